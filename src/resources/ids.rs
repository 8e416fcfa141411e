//! Naming of deployments and the resources derived from them.

use sha2::{Digest, Sha256};

use crate::models::DeploymentType;

const MAX_DEPLOYMENT_NAME_LENGTH: usize = 15;
const MIN_DEPLOYMENT_NAME_LENGTH: usize = 4;
const HASH_SUFFIX_LENGTH: usize = 5;

const PROJECT_SEPARATOR: &str = "-p-";
const SERVICE_SEPARATOR: &str = "-s-";
const JOB_SEPARATOR: &str = "-j-";

/// Prefix shared by every resource of a project, e.g. `berth-p-demo`.
pub fn project_resource_prefix(system_namespace: &str, project_id: &str) -> String {
    format!("{system_namespace}{PROJECT_SEPARATOR}{project_id}")
}

/// Stable deployment id derived from the project and the display name.
pub fn deployment_id(
    system_namespace: &str,
    project_id: &str,
    display_name: &str,
    deployment_type: DeploymentType,
) -> String {
    let separator = if deployment_type.is_job() {
        JOB_SEPARATOR
    } else {
        SERVICE_SEPARATOR
    };
    format!(
        "{}{}{}",
        project_resource_prefix(system_namespace, project_id),
        separator,
        readable_id(display_name)
    )
}

pub fn volume_name(project_id: &str, deployment_id: &str) -> String {
    format!("{project_id}-{deployment_id}-vol")
}

pub fn network_name(system_namespace: &str, project_id: &str) -> String {
    format!("{}-network", project_resource_prefix(system_namespace, project_id))
}

/// Hex digest truncated to `length` characters.
pub fn hash_str(input: &str, length: usize) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex.truncate(length);
    hex
}

/// Lowercase, dash-separated slug. Single-letter words are dropped.
fn slugify(input: &str, max_length: Option<usize>) -> String {
    let lowered: String = input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();

    let mut slug = lowered
        .split('-')
        .filter(|word| !word.is_empty())
        .filter(|word| !(word.len() == 1 && word.chars().all(|c| c.is_ascii_lowercase())))
        .collect::<Vec<_>>()
        .join("-");

    if let Some(max) = max_length {
        if slug.len() > max {
            slug.truncate(max);
            while slug.ends_with('-') {
                slug.pop();
            }
        }
    }
    slug
}

/// Human readable id of at most 15 characters. Names that do not fit are
/// shortened and get a hash suffix, names that are too short are padded
/// with one.
pub fn readable_id(input: &str) -> String {
    let mut id = slugify(input, None);

    if id.len() > MAX_DEPLOYMENT_NAME_LENGTH {
        let mut shortened = id[..MAX_DEPLOYMENT_NAME_LENGTH - HASH_SUFFIX_LENGTH].to_string();
        if !shortened.ends_with('-') {
            shortened.pop();
            shortened.push('-');
        }
        shortened.push_str(&hash_str(&id, HASH_SUFFIX_LENGTH));
        id = shortened;
    }

    id = slugify(&id, Some(MAX_DEPLOYMENT_NAME_LENGTH));

    if id.len() < MIN_DEPLOYMENT_NAME_LENGTH {
        let padding = hash_str(&id, MIN_DEPLOYMENT_NAME_LENGTH - id.len());
        id.push_str(&padding);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_names_are_kept() {
        assert_eq!(readable_id("echo"), "echo");
        assert_eq!(readable_id("My Web App"), "my-web-app");
    }

    #[test]
    fn test_single_letters_are_dropped() {
        assert_eq!(readable_id("a test b server"), "test-server");
    }

    #[test]
    fn test_long_names_get_hash_suffix() {
        let id = readable_id("a very long deployment display name");
        assert!(id.len() <= 15, "{id}");
        assert!(id.starts_with("very-long-"), "{id}");
        assert_eq!(id, readable_id("a very long deployment display name"));
        assert_ne!(id, readable_id("a very long deployment display other"));
    }

    #[test]
    fn test_short_names_are_padded() {
        let id = readable_id("db");
        assert_eq!(id.len(), 4);
        assert!(id.starts_with("db"));

        let empty = readable_id("!!");
        assert_eq!(empty.len(), 4);
    }

    #[test]
    fn test_deployment_id_separators() {
        assert_eq!(
            deployment_id("berth", "demo", "echo", DeploymentType::Service),
            "berth-p-demo-s-echo"
        );
        assert_eq!(
            deployment_id("berth", "demo", "echo", DeploymentType::Job),
            "berth-p-demo-j-echo"
        );
    }

    #[test]
    fn test_resource_names() {
        assert_eq!(network_name("berth", "demo"), "berth-p-demo-network");
        assert_eq!(volume_name("demo", "berth-p-demo-s-echo"), "demo-berth-p-demo-s-echo-vol");
    }
}

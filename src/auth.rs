//! Collaborators from the permission layer: token issuing and the image
//! capability check.

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;

use crate::error::{DeployError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessLevel {
    Read,
    Write,
    Admin,
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessLevel::Read => f.write_str("read"),
            AccessLevel::Write => f.write_str("write"),
            AccessLevel::Admin => f.write_str("admin"),
        }
    }
}

/// A scope such as `projects/demo#read`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Permission {
    pub resource: String,
    pub level: AccessLevel,
}

impl Permission {
    pub fn project_read(project_id: &str) -> Self {
        Self {
            resource: format!("projects/{project_id}"),
            level: AccessLevel::Read,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.resource, self.level)
    }
}

#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue_token(&self, scopes: &[Permission], purpose: &str) -> Result<String>;
}

/// Consulted before any deploy call reaches a backend.
#[async_trait]
pub trait ImagePolicy: Send + Sync {
    async fn check_image_allowed(&self, image_name: &str, image_tag: &str) -> Result<()>;
}

pub struct AllowAllImages;

#[async_trait]
impl ImagePolicy for AllowAllImages {
    async fn check_image_allowed(&self, _image_name: &str, _image_tag: &str) -> Result<()> {
        Ok(())
    }
}

/// Entries are `name` (any tag), `name:*` (any tag) or `name:tag`.
#[derive(Debug, Clone, Default)]
pub struct AllowListImagePolicy {
    any_tag: HashSet<String>,
    exact: HashSet<(String, String)>,
}

impl AllowListImagePolicy {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut policy = Self::default();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() {
                continue;
            }
            match entry.strip_suffix(":*") {
                Some(name) => {
                    policy.any_tag.insert(name.to_string());
                }
                None => {
                    let (name, tag) = crate::resources::image::split_image_name_and_tag(entry);
                    if name == entry {
                        policy.any_tag.insert(name);
                    } else {
                        policy.exact.insert((name, tag));
                    }
                }
            }
        }
        policy
    }
}

#[async_trait]
impl ImagePolicy for AllowListImagePolicy {
    async fn check_image_allowed(&self, image_name: &str, image_tag: &str) -> Result<()> {
        if self.any_tag.contains(image_name)
            || self
                .exact
                .contains(&(image_name.to_string(), image_tag.to_string()))
        {
            return Ok(());
        }
        Err(DeployError::Forbidden(format!(
            "The image '{}:{}' is not allowed.",
            image_name, image_tag
        )))
    }
}

//! Container environment: caller parameters plus injected platform variables,
//! with `{env.NAME}` templates resolved.

use std::collections::{BTreeMap, HashSet};

use crate::auth::{Permission, TokenIssuer};
use crate::config::Settings;
use crate::error::Result;
use crate::models::{DeploymentSpec, DeploymentType};
use crate::resources::endpoints::parse_endpoints;

/// Callers may not pick GPU devices themselves.
pub const GPU_DEVICE_SELECTION_VAR: &str = "NVIDIA_VISIBLE_DEVICES";

const TOKEN_OPEN: &str = "{env.";

/// Who and what a deployment is, independent of its spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentIdentity {
    pub project_id: String,
    pub deployment_id: String,
    pub deployment_type: DeploymentType,
    pub user_id: Option<String>,
}

/// Upper-case prefix of injected variables, e.g. `BERTH_`.
pub fn env_prefix(system_namespace: &str) -> String {
    let mut prefix: String = system_namespace
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    prefix.push('_');
    prefix
}

/// Public URL of an endpoint. `endpoint` may be the `{endpoint}` placeholder.
pub fn access_url(base_url: &str, project_id: &str, deployment_id: &str, endpoint: &str) -> String {
    format!(
        "{}/projects/{}/services/{}/access/{}",
        base_url.trim_end_matches('/'),
        project_id,
        deployment_id,
        endpoint
    )
}

pub async fn build_environment(
    spec: &DeploymentSpec,
    identity: &DeploymentIdentity,
    settings: &Settings,
    tokens: &dyn TokenIssuer,
) -> Result<BTreeMap<String, String>> {
    let mut env = spec.parameters.clone();
    env.remove(GPU_DEVICE_SELECTION_VAR);

    let prefix = env_prefix(&settings.system_namespace);
    env.insert(
        format!("{prefix}DEPLOYMENT_NAME"),
        identity.deployment_id.clone(),
    );
    env.insert(format!("{prefix}BASE_URL"), settings.base_url.clone());
    env.insert(format!("{prefix}API_ENDPOINT"), settings.api_endpoint.clone());

    let token = tokens
        .issue_token(
            &[Permission::project_read(&identity.project_id)],
            &format!("deployment-{}", identity.deployment_id),
        )
        .await?;
    env.insert(format!("{prefix}API_TOKEN"), token);

    let endpoints = parse_endpoints(&spec.endpoints)?;
    match endpoints.as_slice() {
        [] => {}
        [single] => {
            env.insert(
                format!("{prefix}SERVICE_URL"),
                access_url(
                    &settings.base_url,
                    &identity.project_id,
                    &identity.deployment_id,
                    &single.port.to_string(),
                ),
            );
        }
        _ => {
            env.insert(
                format!("{prefix}SERVICE_URL"),
                access_url(
                    &settings.base_url,
                    &identity.project_id,
                    &identity.deployment_id,
                    "{endpoint}",
                ),
            );
        }
    }

    if let (Some(_), Some(size)) = (spec.compute.volume(), spec.compute.max_volume_size_mb) {
        env.insert(format!("{prefix}MAX_VOLUME_SIZE_MB"), size.to_string());
    }

    let mut extra = BTreeMap::new();
    extra.insert("projectId".to_string(), identity.project_id.clone());
    if let Some(user) = &identity.user_id {
        extra.insert("userId".to_string(), user.clone());
    }

    Ok(substitute_all(&env, &extra))
}

/// Resolves templates in every value of `env`. `extra` provides names that
/// are not themselves variables (`projectId`, `userId`) and shadows `env`.
pub fn substitute_all(
    env: &BTreeMap<String, String>,
    extra: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let resolved = resolve_mapping(env, extra);
    env.keys()
        .map(|key| {
            let value = resolved.get(key).cloned().unwrap_or_default();
            (key.clone(), value)
        })
        .collect()
}

/// Fully resolves every mapping value. Values that reference themselves,
/// directly or through other values, resolve to the empty string.
pub fn resolve_mapping(
    env: &BTreeMap<String, String>,
    extra: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut raw = env.clone();
    for (key, value) in extra {
        raw.insert(key.clone(), value.clone());
    }

    let mut resolver = Resolver {
        raw: &raw,
        resolved: BTreeMap::new(),
        stack: Vec::new(),
        cyclic: HashSet::new(),
    };
    for key in raw.keys() {
        resolver.resolve(key);
    }
    resolver.resolved
}

struct Resolver<'a> {
    raw: &'a BTreeMap<String, String>,
    resolved: BTreeMap<String, String>,
    stack: Vec<String>,
    cyclic: HashSet<String>,
}

impl Resolver<'_> {
    fn resolve(&mut self, key: &str) -> String {
        if let Some(value) = self.resolved.get(key) {
            return value.clone();
        }
        if let Some(pos) = self.stack.iter().position(|k| k == key) {
            for member in &self.stack[pos..] {
                self.cyclic.insert(member.clone());
            }
            return String::new();
        }

        let raw = self.raw;
        let template = raw.get(key).cloned().unwrap_or_default();
        self.stack.push(key.to_string());
        let value = replace_tokens(&template, |name| {
            raw.contains_key(name).then(|| self.resolve(name))
        });
        self.stack.pop();

        let value = if self.cyclic.contains(key) {
            String::new()
        } else {
            value
        };
        self.resolved.insert(key.to_string(), value.clone());
        value
    }
}

/// Single left-to-right pass replacing `{env.NAME}` tokens. Names the lookup
/// does not know are left untouched.
pub fn substitute(value: &str, mapping: &BTreeMap<String, String>) -> String {
    replace_tokens(value, |name| mapping.get(name).cloned())
}

fn replace_tokens<F>(value: &str, mut lookup: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find(TOKEN_OPEN) {
        out.push_str(&rest[..start]);
        let after = &rest[start + TOKEN_OPEN.len()..];
        let name_len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());

        if name_len > 0 && after[name_len..].starts_with('}') {
            let name = &after[..name_len];
            match lookup(name) {
                Some(replacement) => out.push_str(&replacement),
                None => out.push_str(&rest[start..start + TOKEN_OPEN.len() + name_len + 1]),
            }
            rest = &after[name_len + 1..];
        } else {
            out.push_str(TOKEN_OPEN);
            rest = after;
        }
    }
    out.push_str(rest);
    out
}

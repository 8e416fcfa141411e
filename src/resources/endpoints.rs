//! Endpoint strings: `"<port>"`, `"<port>/<path>"`, with an optional trailing
//! `b` on the port part used as a routing hint.

use std::collections::HashSet;

use crate::error::{DeployError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub port: u16,
    pub path: String,
    /// The port part carried the `b` routing hint.
    pub flagged: bool,
}

pub fn parse_endpoint(raw: &str) -> Result<Endpoint> {
    let raw = raw.trim();
    let (port_part, path) = match raw.split_once('/') {
        Some((port, path)) => (port, path),
        None => (raw, ""),
    };

    let (port_part, flagged) = match port_part.strip_suffix('b') {
        Some(stripped) => (stripped, true),
        None => (port_part, false),
    };

    let port = port_part.parse::<u16>().map_err(|_| {
        DeployError::validation(format!("Endpoint '{}' does not start with a valid port.", raw))
    })?;

    Ok(Endpoint {
        port,
        path: path.to_string(),
        flagged,
    })
}

/// Parses all endpoints, keeping only the first entry for each port.
pub fn parse_endpoints(raw: &[String]) -> Result<Vec<Endpoint>> {
    let mut seen = HashSet::new();
    let mut endpoints = Vec::with_capacity(raw.len());
    for entry in raw {
        let endpoint = parse_endpoint(entry)?;
        if seen.insert(endpoint.port) {
            endpoints.push(endpoint);
        }
    }
    Ok(endpoints)
}

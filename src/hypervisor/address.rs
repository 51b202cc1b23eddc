//! Connection URI resolution
//!
//! Splits a host connection string of the form
//! `<schema>://[<user>@]<host>[:<port>][/<path>]` into the pieces the rest of
//! the crate displays and logs. Resolution never fails: missing segments come
//! back as empty strings and unknown schemas resolve to the local system.

use serde::{Deserialize, Serialize};

/// Address used when the URI names no remote host
pub const LOCAL_ADDRESS: &str = "localhost";

/// Path used when the URI names no remote host
pub const LOCAL_PATH: &str = "system";

/// Resolved connection target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Transport schema, e.g. `qemu+ssh`
    pub schema: String,

    /// Host component only; user prefix and port are dropped
    pub address: String,

    /// Resource path after the host, e.g. `system`
    pub path: String,
}

impl Target {
    /// Whether the target is reached over the network
    pub fn is_remote(&self) -> bool {
        matches!(self.schema.as_str(), "qemu+ssh" | "qemu+tcp" | "qemu+tls")
    }
}

/// Resolve a connection string into its target
pub fn resolve(raw: &str) -> Target {
    let schema = raw.split(':').next().unwrap_or_default().to_string();

    let remote = raw.contains("://");
    let (mut address, path) = match schema.as_str() {
        "qemu+ssh" if remote => {
            let (address, path) = split_remote(raw);
            match address.split_once('@') {
                Some((_user, host)) => (host.to_string(), path),
                None => (address, path),
            }
        }
        "qemu+tcp" | "qemu+tls" if remote => split_remote(raw),
        _ => (LOCAL_ADDRESS.to_string(), LOCAL_PATH.to_string()),
    };

    if let Some((host, _port)) = address.split_once(':') {
        address = host.to_string();
    }

    Target {
        schema,
        address,
        path,
    }
}

fn split_remote(raw: &str) -> (String, String) {
    let addrs = raw.split_once("://").map(|(_, rest)| rest).unwrap_or_default();
    match addrs.split_once('/') {
        Some((address, path)) => (address.to_string(), path.to_string()),
        None => (addrs.to_string(), String::new()),
    }
}

//! Server Descriptors
//!
//! Candidate proxy servers as delivered by the remote server list.
//! The connection URI is the key used by probing and selection.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::config::ConfigError;

/// One candidate proxy server
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Identifier assigned by the server list
    pub id: i64,
    /// Display name
    pub name: String,
    /// Country flag (URL or emoji, opaque to us)
    #[serde(default)]
    pub flag: String,
    /// Compact connection URI (`vless://...`)
    #[serde(rename = "config", alias = "connectionURI", alias = "uri")]
    pub connection_uri: String,
}

impl ServerDescriptor {
    /// Create a new descriptor
    pub fn new(
        id: i64,
        name: impl Into<String>,
        flag: impl Into<String>,
        connection_uri: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            flag: flag.into(),
            connection_uri: connection_uri.into(),
        }
    }
}

impl std::fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {}", self.id, self.name)
    }
}

/// Ordered server list, read-only once loaded
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerList {
    servers: Vec<ServerDescriptor>,
}

impl ServerList {
    /// Wrap an existing list, preserving order
    pub fn new(servers: Vec<ServerDescriptor>) -> Self {
        Self { servers }
    }

    /// Parse the JSON array produced by the remote list endpoint
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        Self::from_json(&content)
    }

    pub fn as_slice(&self) -> &[ServerDescriptor] {
        &self.servers
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Distinct connection URIs, the key set of a probe batch
    pub fn distinct_uris(&self) -> HashSet<&str> {
        self.servers.iter().map(|s| s.connection_uri.as_str()).collect()
    }
}

impl From<Vec<ServerDescriptor>> for ServerList {
    fn from(servers: Vec<ServerDescriptor>) -> Self {
        Self::new(servers)
    }
}

//! Host Client Contract
//!
//! The virtualization host is an external daemon reached through a single
//! connection. This module defines the slice of its client API the rest of the
//! crate relies on:
//!
//! - [`HostClient`]: opens connections from a URI
//! - [`HostConnection`]: node, domain and storage calls over one connection
//! - [`StoragePoolHandle`] / [`StorageVolumeHandle`]: transient handles that
//!   release their host-side resource when dropped
//!
//! [`sim::SimHost`] is an in-memory implementation used by tests and the CLI.

pub mod sim;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Result alias for host calls
pub type HostResult<T> = std::result::Result<T, HostError>;

/// Failures reported by the host client library
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HostError {
    /// The host daemon could not be reached
    #[error("host unreachable: {0}")]
    Unreachable(String),

    /// No domain matches the lookup key
    #[error("no domain matching '{0}'")]
    NoSuchDomain(String),

    /// No storage pool matches the lookup key
    #[error("no storage pool matching '{0}'")]
    NoSuchPool(String),

    /// The storage pool exists but is not running
    #[error("storage pool '{0}' is not active")]
    NotActive(String),

    /// The host rejected an XML document
    #[error("invalid XML: {0}")]
    InvalidXml(String),

    /// Any other failed operation
    #[error("operation failed: {0}")]
    Operation(String),
}

/// Node hardware summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Logical CPU count
    pub cpus: u32,

    /// CPU model identifier
    pub model: String,

    /// Installed memory in KiB
    pub memory_kib: u64,
}

/// Cumulative CPU time counters summed over all logical CPUs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuStats {
    pub user: u64,
    pub idle: u64,
    pub kernel: u64,
    pub intr: u64,
    pub iowait: u64,
}

/// Node memory report in KiB; each field may be missing from the report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStats {
    pub total: Option<u64>,
    pub free: Option<u64>,
    pub cached: Option<u64>,
}

/// Run state of a domain as reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    Suspended,
}

impl DomainState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainState::NoState => "nostate",
            DomainState::Running => "running",
            DomainState::Blocked => "blocked",
            DomainState::Paused => "paused",
            DomainState::Shutdown => "shutdown",
            DomainState::Shutoff => "shutoff",
            DomainState::Crashed => "crashed",
            DomainState::Suspended => "suspended",
        }
    }

    /// Whether the domain currently has a running process on the host
    pub fn is_active(&self) -> bool {
        !matches!(self, DomainState::Shutoff | DomainState::NoState)
    }
}

/// Host-native domain record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainInfo {
    pub uuid: String,
    pub name: String,
    /// Runtime id; `None` while the domain is inactive
    pub id: Option<u32>,
    pub state: DomainState,
    pub vcpus: u32,
    pub max_memory_kib: u64,
    pub memory_kib: u64,
    pub persistent: bool,
}

/// Filter for domain enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainFilter {
    All,
    Active,
    Inactive,
}

impl DomainFilter {
    pub fn matches(&self, state: DomainState) -> bool {
        match self {
            DomainFilter::All => true,
            DomainFilter::Active => state.is_active(),
            DomainFilter::Inactive => !state.is_active(),
        }
    }
}

/// Flags for storage pool creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolCreateFlags {
    /// Create the pool as-is
    Normal,
    /// Build the backing location before starting the pool
    WithBuild,
}

/// Opens connections to a virtualization host
#[async_trait]
pub trait HostClient: Send + Sync {
    /// Open a new connection to the host named by `uri`
    async fn connect(&self, uri: &str) -> HostResult<Arc<dyn HostConnection>>;
}

/// One live session with the virtualization host
#[async_trait]
pub trait HostConnection: Send + Sync {
    /// Host library version; a trivial call used as a liveness probe
    async fn version(&self) -> HostResult<u64>;

    async fn node_info(&self) -> HostResult<NodeInfo>;

    async fn cpu_stats(&self) -> HostResult<CpuStats>;

    async fn memory_stats(&self) -> HostResult<MemoryStats>;

    async fn list_all_domains(&self, filter: DomainFilter) -> HostResult<Vec<DomainInfo>>;

    async fn lookup_domain_by_uuid(&self, uuid: &str) -> HostResult<DomainInfo>;

    async fn lookup_domain_by_name(&self, name: &str) -> HostResult<DomainInfo>;

    async fn define_domain_xml(&self, xml: &str) -> HostResult<DomainInfo>;

    async fn lookup_storage_pool_by_name(&self, name: &str)
        -> HostResult<Box<dyn StoragePoolHandle>>;

    async fn create_storage_pool_xml(
        &self,
        xml: &str,
        flags: PoolCreateFlags,
    ) -> HostResult<Box<dyn StoragePoolHandle>>;

    /// Close the session; no further calls are made on it afterwards
    async fn close(&self) -> HostResult<()>;
}

/// Transient handle on a host storage pool
#[async_trait]
pub trait StoragePoolHandle: Send + Sync {
    fn name(&self) -> &str;

    async fn list_volumes(&self) -> HostResult<Vec<Box<dyn StorageVolumeHandle>>>;

    /// Deactivate the pool, keeping its definition
    async fn destroy(&self) -> HostResult<()>;
}

/// Transient handle on a volume inside a storage pool
#[async_trait]
pub trait StorageVolumeHandle: Send + Sync {
    fn name(&self) -> &str;

    async fn delete(&self) -> HostResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_filter() {
        assert!(DomainFilter::All.matches(DomainState::Shutoff));
        assert!(DomainFilter::Active.matches(DomainState::Paused));
        assert!(!DomainFilter::Active.matches(DomainState::Shutoff));
        assert!(DomainFilter::Inactive.matches(DomainState::Shutoff));
    }

    #[test]
    fn test_domain_state_serializes_lowercase() {
        let json = serde_json::to_string(&DomainState::Running).unwrap();
        assert_eq!(json, "\"running\"");
    }
}

//! Storage pool provisioning
//!
//! Pools are created and removed idempotently: creating a pool that already
//! exists and removing one that does not both succeed without touching the
//! host. Removal deletes every volume first and then deactivates the pool;
//! the pool definition itself is kept so it can be started again.

use crate::error::{HyperError, Result};
use crate::host::{HostError, PoolCreateFlags};
use crate::hypervisor::Hypervisor;
use serde::{Deserialize, Serialize};

/// Prefix marking a pool that belongs to a single domain
pub const DOMAIN_POOL_PREFIX: char = '.';

/// Name of the pool holding a domain's private volumes
pub fn domain_pool_name(domain: &str) -> String {
    format!("{}{}", DOMAIN_POOL_PREFIX, domain)
}

/// Whether `name` follows the domain pool naming convention
pub fn is_domain_pool(name: &str) -> bool {
    name.starts_with(DOMAIN_POOL_PREFIX)
}

/// Storage pool descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    /// Backend type, `dir` for directory-backed pools
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    /// Capacity in bytes, if known
    pub size: u64,
    /// Filesystem location backing the pool
    pub path: String,
}

impl Pool {
    /// Directory-backed pool at `path`
    pub fn new(name: &str, path: &str) -> Self {
        Self {
            kind: "dir".to_string(),
            name: name.to_string(),
            size: 0,
            path: path.to_string(),
        }
    }

    /// Pool definition document understood by the host
    pub fn to_xml(&self) -> String {
        format!(
            "<pool type='{}'><name>{}</name><target><path>{}</path></target></pool>",
            escape(&self.kind),
            escape(&self.name),
            escape(&self.path)
        )
    }

    /// Create the pool on the host unless one with the same name exists
    pub async fn create(&self, hypervisor: &Hypervisor) -> Result<()> {
        let session = hypervisor.session().await?;
        if session.lookup_storage_pool_by_name(&self.name).await.is_ok() {
            tracing::debug!("Storage pool {} already exists", self.name);
            return Ok(());
        }

        let pool = session
            .create_storage_pool_xml(&self.to_xml(), PoolCreateFlags::WithBuild)
            .await
            .map_err(|e| match e {
                HostError::Unreachable(_) => HyperError::connection(e),
                other => HyperError::Definition(other.to_string()),
            })?;
        tracing::info!("Created storage pool {} at {}", pool.name(), self.path);
        Ok(())
    }

    /// Delete every volume in the pool, then deactivate it.
    ///
    /// A missing or already inactive pool is not an error. If a volume cannot
    /// be deleted the remaining volumes and the pool are left as they are.
    pub async fn remove(&self, hypervisor: &Hypervisor) -> Result<()> {
        let session = hypervisor.session().await?;
        let pool = match session.lookup_storage_pool_by_name(&self.name).await {
            Ok(pool) => pool,
            Err(HostError::NoSuchPool(_)) => {
                tracing::debug!("Storage pool {} not found, nothing to remove", self.name);
                return Ok(());
            }
            Err(e) => return Err(host_error(e)),
        };

        for volume in pool.list_volumes().await.map_err(host_error)? {
            volume.delete().await.map_err(|e| match e {
                HostError::Unreachable(_) => HyperError::connection(e),
                other => HyperError::PartialDeletion {
                    pool: self.name.clone(),
                    volume: volume.name().to_string(),
                    reason: other.to_string(),
                },
            })?;
            tracing::debug!("Deleted volume {} from pool {}", volume.name(), self.name);
        }

        match pool.destroy().await {
            Ok(()) => {}
            Err(HostError::NotActive(_)) => {
                tracing::debug!("Storage pool {} already inactive", self.name);
                return Ok(());
            }
            Err(e) => return Err(host_error(e)),
        }
        tracing::info!("Deactivated storage pool {}", self.name);
        Ok(())
    }
}

/// Create a directory-backed pool named `name` at `path`
pub async fn create_pool(hypervisor: &Hypervisor, name: &str, path: &str) -> Result<Pool> {
    let pool = Pool::new(name, path);
    pool.create(hypervisor).await?;
    Ok(pool)
}

/// Remove the pool named `name` and all its volumes
pub async fn remove_pool(hypervisor: &Hypervisor, name: &str) -> Result<()> {
    Pool::new(name, "").remove(hypervisor).await
}

fn host_error(err: HostError) -> HyperError {
    match err {
        HostError::Unreachable(_) => HyperError::connection(err),
        other => other.into(),
    }
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}

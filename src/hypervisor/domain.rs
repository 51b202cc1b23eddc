//! Domain lookup and definition

use super::Hypervisor;
use crate::error::{HyperError, Result};
use crate::host::{DomainFilter, DomainInfo, DomainState, HostError};
use serde::Serialize;

/// A virtual machine as seen by the host at lookup time.
///
/// Built fresh on every lookup; nothing is cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Domain {
    pub uuid: String,
    pub name: String,
    pub state: DomainState,
    /// Runtime id while active
    pub id: Option<u32>,
    pub vcpus: u32,
    /// Maximum memory in bytes
    pub max_memory: u64,
    /// Current memory in bytes
    pub memory: u64,
    pub persistent: bool,
}

impl Domain {
    pub fn from_host(info: DomainInfo) -> Self {
        Self {
            uuid: info.uuid,
            name: info.name,
            state: info.state,
            id: info.id,
            vcpus: info.vcpus,
            max_memory: info.max_memory_kib.saturating_mul(1024),
            memory: info.memory_kib.saturating_mul(1024),
            persistent: info.persistent,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }
}

impl Hypervisor {
    /// Every domain the host knows about, active or not
    pub async fn list_all(&self) -> Result<Vec<Domain>> {
        let session = self.session().await?;
        let domains = session.list_all_domains(DomainFilter::All).await?;
        Ok(domains.into_iter().map(Domain::from_host).collect())
    }

    pub async fn lookup_by_uuid(&self, uuid: &str) -> Result<Domain> {
        let session = self.session().await?;
        session
            .lookup_domain_by_uuid(uuid)
            .await
            .map(Domain::from_host)
            .map_err(|e| lookup_error(uuid, e))
    }

    pub async fn lookup_by_name(&self, name: &str) -> Result<Domain> {
        let session = self.session().await?;
        session
            .lookup_domain_by_name(name)
            .await
            .map(Domain::from_host)
            .map_err(|e| lookup_error(name, e))
    }

    /// Look `key` up as a UUID first, then as a name.
    ///
    /// When both miss, the name lookup error is returned.
    pub async fn lookup_by_uuid_or_name(&self, key: &str) -> Result<Domain> {
        let session = self.session().await?;
        match session.lookup_domain_by_uuid(key).await {
            Ok(info) => Ok(Domain::from_host(info)),
            Err(e) => {
                tracing::debug!("UUID lookup for '{}' failed ({}), trying name", key, e);
                session
                    .lookup_domain_by_name(key)
                    .await
                    .map(Domain::from_host)
                    .map_err(|e| lookup_error(key, e))
            }
        }
    }

    /// Submit a domain definition
    pub async fn define(&self, xml: &str) -> Result<Domain> {
        let session = self.session().await?;
        let info = session.define_domain_xml(xml).await.map_err(|e| match e {
            HostError::Unreachable(_) => HyperError::connection(e),
            other => HyperError::Definition(other.to_string()),
        })?;
        tracing::info!("Defined domain {} ({})", info.name, info.uuid);
        Ok(Domain::from_host(info))
    }
}

fn lookup_error(key: &str, err: HostError) -> HyperError {
    match err {
        HostError::Unreachable(_) => HyperError::connection(err),
        other => HyperError::not_found("Domain", key, other),
    }
}

//! Simulated Host
//!
//! An in-memory virtualization host implementing the [`HostClient`] contract.
//! It keeps domains, storage pools and CPU counters in process memory and can
//! be told to misbehave: go down, restart (invalidating open connections),
//! fail a volume deletion, or replay a scripted sequence of CPU counters.
//!
//! # Example
//!
//! ```ignore
//! let host = SimHost::new();
//! host.add_domain("web-1", DomainState::Running).await;
//! let hv = Hypervisor::new(Arc::new(host.clone()), "qemu:///system");
//! let domains = hv.list_all().await?;
//! ```

use super::{
    CpuStats, DomainFilter, DomainInfo, DomainState, HostClient, HostConnection, HostError,
    HostResult, MemoryStats, NodeInfo, PoolCreateFlags, StoragePoolHandle, StorageVolumeHandle,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

const SIM_VERSION: u64 = 10_000_000;

/// In-memory host; clones share the same state
#[derive(Clone, Default)]
pub struct SimHost {
    inner: Arc<SimInner>,
}

#[derive(Default)]
struct SimInner {
    /// Whether the daemon is currently accepting calls
    down: AtomicBool,
    /// Bumped on every restart; connections from older epochs are dead
    epoch: AtomicU64,
    connects: AtomicUsize,
    closes: AtomicUsize,
    pool_creates: AtomicUsize,
    /// Pool and volume handles not yet dropped
    live_handles: AtomicUsize,
    state: Mutex<SimState>,
}

#[derive(Default)]
struct SimState {
    node: Option<NodeInfo>,
    memory: MemoryStats,
    cpu_script: VecDeque<CpuStats>,
    cpu_last: CpuStats,
    /// Added to the counters on each read once the script is drained
    cpu_step: Option<CpuStats>,
    domains: Vec<DomainInfo>,
    pools: BTreeMap<String, SimPool>,
}

#[derive(Debug, Clone)]
struct SimPool {
    path: String,
    active: bool,
    volumes: Vec<SimVolume>,
}

#[derive(Debug, Clone)]
struct SimVolume {
    name: String,
    fail_delete: bool,
}

impl SimHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop answering: new connects fail and open connections fail every call
    pub fn go_down(&self) {
        self.inner.down.store(true, Ordering::SeqCst);
    }

    /// Come back up after a restart; connections opened before are stale
    pub fn come_up(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.down.store(false, Ordering::SeqCst);
    }

    /// Number of successful connects so far
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Number of connections closed by the client
    pub fn close_count(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    /// Number of pool create requests received
    pub fn pool_create_count(&self) -> usize {
        self.inner.pool_creates.load(Ordering::SeqCst)
    }

    /// Pool/volume handles handed out and not yet released
    pub fn live_handle_count(&self) -> usize {
        self.inner.live_handles.load(Ordering::SeqCst)
    }

    pub async fn set_node_info(&self, cpus: u32, model: &str, memory_kib: u64) {
        self.inner.state.lock().await.node = Some(NodeInfo {
            cpus,
            model: model.to_string(),
            memory_kib,
        });
    }

    pub async fn set_memory_stats(&self, stats: MemoryStats) {
        self.inner.state.lock().await.memory = stats;
    }

    /// Queue CPU counters returned by successive `cpu_stats` calls.
    /// Once the queue drains the last value is repeated, or advanced if a
    /// step is set.
    pub async fn push_cpu_stats(&self, stats: CpuStats) {
        self.inner.state.lock().await.cpu_script.push_back(stats);
    }

    /// Advance the counters by `step` on every read after the script drains
    pub async fn set_cpu_step(&self, step: CpuStats) {
        self.inner.state.lock().await.cpu_step = Some(step);
    }

    pub async fn add_domain(&self, name: &str, state: DomainState) -> DomainInfo {
        let mut guard = self.inner.state.lock().await;
        let id = if state.is_active() {
            Some(guard.domains.len() as u32 + 1)
        } else {
            None
        };
        let domain = DomainInfo {
            uuid: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            id,
            state,
            vcpus: 1,
            max_memory_kib: 1024 * 1024,
            memory_kib: 1024 * 1024,
            persistent: true,
        };
        guard.domains.push(domain.clone());
        domain
    }

    pub async fn add_pool(&self, name: &str, path: &str) {
        self.inner.state.lock().await.pools.insert(
            name.to_string(),
            SimPool {
                path: path.to_string(),
                active: true,
                volumes: Vec::new(),
            },
        );
    }

    pub async fn add_volume(&self, pool: &str, volume: &str) {
        if let Some(p) = self.inner.state.lock().await.pools.get_mut(pool) {
            p.volumes.push(SimVolume {
                name: volume.to_string(),
                fail_delete: false,
            });
        }
    }

    /// Make deletion of `volume` in `pool` fail
    pub async fn fail_volume_delete(&self, pool: &str, volume: &str) {
        if let Some(p) = self.inner.state.lock().await.pools.get_mut(pool) {
            for v in p.volumes.iter_mut().filter(|v| v.name == volume) {
                v.fail_delete = true;
            }
        }
    }

    pub async fn pool_exists(&self, name: &str) -> bool {
        self.inner.state.lock().await.pools.contains_key(name)
    }

    pub async fn pool_active(&self, name: &str) -> Option<bool> {
        self.inner.state.lock().await.pools.get(name).map(|p| p.active)
    }

    pub async fn pool_path(&self, name: &str) -> Option<String> {
        self.inner.state.lock().await.pools.get(name).map(|p| p.path.clone())
    }

    pub async fn volume_names(&self, pool: &str) -> Vec<String> {
        self.inner
            .state
            .lock()
            .await
            .pools
            .get(pool)
            .map(|p| p.volumes.iter().map(|v| v.name.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl HostClient for SimHost {
    async fn connect(&self, uri: &str) -> HostResult<Arc<dyn HostConnection>> {
        if self.inner.down.load(Ordering::SeqCst) {
            return Err(HostError::Unreachable(format!(
                "failed to connect to '{}': connection refused",
                uri
            )));
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Simulated host accepted connection to {}", uri);
        Ok(Arc::new(SimConnection {
            inner: self.inner.clone(),
            epoch: self.inner.epoch.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
        }))
    }
}

struct SimConnection {
    inner: Arc<SimInner>,
    epoch: u64,
    closed: AtomicBool,
}

impl SimInner {
    /// Fails if the daemon is down or has restarted since `epoch`
    fn check_epoch(&self, epoch: u64) -> HostResult<()> {
        if self.down.load(Ordering::SeqCst) || self.epoch.load(Ordering::SeqCst) != epoch {
            return Err(HostError::Unreachable("end of file while reading data".to_string()));
        }
        Ok(())
    }
}

impl SimConnection {
    fn check(&self) -> HostResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HostError::Operation("connection already closed".to_string()));
        }
        self.inner.check_epoch(self.epoch)
    }

    fn pool_handle(&self, name: &str) -> Box<dyn StoragePoolHandle> {
        self.inner.live_handles.fetch_add(1, Ordering::SeqCst);
        Box::new(SimPoolHandle {
            inner: self.inner.clone(),
            epoch: self.epoch,
            name: name.to_string(),
        })
    }
}

#[async_trait]
impl HostConnection for SimConnection {
    async fn version(&self) -> HostResult<u64> {
        self.check()?;
        Ok(SIM_VERSION)
    }

    async fn node_info(&self) -> HostResult<NodeInfo> {
        self.check()?;
        self.inner
            .state
            .lock()
            .await
            .node
            .clone()
            .ok_or_else(|| HostError::Operation("node info unavailable".to_string()))
    }

    async fn cpu_stats(&self) -> HostResult<CpuStats> {
        self.check()?;
        let mut state = self.inner.state.lock().await;
        if let Some(next) = state.cpu_script.pop_front() {
            state.cpu_last = next;
        } else if let Some(step) = state.cpu_step {
            let last = state.cpu_last;
            state.cpu_last = CpuStats {
                user: last.user + step.user,
                idle: last.idle + step.idle,
                kernel: last.kernel + step.kernel,
                intr: last.intr + step.intr,
                iowait: last.iowait + step.iowait,
            };
        }
        Ok(state.cpu_last)
    }

    async fn memory_stats(&self) -> HostResult<MemoryStats> {
        self.check()?;
        Ok(self.inner.state.lock().await.memory)
    }

    async fn list_all_domains(&self, filter: DomainFilter) -> HostResult<Vec<DomainInfo>> {
        self.check()?;
        Ok(self
            .inner
            .state
            .lock()
            .await
            .domains
            .iter()
            .filter(|d| filter.matches(d.state))
            .cloned()
            .collect())
    }

    async fn lookup_domain_by_uuid(&self, uuid: &str) -> HostResult<DomainInfo> {
        self.check()?;
        let parsed = uuid::Uuid::parse_str(uuid)
            .map_err(|e| HostError::Operation(format!("invalid UUID '{}': {}", uuid, e)))?;
        self.inner
            .state
            .lock()
            .await
            .domains
            .iter()
            .find(|d| uuid::Uuid::parse_str(&d.uuid).ok() == Some(parsed))
            .cloned()
            .ok_or_else(|| HostError::NoSuchDomain(uuid.to_string()))
    }

    async fn lookup_domain_by_name(&self, name: &str) -> HostResult<DomainInfo> {
        self.check()?;
        self.inner
            .state
            .lock()
            .await
            .domains
            .iter()
            .find(|d| d.name == name)
            .cloned()
            .ok_or_else(|| HostError::NoSuchDomain(name.to_string()))
    }

    async fn define_domain_xml(&self, xml: &str) -> HostResult<DomainInfo> {
        self.check()?;
        if !xml.trim_start().starts_with("<domain") {
            return Err(HostError::InvalidXml("expected <domain> root element".to_string()));
        }
        let name = element_text(xml, "name")
            .filter(|n| !n.is_empty())
            .ok_or_else(|| HostError::InvalidXml("missing <name> element".to_string()))?;
        let uuid = match element_text(xml, "uuid") {
            Some(u) => uuid::Uuid::parse_str(&u)
                .map_err(|e| HostError::InvalidXml(format!("malformed <uuid>: {}", e)))?
                .to_string(),
            None => uuid::Uuid::new_v4().to_string(),
        };

        let mut state = self.inner.state.lock().await;
        if let Some(existing) = state.domains.iter_mut().find(|d| d.name == name) {
            if existing.uuid != uuid && element_text(xml, "uuid").is_some() {
                return Err(HostError::Operation(format!(
                    "domain '{}' already exists with uuid {}",
                    name, existing.uuid
                )));
            }
            existing.persistent = true;
            return Ok(existing.clone());
        }
        let domain = DomainInfo {
            uuid,
            name,
            id: None,
            state: DomainState::Shutoff,
            vcpus: element_text(xml, "vcpu")
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            max_memory_kib: element_text(xml, "memory")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            memory_kib: element_text(xml, "currentMemory")
                .or_else(|| element_text(xml, "memory"))
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            persistent: true,
        };
        state.domains.push(domain.clone());
        Ok(domain)
    }

    async fn lookup_storage_pool_by_name(
        &self,
        name: &str,
    ) -> HostResult<Box<dyn StoragePoolHandle>> {
        self.check()?;
        if !self.inner.state.lock().await.pools.contains_key(name) {
            return Err(HostError::NoSuchPool(name.to_string()));
        }
        Ok(self.pool_handle(name))
    }

    async fn create_storage_pool_xml(
        &self,
        xml: &str,
        flags: PoolCreateFlags,
    ) -> HostResult<Box<dyn StoragePoolHandle>> {
        self.check()?;
        self.inner.pool_creates.fetch_add(1, Ordering::SeqCst);
        let name = element_text(xml, "name")
            .filter(|n| !n.is_empty())
            .ok_or_else(|| HostError::InvalidXml("missing pool <name>".to_string()))?;
        let path = element_text(xml, "path")
            .ok_or_else(|| HostError::InvalidXml("missing target <path>".to_string()))?;
        if flags != PoolCreateFlags::WithBuild && !std::path::Path::new(&path).exists() {
            return Err(HostError::Operation(format!(
                "cannot open directory '{}': No such file or directory",
                path
            )));
        }

        let mut state = self.inner.state.lock().await;
        if state.pools.contains_key(&name) {
            return Err(HostError::Operation(format!("pool '{}' already exists", name)));
        }
        state.pools.insert(
            name.clone(),
            SimPool {
                path,
                active: true,
                volumes: Vec::new(),
            },
        );
        drop(state);
        Ok(self.pool_handle(&name))
    }

    async fn close(&self) -> HostResult<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.inner.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct SimPoolHandle {
    inner: Arc<SimInner>,
    /// Epoch of the connection that handed the handle out
    epoch: u64,
    name: String,
}

impl Drop for SimPoolHandle {
    fn drop(&mut self) {
        self.inner.live_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoragePoolHandle for SimPoolHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_volumes(&self) -> HostResult<Vec<Box<dyn StorageVolumeHandle>>> {
        self.inner.check_epoch(self.epoch)?;
        let state = self.inner.state.lock().await;
        let pool = state
            .pools
            .get(&self.name)
            .ok_or_else(|| HostError::NoSuchPool(self.name.clone()))?;
        Ok(pool
            .volumes
            .iter()
            .map(|v| {
                self.inner.live_handles.fetch_add(1, Ordering::SeqCst);
                Box::new(SimVolumeHandle {
                    inner: self.inner.clone(),
                    epoch: self.epoch,
                    pool: self.name.clone(),
                    name: v.name.clone(),
                }) as Box<dyn StorageVolumeHandle>
            })
            .collect())
    }

    async fn destroy(&self) -> HostResult<()> {
        self.inner.check_epoch(self.epoch)?;
        let mut state = self.inner.state.lock().await;
        let pool = state
            .pools
            .get_mut(&self.name)
            .ok_or_else(|| HostError::NoSuchPool(self.name.clone()))?;
        if !pool.active {
            return Err(HostError::NotActive(self.name.clone()));
        }
        pool.active = false;
        Ok(())
    }
}

struct SimVolumeHandle {
    inner: Arc<SimInner>,
    epoch: u64,
    pool: String,
    name: String,
}

impl Drop for SimVolumeHandle {
    fn drop(&mut self) {
        self.inner.live_handles.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageVolumeHandle for SimVolumeHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn delete(&self) -> HostResult<()> {
        self.inner.check_epoch(self.epoch)?;
        let mut state = self.inner.state.lock().await;
        let pool = state
            .pools
            .get_mut(&self.pool)
            .ok_or_else(|| HostError::NoSuchPool(self.pool.clone()))?;
        let idx = pool
            .volumes
            .iter()
            .position(|v| v.name == self.name)
            .ok_or_else(|| HostError::Operation(format!("no volume '{}'", self.name)))?;
        if pool.volumes[idx].fail_delete {
            return Err(HostError::Operation(format!(
                "cannot unlink file '{}': Permission denied",
                self.name
            )));
        }
        pool.volumes.remove(idx);
        Ok(())
    }
}

/// Text of the first `<tag>...</tag>` element (attributes allowed on the open tag)
fn element_text(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let mut from = 0;
    while let Some(pos) = xml[from..].find(&open) {
        let start = from + pos + open.len();
        // Skip longer tag names sharing the prefix, e.g. <memory> vs <memoryBacking>
        match xml[start..].chars().next() {
            Some('>') | Some(' ') => {
                let body_start = start + xml[start..].find('>')? + 1;
                let body_end = body_start + xml[body_start..].find(&close)?;
                return Some(unescape(xml[body_start..body_end].trim()));
            }
            _ => from = start,
        }
    }
    None
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_text() {
        let xml = "<domain><memory unit='KiB'>2048</memory><memoryBacking/><name>a&amp;b</name></domain>";
        assert_eq!(element_text(xml, "memory").as_deref(), Some("2048"));
        assert_eq!(element_text(xml, "name").as_deref(), Some("a&b"));
        assert_eq!(element_text(xml, "uuid"), None);
    }

    #[tokio::test]
    async fn test_restart_invalidates_connections() {
        let host = SimHost::new();
        let conn = host.connect("qemu:///system").await.unwrap();
        assert!(conn.version().await.is_ok());

        host.go_down();
        assert!(matches!(conn.version().await, Err(HostError::Unreachable(_))));
        assert!(host.connect("qemu:///system").await.is_err());

        host.come_up();
        assert!(conn.version().await.is_err());
        let fresh = host.connect("qemu:///system").await.unwrap();
        assert!(fresh.version().await.is_ok());
        assert_eq!(host.connect_count(), 2);
    }

    #[tokio::test]
    async fn test_cpu_script_repeats_last_value() {
        let host = SimHost::new();
        let stats = CpuStats {
            user: 1,
            idle: 2,
            kernel: 3,
            intr: 4,
            iowait: 5,
        };
        host.push_cpu_stats(stats).await;
        let conn = host.connect("qemu:///system").await.unwrap();
        assert_eq!(conn.cpu_stats().await.unwrap(), stats);
        assert_eq!(conn.cpu_stats().await.unwrap(), stats);
    }

    #[tokio::test]
    async fn test_cpu_step_advances_counters() {
        let host = SimHost::new();
        host.set_cpu_step(CpuStats {
            user: 10,
            idle: 90,
            ..CpuStats::default()
        })
        .await;
        let conn = host.connect("qemu:///system").await.unwrap();
        conn.cpu_stats().await.unwrap();
        let second = conn.cpu_stats().await.unwrap();
        assert_eq!(second.idle, 180);
        assert_eq!(second.user, 20);
    }

    #[tokio::test]
    async fn test_pool_handles_are_released_on_drop() {
        let host = SimHost::new();
        host.add_pool("images", "/tmp/images").await;
        let conn = host.connect("qemu:///system").await.unwrap();
        {
            let _pool = conn.lookup_storage_pool_by_name("images").await.unwrap();
            assert_eq!(host.live_handle_count(), 1);
        }
        assert_eq!(host.live_handle_count(), 0);
    }

    #[tokio::test]
    async fn test_pool_handles_fail_after_restart() {
        let host = SimHost::new();
        host.add_pool("images", "/tmp/images").await;
        host.add_volume("images", "disk.img").await;
        let conn = host.connect("qemu:///system").await.unwrap();
        let pool = conn.lookup_storage_pool_by_name("images").await.unwrap();
        let volumes = pool.list_volumes().await.unwrap();

        host.go_down();
        assert!(matches!(pool.list_volumes().await, Err(HostError::Unreachable(_))));
        assert!(matches!(volumes[0].delete().await, Err(HostError::Unreachable(_))));

        host.come_up();
        assert!(matches!(pool.destroy().await, Err(HostError::Unreachable(_))));
        assert_eq!(host.volume_names("images").await, vec!["disk.img"]);
        assert_eq!(host.pool_active("images").await, Some(true));
    }

    #[tokio::test]
    async fn test_destroy_inactive_pool_is_not_active() {
        let host = SimHost::new();
        host.add_pool("images", "/tmp/images").await;
        let conn = host.connect("qemu:///system").await.unwrap();
        let pool = conn.lookup_storage_pool_by_name("images").await.unwrap();
        pool.destroy().await.unwrap();
        assert_eq!(
            pool.destroy().await,
            Err(HostError::NotActive("images".to_string()))
        );
    }
}

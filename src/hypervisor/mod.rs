//! Hypervisor Connection Guard
//!
//! [`Hypervisor`] owns the single connection to a virtualization host. The
//! connection is opened lazily, probed before every use and replaced when the
//! probe fails, so callers survive the host daemon going away and coming back.
//!
//! # Locking
//!
//! All guard state sits behind one `tokio::sync::RwLock`:
//!
//! - opening, probing, replacing and closing the handle take the write lock
//! - host calls run through a [`Session`], which holds the read lock for its
//!   lifetime, so a handle can never be swapped out under an in-flight call
//!
//! Every public operation goes through [`Hypervisor::session`], which runs the
//! open/probe step under the write lock and then downgrades.
//!
//! # Example
//!
//! ```ignore
//! let hv = Arc::new(Hypervisor::new(client, "qemu+ssh://root@node1/system"));
//! hv.add_listener(Arc::new(LifecycleListener::new().on_opened(|_| Ok(())))).await;
//! let mut sampler = CpuSampler::spawn(hv.clone(), Duration::from_secs(2));
//! let cpu = hv.get_cpu().await;
//! sampler.shutdown().await;
//! ```

pub mod address;
pub mod domain;
mod listener;
pub mod sampler;

#[cfg(test)]
mod proptests;

pub use address::{resolve, Target};
pub use domain::Domain;
pub use listener::{LifecycleCallback, LifecycleListener};
pub use sampler::{CpuSampler, CpuSnapshot, CpuUsage, MemoryUsage, IDLE_UNKNOWN};

use crate::error::{HyperError, Result};
use crate::host::{HostClient, HostConnection};
use crate::metrics;
use sampler::CpuState;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Default host URI: the local system instance
pub const DEFAULT_URI: &str = "qemu:///system";

/// Process-wide context for one virtualization host
pub struct Hypervisor {
    client: Arc<dyn HostClient>,
    state: RwLock<GuardState>,
}

/// Everything the guard protects
pub(crate) struct GuardState {
    raw: String,
    target: Target,
    handle: Option<Arc<dyn HostConnection>>,
    /// Incremented on every successful open
    generation: u64,
    listeners: Vec<Arc<LifecycleListener>>,
    pub(crate) cpu: CpuState,
}

/// Borrowed access to the live connection.
///
/// Holds the guard's shared lock; drop it before calling anything that needs
/// to reopen or replace the connection.
pub struct Session<'a> {
    state: RwLockReadGuard<'a, GuardState>,
    conn: Arc<dyn HostConnection>,
}

impl Session<'_> {
    /// Generation of the connection this session is using
    pub fn generation(&self) -> u64 {
        self.state.generation
    }
}

impl Deref for Session<'_> {
    type Target = dyn HostConnection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref()
    }
}

impl GuardState {
    fn new(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            target: resolve(raw),
            handle: None,
            generation: 0,
            listeners: Vec::new(),
            cpu: CpuState::default(),
        }
    }

    /// Probe the current handle, reopening if it is gone or dead.
    /// Must be called with the write lock held.
    pub(crate) async fn ensure_open(
        &mut self,
        client: &dyn HostClient,
    ) -> Result<Arc<dyn HostConnection>> {
        if let Some(conn) = self.handle.clone() {
            if let Err(e) = conn.version().await {
                tracing::warn!("Connection to {} failed liveness probe: {}", self.raw, e);
                metrics::HOST_PROBE_FAILURES_TOTAL.inc();
                if let Err(e) = conn.close().await {
                    tracing::debug!("Closing dead connection failed: {}", e);
                }
                self.handle = None;
                metrics::HOST_CONNECTION_OPEN.set(0);
            }
        }

        if self.handle.is_none() {
            let conn = client.connect(&self.raw).await.map_err(|e| {
                tracing::warn!("Failed to connect to {}: {}", self.raw, e);
                HyperError::connection(e)
            })?;
            self.generation += 1;
            self.handle = Some(conn.clone());
            metrics::HOST_CONNECTION_OPEN.set(1);
            metrics::HOST_CONNECTIONS_OPENED_TOTAL.inc();
            tracing::info!(
                "Connected to {} ({}, generation {})",
                self.target.address,
                self.raw,
                self.generation
            );
            for listener in &self.listeners {
                listener.fire_opened(&conn);
            }
        }

        self.handle
            .clone()
            .ok_or_else(|| HyperError::Connection("no connection".to_string()))
    }

    async fn close(&mut self) {
        let Some(conn) = self.handle.clone() else {
            return;
        };
        for listener in &self.listeners {
            listener.fire_closed(&conn);
        }
        self.handle = None;
        metrics::HOST_CONNECTION_OPEN.set(0);
        if let Err(e) = conn.close().await {
            tracing::debug!("Closing connection to {} failed: {}", self.raw, e);
        }
        tracing::info!("Closed connection to {}", self.raw);
    }
}

impl Hypervisor {
    /// Create a context for `uri`. No connection is made until first use.
    pub fn new(client: Arc<dyn HostClient>, uri: &str) -> Self {
        Self {
            client,
            state: RwLock::new(GuardState::new(uri)),
        }
    }

    /// Exclusive access to guard state, for operations that may replace the handle
    pub(crate) async fn lock(&self) -> RwLockWriteGuard<'_, GuardState> {
        self.state.write().await
    }

    pub(crate) fn client(&self) -> &dyn HostClient {
        self.client.as_ref()
    }

    /// Make sure a live connection exists, opening or replacing it if needed
    pub async fn open(&self) -> Result<()> {
        let mut state = self.state.write().await;
        state.ensure_open(self.client.as_ref()).await.map(|_| ())
    }

    /// Ensure the connection is open and borrow it for a sequence of host calls
    pub async fn session(&self) -> Result<Session<'_>> {
        let mut state = self.state.write().await;
        let conn = state.ensure_open(self.client.as_ref()).await?;
        Ok(Session {
            state: state.downgrade(),
            conn,
        })
    }

    /// Point the context at a different host.
    ///
    /// Setting the current URI again is a no-op. Otherwise the open connection
    /// is closed (listeners see `on_closed`), the target re-resolved and a new
    /// connection attempted. A failed attempt is returned but leaves the context
    /// usable; the next operation retries.
    pub async fn set_target(&self, raw: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if state.raw == raw {
            return Ok(());
        }
        state.close().await;
        state.raw = raw.to_string();
        state.target = resolve(raw);
        tracing::info!(
            "Hypervisor target set to {} (schema {}, address {}, path {})",
            raw,
            state.target.schema,
            state.target.address,
            state.target.path
        );
        state.ensure_open(self.client.as_ref()).await.map(|_| ())
    }

    /// Close the connection if one is open
    pub async fn close(&self) {
        self.state.write().await.close().await;
    }

    /// Register a lifecycle listener.
    ///
    /// If a connection is already open, `on_opened` is invoked right away so
    /// late registrants see the same state as early ones.
    pub async fn add_listener(&self, listener: Arc<LifecycleListener>) {
        let mut state = self.state.write().await;
        if let Some(conn) = &state.handle {
            listener.fire_opened(conn);
        }
        state.listeners.push(listener);
    }

    /// The connection string currently configured
    pub async fn uri(&self) -> String {
        self.state.read().await.raw.clone()
    }

    pub async fn target(&self) -> Target {
        self.state.read().await.target.clone()
    }

    /// Whether a handle is currently held (not probed)
    pub async fn is_open(&self) -> bool {
        self.state.read().await.handle.is_some()
    }

    /// Number of connections opened so far
    pub async fn generation(&self) -> u64 {
        self.state.read().await.generation
    }
}

impl fmt::Debug for Hypervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hypervisor").finish_non_exhaustive()
    }
}

//! Connection lifecycle listeners

use crate::host::HostConnection;
use std::fmt;
use std::sync::Arc;

/// Callback invoked with the connection that was opened or is about to close
pub type LifecycleCallback =
    Box<dyn Fn(&Arc<dyn HostConnection>) -> anyhow::Result<()> + Send + Sync>;

/// A pair of optional callbacks fired on connection open/close.
///
/// Callbacks run while the connection guard holds its exclusive lock, so they
/// must not call back into the [`Hypervisor`](super::Hypervisor).
#[derive(Default)]
pub struct LifecycleListener {
    on_opened: Option<LifecycleCallback>,
    on_closed: Option<LifecycleCallback>,
}

impl LifecycleListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_opened<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<dyn HostConnection>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_opened = Some(Box::new(f));
        self
    }

    pub fn on_closed<F>(mut self, f: F) -> Self
    where
        F: Fn(&Arc<dyn HostConnection>) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_closed = Some(Box::new(f));
        self
    }

    pub(crate) fn fire_opened(&self, conn: &Arc<dyn HostConnection>) {
        if let Some(cb) = &self.on_opened {
            if let Err(e) = cb(conn) {
                tracing::warn!("Connection opened listener failed: {:#}", e);
            }
        }
    }

    pub(crate) fn fire_closed(&self, conn: &Arc<dyn HostConnection>) {
        if let Some(cb) = &self.on_closed {
            if let Err(e) = cb(conn) {
                tracing::warn!("Connection closed listener failed: {:#}", e);
            }
        }
    }
}

impl fmt::Debug for LifecycleListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleListener")
            .field("on_opened", &self.on_opened.is_some())
            .field("on_closed", &self.on_closed.is_some())
            .finish()
    }
}

//! Host CPU and memory telemetry
//!
//! The host only reports cumulative CPU-time counters. Idle utilization is
//! derived by differencing two snapshots: the share of elapsed CPU time spent
//! idle, in parts per thousand. [`CpuSampler`] takes a snapshot on a fixed
//! interval in the background; readers get the latest derived value from
//! [`Hypervisor::get_cpu`].
//!
//! A snapshot is only differenced against one taken on the same connection
//! generation. After a reconnect the counters may come from a restarted
//! daemon, so the next tick takes a fresh baseline instead.

use super::Hypervisor;
use crate::error::Result;
use crate::host::CpuStats;
use crate::metrics;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Idle value reported before any delta has been observed, or when the host is unreachable
pub const IDLE_UNKNOWN: u64 = 1000;

/// Default sampling period
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// CPU counters captured at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuSnapshot {
    pub stats: CpuStats,

    /// Connection generation the counters were read on
    pub generation: u64,

    pub taken_at: DateTime<Utc>,
}

impl CpuSnapshot {
    pub fn new(stats: CpuStats, generation: u64) -> Self {
        Self {
            stats,
            generation,
            taken_at: Utc::now(),
        }
    }

    /// Sum of all counters
    pub fn total(&self) -> u64 {
        let s = &self.stats;
        s.user
            .saturating_add(s.idle)
            .saturating_add(s.kernel)
            .saturating_add(s.intr)
            .saturating_add(s.iowait)
    }

    /// Wall-clock time between `older` and this snapshot
    pub fn elapsed_since(&self, older: &CpuSnapshot) -> chrono::Duration {
        self.taken_at - older.taken_at
    }
}

/// Per-mille idle time between two snapshots.
///
/// Returns `None` when no CPU time elapsed or the counters went backwards.
pub fn idle_per_mille(older: &CpuSnapshot, newer: &CpuSnapshot) -> Option<u64> {
    let elapsed = newer.total().checked_sub(older.total())?;
    let idle = newer.stats.idle.checked_sub(older.stats.idle)?;
    if elapsed == 0 {
        return None;
    }
    let per_mille = (idle as u128 * 1000) / elapsed as u128;
    Some(per_mille.min(1000) as u64)
}

/// Sampler state kept under the connection guard
#[derive(Debug)]
pub(crate) struct CpuState {
    previous: Option<CpuSnapshot>,
    idle_per_mille: u64,
}

impl Default for CpuState {
    fn default() -> Self {
        Self {
            previous: None,
            idle_per_mille: IDLE_UNKNOWN,
        }
    }
}

/// Node CPU summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CpuUsage {
    /// Logical CPU count
    pub cpus: u32,

    /// CPU model identifier
    pub model: String,

    /// Idle time in parts per thousand
    pub idle_per_mille: u64,
}

impl CpuUsage {
    fn unknown() -> Self {
        Self {
            cpus: 0,
            model: String::new(),
            idle_per_mille: IDLE_UNKNOWN,
        }
    }
}

/// Node memory summary in bytes; fields the host did not report are zero
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryUsage {
    pub total: u64,
    pub free: u64,
    pub cached: u64,
}

impl Hypervisor {
    /// Take one CPU sample and update the derived idle value.
    ///
    /// Runs entirely under the guard's exclusive lock. On error nothing is
    /// updated and the previous value stays in place.
    pub async fn sample_cpu(&self) -> Result<u64> {
        let mut state = self.lock().await;
        let conn = state.ensure_open(self.client()).await?;
        let generation = state.generation;

        let previous = state.cpu.previous;
        let older = match previous {
            Some(prev) if prev.generation == generation => prev,
            _ => CpuSnapshot::new(conn.cpu_stats().await?, generation),
        };
        let newer = CpuSnapshot::new(conn.cpu_stats().await?, generation);

        match idle_per_mille(&older, &newer) {
            Some(idle) => {
                state.cpu.idle_per_mille = idle;
                metrics::HOST_IDLE_PER_MILLE.set(idle as i64);
            }
            None => tracing::debug!("No CPU time elapsed between samples, keeping previous value"),
        }
        state.cpu.previous = Some(newer);

        tracing::debug!(
            "CPU sample: idle {}/1000 over {} ms (generation {})",
            state.cpu.idle_per_mille,
            newer.elapsed_since(&older).num_milliseconds(),
            generation
        );
        Ok(state.cpu.idle_per_mille)
    }

    /// Latest derived idle value, without touching the host
    pub async fn idle_per_mille(&self) -> u64 {
        self.state.read().await.cpu.idle_per_mille
    }

    /// CPU count, model and current idle value.
    ///
    /// Returns `(0, "", 1000)` if the host cannot be reached.
    pub async fn get_cpu(&self) -> CpuUsage {
        let session = match self.session().await {
            Ok(session) => session,
            Err(e) => {
                tracing::debug!("get_cpu: {}", e);
                return CpuUsage::unknown();
            }
        };
        match session.node_info().await {
            Ok(info) => CpuUsage {
                cpus: info.cpus,
                model: info.model,
                idle_per_mille: session.state.cpu.idle_per_mille,
            },
            Err(e) => {
                tracing::debug!("get_cpu: node info failed: {}", e);
                CpuUsage::unknown()
            }
        }
    }

    /// Total, free and cached memory in bytes; all zero if the host cannot be reached
    pub async fn get_mem(&self) -> MemoryUsage {
        let session = match self.session().await {
            Ok(session) => session,
            Err(e) => {
                tracing::debug!("get_mem: {}", e);
                return MemoryUsage::default();
            }
        };
        match session.memory_stats().await {
            Ok(stats) => MemoryUsage {
                total: stats.total.map_or(0, |kib| kib.saturating_mul(1024)),
                free: stats.free.map_or(0, |kib| kib.saturating_mul(1024)),
                cached: stats.cached.map_or(0, |kib| kib.saturating_mul(1024)),
            },
            Err(e) => {
                tracing::debug!("get_mem: memory stats failed: {}", e);
                MemoryUsage::default()
            }
        }
    }
}

/// Background task sampling host CPU counters on a fixed interval
pub struct CpuSampler {
    shutdown_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl CpuSampler {
    /// Start sampling `hypervisor` every `interval`. The first tick fires immediately.
    pub fn spawn(hypervisor: Arc<Hypervisor>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::info!("CPU sampler started (interval {:?})", interval);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = hypervisor.sample_cpu().await {
                            metrics::CPU_SAMPLE_FAILURES_TOTAL.inc();
                            tracing::warn!("CPU sample skipped: {}", e);
                        }
                    }
                }
            }

            tracing::info!("CPU sampler stopped");
        });

        Self {
            shutdown_tx,
            handle: Some(handle),
        }
    }

    /// Signal the task to stop. Safe to call more than once.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop the task and wait for it to exit
    pub async fn shutdown(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!("CPU sampler task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }
}

impl Drop for CpuSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::sim::SimHost;
    use crate::host::MemoryStats;
    use crate::hypervisor::DEFAULT_URI;

    const OLDER: CpuStats = CpuStats {
        user: 100,
        idle: 800,
        kernel: 50,
        intr: 10,
        iowait: 40,
    };
    const NEWER: CpuStats = CpuStats {
        user: 110,
        idle: 880,
        kernel: 52,
        intr: 11,
        iowait: 41,
    };

    #[test]
    fn test_idle_per_mille_literal_values() {
        let older = CpuSnapshot::new(OLDER, 1);
        let newer = CpuSnapshot::new(NEWER, 1);
        assert_eq!(older.total(), 1000);
        assert_eq!(newer.total(), 1094);
        assert_eq!(idle_per_mille(&older, &newer), Some(851));
    }

    #[test]
    fn test_idle_per_mille_no_movement() {
        let snap = CpuSnapshot::new(OLDER, 1);
        assert_eq!(idle_per_mille(&snap, &snap), None);
    }

    #[test]
    fn test_idle_per_mille_counter_reset() {
        let older = CpuSnapshot::new(NEWER, 1);
        let newer = CpuSnapshot::new(OLDER, 1);
        assert_eq!(idle_per_mille(&older, &newer), None);
    }

    #[test]
    fn test_snapshot_elapsed_since() {
        let older = CpuSnapshot::new(OLDER, 1);
        let mut newer = CpuSnapshot::new(NEWER, 1);
        newer.taken_at = older.taken_at + chrono::Duration::milliseconds(2000);
        assert_eq!(newer.elapsed_since(&older).num_milliseconds(), 2000);
    }

    #[tokio::test]
    async fn test_first_sample_keeps_default_until_movement() {
        let host = SimHost::new();
        host.push_cpu_stats(OLDER).await;
        let hv = Hypervisor::new(Arc::new(host.clone()), DEFAULT_URI);

        // Baseline and newer read back-to-back with no movement
        assert_eq!(hv.sample_cpu().await.unwrap(), IDLE_UNKNOWN);

        host.push_cpu_stats(NEWER).await;
        assert_eq!(hv.sample_cpu().await.unwrap(), 851);

        // No further movement keeps the value
        assert_eq!(hv.sample_cpu().await.unwrap(), 851);
        assert_eq!(hv.idle_per_mille().await, 851);
    }

    #[tokio::test]
    async fn test_failed_sample_keeps_previous_value() {
        let host = SimHost::new();
        host.push_cpu_stats(OLDER).await;
        host.push_cpu_stats(NEWER).await;
        let hv = Hypervisor::new(Arc::new(host.clone()), DEFAULT_URI);
        assert_eq!(hv.sample_cpu().await.unwrap(), 851);

        host.go_down();
        assert!(hv.sample_cpu().await.is_err());
        assert_eq!(hv.idle_per_mille().await, 851);
    }

    #[tokio::test]
    async fn test_reconnect_takes_fresh_baseline() {
        let host = SimHost::new();
        host.push_cpu_stats(CpuStats {
            user: 5_000,
            idle: 90_000,
            kernel: 2_000,
            intr: 100,
            iowait: 400,
        })
        .await;
        let hv = Hypervisor::new(Arc::new(host.clone()), DEFAULT_URI);
        hv.sample_cpu().await.unwrap();

        host.go_down();
        assert!(hv.sample_cpu().await.is_err());

        // Restarted daemon reports counters from a much lower origin
        host.come_up();
        host.push_cpu_stats(OLDER).await;
        host.push_cpu_stats(NEWER).await;
        assert_eq!(hv.sample_cpu().await.unwrap(), 851);
        assert_eq!(hv.generation().await, 2);
    }

    #[tokio::test]
    async fn test_get_cpu_degrades_when_unreachable() {
        let host = SimHost::new();
        host.go_down();
        let hv = Hypervisor::new(Arc::new(host), DEFAULT_URI);
        assert_eq!(
            hv.get_cpu().await,
            CpuUsage {
                cpus: 0,
                model: String::new(),
                idle_per_mille: 1000,
            }
        );
    }

    #[tokio::test]
    async fn test_get_cpu_reports_node_info() {
        let host = SimHost::new();
        host.set_node_info(8, "x86_64", 16 * 1024 * 1024).await;
        host.push_cpu_stats(OLDER).await;
        host.push_cpu_stats(NEWER).await;
        let hv = Hypervisor::new(Arc::new(host), DEFAULT_URI);
        hv.sample_cpu().await.unwrap();

        let cpu = hv.get_cpu().await;
        assert_eq!(cpu.cpus, 8);
        assert_eq!(cpu.model, "x86_64");
        assert_eq!(cpu.idle_per_mille, 851);
    }

    #[tokio::test]
    async fn test_get_mem_converts_kib_and_missing_fields() {
        let host = SimHost::new();
        host.set_memory_stats(MemoryStats {
            total: Some(2048),
            free: Some(0),
            cached: None,
        })
        .await;
        let hv = Hypervisor::new(Arc::new(host.clone()), DEFAULT_URI);
        assert_eq!(
            hv.get_mem().await,
            MemoryUsage {
                total: 2048 * 1024,
                free: 0,
                cached: 0,
            }
        );

        host.go_down();
        assert_eq!(hv.get_mem().await, MemoryUsage::default());
    }

    #[tokio::test]
    async fn test_get_mem_saturates_huge_values() {
        let host = SimHost::new();
        host.set_memory_stats(MemoryStats {
            total: Some(u64::MAX / 512),
            free: Some(u64::MAX),
            cached: Some(1),
        })
        .await;
        let hv = Hypervisor::new(Arc::new(host), DEFAULT_URI);
        assert_eq!(
            hv.get_mem().await,
            MemoryUsage {
                total: u64::MAX,
                free: u64::MAX,
                cached: 1024,
            }
        );
    }

    #[tokio::test]
    async fn test_idle_read_while_session_held() {
        let host = SimHost::new();
        let hv = Hypervisor::new(Arc::new(host), DEFAULT_URI);
        let session = hv.session().await.unwrap();

        let idle = tokio::time::timeout(Duration::from_secs(1), hv.idle_per_mille())
            .await
            .expect("idle read blocked behind an open session");
        assert_eq!(idle, IDLE_UNKNOWN);
        drop(session);
    }

    #[tokio::test]
    async fn test_sampler_task_runs_and_shuts_down() {
        let host = SimHost::new();
        host.push_cpu_stats(OLDER).await;
        host.push_cpu_stats(NEWER).await;
        let hv = Arc::new(Hypervisor::new(Arc::new(host), DEFAULT_URI));

        let mut sampler = CpuSampler::spawn(hv.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(80)).await;
        sampler.shutdown().await;
        assert!(sampler.is_finished());
        assert_eq!(hv.idle_per_mille().await, 851);

        // Second shutdown is a no-op
        sampler.shutdown().await;
    }

    #[tokio::test]
    async fn test_sampler_survives_host_outage() {
        let host = SimHost::new();
        host.go_down();
        let hv = Arc::new(Hypervisor::new(Arc::new(host.clone()), DEFAULT_URI));

        let mut sampler = CpuSampler::spawn(hv.clone(), Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!sampler.is_finished());
        assert_eq!(hv.idle_per_mille().await, IDLE_UNKNOWN);

        host.come_up();
        host.push_cpu_stats(OLDER).await;
        host.push_cpu_stats(NEWER).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
        sampler.shutdown().await;
        assert_eq!(hv.idle_per_mille().await, 851);
    }
}

//! hyperconn Library
//!
//! This library keeps one resilient connection to a virtualization host and
//! builds host telemetry, domain lookup and storage pool management on top of it.
//!
//! - [`hypervisor`]: connection guard, CPU sampler, domain resolver
//! - [`storage`]: idempotent storage pool create/remove
//! - [`host`]: the host client contract and an in-memory simulated host

pub mod config;
pub mod error;
pub mod host;
pub mod hypervisor;
pub mod metrics;
pub mod storage;

pub use error::{HyperError, Result};
pub use hypervisor::{CpuSampler, Domain, Hypervisor, LifecycleListener, Session, Target};

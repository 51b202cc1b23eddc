//! Property-Based Tests for the Hypervisor Module
//!
//! - **Address Resolution**: ports and user prefixes never leak into the
//!   resolved address, and strings without `://` always resolve locally
//! - **Idle Utilization**: the derived value stays within 0..=1000 and matches
//!   the integer formula whenever time has elapsed
//!
//! # Running the Tests
//!
//! ```bash
//! cargo test --lib hypervisor::proptests
//! ```

use proptest::prelude::*;

use crate::host::CpuStats;
use crate::hypervisor::address::{resolve, LOCAL_ADDRESS, LOCAL_PATH};
use crate::hypervisor::sampler::{idle_per_mille, CpuSnapshot};

fn arb_host() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9.-]{0,20}"
}

fn arb_path() -> impl Strategy<Value = String> {
    "[a-z]{1,10}"
}

fn arb_stats() -> impl Strategy<Value = CpuStats> {
    (0u64..1 << 40, 0u64..1 << 40, 0u64..1 << 40, 0u64..1 << 30, 0u64..1 << 30).prop_map(
        |(user, idle, kernel, intr, iowait)| CpuStats {
            user,
            idle,
            kernel,
            intr,
            iowait,
        },
    )
}

// ============================================================================
// Property 1: Address Resolution
// ============================================================================

proptest! {
    /// Ports are discarded for network schemas
    #[test]
    fn prop_network_port_discarded(
        schema in prop_oneof![Just("qemu+tcp"), Just("qemu+tls"), Just("qemu+ssh")],
        host in arb_host(),
        port in 1u16..=u16::MAX,
        path in arb_path()
    ) {
        let target = resolve(&format!("{}://{}:{}/{}", schema, host, port, path));
        prop_assert_eq!(target.address, host);
        prop_assert_eq!(target.path, path);
    }

    /// SSH user prefixes are stripped
    #[test]
    fn prop_ssh_user_stripped(
        user in "[a-z_][a-z0-9_]{0,8}",
        host in arb_host(),
        path in arb_path()
    ) {
        let target = resolve(&format!("qemu+ssh://{}@{}/{}", user, host, path));
        prop_assert_eq!(target.address, host);
        prop_assert_eq!(target.path, path);
    }

    /// Anything without a scheme separator targets the local system
    #[test]
    fn prop_no_separator_is_local(raw in "[a-zA-Z0-9+.@/_-]*") {
        prop_assume!(!raw.contains("://"));
        let target = resolve(&raw);
        prop_assert_eq!(target.address, LOCAL_ADDRESS);
        prop_assert_eq!(target.path, LOCAL_PATH);
    }

    /// Resolution never leaves a port separator in the address
    #[test]
    fn prop_address_has_no_colon(raw in ".*") {
        prop_assert!(!resolve(&raw).address.contains(':'));
    }
}

// ============================================================================
// Property 2: Idle Utilization
// ============================================================================

proptest! {
    /// Derived idle value is bounded and follows the integer formula
    #[test]
    fn prop_idle_matches_formula(
        base in arb_stats(),
        d_user in 0u64..100_000,
        d_idle in 0u64..100_000,
        d_kernel in 0u64..100_000,
        d_intr in 0u64..1_000,
        d_iowait in 0u64..1_000
    ) {
        let older = CpuSnapshot::new(base, 1);
        let newer = CpuSnapshot::new(
            CpuStats {
                user: base.user + d_user,
                idle: base.idle + d_idle,
                kernel: base.kernel + d_kernel,
                intr: base.intr + d_intr,
                iowait: base.iowait + d_iowait,
            },
            1,
        );
        let elapsed = d_user + d_idle + d_kernel + d_intr + d_iowait;

        match idle_per_mille(&older, &newer) {
            Some(idle) => {
                prop_assert!(idle <= 1000);
                prop_assert_eq!(idle, 1000 * d_idle / elapsed);
            }
            None => prop_assert_eq!(elapsed, 0),
        }
    }

    /// Counters moving backwards never produce a value
    #[test]
    fn prop_idle_counter_reset(a in arb_stats(), b in arb_stats()) {
        let older = CpuSnapshot::new(a, 1);
        let newer = CpuSnapshot::new(b, 1);
        if b.idle < a.idle || newer.total() < older.total() {
            prop_assert_eq!(idle_per_mille(&older, &newer), None);
        }
    }
}

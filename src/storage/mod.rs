//! Storage Management
//!
//! Host storage pools and their volumes, managed through the shared
//! [`Hypervisor`](crate::hypervisor::Hypervisor) connection.

pub mod pool;

pub use pool::{create_pool, domain_pool_name, is_domain_pool, remove_pool, Pool};

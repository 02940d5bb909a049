//! Flare Registry
//!
//! Lease-backed service registry on a consistent KV store (etcd v3), paired with a
//! client-side gRPC balancer that turns registry snapshots into connections and pickers.

pub mod app;
pub mod balancer;
pub mod config;
pub mod error;
pub mod kv;
pub mod logging;
pub mod registry;
pub mod types;

// Re-exports
pub use app::AppIdentity;
pub use balancer::{
    Address, BalancedChannel, BaseBalancer, ChannelPool, ConnectivityState, Picker, PickerBuilder,
    RegistryResolver, ResolverState,
};
pub use config::{BalancerConfig, Config, LogConfig, PickPolicy, RegistryConfig, RegistryKind};
pub use error::{Error, ErrorCategory, ErrorCode, Result};
pub use kv::{EtcdKv, KvClient, MemoryKv};
pub use logging::init_tracing;
pub use registry::{
    Endpoints, EtcdRegistry, LocalRegistry, Registry, RouteConfig, Target, create_registry,
};
pub use types::{ServiceInfo, ServiceKind};

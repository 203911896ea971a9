//! Cluster membership and bootstrap
//!
//! A node must be a cluster member before it aggregates anything. Discovery
//! is one of three modes, picked once from configuration:
//!
//! - **Static**: an explicit bootstrap address (`BOOTSTRAP_SERVER`)
//! - **Dns**: a headless-service name resolved to peers (`KUBERNETES_DNS_NAME`)
//! - **Default**: `localhost:5701`, or a cluster of one when nobody answers

pub mod config;
pub mod coordinator;
pub mod listener;
pub mod message;
pub mod resolver;

pub use config::{
    ClusterConfig, DiscoveryStrategy, DEFAULT_BOOTSTRAP_ADDRESS, DEFAULT_CLUSTER_NAME_PREFIX,
    DEFAULT_PORT,
};
pub use coordinator::{ClusterMembership, MembershipCoordinator, MembershipState};
pub use listener::{bind_listener, MembershipTable};
pub use message::{MemberInfo, MembershipMessage, NodeId, MAX_FRAME_SIZE};
pub use resolver::{NameResolver, StaticResolver, SystemResolver};

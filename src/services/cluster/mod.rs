pub mod health;
pub mod lease;
pub mod node_registry;
pub mod placement;
pub mod replication;

#[cfg(test)]
pub use lease::MemoryLeaseStore;
pub use lease::{LeaseError, LeaseStore, RedisLeaseStore};
pub use node_registry::NodeRegistry;
pub use placement::{PlacementError, PlacementService};
pub use replication::{ReplicationContext, ReplicationPlanner};

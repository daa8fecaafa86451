//! Reconciliation of composable devices with the cluster
//!
//! - `model`: machines and their per-pass device lists
//! - `identity`: node to machine UUID resolution
//! - `inventory`: fabric membership, device counts and quota bounds with
//!   per-pass memoization
//! - `pool`: device pools, generations and the publisher seam
//! - `labels`: node label synchronization
//! - `engine`: the pass and its scheduling loop

pub mod engine;
pub mod identity;
pub mod inventory;
pub mod labels;
pub mod model;
pub mod pool;

pub use engine::{
    spawn_engine, Collaborators, EngineError, EngineOptions, PassSummary, ReconciliationEngine,
};
pub use identity::IdentityResolver;
pub use inventory::{DeviceInventory, FabricMembership, NodeGroupIndex, QuotaResolver};
pub use labels::{sync_labels, LabelChanges};
pub use model::{Device, DeviceList, FabricId, Machine};
pub use pool::{Pool, PoolChange, PoolDevice, PoolPublisher, PoolState, PublishError};

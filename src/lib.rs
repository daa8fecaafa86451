//! # composable-dra
//!
//! Keeps a cluster's advertised pools of fabric-attached composable devices
//! in sync with the live inventory of the composable-infrastructure services,
//! and keeps node labels consistent with each node's fabric membership and
//! device quotas.
//!
//! ```text
//!  IdentityResolver ─► FabricMembership ─► DeviceInventory (per fabric)
//!                                              │
//!                         QuotaResolver ◄──────┘  (per node group)
//!                              │
//!                    diff-and-publish ─► label sync
//! ```
//!
//! The pass runs on a fixed interval inside `cluster::ReconciliationEngine`.
//! Outbound calls to the fabric inventory and policy service are
//! authorized through `client::CredentialCache`.

pub mod cli;
pub mod client;
pub mod cluster;
pub mod config;
pub mod context;
pub mod kube;

//! langop operator: reconciles agents, models, tools, personas and clusters

/// Cluster client abstraction over the langop kinds and their children
pub mod client;
/// Operator settings from flags and environment
pub mod config;
/// Shared controller context
pub mod context;
/// Controller construction
pub mod controller_runner;
/// Per-kind controllers
pub mod controllers;
/// Generic reconcile state machine
pub mod reconciler;
/// Owned-resource synchronizer
pub mod sync;
/// Agent code synthesis seam
pub mod synthesis;
/// Workload building blocks
pub mod workload;

#[cfg(test)]
mod testing;

pub use context::Context;
pub use reconciler::{error_policy, reconcile, Reconcilable};

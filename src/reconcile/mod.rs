//! Reconciliation module
//!
//! This module holds the decision engine that matches desired container
//! requests against observed runtime state, and the batch processor that
//! walks request sets and assembles result maps.

pub mod batch;
pub mod reconciler;

pub use batch::{BatchFailure, BatchProcessor, BatchResult, RunningContainers};
pub use reconciler::{Endpoint, Incumbent, Reconciler, ReconcilerConfig};

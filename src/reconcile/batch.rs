//! Request batch processing
//!
//! Walks a batch of container requests in input order, reconciling each one,
//! and assembles the unit -> endpoint result map that goes back to the
//! requesting layer. Entries are processed strictly in sequence so no two
//! requests can race over the same identity label.
//!
//! A failing entry is recorded and processing continues; the batch always
//! returns its partial results rather than losing them to the first error.

use super::reconciler::{Endpoint, Reconciler};
use crate::request::ContainerRequest;
use std::collections::BTreeMap;

/// Result map returned to the requesting layer: unit -> endpoint
pub type RunningContainers = BTreeMap<String, Endpoint>;

/// One failed batch entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    /// Unit string of the failed request
    pub unit: String,
    /// What went wrong
    pub error: String,
}

/// Outcome of processing one batch
#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    /// Endpoints of satisfied requests, keyed by the original unit string
    pub running: RunningContainers,
    /// Entries that could not be reconciled
    pub failures: Vec<BatchFailure>,
}

impl BatchResult {
    /// Check if every entry in the batch succeeded
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Iterates request batches and drives the reconciler per entry
pub struct BatchProcessor {
    reconciler: Reconciler,
}

impl BatchProcessor {
    /// Create a new batch processor
    pub fn new(reconciler: Reconciler) -> Self {
        Self { reconciler }
    }

    /// Get the underlying reconciler
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Reconcile every request in input order, returning the unit -> endpoint
    /// map for satisfied requests and a failure record for the rest
    pub async fn process_available(&self, requests: &[ContainerRequest]) -> BatchResult {
        tracing::info!("Processing {} container requests", requests.len());
        let mut result = BatchResult::default();

        for request in requests {
            match self.ensure_one(request).await {
                Ok(endpoint) => {
                    result.running.insert(request.unit.clone(), endpoint);
                }
                Err(e) => {
                    tracing::warn!("Failed to reconcile {}: {}", request.unit, e);
                    result.failures.push(BatchFailure {
                        unit: request.unit.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        result
    }

    /// Tear down every request in the batch. The running map of the returned
    /// result stays empty; only failures carry information.
    pub async fn process_broken(&self, requests: &[ContainerRequest]) -> BatchResult {
        tracing::info!("Removing {} withdrawn container requests", requests.len());
        let mut result = BatchResult::default();

        for request in requests {
            match self.remove_one(request).await {
                Ok(()) => {}
                Err(e) => {
                    tracing::warn!("Failed to remove {}: {}", request.unit, e);
                    result.failures.push(BatchFailure {
                        unit: request.unit.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        result
    }

    async fn ensure_one(&self, request: &ContainerRequest) -> crate::error::Result<Endpoint> {
        request.validate()?;
        let identity = request.identity()?;
        self.reconciler
            .ensure_running(&identity, &request.image)
            .await
    }

    async fn remove_one(&self, request: &ContainerRequest) -> crate::error::Result<()> {
        let identity = request.identity()?;
        self.reconciler.remove(&identity).await
    }
}

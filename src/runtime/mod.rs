//! Container runtime gateway
//!
//! This module provides the seam between the reconciler and the local
//! container engine: pulling images, querying containers by label, running
//! containers with all declared ports published, and removing them.

pub mod docker;
pub mod memory;
pub mod types;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

pub use docker::DockerClient;
pub use memory::InMemoryRuntime;
pub use types::{
    ContainerStatus, HostBinding, ImageDescriptor, ObservedContainer, PortBinding, Protocol,
};

/// Gateway to the local container engine
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull an image by reference. Idempotent: pulling an already-present
    /// image succeeds and returns the same descriptor. Fails with
    /// `ImageResolution` on an unknown reference or registry failure.
    async fn pull_image(&self, image: &str) -> Result<ImageDescriptor>;

    /// Return all containers (running or not) carrying the exact label
    /// `key=value`. An empty match set is not an error.
    async fn find_by_label(&self, key: &str, value: &str) -> Result<Vec<ObservedContainer>>;

    /// Start a new detached container from the image with the given labels,
    /// publishing every declared container port to an ephemeral host port.
    /// Port bindings may not be populated yet when this returns, even once
    /// the container reports running; callers poll `inspect` until the
    /// bindings appear.
    async fn run(
        &self,
        image: &str,
        labels: &HashMap<String, String>,
    ) -> Result<ObservedContainer>;

    /// Re-read a container's current attributes
    async fn inspect(&self, id: &str) -> Result<ObservedContainer>;

    /// Stop (if needed) and delete a container. Removing an already-gone
    /// container is not an error.
    async fn remove(&self, id: &str, force: bool) -> Result<()>;
}

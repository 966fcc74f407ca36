//! In-memory container runtime
//!
//! An in-process stand-in for the Docker client used by tests and local
//! development. It keeps registered images and running containers in a shared
//! map, assigns ephemeral host ports the way the engine's publish-all mode
//! does, and counts gateway calls so reconciliation behaviour can be asserted
//! on.
//!
//! The binding delay knob reproduces the engine's port-assignment race: with
//! a delay of N, a freshly run container reports no port bindings until it
//! has been inspected N times.

use super::types::{
    ContainerStatus, ImageDescriptor, ObservedContainer, PortBinding, Protocol,
};
use super::ContainerRuntime;
use crate::error::{BerthError, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

/// Gateway call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeCounters {
    pub pulls: usize,
    pub runs: usize,
    pub inspects: usize,
    pub removes: usize,
}

/// A stored container with its not-yet-visible port bindings
#[derive(Debug, Clone)]
struct StoredContainer {
    container: ObservedContainer,
    /// Bindings assigned at run time, revealed once the delay elapses
    assigned_ports: Vec<PortBinding>,
    /// Inspects remaining until the container reports running with ports
    pending_inspects: u32,
}

impl StoredContainer {
    fn view(&self) -> ObservedContainer {
        self.container.clone()
    }

    fn reveal(&mut self) {
        self.container.status = ContainerStatus::Running;
        self.container.ports = self.assigned_ports.clone();
    }
}

#[derive(Debug, Default)]
struct Inner {
    images: HashMap<String, ImageDescriptor>,
    containers: HashMap<String, StoredContainer>,
    next_host_port: u16,
    binding_delay: u32,
    running_before_bindings: bool,
    counters: RuntimeCounters,
}

/// In-memory container runtime
pub struct InMemoryRuntime {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryRuntime {
    /// Create a new empty runtime
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                next_host_port: 32768,
                ..Inner::default()
            })),
        }
    }

    /// Register an image so it can be pulled, with the container ports it
    /// declares
    pub fn register_image(
        &self,
        reference: &str,
        repo_tags: &[&str],
        exposed_ports: &[(u16, Protocol)],
    ) -> Result<()> {
        let mut inner = self.write()?;

        inner.images.insert(
            reference.to_string(),
            ImageDescriptor {
                id: format!("sha256:{}", short_id()),
                repo_tags: repo_tags.iter().map(|t| t.to_string()).collect(),
                exposed_ports: exposed_ports.to_vec(),
            },
        );

        Ok(())
    }

    /// Delay port-binding visibility by the given number of inspects for
    /// subsequently run containers
    pub fn set_binding_delay(&self, inspects: u32) -> Result<()> {
        self.write()?.binding_delay = inspects;
        Ok(())
    }

    /// Report delayed containers as running while their port bindings are
    /// still hidden, as the engine does between start and network setup
    pub fn set_running_before_bindings(&self, enabled: bool) -> Result<()> {
        self.write()?.running_before_bindings = enabled;
        Ok(())
    }

    /// Inject a container directly, bypassing run. Used to set up incumbents
    /// and stray duplicates.
    pub fn insert_container(&self, container: ObservedContainer) -> Result<()> {
        let mut inner = self.write()?;
        let assigned_ports = container.ports.clone();

        inner.containers.insert(
            container.id.clone(),
            StoredContainer {
                container,
                assigned_ports,
                pending_inspects: 0,
            },
        );

        Ok(())
    }

    /// Snapshot the gateway call counters
    pub fn counters(&self) -> Result<RuntimeCounters> {
        Ok(self.read()?.counters)
    }

    /// Number of stored containers
    pub fn container_count(&self) -> Result<usize> {
        Ok(self.read()?.containers.len())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| BerthError::Lock("Failed to acquire read lock".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| BerthError::Lock("Failed to acquire write lock".to_string()))
    }
}

impl Default for InMemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for InMemoryRuntime {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[async_trait]
impl ContainerRuntime for InMemoryRuntime {
    async fn pull_image(&self, image: &str) -> Result<ImageDescriptor> {
        let mut inner = self.write()?;
        inner.counters.pulls += 1;

        inner
            .images
            .get(image)
            .map(|stored| stored.clone())
            .ok_or_else(|| BerthError::image_resolution(image, "no such image"))
    }

    async fn find_by_label(&self, key: &str, value: &str) -> Result<Vec<ObservedContainer>> {
        let inner = self.read()?;

        let mut matches: Vec<ObservedContainer> = inner
            .containers
            .values()
            .filter(|stored| stored.container.has_label(key, value))
            .map(StoredContainer::view)
            .collect();

        matches.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(matches)
    }

    async fn run(
        &self,
        image: &str,
        labels: &HashMap<String, String>,
    ) -> Result<ObservedContainer> {
        let mut inner = self.write()?;
        inner.counters.runs += 1;

        let descriptor = inner
            .images
            .get(image)
            .cloned()
            .ok_or_else(|| BerthError::Image(format!("No such image: {}", image)))?;

        let mut assigned_ports = Vec::new();
        for (container_port, protocol) in &descriptor.exposed_ports {
            let host_port = inner.next_host_port;
            inner.next_host_port += 1;
            assigned_ports.push(PortBinding {
                container_port: *container_port,
                protocol: *protocol,
                host_port,
            });
        }

        let status = if inner.running_before_bindings {
            ContainerStatus::Running
        } else {
            ContainerStatus::Created
        };

        let id = short_id();
        let mut stored = StoredContainer {
            container: ObservedContainer {
                id: id.clone(),
                labels: labels.clone(),
                image_tags: descriptor.repo_tags.clone(),
                status,
                ports: Vec::new(),
                created_at: Some(Utc::now()),
            },
            assigned_ports,
            pending_inspects: inner.binding_delay,
        };

        if stored.pending_inspects == 0 {
            stored.reveal();
        }

        let view = stored.view();
        inner.containers.insert(id, stored);
        Ok(view)
    }

    async fn inspect(&self, id: &str) -> Result<ObservedContainer> {
        let mut inner = self.write()?;
        inner.counters.inspects += 1;

        let stored = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| BerthError::ContainerNotFound(id.to_string()))?;

        if stored.pending_inspects > 0 {
            stored.pending_inspects -= 1;
            if stored.pending_inspects == 0 {
                stored.reveal();
            }
        }

        Ok(stored.view())
    }

    async fn remove(&self, id: &str, _force: bool) -> Result<()> {
        let mut inner = self.write()?;
        inner.counters.removes += 1;

        if inner.containers.remove(id).is_none() {
            tracing::debug!("Container {} already gone", id);
        }

        Ok(())
    }
}

/// Mint a short container/image ID
fn short_id() -> String {
    let id = Uuid::new_v4().to_string().replace('-', "");
    id[..12].to_string()
}

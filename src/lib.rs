//! Berth - a container reconciliation agent for a single host
//!
//! Berth keeps the set of running containers on a host consistent with a
//! desired set of container requests received from an external event layer.
//! For each requested (service, unit) pair it ensures exactly one container
//! is running the requested image, replacing stale containers when the image
//! changes, and reports back the resulting network endpoints. It provides:
//!
//! - A container runtime gateway (Docker Engine API client plus an in-memory
//!   runtime for tests and local development)
//! - A port exposure ledger mirroring container port bindings
//! - The reconciler deciding no-op / replace / create per request
//! - A batch processor assembling unit -> endpoint result maps

pub mod error;
pub mod ports;
pub mod reconcile;
pub mod request;
pub mod runtime;

pub use error::{BerthError, Result};
pub use ports::PortLedger;
pub use reconcile::{BatchProcessor, BatchResult, Endpoint, Reconciler, ReconcilerConfig};
pub use request::{ContainerRequest, ServiceUnit};
pub use runtime::{ContainerRuntime, DockerClient, InMemoryRuntime, ObservedContainer};

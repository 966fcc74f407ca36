//! Reconciliation of one desired request against observed container state

use crate::error::{BerthError, Result};
use crate::ports::PortLedger;
use crate::request::ServiceUnit;
use crate::runtime::{ContainerRuntime, ObservedContainer};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Reconciler configuration
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Address reported back to requesters as the container host
    pub host_address: String,
    /// Interval between port-binding polls
    pub binding_poll_interval: Duration,
    /// Upper bound on waiting for a started container to report its bindings
    pub binding_poll_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            host_address: gethostname::gethostname().to_string_lossy().to_string(),
            binding_poll_interval: Duration::from_millis(200),
            binding_poll_timeout: Duration::from_secs(10),
        }
    }
}

/// Network endpoint of one reconciled container
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Endpoint {
    /// Host address the container's ports are reachable on
    pub host: String,
    /// Mapping of container port to assigned host port
    pub ports: BTreeMap<String, String>,
}

/// Observed incumbent state for one identity label
#[derive(Debug)]
pub enum Incumbent {
    /// No container carries the label
    Zero,
    /// Exactly one container carries the label
    One(ObservedContainer),
    /// Multiple containers share the label; the invariant has been violated
    Many(Vec<ObservedContainer>),
}

impl Incumbent {
    /// Classify the runtime's match set for a label query
    pub fn classify(mut matches: Vec<ObservedContainer>) -> Self {
        match matches.len() {
            0 => Incumbent::Zero,
            1 => match matches.pop() {
                Some(container) => Incumbent::One(container),
                None => Incumbent::Zero,
            },
            _ => Incumbent::Many(matches),
        }
    }
}

/// The decision engine: brings one (service, unit) pair's container state
/// into agreement with its requested image, and keeps the port ledger in
/// sync with container lifecycle
pub struct Reconciler {
    /// Gateway to the container engine
    runtime: Arc<dyn ContainerRuntime>,
    /// Host port exposure ledger
    ledger: PortLedger,
    /// Configuration
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a new reconciler
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        ledger: PortLedger,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            runtime,
            ledger,
            config,
        }
    }

    /// Get the port ledger handle
    pub fn ledger(&self) -> &PortLedger {
        &self.ledger
    }

    /// Get the configuration
    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Ensure exactly one container is running the desired image for the
    /// given identity, and report its endpoint.
    ///
    /// Pull failures abort before any mutation. At most one mutating path is
    /// taken: no-op, replace, or create.
    pub async fn ensure_running(&self, identity: &ServiceUnit, image: &str) -> Result<Endpoint> {
        let label = identity.label();
        let descriptor = self.runtime.pull_image(image).await?;

        let matches = self
            .runtime
            .find_by_label(identity.label_key(), identity.label_value())
            .await?;

        let container = match Incumbent::classify(matches) {
            Incumbent::Zero => {
                tracing::info!("No container with label {}, starting {}", label, image);
                self.start_container(identity, image).await?
            }
            Incumbent::One(incumbent) => {
                if !incumbent.is_running() {
                    tracing::info!(
                        "Container with label {} is {}, replacing",
                        label,
                        incumbent.status
                    );
                    self.remove(identity).await?;
                    self.start_container(identity, image).await?
                } else if incumbent.image_tags == descriptor.repo_tags {
                    tracing::info!(
                        "Container with label {} already runs image {:?}, nothing to do",
                        label,
                        descriptor.repo_tags
                    );
                    incumbent
                } else {
                    tracing::info!(
                        "Container with label {} runs image {:?} (required: {:?}), replacing",
                        label,
                        incumbent.image_tags,
                        descriptor.repo_tags
                    );
                    self.remove(identity).await?;
                    self.start_container(identity, image).await?
                }
            }
            Incumbent::Many(stale) => {
                tracing::warn!(
                    "{} containers share label {}, converging to one",
                    stale.len(),
                    label
                );
                self.remove(identity).await?;
                self.start_container(identity, image).await?
            }
        };

        let expects_ports = !descriptor.exposed_ports.is_empty();
        let container = self.wait_for_bindings(container, expects_ports).await?;

        let mut ports = BTreeMap::new();
        for binding in &container.ports {
            self.ledger.open(binding.host_port, binding.protocol)?;
            ports.insert(
                binding.container_port.to_string(),
                binding.host_port.to_string(),
            );
        }

        Ok(Endpoint {
            host: self.config.host_address.clone(),
            ports,
        })
    }

    /// Tear down every container carrying the identity label, closing its
    /// exposed ports first. A missing incumbent is a no-op.
    pub async fn remove(&self, identity: &ServiceUnit) -> Result<()> {
        let label = identity.label();
        let matches = self
            .runtime
            .find_by_label(identity.label_key(), identity.label_value())
            .await?;

        if matches.is_empty() {
            tracing::info!("No containers with label {}, nothing to remove", label);
            return Ok(());
        }

        for container in matches {
            tracing::info!("Removing container {} with label {}", container.id, label);

            for binding in &container.ports {
                self.ledger.close(binding.host_port, binding.protocol)?;
            }

            self.runtime.remove(&container.id, true).await?;
        }

        Ok(())
    }

    /// Start a new labeled container from the image
    async fn start_container(
        &self,
        identity: &ServiceUnit,
        image: &str,
    ) -> Result<ObservedContainer> {
        let mut labels = HashMap::new();
        labels.insert(identity.service.clone(), identity.unit_id.clone());

        tracing::info!(
            "Starting container for {} from image {}. This might take a while.",
            identity,
            image
        );

        self.runtime.run(image, &labels).await
    }

    /// Poll until the container reports running with its port bindings
    /// populated, bounded by the configured timeout.
    ///
    /// The engine assigns ephemeral host ports asynchronously after create
    /// returns; it can even report the container running before network
    /// setup finishes, so an empty port table only counts as ready when the
    /// image declares no exposed ports.
    async fn wait_for_bindings(
        &self,
        container: ObservedContainer,
        expects_ports: bool,
    ) -> Result<ObservedContainer> {
        let ready =
            |c: &ObservedContainer| c.is_running() && (!expects_ports || !c.ports.is_empty());

        if ready(&container) {
            return Ok(container);
        }

        let deadline = tokio::time::Instant::now() + self.config.binding_poll_timeout;
        let id = container.id;

        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(self.config.binding_poll_interval).await;

            let current = self.runtime.inspect(&id).await?;
            if ready(&current) {
                return Ok(current);
            }
        }

        Err(BerthError::PortBindingTimeout(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerStatus, InMemoryRuntime, PortBinding, Protocol};
    use chrono::Utc;

    fn test_config() -> ReconcilerConfig {
        ReconcilerConfig {
            host_address: "10.0.0.5".to_string(),
            binding_poll_interval: Duration::from_millis(1),
            binding_poll_timeout: Duration::from_millis(250),
        }
    }

    fn setup() -> (Reconciler, InMemoryRuntime) {
        let runtime = InMemoryRuntime::new();
        let reconciler = Reconciler::new(
            Arc::new(runtime.clone()),
            PortLedger::new(),
            test_config(),
        );
        (reconciler, runtime)
    }

    fn web_identity() -> ServiceUnit {
        ServiceUnit::new("web", "0")
    }

    #[tokio::test]
    async fn test_create_when_no_incumbent() {
        let (reconciler, runtime) = setup();
        runtime
            .register_image("nginx:1.21", &["nginx:1.21"], &[(80, Protocol::Tcp)])
            .unwrap();

        let endpoint = reconciler
            .ensure_running(&web_identity(), "nginx:1.21")
            .await
            .unwrap();

        assert_eq!(endpoint.host, "10.0.0.5");
        assert_eq!(endpoint.ports.get("80").map(String::as_str), Some("32768"));
        assert_eq!(runtime.counters().unwrap().runs, 1);
        assert!(reconciler.ledger().is_open(32768, Protocol::Tcp).unwrap());
    }

    #[tokio::test]
    async fn test_ensure_running_is_idempotent() {
        let (reconciler, runtime) = setup();
        runtime
            .register_image("nginx:1.21", &["nginx:1.21"], &[(80, Protocol::Tcp)])
            .unwrap();

        let first = reconciler
            .ensure_running(&web_identity(), "nginx:1.21")
            .await
            .unwrap();
        let second = reconciler
            .ensure_running(&web_identity(), "nginx:1.21")
            .await
            .unwrap();

        assert_eq!(first, second);
        let counters = runtime.counters().unwrap();
        assert_eq!(counters.runs, 1);
        assert_eq!(counters.removes, 0);
        assert_eq!(reconciler.ledger().count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_replacement_on_image_change() {
        let (reconciler, runtime) = setup();
        runtime
            .register_image("app:1", &["app:1"], &[(80, Protocol::Tcp)])
            .unwrap();
        runtime
            .register_image("app:2", &["app:2"], &[(80, Protocol::Tcp)])
            .unwrap();

        let old = reconciler
            .ensure_running(&web_identity(), "app:1")
            .await
            .unwrap();
        let new = reconciler
            .ensure_running(&web_identity(), "app:2")
            .await
            .unwrap();

        let counters = runtime.counters().unwrap();
        assert_eq!(counters.runs, 2);
        assert_eq!(counters.removes, 1);
        assert_eq!(runtime.container_count().unwrap(), 1);

        // Only the replacement's ports remain open
        let old_port: u16 = old.ports.get("80").unwrap().parse().unwrap();
        let new_port: u16 = new.ports.get("80").unwrap().parse().unwrap();
        assert_ne!(old_port, new_port);
        assert!(!reconciler.ledger().is_open(old_port, Protocol::Tcp).unwrap());
        assert!(reconciler.ledger().is_open(new_port, Protocol::Tcp).unwrap());
        assert_eq!(reconciler.ledger().count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_exited_incumbent_is_replaced_despite_matching_image() {
        let (reconciler, runtime) = setup();
        runtime
            .register_image("nginx:1.21", &["nginx:1.21"], &[(80, Protocol::Tcp)])
            .unwrap();

        let mut labels = HashMap::new();
        labels.insert("web".to_string(), "0".to_string());
        runtime
            .insert_container(ObservedContainer {
                id: "dead00000000".to_string(),
                labels,
                image_tags: vec!["nginx:1.21".to_string()],
                status: ContainerStatus::Exited,
                ports: Vec::new(),
                created_at: Some(Utc::now()),
            })
            .unwrap();

        let endpoint = reconciler
            .ensure_running(&web_identity(), "nginx:1.21")
            .await
            .unwrap();

        assert_eq!(endpoint.ports.get("80").map(String::as_str), Some("32768"));
        let counters = runtime.counters().unwrap();
        assert_eq!(counters.removes, 1);
        assert_eq!(counters.runs, 1);
        assert_eq!(runtime.container_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_waits_for_bindings_when_running_precedes_them() {
        let (reconciler, runtime) = setup();
        runtime
            .register_image("nginx:1.21", &["nginx:1.21"], &[(80, Protocol::Tcp)])
            .unwrap();
        runtime.set_binding_delay(3).unwrap();
        runtime.set_running_before_bindings(true).unwrap();

        let endpoint = reconciler
            .ensure_running(&web_identity(), "nginx:1.21")
            .await
            .unwrap();

        assert_eq!(endpoint.ports.get("80").map(String::as_str), Some("32768"));
        assert!(runtime.counters().unwrap().inspects >= 3);
        assert!(reconciler.ledger().is_open(32768, Protocol::Tcp).unwrap());
    }

    #[tokio::test]
    async fn test_portless_image_needs_no_bindings() {
        let (reconciler, runtime) = setup();
        runtime
            .register_image("worker:1", &["worker:1"], &[])
            .unwrap();
        runtime.set_running_before_bindings(true).unwrap();
        runtime.set_binding_delay(100_000).unwrap();

        let endpoint = reconciler
            .ensure_running(&web_identity(), "worker:1")
            .await
            .unwrap();

        assert!(endpoint.ports.is_empty());
        assert_eq!(reconciler.ledger().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_pull_failure_aborts_without_mutation() {
        let (reconciler, runtime) = setup();

        let result = reconciler.ensure_running(&web_identity(), "ghost:1").await;

        assert!(matches!(result, Err(BerthError::ImageResolution { .. })));
        let counters = runtime.counters().unwrap();
        assert_eq!(counters.runs, 0);
        assert_eq!(counters.removes, 0);
        assert_eq!(reconciler.ledger().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_many_incumbents_converge_to_one() {
        let (reconciler, runtime) = setup();
        runtime
            .register_image("nginx:1.21", &["nginx:1.21"], &[(80, Protocol::Tcp)])
            .unwrap();

        reconciler
            .ensure_running(&web_identity(), "nginx:1.21")
            .await
            .unwrap();

        // A stray duplicate under the same label
        let mut labels = HashMap::new();
        labels.insert("web".to_string(), "0".to_string());
        runtime
            .insert_container(ObservedContainer {
                id: "stray0000000".to_string(),
                labels,
                image_tags: vec!["nginx:1.21".to_string()],
                status: ContainerStatus::Running,
                ports: vec![PortBinding {
                    container_port: 80,
                    protocol: Protocol::Tcp,
                    host_port: 40000,
                }],
                created_at: Some(Utc::now()),
            })
            .unwrap();

        reconciler
            .ensure_running(&web_identity(), "nginx:1.21")
            .await
            .unwrap();

        assert_eq!(runtime.container_count().unwrap(), 1);
        assert_eq!(runtime.counters().unwrap().removes, 2);
        assert!(!reconciler.ledger().is_open(40000, Protocol::Tcp).unwrap());
    }

    #[tokio::test]
    async fn test_remove_closes_all_ports_of_all_matches() {
        let (reconciler, runtime) = setup();

        for (id, host_port) in [("aaa000000000", 40001), ("bbb000000000", 40002)] {
            let mut labels = HashMap::new();
            labels.insert("web".to_string(), "0".to_string());
            runtime
                .insert_container(ObservedContainer {
                    id: id.to_string(),
                    labels,
                    image_tags: vec!["nginx:1.21".to_string()],
                    status: ContainerStatus::Running,
                    ports: vec![PortBinding {
                        container_port: 80,
                        protocol: Protocol::Tcp,
                        host_port,
                    }],
                    created_at: Some(Utc::now()),
                })
                .unwrap();
            reconciler.ledger().open(host_port, Protocol::Tcp).unwrap();
        }

        reconciler.remove(&web_identity()).await.unwrap();

        assert_eq!(runtime.container_count().unwrap(), 0);
        assert_eq!(runtime.counters().unwrap().removes, 2);
        assert_eq!(reconciler.ledger().count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_with_no_matches_is_a_noop() {
        let (reconciler, runtime) = setup();

        reconciler.remove(&web_identity()).await.unwrap();

        let counters = runtime.counters().unwrap();
        assert_eq!(counters.removes, 0);
        assert_eq!(counters.runs, 0);
    }

    #[tokio::test]
    async fn test_waits_for_delayed_port_bindings() {
        let (reconciler, runtime) = setup();
        runtime
            .register_image("nginx:1.21", &["nginx:1.21"], &[(80, Protocol::Tcp)])
            .unwrap();
        runtime.set_binding_delay(3).unwrap();

        let endpoint = reconciler
            .ensure_running(&web_identity(), "nginx:1.21")
            .await
            .unwrap();

        assert_eq!(endpoint.ports.len(), 1);
        assert!(runtime.counters().unwrap().inspects >= 3);
    }

    #[tokio::test]
    async fn test_binding_poll_times_out() {
        let (reconciler, runtime) = setup();
        runtime
            .register_image("nginx:1.21", &["nginx:1.21"], &[(80, Protocol::Tcp)])
            .unwrap();
        runtime.set_binding_delay(100_000).unwrap();

        let result = reconciler.ensure_running(&web_identity(), "nginx:1.21").await;

        assert!(matches!(result, Err(BerthError::PortBindingTimeout(_))));
    }

    #[test]
    fn test_incumbent_classification() {
        let container = ObservedContainer {
            id: "abc123".to_string(),
            labels: HashMap::new(),
            image_tags: Vec::new(),
            status: ContainerStatus::Running,
            ports: Vec::new(),
            created_at: None,
        };

        assert!(matches!(Incumbent::classify(vec![]), Incumbent::Zero));
        assert!(matches!(
            Incumbent::classify(vec![container.clone()]),
            Incumbent::One(_)
        ));
        assert!(matches!(
            Incumbent::classify(vec![container.clone(), container]),
            Incumbent::Many(_)
        ));
    }
}

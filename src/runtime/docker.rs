//! Docker Engine API client
//!
//! Speaks the Docker Engine HTTP API against a local daemon, with the API
//! version negotiated at connect time via `GET /version`. The transport is
//! TCP only; point `DOCKER_HOST` at a tcp:// or http:// address.

use super::types::{
    parse_port_table, ContainerStatus, HostBinding, ImageDescriptor, ObservedContainer,
};
use super::ContainerRuntime;
use crate::error::{BerthError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;

/// Default daemon address when `DOCKER_HOST` is not set
pub const DEFAULT_DOCKER_HOST: &str = "http://localhost:2375";

/// Docker Engine API client
pub struct DockerClient {
    /// Base URL including the negotiated API version, e.g.
    /// "http://localhost:2375/v1.43"
    api_base: String,
    /// HTTP client
    client: reqwest::Client,
}

/// Version info response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct VersionResponse {
    api_version: String,
}

/// Image inspect response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageInspect {
    id: String,
    #[serde(default)]
    repo_tags: Vec<String>,
    #[serde(default)]
    config: Option<ImageConfigInspect>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageConfigInspect {
    /// Declared ports, keyed "port/proto" with empty object values
    #[serde(default)]
    exposed_ports: Option<HashMap<String, serde_json::Value>>,
}

impl ImageInspect {
    /// Declared container ports, ignoring protocols berth cannot expose
    fn exposed_ports(&self) -> Vec<(u16, super::Protocol)> {
        let mut ports: Vec<(u16, super::Protocol)> = self
            .config
            .iter()
            .flat_map(|c| c.exposed_ports.iter().flatten())
            .filter_map(|(key, _)| super::types::parse_port_key(key).ok())
            .collect();
        ports.sort();
        ports
    }
}

/// Container summary from the list endpoint
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerSummary {
    id: String,
}

/// Container create request body
#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerCreateBody<'a> {
    image: &'a str,
    labels: &'a HashMap<String, String>,
    host_config: HostConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig {
    publish_all_ports: bool,
}

/// Container create response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerCreateResponse {
    id: String,
}

/// Container inspect response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    id: String,
    created: Option<String>,
    state: ContainerStateInspect,
    image: String,
    config: ContainerConfigInspect,
    network_settings: NetworkSettingsInspect,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerStateInspect {
    status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerConfigInspect {
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkSettingsInspect {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<HostBinding>>>>,
}

/// One line of the image pull progress stream
#[derive(Debug, Deserialize)]
struct PullProgressLine {
    #[serde(default)]
    error: Option<String>,
}

impl DockerClient {
    /// Connect to the daemon at the given base URL, negotiating the API
    /// version
    pub async fn connect(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::new();

        let response = client
            .get(format!("{}/version", base_url))
            .send()
            .await
            .map_err(request_err)?;

        if !response.status().is_success() {
            return Err(BerthError::RuntimeUnavailable(format!(
                "Version negotiation failed: {}",
                response.status()
            )));
        }

        let version: VersionResponse = response.json().await.map_err(request_err)?;

        tracing::debug!("Negotiated Docker API version {}", version.api_version);

        Ok(Self {
            api_base: format!("{}/v{}", base_url, version.api_version),
            client,
        })
    }

    /// Connect using `DOCKER_HOST`, falling back to the default local TCP
    /// address
    pub async fn from_env() -> Result<Self> {
        let host = std::env::var("DOCKER_HOST").unwrap_or_else(|_| DEFAULT_DOCKER_HOST.to_string());
        let base_url = normalize_host(&host)?;
        Self::connect(&base_url).await
    }

    /// Inspect an image by reference or ID
    async fn inspect_image(&self, reference: &str) -> Result<ImageInspect> {
        let url = format!("{}/images/{}/json", self.api_base, reference);

        let response = self.client.get(&url).send().await.map_err(request_err)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BerthError::image_resolution(reference, "no such image"));
        }
        if !response.status().is_success() {
            return Err(BerthError::Image(format!(
                "Failed to inspect image {}: {}",
                reference,
                response.status()
            )));
        }

        response.json().await.map_err(request_err)
    }

    /// Inspect a container and resolve its image tags
    async fn inspect_detail(&self, id: &str) -> Result<ObservedContainer> {
        let url = format!("{}/containers/{}/json", self.api_base, id);

        let response = self.client.get(&url).send().await.map_err(request_err)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(BerthError::ContainerNotFound(id.to_string()));
        }
        if !response.status().is_success() {
            return Err(BerthError::Container(format!(
                "Failed to inspect container {}: {}",
                id,
                response.status()
            )));
        }

        let detail: ContainerInspect = response.json().await.map_err(request_err)?;

        // The container's image field is a content digest; the tag list for
        // comparison comes from the image object itself.
        let image_tags = self.inspect_image(&detail.image).await?.repo_tags;

        let ports = match detail.network_settings.ports {
            Some(ref table) => parse_port_table(table)?,
            None => Vec::new(),
        };

        let created_at = detail
            .created
            .as_deref()
            .and_then(|s| s.parse::<DateTime<Utc>>().ok());

        Ok(ObservedContainer {
            id: detail.id,
            labels: detail.config.labels.unwrap_or_default(),
            image_tags,
            status: ContainerStatus::parse(&detail.state.status),
            ports,
            created_at,
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerClient {
    async fn pull_image(&self, image: &str) -> Result<ImageDescriptor> {
        let url = format!("{}/images/create", self.api_base);

        let response = self
            .client
            .post(&url)
            .query(&[("fromImage", image)])
            .send()
            .await
            .map_err(request_err)?;

        let status = response.status();
        let body = response.text().await.map_err(request_err)?;

        if !status.is_success() {
            return Err(BerthError::image_resolution(image, body.trim()));
        }

        // The pull endpoint streams JSON progress lines and reports failures
        // mid-stream with a 200 status.
        for line in body.lines() {
            if let Ok(progress) = serde_json::from_str::<PullProgressLine>(line) {
                if let Some(error) = progress.error {
                    return Err(BerthError::image_resolution(image, error));
                }
            }
        }

        let inspect = self.inspect_image(image).await?;
        let exposed_ports = inspect.exposed_ports();

        Ok(ImageDescriptor {
            id: inspect.id,
            repo_tags: inspect.repo_tags,
            exposed_ports,
        })
    }

    async fn find_by_label(&self, key: &str, value: &str) -> Result<Vec<ObservedContainer>> {
        let url = format!("{}/containers/json", self.api_base);
        let filters = json!({"label": [format!("{}={}", key, value)]}).to_string();

        let response = self
            .client
            .get(&url)
            .query(&[("all", "true"), ("filters", filters.as_str())])
            .send()
            .await
            .map_err(request_err)?;

        if !response.status().is_success() {
            return Err(BerthError::Container(format!(
                "Failed to list containers: {}",
                response.status()
            )));
        }

        let summaries: Vec<ContainerSummary> = response.json().await.map_err(request_err)?;

        let mut containers = Vec::with_capacity(summaries.len());
        for summary in summaries {
            match self.inspect_detail(&summary.id).await {
                Ok(container) => containers.push(container),
                // A container can be removed between the list and its inspect
                Err(BerthError::ContainerNotFound(id)) => {
                    tracing::debug!("Container {} vanished during listing", id);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(containers)
    }

    async fn run(
        &self,
        image: &str,
        labels: &HashMap<String, String>,
    ) -> Result<ObservedContainer> {
        let url = format!("{}/containers/create", self.api_base);
        let body = ContainerCreateBody {
            image,
            labels,
            host_config: HostConfig {
                publish_all_ports: true,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(request_err)?;

        if !response.status().is_success() {
            return Err(BerthError::Container(format!(
                "Failed to create container from {}: {}",
                image,
                response.status()
            )));
        }

        let created: ContainerCreateResponse = response.json().await.map_err(request_err)?;

        let start_url = format!("{}/containers/{}/start", self.api_base, created.id);
        let response = self
            .client
            .post(&start_url)
            .send()
            .await
            .map_err(request_err)?;

        // 304 means the container was already started
        if !response.status().is_success()
            && response.status() != reqwest::StatusCode::NOT_MODIFIED
        {
            return Err(BerthError::Container(format!(
                "Failed to start container {}: {}",
                created.id,
                response.status()
            )));
        }

        self.inspect_detail(&created.id).await
    }

    async fn inspect(&self, id: &str) -> Result<ObservedContainer> {
        self.inspect_detail(id).await
    }

    async fn remove(&self, id: &str, force: bool) -> Result<()> {
        let url = format!("{}/containers/{}", self.api_base, id);

        let response = self
            .client
            .delete(&url)
            .query(&[("force", if force { "true" } else { "false" })])
            .send()
            .await
            .map_err(request_err)?;

        // An already-gone container counts as removed
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!("Container {} already gone", id);
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(BerthError::Container(format!(
                "Failed to remove container {}: {}",
                id,
                response.status()
            )));
        }

        Ok(())
    }
}

/// Normalize a `DOCKER_HOST` value into an HTTP base URL
fn normalize_host(host: &str) -> Result<String> {
    if let Some(addr) = host.strip_prefix("tcp://") {
        return Ok(format!("http://{}", addr));
    }
    if host.starts_with("http://") || host.starts_with("https://") {
        return Ok(host.trim_end_matches('/').to_string());
    }
    if host.starts_with("unix://") {
        return Err(BerthError::InvalidConfig(
            "Unix socket transport is not supported; set DOCKER_HOST to a tcp:// address"
                .to_string(),
        ));
    }

    Err(BerthError::InvalidConfig(format!(
        "Unsupported DOCKER_HOST value: {}",
        host
    )))
}

/// Map transport errors, distinguishing an unreachable daemon
fn request_err(e: reqwest::Error) -> BerthError {
    if e.is_connect() || e.is_timeout() {
        BerthError::RuntimeUnavailable(e.to_string())
    } else {
        BerthError::Network(e.to_string())
    }
}

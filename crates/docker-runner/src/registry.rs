//! Client for the layer registry that publishes external layer versions.

use crate::options::{DockerOptions, FunctionOptions, LayerSource};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const DEFAULT_REGION: &str = "us-east-1";
const LAYER_VERSION_PATH: &str = "2018-10-31/layers";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid registry endpoint '{endpoint}': {message}")]
    InvalidEndpoint { endpoint: String, message: String },
    #[error("layer registry request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("layer registry returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Metadata of one published layer version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LayerVersion {
    #[serde(default)]
    pub layer_version_arn: Option<String>,
    pub content: LayerContent,
    #[serde(default)]
    pub compatible_runtimes: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LayerContent {
    /// Pre-signed download location of the layer archive.
    pub location: String,
    #[serde(default)]
    pub code_size: u64,
    #[serde(default)]
    pub code_sha256: Option<String>,
}

#[async_trait]
pub trait LayerRegistry: Send + Sync {
    async fn layer_version(&self, arn: &str) -> Result<LayerVersion, RegistryError>;
}

/// Talks to a Lambda-compatible `GetLayerVersionByArn` endpoint.
pub struct HttpLayerRegistry {
    client: Client,
    endpoint: Url,
}

impl HttpLayerRegistry {
    pub fn new(client: Client, endpoint: &str) -> Result<Self, RegistryError> {
        let mut endpoint_url = Url::parse(endpoint).map_err(|err| RegistryError::InvalidEndpoint {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        })?;
        if !endpoint_url.path().ends_with('/') {
            let path = format!("{}/", endpoint_url.path());
            endpoint_url.set_path(&path);
        }
        Ok(Self {
            client,
            endpoint: endpoint_url,
        })
    }

    /// Uses the public regional endpoint.
    pub fn for_region(client: Client, region: Option<&str>) -> Result<Self, RegistryError> {
        let region = region.unwrap_or(DEFAULT_REGION);
        Self::new(client, &format!("https://lambda.{}.amazonaws.com/", region))
    }

    /// Registry a function's remote layers are looked up in: the configured
    /// endpoint if any, otherwise the regional endpoint of the provider or,
    /// failing that, of the first layer ARN.
    pub fn for_function(
        client: Client,
        function: &FunctionOptions,
        options: &DockerOptions,
    ) -> Result<Self, RegistryError> {
        if let Some(endpoint) = &options.layer_registry_endpoint {
            return Self::new(client, endpoint);
        }
        let region = function.provider.region.as_deref().or_else(|| {
            function.layers.iter().find_map(|layer| match layer.source() {
                LayerSource::Remote { arn, .. } => arn_region(arn),
                LayerSource::Local { .. } => None,
            })
        });
        Self::for_region(client, region)
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn layer_version_url(&self, arn: &str) -> Result<Url, RegistryError> {
        let mut url =
            self.endpoint
                .join(LAYER_VERSION_PATH)
                .map_err(|err| RegistryError::InvalidEndpoint {
                    endpoint: self.endpoint.to_string(),
                    message: err.to_string(),
                })?;
        url.query_pairs_mut()
            .append_pair("find", "LayerVersion")
            .append_pair("Arn", arn);
        Ok(url)
    }
}

#[async_trait]
impl LayerRegistry for HttpLayerRegistry {
    async fn layer_version(&self, arn: &str) -> Result<LayerVersion, RegistryError> {
        let url = self.layer_version_url(arn)?;
        debug!(%url, "fetching layer version metadata");

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unable to read body>".to_string());
            return Err(RegistryError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }
}

/// Region segment of a layer ARN (`arn:aws:lambda:<region>:...`).
pub fn arn_region(arn: &str) -> Option<&str> {
    arn.split(':').nth(3).filter(|region| !region.is_empty())
}

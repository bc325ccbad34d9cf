use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde::Deserialize;

use crate::error::IngestError;
use crate::types::ResourceDescriptor;

/// Source of the resource listing of a catalog package.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn list_resources(&self, package: &str) -> Result<Vec<ResourceDescriptor>, IngestError>;
}

#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    result: Option<PackageResult>,
}

#[derive(Debug, Default, Deserialize)]
struct PackageResult {
    #[serde(default)]
    resources: Option<Vec<RawResource>>,
}

#[derive(Debug, Deserialize)]
struct RawResource {
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Extracts `result.resources` from a package envelope. Missing levels yield an empty list.
pub fn parse_resources(body: &str) -> Result<Vec<ResourceDescriptor>, serde_json::Error> {
    let envelope: Envelope = serde_json::from_str(body)?;
    let resources = envelope
        .result
        .and_then(|r| r.resources)
        .unwrap_or_default()
        .into_iter()
        .map(|raw| ResourceDescriptor {
            format: raw.format.unwrap_or_default(),
            url: raw.url.unwrap_or_default(),
            name: raw.name.unwrap_or_default(),
        })
        .collect::<Vec<_>>();

    for resource in &resources {
        debug!("Parsed resource: {:?}", resource);
    }
    Ok(resources)
}

pub struct CatalogClient {
    client: reqwest::Client,
    base_url: String,
}

impl CatalogClient {
    pub fn new(base_url: Option<&str>, timeout: Duration) -> Result<Self, IngestError> {
        let base_url = base_url
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .ok_or_else(|| {
                IngestError::Configuration("ONS_API_URL environment variable not set".to_string())
            })?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| IngestError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.to_string(),
        })
    }
}

#[async_trait]
impl Catalog for CatalogClient {
    async fn list_resources(&self, package: &str) -> Result<Vec<ResourceDescriptor>, IngestError> {
        info!("Fetching catalog package {} from {}", package, self.base_url);

        let resp = self
            .client
            .get(&self.base_url)
            .query(&[("id", package)])
            .send()
            .await
            .map_err(|e| IngestError::UpstreamUnavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let message = resp
                .text()
                .await
                .unwrap_or_else(|_| "catalog request failed".to_string());
            return Err(IngestError::UpstreamError {
                status: status.as_u16(),
                message,
            });
        }

        let body = resp
            .text()
            .await
            .map_err(|e| IngestError::UpstreamUnavailable(e.to_string()))?;

        let resources = parse_resources(&body).map_err(|e| IngestError::UpstreamError {
            status: status.as_u16(),
            message: format!("invalid catalog response: {e}"),
        })?;

        info!("Catalog listed {} resources for {}", resources.len(), package);
        Ok(resources)
    }
}

//! Client for the container metadata service.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::header::{ACCEPT, HeaderValue};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::{DhcpError, Result};

pub const DEFAULT_METADATA_URL: &str = "http://rancher-metadata/2015-12-19";

/// The host this generator runs on.
#[derive(Debug, Clone, Deserialize)]
pub struct Host {
    pub uuid: String,
}

/// A container as listed by the metadata service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Container {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub host_uuid: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub create_index: u64,
}

#[derive(Clone)]
pub struct MetadataClient {
    http: reqwest::Client,
    base: String,
}

impl MetadataClient {
    pub fn new(base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base, path);
        let http_err = |source| DhcpError::Http {
            url: url.clone(),
            source,
        };

        let response = self
            .http
            .get(&url)
            .header(ACCEPT, HeaderValue::from_static("application/json"))
            .send()
            .await
            .map_err(http_err)?;

        if !response.status().is_success() {
            return Err(DhcpError::Status {
                url: url.clone(),
                status: response.status(),
            });
        }

        response.json().await.map_err(http_err)
    }

    pub async fn self_host(&self) -> Result<Host> {
        self.get("/self/host").await
    }

    pub async fn containers(&self) -> Result<Vec<Container>> {
        self.get("/containers").await
    }

    /// Opaque token that changes whenever the metadata changes.
    pub async fn version(&self) -> Result<String> {
        self.get("/version").await
    }

    /// Poll until the service answers and return its current version.
    pub async fn wait_until_ready(&self, interval: Duration) -> String {
        loop {
            match self.version().await {
                Ok(version) => {
                    info!(url = %self.base, version = %version, "Metadata service ready");
                    return version;
                }
                Err(e) => {
                    debug!(error = %e, "Metadata service not ready");
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }
}

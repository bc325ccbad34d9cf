use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use log::{debug, info};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP error: {status} for URL: {url}")]
    Status { status: u16, url: String },

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Client setup error: {0}")]
    Setup(String),
}

/// Downloads the raw bytes of a resource.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::Setup(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
        info!("Starting download: {}", url);

        let resp = self.client.get(url).send().await?;

        if !resp.status().is_success() {
            return Err(FetchError::Status {
                status: resp.status().as_u16(),
                url: url.to_string(),
            });
        }

        let total_size = resp.content_length().unwrap_or(0) as usize;
        let mut buf = BytesMut::with_capacity(total_size);
        let mut stream = resp.bytes_stream();

        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }

        debug!("Downloaded {} bytes from {}", buf.len(), url);
        Ok(buf.freeze())
    }
}

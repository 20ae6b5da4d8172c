use crate::error::CatalogError;
use crate::types::{ContentKind, FileProbe, ProgressCounter};
use async_trait::async_trait;
use futures::StreamExt;
use log::debug;
use reqwest::header;

/// Upper bound on the buffer reserved up front from a `Content-Length`.
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// Remote side of the catalog: metadata probes and archive transfers.
#[async_trait]
pub trait CatalogService: Send + Sync {
    async fn probe_file(&self, url: &str) -> Result<FileProbe, CatalogError>;

    /// Fetches the whole archive, advancing `progress` as bytes arrive.
    async fn fetch_archive(
        &self,
        url: &str,
        progress: &ProgressCounter,
    ) -> Result<Vec<u8>, CatalogError>;
}

pub struct HttpCatalog {
    client: reqwest::Client,
}

impl HttpCatalog {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CatalogService for HttpCatalog {
    async fn probe_file(&self, url: &str) -> Result<FileProbe, CatalogError> {
        debug!("Probing {}", url);
        let resp = self.client.head(url).send().await?;
        if !resp.status().is_success() {
            return Err(CatalogError::Status {
                status: resp.status().as_u16(),
                url: url.to_string(),
            });
        }

        let size_bytes = resp
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|val| val.to_str().ok())
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| CatalogError::MissingHeader {
                header: "Content-Length",
                url: url.to_string(),
            })?;

        let content_kind = resp
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|val| val.to_str().ok())
            .map(ContentKind::parse)
            .ok_or_else(|| CatalogError::MissingHeader {
                header: "Content-Type",
                url: url.to_string(),
            })?;

        Ok(FileProbe {
            size_bytes,
            content_kind,
        })
    }

    async fn fetch_archive(
        &self,
        url: &str,
        progress: &ProgressCounter,
    ) -> Result<Vec<u8>, CatalogError> {
        debug!("Fetching {}", url);
        let resp = self.client.get(url).send().await?;

        if !resp.status().is_success() {
            return Err(CatalogError::Status {
                status: resp.status().as_u16(),
                url: url.to_string(),
            });
        }

        let total_size = resp.content_length().unwrap_or(0);
        progress.set_total(total_size);

        let mut body = Vec::with_capacity(total_size.min(MAX_PREALLOCATION) as usize);
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            body.extend_from_slice(&chunk);
            progress.advance(chunk.len() as u64);
        }

        debug!("Fetched {} bytes from {}", body.len(), url);
        Ok(body)
    }
}

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{Result, ScanError};

/// Raw response of a document request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedDocument {
    /// Final URL after redirects.
    pub url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl FetchedDocument {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_html(&self) -> bool {
        self.content_type
            .as_deref()
            .map(|ct| ct.contains("html"))
            .unwrap_or(true)
    }
}

/// Fetches sitemaps, robots.txt and page HTML.
#[async_trait]
pub trait DocumentFetcher: Send + Sync + fmt::Debug {
    async fn fetch(&self, url: &str) -> Result<FetchedDocument>;
}

#[derive(Debug, Clone)]
pub struct HttpDocumentFetcher {
    client: reqwest::Client,
}

impl HttpDocumentFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sitelens/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ScanError::Internal(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DocumentFetcher for HttpDocumentFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedDocument> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                ScanError::NavigationTimeout(url.to_string())
            } else {
                ScanError::Http(format!("{url}: {e}"))
            }
        })?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                ScanError::NavigationTimeout(url.to_string())
            } else {
                ScanError::Http(format!("{url}: {e}"))
            }
        })?;

        debug!(target: "scan::discovery", url, status, bytes = body.len(), "fetched document");

        Ok(FetchedDocument {
            url: final_url,
            status,
            content_type,
            body,
        })
    }
}

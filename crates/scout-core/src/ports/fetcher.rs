//! PageFetcher port - the page-rendering/fetching engine.
//!
//! Implementations only fetch. Admission (domain filter, rate limit) has already
//! happened by the time `fetch` is called.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use url::Url;

/// What a fetch hands back to the task body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageContent {
    /// Url that was requested.
    pub url: String,
    /// Url after redirects.
    pub final_url: String,
    pub http_status: u16,
    pub title: String,
    pub text: String,
    #[serde(default)]
    pub links: Vec<String>,
}

impl PageContent {
    pub fn new(url: impl Into<String>, title: impl Into<String>, text: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            final_url: url.clone(),
            url,
            http_status: 200,
            title: title.into(),
            text: text.into(),
            links: Vec::new(),
        }
    }

    pub fn with_links(mut self, links: Vec<String>) -> Self {
        self.links = links;
        self
    }

    pub fn redirected(&self) -> bool {
        self.final_url != self.url
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// Server asked us to slow down (429, or 503 with Retry-After).
    #[error("server overloaded (retry after {retry_after:?})")]
    Overloaded { retry_after: Option<Duration> },

    #[error("http {status}")]
    Http { status: u16 },

    #[error("page load timed out")]
    Timeout,

    #[error("{0}")]
    Other(String),
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<PageContent, FetchError>;
}

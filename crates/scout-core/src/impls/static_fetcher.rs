//! StaticPageFetcher - canned pages for tests and offline runs
//!
//! Each url holds a script of responses. Responses are served in order and the last
//! one repeats, so "overloaded twice, then ok" is three entries.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use url::Url;

use crate::ports::{FetchError, PageContent, PageFetcher};

type Scripted = Result<PageContent, FetchError>;

#[derive(Debug, Default)]
pub struct StaticPageFetcher {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    fetched: Mutex<Vec<String>>,
    latency: Duration,
}

impl StaticPageFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every fetch takes this long (tokio time, so paused tests stay instant).
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Serve a 200 page for `url`.
    pub fn page(self, url: &str, title: &str, text: &str) -> Self {
        let page = PageContent::new(key(url), title, text);
        self.respond(url, Ok(page))
    }

    /// Append one scripted response for `url`.
    pub fn respond(self, url: &str, response: Scripted) -> Self {
        self.scripts
            .lock()
            .entry(key(url))
            .or_default()
            .push_back(response);
        self
    }

    /// Urls fetched so far, in order.
    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().clone()
    }

    fn next_response(&self, url: &str) -> Scripted {
        let mut scripts = self.scripts.lock();
        let Some(script) = scripts.get_mut(url) else {
            return Err(FetchError::Http { status: 404 });
        };
        if script.len() > 1 {
            script.pop_front().unwrap_or(Err(FetchError::Http { status: 404 }))
        } else {
            script
                .front()
                .cloned()
                .unwrap_or(Err(FetchError::Http { status: 404 }))
        }
    }
}

#[async_trait]
impl PageFetcher for StaticPageFetcher {
    async fn fetch(&self, url: &Url) -> Result<PageContent, FetchError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let url = key(url.as_str());
        self.fetched.lock().push(url.clone());
        self.next_response(&url)
    }
}

/// Scripts are keyed by the parsed form, so `example.com` and `https://example.com/`
/// address the same page.
fn key(url: &str) -> String {
    Url::parse(&crate::domain::normalize_url(url))
        .map(String::from)
        .unwrap_or_else(|_| url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn script_is_served_in_order_and_last_entry_repeats() {
        let fetcher = StaticPageFetcher::new()
            .respond(
                "https://busy.test",
                Err(FetchError::Overloaded {
                    retry_after: Some(Duration::from_secs(5)),
                }),
            )
            .page("https://busy.test", "Busy", "finally");
        let url = Url::parse("https://busy.test/").unwrap();

        assert!(matches!(fetcher.fetch(&url).await, Err(FetchError::Overloaded { .. })));
        assert_eq!(fetcher.fetch(&url).await.unwrap().text, "finally");
        assert_eq!(fetcher.fetch(&url).await.unwrap().text, "finally");
        assert_eq!(fetcher.fetched().len(), 3);
    }

    #[tokio::test]
    async fn unknown_url_is_not_found() {
        let fetcher = StaticPageFetcher::new();
        let url = Url::parse("https://nowhere.test/").unwrap();
        assert_eq!(fetcher.fetch(&url).await, Err(FetchError::Http { status: 404 }));
    }
}

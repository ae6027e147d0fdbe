//! HTTP page fetcher backed by reqwest.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use reqwest::StatusCode;
use reqwest::header::RETRY_AFTER;
use scout_core::{FetchError, PageContent, PageFetcher};
use tracing::debug;
use url::Url;

const MAX_TEXT_CHARS: usize = 4000;
const MAX_LINKS: usize = 50;

pub struct HttpPageFetcher {
    client: reqwest::Client,
    title: Regex,
    link: Regex,
    noise: Regex,
    tags: Regex,
}

impl HttpPageFetcher {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("scout/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building http client")?;
        Ok(Self {
            client,
            title: Regex::new(r"(?is)<title[^>]*>(.*?)</title>")?,
            link: Regex::new(r#"(?i)href\s*=\s*["']([^"'#\s]+)["']"#)?,
            noise: Regex::new(r"(?is)<script\b.*?</script>|<style\b.*?</style>|<!--.*?-->")?,
            tags: Regex::new(r"(?s)<[^>]+>")?,
        })
    }

    fn extract_title(&self, html: &str) -> String {
        self.title
            .captures(html)
            .and_then(|c| c.get(1))
            .map(|m| collapse_whitespace(m.as_str()))
            .unwrap_or_default()
    }

    fn extract_text(&self, html: &str) -> String {
        let without_noise = self.noise.replace_all(html, " ");
        let text = self.tags.replace_all(&without_noise, " ");
        collapse_whitespace(&text).chars().take(MAX_TEXT_CHARS).collect()
    }

    fn extract_links(&self, html: &str, base: &Url) -> Vec<String> {
        let mut seen = HashSet::new();
        self.link
            .captures_iter(html)
            .filter_map(|c| c.get(1))
            .filter_map(|m| base.join(m.as_str()).ok())
            .filter(|u| matches!(u.scheme(), "http" | "https"))
            .map(String::from)
            .filter(|u| seen.insert(u.clone()))
            .take(MAX_LINKS)
            .collect()
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &Url) -> Result<PageContent, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(map_reqwest)?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::SERVICE_UNAVAILABLE {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(FetchError::Overloaded { retry_after });
        }
        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
            });
        }

        let final_url = response.url().clone();
        let html = response.text().await.map_err(map_reqwest)?;
        debug!(url = %final_url, bytes = html.len(), "page fetched");

        Ok(PageContent {
            url: url.to_string(),
            final_url: final_url.to_string(),
            http_status: status.as_u16(),
            title: self.extract_title(&html),
            text: self.extract_text(&html),
            links: self.extract_links(&html, &final_url),
        })
    }
}

fn map_reqwest(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Other(err.to_string())
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<html><head><title>
        Rust  Book </title><style>body{}</style></head>
        <body><script>var x = 1;</script><h1>Hello</h1><p>world <a href="/ch1">one</a>
        <a href='https://other.org/x'>two</a><a href="/ch1">dup</a><a href="mailto:a@b">m</a></p></body></html>"#;

    fn fetcher() -> HttpPageFetcher {
        HttpPageFetcher::new(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn title_is_trimmed_and_collapsed() {
        assert_eq!(fetcher().extract_title(PAGE), "Rust Book");
    }

    #[test]
    fn text_drops_markup_scripts_and_styles() {
        let text = fetcher().extract_text(PAGE);
        assert!(text.contains("Hello world one two"));
        assert!(!text.contains("var x"));
        assert!(!text.contains("body{}"));
    }

    #[test]
    fn links_are_resolved_deduplicated_and_http_only() {
        let base = Url::parse("https://doc.rust-lang.org/book/").unwrap();
        let links = fetcher().extract_links(PAGE, &base);
        assert_eq!(
            links,
            vec![
                "https://doc.rust-lang.org/ch1".to_string(),
                "https://other.org/x".to_string(),
            ]
        );
    }
}

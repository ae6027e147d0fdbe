//! Input specs for a research task.
//!
//! `ResearchParams` is constructed once at submission, validated, and never mutated
//! afterwards. Field ranges follow the public task API.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

pub const MAX_QUESTION_CHARS: usize = 1000;

/// Search engine the agent should use for discovery.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchEngine {
    #[default]
    Duckduckgo,
    Bing,
    Google,
    Custom,
}

impl FromStr for SearchEngine {
    type Err = ParamsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "duckduckgo" => Ok(SearchEngine::Duckduckgo),
            "bing" => Ok(SearchEngine::Bing),
            "google" => Ok(SearchEngine::Google),
            "custom" => Ok(SearchEngine::Custom),
            other => Err(ParamsError::UnknownSearchEngine(other.to_string())),
        }
    }
}

/// Admission tier. Higher tiers drain first; lower tiers are never starved
/// beyond their own time budget.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn index(self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl FromStr for Priority {
    type Err = ParamsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(ParamsError::UnknownPriority(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParamsError {
    #[error("question must be between 1 and {MAX_QUESTION_CHARS} characters")]
    QuestionLength,

    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: u64,
        max: u64,
        value: u64,
    },

    #[error("seed url `{0}` is not a valid http(s) url")]
    InvalidSeedUrl(String),

    #[error("unknown search engine `{0}`")]
    UnknownSearchEngine(String),

    #[error("unknown priority `{0}`")]
    UnknownPriority(String),
}

/// Search/crawl parameters of one task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResearchParams {
    pub seed_url: Option<String>,
    pub max_depth: u32,
    pub max_pages: u32,
    pub time_budget_secs: u64,
    pub search_engine: SearchEngine,
    pub max_results: u32,
    pub safe_mode: bool,
    pub same_domain_only: bool,
    pub allow_external_links: bool,
    pub priority: Priority,
}

impl Default for ResearchParams {
    fn default() -> Self {
        Self {
            seed_url: None,
            max_depth: 3,
            max_pages: 20,
            time_budget_secs: 120,
            search_engine: SearchEngine::default(),
            max_results: 10,
            safe_mode: true,
            same_domain_only: false,
            allow_external_links: true,
            priority: Priority::default(),
        }
    }
}

impl ResearchParams {
    pub fn with_seed_url(mut self, url: impl Into<String>) -> Self {
        self.seed_url = Some(url.into());
        self
    }

    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_max_pages(mut self, pages: u32) -> Self {
        self.max_pages = pages;
        self
    }

    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget_secs = budget.as_secs();
        self
    }

    pub fn with_search_engine(mut self, engine: SearchEngine) -> Self {
        self.search_engine = engine;
        self
    }

    pub fn with_max_results(mut self, results: u32) -> Self {
        self.max_results = results;
        self
    }

    pub fn with_safe_mode(mut self, on: bool) -> Self {
        self.safe_mode = on;
        self
    }

    pub fn with_same_domain_only(mut self, on: bool) -> Self {
        self.same_domain_only = on;
        self
    }

    pub fn with_allow_external_links(mut self, on: bool) -> Self {
        self.allow_external_links = on;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn time_budget(&self) -> Duration {
        Duration::from_secs(self.time_budget_secs)
    }

    /// Host of the seed url, if any. Only meaningful after `validate`.
    pub fn seed_host(&self) -> Option<String> {
        self.seed_url
            .as_deref()
            .and_then(|raw| Url::parse(&normalize_url(raw)).ok())
            .and_then(|url| url.host_str().map(|h| h.trim_end_matches('.').to_ascii_lowercase()))
    }

    pub fn validate(&self) -> Result<(), ParamsError> {
        check_range("maxDepth", self.max_depth as u64, 1, 5)?;
        check_range("maxPages", self.max_pages as u64, 1, 50)?;
        check_range("timeBudget", self.time_budget_secs, 30, 600)?;
        check_range("maxResults", self.max_results as u64, 1, 50)?;

        if let Some(raw) = &self.seed_url {
            let parsed = Url::parse(&normalize_url(raw))
                .map_err(|_| ParamsError::InvalidSeedUrl(raw.clone()))?;
            if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
                return Err(ParamsError::InvalidSeedUrl(raw.clone()));
            }
        }
        Ok(())
    }
}

/// Validate question text. Returns the trimmed question.
pub fn validate_question(question: &str) -> Result<String, ParamsError> {
    let trimmed = question.trim();
    let chars = trimmed.chars().count();
    if chars == 0 || chars > MAX_QUESTION_CHARS {
        return Err(ParamsError::QuestionLength);
    }
    Ok(trimmed.to_string())
}

/// Add `https://` when the input carries no scheme at all.
///
/// Anything that already parses with a scheme (`mailto:`, `file:`, `javascript:`)
/// is returned as is, so callers can reject it. `host:port` without a scheme is
/// still treated as a bare host.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    match Url::parse(trimmed) {
        Err(url::ParseError::RelativeUrlWithoutBase) => format!("https://{trimmed}"),
        Ok(parsed) if looks_like_host_and_port(&parsed, trimmed) => format!("https://{trimmed}"),
        _ => trimmed.to_string(),
    }
}

// "example.com:8080/x" parses with "example.com" as its scheme
fn looks_like_host_and_port(parsed: &Url, raw: &str) -> bool {
    let scheme = parsed.scheme();
    (scheme.contains('.') || scheme == "localhost")
        && raw[scheme.len()..]
            .strip_prefix(':')
            .is_some_and(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ParamsError> {
    if value < min || value > max {
        return Err(ParamsError::OutOfRange {
            field,
            min,
            max,
            value,
        });
    }
    Ok(())
}

impl fmt::Display for SearchEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SearchEngine::Duckduckgo => "duckduckgo",
            SearchEngine::Bing => "bing",
            SearchEngine::Google => "google",
            SearchEngine::Custom => "custom",
        };
        f.write_str(s)
    }
}

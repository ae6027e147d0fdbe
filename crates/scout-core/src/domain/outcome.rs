//! Result model: what a research task produces.
//!
//! The core does not synthesize answers; it only stores what the task body hands
//! back, complete or partial.

use serde::{Deserialize, Serialize};

/// A source backing (part of) an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub url: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
}

impl Citation {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            excerpt: None,
        }
    }

    pub fn with_excerpt(mut self, excerpt: impl Into<String>) -> Self {
        self.excerpt = Some(excerpt.into());
        self
    }
}

/// Answer + citations + confidence.
///
/// `partial` marks results that were accumulated before the task ended early
/// (timeout, recoverable failure).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResearchResult {
    pub answer: String,
    #[serde(default)]
    pub citations: Vec<Citation>,
    /// 0.0 ..= 1.0
    pub confidence: f32,
    #[serde(default)]
    pub partial: bool,
}

impl ResearchResult {
    pub fn new(answer: impl Into<String>, confidence: f32) -> Self {
        Self {
            answer: answer.into(),
            citations: Vec::new(),
            confidence: confidence.clamp(0.0, 1.0),
            partial: false,
        }
    }

    pub fn partial(answer: impl Into<String>, confidence: f32) -> Self {
        let mut result = Self::new(answer, confidence);
        result.partial = true;
        result
    }

    pub fn with_citation(mut self, citation: Citation) -> Self {
        self.citations.push(citation);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn confidence_is_clamped() {
        assert_eq!(ResearchResult::new("a", 1.7).confidence, 1.0);
        assert_eq!(ResearchResult::new("a", -0.2).confidence, 0.0);
    }

    #[test]
    fn result_uses_camel_case_and_skips_empty_excerpt() {
        let r = ResearchResult::partial("so far", 0.4)
            .with_citation(Citation::new("https://a.example.com", "A"));
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["partial"], true);
        assert_eq!(v["citations"][0]["url"], "https://a.example.com");
        assert!(v["citations"][0].get("excerpt").is_none());
    }
}

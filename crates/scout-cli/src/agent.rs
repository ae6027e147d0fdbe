//! A minimal research agent: breadth-first reading from a seed page.
//!
//! It does no reasoning. It visits the seed (or a search results page), follows
//! links within the task's depth and page limits, and answers with excerpts of the
//! pages that mention the question's keywords.

use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use scout_core::domain::SearchEngine;
use scout_core::{
    AgentError, Citation, NavigationError, PageContent, ResearchAgent, ResearchRequest,
    ResearchResult, TaskContext, TaskEventKind,
};
use serde_json::json;
use url::Url;

const EXCERPT_CHARS: usize = 280;

pub struct SeedPageAgent;

#[async_trait]
impl ResearchAgent for SeedPageAgent {
    async fn run(&self, request: ResearchRequest, ctx: TaskContext) -> Result<ResearchResult, AgentError> {
        let params = &request.params;
        let start = match &params.seed_url {
            Some(seed) => seed.clone(),
            None => search_url(params.search_engine, &request.question)?,
        };
        let keywords = keywords(&request.question);
        let seed_host = Url::parse(&scout_core::domain::normalize_url(&start))
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));

        ctx.emit(TaskEventKind::thinking(format!("starting from {start}")))
            .await?;

        let mut frontier = VecDeque::from([(start, 0u32)]);
        let mut seen = HashSet::new();
        let mut findings: Vec<(PageContent, usize)> = Vec::new();

        while let Some((url, depth)) = frontier.pop_front() {
            if !seen.insert(url.clone()) {
                continue;
            }
            ctx.emit(TaskEventKind::tool_call("navigate", json!({ "url": url, "depth": depth })))
                .await?;

            let page = match ctx.navigate(&url).await {
                Ok(page) => page,
                Err(NavigationError::Cancelled) => return Err(NavigationError::Cancelled.into()),
                Err(NavigationError::PageBudgetExhausted { .. }) => break,
                Err(err) if findings.is_empty() && depth == 0 => return Err(err.into()),
                Err(err) => {
                    ctx.emit(TaskEventKind::tool_result(
                        "navigate",
                        json!({ "url": url, "error": err.to_string() }),
                        false,
                    ))
                    .await?;
                    continue;
                }
            };
            ctx.emit(TaskEventKind::tool_result(
                "navigate",
                json!({ "url": page.final_url, "title": page.title, "links": page.links.len() }),
                true,
            ))
            .await?;

            if depth < params.max_depth {
                for link in &page.links {
                    let external = Url::parse(link)
                        .ok()
                        .and_then(|u| u.host_str().map(str::to_string))
                        != seed_host;
                    if external && (!params.allow_external_links || params.same_domain_only) {
                        continue;
                    }
                    frontier.push_back((link.clone(), depth + 1));
                }
            }

            let hits = score(&page.text, &keywords);
            findings.push((page, hits));
            let draft = answer(&findings, params.max_results as usize);
            ctx.record_partial(draft);
        }

        if findings.is_empty() {
            return Err(AgentError::recoverable("no page could be read", None));
        }
        Ok(answer(&findings, params.max_results as usize))
    }
}

fn search_url(engine: SearchEngine, question: &str) -> Result<String, AgentError> {
    let base = match engine {
        SearchEngine::Duckduckgo => "https://html.duckduckgo.com/html/",
        SearchEngine::Bing => "https://www.bing.com/search",
        SearchEngine::Google => "https://www.google.com/search",
        SearchEngine::Custom => {
            return Err(AgentError::fatal("a custom search engine needs a seed url"));
        }
    };
    Url::parse_with_params(base, &[("q", question)])
        .map(String::from)
        .map_err(|e| AgentError::fatal(e.to_string()))
}

fn keywords(question: &str) -> Vec<String> {
    question
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() > 3)
        .map(str::to_lowercase)
        .collect()
}

fn score(text: &str, keywords: &[String]) -> usize {
    let text = text.to_lowercase();
    keywords.iter().filter(|k| text.contains(k.as_str())).count()
}

fn answer(findings: &[(PageContent, usize)], max_results: usize) -> ResearchResult {
    let mut ranked: Vec<_> = findings.iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    let ranked: Vec<_> = ranked.into_iter().take(max_results.max(1)).collect();

    let best = ranked.first().map_or(0, |(_, hits)| *hits);
    let summary = ranked
        .first()
        .map(|(page, _)| excerpt(&page.text))
        .unwrap_or_default();
    let confidence = if best == 0 { 0.2 } else { (0.4 + 0.1 * best as f32).min(0.9) };

    ranked
        .iter()
        .fold(ResearchResult::new(summary, confidence), |result, (page, _)| {
            result.with_citation(
                Citation::new(page.final_url.clone(), page.title.clone())
                    .with_excerpt(excerpt(&page.text)),
            )
        })
}

fn excerpt(text: &str) -> String {
    let mut out: String = text.chars().take(EXCERPT_CHARS).collect();
    if text.chars().count() > EXCERPT_CHARS {
        out.push('…');
    }
    out
}

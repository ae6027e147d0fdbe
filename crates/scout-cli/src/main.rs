mod agent;
mod fetcher;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use scout_core::browsing::{DomainVerdict, normalize_host, parse_navigable};
use scout_core::config::{AppConfig, LogFormat, LoggingConfig};
use scout_core::domain::SearchEngine;
use scout_core::{
    BrowsingGate, DomainFilter, Priority, RateLimitStore, RateLimiter, ResearchParams,
    TaskEvent, TaskEventKind, TaskScheduler, TaskStatus,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::agent::SeedPageAgent;
use crate::fetcher::HttpPageFetcher;

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "scout", version, about = "Run web research tasks with polite browsing")]
struct Cli {
    /// Config file (defaults to $SCOUT_CONFIG, then ./scout.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Research a question and stream progress until it finishes
    Run(RunArgs),
    /// Show whether the domain lists allow a url or host
    CheckDomain {
        /// Url or bare host
        target: String,
    },
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long, short)]
    question: String,
    #[arg(long)]
    seed_url: Option<String>,
    #[arg(long)]
    max_depth: Option<u32>,
    #[arg(long)]
    max_pages: Option<u32>,
    /// Seconds
    #[arg(long)]
    time_budget: Option<u64>,
    #[arg(long)]
    search_engine: Option<SearchEngine>,
    #[arg(long)]
    priority: Option<Priority>,
    #[arg(long)]
    same_domain_only: bool,
    /// Print events and the final snapshot as JSON lines
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn params(&self) -> ResearchParams {
        let mut params = ResearchParams::default().with_same_domain_only(self.same_domain_only);
        if let Some(seed) = &self.seed_url {
            params = params.with_seed_url(seed.clone());
        }
        if let Some(depth) = self.max_depth {
            params = params.with_max_depth(depth);
        }
        if let Some(pages) = self.max_pages {
            params = params.with_max_pages(pages);
        }
        if let Some(secs) = self.time_budget {
            params = params.with_time_budget(Duration::from_secs(secs));
        }
        if let Some(engine) = self.search_engine {
            params = params.with_search_engine(engine);
        }
        if let Some(priority) = self.priority {
            params = params.with_priority(priority);
        }
        params
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("loading configuration")?;
    init_tracing(&config.logging);

    match cli.command {
        Command::Run(args) => run(config, args).await,
        Command::CheckDomain { target } => check_domain(&config, &target),
    }
}

async fn run(config: AppConfig, args: RunArgs) -> anyhow::Result<()> {
    let filter = load_filter(&config)?;
    let limiter = RateLimiter::new(config.rate_limit.clone(), Arc::new(RateLimitStore::new()));
    let gate = Arc::new(BrowsingGate::new(Arc::new(filter), Arc::new(limiter)));
    let fetcher = Arc::new(HttpPageFetcher::new(FETCH_TIMEOUT)?);

    let scheduler = TaskScheduler::builder(Arc::new(SeedPageAgent), fetcher)
        .app_config(&config)
        .gate(gate)
        .build();

    let task_id = scheduler
        .submit(&args.question, args.params())
        .await
        .context("submitting task")?;
    info!(task_id = %task_id, "task submitted");

    let mut events = scheduler.stream_events(task_id)?;
    let mut last_seq: Option<u64> = None;
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    // a resubscription replays the backlog; skip what was printed
                    if last_seq.is_none_or(|seen| event.seq > seen) {
                        last_seq = Some(event.seq);
                        print_event(&event, args.json)?;
                    }
                }
                None if events.lagged() => {
                    warn!(task_id = %task_id, "event stream fell behind; resubscribing");
                    events = scheduler.stream_events(task_id)?;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                warn!(task_id = %task_id, "interrupt received; cancelling task");
                scheduler.cancel(task_id, "interrupted").await?;
            }
        }
    }

    let snapshot = scheduler.wait(task_id).await?;
    scheduler.shutdown().await;

    if args.json {
        println!("{}", serde_json::to_string(&snapshot)?);
    } else if let Some(result) = &snapshot.result {
        println!();
        println!("{}", result.answer);
        for (i, citation) in result.citations.iter().enumerate() {
            println!("  [{}] {} <{}>", i + 1, citation.title, citation.url);
        }
    }

    if snapshot.status != TaskStatus::Completed {
        bail!(
            "task {} ended as {}: {}",
            task_id,
            snapshot.status,
            snapshot.error.as_deref().unwrap_or("no detail")
        );
    }
    Ok(())
}

fn check_domain(config: &AppConfig, target: &str) -> anyhow::Result<()> {
    let filter = load_filter(config)?;
    let host = if target.contains("://") || target.contains('/') {
        let url = parse_navigable(target)?;
        url.host_str().map(normalize_host).unwrap_or_default()
    } else {
        normalize_host(target)
    };

    let verdict = filter.check(&host);
    let label = match verdict {
        DomainVerdict::Allowed => "allowed",
        DomainVerdict::Denied => "denied (on the deny list)",
        DomainVerdict::NotAllowListed => "denied (not on the allow list)",
    };
    println!("{host}: {label}");

    if !verdict.is_allowed() {
        std::process::exit(1);
    }
    Ok(())
}

fn load_filter(config: &AppConfig) -> anyhow::Result<DomainFilter> {
    DomainFilter::from_files(&config.domains.allowed_file, &config.domains.disallowed_file)
        .context("loading domain lists")
}

fn print_event(event: &TaskEvent, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    let detail = match &event.kind {
        TaskEventKind::Status { status } => status.to_string(),
        TaskEventKind::Thinking { content } => content.clone(),
        TaskEventKind::ToolCall { tool, args } => format!("{tool} {args}"),
        TaskEventKind::ToolResult { tool, success, .. } => {
            format!("{tool} {}", if *success { "ok" } else { "failed" })
        }
        TaskEventKind::Navigation { url, waited_ms } => format!("{url} (waited {waited_ms}ms)"),
        TaskEventKind::Blocked { url, reason } => format!("{url}: {reason}"),
        TaskEventKind::RateLimited {
            host,
            wait_ms,
            consecutive,
        } => format!("{host} overloaded ({consecutive}x), backing off {wait_ms}ms"),
        TaskEventKind::Screenshot { image_url, .. } => image_url.clone(),
        TaskEventKind::Complete {
            citations,
            duration_ms,
            ..
        } => format!("{} citations in {duration_ms}ms", citations.len()),
        TaskEventKind::Error { error, .. } => error.clone(),
    };
    println!(
        "[{:>7}ms] {:<18} {detail}",
        event.elapsed_ms,
        event.kind.name()
    );
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

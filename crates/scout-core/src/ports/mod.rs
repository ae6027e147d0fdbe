//! Ports - seams to the collaborators the core does not implement.
//!
//! - `ResearchAgent`: the reasoning loop that runs as a task body
//! - `PageFetcher`: the page-rendering engine behind `navigate`
//! - `Clock` / `IdGenerator`: swappable for deterministic tests

pub mod agent;
pub mod clock;
pub mod fetcher;
pub mod id_generator;

pub use self::agent::{ResearchAgent, ResearchRequest};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::fetcher::{FetchError, PageContent, PageFetcher};
pub use self::id_generator::{IdGenerator, UlidGenerator};

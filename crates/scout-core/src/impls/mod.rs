//! Impls - in-process implementations of the ports (development and tests)
//!
//! - **StaticPageFetcher**: serves canned pages and scripted failures
//!
//! Network-backed fetchers live in the binary crate.

pub mod static_fetcher;

pub use self::static_fetcher::StaticPageFetcher;

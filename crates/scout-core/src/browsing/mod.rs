//! Ethical-browsing controls: which hosts may be visited, and how often.

mod domain_filter;
mod gate;
mod rate_limiter;

pub use domain_filter::{
    DomainFilter, DomainList, DomainListError, DomainPattern, DomainVerdict, normalize_host,
};
pub use gate::{Admitted, BrowsingGate, parse_navigable};
pub use rate_limiter::{
    Admission, MAX_BACKOFF_MULTIPLIER, OverloadTracker, RateLimitStore, RateLimiter,
};

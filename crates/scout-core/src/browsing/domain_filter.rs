//! Allow/deny filtering of navigation hosts.
//!
//! Patterns are either an exact host (`example.com`) or a wildcard subdomain
//! pattern (`*.example.com`). A wildcard matches any depth of subdomain but never the
//! bare suffix itself. Deny always wins over allow.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum DomainListError {
    #[error("failed reading domain list {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },
}

/// One entry of an allow or deny list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DomainPattern {
    Exact(String),
    /// Stored without the leading `*.`.
    Wildcard(String),
}

impl DomainPattern {
    /// Parse one list line. Returns `None` for blanks and `#` comments.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }
        let normalized = normalize_host(line);
        match normalized.strip_prefix("*.") {
            Some(suffix) if !suffix.is_empty() => Some(DomainPattern::Wildcard(suffix.to_string())),
            Some(_) => None,
            None if normalized.is_empty() => None,
            None => Some(DomainPattern::Exact(normalized)),
        }
    }

    /// `host` must already be normalized.
    pub fn matches(&self, host: &str) -> bool {
        match self {
            DomainPattern::Exact(exact) => host == exact,
            DomainPattern::Wildcard(suffix) => host
                .strip_suffix(suffix.as_str())
                .is_some_and(|head| head.len() > 1 && head.ends_with('.')),
        }
    }
}

/// Outcome of a filter check, with the reason kept for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainVerdict {
    Allowed,
    Denied,
    NotAllowListed,
}

impl DomainVerdict {
    pub fn is_allowed(self) -> bool {
        matches!(self, DomainVerdict::Allowed)
    }
}

/// Immutable snapshot of both lists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomainList {
    allow: Vec<DomainPattern>,
    deny: Vec<DomainPattern>,
}

impl DomainList {
    pub fn new(allow: Vec<DomainPattern>, deny: Vec<DomainPattern>) -> Self {
        Self { allow, deny }
    }

    pub fn from_lines<'a>(
        allow: impl IntoIterator<Item = &'a str>,
        deny: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            allow: allow.into_iter().filter_map(DomainPattern::parse).collect(),
            deny: deny.into_iter().filter_map(DomainPattern::parse).collect(),
        }
    }

    /// Load both list files. A missing file is an empty list.
    pub fn load(allow_path: &Path, deny_path: &Path) -> Result<Self, DomainListError> {
        Ok(Self {
            allow: load_patterns(allow_path)?,
            deny: load_patterns(deny_path)?,
        })
    }

    pub fn allow(&self) -> &[DomainPattern] {
        &self.allow
    }

    pub fn deny(&self) -> &[DomainPattern] {
        &self.deny
    }

    pub fn check(&self, host: &str) -> DomainVerdict {
        let host = normalize_host(host);
        if self.deny.iter().any(|p| p.matches(&host)) {
            return DomainVerdict::Denied;
        }
        if !self.allow.is_empty() && !self.allow.iter().any(|p| p.matches(&host)) {
            return DomainVerdict::NotAllowListed;
        }
        DomainVerdict::Allowed
    }

    pub fn is_allowed(&self, host: &str) -> bool {
        self.check(host).is_allowed()
    }
}

/// Shared filter. Readers take a cheap snapshot; a reload swaps the whole list.
#[derive(Debug, Default)]
pub struct DomainFilter {
    current: RwLock<Arc<DomainList>>,
}

impl DomainFilter {
    pub fn new(list: DomainList) -> Self {
        Self {
            current: RwLock::new(Arc::new(list)),
        }
    }

    pub fn from_files(allow_path: &Path, deny_path: &Path) -> Result<Self, DomainListError> {
        Ok(Self::new(DomainList::load(allow_path, deny_path)?))
    }

    pub fn snapshot(&self) -> Arc<DomainList> {
        Arc::clone(&self.current.read())
    }

    /// Replace the lists. Only checks made after this call see the new lists.
    pub fn replace(&self, list: DomainList) {
        *self.current.write() = Arc::new(list);
    }

    pub fn reload(&self, allow_path: &Path, deny_path: &Path) -> Result<(), DomainListError> {
        let list = DomainList::load(allow_path, deny_path)?;
        info!(
            allow = list.allow.len(),
            deny = list.deny.len(),
            "domain lists reloaded"
        );
        self.replace(list);
        Ok(())
    }

    pub fn check(&self, host: &str) -> DomainVerdict {
        self.snapshot().check(host)
    }

    pub fn is_allowed(&self, host: &str) -> bool {
        self.check(host).is_allowed()
    }
}

/// Lowercase, trim, strip one trailing dot.
pub fn normalize_host(host: &str) -> String {
    let host = host.trim().to_ascii_lowercase();
    match host.strip_suffix('.') {
        Some(stripped) => stripped.to_string(),
        None => host,
    }
}

fn load_patterns(path: &Path) -> Result<Vec<DomainPattern>, DomainListError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "domain list file not found; treating as empty");
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(DomainListError::Read {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let patterns: Vec<_> = raw.lines().filter_map(DomainPattern::parse).collect();
    info!(path = %path.display(), count = patterns.len(), "loaded domain list");
    Ok(patterns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    const NONE: [&str; 0] = [];

    #[rstest]
    #[case("a.example.com", true)]
    #[case("b.a.example.com", true)]
    #[case("example.com", false)]
    #[case("notexample.com", false)]
    #[case("a.notexample.com", false)]
    fn wildcard_matches_subdomains_only(#[case] host: &str, #[case] expected: bool) {
        let pattern = DomainPattern::parse("*.example.com").unwrap();
        assert_eq!(pattern.matches(host), expected);
    }

    #[test]
    fn deny_overrides_allow() {
        let list = DomainList::from_lines(["example.com"], ["example.com"]);
        assert_eq!(list.check("example.com"), DomainVerdict::Denied);
        assert!(!list.is_allowed("example.com"));
    }

    #[test]
    fn wildcard_deny_overrides_exact_allow() {
        let list = DomainList::from_lines(["ads.tracker.net"], ["*.tracker.net"]);
        assert!(!list.is_allowed("ads.tracker.net"));
    }

    #[test]
    fn non_empty_allow_list_is_exclusive() {
        let list = DomainList::from_lines(["*.wikipedia.org", "docs.rs"], NONE);
        assert!(list.is_allowed("en.wikipedia.org"));
        assert!(list.is_allowed("docs.rs"));
        assert_eq!(list.check("example.com"), DomainVerdict::NotAllowListed);
    }

    #[test]
    fn empty_lists_allow_everything() {
        let list = DomainList::default();
        assert!(list.is_allowed("anything.example"));
    }

    #[test]
    fn host_is_normalized_before_matching() {
        let list = DomainList::from_lines(NONE, ["Blocked.Example.COM."]);
        assert!(!list.is_allowed("blocked.example.com"));
        assert!(!list.is_allowed("BLOCKED.example.com."));
    }

    #[test]
    fn comments_and_blank_lines_are_skipped() {
        assert_eq!(DomainPattern::parse("   "), None);
        assert_eq!(DomainPattern::parse("# tracking"), None);
        assert_eq!(DomainPattern::parse("*."), None);
    }

    #[test]
    fn load_reads_line_files_and_tolerates_missing_ones() {
        let dir = tempfile::tempdir().unwrap();
        let deny_path = dir.path().join("deny.txt");
        let mut f = fs::File::create(&deny_path).unwrap();
        writeln!(f, "# bad actors\n*.spam.test\n\nmalware.test").unwrap();

        let list = DomainList::load(&dir.path().join("missing.txt"), &deny_path).unwrap();
        assert!(list.allow().is_empty());
        assert_eq!(list.deny().len(), 2);
        assert!(!list.is_allowed("x.spam.test"));
        assert!(!list.is_allowed("malware.test"));
        assert!(list.is_allowed("spam.test"));
    }

    #[test]
    fn reload_affects_only_later_checks() {
        let filter = DomainFilter::new(DomainList::default());
        let before = filter.snapshot();
        filter.replace(DomainList::from_lines(NONE, ["example.com"]));

        assert!(before.is_allowed("example.com"));
        assert!(!filter.is_allowed("example.com"));
    }
}

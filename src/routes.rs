//! Host/path routing table
//! An ordered pattern -> action table resolved per request with
//! last-match-wins precedence

use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::Path;

/// What a matching route does with the request
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum RouteAction {
    /// Forward to a backend on localhost at this port
    Forward(u16),
    /// Redirect the client to another host
    Redirect { redirect: String },
}

/// One routing-table record
#[derive(Debug, Clone)]
pub struct RouteEntry {
    /// A domain, optionally with a path suffix (`a.com` or `a.com/api`)
    pub pattern: String,
    pub action: RouteAction,
}

/// The per-request routing decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Forward(SocketAddr),
    Redirect(String),
    NotFound,
}

/// Ordered routing table, loaded once at startup and read-only thereafter.
///
/// Precedence is last-match-wins: every entry is scanned and each match
/// overwrites the previous choice, so more specific routes must be declared
/// after more general ones. This ordering contract is deliberate; do not
/// replace it with first-match-wins.
#[derive(Debug, Clone)]
pub struct RouteTable {
    entries: Vec<RouteEntry>,
}

impl RouteTable {
    pub fn new(entries: Vec<RouteEntry>) -> Self {
        Self { entries }
    }

    /// Load the table from a JSON file shaped like
    /// `{"a.com": 3000, "old.com": {"redirect": "a.com"}}`.
    /// Declaration order in the file is preserved and significant.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read routing table {}", path.display()))?;
        Self::from_json(&text)
            .with_context(|| format!("failed to parse routing table {}", path.display()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let raw: serde_json::Map<String, serde_json::Value> =
            serde_json::from_str(text).context("routing table is not a JSON object")?;

        let mut entries = Vec::with_capacity(raw.len());
        for (pattern, value) in raw {
            let action: RouteAction = serde_json::from_value(value)
                .with_context(|| format!("invalid action for route {}", pattern))?;
            entries.push(RouteEntry { pattern, action });
        }

        Ok(Self::new(entries))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve a request's host and path to an outcome.
    ///
    /// A pattern matches when it equals the host exactly, or when
    /// `host + path` starts with it and the path is not bare `/` (the root
    /// path never participates in prefix matching, so an exact-host route
    /// cannot prefix-match everything). Comparison is case-sensitive and
    /// byte-exact.
    pub fn resolve(&self, host: &str, path: &str) -> Outcome {
        let mut normalized = path.to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let host_and_path = format!("{}{}", host, normalized);

        let mut chosen: Option<&RouteAction> = None;

        for entry in &self.entries {
            let mut pattern = entry.pattern.clone();
            if pattern.contains('/') && !pattern.ends_with('/') {
                pattern.push('/');
            }

            if pattern == host {
                chosen = Some(&entry.action);
            } else if normalized != "/" && host_and_path.starts_with(&pattern) {
                chosen = Some(&entry.action);
            }
        }

        match chosen {
            Some(RouteAction::Forward(port)) => {
                Outcome::Forward(SocketAddr::from(([127, 0, 0, 1], *port)))
            }
            // The redirect keeps the original, un-normalized path
            Some(RouteAction::Redirect { redirect }) => {
                Outcome::Redirect(format!("https://{}{}", redirect, path))
            }
            None => Outcome::NotFound,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forward(pattern: &str, port: u16) -> RouteEntry {
        RouteEntry {
            pattern: pattern.to_string(),
            action: RouteAction::Forward(port),
        }
    }

    fn redirect(pattern: &str, target: &str) -> RouteEntry {
        RouteEntry {
            pattern: pattern.to_string(),
            action: RouteAction::Redirect {
                redirect: target.to_string(),
            },
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn test_exact_host_match() {
        let table = RouteTable::new(vec![
            forward("other.com", 4000),
            forward("a.com", 3000),
            forward("b.com", 5000),
        ]);

        assert_eq!(table.resolve("a.com", "/"), Outcome::Forward(addr(3000)));
    }

    #[test]
    fn test_last_match_wins() {
        let table = RouteTable::new(vec![forward("a.com", 3000), forward("a.com", 3001)]);
        assert_eq!(table.resolve("a.com", "/"), Outcome::Forward(addr(3001)));

        // Swapping declaration order changes which route wins
        let table = RouteTable::new(vec![forward("a.com", 3001), forward("a.com", 3000)]);
        assert_eq!(table.resolve("a.com", "/"), Outcome::Forward(addr(3000)));
    }

    #[test]
    fn test_specific_path_declared_later_wins() {
        let table = RouteTable::new(vec![forward("a.com", 3000), forward("a.com/api", 3001)]);

        assert_eq!(
            table.resolve("a.com", "/api/users"),
            Outcome::Forward(addr(3001))
        );
        assert_eq!(table.resolve("a.com", "/"), Outcome::Forward(addr(3000)));
        assert_eq!(
            table.resolve("a.com", "/other"),
            Outcome::Forward(addr(3000))
        );
    }

    #[test]
    fn test_root_path_never_prefix_matches() {
        // "a.com/" can only be selected by exact host equality, which never
        // holds, so a root-path request must not match it via prefix logic.
        let table = RouteTable::new(vec![forward("a.com/", 3000)]);
        assert_eq!(table.resolve("a.com", "/"), Outcome::NotFound);

        // A non-root path does prefix-match it
        assert_eq!(
            table.resolve("a.com", "/anything"),
            Outcome::Forward(addr(3000))
        );
    }

    #[test]
    fn test_path_pattern_requires_segment_boundary() {
        let table = RouteTable::new(vec![forward("a.com/api", 3001)]);

        // "a.com/api" normalizes to "a.com/api/" so "/apifoo" is not a match
        assert_eq!(table.resolve("a.com", "/apifoo"), Outcome::NotFound);
        assert_eq!(
            table.resolve("a.com", "/api/users"),
            Outcome::Forward(addr(3001))
        );
    }

    #[test]
    fn test_redirect_keeps_original_path() {
        let table = RouteTable::new(vec![redirect("old.com", "new.com")]);

        assert_eq!(
            table.resolve("old.com", "/page"),
            Outcome::Redirect("https://new.com/page".to_string())
        );
    }

    #[test]
    fn test_no_match_is_not_found() {
        let table = RouteTable::new(vec![forward("a.com", 3000)]);
        assert_eq!(table.resolve("unknown.com", "/"), Outcome::NotFound);
    }

    #[test]
    fn test_case_sensitive_host_comparison() {
        let table = RouteTable::new(vec![forward("a.com", 3000)]);
        assert_eq!(table.resolve("A.com", "/"), Outcome::NotFound);
    }

    #[test]
    fn test_from_json_preserves_declaration_order() {
        let table = RouteTable::from_json(
            r#"{
                "a.com": 3000,
                "a.com/api": 3001,
                "old.com": {"redirect": "a.com"}
            }"#,
        )
        .unwrap();

        assert_eq!(table.len(), 3);
        assert_eq!(
            table.resolve("a.com", "/api/users"),
            Outcome::Forward(addr(3001))
        );
        assert_eq!(
            table.resolve("old.com", "/x"),
            Outcome::Redirect("https://a.com/x".to_string())
        );
    }

    #[test]
    fn test_from_json_rejects_bad_action() {
        assert!(RouteTable::from_json(r#"{"a.com": "nope"}"#).is_err());
    }
}

//! The `Identifier` sum type: a query or reference target, parsed
//! independently of context into either a globally stable content hash or a
//! scope-dependent bare id.

use std::fmt;

const HASH_PREFIX: &str = "sha256:";

/// A parsed identifier. Parsing is pure and total: every string parses to
/// either `Hash` (iff it begins with `sha256:`) or `Id` (everything else,
/// including names containing `/`, `-`, `.`). Scope is carried separately by
/// the symbol table, not encoded in the identifier itself — a `/`-qualified
/// id is still just an `Id`, resolved lexically rather than treated as a
/// distinct path-addressed identifier kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    /// `sha256:<hex digest>`, globally stable.
    Hash(String),
    /// Any other string: a bare name or scope-relative path fragment.
    Id(String),
}

impl Identifier {
    /// Parses `raw` into an `Identifier`. Never fails: an identifier is just
    /// a classified string, not a verified reference.
    pub fn parse(raw: &str) -> Identifier {
        match raw.strip_prefix(HASH_PREFIX) {
            Some(hex) => Identifier::Hash(hex.to_string()),
            None => Identifier::Id(raw.to_string()),
        }
    }

    pub fn is_hash(&self) -> bool {
        matches!(self, Identifier::Hash(_))
    }

    pub fn as_hash(&self) -> Option<&str> {
        match self {
            Identifier::Hash(h) => Some(h),
            Identifier::Id(_) => None,
        }
    }

    pub fn as_id(&self) -> Option<&str> {
        match self {
            Identifier::Id(n) => Some(n),
            Identifier::Hash(_) => None,
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Hash(h) => write!(f, "{HASH_PREFIX}{h}"),
            Identifier::Id(n) => write!(f, "{n}"),
        }
    }
}

/// Splits a query string into its root identifier and dotted property path:
/// split at the first `.` *unless* the prefix is a hash (the
/// colon in `sha256:` is not itself a separator, but a hash digest never
/// legitimately contains a literal `.` either way — this just documents that
/// the split happens on the whole raw string before identifier parsing).
pub fn split_query(query: &str) -> (&str, Vec<&str>) {
    match query.find('.') {
        Some(idx) => (&query[..idx], query[idx + 1..].split('.').collect()),
        None => (query, Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hash_prefix() {
        let id = Identifier::parse("sha256:deadbeef");
        assert_eq!(id, Identifier::Hash("deadbeef".to_string()));
        assert!(id.is_hash());
    }

    #[test]
    fn parses_bare_names_including_slashes_and_dashes() {
        assert_eq!(
            Identifier::parse("users/alice-v2"),
            Identifier::Id("users/alice-v2".to_string())
        );
    }

    #[test]
    fn round_trips_via_display() {
        for raw in ["sha256:abc123", "alice", "users/alice.v2", "a-b_c"] {
            let id = Identifier::parse(raw);
            assert_eq!(id.to_string(), raw);
        }
    }

    #[test]
    fn split_query_separates_root_from_property_path() {
        assert_eq!(split_query("alice.profile.email"), ("alice", vec!["profile", "email"]));
        assert_eq!(split_query("alice"), ("alice", vec![]));
        assert_eq!(split_query("alice.items[0]"), ("alice", vec!["items[0]"]));
    }
}

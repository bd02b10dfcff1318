//! Cache key definitions.
//!
//! Defines `QueryKey` for cache entries and `KeyPattern` for pattern-based
//! invalidation and wildcard listeners.

use std::borrow::Borrow;
use std::fmt;

use regex::Regex;
use serde_json::Value;

use crate::error::{QueryError, QueryResult};

/// Delimiter used when building child keys.
pub const SEGMENT_DELIMITER: char = ':';

/// Canonical, hierarchical identifier of a cache entry (`chat:42:messages`).
///
/// Segments may be separated by `:` or `/`. The key is never empty, never
/// contains whitespace or wildcard characters, and never both starts and ends
/// with `/` (that form is reserved for regex patterns).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(String);

impl QueryKey {
    pub fn new(key: impl Into<String>) -> QueryResult<Self> {
        let key = key.into();
        if key.is_empty() {
            return Err(QueryError::invalid_key(key, "key is empty"));
        }
        if let Some(bad) = key
            .chars()
            .find(|c| c.is_whitespace() || matches!(c, '*' | '?'))
        {
            return Err(QueryError::invalid_key(
                key.clone(),
                format!("contains reserved character {bad:?}"),
            ));
        }
        if key.len() > 1 && key.starts_with('/') && key.ends_with('/') {
            return Err(QueryError::invalid_key(
                key,
                "keys wrapped in '/' are read as regex patterns",
            ));
        }
        Ok(Self(key))
    }

    /// Append a `:`-delimited segment.
    pub fn child(&self, segment: impl fmt::Display) -> QueryResult<Self> {
        Self::new(format!("{}{SEGMENT_DELIMITER}{segment}", self.0))
    }

    /// Child key for a page param: its compact JSON, percent-encoded.
    ///
    /// `feed:2` for `2`, `feed:%222%22` for `"2"`; any cursor text is valid.
    pub fn page(&self, param: &Value) -> QueryResult<Self> {
        self.child(urlencoding::encode(&param.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split([':', '/'])
    }

    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for QueryKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for QueryKey {
    type Error = QueryError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<String> for QueryKey {
    type Error = QueryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// Glob or regex matcher over hierarchical keys.
///
/// - `chat:42:*` matches every key under `chat:42:`
/// - `user:?` matches `user:1` but not `user:12`
/// - `/^user:\d+$/` is a regular expression
/// - a pattern without wildcards matches exactly one key
#[derive(Debug, Clone)]
pub struct KeyPattern {
    source: String,
    matcher: Matcher,
}

#[derive(Debug, Clone)]
enum Matcher {
    Exact(String),
    Prefix(String),
    Regex(Regex),
}

impl KeyPattern {
    pub fn parse(pattern: &str) -> QueryResult<Self> {
        if pattern.trim().is_empty() {
            return Err(QueryError::invalid_pattern(pattern, "pattern is empty"));
        }

        let matcher = if let Some(body) = pattern
            .strip_prefix('/')
            .and_then(|rest| rest.strip_suffix('/'))
        {
            if body.is_empty() {
                return Err(QueryError::invalid_pattern(pattern, "regex body is empty"));
            }
            let regex = Regex::new(body)
                .map_err(|err| QueryError::invalid_pattern(pattern, err.to_string()))?;
            Matcher::Regex(regex)
        } else if !pattern.contains(['*', '?']) {
            Matcher::Exact(pattern.to_string())
        } else if let Some(prefix) = pattern.strip_suffix('*')
            && !prefix.contains(['*', '?'])
        {
            Matcher::Prefix(prefix.to_string())
        } else {
            Matcher::Regex(glob_to_regex(pattern)?)
        };

        Ok(Self {
            source: pattern.to_string(),
            matcher,
        })
    }

    /// Pattern matching a single key.
    pub fn exact(key: &QueryKey) -> Self {
        Self {
            source: key.as_str().to_string(),
            matcher: Matcher::Exact(key.as_str().to_string()),
        }
    }

    /// Pattern matching every key (`*`).
    pub fn any() -> Self {
        Self {
            source: "*".to_string(),
            matcher: Matcher::Prefix(String::new()),
        }
    }

    pub fn matches(&self, key: &str) -> bool {
        match &self.matcher {
            Matcher::Exact(exact) => exact == key,
            Matcher::Prefix(prefix) => key.starts_with(prefix.as_str()),
            Matcher::Regex(regex) => regex.is_match(key),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn is_exact(&self) -> bool {
        matches!(self.matcher, Matcher::Exact(_))
    }
}

impl fmt::Display for KeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl From<&QueryKey> for KeyPattern {
    fn from(key: &QueryKey) -> Self {
        Self::exact(key)
    }
}

impl TryFrom<&str> for KeyPattern {
    type Error = QueryError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

fn glob_to_regex(pattern: &str) -> QueryResult<Regex> {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for c in pattern.chars() {
        match c {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr).map_err(|err| QueryError::invalid_pattern(pattern, err.to_string()))
}

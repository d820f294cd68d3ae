use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use shardmap_core::Query;

/// One page of namespaces and the cursor to resume after it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespacePage {
    pub namespaces: Vec<String>,
    /// `None` once the source is exhausted.
    pub next_cursor: Option<String>,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("namespace source unavailable: {0}")]
    Unavailable(String),

    #[error("invalid cursor '{0}'")]
    InvalidCursor(String),
}

/// Enumerates the namespaces a job's query covers, a page at a time.
///
/// Listing the same `(query, cursor)` twice must return the same page, so a
/// page re-read after a failed delivery lands on the same namespaces.
pub trait NamespaceSource: Send + Sync {
    fn list(&self, query: &Query, cursor: Option<&str>, limit: usize) -> Result<NamespacePage, SourceError>;
}

impl<S> NamespaceSource for Arc<S>
where
    S: NamespaceSource + ?Sized,
{
    fn list(&self, query: &Query, cursor: Option<&str>, limit: usize) -> Result<NamespacePage, SourceError> {
        (**self).list(query, cursor, limit)
    }
}

/// Fixed, sorted namespace list. The cursor is the last namespace returned.
#[derive(Debug, Clone, Default)]
pub struct StaticNamespaceSource {
    namespaces: BTreeSet<String>,
}

impl StaticNamespaceSource {
    pub fn new<I, S>(namespaces: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            namespaces: namespaces.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }
}

impl NamespaceSource for StaticNamespaceSource {
    fn list(&self, query: &Query, cursor: Option<&str>, limit: usize) -> Result<NamespacePage, SourceError> {
        let limit = limit.max(1);
        let mut remaining = self
            .namespaces
            .iter()
            .filter(|ns| cursor.is_none_or(|c| ns.as_str() > c))
            .filter(|ns| query.matches_namespace(ns));

        let namespaces: Vec<String> = remaining.by_ref().take(limit).cloned().collect();
        let next_cursor = match remaining.next() {
            Some(_) => namespaces.last().cloned(),
            None => None,
        };

        Ok(NamespacePage {
            namespaces,
            next_cursor,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_until_exhausted() {
        let source = StaticNamespaceSource::new(["c", "a", "b", "a"]);
        let query = Query::new("Photo");

        let first = source.list(&query, None, 2).unwrap();
        assert_eq!(first.namespaces, vec!["a", "b"]);
        assert_eq!(first.next_cursor.as_deref(), Some("b"));

        let second = source.list(&query, first.next_cursor.as_deref(), 2).unwrap();
        assert_eq!(second.namespaces, vec!["c"]);
        assert!(second.next_cursor.is_none());
    }

    #[test]
    fn exact_fit_ends_without_an_empty_page() {
        let source = StaticNamespaceSource::new(["a", "b"]);
        let page = source.list(&Query::new("Photo"), None, 2).unwrap();
        assert_eq!(page.namespaces.len(), 2);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn query_filters_namespaces() {
        let source = StaticNamespaceSource::new(["eu-1", "eu-2", "us-1"]);
        let query = Query::new("Photo").with_namespace_prefix("eu-");
        let page = source.list(&query, None, 10).unwrap();
        assert_eq!(page.namespaces, vec!["eu-1", "eu-2"]);
    }
}

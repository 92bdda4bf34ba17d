// src/store.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::LedgerError;

/// Separator for composite keys. Matches the substrate's convention of a
/// zero byte between key parts, which keeps composed keys unambiguous as
/// long as the parts themselves never contain it.
pub const KEY_SEPARATOR: char = '\u{0}';

/// Deterministically build a composite key from a namespace and its parts.
/// Every replica must derive the identical key for the identical inputs.
pub fn composite_key(namespace: &str, parts: &[&str]) -> String {
    let mut key = String::from(namespace);
    for part in parts {
        key.push(KEY_SEPARATOR);
        key.push_str(part);
    }
    key
}

/// Equality-match selector over document fields.
///
/// This is the subset of rich-query filtering the core actually needs: a
/// document matches when every selector field is present and equal. The
/// store makes no ordering promise for query results; callers sort when
/// order matters.
#[derive(Debug, Clone, Default)]
pub struct Selector {
    fields: BTreeMap<String, Value>,
}

impl Selector {
    /// Start a selector from the document type discriminator.
    pub fn doc_type(doc_type: &str) -> Self {
        Self::default().field("docType", doc_type)
    }

    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    /// Merge caller-supplied criteria on top of the current fields.
    /// Later entries win, except the fields already pinned stay pinned
    /// only if the criteria does not name them.
    pub fn with_criteria(mut self, criteria: BTreeMap<String, Value>) -> Self {
        for (name, value) in criteria {
            self.fields.insert(name, value);
        }
        self
    }

    pub fn matches(&self, document: &Value) -> bool {
        let Some(object) = document.as_object() else {
            // Scalar documents (balance entries) never match field selectors.
            return self.fields.is_empty();
        };
        self.fields
            .iter()
            .all(|(name, expected)| object.get(name) == Some(expected))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// One committed version of a document, as surfaced by the substrate's
/// native historical-version query.
#[derive(Debug, Clone, Serialize)]
pub struct DocVersion {
    pub version: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "isDeleted")]
    pub is_deleted: bool,
    pub document: Option<Value>,
}

/// The consumed capability interface of the external ledger substrate.
///
/// One invocation performs its reads, computes, performs its writes, and
/// returns; the substrate commits the whole write set atomically or not at
/// all. The core never retries and never assumes a read-then-write is
/// atomic across invocations — conflicting concurrent invocations are
/// rejected by the substrate's optimistic concurrency check and resubmitted
/// by the caller.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, LedgerError>;
    async fn put(&self, key: &str, document: Value) -> Result<(), LedgerError>;
    async fn delete(&self, key: &str) -> Result<(), LedgerError>;

    /// Rich filter over stored documents. No guaranteed ordering.
    async fn query(&self, selector: &Selector) -> Result<Vec<Value>, LedgerError>;

    /// Every committed version of a key, newest first.
    async fn history(&self, key: &str) -> Result<Vec<DocVersion>, LedgerError>;
}

struct MemoryInner {
    documents: BTreeMap<String, Value>,
    versions: BTreeMap<String, Vec<DocVersion>>,
    commit_counter: u64,
}

/// In-memory adapter, primarily for tests. Uses `BTreeMap` so iteration
/// order is deterministic, and appends to a per-key version log on every
/// put and delete so `history` behaves like the substrate's.
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                documents: BTreeMap::new(),
                versions: BTreeMap::new(),
                commit_counter: 0,
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, LedgerError> {
        self.inner
            .lock()
            .map_err(|_| LedgerError::Storage("memory store poisoned".to_string()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, LedgerError> {
        let inner = self.lock()?;
        Ok(inner.documents.get(key).cloned())
    }

    async fn put(&self, key: &str, document: Value) -> Result<(), LedgerError> {
        let mut inner = self.lock()?;
        inner.commit_counter += 1;
        let version = inner.commit_counter;
        inner.documents.insert(key.to_string(), document.clone());
        inner
            .versions
            .entry(key.to_string())
            .or_default()
            .push(DocVersion {
                version,
                timestamp: Utc::now(),
                is_deleted: false,
                document: Some(document),
            });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), LedgerError> {
        let mut inner = self.lock()?;
        inner.commit_counter += 1;
        let version = inner.commit_counter;
        inner.documents.remove(key);
        inner
            .versions
            .entry(key.to_string())
            .or_default()
            .push(DocVersion {
                version,
                timestamp: Utc::now(),
                is_deleted: true,
                document: None,
            });
        Ok(())
    }

    async fn query(&self, selector: &Selector) -> Result<Vec<Value>, LedgerError> {
        let inner = self.lock()?;
        Ok(inner
            .documents
            .values()
            .filter(|doc| selector.matches(doc))
            .cloned()
            .collect())
    }

    async fn history(&self, key: &str) -> Result<Vec<DocVersion>, LedgerError> {
        let inner = self.lock()?;
        let mut versions = inner.versions.get(key).cloned().unwrap_or_default();
        versions.reverse();
        Ok(versions)
    }
}

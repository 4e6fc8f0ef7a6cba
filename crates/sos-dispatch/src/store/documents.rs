use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use super::{StoreError, StoreResult};

pub type Document = Map<String, Value>;

#[derive(Debug, Clone, PartialEq)]
enum Clause {
    /// Field equals value. `Null` also matches a missing field.
    Eq(Value),
    /// Field equals one of the values.
    AnyOf(Vec<Value>),
    /// Field is an array holding the value.
    Contains(Value),
}

impl Clause {
    fn matches(&self, field: Option<&Value>) -> bool {
        match self {
            Clause::Eq(Value::Null) => field.is_none_or(Value::is_null),
            Clause::Eq(expected) => field == Some(expected),
            Clause::AnyOf(options) => field.is_some_and(|v| options.contains(v)),
            Clause::Contains(item) => field
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(item)),
        }
    }
}

/// Conjunction of per-field conditions on top-level document fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    clauses: Vec<(String, Clause)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: Value) -> Self {
        self.clauses.push((field.to_string(), Clause::Eq(value)));
        self
    }

    pub fn any_of(mut self, field: &str, values: Vec<Value>) -> Self {
        self.clauses.push((field.to_string(), Clause::AnyOf(values)));
        self
    }

    pub fn contains(mut self, field: &str, value: Value) -> Self {
        self.clauses.push((field.to_string(), Clause::Contains(value)));
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        self.clauses
            .iter()
            .all(|(field, clause)| clause.matches(doc.get(field)))
    }
}

/// Order results by a top-level field. Documents missing the field sort last.
#[derive(Debug, Clone, PartialEq)]
pub struct Sort {
    pub field: String,
    pub descending: bool,
}

impl Sort {
    pub fn asc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            descending: false,
        }
    }

    pub fn desc(field: &str) -> Self {
        Self {
            field: field.to_string(),
            descending: true,
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert(&self, collection: &str, doc: Document) -> StoreResult<()>;

    /// Insert `doc` unless a document with the same `key_field` value is
    /// already present, in which case `StoreError::Duplicate` is returned and
    /// nothing is written. The check and the write are one atomic step.
    async fn insert_unique(&self, collection: &str, key_field: &str, doc: Document)
    -> StoreResult<()>;

    /// Apply `patch` to the first document matching `filter`, atomically with
    /// respect to every other write. `false` means nothing matched and nothing
    /// changed.
    async fn compare_and_swap(
        &self,
        collection: &str,
        filter: &Filter,
        patch: Document,
    ) -> StoreResult<bool>;

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<&Sort>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Document>>;

    async fn find_one(&self, collection: &str, filter: &Filter) -> StoreResult<Option<Document>> {
        Ok(self
            .find(collection, filter, None, Some(1))
            .await?
            .into_iter()
            .next())
    }
}

// ============================================================================
// In-memory backend
// ============================================================================

/// Collections held in process memory. All writes take the same lock, so
/// `compare_and_swap` is a true atomic conditional update.
pub struct MemoryDocumentStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
    available: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            collections: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the backend going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    fn check(&self) -> StoreResult<()> {
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("document store offline".to_string()))
        }
    }
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

fn compare_field(a: &Document, b: &Document, field: &str) -> std::cmp::Ordering {
    use std::cmp::Ordering::*;

    match (a.get(field), b.get(field)) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.total_cmp(&y)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(_), None) => Less,
        (None, Some(_)) => Greater,
        _ => Equal,
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn insert(&self, collection: &str, doc: Document) -> StoreResult<()> {
        self.check()?;
        let mut collections = self.collections.write().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .push(doc);
        Ok(())
    }

    async fn insert_unique(
        &self,
        collection: &str,
        key_field: &str,
        doc: Document,
    ) -> StoreResult<()> {
        self.check()?;
        let key = doc.get(key_field).cloned().unwrap_or(Value::Null);
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();

        if docs.iter().any(|d| d.get(key_field) == Some(&key)) {
            return Err(StoreError::Duplicate {
                collection: collection.to_string(),
                field: key_field.to_string(),
                value: key.to_string(),
            });
        }
        docs.push(doc);
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        collection: &str,
        filter: &Filter,
        patch: Document,
    ) -> StoreResult<bool> {
        self.check()?;
        let mut collections = self.collections.write().await;
        let Some(docs) = collections.get_mut(collection) else {
            return Ok(false);
        };

        match docs.iter_mut().find(|doc| filter.matches(doc)) {
            Some(doc) => {
                doc.extend(patch);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        sort: Option<&Sort>,
        limit: Option<usize>,
    ) -> StoreResult<Vec<Document>> {
        self.check()?;
        let collections = self.collections.read().await;
        let mut found: Vec<Document> = collections
            .get(collection)
            .map(|docs| docs.iter().filter(|d| filter.matches(d)).cloned().collect())
            .unwrap_or_default();

        if let Some(sort) = sort {
            found.sort_by(|a, b| {
                let ord = compare_field(a, b, &sort.field);
                if sort.descending { ord.reverse() } else { ord }
            });
        }
        if let Some(limit) = limit {
            found.truncate(limit);
        }
        Ok(found)
    }
}

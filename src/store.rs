//! The attribution store: a generic document CRUD/query boundary.
//!
//! All engine modules talk to persistence through [`AttributionStore`].
//! Two implementations are provided: [`MemoryStore`] for tests and
//! embedding, and [`PgStore`] over a single `documents` jsonb table.

use std::cmp::Ordering;
use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row, postgres::PgPoolOptions};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug)]
pub enum StoreError {
    /// No document with the given id.
    NotFound,
    /// Duplicate id on create, or a revision mismatch on a checked update.
    Conflict,
    /// Transient I/O failure. The only retryable class, and only for reads
    /// or writes that are idempotent by a stable key.
    Unavailable(anyhow::Error),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::NotFound => write!(f, "document not found"),
            StoreError::Conflict => write!(f, "document conflict"),
            StoreError::Unavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// A stored document. `rev` increments on every update and backs the
/// compare-and-swap used by the click ledger.
#[derive(Debug, Clone)]
pub struct Document {
    pub id: String,
    pub rev: i64,
    pub created_at: DateTime<Utc>,
    pub fields: Value,
}

impl Document {
    /// Deserializes the field map into a typed record.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, StoreError> {
        serde_json::from_value(self.fields.clone()).map_err(|e| {
            StoreError::Unavailable(anyhow::anyhow!("malformed document {}: {e}", self.id))
        })
    }
}

/// Serializes a typed record into a document field map.
pub fn encode<T: serde::Serialize>(value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Unavailable(e.into()))
}

#[derive(Debug, Clone)]
pub enum Filter {
    Eq(&'static str, Value),
    Gte(&'static str, Value),
    Lt(&'static str, Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    CreatedDesc,
    CreatedAsc,
}

/// Query over one collection: equality/range filters on document fields,
/// ordered by creation time. Range filters are for timestamp fields and
/// compare RFC3339 values as instants, not as text.
#[derive(Debug, Clone)]
pub struct ListQuery {
    pub filters: Vec<Filter>,
    pub order: Order,
    pub limit: Option<usize>,
}

impl ListQuery {
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
            order: Order::CreatedDesc,
            limit: None,
        }
    }

    pub fn eq(mut self, field: &'static str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(field, value.into()));
        self
    }

    pub fn gte(mut self, field: &'static str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Gte(field, value.into()));
        self
    }

    pub fn lt(mut self, field: &'static str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Lt(field, value.into()));
        self
    }

    pub fn oldest_first(mut self) -> Self {
        self.order = Order::CreatedAsc;
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }
}

impl Default for ListQuery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
pub trait AttributionStore: Send + Sync {
    /// Creates a document. A `None` id gets a fresh unique one; a duplicate
    /// explicit id fails with `Conflict`.
    async fn create(
        &self,
        collection: &str,
        id: Option<String>,
        fields: Value,
    ) -> Result<Document, StoreError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    /// Shallow-merges `patch` into the document fields.
    async fn update(&self, collection: &str, id: &str, patch: Value)
    -> Result<Document, StoreError>;

    /// As `update`, but only if the stored revision still equals
    /// `expected_rev`; otherwise fails with `Conflict`.
    async fn update_checked(
        &self,
        collection: &str,
        id: &str,
        expected_rev: i64,
        patch: Value,
    ) -> Result<Document, StoreError>;

    async fn list(&self, collection: &str, query: ListQuery) -> Result<Vec<Document>, StoreError>;
}

fn merge_fields(fields: &mut Value, patch: &Value) {
    if let (Value::Object(base), Value::Object(delta)) = (fields, patch) {
        for (k, v) in delta {
            base.insert(k.clone(), v.clone());
        }
    }
}

fn field_matches(fields: &Value, filter: &Filter) -> bool {
    let (key, want) = match filter {
        Filter::Eq(k, v) | Filter::Gte(k, v) | Filter::Lt(k, v) => (*k, v),
    };
    let Some(have) = fields.get(key) else {
        return false;
    };
    match filter {
        Filter::Eq(..) => have == want,
        Filter::Gte(..) => matches!(
            value_cmp(have, want),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Filter::Lt(..) => matches!(value_cmp(have, want), Some(Ordering::Less)),
    }
}

fn value_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        // RFC3339 strings compare as instants: chrono emits variable
        // subsecond precision, and "…00.5Z" sorts before "…00Z" as text.
        (Value::String(x), Value::String(y)) => {
            match (DateTime::parse_from_rfc3339(x), DateTime::parse_from_rfc3339(y)) {
                (Ok(dx), Ok(dy)) => Some(dx.cmp(&dy)),
                _ => Some(x.cmp(y)),
            }
        }
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        _ => None,
    }
}

/// In-memory store. Used by the test suites and embeddable for local runs.
#[derive(Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, HashMap<String, Document>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AttributionStore for MemoryStore {
    async fn create(
        &self,
        collection: &str,
        id: Option<String>,
        fields: Value,
    ) -> Result<Document, StoreError> {
        let mut guard = self.collections.write().await;
        let docs = guard.entry(collection.to_string()).or_default();
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        if docs.contains_key(&id) {
            return Err(StoreError::Conflict);
        }
        let doc = Document {
            id: id.clone(),
            rev: 1,
            created_at: Utc::now(),
            fields,
        };
        docs.insert(id, doc.clone());
        Ok(doc)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let guard = self.collections.read().await;
        Ok(guard.get(collection).and_then(|docs| docs.get(id)).cloned())
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: Value,
    ) -> Result<Document, StoreError> {
        let mut guard = self.collections.write().await;
        let doc = guard
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or(StoreError::NotFound)?;
        merge_fields(&mut doc.fields, &patch);
        doc.rev += 1;
        Ok(doc.clone())
    }

    async fn update_checked(
        &self,
        collection: &str,
        id: &str,
        expected_rev: i64,
        patch: Value,
    ) -> Result<Document, StoreError> {
        let mut guard = self.collections.write().await;
        let doc = guard
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or(StoreError::NotFound)?;
        if doc.rev != expected_rev {
            return Err(StoreError::Conflict);
        }
        merge_fields(&mut doc.fields, &patch);
        doc.rev += 1;
        Ok(doc.clone())
    }

    async fn list(&self, collection: &str, query: ListQuery) -> Result<Vec<Document>, StoreError> {
        let guard = self.collections.read().await;
        let mut out: Vec<Document> = guard
            .get(collection)
            .map(|docs| {
                docs.values()
                    .filter(|d| query.filters.iter().all(|f| field_matches(&d.fields, f)))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        out.sort_by(|a, b| match query.order {
            Order::CreatedAsc => a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)),
            Order::CreatedDesc => b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)),
        });
        if let Some(n) = query.limit {
            out.truncate(n);
        }
        Ok(out)
    }
}

/// Postgres-backed store. One `documents` table keyed by (collection, id),
/// fields as jsonb; see `migrations/0001_documents.sql`.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("Failed to connect to Postgres")?;
        Ok(Self { pool })
    }
}

fn filter_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn row_to_document(row: &sqlx::postgres::PgRow) -> Result<Document, StoreError> {
    let doc = Document {
        id: row.try_get("id").map_err(into_unavailable)?,
        rev: row.try_get("rev").map_err(into_unavailable)?,
        created_at: row.try_get("created_at").map_err(into_unavailable)?,
        fields: row.try_get("fields").map_err(into_unavailable)?,
    };
    Ok(doc)
}

fn into_unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(e.into())
}

// NOTE: 23505 = unique_violation
fn is_unique_violation(e: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = e {
        return db_err.code().as_deref() == Some("23505");
    }
    false
}

#[async_trait]
impl AttributionStore for PgStore {
    async fn create(
        &self,
        collection: &str,
        id: Option<String>,
        fields: Value,
    ) -> Result<Document, StoreError> {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let row = sqlx::query(
            r#"INSERT INTO documents (collection, id, rev, fields, created_at)
               VALUES ($1, $2, 1, $3, now())
               RETURNING id, rev, fields, created_at"#,
        )
        .bind(collection)
        .bind(&id)
        .bind(&fields)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::Conflict
            } else {
                into_unavailable(e)
            }
        })?;
        row_to_document(&row)
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query(
            r#"SELECT id, rev, fields, created_at FROM documents
               WHERE collection = $1 AND id = $2"#,
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(into_unavailable)?;
        row.as_ref().map(row_to_document).transpose()
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: Value,
    ) -> Result<Document, StoreError> {
        let row = sqlx::query(
            r#"UPDATE documents SET fields = fields || $3, rev = rev + 1
               WHERE collection = $1 AND id = $2
               RETURNING id, rev, fields, created_at"#,
        )
        .bind(collection)
        .bind(id)
        .bind(&patch)
        .fetch_optional(&self.pool)
        .await
        .map_err(into_unavailable)?;
        match row {
            Some(row) => row_to_document(&row),
            None => Err(StoreError::NotFound),
        }
    }

    async fn update_checked(
        &self,
        collection: &str,
        id: &str,
        expected_rev: i64,
        patch: Value,
    ) -> Result<Document, StoreError> {
        let row = sqlx::query(
            r#"UPDATE documents SET fields = fields || $3, rev = rev + 1
               WHERE collection = $1 AND id = $2 AND rev = $4
               RETURNING id, rev, fields, created_at"#,
        )
        .bind(collection)
        .bind(id)
        .bind(&patch)
        .bind(expected_rev)
        .fetch_optional(&self.pool)
        .await
        .map_err(into_unavailable)?;
        match row {
            Some(row) => row_to_document(&row),
            // Distinguish a stale revision from a missing document.
            None => match self.get(collection, id).await? {
                Some(_) => Err(StoreError::Conflict),
                None => Err(StoreError::NotFound),
            },
        }
    }

    async fn list(&self, collection: &str, query: ListQuery) -> Result<Vec<Document>, StoreError> {
        let mut sql =
            String::from("SELECT id, rev, fields, created_at FROM documents WHERE collection = $1");
        let mut binds: Vec<String> = Vec::new();
        for filter in &query.filters {
            let (key, value) = match filter {
                Filter::Eq(k, v) | Filter::Gte(k, v) | Filter::Lt(k, v) => (*k, v),
            };
            binds.push(filter_text(value));
            let n = binds.len() + 1;
            // `key` is a compile-time field name from this crate, never
            // caller input, so interpolating it is safe. Range filters apply
            // to timestamp fields; cast both sides so subsecond precision
            // differences cannot reorder the text forms.
            match filter {
                Filter::Eq(..) => sql.push_str(&format!(" AND fields->>'{key}' = ${n}")),
                Filter::Gte(..) => sql.push_str(&format!(
                    " AND (fields->>'{key}')::timestamptz >= (${n})::timestamptz"
                )),
                Filter::Lt(..) => sql.push_str(&format!(
                    " AND (fields->>'{key}')::timestamptz < (${n})::timestamptz"
                )),
            }
        }
        sql.push_str(match query.order {
            Order::CreatedDesc => " ORDER BY created_at DESC, id DESC",
            Order::CreatedAsc => " ORDER BY created_at ASC, id ASC",
        });
        if let Some(n) = query.limit {
            sql.push_str(&format!(" LIMIT {n}"));
        }

        let mut q = sqlx::query(&sql).bind(collection);
        for b in &binds {
            q = q.bind(b);
        }
        let rows = q.fetch_all(&self.pool).await.map_err(into_unavailable)?;
        rows.iter().map(row_to_document).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn create_assigns_id_and_initial_revision() {
        let store = MemoryStore::new();
        let doc = store
            .create("referrals", None, json!({"code": "ABC"}))
            .await
            .unwrap();
        assert_eq!(doc.rev, 1);
        assert!(!doc.id.is_empty());
    }

    #[tokio::test]
    async fn create_with_duplicate_id_conflicts() {
        let store = MemoryStore::new();
        store
            .create("referrals", Some("r1".into()), json!({}))
            .await
            .unwrap();
        let err = store
            .create("referrals", Some("r1".into()), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
    }

    #[tokio::test]
    async fn update_merges_and_bumps_revision() {
        let store = MemoryStore::new();
        let doc = store
            .create("referrals", Some("r1".into()), json!({"a": 1, "b": 1}))
            .await
            .unwrap();
        let updated = store
            .update("referrals", &doc.id, json!({"b": 2}))
            .await
            .unwrap();
        assert_eq!(updated.rev, 2);
        assert_eq!(updated.fields["a"], json!(1));
        assert_eq!(updated.fields["b"], json!(2));
    }

    #[tokio::test]
    async fn update_checked_rejects_stale_revision() {
        let store = MemoryStore::new();
        let doc = store
            .create("referrals", Some("r1".into()), json!({"n": 0}))
            .await
            .unwrap();
        store
            .update_checked("referrals", &doc.id, 1, json!({"n": 1}))
            .await
            .unwrap();
        let err = store
            .update_checked("referrals", &doc.id, 1, json!({"n": 2}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict));
    }

    #[tokio::test]
    async fn list_applies_filters_order_and_limit() {
        let store = MemoryStore::new();
        for (id, code, at) in [
            ("a", "X", "2025-01-01T00:00:00Z"),
            ("b", "X", "2025-02-01T00:00:00Z"),
            ("c", "Y", "2025-03-01T00:00:00Z"),
        ] {
            store
                .create(
                    "clicks",
                    Some(id.into()),
                    json!({"code": code, "clickedAt": at}),
                )
                .await
                .unwrap();
        }
        let docs = store
            .list("clicks", ListQuery::new().eq("code", "X"))
            .await
            .unwrap();
        assert_eq!(docs.len(), 2);

        let ranged = store
            .list(
                "clicks",
                ListQuery::new()
                    .gte("clickedAt", "2025-02-01T00:00:00Z")
                    .lt("clickedAt", "2025-03-01T00:00:00Z"),
            )
            .await
            .unwrap();
        assert_eq!(ranged.len(), 1);
        assert_eq!(ranged[0].id, "b");

        let limited = store
            .list("clicks", ListQuery::new().limit(1))
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn range_filters_compare_instants_not_text() {
        let store = MemoryStore::new();
        // As text, "…00.500Z" sorts before "…00Z"; as an instant it is after.
        store
            .create(
                "clicks",
                Some("frac".into()),
                json!({"clickedAt": "2025-02-01T00:00:00.500Z"}),
            )
            .await
            .unwrap();
        store
            .create(
                "clicks",
                Some("early".into()),
                json!({"clickedAt": "2025-01-31T23:59:59.900Z"}),
            )
            .await
            .unwrap();

        let docs = store
            .list(
                "clicks",
                ListQuery::new().gte("clickedAt", "2025-02-01T00:00:00Z"),
            )
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "frac");
    }
}

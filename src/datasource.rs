//!
//! Dynamic-schema datasource
//! -------------------------
//! Per-table query-builder and CRUD facade over the row store. A
//! `Datasource` is ephemeral per-request state: it holds the table and
//! column metadata snapshot loaded at construction time plus accumulated
//! query-construction fields (search term, row filter, ordering,
//! pagination window). Builder methods consume and return the value so a
//! configured datasource can never alias another; only the terminal
//! operations (`count`, `all`, `get`, `create`, and `RowItem::{update,
//! delete}`) touch storage.
//!
//! Ordering over the open-ended JSON payload cannot be pushed down to an
//! index, so the full filtered set is materialized and sorted in memory
//! keyed by `(value, uuid)` for deterministic tie-breaking. This does not
//! scale past a page-fetch's worth of rows and is the documented contract.

use serde_json::{Map, Value};

use crate::error::{AppError, AppResult};
use crate::schema::{schema_for_columns, FieldErrors, FieldKind, RawValues, RecordSchema};
use crate::storage::{ColumnRecord, RowRecord, SharedStore, TableRecord};

/// Load a datasource for a table identity, or None when the table does not
/// resolve. Columns come back in display (position) order.
pub async fn load_datasource(store: &SharedStore, table_identity: &str) -> AppResult<Option<Datasource>> {
    let guard = store.0.lock();
    let Some(table) = guard.table_by_identity(table_identity) else {
        return Ok(None);
    };
    let columns = guard.columns_for_table(table.pk);
    drop(guard);
    Ok(Some(Datasource::new(store.clone(), table, columns)))
}

/// All datasources in table-creation order, for the dashboard.
pub async fn load_datasources(store: &SharedStore) -> AppResult<Vec<Datasource>> {
    let guard = store.0.lock();
    let tables = guard.list_tables();
    let out = tables
        .into_iter()
        .map(|table| {
            let columns = guard.columns_for_table(table.pk);
            Datasource::new(store.clone(), table, columns)
        })
        .collect();
    Ok(out)
}

/// Datasources owned by one user, for profile pages.
pub async fn load_datasources_for_user(store: &SharedStore, owner_pk: i64) -> AppResult<Vec<Datasource>> {
    let guard = store.0.lock();
    let tables = guard.list_tables_for_owner(owner_pk);
    let out = tables
        .into_iter()
        .map(|table| {
            let columns = guard.columns_for_table(table.pk);
            Datasource::new(store.clone(), table, columns)
        })
        .collect();
    Ok(out)
}

/// Query builder and CRUD facade for one table's rows.
#[derive(Clone)]
pub struct Datasource {
    store: SharedStore,
    pub table: TableRecord,
    pub columns: Vec<ColumnRecord>,
    pub schema: RecordSchema,
    search_term: Option<String>,
    filter_uuid: Option<String>,
    order: Option<(String, bool)>,
    query_offset: Option<usize>,
    query_limit: Option<usize>,
}

impl Datasource {
    fn new(store: SharedStore, table: TableRecord, columns: Vec<ColumnRecord>) -> Self {
        let schema = schema_for_columns(&columns);
        Self {
            store,
            table,
            columns,
            schema,
            search_term: None,
            filter_uuid: None,
            order: None,
            query_offset: None,
            query_limit: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.table.name
    }

    pub fn url(&self) -> String {
        format!("/tables/{}", self.table.identity)
    }

    /// Narrow to rows whose search_text contains the term as a
    /// case-insensitive substring. An empty term is a no-op.
    pub fn search(mut self, term: &str) -> Self {
        if !term.is_empty() {
            self.search_term = Some(term.to_string());
        }
        self
    }

    /// Narrow to exactly one row by its public uuid.
    pub fn filter(mut self, row_uuid: &str) -> Self {
        self.filter_uuid = Some(row_uuid.to_string());
        self
    }

    /// Sort by a column identity; `reverse` flips to descending. The column
    /// must exist in the schema or the ordering is ignored.
    pub fn order_by(mut self, column: &str, reverse: bool) -> Self {
        if self.schema.field(column).is_some() {
            self.order = Some((column.to_string(), reverse));
        }
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.query_offset = Some(offset);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.query_limit = Some(limit);
        self
    }

    /// Validate raw form input against this table's schema.
    pub fn validate(&self, raw: &RawValues) -> Result<Map<String, Value>, FieldErrors> {
        self.schema.validate(raw)
    }

    fn matches(&self, row: &RowRecord) -> bool {
        if let Some(uuid) = &self.filter_uuid {
            if &row.uuid != uuid {
                return false;
            }
        }
        if let Some(term) = &self.search_term {
            if !row.search_text.to_lowercase().contains(&term.to_lowercase()) {
                return false;
            }
        }
        true
    }

    fn matching_rows(&self) -> Vec<RowRecord> {
        let guard = self.store.0.lock();
        guard
            .rows_for_table(self.table.pk)
            .into_iter()
            .filter(|row| self.matches(row))
            .collect()
    }

    /// Count rows matching the current search/filter state. Pagination is
    /// ignored so the caller can compute total pages up front.
    pub async fn count(&self) -> AppResult<usize> {
        Ok(self.matching_rows().len())
    }

    /// Materialize the ordered, paginated record list.
    pub async fn all(&self) -> AppResult<Vec<RowItem>> {
        let mut rows = self.matching_rows();
        if let Some((column, reverse)) = &self.order {
            rows.sort_by(|a, b| {
                let ka = (order_key(a.data.get(column)), a.uuid.clone());
                let kb = (order_key(b.data.get(column)), b.uuid.clone());
                let ord = ka.cmp(&kb);
                if *reverse { ord.reverse() } else { ord }
            });
        }
        let offset = self.query_offset.unwrap_or(0);
        let items: Vec<RowItem> = rows
            .into_iter()
            .skip(offset)
            .take(self.query_limit.unwrap_or(usize::MAX))
            .map(|row| self.item(row))
            .collect();
        Ok(items)
    }

    /// Fetch exactly one matching record, or None. Absence is not an error;
    /// the boundary decides how to surface it.
    pub async fn get(&self) -> AppResult<Option<RowItem>> {
        let mut rows = self.matching_rows();
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.item(rows.remove(0))))
    }

    /// Insert a new row from validated values. Generates the public uuid
    /// and creation timestamp, derives search_text from the string-typed
    /// values, and returns the new row's uuid.
    pub async fn create(&self, values: &Map<String, Value>) -> AppResult<String> {
        let search_text = search_text_for(&self.schema, values);
        let mut guard = self.store.0.lock();
        let row = guard
            .insert_row(self.table.pk, values.clone(), search_text)
            .map_err(AppError::from)?;
        Ok(row.uuid)
    }

    fn item(&self, row: RowRecord) -> RowItem {
        RowItem {
            store: self.store.clone(),
            table_identity: self.table.identity.clone(),
            schema: self.schema.clone(),
            row,
        }
    }
}

/// Space-joined concatenation of the string-typed values, in schema field
/// order. This is the only place search_text is derived.
pub fn search_text_for(schema: &RecordSchema, values: &Map<String, Value>) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for field in schema.fields() {
        if !matches!(field.kind, FieldKind::Str { .. }) {
            continue;
        }
        if let Some(Value::String(s)) = values.get(&field.identity) {
            if !s.is_empty() {
                parts.push(s);
            }
        }
    }
    parts.join(" ")
}

/// Sort key over one payload value: missing values order first, integers
/// before strings.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum OrderKey {
    Missing,
    Int(i64),
    Str(String),
}

fn order_key(value: Option<&Value>) -> OrderKey {
    match value {
        Some(Value::Number(n)) => n.as_i64().map(OrderKey::Int).unwrap_or(OrderKey::Missing),
        Some(Value::String(s)) => OrderKey::Str(s.clone()),
        _ => OrderKey::Missing,
    }
}

/// A single fetched record plus enough context to mutate it.
#[derive(Clone)]
pub struct RowItem {
    store: SharedStore,
    table_identity: String,
    schema: RecordSchema,
    row: RowRecord,
}

impl RowItem {
    pub fn uuid(&self) -> &str {
        &self.row.uuid
    }

    pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.row.created_at
    }

    pub fn search_text(&self) -> &str {
        &self.row.search_text
    }

    pub fn url(&self) -> String {
        format!("/tables/{}/rows/{}", self.table_identity, self.row.uuid)
    }

    pub fn delete_url(&self) -> String {
        format!("/tables/{}/rows/{}/delete", self.table_identity, self.row.uuid)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.row.data.get(key)
    }

    /// Payload projected onto the current schema: stale keys left behind by
    /// deleted columns are never exposed.
    pub fn record(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for field in self.schema.fields() {
            if let Some(value) = self.row.data.get(&field.identity) {
                out.insert(field.identity.clone(), value.clone());
            }
        }
        out
    }

    /// Raw string form of the record, for edit-form population.
    pub fn serialize(&self) -> RawValues {
        self.schema.serialize(&self.row.data)
    }

    /// Replace the payload with a full validated record and recompute
    /// search_text. Partial updates are not supported; last write wins.
    pub async fn update(&self, values: &Map<String, Value>) -> AppResult<()> {
        let search_text = search_text_for(&self.schema, values);
        let mut guard = self.store.0.lock();
        let updated = guard
            .update_row(self.row.pk, values.clone(), search_text)
            .map_err(AppError::from)?;
        if !updated {
            return Err(AppError::not_found("row_missing", "row no longer exists"));
        }
        Ok(())
    }

    /// Remove the row. Destructive and immediate; no soft delete.
    pub async fn delete(&self) -> AppResult<()> {
        let mut guard = self.store.0.lock();
        let deleted = guard.delete_row(self.row.pk).map_err(AppError::from)?;
        if !deleted {
            return Err(AppError::not_found("row_missing", "row no longer exists"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Datatype;
    use serde_json::json;

    async fn fixture() -> (tempfile::TempDir, SharedStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = SharedStore::new(tmp.path()).unwrap();
        {
            let mut guard = store.0.lock();
            let table = guard.insert_table("Election", "election", None).unwrap();
            guard.insert_column(table.pk, "Constituency", "constituency", Datatype::String).unwrap();
            guard.insert_column(table.pk, "Party", "party", Datatype::String).unwrap();
            guard.insert_column(table.pk, "Votes", "votes", Datatype::Integer).unwrap();
        }
        (tmp, store)
    }

    fn record(constituency: &str, party: &str, votes: i64) -> Map<String, Value> {
        let mut values = Map::new();
        values.insert("constituency".into(), json!(constituency));
        values.insert("party".into(), json!(party));
        values.insert("votes".into(), json!(votes));
        values
    }

    #[tokio::test]
    async fn create_then_get_roundtrip() {
        let (_tmp, store) = fixture().await;
        let ds = load_datasource(&store, "election").await.unwrap().unwrap();
        let values = record("Brighton Pavilion", "Green", 30149);
        let uuid = ds.create(&values).await.unwrap();

        let ds = load_datasource(&store, "election").await.unwrap().unwrap();
        let item = ds.filter(&uuid).get().await.unwrap().unwrap();
        assert_eq!(item.record(), values);
        assert!(item.search_text().contains("Brighton Pavilion"));
        assert!(item.search_text().contains("Green"));
        // Integer values are excluded from the search index
        assert!(!item.search_text().contains("30149"));
    }

    #[tokio::test]
    async fn search_is_case_insensitive_substring() {
        let (_tmp, store) = fixture().await;
        let ds = load_datasource(&store, "election").await.unwrap().unwrap();
        ds.create(&record("Brighton Pavilion", "LUCAS Caroline Green", 30149)).await.unwrap();
        ds.create(&record("Brighton Pavilion", "SEN Purna Labour", 22871)).await.unwrap();

        let ds = load_datasource(&store, "election").await.unwrap().unwrap();
        let hits = ds.search("green").all().await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].get("party"), Some(&json!("LUCAS Caroline Green")));
    }

    #[tokio::test]
    async fn count_ignores_pagination() {
        let (_tmp, store) = fixture().await;
        let ds = load_datasource(&store, "election").await.unwrap().unwrap();
        for i in 0..25 {
            ds.create(&record(&format!("Seat {}", i), "Any", i)).await.unwrap();
        }
        let ds = load_datasource(&store, "election").await.unwrap().unwrap();
        let ds = ds.offset(10).limit(10);
        assert_eq!(ds.count().await.unwrap(), 25);
        assert_eq!(ds.all().await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn order_by_sorts_in_memory_with_stable_ties() {
        let (_tmp, store) = fixture().await;
        let ds = load_datasource(&store, "election").await.unwrap().unwrap();
        ds.create(&record("B", "Same", 2)).await.unwrap();
        ds.create(&record("A", "Same", 3)).await.unwrap();
        ds.create(&record("C", "Same", 1)).await.unwrap();

        let ds = load_datasource(&store, "election").await.unwrap().unwrap();
        let asc = ds.clone().order_by("votes", false).all().await.unwrap();
        let votes: Vec<_> = asc.iter().map(|i| i.get("votes").cloned().unwrap()).collect();
        assert_eq!(votes, vec![json!(1), json!(2), json!(3)]);

        let desc = ds.clone().order_by("constituency", true).all().await.unwrap();
        let names: Vec<_> = desc.iter().map(|i| i.get("constituency").cloned().unwrap()).collect();
        assert_eq!(names, vec![json!("C"), json!("B"), json!("A")]);

        // Tied values fall back to uuid ordering, so repeated runs agree.
        let tied_a = ds.clone().order_by("party", false).all().await.unwrap();
        let tied_b = ds.clone().order_by("party", false).all().await.unwrap();
        let ua: Vec<_> = tied_a.iter().map(|i| i.uuid().to_string()).collect();
        let ub: Vec<_> = tied_b.iter().map(|i| i.uuid().to_string()).collect();
        assert_eq!(ua, ub);
    }

    #[tokio::test]
    async fn unknown_order_column_is_ignored() {
        let (_tmp, store) = fixture().await;
        let ds = load_datasource(&store, "election").await.unwrap().unwrap();
        ds.create(&record("B", "x", 2)).await.unwrap();
        ds.create(&record("A", "y", 1)).await.unwrap();
        let ds = load_datasource(&store, "election").await.unwrap().unwrap();
        let items = ds.order_by("no_such_column", false).all().await.unwrap();
        // Insertion order stands, oldest first
        assert_eq!(items[0].get("constituency"), Some(&json!("B")));
    }

    #[tokio::test]
    async fn delete_then_get_is_none() {
        let (_tmp, store) = fixture().await;
        let ds = load_datasource(&store, "election").await.unwrap().unwrap();
        let uuid = ds.create(&record("A", "x", 1)).await.unwrap();
        let ds = load_datasource(&store, "election").await.unwrap().unwrap();
        let item = ds.clone().filter(&uuid).get().await.unwrap().unwrap();
        item.delete().await.unwrap();
        assert!(ds.filter(&uuid).get().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_recomputes_search_text() {
        let (_tmp, store) = fixture().await;
        let ds = load_datasource(&store, "election").await.unwrap().unwrap();
        let uuid = ds.create(&record("Old Name", "Blue", 1)).await.unwrap();
        let ds = load_datasource(&store, "election").await.unwrap().unwrap();
        let item = ds.clone().filter(&uuid).get().await.unwrap().unwrap();
        item.update(&record("New Name", "Red", 2)).await.unwrap();
        let item = ds.filter(&uuid).get().await.unwrap().unwrap();
        assert!(item.search_text().contains("New Name"));
        assert!(!item.search_text().contains("Old Name"));
    }

    #[tokio::test]
    async fn search_combines_with_filter() {
        let (_tmp, store) = fixture().await;
        let ds = load_datasource(&store, "election").await.unwrap().unwrap();
        let uuid = ds.create(&record("Brighton Pavilion", "Green", 1)).await.unwrap();
        ds.create(&record("Hove", "Labour", 2)).await.unwrap();
        let ds = load_datasource(&store, "election").await.unwrap().unwrap();
        // filter + non-matching search narrows to nothing
        let none = ds.clone().filter(&uuid).search("labour").get().await.unwrap();
        assert!(none.is_none());
        let some = ds.filter(&uuid).search("green").get().await.unwrap();
        assert!(some.is_some());
    }

    #[tokio::test]
    async fn missing_table_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SharedStore::new(tmp.path()).unwrap();
        assert!(load_datasource(&store, "nope").await.unwrap().is_none());
    }
}

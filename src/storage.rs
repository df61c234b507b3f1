//!
//! gridbase storage module
//! -----------------------
//! This module implements the row store: four record kinds — User, Table,
//! Column, Row — persisted as JSON documents under a root folder
//! (`users.json`, `tables.json`, `columns.json`, `rows.json`). The full
//! state is loaded at open and the affected document is rewritten on every
//! mutation. Rows carry an open-ended JSON payload keyed by column identity
//! plus a denormalized `search_text` used for substring search.
//!
//! Key responsibilities:
//! - Primary-key allocation and record CRUD for all four kinds.
//! - Cascading deletes: a table takes its columns and rows with it; the
//!   last column of a table takes every row payload with it.
//! - Dense, 1-based column positions per table (new columns append).
//!
//! The public API centers around the `Store` type, which is usually wrapped
//! in a thread-safe `SharedStore` (`Arc<Mutex<Store>>`) elsewhere in the
//! codebase.

use std::{fs, path::{Path, PathBuf}};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Column datatypes supported by user-defined tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Datatype {
    String,
    Integer,
}

impl Datatype {
    pub fn as_str(&self) -> &'static str {
        match self {
            Datatype::String => "string",
            Datatype::Integer => "integer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(Datatype::String),
            "integer" => Some(Datatype::Integer),
            _ => None,
        }
    }
}

/// A registered user. Created or refreshed on the external-auth callback;
/// never deleted in normal operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub pk: i64,
    pub external_id: String,
    pub username: String,
    pub display_name: String,
    pub avatar_url: String,
    pub created_at: DateTime<Utc>,
    pub last_login: DateTime<Utc>,
    #[serde(default)]
    pub is_admin: bool,
}

/// A user-defined table. `identity` is the URL-safe slug; `owner` is None
/// in legacy single-tenant mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRecord {
    pub pk: i64,
    pub owner: Option<i64>,
    pub identity: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// A typed column belonging to one table. Positions are 1-based, dense and
/// unique per table; they define display order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnRecord {
    pub pk: i64,
    pub table: i64,
    pub identity: String,
    pub name: String,
    pub datatype: Datatype,
    pub position: i64,
    pub created_at: DateTime<Utc>,
}

/// One stored row. `uuid` is the public identifier; `data` maps column
/// identity to a scalar value; `search_text` is a materialized index over
/// the string-typed values and must be re-derived whenever `data` changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowRecord {
    pub pk: i64,
    pub table: i64,
    pub uuid: String,
    pub created_at: DateTime<Utc>,
    pub data: Map<String, Value>,
    pub search_text: String,
}

/// On-disk row store rooted at a single folder.
pub struct Store {
    root: PathBuf,
    users: Vec<UserRecord>,
    tables: Vec<TableRecord>,
    columns: Vec<ColumnRecord>,
    rows: Vec<RowRecord>,
    next_pk: i64,
}

fn load_doc<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let records = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(records)
}

fn save_doc<T: Serialize>(path: &Path, records: &[T]) -> Result<()> {
    let text = serde_json::to_string_pretty(records)?;
    fs::write(path, text).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

impl Store {
    /// Open (or initialize) a store rooted at the given folder.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .with_context(|| format!("creating store root {}", root.display()))?;
        let users: Vec<UserRecord> = load_doc(&root.join("users.json"))?;
        let tables: Vec<TableRecord> = load_doc(&root.join("tables.json"))?;
        let columns: Vec<ColumnRecord> = load_doc(&root.join("columns.json"))?;
        let rows: Vec<RowRecord> = load_doc(&root.join("rows.json"))?;
        let max_pk = users.iter().map(|r| r.pk)
            .chain(tables.iter().map(|r| r.pk))
            .chain(columns.iter().map(|r| r.pk))
            .chain(rows.iter().map(|r| r.pk))
            .max()
            .unwrap_or(0);
        debug!(target: "gridbase::storage",
            "open: root='{}' users={} tables={} columns={} rows={}",
            root.display(), users.len(), tables.len(), columns.len(), rows.len());
        Ok(Self { root, users, tables, columns, rows, next_pk: max_pk + 1 })
    }

    pub fn root_path(&self) -> &PathBuf { &self.root }

    fn alloc_pk(&mut self) -> i64 {
        let pk = self.next_pk;
        self.next_pk += 1;
        pk
    }

    fn save_users(&self) -> Result<()> { save_doc(&self.root.join("users.json"), &self.users) }
    fn save_tables(&self) -> Result<()> { save_doc(&self.root.join("tables.json"), &self.tables) }
    fn save_columns(&self) -> Result<()> { save_doc(&self.root.join("columns.json"), &self.columns) }
    fn save_rows(&self) -> Result<()> { save_doc(&self.root.join("rows.json"), &self.rows) }

    // --- Users ---

    /// Create or refresh a user from an externally-authenticated profile.
    /// Matching is by `external_id`; an existing user gets its profile
    /// fields and `last_login` updated.
    pub fn upsert_user(
        &mut self,
        external_id: &str,
        username: &str,
        display_name: &str,
        avatar_url: &str,
    ) -> Result<UserRecord> {
        let now = Utc::now();
        if let Some(user) = self.users.iter_mut().find(|u| u.external_id == external_id) {
            user.username = username.to_string();
            user.display_name = display_name.to_string();
            user.avatar_url = avatar_url.to_string();
            user.last_login = now;
            let out = user.clone();
            self.save_users()?;
            return Ok(out);
        }
        let pk = self.alloc_pk();
        let user = UserRecord {
            pk,
            external_id: external_id.to_string(),
            username: username.to_string(),
            display_name: display_name.to_string(),
            avatar_url: avatar_url.to_string(),
            created_at: now,
            last_login: now,
            is_admin: false,
        };
        debug!(target: "gridbase::storage", "upsert_user: created username='{}'", username);
        self.users.push(user.clone());
        self.save_users()?;
        Ok(user)
    }

    pub fn user_by_username(&self, username: &str) -> Option<UserRecord> {
        self.users.iter().find(|u| u.username == username).cloned()
    }

    pub fn user_by_pk(&self, pk: i64) -> Option<UserRecord> {
        self.users.iter().find(|u| u.pk == pk).cloned()
    }

    // --- Tables ---

    pub fn list_tables(&self) -> Vec<TableRecord> {
        self.tables.clone()
    }

    pub fn list_tables_for_owner(&self, owner_pk: i64) -> Vec<TableRecord> {
        self.tables.iter().filter(|t| t.owner == Some(owner_pk)).cloned().collect()
    }

    pub fn table_by_identity(&self, identity: &str) -> Option<TableRecord> {
        self.tables.iter().find(|t| t.identity == identity).cloned()
    }

    pub fn table_by_pk(&self, pk: i64) -> Option<TableRecord> {
        self.tables.iter().find(|t| t.pk == pk).cloned()
    }

    pub fn insert_table(&mut self, name: &str, identity: &str, owner: Option<i64>) -> Result<TableRecord> {
        let pk = self.alloc_pk();
        let table = TableRecord {
            pk,
            owner,
            identity: identity.to_string(),
            name: name.to_string(),
            created_at: Utc::now(),
        };
        debug!(target: "gridbase::storage", "insert_table: identity='{}' pk={}", identity, pk);
        self.tables.push(table.clone());
        self.save_tables()?;
        Ok(table)
    }

    /// Delete a table and cascade to its columns and rows.
    pub fn delete_table(&mut self, table_pk: i64) -> Result<bool> {
        let before = self.tables.len();
        self.tables.retain(|t| t.pk != table_pk);
        if self.tables.len() == before {
            return Ok(false);
        }
        self.columns.retain(|c| c.table != table_pk);
        self.rows.retain(|r| r.table != table_pk);
        debug!(target: "gridbase::storage", "delete_table: pk={} (cascaded)", table_pk);
        self.save_tables()?;
        self.save_columns()?;
        self.save_rows()?;
        Ok(true)
    }

    // --- Columns ---

    /// Columns for a table in display order (by position).
    pub fn columns_for_table(&self, table_pk: i64) -> Vec<ColumnRecord> {
        let mut cols: Vec<ColumnRecord> = self
            .columns
            .iter()
            .filter(|c| c.table == table_pk)
            .cloned()
            .collect();
        cols.sort_by_key(|c| c.position);
        cols
    }

    pub fn column_by_identity(&self, table_pk: i64, identity: &str) -> Option<ColumnRecord> {
        self.columns
            .iter()
            .find(|c| c.table == table_pk && c.identity == identity)
            .cloned()
    }

    /// Append a single column at max(position)+1.
    pub fn insert_column(
        &mut self,
        table_pk: i64,
        name: &str,
        identity: &str,
        datatype: Datatype,
    ) -> Result<ColumnRecord> {
        let position = self
            .columns
            .iter()
            .filter(|c| c.table == table_pk)
            .map(|c| c.position)
            .max()
            .unwrap_or(0)
            + 1;
        let pk = self.alloc_pk();
        let column = ColumnRecord {
            pk,
            table: table_pk,
            identity: identity.to_string(),
            name: name.to_string(),
            datatype,
            position,
            created_at: Utc::now(),
        };
        debug!(target: "gridbase::storage",
            "insert_column: table={} identity='{}' position={}", table_pk, identity, position);
        self.columns.push(column.clone());
        self.save_columns()?;
        Ok(column)
    }

    /// Bulk-append columns (CSV ingestion). Positions continue the table's
    /// existing sequence.
    pub fn insert_columns(
        &mut self,
        table_pk: i64,
        entries: &[(String, String, Datatype)],
    ) -> Result<Vec<ColumnRecord>> {
        let base = self
            .columns
            .iter()
            .filter(|c| c.table == table_pk)
            .map(|c| c.position)
            .max()
            .unwrap_or(0);
        let now = Utc::now();
        let mut out = Vec::with_capacity(entries.len());
        for (idx, (name, identity, datatype)) in entries.iter().enumerate() {
            let pk = self.alloc_pk();
            let column = ColumnRecord {
                pk,
                table: table_pk,
                identity: identity.clone(),
                name: name.clone(),
                datatype: *datatype,
                position: base + idx as i64 + 1,
                created_at: now,
            };
            self.columns.push(column.clone());
            out.push(column);
        }
        self.save_columns()?;
        Ok(out)
    }

    /// Delete a column by identity. Stale payload keys in existing rows are
    /// tolerated (they are never displayed), except when this was the last
    /// column: then every row payload for the table is cleared outright.
    pub fn delete_column(&mut self, table_pk: i64, identity: &str) -> Result<bool> {
        let before = self.columns.len();
        self.columns
            .retain(|c| !(c.table == table_pk && c.identity == identity));
        if self.columns.len() == before {
            return Ok(false);
        }
        let remaining = self.columns.iter().any(|c| c.table == table_pk);
        if !remaining {
            for row in self.rows.iter_mut().filter(|r| r.table == table_pk) {
                row.data = Map::new();
                row.search_text = String::new();
            }
            self.save_rows()?;
        }
        debug!(target: "gridbase::storage",
            "delete_column: table={} identity='{}' last={}", table_pk, identity, !remaining);
        self.save_columns()?;
        Ok(true)
    }

    // --- Rows ---

    /// Rows for a table in insertion order (oldest first).
    pub fn rows_for_table(&self, table_pk: i64) -> Vec<RowRecord> {
        self.rows.iter().filter(|r| r.table == table_pk).cloned().collect()
    }

    pub fn count_rows(&self, table_pk: i64) -> usize {
        self.rows.iter().filter(|r| r.table == table_pk).count()
    }

    pub fn row_by_uuid(&self, table_pk: i64, uuid: &str) -> Option<RowRecord> {
        self.rows
            .iter()
            .find(|r| r.table == table_pk && r.uuid == uuid)
            .cloned()
    }

    pub fn insert_row(
        &mut self,
        table_pk: i64,
        data: Map<String, Value>,
        search_text: String,
    ) -> Result<RowRecord> {
        let pk = self.alloc_pk();
        let row = RowRecord {
            pk,
            table: table_pk,
            uuid: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            data,
            search_text,
        };
        self.rows.push(row.clone());
        self.save_rows()?;
        Ok(row)
    }

    /// Bulk insert (CSV ingestion): one save for the whole batch.
    pub fn insert_rows(
        &mut self,
        table_pk: i64,
        batch: Vec<(Map<String, Value>, String)>,
    ) -> Result<Vec<RowRecord>> {
        let now = Utc::now();
        let mut out = Vec::with_capacity(batch.len());
        for (data, search_text) in batch {
            let pk = self.alloc_pk();
            let row = RowRecord {
                pk,
                table: table_pk,
                uuid: Uuid::new_v4().to_string(),
                created_at: now,
                data,
                search_text,
            };
            self.rows.push(row.clone());
            out.push(row);
        }
        debug!(target: "gridbase::storage", "insert_rows: table={} inserted={}", table_pk, out.len());
        self.save_rows()?;
        Ok(out)
    }

    /// Full-record update: replaces `data` and the caller-recomputed
    /// `search_text`. Partial updates are not supported.
    pub fn update_row(
        &mut self,
        row_pk: i64,
        data: Map<String, Value>,
        search_text: String,
    ) -> Result<bool> {
        match self.rows.iter_mut().find(|r| r.pk == row_pk) {
            Some(row) => {
                row.data = data;
                row.search_text = search_text;
                self.save_rows()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn delete_row(&mut self, row_pk: i64) -> Result<bool> {
        let before = self.rows.len();
        self.rows.retain(|r| r.pk != row_pk);
        if self.rows.len() == before {
            return Ok(false);
        }
        self.save_rows()?;
        Ok(true)
    }
}

/// Thread-safe shared handle over the store.
#[derive(Clone)]
pub struct SharedStore(pub Arc<Mutex<Store>>);

impl SharedStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        Ok(Self(Arc::new(Mutex::new(Store::open(root)?))))
    }
}

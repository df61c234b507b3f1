//!
//! gridbase: a spreadsheet-as-a-database web service.
//!
//! Users define tables with typed columns at runtime, fill them by form or
//! CSV upload, and browse them with search, ordering and pagination. Live
//! table views stay current over WebSocket.
//!
//! Module map:
//! - `storage`: JSON-document row store (users, tables, columns, rows).
//! - `schema`: runtime validation schemas synthesized from column defs.
//! - `datasource`: per-table query builder and CRUD facade.
//! - `ingest`: CSV normalization, type inference and bulk insert.
//! - `controls`: query-parameter parsing and link-control generation.
//! - `broadcast`: fire-and-forget live-update bus.
//! - `server`: Axum HTTP/WS boundary.

pub mod broadcast;
pub mod controls;
pub mod datasource;
pub mod error;
pub mod ingest;
pub mod schema;
pub mod server;
pub mod slug;
pub mod storage;

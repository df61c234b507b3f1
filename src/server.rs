//!
//! gridbase HTTP/WS server
//! -----------------------
//! Axum-based JSON API and WebSocket interface over the datasource layer.
//!
//! Responsibilities:
//! - Dashboard and per-table endpoints: create/list/delete tables, manage
//!   columns, CRUD rows, CSV upload, JSON/CSV export.
//! - Search, ordering and pagination state via query parameters, echoed
//!   back as link-control descriptors for the client.
//! - Session management with a simple cookie model; identities arrive via
//!   an external-auth callback.
//! - WebSocket endpoint for live table views: on every change signal the
//!   handler re-runs the query for its URL parameters and pushes a fresh
//!   context.

use std::{collections::HashMap, net::SocketAddr};

use axum::{
    extract::{
        ws::{Message, WebSocketUpgrade},
        Path, RawQuery, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use getrandom::getrandom;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{error, info};

use crate::broadcast::Broadcast;
use crate::controls::{
    clamp_page, get_column_controls, get_ordering, get_page_controls, get_page_number,
    get_search_term, total_pages, QueryString, PAGE_SIZE,
};
use crate::datasource::{load_datasource, load_datasources, load_datasources_for_user, Datasource};
use crate::error::{AppError, AppResult};
use crate::ingest;
use crate::schema::{new_column_schema, new_table_schema, RawValues};
use crate::slug::{column_identity, slugify};
use crate::storage::{Datatype, SharedStore, UserRecord};

const SESSION_COOKIE: &str = "gridbase_session";

/// Shared server state injected into all handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: SharedStore,
    pub bus: Broadcast,
    /// Session id -> username mapping
    pub sessions: std::sync::Arc<RwLock<HashMap<String, String>>>,
}

fn log_startup(db_root: &str) {
    let cwd = std::env::current_dir().ok();
    let db_env = std::env::var("GRIDBASE_DB_FOLDER").ok();
    info!(
        target: "startup",
        "gridbase starting. cwd={:?}, db_root_param={:?}, GRIDBASE_DB_FOLDER_env={:?}",
        cwd, db_root, db_env
    );
    let db_exists = std::path::Path::new(db_root).exists();
    info!(target: "startup", "Path existence: db_root_exists={}", db_exists);
}

/// Start the gridbase HTTP server bound to the given port, with the row
/// store rooted at `db_root`.
pub async fn run_with_ports(http_port: u16, db_root: &str) -> anyhow::Result<()> {
    log_startup(db_root);

    let store = SharedStore::new(db_root)?;
    {
        let guard = store.0.lock();
        info!(
            target: "startup",
            "Store opened: root='{}' tables={}",
            db_root,
            guard.list_tables().len()
        );
    }

    let app_state = AppState {
        store,
        bus: Broadcast::new(),
        sessions: std::sync::Arc::new(RwLock::new(HashMap::new())),
    };

    let app = router(app_state);

    let addr: SocketAddr = format!("0.0.0.0:{}", http_port).parse()?;
    info!("Starting server on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// All routes over a prepared state. Split out so tests can drive the
/// router without binding a socket.
pub fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(dashboard).post(create_table))
        .route("/users/{username}", get(profile))
        .route("/tables/{table_id}", get(table_view).post(create_row))
        .route("/tables/{table_id}/delete", post(delete_table))
        .route("/tables/{table_id}/columns", get(list_columns).post(create_column))
        .route("/tables/{table_id}/columns/{column_id}/delete", post(delete_column))
        .route("/tables/{table_id}/upload", post(upload_csv))
        .route("/tables/{table_id}/export.json", get(export_json))
        .route("/tables/{table_id}/export.csv", get(export_csv))
        .route("/tables/{table_id}/rows/{row_uuid}", get(row_detail).post(update_row))
        .route("/tables/{table_id}/rows/{row_uuid}/delete", post(delete_row))
        .route("/ws/{table_id}", get(ws_table))
        .route("/auth/callback", post(auth_callback))
        .route("/logout", post(logout))
        .with_state(app_state)
}

// --- Error and form-error responses ---

fn error_response(err: AppError) -> (StatusCode, Json<Value>) {
    let status =
        StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!("request failed: {}", err);
    }
    (status, Json(json!({"status": "error", "code": err.code_str(), "message": err.message()})))
}

fn form_errors(
    status: StatusCode,
    errors: &std::collections::BTreeMap<String, String>,
) -> (StatusCode, Json<Value>) {
    (status, Json(json!({"status": "invalid", "errors": errors})))
}

fn not_found(what: &str) -> (StatusCode, Json<Value>) {
    error_response(AppError::not_found(format!("{}_missing", what), format!("no such {}", what)))
}

// --- Sessions ---

fn parse_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookie = headers.get("cookie").or_else(|| headers.get("Cookie"))?;
    let s = cookie.to_str().ok()?;
    for part in s.split(';') {
        let p = part.trim();
        if let Some(eq) = p.find('=') {
            let (k, v) = p.split_at(eq);
            if k == name {
                return Some(v[1..].to_string());
            }
        }
    }
    None
}

fn new_session_id() -> String {
    let mut bytes = [0u8; 16];
    let _ = getrandom(&mut bytes);
    let mut sid = String::with_capacity(32);
    use std::fmt::Write as _;
    for b in &bytes {
        let _ = write!(&mut sid, "{:02x}", b);
    }
    sid
}

fn set_session_cookie(sid: &str) -> HeaderValue {
    // Hex session ids are always valid header values
    HeaderValue::from_str(&format!(
        "{}={}; HttpOnly; Secure; SameSite=Strict; Path=/",
        SESSION_COOKIE, sid
    ))
    .unwrap()
}

fn clear_session_cookie() -> HeaderValue {
    HeaderValue::from_str(&format!(
        "{}=deleted; Expires=Thu, 01 Jan 1970 00:00:00 GMT; HttpOnly; Secure; SameSite=Strict; Path=/",
        SESSION_COOKIE
    ))
    .unwrap()
}

async fn current_user(state: &AppState, headers: &HeaderMap) -> Option<UserRecord> {
    let sid = parse_cookie(headers, SESSION_COOKIE)?;
    let username = {
        let map = state.sessions.read().await;
        map.get(&sid).cloned()?
    };
    let guard = state.store.0.lock();
    guard.user_by_username(&username)
}

// --- Context rendering ---

fn owner_username(store: &SharedStore, owner: Option<i64>) -> Option<String> {
    let pk = owner?;
    let guard = store.0.lock();
    guard.user_by_pk(pk).map(|u| u.username)
}

fn datasource_summary(ds: &Datasource, count: usize, owner: Option<&str>) -> Value {
    json!({
        "name": ds.name(),
        "identity": ds.table.identity,
        "url": ds.url(),
        "count": count,
        "owner": owner,
    })
}

/// Full render context for one table view: resolved query state, the rows
/// for the current page, and the link controls to move through the set.
/// Shared between the HTTP handler and the WebSocket push path.
async fn table_context(
    store: &SharedStore,
    table_id: &str,
    query: &QueryString,
) -> AppResult<Option<Value>> {
    let Some(ds) = load_datasource(store, table_id).await? else {
        return Ok(None);
    };
    let identities = ds.schema.identities();
    let search_term = get_search_term(query);
    let (order_column, is_reverse) = get_ordering(query, &identities);

    let mut queryset = ds.clone().search(&search_term);
    if let Some(column) = &order_column {
        queryset = queryset.order_by(column, is_reverse);
    }
    let count = queryset.count().await?;
    let pages = total_pages(count, PAGE_SIZE);
    let current_page = clamp_page(get_page_number(query), pages);
    let items = queryset
        .offset((current_page - 1) * PAGE_SIZE)
        .limit(PAGE_SIZE)
        .all()
        .await?;

    let path = ds.url();
    let columns: Vec<(String, String)> = ds
        .columns
        .iter()
        .map(|c| (c.identity.clone(), c.name.clone()))
        .collect();
    let column_controls =
        get_column_controls(&path, query, &columns, order_column.as_deref(), is_reverse);
    let page_controls = get_page_controls(&path, query, current_page, pages);

    let rows: Vec<Value> = items
        .iter()
        .map(|item| {
            json!({
                "uuid": item.uuid(),
                "url": item.url(),
                "delete_url": item.delete_url(),
                "record": item.record(),
            })
        })
        .collect();

    Ok(Some(json!({
        "table": {"name": ds.name(), "identity": ds.table.identity, "url": path},
        "schema": ds.schema,
        "search_term": search_term,
        "order_column": order_column,
        "is_reverse": is_reverse,
        "current_page": current_page,
        "total_pages": pages,
        "count": count,
        "column_controls": column_controls,
        "page_controls": page_controls,
        "rows": rows,
    })))
}

// --- Dashboard and tables ---

async fn dashboard(State(state): State<AppState>) -> impl IntoResponse {
    let datasources = match load_datasources(&state.store).await {
        Ok(ds) => ds,
        Err(e) => return error_response(e),
    };
    let mut tables = Vec::with_capacity(datasources.len());
    for ds in &datasources {
        let count = match ds.count().await {
            Ok(c) => c,
            Err(e) => return error_response(e),
        };
        let owner = owner_username(&state.store, ds.table.owner);
        tables.push(datasource_summary(ds, count, owner.as_deref()));
    }
    (StatusCode::OK, Json(json!({"status": "ok", "tables": tables})))
}

async fn profile(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> impl IntoResponse {
    let user = {
        let guard = state.store.0.lock();
        guard.user_by_username(&username)
    };
    let Some(user) = user else {
        return not_found("user");
    };
    let datasources = match load_datasources_for_user(&state.store, user.pk).await {
        Ok(ds) => ds,
        Err(e) => return error_response(e),
    };
    let mut tables = Vec::with_capacity(datasources.len());
    for ds in &datasources {
        let count = match ds.count().await {
            Ok(c) => c,
            Err(e) => return error_response(e),
        };
        tables.push(datasource_summary(ds, count, Some(&user.username)));
    }
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "user": {
                "username": user.username,
                "display_name": user.display_name,
                "avatar_url": user.avatar_url,
            },
            "tables": tables,
        })),
    )
}

async fn create_table(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(raw): Json<RawValues>,
) -> impl IntoResponse {
    let record = match new_table_schema().validate(&raw) {
        Ok(record) => record,
        Err(errors) => return form_errors(StatusCode::BAD_REQUEST, &errors),
    };
    let name = record.get("name").and_then(Value::as_str).unwrap_or("");
    let identity = slugify(name);
    if identity.is_empty() {
        let mut errors = std::collections::BTreeMap::new();
        errors.insert("name".to_string(), "Must contain letters or numbers.".to_string());
        return form_errors(StatusCode::BAD_REQUEST, &errors);
    }
    let owner = current_user(&state, &headers).await.map(|u| u.pk);

    let mut guard = state.store.0.lock();
    if guard.table_by_identity(&identity).is_some() {
        let mut errors = std::collections::BTreeMap::new();
        errors.insert("name".to_string(), "A table with this name already exists.".to_string());
        return form_errors(StatusCode::CONFLICT, &errors);
    }
    match guard.insert_table(name, &identity, owner) {
        Ok(table) => (
            StatusCode::CREATED,
            Json(json!({"status": "ok", "identity": table.identity, "url": format!("/tables/{}", table.identity)})),
        ),
        Err(e) => error_response(AppError::from(e)),
    }
}

async fn table_view(
    State(state): State<AppState>,
    Path(table_id): Path<String>,
    RawQuery(raw_query): RawQuery,
) -> impl IntoResponse {
    let query = QueryString::parse(raw_query.as_deref().unwrap_or(""));
    match table_context(&state.store, &table_id, &query).await {
        Ok(Some(context)) => (StatusCode::OK, Json(context)),
        Ok(None) => not_found("table"),
        Err(e) => error_response(e),
    }
}

async fn delete_table(
    State(state): State<AppState>,
    Path(table_id): Path<String>,
) -> impl IntoResponse {
    let table = {
        let guard = state.store.0.lock();
        guard.table_by_identity(&table_id)
    };
    let Some(table) = table else {
        return not_found("table");
    };
    let result = {
        let mut guard = state.store.0.lock();
        guard.delete_table(table.pk)
    };
    match result {
        Ok(_) => {
            state.bus.publish(&table_id);
            (StatusCode::OK, Json(json!({"status": "ok"})))
        }
        Err(e) => error_response(AppError::from(e)),
    }
}

// --- Columns ---

async fn list_columns(
    State(state): State<AppState>,
    Path(table_id): Path<String>,
) -> impl IntoResponse {
    let ds = match load_datasource(&state.store, &table_id).await {
        Ok(Some(ds)) => ds,
        Ok(None) => return not_found("table"),
        Err(e) => return error_response(e),
    };
    let columns: Vec<Value> = ds
        .columns
        .iter()
        .map(|c| {
            json!({
                "identity": c.identity,
                "name": c.name,
                "datatype": c.datatype.as_str(),
                "position": c.position,
                "delete_url": format!("/tables/{}/columns/{}/delete", table_id, c.identity),
            })
        })
        .collect();
    (StatusCode::OK, Json(json!({"status": "ok", "columns": columns})))
}

async fn create_column(
    State(state): State<AppState>,
    Path(table_id): Path<String>,
    Json(raw): Json<RawValues>,
) -> impl IntoResponse {
    let record = match new_column_schema().validate(&raw) {
        Ok(record) => record,
        Err(errors) => return form_errors(StatusCode::BAD_REQUEST, &errors),
    };
    let name = record.get("name").and_then(Value::as_str).unwrap_or("");
    let datatype = record
        .get("datatype")
        .and_then(Value::as_str)
        .and_then(Datatype::parse)
        .unwrap_or(Datatype::String);
    let identity = column_identity(name);
    if identity.is_empty() {
        let mut errors = std::collections::BTreeMap::new();
        errors.insert("name".to_string(), "Must contain letters or numbers.".to_string());
        return form_errors(StatusCode::BAD_REQUEST, &errors);
    }

    let mut guard = state.store.0.lock();
    let Some(table) = guard.table_by_identity(&table_id) else {
        return not_found("table");
    };
    if guard.column_by_identity(table.pk, &identity).is_some() {
        let mut errors = std::collections::BTreeMap::new();
        errors.insert("name".to_string(), "A column with this name already exists.".to_string());
        return form_errors(StatusCode::CONFLICT, &errors);
    }
    match guard.insert_column(table.pk, name, &identity, datatype) {
        Ok(column) => {
            drop(guard);
            state.bus.publish(&table_id);
            (
                StatusCode::CREATED,
                Json(json!({"status": "ok", "identity": column.identity, "position": column.position})),
            )
        }
        Err(e) => error_response(AppError::from(e)),
    }
}

async fn delete_column(
    State(state): State<AppState>,
    Path((table_id, column_id)): Path<(String, String)>,
) -> impl IntoResponse {
    let result = {
        let mut guard = state.store.0.lock();
        let Some(table) = guard.table_by_identity(&table_id) else {
            return not_found("table");
        };
        guard.delete_column(table.pk, &column_id)
    };
    match result {
        Ok(true) => {
            state.bus.publish(&table_id);
            (StatusCode::OK, Json(json!({"status": "ok"})))
        }
        Ok(false) => not_found("column"),
        Err(e) => error_response(AppError::from(e)),
    }
}

// --- Rows ---

async fn create_row(
    State(state): State<AppState>,
    Path(table_id): Path<String>,
    Json(raw): Json<RawValues>,
) -> impl IntoResponse {
    let ds = match load_datasource(&state.store, &table_id).await {
        Ok(Some(ds)) => ds,
        Ok(None) => return not_found("table"),
        Err(e) => return error_response(e),
    };
    if ds.schema.is_empty() {
        return error_response(AppError::user("no_columns", "table has no columns yet"));
    }
    let record = match ds.validate(&raw) {
        Ok(record) => record,
        Err(errors) => return form_errors(StatusCode::BAD_REQUEST, &errors),
    };
    match ds.create(&record).await {
        Ok(uuid) => {
            state.bus.publish(&table_id);
            (
                StatusCode::CREATED,
                Json(json!({"status": "ok", "uuid": uuid, "url": format!("/tables/{}/rows/{}", table_id, uuid)})),
            )
        }
        Err(e) => error_response(e),
    }
}

async fn row_detail(
    State(state): State<AppState>,
    Path((table_id, row_uuid)): Path<(String, String)>,
) -> impl IntoResponse {
    let ds = match load_datasource(&state.store, &table_id).await {
        Ok(Some(ds)) => ds,
        Ok(None) => return not_found("table"),
        Err(e) => return error_response(e),
    };
    match ds.filter(&row_uuid).get().await {
        Ok(Some(item)) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "uuid": item.uuid(),
                "record": item.record(),
                "form_values": item.serialize(),
                "url": item.url(),
                "delete_url": item.delete_url(),
            })),
        ),
        Ok(None) => not_found("row"),
        Err(e) => error_response(e),
    }
}

async fn update_row(
    State(state): State<AppState>,
    Path((table_id, row_uuid)): Path<(String, String)>,
    Json(raw): Json<RawValues>,
) -> impl IntoResponse {
    let ds = match load_datasource(&state.store, &table_id).await {
        Ok(Some(ds)) => ds,
        Ok(None) => return not_found("table"),
        Err(e) => return error_response(e),
    };
    let record = match ds.validate(&raw) {
        Ok(record) => record,
        Err(errors) => return form_errors(StatusCode::BAD_REQUEST, &errors),
    };
    let item = match ds.filter(&row_uuid).get().await {
        Ok(Some(item)) => item,
        Ok(None) => return not_found("row"),
        Err(e) => return error_response(e),
    };
    match item.update(&record).await {
        Ok(()) => {
            state.bus.publish(&table_id);
            (StatusCode::OK, Json(json!({"status": "ok", "uuid": row_uuid})))
        }
        Err(e) => error_response(e),
    }
}

async fn delete_row(
    State(state): State<AppState>,
    Path((table_id, row_uuid)): Path<(String, String)>,
) -> impl IntoResponse {
    let ds = match load_datasource(&state.store, &table_id).await {
        Ok(Some(ds)) => ds,
        Ok(None) => return not_found("table"),
        Err(e) => return error_response(e),
    };
    let item = match ds.filter(&row_uuid).get().await {
        Ok(Some(item)) => item,
        Ok(None) => return not_found("row"),
        Err(e) => return error_response(e),
    };
    match item.delete().await {
        Ok(()) => {
            state.bus.publish(&table_id);
            (StatusCode::OK, Json(json!({"status": "ok"})))
        }
        Err(e) => error_response(e),
    }
}

// --- CSV upload and export ---

async fn upload_csv(
    State(state): State<AppState>,
    Path(table_id): Path<String>,
    body: String,
) -> impl IntoResponse {
    let table = {
        let guard = state.store.0.lock();
        guard.table_by_identity(&table_id)
    };
    let Some(table) = table else {
        return not_found("table");
    };
    let rows = match ingest::parse_csv(&body) {
        Ok(rows) => rows,
        Err(e) => return error_response(e),
    };
    match ingest::ingest_rows(&state.store, table.pk, rows) {
        Ok(summary) => {
            state.bus.publish(&table_id);
            (
                StatusCode::CREATED,
                Json(json!({"status": "ok", "columns": summary.columns, "rows": summary.rows})),
            )
        }
        Err(e) => error_response(e),
    }
}

async fn export_json(
    State(state): State<AppState>,
    Path(table_id): Path<String>,
) -> impl IntoResponse {
    let ds = match load_datasource(&state.store, &table_id).await {
        Ok(Some(ds)) => ds,
        Ok(None) => return not_found("table").into_response(),
        Err(e) => return error_response(e).into_response(),
    };
    let items = match ds.clone().all().await {
        Ok(items) => items,
        Err(e) => return error_response(e).into_response(),
    };
    let rows: Vec<Value> = items
        .iter()
        .map(|item| json!({"uuid": item.uuid(), "record": item.record()}))
        .collect();
    (
        StatusCode::OK,
        Json(json!({"table": ds.table.identity, "schema": ds.schema, "rows": rows})),
    )
        .into_response()
}

fn render_csv(ds: &Datasource, items: &[crate::datasource::RowItem]) -> AppResult<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let header: Vec<&str> = ds.columns.iter().map(|c| c.name.as_str()).collect();
    writer
        .write_record(&header)
        .map_err(|e| AppError::internal("csv_encode", e.to_string()))?;
    for item in items {
        let values = item.serialize();
        let cells: Vec<String> = ds
            .schema
            .identities()
            .iter()
            .map(|id| values.get(id).cloned().unwrap_or_default())
            .collect();
        writer
            .write_record(&cells)
            .map_err(|e| AppError::internal("csv_encode", e.to_string()))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| AppError::internal("csv_encode", e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| AppError::internal("csv_encode", e.to_string()))
}

async fn export_csv(
    State(state): State<AppState>,
    Path(table_id): Path<String>,
) -> impl IntoResponse {
    let ds = match load_datasource(&state.store, &table_id).await {
        Ok(Some(ds)) => ds,
        Ok(None) => return not_found("table").into_response(),
        Err(e) => return error_response(e).into_response(),
    };
    let items = match ds.clone().all().await {
        Ok(items) => items,
        Err(e) => return error_response(e).into_response(),
    };
    match render_csv(&ds, &items) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, HeaderValue::from_static("text/csv"))],
            body,
        )
            .into_response(),
        Err(e) => error_response(e).into_response(),
    }
}

// --- Live updates ---

async fn ws_table(
    State(state): State<AppState>,
    Path(table_id): Path<String>,
    RawQuery(raw_query): RawQuery,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let exists = {
        let guard = state.store.0.lock();
        guard.table_by_identity(&table_id).is_some()
    };
    if !exists {
        return not_found("table").into_response();
    }
    let query = QueryString::parse(raw_query.as_deref().unwrap_or(""));
    ws.on_upgrade(move |mut socket| async move {
        let mut signals = state.bus.subscribe(&table_id);
        // Initial snapshot, then one refresh per change signal. A lagged
        // receiver just re-runs the query, so missed signals are harmless.
        loop {
            let context = match table_context(&state.store, &table_id, &query).await {
                Ok(Some(context)) => context,
                // Table deleted while we were watching
                Ok(None) => break,
                Err(e) => {
                    error!("ws refresh failed: {}", e);
                    break;
                }
            };
            if socket.send(Message::Text(context.to_string().into())).await.is_err() {
                break;
            }
            tokio::select! {
                signal = signals.recv() => {
                    if matches!(signal, Err(tokio::sync::broadcast::error::RecvError::Closed)) {
                        break;
                    }
                }
                msg = futures_util::StreamExt::next(&mut socket) => {
                    match msg {
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                        _ => continue,
                    }
                }
            }
        }
        drop(signals);
        state.bus.prune();
    })
}

// --- Auth ---

#[derive(Debug, Deserialize)]
struct AuthCallbackPayload {
    external_id: String,
    username: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    avatar_url: String,
}

/// Completion of an external login flow: the identity provider's verified
/// profile arrives here, the user record is created or refreshed, and a
/// session cookie is issued.
async fn auth_callback(
    State(state): State<AppState>,
    Json(payload): Json<AuthCallbackPayload>,
) -> impl IntoResponse {
    if payload.external_id.is_empty() || payload.username.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            HeaderMap::new(),
            Json(json!({"status": "error", "message": "external_id and username are required"})),
        );
    }
    let user = {
        let mut guard = state.store.0.lock();
        guard.upsert_user(
            &payload.external_id,
            &payload.username,
            &payload.display_name,
            &payload.avatar_url,
        )
    };
    match user {
        Ok(user) => {
            let sid = new_session_id();
            {
                let mut map = state.sessions.write().await;
                map.insert(sid.clone(), user.username.clone());
            }
            let mut headers = HeaderMap::new();
            headers.insert("Set-Cookie", set_session_cookie(&sid));
            (
                StatusCode::OK,
                headers,
                Json(json!({"status": "ok", "username": user.username})),
            )
        }
        Err(e) => {
            let err = AppError::from(e);
            error!("auth callback failed: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                HeaderMap::new(),
                Json(json!({"status": "error", "message": err.message()})),
            )
        }
    }
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Some(sid) = parse_cookie(&headers, SESSION_COOKIE) {
        let mut map = state.sessions.write().await;
        map.remove(&sid);
    }
    let mut h = HeaderMap::new();
    h.insert("Set-Cookie", clear_session_cookie());
    (StatusCode::OK, h, Json(json!({"status": "ok"})))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cookie_finds_named_value() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "cookie",
            HeaderValue::from_static("other=1; gridbase_session=abc123; more=2"),
        );
        assert_eq!(parse_cookie(&headers, SESSION_COOKIE), Some("abc123".to_string()));
        assert_eq!(parse_cookie(&headers, "absent"), None);
    }

    #[tokio::test]
    async fn dashboard_summary_includes_owner() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SharedStore::new(tmp.path()).unwrap();
        {
            let mut guard = store.0.lock();
            let user = guard.upsert_user("gh-1", "tom", "Tom", "").unwrap();
            guard.insert_table("Budget", "budget", Some(user.pk)).unwrap();
            guard.insert_table("Shared", "shared", None).unwrap();
        }
        let ds = load_datasource(&store, "budget").await.unwrap().unwrap();
        let owner = owner_username(&store, ds.table.owner);
        let summary = datasource_summary(&ds, 0, owner.as_deref());
        assert_eq!(summary["owner"], json!("tom"));
        assert_eq!(summary["url"], json!("/tables/budget"));

        let ds = load_datasource(&store, "shared").await.unwrap().unwrap();
        let owner = owner_username(&store, ds.table.owner);
        let summary = datasource_summary(&ds, 0, owner.as_deref());
        assert_eq!(summary["owner"], json!(null));
    }

    #[test]
    fn session_ids_are_hex_and_unique() {
        let a = new_session_id();
        let b = new_session_id();
        assert_eq!(a.len(), 32);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}

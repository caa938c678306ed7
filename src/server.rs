use axum::{
    async_trait,
    body::Body,
    extract::{rejection::JsonRejection, FromRequest, Path, Query, Request, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::TryStreamExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::commands::{ExportRequest, QueryRequest, QueryService};
use crate::error::Error;
use crate::storage::AuditLog;

const DEFAULT_LOG_LIMIT: usize = 50;
const MAX_LOG_LIMIT: usize = 500;

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<QueryService>,
    pub audit_log: Option<Arc<AuditLog>>,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            error!(error = %self, "request failed");
        }
        let mut body = json!({
            "success": false,
            "error": self.to_string(),
            "executed": false,
        });
        if let Some(sql) = self.sql() {
            body["sql"] = json!(sql);
        }
        (status, Json(body)).into_response()
    }
}

/// `Json` whose rejections use the API error body instead of axum's plain-text 4xx.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(body_error(rejection)),
        }
    }
}

fn body_error(rejection: JsonRejection) -> Error {
    Error::validation(format!("Invalid request body: {}", rejection.body_text()))
}

fn not_found(message: impl Into<String>) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "success": false, "error": message.into() })),
    )
        .into_response()
}

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn run_query(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<QueryRequest>,
) -> Result<Response, Error> {
    let response = state.service.run_query(request).await?;
    Ok(Json(response).into_response())
}

async fn export_csv(
    State(state): State<AppState>,
    ApiJson(request): ApiJson<ExportRequest>,
) -> Result<Response, Error> {
    let export = state.service.export(request).await?;
    info!(filename = %export.filename, "streaming CSV export");

    let lines = export
        .lines
        .inspect_err(|e| error!(error = %e, "CSV export aborted mid-stream"));

    let disposition = format!("attachment; filename=\"{}\"", export.filename);
    Ok((
        [
            (header::CONTENT_TYPE, "text/csv; charset=utf-8".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
            (
                header::CACHE_CONTROL,
                "no-cache, no-store, must-revalidate".to_string(),
            ),
        ],
        Body::from_stream(lines),
    )
        .into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SchemaParams {
    #[serde(default)]
    compact: Option<String>,
    #[serde(default)]
    max_tables: Option<usize>,
}

fn truthy(value: Option<&str>) -> bool {
    matches!(
        value.map(|v| v.trim().to_ascii_lowercase()).as_deref(),
        Some("1" | "true" | "yes" | "on")
    )
}

async fn get_schema(
    State(state): State<AppState>,
    Query(params): Query<SchemaParams>,
) -> Result<Response, Error> {
    let view = state
        .service
        .schema(truthy(params.compact.as_deref()), params.max_tables)
        .await?;
    Ok(Json(view).into_response())
}

async fn get_table_columns(
    State(state): State<AppState>,
    Path(table): Path<String>,
) -> Result<Response, Error> {
    match state.service.table_columns(&table).await? {
        Some(columns) => Ok(Json(columns).into_response()),
        None => Ok(not_found(format!("Table '{}' does not exist", table))),
    }
}

#[derive(Debug, Default, Deserialize)]
struct LogParams {
    #[serde(default)]
    limit: Option<usize>,
}

async fn get_log(State(state): State<AppState>, Query(params): Query<LogParams>) -> Response {
    let Some(log) = &state.audit_log else {
        return not_found("Audit log is disabled");
    };
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LOG_LIMIT)
        .clamp(1, MAX_LOG_LIMIT);
    match log.recent(limit).await {
        Ok(entries) => Json(entries).into_response(),
        Err(e) => {
            error!(error = %e, "failed to read audit log");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/query", post(run_query))
        .route("/api/export", post(export_csv))
        .route("/api/schema", get(get_schema))
        .route("/api/schema/tables/:table/columns", get(get_table_columns))
        .route("/api/log", get(get_log))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    host: &str,
    port: u16,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "sqlscout listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use snipvault_api::{
    access_error, MigrateResult, SessionInfo, SnipVaultApi, SnippetRef, TokenTableResolver,
    API_CONTRACT_VERSION,
};
use snipvault_core::{AccessError, CallerContext, NewSnippet, Snippet, SnippetId, SnippetPatch};
use snipvault_store_sqlite::SchemaStatus;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "service.v1";
const OPENAPI_YAML: &str = include_str!("../../../openapi/openapi.yaml");
const DEFAULT_LOG_FILTER: &str = "snipvault=info,tower_http=info";

#[derive(Debug, Clone)]
struct ServiceState {
    api: Arc<SnipVaultApi<TokenTableResolver>>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    api_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    #[serde(skip)]
    status: StatusCode,
    service_contract_version: &'static str,
    code: &'static str,
    error: String,
}

#[derive(Debug, Clone, Deserialize)]
struct MigrateRequest {
    dry_run: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct ListQuery {
    category: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "snipvault-service")]
#[command(about = "HTTP service for owner-scoped SnipVault snippets")]
struct Args {
    #[arg(long, env = "SNIPVAULT_DB", default_value = "./snipvault.sqlite3")]
    db: PathBuf,
    #[arg(long, env = "SNIPVAULT_BIND", default_value = "127.0.0.1:4010")]
    bind: SocketAddr,
    /// JSON token table: `{ "tokens": { "<bearer token>": "<principal id>" } }`.
    #[arg(long, env = "SNIPVAULT_PRINCIPALS")]
    principals: PathBuf,
    #[arg(long, env = "SNIPVAULT_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status;
        (status, Json(self)).into_response()
    }
}

impl ServiceError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            service_contract_version: SERVICE_CONTRACT_VERSION,
            code,
            error: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }
}

impl From<anyhow::Error> for ServiceError {
    fn from(err: anyhow::Error) -> Self {
        let (status, code) = match access_error(&err) {
            Some(AccessError::Unauthenticated) => (StatusCode::UNAUTHORIZED, "unauthenticated"),
            Some(AccessError::AccessDenied(_)) => (StatusCode::FORBIDDEN, "access_denied"),
            Some(AccessError::NotFound(_)) => (StatusCode::NOT_FOUND, "not_found"),
            Some(AccessError::Validation(_)) => (StatusCode::UNPROCESSABLE_ENTITY, "validation"),
            Some(AccessError::Store(_)) | None => {
                tracing::error!(error = %format!("{err:#}"), "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
        };
        Self::new(status, code, err.to_string())
    }
}

impl From<JsonRejection> for ServiceError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        api_contract_version: API_CONTRACT_VERSION,
        data,
    }
}

/// Build the caller context from an `Authorization: Bearer <token>` header.
/// Missing or malformed headers yield an anonymous caller.
fn caller(headers: &HeaderMap) -> CallerContext {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split_once(' '))
        .filter(|(scheme, _)| scheme.eq_ignore_ascii_case("bearer"))
        .map(|(_, token)| token.trim())
        .filter(|token| !token.is_empty());
    token.map_or_else(CallerContext::anonymous, CallerContext::with_credential)
}

fn parse_snippet_id(raw: &str) -> Result<SnippetId, ServiceError> {
    raw.parse::<SnippetId>()
        .map_err(|err| ServiceError::bad_request(format!("invalid snippet id {raw}: {err}")))
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/openapi", get(openapi))
        .route("/v1/session", get(session))
        .route("/v1/snippets", get(snippets_list).post(snippets_create))
        .route(
            "/v1/snippets/:id",
            get(snippets_get).patch(snippets_update).delete(snippets_delete),
        )
        .route("/v1/categories", get(categories_list))
        .route("/v1/db/schema-version", post(db_schema_version))
        .route("/v1/db/migrate", post(db_migrate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let resolver = TokenTableResolver::load(&args.principals)?;
    let api = SnipVaultApi::new(args.db, resolver);
    api.migrate(false).context("failed to migrate database at startup")?;
    tracing::info!(db = %api.db_path().display(), "database ready");

    let state = ServiceState { api: Arc::new(api) };
    let listener = tokio::net::TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("failed to bind {}", args.bind))?;
    tracing::info!(bind = %args.bind, "snipvault service listening");
    axum::serve(listener, app(state)).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn health() -> Json<ServiceEnvelope<HealthResponse>> {
    Json(envelope(HealthResponse { status: "ok" }))
}

async fn openapi() -> impl IntoResponse {
    (StatusCode::OK, [("content-type", "application/yaml; charset=utf-8")], OPENAPI_YAML)
}

async fn session(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<SessionInfo>>, ServiceError> {
    let session = state.api.whoami(&caller(&headers))?;
    Ok(Json(envelope(session)))
}

async fn snippets_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<ServiceEnvelope<Vec<Snippet>>>, ServiceError> {
    let snippets = state.api.list_snippets(&caller(&headers), query.category.as_deref())?;
    Ok(Json(envelope(snippets)))
}

async fn snippets_create(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<NewSnippet>, JsonRejection>,
) -> Result<(StatusCode, Json<ServiceEnvelope<SnippetRef>>), ServiceError> {
    let ctx = caller(&headers);
    // Identity first, so anonymous callers see 401 rather than a request error.
    state.api.whoami(&ctx)?;
    let Json(request) = payload?;
    let created = state.api.create_snippet(&ctx, request)?;
    Ok((StatusCode::CREATED, Json(envelope(created))))
}

async fn snippets_get(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
) -> Result<Json<ServiceEnvelope<Option<Snippet>>>, ServiceError> {
    let ctx = caller(&headers);
    state.api.whoami(&ctx)?;
    let id = parse_snippet_id(&raw_id)?;
    let snippet = state.api.get_snippet(&ctx, id)?;
    Ok(Json(envelope(snippet)))
}

async fn snippets_update(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
    payload: Result<Json<SnippetPatch>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<SnippetRef>>, ServiceError> {
    let ctx = caller(&headers);
    state.api.whoami(&ctx)?;
    let id = parse_snippet_id(&raw_id)?;
    let Json(patch) = payload?;
    let updated = state.api.update_snippet(&ctx, id, patch)?;
    Ok(Json(envelope(updated)))
}

async fn snippets_delete(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    Path(raw_id): Path<String>,
) -> Result<Json<ServiceEnvelope<SnippetRef>>, ServiceError> {
    let ctx = caller(&headers);
    state.api.whoami(&ctx)?;
    let id = parse_snippet_id(&raw_id)?;
    let deleted = state.api.delete_snippet(&ctx, id)?;
    Ok(Json(envelope(deleted)))
}

async fn categories_list(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<Vec<String>>>, ServiceError> {
    let categories = state.api.list_categories(&caller(&headers))?;
    Ok(Json(envelope(categories)))
}

async fn db_schema_version(
    State(state): State<ServiceState>,
    headers: HeaderMap,
) -> Result<Json<ServiceEnvelope<SchemaStatus>>, ServiceError> {
    state.api.whoami(&caller(&headers))?;
    let status = state.api.schema_status()?;
    Ok(Json(envelope(status)))
}

async fn db_migrate(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<MigrateRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<MigrateResult>>, ServiceError> {
    state.api.whoami(&caller(&headers))?;
    let Json(request) = payload?;
    let result = state.api.migrate(request.dry_run)?;
    Ok(Json(envelope(result)))
}

use std::{env, net::SocketAddr, sync::Arc, time::Duration};

use crate::auth::{AuthError, SharedSecretAuth};
use crate::telemetry::LogFormat;
use anyhow::{Context, Result};
use axum::{
    extract::{Query, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    routing::post,
    Json, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::{error, info, info_span, warn, Level};
use utoipa::{IntoParams, OpenApi, ToSchema};
use uuid::Uuid;

use warden_core::docker::DockerDriver;
use warden_core::object_store::ObjectStoreGateway;
use warden_core::tasks::BackgroundTasks;
use warden_core::{
    validate_user_id, CreateSandboxRequest, ExecRequest, ExecResult, Orchestrator,
    OrchestratorConfig, OrchestratorError,
};
use warden_store::memory::MemoryStore;
use warden_store::postgres::PostgresStore;
use warden_store::{SandboxRecord, SandboxStore, StopReason};

/// Header carrying the end-user identity forwarded by the calling service.
/// The shared-secret API key authenticates the service itself.
const USER_HEADER: &str = "X-User-Id";

pub async fn run(config: AppConfig) -> Result<()> {
    let store: Arc<dyn SandboxStore> = match config.store_backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("WARDEN_DATABASE_URL is required for the postgres backend")?;
            Arc::new(
                PostgresStore::connect(url)
                    .await
                    .context("failed to open registry database")?,
            )
        }
    };

    let driver = Arc::new(
        DockerDriver::connect(config.exec_user.clone())
            .map_err(|err| anyhow::anyhow!("container engine: {err}"))?,
    );

    if config.bucket.is_empty() {
        warn!("no object store bucket configured; sandboxes start without hot/cold tiers");
    } else {
        let gateway =
            ObjectStoreGateway::connect(config.bucket.clone(), config.region.clone()).await;
        gateway
            .verify_bucket()
            .await
            .context("object store verification failed")?;
    }

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        driver,
        config.orchestrator_config(),
    ));

    // Converge registry and engine once before accepting traffic, so a
    // crashed predecessor's drift is repaired immediately.
    orchestrator.reconcile_once().await;

    let tasks = BackgroundTasks::spawn(
        orchestrator.clone(),
        config.reconcile_interval,
        config.expiry_interval,
    );

    let state = Arc::new(AppState {
        orchestrator,
        auth: SharedSecretAuth::new(config.api_key.clone(), config.api_key_header.clone()),
    });
    let app = build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind listen socket")?;

    info!(%addr, "warden-daemon listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server exited")?;

    tasks.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

fn build_router(state: Arc<AppState>) -> Router {
    let protected = Router::new()
        .route("/sandboxes", post(create_sandbox).get(list_sandboxes))
        .route(
            "/sandboxes/:id",
            get(get_sandbox).delete(destroy_sandbox),
        )
        .route("/sandboxes/:id/exec", post(exec_in_sandbox))
        .route("/sandboxes/:id/heartbeat", post(heartbeat))
        .route("/sandboxes/:id/complete", post(mark_complete))
        .route("/sandboxes/:id/error", post(mark_error))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request| {
                    info_span!(
                        "http",
                        method = %request.method(),
                        path = %request.uri().path(),
                        user_id = tracing::field::Empty,
                        sandbox_id = tracing::field::Empty,
                    )
                })
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .with_state(state)
}

struct AppState {
    orchestrator: Arc<Orchestrator>,
    auth: SharedSecretAuth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub api_key: Option<String>,
    pub api_key_header: String,
    pub sandbox_image: String,
    pub bucket: String,
    pub region: String,
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub default_ttl_seconds: i64,
    pub exec_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub reconcile_interval: Duration,
    pub expiry_interval: Duration,
    pub exec_user: String,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let host = env::var("WARDEN_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = parse_env("WARDEN_PORT", 8080u16)?;

        let api_key = env::var("WARDEN_API_KEY").ok();
        let api_key_header =
            env::var("WARDEN_API_KEY_HEADER").unwrap_or_else(|_| "X-API-Key".to_string());

        let sandbox_image = env::var("WARDEN_SANDBOX_IMAGE")
            .unwrap_or_else(|_| "warden-sandbox:latest".to_string());
        let bucket = env::var("WARDEN_S3_BUCKET").unwrap_or_default();
        let region = env::var("WARDEN_S3_REGION").unwrap_or_else(|_| "us-east-1".to_string());

        let store_backend = match env::var("WARDEN_STORE_BACKEND").as_deref() {
            Err(_) | Ok("memory") => StoreBackend::Memory,
            Ok("postgres") => StoreBackend::Postgres,
            Ok(other) => anyhow::bail!("WARDEN_STORE_BACKEND must be 'memory' or 'postgres', got '{other}'"),
        };
        let database_url = env::var("WARDEN_DATABASE_URL").ok();
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            anyhow::bail!("WARDEN_DATABASE_URL is required when WARDEN_STORE_BACKEND=postgres");
        }

        let default_ttl_seconds = parse_env("WARDEN_DEFAULT_TTL_SECONDS", 7_200i64)?;
        let exec_timeout =
            Duration::from_secs(parse_env("WARDEN_EXEC_TIMEOUT_SECONDS", 300u64)?);
        let shutdown_timeout =
            Duration::from_secs(parse_env("WARDEN_SHUTDOWN_TIMEOUT_SECONDS", 30u64)?);
        let reconcile_interval =
            Duration::from_secs(parse_env("WARDEN_RECONCILE_INTERVAL_SECONDS", 30u64)?);
        let expiry_interval =
            Duration::from_secs(parse_env("WARDEN_EXPIRY_INTERVAL_SECONDS", 60u64)?);

        let exec_user = env::var("WARDEN_EXEC_USER").unwrap_or_else(|_| "agent".to_string());
        let log_level = env::var("WARDEN_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let log_format = env::var("WARDEN_LOG_FORMAT")
            .unwrap_or_else(|_| "text".to_string())
            .parse()?;

        Ok(Self {
            host,
            port,
            api_key,
            api_key_header,
            sandbox_image,
            bucket,
            region,
            store_backend,
            database_url,
            default_ttl_seconds,
            exec_timeout,
            shutdown_timeout,
            reconcile_interval,
            expiry_interval,
            exec_user,
            log_level,
            log_format,
        })
    }

    fn orchestrator_config(&self) -> OrchestratorConfig {
        let mut config = OrchestratorConfig::new(
            self.sandbox_image.clone(),
            self.bucket.clone(),
            self.region.clone(),
        );
        config.default_ttl_seconds = self.default_ttl_seconds;
        config.exec_timeout = self.exec_timeout;
        config.shutdown_timeout = self.shutdown_timeout;
        config
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid {key}: {err}")),
        Err(_) => Ok(default),
    }
}

async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    state.auth.authorize(request.headers())?;
    Ok(next.run(request).await)
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is healthy", body = HealthResponse))
)]
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[utoipa::path(
    post,
    path = "/sandboxes",
    request_body = CreateSandboxBody,
    responses(
        (status = 201, description = "Sandbox provisioned and ready", body = SandboxResponse),
        (status = 422, description = "Invalid request", body = ErrorBody),
        (status = 503, description = "Engine or store unavailable", body = ErrorBody)
    ),
    security(("apiKey" = []))
)]
async fn create_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateSandboxBody>,
) -> Result<(StatusCode, Json<SandboxResponse>), ApiError> {
    if let Some(header_user) = optional_user(&headers)? {
        if header_user != body.user_id {
            return Err(ApiError::validation(format!(
                "user_id in body does not match {USER_HEADER} header"
            )));
        }
    }

    let record = state
        .orchestrator
        .create_sandbox(CreateSandboxRequest {
            user_id: body.user_id,
            ttl_seconds: body.ttl_seconds,
            config: body.config,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(record.into())))
}

#[utoipa::path(
    get,
    path = "/sandboxes",
    responses(
        (status = 200, description = "Caller's sandboxes", body = [SandboxResponse]),
        (status = 422, description = "Missing or invalid user header", body = ErrorBody)
    ),
    security(("apiKey" = []))
)]
async fn list_sandboxes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<SandboxResponse>>, ApiError> {
    let user = require_user(&headers)?;
    let records = state.orchestrator.list_sandboxes(&user).await?;
    Ok(Json(records.into_iter().map(SandboxResponse::from).collect()))
}

#[utoipa::path(
    get,
    path = "/sandboxes/{id}",
    params(("id" = String, Path, description = "Sandbox identifier")),
    responses(
        (status = 200, description = "Sandbox details", body = SandboxResponse),
        (status = 404, description = "Not found or not owned by caller", body = ErrorBody)
    ),
    security(("apiKey" = []))
)]
async fn get_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Json<SandboxResponse>, ApiError> {
    let sandbox_id = parse_sandbox_id(&id)?;
    let user = require_user(&headers)?;
    let record = state.orchestrator.get_sandbox(sandbox_id, &user).await?;
    Ok(Json(record.into()))
}

#[utoipa::path(
    post,
    path = "/sandboxes/{id}/exec",
    params(("id" = String, Path, description = "Sandbox identifier")),
    request_body = ExecBody,
    responses(
        (status = 200, description = "Command result", body = ExecResponse),
        (status = 404, description = "Not found or not owned by caller", body = ErrorBody),
        (status = 409, description = "Sandbox is not ready or running", body = ErrorBody),
        (status = 504, description = "Command deadline exceeded", body = ErrorBody)
    ),
    security(("apiKey" = []))
)]
async fn exec_in_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    axum::extract::Path(id): axum::extract::Path<String>,
    Json(body): Json<ExecBody>,
) -> Result<Json<ExecResponse>, ApiError> {
    let sandbox_id = parse_sandbox_id(&id)?;
    let user = require_user(&headers)?;

    let result = state
        .orchestrator
        .exec_in_sandbox(
            sandbox_id,
            &user,
            ExecRequest {
                command: body.command,
                cwd: body.cwd,
                timeout: body.timeout_seconds.map(Duration::from_secs),
            },
        )
        .await?;
    Ok(Json(result.into()))
}

#[utoipa::path(
    post,
    path = "/sandboxes/{id}/heartbeat",
    params(("id" = String, Path, description = "Sandbox identifier")),
    responses(
        (status = 200, description = "Heartbeat recorded", body = OkResponse),
        (status = 404, description = "Not found or not owned by caller", body = ErrorBody)
    ),
    security(("apiKey" = []))
)]
async fn heartbeat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> Result<Json<OkResponse>, ApiError> {
    let sandbox_id = parse_sandbox_id(&id)?;
    let user = require_user(&headers)?;
    state.orchestrator.heartbeat(sandbox_id, &user).await?;
    Ok(Json(OkResponse { ok: true }))
}

#[utoipa::path(
    post,
    path = "/sandboxes/{id}/complete",
    params(("id" = String, Path, description = "Sandbox identifier")),
    request_body = CompleteBody,
    responses(
        (status = 200, description = "Completion recorded", body = OkResponse),
        (status = 404, description = "Not found or not owned by caller", body = ErrorBody)
    ),
    security(("apiKey" = []))
)]
async fn mark_complete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    axum::extract::Path(id): axum::extract::Path<String>,
    Json(body): Json<CompleteBody>,
) -> Result<Json<OkResponse>, ApiError> {
    let sandbox_id = parse_sandbox_id(&id)?;
    let user = require_user(&headers)?;
    state
        .orchestrator
        .mark_complete(sandbox_id, &user, body.result)
        .await?;
    Ok(Json(OkResponse { ok: true }))
}

#[utoipa::path(
    post,
    path = "/sandboxes/{id}/error",
    params(("id" = String, Path, description = "Sandbox identifier")),
    request_body = ErrorReportBody,
    responses(
        (status = 200, description = "Error recorded", body = OkResponse),
        (status = 404, description = "Not found or not owned by caller", body = ErrorBody)
    ),
    security(("apiKey" = []))
)]
async fn mark_error(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    axum::extract::Path(id): axum::extract::Path<String>,
    Json(body): Json<ErrorReportBody>,
) -> Result<Json<OkResponse>, ApiError> {
    let sandbox_id = parse_sandbox_id(&id)?;
    let user = require_user(&headers)?;
    state
        .orchestrator
        .mark_error(sandbox_id, &user, body.message, body.details)
        .await?;
    Ok(Json(OkResponse { ok: true }))
}

#[utoipa::path(
    delete,
    path = "/sandboxes/{id}",
    params(
        ("id" = String, Path, description = "Sandbox identifier"),
        DestroyQuery
    ),
    responses(
        (status = 200, description = "Terminal sandbox record", body = SandboxResponse),
        (status = 404, description = "Not found or not owned by caller", body = ErrorBody)
    ),
    security(("apiKey" = []))
)]
async fn destroy_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    axum::extract::Path(id): axum::extract::Path<String>,
    Query(query): Query<DestroyQuery>,
) -> Result<Json<SandboxResponse>, ApiError> {
    let sandbox_id = parse_sandbox_id(&id)?;
    let user = require_user(&headers)?;
    let record = state
        .orchestrator
        .destroy_sandbox(
            sandbox_id,
            Some(&user),
            query.graceful.unwrap_or(true),
            StopReason::UserRequested,
        )
        .await?;
    Ok(Json(record.into()))
}

fn require_user(headers: &HeaderMap) -> Result<String, ApiError> {
    optional_user(headers)?
        .ok_or_else(|| ApiError::validation(format!("missing {USER_HEADER} header")))
}

fn optional_user(headers: &HeaderMap) -> Result<Option<String>, ApiError> {
    let Some(raw) = headers.get(USER_HEADER) else {
        return Ok(None);
    };
    let user = raw
        .to_str()
        .map_err(|_| ApiError::validation(format!("invalid {USER_HEADER} header encoding")))?
        .to_string();
    validate_user_id(&user)?;
    tracing::Span::current().record("user_id", tracing::field::display(&user));
    Ok(Some(user))
}

fn parse_sandbox_id(raw: &str) -> Result<Uuid, ApiError> {
    let id = Uuid::parse_str(raw)
        .map_err(|_| ApiError::validation(format!("'{raw}' is not a valid sandbox id")))?;
    tracing::Span::current().record("sandbox_id", tracing::field::display(&id));
    Ok(id)
}

#[derive(Debug, Serialize, ToSchema)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
struct CreateSandboxBody {
    user_id: String,
    #[serde(default)]
    ttl_seconds: Option<i64>,
    #[serde(default)]
    config: Option<Value>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
struct ExecBody {
    command: String,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
struct CompleteBody {
    #[serde(default)]
    result: Option<Value>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
struct ErrorReportBody {
    message: String,
    #[serde(default)]
    details: Option<Value>,
}

#[derive(Debug, Deserialize, IntoParams)]
struct DestroyQuery {
    graceful: Option<bool>,
}

#[derive(Debug, Serialize, ToSchema)]
struct OkResponse {
    ok: bool,
}

#[derive(Debug, Serialize, ToSchema)]
struct SandboxResponse {
    sandbox_id: Uuid,
    user_id: String,
    container_id: Option<String>,
    status: String,
    hot_path: String,
    cold_path: String,
    cwd: String,
    config: Value,
    ttl_seconds: i64,
    expires_at: Option<String>,
    /// Remaining lease, clamped at zero; absent until the lease is armed.
    expires_in_seconds: Option<i64>,
    last_heartbeat_at: Option<String>,
    stopped_at: Option<String>,
    stop_reason: Option<String>,
    created_at: String,
    updated_at: String,
}

impl From<SandboxRecord> for SandboxResponse {
    fn from(record: SandboxRecord) -> Self {
        let expires_in_seconds = record
            .expires_at
            .map(|deadline| (deadline - Utc::now()).num_seconds().max(0));

        Self {
            sandbox_id: record.sandbox_id,
            user_id: record.user_id,
            container_id: record.container_id,
            status: record.status.as_str().to_string(),
            hot_path: record.hot_path,
            cold_path: record.cold_path,
            cwd: record.cwd,
            config: record.config,
            ttl_seconds: record.ttl_seconds,
            expires_at: record.expires_at.map(|ts| ts.to_rfc3339()),
            expires_in_seconds,
            last_heartbeat_at: record.last_heartbeat_at.map(|ts| ts.to_rfc3339()),
            stopped_at: record.stopped_at.map(|ts| ts.to_rfc3339()),
            stop_reason: record.stop_reason.map(|reason| reason.as_str().to_string()),
            created_at: record.created_at.to_rfc3339(),
            updated_at: record.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct ExecResponse {
    exit_code: Option<i64>,
    stdout: String,
    stderr: String,
    cwd: String,
}

impl From<ExecResult> for ExecResponse {
    fn from(result: ExecResult) -> Self {
        Self {
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
            cwd: result.cwd,
        }
    }
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorDetail {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<Uuid>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
    correlation_id: Option<Uuid>,
}

impl ApiError {
    fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
            correlation_id: None,
        }
    }

    fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "validation", message)
    }

    /// 500 with a correlation id; the full error is logged, the caller only
    /// sees the id.
    fn internal(err: impl std::fmt::Display) -> Self {
        let correlation_id = Uuid::new_v4();
        error!(%correlation_id, error = %err, "internal error");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "internal",
            message: "internal error".to_string(),
            correlation_id: Some(correlation_id),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::Validation(message) => ApiError::validation(message),
            OrchestratorError::NotFound(id) => ApiError::new(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("sandbox {id} not found"),
            ),
            OrchestratorError::Conflict(id) => ApiError::new(
                StatusCode::CONFLICT,
                "conflict",
                format!("sandbox {id} already exists"),
            ),
            OrchestratorError::InvalidState { sandbox_id, status } => ApiError::new(
                StatusCode::CONFLICT,
                "invalid_state",
                format!("sandbox {sandbox_id} is {status}"),
            ),
            OrchestratorError::EngineUnavailable(inner) => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "engine_unavailable",
                inner.to_string(),
            ),
            OrchestratorError::Timeout(deadline) => ApiError::new(
                StatusCode::GATEWAY_TIMEOUT,
                "timeout",
                format!("operation timed out after {deadline:?}"),
            ),
            OrchestratorError::StoreUnavailable(inner) => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
                inner.to_string(),
            ),
            OrchestratorError::Internal(inner) => ApiError::internal(inner),
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingKey => ApiError::new(
                StatusCode::UNAUTHORIZED,
                "unauthenticated",
                "missing API key",
            ),
            AuthError::WrongKey => {
                ApiError::new(StatusCode::FORBIDDEN, "forbidden", "invalid API key")
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: ErrorDetail {
                kind: self.kind.to_string(),
                message: self.message,
                correlation_id: self.correlation_id,
            },
        });
        (self.status, body).into_response()
    }
}

pub mod docs {
    use super::*;
    use utoipa::openapi::security::{ApiKey, ApiKeyValue, SecurityScheme};
    use utoipa::Modify;

    #[derive(OpenApi)]
    #[openapi(
        info(title = "Warden API", version = "0.1.0"),
        paths(
            health,
            create_sandbox,
            list_sandboxes,
            get_sandbox,
            exec_in_sandbox,
            heartbeat,
            mark_complete,
            mark_error,
            destroy_sandbox
        ),
        components(schemas(
            HealthResponse,
            CreateSandboxBody,
            ExecBody,
            CompleteBody,
            ErrorReportBody,
            OkResponse,
            SandboxResponse,
            ExecResponse,
            ErrorBody,
            ErrorDetail
        )),
        modifiers(&SecurityAddon)
    )]
    pub struct ApiDoc;

    struct SecurityAddon;

    impl Modify for SecurityAddon {
        fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
            if let Some(components) = openapi.components.as_mut() {
                components.add_security_scheme(
                    "apiKey",
                    SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new("X-API-Key"))),
                );
            }
        }
    }
}

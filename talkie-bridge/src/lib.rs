mod adapters;
mod app;
pub mod auth;
pub mod crypto;
mod domain;
pub mod matcher;
mod ports;
mod telemetry;

pub use app::pairing::ApprovalPolicy;
pub use auth::AuthMode;
pub use domain::devices::DevicePublicKey;
pub use domain::matching::{TerminalDescriptor, TerminalFingerprint};
pub use domain::sessions::Session;

use adapters::delivery::{
    ClaudeCliInvoker, HttpUiAutomationClient, IoregScreenLockProbe, NeverLocked,
};
use adapters::devices::FileDeviceRegistry;
use adapters::matching::FileMappingRepository;
use adapters::process::TokioCommandRunner;
use adapters::sessions::{FsSessionStore, PgrepAgentProbe};
use anyhow::Context;
use app::delivery::{DeliveryConfig, DeliveryError, DeliveryRouter};
use app::matching::{MatchService, MatchServiceError};
use app::pairing::{DeviceCounts, PairOutcome, PairingError, PairingService};
use app::sessions::{CacheConfig, CacheStatus, EngagementCache};
use auth::{AuthenticatedDevice, MAX_SIGNED_BODY_BYTES};
use axum::extract::{DefaultBodyLimit, Path as RoutePath, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use axum::{middleware, Extension, Json, Router};
use chrono::{DateTime, Utc};
use crypto::CryptoStore;
use dirs::config_dir;
use domain::delivery::{DeliveryMode, DeliveryPayload, ModeReason};
use domain::devices::Device;
use domain::matching::{MatchReport, MatchResult};
use matcher::FuzzyMatcher;
use ports::clock::{Clock, SystemClock};
use ports::delivery::ScreenLockProbe;
use ports::devices::DeviceRepository;
use ports::process::CommandRunner;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use telemetry::BridgeMetrics;
use tokio::fs;
use tokio::net::TcpListener;
use tokio::signal::ctrl_c;
use tracing::{info, warn};

const DEVICES_FILE: &str = "devices.json";
const MAPPINGS_FILE: &str = "terminal_mappings.json";
const DISCOVERY_FILE: &str = "bridge.json";

type Pairing = PairingService<dyn DeviceRepository>;

#[derive(Debug, Clone)]
pub struct Settings {
    pub listen: SocketAddr,
    pub state_dir: PathBuf,
    pub projects_dir: PathBuf,
    pub ui_automation_url: String,
    /// Binary resumed for headless delivery.
    pub agent_cli: String,
    /// Process name whose presence marks sessions live.
    pub agent_process: String,
    pub approval: ApprovalPolicy,
    pub auth_mode: AuthMode,
    /// Zero disables pruning.
    pub device_ttl_days: i64,
    pub otlp_endpoint: Option<String>,
    pub write_discovery: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8765)),
            state_dir: default_state_dir(),
            projects_dir: default_projects_dir(),
            ui_automation_url: "http://127.0.0.1:8766".to_string(),
            agent_cli: "claude".to_string(),
            agent_process: "claude".to_string(),
            approval: ApprovalPolicy::AutoApprove,
            auth_mode: AuthMode::Signed,
            device_ttl_days: app::pairing::DEFAULT_DEVICE_TTL_DAYS,
            otlp_endpoint: None,
            write_discovery: true,
        }
    }
}

pub fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("talkie-bridge"))
        .unwrap_or_else(|| PathBuf::from("state"))
}

pub fn default_projects_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".claude").join("projects"))
        .unwrap_or_else(|| PathBuf::from(".claude/projects"))
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) cache: Arc<EngagementCache>,
    pub(crate) pairing: Arc<Pairing>,
    pub(crate) matching: Arc<MatchService>,
    pub(crate) delivery: Arc<DeliveryRouter>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) auth_mode: AuthMode,
    pub(crate) metrics: Option<Arc<BridgeMetrics>>,
    pub(crate) listen: SocketAddr,
    pub(crate) hostname: String,
    pub(crate) started_at: DateTime<Utc>,
}

impl AppState {
    fn new(
        settings: &Settings,
        listen: SocketAddr,
        metrics: Option<Arc<BridgeMetrics>>,
    ) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&settings.state_dir).with_context(|| {
            format!("creating state directory {}", settings.state_dir.display())
        })?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner::new());

        let crypto = Arc::new(CryptoStore::load_or_create(&settings.state_dir)?);
        let devices: Arc<dyn DeviceRepository> = Arc::new(FileDeviceRegistry::new(
            settings.state_dir.join(DEVICES_FILE),
        )?);
        let pairing = Arc::new(PairingService::new(
            devices,
            crypto,
            Arc::clone(&clock),
            settings.approval,
            metrics.clone(),
        ));

        let probe = Arc::new(PgrepAgentProbe::new(
            Arc::clone(&runner),
            settings.agent_process.clone(),
        ));
        let store = Arc::new(FsSessionStore::new(settings.projects_dir.clone(), probe));
        let cache = EngagementCache::new(
            store,
            Arc::clone(&clock),
            CacheConfig::default(),
            metrics.clone(),
        );

        let ui = Arc::new(HttpUiAutomationClient::new(settings.ui_automation_url.clone())?);
        let mappings = Arc::new(FileMappingRepository::new(
            settings.state_dir.join(MAPPINGS_FILE),
        )?);
        let matching = Arc::new(MatchService::new(
            Arc::clone(&cache),
            ui.clone(),
            mappings,
            FuzzyMatcher::from_env(),
            Arc::clone(&clock),
            metrics.clone(),
        ));

        let screen_lock: Arc<dyn ScreenLockProbe> = if cfg!(target_os = "macos") {
            Arc::new(IoregScreenLockProbe::new(Arc::clone(&runner)))
        } else {
            Arc::new(NeverLocked)
        };
        let headless = Arc::new(ClaudeCliInvoker::new(runner, settings.agent_cli.clone()));
        let delivery = Arc::new(DeliveryRouter::new(
            Arc::clone(&cache),
            screen_lock,
            ui,
            headless,
            DeliveryConfig::default(),
            metrics.clone(),
        ));

        Ok(Self {
            cache,
            pairing,
            matching,
            delivery,
            started_at: clock.now(),
            clock,
            auth_mode: settings.auth_mode,
            metrics,
            listen,
            hostname: hostname(),
        })
    }
}

fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let (metrics, provider) = if let Some(ref endpoint) = settings.otlp_endpoint {
        let (provider, metrics) =
            telemetry::init_metrics(Some(endpoint.clone()), "talkie-bridge")?;
        (Some(Arc::new(metrics)), Some(provider))
    } else {
        (None, None)
    };

    let listener = TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("binding {}", settings.listen))?;
    let listen = listener.local_addr()?;

    let state = AppState::new(&settings, listen, metrics)?;

    if settings.device_ttl_days > 0 {
        let ttl = chrono::Duration::days(settings.device_ttl_days);
        if let Err(err) = state.pairing.prune_stale(ttl).await {
            warn!(%err, "pruning stale devices failed");
        }
    }

    if settings.write_discovery {
        if let Err(err) = write_discovery_file(&state).await {
            warn!(error = %format!("{err:#}"), "writing discovery file failed");
        }
    }

    if which::which(&settings.agent_cli).is_err() {
        warn!(agent_cli = %settings.agent_cli, "agent cli not found; headless delivery will fail");
    }
    if state.auth_mode == AuthMode::Disabled {
        warn!("request signatures disabled; only use --insecure-local on a trusted machine");
    }
    info!(
        listening = %listen,
        state_dir = %settings.state_dir.display(),
        projects_dir = %settings.projects_dir.display(),
        approval = ?settings.approval,
        "talkie-bridge started"
    );

    let app = router(state.clone());
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    state.cache.shutdown();

    if let Some(provider) = provider {
        if let Err(e) = telemetry::shutdown_metrics(provider) {
            warn!("Failed to shutdown telemetry: {}", e);
        }
    }

    Ok(())
}

pub(crate) fn router(state: AppState) -> Router {
    let public = Router::new()
        .route("/health", get(health))
        .route("/pair", post(pair))
        .route("/pair/info", get(pair_info));

    let operator = Router::new()
        .route("/pair/pending", get(pending_devices))
        .route("/pair/devices", get(list_devices))
        .route("/pair/:id/approve", post(approve_device))
        .route("/pair/:id/reject", post(reject_device))
        .route("/pair/:id", delete(revoke_device))
        .route_layer(middleware::from_fn(auth::operator_guard));

    let device = Router::new()
        .route("/status", get(status))
        .route("/sessions", get(list_sessions))
        .route("/sessions/:id", get(get_session))
        .route("/sessions/:id/message", post(post_message))
        .route("/match", get(match_report))
        .route("/match/scan", post(match_scan))
        .route("/match/confirm", post(match_confirm))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_signature,
        ));

    public
        .merge(operator)
        .merge(device)
        .layer(DefaultBodyLimit::max(MAX_SIGNED_BODY_BYTES))
        .with_state(state)
}

async fn shutdown_signal() {
    let _ = ctrl_c().await;
    info!("shutdown signal received");
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DiscoveryDocument {
    version: u32,
    build: &'static str,
    generated_at: String,
    listen: String,
    host_public_key: String,
    auth: AuthMode,
}

async fn write_discovery_file(state: &AppState) -> anyhow::Result<()> {
    let Some(mut dir) = config_dir() else {
        warn!("config_dir unavailable; skipping discovery file");
        return Ok(());
    };
    dir.push("talkie-bridge");
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    dir.push(DISCOVERY_FILE);

    let document = DiscoveryDocument {
        version: 1,
        build: env!("CARGO_PKG_VERSION"),
        generated_at: Utc::now().to_rfc3339(),
        listen: state.listen.to_string(),
        host_public_key: state.pairing.host_public_key().to_string(),
        auth: state.auth_mode,
    };
    let json = serde_json::to_vec_pretty(&document)?;
    fs::write(&dir, json)
        .await
        .with_context(|| format!("writing {}", dir.display()))?;
    info!(path = %dir.display(), "discovery file written");
    Ok(())
}

// ---------------------------------------------------------------------------
// DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionDto {
    id: String,
    folder_name: String,
    project_path: String,
    display_name: String,
    is_live: bool,
    last_seen: DateTime<Utc>,
    message_count: usize,
    transcript_path: String,
}

impl From<&Session> for SessionDto {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            folder_name: session.folder_name.clone(),
            project_path: session.project_path.clone(),
            display_name: session.display_name.clone(),
            is_live: session.is_live,
            last_seen: session.last_seen,
            message_count: session.message_count,
            transcript_path: session.transcript_path.to_string_lossy().into_owned(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct RefreshQuery {
    #[serde(default)]
    refresh: bool,
}

#[derive(Debug, Default, Deserialize)]
struct FreshQuery {
    #[serde(default)]
    fresh: bool,
}

#[derive(Debug, Serialize)]
struct SessionListResponse {
    sessions: Vec<SessionDto>,
    count: usize,
}

#[derive(Debug, Default, Deserialize)]
struct MessageRequest {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    audio: Option<String>,
    #[serde(default)]
    format: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MessageResponse {
    success: bool,
    session_id: String,
    mode: DeliveryMode,
    mode_reason: ModeReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    verified: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    verify_attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairRequest {
    device_id: String,
    public_key: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PairResponse {
    status: PairOutcome,
    device_id: String,
    host_public_key: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PairInfoResponse {
    public_key: String,
    hostname: String,
    port: u16,
}

#[derive(Debug, Serialize)]
struct DeviceListResponse {
    devices: Vec<Device>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceStatusResponse {
    device_id: String,
    status: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    service: &'static str,
    version: &'static str,
    started_at: DateTime<Utc>,
    uptime_seconds: i64,
    auth: AuthMode,
    approval: &'static str,
    cache: CacheStatus,
    devices: DeviceCounts,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MatchDto {
    terminal: TerminalDescriptor,
    fingerprint: TerminalFingerprint,
    session_id: String,
    session_name: String,
    project_path: String,
    confidence: u8,
    method: &'static str,
    details: String,
}

impl From<&MatchResult> for MatchDto {
    fn from(result: &MatchResult) -> Self {
        Self {
            fingerprint: result.terminal.fingerprint(),
            terminal: result.terminal.clone(),
            session_id: result.session.id.clone(),
            session_name: result.session.display_name.clone(),
            project_path: result.session.project_path.clone(),
            confidence: result.confidence,
            method: result.method.as_str(),
            details: result.details.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
struct MatchReportResponse {
    matches: Vec<MatchDto>,
    unmatched: Vec<TerminalDescriptor>,
    timestamp: DateTime<Utc>,
}

impl From<&MatchReport> for MatchReportResponse {
    fn from(report: &MatchReport) -> Self {
        Self {
            matches: report.matches.iter().map(MatchDto::from).collect(),
            unmatched: report.unmatched.clone(),
            timestamp: report.generated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmRequest {
    terminal_fingerprint: String,
    session_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConfirmResponse {
    status: &'static str,
    terminal_fingerprint: TerminalFingerprint,
    session_id: String,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
    }))
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, ApiError> {
    let devices = state
        .pairing
        .counts()
        .await
        .map_err(|err| pairing_error("status.devices", err))?;
    let now = state.clock.now();
    Ok(Json(StatusResponse {
        service: "talkie-bridge",
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.started_at,
        uptime_seconds: now.signed_duration_since(state.started_at).num_seconds(),
        auth: state.auth_mode,
        approval: match state.pairing.policy() {
            ApprovalPolicy::AutoApprove => "auto",
            ApprovalPolicy::Manual => "manual",
        },
        cache: state.cache.status(),
        devices,
    }))
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<RefreshQuery>,
) -> Json<SessionListResponse> {
    let sessions: Vec<SessionDto> = state
        .cache
        .get(query.refresh)
        .await
        .iter()
        .map(SessionDto::from)
        .collect();
    Json(SessionListResponse {
        count: sessions.len(),
        sessions,
    })
}

async fn get_session(
    State(state): State<AppState>,
    RoutePath(id): RoutePath<String>,
    Query(query): Query<RefreshQuery>,
) -> Result<Json<SessionDto>, ApiError> {
    state
        .cache
        .get_one(&id, query.refresh)
        .await
        .map(|session| Json(SessionDto::from(&session)))
        .ok_or_else(|| ApiError::not_found("session_not_found", format!("session {id} not found")))
}

async fn post_message(
    State(state): State<AppState>,
    RoutePath(id): RoutePath<String>,
    device: Option<Extension<AuthenticatedDevice>>,
    Json(payload): Json<MessageRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let payload = DeliveryPayload::from_parts(payload.text, payload.audio, payload.format);
    info!(
        session = %id,
        device = device.as_ref().map(|Extension(d)| d.id.as_str()).unwrap_or("local"),
        audio = payload.has_audio(),
        chars = payload.text.chars().count(),
        "message received"
    );
    let outcome = state
        .delivery
        .deliver(&id, payload)
        .await
        .map_err(delivery_error)?;
    Ok(Json(MessageResponse {
        success: true,
        session_id: outcome.session_id,
        mode: outcome.mode,
        mode_reason: outcome.reason,
        verified: outcome.verification.map(|v| v.verified),
        verify_attempts: outcome.verification.map(|v| v.attempts),
        response: outcome.response,
    }))
}

async fn pair(
    State(state): State<AppState>,
    Json(request): Json<PairRequest>,
) -> Result<Json<PairResponse>, ApiError> {
    let (outcome, device) = state
        .pairing
        .request_pairing(&request.device_id, &request.public_key, &request.name)
        .await
        .map_err(|err| pairing_error("pair.request", err))?;
    Ok(Json(PairResponse {
        status: outcome,
        device_id: device.id().to_string(),
        host_public_key: state.pairing.host_public_key().to_string(),
    }))
}

async fn pair_info(State(state): State<AppState>) -> Json<PairInfoResponse> {
    Json(PairInfoResponse {
        public_key: state.pairing.host_public_key().to_string(),
        hostname: state.hostname.clone(),
        port: state.listen.port(),
    })
}

async fn pending_devices(
    State(state): State<AppState>,
) -> Result<Json<DeviceListResponse>, ApiError> {
    let devices = state
        .pairing
        .pending()
        .await
        .map_err(|err| pairing_error("pair.pending", err))?;
    Ok(Json(DeviceListResponse { devices }))
}

async fn list_devices(State(state): State<AppState>) -> Result<Json<DeviceListResponse>, ApiError> {
    let devices = state
        .pairing
        .devices()
        .await
        .map_err(|err| pairing_error("pair.devices", err))?;
    Ok(Json(DeviceListResponse { devices }))
}

async fn approve_device(
    State(state): State<AppState>,
    RoutePath(id): RoutePath<String>,
) -> Result<Json<DeviceStatusResponse>, ApiError> {
    let device = state
        .pairing
        .approve(&id)
        .await
        .map_err(|err| pairing_error("pair.approve", err))?;
    Ok(Json(DeviceStatusResponse {
        device_id: device.id().to_string(),
        status: device.status().to_string(),
    }))
}

async fn reject_device(
    State(state): State<AppState>,
    RoutePath(id): RoutePath<String>,
) -> Result<Json<DeviceStatusResponse>, ApiError> {
    let device = state
        .pairing
        .reject(&id)
        .await
        .map_err(|err| pairing_error("pair.reject", err))?;
    Ok(Json(DeviceStatusResponse {
        device_id: device.id().to_string(),
        status: device.status().to_string(),
    }))
}

async fn revoke_device(
    State(state): State<AppState>,
    RoutePath(id): RoutePath<String>,
) -> Result<Json<DeviceStatusResponse>, ApiError> {
    state
        .pairing
        .revoke(&id)
        .await
        .map_err(|err| pairing_error("pair.revoke", err))?;
    Ok(Json(DeviceStatusResponse {
        device_id: id,
        status: "revoked".to_string(),
    }))
}

async fn match_report(
    State(state): State<AppState>,
    Query(query): Query<FreshQuery>,
) -> Json<MatchReportResponse> {
    let report = state.matching.report(query.fresh).await;
    Json(MatchReportResponse::from(report.as_ref()))
}

async fn match_scan(State(state): State<AppState>) -> Json<MatchReportResponse> {
    let report = state.matching.scan().await;
    Json(MatchReportResponse::from(report.as_ref()))
}

async fn match_confirm(
    State(state): State<AppState>,
    Json(request): Json<ConfirmRequest>,
) -> Result<Json<ConfirmResponse>, ApiError> {
    let (fingerprint, session) = state
        .matching
        .confirm(&request.terminal_fingerprint, &request.session_id)
        .await
        .map_err(match_error)?;
    Ok(Json(ConfirmResponse {
        status: "confirmed",
        terminal_fingerprint: fingerprint,
        session_id: session.id,
    }))
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub(crate) struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Debug)]
pub(crate) struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }

    pub(crate) fn invalid(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub(crate) fn unauthorized(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, code, message)
    }

    pub(crate) fn forbidden(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, code, message)
    }

    pub(crate) fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, message)
    }

    fn conflict(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, message)
    }

    pub(crate) fn payload_too_large(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::PAYLOAD_TOO_LARGE, code, message)
    }

    fn unavailable(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, code, message)
    }

    fn bad_gateway(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_GATEWAY, code, message)
    }

    pub(crate) fn internal(code: &'static str, err: impl Into<anyhow::Error>) -> Self {
        let err = err.into();
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status;
        let body = Json(self.body);
        (status, body).into_response()
    }
}

fn pairing_error(code: &'static str, err: PairingError) -> ApiError {
    match err {
        PairingError::Invalid(message) => ApiError::invalid(code, message),
        PairingError::NotFound(_) => ApiError::not_found(code, err.to_string()),
        PairingError::Conflict { .. } => ApiError::conflict(code, err.to_string()),
        PairingError::NotApproved(_) => ApiError::forbidden(code, err.to_string()),
        PairingError::Internal(message) => ApiError::internal(code, anyhow::anyhow!(message)),
    }
}

fn match_error(err: MatchServiceError) -> ApiError {
    match err {
        MatchServiceError::Invalid(message) => ApiError::invalid("match.confirm", message),
        MatchServiceError::NotFound(_) => ApiError::not_found("match.confirm", err.to_string()),
        MatchServiceError::Internal(message) => {
            ApiError::internal("match.confirm", anyhow::anyhow!(message))
        }
    }
}

fn delivery_error(err: DeliveryError) -> ApiError {
    let code = err.code();
    match err {
        DeliveryError::NotFound(_) => ApiError::not_found(code, err.to_string()),
        DeliveryError::AudioRequiresUi(_) => ApiError::unavailable(code, err.to_string()),
        DeliveryError::Transient { .. }
        | DeliveryError::Ui(_)
        | DeliveryError::ExternalProcess(_) => ApiError::bad_gateway(code, err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::devices::InMemoryDeviceRepository;
    use crate::adapters::sessions::StaticAgentProbe;
    use crate::auth::{
        sign_request, DEVICE_HEADER, ENCRYPTED_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER,
    };
    use crate::crypto::{derive_key_set, DerivedKeySet};
    use crate::ports::delivery::{
        ForwardRequest, HeadlessError, HeadlessInvoker, HeadlessReply, HeadlessRequest,
        UiAutomationPort, UiForwardError,
    };
    use crate::ports::matching::TerminalSource;
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::extract::ConnectInfo;
    use axum::http::{Method, Request};
    use p256::SecretKey;
    use rand_core::OsRng;
    use serde_json::Value;
    use std::time::Duration;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const SESSION_ID: &str = "5d0e3c52-8f7a-4f5e-9b1c-2a6d7e8f9a0b";

    struct DownUi;

    #[async_trait]
    impl UiAutomationPort for DownUi {
        async fn healthy(&self, _timeout: Duration) -> bool {
            false
        }

        async fn forward(
            &self,
            _request: &ForwardRequest,
            _timeout: Duration,
        ) -> Result<(), UiForwardError> {
            Err(UiForwardError::Connect("down".into()))
        }
    }

    #[async_trait]
    impl TerminalSource for DownUi {
        async fn list_terminals(&self) -> Vec<TerminalDescriptor> {
            vec![TerminalDescriptor::new(
                "com.apple.Terminal",
                "zsh - ~/dev/talkie",
            )]
        }
    }

    struct EchoCli;

    #[async_trait]
    impl HeadlessInvoker for EchoCli {
        async fn invoke(&self, request: &HeadlessRequest) -> Result<HeadlessReply, HeadlessError> {
            Ok(HeadlessReply {
                text: format!("echo: {}", request.text),
            })
        }
    }

    struct Harness {
        app: Router,
        state: AppState,
        _temp: TempDir,
    }

    fn harness(approval: ApprovalPolicy, auth_mode: AuthMode) -> Harness {
        let temp = TempDir::new().unwrap();
        let project = temp.path().join("projects").join("-Users-arach-dev-talkie");
        std::fs::create_dir_all(&project).unwrap();
        std::fs::write(
            project.join(format!("{SESSION_ID}.jsonl")),
            format!(
                "{{\"type\":\"user\",\"sessionId\":\"{SESSION_ID}\",\"cwd\":\"/Users/arach/dev/talkie\",\"message\":{{\"content\":\"hi\"}}}}\n"
            ),
        )
        .unwrap();

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(FsSessionStore::new(
            temp.path().join("projects"),
            Arc::new(StaticAgentProbe(true)),
        ));
        let cache = EngagementCache::new(
            store,
            Arc::clone(&clock),
            CacheConfig {
                poll_interval: Duration::from_secs(3600),
                ..CacheConfig::default()
            },
            None,
        );
        let devices: Arc<dyn DeviceRepository> = Arc::new(InMemoryDeviceRepository::new());
        let pairing = Arc::new(PairingService::new(
            devices,
            Arc::new(CryptoStore::ephemeral()),
            Arc::clone(&clock),
            approval,
            None,
        ));
        let ui = Arc::new(DownUi);
        let mappings =
            Arc::new(FileMappingRepository::new(temp.path().join(MAPPINGS_FILE)).unwrap());
        let matching = Arc::new(MatchService::new(
            Arc::clone(&cache),
            ui.clone(),
            mappings,
            FuzzyMatcher::new(Some("/Users/arach".into())),
            Arc::clone(&clock),
            None,
        ));
        let delivery = Arc::new(DeliveryRouter::new(
            Arc::clone(&cache),
            Arc::new(NeverLocked),
            ui,
            Arc::new(EchoCli),
            DeliveryConfig::default(),
            None,
        ));
        let state = AppState {
            cache,
            pairing,
            matching,
            delivery,
            started_at: clock.now(),
            clock,
            auth_mode,
            metrics: None,
            listen: SocketAddr::from(([127, 0, 0, 1], 8765)),
            hostname: "test-host".into(),
        };
        Harness {
            app: router(state.clone()),
            state,
            _temp: temp,
        }
    }

    struct Phone {
        id: String,
        public_key: DevicePublicKey,
        secret: SecretKey,
    }

    impl Phone {
        fn new(id: &str) -> Self {
            let secret = SecretKey::random(&mut OsRng);
            Self {
                id: id.to_string(),
                public_key: DevicePublicKey::from_public_key(&secret.public_key()),
                secret,
            }
        }

        fn keys(&self, host: &DevicePublicKey) -> DerivedKeySet {
            derive_key_set(&self.secret, &host.to_public_key().unwrap()).unwrap()
        }
    }

    fn loopback() -> ConnectInfo<SocketAddr> {
        ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 50000)))
    }

    fn plain(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let mut request = builder.body(body).unwrap();
        request.extensions_mut().insert(loopback());
        request
    }

    fn signed(
        phone: &Phone,
        keys: &DerivedKeySet,
        method: Method,
        uri: &str,
        body: &[u8],
        timestamp_ms: i64,
    ) -> Request<Body> {
        let signature = sign_request(keys, method.as_str(), uri, timestamp_ms, body).unwrap();
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .header(DEVICE_HEADER, &phone.id)
            .header(TIMESTAMP_HEADER, timestamp_ms.to_string())
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(body.to_vec()))
            .unwrap()
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    async fn paired(h: &Harness, id: &str) -> (Phone, DerivedKeySet) {
        let phone = Phone::new(id);
        let (status, body) = send(
            &h.app,
            plain(
                Method::POST,
                "/pair",
                Some(json!({
                    "deviceId": phone.id,
                    "publicKey": phone.public_key.as_str(),
                    "name": "Test Phone",
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let host = DevicePublicKey::parse(body["hostPublicKey"].as_str().unwrap()).unwrap();
        let keys = phone.keys(&host);
        (phone, keys)
    }

    fn now_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    #[tokio::test]
    async fn health_and_pair_info_are_public() {
        let h = harness(ApprovalPolicy::AutoApprove, AuthMode::Signed);
        let (status, body) = send(&h.app, plain(Method::GET, "/health", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(&h.app, plain(Method::GET, "/pair/info", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["hostname"], "test-host");
        assert_eq!(body["port"], 8765);
        assert_eq!(
            body["publicKey"],
            h.state.pairing.host_public_key().as_str()
        );
    }

    #[tokio::test]
    async fn unsigned_requests_are_rejected() {
        let h = harness(ApprovalPolicy::AutoApprove, AuthMode::Signed);
        let (status, body) = send(&h.app, plain(Method::GET, "/sessions", None)).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "missing_signature");
    }

    #[tokio::test]
    async fn paired_device_lists_sessions() {
        let h = harness(ApprovalPolicy::AutoApprove, AuthMode::Signed);
        let (phone, keys) = paired(&h, "phone-1").await;

        let (status, body) = send(
            &h.app,
            signed(&phone, &keys, Method::GET, "/sessions?refresh=true", b"", now_ms()),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["count"], 1);
        assert_eq!(body["sessions"][0]["id"], SESSION_ID);
        assert_eq!(body["sessions"][0]["displayName"], "talkie");
        assert_eq!(body["sessions"][0]["isLive"], true);

        let (status, body) = send(
            &h.app,
            signed(
                &phone,
                &keys,
                Method::GET,
                "/sessions/-Users-arach-dev-talkie",
                b"",
                now_ms(),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], SESSION_ID);

        let (status, body) = send(
            &h.app,
            signed(&phone, &keys, Method::GET, "/sessions/ghost", b"", now_ms()),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "session_not_found");
    }

    #[tokio::test]
    async fn tampered_or_stale_signatures_fail() {
        let h = harness(ApprovalPolicy::AutoApprove, AuthMode::Signed);
        let (phone, keys) = paired(&h, "phone-1").await;

        let mut request = signed(&phone, &keys, Method::GET, "/sessions", b"", now_ms());
        *request.uri_mut() = "/sessions?refresh=true".parse().unwrap();
        let (status, body) = send(&h.app, request).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "bad_signature");

        let stale = now_ms() - 6 * 60 * 1000;
        let (status, body) = send(
            &h.app,
            signed(&phone, &keys, Method::GET, "/sessions", b"", stale),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "stale_timestamp");

        for extreme in [i64::MIN, i64::MAX, 0] {
            let (status, body) = send(
                &h.app,
                signed(&phone, &keys, Method::GET, "/sessions", b"", extreme),
            )
            .await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(body["code"], "stale_timestamp");
        }

        let stranger = Phone::new("stranger");
        let (status, body) = send(
            &h.app,
            signed(&stranger, &keys, Method::GET, "/sessions", b"", now_ms()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "unknown_device");
    }

    #[tokio::test]
    async fn repeated_pairing_is_idempotent() {
        let h = harness(ApprovalPolicy::AutoApprove, AuthMode::Signed);
        let phone = Phone::new("phone-1");
        let request = json!({
            "deviceId": phone.id,
            "publicKey": phone.public_key.as_str(),
            "name": "Phone",
        });
        for _ in 0..2 {
            let (status, body) =
                send(&h.app, plain(Method::POST, "/pair", Some(request.clone()))).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], "approved");
        }
        let other_key = Phone::new("phone-1");
        let (status, _) = send(
            &h.app,
            plain(
                Method::POST,
                "/pair",
                Some(json!({
                    "deviceId": "phone-1",
                    "publicKey": other_key.public_key.as_str(),
                    "name": "Phone",
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn manual_approval_flow() {
        let h = harness(ApprovalPolicy::Manual, AuthMode::Signed);
        let phone = Phone::new("ipad");
        let (status, body) = send(
            &h.app,
            plain(
                Method::POST,
                "/pair",
                Some(json!({"deviceId": "ipad", "publicKey": phone.public_key.as_str(), "name": "iPad"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "pending_approval");
        let keys = phone.keys(h.state.pairing.host_public_key());

        let (status, body) = send(
            &h.app,
            signed(&phone, &keys, Method::GET, "/sessions", b"", now_ms()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "device_not_approved");

        let (status, body) = send(&h.app, plain(Method::GET, "/pair/pending", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["devices"][0]["id"], "ipad");

        let (status, body) =
            send(&h.app, plain(Method::POST, "/pair/ipad/approve", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "approved");

        let (status, _) = send(
            &h.app,
            signed(&phone, &keys, Method::GET, "/sessions", b"", now_ms()),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&h.app, plain(Method::POST, "/pair/nobody/approve", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(&h.app, plain(Method::DELETE, "/pair/ipad", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "revoked");
        let (status, _) = send(
            &h.app,
            signed(&phone, &keys, Method::GET, "/sessions", b"", now_ms()),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn operator_routes_refuse_remote_peers() {
        let h = harness(ApprovalPolicy::Manual, AuthMode::Disabled);
        let mut request = plain(Method::GET, "/pair/devices", None);
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([100, 64, 0, 7], 50000))));
        let (status, body) = send(&h.app, request).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["code"], "operator_only");

        let (status, body) = send(&h.app, plain(Method::GET, "/pair/devices", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["devices"], json!([]));
    }

    #[tokio::test]
    async fn message_goes_headless_when_ui_is_down() {
        let h = harness(ApprovalPolicy::AutoApprove, AuthMode::Signed);
        let (phone, keys) = paired(&h, "phone-1").await;
        let uri = format!("/sessions/{SESSION_ID}/message");

        let body = json!({"text": "run the tests"}).to_string();
        let (status, response) = send(
            &h.app,
            signed(&phone, &keys, Method::POST, &uri, body.as_bytes(), now_ms()),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{response}");
        assert_eq!(response["success"], true);
        assert_eq!(response["mode"], "headless");
        assert_eq!(response["modeReason"], "ui_unavailable");
        assert_eq!(response["response"], "echo: run the tests");
        assert!(response.get("verified").is_none());

        let audio = json!({"audio": "AAAA", "format": "m4a"}).to_string();
        let (status, response) = send(
            &h.app,
            signed(&phone, &keys, Method::POST, &uri, audio.as_bytes(), now_ms()),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response["code"], "audio_requires_ui");
    }

    #[tokio::test]
    async fn encrypted_bodies_are_opened_before_the_handler() {
        let h = harness(ApprovalPolicy::AutoApprove, AuthMode::Signed);
        let (phone, keys) = paired(&h, "phone-1").await;
        let uri = format!("/sessions/{SESSION_ID}/message");

        let envelope = keys
            .seal(json!({"text": "sealed hello"}).to_string().as_bytes())
            .unwrap();
        let wire = serde_json::to_vec(&envelope).unwrap();
        let mut request = signed(&phone, &keys, Method::POST, &uri, &wire, now_ms());
        request
            .headers_mut()
            .insert(ENCRYPTED_HEADER, "1".parse().unwrap());
        let (status, response) = send(&h.app, request).await;
        assert_eq!(status, StatusCode::OK, "{response}");
        assert_eq!(response["response"], "echo: sealed hello");
    }

    #[tokio::test]
    async fn disabled_auth_skips_signatures() {
        let h = harness(ApprovalPolicy::AutoApprove, AuthMode::Disabled);
        let (status, body) = send(&h.app, plain(Method::GET, "/status", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["service"], "talkie-bridge");
        assert_eq!(body["auth"], "disabled");
        assert_eq!(body["devices"]["approved"], 0);
    }

    #[tokio::test]
    async fn match_routes_report_and_confirm() {
        let h = harness(ApprovalPolicy::AutoApprove, AuthMode::Disabled);
        let (status, body) = send(&h.app, plain(Method::GET, "/match?fresh=true", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["matches"][0]["sessionId"], SESSION_ID);
        assert_eq!(body["matches"][0]["method"], "path_in_title");
        assert_eq!(body["matches"][0]["confidence"], 95);

        let (status, body) = send(
            &h.app,
            plain(
                Method::POST,
                "/match/confirm",
                Some(json!({
                    "terminalFingerprint": "com.apple.Terminal|zsh - ~/dev/talkie",
                    "sessionId": SESSION_ID,
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["status"], "confirmed");

        let (status, body) = send(&h.app, plain(Method::POST, "/match/scan", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["matches"][0]["confidence"], 100);
        assert_eq!(body["matches"][0]["method"], "confirmed");

        let (status, _) = send(
            &h.app,
            plain(
                Method::POST,
                "/match/confirm",
                Some(json!({"terminalFingerprint": "nope", "sessionId": SESSION_ID})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &h.app,
            plain(
                Method::POST,
                "/match/confirm",
                Some(json!({"terminalFingerprint": "a|b", "sessionId": "ghost"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

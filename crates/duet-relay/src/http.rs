//! HTTP request handlers
//!
//! JSON field names are camelCase so the existing web client works unchanged.

use axum::{
    body::Bytes,
    extract::{
        rejection::JsonRejection, DefaultBodyLimit, FromRequest, Multipart, Path, Request, State,
    },
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use duet_auth::{DeviceInfo, TokenDigest, TokenProof};
use duet_core::{error::require_field, Error, SignalEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::error::{ApiError, ApiResult};
use crate::mailbox::SignalRequest;
use crate::state::AppState;

/// Extra room on top of the blob ceiling for base64 and multipart framing
const BACKUP_BODY_OVERHEAD: usize = 1024 * 1024;

/// Create the main application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let backup_limit = state.config.max_backup_bytes / 3 * 4 + BACKUP_BODY_OVERHEAD;

    Router::new()
        .route("/health", get(health_handler))
        // Pairing API
        .route("/api/pair/initiate", post(pair_initiate_handler))
        .route("/api/pair/confirm", post(pair_confirm_handler))
        .route("/api/pair/status/:couple_id", get(pair_status_handler))
        // Signaling API
        .route("/api/signal", post(signal_send_handler))
        .route("/api/signals/:couple_id/:device_id", get(signal_drain_handler))
        // Backup API
        .route(
            "/api/backup",
            post(backup_store_handler).layer(DefaultBodyLimit::max(backup_limit)),
        )
        .route("/api/backup/:couple_id", get(backup_retrieve_handler))
        // Live channel
        .route("/ws", get(crate::websocket::ws_handler))
        .fallback(not_found_handler)
        .layer(cors_layer(&state.config.allowed_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    if allowed_origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", o);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    body.map(|Json(v)| v).map_err(ApiError::from)
}

async fn not_found_handler() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "Endpoint not found" })),
    )
}

// ============================================================================
// Health
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub version: &'static str,
    /// Lets devices pin the self-signed certificate before trusting it
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_fingerprint: Option<String>,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now(),
        version: env!("CARGO_PKG_VERSION"),
        cert_fingerprint: state.cert_fingerprint.clone(),
    })
}

// ============================================================================
// Pairing API Handlers
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    couple_id: Option<String>,
    pairing_token_hash: Option<String>,
    #[serde(default)]
    device_info: Option<DeviceInfo>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub success: bool,
    pub message: &'static str,
    pub expires_at: DateTime<Utc>,
}

/// Register the digest of a pairing secret for a couple
///
/// The request stays confirmable for 24 hours; a second initiate while one
/// is pending is rejected with 409.
async fn pair_initiate_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<InitiateRequest>, JsonRejection>,
) -> ApiResult<Json<InitiateResponse>> {
    let request = json_body(body)?;
    let couple_id = require_field("coupleId", request.couple_id.as_deref())?;
    let digest = TokenDigest::parse(require_field(
        "pairingTokenHash",
        request.pairing_token_hash.as_deref(),
    )?)?;

    let pairing = state
        .registry
        .initiate(couple_id, digest, request.device_info)?;

    Ok(Json(InitiateResponse {
        success: true,
        message: "Pairing initiated",
        expires_at: pairing.expires_at,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    couple_id: Option<String>,
    pairing_token_hash: Option<String>,
    pairing_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ConfirmResponse {
    pub success: bool,
    pub message: &'static str,
}

/// Consume a pairing request by presenting the secret or its digest
async fn pair_confirm_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ConfirmRequest>, JsonRejection>,
) -> ApiResult<Json<ConfirmResponse>> {
    let request = json_body(body)?;
    let couple_id = require_field("coupleId", request.couple_id.as_deref())?;

    let proof = match (
        request.pairing_token_hash.as_deref().map(str::trim),
        request.pairing_token,
    ) {
        (Some(hash), _) if !hash.is_empty() => TokenProof::Digest(TokenDigest::parse(hash)?),
        (_, Some(secret)) if !secret.trim().is_empty() => TokenProof::Secret(secret),
        _ => return Err(Error::validation("Missing required field: pairingTokenHash").into()),
    };

    state.registry.confirm(couple_id, &proof)?;

    Ok(Json(ConfirmResponse {
        success: true,
        message: "Pairing confirmed",
    }))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingStatusResponse {
    /// Whether a confirmable request exists
    pub pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
}

async fn pair_status_handler(
    State(state): State<Arc<AppState>>,
    Path(couple_id): Path<String>,
) -> Json<PairingStatusResponse> {
    let status = state.registry.status(&couple_id);
    Json(PairingStatusResponse {
        pending: status.is_some(),
        expires_at: status.as_ref().map(|s| s.expires_at),
        expires_in: status.as_ref().map(|s| s.expires_in),
    })
}

// ============================================================================
// Signaling API Handlers
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalBody {
    couple_id: Option<String>,
    from_device_id: Option<String>,
    to_device_id: Option<String>,
    #[serde(default)]
    signal_payload: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalResponse {
    pub success: bool,
    pub envelope_id: String,
    /// Live connections the signal was pushed to
    pub delivered: usize,
}

/// Queue a signal for the recipient and push it to live subscribers
async fn signal_send_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SignalBody>, JsonRejection>,
) -> ApiResult<Json<SignalResponse>> {
    let body = json_body(body)?;
    let request = SignalRequest::new(
        require_field("coupleId", body.couple_id.as_deref())?,
        require_field("fromDeviceId", body.from_device_id.as_deref())?,
        require_field("toDeviceId", body.to_device_id.as_deref())?,
        body.signal_payload,
    )?;

    let receipt = state.hub.publish(&request, None)?;

    Ok(Json(SignalResponse {
        success: true,
        envelope_id: receipt.envelope.id.to_string(),
        delivered: receipt.delivered,
    }))
}

#[derive(Debug, Serialize)]
pub struct SignalsResponse {
    pub signals: Vec<SignalEvent>,
}

/// Take every pending signal addressed to a device
async fn signal_drain_handler(
    State(state): State<Arc<AppState>>,
    Path((couple_id, device_id)): Path<(String, String)>,
) -> Json<SignalsResponse> {
    let signals = state
        .mailbox
        .drain(&couple_id, &device_id)
        .iter()
        .map(|e| e.to_event())
        .collect();
    Json(SignalsResponse { signals })
}

// ============================================================================
// Backup API Handlers
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupJson {
    couple_id: Option<String>,
    /// Base64 ciphertext
    encrypted_data: Option<String>,
    #[serde(default)]
    meta: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupResponse {
    pub success: bool,
    pub object_url: String,
    pub message: &'static str,
    pub created_at: DateTime<Utc>,
    pub size: usize,
}

struct BackupUpload {
    couple_id: Option<String>,
    blob: Option<Bytes>,
    meta: Value,
}

/// Store an encrypted backup
///
/// Accepts `multipart/form-data` with a `backup` file field, or JSON with
/// base64 `encryptedData`.
async fn backup_store_handler(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> ApiResult<Json<BackupResponse>> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("multipart/form-data"))
        .unwrap_or(false);

    let upload = if is_multipart {
        read_multipart(Multipart::from_request(request, &()).await?).await?
    } else {
        read_json_backup(Json::<BackupJson>::from_request(request, &()).await)?
    };

    let couple_id = require_field("coupleId", upload.couple_id.as_deref())?;
    let blob = upload
        .blob
        .ok_or_else(|| Error::validation("No backup data provided"))?;

    let record = state.vault.store(couple_id, blob, upload.meta).await?;

    Ok(Json(BackupResponse {
        success: true,
        object_url: record.object_url(),
        message: "Backup uploaded successfully",
        created_at: record.created_at,
        size: record.size,
    }))
}

async fn read_multipart(mut multipart: Multipart) -> ApiResult<BackupUpload> {
    let mut upload = BackupUpload {
        couple_id: None,
        blob: None,
        meta: Value::Null,
    };

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("coupleId") => upload.couple_id = Some(field.text().await?),
            Some("backup") => upload.blob = Some(field.bytes().await?),
            Some("meta") => {
                let text = field.text().await?;
                upload.meta = serde_json::from_str(&text).unwrap_or(Value::String(text));
            }
            other => debug!("Ignoring multipart field {:?}", other),
        }
    }
    Ok(upload)
}

fn read_json_backup(body: Result<Json<BackupJson>, JsonRejection>) -> ApiResult<BackupUpload> {
    let body = json_body(body)?;
    let blob = body
        .encrypted_data
        .map(|data| {
            BASE64
                .decode(data.trim())
                .map(Bytes::from)
                .map_err(|_| Error::validation("encryptedData is not valid base64"))
        })
        .transpose()?;

    Ok(BackupUpload {
        couple_id: body.couple_id,
        blob,
        meta: body.meta,
    })
}

/// Download the newest backup of a couple
async fn backup_retrieve_handler(
    State(state): State<Arc<AppState>>,
    Path(couple_id): Path<String>,
) -> ApiResult<Response> {
    let (record, blob) = state.vault.retrieve_latest(&couple_id).await?;

    let disposition = format!(
        "attachment; filename=\"duet-backup-{}.bin\"",
        record.created_at.timestamp_millis()
    );
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
            (
                header::HeaderName::from_static("x-backup-sha256"),
                record.sha256.clone(),
            ),
        ],
        blob,
    )
        .into_response())
}

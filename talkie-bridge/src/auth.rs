//! Request signing for paired devices and the loopback gate for operator routes.

use crate::app::pairing::PairingError;
use crate::crypto::{CryptoError, DerivedKeySet, SealedEnvelope};
use crate::domain::devices::DeviceId;
use crate::{ApiError, AppState};
use axum::body::{to_bytes, Body};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::Response;
use chrono::Duration;
use std::net::SocketAddr;
use tracing::{debug, warn};

pub const DEVICE_HEADER: &str = "x-bridge-device";
pub const TIMESTAMP_HEADER: &str = "x-bridge-timestamp";
pub const SIGNATURE_HEADER: &str = "x-bridge-signature";
pub const ENCRYPTED_HEADER: &str = "x-bridge-encrypted";

/// Signed requests older or newer than this are replays or broken clocks.
pub const MAX_CLOCK_SKEW: Duration = Duration::minutes(5);
/// Audio notes travel inline, so the cap is generous.
pub const MAX_SIGNED_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Every device route needs a valid signature.
    Signed,
    /// Local development only; switched on explicitly from the command line.
    Disabled,
}

/// Inserted into request extensions once a signature checks out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticatedDevice {
    pub id: DeviceId,
    pub name: String,
}

/// Bytes covered by the signature: `METHOD\nPATH\nTIMESTAMP\nBODY`.
///
/// `path` includes the query string when there is one.
pub fn canonical_message(method: &str, path: &str, timestamp: &str, body: &[u8]) -> Vec<u8> {
    let mut message =
        Vec::with_capacity(method.len() + path.len() + timestamp.len() + body.len() + 3);
    message.extend_from_slice(method.to_ascii_uppercase().as_bytes());
    message.push(b'\n');
    message.extend_from_slice(path.as_bytes());
    message.push(b'\n');
    message.extend_from_slice(timestamp.as_bytes());
    message.push(b'\n');
    message.extend_from_slice(body);
    message
}

/// Client-side counterpart of [`require_signature`].
pub fn sign_request(
    keys: &DerivedKeySet,
    method: &str,
    path: &str,
    timestamp_ms: i64,
    body: &[u8],
) -> Result<String, CryptoError> {
    keys.sign(&canonical_message(
        method,
        path,
        &timestamp_ms.to_string(),
        body,
    ))
}

/// Operator routes answer only to the machine the bridge runs on.
pub(crate) async fn operator_guard(request: Request, next: Next) -> Result<Response, ApiError> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_canonical());
    match peer {
        Some(ip) if ip.is_loopback() => Ok(next.run(request).await),
        Some(ip) => {
            warn!(peer = %ip, path = request.uri().path(), "operator route refused for remote peer");
            Err(ApiError::forbidden(
                "operator_only",
                "operator routes are only served to loopback clients",
            ))
        }
        None => Err(ApiError::forbidden(
            "operator_only",
            "peer address unavailable",
        )),
    }
}

pub(crate) async fn require_signature(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if state.auth_mode == AuthMode::Disabled {
        return Ok(next.run(request).await);
    }
    match verify_signed(&state, request).await {
        Ok(request) => Ok(next.run(request).await),
        Err((reason, err)) => {
            if let Some(metrics) = &state.metrics {
                metrics.record_auth_rejection(reason);
            }
            Err(err)
        }
    }
}

type Rejection = (&'static str, ApiError);

fn unauthorized(reason: &'static str, message: impl Into<String>) -> Rejection {
    (reason, ApiError::unauthorized(reason, message))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}

fn within_skew(now_ms: i64, sent_ms: i64) -> bool {
    now_ms.abs_diff(sent_ms) <= MAX_CLOCK_SKEW.num_milliseconds().unsigned_abs()
}

async fn verify_signed(state: &AppState, request: Request) -> Result<Request, Rejection> {
    let (mut parts, body) = request.into_parts();

    let (Some(device), Some(timestamp), Some(signature)) = (
        header_str(&parts.headers, DEVICE_HEADER),
        header_str(&parts.headers, TIMESTAMP_HEADER),
        header_str(&parts.headers, SIGNATURE_HEADER),
    ) else {
        return Err(unauthorized(
            "missing_signature",
            "X-Bridge-Device, X-Bridge-Timestamp and X-Bridge-Signature are required",
        ));
    };
    let device_id = DeviceId::try_new(device)
        .map_err(|err| unauthorized("unknown_device", err))?;

    let sent_ms: i64 = timestamp
        .parse()
        .map_err(|_| unauthorized("bad_timestamp", "timestamp must be unix milliseconds"))?;
    let now_ms = state.clock.now().timestamp_millis();
    if !within_skew(now_ms, sent_ms) {
        return Err(unauthorized(
            "stale_timestamp",
            "request timestamp is outside the accepted window",
        ));
    }

    let (device, keys) = match state.pairing.authorize(&device_id).await {
        Ok(found) => found,
        Err(PairingError::NotFound(_)) | Err(PairingError::Invalid(_)) => {
            return Err(unauthorized("unknown_device", "device is not paired"))
        }
        Err(PairingError::NotApproved(_)) => {
            return Err(unauthorized(
                "device_not_approved",
                "device is waiting for approval or was rejected",
            ))
        }
        Err(err) => return Err(("internal", ApiError::internal("auth_internal", err))),
    };

    let timestamp = timestamp.to_string();
    let signature = signature.to_string();
    let encrypted = header_str(&parts.headers, ENCRYPTED_HEADER) == Some("1");

    let bytes = to_bytes(body, MAX_SIGNED_BODY_BYTES).await.map_err(|err| {
        (
            "body_too_large",
            ApiError::payload_too_large("body_too_large", err.to_string()),
        )
    })?;

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or_else(|| parts.uri.path());
    let message = canonical_message(parts.method.as_str(), path, &timestamp, &bytes);
    if !keys.verify(&message, &signature) {
        debug!(device = %device_id, path, "signature mismatch");
        return Err(unauthorized("bad_signature", "signature does not match request"));
    }

    let body = if encrypted {
        let envelope: SealedEnvelope = serde_json::from_slice(&bytes).map_err(|err| {
            (
                "bad_envelope",
                ApiError::invalid("bad_envelope", format!("encrypted body: {err}")),
            )
        })?;
        let plaintext = keys.open(&envelope).map_err(|err| {
            (
                "bad_envelope",
                ApiError::invalid("bad_envelope", err.to_string()),
            )
        })?;
        parts.headers.remove(header::CONTENT_LENGTH);
        parts.headers.remove(ENCRYPTED_HEADER);
        Body::from(plaintext)
    } else {
        Body::from(bytes)
    };

    if let Err(err) = state.pairing.touch(&device_id).await {
        warn!(device = %device_id, error = %err, "failed to record device activity");
    }

    parts.extensions.insert(AuthenticatedDevice {
        id: device_id,
        name: device.name().to_string(),
    });
    Ok(Request::from_parts(parts, body))
}

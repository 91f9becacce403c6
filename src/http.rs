//! JSON-over-HTTP surface. Every response carries `ok`; failures add a
//! machine-readable `code`.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;
use ulid::Ulid;

use crate::audit::hash_identifier;
use crate::engine::{BookingRequest, Engine, EngineError, ReleaseOutcome, SlotRequest};
use crate::limits::MAX_FINGERPRINT_LEN;
use crate::model::{BookingId, Ms, ServiceId};
use crate::observability as obs;

type AppState = Arc<Engine>;

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/locks/create", post(create_lock))
        .route("/locks/extend", post(extend_lock))
        .route("/locks/release", post(release_lock))
        .route("/tables/allocate", post(allocate_table))
        .route("/bookings/commit", post(commit_booking))
        .route("/bookings/cancel", post(cancel_booking))
        .route("/availability/{venue_slug}/{service_id}/{date}", get(availability))
        .with_state(engine)
        .layer(middleware::from_fn(track_metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ── Errors ───────────────────────────────────────────────────────

/// Render a unix-ms instant the way clients expect it.
pub fn rfc3339(ms: Ms) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_default()
}

impl EngineError {
    pub fn status(&self) -> StatusCode {
        match self {
            EngineError::InvalidRequest(_) | EngineError::LimitExceeded(_) => StatusCode::BAD_REQUEST,
            EngineError::VenueNotFound(_)
            | EngineError::ServiceNotFound(_)
            | EngineError::LockNotFound(_)
            | EngineError::BookingNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::SlotLocked { .. } | EngineError::NoTableAvailable(_) => StatusCode::CONFLICT,
            EngineError::LockExpired(_) => StatusCode::GONE,
            EngineError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut body = json!({
            "ok": false,
            "code": self.code(),
            "message": self.to_string(),
        });
        match &self {
            EngineError::SlotLocked { expires_at } => {
                body["expiresAt"] = json!(rfc3339(*expires_at));
            }
            EngineError::NoTableAvailable(alternatives) => {
                body["alternatives"] = json!(alternatives);
            }
            EngineError::Store(e) => {
                error!("internal error: {e}");
                body["message"] = json!("internal error");
            }
            _ => {}
        }
        (status, Json(body)).into_response()
    }
}

fn bad_json(rejection: JsonRejection) -> EngineError {
    EngineError::InvalidRequest(rejection.body_text())
}

type ApiResult = Result<Json<Value>, EngineError>;

// ── Handlers ─────────────────────────────────────────────────────

async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateLockBody {
    #[serde(flatten)]
    slot: SlotRequest,
    #[serde(default)]
    client_fingerprint: Option<String>,
}

/// Fingerprint if supplied, else forwarded address plus user agent.
/// Only the digest ever leaves this function.
fn client_hash(headers: &HeaderMap, fingerprint: Option<&str>) -> Option<String> {
    if let Some(fp) = fingerprint.filter(|f| !f.trim().is_empty()) {
        let end = fp.char_indices().nth(MAX_FINGERPRINT_LEN).map_or(fp.len(), |(i, _)| i);
        return hash_identifier(&[&fp[..end]]);
    }
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("");
    let ip = header("x-forwarded-for")
        .split(',')
        .next()
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .unwrap_or_else(|| header("x-real-ip"));
    hash_identifier(&[ip, header("user-agent")])
}

async fn create_lock(
    State(engine): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<CreateLockBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body.map_err(bad_json)?;
    let client = client_hash(&headers, body.client_fingerprint.as_deref());
    let grant = engine.create_lock(&body.slot, client).await?;
    Ok(Json(json!({
        "ok": true,
        "lockToken": grant.token.to_string(),
        "expiresAt": rfc3339(grant.expires_at),
        "holdMinutes": grant.hold_minutes,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtendBody {
    lock_token: String,
}

async fn extend_lock(State(engine): State<AppState>, body: Result<Json<ExtendBody>, JsonRejection>) -> ApiResult {
    let Json(body) = body.map_err(bad_json)?;
    // A token that cannot parse cannot name a lock.
    let token = Ulid::from_string(body.lock_token.trim())
        .map_err(|_| EngineError::LockNotFound(Ulid::nil()))?;
    let expires_at = engine.extend_lock(token).await?;
    Ok(Json(json!({ "ok": true, "expiresAt": rfc3339(expires_at) })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseBody {
    #[serde(default)]
    lock_token: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Always 200: a hold the caller cannot release lapses on its own.
async fn release_lock(
    State(engine): State<AppState>,
    body: Result<Json<ReleaseBody>, JsonRejection>,
) -> Json<Value> {
    let ok = Json(json!({ "ok": true }));
    let Ok(Json(body)) = body else { return ok };
    let Some(token) = body.lock_token.and_then(|t| Ulid::from_string(t.trim()).ok()) else {
        return ok;
    };
    if engine.release_lock(token, body.reason.as_deref()).await == ReleaseOutcome::Failed {
        tracing::debug!("release of {token} reported success despite store failure");
    }
    ok
}

async fn allocate_table(
    State(engine): State<AppState>,
    body: Result<Json<BookingRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = body.map_err(bad_json)?;
    let allocation = engine.allocate_table(&req).await?;
    Ok(Json(json!({ "ok": true, "allocation": allocation })))
}

async fn commit_booking(
    State(engine): State<AppState>,
    body: Result<Json<BookingRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = body.map_err(bad_json)?;
    let committed = engine.commit_booking(&req).await?;
    Ok(Json(json!({
        "ok": true,
        "bookingId": committed.booking_id.to_string(),
        "allocation": committed.allocation,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelBody {
    booking_id: String,
}

async fn cancel_booking(
    State(engine): State<AppState>,
    body: Result<Json<CancelBody>, JsonRejection>,
) -> ApiResult {
    let Json(body) = body.map_err(bad_json)?;
    let id: BookingId = Ulid::from_string(body.booking_id.trim())
        .map_err(|_| EngineError::InvalidRequest(format!("invalid bookingId: {}", body.booking_id)))?;
    engine.cancel_booking(id).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn availability(
    State(engine): State<AppState>,
    path: Result<Path<(String, ServiceId, String)>, PathRejection>,
) -> ApiResult {
    let Path((venue_slug, service_id, date)) =
        path.map_err(|e| EngineError::InvalidRequest(e.body_text()))?;
    let view = engine.availability(&venue_slug, service_id, &date).await?;
    Ok(Json(json!({
        "ok": true,
        "cached": view.cached,
        "availability": view.availability,
    })))
}

// ── Middleware ───────────────────────────────────────────────────

async fn track_metrics(req: Request, next: Next) -> Response {
    let endpoint = obs::endpoint_label(req.uri().path());
    let start = Instant::now();
    let response = next.run(req).await;
    let status = response.status().as_u16().to_string();
    metrics::counter!(obs::REQUESTS_TOTAL, "endpoint" => endpoint, "status" => status).increment(1);
    metrics::histogram!(obs::REQUEST_DURATION_SECONDS, "endpoint" => endpoint)
        .record(start.elapsed().as_secs_f64());
    response
}

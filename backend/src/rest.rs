use crate::errors::Error;
use crate::model::{Identity, Role, TelemetryRecord};
use crate::store::TelemetryStore;
use crate::token::TokenService;
use crate::users::IdentityProvider;
use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Form, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{error, info};

const DEFAULT_LATEST_LIMIT: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn TelemetryStore>,
    pub tokens: Arc<TokenService>,
    pub identity: Arc<dyn IdentityProvider>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/auth/login", post(login))
        .route("/devices/:device_id/latest", get(latest_data))
        .route("/devices/:device_id/range", get(range_data))
        .route("/devices/:device_id", delete(delete_device))
        .route("/devices/:device_id/control", post(send_control))
        .with_state(state)
}

/// An authenticated caller. Extraction fails with 401 when the bearer token
/// is missing, malformed, tampered or expired; the response does not say
/// which.
pub struct AuthUser(pub Identity);

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(ApiError(Error::InvalidToken))?;

        let identity = state.tokens.verify(token, Utc::now())?;
        Ok(AuthUser(identity))
    }
}

/// An authenticated administrator. Authentication is checked first, so a
/// missing or bad token is 401 rather than 403.
pub struct AdminUser(pub Identity);

#[async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let AuthUser(identity) = AuthUser::from_request_parts(parts, state).await?;

        if identity.role != Role::Admin {
            return Err(ApiError(Error::Forbidden));
        }
        Ok(AdminUser(identity))
    }
}

#[derive(Debug, Deserialize)]
struct LoginForm {
    username: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    Form(form): Form<LoginForm>,
) -> Result<Json<Value>, ApiError> {
    let identity = state.identity.authenticate(&form.username, &form.password)?;
    let token = state
        .tokens
        .issue(&identity.subject, identity.role, Utc::now())?;

    Ok(Json(json!({
        "access_token": token,
        "token_type": "bearer",
    })))
}

#[derive(Debug, Deserialize)]
struct LatestParams {
    limit: Option<usize>,
}

async fn latest_data(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
    Path(device_id): Path<String>,
    Query(params): Query<LatestParams>,
) -> Result<Json<Vec<TelemetryRecord>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LATEST_LIMIT);
    let rows = state.store.latest(&device_id, limit).await?;
    Ok(Json(rows))
}

#[derive(Debug, Deserialize)]
struct RangeParams {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

async fn range_data(
    State(state): State<AppState>,
    AuthUser(_): AuthUser,
    Path(device_id): Path<String>,
    Query(params): Query<RangeParams>,
) -> Result<Json<Vec<TelemetryRecord>>, ApiError> {
    let rows = state
        .store
        .range(&device_id, params.start, params.end)
        .await?;
    Ok(Json(rows))
}

/// Admin-only stub: acknowledges the request but removes no telemetry.
async fn delete_device(
    AdminUser(admin): AdminUser,
    Path(device_id): Path<String>,
) -> Json<Value> {
    info!(
        "Device {} delete requested by {} (no-op: record deletion not implemented)",
        device_id, admin.subject
    );
    Json(json!({ "deleted": device_id }))
}

/// Control stub: echoes the command back. Nothing is dispatched to the
/// device yet; real dispatch needs ack/timeout semantics on the bus.
async fn send_control(
    AuthUser(operator): AuthUser,
    Path(device_id): Path<String>,
    Json(payload): Json<Value>,
) -> Json<Value> {
    info!(
        "Control command for {} accepted from {} (not dispatched: not implemented)",
        device_id, operator.subject
    );
    Json(json!({
        "status": "received",
        "device_id": device_id,
        "payload": payload,
    }))
}

/// Maps domain errors onto HTTP statuses with generic bodies; details go to
/// the log only.
pub struct ApiError(pub Error);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            Error::InvalidCredentials => (StatusCode::UNAUTHORIZED, "Invalid credentials"),
            Error::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid or expired token"),
            Error::Forbidden => (StatusCode::FORBIDDEN, "Admin access required"),
            Error::StoreUnavailable(detail) => {
                error!("Store unavailable while serving request: {}", detail);
                (StatusCode::SERVICE_UNAVAILABLE, "Service unavailable")
            }
            other => {
                error!("Unexpected API error: {}", other);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        (status, Json(json!({ "detail": message }))).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError(err)
    }
}

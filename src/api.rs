//! REST API router for the order queue.
//!
//! Used by the binary and by integration tests. Create with [`create_router`].
//! Uses Extension for state so the router is `Router<()>` and works with `into_make_service()`.
//!
//! Everything under `/api` requires `Authorization: Bearer <token>`; `/health` is public.
//! Engine calls run on the blocking pool, with an abort guard so a request dropped before
//! commit rolls its transaction back.

use axum::{
    extract::{rejection::JsonRejection, Extension, Request},
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use crate::audit::StdoutAuditSink;
use crate::auth::{require_bearer, require_role, AuthContext, Authenticator, JwtService};
use crate::config::{Config, StartupError};
use crate::engine::{EngineSettings, QueueEngine};
use crate::error::{ErrorKind, QueueError};
use crate::notifier::{LogNotifier, Notifier, WebhookNotifier};
use crate::request_counter::{count_requests, RequestCounter};
use crate::store::{AbortSignal, OrderStore};
use crate::types::{FinalizedOrder, Order, OrderId, OrderKind, OrderStatus, OrderSummary, Role};

/// Shared app state: one engine per process.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<QueueEngine>,
    pub jwt: Arc<JwtService>,
    pub requests: Arc<RequestCounter>,
}

impl AppState {
    pub fn new(engine: Arc<QueueEngine>, jwt: Arc<JwtService>) -> Self {
        Self {
            engine,
            jwt,
            requests: Arc::new(RequestCounter::new()),
        }
    }

    /// Opens the store and wires engine, notifier and audit sink as configured.
    pub fn from_config(config: &Config) -> Result<Self, StartupError> {
        let store = Arc::new(OrderStore::open(&config.database_path)?);
        let jwt = Arc::new(JwtService::from_base64_secret(&config.jwt_secret, config.token_lifetime_secs)?);
        let mut engine = QueueEngine::new(store).with_settings(EngineSettings {
            tx_timeout: config.tx_timeout,
            max_retries: config.tx_max_retries,
        });
        if config.audit_stdout {
            engine = engine.with_audit(Arc::new(StdoutAuditSink));
        }
        if config.notifier_enabled {
            let notifier: Arc<dyn Notifier> = match &config.notifier_webhook_url {
                Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
                None => Arc::new(LogNotifier),
            };
            engine = engine.with_notifier(notifier);
        }
        Ok(Self::new(Arc::new(engine), jwt))
    }
}

/// Builds the REST router with state. Returns `Router<()>` so you can call `.into_make_service()` for `axum::serve`.
pub fn create_router(state: AppState) -> Router<()> {
    let auth = Authenticator {
        jwt: state.jwt.clone(),
        store: state.engine.store().clone(),
    };
    let requests = state.requests.clone();

    let protected = Router::new()
        .route("/api/peditos/add", post(add_order))
        .route("/api/peditos/position", get(my_position))
        .route("/api/peditos/meus", get(my_orders))
        .route("/api/peditos/all", get(all_queued))
        .route("/api/peditos/atendimento", get(in_service))
        .route("/api/peditos/next", get(next_order))
        .route("/api/peditos/finnality", put(finalize_order))
        .route("/api/peditos/complete", put(complete_order))
        .route("/api/peditos/cancel", put(cancel_order))
        .route("/api/admin/info/requisitions", get(request_count))
        .route_layer(middleware::from_fn(move |req: Request, next: Next| {
            require_bearer(req, next, auth.clone())
        }));

    Router::new()
        .route("/health", get(health))
        .merge(protected)
        .layer(middleware::from_fn(move |req: Request, next: Next| {
            count_requests(req, next, requests.clone())
        }))
        .layer(Extension(state))
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Unauthenticated | ErrorKind::InvalidCredential => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::InvalidRequest => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyActive | ErrorKind::IllegalState => StatusCode::CONFLICT,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `{ "Error": <reason phrase>, "Message": <detail>, "Status": <code> }`
impl IntoResponse for QueueError {
    fn into_response(self) -> Response {
        let status = status_for(self.kind());
        if status.is_server_error() {
            log::error!("request failed status={} error={}", status.as_u16(), self);
        }
        let body = json!({
            "Error": status.canonical_reason().unwrap_or("Error"),
            "Message": self.to_string(),
            "Status": status.as_u16(),
        });
        (status, Json(body)).into_response()
    }
}

/// Runs an engine call on the blocking pool. If this future is dropped before the call
/// commits, the abort signal fires and the transaction rolls back.
async fn run<T, F>(state: &AppState, op: F) -> Result<T, QueueError>
where
    F: FnOnce(&QueueEngine, &AbortSignal) -> Result<T, QueueError> + Send + 'static,
    T: Send + 'static,
{
    let engine = state.engine.clone();
    let abort = AbortSignal::new();
    let guard = abort.abort_on_drop();
    let joined = tokio::task::spawn_blocking(move || op(&*engine, &abort)).await;
    guard.disarm();
    joined.map_err(|e| QueueError::Internal(format!("engine task failed: {e}")))?
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, QueueError> {
    body.map(|Json(v)| v)
        .map_err(|e| QueueError::InvalidRequest(e.body_text()))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[derive(Deserialize)]
struct AddRequest {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Deserialize)]
struct OrderIdRequest {
    id: i64,
}

async fn add_order(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
    body: Result<Json<AddRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, QueueError> {
    let body = json_body(body)?;
    let kind = OrderKind::from_str(&body.kind)
        .ok_or_else(|| QueueError::InvalidRequest(format!("unknown order type {:?}", body.kind)))?;
    run(&state, move |engine, abort| engine.admit_with(ctx.user_id, kind, abort)).await?;
    Ok(Json(json!({})))
}

async fn my_position(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<u32>, QueueError> {
    let owner = ctx.user_id;
    run(&state, move |engine, _| engine.my_position(owner))
        .await?
        .map(Json)
        .ok_or_else(|| QueueError::NotFound(format!("user {owner} has no queued order")))
}

async fn my_orders(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Vec<OrderSummary>>, QueueError> {
    run(&state, move |engine, _| engine.summaries_by_owner(ctx.user_id))
        .await
        .map(Json)
}

async fn all_queued(Extension(state): Extension<AppState>) -> Result<Json<Vec<Order>>, QueueError> {
    run(&state, |engine, _| engine.list_queued()).await.map(Json)
}

async fn in_service(Extension(state): Extension<AppState>) -> Result<Json<Vec<OrderSummary>>, QueueError> {
    run(&state, |engine, _| engine.summaries_by_status(OrderStatus::Processing))
        .await
        .map(Json)
}

async fn next_order(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Option<Order>>, QueueError> {
    require_role(&ctx, Role::Admin)?;
    run(&state, move |engine, abort| engine.promote_next_with(ctx.user_id, abort))
        .await
        .map(Json)
}

async fn finalize_order(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
    body: Result<Json<OrderIdRequest>, JsonRejection>,
) -> Result<Json<FinalizedOrder>, QueueError> {
    require_role(&ctx, Role::Admin)?;
    let id = OrderId(json_body(body)?.id);
    run(&state, move |engine, abort| engine.finalize_with(id, ctx.user_id, abort))
        .await
        .map(Json)
}

async fn complete_order(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
    body: Result<Json<OrderIdRequest>, JsonRejection>,
) -> Result<Json<Order>, QueueError> {
    require_role(&ctx, Role::Admin)?;
    let id = OrderId(json_body(body)?.id);
    run(&state, move |engine, abort| engine.complete_with(id, ctx.user_id, abort))
        .await
        .map(Json)
}

async fn cancel_order(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<Order>, QueueError> {
    run(&state, move |engine, abort| engine.cancel_with(ctx.user_id, abort))
        .await
        .map(Json)
}

async fn request_count(
    Extension(state): Extension<AppState>,
    Extension(ctx): Extension<AuthContext>,
) -> Result<Json<u64>, QueueError> {
    require_role(&ctx, Role::Admin)?;
    Ok(Json(state.requests.count()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[test]
    fn every_kind_has_a_status() {
        assert_eq!(status_for(ErrorKind::Unauthenticated), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(ErrorKind::InvalidCredential), StatusCode::UNAUTHORIZED);
        assert_eq!(status_for(ErrorKind::Forbidden), StatusCode::FORBIDDEN);
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::AlreadyActive), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::IllegalState), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::Unavailable), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(status_for(ErrorKind::Internal), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn error_body_has_reason_message_and_status() {
        let response = QueueError::AlreadyActive(crate::types::UserId(3)).into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["Error"], "Conflict");
        assert_eq!(json["Status"], 409);
        assert_eq!(json["Message"], "user 3 already has an active order");
    }
}

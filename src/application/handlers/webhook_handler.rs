use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::application::services::alert_intake::{AlertIntakeService, IntakeOutcome};
use crate::auth::{require_webhook_token, WebhookAuth};
use crate::domain::errors::ErrorCategory;
use crate::persistence::DbPool;
use crate::rate_limit::{rate_limit_middleware, GlobalRateLimiter};

/// Largest webhook body accepted
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Shared state of the webhook server
#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub intake: AlertIntakeService,
    pub auth: WebhookAuth,
    pub limiter: GlobalRateLimiter,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub category: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub database: String,
}

/// Build the HTTP surface: `POST /webhook/:source` behind the token check, and
/// `GET /health`. Both share the global rate limit.
pub fn router(state: AppState) -> Router {
    let webhooks = Router::new()
        .route("/webhook/:source", post(receive_webhook))
        .route_layer(middleware::from_fn_with_state(
            state.auth.clone(),
            require_webhook_token,
        ));

    Router::new()
        .route("/health", get(health_check))
        .merge(webhooks)
        .layer(middleware::from_fn_with_state(
            state.limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Accept one alert payload from `source`.
///
/// 200 for accepted, duplicate and ledger-rejected alerts (the outcome is in the body),
/// 422 for payloads that cannot be parsed, 500 when storage fails.
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(source): Path<String>,
    body: String,
) -> Result<(StatusCode, Json<IntakeOutcome>), (StatusCode, Json<ErrorResponse>)> {
    match state.intake.ingest(&source, &body).await {
        Ok(outcome @ IntakeOutcome::Invalid { .. }) => {
            Ok((StatusCode::UNPROCESSABLE_ENTITY, Json(outcome)))
        }
        Ok(outcome) => Ok((StatusCode::OK, Json(outcome))),
        Err(e) => {
            error!("Webhook from {} failed: {}", source, e);
            let status = match e.category() {
                ErrorCategory::Validation => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            Err((
                status,
                Json(ErrorResponse {
                    error: e.to_string(),
                    category: e.category().to_string(),
                }),
            ))
        }
    }
}

/// Liveness plus a database round trip.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => (
            StatusCode::OK,
            Json(HealthResponse {
                status: "ok".to_string(),
                database: "ok".to_string(),
            }),
        ),
        Err(e) => {
            error!("Health check database query failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    status: "degraded".to_string(),
                    database: "unavailable".to_string(),
                }),
            )
        }
    }
}

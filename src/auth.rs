use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use zeroize::Zeroizing;

/// Header carrying the shared webhook secret
pub const AUTH_HEADER: &str = "X-Auth-Token";

/// Shared-secret check for inbound webhooks.
///
/// Without a configured secret every request is let through; the server warns about
/// this once at startup.
#[derive(Clone, Default)]
pub struct WebhookAuth {
    token: Option<Arc<Zeroizing<String>>>,
}

impl std::fmt::Debug for WebhookAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookAuth")
            .field("token", &self.token.as_ref().map(|_| "<REDACTED>"))
            .finish()
    }
}

impl WebhookAuth {
    pub fn new(token: Option<Zeroizing<String>>) -> Self {
        let token = token.filter(|t| !t.trim().is_empty()).map(Arc::new);
        if token.is_none() {
            tracing::warn!(
                "WEBHOOK_SECRET_TOKEN is not set: webhook authentication is DISABLED"
            );
        }
        Self { token }
    }

    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }

    /// Check a presented token.
    pub fn verify(&self, presented: Option<&str>) -> bool {
        match (&self.token, presented) {
            (None, _) => true,
            (Some(expected), Some(presented)) => {
                constant_time_eq(expected.as_bytes(), presented.as_bytes())
            }
            (Some(_), None) => false,
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Middleware rejecting webhook calls without the expected `X-Auth-Token`.
pub async fn require_webhook_token(
    State(auth): State<WebhookAuth>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let presented = request
        .headers()
        .get(AUTH_HEADER)
        .and_then(|v| v.to_str().ok());

    if auth.verify(presented) {
        Ok(next.run(request).await)
    } else {
        match presented {
            Some(_) => tracing::warn!("Invalid webhook token attempted"),
            None => tracing::warn!("Missing {} header", AUTH_HEADER),
        }
        Err(StatusCode::UNAUTHORIZED)
    }
}

use axum::{
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};

use crate::state::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Reject requests that do not carry the configured API key
#[tracing::instrument(skip_all)]
pub async fn api_key_middleware(
    State(state): State<AppState>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if let Some(expected) = &state.api_key {
        let provided = req
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|h| h.to_str().ok());
        if provided != Some(expected.as_ref()) {
            tracing::warn!("Rejected request with missing or invalid API key");
            return Err(StatusCode::UNAUTHORIZED);
        }
    }
    Ok(next.run(req).await)
}

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use jsonwebtoken::{DecodingKey, Validation, decode};

use hearth_types::Session;
use hearth_types::api::Claims;

use crate::auth::AppState;
use crate::error::ApiError;

pub fn decode_token(secret: &str, token: &str) -> Result<Claims, ApiError> {
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &Validation::default(),
    )
    .map(|data| data.claims)
    .map_err(|_| ApiError::unauthorized())
}

/// Extract and validate JWT from Authorization header. Handlers behind this
/// layer receive the caller as `Extension<Session>`.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(ApiError::unauthorized)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or_else(ApiError::unauthorized)?;

    let claims = decode_token(&state.jwt_secret, token)?;

    req.extensions_mut().insert(Session::new(claims.sub));
    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

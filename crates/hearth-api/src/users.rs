use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use hearth_types::Session;
use hearth_types::api::UpdateProfileRequest;

use crate::auth::AppState;
use crate::error::ApiError;

pub async fn get_me(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.messenger.get_user(session.user_id).await?;
    Ok(Json(user))
}

pub async fn update_me(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state
        .messenger
        .update_profile(session, req.full_name, req.photos)
        .await?;
    Ok(Json(user))
}

pub async fn get_user(
    State(state): State<AppState>,
    Extension(_session): Extension<Session>,
    Path(user_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state.messenger.get_user(user_id).await?;
    Ok(Json(user))
}

/// Deletes the account together with every conversation it took part in.
pub async fn delete_me(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<impl IntoResponse, ApiError> {
    let removed = state.messenger.delete_account(session).await?;
    info!(
        "{} deleted their account ({} conversations removed)",
        session.user_id,
        removed.len()
    );
    Ok(StatusCode::NO_CONTENT)
}

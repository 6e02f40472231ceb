use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use hearth_types::Session;
use hearth_types::api::{MessageQuery, SendMessageRequest};

use crate::auth::AppState;
use crate::error::ApiError;

/// Oldest first. Pass the `created_at` of the oldest message held as
/// `before` to page further back.
pub async fn get_messages(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let messages = state
        .messenger
        .list_messages(session, conversation_id, query)
        .await?;
    Ok(Json(messages))
}

pub async fn send_message(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(conversation_id): Path<Uuid>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let message = state
        .messenger
        .send_message(session, conversation_id, req.content)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(message_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let receipt = state.messenger.mark_read(session, message_id).await?;
    Ok(Json(receipt))
}

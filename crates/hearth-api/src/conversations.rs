use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use hearth_types::Session;
use hearth_types::api::{StartConversationRequest, StartConversationResponse};

use crate::auth::AppState;
use crate::error::ApiError;

/// Resolve the one conversation between the caller and another user.
/// 201 when it was created by this call, 200 when it already existed.
pub async fn start_conversation(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Json(req): Json<StartConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let resolved = state
        .messenger
        .start_conversation(session, req.other_user_id)
        .await?;

    let status = if resolved.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(StartConversationResponse {
            conversation_id: resolved.conversation.id,
        }),
    ))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
) -> Result<impl IntoResponse, ApiError> {
    let summaries = state.messenger.list_conversations(session).await?;
    Ok(Json(summaries))
}

/// Mark every unread incoming message of the conversation read. Returns the
/// messages that changed.
pub async fn mark_conversation_read(
    State(state): State<AppState>,
    Extension(session): Extension<Session>,
    Path(conversation_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let marked = state
        .messenger
        .mark_conversation_read(session, conversation_id)
        .await?;
    Ok(Json(marked))
}

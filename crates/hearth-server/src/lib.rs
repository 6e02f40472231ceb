pub mod config;

use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use hearth_api::auth::{self, AppState, AppStateInner};
use hearth_api::middleware::{decode_token, require_auth};
use hearth_api::{ApiError, Messenger, conversations, messages, users};
use hearth_db::Database;
use hearth_gateway::{Dispatcher, connection};
use hearth_types::Session;

pub fn build_state(db: Database, jwt_secret: String) -> AppState {
    Arc::new(AppStateInner {
        messenger: Messenger::new(Arc::new(db), Dispatcher::new()),
        jwt_secret,
    })
}

pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login));

    let protected_routes = Router::new()
        .route(
            "/users/me",
            get(users::get_me).patch(users::update_me).delete(users::delete_me),
        )
        .route("/users/{user_id}", get(users::get_user))
        .route(
            "/conversations",
            get(conversations::list_conversations).post(conversations::start_conversation),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(messages::get_messages).post(messages::send_message),
        )
        .route(
            "/conversations/{conversation_id}/read",
            post(conversations::mark_conversation_read),
        )
        .route("/messages/{message_id}/read", post(messages::mark_read))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let ws_route = Router::new().route("/gateway", get(ws_upgrade));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

#[derive(Debug, Deserialize)]
struct GatewayQuery {
    token: String,
}

/// Browsers cannot set headers on a WebSocket handshake, so the token
/// travels in the query string and is checked before upgrading.
async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<GatewayQuery>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ApiError> {
    let claims = decode_token(&state.jwt_secret, &query.token)?;
    let session = Session::new(claims.sub);
    let dispatcher = state.messenger.dispatcher().clone();
    let db = state.messenger.db().clone();

    Ok(ws.on_upgrade(move |socket| connection::handle_connection(socket, dispatcher, db, session)))
}

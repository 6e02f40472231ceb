use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};
use uuid::Uuid;

use hearth_types::api::{
    ErrorKind, ErrorResponse, LoginRequest, LoginResponse, MessageQuery, RegisterRequest,
    RegisterResponse, SendMessageRequest, StartConversationRequest, StartConversationResponse,
};
use hearth_types::events::{GatewayCommand, GatewayEvent, Notification, Topic};
use hearth_types::models::{ConversationSummary, Message, ReadReceipt};

use crate::backend::{Backend, Feed};
use crate::error::{Result, SyncError};

/// Pause before reconnecting a dropped gateway connection.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Backend over the HTTP API and the WebSocket gateway.
#[derive(Clone)]
pub struct RemoteBackend {
    http: reqwest::Client,
    base_url: String,
    token: String,
    user_id: Uuid,
}

impl RemoteBackend {
    pub fn with_token(base_url: &str, token: String, user_id: Uuid) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            user_id,
        }
    }

    pub async fn register(base_url: &str, email: &str, password: &str, full_name: &str) -> Result<Self> {
        let http = reqwest::Client::new();
        let url = format!("{}/auth/register", base_url.trim_end_matches('/'));
        let resp: RegisterResponse = read_json(http.post(url).json(&RegisterRequest {
            email: email.to_string(),
            password: password.to_string(),
            full_name: full_name.to_string(),
        }))
        .await?;
        Ok(Self::with_token(base_url, resp.token, resp.user_id))
    }

    pub async fn login(base_url: &str, email: &str, password: &str) -> Result<Self> {
        let http = reqwest::Client::new();
        let url = format!("{}/auth/login", base_url.trim_end_matches('/'));
        let resp: LoginResponse = read_json(http.post(url).json(&LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        }))
        .await?;
        Ok(Self::with_token(base_url, resp.token, resp.user_id))
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.http.get(self.url(path)).bearer_auth(&self.token)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.http.post(self.url(path)).bearer_auth(&self.token)
    }

    fn gateway_url(&self) -> String {
        format!(
            "{}/gateway?token={}",
            self.base_url
                .replacen("http://", "ws://", 1)
                .replacen("https://", "wss://", 1),
            self.token
        )
    }
}

/// Send a request and decode the JSON body. Error bodies become
/// `Rejected` with the server's kind and message.
async fn read_json<T: DeserializeOwned>(req: RequestBuilder) -> Result<T> {
    let resp = req.send().await?;
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }

    match resp.json::<ErrorResponse>().await {
        Ok(body) if body.error != ErrorKind::Internal => Err(SyncError::rejected(body.error, body.message)),
        Ok(body) => Err(SyncError::Transport(body.message)),
        Err(_) => Err(rejection_for_status(status)),
    }
}

/// Errors axum produces itself (bad JSON, bad path) carry no error body.
fn rejection_for_status(status: StatusCode) -> SyncError {
    let kind = match status {
        StatusCode::UNAUTHORIZED => ErrorKind::Unauthorized,
        StatusCode::FORBIDDEN => ErrorKind::Forbidden,
        StatusCode::NOT_FOUND => ErrorKind::NotFound,
        StatusCode::CONFLICT => ErrorKind::Conflict,
        s if s.is_client_error() => ErrorKind::Validation,
        s => return SyncError::Transport(format!("server returned {}", s)),
    };
    SyncError::rejected(kind, status.to_string())
}

#[async_trait]
impl Backend for RemoteBackend {
    fn user_id(&self) -> Uuid {
        self.user_id
    }

    async fn start_conversation(&self, other_user_id: Uuid) -> Result<Uuid> {
        let resp: StartConversationResponse = read_json(
            self.post("/conversations")
                .json(&StartConversationRequest { other_user_id }),
        )
        .await?;
        Ok(resp.conversation_id)
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        read_json(self.get("/conversations")).await
    }

    async fn list_messages(&self, conversation_id: Uuid, query: MessageQuery) -> Result<Vec<Message>> {
        read_json(
            self.get(&format!("/conversations/{}/messages", conversation_id))
                .query(&query),
        )
        .await
    }

    async fn send_message(&self, conversation_id: Uuid, content: &str) -> Result<Message> {
        read_json(
            self.post(&format!("/conversations/{}/messages", conversation_id))
                .json(&SendMessageRequest {
                    content: content.to_string(),
                }),
        )
        .await
    }

    async fn mark_read(&self, message_id: Uuid) -> Result<ReadReceipt> {
        read_json(self.post(&format!("/messages/{}/read", message_id))).await
    }

    async fn mark_conversation_read(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        read_json(self.post(&format!("/conversations/{}/read", conversation_id))).await
    }

    /// One gateway connection per feed. A dropped connection is reopened
    /// after a short delay and reported as `Resync`, since changes may
    /// have been missed meanwhile.
    async fn subscribe(&self, topic: Topic) -> Result<Feed> {
        let url = self.gateway_url();
        let first = open_feed(&url, topic).await?;

        let feed = async_stream::stream! {
            let mut socket = Some(first);
            loop {
                let mut ws = match socket.take() {
                    Some(ws) => ws,
                    None => {
                        tokio::time::sleep(RECONNECT_DELAY).await;
                        match open_feed(&url, topic).await {
                            Ok(ws) => {
                                debug!("Gateway feed for {:?} reconnected", topic);
                                yield Notification::Resync;
                                ws
                            }
                            Err(e @ SyncError::Rejected { .. }) => {
                                warn!("Gateway refused {:?} on reconnect: {}", topic, e);
                                break;
                            }
                            Err(e) => {
                                warn!("Gateway reconnect failed: {}", e);
                                continue;
                            }
                        }
                    }
                };

                while let Some(frame) = ws.next().await {
                    match frame {
                        Ok(WsMessage::Text(text)) => match serde_json::from_str::<GatewayEvent>(&text) {
                            Ok(GatewayEvent::Change { topic: t, change }) if t == topic => {
                                yield Notification::Change(change);
                            }
                            Ok(GatewayEvent::Resync { topic: t }) if t == topic => {
                                yield Notification::Resync;
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Bad gateway event: {}", e),
                        },
                        Ok(WsMessage::Close(_)) => break,
                        Ok(_) => {}
                        Err(e) => {
                            warn!("Gateway connection lost: {}", e);
                            break;
                        }
                    }
                }
            }
        };
        Ok(Box::pin(feed))
    }
}

/// Connect, subscribe, and wait for the server's ack so that nothing
/// published afterwards can be missed.
async fn open_feed(url: &str, topic: Topic) -> Result<WsStream> {
    let (mut ws, _) = connect_async(url).await.map_err(|e| match e {
        tungstenite::Error::Http(resp) if resp.status() == StatusCode::UNAUTHORIZED.as_u16() => {
            SyncError::rejected(ErrorKind::Unauthorized, "gateway refused the token")
        }
        e => e.into(),
    })?;

    let command = serde_json::to_string(&GatewayCommand::Subscribe { topic })
        .map_err(|e| SyncError::Transport(e.to_string()))?;
    ws.send(WsMessage::Text(command.into())).await?;

    while let Some(frame) = ws.next().await {
        let WsMessage::Text(text) = frame? else {
            continue;
        };
        match serde_json::from_str::<GatewayEvent>(&text) {
            Ok(GatewayEvent::Subscribed { topic: t }) if t == topic => return Ok(ws),
            Ok(GatewayEvent::Error {
                topic: Some(t),
                kind,
                message,
            }) if t == topic => return Err(SyncError::rejected(kind, message)),
            Ok(_) => {}
            Err(e) => warn!("Bad gateway event: {}", e),
        }
    }
    Err(SyncError::Transport("gateway closed before subscribing".into()))
}

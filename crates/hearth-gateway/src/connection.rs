use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use hearth_db::{Database, policy};
use hearth_types::Session;
use hearth_types::api::ErrorKind;
use hearth_types::events::{GatewayCommand, GatewayEvent, Notification, Topic};

use crate::dispatcher::Dispatcher;

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Forwarding tasks of one connection, one per subscribed topic. Aborted
/// when the connection goes away so that no subscription outlives it.
#[derive(Default)]
struct Forwards(HashMap<Topic, JoinHandle<()>>);

impl Forwards {
    fn stop(&mut self, topic: &Topic) -> bool {
        match self.0.remove(topic) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

impl Drop for Forwards {
    fn drop(&mut self) {
        for (_, handle) in self.0.drain() {
            handle.abort();
        }
    }
}

/// Serve one WebSocket connection. The token was already validated at the
/// HTTP upgrade, so the connection starts with Ready.
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: Dispatcher,
    db: Arc<Database>,
    session: Session,
) {
    let (mut sender, mut receiver) = socket.split();
    let user_id = session.user_id;

    info!("{} connected to gateway", user_id);

    if send_event(&mut sender, &GatewayEvent::Ready { user_id })
        .await
        .is_err()
    {
        return;
    }

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<GatewayEvent>();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Outgoing: queued events plus heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                event = out_rx.recv() => {
                    let Some(event) = event else { break };
                    if send_event(&mut sender, &event).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Default::default())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Incoming: subscribe/unsubscribe commands
    let mut recv_task = tokio::spawn(async move {
        let mut forwards = Forwards::default();

        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<GatewayCommand>(&text) {
                    Ok(cmd) => {
                        handle_command(&dispatcher, &db, session, cmd, &mut forwards, &out_tx).await;
                    }
                    Err(e) => {
                        warn!(
                            "{} bad command: {} -- raw: {}",
                            user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!("{} disconnected from gateway", user_id);
}

async fn handle_command(
    dispatcher: &Dispatcher,
    db: &Arc<Database>,
    session: Session,
    cmd: GatewayCommand,
    forwards: &mut Forwards,
    out_tx: &mpsc::UnboundedSender<GatewayEvent>,
) {
    match cmd {
        GatewayCommand::Subscribe { topic } => {
            if forwards.0.contains_key(&topic) {
                let _ = out_tx.send(GatewayEvent::Subscribed { topic });
                return;
            }

            if let Err(event) = authorize(db, session, topic).await {
                let _ = out_tx.send(event);
                return;
            }

            let mut subscription = dispatcher.subscribe(session.user_id, topic);
            info!("{} subscribed to {:?}", session.user_id, topic);

            // Ack before forwarding starts: anything published from here on
            // is buffered in the subscription and arrives after the ack.
            let _ = out_tx.send(GatewayEvent::Subscribed { topic });

            let tx = out_tx.clone();
            let handle = tokio::spawn(async move {
                while let Some(notification) = subscription.next().await {
                    let event = match notification {
                        Notification::Change(change) => GatewayEvent::Change { topic, change },
                        Notification::Resync => GatewayEvent::Resync { topic },
                    };
                    if tx.send(event).is_err() {
                        break;
                    }
                }
            });
            forwards.0.insert(topic, handle);
        }

        GatewayCommand::Unsubscribe { topic } => {
            if forwards.stop(&topic) {
                debug!("{} unsubscribed from {:?}", session.user_id, topic);
            }
            let _ = out_tx.send(GatewayEvent::Unsubscribed { topic });
        }
    }
}

/// Run the row-level check for a topic. On refusal, returns the error event
/// to send back.
async fn authorize(db: &Arc<Database>, session: Session, topic: Topic) -> Result<(), GatewayEvent> {
    let db = db.clone();
    let result = tokio::task::spawn_blocking(move || {
        db.with_conn(|conn| policy::authorize_topic(conn, &session, &topic))
    })
    .await;

    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            let kind = e.kind();
            let message = if kind == ErrorKind::Internal {
                error!("Authorizing {:?} for {} failed: {}", topic, session.user_id, e);
                "internal error".to_string()
            } else {
                e.to_string()
            };
            Err(GatewayEvent::Error {
                topic: Some(topic),
                kind,
                message,
            })
        }
        Err(e) => {
            error!("spawn_blocking join error: {}", e);
            Err(GatewayEvent::Error {
                topic: Some(topic),
                kind: ErrorKind::Internal,
                message: "internal error".to_string(),
            })
        }
    }
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &GatewayEvent,
) -> Result<(), axum::Error> {
    let text = match serde_json::to_string(event) {
        Ok(text) => text,
        Err(e) => {
            error!("Failed to encode gateway event: {}", e);
            return Ok(());
        }
    };
    sender.send(Message::Text(text.into())).await
}

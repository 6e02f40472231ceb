use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};
use uuid::Uuid;

use hearth_types::events::{Change, Notification, Topic};

const DEFAULT_CAPACITY: usize = 1024;

/// A change plus the users allowed to see it (the conversation's
/// participants at the time of the write).
#[derive(Debug, Clone)]
struct Envelope {
    change: Change,
    audience: Arc<[Uuid]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub user_id: Uuid,
    pub topic: Topic,
}

/// Fans row-level changes out to subscribers.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    /// Every subscription holds a receiver; filtering happens per subscriber.
    broadcast_tx: broadcast::Sender<Envelope>,

    /// Live subscriptions: subscription id -> owner and topic.
    active: Mutex<HashMap<Uuid, SubscriptionInfo>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` is how many changes a slow subscriber may fall behind
    /// before it is told to resync.
    pub fn with_capacity(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(DispatcherInner {
                broadcast_tx,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Publish a change to every subscriber in `audience` whose topic
    /// matches. Returns how many subscriptions were live at send time.
    pub fn publish(&self, change: Change, audience: &[Uuid]) -> usize {
        debug!(
            "Publishing {:?} {:?} in conversation {} to {} users",
            change.operation,
            change.table(),
            change.conversation_id(),
            audience.len()
        );
        self.inner
            .broadcast_tx
            .send(Envelope {
                change,
                audience: audience.into(),
            })
            .unwrap_or(0)
    }

    /// Open a feed for `user_id`. The caller is responsible for checking
    /// the user may see `topic`; delivery is further restricted to changes
    /// whose audience includes the user.
    pub fn subscribe(&self, user_id: Uuid, topic: Topic) -> Subscription {
        let id = Uuid::new_v4();
        let rx = self.inner.broadcast_tx.subscribe();

        self.lock_active()
            .insert(id, SubscriptionInfo { user_id, topic });
        debug!("Subscription {} opened by {} for {:?}", id, user_id, topic);

        Subscription {
            id,
            user_id,
            topic,
            feed: Box::pin(feed(rx, id, user_id, topic)),
            dispatcher: self.clone(),
        }
    }

    pub fn active_subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.lock_active().values().cloned().collect()
    }

    fn unregister(&self, id: Uuid) {
        if self.lock_active().remove(&id).is_some() {
            debug!("Subscription {} closed", id);
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, SubscriptionInfo>> {
        // The map holds plain data; a panic elsewhere cannot leave it torn.
        self.inner
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn feed(
    mut rx: broadcast::Receiver<Envelope>,
    id: Uuid,
    user_id: Uuid,
    topic: Topic,
) -> impl Stream<Item = Notification> + Send {
    async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    if envelope.audience.contains(&user_id) && topic.matches(&envelope.change) {
                        yield Notification::Change(envelope.change);
                    }
                }
                Err(RecvError::Lagged(n)) => {
                    warn!("Subscription {} lagged by {} changes, asking for resync", id, n);
                    yield Notification::Resync;
                }
                Err(RecvError::Closed) => break,
            }
        }
    }
}

/// A live feed of notifications for one user and topic.
///
/// Lazy and unbounded: it yields until closed. Closing (or dropping) it
/// unregisters it from the dispatcher immediately.
pub struct Subscription {
    id: Uuid,
    user_id: Uuid,
    topic: Topic,
    feed: Pin<Box<dyn Stream<Item = Notification> + Send>>,
    dispatcher: Dispatcher,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    /// A fresh feed with the same scope, starting from now.
    pub fn resubscribe(&self) -> Subscription {
        self.dispatcher.subscribe(self.user_id, self.topic)
    }

    pub fn close(self) {}
}

impl Stream for Subscription {
    type Item = Notification;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().feed.as_mut().poll_next(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispatcher.unregister(self.id);
    }
}

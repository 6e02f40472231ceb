use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use uuid::Uuid;

use hearth_api::Messenger;
use hearth_db::Database;
use hearth_gateway::Dispatcher;
use hearth_sync::backend::Feed;
use hearth_sync::error::Result;
use hearth_sync::{
    Backend, ConversationListView, ConversationView, LocalBackend, OutgoingStatus, SyncError,
    ViewUpdate,
};
use hearth_types::Session;
use hearth_types::api::{ErrorKind, MessageQuery};
use hearth_types::events::Topic;
use hearth_types::models::{ConversationSummary, Message, ReadReceipt};

const WAIT: Duration = Duration::from_secs(5);

fn messenger_with_capacity(capacity: usize) -> Messenger {
    Messenger::new(
        Arc::new(Database::open_in_memory().unwrap()),
        Dispatcher::with_capacity(capacity),
    )
}

fn messenger() -> Messenger {
    messenger_with_capacity(1024)
}

fn sign_up(messenger: &Messenger, name: &str) -> LocalBackend {
    let id = Uuid::new_v4();
    messenger
        .db()
        .create_user(id, &format!("{}@example.com", name.to_lowercase()), name, "hash")
        .unwrap();
    LocalBackend::new(messenger.clone(), Session::new(id))
}

async fn next_update(view: &mut ConversationView) -> ViewUpdate {
    tokio::time::timeout(WAIT, view.next_event())
        .await
        .expect("timed out waiting for a conversation event")
        .unwrap()
}

/// Skip echoes of changes the view already holds.
async fn next_change(view: &mut ConversationView) -> ViewUpdate {
    loop {
        match next_update(view).await {
            ViewUpdate::Unchanged => continue,
            update => return update,
        }
    }
}

async fn next_list(view: &mut ConversationListView) -> Vec<ConversationSummary> {
    tokio::time::timeout(WAIT, view.next_event())
        .await
        .expect("timed out waiting for a list event")
        .unwrap()
        .to_vec()
}

#[tokio::test]
async fn test_hello_is_seen_unread_then_read() {
    let messenger = messenger();
    let a: Arc<dyn Backend> = Arc::new(sign_up(&messenger, "Ann"));
    let b: Arc<dyn Backend> = Arc::new(sign_up(&messenger, "Ben"));

    let conversation_id = a.start_conversation(b.user_id()).await.unwrap();
    let mut a_view = ConversationView::open(a.clone(), conversation_id).await.unwrap();
    let mut b_list = ConversationListView::open(b.clone()).await.unwrap();
    assert_eq!(b_list.summaries().len(), 1);
    assert_eq!(b_list.total_unread(), 0);

    let hello = a_view.send("Hello").await.unwrap();
    assert!(a_view.outbox().is_empty());

    // B's list learns about the insert while the message is still unread.
    let summaries = next_list(&mut b_list).await;
    assert_eq!(summaries[0].unread_count, 1);
    let last = summaries[0].last_message.as_ref().unwrap();
    assert_eq!(last.content, "Hello");
    assert_eq!(last.sender_id, a.user_id());

    // Opening the conversation marks it read.
    let b_view = ConversationView::open(b.clone(), conversation_id).await.unwrap();
    assert_eq!(b_view.unread_count(), 0);
    assert!(b_view.message(hello.id).unwrap().is_read());

    // The receipt reaches the sender and the list.
    match next_change(&mut a_view).await {
        ViewUpdate::Upserted(message) => {
            assert_eq!(message.id, hello.id);
            assert!(message.read_at.is_some());
        }
        other => panic!("unexpected {:?}", other),
    }
    let summaries = next_list(&mut b_list).await;
    assert_eq!(summaries[0].unread_count, 0);

    a_view.close();
    b_view.close();
    b_list.close();
}

#[tokio::test]
async fn test_open_view_marks_incoming_messages_read() {
    let messenger = messenger();
    let a: Arc<dyn Backend> = Arc::new(sign_up(&messenger, "Ann"));
    let b: Arc<dyn Backend> = Arc::new(sign_up(&messenger, "Ben"));
    let conversation_id = b.start_conversation(a.user_id()).await.unwrap();

    let mut b_view = ConversationView::open(b.clone(), conversation_id).await.unwrap();
    let sent = a.send_message(conversation_id, "  are you there?  ").await.unwrap();
    assert_eq!(sent.content, "are you there?");

    match next_change(&mut b_view).await {
        ViewUpdate::Upserted(message) => {
            assert_eq!(message.id, sent.id);
            assert!(message.is_read());
        }
        other => panic!("unexpected {:?}", other),
    }

    let stored = a
        .list_messages(conversation_id, MessageQuery::default())
        .await
        .unwrap();
    assert!(stored[0].read_at.is_some());

    // Marking again changes nothing.
    assert!(matches!(
        b.mark_read(sent.id).await.unwrap(),
        ReadReceipt::AlreadyRead { .. }
    ));
}

#[tokio::test]
async fn test_messages_stay_in_creation_order() {
    let messenger = messenger();
    let a: Arc<dyn Backend> = Arc::new(sign_up(&messenger, "Ann"));
    let b: Arc<dyn Backend> = Arc::new(sign_up(&messenger, "Ben"));
    let conversation_id = a.start_conversation(b.user_id()).await.unwrap();

    for i in 0..5 {
        let sender = if i % 2 == 0 { &a } else { &b };
        sender
            .send_message(conversation_id, &format!("message {}", i))
            .await
            .unwrap();
    }

    let view = ConversationView::open(a.clone(), conversation_id).await.unwrap();
    let messages: Vec<&Message> = view.messages().collect();
    assert_eq!(messages.len(), 5);
    assert!(messages.windows(2).all(|w| w[0].created_at < w[1].created_at));
    assert_eq!(messages[4].content, "message 4");
}

#[tokio::test]
async fn test_concurrent_start_from_both_sides() {
    let messenger = messenger();
    let a = sign_up(&messenger, "Ann");
    let b = sign_up(&messenger, "Ben");

    let (from_a, from_b) = tokio::join!(
        a.start_conversation(b.user_id()),
        b.start_conversation(a.user_id())
    );
    assert_eq!(from_a.unwrap(), from_b.unwrap());

    assert_eq!(a.list_conversations().await.unwrap().len(), 1);
    assert_eq!(b.list_conversations().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_outsider_cannot_open_view() {
    let messenger = messenger();
    let a = sign_up(&messenger, "Ann");
    let b = sign_up(&messenger, "Ben");
    let outsider: Arc<dyn Backend> = Arc::new(sign_up(&messenger, "Cat"));
    let conversation_id = a.start_conversation(b.user_id()).await.unwrap();

    match ConversationView::open(outsider, conversation_id).await {
        Err(err) => assert_eq!(err.kind(), Some(ErrorKind::Forbidden)),
        Ok(_) => panic!("outsider opened the conversation"),
    }
    assert!(messenger.dispatcher().active_subscriptions().is_empty());
}

#[tokio::test]
async fn test_close_releases_subscription() {
    let messenger = messenger();
    let a: Arc<dyn Backend> = Arc::new(sign_up(&messenger, "Ann"));
    let b = sign_up(&messenger, "Ben");
    let conversation_id = a.start_conversation(b.user_id()).await.unwrap();

    let view = ConversationView::open(a.clone(), conversation_id).await.unwrap();
    let list = ConversationListView::open(a).await.unwrap();
    assert_eq!(messenger.dispatcher().active_subscriptions().len(), 2);

    view.close();
    list.close();
    assert!(messenger.dispatcher().active_subscriptions().is_empty());
}

#[tokio::test]
async fn test_lagging_view_refetches() {
    let messenger = messenger_with_capacity(2);
    let a: Arc<dyn Backend> = Arc::new(sign_up(&messenger, "Ann"));
    let b: Arc<dyn Backend> = Arc::new(sign_up(&messenger, "Ben"));
    let conversation_id = a.start_conversation(b.user_id()).await.unwrap();
    let mut b_view = ConversationView::open(b.clone(), conversation_id).await.unwrap();

    for i in 0..6 {
        a.send_message(conversation_id, &format!("burst {}", i))
            .await
            .unwrap();
    }

    assert_eq!(next_update(&mut b_view).await, ViewUpdate::Refreshed);
    assert_eq!(b_view.len(), 6);
    assert_eq!(b_view.unread_count(), 0);
}

#[tokio::test]
async fn test_load_older_pages_back() {
    let messenger = messenger();
    let a: Arc<dyn Backend> = Arc::new(sign_up(&messenger, "Ann"));
    let b = sign_up(&messenger, "Ben");
    let conversation_id = a.start_conversation(b.user_id()).await.unwrap();

    let total = hearth_types::api::DEFAULT_PAGE_SIZE as usize + 7;
    for i in 0..total {
        a.send_message(conversation_id, &format!("#{}", i)).await.unwrap();
    }

    let mut view = ConversationView::open(a.clone(), conversation_id).await.unwrap();
    assert_eq!(view.len(), hearth_types::api::DEFAULT_PAGE_SIZE as usize);
    assert!(view.has_older());

    assert_eq!(view.load_older().await.unwrap(), 7);
    assert!(!view.has_older());
    assert_eq!(view.messages().next().unwrap().content, "#0");
}

/// Local backend whose sends can be switched off and whose fetches can be
/// made to fail a given number of times.
struct FlakyBackend {
    inner: LocalBackend,
    offline: AtomicBool,
    failing_fetches: AtomicUsize,
}

impl FlakyBackend {
    fn new(inner: LocalBackend) -> Self {
        Self {
            inner,
            offline: AtomicBool::new(false),
            failing_fetches: AtomicUsize::new(0),
        }
    }

    fn fetch_fails(&self) -> bool {
        self.failing_fetches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Backend for FlakyBackend {
    fn user_id(&self) -> Uuid {
        self.inner.user_id()
    }

    async fn start_conversation(&self, other_user_id: Uuid) -> Result<Uuid> {
        self.inner.start_conversation(other_user_id).await
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        if self.fetch_fails() {
            return Err(SyncError::Transport("connection reset".into()));
        }
        self.inner.list_conversations().await
    }

    async fn list_messages(&self, conversation_id: Uuid, query: MessageQuery) -> Result<Vec<Message>> {
        if self.fetch_fails() {
            return Err(SyncError::Transport("connection reset".into()));
        }
        self.inner.list_messages(conversation_id, query).await
    }

    async fn send_message(&self, conversation_id: Uuid, content: &str) -> Result<Message> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("offline".into()));
        }
        self.inner.send_message(conversation_id, content).await
    }

    async fn mark_read(&self, message_id: Uuid) -> Result<ReadReceipt> {
        self.inner.mark_read(message_id).await
    }

    async fn mark_conversation_read(&self, conversation_id: Uuid) -> Result<Vec<Message>> {
        self.inner.mark_conversation_read(conversation_id).await
    }

    async fn subscribe(&self, topic: Topic) -> Result<Feed> {
        self.inner.subscribe(topic).await
    }
}

#[tokio::test]
async fn test_failed_send_keeps_draft_and_can_be_retried() {
    let messenger = messenger();
    let flaky = Arc::new(FlakyBackend::new(sign_up(&messenger, "Ann")));
    flaky.offline.store(true, Ordering::SeqCst);
    let b = sign_up(&messenger, "Ben");
    let conversation_id = flaky.start_conversation(b.user_id()).await.unwrap();
    let mut view = ConversationView::open(flaky.clone(), conversation_id).await.unwrap();

    view.set_draft("see you at 8");
    let err = view.send_draft().await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(view.draft(), "see you at 8");
    assert!(view.is_empty());

    let failed = view.outbox()[0].clone();
    assert_eq!(failed.content, "see you at 8");
    assert!(matches!(failed.status, OutgoingStatus::Failed(_)));

    flaky.offline.store(false, Ordering::SeqCst);
    let sent = view.retry(failed.local_id).await.unwrap();
    assert_eq!(sent.content, "see you at 8");
    assert!(view.outbox().is_empty());
    assert_eq!(view.draft(), "");
    assert_eq!(view.message(sent.id), Some(&sent));
}

#[tokio::test]
async fn test_rejected_send_is_distinguishable_from_pending() {
    let messenger = messenger();
    let a: Arc<dyn Backend> = Arc::new(sign_up(&messenger, "Ann"));
    let b = sign_up(&messenger, "Ben");
    let conversation_id = a.start_conversation(b.user_id()).await.unwrap();
    let mut view = ConversationView::open(a.clone(), conversation_id).await.unwrap();

    // The other side leaving removes the conversation.
    messenger
        .delete_account(Session::new(b.user_id()))
        .await
        .unwrap();

    let err = view.send("anyone?").await.unwrap_err();
    assert_eq!(err.kind(), Some(ErrorKind::NotFound));
    assert_eq!(view.outbox().len(), 1);
    assert_ne!(view.outbox()[0].status, OutgoingStatus::Pending);
}

#[tokio::test]
async fn test_receipts_for_older_messages_leave_no_gap() {
    let messenger = messenger();
    let a: Arc<dyn Backend> = Arc::new(sign_up(&messenger, "Ann"));
    let b: Arc<dyn Backend> = Arc::new(sign_up(&messenger, "Ben"));
    let conversation_id = a.start_conversation(b.user_id()).await.unwrap();

    for (sender, count) in [(&a, 10), (&b, 10), (&a, 50)] {
        for i in 0..count {
            sender
                .send_message(conversation_id, &format!("{} #{}", sender.user_id(), i))
                .await
                .unwrap();
        }
    }

    let mut a_view = ConversationView::open(a.clone(), conversation_id).await.unwrap();
    assert_eq!(a_view.len(), 50);

    // Ben reads everything, including Ann's ten oldest messages that lie
    // outside both windows.
    let mut b_view = ConversationView::open(b.clone(), conversation_id).await.unwrap();
    assert_eq!(b_view.len(), 50);

    while let Some(update) = a_view.next_event().now_or_never() {
        update.unwrap();
    }
    assert_eq!(a_view.len(), 50);

    for view in [&mut a_view, &mut b_view] {
        while view.load_older().await.unwrap() > 0 {}
        assert!(!view.has_older());
        assert_eq!(view.len(), 70);
        let from_ben = view.messages().filter(|m| m.sender_id == b.user_id()).count();
        assert_eq!(from_ben, 10);
        let messages: Vec<&Message> = view.messages().collect();
        assert!(messages.windows(2).all(|w| w[0].created_at < w[1].created_at));
    }
    assert!(a_view.messages().all(|m| m.sender_id != a.user_id() || m.is_read()));
}

#[tokio::test]
async fn test_failed_resync_is_retried_before_folding_more() {
    let messenger = messenger_with_capacity(2);
    let a = sign_up(&messenger, "Ann");
    let flaky = Arc::new(FlakyBackend::new(sign_up(&messenger, "Ben")));
    let conversation_id = a.start_conversation(flaky.user_id()).await.unwrap();
    let mut view = ConversationView::open(flaky.clone(), conversation_id).await.unwrap();

    for i in 0..6 {
        a.send_message(conversation_id, &format!("burst {}", i))
            .await
            .unwrap();
    }

    flaky.failing_fetches.store(1, Ordering::SeqCst);
    let err = tokio::time::timeout(WAIT, view.next_event())
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.is_transient());
    assert!(view.needs_refresh());

    assert_eq!(next_update(&mut view).await, ViewUpdate::Refreshed);
    assert!(!view.needs_refresh());
    assert_eq!(view.len(), 6);
    assert_eq!(view.unread_count(), 0);
}

#[tokio::test]
async fn test_failed_list_refresh_is_retried() {
    let messenger = messenger_with_capacity(2);
    let a = sign_up(&messenger, "Ann");
    let flaky = Arc::new(FlakyBackend::new(sign_up(&messenger, "Ben")));
    let conversation_id = a.start_conversation(flaky.user_id()).await.unwrap();
    let mut list = ConversationListView::open(flaky.clone()).await.unwrap();

    for i in 0..6 {
        a.send_message(conversation_id, &format!("burst {}", i))
            .await
            .unwrap();
    }

    flaky.failing_fetches.store(1, Ordering::SeqCst);
    assert!(list.next_event().await.unwrap_err().is_transient());
    assert!(list.needs_refresh());
    assert_eq!(list.total_unread(), 0);

    let summaries = next_list(&mut list).await;
    assert_eq!(summaries[0].unread_count, 6);
    assert!(!list.needs_refresh());
}

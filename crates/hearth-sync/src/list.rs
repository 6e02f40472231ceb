use std::sync::Arc;

use futures_util::{FutureExt, StreamExt};
use tracing::debug;
use uuid::Uuid;

use hearth_types::events::Topic;
use hearth_types::models::ConversationSummary;

use crate::backend::{Backend, Feed};
use crate::error::{Result, SyncError};

/// The signed-in user's conversation list, re-projected by the store
/// whenever a message or participant change reaches the user.
pub struct ConversationListView {
    backend: Arc<dyn Backend>,
    feed: Feed,
    summaries: Vec<ConversationSummary>,
    /// A change arrived but the re-fetch for it has not succeeded yet.
    needs_refresh: bool,
}

impl ConversationListView {
    pub async fn open(backend: Arc<dyn Backend>) -> Result<Self> {
        let feed = backend.subscribe(Topic::AllConversations).await?;
        let mut view = Self {
            backend,
            feed,
            summaries: Vec::new(),
            needs_refresh: false,
        };
        view.refresh().await?;
        Ok(view)
    }

    /// Most recently active first.
    pub fn summaries(&self) -> &[ConversationSummary] {
        &self.summaries
    }

    pub fn get(&self, conversation_id: Uuid) -> Option<&ConversationSummary> {
        self.summaries
            .iter()
            .find(|s| s.conversation.id == conversation_id)
    }

    pub fn total_unread(&self) -> u32 {
        self.summaries.iter().map(|s| s.unread_count).sum()
    }

    pub async fn refresh(&mut self) -> Result<()> {
        self.summaries = self.backend.list_conversations().await?;
        self.needs_refresh = false;
        Ok(())
    }

    /// Wait for a change, then re-fetch the list. Notifications already
    /// queued behind it are folded into the same fetch. A fetch that failed
    /// last time is retried before waiting again.
    pub async fn next_event(&mut self) -> Result<&[ConversationSummary]> {
        if self.needs_refresh {
            self.refresh().await?;
            return Ok(&self.summaries);
        }

        if self.feed.next().await.is_none() {
            return Err(SyncError::Closed);
        }
        let mut coalesced = 0;
        while let Some(Some(_)) = self.feed.next().now_or_never() {
            coalesced += 1;
        }
        if coalesced > 0 {
            debug!("Coalesced {} list notifications", coalesced);
        }

        self.needs_refresh = true;
        self.refresh().await?;
        Ok(&self.summaries)
    }

    pub fn needs_refresh(&self) -> bool {
        self.needs_refresh
    }

    pub fn close(self) {}
}

use std::sync::Arc;

use roomchat_storage::{
    DocumentStore, MessageRecord, NewMessage, RoomId, RoomQuery, Snapshot, Subscription,
};
use snafu::ResultExt;

use super::composer::Composer;
use super::scroll::ScrollTracker;
use super::view::{MessageRow, classify_rows};
use crate::error::{AppendSnafu, ChatResult, SubscribeSnafu};
use crate::identity::{Identity, IdentityProvider};

/// Lifecycle of the room subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamPhase {
    Closed,
    /// Registered with the store, first snapshot not seen yet.
    Subscribing,
    Live,
}

/// Why a send produced no write. The end user sees nothing; callers may.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    EmptyText,
    MissingIdentity,
    NoOpenRoom,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent(MessageRecord),
    Skipped(SkipReason),
}

enum StreamState {
    Closed,
    Open {
        subscription: Subscription,
        live: bool,
    },
}

/// A validated send that no longer borrows the stream.
///
/// The target room is fixed when the send is prepared, so switching rooms
/// while it is in flight neither cancels nor redirects it.
pub struct PendingSend {
    store: Arc<dyn DocumentStore>,
    message: NewMessage,
}

impl PendingSend {
    pub fn room_id(&self) -> &RoomId {
        &self.message.room_id
    }

    pub async fn submit(self) -> ChatResult<MessageRecord> {
        let room_id = self.message.room_id.to_string();
        self.store
            .append(self.message)
            .await
            .context(AppendSnafu {
                stage: "room-send-append",
                room_id,
            })
    }
}

/// Live, ordered view of one chat room plus its message box.
pub struct RoomMessageStream {
    store: Arc<dyn DocumentStore>,
    identity: Arc<dyn IdentityProvider>,
    state: StreamState,
    messages: Vec<MessageRecord>,
    composer: Composer,
    scroll: ScrollTracker,
}

impl RoomMessageStream {
    pub fn new(store: Arc<dyn DocumentStore>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            store,
            identity,
            state: StreamState::Closed,
            messages: Vec::new(),
            composer: Composer::new(),
            scroll: ScrollTracker::new(),
        }
    }

    pub fn phase(&self) -> StreamPhase {
        match &self.state {
            StreamState::Closed => StreamPhase::Closed,
            StreamState::Open { live: false, .. } => StreamPhase::Subscribing,
            StreamState::Open { live: true, .. } => StreamPhase::Live,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.state, StreamState::Open { .. })
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        match &self.state {
            StreamState::Closed => None,
            StreamState::Open { subscription, .. } => Some(subscription.room_id()),
        }
    }

    pub fn messages(&self) -> &[MessageRecord] {
        &self.messages
    }

    pub fn rows(&self) -> Vec<MessageRow<'_>> {
        let viewer = self.identity.current_identity();
        classify_rows(&self.messages, viewer.as_ref().map(|identity| identity.id.as_str()))
    }

    pub fn composer(&self) -> &Composer {
        &self.composer
    }

    pub fn composer_mut(&mut self) -> &mut Composer {
        &mut self.composer
    }

    pub fn scroll(&self) -> &ScrollTracker {
        &self.scroll
    }

    pub fn take_scroll_request(&mut self) -> Option<usize> {
        self.scroll.take_scroll_request()
    }

    /// Starts following `room_id`, releasing any previous room first.
    ///
    /// Returns as soon as the live query is registered; the first snapshot
    /// arrives through [`Self::next_snapshot`] or [`Self::drain_snapshots`].
    pub fn open_room(&mut self, room_id: RoomId) -> ChatResult<()> {
        if self.room_id() == Some(&room_id) {
            return Ok(());
        }

        self.close_room();

        let subscription = self
            .store
            .subscribe_ordered(RoomQuery::room(room_id.clone()))
            .context(SubscribeSnafu {
                stage: "room-open-subscribe",
                room_id: room_id.to_string(),
            })?;
        self.state = StreamState::Open {
            subscription,
            live: false,
        };

        tracing::info!("opened room '{room_id}'");
        Ok(())
    }

    /// Releases the live query and clears the view. Safe to call when closed.
    pub fn close_room(&mut self) -> bool {
        let StreamState::Open {
            mut subscription, ..
        } = std::mem::replace(&mut self.state, StreamState::Closed)
        else {
            return false;
        };

        subscription.unsubscribe();
        self.messages.clear();
        self.scroll.reset();
        tracing::info!("closed room '{}'", subscription.room_id());
        true
    }

    /// Replaces the view with `snapshot` if it belongs to the open room.
    pub fn apply_snapshot(&mut self, snapshot: Snapshot) -> bool {
        let StreamState::Open { subscription, live } = &mut self.state else {
            return false;
        };
        if subscription.room_id() != &snapshot.room_id {
            tracing::debug!(
                "ignoring snapshot for room '{}' while '{}' is open",
                snapshot.room_id,
                subscription.room_id()
            );
            return false;
        }

        *live = true;
        self.messages = snapshot.messages;
        self.scroll.request_scroll_to_bottom(self.messages.len());
        tracing::debug!(
            "applied snapshot with {} message(s) to room '{}'",
            self.messages.len(),
            snapshot.room_id
        );
        true
    }

    /// Waits for the next snapshot of the open room and applies it.
    ///
    /// Returns `None` when no room is open or the store ended the query.
    pub async fn next_snapshot(&mut self) -> Option<&[MessageRecord]> {
        let StreamState::Open { subscription, .. } = &mut self.state else {
            return None;
        };

        let snapshot = subscription.recv().await?;
        self.apply_snapshot(snapshot);
        Some(self.messages.as_slice())
    }

    /// Applies every snapshot already delivered, without waiting.
    pub fn drain_snapshots(&mut self) -> usize {
        let mut applied = 0;
        loop {
            let StreamState::Open { subscription, .. } = &mut self.state else {
                return applied;
            };
            let Some(snapshot) = subscription.try_recv() else {
                return applied;
            };
            if self.apply_snapshot(snapshot) {
                applied += 1;
            }
        }
    }

    /// Validates a send against the open room without touching the store.
    ///
    /// Emptiness is judged on the trimmed text; the text is stored as typed.
    pub fn prepare_send(
        &self,
        text: &str,
        identity: Option<&Identity>,
    ) -> Result<PendingSend, SkipReason> {
        if text.trim().is_empty() {
            return Err(SkipReason::EmptyText);
        }
        let Some(identity) = identity.filter(|identity| identity.is_complete()) else {
            return Err(SkipReason::MissingIdentity);
        };
        let Some(room_id) = self.room_id() else {
            return Err(SkipReason::NoOpenRoom);
        };

        Ok(PendingSend {
            store: Arc::clone(&self.store),
            message: NewMessage {
                room_id: room_id.clone(),
                text: text.to_string(),
                author_display_name: identity.display_name.clone(),
                author_id: identity.id.clone(),
            },
        })
    }

    /// Clears the message box once the store has acknowledged the write.
    pub fn finish_send(&mut self, result: &ChatResult<MessageRecord>) {
        if result.is_ok() {
            self.composer.clear();
        }
    }

    pub async fn send(
        &mut self,
        text: &str,
        identity: Option<&Identity>,
    ) -> ChatResult<SendOutcome> {
        let pending = match self.prepare_send(text, identity) {
            Ok(pending) => pending,
            Err(reason) => {
                tracing::debug!("send skipped: {reason:?}");
                return Ok(SendOutcome::Skipped(reason));
            }
        };

        let result = pending.submit().await;
        self.finish_send(&result);
        result.map(SendOutcome::Sent)
    }

    /// Sends the message box contents as the current identity.
    pub async fn submit(&mut self) -> ChatResult<SendOutcome> {
        let text = self.composer.text().to_string();
        let identity = self.identity.current_identity();
        self.send(&text, identity.as_ref()).await
    }
}

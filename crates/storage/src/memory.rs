use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use snafu::ensure;

use super::error::{StorageResult, UnavailableSnafu};
use super::ids::{MessageId, RoomId};
use super::subscription::{SubscriberRegistry, Subscription};
use super::types::{MessageRecord, NewMessage, RoomQuery, ServerTimestamp, Snapshot, room_order};
use super::{BoxFuture, DocumentStore, unix_timestamp_micros};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStoreOptions {
    /// Publish a snapshot carrying the new message with a pending timestamp
    /// before the write commits, the way latency-compensating clients do.
    pub emit_pending_writes: bool,
}

struct MemoryState {
    messages: Vec<MessageRecord>,
    last_timestamp: u64,
    available: bool,
    append_calls: usize,
}

/// Process-local store, used by tests and the `--memory` mode of the binary.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    registry: Arc<SubscriberRegistry>,
    options: MemoryStoreOptions,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_options(MemoryStoreOptions::default())
    }

    pub fn with_options(options: MemoryStoreOptions) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                messages: Vec::new(),
                last_timestamp: 0,
                available: true,
                append_calls: 0,
            }),
            registry: SubscriberRegistry::new(),
            options,
        }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Toggles simulated outages; while unavailable every append fails.
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Number of `append` calls received, including rejected ones.
    pub fn append_calls(&self) -> usize {
        self.lock().append_calls
    }

    /// Inserts a fully specified record as another writer would, keeping its
    /// timestamp, and notifies the room.
    pub fn seed(&self, record: MessageRecord) {
        let mut state = self.lock();
        if let ServerTimestamp::Resolved(micros) = record.created_at {
            state.last_timestamp = state.last_timestamp.max(micros);
        }
        let room_id = record.room_id.clone();
        state.messages.push(record);
        let version = self.registry.advance_version();
        self.registry
            .publish(&room_snapshot(&state.messages, &room_id, version));
    }

    pub fn list_room(&self, room_id: &RoomId) -> Snapshot {
        let state = self.lock();
        room_snapshot(&state.messages, room_id, self.registry.current_version())
    }

    fn publish_pending(&self, input: &NewMessage) -> StorageResult<()> {
        let state = self.lock();
        ensure!(
            state.available,
            UnavailableSnafu {
                stage: "memory-append-pending",
            }
        );

        let mut messages = state.messages.clone();
        messages.push(MessageRecord {
            id: MessageId::new_v7(),
            room_id: input.room_id.clone(),
            text: input.text.clone(),
            author_display_name: input.author_display_name.clone(),
            author_id: input.author_id.clone(),
            created_at: ServerTimestamp::Pending,
        });
        let version = self.registry.advance_version();
        self.registry
            .publish(&room_snapshot(&messages, &input.room_id, version));
        Ok(())
    }

    /// Replaces a published pending write with the committed room contents.
    fn retract_pending(&self, room_id: &RoomId) {
        let state = self.lock();
        let version = self.registry.advance_version();
        let listeners = self
            .registry
            .publish(&room_snapshot(&state.messages, room_id, version));
        tracing::debug!("retracted pending write in room '{room_id}' for {listeners} listener(s)");
    }

    fn commit(&self, input: NewMessage) -> StorageResult<MessageRecord> {
        let mut state = self.lock();
        ensure!(
            state.available,
            UnavailableSnafu {
                stage: "memory-append-commit",
            }
        );

        let created_at = unix_timestamp_micros().max(state.last_timestamp + 1);
        state.last_timestamp = created_at;

        let record = MessageRecord {
            id: MessageId::new_v7(),
            room_id: input.room_id,
            text: input.text,
            author_display_name: input.author_display_name,
            author_id: input.author_id,
            created_at: ServerTimestamp::Resolved(created_at),
        };
        state.messages.push(record.clone());

        let version = self.registry.advance_version();
        let listeners = self
            .registry
            .publish(&room_snapshot(&state.messages, &record.room_id, version));
        tracing::debug!(
            "committed message {} to room '{}' for {listeners} listener(s)",
            record.id,
            record.room_id
        );
        Ok(record)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DocumentStore for MemoryStore {
    fn subscribe_ordered(&self, query: RoomQuery) -> StorageResult<Subscription> {
        // Holding the state lock keeps the initial snapshot ahead of any later commit.
        let state = self.lock();
        let subscription = self.registry.register(query);
        self.registry.deliver(
            subscription.id(),
            room_snapshot(
                &state.messages,
                subscription.room_id(),
                self.registry.current_version(),
            ),
        );
        Ok(subscription)
    }

    fn append(&self, input: NewMessage) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            self.lock().append_calls += 1;

            if !self.options.emit_pending_writes {
                return self.commit(input);
            }

            self.publish_pending(&input)?;
            tokio::task::yield_now().await;

            let room_id = input.room_id.clone();
            let committed = self.commit(input);
            if committed.is_err() {
                self.retract_pending(&room_id);
            }
            committed
        })
    }
}

fn room_snapshot(messages: &[MessageRecord], room_id: &RoomId, version: u64) -> Snapshot {
    let mut selected = messages
        .iter()
        .filter(|message| &message.room_id == room_id)
        .cloned()
        .collect::<Vec<_>>();
    selected.sort_by(room_order);

    Snapshot {
        room_id: room_id.clone(),
        version,
        messages: selected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;

    fn room(raw: &str) -> RoomId {
        RoomId::parse(raw).expect("room id")
    }

    fn new_message(room_id: &RoomId, text: &str) -> NewMessage {
        NewMessage {
            room_id: room_id.clone(),
            text: text.to_string(),
            author_display_name: "Alice".to_string(),
            author_id: "u1".to_string(),
        }
    }

    fn seeded(room_id: &RoomId, text: &str, micros: u64) -> MessageRecord {
        MessageRecord {
            id: MessageId::new_v7(),
            room_id: room_id.clone(),
            text: text.to_string(),
            author_display_name: "Bob".to_string(),
            author_id: "u2".to_string(),
            created_at: ServerTimestamp::Resolved(micros),
        }
    }

    #[tokio::test]
    async fn subscribe_delivers_current_snapshot_immediately() {
        let store = MemoryStore::new();
        let job42 = room("job42");
        store.seed(seeded(&job42, "hi", 10));

        let mut subscription = store
            .subscribe_ordered(RoomQuery::room(job42.clone()))
            .expect("subscribe");
        let initial = subscription.try_recv().expect("initial snapshot");

        assert_eq!(initial.room_id, job42);
        assert_eq!(initial.messages.len(), 1);
        assert_eq!(initial.messages[0].text, "hi");
    }

    #[tokio::test]
    async fn append_assigns_increasing_timestamps_and_publishes() {
        let store = MemoryStore::new();
        let job42 = room("job42");
        let mut subscription = store
            .subscribe_ordered(RoomQuery::room(job42.clone()))
            .expect("subscribe");
        assert_eq!(subscription.try_recv().map(|snapshot| snapshot.len()), Some(0));

        let first = store.append(new_message(&job42, "one")).await.expect("append");
        let second = store.append(new_message(&job42, "two")).await.expect("append");
        assert!(first.created_at < second.created_at);

        let latest = subscription.recv().await.expect("first publish");
        assert_eq!(latest.len(), 1);
        let latest = subscription.recv().await.expect("second publish");
        let texts = latest
            .messages
            .iter()
            .map(|message| message.text.as_str())
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["one", "two"]);
        assert_eq!(store.append_calls(), 2);
    }

    #[tokio::test]
    async fn seeded_records_are_ordered_by_timestamp() {
        let store = MemoryStore::new();
        let job42 = room("job42");
        store.seed(seeded(&job42, "third", 30));
        store.seed(seeded(&job42, "first", 10));
        store.seed(seeded(&job42, "second", 20));

        let texts = store
            .list_room(&job42)
            .messages
            .into_iter()
            .map(|message| message.text)
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["first", "second", "third"]);

        let appended = store.append(new_message(&job42, "fourth")).await.expect("append");
        assert!(appended.created_at > ServerTimestamp::Resolved(30));
    }

    #[tokio::test]
    async fn pending_write_is_published_before_commit() {
        let store = MemoryStore::with_options(MemoryStoreOptions {
            emit_pending_writes: true,
        });
        let job42 = room("job42");
        store.seed(seeded(&job42, "hi", 10));
        let mut subscription = store
            .subscribe_ordered(RoomQuery::room(job42.clone()))
            .expect("subscribe");
        subscription.try_recv().expect("initial snapshot");

        store.append(new_message(&job42, "hey")).await.expect("append");

        let pending = subscription.try_recv().expect("pending snapshot");
        assert_eq!(pending.len(), 2);
        assert!(pending.messages[1].created_at.is_pending());
        assert_eq!(pending.messages[1].text, "hey");

        let committed = subscription.try_recv().expect("committed snapshot");
        assert_eq!(committed.len(), 2);
        assert!(!committed.messages[1].created_at.is_pending());
    }

    #[tokio::test]
    async fn failed_commit_retracts_the_pending_write() {
        let store = Arc::new(MemoryStore::with_options(MemoryStoreOptions {
            emit_pending_writes: true,
        }));
        let job42 = room("job42");
        let mut subscription = store
            .subscribe_ordered(RoomQuery::room(job42.clone()))
            .expect("subscribe");
        subscription.try_recv().expect("initial snapshot");

        let writer = Arc::clone(&store);
        let message = new_message(&job42, "ghost");
        let append = tokio::spawn(async move { writer.append(message).await });
        let pending = subscription.recv().await.expect("pending snapshot");
        assert!(pending.messages[0].created_at.is_pending());

        store.set_available(false);
        let error = append
            .await
            .expect("append task")
            .expect_err("commit fails");
        assert!(matches!(error, StorageError::Unavailable { .. }));

        let retracted = subscription.try_recv().expect("corrective snapshot");
        assert!(retracted.is_empty());
        assert!(retracted.version > pending.version);
        assert!(store.list_room(&job42).is_empty());
    }

    #[tokio::test]
    async fn unavailable_store_rejects_appends() {
        let store = MemoryStore::new();
        let job42 = room("job42");
        store.set_available(false);

        let error = store
            .append(new_message(&job42, "lost"))
            .await
            .expect_err("append fails");
        assert!(matches!(error, StorageError::Unavailable { .. }));
        assert!(store.list_room(&job42).is_empty());
        assert_eq!(store.append_calls(), 1);

        store.set_available(true);
        store.append(new_message(&job42, "kept")).await.expect("append");
        assert_eq!(store.list_room(&job42).len(), 1);
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let store = MemoryStore::new();
        let job42 = room("job42");
        let job7 = room("job7");
        let mut other = store
            .subscribe_ordered(RoomQuery::room(job7.clone()))
            .expect("subscribe");
        other.try_recv().expect("initial snapshot");

        store.append(new_message(&job42, "only here")).await.expect("append");

        assert!(other.try_recv().is_none());
        assert!(store.list_room(&job7).is_empty());
    }
}

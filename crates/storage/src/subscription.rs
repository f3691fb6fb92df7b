use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

use super::ids::{RoomId, SubscriptionId};
use super::types::{RoomQuery, Snapshot};

struct SubscriberEntry {
    room_id: RoomId,
    sender: mpsc::UnboundedSender<Snapshot>,
    delivered_version: Option<u64>,
}

impl SubscriberEntry {
    fn offer(&mut self, snapshot: Snapshot) -> bool {
        // A snapshot read before the last delivered one reflects older store state.
        if self
            .delivered_version
            .is_some_and(|delivered| snapshot.version < delivered)
        {
            return true;
        }

        self.delivered_version = Some(snapshot.version);
        self.sender.send(snapshot).is_ok()
    }
}

/// Per-store table of live queries.
///
/// Each subscriber gets its own copy of every snapshot for its room; nothing
/// is shared between subscribers after fan-out. The registry also owns the
/// store's change counter that stamps [`Snapshot::version`].
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: Mutex<HashMap<SubscriptionId, SubscriberEntry>>,
    version: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Version of the latest change recorded so far.
    pub fn current_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Records a change to the store and returns its version. Call it after
    /// the change is visible to readers and before loading the snapshot
    /// that will carry it.
    pub fn advance_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn register(self: &Arc<Self>, query: RoomQuery) -> Subscription {
        let id = SubscriptionId::new_v7();
        let (sender, snapshots) = mpsc::unbounded_channel();
        self.lock().insert(
            id,
            SubscriberEntry {
                room_id: query.room_id.clone(),
                sender,
                delivered_version: None,
            },
        );
        tracing::debug!("registered live query {id} for room '{}'", query.room_id);

        Subscription {
            id,
            room_id: query.room_id,
            snapshots,
            registry: Some(Arc::clone(self)),
        }
    }

    /// Sends a snapshot to one subscriber, typically its initial result set.
    pub fn deliver(&self, id: SubscriptionId, snapshot: Snapshot) -> bool {
        let mut subscribers = self.lock();
        let Some(entry) = subscribers.get_mut(&id) else {
            return false;
        };
        if entry.room_id != snapshot.room_id {
            return false;
        }

        let delivered = entry.offer(snapshot);
        if !delivered {
            subscribers.remove(&id);
        }
        delivered
    }

    /// Fans a snapshot out to every subscriber of its room and returns how
    /// many subscribers are still listening.
    pub fn publish(&self, snapshot: &Snapshot) -> usize {
        let mut subscribers = self.lock();
        subscribers.retain(|_, entry| {
            entry.room_id != snapshot.room_id || entry.offer(snapshot.clone())
        });
        subscribers
            .values()
            .filter(|entry| entry.room_id == snapshot.room_id)
            .count()
    }

    pub fn remove(&self, id: SubscriptionId) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            tracing::debug!("released live query {id}");
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    pub fn room_subscriber_count(&self, room_id: &RoomId) -> usize {
        self.lock()
            .values()
            .filter(|entry| &entry.room_id == room_id)
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriptionId, SubscriberEntry>> {
        // Entries stay structurally valid even if a holder panicked mid-publish.
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to one live query.
///
/// Dropping the handle releases the query; [`Subscription::unsubscribe`]
/// does the same eagerly and may be called any number of times.
pub struct Subscription {
    id: SubscriptionId,
    room_id: RoomId,
    snapshots: mpsc::UnboundedReceiver<Snapshot>,
    registry: Option<Arc<SubscriberRegistry>>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn is_active(&self) -> bool {
        self.registry.is_some()
    }

    pub async fn recv(&mut self) -> Option<Snapshot> {
        self.snapshots.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Snapshot> {
        self.snapshots.try_recv().ok()
    }

    pub fn unsubscribe(&mut self) -> bool {
        let Some(registry) = self.registry.take() else {
            return false;
        };

        let removed = registry.remove(self.id);
        self.snapshots.close();
        while self.snapshots.try_recv().is_ok() {}
        removed
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl Stream for Subscription {
    type Item = Snapshot;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Snapshot>> {
        self.get_mut().snapshots.poll_recv(cx)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Subscription")
            .field("id", &self.id)
            .field("room_id", &self.room_id)
            .field("active", &self.is_active())
            .finish()
    }
}

use std::future::Future;
use std::pin::Pin;
use std::time::{SystemTime, UNIX_EPOCH};

pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod subscription;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use ids::{MessageId, RoomId, SubscriptionId};
pub use memory::{MemoryStore, MemoryStoreOptions};
pub use sqlite::SqliteStore;
pub use subscription::{SubscriberRegistry, Subscription};
pub use types::{MessageRecord, NewMessage, RoomQuery, ServerTimestamp, Snapshot, room_order};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Document store holding chat messages.
///
/// `subscribe_ordered` registers a live query and returns without waiting
/// for data; the store pushes the complete ordered result set into the
/// returned handle once immediately and again after every matching write.
pub trait DocumentStore: Send + Sync {
    fn subscribe_ordered(&self, query: RoomQuery) -> StorageResult<Subscription>;
    fn append(&self, input: NewMessage) -> BoxFuture<'_, StorageResult<MessageRecord>>;
}

pub(crate) fn unix_timestamp_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_micros() as u64)
}

use std::cmp::Ordering;

use super::ids::{MessageId, RoomId};

/// Commit time assigned by the store, never by the submitting client.
///
/// `Pending` marks a write the store has not committed yet. It orders after
/// every resolved timestamp so unconfirmed messages stay at the tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerTimestamp {
    Resolved(u64),
    Pending,
}

impl ServerTimestamp {
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Pending)
    }
}

impl Ord for ServerTimestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::Resolved(left), Self::Resolved(right)) => left.cmp(right),
            (Self::Resolved(_), Self::Pending) => Ordering::Less,
            (Self::Pending, Self::Resolved(_)) => Ordering::Greater,
            (Self::Pending, Self::Pending) => Ordering::Equal,
        }
    }
}

impl PartialOrd for ServerTimestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub room_id: RoomId,
    pub text: String,
    // Captured at send time; later renames do not rewrite history.
    pub author_display_name: String,
    pub author_id: String,
    pub created_at: ServerTimestamp,
}

/// Append payload. `created_at` is absent on purpose: the store assigns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub room_id: RoomId,
    pub text: String,
    pub author_display_name: String,
    pub author_id: String,
}

/// Live query over one room, ordered by `created_at` ascending.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomQuery {
    pub room_id: RoomId,
}

impl RoomQuery {
    pub fn room(room_id: RoomId) -> Self {
        Self { room_id }
    }
}

/// Complete ordered result set of a [`RoomQuery`] at one point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub room_id: RoomId,
    /// Store change counter at the time the result set was read.
    pub version: u64,
    pub messages: Vec<MessageRecord>,
}

impl Snapshot {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Room ordering shared by every store: `created_at` ascending, message id
/// as the deterministic tie-break.
pub fn room_order(left: &MessageRecord, right: &MessageRecord) -> Ordering {
    left.created_at
        .cmp(&right.created_at)
        .then_with(|| left.id.cmp(&right.id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_sorts_after_resolved() {
        let mut stamps = vec![
            ServerTimestamp::Pending,
            ServerTimestamp::Resolved(30),
            ServerTimestamp::Resolved(10),
        ];
        stamps.sort();

        assert_eq!(
            stamps,
            vec![
                ServerTimestamp::Resolved(10),
                ServerTimestamp::Resolved(30),
                ServerTimestamp::Pending,
            ]
        );
    }

    #[test]
    fn equal_timestamps_fall_back_to_message_id() {
        let room_id = RoomId::parse("job42").expect("room id");
        let make = |id: MessageId| MessageRecord {
            id,
            room_id: room_id.clone(),
            text: "tie".to_string(),
            author_display_name: "Bob".to_string(),
            author_id: "u2".to_string(),
            created_at: ServerTimestamp::Resolved(5),
        };
        let first = make(MessageId::new_v7());
        let second = make(MessageId::new_v7());

        assert_eq!(room_order(&first, &second), first.id.cmp(&second.id));
        assert_eq!(room_order(&first, &first), Ordering::Equal);
    }
}

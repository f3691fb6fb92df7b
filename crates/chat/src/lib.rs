#![deny(unsafe_code)]
//! Real-time room chat for the marketplace.
//!
//! Messages live in a [`roomchat_storage::DocumentStore`]; a
//! [`room::RoomMessageStream`] follows one room through a live query and
//! sends on behalf of the identity it was given.

pub mod error;
pub mod identity;
pub mod room;
pub mod settings;

pub use error::{ChatError, ChatResult};
pub use identity::{Identity, IdentityProvider, SessionIdentity};
pub use room::{
    Alignment, Composer, MessageRow, PendingSend, RoomMessageStream, ScrollTracker, SendOutcome,
    SkipReason, StreamPhase, parse_room,
};
pub use settings::{ChatSettings, SettingsError, SettingsStore};

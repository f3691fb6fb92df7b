pub mod composer;
pub mod scroll;
pub mod stream;
pub mod view;

use roomchat_storage::RoomId;
use snafu::ResultExt;

use crate::error::{ChatResult, InvalidRoomSnafu};

pub use composer::Composer;
pub use scroll::ScrollTracker;
pub use stream::{PendingSend, RoomMessageStream, SendOutcome, SkipReason, StreamPhase};
pub use view::{Alignment, MessageRow, classify_rows, render_transcript};

/// Parses user input into a room id.
pub fn parse_room(raw: &str) -> ChatResult<RoomId> {
    RoomId::parse(raw).context(InvalidRoomSnafu {
        stage: "parse-room",
        raw: raw.to_string(),
    })
}

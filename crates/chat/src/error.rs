use roomchat_storage::StorageError;
use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("room id '{raw}' is not usable on `{stage}`: {source}"))]
    InvalidRoom {
        stage: &'static str,
        raw: String,
        source: StorageError,
    },
    #[snafu(display("failed to subscribe to room '{room_id}' on `{stage}`: {source}"))]
    Subscribe {
        stage: &'static str,
        room_id: String,
        source: StorageError,
    },
    #[snafu(display("failed to send message to room '{room_id}' on `{stage}`: {source}"))]
    Append {
        stage: &'static str,
        room_id: String,
        source: StorageError,
    },
}

pub type ChatResult<T> = Result<T, ChatError>;

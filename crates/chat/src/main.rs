use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use roomchat::room::render_transcript;
use roomchat::{
    ChatError, ChatResult, ChatSettings, IdentityProvider, RoomMessageStream, SessionIdentity,
    SettingsError, SettingsStore, parse_room,
};
use roomchat_storage::{
    DocumentStore, MemoryStore, MessageRecord, RoomId, SqliteStore, StorageError,
};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::{JoinError, JoinSet};
use tracing_subscriber::EnvFilter;

const TRANSCRIPT_WIDTH: usize = 72;

#[derive(Debug, Clone, Default)]
struct CliArgs {
    room: Option<String>,
    display_name: Option<String>,
    user_id: Option<String>,
    db_path: Option<String>,
    memory: bool,
    config_path: Option<PathBuf>,
}

#[derive(Debug, Snafu)]
enum CliError {
    #[snafu(display("missing value for argument '{arg}'"))]
    MissingArgumentValue {
        stage: &'static str,
        arg: &'static str,
    },
    #[snafu(display("unknown argument '{raw}'"))]
    UnknownArgument { stage: &'static str, raw: String },
    #[snafu(display("failed to open message store: {source}"))]
    OpenStore {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("{source}"))]
    Chat {
        stage: &'static str,
        source: ChatError,
    },
    #[snafu(display("failed to save settings: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("failed to read input: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
}

type CliResult<T> = Result<T, CliError>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Send(String),
    Room(String),
    Close,
    Quit,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("roomchat: {error}");
        std::process::exit(1);
    }
}

async fn run() -> CliResult<()> {
    let args = parse_args(env::args().skip(1))?;
    let settings_store = args
        .config_path
        .clone()
        .map_or_else(SettingsStore::load, SettingsStore::new);
    let settings = remember_args(&settings_store, &args)?;
    init_tracing(&settings.log_filter);
    tracing::debug!("settings loaded from {}", settings_store.config_path().display());

    let store: Arc<dyn DocumentStore> = if args.memory {
        Arc::new(MemoryStore::new())
    } else {
        let location = args
            .db_path
            .clone()
            .unwrap_or_else(|| settings.database_location.clone());
        Arc::new(
            SqliteStore::open(&location)
                .await
                .context(OpenStoreSnafu {
                    stage: "open-message-store",
                })?,
        )
    };

    let identity = Arc::new(SessionIdentity::new());
    match settings.identity() {
        Some(current) => identity.sign_in(current),
        None => tracing::warn!("no identity configured; pass --name and --user to send messages"),
    }

    let mut stream = RoomMessageStream::new(store, identity.clone());
    if let Some(room) = settings.last_room.as_deref() {
        let room_id = parse_room(room).context(ChatSnafu {
            stage: "parse-initial-room",
        })?;
        stream.open_room(room_id).context(ChatSnafu {
            stage: "open-initial-room",
        })?;
    }

    let mut sends = JoinSet::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context(ReadInputSnafu { stage: "read-stdin-line" })? else {
                    break;
                };

                match parse_command(&line) {
                    Some(Command::Quit) => break,
                    Some(Command::Close) => {
                        stream.close_room();
                    }
                    Some(Command::Room(raw)) => switch_room(&mut stream, &settings_store, &raw),
                    Some(Command::Send(text)) => {
                        // Submitted on its own task so typing and room switches keep flowing.
                        match stream.prepare_send(&text, identity.current_identity().as_ref()) {
                            Ok(pending) => {
                                tracing::debug!("sending to room '{}'", pending.room_id());
                                sends.spawn(pending.submit());
                            }
                            Err(reason) => tracing::debug!("send skipped: {reason:?}"),
                        }
                    }
                    None => {}
                }
            }
            Some(joined) = sends.join_next() => report_send(joined),
            snapshot = stream.next_snapshot(), if stream.is_open() => {
                let ended = snapshot.is_none();
                if ended {
                    tracing::warn!("live query ended by the store");
                    stream.close_room();
                } else {
                    redraw(&mut stream);
                }
            }
        }
    }

    // Sends already handed to the store still get their acknowledgement.
    drain_sends(&mut sends).await;
    stream.close_room();
    Ok(())
}

async fn drain_sends(sends: &mut JoinSet<ChatResult<MessageRecord>>) -> usize {
    let mut finished = 0;
    while let Some(joined) = sends.join_next().await {
        report_send(joined);
        finished += 1;
    }
    finished
}

fn report_send(joined: Result<ChatResult<MessageRecord>, JoinError>) {
    match joined {
        Ok(Ok(record)) => tracing::debug!("message {} acknowledged", record.id),
        Ok(Err(error)) => tracing::error!("{error}"),
        Err(error) => tracing::error!("send task failed: {error}"),
    }
}

fn parse_args(args: impl IntoIterator<Item = String>) -> CliResult<CliArgs> {
    let mut parsed = CliArgs::default();
    let mut pending = args.into_iter();

    while let Some(argument) = pending.next() {
        match argument.as_str() {
            "--room" => {
                parsed.room = Some(pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-room-value",
                    arg: "--room",
                })?);
            }
            "--name" => {
                parsed.display_name = Some(pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-name-value",
                    arg: "--name",
                })?);
            }
            "--user" => {
                parsed.user_id = Some(pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-user-value",
                    arg: "--user",
                })?);
            }
            "--db" => {
                parsed.db_path = Some(pending.next().context(MissingArgumentValueSnafu {
                    stage: "parse-args-db-value",
                    arg: "--db",
                })?);
            }
            "--config" => {
                parsed.config_path = Some(PathBuf::from(pending.next().context(
                    MissingArgumentValueSnafu {
                        stage: "parse-args-config-value",
                        arg: "--config",
                    },
                )?));
            }
            "--memory" => parsed.memory = true,
            _ => {
                return UnknownArgumentSnafu {
                    stage: "parse-args",
                    raw: argument,
                }
                .fail();
            }
        }
    }

    Ok(parsed)
}

fn parse_command(line: &str) -> Option<Command> {
    let Some(command) = line.strip_prefix('/') else {
        return Some(Command::Send(line.to_string()));
    };

    match command.split_once(' ') {
        Some(("room", room)) => Some(Command::Room(room.to_string())),
        None if command == "close" => Some(Command::Close),
        None if command == "quit" => Some(Command::Quit),
        _ => {
            eprintln!("commands: /room <id>, /close, /quit");
            None
        }
    }
}

/// Command-line identity and room become the new remembered defaults.
fn remember_args(store: &SettingsStore, args: &CliArgs) -> CliResult<Arc<ChatSettings>> {
    let current = store.settings();
    if args.room.is_none() && args.display_name.is_none() && args.user_id.is_none() {
        return Ok(current);
    }

    let mut updated = current.as_ref().clone();
    if let Some(room) = &args.room {
        updated.last_room = Some(room.clone());
    }
    if let Some(display_name) = &args.display_name {
        updated.display_name = Some(display_name.clone());
    }
    if let Some(user_id) = &args.user_id {
        updated.user_id = Some(user_id.clone());
    }

    store.update(updated).context(SettingsSnafu {
        stage: "persist-cli-settings",
    })?;
    Ok(store.settings())
}

fn switch_room(stream: &mut RoomMessageStream, settings_store: &SettingsStore, raw: &str) {
    let room_id = match parse_room(raw) {
        Ok(room_id) => room_id,
        Err(error) => {
            eprintln!("{error}");
            return;
        }
    };

    if let Err(error) = stream.open_room(room_id.clone()) {
        tracing::error!("{error}");
        return;
    }
    remember_room(settings_store, &room_id);
}

fn remember_room(settings_store: &SettingsStore, room_id: &RoomId) {
    let mut updated = settings_store.settings().as_ref().clone();
    updated.last_room = Some(room_id.to_string());
    if let Err(error) = settings_store.update(updated) {
        tracing::warn!("failed to remember room '{room_id}': {error}");
    }
}

fn redraw(stream: &mut RoomMessageStream) {
    // A terminal is always scrolled to its tail, so the request only gates the redraw.
    if stream.take_scroll_request().is_none() {
        return;
    }

    let room = stream.room_id().map(ToString::to_string).unwrap_or_default();
    println!("--- {room} ---");
    print!("{}", render_transcript(&stream.rows(), TRANSCRIPT_WIDTH));
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn parses_every_flag() {
        let parsed = parse_args(args(&[
            "--room", "job42", "--name", "Alice", "--user", "u1", "--db", "chat.db", "--memory",
            "--config", "conf.json",
        ]))
        .expect("valid args");

        assert_eq!(parsed.room.as_deref(), Some("job42"));
        assert_eq!(parsed.display_name.as_deref(), Some("Alice"));
        assert_eq!(parsed.user_id.as_deref(), Some("u1"));
        assert_eq!(parsed.db_path.as_deref(), Some("chat.db"));
        assert!(parsed.memory);
        assert_eq!(parsed.config_path, Some(PathBuf::from("conf.json")));
    }

    #[test]
    fn rejects_missing_values_and_unknown_flags() {
        assert!(matches!(
            parse_args(args(&["--room"])),
            Err(CliError::MissingArgumentValue { arg: "--room", .. })
        ));
        assert!(matches!(
            parse_args(args(&["--verbose"])),
            Err(CliError::UnknownArgument { .. })
        ));
    }

    #[tokio::test]
    async fn quitting_waits_for_in_flight_sends() {
        let store = Arc::new(MemoryStore::new());
        let identity = Arc::new(SessionIdentity::new());
        let mut stream = RoomMessageStream::new(store.clone(), identity);
        let job42 = parse_room("job42").expect("room id");
        stream.open_room(job42.clone()).expect("open");
        let alice = roomchat::Identity::new("Alice", "u1");

        let mut sends = JoinSet::new();
        for text in ["one", "two"] {
            let pending = stream.prepare_send(text, Some(&alice)).expect("valid send");
            sends.spawn(pending.submit());
        }

        assert_eq!(drain_sends(&mut sends).await, 2);
        assert_eq!(store.list_room(&job42).len(), 2);
    }

    #[test]
    fn commands_and_plain_text_are_distinguished() {
        assert_eq!(
            parse_command("  hello "),
            Some(Command::Send("  hello ".to_string()))
        );
        assert_eq!(
            parse_command("/room job7"),
            Some(Command::Room("job7".to_string()))
        );
        assert_eq!(parse_command("/close"), Some(Command::Close));
        assert_eq!(parse_command("/quit"), Some(Command::Quit));
        assert_eq!(parse_command("/dance"), None);
    }
}

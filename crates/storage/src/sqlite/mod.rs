use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, SqlitePool};

use super::error::{
    CreateSqliteDirectorySnafu, InvariantViolationSnafu, RuntimeUnavailableSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu,
    SqliteQuerySnafu, StorageResult,
};
use super::ids::{MessageId, RoomId};
use super::subscription::{SubscriberRegistry, Subscription};
use super::types::{MessageRecord, NewMessage, RoomQuery, ServerTimestamp, Snapshot};
use super::{BoxFuture, DocumentStore, unix_timestamp_micros};

/// SQLite-backed message store with in-process live queries.
///
/// Live queries only observe writes made through this handle (or its
/// clones); another process writing the same file is not seen until the
/// next local write to the room.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    registry: Arc<SubscriberRegistry>,
}

impl SqliteStore {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // An in-memory database lives exactly as long as its single connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::info!("opened message store at {database_url} (journal_mode={journal_mode})");
        Ok(Self {
            pool,
            registry: SubscriberRegistry::new(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub async fn list_room(&self, room_id: &RoomId) -> StorageResult<Snapshot> {
        let version = self.registry.current_version();
        load_room_snapshot(&self.pool, room_id, version, "sqlite-list-room").await
    }

    async fn insert_message(&self, input: NewMessage) -> StorageResult<MessageRecord> {
        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "message-append-begin",
        })?;

        let last_created_at =
            sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(created_at) FROM messages")
                .fetch_one(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-append-last-created-at",
                })?
                .map(|value| i64_to_u64(value, "message-append-last-created-at"))
                .transpose()?
                .unwrap_or(0);

        // Commit order and timestamp order must agree even if the wall clock steps back.
        let created_at = unix_timestamp_micros().max(last_created_at + 1);
        let message_id = MessageId::new_v7();

        sqlx::query(
            "INSERT INTO messages (id, room_id, text, author_display_name, author_id, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(message_id.to_string())
        .bind(input.room_id.as_str())
        .bind(input.text.as_str())
        .bind(input.author_display_name.as_str())
        .bind(input.author_id.as_str())
        .bind(u64_to_i64(created_at, "message-append-created-at")?)
        .execute(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-append-insert",
        })?;

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "message-append-commit",
        })?;

        Ok(MessageRecord {
            id: message_id,
            room_id: input.room_id,
            text: input.text,
            author_display_name: input.author_display_name,
            author_id: input.author_id,
            created_at: ServerTimestamp::Resolved(created_at),
        })
    }
}

impl DocumentStore for SqliteStore {
    fn subscribe_ordered(&self, query: RoomQuery) -> StorageResult<Subscription> {
        let runtime = tokio::runtime::Handle::try_current()
            .ok()
            .context(RuntimeUnavailableSnafu {
                stage: "sqlite-subscribe-runtime",
            })?;

        let subscription = self.registry.register(query);
        let subscription_id = subscription.id();
        let room_id = subscription.room_id().clone();
        let pool = self.pool.clone();
        let registry = Arc::clone(&self.registry);

        runtime.spawn(async move {
            // Read before the query so a commit racing the load outranks this snapshot.
            let version = registry.current_version();
            match load_room_snapshot(&pool, &room_id, version, "sqlite-subscribe-initial").await {
                Ok(snapshot) => {
                    registry.deliver(subscription_id, snapshot);
                }
                Err(error) => {
                    tracing::warn!("failed to load initial snapshot for room '{room_id}': {error}");
                }
            }
        });

        Ok(subscription)
    }

    fn append(&self, input: NewMessage) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        Box::pin(async move {
            let record = self.insert_message(input).await?;
            let version = self.registry.advance_version();

            // The write is durable at this point; a failed refresh only delays listeners.
            match load_room_snapshot(
                &self.pool,
                &record.room_id,
                version,
                "message-append-snapshot",
            )
            .await
            {
                Ok(snapshot) => {
                    self.registry.publish(&snapshot);
                }
                Err(error) => {
                    tracing::warn!(
                        "message {} committed but room '{}' refresh failed: {error}",
                        record.id,
                        record.room_id
                    );
                }
            }

            Ok(record)
        })
    }
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    room_id: String,
    text: String,
    author_display_name: String,
    author_id: String,
    created_at: Option<i64>,
}

async fn load_room_snapshot(
    pool: &SqlitePool,
    room_id: &RoomId,
    version: u64,
    stage: &'static str,
) -> StorageResult<Snapshot> {
    let rows = sqlx::query_as::<_, MessageRow>(
        "SELECT id, room_id, text, author_display_name, author_id, created_at FROM messages WHERE room_id = ? ORDER BY created_at IS NULL, created_at ASC, id ASC",
    )
    .bind(room_id.as_str())
    .fetch_all(pool)
    .await
    .context(SqliteQuerySnafu { stage })?;

    let messages = rows
        .into_iter()
        .map(message_row_to_record)
        .collect::<StorageResult<Vec<_>>>()?;

    Ok(Snapshot {
        room_id: room_id.clone(),
        version,
        messages,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        room_id: RoomId::parse(row.room_id)?,
        text: row.text,
        author_display_name: row.author_display_name,
        author_id: row.author_id,
        created_at: match row.created_at {
            Some(value) => ServerTimestamp::Resolved(i64_to_u64(value, "message-row-created-at")?),
            None => ServerTimestamp::Pending,
        },
    })
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value.try_into().ok().context(InvariantViolationSnafu {
        stage,
        details: format!("negative sqlite integer '{value}' cannot map to u64"),
    })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value.try_into().ok().context(InvariantViolationSnafu {
        stage,
        details: format!("u64 '{value}' cannot map to sqlite i64"),
    })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}

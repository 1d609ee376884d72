use async_trait::async_trait;
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    PgPool, SqlitePool,
};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::error::{StoreError, UpsertStep};
use crate::models::{AppId, EnrichedRecord};

/// Writes enriched records. Each statement commits on its own; a failed
/// sub-step abandons the rest of that record only.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert(&self, record: &EnrichedRecord) -> Result<(), StoreError>;

    /// Release the connection. Safe to call more than once.
    async fn close(&self);
}

/// What an existing `games` row takes from a re-crawled record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictRefresh {
    /// Only the name is refreshed.
    NameOnly,
    /// Everything is refreshed, except that an empty description or image
    /// never overwrites a stored one.
    #[default]
    PreserveNonEmpty,
}

impl ConflictRefresh {
    fn upsert_sql(self) -> &'static str {
        match self {
            ConflictRefresh::NameOnly => UPSERT_GAME_NAME_ONLY,
            ConflictRefresh::PreserveNonEmpty => UPSERT_GAME_PRESERVE_NON_EMPTY,
        }
    }
}

impl FromStr for ConflictRefresh {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "name-only" | "name_only" | "name" => Ok(ConflictRefresh::NameOnly),
            "preserve-non-empty" | "preserve_non_empty" | "all" => {
                Ok(ConflictRefresh::PreserveNonEmpty)
            }
            other => Err(format!(
                "unknown conflict refresh {other:?} (expected name-only | preserve-non-empty)"
            )),
        }
    }
}

// `$n` placeholders are understood by both the Postgres and SQLite drivers.
const UPSERT_GAME_NAME_ONLY: &str = "INSERT INTO games (appid, name, description, image_url, review_count, localized) \
     VALUES ($1, $2, $3, $4, $5, $6) \
     ON CONFLICT (appid) DO UPDATE SET name = excluded.name";

const UPSERT_GAME_PRESERVE_NON_EMPTY: &str = "INSERT INTO games (appid, name, description, image_url, review_count, localized) \
     VALUES ($1, $2, $3, $4, $5, $6) \
     ON CONFLICT (appid) DO UPDATE SET \
       name = excluded.name, \
       description = CASE WHEN excluded.description <> '' THEN excluded.description ELSE games.description END, \
       image_url = CASE WHEN excluded.image_url <> '' THEN excluded.image_url ELSE games.image_url END, \
       review_count = excluded.review_count, \
       localized = excluded.localized";

const SELECT_GAME_ID: &str = "SELECT id FROM games WHERE appid = $1";
const INSERT_TAG: &str = "INSERT INTO tags (name) VALUES ($1) ON CONFLICT (name) DO NOTHING";
const SELECT_TAG_ID: &str = "SELECT id FROM tags WHERE name = $1";
const LINK_GAME_TAG: &str =
    "INSERT INTO game_tags (game_id, tag_id) VALUES ($1, $2) ON CONFLICT (game_id, tag_id) DO NOTHING";

const PG_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS games (
    id           BIGSERIAL PRIMARY KEY,
    appid        BIGINT  NOT NULL UNIQUE,
    name         TEXT    NOT NULL,
    description  TEXT    NOT NULL DEFAULT '',
    image_url    TEXT    NOT NULL DEFAULT '',
    review_count BIGINT  NOT NULL DEFAULT 0,
    localized    BOOLEAN NOT NULL DEFAULT FALSE
);
CREATE TABLE IF NOT EXISTS tags (
    id   BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS game_tags (
    game_id BIGINT NOT NULL REFERENCES games (id) ON DELETE CASCADE,
    tag_id  BIGINT NOT NULL REFERENCES tags (id) ON DELETE CASCADE,
    PRIMARY KEY (game_id, tag_id)
);
"#;

const SQLITE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS games (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    appid        INTEGER NOT NULL UNIQUE,
    name         TEXT    NOT NULL,
    description  TEXT    NOT NULL DEFAULT '',
    image_url    TEXT    NOT NULL DEFAULT '',
    review_count INTEGER NOT NULL DEFAULT 0,
    localized    BOOLEAN NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS tags (
    id   INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);
CREATE TABLE IF NOT EXISTS game_tags (
    game_id INTEGER NOT NULL REFERENCES games (id) ON DELETE CASCADE,
    tag_id  INTEGER NOT NULL REFERENCES tags (id) ON DELETE CASCADE,
    PRIMARY KEY (game_id, tag_id)
);
"#;

fn statement_error(step: UpsertStep, appid: AppId) -> impl FnOnce(sqlx::Error) -> StoreError {
    move |source| StoreError::Statement {
        step,
        appid,
        source,
    }
}

// Same statement sequence for every pool type: upsert game, resolve its id,
// then insert-if-absent / resolve / link for each tag.
macro_rules! upsert_record {
    ($pool:expr, $refresh:expr, $record:expr) => {{
        let pool = $pool;
        let record: &EnrichedRecord = $record;
        sqlx::query($refresh.upsert_sql())
            .bind(record.id)
            .bind(record.display_name.as_str())
            .bind(record.description.as_str())
            .bind(record.image_url.as_str())
            .bind(record.popularity_count)
            .bind(record.localization_flag)
            .execute(pool)
            .await
            .map_err(statement_error(UpsertStep::Game, record.id))?;

        let game_id: i64 = sqlx::query_scalar(SELECT_GAME_ID)
            .bind(record.id)
            .fetch_one(pool)
            .await
            .map_err(statement_error(UpsertStep::GameId, record.id))?;

        for tag in &record.tags {
            sqlx::query(INSERT_TAG)
                .bind(tag.as_str())
                .execute(pool)
                .await
                .map_err(statement_error(UpsertStep::Tag, record.id))?;
            let tag_id: i64 = sqlx::query_scalar(SELECT_TAG_ID)
                .bind(tag.as_str())
                .fetch_one(pool)
                .await
                .map_err(statement_error(UpsertStep::TagId, record.id))?;
            sqlx::query(LINK_GAME_TAG)
                .bind(game_id)
                .bind(tag_id)
                .execute(pool)
                .await
                .map_err(statement_error(UpsertStep::GameTag, record.id))?;
        }
        debug!(appid = record.id, game_id, tags = record.tags.len(), "record upserted");
        Ok(())
    }};
}

/// Postgres-backed store; one pooled connection, as the crawler has one writer.
pub struct PgStore {
    pool: PgPool,
    refresh: ConflictRefresh,
}

impl PgStore {
    // SECURITY: never include the password in tracing spans.
    #[instrument(skip(password))]
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        database: &str,
        refresh: ConflictRefresh,
    ) -> Result<Self, StoreError> {
        let options = PgConnectOptions::new()
            .host(host)
            .port(port)
            .username(user)
            .password(password)
            .database(database);
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await
            .map_err(StoreError::Connect)?;
        info!("connected to postgres");
        Ok(Self { pool, refresh })
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(PG_SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Schema)?;
        Ok(())
    }
}

#[async_trait]
impl RecordStore for PgStore {
    async fn upsert(&self, record: &EnrichedRecord) -> Result<(), StoreError> {
        upsert_record!(&self.pool, self.refresh, record)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// SQLite-backed store for local runs and tests.
pub struct SqliteStore {
    pool: SqlitePool,
    refresh: ConflictRefresh,
}

impl SqliteStore {
    pub async fn open(path: &std::path::Path, refresh: ConflictRefresh) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(StoreError::Connect)?;
        info!(path = %path.display(), "opened sqlite store");
        Ok(Self { pool, refresh })
    }

    /// Private in-memory database. The single connection is never recycled,
    /// otherwise the data would vanish with it.
    pub async fn in_memory(refresh: ConflictRefresh) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::Connect)?
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(StoreError::Connect)?;
        Ok(Self { pool, refresh })
    }

    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SQLITE_SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(StoreError::Schema)?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn upsert(&self, record: &EnrichedRecord) -> Result<(), StoreError> {
        upsert_record!(&self.pool, self.refresh, record)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

/// Connection parameters, sourced from the environment at startup.
#[derive(Clone, PartialEq, Eq)]
pub enum StoreConfig {
    Postgres {
        host: String,
        port: u16,
        user: String,
        password: String,
        database: String,
    },
    Sqlite {
        path: PathBuf,
    },
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreConfig::Postgres {
                host,
                port,
                user,
                database,
                ..
            } => f
                .debug_struct("Postgres")
                .field("host", host)
                .field("port", port)
                .field("user", user)
                .field("password", &"<redacted>")
                .field("database", database)
                .finish(),
            StoreConfig::Sqlite { path } => {
                f.debug_struct("Sqlite").field("path", path).finish()
            }
        }
    }
}

/// Open the configured store. With `create_schema` the three tables are
/// created when missing.
pub async fn connect_store(
    config: &StoreConfig,
    refresh: ConflictRefresh,
    create_schema: bool,
) -> Result<Arc<dyn RecordStore>, StoreError> {
    match config {
        StoreConfig::Postgres {
            host,
            port,
            user,
            password,
            database,
        } => {
            let store = PgStore::connect(host, *port, user, password, database, refresh).await?;
            if create_schema {
                info!("creating tables if missing (AUTO_MIGRATE=on)");
                store.ensure_schema().await?;
            }
            Ok(Arc::new(store))
        }
        StoreConfig::Sqlite { path } => {
            let store = SqliteStore::open(path, refresh).await?;
            if create_schema {
                info!("creating tables if missing (AUTO_MIGRATE=on)");
                store.ensure_schema().await?;
            }
            Ok(Arc::new(store))
        }
    }
}

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::models::AppId;

/// A detail request that did not produce a usable answer but might on a later
/// attempt. "No data for this id" is not an error; see `DetailLookup::Absent`.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate limited (HTTP 429)")]
    RateLimited { retry_after: Option<Duration> },
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),
    #[error("unexpected HTTP status {0}")]
    HttpStatus(u16),
    #[error("undecodable response body: {0}")]
    Malformed(#[source] serde_json::Error),
}

impl FetchError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, FetchError::RateLimited { .. })
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            FetchError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FetchError::Timeout
        } else {
            FetchError::Network(err)
        }
    }
}

/// Sub-step of a record write, carried in `StoreError::Statement`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertStep {
    Game,
    GameId,
    Tag,
    TagId,
    GameTag,
}

impl std::fmt::Display for UpsertStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            UpsertStep::Game => "upsert game",
            UpsertStep::GameId => "resolve game id",
            UpsertStep::Tag => "insert tag",
            UpsertStep::TagId => "resolve tag id",
            UpsertStep::GameTag => "link game tag",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to connect to store: {0}")]
    Connect(#[source] sqlx::Error),
    #[error("failed to prepare schema: {0}")]
    Schema(#[source] sqlx::Error),
    #[error("{step} failed for appid {appid}: {source}")]
    Statement {
        step: UpsertStep,
        appid: AppId,
        #[source]
        source: sqlx::Error,
    },
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("refusing to move cursor back from {current} to {requested}")]
    Rewind { current: usize, requested: usize },
    #[error("ledger file {} holds an unreadable cursor: {line:?}", path.display())]
    Corrupt { path: PathBuf, line: String },
}

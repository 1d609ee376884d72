//! Startup configuration assembled from the environment (and `.env`).

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

use crate::database_ops::db::{ConflictRefresh, StoreConfig};
use crate::database_ops::ledger::FileLedger;
use crate::database_ops::steam::details::{RetryMode, RetryPolicy};
use crate::database_ops::steam::{
    SteamEndpoints, DEFAULT_APP_LIST_URL, DEFAULT_MAX_RETRY_AFTER, DEFAULT_STORE_URL,
    DEFAULT_USER_AGENT,
};
use crate::normalization::language::{LanguageTag, LocalizationClassifier, LocalizationPolicy};
use crate::orchestrator::{BatchSettings, Pacing};
use crate::util::env::{env_choice, env_flag, env_opt, env_parse, env_req};

pub const DEFAULT_JOURNAL: &str = "crawler_log.txt";

#[derive(Debug, Clone)]
pub struct CrawlerConfig {
    pub store: StoreConfig,
    pub auto_migrate: bool,
    pub refresh: ConflictRefresh,
    pub batch: BatchSettings,
    pub retry: RetryPolicy,
    pub language: LanguageTag,
    pub language_match: LocalizationPolicy,
    pub endpoints: SteamEndpoints,
    pub state_dir: PathBuf,
    /// `None` disables the run journal.
    pub journal: Option<PathBuf>,
}

fn millis(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(env_parse(key, default_ms))
}

/// `DB_SQLITE_PATH` selects SQLite; otherwise the Postgres `DB_*` keys are
/// required.
pub fn store_config_from_env() -> Result<StoreConfig> {
    if let Some(path) = env_opt("DB_SQLITE_PATH") {
        return Ok(StoreConfig::Sqlite {
            path: PathBuf::from(path),
        });
    }
    let host = env_req("DB_HOST").context("store configuration incomplete")?;
    let user = env_req("DB_USER").context("store configuration incomplete")?;
    let password = env_req("DB_PASSWORD").context("store configuration incomplete")?;
    let database = env_req("DB_NAME").context("store configuration incomplete")?;
    Ok(StoreConfig::Postgres {
        host,
        port: env_parse("DB_PORT", 5432u16),
        user,
        password,
        database,
    })
}

pub fn retry_policy_from_env() -> Result<RetryPolicy> {
    let mode = env_choice::<RetryMode>("CRAWL_RETRY_MODE")?.unwrap_or(RetryMode::Backoff);
    let rate_limit_cooldown = millis("CRAWL_RATE_LIMIT_COOLDOWN_MS", 5_000);
    Ok(match mode {
        RetryMode::Immediate => RetryPolicy::Immediate {
            cooldown: millis("CRAWL_FAILURE_COOLDOWN_MS", 1_000),
            rate_limit_cooldown,
        },
        RetryMode::Backoff => RetryPolicy::Backoff {
            max_attempts: env_parse("CRAWL_RETRY_ATTEMPTS", 3u32).max(1),
            base_delay: millis("CRAWL_RETRY_BASE_MS", 2_000),
            step: millis("CRAWL_RETRY_STEP_MS", 2_000),
            rate_limit_cooldown,
        },
    })
}

impl CrawlerConfig {
    pub fn from_env() -> Result<Self> {
        let store = store_config_from_env()?;

        let batch = BatchSettings {
            batch_size: env_parse("CRAWL_BATCH_SIZE", 100usize).max(1),
            window_cap: env_parse("CRAWL_WINDOW_CAP", 20_000usize),
            pacing: Pacing {
                delay: millis("CRAWL_ITEM_DELAY_MS", 1_000),
                jitter: millis("CRAWL_ITEM_JITTER_MS", 0),
            },
            wrong_kind: env_choice("CRAWL_WRONG_KIND")?.unwrap_or_default(),
            retention: env_choice("CRAWL_LEDGER_RETENTION")?.unwrap_or_default(),
            retry_pass: true,
        };

        let language = match env_opt("CRAWL_LANGUAGE") {
            Some(raw) => raw
                .parse::<LanguageTag>()
                .map_err(|e| anyhow::anyhow!("CRAWL_LANGUAGE: {e}"))?,
            None => LanguageTag::korean(),
        };

        let endpoints = SteamEndpoints {
            app_list_url: env_opt("STEAM_APP_LIST_URL")
                .unwrap_or_else(|| DEFAULT_APP_LIST_URL.to_string()),
            store_url: env_opt("STEAM_STORE_URL").unwrap_or_else(|| DEFAULT_STORE_URL.to_string()),
            user_agent: env_opt("CRAWL_USER_AGENT")
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            timeout: Duration::from_secs(env_parse("CRAWL_HTTP_TIMEOUT_SECS", 10u64).max(1)),
            max_retry_after: Duration::from_secs(env_parse(
                "CRAWL_MAX_RETRY_AFTER_SECS",
                DEFAULT_MAX_RETRY_AFTER.as_secs(),
            )),
        };

        // Set-but-empty disables the journal; unset uses the default file name.
        let journal = match std::env::var("CRAWL_JOURNAL") {
            Ok(raw) if raw.trim().is_empty() => None,
            Ok(raw) => Some(PathBuf::from(raw.trim())),
            Err(_) => Some(PathBuf::from(DEFAULT_JOURNAL)),
        };

        Ok(Self {
            store,
            auto_migrate: env_flag("AUTO_MIGRATE", false),
            refresh: env_choice("CRAWL_CONFLICT_REFRESH")?.unwrap_or_default(),
            batch,
            retry: retry_policy_from_env()?,
            language,
            language_match: env_choice("CRAWL_LANGUAGE_MATCH")?.unwrap_or_default(),
            endpoints,
            state_dir: PathBuf::from(env_opt("CRAWL_STATE_DIR").unwrap_or_else(|| ".".into())),
            journal,
        })
    }

    pub fn classifier(&self) -> LocalizationClassifier {
        LocalizationClassifier::new(self.language.clone(), self.language_match)
    }

    pub fn ledger(&self) -> FileLedger {
        FileLedger::in_dir(&self.state_dir)
    }

    /// One redacted line describing the effective settings.
    pub fn log_summary(&self) {
        info!(
            store = ?self.store,
            auto_migrate = self.auto_migrate,
            refresh = ?self.refresh,
            batch_size = self.batch.batch_size,
            window_cap = self.batch.window_cap,
            delay_ms = self.batch.pacing.delay.as_millis() as u64,
            jitter_ms = self.batch.pacing.jitter.as_millis() as u64,
            retry_mode = self.retry.mode_name(),
            max_attempts = self.retry.max_attempts(),
            language = %self.language,
            language_match = ?self.language_match,
            wrong_kind = ?self.batch.wrong_kind,
            retention = ?self.batch.retention,
            state_dir = %self.state_dir.display(),
            journal = ?self.journal,
            "crawler configuration"
        );
    }
}

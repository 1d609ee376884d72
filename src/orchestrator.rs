//! Drives one crawl: resume from the saved cursor, walk a bounded window of
//! the app list in fixed-size batches, then replay ids that ran out of detail
//! attempts.
//!
//! Everything runs on a single task, one entry at a time. Entry-level failures
//! are counted and logged, never returned; only a missing app list or an
//! unreadable cursor ends a run early.

use anyhow::{Context, Result};
use rand::Rng;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::database_ops::db::RecordStore;
use crate::database_ops::ledger::ProgressLedger;
use crate::database_ops::steam::catalog::CatalogSource;
use crate::database_ops::steam::details::{DetailFetcher, DetailLookup};
use crate::database_ops::steam::tags::TagSource;
use crate::models::{AppId, CatalogEntry, EnrichedRecord};
use crate::normalization::language::LocalizationClassifier;
use crate::util::journal::RunJournal;

/// What to do with ids whose payload is absent or not a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WrongKindPolicy {
    /// Drop silently.
    #[default]
    Discard,
    /// Drop, but write a failure line to the run journal. Never ledgered.
    LogAsFailure,
}

impl FromStr for WrongKindPolicy {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "discard" | "drop" => Ok(Self::Discard),
            "log-failure" | "log_failure" | "log" => Ok(Self::LogAsFailure),
            other => Err(format!(
                "unknown wrong-kind policy {other:?} (expected discard | log-failure)"
            )),
        }
    }
}

/// What the retry pass does to the failure ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LedgerRetention {
    /// Leave the ledger untouched; recovered ids are retried again next run.
    AppendOnly,
    /// Rewrite the ledger to the ids that failed again.
    #[default]
    CompactAfterRetry,
}

impl FromStr for LedgerRetention {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "append-only" | "append_only" | "keep" => Ok(Self::AppendOnly),
            "compact" | "compact-after-retry" | "compact_after_retry" => {
                Ok(Self::CompactAfterRetry)
            }
            other => Err(format!(
                "unknown ledger retention {other:?} (expected append-only | compact)"
            )),
        }
    }
}

/// Pause after each entry that hit the store API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub delay: Duration,
    /// Upper bound of a uniformly random extra wait.
    pub jitter: Duration,
}

impl Pacing {
    pub fn none() -> Self {
        Self {
            delay: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    pub fn next_delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.delay;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        self.delay + Duration::from_millis(extra)
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(1),
            jitter: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSettings {
    pub batch_size: usize,
    /// Max catalog entries one invocation walks, counted from the cursor.
    pub window_cap: usize,
    pub pacing: Pacing,
    pub wrong_kind: WrongKindPolicy,
    pub retention: LedgerRetention,
    pub retry_pass: bool,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            window_cap: 20_000,
            pacing: Pacing::default(),
            wrong_kind: WrongKindPolicy::default(),
            retention: LedgerRetention::default(),
            retry_pass: true,
        }
    }
}

/// The network collaborators.
pub struct Sources {
    pub catalog: Arc<dyn CatalogSource>,
    pub details: DetailFetcher,
    pub tags: Arc<dyn TagSource>,
}

/// Store handle, ledger and journal for one run. Built once, passed down, and
/// closed by [`Orchestrator::shutdown`].
pub struct CrawlContext {
    pub store: Arc<dyn RecordStore>,
    pub ledger: Arc<dyn ProgressLedger>,
    pub journal: RunJournal,
    closed: bool,
}

impl CrawlContext {
    pub fn new(
        store: Arc<dyn RecordStore>,
        ledger: Arc<dyn ProgressLedger>,
        journal: RunJournal,
    ) -> Self {
        Self {
            store,
            ledger,
            journal,
            closed: false,
        }
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.journal.close().await;
        self.store.close().await;
        debug!("crawl context closed");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Resuming,
    BatchIterating { offset: usize, end: usize },
    RetryPass,
    Done,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Resuming => f.write_str("resuming"),
            Phase::BatchIterating { offset, end } => write!(f, "batch {offset}..{end}"),
            Phase::RetryPass => f.write_str("retry pass"),
            Phase::Done => f.write_str("done"),
        }
    }
}

/// What happened to one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOutcome {
    Unnamed,
    Absent,
    WrongKind,
    NotLocalized,
    Exhausted,
    Stored,
    StoreFailed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassCounts {
    pub attempted: usize,
    pub stored: usize,
    pub unnamed: usize,
    pub absent: usize,
    pub wrong_kind: usize,
    pub not_localized: usize,
    pub exhausted: usize,
    pub store_errors: usize,
}

impl PassCounts {
    fn record(&mut self, outcome: EntryOutcome) {
        self.attempted += 1;
        match outcome {
            EntryOutcome::Unnamed => self.unnamed += 1,
            EntryOutcome::Absent => self.absent += 1,
            EntryOutcome::WrongKind => self.wrong_kind += 1,
            EntryOutcome::NotLocalized => self.not_localized += 1,
            EntryOutcome::Exhausted => self.exhausted += 1,
            EntryOutcome::Stored => self.stored += 1,
            EntryOutcome::StoreFailed => self.store_errors += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub catalog_len: usize,
    pub start_cursor: usize,
    pub end_cursor: usize,
    pub batches: usize,
    pub main: PassCounts,
    pub retry: PassCounts,
    /// Ids left in the failure ledger after the run.
    pub ledger_remaining: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Main,
    Retry,
}

pub struct Orchestrator {
    sources: Sources,
    classifier: LocalizationClassifier,
    settings: BatchSettings,
    ctx: CrawlContext,
    summary: RunSummary,
}

impl Orchestrator {
    pub fn new(
        sources: Sources,
        classifier: LocalizationClassifier,
        mut settings: BatchSettings,
        ctx: CrawlContext,
    ) -> Self {
        settings.batch_size = settings.batch_size.max(1);
        Self {
            sources,
            classifier,
            settings,
            ctx,
            summary: RunSummary::default(),
        }
    }

    /// Full run: resume, walk the window, then the retry pass (if enabled).
    pub async fn run(&mut self) -> Result<RunSummary> {
        self.drive(Phase::Resuming).await
    }

    /// Only replay the failure ledger.
    pub async fn retry_failed(&mut self) -> Result<RunSummary> {
        self.drive(Phase::RetryPass).await
    }

    /// Release the store connection and the journal. Call on every exit path.
    pub async fn shutdown(&mut self) {
        self.ctx.close().await;
    }

    async fn drive(&mut self, first: Phase) -> Result<RunSummary> {
        self.summary = RunSummary::default();
        let catalog = if first == Phase::Resuming {
            let catalog = self
                .sources
                .catalog
                .fetch_catalog()
                .await
                .context("failed to obtain the app list")?;
            self.summary.catalog_len = catalog.len();
            catalog
        } else {
            Vec::new()
        };

        let mut phase = first;
        loop {
            debug!(%phase, "entering phase");
            phase = match phase {
                Phase::Resuming => {
                    let start = self
                        .ctx
                        .ledger
                        .load_cursor()
                        .await
                        .context("failed to read the progress cursor")?;
                    let end = catalog
                        .len()
                        .min(start.saturating_add(self.settings.window_cap));
                    self.summary.start_cursor = start;
                    self.summary.end_cursor = start;
                    info!(
                        start,
                        end,
                        catalog = catalog.len(),
                        batch_size = self.settings.batch_size,
                        "resuming crawl"
                    );
                    self.ctx
                        .journal
                        .note(&format!("run started at offset {start} (window end {end})"))
                        .await;
                    Phase::BatchIterating { offset: start, end }
                }
                Phase::BatchIterating { offset, end } if offset < end => {
                    let next = self.run_batch(&catalog, offset).await;
                    Phase::BatchIterating { offset: next, end }
                }
                Phase::BatchIterating { .. } => {
                    if self.settings.retry_pass {
                        Phase::RetryPass
                    } else {
                        Phase::Done
                    }
                }
                Phase::RetryPass => {
                    self.retry_pass().await;
                    Phase::Done
                }
                Phase::Done => break,
            };
        }

        self.finish().await;
        Ok(self.summary.clone())
    }

    /// Process `catalog[offset..offset + batch_size]` and persist the cursor
    /// past it. Returns the new offset.
    async fn run_batch(&mut self, catalog: &[CatalogEntry], offset: usize) -> usize {
        let stop = offset
            .saturating_add(self.settings.batch_size)
            .min(catalog.len());
        info!(from = offset, to = stop, "batch started");

        for entry in &catalog[offset..stop] {
            let outcome = self.process_entry(entry).await;
            self.summary.main.record(outcome);
        }

        self.summary.batches += 1;
        match self.ctx.ledger.save_cursor(stop).await {
            Ok(()) => {
                self.summary.end_cursor = stop;
                info!(cursor = stop, "batch complete; cursor saved");
            }
            Err(err) => {
                // The batch is redone on the next run; upserts make that harmless.
                warn!(cursor = stop, error = %err, "failed to save cursor");
            }
        }
        stop
    }

    async fn process_entry(&mut self, entry: &CatalogEntry) -> EntryOutcome {
        if entry.is_unnamed() {
            return EntryOutcome::Unnamed;
        }
        let outcome = self
            .enrich(entry.id, Some(&entry.display_name), Pass::Main)
            .await;
        if outcome == EntryOutcome::Exhausted {
            match self.ctx.ledger.record_failure(entry.id).await {
                Ok(true) => debug!(appid = entry.id, "added to failure ledger"),
                Ok(false) => debug!(appid = entry.id, "already in failure ledger"),
                Err(err) => {
                    error!(appid = entry.id, error = %err, "failed to record failed id")
                }
            }
        }
        self.pace().await;
        outcome
    }

    async fn retry_pass(&mut self) {
        let ids = match self.ctx.ledger.failed_ids().await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(error = %err, "failure ledger unreadable; skipping retry pass");
                return;
            }
        };
        if ids.is_empty() {
            info!("no failed ids to retry");
            self.summary.ledger_remaining = Some(0);
            return;
        }

        info!(count = ids.len(), "retrying failed ids");
        self.ctx
            .journal
            .note(&format!("retrying {} failed ids", ids.len()))
            .await;
        let mut still_failing: Vec<AppId> = Vec::new();
        for appid in ids.iter().copied() {
            let outcome = self.enrich(appid, None, Pass::Retry).await;
            self.summary.retry.record(outcome);
            if outcome == EntryOutcome::Exhausted {
                still_failing.push(appid);
            }
            self.pace().await;
        }

        match self.settings.retention {
            LedgerRetention::AppendOnly => {
                if !still_failing.is_empty() {
                    info!(
                        still_failing = still_failing.len(),
                        "ids failed again; ledger left as is"
                    );
                }
                self.summary.ledger_remaining = Some(ids.len());
            }
            LedgerRetention::CompactAfterRetry => {
                match self.ctx.ledger.replace_failures(&still_failing).await {
                    Ok(()) => self.summary.ledger_remaining = Some(still_failing.len()),
                    Err(err) => {
                        warn!(error = %err, "failed to compact failure ledger");
                        self.summary.ledger_remaining = Some(ids.len());
                    }
                }
            }
        }
    }

    /// Detail lookup, kind and language checks, tags, upsert.
    ///
    /// `catalog_name` is absent for ids replayed from the ledger; the payload
    /// name is used instead.
    async fn enrich(
        &mut self,
        appid: AppId,
        catalog_name: Option<&str>,
        pass: Pass,
    ) -> EntryOutcome {
        let detail = match self.sources.details.fetch_detail(appid).await {
            DetailLookup::Found(detail) => detail,
            DetailLookup::Absent => {
                debug!(appid, "no store data");
                if self.settings.wrong_kind == WrongKindPolicy::LogAsFailure {
                    self.ctx.journal.failed(appid, "no store data").await;
                }
                return EntryOutcome::Absent;
            }
            DetailLookup::Exhausted {
                attempts,
                last_error,
            } => {
                warn!(appid, attempts, ?pass, error = %last_error, "giving up on appid");
                self.ctx
                    .journal
                    .failed(appid, &format!("{last_error} after {attempts} attempt(s)"))
                    .await;
                return EntryOutcome::Exhausted;
            }
        };

        if !detail.is_game() {
            debug!(appid, kind = %detail.kind, "not a game");
            if self.settings.wrong_kind == WrongKindPolicy::LogAsFailure {
                let reason = format!("kind {:?} is not a game", detail.kind);
                self.ctx.journal.failed(appid, &reason).await;
            }
            return EntryOutcome::WrongKind;
        }

        let name = catalog_name
            .map(str::to_string)
            .or_else(|| detail.name.clone())
            .filter(|n| !n.trim().is_empty());
        let Some(name) = name else {
            debug!(appid, "no display name in payload");
            return EntryOutcome::Unnamed;
        };

        if !self.classifier.is_localized(&detail.raw_language_support) {
            debug!(appid, name = %name, language = %self.classifier.target(), "language not supported");
            return EntryOutcome::NotLocalized;
        }

        let tags = self.sources.tags.fetch_tags(appid).await;
        let record = EnrichedRecord::from_detail(name, detail, true, tags);
        match self.ctx.store.upsert(&record).await {
            Ok(()) => {
                info!(
                    appid,
                    name = %record.display_name,
                    reviews = record.popularity_count,
                    tags = record.tags.len(),
                    ?pass,
                    "stored"
                );
                self.ctx
                    .journal
                    .stored(appid, &record.display_name, record.tags.len())
                    .await;
                EntryOutcome::Stored
            }
            Err(err) => {
                error!(appid, error = %err, "failed to store record");
                self.ctx
                    .journal
                    .failed(appid, &format!("store: {err}"))
                    .await;
                EntryOutcome::StoreFailed
            }
        }
    }

    async fn pace(&self) {
        let delay = self.settings.pacing.next_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    async fn finish(&mut self) {
        let s = &self.summary;
        info!(
            catalog = s.catalog_len,
            start_cursor = s.start_cursor,
            end_cursor = s.end_cursor,
            batches = s.batches,
            stored = s.main.stored,
            unnamed = s.main.unnamed,
            absent = s.main.absent,
            wrong_kind = s.main.wrong_kind,
            not_localized = s.main.not_localized,
            exhausted = s.main.exhausted,
            store_errors = s.main.store_errors,
            retried = s.retry.attempted,
            recovered = s.retry.stored,
            "crawl finished"
        );
        let line = format!(
            "run finished: cursor {} -> {}, stored {}, exhausted {}, recovered {}",
            s.start_cursor, s.end_cursor, s.main.stored, s.main.exhausted, s.retry.stored
        );
        self.ctx.journal.note(&line).await;
    }
}

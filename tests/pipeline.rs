use async_trait::async_trait;
use sqlx::SqlitePool;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use steam_crawl::database_ops::db::{ConflictRefresh, RecordStore, SqliteStore};
use steam_crawl::database_ops::ledger::{FileLedger, ProgressLedger, FAILURES_FILE};
use steam_crawl::database_ops::steam::catalog::CatalogSource;
use steam_crawl::database_ops::steam::details::{DetailFetcher, DetailTransport, RetryPolicy};
use steam_crawl::database_ops::steam::tags::TagSource;
use steam_crawl::error::{FetchError, StoreError, UpsertStep};
use steam_crawl::models::{AppId, CatalogEntry, EnrichedRecord, ItemDetail};
use steam_crawl::normalization::language::LocalizationClassifier;
use steam_crawl::orchestrator::{
    BatchSettings, CrawlContext, LedgerRetention, Orchestrator, Pacing, Sources, WrongKindPolicy,
};
use steam_crawl::util::journal::RunJournal;

struct FakeCatalog(Option<Vec<CatalogEntry>>);

#[async_trait]
impl CatalogSource for FakeCatalog {
    async fn fetch_catalog(&self) -> anyhow::Result<Vec<CatalogEntry>> {
        self.0
            .clone()
            .ok_or_else(|| anyhow::anyhow!("app list unavailable"))
    }
}

#[derive(Clone)]
enum Reply {
    Game {
        name: Option<&'static str>,
        languages: &'static str,
    },
    Kind(&'static str),
    Absent,
    Limited,
}

/// Scripted replies per id. The last reply of a script repeats forever; ids
/// without a script get a Korean-localized game.
#[derive(Default)]
struct FakeDetails {
    scripts: Mutex<HashMap<AppId, VecDeque<Reply>>>,
    calls: Mutex<Vec<AppId>>,
}

impl FakeDetails {
    fn script(self, appid: AppId, replies: Vec<Reply>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(appid, replies.into_iter().collect());
        self
    }

    fn calls(&self) -> Vec<AppId> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_for(&self, appid: AppId) -> usize {
        self.calls().iter().filter(|id| **id == appid).count()
    }
}

fn korean_game() -> Reply {
    Reply::Game {
        name: None,
        languages: "English, <strong>Korean</strong><br>",
    }
}

#[async_trait]
impl DetailTransport for FakeDetails {
    async fn attempt(&self, appid: AppId) -> Result<Option<ItemDetail>, FetchError> {
        self.calls.lock().unwrap().push(appid);
        let reply = {
            let mut scripts = self.scripts.lock().unwrap();
            match scripts.get_mut(&appid) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        }
        .unwrap_or_else(korean_game);

        match reply {
            Reply::Game { name, languages } => Ok(Some(ItemDetail {
                id: appid,
                kind: "game".into(),
                name: name.map(str::to_string),
                short_description: format!("description of {appid}"),
                image_url: format!("https://cdn.example/{appid}.jpg"),
                popularity_count: 42,
                raw_language_support: languages.into(),
            })),
            Reply::Kind(kind) => Ok(Some(ItemDetail {
                id: appid,
                kind: kind.into(),
                name: Some("Soundtrack".into()),
                raw_language_support: "Korean".into(),
                ..ItemDetail::default()
            })),
            Reply::Absent => Ok(None),
            Reply::Limited => Err(FetchError::RateLimited { retry_after: None }),
        }
    }
}

/// Even ids get two tags (one duplicated), odd ids one; `untagged` ids get
/// nothing, as when the store page cannot be fetched.
#[derive(Default)]
struct FakeTags {
    untagged: Vec<AppId>,
}

#[async_trait]
impl TagSource for FakeTags {
    async fn fetch_tags(&self, appid: AppId) -> Vec<String> {
        if self.untagged.contains(&appid) {
            Vec::new()
        } else if appid % 2 == 0 {
            vec!["Puzzle".into(), " Co-op ".into(), "Puzzle".into()]
        } else {
            vec!["Indie".into()]
        }
    }
}

/// Delegates to SQLite but fails the upsert of `reject`; records every call.
struct RejectingStore {
    inner: Arc<SqliteStore>,
    reject: AppId,
    upserts: Mutex<Vec<AppId>>,
}

#[async_trait]
impl RecordStore for RejectingStore {
    async fn upsert(&self, record: &EnrichedRecord) -> Result<(), StoreError> {
        self.upserts.lock().unwrap().push(record.id);
        if record.id == self.reject {
            return Err(StoreError::Statement {
                step: UpsertStep::Game,
                appid: record.id,
                source: sqlx::Error::RowNotFound,
            });
        }
        self.inner.upsert(record).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

fn no_wait_retry() -> RetryPolicy {
    RetryPolicy::Backoff {
        max_attempts: 3,
        base_delay: Duration::ZERO,
        step: Duration::ZERO,
        rate_limit_cooldown: Duration::ZERO,
    }
}

fn settings(batch_size: usize, window_cap: usize) -> BatchSettings {
    BatchSettings {
        batch_size,
        window_cap,
        pacing: Pacing::none(),
        ..BatchSettings::default()
    }
}

struct Harness {
    store: Arc<SqliteStore>,
    details: Arc<FakeDetails>,
    dir: tempfile::TempDir,
}

impl Harness {
    async fn new(details: FakeDetails) -> Self {
        let store = SqliteStore::in_memory(ConflictRefresh::default())
            .await
            .unwrap();
        store.ensure_schema().await.unwrap();
        Self {
            store: Arc::new(store),
            details: Arc::new(details),
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn ledger(&self) -> FileLedger {
        FileLedger::in_dir(self.dir.path())
    }

    fn orchestrator(
        &self,
        catalog: Option<Vec<CatalogEntry>>,
        settings: BatchSettings,
        journal: RunJournal,
    ) -> Orchestrator {
        self.orchestrator_with(
            self.store.clone(),
            FakeTags::default(),
            catalog,
            settings,
            journal,
        )
    }

    fn orchestrator_with(
        &self,
        store: Arc<dyn RecordStore>,
        tags: FakeTags,
        catalog: Option<Vec<CatalogEntry>>,
        settings: BatchSettings,
        journal: RunJournal,
    ) -> Orchestrator {
        let sources = Sources {
            catalog: Arc::new(FakeCatalog(catalog)),
            details: DetailFetcher::new(self.details.clone(), no_wait_retry()),
            tags: Arc::new(tags),
        };
        let ctx = CrawlContext::new(store, Arc::new(self.ledger()), journal);
        Orchestrator::new(sources, LocalizationClassifier::default(), settings, ctx)
    }

    fn pool(&self) -> &SqlitePool {
        self.store.pool()
    }

    async fn games(&self) -> Vec<(i64, String)> {
        sqlx::query_as("SELECT appid, name FROM games ORDER BY appid")
            .fetch_all(self.pool())
            .await
            .unwrap()
    }

    async fn tags_of(&self, appid: AppId) -> Vec<String> {
        sqlx::query_scalar(
            "SELECT t.name FROM tags t \
             JOIN game_tags gt ON gt.tag_id = t.id \
             JOIN games g ON g.id = gt.game_id \
             WHERE g.appid = $1 ORDER BY t.name",
        )
        .bind(appid)
        .fetch_all(self.pool())
        .await
        .unwrap()
    }
}

fn read(dir: &Path, file: &str) -> String {
    std::fs::read_to_string(dir.join(file)).unwrap_or_default()
}

#[tokio::test]
async fn two_runs_walk_the_catalog_in_windows() {
    let h = Harness::new(FakeDetails::default()).await;
    let catalog = vec![
        CatalogEntry::new(10, "Alpha"),
        CatalogEntry::new(11, "   "),
        CatalogEntry::new(13, "Gamma"),
    ];

    let first = h
        .orchestrator(Some(catalog.clone()), settings(2, 2), RunJournal::disabled())
        .run()
        .await
        .unwrap();
    assert_eq!((first.start_cursor, first.end_cursor), (0, 2));
    assert_eq!(first.main.stored, 1);
    assert_eq!(first.main.unnamed, 1);
    assert_eq!(h.ledger().load_cursor().await.unwrap(), 2);
    assert_eq!(h.games().await, vec![(10, "Alpha".to_string())]);

    let second = h
        .orchestrator(Some(catalog), settings(2, 2), RunJournal::disabled())
        .run()
        .await
        .unwrap();
    assert_eq!((second.start_cursor, second.end_cursor), (2, 3));
    assert_eq!(h.ledger().load_cursor().await.unwrap(), 3);
    assert_eq!(
        h.games().await,
        vec![(10, "Alpha".to_string()), (13, "Gamma".to_string())]
    );
    assert_eq!(h.tags_of(10).await, vec!["Co-op", "Puzzle"]);
    assert_eq!(h.tags_of(13).await, vec!["Indie"]);

    // 11 is unnamed and never reaches the store API.
    assert_eq!(h.details.calls(), vec![10, 13]);
}

#[tokio::test]
async fn non_games_and_unlocalized_games_are_not_stored() {
    let details = FakeDetails::default()
        .script(1, vec![Reply::Kind("dlc")])
        .script(
            2,
            vec![Reply::Game {
                name: None,
                languages: "English, French",
            }],
        )
        .script(3, vec![Reply::Absent])
        .script(
            4,
            vec![Reply::Game {
                name: None,
                languages: "영어, 한국어",
            }],
        );
    let h = Harness::new(details).await;
    let catalog = vec![
        CatalogEntry::new(1, "Some DLC"),
        CatalogEntry::new(2, "French Game"),
        CatalogEntry::new(3, "Delisted"),
        CatalogEntry::new(4, "Native Script"),
    ];

    let summary = h
        .orchestrator(Some(catalog), settings(10, 100), RunJournal::disabled())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.main.wrong_kind, 1);
    assert_eq!(summary.main.not_localized, 1);
    assert_eq!(summary.main.absent, 1);
    assert_eq!(summary.main.stored, 1);
    assert_eq!(h.games().await, vec![(4, "Native Script".to_string())]);
    assert!(h.ledger().failed_ids().await.unwrap().is_empty());
    assert_eq!(h.ledger().load_cursor().await.unwrap(), 4);
}

#[tokio::test]
async fn rate_limits_then_success_stores_once() {
    let details =
        FakeDetails::default().script(7, vec![Reply::Limited, Reply::Limited, korean_game()]);
    let h = Harness::new(details).await;

    let summary = h
        .orchestrator(
            Some(vec![CatalogEntry::new(7, "Seven")]),
            settings(5, 100),
            RunJournal::disabled(),
        )
        .run()
        .await
        .unwrap();

    assert_eq!(h.details.calls_for(7), 3);
    assert_eq!(summary.main.stored, 1);
    assert_eq!(h.games().await, vec![(7, "Seven".to_string())]);
    assert!(h.ledger().failed_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn exhausted_ids_are_ledgered_once_and_not_stored() {
    let details = FakeDetails::default().script(5, vec![Reply::Limited]);
    let h = Harness::new(details).await;
    let mut no_retry = settings(1, 100);
    no_retry.retry_pass = false;

    let summary = h
        .orchestrator(
            Some(vec![CatalogEntry::new(5, "Five"), CatalogEntry::new(5, "Five")]),
            no_retry,
            RunJournal::disabled(),
        )
        .run()
        .await
        .unwrap();

    assert_eq!(summary.main.exhausted, 2);
    assert_eq!(h.details.calls_for(5), 6);
    assert!(h.games().await.is_empty());
    assert_eq!(read(h.dir.path(), FAILURES_FILE), "5\n");
    assert_eq!(h.ledger().load_cursor().await.unwrap(), 2);
}

#[tokio::test]
async fn resumes_after_completed_batches() {
    let h = Harness::new(FakeDetails::default()).await;
    h.ledger().save_cursor(2).await.unwrap();
    let catalog = (1..=4)
        .map(|id| CatalogEntry::new(id, format!("Game {id}")))
        .collect::<Vec<_>>();

    let summary = h
        .orchestrator(Some(catalog), settings(2, 100), RunJournal::disabled())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.start_cursor, 2);
    assert_eq!(summary.batches, 1);
    assert_eq!(h.details.calls(), vec![3, 4]);
    assert_eq!(h.ledger().load_cursor().await.unwrap(), 4);
}

#[tokio::test]
async fn retry_pass_compacts_the_ledger() {
    let details = FakeDetails::default()
        .script(
            7,
            vec![Reply::Game {
                name: Some("Recovered"),
                languages: "Korean",
            }],
        )
        .script(8, vec![Reply::Limited])
        .script(
            9,
            vec![Reply::Game {
                name: None,
                languages: "Korean",
            }],
        );
    let h = Harness::new(details).await;
    for id in [7, 8, 9] {
        h.ledger().record_failure(id).await.unwrap();
    }

    let summary = h
        .orchestrator(None, settings(10, 100), RunJournal::disabled())
        .retry_failed()
        .await
        .unwrap();

    assert_eq!(summary.retry.attempted, 3);
    assert_eq!(summary.retry.stored, 1);
    assert_eq!(summary.retry.exhausted, 1);
    assert_eq!(summary.retry.unnamed, 1);
    assert_eq!(summary.ledger_remaining, Some(1));
    assert_eq!(h.games().await, vec![(7, "Recovered".to_string())]);
    assert_eq!(h.ledger().failed_ids().await.unwrap(), vec![8]);
    // The cursor belongs to the main pass only.
    assert_eq!(h.ledger().load_cursor().await.unwrap(), 0);
}

#[tokio::test]
async fn append_only_retention_leaves_the_ledger_alone() {
    let h = Harness::new(FakeDetails::default().script(8, vec![Reply::Limited])).await;
    for id in [7, 8] {
        h.ledger().record_failure(id).await.unwrap();
    }
    let mut append_only = settings(10, 100);
    append_only.retention = LedgerRetention::AppendOnly;

    h.orchestrator(None, append_only, RunJournal::disabled())
        .retry_failed()
        .await
        .unwrap();

    assert_eq!(h.ledger().failed_ids().await.unwrap(), vec![7, 8]);
    assert_eq!(read(h.dir.path(), FAILURES_FILE), "7\n8\n");
}

#[tokio::test]
async fn missing_app_list_aborts_without_touching_state() {
    let h = Harness::new(FakeDetails::default()).await;
    h.ledger().save_cursor(3).await.unwrap();

    let mut orchestrator = h.orchestrator(None, settings(2, 100), RunJournal::disabled());
    let err = orchestrator.run().await.unwrap_err();
    orchestrator.shutdown().await;

    assert!(format!("{err:#}").contains("app list"));
    assert_eq!(h.ledger().load_cursor().await.unwrap(), 3);
    assert!(h.details.calls().is_empty());
}

#[tokio::test]
async fn wrong_kind_can_be_journaled_as_failure() {
    let details = FakeDetails::default().script(2, vec![Reply::Kind("music")]);
    let h = Harness::new(details).await;
    let journal_path = h.dir.path().join("crawler_log.txt");
    let mut log_failures = settings(10, 100);
    log_failures.wrong_kind = WrongKindPolicy::LogAsFailure;

    let mut orchestrator = h.orchestrator(
        Some(vec![CatalogEntry::new(1, "One"), CatalogEntry::new(2, "OST")]),
        log_failures,
        RunJournal::open(&journal_path).await,
    );
    orchestrator.run().await.unwrap();
    let games = h.games().await;
    orchestrator.shutdown().await;

    assert_eq!(games, vec![(1, "One".to_string())]);
    let journal = std::fs::read_to_string(&journal_path).unwrap();
    assert!(journal.contains("OK   appid=1 tags=1 name=\"One\""));
    assert!(journal.contains("FAIL appid=2 reason=kind \"music\" is not a game"));
    assert!(h.ledger().failed_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn single_run_stores_only_the_named_game() {
    let details = FakeDetails::default().script(3, vec![Reply::Kind("dlc")]);
    let h = Harness::new(details).await;
    let catalog = vec![
        CatalogEntry::new(1, "A"),
        CatalogEntry::new(2, ""),
        CatalogEntry::new(3, "C"),
    ];

    let summary = h
        .orchestrator(Some(catalog), settings(2, 100), RunJournal::disabled())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.batches, 2);
    assert_eq!(summary.end_cursor, 3);
    assert_eq!(summary.main.wrong_kind, 1);
    assert_eq!(h.games().await, vec![(1, "A".to_string())]);
    assert_eq!(h.tags_of(1).await, vec!["Indie"]);
    assert_eq!(h.details.calls(), vec![1, 3]);
    assert_eq!(h.ledger().load_cursor().await.unwrap(), 3);
}

#[tokio::test]
async fn store_failure_skips_only_that_record() {
    let h = Harness::new(FakeDetails::default()).await;
    let store = Arc::new(RejectingStore {
        inner: h.store.clone(),
        reject: 1,
        upserts: Mutex::new(Vec::new()),
    });
    let catalog = vec![CatalogEntry::new(1, "Broken"), CatalogEntry::new(2, "Fine")];

    let summary = h
        .orchestrator_with(
            store.clone(),
            FakeTags::default(),
            Some(catalog),
            settings(2, 100),
            RunJournal::disabled(),
        )
        .run()
        .await
        .unwrap();

    assert_eq!(*store.upserts.lock().unwrap(), vec![1, 2]);
    assert_eq!(summary.main.store_errors, 1);
    assert_eq!(summary.main.stored, 1);
    assert_eq!(h.games().await, vec![(2, "Fine".to_string())]);
    assert_eq!(h.ledger().load_cursor().await.unwrap(), 2);
    // Store errors are not fetch failures; nothing to replay.
    assert!(h.ledger().failed_ids().await.unwrap().is_empty());
}

#[tokio::test]
async fn missing_tags_do_not_block_the_record() {
    let h = Harness::new(FakeDetails::default()).await;
    let tags = FakeTags {
        untagged: vec![4],
    };
    let catalog = vec![CatalogEntry::new(4, "Tagless"), CatalogEntry::new(5, "Tagged")];

    let summary = h
        .orchestrator_with(
            h.store.clone(),
            tags,
            Some(catalog),
            settings(5, 100),
            RunJournal::disabled(),
        )
        .run()
        .await
        .unwrap();

    assert_eq!(summary.main.stored, 2);
    assert_eq!(
        h.games().await,
        vec![(4, "Tagless".to_string()), (5, "Tagged".to_string())]
    );
    assert!(h.tags_of(4).await.is_empty());
    let links: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM game_tags gt JOIN games g ON g.id = gt.game_id WHERE g.appid = $1",
    )
    .bind(4i64)
    .fetch_one(h.pool())
    .await
    .unwrap();
    assert_eq!(links, 0);
    assert_eq!(h.tags_of(5).await, vec!["Indie"]);
}

use async_trait::async_trait;
use indexmap::IndexSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::LedgerError;
use crate::models::AppId;

pub const CURSOR_FILE: &str = "last_index.txt";
pub const FAILURES_FILE: &str = "failed_appids.txt";

/// Durable run state: the next unprocessed catalog offset and the ids whose
/// detail lookups ran out of attempts.
#[async_trait]
pub trait ProgressLedger: Send + Sync {
    /// 0 when nothing was saved yet.
    async fn load_cursor(&self) -> Result<usize, LedgerError>;

    /// Persist `offset`. Moving backwards is rejected.
    async fn save_cursor(&self, offset: usize) -> Result<(), LedgerError>;

    /// Append `appid` unless already present; `Ok(false)` for a duplicate.
    async fn record_failure(&self, appid: AppId) -> Result<bool, LedgerError>;

    /// Failed ids in the order they were first recorded.
    async fn failed_ids(&self) -> Result<Vec<AppId>, LedgerError>;

    /// Replace the whole failure list in one atomic write.
    async fn replace_failures(&self, ids: &[AppId]) -> Result<(), LedgerError>;
}

#[derive(Default)]
struct LedgerState {
    cursor: Option<usize>,
    failures: Option<IndexSet<AppId>>,
}

/// Two small text files in a state directory: `last_index.txt` holds the
/// cursor, `failed_appids.txt` one id per line.
pub struct FileLedger {
    cursor_path: PathBuf,
    failures_path: PathBuf,
    state: Mutex<LedgerState>,
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> LedgerError + '_ {
    move |source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write via a sibling temp file and rename, so a crash leaves either the old
/// or the new content.
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), LedgerError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).await.map_err(io_err(parent))?;
    }
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp).await.map_err(io_err(&tmp))?;
    file.write_all(contents).await.map_err(io_err(&tmp))?;
    file.sync_all().await.map_err(io_err(&tmp))?;
    drop(file);
    fs::rename(&tmp, path).await.map_err(io_err(path))?;
    Ok(())
}

async fn read_optional(path: &Path) -> Result<Option<String>, LedgerError> {
    match fs::read_to_string(path).await {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(io_err(path)(err)),
    }
}

/// Ids from a failure file; blank and non-numeric lines are ignored.
pub fn parse_failure_lines(text: &str) -> IndexSet<AppId> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match line.parse::<AppId>() {
            Ok(id) if id >= 0 => Some(id),
            _ => {
                debug!(line, "skipping unreadable failure ledger line");
                None
            }
        })
        .collect()
}

impl FileLedger {
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            cursor_path: dir.join(CURSOR_FILE),
            failures_path: dir.join(FAILURES_FILE),
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn cursor_path(&self) -> &Path {
        &self.cursor_path
    }

    pub fn failures_path(&self) -> &Path {
        &self.failures_path
    }

    async fn read_cursor(&self) -> Result<usize, LedgerError> {
        let Some(text) = read_optional(&self.cursor_path).await? else {
            return Ok(0);
        };
        let line = text.trim();
        if line.is_empty() {
            return Ok(0);
        }
        line.parse::<usize>().map_err(|_| LedgerError::Corrupt {
            path: self.cursor_path.clone(),
            line: line.to_string(),
        })
    }

    async fn loaded_failures<'a>(
        &self,
        state: &'a mut LedgerState,
    ) -> Result<&'a mut IndexSet<AppId>, LedgerError> {
        if state.failures.is_none() {
            let text = read_optional(&self.failures_path).await?.unwrap_or_default();
            state.failures = Some(parse_failure_lines(&text));
        }
        Ok(state.failures.get_or_insert_with(IndexSet::new))
    }
}

#[async_trait]
impl ProgressLedger for FileLedger {
    async fn load_cursor(&self) -> Result<usize, LedgerError> {
        let mut state = self.state.lock().await;
        let cursor = self.read_cursor().await?;
        state.cursor = Some(cursor);
        Ok(cursor)
    }

    async fn save_cursor(&self, offset: usize) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let current = match state.cursor {
            Some(c) => c,
            None => self.read_cursor().await?,
        };
        if offset < current {
            return Err(LedgerError::Rewind {
                current,
                requested: offset,
            });
        }
        write_atomic(&self.cursor_path, offset.to_string().as_bytes()).await?;
        state.cursor = Some(offset);
        Ok(())
    }

    async fn record_failure(&self, appid: AppId) -> Result<bool, LedgerError> {
        let mut state = self.state.lock().await;
        let failures = self.loaded_failures(&mut state).await?;
        if failures.contains(&appid) {
            return Ok(false);
        }
        if let Some(parent) = self
            .failures_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
        {
            fs::create_dir_all(parent).await.map_err(io_err(parent))?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.failures_path)
            .await
            .map_err(io_err(&self.failures_path))?;
        file.write_all(format!("{appid}\n").as_bytes())
            .await
            .map_err(io_err(&self.failures_path))?;
        file.sync_data().await.map_err(io_err(&self.failures_path))?;
        failures.insert(appid);
        Ok(true)
    }

    async fn failed_ids(&self) -> Result<Vec<AppId>, LedgerError> {
        let mut state = self.state.lock().await;
        let failures = self.loaded_failures(&mut state).await?;
        Ok(failures.iter().copied().collect())
    }

    async fn replace_failures(&self, ids: &[AppId]) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let kept: IndexSet<AppId> = ids.iter().copied().collect();
        let mut contents = String::new();
        for id in &kept {
            contents.push_str(&id.to_string());
            contents.push('\n');
        }
        write_atomic(&self.failures_path, contents.as_bytes()).await?;
        if kept.is_empty() {
            debug!(path = %self.failures_path.display(), "failure ledger emptied");
        } else {
            warn!(remaining = kept.len(), "ids still failing after retry pass");
        }
        state.failures = Some(kept);
        Ok(())
    }
}

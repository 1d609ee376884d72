//! Human-readable run journal: one timestamped line per stored record or
//! failed entry, appended across runs. Diagnostics go through `tracing`; this
//! file is the operator's after-the-fact record of what a run did.

use chrono::Local;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::warn;

use crate::models::AppId;

pub struct RunJournal {
    path: Option<PathBuf>,
    out: Option<BufWriter<File>>,
}

impl RunJournal {
    pub fn disabled() -> Self {
        Self {
            path: None,
            out: None,
        }
    }

    /// Open `path` for appending. A journal that cannot be opened is disabled
    /// with a warning; the run goes on without it.
    pub async fn open(path: &Path) -> Self {
        match OpenOptions::new().create(true).append(true).open(path).await {
            Ok(file) => Self {
                path: Some(path.to_path_buf()),
                out: Some(BufWriter::new(file)),
            },
            Err(err) => {
                warn!(path = %path.display(), error = %err, "run journal unavailable; continuing without it");
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.out.is_some()
    }

    pub async fn stored(&mut self, appid: AppId, name: &str, tags: usize) {
        self.write_line(&format!("OK   appid={appid} tags={tags} name={name:?}"))
            .await;
    }

    pub async fn failed(&mut self, appid: AppId, reason: &str) {
        self.write_line(&format!("FAIL appid={appid} reason={reason}"))
            .await;
    }

    pub async fn note(&mut self, message: &str) {
        self.write_line(&format!("---- {message}")).await;
    }

    async fn write_line(&mut self, body: &str) {
        let Some(out) = self.out.as_mut() else {
            return;
        };
        let line = format!("{} {}\n", Local::now().format("%Y-%m-%d %H:%M:%S"), body);
        if let Err(err) = out.write_all(line.as_bytes()).await {
            warn!(
                path = ?self.path,
                error = %err,
                "run journal write failed; disabling journal"
            );
            self.out = None;
        }
    }

    /// Flush and release the file. Later writes are dropped.
    pub async fn close(&mut self) {
        let Some(mut out) = self.out.take() else {
            return;
        };
        if let Err(err) = out.flush().await {
            warn!(path = ?self.path, error = %err, "run journal flush failed");
            return;
        }
        if let Err(err) = out.get_ref().sync_all().await {
            warn!(path = ?self.path, error = %err, "run journal sync failed");
        }
    }
}

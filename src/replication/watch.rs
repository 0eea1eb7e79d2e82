//! `notify`-backed [`ChangeWatcher`] over a table's change file, per §6.3.
//! Coalesces rapid-fire filesystem events into one read-to-EOF per wakeup,
//! the way a production file-tail debounces.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use super::{ChangeWatcher, ChangeWatcherFactory, Error};
use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::warn;

/// Debounce window: further filesystem events arriving within this long of
/// the first one are coalesced into a single read.
const DEBOUNCE: Duration = Duration::from_millis(50);

/// Watches one change file, feeding newly-appended, non-empty text.
pub struct FileChangeWatcher {
    changes: mpsc::UnboundedReceiver<String>,
    _watcher: RecommendedWatcher,
}

impl std::fmt::Debug for FileChangeWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileChangeWatcher").finish_non_exhaustive()
    }
}

#[async_trait]
impl ChangeWatcher for FileChangeWatcher {
    async fn next_change(&mut self) -> Option<String> {
        self.changes.recv().await
    }
}

impl FileChangeWatcher {
    /// Start watching `path`. The file need not exist yet; `notify` reports
    /// creation like any other event.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<()>();

        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<notify::Event>| match res {
                Ok(_) => {
                    signal_tx.send(()).ok();
                }
                Err(e) => warn!("file watcher error: {e}"),
            })
            .map_err(|e| Error::Server(format!("could not start file watcher: {e}")))?;
        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Server(format!("could not watch {}: {e}", path.display())))?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut offset: u64 = 0;
            while signal_rx.recv().await.is_some() {
                // Drain any further signals that arrived in the same burst.
                tokio::time::sleep(DEBOUNCE).await;
                while signal_rx.try_recv().is_ok() {}

                match read_appended(&path, &mut offset).await {
                    Ok(text) if !text.is_empty() => {
                        if tx.send(text).is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!("failed to read change file {}: {e}", path.display()),
                }
            }
        });

        Ok(Self {
            changes: rx,
            _watcher: watcher,
        })
    }
}

/// Read everything appended to `path` since `offset`, advancing it.
async fn read_appended(path: &PathBuf, offset: &mut u64) -> std::io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    if len < *offset {
        // Truncated/rotated underneath us: start over from the top.
        *offset = 0;
    }
    file.seek(std::io::SeekFrom::Start(*offset)).await?;
    let mut buf = String::new();
    file.read_to_string(&mut buf).await?;
    *offset += buf.len() as u64;
    Ok(buf)
}

/// Builds a [`FileChangeWatcher`] rooted under a fixed directory, the way
/// the replication coordinator locates a table's change file by name alone.
#[derive(Debug)]
pub struct FileChangeWatcherFactory {
    dir: PathBuf,
}

impl FileChangeWatcherFactory {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ChangeWatcherFactory for FileChangeWatcherFactory {
    async fn watch(&self, change_file: &str) -> Result<Box<dyn ChangeWatcher>, Error> {
        let path = self.dir.join(change_file);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            tokio::fs::File::create(&path).await.map_err(|e| {
                Error::Server(format!(
                    "could not create change file {}: {e}",
                    path.display()
                ))
            })?;
        }
        Ok(Box::new(FileChangeWatcher::new(path)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn reports_appended_text() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t_ABCDEFGHIJKLMNOPQRST");
        tokio::fs::File::create(&path).await.unwrap();

        let mut watcher = FileChangeWatcher::new(&path).unwrap();
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .unwrap();
        file.write_all(b"a,b\n").await.unwrap();
        file.flush().await.unwrap();

        let change = tokio::time::timeout(Duration::from_secs(5), watcher.next_change())
            .await
            .expect("watcher should report the append")
            .expect("channel stays open");
        assert_eq!(change, "a,b\n");
    }
}

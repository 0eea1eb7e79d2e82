//! The embedded SQL engine's command interface, per §6.4. The engine and
//! its persistent page store are external collaborators this crate consumes
//! but never defines: a real implementation shells out to (or links
//! against) the engine binary, so only the trait and a test fake live here.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

/// Errors an [`EngineHandle`] implementation may surface.
#[derive(Debug, Error)]
pub enum Error {
    #[error("engine command failed: {0}")]
    Command(String),
    #[error("unknown table or view: {0}")]
    NotFound(String),
}

/// The embedded engine's command surface, one method per argv form named in
/// the spec. Implementations must serialize invocations: every call
/// logically completes before the next begins, even though the methods take
/// `&self` so the handle can be shared across the replication coordinator's
/// concurrent per-table tasks.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    /// This replication peer's uid, used as the `--source` argument so the
    /// engine does not echo our own writes back to us.
    async fn uid(&self) -> Result<String, Error>;

    /// Latest acknowledged watermark for `table`, read from
    /// `skdb__<table>_sync_metadata`.
    async fn watermark(&self, table: &str) -> Result<u64, Error>;

    /// Ingest `data` (newline-terminated CSV) into `table`, tagging the
    /// write with `source` so it is not re-emitted to that same source.
    async fn write_csv(&self, table: &str, source: &str, data: &str) -> Result<(), Error>;

    /// Subscribe `view` to change notifications, ignoring writes tagged with
    /// `ignore_source`. Returns a session token used with [`Self::diff`].
    async fn subscribe(
        &self,
        view: &str,
        connect: bool,
        updates_file: &str,
        ignore_source: &str,
    ) -> Result<String, Error>;

    /// CSV of every change to `session`'s view since `since`.
    async fn diff(&self, since: u64, session: &str) -> Result<String, Error>;

    /// Full CSV dump of a base table.
    async fn dump_table(&self, name: &str) -> Result<String, Error>;
    /// Full CSV dump of a view.
    async fn dump_view(&self, name: &str) -> Result<String, Error>;
    /// Names of every base table.
    async fn dump_tables(&self) -> Result<Vec<String>, Error>;
    /// Names of every view.
    async fn dump_views(&self) -> Result<Vec<String>, Error>;
}

#[async_trait]
impl<T: EngineHandle + ?Sized> EngineHandle for std::sync::Arc<T> {
    async fn uid(&self) -> Result<String, Error> {
        (**self).uid().await
    }
    async fn watermark(&self, table: &str) -> Result<u64, Error> {
        (**self).watermark(table).await
    }
    async fn write_csv(&self, table: &str, source: &str, data: &str) -> Result<(), Error> {
        (**self).write_csv(table, source, data).await
    }
    async fn subscribe(
        &self,
        view: &str,
        connect: bool,
        updates_file: &str,
        ignore_source: &str,
    ) -> Result<String, Error> {
        (**self)
            .subscribe(view, connect, updates_file, ignore_source)
            .await
    }
    async fn diff(&self, since: u64, session: &str) -> Result<String, Error> {
        (**self).diff(since, session).await
    }
    async fn dump_table(&self, name: &str) -> Result<String, Error> {
        (**self).dump_table(name).await
    }
    async fn dump_view(&self, name: &str) -> Result<String, Error> {
        (**self).dump_view(name).await
    }
    async fn dump_tables(&self) -> Result<Vec<String>, Error> {
        (**self).dump_tables().await
    }
    async fn dump_views(&self) -> Result<Vec<String>, Error> {
        (**self).dump_views().await
    }
}

/// An in-memory [`EngineHandle`] fake for tests: tables are append-only CSV
/// blobs, watermarks are lengths, and `diff` replays the suffix past `since`.
/// An internal mutex serializes every call, matching what the trait asks of
/// real implementations.
#[derive(Debug, Default)]
pub struct FakeEngine {
    inner: parking_lot::Mutex<FakeEngineState>,
}

#[derive(Debug, Default)]
struct FakeEngineState {
    uid: String,
    tables: HashMap<String, String>,
    watermarks: HashMap<String, u64>,
    subscriptions: HashMap<String, String>,
}

impl FakeEngine {
    #[must_use]
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            inner: parking_lot::Mutex::new(FakeEngineState {
                uid: uid.into(),
                ..Default::default()
            }),
        }
    }
}

#[async_trait]
impl EngineHandle for FakeEngine {
    async fn uid(&self) -> Result<String, Error> {
        Ok(self.inner.lock().uid.clone())
    }

    async fn watermark(&self, table: &str) -> Result<u64, Error> {
        Ok(*self.inner.lock().watermarks.get(table).unwrap_or(&0))
    }

    async fn write_csv(&self, table: &str, _source: &str, data: &str) -> Result<(), Error> {
        let mut state = self.inner.lock();
        let entry = state.tables.entry(table.to_string()).or_default();
        entry.push_str(data);
        let len = entry.len() as u64;
        state.watermarks.insert(table.to_string(), len);
        Ok(())
    }

    async fn subscribe(
        &self,
        view: &str,
        _connect: bool,
        updates_file: &str,
        _ignore_source: &str,
    ) -> Result<String, Error> {
        let mut state = self.inner.lock();
        let token = format!("session-{view}");
        state
            .subscriptions
            .insert(token.clone(), updates_file.to_string());
        Ok(token)
    }

    async fn diff(&self, since: u64, session: &str) -> Result<String, Error> {
        let state = self.inner.lock();
        let view = session
            .strip_prefix("session-")
            .ok_or_else(|| Error::Command(format!("unknown session token: {session}")))?;
        let data = state
            .tables
            .get(view)
            .ok_or_else(|| Error::NotFound(view.to_string()))?;
        let since = since as usize;
        Ok(data.get(since..).unwrap_or("").to_string())
    }

    async fn dump_table(&self, name: &str) -> Result<String, Error> {
        self.inner
            .lock()
            .tables
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    async fn dump_view(&self, name: &str) -> Result<String, Error> {
        self.dump_table(name).await
    }

    async fn dump_tables(&self) -> Result<Vec<String>, Error> {
        Ok(self.inner.lock().tables.keys().cloned().collect())
    }

    async fn dump_views(&self) -> Result<Vec<String>, Error> {
        self.dump_tables().await
    }
}

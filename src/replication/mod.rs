//! Table mirroring, per §4.5: for each mirrored table, a server-tail stream
//! feeds server-side changes into the local engine, and a local-tail stream
//! ships local changes (picked up off a change file) back to the server,
//! with server-acknowledged checkpoints persisted as the table's watermark.
//
// SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

#[cfg(feature = "file-watch")]
mod watch;

#[cfg(feature = "file-watch")]
pub use watch::{FileChangeWatcher, FileChangeWatcherFactory};

use crate::engine::EngineHandle;
use crate::envelope::{Request, Response};
use crate::socket::StreamOpener;
use crate::stream::{Stream, StreamEvent};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace, warn};

/// Errors raised establishing or running a table mirror.
#[derive(Debug, Error)]
pub enum Error {
    #[error("engine error: {0}")]
    Engine(#[from] crate::engine::Error),
    #[error("could not open a stream: {0}")]
    Stream(#[from] crate::socket::Error),
    #[error("malformed response envelope: {0}")]
    Envelope(#[from] serde_json::Error),
    #[error("server closed the stream before responding")]
    StreamClosed,
    #[error("server returned an error: {0}")]
    Server(String),
}

/// Source of local change-file text for a mirrored table's local-tail. The
/// real implementation watches the engine's change file with `notify`
/// (see [`FileChangeWatcher`]); tests supply an in-memory fake.
#[async_trait]
pub trait ChangeWatcher: Send {
    /// Await the next non-empty batch of newly-appended change text.
    /// Returns `None` once the underlying source is gone for good.
    async fn next_change(&mut self) -> Option<String>;
}

/// Constructs a [`ChangeWatcher`] for a table's change file. Boxed so
/// `ReplicationCoordinator` does not need to be generic over it.
#[async_trait]
pub trait ChangeWatcherFactory: Send + Sync {
    async fn watch(&self, change_file: &str) -> Result<Box<dyn ChangeWatcher>, Error>;
}

/// The name the spec gives a mirrored table's checkpoint table.
fn metadata_table(name: &str) -> String {
    format!("skdb__{name}_sync_metadata")
}

/// Change-file name for a mirrored table, per §6.3.
fn change_file_name(table: &str, access_key: &str) -> String {
    format!("{table}_{access_key}")
}

/// Coordinates mirroring zero or more tables over one [`StreamOpener`].
pub struct ReplicationCoordinator<E: EngineHandle> {
    opener: StreamOpener,
    engine: Arc<E>,
    watcher_factory: Arc<dyn ChangeWatcherFactory>,
    access_key: String,
    mirrored: AsyncMutex<HashSet<String>>,
}

impl<E: EngineHandle> std::fmt::Debug for ReplicationCoordinator<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationCoordinator")
            .field("access_key", &self.access_key)
            .finish_non_exhaustive()
    }
}

impl<E: EngineHandle + 'static> ReplicationCoordinator<E> {
    #[must_use]
    pub fn new(
        opener: StreamOpener,
        engine: Arc<E>,
        watcher_factory: Arc<dyn ChangeWatcherFactory>,
        access_key: impl Into<String>,
    ) -> Self {
        Self {
            opener,
            engine,
            watcher_factory,
            access_key: access_key.into(),
            mirrored: AsyncMutex::new(HashSet::new()),
        }
    }

    /// Begin mirroring `table`. A no-op if it is already mirrored.
    pub async fn mirror_table(&self, table: &str) -> Result<(), Error> {
        {
            let mut mirrored = self.mirrored.lock().await;
            if !mirrored.insert(table.to_string()) {
                debug!(table, "already mirrored, skipping");
                return Ok(());
            }
        }

        self.ensure_table_exists(table).await?;
        let uid = self.engine.uid().await?;

        self.start_server_tail(table, &uid).await?;
        self.start_local_tail(table, &uid).await?;
        Ok(())
    }

    /// If the engine is missing `table`, fetch its schema over a one-shot
    /// stream and apply it, and create the checkpoint table alongside it.
    async fn ensure_table_exists(&self, table: &str) -> Result<(), Error> {
        let existing = self.engine.dump_tables().await?;
        if existing.iter().any(|t| t == table) {
            return Ok(());
        }
        let mut stream = self.opener.open_stream()?;
        send_request(
            &stream,
            &Request::Schema {
                table: Some(table.to_string()),
                view: None,
                suffix: None,
            },
        );
        let ddl = match recv_response(&mut stream).await? {
            Response::Pipe { data: ddl } => ddl,
            Response::Error { msg } => return Err(Error::Server(msg)),
            Response::Credentials { .. } => {
                return Err(Error::Server("unexpected credentials response".into()))
            }
        };
        stream.close();
        self.engine.write_csv(table, "schema", &ddl).await?;
        self.engine
            .write_csv(&metadata_table(table), "schema", "")
            .await?;
        Ok(())
    }

    /// Open the server-tail stream and spawn a task that feeds incoming
    /// changes into the local engine.
    async fn start_server_tail(&self, table: &str, uid: &str) -> Result<(), Error> {
        let watermark = self.engine.watermark(table).await?;
        let mut stream = self.opener.open_stream()?;
        send_request(
            &stream,
            &Request::Tail {
                table: table.to_string(),
                since: watermark,
            },
        );

        let engine = self.engine.clone();
        let table = table.to_string();
        let uid = uid.to_string();
        tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                match event {
                    StreamEvent::Data(data) => {
                        if let Err(e) = apply_server_change(&engine, &table, &uid, &data).await {
                            warn!(table, "failed to apply server change: {e}");
                        }
                    }
                    StreamEvent::Closed => {
                        debug!(table, "server-tail closed");
                        break;
                    }
                    StreamEvent::Error(code, msg) => {
                        warn!(table, code, msg, "server-tail errored");
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    /// Open the local-tail stream, subscribe the engine to the table, and
    /// spawn a task forwarding both local changes (via the watcher) and
    /// server checkpoint acks (via the stream).
    async fn start_local_tail(&self, table: &str, uid: &str) -> Result<(), Error> {
        let mut stream = self.opener.open_stream()?;
        send_request(
            &stream,
            &Request::Write {
                table: table.to_string(),
            },
        );

        let change_file = change_file_name(table, &self.access_key);
        self.engine
            .subscribe(table, true, &change_file, uid)
            .await?;
        let mut watcher = self.watcher_factory.watch(&change_file).await?;

        let engine = self.engine.clone();
        let table_name = table.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    change = watcher.next_change() => {
                        match change {
                            Some(text) if !text.is_empty() => {
                                stream.send(Bytes::from(encode_request(&Request::Pipe { data: text })));
                            }
                            Some(_) => {}
                            None => break,
                        }
                    }
                    event = stream.recv() => {
                        match event {
                            Some(StreamEvent::Data(data)) => {
                                if let Err(e) = apply_checkpoint_ack(&engine, &table_name, &data).await {
                                    warn!(table = %table_name, "failed to persist checkpoint ack: {e}");
                                }
                            }
                            Some(StreamEvent::Closed | StreamEvent::Error(_, _)) | None => break,
                        }
                    }
                }
            }
        });
        Ok(())
    }
}

fn encode_request(req: &Request) -> Vec<u8> {
    serde_json::to_vec(req).expect("Request always serializes")
}

fn send_request(stream: &Stream, req: &Request) {
    stream.send(Bytes::from(encode_request(req)));
}

async fn recv_response(stream: &mut Stream) -> Result<Response, Error> {
    match stream.recv().await {
        Some(StreamEvent::Data(data)) => Ok(serde_json::from_slice(&data)?),
        Some(StreamEvent::Closed) | None => Err(Error::StreamClosed),
        Some(StreamEvent::Error(_, msg)) => Err(Error::Server(msg)),
    }
}

async fn apply_server_change<E: EngineHandle + ?Sized>(
    engine: &E,
    table: &str,
    uid: &str,
    data: &[u8],
) -> Result<(), Error> {
    let resp: Response = serde_json::from_slice(data)?;
    let Response::Pipe { data: payload } = resp else {
        trace!(table, "ignoring non-pipe server-tail message");
        return Ok(());
    };
    let mut csv = payload;
    if !csv.ends_with('\n') {
        csv.push('\n');
    }
    engine.write_csv(table, uid, &csv).await?;
    Ok(())
}

async fn apply_checkpoint_ack<E: EngineHandle + ?Sized>(
    engine: &E,
    table: &str,
    data: &[u8],
) -> Result<(), Error> {
    let checkpoint = String::from_utf8_lossy(data);
    engine
        .write_csv(
            &metadata_table(table),
            "checkpoint",
            &format!("watermark,{}\n", checkpoint.trim()),
        )
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Credentials;
    use crate::engine::FakeEngine;
    use crate::socket::MuxedSocket;
    use crate::transport::Message;
    use futures_util::{Sink, Stream as FStream};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, DuplexStream};

    struct NoopTransport(#[allow(dead_code)] DuplexStream);
    impl FStream for NoopTransport {
        type Item = Result<Message, std::io::Error>;
        fn poll_next(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            Poll::Pending
        }
    }
    impl Sink<Message> for NoopTransport {
        type Error = std::io::Error;
        fn poll_ready(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn start_send(self: Pin<&mut Self>, _item: Message) -> Result<(), Self::Error> {
            Ok(())
        }
        fn poll_flush(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
        fn poll_close(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }
    }

    struct EmptyWatcher;
    #[async_trait]
    impl ChangeWatcher for EmptyWatcher {
        async fn next_change(&mut self) -> Option<String> {
            std::future::pending().await
        }
    }
    struct EmptyWatcherFactory;
    #[async_trait]
    impl ChangeWatcherFactory for EmptyWatcherFactory {
        async fn watch(&self, _change_file: &str) -> Result<Box<dyn ChangeWatcher>, Error> {
            Ok(Box::new(EmptyWatcher))
        }
    }

    fn creds() -> Credentials {
        Credentials {
            access_key: "ABCDEFGHIJKLMNOPQRST".to_string(),
            private_key: b"k".to_vec(),
            device_uuid: "d".to_string(),
        }
    }

    #[tokio::test]
    async fn mirror_table_is_idempotent() {
        let (a, _b) = duplex(4096);
        let socket = MuxedSocket::connect(NoopTransport(a), &creds()).unwrap();
        let opener = socket.opener();
        let engine = Arc::new(FakeEngine::new("replica-1"));
        engine.write_csv("t", "init", "").await.unwrap();
        let coordinator = ReplicationCoordinator::new(
            opener,
            engine,
            Arc::new(EmptyWatcherFactory),
            "ABCDEFGHIJKLMNOPQRST",
        );
        coordinator.mirror_table("t").await.unwrap();
        coordinator.mirror_table("t").await.unwrap();
        assert_eq!(coordinator.mirrored.lock().await.len(), 1);
    }

    #[test]
    fn change_file_name_matches_spec_layout() {
        assert_eq!(
            change_file_name("t", "ABCDEFGHIJKLMNOPQRST"),
            "t_ABCDEFGHIJKLMNOPQRST"
        );
    }

    #[test]
    fn metadata_table_matches_spec_layout() {
        assert_eq!(metadata_table("t"), "skdb__t_sync_metadata");
    }
}

//! Shared record of which clients are connected and under which nickname.
//!
//! The registry is the only source of truth for broadcast recipients. Every
//! operation takes the same async mutex, so insert, remove and snapshot are
//! atomic with respect to each other. Network writes never happen under that
//! lock: broadcasters take a [`Registry::snapshot`] and write to the copied
//! handles afterwards.

use std::{collections::BTreeMap, fmt, io, sync::Arc};

use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{Mutex, MutexGuard},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type ClientId = u64;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Cloneable handle to one live connection.
///
/// Handles compare by [`ClientId`]. Writes are serialized through a per-handle
/// mutex so two concurrent broadcasts never interleave their bytes.
#[derive(Clone)]
pub struct ClientHandle {
    id: ClientId,
    writer: Arc<Mutex<Option<BoxedWriter>>>,
    closed: CancellationToken,
}

impl ClientHandle {
    /// Wraps the write half of a connection. Cancelling `closed` (or calling
    /// [`ClientHandle::close`]) tells the owning session to stop reading.
    pub fn new<W>(id: ClientId, writer: W, closed: CancellationToken) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            id,
            writer: Arc::new(Mutex::new(Some(Box::new(writer)))),
            closed,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Writes one already-encoded payload and flushes it.
    pub async fn send(&self, payload: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        write_payload(&mut writer, payload).await
    }

    /// Holds the writer exclusively until the guard is dropped.
    pub async fn lock_writer(&self) -> WriterGuard<'_> {
        WriterGuard {
            guard: self.writer.lock().await,
        }
    }

    /// Closes the connection. Safe to call any number of times.
    pub async fn close(&self) {
        self.closed.cancel();
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(err) = writer.shutdown().await {
                debug!(client = self.id, ?err, "failed to shut down client writer");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the handle has been closed from anywhere.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl PartialEq for ClientHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ClientHandle {}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Exclusive access to a handle's writer, see [`ClientHandle::lock_writer`].
pub struct WriterGuard<'a> {
    guard: MutexGuard<'a, Option<BoxedWriter>>,
}

impl WriterGuard<'_> {
    pub async fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        write_payload(&mut self.guard, payload).await
    }
}

async fn write_payload(writer: &mut Option<BoxedWriter>, payload: &[u8]) -> io::Result<()> {
    let Some(writer) = writer.as_mut() else {
        return Err(io::Error::new(
            io::ErrorKind::NotConnected,
            "client handle is closed",
        ));
    };
    writer.write_all(payload).await?;
    writer.flush().await
}

#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub handle: ClientHandle,
    pub nickname: String,
}

/// Mapping from active client handles to nicknames.
///
/// Keyed by a `BTreeMap` so snapshots come back in connection order.
#[derive(Default)]
pub struct Registry {
    clients: Mutex<BTreeMap<ClientId, RegistryEntry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a client. Returns `false` and leaves the existing entry untouched
    /// if the id is already registered.
    pub async fn insert(&self, handle: ClientHandle, nickname: String) -> bool {
        let mut clients = self.clients.lock().await;
        let id = handle.id();
        if clients.contains_key(&id) {
            return false;
        }
        clients.insert(id, RegistryEntry { handle, nickname });
        true
    }

    /// Removes a client, returning its entry only for the caller that actually
    /// removed it. Later calls for the same id are no-ops.
    pub async fn remove(&self, id: ClientId) -> Option<RegistryEntry> {
        self.clients.lock().await.remove(&id)
    }

    pub async fn lookup(&self, id: ClientId) -> Option<String> {
        self.clients
            .lock()
            .await
            .get(&id)
            .map(|entry| entry.nickname.clone())
    }

    /// Copies the current entries so callers can iterate without holding the lock.
    pub async fn snapshot(&self) -> Vec<RegistryEntry> {
        self.clients.lock().await.values().cloned().collect()
    }

    /// Empties the registry and hands back everything that was in it.
    pub async fn drain(&self) -> Vec<RegistryEntry> {
        let mut clients = self.clients.lock().await;
        std::mem::take(&mut *clients).into_values().collect()
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }
}

//! Connections to SFTP servers and the registry sharing them.
//!
//! Each login identity (`user@host`) owns at most one connection. A
//! connection stays open for a while after its last user went away so
//! that subsequent operations do not pay for another ssh handshake.

use crate::{
    error::{Error, Result},
    sftp::Channel,
    transport::{self, DiagnosticSlot, SshProcess, Transport},
    uri::Uri,
};
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::{
    fmt, io,
    ops::Deref,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard,
    },
    time::Duration,
};
use tokio::{
    sync::{MappedMutexGuard, Mutex, MutexGuard},
    task::JoinHandle,
};

/// A freshly negotiated SFTP session.
#[derive(Debug)]
pub struct Session {
    pub transport: Transport,
    pub version: u32,
}

/// Establishes sessions for the registry.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, uri: &'a Uri) -> BoxFuture<'a, Result<Session>>;
}

fn lock<T>(m: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct Lifecycle {
    refs: usize,
    close_timer: Option<JoinHandle<()>>,
}

/// A live session with one SFTP server.
pub struct Connection {
    key: String,
    version: u32,
    channel: Mutex<Option<Channel>>,
    lifecycle: StdMutex<Lifecycle>,
    broken: AtomicBool,
    process: StdMutex<Option<SshProcess>>,
    diagnostic: DiagnosticSlot,
    error_reader: StdMutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("key", &self.key)
            .field("version", &self.version)
            .field("broken", &self.is_broken())
            .finish()
    }
}

impl Connection {
    fn new(key: String, session: Session) -> Self {
        let Session { transport, version } = session;
        let Transport {
            reader,
            writer,
            mut process,
        } = transport;

        let diagnostic = DiagnosticSlot::default();
        let error_reader = process
            .as_mut()
            .and_then(SshProcess::take_stderr)
            .map(|stderr| transport::drain_errors(stderr, diagnostic.clone()));

        Self {
            key,
            version,
            channel: Mutex::new(Some(Channel::new(reader, writer))),
            lifecycle: StdMutex::new(Lifecycle::default()),
            broken: AtomicBool::new(false),
            process: StdMutex::new(process),
            diagnostic,
            error_reader: StdMutex::new(error_reader),
        }
    }

    /// The identity this connection was opened for.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Protocol version announced by the server.
    pub fn version(&self) -> u32 {
        self.version
    }

    /// The last line the ssh client printed on its error stream.
    fn diagnostic(&self) -> Option<String> {
        lock(&*self.diagnostic).clone()
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Take exclusive use of the connection's streams.
    ///
    /// The guard must be held from sending a request until its replies
    /// have been read.
    pub async fn channel(&self) -> Result<MappedMutexGuard<'_, Channel>> {
        let guard = self.channel.lock().await;
        let mut channel = MutexGuard::try_map(guard, Option::as_mut).map_err(|_| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is closed",
            ))
        })?;
        if let Err(err) = channel.begin() {
            return self.check(Err(err));
        }
        Ok(channel)
    }

    /// Pass through the result of an exchange, marking the connection
    /// unusable when the stream can no longer be trusted.
    pub fn check<T>(&self, res: Result<T>) -> Result<T> {
        if let Err(err) = &res {
            if err.is_fatal() && !self.broken.swap(true, Ordering::AcqRel) {
                match self.diagnostic() {
                    Some(diagnostic) => tracing::warn!(
                        key = %self.key,
                        error = %err,
                        %diagnostic,
                        "connection is broken"
                    ),
                    None => tracing::warn!(key = %self.key, error = %err, "connection is broken"),
                }
            }
        }
        res
    }

    fn retain(&self) {
        let mut life = lock(&self.lifecycle);
        life.refs += 1;
        if let Some(timer) = life.close_timer.take() {
            tracing::trace!(key = %self.key, "idle close cancelled");
            timer.abort();
        }
    }

    /// Close the streams and reap the ssh client.
    async fn close(&self) {
        tracing::info!(key = %self.key, "closing connection");
        drop(self.channel.lock().await.take());

        let process = lock(&self.process).take();
        if let Some(process) = process {
            process.shutdown().await;
        }
        if let Some(task) = lock(&self.error_reader).take() {
            task.abort();
        }
    }
}

type Slot = Arc<Mutex<Option<Arc<Connection>>>>;

struct Inner {
    connector: Arc<dyn Connector>,
    idle_timeout: Duration,
    table: DashMap<String, Slot>,
}

impl Inner {
    fn release(self: &Arc<Self>, conn: &Arc<Connection>) {
        let mut life = lock(&conn.lifecycle);
        life.refs = life.refs.saturating_sub(1);
        if life.refs > 0 {
            return;
        }

        let delay = if conn.is_broken() {
            Duration::from_secs(0)
        } else {
            self.idle_timeout
        };

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(..) => {
                tracing::debug!(key = %conn.key, "no runtime, connection is dropped");
                return;
            }
        };

        tracing::trace!(key = %conn.key, ?delay, "scheduling idle close");
        let registry = Arc::downgrade(self);
        let conn = conn.clone();
        life.close_timer = Some(runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(registry) = registry.upgrade() {
                registry.expire(conn).await;
            }
        }));
    }

    async fn expire(&self, conn: Arc<Connection>) {
        let slot = match self.table.get(&conn.key) {
            Some(slot) => slot.value().clone(),
            None => return,
        };

        let mut guard = slot.lock().await;
        match &*guard {
            Some(current) if Arc::ptr_eq(current, &conn) => {}
            _ => return,
        }
        {
            let mut life = lock(&conn.lifecycle);
            if life.refs > 0 {
                return;
            }
            // this task is the timer; let it run to the end.
            life.close_timer.take();
        }
        *guard = None;
        drop(guard);

        self.forget_if_unused(&conn.key, &slot);
        conn.close().await;
    }

    /// Remove an empty slot nobody else is waiting on.
    fn forget_if_unused(&self, key: &str, slot: &Slot) {
        self.table.remove_if(key, |_, v| {
            // one reference in the table, one held by the caller.
            Arc::ptr_eq(v, slot)
                && Arc::strong_count(v) == 2
                && matches!(v.try_lock(), Ok(guard) if guard.is_none())
        });
    }
}

/// The table of open connections, keyed by login identity.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("idle_timeout", &self.inner.idle_timeout)
            .field("connections", &self.inner.table.len())
            .finish()
    }
}

impl Registry {
    pub fn new(connector: Arc<dyn Connector>, idle_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                idle_timeout,
                table: DashMap::new(),
            }),
        }
    }

    /// Number of identities with an entry in the table.
    pub fn len(&self) -> usize {
        self.inner.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.table.is_empty()
    }

    /// Get the connection for the identity of `uri`, opening it if needed.
    ///
    /// Concurrent callers for the same identity wait for a single login.
    pub async fn acquire(&self, uri: &Uri) -> Result<ConnectionRef> {
        let key = uri.identity();
        let slot = self
            .inner
            .table
            .entry(key.clone())
            .or_insert_with(Slot::default)
            .value()
            .clone();

        let mut guard = slot.lock().await;

        if let Some(conn) = &*guard {
            if !conn.is_broken() {
                conn.retain();
                tracing::trace!(%key, "reusing connection");
                return Ok(ConnectionRef {
                    conn: conn.clone(),
                    registry: self.inner.clone(),
                });
            }
        }

        if let Some(stale) = guard.take() {
            tracing::debug!(%key, "replacing broken connection");
            tokio::spawn(async move { stale.close().await });
        }

        tracing::info!(%key, "opening connection");
        let session = match self.inner.connector.connect(uri).await {
            Ok(session) => session,
            Err(err) => {
                tracing::debug!(%key, error = %err, "failed to connect");
                drop(guard);
                self.inner.forget_if_unused(&key, &slot);
                return Err(err);
            }
        };
        tracing::debug!(%key, version = session.version, "connected");

        let conn = Arc::new(Connection::new(key, session));
        conn.retain();
        *guard = Some(conn.clone());

        Ok(ConnectionRef {
            conn,
            registry: self.inner.clone(),
        })
    }

    /// Close every connection and empty the table.
    pub async fn shutdown(&self) {
        let slots: Vec<Slot> = self
            .inner
            .table
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.inner.table.clear();

        for slot in slots {
            let conn = slot.lock().await.take();
            if let Some(conn) = conn {
                if let Some(timer) = lock(&conn.lifecycle).close_timer.take() {
                    timer.abort();
                }
                conn.close().await;
            }
        }
    }
}

/// A counted reference to a connection; dropping it releases the
/// connection back to the registry.
pub struct ConnectionRef {
    conn: Arc<Connection>,
    registry: Arc<Inner>,
}

impl fmt::Debug for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.conn, f)
    }
}

impl ConnectionRef {
    /// Whether both references point at the same connection.
    pub fn ptr_eq(this: &Self, other: &Self) -> bool {
        Arc::ptr_eq(&this.conn, &other.conn)
    }
}

impl Clone for ConnectionRef {
    fn clone(&self) -> Self {
        self.conn.retain();
        Self {
            conn: self.conn.clone(),
            registry: self.registry.clone(),
        }
    }
}

impl Deref for ConnectionRef {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl Drop for ConnectionRef {
    fn drop(&mut self) {
        self.registry.release(&self.conn);
    }
}

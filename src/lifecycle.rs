//! Connection lifecycle: acquisition, identity, and the release sequence.
//!
//! Releasing a connection always runs Sync, then `DISCARD ALL`, then close.
//! Each step is best-effort: failures are logged and never reach the caller
//! whose query outcome is already decided. Release runs at most once per
//! handle no matter how many paths ask for it.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::message::{Request, Response, StatementName};
use crate::registry::StatementRegistry;
use crate::transport::{Connection, ConnectionFactory};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

// ============================================================================
// Connection handle
// ============================================================================

struct HandleInner {
    id: u64,
    conn: Arc<dyn Connection>,
    released: AtomicBool,
}

/// An acquired connection with a stable identity.
///
/// Clones share identity and release state.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    pub fn new(conn: Arc<dyn Connection>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
                conn,
                released: AtomicBool::new(false),
            }),
        }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Send one request, mapping a server error response into an error.
    pub async fn send(&self, request: Request) -> Result<Response> {
        if self.is_released() {
            return Err(ClientError::Closed);
        }
        match self.inner.conn.send(request).await? {
            Response::Error(err) => Err(ClientError::Server(err)),
            response => Ok(response),
        }
    }

    /// Run the reset sequence and close. Only the first call does anything.
    pub async fn release(&self) {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return;
        }

        let conn = &self.inner.conn;
        let id = self.inner.id;

        match conn.send(Request::Sync).await {
            Ok(Response::Error(err)) => warn!(connection = id, error = %err, "sync failed during release"),
            Err(err) => warn!(connection = id, error = %err, "sync failed during release"),
            Ok(_) => {}
        }
        match conn.send(Request::Query("DISCARD ALL".to_string())).await {
            Ok(Response::Error(err)) => warn!(connection = id, error = %err, "DISCARD ALL failed during release"),
            Err(err) => warn!(connection = id, error = %err, "DISCARD ALL failed during release"),
            Ok(_) => {}
        }
        if let Err(err) = conn.close().await {
            warn!(connection = id, error = %err, "close failed during release");
        }

        debug!(connection = id, "connection released");
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("released", &self.is_released())
            .finish()
    }
}

// ============================================================================
// Lifecycle controller
// ============================================================================

/// Acquires connections and guarantees their release.
#[derive(Clone)]
pub struct Lifecycle {
    factory: Arc<dyn ConnectionFactory>,
    registry: Arc<StatementRegistry>,
}

impl Lifecycle {
    pub fn new(factory: Arc<dyn ConnectionFactory>, registry: Arc<StatementRegistry>) -> Self {
        Self { factory, registry }
    }

    pub fn registry(&self) -> &Arc<StatementRegistry> {
        &self.registry
    }

    pub fn factory(&self) -> &Arc<dyn ConnectionFactory> {
        &self.factory
    }

    pub async fn acquire(&self) -> Result<ConnectionHandle> {
        let conn = ConnectionHandle::new(self.factory.acquire().await?);
        debug!(connection = conn.id(), "connection acquired");
        Ok(conn)
    }

    /// Arm a guard that releases `conn` (and drops `name` from the registry)
    /// even if the calling future is dropped before finishing.
    pub fn guard(&self, conn: ConnectionHandle, name: Option<StatementName>) -> ReleaseGuard {
        ReleaseGuard {
            conn,
            name,
            registry: Arc::clone(&self.registry),
            armed: true,
        }
    }
}

// ============================================================================
// Release guard
// ============================================================================

/// Scoped ownership of a connection's cleanup.
///
/// Either [`ReleaseGuard::release`] is awaited, or the guard is dropped and
/// the same cleanup is spawned onto the current runtime.
pub struct ReleaseGuard {
    conn: ConnectionHandle,
    name: Option<StatementName>,
    registry: Arc<StatementRegistry>,
    armed: bool,
}

impl ReleaseGuard {
    fn deregister(&mut self) {
        if let Some(name) = self.name.take() {
            if self.registry.remove_if_matches(&name, &self.conn) {
                debug!(statement = %name, connection = self.conn.id(), "statement deregistered");
            }
        }
    }

    /// Keep the connection; cleanup becomes someone else's job.
    pub fn disarm(mut self) -> ConnectionHandle {
        self.armed = false;
        self.conn.clone()
    }

    /// Deregister and release now. The release itself runs on a spawned task
    /// so it completes even if this future is abandoned.
    pub async fn release(mut self) {
        self.armed = false;
        self.deregister();
        let conn = self.conn.clone();
        let task = async move { conn.release().await };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let _ = runtime.spawn(task).await;
            }
            Err(_) => task.await,
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.deregister();
        let conn = self.conn.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { conn.release().await });
            }
            Err(_) => warn!(connection = conn.id(), "no runtime to release connection"),
        }
    }
}

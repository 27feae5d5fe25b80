//! Connection pool backing the default transport.
//!
//! A semaphore bounds how many connections are checked out at once; idle
//! connections wait in a plain vector. Closing a [`PooledConnection`]
//! hands its socket back to the idle list when it is still usable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use super::connection::PgConnection;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::message::{Request, Response};
use crate::transport::{Connection, ConnectionFactory};

struct PoolInner {
    config: ClientConfig,
    idle: Mutex<Vec<PgConnection>>,
    semaphore: Arc<Semaphore>,
    closed: AtomicBool,
}

/// A bounded pool of [`PgConnection`]s.
#[derive(Clone)]
pub struct PgPool {
    inner: Arc<PoolInner>,
}

impl PgPool {
    /// Create the pool and open `min_connections` up front.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let inner = Arc::new(PoolInner {
            semaphore: Arc::new(Semaphore::new(config.max_connections as usize)),
            idle: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            config,
        });

        for _ in 0..inner.config.min_connections {
            let conn = PgConnection::connect(&inner.config).await?;
            inner.idle.lock().push(conn);
        }

        Ok(Self { inner })
    }

    pub async fn checkout(&self) -> Result<PooledConnection> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        let permit = Arc::clone(&self.inner.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| ClientError::Closed)?;

        let reused = {
            let mut idle = self.inner.idle.lock();
            std::iter::from_fn(|| idle.pop()).find(PgConnection::is_usable)
        };
        let conn = match reused {
            Some(conn) => conn,
            None => PgConnection::connect(&self.inner.config).await?,
        };
        debug!(backend_pid = conn.backend_pid(), "connection checked out");

        Ok(PooledConnection {
            conn: tokio::sync::Mutex::new(Some(conn)),
            pool: Arc::clone(&self.inner),
            permit: Mutex::new(Some(permit)),
        })
    }

    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().len()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }
}

#[async_trait]
impl ConnectionFactory for PgPool {
    async fn acquire(&self) -> Result<Arc<dyn Connection>> {
        Ok(Arc::new(self.checkout().await?))
    }

    /// Refuse new checkouts and terminate idle connections. Checked-out
    /// connections are terminated when they are closed.
    async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.inner.semaphore.close();

        let idle = std::mem::take(&mut *self.inner.idle.lock());
        debug!(idle = idle.len(), "closing pool");
        for mut conn in idle {
            if let Err(err) = conn.terminate().await {
                warn!(error = %err, "failed to terminate idle connection");
            }
        }
        Ok(())
    }
}

/// A connection checked out of a [`PgPool`].
pub struct PooledConnection {
    /// One exchange at a time.
    conn: tokio::sync::Mutex<Option<PgConnection>>,
    pool: Arc<PoolInner>,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

#[async_trait]
impl Connection for PooledConnection {
    async fn send(&self, request: Request) -> Result<Response> {
        let mut conn = self.conn.lock().await;
        conn.as_mut()
            .ok_or(ClientError::Closed)?
            .exchange(&request)
            .await
    }

    async fn close(&self) -> Result<()> {
        let conn = self.conn.lock().await.take();
        let result = match conn {
            Some(conn) if conn.is_usable() && !self.pool.closed.load(Ordering::Acquire) => {
                self.pool.idle.lock().push(conn);
                Ok(())
            }
            Some(mut conn) => conn.terminate().await,
            None => Ok(()),
        };
        self.permit.lock().take();
        result
    }
}

//! Message router: picks the connection that must carry each request.
//!
//! Server-side prepared statements are connection-local, so every request
//! naming a statement has to travel on the connection that parsed it.
//! Requests without a name may use any connection and hold it for exactly
//! one round trip.

use tracing::{debug, trace};

use crate::error::{ClientError, Result};
use crate::lifecycle::Lifecycle;
use crate::message::{Request, Response, StatementName};
use crate::registry::StatementRegistry;

/// How a request is bound to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// New connection; a successful Parse pins it under the statement name.
    Fresh,
    /// Pinned connection; a failure unpins and releases it.
    StickyReuse,
    /// Pinned connection, unpinned and released whatever the outcome.
    StickyConsume,
    /// New connection released after one round trip.
    FireAndRelease,
}

impl Dispatch {
    pub fn of(request: &Request) -> Self {
        match request {
            Request::Parse { .. } => Dispatch::Fresh,
            Request::Bind { .. } | Request::Describe { .. } | Request::Execute { .. } => {
                Dispatch::StickyReuse
            }
            Request::Close { .. } => Dispatch::StickyConsume,
            Request::Query(_) | Request::Sync => Dispatch::FireAndRelease,
        }
    }
}

#[derive(Clone)]
pub struct Router {
    lifecycle: Lifecycle,
}

impl Router {
    pub fn new(lifecycle: Lifecycle) -> Self {
        Self { lifecycle }
    }

    pub fn registry(&self) -> &StatementRegistry {
        self.lifecycle.registry()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub async fn dispatch(&self, request: Request) -> Result<Response> {
        let strategy = Dispatch::of(&request);
        trace!(kind = request.kind(), ?strategy, "routing request");

        match strategy {
            Dispatch::Fresh => self.fresh(request).await,
            Dispatch::StickyReuse => self.sticky(request, false).await,
            Dispatch::StickyConsume => self.sticky(request, true).await,
            Dispatch::FireAndRelease => self.fire_and_release(request).await,
        }
    }

    /// Unpin `name` and release its connection. Returns false if the name
    /// was not registered.
    pub async fn retire(&self, name: &StatementName) -> bool {
        match self.registry().get(name) {
            Some(conn) => {
                self.lifecycle
                    .guard(conn, Some(name.clone()))
                    .release()
                    .await;
                true
            }
            None => false,
        }
    }

    async fn fresh(&self, request: Request) -> Result<Response> {
        let name = request
            .statement_name()
            .cloned()
            .ok_or_else(|| ClientError::mismatch("named Parse", request.kind()))?;

        let conn = self.lifecycle.acquire().await?;
        let guard = self.lifecycle.guard(conn.clone(), None);

        match conn.send(request).await {
            Ok(Response::ParseComplete) => {
                if let Err(err) = self.registry().put_if_absent(name.clone(), conn.clone()) {
                    guard.release().await;
                    return Err(err);
                }
                guard.disarm();
                debug!(statement = %name, connection = conn.id(), "statement registered");
                Ok(Response::ParseComplete)
            }
            Ok(other) => {
                guard.release().await;
                Err(ClientError::mismatch("ParseComplete", other))
            }
            Err(err) => {
                guard.release().await;
                Err(err)
            }
        }
    }

    async fn sticky(&self, request: Request, consume: bool) -> Result<Response> {
        let name = request
            .statement_name()
            .cloned()
            .ok_or_else(|| ClientError::mismatch("named request", request.kind()))?;
        let conn = self
            .registry()
            .get(&name)
            .ok_or_else(|| ClientError::UnknownStatement(name.to_string()))?;
        let guard = self.lifecycle.guard(conn.clone(), Some(name));

        let result = conn.send(request).await;
        if consume || result.is_err() {
            guard.release().await;
        } else {
            guard.disarm();
        }
        result
    }

    async fn fire_and_release(&self, request: Request) -> Result<Response> {
        let conn = self.lifecycle.acquire().await?;
        let guard = self.lifecycle.guard(conn.clone(), None);
        let result = conn.send(request).await;
        guard.release().await;
        result
    }
}

//! The two narrow interfaces the client consumes from its transport.
//!
//! Anything that can hand out connections and exchange one [`Request`] for
//! one [`Response`] can drive a [`crate::Client`]. The default
//! implementation is [`crate::pg::PgPool`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::message::{Request, Response};

/// A single-use-at-a-time channel to the server.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    /// Send one message and wait for its matched response.
    async fn send(&self, request: Request) -> Result<Response>;

    /// Give the connection back. Called exactly once per acquisition.
    async fn close(&self) -> Result<()>;
}

/// Source of connections.
#[async_trait]
pub trait ConnectionFactory: Send + Sync + 'static {
    async fn acquire(&self) -> Result<Arc<dyn Connection>>;

    /// Shut the factory down. In-flight connections are unaffected.
    async fn close(&self) -> Result<()>;
}

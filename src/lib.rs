//! pgmux: a PostgreSQL client built around connection-pinned prepared
//! statements.
//!
//! A [`Client`] runs one-shot simple queries on whichever connection its
//! [`ConnectionFactory`] hands out, and prepares statements that stay on
//! the connection that parsed them until they are closed, dropped, or fail.
//!
//! ```no_run
//! # async fn demo() -> pgmux::Result<()> {
//! let client = pgmux::Client::connect_url("postgres://postgres@localhost/app").await?;
//!
//! let stmt = client.prepare("SELECT $1::int AS n").await?;
//! let ns = stmt.select(&[&42i32], |row| row.get::<i32>("n")).await?;
//! assert_eq!(ns.into_iter().collect::<pgmux::Result<Vec<_>>>()?, vec![42]);
//!
//! let deleted = client.execute_update("DELETE FROM jobs WHERE done").await?;
//! # let _ = deleted;
//! stmt.close().await?;
//! client.close().await
//! # }
//! ```

pub mod client;
pub mod config;
pub mod convert;
pub mod error;
pub mod lifecycle;
pub mod message;
pub mod pg;
pub mod projector;
pub mod registry;
pub mod router;
pub mod statement;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;

pub use client::Client;
pub use config::ClientConfig;
pub use convert::{FromValue, ToValue};
pub use error::{ClientError, Result, ServerError};
pub use message::{FieldDescriptor, Request, Response, StatementName};
pub use projector::{Columns, CustomTypes, QueryResponse, ResultSet, Row};
pub use statement::{PreparedStatement, SessionState};
pub use transport::{Connection, ConnectionFactory};
pub use types::{Format, Oid, Value};

//! Default transport: a hand-written PostgreSQL client over tokio TCP.
//!
//! - `protocol`: wire framing of frontend and backend messages
//! - `connection`: startup, authentication and request/response exchange
//! - `pool`: bounded pool implementing [`crate::ConnectionFactory`]
//! - `scram`: SCRAM-SHA-256 authentication

pub mod connection;
pub mod pool;
pub mod protocol;
pub mod scram;


pub use connection::PgConnection;
pub use pool::{PgPool, PooledConnection};

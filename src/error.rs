//! Error types for the pgmux client.
//!
//! Every public operation resolves either with a typed result or with one
//! of these kinds. Cleanup failures are never reported through here.

use std::collections::HashMap;
use std::fmt;
use std::io;

use thiserror::Error;

/// An explicit error response sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl ServerError {
    /// Build from the tagged fields of an ErrorResponse message.
    pub fn from_fields(fields: &HashMap<u8, String>) -> Self {
        Self {
            severity: fields.get(&b'S').cloned().unwrap_or_default(),
            code: fields.get(&b'C').cloned().unwrap_or_default(),
            message: fields.get(&b'M').cloned().unwrap_or_default(),
            detail: fields.get(&b'D').cloned(),
            hint: fields.get(&b'H').cloned(),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)?;
        if let Some(d) = &self.detail {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = &self.hint {
            write!(f, "\nHint: {}", h)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum ClientError {
    /// A response arrived that the current step did not expect.
    #[error("Protocol mismatch: expected {expected}, received {received}")]
    ProtocolMismatch {
        expected: &'static str,
        received: String,
    },

    /// Bind/Describe/Execute referenced a name that was never registered.
    #[error("Unknown statement: {0}")]
    UnknownStatement(String),

    /// The statement's connection has already been released.
    #[error("Statement is no longer usable: {0}")]
    StaleStatement(String),

    /// A Parse tried to register a name that is already pinned.
    #[error("Statement name already registered: {0}")]
    DuplicateStatement(String),

    #[error("Transport failure: {0}")]
    Transport(#[from] io::Error),

    #[error("Server error: {0}")]
    Server(ServerError),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Client is closed")]
    Closed,
}

impl ClientError {
    pub(crate) fn mismatch(expected: &'static str, received: impl fmt::Debug) -> Self {
        ClientError::ProtocolMismatch {
            expected,
            received: format!("{:?}", received),
        }
    }

    /// True when the failure came from the connection itself rather than
    /// from the server or the caller.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, ClientError::Transport(_) | ClientError::Closed)
    }
}

impl From<ServerError> for ClientError {
    fn from(err: ServerError) -> Self {
        ClientError::Server(err)
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;

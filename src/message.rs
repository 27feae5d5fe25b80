//! Messages exchanged with a connection, one request for one response.
//!
//! These are the frontend/backend vocabulary the router dispatches on.
//! Byte-level framing lives in [`crate::pg::protocol`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::error::ServerError;
use crate::types::{Format, Oid, Value};

// ============================================================================
// Statement names
// ============================================================================

static NEXT_STATEMENT_ID: AtomicU64 = AtomicU64::new(0);

/// Client-generated name shared by a server-side statement and its portal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StatementName(Arc<str>);

impl StatementName {
    /// A name unique for the lifetime of the process.
    pub fn generate() -> Self {
        let id = NEXT_STATEMENT_ID.fetch_add(1, Ordering::Relaxed);
        Self(Arc::from(format!("__pgmux_{}", id)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StatementName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// Field descriptors
// ============================================================================

/// One column of a row description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub format: Format,
    pub type_oid: Oid,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, format: Format, type_oid: Oid) -> Self {
        Self {
            name: name.into(),
            format,
            type_oid,
        }
    }
}

/// A row as received: one optional raw buffer per column.
pub type RawRow = Vec<Option<Bytes>>;

// ============================================================================
// Requests
// ============================================================================

/// An outgoing protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Simple query.
    Query(String),
    /// Create the named prepared statement.
    Parse {
        name: StatementName,
        sql: String,
        param_types: Vec<Oid>,
    },
    /// Bind parameters into the portal of the same name.
    Bind {
        name: StatementName,
        params: Vec<Value>,
    },
    /// Describe the portal of the given name.
    Describe { name: StatementName },
    /// Run the portal; `max_rows == 0` means no limit.
    Execute { name: StatementName, max_rows: i32 },
    /// Close the named statement on the server.
    Close { name: StatementName },
    /// End the extended-query cycle.
    Sync,
}

impl Request {
    /// The statement name this request is pinned to, if any.
    pub fn statement_name(&self) -> Option<&StatementName> {
        match self {
            Request::Parse { name, .. }
            | Request::Bind { name, .. }
            | Request::Describe { name }
            | Request::Execute { name, .. }
            | Request::Close { name } => Some(name),
            Request::Query(_) | Request::Sync => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Request::Query(_) => "Query",
            Request::Parse { .. } => "Parse",
            Request::Bind { .. } => "Bind",
            Request::Describe { .. } => "Describe",
            Request::Execute { .. } => "Execute",
            Request::Close { .. } => "Close",
            Request::Sync => "Sync",
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

/// The decoded reply to one [`Request`].
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    ParseComplete,
    BindComplete,
    CloseComplete,
    /// Portal description with result columns.
    RowDescription(Vec<FieldDescriptor>),
    /// Portal produces no rows.
    NoData,
    /// Rows returned by Execute.
    Rows { rows: Vec<RawRow>, tag: String },
    /// Completion of a statement that produced no rows.
    CommandComplete { tag: String },
    /// Row-returning simple query (fields are kept even with zero rows).
    SelectResult {
        fields: Vec<FieldDescriptor>,
        rows: Vec<RawRow>,
    },
    ReadyForQuery,
    Error(ServerError),
}

/// Parse rows affected from a command tag (e.g. "INSERT 0 5" -> 5).
pub fn affected_rows(tag: &str) -> u64 {
    let parts: Vec<&str> = tag.split_whitespace().collect();
    match parts.as_slice() {
        ["INSERT", _, n] => n.parse().unwrap_or(0),
        [_, n] => n.parse().unwrap_or(0),
        _ => 0,
    }
}

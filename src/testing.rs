//! Scripted in-memory transport for unit tests.
//!
//! Each acquired connection behaves like a tiny echo server: a prepared
//! `SELECT` returns its bound parameters as a single row, other statements
//! complete with one affected row. Every request is recorded so tests can
//! count Parse/Bind/Execute traffic and closes per connection.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;

use crate::error::{ClientError, Result, ServerError};
use crate::message::{FieldDescriptor, RawRow, Request, Response, StatementName};
use crate::transport::{Connection, ConnectionFactory};
use crate::types::{Format, Value};

/// Failure injection, applied to connections acquired after it is set.
#[derive(Debug, Clone, Default)]
pub struct Script {
    transport_failures: Vec<&'static str>,
    server_failures: Vec<&'static str>,
    fail_close: bool,
}

impl Script {
    pub fn fail_on(kind: &'static str) -> Self {
        Self::default().and_fail_on(kind)
    }

    pub fn server_error_on(kind: &'static str) -> Self {
        Self::default().and_server_error_on(kind)
    }

    pub fn and_fail_on(mut self, kind: &'static str) -> Self {
        self.transport_failures.push(kind);
        self
    }

    pub fn and_server_error_on(mut self, kind: &'static str) -> Self {
        self.server_failures.push(kind);
        self
    }

    pub fn and_fail_close(mut self) -> Self {
        self.fail_close = true;
        self
    }
}

pub fn server_error(message: &str) -> ServerError {
    ServerError {
        severity: "ERROR".to_string(),
        code: "XX000".to_string(),
        message: message.to_string(),
        detail: None,
        hint: None,
    }
}

// ============================================================================
// Mock connection
// ============================================================================

pub struct MockConnection {
    script: Script,
    queries: Arc<Mutex<HashMap<String, Response>>>,
    sent: Mutex<Vec<Request>>,
    statements: Mutex<HashMap<StatementName, String>>,
    portals: Mutex<HashMap<StatementName, Vec<Value>>>,
    closes: AtomicUsize,
    total_closes: Arc<AtomicUsize>,
}

impl MockConnection {
    pub fn sent(&self) -> Vec<Request> {
        self.sent.lock().clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(Request::kind).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.sent.lock().iter().filter(|r| r.kind() == kind).count()
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    fn respond(&self, request: &Request) -> Response {
        match request {
            Request::Query(sql) => self
                .queries
                .lock()
                .get(sql)
                .cloned()
                .unwrap_or_else(|| default_query_response(sql)),
            Request::Parse { name, sql, .. } => {
                self.statements.lock().insert(name.clone(), sql.clone());
                Response::ParseComplete
            }
            Request::Bind { name, params } => {
                if !self.statements.lock().contains_key(name) {
                    return Response::Error(server_error("prepared statement does not exist"));
                }
                self.portals.lock().insert(name.clone(), params.clone());
                Response::BindComplete
            }
            Request::Describe { name } => match self.select_fields(name) {
                Some(fields) => Response::RowDescription(fields),
                None => Response::NoData,
            },
            Request::Execute { name, .. } => {
                let params = self.portals.lock().get(name).cloned().unwrap_or_default();
                if self.select_fields(name).is_some() {
                    let row: RawRow = params
                        .iter()
                        .map(|p| {
                            let mut buf = BytesMut::new();
                            p.encode_binary(&mut buf).map(|_| buf.freeze())
                        })
                        .collect();
                    Response::Rows {
                        rows: vec![row],
                        tag: "SELECT 1".to_string(),
                    }
                } else {
                    Response::CommandComplete {
                        tag: command_tag(&self.statements.lock().get(name).cloned().unwrap_or_default()),
                    }
                }
            }
            Request::Close { name } => {
                self.statements.lock().remove(name);
                Response::CloseComplete
            }
            Request::Sync => Response::ReadyForQuery,
        }
    }

    /// A prepared SELECT echoes its parameters; columns are named after
    /// the `AS` aliases in the statement text.
    fn select_fields(&self, name: &StatementName) -> Option<Vec<FieldDescriptor>> {
        let sql = self.statements.lock().get(name).cloned()?;
        if !sql.trim_start().to_uppercase().starts_with("SELECT") {
            return None;
        }
        let params = self.portals.lock().get(name).cloned().unwrap_or_default();
        let words: Vec<&str> = sql.split_whitespace().collect();
        let aliases: Vec<&str> = words
            .windows(2)
            .filter(|w| w[0].eq_ignore_ascii_case("AS"))
            .map(|w| w[1].trim_end_matches(','))
            .collect();
        Some(
            params
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    FieldDescriptor::new(
                        aliases.get(i).copied().unwrap_or("?column?"),
                        Format::Binary,
                        p.type_oid(),
                    )
                })
                .collect(),
        )
    }
}

fn command_tag(sql: &str) -> String {
    let verb = sql
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_uppercase();
    match verb.as_str() {
        "INSERT" => "INSERT 0 1".to_string(),
        "DELETE" | "UPDATE" => format!("{} 1", verb),
        _ => verb,
    }
}

fn default_query_response(sql: &str) -> Response {
    if sql.trim_start().to_uppercase().starts_with("SELECT") {
        Response::SelectResult {
            fields: Vec::new(),
            rows: Vec::new(),
        }
    } else {
        Response::CommandComplete {
            tag: command_tag(sql),
        }
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn send(&self, request: Request) -> Result<Response> {
        let kind = request.kind();
        self.sent.lock().push(request.clone());
        tokio::task::yield_now().await;

        if self.script.transport_failures.contains(&kind) {
            return Err(ClientError::Transport(io::Error::new(
                io::ErrorKind::ConnectionReset,
                format!("injected failure on {}", kind),
            )));
        }
        if self.script.server_failures.contains(&kind) {
            return Ok(Response::Error(server_error("injected server error")));
        }
        Ok(self.respond(&request))
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.total_closes.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_close {
            return Err(ClientError::Transport(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "injected close failure",
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Mock factory
// ============================================================================

#[derive(Default)]
struct FactoryInner {
    connections: Mutex<Vec<Arc<MockConnection>>>,
    script: Mutex<Script>,
    queries: Arc<Mutex<HashMap<String, Response>>>,
    total_closes: Arc<AtomicUsize>,
    factory_closes: AtomicUsize,
    closed: AtomicBool,
    fail_acquire: AtomicBool,
}

#[derive(Clone, Default)]
pub struct MockFactory {
    inner: Arc<FactoryInner>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, script: Script) {
        *self.inner.script.lock() = script;
    }

    pub fn fail_acquire(&self, fail: bool) {
        self.inner.fail_acquire.store(fail, Ordering::SeqCst);
    }

    /// Canned response for a simple query.
    pub fn respond_to(&self, sql: &str, response: Response) {
        self.inner.queries.lock().insert(sql.to_string(), response);
    }

    pub fn connection(&self, index: usize) -> Arc<MockConnection> {
        Arc::clone(&self.inner.connections.lock()[index])
    }

    pub fn acquired(&self) -> usize {
        self.inner.connections.lock().len()
    }

    pub fn total_closes(&self) -> usize {
        self.inner.total_closes.load(Ordering::SeqCst)
    }

    pub fn factory_closes(&self) -> usize {
        self.inner.factory_closes.load(Ordering::SeqCst)
    }

    /// Total requests of `kind` across all connections.
    pub fn count(&self, kind: &str) -> usize {
        self.inner
            .connections
            .lock()
            .iter()
            .map(|c| c.count(kind))
            .sum()
    }

    /// Wait for cleanup running on spawned tasks.
    pub async fn wait_for_closes(&self, n: usize) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while self.total_closes() < n {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {} closes", n);
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn acquire(&self) -> Result<Arc<dyn Connection>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(ClientError::Closed);
        }
        if self.inner.fail_acquire.load(Ordering::SeqCst) {
            return Err(ClientError::Transport(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "injected acquire failure",
            )));
        }
        let conn = Arc::new(MockConnection {
            script: self.inner.script.lock().clone(),
            queries: Arc::clone(&self.inner.queries),
            sent: Mutex::new(Vec::new()),
            statements: Mutex::new(HashMap::new()),
            portals: Mutex::new(HashMap::new()),
            closes: AtomicUsize::new(0),
            total_closes: Arc::clone(&self.inner.total_closes),
        });
        self.inner.connections.lock().push(Arc::clone(&conn));
        Ok(conn)
    }

    async fn close(&self) -> Result<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.factory_closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

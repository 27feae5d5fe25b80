//! Prepared statement sessions.
//!
//! A statement is parsed once on one connection and stays pinned there.
//! Every `fire` runs Bind → Describe → Execute on that connection. Any
//! failure retires the statement: its name is unpinned, the connection is
//! released, and later calls fail with [`ClientError::StaleStatement`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::convert::ToValue;
use crate::error::{ClientError, Result};
use crate::message::{affected_rows, FieldDescriptor, Request, Response, StatementName};
use crate::projector::{project, Columns, CustomTypes, QueryResponse, Row};
use crate::router::Router;
use crate::types::Value;

/// Where a statement is within its current `fire`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Parsed,
    Bound,
    Described,
    Executed,
    /// Terminal.
    Failed,
}

pub struct PreparedStatement {
    name: StatementName,
    sql: String,
    router: Router,
    custom_types: Arc<CustomTypes>,
    state: Mutex<SessionState>,
    columns: Mutex<Option<Arc<Columns>>>,
    /// Serializes `fire` calls; one portal per statement.
    serial: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl PreparedStatement {
    pub(crate) fn new(
        name: StatementName,
        sql: String,
        router: Router,
        custom_types: Arc<CustomTypes>,
    ) -> Self {
        Self {
            name,
            sql,
            router,
            custom_types,
            state: Mutex::new(SessionState::Parsed),
            columns: Mutex::new(None),
            serial: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &StatementName {
        &self.name
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Bind `params`, run the statement, and return its outcome.
    pub async fn fire(&self, params: &[&(dyn ToValue + Sync)]) -> Result<QueryResponse> {
        let params = params.iter().map(|p| p.to_value()).collect();
        self.fire_values(params).await
    }

    pub async fn fire_values(&self, params: Vec<Value>) -> Result<QueryResponse> {
        let _serial = self.serial.lock().await;

        if self.closed.load(Ordering::Acquire) || !self.router.registry().contains(&self.name) {
            self.set_state(SessionState::Failed);
            return Err(ClientError::StaleStatement(self.name.to_string()));
        }

        match self.run(params).await {
            Ok(response) => Ok(response),
            Err(err) => {
                self.set_state(SessionState::Failed);
                if self.router.retire(&self.name).await {
                    debug!(statement = %self.name, error = %err, "statement retired after failure");
                }
                Err(match err {
                    ClientError::UnknownStatement(name) => ClientError::StaleStatement(name),
                    other => other,
                })
            }
        }
    }

    /// Run a statement that must not return rows.
    pub async fn exec(&self, params: &[&(dyn ToValue + Sync)]) -> Result<u64> {
        match self.fire(params).await? {
            QueryResponse::Ok(affected) => Ok(affected),
            QueryResponse::ResultSet(rs) => Err(ClientError::mismatch(
                "command completion",
                format!("result set with {} rows", rs.len()),
            )),
        }
    }

    /// Run a row-returning statement and map every row through `projection`.
    pub async fn select<T, F>(&self, params: &[&(dyn ToValue + Sync)], projection: F) -> Result<Vec<T>>
    where
        F: FnMut(Row) -> T,
    {
        match self.fire(params).await? {
            QueryResponse::ResultSet(rs) => Ok(rs.into_iter().map(projection).collect()),
            QueryResponse::Ok(affected) => Err(ClientError::mismatch(
                "result set",
                format!("command completion ({} rows affected)", affected),
            )),
        }
    }

    /// Close the statement on the server and release its connection.
    /// Closing twice, or after a failure already retired it, is a no-op.
    pub async fn close(&self) -> Result<()> {
        let _serial = self.serial.lock().await;
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let result = self
            .router
            .dispatch(Request::Close {
                name: self.name.clone(),
            })
            .await;
        self.set_state(SessionState::Failed);

        match result {
            Ok(Response::CloseComplete) | Err(ClientError::UnknownStatement(_)) => Ok(()),
            Ok(other) => Err(ClientError::mismatch("CloseComplete", other)),
            Err(err) => Err(err),
        }
    }

    async fn run(&self, params: Vec<Value>) -> Result<QueryResponse> {
        trace!(statement = %self.name, params = params.len(), "firing statement");
        let name = self.name.clone();

        match self
            .router
            .dispatch(Request::Bind {
                name: name.clone(),
                params,
            })
            .await?
        {
            Response::BindComplete => self.set_state(SessionState::Bound),
            other => return Err(ClientError::mismatch("BindComplete", other)),
        }

        let columns = match self
            .router
            .dispatch(Request::Describe { name: name.clone() })
            .await?
        {
            Response::RowDescription(fields) => Some(self.columns_for(fields)),
            Response::NoData => None,
            other => return Err(ClientError::mismatch("RowDescription or NoData", other)),
        };
        self.set_state(SessionState::Described);

        let response = self
            .router
            .dispatch(Request::Execute { name, max_rows: 0 })
            .await?;
        self.set_state(SessionState::Executed);

        match (columns, response) {
            (Some(columns), Response::Rows { rows, .. }) => {
                Ok(QueryResponse::ResultSet(project(columns, &rows)?))
            }
            (Some(columns), Response::CommandComplete { .. }) => {
                Ok(QueryResponse::ResultSet(project(columns, &[])?))
            }
            (None, Response::CommandComplete { tag }) => Ok(QueryResponse::Ok(affected_rows(&tag))),
            (_, other) => Err(ClientError::mismatch("Rows or CommandComplete", other)),
        }
    }

    /// Reuse the previous description when the server repeats it.
    fn columns_for(&self, fields: Vec<FieldDescriptor>) -> Arc<Columns> {
        let mut cached = self.columns.lock();
        if let Some(columns) = cached.as_ref() {
            if columns.fields() == fields.as_slice() {
                return Arc::clone(columns);
            }
        }
        let columns = Arc::new(Columns::new(fields, &self.custom_types));
        *cached = Some(Arc::clone(&columns));
        columns
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
    }
}

impl Drop for PreparedStatement {
    fn drop(&mut self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Some(conn) = self.router.registry().get(&self.name) {
            // An armed guard going out of scope schedules the release.
            drop(self.router.lifecycle().guard(conn, Some(self.name.clone())));
        }
    }
}

impl fmt::Debug for PreparedStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreparedStatement")
            .field("name", &self.name)
            .field("sql", &self.sql)
            .field("state", &self.state())
            .finish()
    }
}

//! The client: one-shot queries, statement preparation and shutdown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::lifecycle::Lifecycle;
use crate::message::{affected_rows, Request, Response, StatementName};
use crate::pg::PgPool;
use crate::projector::{project, Columns, CustomTypes, QueryResponse, ResultSet, Row};
use crate::registry::StatementRegistry;
use crate::router::Router;
use crate::statement::PreparedStatement;
use crate::transport::ConnectionFactory;
use crate::types::Oid;

pub struct Client {
    router: Router,
    custom_types: Arc<CustomTypes>,
    closed: AtomicBool,
}

impl Client {
    /// Open a pooled client against a PostgreSQL server.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let custom_types = CustomTypes::from_map(config.custom_types.clone());
        let pool = PgPool::connect(config).await?;
        Ok(Self::with_factory(Arc::new(pool), custom_types))
    }

    /// Shorthand for [`ClientConfig::from_url`] + [`Client::connect`].
    pub async fn connect_url(url: &str) -> Result<Self> {
        Self::connect(ClientConfig::from_url(url)?).await
    }

    /// Build a client over any connection source.
    pub fn with_factory(factory: Arc<dyn ConnectionFactory>, custom_types: CustomTypes) -> Self {
        let lifecycle = Lifecycle::new(factory, Arc::new(StatementRegistry::new()));
        Self {
            router: Router::new(lifecycle),
            custom_types: Arc::new(custom_types),
            closed: AtomicBool::new(false),
        }
    }

    /// Run one simple query on a connection of its own.
    pub async fn query(&self, sql: &str) -> Result<QueryResponse> {
        self.ensure_open()?;
        match self.router.dispatch(Request::Query(sql.to_string())).await? {
            Response::SelectResult { fields, rows } => {
                let columns = Arc::new(Columns::new(fields, &self.custom_types));
                Ok(QueryResponse::ResultSet(project(columns, &rows)?))
            }
            Response::CommandComplete { tag } => Ok(QueryResponse::Ok(affected_rows(&tag))),
            other => Err(ClientError::mismatch("query result", other)),
        }
    }

    /// Run a query that must return rows.
    pub async fn fetch(&self, sql: &str) -> Result<ResultSet> {
        match self.query(sql).await? {
            QueryResponse::ResultSet(rs) => Ok(rs),
            QueryResponse::Ok(affected) => Err(ClientError::mismatch(
                "result set",
                format!("command completion ({} rows affected)", affected),
            )),
        }
    }

    /// Run a statement that must not return rows; yields rows affected.
    pub async fn execute_update(&self, sql: &str) -> Result<u64> {
        match self.query(sql).await? {
            QueryResponse::Ok(affected) => Ok(affected),
            QueryResponse::ResultSet(rs) => Err(ClientError::mismatch(
                "command completion",
                format!("result set with {} rows", rs.len()),
            )),
        }
    }

    pub async fn select<T, F>(&self, sql: &str, projection: F) -> Result<Vec<T>>
    where
        F: FnMut(Row) -> T,
    {
        Ok(self.fetch(sql).await?.into_iter().map(projection).collect())
    }

    /// Parse `sql` on a fresh connection and pin it there.
    pub async fn prepare(&self, sql: &str) -> Result<PreparedStatement> {
        self.prepare_typed(sql, &[]).await
    }

    /// Like [`Client::prepare`], declaring parameter types up front.
    /// Parameters left out (or given as `Oid(0)`) are inferred by the server.
    pub async fn prepare_typed(&self, sql: &str, param_types: &[Oid]) -> Result<PreparedStatement> {
        self.ensure_open()?;
        let name = StatementName::generate();
        let request = Request::Parse {
            name: name.clone(),
            sql: sql.to_string(),
            param_types: param_types.to_vec(),
        };
        match self.router.dispatch(request).await? {
            Response::ParseComplete => Ok(PreparedStatement::new(
                name,
                sql.to_string(),
                self.router.clone(),
                Arc::clone(&self.custom_types),
            )),
            other => Err(ClientError::mismatch("ParseComplete", other)),
        }
    }

    /// Close the connection source. Statements still pinned keep their
    /// connections until they are closed or dropped. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        debug!(pinned = self.router.registry().len(), "closing client");
        self.router.lifecycle().factory().close().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Record the OID of a server-defined type so its columns decode as text.
    pub fn register_type(&self, name: impl Into<String>, oid: Oid) {
        self.custom_types.register(name, oid);
    }

    pub fn custom_types(&self) -> &CustomTypes {
        &self.custom_types
    }

    pub fn registry(&self) -> &StatementRegistry {
        self.router.registry()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        Ok(())
    }
}

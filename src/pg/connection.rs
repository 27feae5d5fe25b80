//! A single PostgreSQL connection speaking the v3 protocol over TCP.
//!
//! [`PgConnection::exchange`] turns one [`Request`] into the frames the
//! server needs and reads back exactly one [`Response`]:
//!
//! | request  | frames sent            | read until                    |
//! |----------|------------------------|-------------------------------|
//! | Query    | `Q`                    | ReadyForQuery                 |
//! | Parse    | `P` + Sync             | ReadyForQuery                 |
//! | Bind     | `B` + Flush            | BindComplete                  |
//! | Describe | `D` (portal) + Flush   | RowDescription / NoData       |
//! | Execute  | `E` + Sync             | ReadyForQuery                 |
//! | Close    | `C` (statement) + Sync | ReadyForQuery                 |
//! | Sync     | `S`                    | ReadyForQuery                 |
//!
//! Named statements survive Sync; portals do not, which is why Bind and
//! Describe only flush.

use std::collections::HashMap;
use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::protocol::{md5_password, Backend, Frontend, SCRAM_SHA_256};
use super::scram::ScramClient;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result, ServerError};
use crate::message::{FieldDescriptor, RawRow, Request, Response};

pub struct PgConnection {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    read_buf: BytesMut,
    write_buf: BytesMut,
    backend_pid: i32,
    parameters: HashMap<String, String>,
    closed: bool,
    /// Set when the stream may be out of step with the server.
    broken: bool,
}

impl PgConnection {
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        let stream = TcpStream::connect(config.address()).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        let mut conn = Self {
            reader,
            writer,
            read_buf: BytesMut::with_capacity(32 * 1024),
            write_buf: BytesMut::with_capacity(4 * 1024),
            backend_pid: 0,
            parameters: HashMap::new(),
            closed: false,
            broken: false,
        };
        conn.startup(config).await?;
        debug!(
            host = %config.host,
            database = %config.database,
            backend_pid = conn.backend_pid,
            "connected"
        );
        Ok(conn)
    }

    async fn startup(&mut self, config: &ClientConfig) -> Result<()> {
        self.send(&[Frontend::Startup {
            user: &config.user,
            database: &config.database,
            application_name: config.application_name.as_deref(),
        }])
        .await?;

        let password = || {
            config
                .password
                .as_deref()
                .ok_or_else(|| ClientError::Auth("Password required".to_string()))
        };

        loop {
            match self.receive().await? {
                Backend::AuthenticationOk => {}
                Backend::AuthenticationCleartextPassword => {
                    self.send(&[Frontend::Password(password()?)]).await?;
                }
                Backend::AuthenticationMd5Password { salt } => {
                    let hashed = md5_password(&config.user, password()?, &salt);
                    self.send(&[Frontend::Password(&hashed)]).await?;
                }
                Backend::AuthenticationSasl { mechanisms } => {
                    if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                        return Err(ClientError::Auth(format!(
                            "Unsupported SASL mechanisms: {:?}",
                            mechanisms
                        )));
                    }
                    self.authenticate_scram(&config.user, password()?).await?;
                }
                Backend::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                Backend::BackendKeyData { process_id, .. } => self.backend_pid = process_id,
                Backend::ReadyForQuery(_) => return Ok(()),
                Backend::ErrorResponse(err) => return Err(err.into()),
                _ => {}
            }
        }
    }

    async fn authenticate_scram(&mut self, user: &str, password: &str) -> Result<()> {
        let scram = ScramClient::new(user, password);
        self.send(&[Frontend::SaslInitialResponse {
            mechanism: SCRAM_SHA_256,
            data: &scram.client_first(),
        }])
        .await?;

        let server_first = match self.receive_auth().await? {
            Backend::AuthenticationSaslContinue(data) => data,
            other => return Err(ClientError::mismatch("AuthenticationSASLContinue", other)),
        };
        let (client_final, verifier) = scram.client_final(&server_first)?;
        self.send(&[Frontend::SaslResponse(&client_final)]).await?;

        match self.receive_auth().await? {
            Backend::AuthenticationSaslFinal(data) => Ok(verifier.verify(&data)?),
            other => Err(ClientError::mismatch("AuthenticationSASLFinal", other)),
        }
    }

    /// Next authentication message, skipping notices.
    async fn receive_auth(&mut self) -> Result<Backend> {
        loop {
            match self.receive().await? {
                Backend::NoticeResponse(_) => {}
                Backend::ErrorResponse(err) => return Err(err.into()),
                other => return Ok(other),
            }
        }
    }

    /// Send one request and read its response. A server error comes back
    /// as [`Response::Error`] with the connection ready for more work.
    pub async fn exchange(&mut self, request: &Request) -> Result<Response> {
        if self.closed {
            return Err(ClientError::Closed);
        }
        if self.broken {
            return Err(ClientError::Transport(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection is out of sync with the server",
            )));
        }
        trace!(kind = request.kind(), backend_pid = self.backend_pid, "exchange");

        // Stays set if this future is dropped mid-exchange.
        self.broken = true;
        let result = self.exchange_frames(request).await;
        self.broken = result.is_err();
        result
    }

    async fn exchange_frames(&mut self, request: &Request) -> Result<Response> {
        match request {
            Request::Query(sql) => {
                self.send(&[Frontend::Query(sql)]).await?;
                self.read_until_ready().await
            }
            Request::Parse {
                name,
                sql,
                param_types,
            } => {
                let parse = Frontend::Parse {
                    name: name.as_str(),
                    sql,
                    param_types,
                };
                self.send(&[parse, Frontend::Sync]).await?;
                self.read_until_ready().await
            }
            Request::Bind { name, params } => {
                let bind = Frontend::Bind {
                    name: name.as_str(),
                    params,
                };
                self.send(&[bind, Frontend::Flush]).await?;
                self.read_step().await
            }
            Request::Describe { name } => {
                self.send(&[Frontend::DescribePortal(name.as_str()), Frontend::Flush])
                    .await?;
                self.read_step().await
            }
            Request::Execute { name, max_rows } => {
                let execute = Frontend::Execute {
                    portal: name.as_str(),
                    max_rows: *max_rows,
                };
                self.send(&[execute, Frontend::Sync]).await?;
                self.read_until_ready().await
            }
            Request::Close { name } => {
                self.send(&[Frontend::CloseStatement(name.as_str()), Frontend::Sync])
                    .await?;
                self.read_until_ready().await
            }
            Request::Sync => {
                self.send(&[Frontend::Sync]).await?;
                self.read_until_ready().await
            }
        }
    }

    /// Read the single reply to a flushed (unsynced) step.
    async fn read_step(&mut self) -> Result<Response> {
        loop {
            match self.receive().await? {
                Backend::BindComplete => return Ok(Response::BindComplete),
                Backend::RowDescription(fields) => return Ok(Response::RowDescription(fields)),
                Backend::NoData => return Ok(Response::NoData),
                Backend::ErrorResponse(err) => {
                    // The server skips everything up to the next Sync.
                    self.send(&[Frontend::Sync]).await?;
                    self.read_until_ready().await?;
                    return Ok(Response::Error(err));
                }
                Backend::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                Backend::NoticeResponse(_) | Backend::Ignored(_) => {}
                other => return Err(ClientError::mismatch("reply to Bind or Describe", other)),
            }
        }
    }

    /// Read up to ReadyForQuery. For multi-statement queries the last
    /// statement's outcome wins; any server error takes precedence.
    async fn read_until_ready(&mut self) -> Result<Response> {
        let mut fields: Option<Vec<FieldDescriptor>> = None;
        let mut rows: Vec<RawRow> = Vec::new();
        let mut outcome: Option<Response> = None;
        let mut error: Option<ServerError> = None;

        loop {
            match self.receive().await? {
                Backend::ParseComplete => outcome = Some(Response::ParseComplete),
                Backend::CloseComplete => outcome = Some(Response::CloseComplete),
                Backend::BindComplete => {}
                Backend::RowDescription(description) => {
                    fields = Some(description);
                    rows.clear();
                }
                Backend::DataRow(row) => rows.push(row),
                Backend::CommandComplete(tag) => {
                    outcome = Some(completed(fields.take(), std::mem::take(&mut rows), tag));
                }
                Backend::PortalSuspended => {
                    outcome = Some(completed(fields.take(), std::mem::take(&mut rows), String::new()));
                }
                Backend::EmptyQueryResponse => {
                    outcome = Some(Response::CommandComplete { tag: String::new() });
                }
                Backend::ErrorResponse(err) => {
                    error.get_or_insert(err);
                }
                Backend::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                Backend::ReadyForQuery(_) => {
                    return Ok(match error {
                        Some(err) => Response::Error(err),
                        None => outcome.unwrap_or(Response::ReadyForQuery),
                    });
                }
                Backend::NoticeResponse(_) | Backend::Ignored(_) => {}
                other => return Err(ClientError::mismatch("query reply", other)),
            }
        }
    }

    async fn send(&mut self, frames: &[Frontend<'_>]) -> Result<()> {
        self.write_buf.clear();
        for frame in frames {
            frame.encode(&mut self.write_buf);
        }
        self.writer.write_all(&self.write_buf).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<Backend> {
        loop {
            if let Some(message) = Backend::parse_frame(&mut self.read_buf)? {
                return Ok(message);
            }
            self.read_buf.reserve(8 * 1024);
            if self.reader.read_buf(&mut self.read_buf).await? == 0 {
                return Err(ClientError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "server closed the connection",
                )));
            }
        }
    }

    /// Send Terminate and shut the socket. Idempotent.
    pub async fn terminate(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.send(&[Frontend::Terminate]).await?;
        self.writer.shutdown().await?;
        debug!(backend_pid = self.backend_pid, "connection terminated");
        Ok(())
    }

    /// False once terminated or after a transport or framing failure.
    pub fn is_usable(&self) -> bool {
        !self.closed && !self.broken
    }

    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }
}

fn completed(fields: Option<Vec<FieldDescriptor>>, rows: Vec<RawRow>, tag: String) -> Response {
    match fields {
        Some(fields) => Response::SelectResult { fields, rows },
        None if !rows.is_empty() => Response::Rows { rows, tag },
        None => Response::CommandComplete { tag },
    }
}

//! PostgreSQL connection implementation.
//!
//! This module provides the connection type that handles:
//! - TCP or Unix-domain socket establishment
//! - Startup and authentication (trust, cleartext, SCRAM-SHA-256)
//! - The simple query protocol

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use smallvec::SmallVec;
use tokio::io::{
    AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::config::{Host, PgConfig};
use super::error::{Notice, PgError, PgResult, ServerError};
use super::message::MessageReader;
use super::protocol::*;
use super::row::{QueryResult, Row, SharedColumns};
use super::scram::{ScramClient, ScramError};
use super::types::PgValue;

/// Any byte stream a connection can speak the protocol over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for T {}

type BoxedTransport = Box<dyn Transport>;

/// Whether the handshake has completed on the current transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    NotConnected,
    Connected,
}

/// BackendKeyData, kept for a future CancelRequest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelKey {
    pub process_id: i32,
    pub secret_key: i32,
}

struct Stream {
    reader: MessageReader<BufReader<ReadHalf<BoxedTransport>>>,
    writer: BufWriter<WriteHalf<BoxedTransport>>,
}

impl Stream {
    fn new(transport: BoxedTransport) -> Self {
        let (read_half, write_half) = tokio::io::split(transport);
        Self {
            reader: MessageReader::new(BufReader::new(read_half)),
            writer: BufWriter::new(write_half),
        }
    }

    async fn send<M: FrontendMessage>(&mut self, msg: &M) -> PgResult<()> {
        let encoded = msg.encode();
        self.writer.write_all(&encoded).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

// ============================================================================
// Connection
// ============================================================================

/// A PostgreSQL connection.
///
/// Created not connected. [`PgConnection::connect`] runs the startup
/// handshake; a fatal error during a query drops the transport and returns
/// the connection to `NotConnected`.
pub struct PgConnection {
    /// Connection configuration
    config: PgConfig,
    /// Transport, present from the start of the handshake until reset
    stream: Option<Stream>,
    status: ConnectionStatus,
    /// Current transaction status
    transaction_status: TransactionStatus,
    /// Server parameters (e.g., server_version, client_encoding)
    server_params: HashMap<String, String>,
    cancel_key: Option<CancelKey>,
    /// Set from sending Query until its ReadyForQuery is read. Still set
    /// when a query future was dropped mid-response.
    in_flight: bool,
}

impl PgConnection {
    pub fn new(config: PgConfig) -> Self {
        Self {
            config,
            stream: None,
            status: ConnectionStatus::NotConnected,
            transaction_status: TransactionStatus::Idle,
            server_params: HashMap::new(),
            cancel_key: None,
            in_flight: false,
        }
    }

    /// Create and connect in one step.
    pub async fn open(config: PgConfig) -> PgResult<Self> {
        let mut conn = Self::new(config);
        conn.connect().await?;
        Ok(conn)
    }

    /// Open the configured transport and perform the startup handshake.
    ///
    /// Does nothing if already connected with no response pending.
    pub async fn connect(&mut self) -> PgResult<()> {
        if self.is_connected() && !self.in_flight {
            return Ok(());
        }

        let transport: BoxedTransport = match &self.config.host {
            Host::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true)?;
                Box::new(stream)
            }
            Host::Unix { .. } => open_unix(&self.config.host).await?,
        };

        debug!(host = %self.config.host, "transport open");
        self.handshake(transport).await
    }

    /// Perform the startup handshake over an already-open stream.
    ///
    /// Any existing transport is dropped first.
    pub async fn connect_with_stream<S: Transport>(&mut self, stream: S) -> PgResult<()> {
        self.handshake(Box::new(stream)).await
    }

    async fn handshake(&mut self, transport: BoxedTransport) -> PgResult<()> {
        self.reset();
        self.stream = Some(Stream::new(transport));

        match self.startup().await {
            Ok(()) => {
                debug!(
                    user = %self.config.user,
                    database = %self.config.database,
                    "connected"
                );
                Ok(())
            }
            Err(e) => {
                debug!(error = %e, "startup failed");
                self.reset();
                Err(e)
            }
        }
    }

    /// Run the startup packet and authentication exchange up to ReadyForQuery.
    async fn startup(&mut self) -> PgResult<()> {
        let startup = self.config.startup_message();
        self.send_message(&startup).await?;

        let mut scram: Option<ScramClient> = None;

        loop {
            match self.receive_message().await? {
                BackendMessage::Authentication(request) => {
                    self.authenticate(request, &mut scram).await?;
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.server_params.insert(name, value);
                }
                BackendMessage::BackendKeyData {
                    process_id,
                    secret_key,
                } => {
                    self.cancel_key = Some(CancelKey {
                        process_id,
                        secret_key,
                    });
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    self.status = ConnectionStatus::Connected;
                    return Ok(());
                }
                BackendMessage::ErrorResponse { fields } => {
                    return Err(ServerError::from_fields(&fields).into());
                }
                BackendMessage::NoticeResponse { fields } => {
                    log_notice(&Notice::from_fields(&fields));
                }
                other => {
                    return Err(PgError::violation(format!(
                        "unexpected message '{}' during startup",
                        other.tag() as char
                    )));
                }
            }
        }
    }

    async fn authenticate(
        &mut self,
        request: AuthRequest,
        scram: &mut Option<ScramClient>,
    ) -> PgResult<()> {
        match request {
            AuthRequest::Ok => {
                // AuthenticationOk may not stand in for the SCRAM server signature.
                if scram.is_some() {
                    return Err(PgError::AuthFailed(
                        "server completed SCRAM without sending its signature".to_string(),
                    ));
                }
                debug!("authentication ok");
            }
            AuthRequest::CleartextPassword => {
                debug!("cleartext password requested");
                let password = self.password()?.to_string();
                self.send_message(&PasswordMessage { password }).await?;
            }
            AuthRequest::Md5Password { .. } => {
                return Err(PgError::UnsupportedAuth("MD5 password".to_string()));
            }
            AuthRequest::Sasl { mechanisms } => {
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(PgError::UnsupportedAuth(format!(
                        "SASL mechanisms {:?}",
                        mechanisms
                    )));
                }
                debug!("SCRAM-SHA-256 authentication");

                let client = ScramClient::new(&self.config.user, self.password()?);
                let initial = SaslInitialResponseMessage {
                    mechanism: SCRAM_SHA_256.to_string(),
                    data: client.client_first_message(),
                };
                self.send_message(&initial).await?;
                *scram = Some(client);
            }
            AuthRequest::SaslContinue { data } => {
                let client = scram
                    .as_mut()
                    .ok_or_else(|| PgError::violation("SASL continue without SASL start"))?;
                client.receive_challenge(&data).map_err(scram_error)?;
                let response = client.compose_response().map_err(scram_error)?;
                self.send_message(&SaslResponseMessage {
                    data: response.into_bytes(),
                })
                .await?;
            }
            AuthRequest::SaslFinal { data } => {
                let client = scram
                    .take()
                    .ok_or_else(|| PgError::violation("SASL final without SASL start"))?;
                client.receive_response(&data).map_err(scram_error)?;
                debug!("server signature verified");
            }
            AuthRequest::Other(code) => {
                return Err(PgError::UnsupportedAuth(auth_method_name(code)));
            }
        }
        Ok(())
    }

    fn password(&self) -> PgResult<&str> {
        self.config
            .password
            .as_deref()
            .ok_or_else(|| PgError::AuthFailed("Password required".to_string()))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Execute a simple query (text protocol).
    ///
    /// Returns only after ReadyForQuery. A server error is raised after the
    /// stream is drained, so the connection stays usable; a fatal error
    /// leaves it `NotConnected`.
    ///
    /// A connection whose previous query was cancelled before ReadyForQuery
    /// is dropped and reports `NotConnected`.
    pub async fn query(&mut self, sql: &str) -> PgResult<QueryResult> {
        if self.in_flight {
            warn!("previous query was cancelled mid-response, dropping connection");
            self.reset();
        }
        if !self.is_connected() {
            return Err(PgError::NotConnected);
        }

        match self.run_query(sql).await {
            Err(e) if e.is_fatal() => {
                warn!(error = %e, "fatal connection error, dropping connection");
                if matches!(e, PgError::ProtocolViolation(_)) {
                    // Best effort; the caller gets the violation either way.
                    let _ = self.terminate().await;
                } else {
                    self.reset();
                }
                Err(e)
            }
            other => other,
        }
    }

    async fn run_query(&mut self, sql: &str) -> PgResult<QueryResult> {
        self.in_flight = true;
        self.send_message(&QueryMessage {
            query: sql.to_string(),
        })
        .await?;

        let mut result = QueryResult::new();
        let mut described = false;
        let mut first_error: Option<PgError> = None;

        loop {
            match self.receive_message().await? {
                BackendMessage::RowDescription { columns } => {
                    if described {
                        return Err(PgError::violation(
                            "second RowDescription in one query",
                        ));
                    }
                    described = true;
                    result.columns = Arc::new(columns);
                }
                BackendMessage::DataRow { values } => {
                    if !described {
                        return Err(PgError::violation("DataRow before RowDescription"));
                    }
                    if values.len() != result.columns.len() {
                        return Err(PgError::violation(format!(
                            "DataRow has {} values, RowDescription has {} columns",
                            values.len(),
                            result.columns.len()
                        )));
                    }
                    match decode_row(&result.columns, values) {
                        Ok(row) => result.rows.push(row),
                        Err(e) if first_error.is_none() => first_error = Some(e),
                        Err(_) => {}
                    }
                }
                BackendMessage::CommandComplete { tag } => {
                    result.command_tag = Some(tag);
                }
                BackendMessage::EmptyQueryResponse
                | BackendMessage::ParseComplete
                | BackendMessage::CloseComplete
                | BackendMessage::Blank => {}
                BackendMessage::NoticeResponse { fields } => {
                    let notice = Notice::from_fields(&fields);
                    log_notice(&notice);
                    result.notices.push(notice);
                }
                BackendMessage::ErrorResponse { fields } => {
                    if first_error.is_none() {
                        first_error =
                            Some(ServerError::from_fields(&fields).with_query(sql).into());
                    }
                }
                BackendMessage::ParameterStatus { name, value } => {
                    self.server_params.insert(name, value);
                }
                BackendMessage::NotificationResponse { channel, .. } => {
                    debug!(channel = %channel, "ignoring notification");
                }
                BackendMessage::ReadyForQuery { status } => {
                    self.transaction_status = status;
                    self.in_flight = false;
                    if let Some(e) = first_error {
                        return Err(e);
                    }
                    result.row_count = result.rows.len();
                    return Ok(result);
                }
                other => {
                    return Err(PgError::violation(format!(
                        "unexpected message '{}' during query",
                        other.tag() as char
                    )));
                }
            }
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Send Terminate and close the transport.
    ///
    /// The connection is `NotConnected` afterwards even if the send fails.
    pub async fn terminate(&mut self) -> PgResult<()> {
        let stream = self.stream.take();
        self.reset();

        if let Some(mut stream) = stream {
            stream.send(&TerminateMessage).await?;
            stream.writer.shutdown().await?;
        }
        Ok(())
    }

    /// Drop the transport and forget all server state without notifying
    /// the server.
    pub fn reset(&mut self) {
        self.stream = None;
        self.status = ConnectionStatus::NotConnected;
        self.transaction_status = TransactionStatus::Idle;
        self.server_params.clear();
        self.cancel_key = None;
        self.in_flight = false;
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    /// A query was sent and its response has not been fully read.
    pub fn is_busy(&self) -> bool {
        self.in_flight
    }

    /// Get the current transaction status.
    pub fn transaction_status(&self) -> TransactionStatus {
        self.transaction_status
    }

    /// Get a server parameter.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.server_params.get(name).map(|s| s.as_str())
    }

    pub fn server_params(&self) -> &HashMap<String, String> {
        &self.server_params
    }

    pub fn cancel_key(&self) -> Option<CancelKey> {
        self.cancel_key
    }

    pub fn config(&self) -> &PgConfig {
        &self.config
    }

    // ========================================================================
    // Private helpers
    // ========================================================================

    /// Send a frontend message (with flush).
    async fn send_message<M: FrontendMessage>(&mut self, msg: &M) -> PgResult<()> {
        self.stream
            .as_mut()
            .ok_or(PgError::NotConnected)?
            .send(msg)
            .await
    }

    /// Receive a backend message.
    async fn receive_message(&mut self) -> PgResult<BackendMessage> {
        let stream = self.stream.as_mut().ok_or(PgError::NotConnected)?;
        BackendMessage::read(&mut stream.reader).await
    }
}

impl std::fmt::Debug for PgConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgConnection")
            .field("host", &self.config.host)
            .field("status", &self.status)
            .field("transaction_status", &self.transaction_status)
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

// ============================================================================
// Helper functions
// ============================================================================

#[cfg(unix)]
async fn open_unix(host: &Host) -> PgResult<BoxedTransport> {
    let path = host
        .socket_path()
        .ok_or_else(|| PgError::Config("not a Unix-domain socket host".to_string()))?;
    let stream = tokio::net::UnixStream::connect(&path).await?;
    Ok(Box::new(stream))
}

#[cfg(not(unix))]
async fn open_unix(_host: &Host) -> PgResult<BoxedTransport> {
    Err(PgError::Config(
        "Unix-domain sockets are not supported on this platform".to_string(),
    ))
}

/// Decode a row from text format (simple query protocol).
fn decode_row(columns: &SharedColumns, values: Vec<Option<Bytes>>) -> PgResult<Row> {
    let decoded = columns
        .iter()
        .zip(values)
        .map(|(column, value)| match value {
            None => Ok(PgValue::Null),
            // Binary cursors are the only way to get format 1 here.
            Some(data) if column.format_code != 0 => Ok(PgValue::Bytea(data.to_vec())),
            Some(data) => PgValue::decode_text(column.type_oid, &data),
        })
        .collect::<PgResult<SmallVec<[PgValue; 16]>>>()?;

    Ok(Row::new(Arc::clone(columns), decoded))
}

fn log_notice(notice: &Notice) {
    if notice.is_warning() {
        warn!(code = %notice.code, severity = %notice.severity, "{}", notice.message);
    } else {
        info!(code = %notice.code, severity = %notice.severity, "{}", notice.message);
    }
}

fn scram_error(e: ScramError) -> PgError {
    match e {
        ScramError::NonceVerificationFailed
        | ScramError::InvalidServerSignature
        | ScramError::ServerSignatureVerificationFailed
        | ScramError::ServerRejected(_) => PgError::AuthFailed(e.to_string()),
        _ => PgError::violation(format!("SCRAM exchange: {}", e)),
    }
}

fn auth_method_name(code: i32) -> String {
    match code {
        2 => "Kerberos V5".to_string(),
        6 => "SCM credentials".to_string(),
        7 | 8 => "GSSAPI".to_string(),
        9 => "SSPI".to_string(),
        other => format!("authentication request type {}", other),
    }
}

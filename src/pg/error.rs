//! Error types for the PostgreSQL protocol implementation.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

use super::sqlstate;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur during PostgreSQL operations.
#[derive(Debug, Error)]
pub enum PgError {
    /// I/O error while opening or using the socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The channel ended in the middle of a frame.
    #[error("Connection closed by server")]
    TransportClosed,

    /// Unexpected message tag or malformed message body.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Server requested an authentication method we do not implement.
    #[error("Unsupported authentication method: {0}")]
    UnsupportedAuth(String),

    /// Credentials rejected, or the server failed to prove itself.
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Server returned an ErrorResponse.
    #[error("{0}")]
    Server(Box<ServerError>),

    /// A text-format column value did not parse for its declared type.
    #[error("Decode error: {0}")]
    Decode(String),

    /// No pool slot became free before the acquisition deadline.
    #[error("Timed out after {0:?} waiting for a pooled connection")]
    PoolTimeout(Duration),

    /// Query attempted on a connection that has not completed its handshake.
    #[error("Connection is not connected")]
    NotConnected,

    /// Invalid connection or pool configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PgError {
    /// Whether the connection that produced this error must be discarded.
    ///
    /// Server errors, decode errors and pool timeouts leave the connection
    /// usable; everything touching the transport or framing does not.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PgError::Io(_)
                | PgError::TransportClosed
                | PgError::ProtocolViolation(_)
                | PgError::NotConnected
        )
    }

    /// The server-reported error, if this is one.
    pub fn server_error(&self) -> Option<&ServerError> {
        match self {
            PgError::Server(e) => Some(e),
            _ => None,
        }
    }

    /// SQLSTATE code of a server-reported error.
    pub fn sqlstate(&self) -> Option<&str> {
        self.server_error().map(|e| e.code.as_str())
    }

    pub(crate) fn violation(msg: impl Into<String>) -> Self {
        PgError::ProtocolViolation(msg.into())
    }
}

impl From<ServerError> for PgError {
    fn from(e: ServerError) -> Self {
        PgError::Server(Box::new(e))
    }
}

// ============================================================================
// Server-reported errors and notices
// ============================================================================

/// An error reported by the backend through an ErrorResponse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    /// SQLSTATE code, e.g. `23505`.
    pub code: String,
    /// Condition name for `code`, e.g. `unique_violation`.
    pub name: &'static str,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    /// 1-based character position of the error in the query text.
    pub position: Option<u32>,
    pub where_: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub constraint: Option<String>,
    /// The query that produced the error. Unset for handshake errors.
    pub query: Option<String>,
}

impl ServerError {
    /// Build from the tagged field list of an ErrorResponse.
    pub fn from_fields(fields: &HashMap<u8, String>) -> Self {
        // Prefer the non-localized severity (V) when the server sends it.
        let severity = fields
            .get(&b'V')
            .or_else(|| fields.get(&b'S'))
            .cloned()
            .unwrap_or_default();
        let code = fields.get(&b'C').cloned().unwrap_or_default();

        Self {
            severity,
            name: sqlstate::condition_name(&code),
            code,
            message: fields.get(&b'M').cloned().unwrap_or_default(),
            detail: fields.get(&b'D').cloned(),
            hint: fields.get(&b'H').cloned(),
            position: fields.get(&b'P').and_then(|p| p.parse().ok()),
            where_: fields.get(&b'W').cloned(),
            schema: fields.get(&b's').cloned(),
            table: fields.get(&b't').cloned(),
            column: fields.get(&b'c').cloned(),
            constraint: fields.get(&b'n').cloned(),
            query: None,
        }
    }

    pub(crate) fn with_query(mut self, query: &str) -> Self {
        self.query = Some(query.to_string());
        self
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ({} {})",
            self.severity, self.message, self.code, self.name
        )?;
        if let Some(d) = &self.detail {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = &self.hint {
            write!(f, "\nHint: {}", h)?;
        }
        if let Some(q) = &self.query {
            write!(f, "\nQuery: {}", q)?;
        }
        Ok(())
    }
}

/// A NoticeResponse. Collected, never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl Notice {
    pub fn from_fields(fields: &HashMap<u8, String>) -> Self {
        Self {
            severity: fields
                .get(&b'V')
                .or_else(|| fields.get(&b'S'))
                .cloned()
                .unwrap_or_default(),
            code: fields.get(&b'C').cloned().unwrap_or_default(),
            message: fields.get(&b'M').cloned().unwrap_or_default(),
            detail: fields.get(&b'D').cloned(),
            hint: fields.get(&b'H').cloned(),
        }
    }

    /// WARNING-level notices are logged louder than NOTICE/INFO/DEBUG/LOG.
    pub fn is_warning(&self) -> bool {
        self.severity == "WARNING" || sqlstate::is_warning_class(&self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(u8, &str)]) -> HashMap<u8, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn test_server_error_from_fields() {
        let err = ServerError::from_fields(&fields(&[
            (b'S', "ERROR"),
            (b'V', "ERROR"),
            (b'C', "23505"),
            (b'M', "duplicate key value violates unique constraint \"users_pkey\""),
            (b'D', "Key (id)=(1) already exists."),
            (b'n', "users_pkey"),
            (b'P', "15"),
        ]));

        assert_eq!(err.code, "23505");
        assert_eq!(err.name, "unique_violation");
        assert_eq!(err.constraint.as_deref(), Some("users_pkey"));
        assert_eq!(err.position, Some(15));
        assert!(err.hint.is_none());
    }

    #[test]
    fn test_fatal_classification() {
        assert!(PgError::TransportClosed.is_fatal());
        assert!(PgError::violation("bad tag").is_fatal());
        assert!(!PgError::PoolTimeout(Duration::from_millis(5)).is_fatal());

        let server: PgError = ServerError::from_fields(&fields(&[(b'C', "42P01")])).into();
        assert!(!server.is_fatal());
        assert_eq!(server.sqlstate(), Some("42P01"));
    }

    #[test]
    fn test_display_includes_query() {
        let err = ServerError::from_fields(&fields(&[
            (b'S', "ERROR"),
            (b'C', "42601"),
            (b'M', "syntax error at or near \"SELEC\""),
        ]))
        .with_query("SELEC 1");

        let text = err.to_string();
        assert!(text.contains("syntax_error"));
        assert!(text.contains("Query: SELEC 1"));
    }
}

//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the subset of the PostgreSQL v3 protocol needed for
//! startup, authentication and the simple query protocol.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncRead;

use super::error::{PgError, PgResult};
use super::message::{MessageReader, MessageWriter};
use super::types::Oid;

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// The only SASL mechanism we speak.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    #[default]
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl TryFrom<u8> for TransactionStatus {
    type Error = PgError;

    fn try_from(b: u8) -> PgResult<Self> {
        match b {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(PgError::violation(format!(
                "unknown transaction status '{}'",
                other as char
            ))),
        }
    }
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages
pub trait FrontendMessage {
    fn encode(&self) -> BytesMut;
}

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage {
    pub user: String,
    pub database: Option<String>,
    pub options: Vec<(String, String)>,
}

impl FrontendMessage for StartupMessage {
    fn encode(&self) -> BytesMut {
        let mut w = MessageWriter::untagged();
        w.add_int32(PROTOCOL_VERSION);

        w.add_cstring("user").add_cstring(&self.user);
        if let Some(ref db) = self.database {
            w.add_cstring("database").add_cstring(db);
        }
        for (key, value) in &self.options {
            w.add_cstring(key).add_cstring(value);
        }

        // Terminator
        w.add_byte(0);
        w.message()
    }
}

/// Cleartext password message ('p')
#[derive(Debug, Clone)]
pub struct PasswordMessage {
    pub password: String,
}

impl FrontendMessage for PasswordMessage {
    fn encode(&self) -> BytesMut {
        let mut w = MessageWriter::new(b'p');
        w.add_cstring(&self.password);
        w.message()
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage {
    pub query: String,
}

impl FrontendMessage for QueryMessage {
    fn encode(&self) -> BytesMut {
        let mut w = MessageWriter::new(b'Q');
        w.add_cstring(&self.query);
        w.message()
    }
}

/// Terminate message ('X') - Close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode(&self) -> BytesMut {
        MessageWriter::new(b'X').message()
    }
}

/// SASL Initial Response message ('p') - First SCRAM message
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage {
    /// SASL mechanism name (e.g., "SCRAM-SHA-256")
    pub mechanism: String,
    /// Initial client response data
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslInitialResponseMessage {
    fn encode(&self) -> BytesMut {
        let mut w = MessageWriter::new(b'p');
        w.add_cstring(&self.mechanism).add_length_prefixed(&self.data);
        w.message()
    }
}

/// SASL Response message ('p') - Subsequent SCRAM messages
#[derive(Debug, Clone)]
pub struct SaslResponseMessage {
    pub data: Vec<u8>,
}

impl FrontendMessage for SaslResponseMessage {
    fn encode(&self) -> BytesMut {
        let mut w = MessageWriter::new(b'p');
        w.add_bytes(&self.data);
        w.message()
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// One column of a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_id: i16,
    pub type_oid: Oid,
    /// Resolved from the built-in OID table; `None` for user-defined types.
    pub type_name: Option<&'static str>,
    pub type_size: i16,
    pub type_modifier: i32,
    /// Always 0 (text) under the simple query protocol.
    pub format_code: i16,
}

/// Authentication request sub-types ('R').
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    Ok,
    CleartextPassword,
    Md5Password { salt: [u8; 4] },
    Sasl { mechanisms: Vec<String> },
    SaslContinue { data: Bytes },
    SaslFinal { data: Bytes },
    /// Kerberos, GSSAPI, SSPI and anything newer.
    Other(i32),
}

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    Authentication(AuthRequest),
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },
    ReadyForQuery {
        status: TransactionStatus,
    },
    RowDescription {
        columns: Vec<ColumnDescription>,
    },
    DataRow {
        values: Vec<Option<Bytes>>,
    },
    CommandComplete {
        tag: String,
    },
    EmptyQueryResponse,
    ParseComplete,
    CloseComplete,
    /// A frame whose tag byte is NUL.
    Blank,
    ErrorResponse {
        fields: HashMap<u8, String>,
    },
    NoticeResponse {
        fields: HashMap<u8, String>,
    },
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
    /// Any tag this client does not speak (COPY, extended protocol, ...).
    Unsupported {
        tag: u8,
    },
}

impl BackendMessage {
    /// The wire tag this message was decoded from.
    pub fn tag(&self) -> u8 {
        match self {
            BackendMessage::Authentication(_) => b'R',
            BackendMessage::ParameterStatus { .. } => b'S',
            BackendMessage::BackendKeyData { .. } => b'K',
            BackendMessage::ReadyForQuery { .. } => b'Z',
            BackendMessage::RowDescription { .. } => b'T',
            BackendMessage::DataRow { .. } => b'D',
            BackendMessage::CommandComplete { .. } => b'C',
            BackendMessage::EmptyQueryResponse => b'I',
            BackendMessage::ParseComplete => b'1',
            BackendMessage::CloseComplete => b'3',
            BackendMessage::Blank => 0,
            BackendMessage::ErrorResponse { .. } => b'E',
            BackendMessage::NoticeResponse { .. } => b'N',
            BackendMessage::NotificationResponse { .. } => b'A',
            BackendMessage::Unsupported { tag } => *tag,
        }
    }

    /// Read the next frame from `reader` and decode it.
    pub async fn read<R: AsyncRead + Unpin>(reader: &mut MessageReader<R>) -> PgResult<Self> {
        let tag = reader.next_message().await?;
        Self::decode(tag, reader)
    }

    /// Decode the frame currently buffered in `reader`.
    pub fn decode<R: AsyncRead + Unpin>(tag: u8, r: &mut MessageReader<R>) -> PgResult<Self> {
        match tag {
            b'R' => Self::decode_auth(r),
            b'S' => Ok(BackendMessage::ParameterStatus {
                name: r.read_cstring()?,
                value: r.read_cstring()?,
            }),
            b'K' => Ok(BackendMessage::BackendKeyData {
                process_id: r.read_int32()?,
                secret_key: r.read_int32()?,
            }),
            b'Z' => Ok(BackendMessage::ReadyForQuery {
                status: TransactionStatus::try_from(r.read_byte()?)?,
            }),
            b'T' => Self::decode_row_description(r),
            b'D' => Self::decode_data_row(r),
            b'C' => Ok(BackendMessage::CommandComplete {
                tag: r.read_cstring()?,
            }),
            b'I' => Ok(BackendMessage::EmptyQueryResponse),
            b'1' => Ok(BackendMessage::ParseComplete),
            b'3' => Ok(BackendMessage::CloseComplete),
            0 => Ok(BackendMessage::Blank),
            b'E' => Ok(BackendMessage::ErrorResponse {
                fields: read_error_fields(r)?,
            }),
            b'N' => Ok(BackendMessage::NoticeResponse {
                fields: read_error_fields(r)?,
            }),
            b'A' => Ok(BackendMessage::NotificationResponse {
                process_id: r.read_int32()?,
                channel: r.read_cstring()?,
                payload: r.read_cstring()?,
            }),
            tag => Ok(BackendMessage::Unsupported { tag }),
        }
    }

    fn decode_auth<R: AsyncRead + Unpin>(r: &mut MessageReader<R>) -> PgResult<Self> {
        let auth_type = r.read_int32()?;

        let request = match auth_type {
            0 => AuthRequest::Ok,
            3 => AuthRequest::CleartextPassword,
            5 => {
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&r.read_bytes(4)?);
                AuthRequest::Md5Password { salt }
            }
            10 => {
                let mut mechanisms = Vec::new();
                while r.remaining() > 0 {
                    let mech = r.read_cstring()?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                AuthRequest::Sasl { mechanisms }
            }
            11 => AuthRequest::SaslContinue {
                data: r.read_all_bytes(),
            },
            12 => AuthRequest::SaslFinal {
                data: r.read_all_bytes(),
            },
            other => AuthRequest::Other(other),
        };

        Ok(BackendMessage::Authentication(request))
    }

    fn decode_row_description<R: AsyncRead + Unpin>(r: &mut MessageReader<R>) -> PgResult<Self> {
        let num_fields = r.read_int16()?;
        if num_fields < 0 {
            return Err(PgError::violation("negative column count in RowDescription"));
        }
        let mut columns = Vec::with_capacity(num_fields as usize);

        for _ in 0..num_fields {
            let name = r.read_cstring()?;
            let table_oid = r.read_int32()?;
            let column_id = r.read_int16()?;
            let type_oid = Oid::from_i32(r.read_int32()?);
            let type_size = r.read_int16()?;
            let type_modifier = r.read_int32()?;
            let format_code = r.read_int16()?;

            columns.push(ColumnDescription {
                name,
                table_oid,
                column_id,
                type_name: type_oid.name(),
                type_oid,
                type_size,
                type_modifier,
                format_code,
            });
        }

        Ok(BackendMessage::RowDescription { columns })
    }

    fn decode_data_row<R: AsyncRead + Unpin>(r: &mut MessageReader<R>) -> PgResult<Self> {
        let num_cols = r.read_int16()?;
        if num_cols < 0 {
            return Err(PgError::violation("negative column count in DataRow"));
        }
        let mut values = Vec::with_capacity(num_cols as usize);

        for _ in 0..num_cols {
            let len = r.read_int32()?;
            if len == -1 {
                values.push(None);
            } else if len < 0 {
                return Err(PgError::violation(format!("invalid value length {}", len)));
            } else {
                values.push(Some(r.read_bytes(len as usize)?));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }
}

/// Read error/notice response fields
fn read_error_fields<R: AsyncRead + Unpin>(
    r: &mut MessageReader<R>,
) -> PgResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while r.remaining() > 0 {
        let field_type = r.read_byte()?;
        if field_type == 0 {
            break;
        }
        let value = r.read_cstring()?;
        fields.insert(field_type, value);
    }

    Ok(fields)
}

//! PostgreSQL wire protocol client.
//!
//! Speaks protocol v3 startup, authentication (trust, cleartext,
//! SCRAM-SHA-256) and the simple query protocol, with results decoded from
//! text format.
//!
//! Architecture:
//! - `codec`, `message`: byte primitives and message framing
//! - `protocol`: frontend and backend messages
//! - `scram`: SCRAM-SHA-256 client
//! - `connection`: connection state machine and query executor
//! - `pool`: fixed-size pool with acquire timeout and fatal-error retry
//! - `types`, `row`: decoded values and result rows

pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod pool;
pub mod protocol;
pub mod row;
pub mod scram;
pub mod sqlstate;
pub mod types;


// Public API re-exports for library consumers
pub use config::{Host, PgConfig};
pub use connection::{CancelKey, ConnectionStatus, PgConnection};
pub use error::{Notice, PgError, PgResult, ServerError};
pub use pool::{PgPool, PgPoolConfig, PooledConnection};
pub use protocol::{ColumnDescription, TransactionStatus};
pub use row::{FromRow, QueryResult, Row, SharedColumns};
pub use types::{Oid, PgValue};

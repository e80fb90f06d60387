//! Engine-wide error taxonomy.
//!
//! Every raw I/O or protocol failure is wrapped into one of these kinds
//! before it reaches a caller. The split matters operationally: fatal errors
//! close the session, stale-statement errors are retried exactly once
//! internally, batch errors leave the connection usable, and cancellation is
//! distinct from a client-side timeout even though both abort a query.

use thiserror::Error;

use crate::protocol::auth::AuthError;
use crate::protocol::response::ErrPacket;

/// Server error code: prepared statement needs re-prepare
pub const ER_NEED_REPREPARE: u16 = 1615;
/// Server error code: unknown column
pub const ER_BAD_FIELD_ERROR: u16 = 1054;
/// Server error code: query was killed
pub const ER_QUERY_INTERRUPTED: u16 = 1317;
/// Server error code: packet exceeded max_allowed_packet
pub const ER_NET_PACKET_TOO_LARGE: u16 = 1153;
/// Server error code: data too long for column
pub const ER_DATA_TOO_LONG: u16 = 1406;

/// A server-reported error: vendor code, SQL state and message
#[derive(Debug, Clone, Error)]
#[error("({sql_state}/{code}) {message}")]
pub struct ServerError {
    pub code: u16,
    pub sql_state: String,
    pub message: String,
}

impl From<ErrPacket> for ServerError {
    fn from(err: ErrPacket) -> Self {
        Self {
            code: err.error_code,
            sql_state: err.sql_state,
            message: err.error_message,
        }
    }
}

impl ServerError {
    /// Stale prepared-statement errors eligible for one transparent
    /// re-prepare
    pub fn needs_reprepare(&self) -> bool {
        self.code == ER_NEED_REPREPARE
    }
}

/// Outcome of a single row within a batch, reported by strategies with
/// per-row granularity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOutcome {
    Ok { affected_rows: u64 },
    Failed { code: u16 },
    /// Not executed because an earlier row aborted the batch
    Skipped,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Connection-fatal: socket-level failure. Session is Closed, nothing
    /// in flight survives.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection-fatal: server closed the connection
    #[error("Connection closed by server")]
    Disconnected,

    /// Connection-fatal: handshake or credential failure
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Connection-fatal: a server-issued redirect could not be followed
    #[error("Redirect failed: {0}")]
    Redirect(String),

    /// Connection-fatal: malformed or unexpected wire data
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// TLS establishment failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// Server-reported statement error; the connection stays usable
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// Batch failure with a strategy-shaped message, connection usable.
    /// `outcomes` is present for strategies with per-row granularity.
    #[error("Batch error: {message}")]
    Batch {
        message: String,
        source: ServerError,
        outcomes: Option<Vec<RowOutcome>>,
    },

    /// The in-flight query was killed by a cancel request
    #[error("Query cancelled")]
    Cancelled,

    /// The client-side watchdog expired before the server responded
    #[error("Query timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Use of a closed statement, cursor or session. Local, never touches
    /// the network.
    #[error("{0} is closed")]
    ResourceClosed(&'static str),

    /// Pre-flight rejection: the assembled payload would exceed
    /// max_allowed_packet
    #[error(
        "Packet of {size} bytes exceeds max_allowed_packet ({max}) for {context}"
    )]
    PacketTooLarge {
        size: usize,
        max: usize,
        context: String,
    },

    /// Connection URL could not be parsed
    #[error("Invalid connection URL: {0}")]
    Url(String),

    /// Invalid option value or profile file
    #[error("Configuration error: {0}")]
    Config(String),

    /// Feature not negotiated or not available on this server/platform
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// All candidate hosts failed; carries the last cause. Non-transient:
    /// nothing is replayed.
    #[error("No host available: {0}")]
    NoHostAvailable(String),
}

impl From<AuthError> for Error {
    fn from(err: AuthError) -> Self {
        Error::Auth(err.to_string())
    }
}

impl From<crate::url::UrlError> for Error {
    fn from(err: crate::url::UrlError) -> Self {
        Error::Url(err.to_string())
    }
}

impl From<crate::config::ConfigError> for Error {
    fn from(err: crate::config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl Error {
    /// Errors that close the session: any handle from it raises
    /// `ResourceClosed` afterwards.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Io(_)
                | Error::Disconnected
                | Error::Auth(_)
                | Error::Redirect(_)
                | Error::Protocol(_)
                | Error::Tls(_)
                | Error::NoHostAvailable(_)
        )
    }

    /// SQL state for the error surface; server errors carry their own.
    pub fn sql_state(&self) -> &str {
        match self {
            Error::Server(e) => &e.sql_state,
            Error::Batch { source, .. } => &source.sql_state,
            Error::Auth(_) => "28000",
            Error::Timeout(_) | Error::Cancelled => "70100",
            Error::Url(_) | Error::Config(_) => "HY009",
            _ => "08000",
        }
    }

    /// Vendor error code where one exists (0 for purely local errors).
    pub fn vendor_code(&self) -> u16 {
        match self {
            Error::Server(e) => e.code,
            Error::Batch { source, .. } => source.code,
            Error::Cancelled => ER_QUERY_INTERRUPTED,
            Error::PacketTooLarge { .. } => ER_NET_PACKET_TOO_LARGE,
            _ => 0,
        }
    }
}

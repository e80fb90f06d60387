//! Async MySQL/MariaDB client protocol engine.
//!
//! The crate implements the wire-level core a driver is built on: the packet
//! codec (framing, compression, large-payload chunking), the session state
//! machine (handshake, pluggable authentication, TLS, session-state
//! mirroring, cancellation), the statement execution engine (prepared
//! statements with transparent re-prepare, four batch strategies), the
//! result streaming engine (buffered, streaming and server-cursor fetch,
//! multi-result chains) and the failover coordinator (host lists, blacklist,
//! read-only routing).
//!
//! ```no_run
//! use hermes::{ConnectionUrl, Connector};
//!
//! # async fn demo() -> Result<(), hermes::Error> {
//! let url = ConnectionUrl::parse("mysql://db1:3306,db2:3306/shop?user=app&password=secret")?;
//! let connector = Connector::new(url.options.clone());
//! let session = connector.connect(&url.hosts[0], url.database.as_deref()).await?;
//!
//! let mut execution = session.execute("SELECT id, name FROM users").await?;
//! if let Some(rows) = execution.result_set() {
//!     while let Some(row) = rows.next().await? {
//!         println!("{:?}", row.get_string(1));
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod failover;
pub mod metrics;
pub mod parser;
pub mod protocol;
pub mod result;
pub mod session;
pub mod statement;
pub mod url;

pub use config::{ConnectionOptions, SslMode};
pub use error::{Error, RowOutcome, ServerError};
pub use failover::{Blacklist, FailoverCoordinator};
pub use protocol::{CredentialProvider, PasswordCredentials, Value};
pub use result::{Execution, MoreResultsMode, ResultSetCursor, Row};
pub use session::{Connector, ExecuteConfig, IsolationLevel, Session, SessionState, SessionStatus};
pub use statement::{
    BatchResult, BatchStrategy, Executable, ParameterBindable, PreparedStatement,
};
pub use url::{ConnectionUrl, HostAddress, HostRole, UrlError};

//! Client-side session runtime for the Seine distributed search platform.
//!
//! One logical search fans out to many independent search servers. Each
//! server gets a paired control + data TCP connection: the control channel
//! carries lockstep request/reply RPCs, the data channel streams pushed
//! result objects back under credit flow control (the "blast channel"). The
//! [`Search`] session merges every server's stream into one bounded queue and
//! coordinates session-wide state (statistics, tunable session variables)
//! across all hosts.
//!
//! Partial-failure policy: per-host failures are always tagged with the
//! hostname, and a single host's error never cancels the other hosts'
//! in-flight work. The common session-level decision, closing the whole
//! session on the first transport error anywhere, is made here rather than
//! in the transport.

mod blast;
mod config;
mod connection;
mod connection_set;
mod filter;
mod search;

use thiserror::Error;

pub use blast::{BlastItem, ResultObject};
pub use config::ConnectionConfig;
pub use connection::{Connection, Reply};
pub use connection_set::ConnectionSet;
pub use filter::{Filter, FilterSet, Signature};
pub use search::Search;

pub use seine_wire::message::{
    Attributes, DeviceCharacteristics, ObjectIdentifier, ServerStatistics, SessionVariables,
};
pub use seine_wire::Status;

// The mock search server is only needed for tests and downstream integration
// suites. Compile it for seine-client's own unit tests unconditionally (via
// `cfg(test)`), while keeping it behind the `mock-server` feature for normal
// builds and for downstream crates.
#[cfg(any(test, feature = "mock-server"))]
pub mod mock;

pub type Result<T> = std::result::Result<T, SearchError>;

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("I/O error talking to {host}: {source}")]
    Io {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("protocol error from {host}: {source}")]
    Wire {
        host: String,
        #[source]
        source: seine_wire::WireError,
    },
    /// The server answered an RPC with a non-zero status.
    #[error("server {host} returned {status}")]
    Rpc { host: String, status: Status },
    #[error("handshake with {host} failed: {source}")]
    Handshake {
        host: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out waiting for {host}")]
    Timeout { host: String },
    #[error("connection to {host} is closed")]
    ConnectionClosed { host: String },
    /// Any operation except `close()` on a closed session.
    #[error("search session is closed")]
    Closed,
    #[error("duplicate filter name {0:?}")]
    DuplicateFilter(String),
    #[error("no connection to host {0:?}")]
    NoSuchHost(String),
    #[error("bad scope cookie: {0}")]
    Scope(#[from] seine_scope::ScopeError),
}

impl SearchError {
    /// Transport-equivalent failures are fatal to the whole session; typed
    /// application failures ([`SearchError::Rpc`] with an application status)
    /// are surfaced to the caller without tearing anything down.
    pub fn is_fatal(&self) -> bool {
        match self {
            SearchError::Io { .. }
            | SearchError::Wire { .. }
            | SearchError::Handshake { .. }
            | SearchError::Timeout { .. }
            | SearchError::ConnectionClosed { .. } => true,
            SearchError::Rpc { status, .. } => status.is_protocol_error(),
            _ => false,
        }
    }

    /// The host this failure is attributed to, when there is one.
    pub fn host(&self) -> Option<&str> {
        match self {
            SearchError::Io { host, .. }
            | SearchError::Wire { host, .. }
            | SearchError::Rpc { host, .. }
            | SearchError::Handshake { host, .. }
            | SearchError::Timeout { host }
            | SearchError::ConnectionClosed { host } => Some(host),
            SearchError::NoSuchHost(host) => Some(host),
            _ => None,
        }
    }
}

//! Fixed numeric tables for the Seine protocol revision.
//!
//! Client and server are assumed to speak the same revision; nothing here is
//! negotiated at runtime.

/// Well-known TCP port every search server listens on.
pub const PORT: u16 = 5872;

/// Length of the random handshake nonce written (and echoed) on both the
/// control and data socket.
pub const NONCE_LEN: usize = 16;

/// Control-channel command opcodes.
pub mod command {
    pub const GET_CHARACTERISTICS: i32 = 1;
    pub const REQUEST_STATS: i32 = 2;
    pub const GET_SESSION_VARIABLES: i32 = 3;
    pub const SET_SESSION_VARIABLES: i32 = 4;
    pub const START_SEARCH: i32 = 5;
    pub const STOP_SEARCH: i32 = 6;
    pub const REEXECUTE_OBJECT: i32 = 7;
    pub const SET_SCOPE: i32 = 8;
    pub const SET_FILTERS: i32 = 9;
    pub const SET_BLOBS: i32 = 10;
    pub const SET_PUSH_ATTRIBUTES: i32 = 11;
}

/// Data-channel command opcodes.
pub mod blast {
    /// Server → client: one pushed result object.
    pub const OBJECT: i32 = 1;
    /// Client → server: flow-control credit, payload is one `u32` count.
    pub const CREDIT: i32 = 2;
}

/// Reply status. Zero is success, negative values are protocol-layer errors,
/// values at or above 500 are application-layer errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    EncodingError,
    ProcedureUnavailable,
    InvalidArgument,
    InvalidProtocol,
    NetworkFailure,
    Failure,
    FilterCacheMiss,
    StatsUnavailable,
    OutOfMemory,
    CookieExpired,
    /// A code this client has no name for; preserved numerically.
    Other(i32),
}

impl Status {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Status::Ok,
            -2 => Status::EncodingError,
            -3 => Status::ProcedureUnavailable,
            -4 => Status::InvalidArgument,
            -5 => Status::InvalidProtocol,
            -6 => Status::NetworkFailure,
            500 => Status::Failure,
            501 => Status::FilterCacheMiss,
            502 => Status::StatsUnavailable,
            503 => Status::OutOfMemory,
            504 => Status::CookieExpired,
            other => Status::Other(other),
        }
    }

    pub fn code(self) -> i32 {
        match self {
            Status::Ok => 0,
            Status::EncodingError => -2,
            Status::ProcedureUnavailable => -3,
            Status::InvalidArgument => -4,
            Status::InvalidProtocol => -5,
            Status::NetworkFailure => -6,
            Status::Failure => 500,
            Status::FilterCacheMiss => 501,
            Status::StatsUnavailable => 502,
            Status::OutOfMemory => 503,
            Status::CookieExpired => 504,
            Status::Other(code) => code,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Status::Ok => "OK",
            Status::EncodingError => "ENCODING_ERROR",
            Status::ProcedureUnavailable => "PROCEDURE_UNAVAILABLE",
            Status::InvalidArgument => "INVALID_ARGUMENT",
            Status::InvalidProtocol => "INVALID_PROTOCOL",
            Status::NetworkFailure => "NETWORK_FAILURE",
            Status::Failure => "FAILURE",
            Status::FilterCacheMiss => "FILTER_CACHE_MISS",
            Status::StatsUnavailable => "STATS_UNAVAILABLE",
            Status::OutOfMemory => "OUT_OF_MEMORY",
            Status::CookieExpired => "COOKIE_EXPIRED",
            Status::Other(_) => "UNKNOWN",
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, Status::Ok)
    }

    /// Protocol-layer errors (negative codes) are treated like transport
    /// failures: fatal to the connection that produced them.
    pub fn is_protocol_error(self) -> bool {
        self.code() < 0
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

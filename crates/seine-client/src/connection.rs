use std::sync::atomic::{AtomicU32, Ordering};

use rand::RngCore;
use seine_scope::ScopeCookie;
use seine_wire::proto::{command, NONCE_LEN};
use seine_wire::{read_frame, write_frame, Frame, Status, WireError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{ConnectionConfig, Result, SearchError};

/// A control-channel reply tagged with the host that produced it, so fan-out
/// callers can always attribute an outcome to a server.
#[derive(Debug, Clone)]
pub struct Reply {
    pub host: String,
    pub command: i32,
    pub payload: Vec<u8>,
}

/// Exactly two live sockets to one search server: a control socket carrying
/// lockstep request/reply RPCs and a data socket carrying pushed result
/// objects. Owned exclusively by the session that created it; closed exactly
/// once, on session teardown or on an irrecoverable I/O error.
pub struct Connection {
    host: String,
    // Held across one full request/reply exchange: the control channel is
    // strictly half-duplex, at most one outstanding request.
    control: Mutex<TcpStream>,
    // Handed to the blast reader task at session start.
    data: std::sync::Mutex<Option<TcpStream>>,
    next_sequence: AtomicU32,
    shutdown: CancellationToken,
    config: ConnectionConfig,
}

impl Connection {
    /// Open the control/data socket pair to `host`, run the nonce handshake on
    /// both, and deliver the host's scope cookies.
    ///
    /// The same 16-byte nonce is written on both sockets; the server pairs the
    /// two opens by rendezvousing on it. The echoed bytes are checked for
    /// length only. Any failure aborts connection creation without leaking
    /// the partially opened socket (both sockets close on drop).
    pub async fn connect(
        host: &str,
        cookies: &[ScopeCookie],
        config: ConnectionConfig,
    ) -> Result<Self> {
        let addr = if host.contains(':') {
            host.to_string()
        } else {
            format!("{host}:{}", config.port)
        };

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let control = Self::open_socket(host, &addr, &nonce, &config).await?;
        let data = Self::open_socket(host, &addr, &nonce, &config).await?;

        let conn = Self {
            host: host.to_string(),
            control: Mutex::new(control),
            data: std::sync::Mutex::new(Some(data)),
            next_sequence: AtomicU32::new(0),
            shutdown: CancellationToken::new(),
            config,
        };

        let scope: String = cookies.iter().map(ScopeCookie::encoded).collect();
        if !scope.is_empty() {
            conn.call(command::SET_SCOPE, scope.into_bytes()).await?;
        }

        tracing::debug!(target: "seine.connection", host, "connected");
        Ok(conn)
    }

    async fn open_socket(
        host: &str,
        addr: &str,
        nonce: &[u8; NONCE_LEN],
        config: &ConnectionConfig,
    ) -> Result<TcpStream> {
        let timeout = config.handshake_timeout;

        let mut stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SearchError::Timeout {
                host: host.to_string(),
            })?
            .map_err(|source| SearchError::Io {
                host: host.to_string(),
                source,
            })?;
        let _ = stream.set_nodelay(true);

        let handshake = async {
            stream.write_all(nonce).await?;
            let mut echoed = [0u8; NONCE_LEN];
            stream.read_exact(&mut echoed).await?;
            Ok::<_, std::io::Error>(())
        };
        tokio::time::timeout(timeout, handshake)
            .await
            .map_err(|_| SearchError::Timeout {
                host: host.to_string(),
            })?
            .map_err(|source| SearchError::Handshake {
                host: host.to_string(),
                source,
            })?;

        Ok(stream)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Hand the data socket to the blast reader. Yields `None` the second
    /// time.
    pub(crate) fn take_data_stream(&self) -> Option<TcpStream> {
        match self.data.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Cancelled when the connection is closed. Blast readers select against
    /// this: socket closure is the only cancellation mechanism for in-flight
    /// I/O.
    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Idempotent. Unblocks every task currently blocked on this connection's
    /// sockets.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::debug!(target: "seine.connection", host = %self.host, "closing");
            self.shutdown.cancel();
        }
    }

    fn closed_error(&self) -> SearchError {
        SearchError::ConnectionClosed {
            host: self.host.clone(),
        }
    }

    pub(crate) fn wire_error(&self, err: WireError) -> SearchError {
        match err {
            WireError::Io(source) => SearchError::Io {
                host: self.host.clone(),
                source,
            },
            err => SearchError::Wire {
                host: self.host.clone(),
                source: err,
            },
        }
    }

    /// Issue one RPC: write one framed request on the control channel, block
    /// for the single framed reply, and tag it with this host.
    ///
    /// A non-zero reply status becomes a typed [`SearchError::Rpc`]; protocol-
    /// layer statuses and any transport error additionally close the
    /// connection (never retried here).
    pub async fn call(&self, command: i32, payload: Vec<u8>) -> Result<Reply> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let frame = Frame::request(sequence, command, payload);

        let mut control = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(self.closed_error()),
            guard = self.control.lock() => guard,
        };

        let exchange = async {
            write_frame(&mut *control, &frame).await?;
            read_frame(&mut *control).await
        };
        let reply = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(self.closed_error()),
            res = tokio::time::timeout(self.config.reply_timeout, exchange) => match res {
                Ok(Ok(reply)) => reply,
                Ok(Err(err)) => {
                    self.close();
                    return Err(self.wire_error(err));
                }
                Err(_elapsed) => {
                    self.close();
                    return Err(SearchError::Timeout { host: self.host.clone() });
                }
            },
        };

        let status = Status::from_code(reply.status);
        if !status.is_ok() {
            if status.is_protocol_error() {
                self.close();
            }
            return Err(SearchError::Rpc {
                host: self.host.clone(),
                status,
            });
        }

        Ok(Reply {
            host: self.host.clone(),
            command: reply.command,
            payload: reply.payload,
        })
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.host)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

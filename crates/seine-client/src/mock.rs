//! A tiny in-process search server used for unit/integration testing.
//!
//! It intentionally supports a *small* subset of the protocol sufficient to
//! exercise seine-client without requiring a deployed search cluster: the
//! nonce-rendezvous handshake, the lockstep control channel, and a scripted
//! blast stream that honors credit flow control.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use seine_wire::message::{
    decode_attribute_names, decode_filter_blobs, decode_filter_specs, decode_credit,
    decode_session_variables, encode_session_variables, Attributes, BlastObject,
    DeviceCharacteristics, FilterSpec, ObjectIdentifier, SearchStart, ServerStatistics,
    SessionVariables,
};
use seine_wire::proto::{blast, command, NONCE_LEN};
use seine_wire::{read_frame, write_frame, Frame, Status};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use seine_scope::{BEGIN_COOKIE, END_COOKIE};

/// Build a single-cookie scope blob authorizing `hosts`. Host strings may
/// carry explicit ports (`127.0.0.1:40123`), which is how tests point a
/// cookie at mock servers.
pub fn scope_blob(hosts: &[&str]) -> String {
    let text = format!(
        "Version: 1\nSerial: 634ba9d5-9880-4a2c-a7e0-b0ff54d78251\n\
         Expires: 2031-01-01T00:00:00Z\nServers: {}\n\nmock scope\n",
        hosts.join(";")
    );
    format!("{BEGIN_COOKIE}\n{}\n{END_COOKIE}\n", BASE64.encode(text))
}

#[derive(Clone, Debug)]
pub struct MockServerConfig {
    pub characteristics: DeviceCharacteristics,
    pub statistics: ServerStatistics,
    /// Initial host-local session variables served by `GET_SESSION_VARIABLES`.
    pub session_variables: SessionVariables,
    /// Objects pushed on the data channel after `START_SEARCH`, one credit
    /// awaited between pushes.
    pub blast_objects: Vec<BlastObject>,
    /// Close the data socket after the last scripted object instead of
    /// sending the end-of-stream marker, simulating a mid-stream failure.
    pub abort_mid_stream: bool,
    /// Reply to this command with the given status code instead of handling
    /// it.
    pub fail_command: Option<(i32, i32)>,
}

impl Default for MockServerConfig {
    fn default() -> Self {
        Self {
            characteristics: DeviceCharacteristics {
                device_name: "mock-device".to_string(),
                protocol_revision: 1,
                cpu_count: 4,
            },
            statistics: ServerStatistics::default(),
            session_variables: SessionVariables::new(),
            blast_objects: Vec::new(),
            abort_mid_stream: false,
            fail_command: None,
        }
    }
}

/// Everything the mock observed, for test assertions.
#[derive(Debug, Default)]
struct StateInner {
    last_sequence: Option<u32>,
    scope: Option<String>,
    filters: Vec<FilterSpec>,
    push_attributes: Vec<String>,
    session_variables: SessionVariables,
    pushed_variables: Option<SessionVariables>,
    credits: u32,
    started: bool,
}

#[derive(Debug, Default)]
pub struct MockState {
    inner: Mutex<StateInner>,
}

impl MockState {
    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn last_sequence(&self) -> Option<u32> {
        self.lock().last_sequence
    }

    pub fn scope(&self) -> Option<String> {
        self.lock().scope.clone()
    }

    pub fn filters(&self) -> Vec<FilterSpec> {
        self.lock().filters.clone()
    }

    pub fn push_attributes(&self) -> Vec<String> {
        self.lock().push_attributes.clone()
    }

    /// The variable map most recently pushed with `SET_SESSION_VARIABLES`.
    pub fn pushed_variables(&self) -> Option<SessionVariables> {
        self.lock().pushed_variables.clone()
    }

    /// Total flow-control credits received on the data channel.
    pub fn credits(&self) -> u32 {
        self.lock().credits
    }

    pub fn started(&self) -> bool {
        self.lock().started
    }
}

pub struct MockSearchServer {
    addr: SocketAddr,
    host: String,
    shutdown: CancellationToken,
    state: Arc<MockState>,
}

impl MockSearchServer {
    pub async fn spawn() -> std::io::Result<Self> {
        Self::spawn_with_config(MockServerConfig::default()).await
    }

    pub async fn spawn_with_config(config: MockServerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let state = Arc::new(MockState::default());
        state.lock().session_variables = config.session_variables.clone();

        let task_shutdown = shutdown.clone();
        let task_state = state.clone();
        tokio::spawn(async move {
            run(listener, config, task_state, task_shutdown).await;
        });

        Ok(Self {
            addr,
            host: format!("127.0.0.1:{}", addr.port()),
            shutdown,
            state,
        })
    }

    /// `host:port` string suitable for a scope cookie's `Servers` header.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> &MockState {
        &self.state
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for MockSearchServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run(
    listener: TcpListener,
    config: MockServerConfig,
    state: Arc<MockState>,
    shutdown: CancellationToken,
) {
    // First socket presenting a nonce is the control channel, the second is
    // the data channel; the shared nonce is the rendezvous.
    let mut pending: HashMap<[u8; NONCE_LEN], TcpStream> = HashMap::new();

    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => return,
            res = listener.accept() => res,
        };
        let Ok((mut stream, _)) = accepted else {
            return;
        };

        let mut nonce = [0u8; NONCE_LEN];
        if stream.read_exact(&mut nonce).await.is_err() {
            continue;
        }
        if stream.write_all(&nonce).await.is_err() {
            continue;
        }

        match pending.remove(&nonce) {
            Some(control) => {
                let config = config.clone();
                let state = state.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    serve_pair(control, stream, config, state, shutdown).await;
                });
            }
            None => {
                pending.insert(nonce, stream);
            }
        }
    }
}

async fn serve_pair(
    mut control: TcpStream,
    data: TcpStream,
    config: MockServerConfig,
    state: Arc<MockState>,
    shutdown: CancellationToken,
) {
    let mut data = Some(data);

    loop {
        let frame = tokio::select! {
            _ = shutdown.cancelled() => return,
            res = read_frame(&mut control) => match res {
                Ok(frame) => frame,
                Err(_) => return,
            },
        };
        state.lock().last_sequence = Some(frame.sequence);

        if let Some((cmd, status)) = config.fail_command {
            if cmd == frame.command {
                let reply = Frame {
                    sequence: frame.sequence,
                    status,
                    command: frame.command,
                    payload: Vec::new(),
                };
                if write_frame(&mut control, &reply).await.is_err() {
                    return;
                }
                continue;
            }
        }

        let payload = match handle_command(&frame, &config, &state, &mut data, &shutdown) {
            Ok(payload) => payload,
            Err(status) => {
                let reply = Frame {
                    sequence: frame.sequence,
                    status: status.code(),
                    command: frame.command,
                    payload: Vec::new(),
                };
                if write_frame(&mut control, &reply).await.is_err() {
                    return;
                }
                continue;
            }
        };

        let reply = Frame {
            sequence: frame.sequence,
            status: 0,
            command: frame.command,
            payload,
        };
        if write_frame(&mut control, &reply).await.is_err() {
            return;
        }
    }
}

fn handle_command(
    frame: &Frame,
    config: &MockServerConfig,
    state: &Arc<MockState>,
    data: &mut Option<TcpStream>,
    shutdown: &CancellationToken,
) -> std::result::Result<Vec<u8>, Status> {
    match frame.command {
        command::GET_CHARACTERISTICS => Ok(config.characteristics.encode()),
        command::REQUEST_STATS => Ok(config.statistics.encode()),
        command::GET_SESSION_VARIABLES => {
            Ok(encode_session_variables(&state.lock().session_variables))
        }
        command::SET_SESSION_VARIABLES => {
            let vars =
                decode_session_variables(&frame.payload).map_err(|_| Status::EncodingError)?;
            let mut guard = state.lock();
            guard.session_variables = vars.clone();
            guard.pushed_variables = Some(vars);
            Ok(Vec::new())
        }
        command::SET_SCOPE => {
            state.lock().scope = Some(String::from_utf8_lossy(&frame.payload).into_owned());
            Ok(Vec::new())
        }
        command::SET_FILTERS => {
            let specs = decode_filter_specs(&frame.payload).map_err(|_| Status::EncodingError)?;
            state.lock().filters = specs;
            Ok(Vec::new())
        }
        command::SET_BLOBS => {
            decode_filter_blobs(&frame.payload).map_err(|_| Status::EncodingError)?;
            Ok(Vec::new())
        }
        command::SET_PUSH_ATTRIBUTES => {
            let names =
                decode_attribute_names(&frame.payload).map_err(|_| Status::EncodingError)?;
            state.lock().push_attributes = names;
            Ok(Vec::new())
        }
        command::START_SEARCH => {
            SearchStart::decode(&frame.payload).map_err(|_| Status::EncodingError)?;
            state.lock().started = true;
            if let Some(stream) = data.take() {
                let objects = config.blast_objects.clone();
                let abort = config.abort_mid_stream;
                let state = state.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    run_blast(stream, objects, abort, state, shutdown).await;
                });
            }
            Ok(Vec::new())
        }
        command::STOP_SEARCH => Ok(Vec::new()),
        command::REEXECUTE_OBJECT => {
            let id =
                ObjectIdentifier::decode(&frame.payload).map_err(|_| Status::EncodingError)?;
            let mut attributes = Attributes::new();
            attributes.insert("reexecuted".to_string(), id.object_id.into_bytes());
            let object = BlastObject {
                attributes,
                payload: Vec::new(),
            };
            Ok(object.encode())
        }
        _ => Err(Status::ProcedureUnavailable),
    }
}

/// Push the scripted objects, awaiting one credit between pushes, then either
/// finish with the end-of-stream marker or drop the socket mid-stream.
async fn run_blast(
    mut stream: TcpStream,
    objects: Vec<BlastObject>,
    abort: bool,
    state: Arc<MockState>,
    shutdown: CancellationToken,
) {
    let mut sequence = 0u32;
    for object in objects {
        let frame = Frame {
            sequence,
            status: 0,
            command: blast::OBJECT,
            payload: object.encode(),
        };
        sequence = sequence.wrapping_add(1);
        let written = tokio::select! {
            _ = shutdown.cancelled() => return,
            res = write_frame(&mut stream, &frame) => res,
        };
        if written.is_err() {
            return;
        }

        // Hold back further pushes until the client returns credit.
        let credit = tokio::select! {
            _ = shutdown.cancelled() => return,
            res = read_frame(&mut stream) => res,
        };
        match credit {
            Ok(frame) if frame.command == blast::CREDIT => {
                if let Ok(count) = decode_credit(&frame.payload) {
                    state.lock().credits += count;
                }
            }
            _ => return,
        }
    }

    if abort {
        let _ = stream.shutdown().await;
        return;
    }

    let eos = Frame {
        sequence,
        status: 0,
        command: blast::OBJECT,
        payload: BlastObject::end_of_stream().encode(),
    };
    if write_frame(&mut stream, &eos).await.is_err() {
        return;
    }
    // The client acknowledges the marker too; drain and record it so tests
    // can assert one credit per push, marker included.
    if let Ok(frame) = read_frame(&mut stream).await {
        if frame.command == blast::CREDIT {
            if let Ok(count) = decode_credit(&frame.payload) {
                state.lock().credits += count;
            }
        }
    }
}

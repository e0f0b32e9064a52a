use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use seine_scope::CookieMap;
use seine_wire::message::{
    decode_session_variables, encode_attribute_names, encode_filter_blobs,
    encode_filter_specs, encode_session_variables, Attributes, BlastObject,
    DeviceCharacteristics, ObjectIdentifier, ServerStatistics, SessionVariables,
};
use seine_wire::proto::command;
use tokio::sync::Mutex;

use crate::blast::BlastChannel;
use crate::{
    ConnectionConfig, ConnectionSet, FilterSet, Reply, Result, ResultObject, SearchError,
};
use crate::BlastItem;

const STATE_CREATED: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// One search session across every server a cookie map authorizes.
///
/// Lifecycle: `created → started → closed`. `closed` is terminal and
/// idempotent; every operation except [`close`](Search::close) on a closed
/// session fails with [`SearchError::Closed`].
pub struct Search {
    set: Arc<ConnectionSet>,
    // Single-consumer discipline for the merged queue.
    blast: Mutex<BlastChannel>,
    // Serializes fan-out operations: two logical operations must never
    // interleave lockstep RPCs on the same control channel.
    rpc: Mutex<()>,
    state: AtomicU8,
    search_id: u32,
    push_attributes: Vec<String>,
}

impl Search {
    /// Connect to every authorized host (all-or-nothing), deliver the filter
    /// set, and return a session ready to [`start`](Search::start).
    pub async fn open(
        cookies: &CookieMap,
        filters: &FilterSet,
        push_attributes: Vec<String>,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let capacity = config.blast_queue_capacity;
        let set = Arc::new(ConnectionSet::connect(cookies, &config).await?);
        let blast = BlastChannel::spawn(set.clone(), capacity);

        let search = Self {
            set,
            blast: Mutex::new(blast),
            rpc: Mutex::new(()),
            state: AtomicU8::new(STATE_CREATED),
            search_id: rand::random(),
            push_attributes,
        };

        let setup = async {
            search
                .fan_out_all_or_close(command::SET_FILTERS, encode_filter_specs(&filters.to_specs()))
                .await?;
            let blobs = filters.blobs();
            if !blobs.is_empty() {
                search
                    .fan_out_all_or_close(command::SET_BLOBS, encode_filter_blobs(&blobs))
                    .await?;
            }
            search
                .fan_out_all_or_close(
                    command::SET_PUSH_ATTRIBUTES,
                    encode_attribute_names(&search.push_attributes),
                )
                .await?;
            Ok(())
        };
        match setup.await {
            Ok(()) => {
                tracing::info!(
                    target: "seine.search",
                    hosts = search.set.len(),
                    search_id = search.search_id,
                    "session opened"
                );
                Ok(search)
            }
            Err(err) => {
                search.close();
                Err(err)
            }
        }
    }

    pub fn hosts(&self) -> Vec<String> {
        self.set.hosts().map(str::to_string).collect()
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) == STATE_CLOSED
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SearchError::Closed);
        }
        Ok(())
    }

    /// Close the session: every socket is shut, which is what cancels any
    /// in-flight blast reader or RPC. Idempotent; the only operation legal on
    /// a closed session.
    pub fn close(&self) {
        let prev = self.state.swap(STATE_CLOSED, Ordering::SeqCst);
        if prev != STATE_CLOSED {
            tracing::info!(target: "seine.search", search_id = self.search_id, "session closed");
            self.set.close();
        }
    }

    /// Start the search on every host. If any host fails, the whole session
    /// is closed and the first error surfaces: there is no partial start.
    pub async fn start(&self) -> Result<()> {
        self.ensure_open()?;
        let _serial = self.rpc.lock().await;
        let record = seine_wire::message::SearchStart {
            search_id: self.search_id,
            push_attributes: self.push_attributes.clone(),
        };
        self.fan_out_all_or_close(command::START_SEARCH, record.encode())
            .await?;
        self.state.store(STATE_STARTED, Ordering::SeqCst);
        Ok(())
    }

    /// Stop the search on every host, leaving the session open for
    /// statistics and variable reconciliation.
    pub async fn stop(&self) -> Result<()> {
        self.ensure_open()?;
        let _serial = self.rpc.lock().await;
        let record = seine_wire::message::SearchStop {
            search_id: self.search_id,
        };
        let outcomes = self.set.send_to_all(command::STOP_SEARCH, record.encode()).await;
        self.first_failure(outcomes).map(|_| ())
    }

    /// Pull one merged result.
    ///
    /// `Ok(None)` is end-of-stream: every server finished; the session is
    /// closed automatically (later callers observe [`SearchError::Closed`]).
    /// While [`pause`](Search::pause)d, `Ok(None)` instead means "nothing
    /// queued": the session stays open and [`resume`](Search::resume)
    /// restores delivery. A stream-level error closes the session and
    /// re-raises here.
    pub async fn next_result(&self) -> Result<Option<ResultObject>> {
        self.ensure_open()?;
        let mut blast = self.blast.lock().await;
        match blast.take().await {
            BlastItem::Object(obj) => Ok(Some(obj)),
            BlastItem::End => {
                if blast.is_finished() {
                    self.close();
                }
                Ok(None)
            }
            BlastItem::Error { host, error } => {
                tracing::warn!(
                    target: "seine.search",
                    host = %host,
                    error = %error,
                    "result stream failed"
                );
                self.close();
                Err(error)
            }
        }
    }

    /// Stop pulling results without tearing connections down: queued and
    /// further pushed objects are dropped until [`resume`](Search::resume).
    pub async fn pause(&self) -> Result<()> {
        self.ensure_open()?;
        self.blast.lock().await.pause();
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        self.ensure_open()?;
        self.blast.lock().await.resume();
        Ok(())
    }

    /// Per-host object counters, keyed by hostname.
    pub async fn statistics(&self) -> Result<BTreeMap<String, ServerStatistics>> {
        self.ensure_open()?;
        let _serial = self.rpc.lock().await;
        let outcomes = self.set.send_to_all(command::REQUEST_STATS, Vec::new()).await;
        let replies = self.first_failure(outcomes)?;

        let mut stats = BTreeMap::new();
        for reply in replies {
            let decoded = ServerStatistics::decode(&reply.payload)
                .map_err(|source| SearchError::Wire {
                    host: reply.host.clone(),
                    source,
                })?;
            stats.insert(reply.host, decoded);
        }
        Ok(stats)
    }

    /// Per-host device characteristics, keyed by hostname.
    pub async fn characteristics(&self) -> Result<BTreeMap<String, DeviceCharacteristics>> {
        self.ensure_open()?;
        let _serial = self.rpc.lock().await;
        let outcomes = self
            .set
            .send_to_all(command::GET_CHARACTERISTICS, Vec::new())
            .await;
        let replies = self.first_failure(outcomes)?;

        let mut chars = BTreeMap::new();
        for reply in replies {
            let decoded = DeviceCharacteristics::decode(&reply.payload)
                .map_err(|source| SearchError::Wire {
                    host: reply.host.clone(),
                    source,
                })?;
            chars.insert(reply.host, decoded);
        }
        Ok(chars)
    }

    /// Reconcile session variables across every host.
    ///
    /// Fetches each host's variables, unions every name into `globals`
    /// (unseen keys default to 0.0), folds each key through `compose(key,
    /// global, local)` strictly sequentially in host order, then pushes the
    /// merged map back to every host. The composer defines the reduction
    /// (sum, max, weighted average, ...); the session does not interpret it.
    pub async fn merge_session_variables<F>(
        &self,
        mut globals: SessionVariables,
        compose: F,
    ) -> Result<SessionVariables>
    where
        F: Fn(&str, f64, f64) -> f64,
    {
        self.ensure_open()?;
        let _serial = self.rpc.lock().await;

        let outcomes = self
            .set
            .run_on_all(|conn| async move {
                let reply = conn.call(command::GET_SESSION_VARIABLES, Vec::new()).await?;
                let vars = decode_session_variables(&reply.payload)
                    .map_err(|e| conn.wire_error(e))?;
                Ok((reply.host, vars))
            })
            .await;
        let per_host: HashMap<String, SessionVariables> =
            self.first_failure(outcomes)?.into_iter().collect();

        for vars in per_host.values() {
            for name in vars.keys() {
                globals.entry(name.clone()).or_insert(0.0);
            }
        }

        // Strictly sequential fold, in the set's (sorted) host order.
        let keys: Vec<String> = globals.keys().cloned().collect();
        for host in self.set.hosts() {
            let Some(locals) = per_host.get(host) else {
                continue;
            };
            for key in &keys {
                let local = locals.get(key).copied().unwrap_or(0.0);
                let global = globals[key];
                globals.insert(key.clone(), compose(key, global, local));
            }
        }

        let outcomes = self
            .set
            .send_to_all(
                command::SET_SESSION_VARIABLES,
                encode_session_variables(&globals),
            )
            .await;
        self.first_failure(outcomes)?;
        Ok(globals)
    }

    /// Ask an object's origin host to re-evaluate it, returning the freshly
    /// computed attribute map.
    pub async fn reexecute(&self, id: &ObjectIdentifier) -> Result<Attributes> {
        self.ensure_open()?;
        let _serial = self.rpc.lock().await;
        let conn = self
            .set
            .connection_for(&id.host)
            .ok_or_else(|| SearchError::NoSuchHost(id.host.clone()))?;
        let reply = conn.call(command::REEXECUTE_OBJECT, id.encode()).await?;
        let object = BlastObject::decode(&reply.payload).map_err(|e| conn.wire_error(e))?;
        Ok(object.attributes)
    }

    /// Fan out one RPC; any failure closes the whole session.
    async fn fan_out_all_or_close(&self, cmd: i32, payload: Vec<u8>) -> Result<Vec<Reply>> {
        let outcomes = self.set.send_to_all(cmd, payload).await;
        let mut replies = Vec::with_capacity(outcomes.len());
        let mut first_err = None;
        for outcome in outcomes {
            match outcome {
                Ok(reply) => replies.push(reply),
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => {
                self.close();
                Err(err)
            }
            None => Ok(replies),
        }
    }

    /// Drain a full set of fan-out outcomes. The first failure is returned;
    /// transport-equivalent failures additionally close the session
    /// (application statuses leave it open).
    fn first_failure<T>(&self, outcomes: Vec<Result<T>>) -> Result<Vec<T>> {
        let mut values = Vec::with_capacity(outcomes.len());
        let mut first_err = None;
        for outcome in outcomes {
            match outcome {
                Ok(value) => values.push(value),
                Err(err) => {
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => {
                if err.is_fatal() {
                    self.close();
                }
                Err(err)
            }
            None => Ok(values),
        }
    }
}

impl Drop for Search {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Search {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Search")
            .field("search_id", &self.search_id)
            .field("hosts", &self.hosts())
            .field("closed", &self.is_closed())
            .finish()
    }
}

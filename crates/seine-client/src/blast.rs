use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use seine_wire::message::{encode_credit, Attributes, BlastObject, ObjectIdentifier};
use seine_wire::proto::blast;
use seine_wire::{read_frame, write_frame, Frame, WireError};
use tokio::sync::mpsc;

use crate::{Connection, ConnectionSet, Result, SearchError};

/// Attribute carrying the server-assigned object id.
pub const ATTR_OBJECT_ID: &str = "_ObjectID";
/// Attribute carrying the name of the device that evaluated the object.
pub const ATTR_DEVICE_NAME: &str = "Device-Name";

/// One decoded result object, tagged with the host that pushed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultObject {
    pub attributes: Attributes,
    pub payload: Vec<u8>,
    pub host: String,
}

impl ResultObject {
    fn attr_str(&self, name: &str) -> Option<String> {
        self.attributes
            .get(name)
            .and_then(|v| std::str::from_utf8(v).ok())
            .map(|s| s.trim_end_matches('\0').to_string())
    }

    /// Identity of this object, when the server attached one: enough to ask
    /// the origin host to re-evaluate it later.
    pub fn identifier(&self) -> Option<ObjectIdentifier> {
        Some(ObjectIdentifier {
            object_id: self.attr_str(ATTR_OBJECT_ID)?,
            device_name: self.attr_str(ATTR_DEVICE_NAME).unwrap_or_default(),
            host: self.host.clone(),
        })
    }
}

/// Element type of the merged result queue. The end-of-stream and error
/// cases are explicit variants so every consumer has to handle them.
#[derive(Debug)]
pub enum BlastItem {
    Object(ResultObject),
    /// Exactly one per session, after every per-server stream has finished
    /// or failed.
    End,
    /// A stream-level failure; wakes a blocked consumer immediately.
    Error { host: String, error: SearchError },
}

/// Consumer end of the session-wide merged queue.
///
/// Single-consumer discipline: the owning session serializes `take`, so
/// shutdown behavior is deterministic. After close or pause, `take` drains
/// without blocking and then yields `End`.
pub(crate) struct BlastChannel {
    rx: mpsc::Receiver<BlastItem>,
    paused: Arc<AtomicBool>,
    /// Non-object items rescued while draining in paused mode.
    stash: VecDeque<BlastItem>,
    finished: bool,
}

impl BlastChannel {
    /// Spawn one reader task per connection plus the supervising task that
    /// merges their termination into a single `End`.
    pub(crate) fn spawn(set: Arc<ConnectionSet>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        let paused = Arc::new(AtomicBool::new(false));

        let readers: FuturesUnordered<_> = set
            .connections()
            .iter()
            .map(|conn| tokio::spawn(run_reader(conn.clone(), tx.clone(), paused.clone())))
            .collect();
        tokio::spawn(supervise(readers, tx, set));

        Self {
            rx,
            paused,
            stash: VecDeque::new(),
            finished: false,
        }
    }

    #[cfg(test)]
    fn from_parts(rx: mpsc::Receiver<BlastItem>) -> Self {
        Self {
            rx,
            paused: Arc::new(AtomicBool::new(false)),
            stash: VecDeque::new(),
            finished: false,
        }
    }

    /// Drop pushed objects instead of queueing them until [`resume`]d, and
    /// clear everything already queued. Readers keep acknowledging credits,
    /// so the servers stay warm without anyone draining the queue.
    pub(crate) fn pause(&mut self) {
        self.paused.store(true, Ordering::SeqCst);
        self.drain_queued();
    }

    pub(crate) fn resume(&mut self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// True once the terminal `End` has been observed. A paused drain that
    /// comes up empty yields `End` without setting this, so the owning
    /// session can tell "nothing queued right now" from "stream over".
    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    fn drain_queued(&mut self) {
        while let Ok(item) = self.rx.try_recv() {
            match item {
                BlastItem::Object(_) => {}
                other => self.stash.push_back(other),
            }
        }
    }

    /// Take the next item. Blocking while the stream is live; after pause or
    /// after the terminal `End`, never blocks.
    pub(crate) async fn take(&mut self) -> BlastItem {
        if let Some(item) = self.stash.pop_front() {
            if matches!(item, BlastItem::End) {
                self.finished = true;
            }
            return item;
        }
        if self.finished {
            return BlastItem::End;
        }
        if self.paused.load(Ordering::SeqCst) {
            self.drain_queued();
            return match self.stash.pop_front() {
                Some(item) => {
                    if matches!(item, BlastItem::End) {
                        self.finished = true;
                    }
                    item
                }
                None => BlastItem::End,
            };
        }
        match self.rx.recv().await {
            Some(BlastItem::End) | None => {
                self.finished = true;
                BlastItem::End
            }
            Some(item) => item,
        }
    }
}

/// Per-connection background reader: pull pushed objects off the data socket,
/// return one flow-control credit per object, and forward decoded objects
/// into the shared queue. Returns normally on the end-of-stream marker or on
/// connection close; returns the host-tagged error on any transport fault.
async fn run_reader(
    conn: Arc<Connection>,
    tx: mpsc::Sender<BlastItem>,
    paused: Arc<AtomicBool>,
) -> Result<()> {
    let Some(mut stream) = conn.take_data_stream() else {
        return Ok(());
    };
    let token = conn.shutdown_token();
    let host = conn.host().to_string();
    let mut sequence = 0u32;

    loop {
        let frame = tokio::select! {
            _ = token.cancelled() => return Ok(()),
            res = read_frame(&mut stream) => res.map_err(|e| conn.wire_error(e))?,
        };
        if frame.command != blast::OBJECT {
            return Err(SearchError::Wire {
                host,
                source: WireError::Malformed(format!(
                    "unexpected data-channel command {}",
                    frame.command
                )),
            });
        }
        let object = BlastObject::decode(&frame.payload).map_err(|e| conn.wire_error(e))?;

        // One credit per push, returned before the object reaches the queue:
        // the queue bounds objects in flight, the credit bounds the server.
        let credit = Frame::request(sequence, blast::CREDIT, encode_credit(1));
        sequence = sequence.wrapping_add(1);
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            res = write_frame(&mut stream, &credit) => res.map_err(|e| conn.wire_error(e))?,
        }

        if object.is_end_of_stream() {
            tracing::debug!(target: "seine.blast", host = %host, "stream ended");
            return Ok(());
        }

        if paused.load(Ordering::SeqCst) {
            continue;
        }
        let item = BlastItem::Object(ResultObject {
            attributes: object.attributes,
            payload: object.payload,
            host: host.clone(),
        });
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            res = tx.send(item) => {
                // A dropped receiver means the session is gone; stop quietly.
                if res.is_err() {
                    return Ok(());
                }
            }
        }
    }
}

/// Waits for every per-connection reader, surfaces the first failure as an
/// error item, and finishes the session with exactly one `End`.
async fn supervise(
    mut readers: FuturesUnordered<tokio::task::JoinHandle<Result<()>>>,
    tx: mpsc::Sender<BlastItem>,
    set: Arc<ConnectionSet>,
) {
    let mut failed = false;
    while let Some(joined) = readers.next().await {
        let outcome = match joined {
            Ok(outcome) => outcome,
            Err(join_err) => Err(SearchError::Io {
                host: "?".to_string(),
                source: std::io::Error::other(join_err),
            }),
        };
        if let Err(error) = outcome {
            tracing::warn!(
                target: "seine.blast",
                host = error.host().unwrap_or("?"),
                error = %error,
                "blast reader failed"
            );
            if !failed {
                failed = true;
                let host = error.host().unwrap_or("?").to_string();
                // Wake a blocked consumer, then tear the session down; the
                // closed sockets end the remaining readers.
                let _ = tx.send(BlastItem::Error { host, error }).await;
                set.close();
            }
        }
    }
    // A clean finish does not tear the connections down: the session stays
    // usable for statistics and variable reconciliation until the consumer
    // observes `End` (or closes explicitly).
    let _ = tx.send(BlastItem::End).await;
}

use std::future::Future;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use seine_scope::{CookieMap, ScopeError};

use crate::{Connection, ConnectionConfig, Reply, Result, SearchError};

/// The set of live per-server connections for one search session.
///
/// Mutated only at construction and at close: steady-state callers fan RPCs
/// out over an immutable snapshot.
pub struct ConnectionSet {
    connections: Vec<Arc<Connection>>,
}

impl ConnectionSet {
    /// Connect to every host a [`CookieMap`] authorizes, concurrently.
    ///
    /// All-or-nothing: if any host fails, every already-open connection is
    /// closed and the first error observed is returned. A partially-open set
    /// never escapes.
    pub async fn connect(map: &CookieMap, config: &ConnectionConfig) -> Result<Self> {
        if map.is_empty() {
            return Err(SearchError::Scope(ScopeError::BadCookie(
                "cookie map names no servers".to_string(),
            )));
        }

        let mut pending: FuturesUnordered<_> = map
            .hosts()
            .map(|host| {
                let host = host.to_string();
                let cookies = map.cookies_for(&host).to_vec();
                let config = config.clone();
                tokio::spawn(async move { Connection::connect(&host, &cookies, config).await })
            })
            .collect();

        let mut connections = Vec::new();
        let mut first_err = None;
        while let Some(joined) = pending.next().await {
            match joined {
                Ok(Ok(conn)) => connections.push(Arc::new(conn)),
                Ok(Err(err)) => {
                    tracing::warn!(
                        target: "seine.connection",
                        host = err.host().unwrap_or("?"),
                        error = %err,
                        "connection attempt failed; rolling back session setup"
                    );
                    first_err.get_or_insert(err);
                }
                Err(join_err) => {
                    first_err.get_or_insert(SearchError::Io {
                        host: "?".to_string(),
                        source: std::io::Error::other(join_err),
                    });
                }
            }
        }

        if let Some(err) = first_err {
            for conn in &connections {
                conn.close();
            }
            return Err(err);
        }

        // Deterministic host order for session-variable folds and `hosts()`.
        connections.sort_by(|a, b| a.host().cmp(b.host()));
        Ok(Self { connections })
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.connections.iter().map(|c| c.host())
    }

    pub(crate) fn connections(&self) -> &[Arc<Connection>] {
        &self.connections
    }

    pub fn connection_for(&self, host: &str) -> Option<Arc<Connection>> {
        self.connections
            .iter()
            .find(|c| c.host() == host)
            .cloned()
    }

    /// Run one concurrently scheduled task per live connection and collect
    /// the host-tagged outcomes in completion order, not submission order.
    ///
    /// A single host's failure never cancels the others; callers that need
    /// "did any host fail" semantics drain all [`len`](Self::len) outcomes
    /// and aggregate.
    pub async fn run_on_all<T, F, Fut>(&self, task: F) -> Vec<Result<T>>
    where
        T: Send + 'static,
        F: Fn(Arc<Connection>) -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let mut pending: FuturesUnordered<_> = self
            .connections
            .iter()
            .map(|conn| {
                let host = conn.host().to_string();
                let handle = tokio::spawn(task(conn.clone()));
                async move { (host, handle.await) }
            })
            .collect();

        let mut outcomes = Vec::with_capacity(self.len());
        while let Some((host, joined)) = pending.next().await {
            outcomes.push(match joined {
                Ok(outcome) => outcome,
                Err(join_err) => Err(SearchError::Io {
                    host,
                    source: std::io::Error::other(join_err),
                }),
            });
        }
        outcomes
    }

    /// The common fan-out: the same command and payload to every host's
    /// control channel, replies tagged by host, completion order.
    pub async fn send_to_all(&self, command: i32, payload: Vec<u8>) -> Vec<Result<Reply>> {
        self.run_on_all(move |conn| {
            let payload = payload.clone();
            async move { conn.call(command, payload).await }
        })
        .await
    }

    /// Close every connection. Idempotent; unblocks blast readers and
    /// in-flight RPCs with I/O errors.
    pub fn close(&self) {
        for conn in &self.connections {
            conn.close();
        }
    }
}

impl std::fmt::Debug for ConnectionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSet")
            .field("hosts", &self.hosts().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{scope_blob, MockSearchServer, MockServerConfig};
    use crate::Status;
    use seine_wire::proto::command;
    use std::collections::BTreeSet;
    use std::time::Duration;

    fn test_config() -> ConnectionConfig {
        ConnectionConfig {
            handshake_timeout: Duration::from_secs(2),
            reply_timeout: Duration::from_secs(2),
            ..ConnectionConfig::default()
        }
    }

    async fn spawn_servers(n: usize) -> Vec<MockSearchServer> {
        let mut servers = Vec::new();
        for _ in 0..n {
            servers.push(MockSearchServer::spawn().await.unwrap());
        }
        servers
    }

    #[tokio::test]
    async fn fan_out_yields_one_tagged_outcome_per_host() {
        let servers = spawn_servers(3).await;
        let hosts: Vec<&str> = servers.iter().map(|s| s.host()).collect();
        let map = CookieMap::from_blob(&scope_blob(&hosts)).unwrap();
        let set = ConnectionSet::connect(&map, &test_config()).await.unwrap();
        assert_eq!(set.len(), 3);

        let outcomes = set.send_to_all(command::GET_CHARACTERISTICS, Vec::new()).await;
        assert_eq!(outcomes.len(), 3);
        let tagged: BTreeSet<String> = outcomes
            .into_iter()
            .map(|o| o.unwrap().host)
            .collect();
        let expected: BTreeSet<String> = hosts.iter().map(|h| h.to_string()).collect();
        assert_eq!(tagged, expected);
    }

    #[tokio::test]
    async fn one_failing_host_does_not_cancel_the_others() {
        let mut failing = MockServerConfig::default();
        failing.fail_command = Some((command::REQUEST_STATS, Status::Failure.code()));
        let bad = MockSearchServer::spawn_with_config(failing).await.unwrap();
        let good = spawn_servers(2).await;

        let hosts: Vec<&str> = good
            .iter()
            .map(|s| s.host())
            .chain(std::iter::once(bad.host()))
            .collect();
        let map = CookieMap::from_blob(&scope_blob(&hosts)).unwrap();
        let set = ConnectionSet::connect(&map, &test_config()).await.unwrap();

        let outcomes = set.send_to_all(command::REQUEST_STATS, Vec::new()).await;
        assert_eq!(outcomes.len(), 3);
        let failures: Vec<_> = outcomes.iter().filter(|o| o.is_err()).collect();
        assert_eq!(failures.len(), 1);
        match outcomes.iter().find(|o| o.is_err()).unwrap() {
            Err(SearchError::Rpc { host, status }) => {
                assert_eq!(host, bad.host());
                assert_eq!(*status, Status::Failure);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_is_all_or_nothing() {
        let live = MockSearchServer::spawn().await.unwrap();
        // Bind-then-drop for a dead port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap().to_string();
        drop(listener);

        let map = CookieMap::from_blob(&scope_blob(&[live.host(), &dead])).unwrap();
        let err = ConnectionSet::connect(&map, &test_config()).await.unwrap_err();
        assert!(err.host().is_some());
    }

    #[tokio::test]
    async fn empty_map_is_rejected() {
        let map = CookieMap::default();
        assert!(matches!(
            ConnectionSet::connect(&map, &test_config()).await,
            Err(SearchError::Scope(_))
        ));
    }
}

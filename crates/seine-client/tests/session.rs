//! End-to-end session tests against the in-process mock search server.

use std::collections::BTreeSet;
use std::time::Duration;

use seine_client::mock::{scope_blob, MockSearchServer, MockServerConfig};
use seine_client::{
    Attributes, ConnectionConfig, Filter, FilterSet, Search, SearchError, ServerStatistics,
    SessionVariables, Status,
};
use seine_scope::CookieMap;
use seine_wire::message::BlastObject;

fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        handshake_timeout: Duration::from_secs(2),
        reply_timeout: Duration::from_secs(5),
        ..ConnectionConfig::default()
    }
}

fn push_object(id: &str) -> BlastObject {
    let mut attributes = Attributes::new();
    attributes.insert("_ObjectID".to_string(), id.as_bytes().to_vec());
    attributes.insert("Device-Name".to_string(), b"mock-device".to_vec());
    BlastObject {
        attributes,
        payload: b"pixels".to_vec(),
    }
}

fn one_filter() -> FilterSet {
    let mut filters = FilterSet::new();
    filters
        .add(
            Filter::new(b"\x7fELF-filter-code".to_vec())
                .with_name("edges")
                .with_thresholds(0.5, f64::INFINITY),
        )
        .unwrap();
    filters
}

async fn open_search(servers: &[MockSearchServer]) -> Search {
    // `RUST_LOG=seine=debug cargo test` prints the session/blast traces.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();

    let hosts: Vec<&str> = servers.iter().map(|s| s.host()).collect();
    let map = CookieMap::from_blob(&scope_blob(&hosts)).unwrap();
    Search::open(&map, &one_filter(), vec!["_ObjectID".to_string()], test_config())
        .await
        .unwrap()
}

/// The mock records some observations (final credits) slightly after the
/// client sees the corresponding frame; poll instead of racing.
async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

#[tokio::test]
async fn results_stream_until_a_single_end_of_stream() {
    let mut servers = Vec::new();
    for i in 0..3 {
        let mut config = MockServerConfig::default();
        config.blast_objects = vec![
            push_object(&format!("srv{i}-obj0")),
            push_object(&format!("srv{i}-obj1")),
        ];
        servers.push(MockSearchServer::spawn_with_config(config).await.unwrap());
    }

    let search = open_search(&servers).await;
    search.start().await.unwrap();

    let mut seen = BTreeSet::new();
    while let Some(result) = search.next_result().await.unwrap() {
        // Host tagging matches the pushing server.
        let id = result.identifier().unwrap();
        assert_eq!(id.host, result.host);
        seen.insert(id.object_id);
    }
    assert_eq!(seen.len(), 6);

    // End-of-stream auto-closed the session; the end marker itself was never
    // delivered as a result.
    assert!(search.is_closed());
    assert!(matches!(
        search.next_result().await,
        Err(SearchError::Closed)
    ));
    // close() stays a no-op.
    search.close();
    search.close();
}

#[tokio::test]
async fn mid_stream_failure_surfaces_and_closes_the_session() {
    let mut failing = MockServerConfig::default();
    failing.blast_objects = vec![push_object("bad-obj0")];
    failing.abort_mid_stream = true;
    let bad = MockSearchServer::spawn_with_config(failing).await.unwrap();

    let mut healthy = MockServerConfig::default();
    healthy.blast_objects = vec![push_object("good-obj0")];
    let good = MockSearchServer::spawn_with_config(healthy).await.unwrap();

    let servers = [bad, good];
    let search = open_search(&servers).await;
    search.start().await.unwrap();

    let mut objects = 0usize;
    let err = loop {
        match search.next_result().await {
            Ok(Some(_)) => objects += 1,
            Ok(None) => panic!("stream ended cleanly despite a failing server"),
            Err(err) => break err,
        }
    };
    assert!(err.is_fatal(), "expected a transport failure, got {err:?}");
    assert!(search.is_closed());
    assert!(objects <= 2);
}

#[tokio::test]
async fn session_variables_merge_across_hosts() {
    let mut a = MockServerConfig::default();
    a.session_variables = SessionVariables::from([("x".to_string(), 1.0)]);
    let mut b = MockServerConfig::default();
    b.session_variables = SessionVariables::from([("x".to_string(), 2.0), ("y".to_string(), 5.0)]);

    let servers = [
        MockSearchServer::spawn_with_config(a).await.unwrap(),
        MockSearchServer::spawn_with_config(b).await.unwrap(),
    ];

    let search = open_search(&servers).await;
    let merged = search
        .merge_session_variables(SessionVariables::new(), |_key, global, local| global + local)
        .await
        .unwrap();

    assert_eq!(merged["x"], 3.0);
    assert_eq!(merged["y"], 5.0);

    // The merged map was pushed back to every host before the call returned.
    for server in &servers {
        assert_eq!(server.state().pushed_variables(), Some(merged.clone()));
    }
}

#[tokio::test]
async fn statistics_are_keyed_by_host() {
    let mut a = MockServerConfig::default();
    a.statistics = ServerStatistics {
        objects_total: 100,
        objects_processed: 90,
        objects_dropped: 80,
        filters: Vec::new(),
    };
    let mut b = MockServerConfig::default();
    b.statistics = ServerStatistics {
        objects_total: 7,
        objects_processed: 7,
        objects_dropped: 0,
        filters: Vec::new(),
    };
    let servers = [
        MockSearchServer::spawn_with_config(a).await.unwrap(),
        MockSearchServer::spawn_with_config(b).await.unwrap(),
    ];
    let host_a = servers[0].host().to_string();
    let host_b = servers[1].host().to_string();

    let search = open_search(&servers).await;
    let stats = search.statistics().await.unwrap();
    assert_eq!(stats[&host_a].objects_total, 100);
    assert_eq!(stats[&host_b].objects_total, 7);
}

#[tokio::test]
async fn pause_keeps_the_session_open_across_an_empty_take() {
    let mut config = MockServerConfig::default();
    config.blast_objects = vec![push_object("after-resume")];
    let server = MockSearchServer::spawn_with_config(config).await.unwrap();

    let search = open_search(std::slice::from_ref(&server)).await;
    // Nothing is streaming before start, so the paused take drains empty.
    search.pause().await.unwrap();
    assert!(matches!(search.next_result().await, Ok(None)));
    assert!(
        !search.is_closed(),
        "an empty paused take must not end the session"
    );

    // The connections stayed warm: resume and run the search to completion.
    search.resume().await.unwrap();
    search.start().await.unwrap();
    let result = search.next_result().await.unwrap().expect("one result");
    assert_eq!(result.identifier().unwrap().object_id, "after-resume");
    assert!(matches!(search.next_result().await, Ok(None)));
    assert!(search.is_closed());
}

#[tokio::test]
async fn every_operation_fails_closed_except_close() {
    let server = MockSearchServer::spawn().await.unwrap();
    let search = open_search(std::slice::from_ref(&server)).await;
    search.close();

    assert!(matches!(search.start().await, Err(SearchError::Closed)));
    assert!(matches!(search.stop().await, Err(SearchError::Closed)));
    assert!(matches!(
        search.next_result().await,
        Err(SearchError::Closed)
    ));
    assert!(matches!(
        search.statistics().await,
        Err(SearchError::Closed)
    ));
    assert!(matches!(search.pause().await, Err(SearchError::Closed)));
    assert!(matches!(
        search
            .merge_session_variables(SessionVariables::new(), |_, g, l| g + l)
            .await,
        Err(SearchError::Closed)
    ));
    search.close();
}

#[tokio::test]
async fn failed_start_closes_the_whole_session() {
    let mut failing = MockServerConfig::default();
    failing.fail_command = Some((
        seine_wire::proto::command::START_SEARCH,
        Status::Failure.code(),
    ));
    let servers = [
        MockSearchServer::spawn_with_config(failing).await.unwrap(),
        MockSearchServer::spawn().await.unwrap(),
    ];
    let bad_host = servers[0].host().to_string();

    let search = open_search(&servers).await;
    let err = search.start().await.unwrap_err();
    match err {
        SearchError::Rpc { host, status } => {
            assert_eq!(host, bad_host);
            assert_eq!(status, Status::Failure);
        }
        other => panic!("expected Rpc failure, got {other:?}"),
    }
    assert!(search.is_closed());
}

#[tokio::test]
async fn setup_delivers_scope_filters_and_push_attributes() {
    let server = MockSearchServer::spawn().await.unwrap();
    let _search = open_search(std::slice::from_ref(&server)).await;

    let scope = server.state().scope().expect("scope was delivered");
    assert!(scope.contains("BEGIN OPENDIAMOND SCOPECOOKIE"));

    let filters = server.state().filters();
    assert_eq!(filters.len(), 1);
    assert_eq!(filters[0].name, "edges");
    assert_eq!(filters[0].min_score, 0.5);

    assert_eq!(server.state().push_attributes(), ["_ObjectID"]);
}

#[tokio::test]
async fn credits_flow_back_one_per_object() {
    let mut config = MockServerConfig::default();
    config.blast_objects = vec![push_object("a"), push_object("b"), push_object("c")];
    let server = MockSearchServer::spawn_with_config(config).await.unwrap();

    let search = open_search(std::slice::from_ref(&server)).await;
    search.start().await.unwrap();
    let mut count = 0;
    while search.next_result().await.unwrap().is_some() {
        count += 1;
    }
    assert_eq!(count, 3);
    // One credit per pushed object, including the end-of-stream marker.
    wait_until(|| server.state().credits() == 4).await;
}

#[tokio::test]
async fn reexecute_asks_the_origin_host() {
    let mut config = MockServerConfig::default();
    config.blast_objects = vec![push_object("obj-7")];
    let server = MockSearchServer::spawn_with_config(config).await.unwrap();

    let search = open_search(std::slice::from_ref(&server)).await;
    search.start().await.unwrap();

    let result = search.next_result().await.unwrap().expect("one result");
    let id = result.identifier().expect("object carries an identity");
    let attrs = search.reexecute(&id).await.unwrap();
    assert_eq!(attrs["reexecuted"], b"obj-7".to_vec());
}

#[tokio::test]
async fn stop_leaves_the_session_usable_for_statistics() {
    let server = MockSearchServer::spawn().await.unwrap();
    let search = open_search(std::slice::from_ref(&server)).await;
    search.start().await.unwrap();
    search.stop().await.unwrap();

    // The session is still open for post-search bookkeeping.
    assert!(!search.is_closed());
    assert_eq!(search.statistics().await.unwrap().len(), 1);
    let chars = search.characteristics().await.unwrap();
    assert_eq!(chars.values().next().unwrap().device_name, "mock-device");
    search.close();
}

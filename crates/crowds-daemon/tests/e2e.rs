//! End-to-end tests for crowds-daemon.
//!
//! Runs a real directory and real forwarders on ephemeral loopback ports and
//! drives them through joins, relayed DATA, votes and failure paths.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crowds_core::protocol::parse_result_line;
use crowds_core::{Bias, Hop, Message, MessageType, Node, RelayPolicy};
use crowds_daemon::transport::{self, LineConnection};
use crowds_daemon::{Directory, Forwarder, ForwarderEvent, JoinError, Server, ShutdownHandle};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(10);

// ============================================================================
// Helpers
// ============================================================================

struct RunningDirectory {
    directory: Arc<Directory>,
    node: Node,
    shutdown: ShutdownHandle,
    task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

struct RunningForwarder {
    forwarder: Arc<Forwarder>,
    node: Node,
}

async fn start_directory() -> RunningDirectory {
    let server = Server::bind("127.0.0.1", 0, 4).await.expect("Failed to bind");
    let port = server.local_addr().expect("Failed to get local addr").port();
    let node = Node::new("127.0.0.1", port);
    let directory = Arc::new(Directory::new(node.clone()));
    let shutdown = server.shutdown_handle();
    let task = tokio::spawn(server.run(Arc::clone(&directory)));
    RunningDirectory {
        directory,
        node,
        shutdown,
        task,
    }
}

async fn start_forwarder(directory: &Node, bias: u8) -> RunningForwarder {
    let server = Server::bind("127.0.0.1", 0, 4).await.expect("Failed to bind");
    let port = server.local_addr().expect("Failed to get local addr").port();
    let node = Node::new("127.0.0.1", port);
    let policy = RelayPolicy::new(Bias::new(bias).unwrap(), false);

    let forwarder = Forwarder::join(node.clone(), directory.clone(), policy)
        .await
        .expect("Failed to join");
    let forwarder = Arc::new(forwarder);
    tokio::spawn(server.run(Arc::clone(&forwarder)));
    RunningForwarder { forwarder, node }
}

/// Directory plus three forwarders joined one after another.
async fn start_overlay(bias: u8) -> (RunningDirectory, Vec<RunningForwarder>) {
    let directory = start_directory().await;
    let mut forwarders = Vec::new();
    for _ in 0..3 {
        forwarders.push(start_forwarder(&directory.node, bias).await);
    }
    for f in &forwarders {
        wait_until(|| f.forwarder.member_count() == 2).await;
    }
    (directory, forwarders)
}

/// Poll until `condition` holds, failing the test after `WAIT`.
async fn wait_until(condition: impl Fn() -> bool) {
    timeout(WAIT, async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("Timed out waiting for condition");
}

/// Wait for the first event matching `pick`.
async fn next_event<T>(
    events: &mut broadcast::Receiver<ForwarderEvent>,
    pick: impl Fn(ForwarderEvent) -> Option<T>,
) -> T {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("Event channel closed");
            if let Some(found) = pick(event) {
                return found;
            }
        }
    })
    .await
    .expect("Timed out waiting for event")
}

// ============================================================================
// Membership
// ============================================================================

#[tokio::test]
async fn test_three_forwarders_see_each_other() {
    let (directory, forwarders) = start_overlay(66).await;

    assert_eq!(directory.directory.member_count(), 3);
    for f in &forwarders {
        let members = f.forwarder.members();
        assert_eq!(members.len(), 2);
        assert!(!members.contains(&f.node), "{} stored itself", f.node);
        for other in &forwarders {
            if other.node != f.node {
                assert!(members.contains(&other.node));
            }
        }
    }
}

#[tokio::test]
async fn test_duplicate_join_is_welcomed_but_not_added() {
    let (directory, forwarders) = start_overlay(66).await;
    let existing = &forwarders[0].node;

    let reply = transport::request(
        directory.node.address(),
        directory.node.port(),
        &Message::hello(existing),
    )
    .await
    .unwrap();

    match reply {
        Some(Message::Welcome { routing_table }) => assert_eq!(routing_table.len(), 3),
        other => panic!("Expected WELCOME, got {:?}", other),
    }
    assert_eq!(directory.directory.member_count(), 3);

    // No one was told about the duplicate.
    sleep(Duration::from_millis(100)).await;
    for f in &forwarders {
        assert_eq!(f.forwarder.member_count(), 2);
    }
}

#[tokio::test]
async fn test_late_joiner_receives_full_table() {
    let (directory, forwarders) = start_overlay(66).await;
    let late = start_forwarder(&directory.node, 66).await;

    assert_eq!(late.forwarder.member_count(), 3);
    for f in &forwarders {
        wait_until(|| f.forwarder.member_count() == 3).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_joins_reach_every_member() {
    const JOINERS: usize = 12;
    let directory = start_directory().await;

    let mut joins = tokio::task::JoinSet::new();
    for _ in 0..JOINERS {
        let directory_node = directory.node.clone();
        joins.spawn(async move { start_forwarder(&directory_node, 66).await });
    }
    let mut forwarders = Vec::new();
    while let Some(joined) = joins.join_next().await {
        forwarders.push(joined.expect("Join task panicked"));
    }

    assert_eq!(directory.directory.member_count(), JOINERS);
    let everyone = directory.directory.members();
    for f in &forwarders {
        wait_until(|| f.forwarder.member_count() == JOINERS - 1).await;
        let members = f.forwarder.members();
        assert!(!members.contains(&f.node), "{} stored itself", f.node);
        for member in &members {
            assert!(everyone.contains(member));
        }
    }
}

// ============================================================================
// DATA relay
// ============================================================================

#[tokio::test]
async fn test_direct_relay_delivers_in_one_hop() {
    let (_directory, forwarders) = start_overlay(0).await;
    let (a, b, c) = (&forwarders[0], &forwarders[1], &forwarders[2]);

    let hop = a
        .forwarder
        .send_data(c.node.address(), c.node.port(), "hello")
        .await
        .expect("DATA should be acknowledged");

    assert_eq!(
        hop,
        Hop::Direct {
            address: c.node.address().to_string(),
            port: c.node.port()
        }
    );
    // The ACK came from C itself, so delivery already happened.
    assert_eq!(c.forwarder.session().delivered(), vec!["hello"]);
    assert!(b.forwarder.session().delivered().is_empty());
    assert!(a.forwarder.session().delivered().is_empty());
}

#[tokio::test]
async fn test_random_relay_eventually_delivers() {
    let (_directory, forwarders) = start_overlay(66).await;
    let (a, c) = (&forwarders[0], &forwarders[2]);
    let mut events = c.forwarder.subscribe();

    for i in 0..5 {
        let payload = format!("message {i}");
        let hop = a
            .forwarder
            .send_data(c.node.address(), c.node.port(), &payload)
            .await
            .expect("DATA should be acknowledged");
        assert!(matches!(hop, Hop::Random(_) | Hop::Direct { .. }), "got {hop}");

        let delivered = next_event(&mut events, |event| match event {
            ForwarderEvent::Delivered { data } => Some(data),
            _ => None,
        })
        .await;
        assert_eq!(delivered, payload);
    }
}

#[tokio::test]
async fn test_relayed_data_is_acked_by_next_hop() {
    let (_directory, forwarders) = start_overlay(66).await;
    let b = &forwarders[1];
    let c = &forwarders[2];

    // Hand DATA to B as if B were an intermediate hop.
    let reply = transport::request(
        b.node.address(),
        b.node.port(),
        &Message::data(c.node.address(), c.node.port(), "via b"),
    )
    .await
    .unwrap();

    match reply {
        Some(Message::Ack { src_addr, src_port }) => assert!(b.node.is_at(&src_addr, src_port)),
        other => panic!("Expected ACK, got {:?}", other),
    }
    wait_until(|| c.forwarder.session().delivered() == vec!["via b"]).await;
}

// ============================================================================
// Voting
// ============================================================================

#[tokio::test]
async fn test_vote_cast_and_results() {
    let (directory, forwarders) = start_overlay(66).await;
    let (a, b) = (&forwarders[0], &forwarders[1]);
    let mut a_events = a.forwarder.subscribe();

    let vote = directory
        .directory
        .create_and_broadcast_vote("Pick a color", vec!["red".into(), "blue".into()])
        .await
        .unwrap();
    for f in &forwarders {
        wait_until(|| f.forwarder.session().current_vote().is_some()).await;
        assert_eq!(f.forwarder.session().current_vote().unwrap().vote_id, vote.vote_id);
    }

    let (red, _) = a.forwarder.cast_vote(1).await.unwrap();
    let (blue, _) = b.forwarder.cast_vote(2).await.unwrap();
    assert_eq!(red.selection.as_deref(), Some("red"));
    assert_eq!(blue.selection.as_deref(), Some("blue"));
    assert_eq!(a.forwarder.session().cast_selection(&vote.vote_id).as_deref(), Some("red"));

    wait_until(|| directory.directory.results(&vote.vote_id).len() == 2).await;

    a.forwarder.query_results(&vote.vote_id).await.unwrap();
    let results = next_event(&mut a_events, |event| match event {
        ForwarderEvent::ResultsReceived { vote_id, results } if vote_id == vote.vote_id => {
            Some(results)
        }
        _ => None,
    })
    .await;

    let counts: BTreeMap<String, u64> = results
        .iter()
        .filter_map(|line| parse_result_line(line))
        .collect();
    let expected: BTreeMap<String, u64> = [("red".to_string(), 1), ("blue".to_string(), 1)].into();
    assert_eq!(counts, expected);
    assert_eq!(a.forwarder.session().results(&vote.vote_id), Some(results));
}

#[tokio::test]
async fn test_results_for_unknown_vote_are_empty() {
    let (_directory, forwarders) = start_overlay(66).await;
    let a = &forwarders[0];
    let mut events = a.forwarder.subscribe();

    a.forwarder.query_results("no-such-vote").await.unwrap();
    let results = next_event(&mut events, |event| match event {
        ForwarderEvent::ResultsReceived { results, .. } => Some(results),
        _ => None,
    })
    .await;
    assert!(results.is_empty());
}

// ============================================================================
// Failure paths
// ============================================================================

#[tokio::test]
async fn test_malformed_message_closed_without_reply() {
    let directory = start_directory().await;

    let mut stream = TcpStream::connect(("127.0.0.1", directory.node.port())).await.unwrap();
    stream.write_all(b"{\"type\":\"HELLO\",\"srcAddr\":\"127.0.0.1\"}\n").await.unwrap();
    let mut conn = LineConnection::new(stream);
    let reply = timeout(WAIT, conn.recv()).await.expect("Timed out");
    assert!(matches!(reply, Ok(None)), "got {:?}", reply);

    // The directory keeps serving.
    assert_eq!(directory.directory.member_count(), 0);
    start_forwarder(&directory.node, 66).await;
    assert_eq!(directory.directory.member_count(), 1);
}

#[tokio::test]
async fn test_join_fails_when_directory_unreachable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let result = Forwarder::join(
        Node::new("127.0.0.1", 6999),
        Node::new("127.0.0.1", port),
        RelayPolicy::default(),
    )
    .await;
    assert!(matches!(result, Err(JoinError::Connect { .. })));
}

#[tokio::test]
async fn test_join_fails_on_non_welcome_reply() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = LineConnection::new(stream);
        let _hello = conn.recv().await.unwrap();
        conn.send(&Message::ack(&Node::new("127.0.0.1", port))).await.unwrap();
    });

    let result = Forwarder::join(
        Node::new("127.0.0.1", 6999),
        Node::new("127.0.0.1", port),
        RelayPolicy::default(),
    )
    .await;
    assert!(matches!(result, Err(JoinError::UnexpectedReply(MessageType::Ack))));
}

#[tokio::test]
async fn test_join_fails_when_directory_hangs_up() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = LineConnection::new(stream);
        let _hello = conn.recv().await.unwrap();
        conn.shutdown().await;
    });

    let result = Forwarder::join(
        Node::new("127.0.0.1", 6999),
        Node::new("127.0.0.1", port),
        RelayPolicy::default(),
    )
    .await;
    assert!(matches!(result, Err(JoinError::Closed(_))));
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_directory_shutdown_drains() {
    let directory = start_directory().await;
    start_forwarder(&directory.node, 66).await;

    directory.shutdown.shutdown();
    timeout(WAIT, directory.task)
        .await
        .expect("Server did not stop")
        .unwrap()
        .unwrap();

    let result = Forwarder::join(
        Node::new("127.0.0.1", 6998),
        directory.node.clone(),
        RelayPolicy::default(),
    )
    .await;
    assert!(matches!(result, Err(JoinError::Connect { .. })));
}

//! End-to-end scenarios mirroring the specification's numbered
//! walkthroughs: concurrent inserts, right-to-left regex replacement,
//! rate-limited burst ordering, streaming macros interleaved with remote
//! edits, stale recovery, and undo grouping.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use edison_collab_client::ot_client::Collaborators;
use edison_collab_client::{CoreResult, OtClient, SessionClient, SessionConfig, TextOperation, Transport};
use edison_collab_client::transport::{InboundMessage, TransportEvent};
use edison_collab_client::session::LifecycleEvent;
use serde_json::Value;
use tokio::sync::mpsc;

/// Records every effect instead of performing real I/O, mirroring the
/// dependency-injection approach used throughout this crate's own tests.
#[derive(Default)]
struct RecordingCollaborators {
    sent: Vec<(u64, TextOperation)>,
    applied: Vec<TextOperation>,
    requested: Vec<(u64, u64)>,
}

impl Collaborators for RecordingCollaborators {
    fn send_operation(&mut self, revision: u64, op: &TextOperation) {
        self.sent.push((revision, op.clone()));
    }
    fn apply_operation(&mut self, op: &TextOperation) {
        self.applied.push(op.clone());
    }
    fn get_operations(&mut self, base: u64, head: u64) {
        self.requested.push((base, head));
    }
}

/// Scenario 1: concurrent insert at the same position, left-hand tie-break.
#[test]
fn concurrent_insert_at_same_position() {
    let mut replica = "hello world".to_string();
    let mut fsm = OtClient::new(0);
    let mut collab = RecordingCollaborators::default();

    let mut local = TextOperation::new();
    local.retain(5).insert("X").retain(6);
    replica = local.apply(&replica).unwrap();
    fsm.apply_client(local.clone(), &mut collab).unwrap();
    assert_eq!(replica, "helloX world");
    assert!(!fsm.is_synchronized());

    let mut remote = TextOperation::new();
    remote.retain(5).insert("Y").retain(6);
    fsm.apply_server(1, remote.clone(), &mut collab).unwrap();

    // The transformed remote op is what actually lands on the replica;
    // apply_server already recorded it via `apply_operation`.
    let transformed_remote = collab.applied.last().cloned().unwrap();
    replica = transformed_remote.apply(&replica).unwrap();
    assert_eq!(replica, "helloXY world");

    fsm.server_ack(2, &mut collab).unwrap();
    assert!(fsm.is_synchronized());
    assert_eq!(replica, "helloXY world");
}

/// Scenario 5: an ack arrives far ahead of the outstanding revision,
/// forcing a Stale -> get_operations -> AwaitingConfirm recovery.
#[test]
fn stale_recovery_via_get_operations() {
    let mut fsm = OtClient::new(5);
    let mut collab = RecordingCollaborators::default();

    let mut local = TextOperation::new();
    local.retain(3).insert("!").retain(2);
    fsm.apply_client(local, &mut collab).unwrap();
    assert!(!fsm.is_synchronized());

    fsm.server_ack(8, &mut collab).unwrap();
    assert_eq!(collab.requested, vec![(5, 8)]);
    assert!(!fsm.is_synchronized());

    let mut op6 = TextOperation::new();
    op6.retain(5);
    let mut op7 = TextOperation::new();
    op7.retain(5);
    let mut op8 = TextOperation::new();
    op8.retain(5);
    fsm.apply_operations(8, vec![op6, op7, op8], &mut collab).unwrap();

    assert_eq!(fsm.revision(), 8);
}

struct FakeTransport {
    inbound: mpsc::UnboundedReceiver<TransportEvent>,
    outbox: Vec<(String, Vec<Value>)>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn emit(&mut self, event: &str, args: Vec<Value>) -> CoreResult<()> {
        self.outbox.push((event.to_string(), args));
        Ok(())
    }
    async fn next_event(&mut self) -> Option<TransportEvent> {
        self.inbound.recv().await
    }
    async fn disconnect(&mut self, _intentional: bool) {}
    async fn reconnect(&mut self) -> CoreResult<()> {
        Ok(())
    }
}

async fn ready_session(content: &str) -> (SessionClient, mpsc::UnboundedSender<TransportEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = SessionClient::new(
        Box::new(FakeTransport { inbound: rx, outbox: Vec::new() }),
        SessionConfig::default(),
    );
    let mut lifecycle = session.subscribe_lifecycle();
    let run_session = session.clone();
    tokio::spawn(async move {
        let _ = run_session.run().await;
    });

    tx.send(TransportEvent::Message(InboundMessage {
        event: "doc".to_string(),
        args: vec![serde_json::json!({"str": content, "revision": 0})],
    }))
    .unwrap();
    loop {
        match lifecycle.recv().await {
            Ok(LifecycleEvent::Ready) => break,
            Ok(_) => continue,
            Err(_) => panic!("session closed before ready"),
        }
    }
    tx.send(TransportEvent::Message(InboundMessage {
        event: "permission".to_string(),
        args: vec![serde_json::json!({"permission": "freely"})],
    }))
    .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    session.set_logged_in(true).await;
    (session, tx)
}

/// Scenario 2: replace-regex right-to-left preserves earlier match
/// positions.
#[tokio::test]
async fn replace_regex_right_to_left_preserves_positions() {
    let (session, _tx) = ready_session("a1 b2 c3").await;
    let pattern = regex::Regex::new(r"\d").unwrap();
    session
        .replace_regex(&pattern, |caps: &regex::Captures| {
            let n: i32 = caps.get(0).unwrap().as_str().parse().unwrap();
            (n + 10).to_string()
        })
        .await
        .unwrap();
    let (doc, _) = session.document_snapshot().await;
    assert_eq!(doc, "a11 b12 c13");
}

/// Scenario 3: a rate-limited burst of inserts reaches the FSM in
/// submission order and the final replica reflects all four edits.
#[tokio::test]
async fn rate_limited_burst_preserves_order() {
    use edison_collab_client::config::RateLimitConfig;

    let mut config = SessionConfig::default();
    config.rate_limit = RateLimitConfig {
        min_interval: Duration::from_millis(50),
        max_burst: 2,
        burst_window: Duration::from_secs(1),
        enabled: true,
    };
    let (tx, rx) = mpsc::unbounded_channel();
    let session = SessionClient::new(
        Box::new(FakeTransport { inbound: rx, outbox: Vec::new() }),
        config,
    );
    let mut lifecycle = session.subscribe_lifecycle();
    let run_session = session.clone();
    tokio::spawn(async move {
        let _ = run_session.run().await;
    });
    tx.send(TransportEvent::Message(InboundMessage {
        event: "doc".to_string(),
        args: vec![serde_json::json!({"str": "", "revision": 0})],
    }))
    .unwrap();
    loop {
        match lifecycle.recv().await {
            Ok(LifecycleEvent::Ready) => break,
            Ok(_) => continue,
            Err(_) => panic!("session closed before ready"),
        }
    }
    tx.send(TransportEvent::Message(InboundMessage {
        event: "permission".to_string(),
        args: vec![serde_json::json!({"permission": "freely"})],
    }))
    .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    session.set_logged_in(true).await;

    session.insert(0, "A").await.unwrap();
    session.insert(1, "B").await.unwrap();
    session.insert(2, "C").await.unwrap();
    session.insert(3, "D").await.unwrap();

    tokio::time::sleep(Duration::from_millis(400)).await;
    let (doc, _) = session.document_snapshot().await;
    assert_eq!(doc, "ABCD");
}

/// Scenario 4, cursor math: a remote insert of length 7 landing before a
/// streaming macro's tracked position shifts that position by exactly its
/// inserted length, so subsequent streamed lines land at the correct
/// offset.
#[test]
fn streaming_cursor_position_shifts_by_remote_insert_length() {
    let mut remote = TextOperation::new();
    remote.retain(10).insert("REMOTE ").retain(10);
    let shifted = TextOperation::transform_position(20, &remote, true);
    assert_eq!(shifted, 27);
}

/// Scenario 4, end to end: a streaming exec macro's subprocess output is
/// deleted-then-inserted contiguously at the trigger's location.
#[tokio::test]
async fn streaming_macro_inserts_output_contiguously() {
    use edison_collab_client::macros::{
        MacroEngine, ProcessSpawner, SpawnedProcess, StreamingCallbacks, StreamMatch,
    };

    struct FakeProcess {
        chunks: Vec<Vec<u8>>,
    }

    #[async_trait]
    impl SpawnedProcess for FakeProcess {
        async fn read_chunk(&mut self) -> Option<Vec<u8>> {
            if self.chunks.is_empty() {
                None
            } else {
                Some(self.chunks.remove(0))
            }
        }
        async fn kill(&mut self) {}
    }

    struct FakeSpawner;

    #[async_trait]
    impl ProcessSpawner for FakeSpawner {
        async fn spawn(&self, _command: &str) -> CoreResult<Box<dyn SpawnedProcess>> {
            Ok(Box::new(FakeProcess {
                chunks: vec![b"one\n".to_vec(), b"two\n".to_vec(), b"three\n".to_vec()],
            }))
        }
    }

    let (session, _tx) = ready_session("before trigger after").await;
    let engine = MacroEngine::with_spawner(session.clone(), Arc::new(FakeSpawner));
    let pattern = regex::Regex::new("trigger").unwrap();
    engine
        .add_streaming_exec_macro(
            "gen",
            pattern,
            Arc::new(|_m: &StreamMatch| "produce".to_string()),
            true,
            false,
            false,
            StreamingCallbacks::default(),
        )
        .await;
    engine.expand().await;
    engine.wait_for_streams().await;

    let (doc, _) = session.document_snapshot().await;
    assert_eq!(doc, "before one\ntwo\nthree\n after");
}

/// Scenario 6: three edits within the undo-group interval collapse into a
/// single undo entry; a later edit starts a new one.
#[tokio::test]
async fn undo_groups_rapid_edits_into_one_entry() {
    let (session, _tx) = ready_session("").await;

    session.insert(0, "a").await.unwrap();
    session.insert(1, "b").await.unwrap();
    session.insert(2, "c").await.unwrap();

    assert!(session.can_undo().await);
    session.undo().await.unwrap();
    let (doc, _) = session.document_snapshot().await;
    assert_eq!(doc, "");
    assert!(!session.can_undo().await);

    session.redo().await.unwrap();
    let (doc, _) = session.document_snapshot().await;
    assert_eq!(doc, "abc");
}

use std::time::Duration;

use mcp_bridge_error::BridgeError;
use mcp_session_bridge::config::BridgeConfig;
use mcp_session_bridge::launch::LaunchSpec;
use mcp_session_bridge::registry::SessionRegistry;
use mcp_session_bridge::session::SessionState;
use serde_json::{json, Value};

fn mock_worker() -> LaunchSpec {
    LaunchSpec::from_command_line(&[env!("CARGO_BIN_EXE_mock-mcp-worker").to_string()])
        .expect("launch spec")
}

fn config(idle: Duration, lifetime: Duration) -> BridgeConfig {
    BridgeConfig {
        session_idle_timeout: idle,
        session_max_lifetime: lifetime,
        request_timeout: Duration::from_secs(30),
        ..BridgeConfig::default()
    }
}

fn hang(id: u64) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": "tools/call",
        "params": {"name": "hang"}
    })
}

async fn wait_until_empty(registry: &SessionRegistry, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if registry.is_empty().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    registry.is_empty().await
}

#[tokio::test]
async fn idle_session_is_evicted() {
    let registry = SessionRegistry::new(
        mock_worker(),
        config(Duration::from_millis(300), Duration::from_secs(60)),
    );
    let session = registry.resolve("idle").await.expect("resolve");
    assert_eq!(registry.len().await, 1);

    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(registry.is_empty().await);
    assert!(session.is_destroyed());
}

#[tokio::test]
async fn activity_pushes_the_idle_deadline_out() {
    let registry = SessionRegistry::new(
        mock_worker(),
        config(Duration::from_millis(500), Duration::from_secs(60)),
    );
    let first = registry.resolve("busy").await.expect("resolve");
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let again = registry.resolve("busy").await.expect("resolve again");
        assert_eq!(first.pid(), again.pid());
    }
    assert_eq!(registry.len().await, 1, "activity kept the session alive");

    assert!(wait_until_empty(&registry, Duration::from_secs(2)).await);
}

#[tokio::test]
async fn max_lifetime_evicts_an_active_session() {
    let registry = SessionRegistry::new(
        mock_worker(),
        config(Duration::from_secs(60), Duration::from_millis(500)),
    );
    let session = registry.resolve("aging").await.expect("resolve");
    let pending = session
        .submit(&json!(1), "tools/call", Duration::from_secs(30), &hang(1))
        .await
        .expect("submit");

    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if !session.is_destroyed() {
            let _ = registry.resolve("aging").await;
        }
    }

    let outcome = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("completion delivered")
        .expect("sender kept");
    match outcome {
        Err(BridgeError::SessionTerminated { reason }) => {
            assert_eq!(reason, "max lifetime reached")
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert!(wait_until_empty(&registry, Duration::from_secs(1)).await);
}

#[tokio::test]
async fn evict_fails_every_pending_request_once() {
    let registry = SessionRegistry::new(
        mock_worker(),
        config(Duration::from_secs(60), Duration::from_secs(60)),
    );
    let session = registry.resolve("doomed").await.expect("resolve");

    let mut receivers = Vec::new();
    for id in 1..=3 {
        receivers.push(
            session
                .submit(&json!(id), "tools/call", Duration::from_secs(30), &hang(id))
                .await
                .expect("submit"),
        );
    }
    assert_eq!(session.pending_count(), 3);

    assert!(registry.evict("doomed", "test eviction").await);
    assert!(!registry.evict("doomed", "test eviction").await);

    for receiver in receivers {
        match receiver.await.expect("sender kept") {
            Err(BridgeError::SessionTerminated { reason }) => assert_eq!(reason, "test eviction"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert_eq!(session.pending_count(), 0);
    assert_eq!(session.state(), SessionState::Destroyed);

    let refused = session
        .submit(&json!(9), "tools/call", Duration::from_secs(30), &hang(9))
        .await;
    assert!(matches!(refused, Err(BridgeError::SessionTerminated { .. })));
}

#[tokio::test]
async fn recreated_session_gets_a_fresh_worker() {
    let registry = SessionRegistry::new(
        mock_worker(),
        config(Duration::from_secs(60), Duration::from_secs(60)),
    );
    let first = registry.resolve("phoenix").await.expect("resolve");
    let first_pid = first.pid();
    assert!(registry.evict("phoenix", "test eviction").await);

    let second = registry.resolve("phoenix").await.expect("resolve again");
    assert_ne!(first_pid, second.pid());
    assert!(second.is_process_alive());
    assert_eq!(second.state(), SessionState::New);
}

#[tokio::test]
async fn worker_exit_evicts_and_terminates_pending() {
    let registry = SessionRegistry::new(
        mock_worker(),
        config(Duration::from_secs(60), Duration::from_secs(60)),
    );
    let session = registry.resolve("crash").await.expect("resolve");
    let pending = session
        .submit(&json!(3), "tools/call", Duration::from_secs(30), &hang(3))
        .await
        .expect("submit hang");
    let exiting = session
        .submit(
            &json!(4),
            "mock/exit",
            Duration::from_secs(30),
            &json!({"jsonrpc": "2.0", "id": 4, "method": "mock/exit"}),
        )
        .await
        .expect("submit exit");

    for receiver in [pending, exiting] {
        let outcome = tokio::time::timeout(Duration::from_secs(3), receiver)
            .await
            .expect("completion delivered")
            .expect("sender kept");
        match outcome {
            Err(BridgeError::SessionTerminated { reason }) => assert_eq!(reason, "process exited"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
    assert!(wait_until_empty(&registry, Duration::from_secs(1)).await);
    assert!(!session.is_process_alive());
}

#[tokio::test]
async fn request_round_trip_and_timeout_through_a_session() {
    let registry = SessionRegistry::new(
        mock_worker(),
        config(Duration::from_secs(60), Duration::from_secs(60)),
    );
    let session = registry.resolve("rpc").await.expect("resolve");

    let echo = session
        .submit(
            &json!("a"),
            "mock/ping",
            Duration::from_secs(5),
            &json!({"jsonrpc": "2.0", "id": "a", "method": "mock/ping", "params": {"x": 1}}),
        )
        .await
        .expect("submit")
        .await
        .expect("sender kept")
        .expect("response");
    assert_eq!(echo["id"], "a");
    assert_eq!(echo["result"]["echoed"]["params"]["x"], 1);

    let timed_out = session
        .submit(&json!(2), "tools/call", Duration::from_millis(200), &hang(2))
        .await
        .expect("submit")
        .await
        .expect("sender kept");
    match timed_out {
        Err(BridgeError::RequestTimeout { method, timeout, .. }) => {
            assert_eq!(method, "tools/call");
            assert_eq!(timeout, Duration::from_millis(200));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(session.pending_count(), 0);
    assert!(session.is_process_alive());
}

#[tokio::test]
async fn worker_notifications_reach_the_attached_stream() {
    use futures::StreamExt;
    use mcp_session_bridge::sink::SinkEvent;

    let registry = SessionRegistry::new(
        mock_worker(),
        config(Duration::from_secs(60), Duration::from_secs(60)),
    );
    let session = registry.resolve("stream").await.expect("resolve");
    let mut events = session.attach_sink();

    match events.next().await {
        Some(SinkEvent::Comment(text)) => assert_eq!(text, "Connected to session stream"),
        other => panic!("unexpected event: {other:?}"),
    }

    session
        .submit(
            &json!(1),
            "mock/notify",
            Duration::from_secs(5),
            &json!({"jsonrpc": "2.0", "id": 1, "method": "mock/notify", "params": {"k": "v"}}),
        )
        .await
        .expect("submit")
        .await
        .expect("sender kept")
        .expect("response");

    match tokio::time::timeout(Duration::from_secs(2), events.next()).await {
        Ok(Some(SinkEvent::Message(message))) => {
            assert_eq!(message["method"], "mock/event");
            assert_eq!(message["params"]["k"], "v");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    assert!(registry.evict("stream", "test eviction").await);
    let rest = tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .expect("stream ends after eviction");
    assert!(rest.is_none());
}

#[tokio::test]
async fn shutdown_evicts_everything_and_refuses_new_sessions() {
    let registry = SessionRegistry::start(
        mock_worker(),
        config(Duration::from_secs(60), Duration::from_secs(60)),
    );
    let a = registry.resolve("a").await.expect("resolve a");
    let b = registry.resolve("b").await.expect("resolve b");
    assert_eq!(registry.len().await, 2);

    registry.shutdown().await;
    registry.shutdown().await;

    assert!(registry.is_empty().await);
    assert!(a.is_destroyed() && b.is_destroyed());
    match registry.resolve("c").await {
        Err(BridgeError::SessionTerminated { reason }) => assert_eq!(reason, "server shutdown"),
        Ok(_) => panic!("session created after shutdown"),
        Err(other) => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn debug_snapshot_lists_pending_requests() {
    let registry = SessionRegistry::new(
        mock_worker(),
        config(Duration::from_secs(60), Duration::from_secs(60)),
    );
    let session = registry.resolve("snap").await.expect("resolve");
    let _pending = session
        .submit(&json!(11), "tools/call", Duration::from_secs(30), &hang(11))
        .await
        .expect("submit");

    let snapshot = registry.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    let (id, info) = &snapshot[0];
    assert_eq!(id, "snap");
    assert!(info.process_alive);
    assert_eq!(info.pid, session.pid());
    assert_eq!(info.pending_requests.len(), 1);
    assert_eq!(info.pending_requests[0].id, json!(11));
    assert_eq!(info.pending_requests[0].method, "tools/call");
    assert!(!info.has_sse_connection);
}

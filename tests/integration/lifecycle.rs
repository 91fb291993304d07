use crate::*;

use ferry_core::model::{ContentRef, SessionStatus};

const T: Duration = Duration::from_secs(20);

async fn completed_transfer(a: &Node, b: &Node) -> TransferSession {
    let file = a.source("done.txt", b"finished business");
    let session = a.send(b.peer_ref(), vec![file]);
    wait_for("completion", T, || {
        a.sessions.get(&session.id).unwrap().status == SessionStatus::Completed
    })
    .await
    .unwrap();
    session
}

/// Cleanup removes finished sessions once; running it again is a no-op.
#[tokio::test]
async fn test_cleanup_is_idempotent() {
    let a = Node::start("a").await;
    let b = Node::start("b").await;
    let done = completed_transfer(&a, &b).await;
    let unsent = a
        .sessions
        .create_outbound(b.peer_ref(), vec![a.source("later.txt", b"x")], None)
        .unwrap();

    assert_eq!(a.sessions.cleanup(Duration::ZERO), 1);
    assert_eq!(a.sessions.cleanup(Duration::ZERO), 0);
    assert!(a.sessions.get(&done.id).is_none());
    assert!(a.sessions.get(&unsent.id).is_some());

    // Gone from disk too.
    let root = a.stop();
    let a = Node::start_at("a", root, NodeOptions::default()).await;
    assert!(a.sessions.get(&done.id).is_none());
    assert!(a.sessions.get(&unsent.id).is_some());
}

/// Retention keeps recent sessions.
#[tokio::test]
async fn test_cleanup_respects_age() {
    let a = Node::start("a").await;
    let b = Node::start("b").await;
    let done = completed_transfer(&a, &b).await;

    assert_eq!(a.sessions.cleanup(Duration::from_secs(3600)), 0);
    assert!(a.sessions.get(&done.id).is_some());
}

/// A receiver that paused its session refuses the sender's connection.
#[tokio::test]
async fn test_paused_receiver_refuses_transfer() {
    let a = Node::start_with(
        "a",
        NodeOptions {
            max_attempts: 1,
            ..Default::default()
        },
    )
    .await;
    let b = Node::start("b").await;
    let file = a.source("held.txt", b"wait for it");

    let mut expected = file.clone();
    expected.content = ContentRef::new(b.downloads().join("held.txt"));
    let waiting = b.sessions.create_inbound(a.peer_ref(), expected).unwrap();
    b.sessions.start(&waiting.id).unwrap();
    b.sessions.pause(&waiting.id).unwrap();

    let session = a.send(b.peer_ref(), vec![file]);
    wait_for("sender failure", T, || {
        a.sessions.get(&session.id).unwrap().status == SessionStatus::Failed
    })
    .await
    .unwrap();

    let error = a.sessions.get(&session.id).unwrap().error.unwrap();
    assert!(error.contains("paused"), "error: {error}");
    assert_eq!(b.sessions.get(&waiting.id).unwrap().status, SessionStatus::Paused);
    assert!(!b.downloads().join("held.txt").exists());
}

/// Cancelling a running session aborts it and releases its chunks.
#[tokio::test]
async fn test_cancel_running_session() {
    let a = Node::start_with(
        "a",
        NodeOptions {
            chunk_size: Some(1024),
            idle_timeout: Duration::from_secs(30),
            ..Default::default()
        },
    )
    .await;
    let receiver = ScriptedReceiver::start(Vec::new(), Box::new(|_, index| index == 1)).await;

    let file = a.source("big.bin", &patterned(4096));
    let file_id = file.id.clone();
    let session = a.send(receiver.peer_ref(), vec![file]);
    wait_for("stalled chunk", T, || receiver.received().len() == 2)
        .await
        .unwrap();
    assert!(a.scheduler.is_running(&session.id));

    assert!(a.scheduler.cancel(&session.id));
    a.sessions.cancel(&session.id).unwrap();

    let cancelled = a.sessions.get(&session.id).unwrap();
    assert_eq!(cancelled.status, SessionStatus::Cancelled);
    assert!(!a.scheduler.is_running(&session.id));
    assert!(a.scheduler.queued().is_empty());
    assert!(!a.sessions.outbound_store().contains(&file_id));

    // Terminal sessions stay put.
    assert!(a.sessions.pause(&session.id).is_err());
    assert!(a.sessions.retry(&session.id).is_err());
}

use crate::*;

use ferry_core::model::SessionStatus;

const T: Duration = Duration::from_secs(20);

fn opts() -> NodeOptions {
    NodeOptions {
        chunk_size: Some(1024),
        ..Default::default()
    }
}

/// Leave an outbound session as a crash would: in progress, chunks 0 and 1
/// acknowledged, chunk 2 mid-flight.
fn interrupt(node: &Node, to: PeerRef, file: FileDescriptor) -> TransferSession {
    let session = node
        .sessions
        .create_outbound(to, vec![file.clone()], node.opts.chunk_size)
        .unwrap();
    node.sessions.start(&session.id).unwrap();
    node.sessions.mark_in_progress(&session.id).unwrap();

    let store = node.sessions.outbound_store();
    store.mark_completed(&file.id, 0).unwrap();
    store.mark_completed(&file.id, 1).unwrap();
    store.mark_in_progress(&file.id, 2).unwrap();
    session
}

/// After a restart with 2 of 5 chunks delivered, only chunks 2..=4 are sent.
#[tokio::test]
async fn test_restart_resumes_remaining_chunks() {
    let receiver = ScriptedReceiver::start(vec![0, 1], Box::new(|_, _| false)).await;

    let a = Node::start_with("a", opts()).await;
    let file = a.source("five.bin", &patterned(5000));
    let session = interrupt(&a, receiver.peer_ref(), file);
    let root = a.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let a = Node::start_at("a", root, opts()).await;
    let restored = a.sessions.get(&session.id).unwrap();
    assert_eq!(restored.status, SessionStatus::InProgress);

    let resumable = a.sessions.resume_interrupted();
    assert_eq!(resumable, vec![session.id.clone()]);
    assert_eq!(
        a.sessions.get(&session.id).unwrap().status,
        SessionStatus::Connecting
    );

    for id in resumable {
        a.scheduler.enqueue(&id);
    }
    wait_for("resumed completion", T, || {
        a.sessions.get(&session.id).unwrap().status == SessionStatus::Completed
    })
    .await
    .unwrap();

    assert_eq!(receiver.received(), vec![(0, 2), (0, 3), (0, 4)]);
}

/// A source that vanished while the endpoint was down cannot resume.
#[tokio::test]
async fn test_restart_with_missing_source_fails() {
    let receiver = ScriptedReceiver::start(Vec::new(), Box::new(|_, _| false)).await;

    let a = Node::start_with("a", opts()).await;
    let file = a.source("gone.bin", &patterned(5000));
    let path = file.content.path().to_path_buf();
    let session = interrupt(&a, receiver.peer_ref(), file);
    let root = a.stop();
    std::fs::remove_file(&path).unwrap();

    let a = Node::start_at("a", root, opts()).await;
    assert!(a.sessions.resume_interrupted().is_empty());

    let failed = a.sessions.get(&session.id).unwrap();
    assert_eq!(failed.status, SessionStatus::Failed);
    assert!(failed.error.unwrap().contains("no longer readable"));
    assert!(receiver.received().is_empty());
}

/// Pending sessions and the persisted work queue survive a restart.
#[tokio::test]
async fn test_queue_survives_restart() {
    let b = Node::start("b").await;

    let a = Node::start_with(
        "a",
        NodeOptions {
            run_scheduler: false,
            ..opts()
        },
    )
    .await;
    let file = a.source("later.bin", &patterned(4000));
    let session = a.send(b.peer_ref(), vec![file]);
    let root = a.stop();

    let a = Node::start_at("a", root, opts()).await;
    assert_eq!(a.scheduler.queued()[0].session_id, session.id);
    wait_for("completion after restart", T, || {
        a.sessions.get(&session.id).unwrap().status == SessionStatus::Completed
    })
    .await
    .unwrap();
    assert_eq!(read(&b.downloads().join("later.bin")), patterned(4000));
}

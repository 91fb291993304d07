use crate::*;

use ferry_core::model::SessionStatus;

const T: Duration = Duration::from_secs(20);

fn fast_timeouts() -> NodeOptions {
    NodeOptions {
        idle_timeout: Duration::from_millis(300),
        chunk_size: Some(1024),
        ..Default::default()
    }
}

/// Chunk 1 goes unanswered on the first two connections. The scheduler
/// retries the session and the third attempt delivers it.
#[tokio::test]
async fn test_chunk_timeout_recovers_on_third_attempt() {
    let a = Node::start_with("a", fast_timeouts()).await;
    let file = a.source("three.bin", &patterned(3000));
    let file_id = file.id.clone();

    let retries_on_success = Arc::new(Mutex::new(None));
    let stall: StallRule = {
        let store = a.sessions.outbound_store().clone();
        let seen = retries_on_success.clone();
        let file_id = file_id.clone();
        Box::new(move |conn, index| {
            if conn == 2 && index == 1 {
                *seen.lock().unwrap() = store.chunk(&file_id, 1).ok().map(|c| c.retry_count);
            }
            conn < 2 && index == 1
        })
    };
    let receiver = ScriptedReceiver::start(Vec::new(), stall).await;

    let session = a.send(receiver.peer_ref(), vec![file]);
    wait_for("session completion", T, || {
        a.sessions.get(&session.id).unwrap().status == SessionStatus::Completed
    })
    .await
    .unwrap();

    assert_eq!(*retries_on_success.lock().unwrap(), Some(2));
    assert_eq!(
        receiver.received(),
        vec![(0, 0), (0, 1), (1, 1), (2, 1), (2, 2)]
    );
    assert!(a.scheduler.queued().is_empty());
}

/// A chunk that never gets acknowledged exhausts its retries and the
/// session fails instead of looping forever.
#[tokio::test]
async fn test_chunk_retries_exhausted_fails_session() {
    let a = Node::start_with(
        "a",
        NodeOptions {
            max_attempts: 10,
            max_chunk_retries: 2,
            ..fast_timeouts()
        },
    )
    .await;
    let receiver = ScriptedReceiver::start(Vec::new(), Box::new(|_, index| index == 0)).await;

    let file = a.source("stuck.bin", &patterned(2048));
    let file_id = file.id.clone();
    let session = a.send(receiver.peer_ref(), vec![file]);

    wait_for("session failure", T, || {
        a.sessions.get(&session.id).unwrap().status == SessionStatus::Failed
    })
    .await
    .unwrap();

    // Two timed-out attempts, then the exhausted chunk stops the third.
    assert_eq!(receiver.received(), vec![(0, 0), (1, 0)]);
    let chunk = a.sessions.outbound_store().chunk(&file_id, 0).unwrap();
    assert_eq!(chunk.retry_count, 2);
    assert!(a.sessions.get(&session.id).unwrap().error.is_some());
}

/// An explicit retry of a failed session starts over the failed chunks
/// and finishes the transfer.
#[tokio::test]
async fn test_explicit_retry_after_failure() {
    let a = Node::start_with(
        "a",
        NodeOptions {
            max_attempts: 1,
            ..fast_timeouts()
        },
    )
    .await;
    let receiver = ScriptedReceiver::start(Vec::new(), Box::new(|conn, index| conn == 0 && index == 1)).await;

    let file = a.source("again.bin", &patterned(2500));
    let session = a.send(receiver.peer_ref(), vec![file]);
    wait_for("session failure", T, || {
        a.sessions.get(&session.id).unwrap().status == SessionStatus::Failed
    })
    .await
    .unwrap();

    a.sessions.retry(&session.id).unwrap();
    assert!(a.scheduler.enqueue(&session.id));
    wait_for("session completion", T, || {
        a.sessions.get(&session.id).unwrap().status == SessionStatus::Completed
    })
    .await
    .unwrap();

    assert_eq!(receiver.received(), vec![(0, 0), (0, 1), (1, 1), (1, 2)]);
}

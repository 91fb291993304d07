use crate::*;

use ferry_core::model::{Direction, SessionStatus};
use ferry_core::wire::Control;
use ferry_services::transfer::frame::{read_token, write_token};

const T: Duration = Duration::from_secs(20);

fn inbound(node: &Node) -> Vec<TransferSession> {
    node.sessions
        .list()
        .into_iter()
        .filter(|s| s.direction == Direction::Inbound)
        .collect()
}

fn status(node: &Node, id: &str) -> SessionStatus {
    node.sessions.get(id).unwrap().status
}

/// A sends a multi-chunk file to B; B assembles a byte-identical copy.
#[tokio::test]
async fn test_file_transfer_end_to_end() {
    let a = Node::start_with(
        "a",
        NodeOptions {
            chunk_size: Some(64 * 1024),
            ..Default::default()
        },
    )
    .await;
    let b = Node::start("b").await;

    let data = patterned(300_000);
    let file = a.source("report.pdf", &data);
    let session = a.send(b.peer_ref(), vec![file]);

    wait_for("sender completion", T, || status(&a, &session.id) == SessionStatus::Completed)
        .await
        .unwrap();

    let received = b.downloads().join("report.pdf");
    assert_eq!(read(&received), data);

    let sent = a.sessions.get(&session.id).unwrap();
    assert_eq!(sent.transferred_bytes, 300_000);
    assert_eq!(sent.progress_percent(), 100.0);
    assert!(sent.ended_at_ms.is_some());
    // Chunk storage is released once the session completes.
    assert!(!a.sessions.outbound_store().contains(&sent.files[0].id));

    let got = inbound(&b);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].status, SessionStatus::Completed);
    assert!(got[0].warnings.is_empty());
    assert_eq!(got[0].files[0].content.path(), received.as_path());
    assert!(!b.sessions.inbound_store().contains(&got[0].files[0].id));
}

/// A zero-byte file completes after a single empty chunk.
#[tokio::test]
async fn test_empty_file_transfer() {
    let a = Node::start("a").await;
    let b = Node::start("b").await;

    let file = a.source("empty.txt", b"");
    let session = a.send(b.peer_ref(), vec![file]);

    wait_for("sender completion", T, || status(&a, &session.id) == SessionStatus::Completed)
        .await
        .unwrap();

    let received = b.downloads().join("empty.txt");
    assert!(received.exists());
    assert_eq!(read(&received).len(), 0);
    assert_eq!(inbound(&b)[0].status, SessionStatus::Completed);
}

/// Every file of a session arrives; each gets its own receiving session.
#[tokio::test]
async fn test_multi_file_session() {
    let a = Node::start("a").await;
    let b = Node::start("b").await;

    let one = a.source("one.bin", &patterned(10_000));
    let two = a.source("two.bin", &patterned(20_000));
    let session = a.send(b.peer_ref(), vec![one, two]);

    wait_for("sender completion", T, || status(&a, &session.id) == SessionStatus::Completed)
        .await
        .unwrap();

    assert_eq!(read(&b.downloads().join("one.bin")), patterned(10_000));
    assert_eq!(read(&b.downloads().join("two.bin")), patterned(20_000));
    let got = inbound(&b);
    assert_eq!(got.len(), 2);
    assert!(got.iter().all(|s| s.status == SessionStatus::Completed));
}

/// A second file with a taken name lands next to the first.
#[tokio::test]
async fn test_name_collision_gets_suffix() {
    let a = Node::start("a").await;
    let b = Node::start("b").await;

    for body in [&b"first"[..], &b"second"[..]] {
        let file = a.source("notes.txt", body);
        let session = a.send(b.peer_ref(), vec![file]);
        wait_for("sender completion", T, || status(&a, &session.id) == SessionStatus::Completed)
            .await
            .unwrap();
    }

    assert_eq!(read(&b.downloads().join("notes.txt")), b"first");
    assert_eq!(read(&b.downloads().join("notes (1).txt")), b"second");
}

/// A bare HELLO is answered with the listener's identity.
#[tokio::test]
async fn test_probe_answers_identity() {
    let b = Node::start("b").await;

    let mut stream = tokio::net::TcpStream::connect(b.addr).await.unwrap();
    let reply = within(T, async {
        write_token(&mut stream, &Control::Hello, Duration::from_secs(5)).await.unwrap();
        read_token(&mut stream, Duration::from_secs(5)).await.unwrap()
    })
    .await;

    assert_eq!(
        reply,
        Control::Peer {
            id: "b-id".into(),
            name: "b".into()
        }
    );
    assert!(b.sessions.list().is_empty());
}

/// Nobody listening: the scheduler retries, then the session fails.
#[tokio::test]
async fn test_unreachable_peer_fails_after_attempts() {
    let a = Node::start("a").await;
    let gone = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };

    let file = a.source("lost.txt", b"nobody home");
    let session = a.send(
        PeerRef {
            id: "ghost".into(),
            name: "ghost".into(),
            addr: gone,
        },
        vec![file],
    );

    wait_for("session failure", T, || status(&a, &session.id) == SessionStatus::Failed)
        .await
        .unwrap();
    let failed = a.sessions.get(&session.id).unwrap();
    assert!(failed.error.is_some());
    assert!(a.scheduler.queued().is_empty());
}

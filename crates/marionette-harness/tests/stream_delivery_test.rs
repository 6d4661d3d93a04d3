//! Stream payload delivery across machine cycles.

use std::sync::Arc;
use std::time::Duration;

use marionette_core::{Config, Fsm, Party, StreamSet};
use marionette_harness::{docs, pipe, StubSuite};
use tokio::sync::watch;
use tokio::time::timeout;

const MSG_LEN: i64 = 128;

fn session() -> (Fsm, Fsm, Arc<StreamSet>, Arc<StreamSet>, watch::Sender<bool>) {
    let doc = Arc::new(docs::relay(8081, MSG_LEN));
    let (client_conn, server_conn) = pipe();
    let (cancel, cancel_rx) = watch::channel(false);
    let client_set = Arc::new(StreamSet::new());
    let server_set = Arc::new(StreamSet::new());

    let client = Fsm::new(
        Arc::clone(&doc),
        "127.0.0.1",
        Party::Client,
        client_conn,
        Arc::clone(&client_set),
        StubSuite::new(),
        Config::default(),
        cancel_rx.clone(),
    );
    let server = Fsm::new(
        doc,
        "127.0.0.1",
        Party::Server,
        server_conn,
        Arc::clone(&server_set),
        StubSuite::new(),
        Config::default(),
        cancel_rx,
    );
    (client, server, client_set, server_set, cancel)
}

#[tokio::test]
async fn payload_crosses_one_cycle() {
    let (mut client, mut server, client_set, server_set, _cancel) = session();
    let stream = client_set.create();
    stream.write(b"foo").await.unwrap();

    let (client_run, server_run) =
        timeout(Duration::from_secs(5), async { tokio::join!(client.execute(), server.execute()) })
            .await
            .expect("cycle should finish");
    client_run.unwrap();
    server_run.unwrap();

    let peer = timeout(Duration::from_secs(1), server_set.accept()).await.unwrap();
    assert_eq!(peer.id(), stream.id());

    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(1), peer.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"foo");
}

#[tokio::test]
async fn large_payload_spans_cycles_in_order() {
    let (mut client, mut server, client_set, server_set, _cancel) = session();
    let stream = client_set.create();
    let payload: Vec<u8> = (0..100u8).collect();
    stream.write(&payload).await.unwrap();

    // Each cycle carries one cell; the stub cipher caps payloads well
    // below 100 bytes, so delivery takes several cycles.
    let cycles = 4;
    let run = async {
        for _ in 0..cycles {
            let (client_run, server_run) = tokio::join!(client.execute(), server.execute());
            client_run.unwrap();
            server_run.unwrap();
        }
    };
    timeout(Duration::from_secs(5), run).await.expect("cycles should finish");

    let peer = timeout(Duration::from_secs(1), server_set.accept()).await.unwrap();
    let mut collected = Vec::new();
    while collected.len() < payload.len() {
        let mut buf = [0u8; 64];
        let n = timeout(Duration::from_secs(1), peer.read(&mut buf)).await.unwrap().unwrap();
        assert!(n > 0, "stream ended early");
        collected.extend_from_slice(&buf[..n]);
    }
    assert_eq!(collected, payload);
}

//! A locally closed stream recycles the cycle without killing the
//! machine, and the peer drains everything that was queued.

use std::sync::Arc;
use std::time::Duration;

use marionette_core::{Config, Error, Fsm, Party, StreamSet};
use marionette_harness::{docs, pipe, StubSuite};
use tokio::sync::watch;
use tokio::time::timeout;

const MSG_LEN: i64 = 128;

#[tokio::test]
async fn local_close_recycles_and_peer_drains() {
    let doc = Arc::new(docs::relay(8081, MSG_LEN));
    let (client_conn, server_conn) = pipe();
    let (_cancel, cancel_rx) = watch::channel(false);
    let client_set = Arc::new(StreamSet::new());
    let server_set = Arc::new(StreamSet::new());

    let mut client = Fsm::new(
        Arc::clone(&doc),
        "127.0.0.1",
        Party::Client,
        client_conn,
        Arc::clone(&client_set),
        StubSuite::new(),
        Config::default(),
        cancel_rx.clone(),
    );
    let mut server = Fsm::new(
        doc,
        "127.0.0.1",
        Party::Server,
        server_conn,
        Arc::clone(&server_set),
        StubSuite::new(),
        Config::default(),
        cancel_rx,
    );

    let stream = client_set.create();
    stream.write(b"abc").await.unwrap();
    stream.close();

    // Cycle 1 carries the queued bytes.
    let (client_run, server_run) =
        timeout(Duration::from_secs(5), async { tokio::join!(client.execute(), server.execute()) })
            .await
            .unwrap();
    client_run.unwrap();
    server_run.unwrap();

    // Cycle 2 carries the end marker; the sender reports the closed
    // stream and the driver would recycle it.
    let (client_run, server_run) =
        timeout(Duration::from_secs(5), async { tokio::join!(client.execute(), server.execute()) })
            .await
            .unwrap();
    assert!(matches!(client_run, Err(Error::StreamClosed)));
    server_run.unwrap();

    // Cycle 3 proves the machine survived: it falls back to cover cells.
    let (client_run, server_run) =
        timeout(Duration::from_secs(5), async { tokio::join!(client.execute(), server.execute()) })
            .await
            .unwrap();
    client_run.unwrap();
    server_run.unwrap();

    let peer = timeout(Duration::from_secs(1), server_set.accept()).await.unwrap();
    let mut buf = [0u8; 16];
    let n = timeout(Duration::from_secs(1), peer.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"abc");
    let eof = timeout(Duration::from_secs(1), peer.read(&mut buf)).await.unwrap().unwrap();
    assert_eq!(eof, 0);
}

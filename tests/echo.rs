use std::time::{Duration, Instant};

use rudp::{dial, listen, Error, Mode};
use tokio::time::timeout;

#[tokio::test(flavor = "multi_thread")]
async fn echo_roundtrip() {
    let listener = listen(Mode::Fast, "127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr();

    let server = tokio::spawn(async move {
        let session = listener.accept().await.unwrap();
        let mut buffer = [0u8; 64];
        let n = session.read(&mut buffer).await.unwrap();
        assert_eq!(&buffer[..n], b"hello");
        session.write(&buffer[..n]).await.unwrap();
        (listener, session)
    });

    let client = dial(Mode::Fast, &server_addr.to_string()).await.unwrap();
    client.write(b"hello").await.unwrap();

    let mut buffer = [0u8; 64];
    let n = timeout(Duration::from_secs(10), client.read(&mut buffer))
        .await
        .expect("echo must arrive")
        .unwrap();
    assert_eq!(&buffer[..n], b"hello");

    let (_listener, server_session) = server.await.unwrap();
    // the client socket binds the wildcard address, so only ports compare
    assert_eq!(server_session.remote_addr().port(), client.local_addr().port());
    assert_eq!(server_session.conv(), client.conv());

    client.close().await.unwrap();
    assert!(matches!(client.close().await, Err(Error::BrokenPipe)));
    assert!(matches!(
        client.read(&mut buffer).await,
        Err(Error::BrokenPipe)
    ));
    assert!(matches!(client.write(b"x").await, Err(Error::BrokenPipe)));
}

#[tokio::test(flavor = "multi_thread")]
async fn large_message_is_reassembled() {
    let listener = listen(Mode::Fast, "127.0.0.1:0").await.unwrap();
    let server_addr = listener.local_addr();

    let message: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    let expected = message.clone();

    let server = tokio::spawn(async move {
        let session = listener.accept().await.unwrap();
        let mut buffer = vec![0u8; 8192];
        // a message fitting the buffer arrives in one piece, fragmentation
        //  on the wire notwithstanding
        let n = session.read(&mut buffer).await.unwrap();
        assert_eq!(n, expected.len());
        assert_eq!(&buffer[..n], expected.as_slice());
        (listener, session)
    });

    let client = dial(Mode::Fast, &server_addr.to_string()).await.unwrap();
    client.write(&message).await.unwrap();

    timeout(Duration::from_secs(10), server)
        .await
        .expect("server must finish")
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn read_deadline_times_out() {
    let listener = listen(Mode::Default, "127.0.0.1:0").await.unwrap();
    let client = dial(Mode::Default, &listener.local_addr().to_string())
        .await
        .unwrap();

    client
        .set_read_deadline(Some(Instant::now() + Duration::from_millis(200)))
        .await;
    // write deadlines are accepted but have no effect
    client
        .set_write_deadline(Some(Instant::now() + Duration::from_millis(1)))
        .await;

    let mut buffer = [0u8; 8];
    let started = Instant::now();
    let result = timeout(Duration::from_secs(5), client.read(&mut buffer))
        .await
        .expect("read must return on its own");
    assert!(matches!(result, Err(Error::Timeout)));
    assert!(started.elapsed() >= Duration::from_millis(200));

    // a disabled deadline blocks again
    client.set_read_deadline(None).await;
    assert!(timeout(Duration::from_millis(300), client.read(&mut buffer))
        .await
        .is_err());

    client.write(b"still writable after a read timeout").await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn accept_after_close_returns_listener_stopped() {
    let listener = listen(Mode::Normal, "127.0.0.1:0").await.unwrap();
    listener.close().unwrap();

    assert!(matches!(listener.accept().await, Err(Error::ListenerStopped)));
    assert!(matches!(listener.close(), Err(Error::ListenerStopped)));
}

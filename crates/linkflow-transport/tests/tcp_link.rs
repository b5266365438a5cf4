use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::time::timeout;

use linkflow_transport::{
    ConnectionState, FailureKind, FramingRule, LinkClient, RetryPolicy, StateChange, TcpTransport,
};

const WAIT: Duration = Duration::from_secs(5);

async fn wait_for_state(
    changes: &mut broadcast::Receiver<StateChange>,
    wanted: ConnectionState,
) -> anyhow::Result<()> {
    timeout(WAIT, async {
        loop {
            let change = changes.recv().await?;
            if change.new_state == wanted {
                return Ok::<_, anyhow::Error>(());
            }
        }
    })
    .await?
}

#[test_log::test(tokio::test)]
async fn frames_and_commands_over_loopback() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let device = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await?;
        // reply split awkwardly across writes
        socket.write_all(b"READY\r\nPW").await?;
        socket.flush().await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
        socket.write_all(b"R=ON\r\n").await?;

        let mut received = vec![0u8; 12];
        socket.read_exact(&mut received).await?;
        Ok::<_, std::io::Error>(received)
    });

    let frames = Arc::new(Mutex::new(Vec::new()));
    let sink = frames.clone();
    let client = LinkClient::builder(Arc::new(TcpTransport::new("127.0.0.1", port)))
        .id("projector")
        .framing(FramingRule::crlf())
        .pacing(Duration::from_millis(10))
        .on_frame(move |frame| sink.lock().unwrap().push(frame))
        .build()?;

    client.connect().await?;
    client.send_line("PWR?")?;
    client.send_line("INP?")?;

    let received = timeout(WAIT, device).await???;
    assert_eq!(received, b"PWR?\r\nINP?\r\n");

    timeout(WAIT, async {
        while frames.lock().unwrap().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await?;
    assert_eq!(
        *frames.lock().unwrap(),
        vec![Bytes::from("READY"), Bytes::from("PWR=ON")]
    );

    client.disconnect().await?;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    Ok(())
}

#[test_log::test(tokio::test)]
async fn reconnects_after_peer_close() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let device = tokio::spawn(async move {
        // first session: hang up immediately
        let (first, _) = listener.accept().await?;
        drop(first);
        // second session: stay up
        let (second, _) = listener.accept().await?;
        Ok::<_, std::io::Error>(second)
    });

    let client = LinkClient::builder(Arc::new(TcpTransport::new("127.0.0.1", port)))
        .id("mixer")
        .retry(RetryPolicy::new(Duration::from_millis(100)))
        .build()?;
    let mut changes = client.subscribe();

    client.connect().await?;
    wait_for_state(
        &mut changes,
        ConnectionState::Failed(FailureKind::PeerClosed),
    )
    .await?;
    wait_for_state(&mut changes, ConnectionState::Connected).await?;

    let _second = timeout(WAIT, device).await???;
    assert!(client.is_connected());

    client.disconnect().await?;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn refused_connection_retries_until_disconnect() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    drop(listener);

    let client = LinkClient::builder(Arc::new(TcpTransport::new("127.0.0.1", port)))
        .id("camera")
        .retry(RetryPolicy::new(Duration::from_millis(50)))
        .build()?;
    let mut changes = client.subscribe();

    assert!(client.connect().await.is_err());
    assert_eq!(
        client.state(),
        ConnectionState::Failed(FailureKind::Unreachable)
    );

    // the first attempt plus at least one automatic retry
    timeout(WAIT, async {
        let mut attempts = 0;
        while attempts < 2 {
            if changes.recv().await?.new_state == ConnectionState::Connecting {
                attempts += 1;
            }
        }
        Ok::<_, anyhow::Error>(())
    })
    .await??;

    client.disconnect().await?;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(!client.supervisor().is_retry_pending());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(client.state(), ConnectionState::Disconnected);
    Ok(())
}

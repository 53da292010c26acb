use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use socket_engine::transport::{ScriptedBinder, ScriptedTransport, SharedTransport};
use sum_server::{app::SumServer, command::WELCOME};
use tokio::{sync::oneshot, task::JoinHandle, time::timeout};

const PING: &[u8] = b" ";

fn start(
    binder: &ScriptedBinder,
    sweep_interval: Duration,
) -> Result<(oneshot::Sender<()>, JoinHandle<Result<()>>)> {
    let server = SumServer::new(Arc::new(binder.clone()), sweep_interval)?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        server.listen("127.0.0.1", 9999).await?;
        server
            .run_until(async move {
                let _ = shutdown_rx.await;
            })
            .await
    });
    Ok((shutdown_tx, handle))
}

fn client(port: u16, lines: &[&str]) -> Arc<ScriptedTransport> {
    let chunks: Vec<Vec<u8>> = lines.iter().map(|line| line.as_bytes().to_vec()).collect();
    Arc::new(
        ScriptedTransport::connected(SocketAddr::from(([10, 0, 0, 2], port)))
            .with_chunks(chunks)
            .held_open(),
    )
}

// Everything written to the client except liveness pings.
fn replies(transport: &ScriptedTransport) -> Vec<String> {
    transport
        .writes()
        .into_iter()
        .filter(|write| write != PING)
        .map(|write| String::from_utf8_lossy(&write).into_owned())
        .collect()
}

async fn wait_for(mut condition: impl FnMut() -> bool) -> Result<()> {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .context("condition not reached in time")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lines_sent_back_to_back_are_answered_in_order() -> Result<()> {
    const CONNECTIONS: u16 = 64;

    let binder = ScriptedBinder::new();
    let (shutdown_tx, server) = start(&binder, Duration::from_secs(3600))?;

    let clients: Vec<_> = (0..CONNECTIONS)
        .map(|c| client(30000 + c, &["hello", "5", "7"]))
        .collect();
    for transport in &clients {
        let shared: SharedTransport = transport.clone();
        binder.acceptor().offer(shared);
    }

    wait_for(|| clients.iter().all(|transport| replies(transport).len() >= 3)).await?;
    let expected = vec![
        format!("{WELCOME}\r\n"),
        "5\r\n".to_string(),
        "12\r\n".to_string(),
    ];
    for (c, transport) in clients.iter().enumerate() {
        assert_eq!(replies(transport), expected, "connection {c}");
    }

    let _ = shutdown_tx.send(());
    timeout(Duration::from_secs(2), server).await???;
    Ok(())
}

#[tokio::test]
async fn sweep_pings_every_connection_with_a_space() -> Result<()> {
    let binder = ScriptedBinder::new();
    let (shutdown_tx, server) = start(&binder, Duration::from_millis(20))?;

    let transport = client(30100, &[]);
    let shared: SharedTransport = transport.clone();
    binder.acceptor().offer(shared);

    wait_for(|| !transport.writes().is_empty()).await?;
    assert_eq!(transport.writes()[0], PING);
    assert!(replies(&transport).is_empty());

    let _ = shutdown_tx.send(());
    timeout(Duration::from_secs(2), server).await???;
    Ok(())
}

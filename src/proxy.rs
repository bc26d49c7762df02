use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::protocol::postgres::PgDissector;
use crate::protocol::Direction;

pub enum ProxyMessage {
    ConnectionOpened {
        conn_id: u64,
        client_addr: String,
        server_addr: String,
    },
    ConnectionClosed {
        conn_id: u64,
    },
    /// One reconstructed SQL statement, in client-stream order.
    Query {
        conn_id: u64,
        sql: String,
    },
    /// One raw forwarded chunk. Only emitted when the traffic tap is on.
    Traffic {
        conn_id: u64,
        direction: Direction,
        data: Bytes,
    },
}

static CONN_COUNTER: AtomicU64 = AtomicU64::new(1);

pub async fn run_proxy(
    listen_addr: &str,
    upstream_addr: String,
    tx: mpsc::Sender<ProxyMessage>,
    tap_traffic: bool,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("Listening on {listen_addr}, forwarding to {upstream_addr}");

    loop {
        let (client_stream, client_addr) = listener.accept().await?;
        let conn_id = CONN_COUNTER.fetch_add(1, Ordering::Relaxed);
        let upstream_addr = upstream_addr.clone();
        let tx = tx.clone();

        debug!("New connection {conn_id} from {client_addr}");
        let _ = tx
            .send(ProxyMessage::ConnectionOpened {
                conn_id,
                client_addr: client_addr.to_string(),
                server_addr: upstream_addr.clone(),
            })
            .await;

        tokio::spawn(async move {
            if let Err(e) = handle_connection(conn_id, client_stream, &upstream_addr, tx.clone(), tap_traffic).await
            {
                warn!("Connection {conn_id} error: {e}");
            }
            let _ = tx.send(ProxyMessage::ConnectionClosed { conn_id }).await;
            debug!("Connection {conn_id} closed");
        });
    }
}

async fn handle_connection(
    conn_id: u64,
    client_stream: TcpStream,
    upstream_addr: &str,
    tx: mpsc::Sender<ProxyMessage>,
    tap_traffic: bool,
) -> anyhow::Result<()> {
    // No dial timeout: an unreachable backend is reported by the OS, a slow
    // one is waited out, and the client hanging up tears the pair down.
    let upstream_stream = match TcpStream::connect(upstream_addr).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to connect to upstream {upstream_addr}: {e}");
            return Err(e.into());
        }
    };

    let (client_read, client_write) = client_stream.into_split();
    let (upstream_read, upstream_write) = upstream_stream.into_split();

    let tx_fe = tx.clone();
    let mut frontend = tokio::spawn(relay_frontend(
        conn_id,
        client_read,
        upstream_write,
        tx_fe,
        tap_traffic,
    ));
    let mut backend = tokio::spawn(relay_backend(
        conn_id,
        upstream_read,
        client_write,
        tx,
        tap_traffic,
    ));

    // EOF, error, or hangup on either side ends the pair: both halves are
    // torn down together and the dissector state goes with its task.
    tokio::select! {
        _ = &mut frontend => {}
        _ = &mut backend => {}
    }

    frontend.abort();
    backend.abort();

    Ok(())
}

/// Client -> backend. The only dissected direction: each chunk is fed to the
/// dissector before it is forwarded, so queries are observed in exactly the
/// order the backend will see them. Forwarded bytes are never modified.
async fn relay_frontend(
    conn_id: u64,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    tx: mpsc::Sender<ProxyMessage>,
    tap_traffic: bool,
) -> anyhow::Result<()> {
    let mut dissector = PgDissector::new();
    let mut buf = vec![0u8; 16384];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        let queries = dissector.feed(&buf[..n]);

        writer.write_all(&buf[..n]).await?;

        if tap_traffic {
            let _ = tx
                .send(ProxyMessage::Traffic {
                    conn_id,
                    direction: Direction::Frontend,
                    data: Bytes::copy_from_slice(&buf[..n]),
                })
                .await;
        }
        for sql in queries {
            let _ = tx.send(ProxyMessage::Query { conn_id, sql }).await;
        }
    }

    Ok(())
}

/// Backend -> client. Pure passthrough; server messages are never parsed.
async fn relay_backend(
    conn_id: u64,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    tx: mpsc::Sender<ProxyMessage>,
    tap_traffic: bool,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; 16384];

    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        writer.write_all(&buf[..n]).await?;

        if tap_traffic {
            let _ = tx
                .send(ProxyMessage::Traffic {
                    conn_id,
                    direction: Direction::Backend,
                    data: Bytes::copy_from_slice(&buf[..n]),
                })
                .await;
        }
    }

    Ok(())
}

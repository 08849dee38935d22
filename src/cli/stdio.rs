//! Line-delimited JSON transport over stdin/stdout.
//!
//! Inbound: `{ "port": <name>, "tab": <id>?, "frame": <request> }`, or
//! `{ "port": <name>, "tab": <id>?, "disconnect": true }`.
//! Outbound: `{ "port": <name>, "tab": <id>?, "frame": <response> }`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::background::{Background, Connection, PortSender};
use crate::error::Result;
use crate::messages::{TransportRequest, TransportResponse};

/// How long requests still running at end of input get to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Deserialize, Debug)]
pub struct InboundLine {
    pub port: String,
    #[serde(default)]
    pub tab: Option<u32>,
    #[serde(default)]
    pub frame: Option<TransportRequest>,
    #[serde(default)]
    pub disconnect: bool,
}

#[derive(Serialize, Debug)]
pub struct OutboundLine {
    pub port: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tab: Option<u32>,
    pub frame: TransportResponse,
}

type ConnKey = (String, Option<u32>);

struct OpenPort {
    sender: PortSender,
    pump: JoinHandle<()>,
}

fn encode(port: &str, tab: Option<u32>, frame: TransportResponse) -> Option<String> {
    let line = OutboundLine {
        port: port.to_string(),
        tab,
        frame,
    };
    match serde_json::to_string(&line) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!("Unable to encode outbound frame: {}", e);
            None
        }
    }
}

/// Copy frames from `connection` to `out` until shutdown, then drain.
fn spawn_pump(
    mut connection: Connection,
    key: ConnKey,
    out: mpsc::UnboundedSender<String>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (port, tab) = key;
        loop {
            tokio::select! {
                frame = connection.recv() => match frame {
                    Some(frame) => {
                        if let Some(line) = encode(&port, tab, frame) {
                            if out.send(line).is_err() {
                                return;
                            }
                        }
                    }
                    None => return,
                },
                _ = shutdown.changed() => {
                    while let Some(frame) = connection.try_recv() {
                        if let Some(line) = encode(&port, tab, frame) {
                            let _ = out.send(line);
                        }
                    }
                    return;
                }
            }
        }
    })
}

/// Serve `input` until EOF, writing outbound frames to `output`.
pub async fn serve<R, W>(background: Arc<Background>, input: R, mut output: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            if output.write_all(line.as_bytes()).await.is_err() || output.write_all(b"\n").await.is_err() {
                break;
            }
            let _ = output.flush().await;
        }
    });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut open: HashMap<ConnKey, OpenPort> = HashMap::new();
    let mut inflight: Vec<JoinHandle<()>> = Vec::new();
    let mut reader = BufReader::new(input);
    let mut line = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let inbound: InboundLine = match serde_json::from_slice(&line) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("Skipping malformed line: {}", e);
                continue;
            }
        };
        let key = (inbound.port.clone(), inbound.tab);

        if inbound.disconnect {
            if let Some(port) = open.remove(&key) {
                // dropping the receiver closes the port
                port.pump.abort();
                info!("Disconnected {} {:?}", key.0, key.1);
            }
            continue;
        }

        let Some(frame) = inbound.frame else {
            debug!("Line for {} without frame", key.0);
            continue;
        };

        if !open.contains_key(&key) {
            let connection = match background.connect(&inbound.port, inbound.tab) {
                Ok(connection) => connection,
                Err(e) => {
                    warn!("Refusing port {}: {}", inbound.port, e);
                    continue;
                }
            };
            let sender = connection.sender();
            let pump = spawn_pump(connection, key.clone(), out_tx.clone(), shutdown_rx.clone());
            open.insert(key.clone(), OpenPort { sender, pump });
        }

        if let Some(port) = open.get(&key) {
            inflight.retain(|task| !task.is_finished());
            inflight.push(port.sender.send(frame));
        }
    }

    info!("Input closed, {} requests still running", inflight.len());
    let _ = tokio::time::timeout(SHUTDOWN_GRACE, async {
        for task in inflight.iter_mut() {
            let _ = task.await;
        }
    })
    .await;

    shutdown_tx.send_replace(true);
    for (_, port) in open.drain() {
        let _ = port.pump.await;
    }
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

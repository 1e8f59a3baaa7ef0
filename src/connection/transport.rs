use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::connection::backoff::Backoff;
use crate::connection::codec::{EnginePacket, SocketPacket};
use crate::connection::{Connection, OutboundFrame};
use crate::error::{DashError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);
const DEFAULT_PING_INTERVAL_MS: u64 = 25_000;
const DEFAULT_PING_TIMEOUT_MS: u64 = 20_000;

/// Why an established session ended.
enum SessionEnd {
    Shutdown,
    Lost(String),
}

/// An Engine.IO session whose Socket.IO namespace is connected.
struct Established {
    sink: WsSink,
    source: WsSource,
    /// Pings must arrive at least this often or the link is considered dead.
    liveness: Duration,
    /// Events that arrived before the namespace connect ack.
    early: Vec<SocketPacket>,
}

/// Build the Engine.IO WebSocket endpoint from the dashboard base URL.
pub fn socket_url(base: &str) -> Result<String> {
    let trimmed = base.trim().trim_end_matches('/');
    let (scheme, rest) = trimmed
        .split_once("://")
        .ok_or_else(|| DashError::Url(format!("missing scheme in {:?}", base)))?;

    let ws_scheme = match scheme {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(DashError::Url(format!("unsupported scheme {:?}", other))),
    };
    if rest.is_empty() {
        return Err(DashError::Url(format!("missing host in {:?}", base)));
    }

    let path = if rest.ends_with("/socket.io") {
        rest.to_string()
    } else {
        format!("{}/socket.io", rest)
    };
    Ok(format!("{}://{}/?EIO=4&transport=websocket", ws_scheme, path))
}

/// Drive the shared connection until `shutdown` fires.
///
/// Each iteration opens a WebSocket, performs the Engine.IO and Socket.IO
/// handshakes, then pumps frames both ways. Failures are reported through
/// the connection's lifecycle signals and retried after the backoff delay.
/// The connection is closed when this returns.
pub async fn run_transport(
    conn: Connection,
    mut outbound_rx: mpsc::UnboundedReceiver<OutboundFrame>,
    config: ClientConfig,
    shutdown: CancellationToken,
) {
    let url = match socket_url(&config.url) {
        Ok(url) => url,
        Err(e) => {
            tracing::error!(url = %config.url, error = %e, "Cannot start realtime transport");
            conn.close();
            return;
        }
    };
    let mut backoff = Backoff::new(config.reconnect.clone());

    loop {
        if shutdown.is_cancelled() {
            break;
        }
        conn.mark_connecting();
        tracing::debug!(url = %url, attempt = backoff.attempts(), "Opening realtime transport");

        let attempt = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = timeout(HANDSHAKE_TIMEOUT, handshake(&url, &config.namespace)) => result,
        };

        match attempt {
            Ok(Ok(established)) => {
                backoff.reset();
                conn.mark_connected();
                match pump(&conn, established, &mut outbound_rx, &config.namespace, &shutdown).await
                {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Lost(reason) => conn.mark_disconnected(&reason),
                }
            }
            Ok(Err(e)) => conn.mark_connect_error(&e.to_string()),
            Err(_) => conn.mark_connect_error("handshake timed out"),
        }

        let delay = backoff.next_delay();
        tracing::debug!(delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    conn.close();
    tracing::info!("Realtime transport stopped");
}

async fn handshake(url: &str, namespace: &str) -> Result<Established> {
    let (ws, _) = connect_async(url).await?;
    let (mut sink, mut source) = ws.split();

    let mut liveness = Duration::from_millis(DEFAULT_PING_INTERVAL_MS + DEFAULT_PING_TIMEOUT_MS);
    let mut opened = false;
    let mut early = Vec::new();

    while let Some(msg) = source.next().await {
        let text = match msg? {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };

        match EnginePacket::decode(text.as_str())? {
            EnginePacket::Open(info) => {
                liveness = liveness_from_open(&info);
                opened = true;
                let connect = SocketPacket::Connect {
                    namespace: namespace.to_string(),
                    data: None,
                };
                sink.send(Message::Text(connect.to_frame().into())).await?;
            }
            EnginePacket::Ping => {
                sink.send(Message::Text(EnginePacket::Pong.encode().into()))
                    .await?;
            }
            EnginePacket::Close => break,
            EnginePacket::Message(body) if opened => match SocketPacket::decode(&body)? {
                SocketPacket::Connect { namespace: ns, .. } if ns == namespace => {
                    return Ok(Established {
                        sink,
                        source,
                        liveness,
                        early,
                    });
                }
                SocketPacket::ConnectError { message, .. } => {
                    return Err(DashError::Handshake(message));
                }
                packet @ SocketPacket::Event { .. } => early.push(packet),
                _ => {}
            },
            _ => {}
        }
    }

    Err(DashError::Handshake(
        "connection closed during handshake".to_string(),
    ))
}

fn liveness_from_open(info: &Value) -> Duration {
    let interval = info
        .get("pingInterval")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_PING_INTERVAL_MS);
    let ping_timeout = info
        .get("pingTimeout")
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_PING_TIMEOUT_MS);
    Duration::from_millis(interval + ping_timeout)
}

async fn pump(
    conn: &Connection,
    established: Established,
    outbound_rx: &mut mpsc::UnboundedReceiver<OutboundFrame>,
    namespace: &str,
    shutdown: &CancellationToken,
) -> SessionEnd {
    let Established {
        mut sink,
        mut source,
        liveness,
        early,
    } = established;

    for packet in early {
        if let SocketPacket::Event { name, data, .. } = packet {
            conn.dispatch(&name, &data);
        }
    }

    let mut ping_deadline = Instant::now() + liveness;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                let goodbye = SocketPacket::Disconnect { namespace: namespace.to_string() };
                let _ = sink.send(Message::Text(goodbye.to_frame().into())).await;
                let _ = sink.send(Message::Close(None)).await;
                return SessionEnd::Shutdown;
            }

            _ = tokio::time::sleep_until(ping_deadline) => {
                return SessionEnd::Lost("ping timeout".to_string());
            }

            frame = outbound_rx.recv() => {
                let Some(frame) = frame else {
                    // Every connection handle is gone.
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                };
                let packet = SocketPacket::event(namespace, frame.event.clone(), frame.payload);
                if let Err(e) = sink.send(Message::Text(packet.to_frame().into())).await {
                    tracing::warn!(event = %frame.event, error = %e, "Failed to send frame");
                    return SessionEnd::Lost(format!("transport error: {}", e));
                }
                tracing::trace!(event = %frame.event, "Sent frame");
            }

            msg = source.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                        continue;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Lost("transport close".to_string());
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return SessionEnd::Lost(format!("transport error: {}", e)),
                };

                let packet = match EnginePacket::decode(text.as_str()) {
                    Ok(packet) => packet,
                    Err(e) => {
                        tracing::warn!(error = %e, "Skipping malformed engine packet");
                        continue;
                    }
                };

                match packet {
                    EnginePacket::Ping => {
                        ping_deadline = Instant::now() + liveness;
                        let pong = EnginePacket::Pong.encode();
                        if let Err(e) = sink.send(Message::Text(pong.into())).await {
                            return SessionEnd::Lost(format!("transport error: {}", e));
                        }
                    }
                    EnginePacket::Close => return SessionEnd::Lost("transport close".to_string()),
                    EnginePacket::Message(body) => match SocketPacket::decode(&body) {
                        Ok(SocketPacket::Event { namespace: ns, name, data, .. }) if ns == namespace => {
                            conn.dispatch(&name, &data);
                        }
                        Ok(SocketPacket::Disconnect { namespace: ns }) if ns == namespace => {
                            return SessionEnd::Lost("io server disconnect".to_string());
                        }
                        Ok(SocketPacket::ConnectError { message, .. }) => {
                            return SessionEnd::Lost(message);
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "Skipping malformed socket packet"),
                    },
                    _ => {}
                }
            }
        }
    }
}

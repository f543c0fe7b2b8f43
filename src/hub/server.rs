use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::Registry;

#[derive(Debug, Error)]
pub enum HubError {
    #[error("failed to bind {0}: {1}")]
    Bind(String, std::io::Error),
    #[error("failed to build the hub runtime: {0}")]
    Runtime(std::io::Error),
}

/// WebSocket endpoint hosting the peer registry.
///
/// Runs a current-thread tokio runtime on its own OS thread; everything the
/// rest of the control plane needs goes through the shared [`Registry`].
pub struct PeerHub {
    local_addr: SocketAddr,
    shutdown: Arc<Notify>,
    thread: Option<JoinHandle<()>>,
}

impl PeerHub {
    pub fn start(host: &str, port: u16, registry: Arc<Registry>) -> Result<PeerHub, HubError> {
        let endpoint = format!("{host}:{port}");
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(HubError::Runtime)?;

        let shutdown = Arc::new(Notify::new());
        let (bound_tx, bound_rx) = std::sync::mpsc::channel();

        let thread = thread::spawn({
            let endpoint = endpoint.clone();
            let shutdown = Arc::clone(&shutdown);
            move || runtime.block_on(serve(endpoint, registry, shutdown, bound_tx))
        });

        match bound_rx.recv() {
            Ok(Ok(local_addr)) => {
                info!("peer hub listening on ws://{local_addr}");
                Ok(PeerHub {
                    local_addr,
                    shutdown,
                    thread: Some(thread),
                })
            }
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(HubError::Bind(endpoint, err))
            }
            Err(_) => {
                let _ = thread.join();
                Err(HubError::Bind(
                    endpoint,
                    std::io::Error::other("hub thread exited before binding"),
                ))
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close the listener and join the hub thread. Open peer tasks die with
    /// the runtime.
    pub fn stop(mut self) {
        self.shutdown.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

async fn serve(
    endpoint: String,
    registry: Arc<Registry>,
    shutdown: Arc<Notify>,
    bound: std::sync::mpsc::Sender<std::io::Result<SocketAddr>>,
) {
    let listener = match TcpListener::bind(&endpoint).await {
        Ok(listener) => {
            let _ = bound.send(listener.local_addr());
            listener
        }
        Err(err) => {
            let _ = bound.send(Err(err));
            return;
        }
    };

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    debug!(%addr, "incoming connection");
                    tokio::spawn(handle_peer(stream, Arc::clone(&registry)));
                }
                Err(err) => warn!("accept failed: {err}"),
            },
        }
    }
}

async fn handle_peer(stream: TcpStream, registry: Arc<Registry>) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(err) => {
            debug!("websocket handshake failed: {err}");
            return;
        }
    };
    let (mut sink, mut frames) = ws.split();

    // First frame is the registration.
    let name = loop {
        match frames.next().await {
            Some(Ok(Message::Text(raw))) => break peer_name(raw.as_str()),
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            _ => return,
        }
    };
    let Some(name) = name else {
        warn!("peer sent no usable name, closing");
        let _ = sink.close().await;
        return;
    };

    let (tx, mut outbound) = mpsc::unbounded_channel::<String>();
    let generation = registry.register(&name, tx);
    info!(peer = %name, "peer registered");

    let writer = tokio::spawn(async move {
        while let Some(payload) = outbound.recv().await {
            if sink.send(Message::text(payload)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Message::Text(text)) => registry.record_message(&name, generation, text.as_str()),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(err) => {
                debug!(peer = %name, "connection lost: {err}");
                break;
            }
        }
    }

    registry.unregister(&name, generation);
    writer.abort();
    info!(peer = %name, "peer disconnected");
}

/// Extract the peer name from a registration frame.
///
/// The contract is a JSON object carrying `client_id` (older peers used
/// `name` or `client`); a bare non-JSON string is accepted as a legacy
/// fallback and used verbatim.
fn peer_name(raw: &str) -> Option<String> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) {
        return ["client_id", "name", "client"]
            .iter()
            .find_map(|key| value.get(key))
            .and_then(|v| v.as_str())
            .filter(|name| !name.is_empty())
            .map(str::to_owned);
    }

    let name = raw.trim();
    if name.is_empty() {
        None
    } else {
        warn!(peer = name, "legacy plain-text registration");
        Some(name.to_owned())
    }
}

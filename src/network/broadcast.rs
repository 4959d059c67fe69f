//! Frame fan-out to connected receivers
//!
//! Each encoded frame is framed once and published on a broadcast channel.
//! Every accepted TCP client gets its own subscriber and writer task; a
//! client that falls more than the channel backlog behind skips the frames
//! it missed and keeps going.

use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::error::NetworkError;
use crate::network::framing::{encode_frame, Framing};

/// Publishes frames to every connected client
#[derive(Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<Bytes>,
    framing: Framing,
    max_frame: usize,
}

impl Broadcaster {
    pub fn new(framing: Framing, max_frame: usize, backlog: usize) -> Self {
        let (tx, _) = broadcast::channel(backlog.max(1));
        Self {
            tx,
            framing,
            max_frame,
        }
    }

    /// Bind the listening socket
    pub async fn bind(addr: &str) -> Result<TcpListener, NetworkError> {
        TcpListener::bind(addr)
            .await
            .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))
    }

    /// Frame `payload` and queue it for every client.
    ///
    /// Returns how many clients it was queued for. No clients is not an error.
    pub fn publish(&self, payload: Bytes) -> Result<usize, NetworkError> {
        let wire = encode_frame(self.framing, payload, self.max_frame)?;
        Ok(self.tx.send(wire).unwrap_or(0))
    }

    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Accept clients until `cancel` fires
    pub async fn serve(
        &self,
        listener: TcpListener,
        nodelay: bool,
        cancel: CancellationToken,
    ) -> Result<(), NetworkError> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!("Streaming on {}", addr);
        }

        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };

            if let Err(e) = stream.set_nodelay(nodelay) {
                tracing::warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
            }

            tracing::info!("Client {} connected", peer);
            let rx = self.tx.subscribe();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                match serve_client(stream, peer, rx, cancel).await {
                    Ok(()) => tracing::info!("Client {} disconnected", peer),
                    Err(e) => tracing::info!("Client {} dropped: {}", peer, e),
                }
            });
        }
    }
}

async fn serve_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    mut rx: broadcast::Receiver<Bytes>,
    cancel: CancellationToken,
) -> io::Result<()> {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = rx.recv() => msg,
        };

        match msg {
            // One write per frame
            Ok(wire) => stream.write_all(&wire).await?,
            Err(RecvError::Lagged(n)) => {
                tracing::warn!(
                    "Client {} lagged, {} frames missed. Stream may be distorted.",
                    peer,
                    n
                );
            }
            Err(RecvError::Closed) => break,
        }
    }
    stream.shutdown().await
}

//! Network transport for encoded frames

pub mod broadcast;
pub mod framing;
pub mod receiver;

pub use broadcast::Broadcaster;
pub use framing::{encode_frame, frames, FrameStream, Framing};
pub use receiver::{ReceiveEnd, ReceiverStats, StreamReceiver};

use tokio::net::TcpStream;

use crate::error::NetworkError;

/// Connect to a sender and delimit its byte stream into frames
pub async fn connect(
    endpoint: &str,
    framing: Framing,
    max_frame: usize,
    nodelay: bool,
) -> Result<FrameStream, NetworkError> {
    let stream = TcpStream::connect(endpoint)
        .await
        .map_err(|e| NetworkError::ConnectionFailed(format!("{}: {}", endpoint, e)))?;
    if let Err(e) = stream.set_nodelay(nodelay) {
        tracing::warn!("Failed to set TCP_NODELAY: {}", e);
    }
    tracing::info!("Connected to {} ({:?} framing)", endpoint, framing);
    Ok(frames(stream, framing, max_frame))
}

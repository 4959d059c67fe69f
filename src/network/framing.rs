//! Frame delimiting on the byte stream
//!
//! Two framings are supported. `Chunked` treats every read as one frame,
//! which only holds on transports that preserve write boundaries and a
//! sender that writes exactly one frame per write. `LengthPrefixed` puts a
//! big-endian u16 length in front of each frame so boundaries survive any
//! coalescing or splitting on the way.

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::io;
use std::pin::Pin;
use tokio::io::AsyncRead;
use tokio_util::codec::{BytesCodec, Encoder, FramedRead, LengthDelimitedCodec};

use crate::error::NetworkError;

/// How frames are delimited on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// One transport read is one frame
    Chunked,
    /// u16 big-endian length prefix per frame
    #[default]
    LengthPrefixed,
}

/// A stream of raw frame payloads
pub type FrameStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

fn length_codec(max_frame: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(2)
        .max_frame_length(max_frame)
        .new_codec()
}

/// Delimit a byte stream into frame payloads
pub fn frames<R>(reader: R, framing: Framing, max_frame: usize) -> FrameStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    match framing {
        Framing::Chunked => Box::pin(
            FramedRead::with_capacity(reader, BytesCodec::new(), max_frame)
                .map_ok(BytesMut::freeze),
        ),
        Framing::LengthPrefixed => Box::pin(
            FramedRead::new(reader, length_codec(max_frame)).map_ok(BytesMut::freeze),
        ),
    }
}

/// Serialize one frame into the bytes of a single transport write
pub fn encode_frame(
    framing: Framing,
    payload: Bytes,
    max_frame: usize,
) -> Result<Bytes, NetworkError> {
    if payload.len() > max_frame {
        return Err(NetworkError::FrameTooLarge(payload.len()));
    }
    match framing {
        Framing::Chunked => Ok(payload),
        Framing::LengthPrefixed => {
            let mut out = BytesMut::with_capacity(payload.len() + 2);
            length_codec(max_frame)
                .encode(payload, &mut out)
                .map_err(|e| NetworkError::SendFailed(e.to_string()))?;
            Ok(out.freeze())
        }
    }
}

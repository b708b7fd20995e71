use bytes::{Buf, BufMut, BytesMut};
use linkrpc_core::TransportError;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Length-prefixed JSON text frames for stream-oriented IPC channels.
///
/// Each frame is a 4-byte big-endian length followed by that many bytes of
/// UTF-8 JSON.
#[derive(Debug, Clone)]
pub struct JsonFrameCodec {
    /// Maximum frame size to prevent unbounded buffering
    max_frame_size: usize,
}

impl JsonFrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame_size: 10 * 1024 * 1024, // 10MB default
        }
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Default for JsonFrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for JsonFrameCodec {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..4]);
        let frame_len = u32::from_be_bytes(length_bytes) as usize;

        if frame_len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(frame_len));
        }

        if src.len() < 4 + frame_len {
            src.reserve(4 + frame_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame = src.split_to(frame_len);
        let text = String::from_utf8(frame.to_vec()).map_err(|_| CodecError::InvalidUtf8)?;
        Ok(Some(text))
    }
}

impl Encoder<String> for JsonFrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: String, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = item.as_bytes();
        if bytes.len() > self.max_frame_size {
            return Err(CodecError::FrameTooLarge(bytes.len()));
        }

        dst.reserve(4 + bytes.len());
        dst.put_u32(bytes.len() as u32);
        dst.put_slice(bytes);
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CodecError> for TransportError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => TransportError::from(e),
            other => TransportError::Codec(other.to_string()),
        }
    }
}

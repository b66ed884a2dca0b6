//! Codec for encoding/decoding tunnel frames

use crate::frames::TunnelFrame;
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Whether the byte stream is unusable after this error.
    ///
    /// A payload that fails to deserialize has a known length and can be
    /// skipped; an oversized length header cannot be resynchronised.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, CodecError::SerializationError(_))
    }
}

/// Tunnel frame codec
///
/// Byte-stream format: `[length: u32 BE][payload: bincode TunnelFrame]`.
/// Message-oriented transports carry the bare payload.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Serialize a frame without the length header
    pub fn encode_payload(frame: &TunnelFrame) -> Result<Vec<u8>, CodecError> {
        let payload = bincode::serialize(frame)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }
        Ok(payload)
    }

    /// Deserialize a bare payload
    pub fn decode_payload(payload: &[u8]) -> Result<TunnelFrame, CodecError> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }
        Ok(bincode::deserialize(payload)?)
    }

    /// Encode a frame with its length header
    pub fn encode(frame: &TunnelFrame) -> Result<Bytes, CodecError> {
        let payload = Self::encode_payload(frame)?;

        let mut buf = BytesMut::with_capacity(4 + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode one length-prefixed frame from the front of `buf`.
    ///
    /// Returns Ok(Some(frame)) if a complete frame was decoded,
    /// Ok(None) if more data is needed. The frame's bytes are consumed
    /// even when its payload fails to deserialize.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<TunnelFrame>, CodecError> {
        match Self::split_frame(buf)? {
            Some(payload) => Self::decode_payload(&payload).map(Some),
            None => Ok(None),
        }
    }

    /// Decode every complete frame currently buffered
    pub fn decode_all(buf: &mut BytesMut) -> Result<Vec<TunnelFrame>, CodecError> {
        let mut frames = Vec::new();

        while let Some(frame) = Self::decode(buf)? {
            frames.push(frame);
        }

        Ok(frames)
    }

    fn split_frame(buf: &mut BytesMut) -> Result<Option<BytesMut>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&buf[..4]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        if buf.len() < 4 + length {
            buf.reserve(4 + length - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        Ok(Some(buf.split_to(length)))
    }
}

/// Stream decoding yields per-frame results so a single malformed payload
/// does not end the stream.
impl Decoder for FrameCodec {
    type Item = Result<TunnelFrame, CodecError>;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(Self::split_frame(src)?.map(|payload| Self::decode_payload(&payload)))
    }
}

impl Encoder<TunnelFrame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: TunnelFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = Self::encode_payload(&frame)?;
        dst.reserve(4 + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::TunnelFrame;

    #[test]
    fn test_encode_decode() {
        let frame = TunnelFrame::RequestStart {
            request_id: 7,
            method: "POST".into(),
            path: "/upload?x=1".into(),
            headers: vec![("content-type".into(), b"application/octet-stream".to_vec())],
        };

        let encoded = FrameCodec::encode(&frame).unwrap();
        let mut buf = BytesMut::from(encoded.as_ref());

        let decoded = FrameCodec::decode(&mut buf).unwrap();
        assert_eq!(decoded, Some(frame));
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_decode_incomplete() {
        let frame = TunnelFrame::ResponseEnd { request_id: 3 };
        let encoded = FrameCodec::encode(&frame).unwrap();

        // Only provide length header
        let mut buf = BytesMut::from(&encoded[..4]);
        assert_eq!(FrameCodec::decode(&mut buf).unwrap(), None);

        // Provide rest of frame
        buf.extend_from_slice(&encoded[4..]);
        assert_eq!(FrameCodec::decode(&mut buf).unwrap(), Some(frame));
    }

    #[test]
    fn test_decode_multiple() {
        let first = TunnelFrame::Heartbeat;
        let second = TunnelFrame::WindowUpdate {
            request_id: 1,
            credits: 8,
        };

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&FrameCodec::encode(&first).unwrap());
        buf.extend_from_slice(&FrameCodec::encode(&second).unwrap());

        let frames = FrameCodec::decode_all(&mut buf).unwrap();
        assert_eq!(frames, vec![first, second]);
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn test_binary_chunk_survives() {
        let bytes: Vec<u8> = (0..=255u8).cycle().take(crate::CHUNK_SIZE).collect();
        let frame = TunnelFrame::ResponseBodyChunk {
            request_id: 42,
            bytes: bytes.clone(),
        };

        let payload = FrameCodec::encode_payload(&frame).unwrap();
        match FrameCodec::decode_payload(&payload).unwrap() {
            TunnelFrame::ResponseBodyChunk { request_id, bytes: got } => {
                assert_eq!(request_id, 42);
                assert_eq!(got, bytes);
            }
            other => panic!("Expected ResponseBodyChunk, got {:?}", other),
        }
    }

    #[test]
    fn test_oversized_length_is_fatal() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        let err = FrameCodec::decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge(_)));
        assert!(err.is_fatal());
    }

    #[test]
    fn test_stream_decoder_skips_malformed_payload() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();

        // A frame whose payload is an unknown enum variant
        buf.put_u32(4);
        buf.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        buf.extend_from_slice(&FrameCodec::encode(&TunnelFrame::Heartbeat).unwrap());

        let bad = Decoder::decode(&mut codec, &mut buf).unwrap().unwrap();
        let err = bad.unwrap_err();
        assert!(!err.is_fatal());

        let good = Decoder::decode(&mut codec, &mut buf).unwrap().unwrap();
        assert_eq!(good.unwrap(), TunnelFrame::Heartbeat);
        assert!(buf.is_empty());
    }
}

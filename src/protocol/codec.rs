//! Binary frame codec for the ESPHome native API
//!
//! Wire format: `[indicator:1][length:varint][type:varint][payload]` where the
//! indicator is `0x00` for plaintext (the only supported mode) and the length
//! covers the payload only, never the type tag.
//!
//! Codec errors are fatal to the connection; there is no mid-stream
//! resynchronization. Unknown message types are not errors: the frame is
//! consumed and discarded, and the reader moves on to the next one.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use super::api::ApiMessage;

/// Errors raised by the frame codec
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame indicator byte was not `0x00` (e.g. an encrypted peer)
    #[error("unsupported frame indicator {0:#04x}")]
    UnsupportedIndicator(u8),

    /// Varint continuation ran past 64 bits
    #[error("varint value too large")]
    VarIntOverflow,

    /// The peer closed the stream
    #[error("connection closed")]
    ConnectionClosed,

    /// Payload bytes were not valid protobuf for the declared type
    #[error("malformed payload: {0}")]
    Payload(#[from] prost::DecodeError),

    /// Underlying transport error
    #[error("io error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::ConnectionClosed
        } else {
            Self::Io(err)
        }
    }
}

/// Append an unsigned LEB128 varint to `buf`.
pub fn write_varint(buf: &mut Vec<u8>, mut value: u32) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Reads typed messages from a byte stream.
pub struct FrameReader<R> {
    inner: BufReader<R>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Wrap a readable stream half.
    pub fn new(stream: R) -> Self {
        Self {
            inner: BufReader::new(stream),
        }
    }

    /// Read the next known message, silently skipping frames with
    /// unregistered type tags.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::ConnectionClosed`] at end of stream and other
    /// protocol errors for malformed frames. All errors are fatal: the caller
    /// must tear the session down rather than keep reading.
    pub async fn read_message(&mut self) -> Result<ApiMessage, ProtocolError> {
        loop {
            let indicator = self.read_byte().await?;
            if indicator != 0 {
                return Err(ProtocolError::UnsupportedIndicator(indicator));
            }

            let length = self.read_varint().await? as usize;
            let tag = self.read_varint().await?;

            let mut payload = vec![0u8; length];
            self.inner.read_exact(&mut payload).await?;

            match ApiMessage::decode(tag, &payload)? {
                Some(message) => return Ok(message),
                None => {
                    tracing::trace!(tag, length, "skipping unknown message type");
                }
            }
        }
    }

    async fn read_byte(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.inner.read_u8().await?)
    }

    /// Read an unsigned LEB128 varint.
    ///
    /// The protocol never emits values above 16 bits, but the reference
    /// protobuf implementation tolerates up to 64 bits and discards the top
    /// 32. Do the same here so a nonconformant peer cannot corrupt our state.
    async fn read_varint(&mut self) -> Result<u32, ProtocolError> {
        let mut result: u32 = 0;
        let mut shift = 0u32;
        while shift < 32 {
            let byte = self.read_byte().await?;
            result |= u32::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }

        while shift < 64 {
            let byte = self.read_byte().await?;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }

        Err(ProtocolError::VarIntOverflow)
    }
}

/// Writes typed messages to a byte stream.
pub struct FrameWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Wrap a writable stream half.
    pub fn new(stream: W) -> Self {
        Self { inner: stream }
    }

    /// Encode and write one message frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport write fails.
    pub async fn write_message(&mut self, message: &ApiMessage) -> Result<(), ProtocolError> {
        let frame = encode_frame(message);
        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Encode a message into a complete wire frame.
#[must_use]
pub fn encode_frame(message: &ApiMessage) -> Vec<u8> {
    let payload = message.encode_payload();
    let mut frame = Vec::with_capacity(payload.len() + 6);
    frame.push(0x00);
    #[allow(clippy::cast_possible_truncation)]
    write_varint(&mut frame, payload.len() as u32);
    write_varint(&mut frame, message.tag());
    frame.extend_from_slice(&payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::api::{PingRequest, VoiceAssistantAudio};

    async fn read_one(bytes: &[u8]) -> Result<ApiMessage, ProtocolError> {
        FrameReader::new(bytes).read_message().await
    }

    #[tokio::test]
    async fn round_trip() {
        let message = ApiMessage::VoiceAudio(VoiceAssistantAudio {
            data: vec![0x55; 300],
            end: false,
        });
        let frame = encode_frame(&message);
        assert_eq!(read_one(&frame).await.unwrap(), message);
    }

    #[tokio::test]
    async fn length_field_excludes_tag() {
        let message = ApiMessage::PingRequest(PingRequest::default());
        let frame = encode_frame(&message);
        // Empty payload: indicator, length 0, tag 7
        assert_eq!(frame, vec![0x00, 0x00, 0x07]);
    }

    #[tokio::test]
    async fn nonzero_indicator_is_fatal() {
        let err = read_one(&[0x01, 0x00, 0x07]).await.unwrap_err();
        assert!(matches!(err, ProtocolError::UnsupportedIndicator(0x01)));
    }

    #[tokio::test]
    async fn unknown_tag_is_skipped() {
        // Unregistered tag 200 with a 2-byte payload, then a ping
        let mut bytes = vec![0x00, 0x02, 0xc8, 0x01, 0xaa, 0xbb];
        bytes.extend(encode_frame(&ApiMessage::PingRequest(PingRequest::default())));
        let message = read_one(&bytes).await.unwrap();
        assert_eq!(message, ApiMessage::PingRequest(PingRequest::default()));
    }

    #[tokio::test]
    async fn truncated_stream_is_connection_closed() {
        let err = read_one(&[0x00, 0x05, 0x07, 0x01]).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[tokio::test]
    async fn varint_discards_bits_above_32() {
        // 10-byte varint for the length: low 32 bits decode to 0, the rest is
        // discarded. Tag 7 follows, so this parses as an empty ping.
        let bytes = [
            0x00, // indicator
            0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x00, // length 0
            0x07, // tag
        ];
        let message = read_one(&bytes).await.unwrap();
        assert_eq!(message, ApiMessage::PingRequest(PingRequest::default()));
    }

    #[tokio::test]
    async fn varint_past_64_bits_overflows() {
        let bytes = [0x00, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80, 0x80];
        let err = read_one(&bytes).await.unwrap_err();
        assert!(matches!(err, ProtocolError::VarIntOverflow));
    }

    #[test]
    fn varint_encoding_matches_leb128() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 0);
        write_varint(&mut buf, 127);
        write_varint(&mut buf, 128);
        write_varint(&mut buf, 300);
        assert_eq!(buf, vec![0x00, 0x7f, 0x80, 0x01, 0xac, 0x02]);
    }
}

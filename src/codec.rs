use bytes::{Buf, BytesMut};
use std::convert::TryInto;
use std::io::Cursor;
use tokio_util::codec::{Decoder, Encoder};

use crate::command::Command;
use crate::frame::{self, Frame};
use crate::Error;

/// Frame-level glue between the byte stream and [`Frame`]: decodes complete
/// inbound replies and encodes outbound commands.
#[derive(Default)]
pub struct FrameCodec {
    // Attributes are out-of-band metadata. By default the codec unwraps them
    // and yields the value they annotate.
    keep_attributes: bool,
}

impl FrameCodec {
    pub fn new() -> FrameCodec {
        FrameCodec {
            keep_attributes: false,
        }
    }

    pub fn with_attributes() -> FrameCodec {
        FrameCodec {
            keep_attributes: true,
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut cursor = Cursor::new(&src[..]);
        let frame = match Frame::parse(&mut cursor) {
            Ok(frame) => frame,
            Err(frame::Error::Incomplete) => return Ok(None), // Not enough data to parse a frame.
            Err(err) => return Err(Error::Protocol(err.to_string())),
        };

        let position: usize = cursor
            .position()
            .try_into()
            .map_err(|_| Error::Protocol("frame exceeds addressable buffer".to_string()))?;

        // Remove the parsed frame from the buffer.
        src.advance(position);

        match frame {
            Frame::Attribute { value, .. } if !self.keep_attributes => Ok(Some(*value)),
            frame => Ok(Some(frame)),
        }
    }
}

impl Encoder<Command> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, command: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        command.write_to(dst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn decode_incomplete_then_complete() {
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::from(&b"$5\r\nhel"[..]);

        assert!(matches!(codec.decode(&mut buffer), Ok(None)));

        buffer.extend_from_slice(b"lo\r\n");
        let frame = codec.decode(&mut buffer).unwrap();
        assert_eq!(frame, Some(Frame::Bulk(Bytes::from("hello"))));
        assert!(buffer.is_empty());
    }

    #[test]
    fn decode_strips_attributes_by_default() {
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::from(&b"|1\r\n+ttl\r\n:3600\r\n:42\r\n"[..]);

        let frame = codec.decode(&mut buffer).unwrap();
        assert_eq!(frame, Some(Frame::Integer(42)));
    }

    #[test]
    fn decode_keeps_attributes_when_asked() {
        let mut codec = FrameCodec::with_attributes();
        let mut buffer = BytesMut::from(&b"|1\r\n+ttl\r\n:3600\r\n:42\r\n"[..]);

        let frame = codec.decode(&mut buffer).unwrap();
        assert_eq!(
            frame,
            Some(Frame::Attribute {
                attributes: vec![(Frame::Simple("ttl".to_string()), Frame::Integer(3600))],
                value: Box::new(Frame::Integer(42)),
            })
        );
    }

    #[test]
    fn decode_rejects_malformed_prefix() {
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::from(&b"?what\r\n"[..]);

        assert!(matches!(
            codec.decode(&mut buffer),
            Err(Error::Protocol(_))
        ));
    }

    #[test]
    fn encode_command_as_bulk_array() {
        let mut codec = FrameCodec::new();
        let mut buffer = BytesMut::new();

        let command = Command::new("SET").arg("foo").arg("bar");
        codec.encode(command, &mut buffer).unwrap();

        assert_eq!(&buffer[..], b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n");
    }
}

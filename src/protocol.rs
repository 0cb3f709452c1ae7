use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::message::Message;

/// Wire protocol format:
///
///   LEN(u32 BE) FIELD FIELD FIELD FIELD FIELD FIELD
///
/// where every FIELD is `LEN(u16 BE) UTF-8 BYTES`, in this order:
///
///   cmd      ≤ 10 bytes
///   from     ≤ 10 bytes
///   to       ≤ 10 bytes
///   channel  ≤ 10 bytes
///   message  ≤ 960 bytes
///   color    ≤ 10 bytes
///
/// The outer length prefix lets the decoder wait for a complete record no
/// matter how TCP splits or coalesces the bytes.
pub const FIELD_MAX: usize = 10;
pub const BODY_MAX: usize = 960;

const FIELDS: [(&str, usize); 6] = [
    ("cmd", FIELD_MAX),
    ("from", FIELD_MAX),
    ("to", FIELD_MAX),
    ("channel", FIELD_MAX),
    ("message", BODY_MAX),
    ("color", FIELD_MAX),
];

const LEN_PREFIX: usize = 4;
const FIELD_PREFIX: usize = 2;

/// Largest payload a well-formed record can have.
pub const MAX_PAYLOAD: usize = FIELD_PREFIX * FIELDS.len() + 5 * FIELD_MAX + BODY_MAX;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame of {0} bytes exceeds the {MAX_PAYLOAD}-byte limit")]
    FrameTooLarge(usize),

    #[error("field '{field}' is {len} bytes, limit is {max}")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("malformed frame: {0}")]
    Malformed(&'static str),

    #[error("field '{0}' is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A tokio codec that frames [`Message`] records with a length prefix.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl MessageCodec {
    fn fields(msg: &Message) -> [&str; 6] {
        [
            &msg.cmd,
            &msg.from,
            &msg.to,
            &msg.channel,
            &msg.message,
            &msg.color,
        ]
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LEN_PREFIX {
            return Ok(None);
        }

        let mut prefix = &src[..LEN_PREFIX];
        let len = prefix.get_u32() as usize;
        if len > MAX_PAYLOAD {
            return Err(CodecError::FrameTooLarge(len));
        }

        if src.len() < LEN_PREFIX + len {
            // Not enough data yet; make room for the rest of the frame.
            src.reserve(LEN_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LEN_PREFIX);
        let mut payload = src.split_to(len);

        let mut values: [String; 6] = Default::default();
        for (&(field, max), value) in FIELDS.iter().zip(values.iter_mut()) {
            if payload.remaining() < FIELD_PREFIX {
                return Err(CodecError::Malformed("missing field length"));
            }
            let n = payload.get_u16() as usize;
            if n > max {
                return Err(CodecError::FieldTooLong { field, len: n, max });
            }
            if payload.remaining() < n {
                return Err(CodecError::Malformed("field runs past end of frame"));
            }
            let bytes = payload.split_to(n);
            *value = String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::InvalidUtf8(field))?;
        }

        if payload.has_remaining() {
            return Err(CodecError::Malformed("trailing bytes after last field"));
        }

        let [cmd, from, to, channel, message, color] = values;
        Ok(Some(Message {
            cmd,
            from,
            to,
            channel,
            message,
            color,
        }))
    }
}

impl Encoder<&Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: &Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let values = Self::fields(item);

        let mut len = 0;
        for (&(field, max), value) in FIELDS.iter().zip(values) {
            if value.len() > max {
                return Err(CodecError::FieldTooLong {
                    field,
                    len: value.len(),
                    max,
                });
            }
            len += FIELD_PREFIX + value.len();
        }

        dst.reserve(LEN_PREFIX + len);
        dst.put_u32(len as u32);
        for value in values {
            dst.put_u16(value.len() as u16);
            dst.put_slice(value.as_bytes());
        }
        Ok(())
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        Encoder::<&Message>::encode(self, &item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(msg: &Message) -> BytesMut {
        let mut buf = BytesMut::new();
        MessageCodec.encode(msg, &mut buf).unwrap();
        buf
    }

    fn sample() -> Message {
        Message {
            color: "31".into(),
            ..Message::new("dm", "hello bob")
                .sender("alice")
                .recipient("bob")
                .on_channel("global")
        }
    }

    // ── Decoder ──────────────────────────────────────────────────

    #[test]
    fn decode_complete_frame() {
        let mut buf = encoded(&sample());
        let msg = MessageCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg, sample());
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_partial_frame_then_complete() {
        let full = encoded(&sample());
        let mut buf = BytesMut::from(&full[..7]);

        // Not enough data yet.
        assert!(MessageCodec.decode(&mut buf).unwrap().is_none());

        // The rest arrives.
        buf.extend_from_slice(&full[7..]);
        let msg = MessageCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(msg.message, "hello bob");
    }

    #[test]
    fn decode_two_frames_in_one_read() {
        let mut buf = encoded(&sample());
        buf.extend_from_slice(&encoded(&Message::new("fin", "")));

        let first = MessageCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.cmd, "dm");
        let second = MessageCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.cmd, "fin");
        assert!(buf.is_empty());
        assert!(MessageCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn decode_rejects_oversized_frame() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_PAYLOAD + 1) as u32);
        assert!(matches!(
            MessageCodec.decode(&mut buf),
            Err(CodecError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn decode_rejects_oversized_field() {
        let mut buf = BytesMut::new();
        buf.put_u32(2 + 11);
        buf.put_u16(11);
        buf.put_slice(b"abcdefghijk");
        assert!(matches!(
            MessageCodec.decode(&mut buf),
            Err(CodecError::FieldTooLong { field: "cmd", .. })
        ));
    }

    #[test]
    fn decode_rejects_invalid_utf8() {
        let mut buf = BytesMut::new();
        buf.put_u32(2 + 2 + 10);
        buf.put_u16(2);
        buf.put_slice(&[0xff, 0xfe]);
        for _ in 0..5 {
            buf.put_u16(0);
        }
        assert!(matches!(
            MessageCodec.decode(&mut buf),
            Err(CodecError::InvalidUtf8("cmd"))
        ));
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut buf = BytesMut::new();
        buf.put_u32(12 + 1);
        for _ in 0..6 {
            buf.put_u16(0);
        }
        buf.put_u8(0);
        assert!(matches!(
            MessageCodec.decode(&mut buf),
            Err(CodecError::Malformed(_))
        ));
    }

    // ── Encoder ──────────────────────────────────────────────────

    #[test]
    fn encode_rejects_long_username() {
        let msg = Message::new("", "hi").sender("much-too-long");
        let mut buf = BytesMut::new();
        assert!(matches!(
            MessageCodec.encode(&msg, &mut buf),
            Err(CodecError::FieldTooLong { field: "from", .. })
        ));
        assert!(buf.is_empty());
    }

    #[test]
    fn encode_accepts_full_body() {
        let body = "x".repeat(BODY_MAX);
        let buf = encoded(&Message::new("", body));
        assert_eq!(buf.len(), LEN_PREFIX + 12 + BODY_MAX);
    }
}

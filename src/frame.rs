//! The frame codec boundary: the one place this crate talks to the external
//! `serde_amqp`/`fe2o3-amqp-types` collaborators that own the AMQP type system.
//!
//! A single AMQP frame on the wire is a big-endian `u32` total size (including
//! itself), a one-byte data offset (in 4-byte words, counted from the start of
//! the frame), a one-byte frame type (`0x00` for AMQP), a big-endian `u16`
//! channel, any extended header bytes the `doff` implies (unused here), and a
//! body. For every performative except TRANSFER the body is exactly one
//! encoded performative; TRANSFER's body is a performative followed by an
//! opaque payload section copied verbatim.

use bytes::{BufMut, Bytes, BytesMut};
use fe2o3_amqp_types::performatives::{
    Attach, Begin, Close, Detach, Disposition, End, Flow, Open, Performative, Transfer,
};
use serde_amqp::de::Deserializer;
use serde_amqp::ser::Serializer;
use serde_amqp::read::IoReader;

use crate::error::EngineError;

pub const FRAME_TYPE_AMQP: u8 = 0x00;
const FIXED_HEADER_LEN: usize = 8;

/// A decoded AMQP frame, channel-tagged, with TRANSFER's trailing payload
/// (if any) kept as raw bytes rather than parsed into a message.
#[derive(Debug, Clone)]
pub struct Frame {
    pub channel: u16,
    pub body: FrameBody,
}

#[derive(Debug, Clone)]
pub enum FrameBody {
    Open(Open),
    Begin(Begin),
    Attach(Attach),
    Flow(Flow),
    Transfer { performative: Transfer, payload: Bytes },
    Disposition(Disposition),
    Detach(Detach),
    End(End),
    Close(Close),
    /// The zero-performative heartbeat frame used by the idle/keepalive tick.
    Empty,
}

impl Frame {
    pub fn empty(channel: u16) -> Self {
        Frame {
            channel,
            body: FrameBody::Empty,
        }
    }
}

/// Serialize one frame (header + performative + optional payload) into `buf`.
///
/// Returns an error only if the encoded size before any splitting already
/// exceeds the `max_frame_size`; splitting a TRANSFER across multiple frames
/// is the caller's responsibility (see the tpwork sender path).
pub fn encode_frame(frame: &Frame, max_frame_size: u32, buf: &mut BytesMut) -> Result<(), EngineError> {
    let start = buf.len();
    buf.put_u32(0); // size placeholder
    buf.put_u8(2); // doff: 2 * 4 = 8-byte fixed header, no extended header
    buf.put_u8(FRAME_TYPE_AMQP);
    buf.put_u16(frame.channel);

    let mut body_buf = BytesMut::new();
    let payload = match &frame.body {
        FrameBody::Open(p) => {
            encode_performative(&Performative::Open(p.clone()), &mut body_buf)?;
            None
        }
        FrameBody::Begin(p) => {
            encode_performative(&Performative::Begin(p.clone()), &mut body_buf)?;
            None
        }
        FrameBody::Attach(p) => {
            encode_performative(&Performative::Attach(Box::new(p.clone())), &mut body_buf)?;
            None
        }
        FrameBody::Flow(p) => {
            encode_performative(&Performative::Flow(p.clone()), &mut body_buf)?;
            None
        }
        FrameBody::Transfer { performative, payload } => {
            encode_performative(&Performative::Transfer(Box::new(performative.clone())), &mut body_buf)?;
            Some(payload.clone())
        }
        FrameBody::Disposition(p) => {
            encode_performative(&Performative::Disposition(p.clone()), &mut body_buf)?;
            None
        }
        FrameBody::Detach(p) => {
            encode_performative(&Performative::Detach(p.clone()), &mut body_buf)?;
            None
        }
        FrameBody::End(p) => {
            encode_performative(&Performative::End(p.clone()), &mut body_buf)?;
            None
        }
        FrameBody::Close(p) => {
            encode_performative(&Performative::Close(p.clone()), &mut body_buf)?;
            None
        }
        FrameBody::Empty => None,
    };

    buf.extend_from_slice(&body_buf);
    if let Some(payload) = &payload {
        buf.extend_from_slice(payload);
    }

    let total_len = buf.len() - start;
    if max_frame_size != 0 && total_len > max_frame_size as usize {
        buf.truncate(start);
        return Err(EngineError::framing_error(format!(
            "encoded frame of {total_len} bytes exceeds max-frame-size {max_frame_size}"
        )));
    }
    let size_bytes = (total_len as u32).to_be_bytes();
    buf[start..start + 4].copy_from_slice(&size_bytes);
    Ok(())
}

fn encode_performative(performative: &Performative, buf: &mut BytesMut) -> Result<(), EngineError> {
    let mut writer = Vec::new();
    let mut serializer = Serializer::from(&mut writer);
    serde::Serialize::serialize(performative, &mut serializer).map_err(EngineError::Codec)?;
    buf.extend_from_slice(&writer);
    Ok(())
}

/// Attempt to strip one complete frame off the front of `input`. Returns
/// `Ok(None)` if fewer than a full frame is currently buffered.
pub fn decode_frame(input: &mut BytesMut) -> Result<Option<Frame>, EngineError> {
    if input.len() < 4 {
        return Ok(None);
    }
    let size = u32::from_be_bytes(input[0..4].try_into().unwrap()) as usize;
    if size < FIXED_HEADER_LEN {
        return Err(EngineError::framing_error(format!(
            "frame size {size} smaller than the fixed 8-byte header"
        )));
    }
    if input.len() < size {
        return Ok(None);
    }

    let mut frame_bytes = input.split_to(size);
    let doff = frame_bytes[4];
    let frame_type = frame_bytes[5];
    let channel = u16::from_be_bytes(frame_bytes[6..8].try_into().unwrap());
    if frame_type != FRAME_TYPE_AMQP {
        return Err(EngineError::framing_error(format!(
            "unsupported frame type {frame_type}"
        )));
    }
    let data_offset = doff as usize * 4;
    if data_offset < FIXED_HEADER_LEN || data_offset > size {
        return Err(EngineError::framing_error("invalid data offset"));
    }
    let mut body = frame_bytes.split_off(data_offset);
    let _ = frame_bytes; // header + extended header, discarded

    if body.is_empty() {
        return Ok(Some(Frame::empty(channel)));
    }

    let consumed_before = body.len();
    let performative: Performative = {
        let reader = IoReader::new(body.as_ref());
        let mut deserializer = Deserializer::new(reader);
        serde::Deserialize::deserialize(&mut deserializer).map_err(EngineError::Codec)?
    };
    // `serde_amqp` does not report how many bytes it consumed from a shared
    // buffer, so for the payload-bearing TRANSFER case we re-encode to learn
    // the performative's own length and treat the remainder as payload.
    let perf_len = {
        let mut probe = BytesMut::new();
        encode_performative(&performative, &mut probe)?;
        probe.len().min(consumed_before)
    };
    let payload = body.split_off(perf_len);

    let frame_body = match performative {
        Performative::Open(p) => FrameBody::Open(p),
        Performative::Begin(p) => FrameBody::Begin(p),
        Performative::Attach(p) => FrameBody::Attach(*p),
        Performative::Flow(p) => FrameBody::Flow(p),
        Performative::Transfer(p) => FrameBody::Transfer {
            performative: *p,
            payload: payload.freeze(),
        },
        Performative::Disposition(p) => FrameBody::Disposition(p),
        Performative::Detach(p) => FrameBody::Detach(p),
        Performative::End(p) => FrameBody::End(p),
        Performative::Close(p) => FrameBody::Close(p),
    };

    Ok(Some(Frame { channel, body: frame_body }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fe2o3_amqp_types::performatives::Close;

    #[test]
    fn test_encode_empty_frame() {
        let mut buf = BytesMut::new();
        encode_frame(&Frame::empty(0), 512, &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x00, 0x00, 0x00, 0x08, 0x02, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_decode_empty_frame() {
        let mut buf = BytesMut::from(&[0x00u8, 0x00, 0x00, 0x08, 0x02, 0x00, 0x00, 0x00][..]);
        let frame = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(frame.channel, 0);
        assert!(matches!(frame.body, FrameBody::Empty));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_roundtrip_close_frame() {
        let close = Close { error: None };
        let mut buf = BytesMut::new();
        encode_frame(
            &Frame {
                channel: 3,
                body: FrameBody::Close(close),
            },
            512,
            &mut buf,
        )
        .unwrap();
        let decoded = decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.channel, 3);
        assert!(matches!(decoded.body, FrameBody::Close(Close { error: None })));
    }

    #[test]
    fn test_partial_frame_returns_none() {
        let mut buf = BytesMut::from(&[0x00u8, 0x00, 0x00, 0x10, 0x02, 0x00][..]);
        assert!(decode_frame(&mut buf).unwrap().is_none());
    }
}

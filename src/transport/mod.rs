//! The byte-stream transport buffer: a capacity-driven push/process input
//! side and a pending-driven peek/pop output side, with the AMQP header
//! handshake folded in as the first thing each side does.
//!
//! This is the one place bytes are owned; everything above it deals in
//! decoded [`crate::frame::Frame`]s.

pub mod header;
pub mod layer;

use bytes::BytesMut;

use crate::error::EngineError;
use crate::frame::{self, Frame};

pub use layer::{IoLayer, PassthroughLayer};

const MIN_MAX_FRAME_SIZE: u32 = fe2o3_amqp_types::definitions::MIN_MAX_FRAME_SIZE as u32;

#[derive(Debug)]
pub struct Transport {
    /// The max-frame-size this engine advertises in its own OPEN.
    pub max_frame_size_local: u32,
    /// The max-frame-size the peer advertised, clamped to the protocol
    /// minimum; `0` until OPEN has been received, meaning "no limit yet known".
    pub max_frame_size_peer: u32,

    /// Layers run ahead of the AMQP frame codec, outer to inner, on every
    /// `process`/`push_frame`/tick. Empty until a SASL/TLS negotiation
    /// installs one; the AMQP codec below is the fixed terminal stage.
    layers: Vec<Box<dyn IoLayer>>,

    input: BytesMut,
    output: BytesMut,
    tail_closed: bool,
    head_closed: bool,

    header_matched_in: bool,
    header_written_out: bool,

    input_bytes_total: u64,
    output_bytes_total: u64,
}

impl Transport {
    pub fn new(max_frame_size_local: u32) -> Self {
        Transport {
            max_frame_size_local: max_frame_size_local.max(MIN_MAX_FRAME_SIZE),
            max_frame_size_peer: 0,
            layers: Vec::new(),
            input: BytesMut::new(),
            output: BytesMut::new(),
            tail_closed: false,
            head_closed: false,
            header_matched_in: false,
            header_written_out: false,
            input_bytes_total: 0,
            output_bytes_total: 0,
        }
    }

    /// Install a layer in front of the AMQP codec (outermost last), e.g. a
    /// SASL or TLS stage negotiated before the AMQP header is exchanged.
    pub fn push_layer(&mut self, layer: Box<dyn IoLayer>) {
        self.layers.push(layer);
    }

    // ---- input side ----

    /// Bytes the embedder may currently `push`, or `None` once `close_tail`
    /// has latched EOS.
    pub fn capacity(&self) -> Option<usize> {
        if self.tail_closed {
            None
        } else {
            Some(usize::MAX - self.input.len())
        }
    }

    pub fn push(&mut self, src: &[u8]) -> Result<(), EngineError> {
        match self.capacity() {
            None => Err(EngineError::Overflow("input tail is closed")),
            Some(cap) if src.len() > cap => Err(EngineError::Overflow("push exceeds capacity()")),
            Some(_) => {
                self.input.extend_from_slice(src);
                Ok(())
            }
        }
    }

    pub fn close_tail(&mut self) {
        self.tail_closed = true;
    }

    pub fn tail_closed(&self) -> bool {
        self.tail_closed
    }

    /// Drain the AMQP header (if not yet matched) then as many complete
    /// frames as are currently buffered. Mirrors `process`/`consume` of the
    /// framing design: residual partial-frame bytes are simply left in place
    /// (equivalent to "memmoved to buffer start", since `BytesMut::split_to`
    /// already advances the start in place).
    pub fn process(&mut self) -> Result<Vec<Frame>, EngineError> {
        let mut layer_frames = Vec::new();
        for layer in self.layers.iter_mut() {
            layer_frames.extend(layer.process_input(&mut self.input)?);
        }
        if !layer_frames.is_empty() {
            return Ok(layer_frames);
        }

        if !self.header_matched_in {
            if self.input.len() < 8 {
                return Ok(Vec::new());
            }
            let head = self.input.split_to(8);
            if !header::matches(&head) {
                return Err(EngineError::framing_error(format!(
                    "protocol header mismatch: {head:02x?}"
                )));
            }
            self.header_matched_in = true;
        }

        let mut frames = Vec::new();
        loop {
            let before = self.input.len();
            match frame::decode_frame(&mut self.input)? {
                Some(frame) => {
                    self.input_bytes_total += (before - self.input.len()) as u64;
                    frames.push(frame);
                }
                None => break,
            }
        }
        Ok(frames)
    }

    // ---- output side ----

    pub fn pending(&self) -> Option<usize> {
        if self.head_closed && self.output.is_empty() {
            None
        } else {
            Some(self.output.len())
        }
    }

    pub fn head(&self) -> &[u8] {
        &self.output
    }

    pub fn peek(&self, dst: &mut [u8], n: usize) -> Result<(), EngineError> {
        if n > self.output.len() {
            return Err(EngineError::Underflow {
                requested: n,
                available: self.output.len(),
            });
        }
        dst[..n].copy_from_slice(&self.output[..n]);
        Ok(())
    }

    pub fn pop(&mut self, n: usize) {
        let n = n.min(self.output.len());
        let _ = self.output.split_to(n);
        self.output_bytes_total += n as u64;
    }

    pub fn close_head(&mut self) {
        self.head_closed = true;
    }

    pub fn head_closed(&self) -> bool {
        self.head_closed
    }

    /// Serialize one frame onto the output buffer, writing the protocol
    /// header first if this is the first frame produced.
    pub fn push_frame(&mut self, frame: &Frame) -> Result<(), EngineError> {
        if !self.header_written_out {
            self.output.extend_from_slice(&header::AMQP_HEADER);
            self.header_written_out = true;
        }
        frame::encode_frame(frame, self.max_frame_size_peer, &mut self.output)?;

        for layer in self.layers.iter_mut().rev() {
            layer.process_output(&mut self.output)?;
        }
        Ok(())
    }

    /// Offer every installed layer a chance to contribute its own deadline,
    /// returning the earliest one. Pass-through layers contribute none.
    pub fn process_tick(&mut self, now: u64) -> Option<u64> {
        self.layers.iter_mut().filter_map(|l| l.process_tick(now)).min()
    }

    /// True if any installed layer is still sitting on bytes it hasn't
    /// handed onward in either direction (mirrors `pn_transport_quiesced`'s
    /// per-layer `buffered_output` check).
    pub fn has_buffered_layer_io(&self) -> bool {
        self.layers.iter().any(|l| l.buffered_input() || l.buffered_output())
    }

    pub fn input_bytes_total(&self) -> u64 {
        self.input_bytes_total
    }

    pub fn output_bytes_total(&self) -> u64 {
        self.output_bytes_total
    }

    /// Install the peer's advertised max-frame-size, clamped to the protocol
    /// minimum (§4.3 OPEN handling).
    pub fn set_peer_max_frame_size(&mut self, advertised: u32) -> u32 {
        let clamped = if advertised == 0 {
            0
        } else {
            advertised.max(MIN_MAX_FRAME_SIZE)
        };
        self.max_frame_size_peer = clamped;
        clamped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBody;

    #[test]
    fn test_header_exchange() {
        let mut t = Transport::new(1024);
        t.push(&header::AMQP_HEADER).unwrap();
        let frames = t.process().unwrap();
        assert!(frames.is_empty());
        assert!(t.header_matched_in);
    }

    #[test]
    fn test_header_mismatch_errors() {
        let mut t = Transport::new(1024);
        t.push(b"GARBAGE!").unwrap();
        assert!(t.process().is_err());
    }

    #[test]
    fn test_push_frame_writes_header_once() {
        let mut t = Transport::new(1024);
        t.push_frame(&Frame::empty(0)).unwrap();
        t.push_frame(&Frame::empty(0)).unwrap();
        assert_eq!(&t.head()[..8], &header::AMQP_HEADER);
        assert_eq!(t.pending(), Some(8 + 8 + 8));
    }

    #[test]
    fn test_roundtrip_empty_frame_through_buffers() {
        let mut a = Transport::new(1024);
        a.push_frame(&Frame::empty(7)).unwrap();

        let mut b = Transport::new(1024);
        let n = a.pending().unwrap();
        let mut buf = vec![0u8; n];
        a.peek(&mut buf, n).unwrap();
        a.pop(n);
        b.push(&buf).unwrap();
        let frames = b.process().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].channel, 7);
        assert!(matches!(frames[0].body, FrameBody::Empty));
    }
}

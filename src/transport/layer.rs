//! The I/O layer chain (§4.7): a fixed sequence of stages the transport
//! drives on every `process`/`push_frame`/tick, with the AMQP frame codec
//! as the fixed terminal stage. Earlier stages are where a SASL or TLS
//! negotiation would sit; absent one, they default to pass-through and
//! leave the byte stream untouched.
//!
//! No SASL/TLS layer is implemented here (out of scope), but the seam is:
//! installing one means pushing a transforming `IoLayer` in front of the
//! layers already present, same as `pn_io_layer_t` chains in the upstream
//! engine.

use bytes::BytesMut;

use crate::error::EngineError;
use crate::frame::Frame;

/// One stage of the transport's input/output/tick processing chain.
///
/// Default methods are the pass-through behavior: no bytes consumed, no
/// frames produced, no deadline of its own, nothing buffered. A
/// transforming layer overrides the hooks it cares about.
pub trait IoLayer: std::fmt::Debug {
    /// Consume/transform whatever of `input` this layer understands before
    /// handing it on to the next stage. The terminal AMQP stage is the only
    /// one that actually extracts [`Frame`]s.
    fn process_input(&mut self, input: &mut BytesMut) -> Result<Vec<Frame>, EngineError> {
        let _ = input;
        Ok(Vec::new())
    }

    /// Transform `output` in place after an inner stage has written to it
    /// (e.g. wrapping already-encoded frame bytes in TLS records).
    fn process_output(&mut self, output: &mut BytesMut) -> Result<(), EngineError> {
        let _ = output;
        Ok(())
    }

    /// Offer this layer's own deadline, if it keeps one (e.g. a TLS
    /// renegotiation timer). Pass-through layers keep none.
    fn process_tick(&mut self, now: u64) -> Option<u64> {
        let _ = now;
        None
    }

    /// Whether this layer is still holding input it hasn't handed onward.
    fn buffered_input(&self) -> bool {
        false
    }

    /// Whether this layer is still holding output it hasn't flushed onward.
    fn buffered_output(&self) -> bool {
        false
    }
}

/// The layer installed when no SASL/TLS negotiation is in play. Accepts all
/// the trait's defaults verbatim.
#[derive(Debug, Default)]
pub struct PassthroughLayer;

impl IoLayer for PassthroughLayer {}

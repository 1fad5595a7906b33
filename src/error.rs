//! Crate-wide error types.
//!
//! Errors are grouped by the classification in the engine's error handling design:
//! argument/state errors are returned synchronously and never touch engine state,
//! while protocol/framing errors latch a connection-level close.

use fe2o3_amqp_types::definitions;

/// Error returned by a synchronous, local operation (attach, send, settle, flow, bind).
///
/// Argument and State class errors from the error handling design map onto the
/// `IllegalState`/`InvalidArgument` variants here; they never mutate engine state.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The operation is not legal in the endpoint's current local/remote state.
    #[error("illegal state: {0}")]
    IllegalState(&'static str),

    /// The caller passed an argument the engine will not accept (e.g. an unknown handle).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A connection-, session-, or link-level protocol error has latched.
    ///
    /// Once set, the connection drains its output (a CLOSE frame) and then reports EOS;
    /// see [`crate::connection::Connection::process`].
    #[error("protocol error: {0}")]
    Protocol(#[from] definitions::Error),

    /// The peer's bytes did not decode as a legal AMQP frame.
    #[error("framing error: {0}")]
    Codec(#[from] serde_amqp::Error),

    /// The embedder violated the transport buffer backpressure contract.
    #[error("transport buffer overflow: {0}")]
    Overflow(&'static str),

    /// The embedder tried to `pop`/`peek` more bytes than `pending()` reported.
    #[error("transport buffer underflow: requested {requested}, available {available}")]
    Underflow {
        /// Bytes requested by the embedder.
        requested: usize,
        /// Bytes actually pending.
        available: usize,
    },
}

// `serde_amqp::Error::Io(std::io::Error)` isn't `Clone`, so `EngineError` can't
// derive it wholesale; the dispatcher only needs to clone a latched error to
// both drive `close()` and return it to the caller, so the `Codec` case is
// flattened to a fresh framing error instead of carrying the original cause.
impl Clone for EngineError {
    fn clone(&self) -> Self {
        match self {
            EngineError::IllegalState(s) => EngineError::IllegalState(s),
            EngineError::InvalidArgument(s) => EngineError::InvalidArgument(s),
            EngineError::Protocol(e) => EngineError::Protocol(e.clone()),
            EngineError::Codec(e) => EngineError::framing_error(e.to_string()),
            EngineError::Overflow(s) => EngineError::Overflow(s),
            EngineError::Underflow { requested, available } => EngineError::Underflow {
                requested: *requested,
                available: *available,
            },
        }
    }
}

impl EngineError {
    /// Build a [`definitions::Error`] tagged with a well-known AMQP condition and wrap it.
    pub(crate) fn protocol(condition: definitions::ErrorCondition, description: impl Into<String>) -> Self {
        Self::Protocol(definitions::Error::new(condition, Some(description.into()), None))
    }

    /// `amqp:session:window-violation` — peer sent a TRANSFER with no window left.
    pub(crate) fn window_violation() -> Self {
        Self::protocol(
            definitions::ErrorCondition::SessionError(definitions::SessionError::WindowViolation),
            "transfer received while incoming window is exhausted",
        )
    }

    /// `amqp:session:invalid-field` — this condition has no variant in the published
    /// `SessionError` enum, so it is expressed via the `Custom` escape hatch.
    pub(crate) fn invalid_field(detail: impl Into<String>) -> Self {
        Self::protocol(
            definitions::ErrorCondition::Custom(serde_amqp::primitives::Symbol::from(
                "amqp:session:invalid-field",
            )),
            detail,
        )
    }

    /// `amqp:resource-limit-exceeded` — local idle timeout expired.
    pub(crate) fn idle_timeout_expired() -> Self {
        Self::protocol(
            definitions::ErrorCondition::AmqpError(definitions::AmqpError::ResourceLimitExceeded),
            "local-idle-timeout expired",
        )
    }

    /// `amqp:connection:framing-error` — malformed bytes on the wire.
    pub(crate) fn framing_error(detail: impl Into<String>) -> Self {
        Self::protocol(
            definitions::ErrorCondition::ConnectionError(definitions::ConnectionError::FramingError),
            detail,
        )
    }
}

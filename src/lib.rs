#![deny(missing_debug_implementations)]

//! A sans-IO implementation of the AMQP 1.0 connection/session/link/delivery engine.
//!
//! The [`Connection`](connection::Connection) owns the three-level endpoint hierarchy
//! (Connection → Session → Link → Delivery) and is driven entirely by the embedder:
//! bytes flow in and out through [`transport::Transport`], application intent is
//! expressed through methods on `Connection`/`Session`/`Link`, and [`Connection::process`]
//! turns accumulated intent into an ordered, legal frame sequence.
//!
//! The engine performs no I/O and spawns no task. A real connection is built by pumping
//! bytes read from a socket into the transport's input side, calling
//! [`Connection::process`] (and periodically [`Connection::tick`]), then draining the
//! transport's output side back onto the socket.

pub mod delivery;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod link;
pub mod session;
pub mod terminus;
pub mod transport;

pub mod connection;

pub use connection::{Connection, ConnectionBuilder};
pub use error::EngineError;
pub use link::{Link, LinkId, Role};
pub use session::{Session, SessionId};

//! Typestate builder for [`Connection`](super::Connection), mirroring the
//! teacher crate's `WithoutContainerId`/`WithContainerId` builder pattern:
//! a container id is mandatory and the type system enforces it is set
//! exactly once before `open()`.

use fe2o3_amqp_types::definitions::MIN_MAX_FRAME_SIZE;

use super::Connection;

/// Marker: no container id has been supplied yet. [`ConnectionBuilder::build`]
/// is not available in this state.
#[derive(Debug)]
pub struct WithoutContainerId {}

/// Marker: a container id has been supplied; the connection can be built.
#[derive(Debug)]
pub struct WithContainerId {
    container_id: String,
}

/// Builds a [`Connection`] with a default max-frame-size, channel-max, and
/// no idle timeout unless overridden.
#[derive(Debug)]
pub struct ConnectionBuilder<Mode> {
    mode: Mode,
    max_frame_size: u32,
    channel_max: u16,
    idle_timeout: Option<u32>,
    hostname: Option<String>,
}

impl ConnectionBuilder<WithoutContainerId> {
    pub(super) fn new() -> Self {
        ConnectionBuilder {
            mode: WithoutContainerId {},
            max_frame_size: MIN_MAX_FRAME_SIZE as u32 * 8,
            channel_max: u16::MAX,
            idle_timeout: None,
            hostname: None,
        }
    }

    pub fn container_id(self, container_id: impl Into<String>) -> ConnectionBuilder<WithContainerId> {
        ConnectionBuilder {
            mode: WithContainerId {
                container_id: container_id.into(),
            },
            max_frame_size: self.max_frame_size,
            channel_max: self.channel_max,
            idle_timeout: self.idle_timeout,
            hostname: self.hostname,
        }
    }
}

impl<Mode> ConnectionBuilder<Mode> {
    pub fn max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = max_frame_size.max(MIN_MAX_FRAME_SIZE as u32);
        self
    }

    pub fn channel_max(mut self, channel_max: u16) -> Self {
        self.channel_max = channel_max;
        self
    }

    pub fn idle_timeout(mut self, idle_timeout_ms: u32) -> Self {
        self.idle_timeout = Some(idle_timeout_ms);
        self
    }

    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }
}

impl ConnectionBuilder<WithContainerId> {
    pub fn build(self) -> Connection {
        Connection::new(
            self.mode.container_id,
            self.max_frame_size,
            self.channel_max,
            self.idle_timeout,
            self.hostname,
        )
    }
}

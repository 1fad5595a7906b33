//! Idle timeout / keepalive tick (§4.8). Time-injected: the engine reads no
//! clock of its own, so every deadline is computed from the `now` the
//! embedder passes in.

use crate::error::EngineError;
use crate::frame::Frame;

use super::{Connection, Millis};

impl Connection {
    /// Advance the idle/keepalive state machine to `now` and return the next
    /// absolute deadline the embedder should call back at, if any.
    ///
    /// Mirrors the upstream engine's tick handler: a local idle timeout
    /// expiring latches a connection error (driving CLOSE through the normal
    /// error path); a remote idle timeout approaching emits an empty
    /// heartbeat frame if nothing else is currently queued to send.
    pub fn tick(&mut self, now: Millis) -> Option<Millis> {
        let mut deadline: Option<Millis> = None;

        if let Some(local_idle_timeout) = self.idle_timeout.filter(|t| *t > 0) {
            let local_idle_timeout = local_idle_timeout as Millis;
            let input_bytes = self.transport.input_bytes_total();
            if self.dead_remote_deadline.is_none() || self.last_seen_input_bytes != input_bytes {
                self.dead_remote_deadline = Some(now + local_idle_timeout);
                self.last_seen_input_bytes = input_bytes;
            } else if self.dead_remote_deadline.is_some_and(|d| d <= now) {
                self.dead_remote_deadline = Some(now + local_idle_timeout);
                self.do_error(EngineError::idle_timeout_expired());
            }
            deadline = self.dead_remote_deadline;
        }

        if let Some(remote_idle_timeout) = self.remote_idle_timeout.filter(|t| *t > 0) {
            if !self.close_sent {
                let remote_idle_timeout = remote_idle_timeout as Millis;
                let half = remote_idle_timeout / 2;
                let output_bytes = self.transport.output_bytes_total();
                if self.keepalive_deadline.is_none() || self.last_seen_output_bytes != output_bytes {
                    self.keepalive_deadline = Some(now + half);
                    self.last_seen_output_bytes = output_bytes;
                } else if self.keepalive_deadline.is_some_and(|d| d <= now) {
                    self.keepalive_deadline = Some(now + half);
                    if self.transport.pending().map_or(true, |p| p == 0) {
                        let _ = self.transport.push_frame(&Frame::empty(0));
                    }
                }
                deadline = match (deadline, self.keepalive_deadline) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, None) => a,
                    (None, b) => b,
                };
            }
        }

        let layer_deadline = self.transport.process_tick(now);
        deadline = match (deadline, layer_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, None) => a,
            (None, b) => b,
        };

        deadline
    }
}

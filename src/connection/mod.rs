//! Connection endpoint: the top of the hierarchy. Owns the session arena,
//! the endpoint/work/tpwork lists, and the bound [`Transport`].

mod builder;
mod dispatch;
mod process;
mod tick;

pub use builder::ConnectionBuilder;

use std::collections::{BTreeMap, VecDeque};

use fe2o3_amqp_types::definitions::{self, Fields};
use fe2o3_amqp_types::primitives::Symbol;
use slab::Slab;

use crate::delivery::Delivery;
use crate::endpoint::{EndpointHeader, EndpointRef, HalfState};
use crate::error::EngineError;
use crate::link::{Link, LinkId, Role};
use crate::session::{Session, SessionId};
use crate::transport::Transport;

/// Absolute tick time, in milliseconds, on whatever monotonic clock the
/// embedder uses. The engine never reads a real clock itself.
pub type Millis = u64;

/// A delivery address within the arena tree: which session, which link
/// within it, and which slab index within that link's delivery arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryRef {
    pub session: SessionId,
    pub link: LinkId,
    pub index: usize,
}

#[derive(Debug)]
pub struct Connection {
    pub endpoint: EndpointHeader,

    pub container_id: String,
    pub hostname: Option<String>,
    pub max_frame_size: u32,
    pub channel_max: u16,
    pub idle_timeout: Option<u32>,
    pub offered_capabilities: Option<Vec<Symbol>>,
    pub desired_capabilities: Option<Vec<Symbol>>,
    pub properties: Option<Fields>,

    pub remote_container_id: Option<String>,
    pub remote_hostname: Option<String>,
    pub remote_channel_max: u16,
    pub remote_idle_timeout: Option<u32>,

    pub sessions: Slab<Session>,
    pub local_channels: BTreeMap<u16, usize>,
    pub remote_channels: BTreeMap<u16, usize>,

    pub modified: VecDeque<EndpointRef>,
    pub work: VecDeque<DeliveryRef>,
    pub tpwork: VecDeque<DeliveryRef>,

    pub open_sent: bool,
    pub close_sent: bool,
    pub close_rcvd: bool,

    pub transport: Transport,

    pub(crate) dead_remote_deadline: Option<Millis>,
    pub(crate) keepalive_deadline: Option<Millis>,
    pub(crate) last_seen_input_bytes: u64,
    pub(crate) last_seen_output_bytes: u64,
}

impl Connection {
    pub fn builder() -> ConnectionBuilder<builder::WithoutContainerId> {
        ConnectionBuilder::new()
    }

    fn new(
        container_id: String,
        max_frame_size: u32,
        channel_max: u16,
        idle_timeout: Option<u32>,
        hostname: Option<String>,
    ) -> Self {
        Connection {
            endpoint: EndpointHeader::default(),
            container_id,
            hostname,
            max_frame_size,
            channel_max,
            idle_timeout,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
            remote_container_id: None,
            remote_hostname: None,
            remote_channel_max: u16::MAX,
            remote_idle_timeout: None,
            sessions: Slab::new(),
            local_channels: BTreeMap::new(),
            remote_channels: BTreeMap::new(),
            modified: VecDeque::new(),
            work: VecDeque::new(),
            tpwork: VecDeque::new(),
            open_sent: false,
            close_sent: false,
            close_rcvd: false,
            transport: Transport::new(max_frame_size),
            dead_remote_deadline: None,
            keepalive_deadline: None,
            last_seen_input_bytes: 0,
            last_seen_output_bytes: 0,
        }
    }

    // ---- endpoint graph (§4.1) ----

    fn mark_connection_modified(&mut self) {
        if self.endpoint.mark_modified() {
            self.modified.push_back(EndpointRef::Connection);
        }
    }

    fn mark_session_modified(&mut self, id: SessionId) {
        let session = &mut self.sessions[id.0];
        if session.endpoint.mark_modified() {
            self.modified.push_back(EndpointRef::Session(id));
        }
    }

    fn mark_link_modified(&mut self, session: SessionId, link: LinkId) {
        let link_mut = &mut self.sessions[session.0].links[link.0];
        if link_mut.endpoint.mark_modified() {
            self.modified.push_back(EndpointRef::Link(session, link));
        }
    }

    // ---- application intent: connection lifecycle ----

    /// Mark the connection's local half ACTIVE; `process()` will emit OPEN.
    pub fn open(&mut self) -> Result<(), EngineError> {
        if self.endpoint.state.local != HalfState::Uninit {
            return Err(EngineError::IllegalState("connection already opened"));
        }
        self.endpoint.state.local = HalfState::Active;
        self.mark_connection_modified();
        Ok(())
    }

    /// Mark the connection's local half CLOSED; `process()` will emit CLOSE
    /// once any deferred teardown conditions clear.
    pub fn close(&mut self, error: Option<definitions::Error>) -> Result<(), EngineError> {
        if self.endpoint.state.local == HalfState::Closed {
            return Err(EngineError::IllegalState("connection already closed"));
        }
        if let Some(error) = error {
            self.endpoint.local_condition.set(error);
        }
        self.endpoint.state.local = HalfState::Closed;
        self.mark_connection_modified();
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.endpoint.state.is_terminal()
    }

    pub fn remote_condition(&self) -> Option<&definitions::Error> {
        self.endpoint.remote_condition.error.as_ref()
    }

    // ---- application intent: session lifecycle ----

    /// Create a local session. The returned id is stable; `process()` will
    /// assign a channel and emit BEGIN on the next `ssn_setup` phase.
    pub fn begin_session(&mut self, incoming_capacity: u64) -> SessionId {
        let idx = self.sessions.insert(Session::new(incoming_capacity));
        let id = SessionId(idx);
        self.sessions[idx].endpoint.state.local = HalfState::Active;
        self.mark_session_modified(id);
        id
    }

    pub fn end_session(&mut self, id: SessionId, error: Option<definitions::Error>) -> Result<(), EngineError> {
        let session = self
            .sessions
            .get_mut(id.0)
            .ok_or(EngineError::InvalidArgument("unknown session"))?;
        if session.endpoint.state.local == HalfState::Closed {
            return Err(EngineError::IllegalState("session already ended"));
        }
        if let Some(error) = error {
            session.endpoint.local_condition.set(error);
        }
        session.endpoint.state.local = HalfState::Closed;
        self.mark_session_modified(id);
        Ok(())
    }

    /// Locally open a session the peer initiated (discovered, e.g., by
    /// scanning `sessions` after a BEGIN with no matching local channel was
    /// mirrored in). Distinct from `begin_session`, which always inserts a
    /// brand-new session; this activates one dispatch already created.
    pub fn open_session(&mut self, id: SessionId) -> Result<(), EngineError> {
        let session = self
            .sessions
            .get_mut(id.0)
            .ok_or(EngineError::InvalidArgument("unknown session"))?;
        if session.endpoint.state.local != HalfState::Uninit {
            return Err(EngineError::IllegalState("session already opened"));
        }
        session.endpoint.state.local = HalfState::Active;
        self.mark_session_modified(id);
        Ok(())
    }

    pub fn session(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(id.0)
    }

    pub fn session_mut(&mut self, id: SessionId) -> Option<&mut Session> {
        self.sessions.get_mut(id.0)
    }

    // ---- application intent: link lifecycle ----

    pub fn attach_link(&mut self, session: SessionId, role: Role, name: impl Into<String>) -> Result<LinkId, EngineError> {
        let session_mut = self
            .sessions
            .get_mut(session.0)
            .ok_or(EngineError::InvalidArgument("unknown session"))?;
        let name = name.into();
        let is_receiver = bool::from(&role);
        let mut link = Link::new(role, name.clone());
        link.endpoint.state.local = HalfState::Active;
        let idx = session_mut.links.insert(link);
        session_mut.links_by_name.insert((name, is_receiver), idx);
        let id = LinkId(idx);
        self.mark_link_modified(session, id);
        Ok(id)
    }

    pub fn detach_link(&mut self, session: SessionId, link: LinkId, error: Option<definitions::Error>) -> Result<(), EngineError> {
        let link_mut = self
            .sessions
            .get_mut(session.0)
            .and_then(|s| s.links.get_mut(link.0))
            .ok_or(EngineError::InvalidArgument("unknown link"))?;
        if link_mut.endpoint.state.local == HalfState::Closed {
            return Err(EngineError::IllegalState("link already detached"));
        }
        if let Some(error) = error {
            link_mut.endpoint.local_condition.set(error);
        }
        link_mut.endpoint.state.local = HalfState::Closed;
        self.mark_link_modified(session, link);
        Ok(())
    }

    pub fn link(&self, session: SessionId, link: LinkId) -> Option<&Link> {
        self.sessions.get(session.0).and_then(|s| s.links.get(link.0))
    }

    pub fn link_mut(&mut self, session: SessionId, link: LinkId) -> Option<&mut Link> {
        self.sessions.get_mut(session.0).and_then(|s| s.links.get_mut(link.0))
    }

    // ---- delivery engine (§4.2) ----

    /// `new_delivery`: reuse from the link's settled free-list, else allocate.
    pub fn new_delivery(&mut self, session: SessionId, link_id: LinkId, tag: crate::delivery::DeliveryTag) -> Result<DeliveryRef, EngineError> {
        let link = self
            .sessions
            .get_mut(session.0)
            .and_then(|s| s.links.get_mut(link_id.0))
            .ok_or(EngineError::InvalidArgument("unknown link"))?;

        let index = if let Some(reused) = link.settled.pop() {
            link.deliveries[reused].reset_for_reuse(tag);
            reused
        } else {
            link.deliveries.insert(Delivery::new(tag))
        };
        link.unsettled.push_back(index);
        if link.current.is_none() {
            link.current = Some(index);
        }

        let dref = DeliveryRef { session, link: link_id, index };
        self.work_update(dref);
        Ok(dref)
    }

    /// Sender: append payload bytes to `dref`'s buffer and mark it for
    /// outbound transfer. Returns the number of bytes accepted.
    pub fn send(&mut self, session: SessionId, link_id: LinkId, dref: DeliveryRef, bytes: &[u8]) -> Result<usize, EngineError> {
        let link = self
            .sessions
            .get_mut(session.0)
            .and_then(|s| s.links.get_mut(link_id.0))
            .ok_or(EngineError::InvalidArgument("unknown link"))?;
        let delivery = link
            .deliveries
            .get_mut(dref.index)
            .ok_or(EngineError::InvalidArgument("unknown delivery"))?;
        delivery.bytes.extend_from_slice(bytes);
        self.sessions[session.0].outgoing_bytes += bytes.len() as u64;
        self.mark_delivery_tpwork(dref);
        Ok(bytes.len())
    }

    /// Receiver: copy as much of `dref`'s buffered payload into `dst` as
    /// fits, trimming what was read. Re-marks tpwork to prompt a flow
    /// replenish if the session's incoming window is currently exhausted.
    pub fn recv(&mut self, session: SessionId, link_id: LinkId, dref: DeliveryRef, dst: &mut [u8]) -> Result<usize, EngineError> {
        let link = self
            .sessions
            .get_mut(session.0)
            .and_then(|s| s.links.get_mut(link_id.0))
            .ok_or(EngineError::InvalidArgument("unknown link"))?;
        let delivery = link
            .deliveries
            .get_mut(dref.index)
            .ok_or(EngineError::InvalidArgument("unknown delivery"))?;
        let n = dst.len().min(delivery.bytes.len());
        dst[..n].copy_from_slice(&delivery.bytes[..n]);
        let _ = delivery.bytes.split_to(n);
        if n > 0 {
            self.sessions[session.0].incoming_bytes = self.sessions[session.0].incoming_bytes.saturating_sub(n as u64);
            if self.sessions[session.0].incoming_window == 0 {
                self.mark_delivery_tpwork(dref);
            }
        }
        Ok(n)
    }

    /// Receiver: grant `credit` additional link-credit and clear `drain`.
    pub fn flow(&mut self, session: SessionId, link_id: LinkId, credit: u32) -> Result<(), EngineError> {
        let link = self
            .sessions
            .get_mut(session.0)
            .and_then(|s| s.links.get_mut(link_id.0))
            .ok_or(EngineError::InvalidArgument("unknown link"))?;
        link.credit = link.credit.saturating_add(credit);
        link.drain = false;
        self.mark_link_modified(session, link_id);
        Ok(())
    }

    /// Receiver: grant `credit` additional link-credit and set `drain`,
    /// asking the sender to either use it or advance past it.
    pub fn drain(&mut self, session: SessionId, link_id: LinkId, credit: u32) -> Result<(), EngineError> {
        self.flow(session, link_id, credit)?;
        self.sessions[session.0].links[link_id.0].drain = true;
        Ok(())
    }

    /// Sender: acknowledge a drain request by surrendering any unused
    /// credit. A no-op unless the link is both draining and still holding
    /// credit.
    pub fn drained(&mut self, session: SessionId, link_id: LinkId) -> Result<(), EngineError> {
        let link = self
            .sessions
            .get_mut(session.0)
            .and_then(|s| s.links.get_mut(link_id.0))
            .ok_or(EngineError::InvalidArgument("unknown link"))?;
        if link.drain && link.credit > 0 {
            link.credit = 0;
            link.drained = true;
            self.mark_link_modified(session, link_id);
        }
        Ok(())
    }

    /// Sender: advertise how many deliveries are available to send.
    pub fn offered(&mut self, session: SessionId, link_id: LinkId, available: u32) -> Result<(), EngineError> {
        let link = self
            .sessions
            .get_mut(session.0)
            .and_then(|s| s.links.get_mut(link_id.0))
            .ok_or(EngineError::InvalidArgument("unknown link"))?;
        link.available = available;
        Ok(())
    }

    /// Maintain membership of `dref` in the Connection's `work` list per the
    /// policy in §4.2.
    pub fn work_update(&mut self, dref: DeliveryRef) {
        let Some(link) = self
            .sessions
            .get(dref.session.0)
            .and_then(|s| s.links.get(dref.link.0))
        else {
            return;
        };
        let Some(delivery) = link.deliveries.get(dref.index) else {
            return;
        };

        let should_be_in_work = if delivery.updated && !delivery.local.settled {
            true
        } else if link.current == Some(dref.index) {
            if link.is_sender() {
                link.credit > 0
            } else {
                true
            }
        } else {
            false
        };

        if should_be_in_work && !delivery.work {
            self.mark_delivery_work(dref, true);
        } else if !should_be_in_work && delivery.work {
            self.mark_delivery_work(dref, false);
        }
    }

    fn mark_delivery_work(&mut self, dref: DeliveryRef, present: bool) {
        let link = &mut self.sessions[dref.session.0].links[dref.link.0];
        let delivery = &mut link.deliveries[dref.index];
        if present == delivery.work {
            return;
        }
        delivery.work = present;
        if present {
            self.work.push_back(dref);
        } else {
            self.work.retain(|d| *d != dref);
        }
    }

    fn mark_delivery_tpwork(&mut self, dref: DeliveryRef) {
        let link = &mut self.sessions[dref.session.0].links[dref.link.0];
        let delivery = &mut link.deliveries[dref.index];
        if !delivery.tpwork {
            delivery.tpwork = true;
            self.tpwork.push_back(dref);
        }
        self.mark_connection_modified();
    }

    /// Application: "I'm done with `current`" on this link.
    pub fn advance(&mut self, session: SessionId, link_id: LinkId) -> Result<(), EngineError> {
        let (current_idx, next_idx, is_sender) = {
            let link = self
                .sessions
                .get(session.0)
                .and_then(|s| s.links.get(link_id.0))
                .ok_or(EngineError::InvalidArgument("unknown link"))?;
            let current_idx = link
                .current
                .ok_or(EngineError::IllegalState("no current delivery to advance"))?;
            let pos = link.unsettled.iter().position(|i| *i == current_idx);
            let next_idx = pos.and_then(|p| link.unsettled.get(p + 1)).copied();
            (current_idx, next_idx, link.is_sender())
        };

        if is_sender {
            self.sessions[session.0].links[link_id.0].deliveries[current_idx].done = true;
            self.sessions[session.0].links[link_id.0].queued += 1;
            self.sessions[session.0].links[link_id.0].credit =
                self.sessions[session.0].links[link_id.0].credit.saturating_sub(1);
            self.sessions[session.0].outgoing_deliveries += 1;
        } else {
            self.sessions[session.0].links[link_id.0].credit =
                self.sessions[session.0].links[link_id.0].credit.saturating_sub(1);
            self.sessions[session.0].links[link_id.0].queued =
                self.sessions[session.0].links[link_id.0].queued.saturating_sub(1);
            let payload_len = self.sessions[session.0].links[link_id.0].deliveries[current_idx]
                .bytes
                .len() as u64;
            self.sessions[session.0].incoming_deliveries -= 1;
            self.sessions[session.0].incoming_bytes -= payload_len;
            self.sessions[session.0].links[link_id.0].deliveries[current_idx]
                .bytes
                .clear();
        }
        self.sessions[session.0].links[link_id.0].current = next_idx;

        let prev_ref = DeliveryRef { session, link: link_id, index: current_idx };
        if is_sender {
            self.mark_delivery_tpwork(prev_ref);
        } else if self.sessions[session.0].incoming_window == 0 {
            self.mark_delivery_tpwork(prev_ref);
        }

        self.work_update(prev_ref);
        if let Some(next_idx) = self.sessions[session.0].links[link_id.0].current {
            self.work_update(DeliveryRef { session, link: link_id, index: next_idx });
        }
        Ok(())
    }

    /// Mark a delivery locally settled. Removal from the session delivery
    /// map ("full settle") is deferred to the outbound tpwork processor.
    pub fn settle(&mut self, session: SessionId, link_id: LinkId, dref: DeliveryRef) -> Result<(), EngineError> {
        let is_current = self.sessions[session.0].links[link_id.0].current == Some(dref.index);
        if is_current {
            self.advance(session, link_id)?;
        }
        let link = &mut self.sessions[session.0].links[link_id.0];
        let delivery = link
            .deliveries
            .get_mut(dref.index)
            .ok_or(EngineError::InvalidArgument("unknown delivery"))?;
        if delivery.local.settled {
            // Settlement idempotence (testable property 8).
            return Ok(());
        }
        delivery.local.settled = true;
        self.mark_delivery_tpwork(dref);
        self.work_update(dref);
        Ok(())
    }

    /// Remove a fully-flushed delivery from the session delivery map and
    /// move it onto the link's settled free-list.
    pub(crate) fn full_settle(&mut self, dref: DeliveryRef) {
        let (init, id, is_sender) = {
            let link = &self.sessions[dref.session.0].links[dref.link.0];
            let delivery = &link.deliveries[dref.index];
            (delivery.init, delivery.id, link.is_sender())
        };
        if init {
            if let Some(id) = id {
                let map = if is_sender {
                    &mut self.sessions[dref.session.0].outgoing
                } else {
                    &mut self.sessions[dref.session.0].incoming
                };
                map.del(id);
            }
        }

        let link = &mut self.sessions[dref.session.0].links[dref.link.0];
        link.unsettled.retain(|i| *i != dref.index);
        link.settled.push(dref.index);
        let delivery = &mut link.deliveries[dref.index];
        delivery.tag = Default::default();
        delivery.bytes.clear();
        delivery.local.settled = true;
        delivery.tpwork = false;
    }
}


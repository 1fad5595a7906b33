//! Inbound performative actions (§4.3). Each `on_*` method receives an
//! already-decoded performative and turns it into endpoint/delivery state
//! changes, marking endpoints modified as it goes.

use fe2o3_amqp_types::definitions::{self, Role};
use fe2o3_amqp_types::messaging::{Source, TargetArchetype};
use fe2o3_amqp_types::performatives::{
    Attach, Begin, Close, Detach, Disposition, End, Flow, Open, Transfer,
};
use tracing::{trace, warn};

use crate::delivery::Delivery;
use crate::endpoint::HalfState;
use crate::error::EngineError;
use crate::frame::{Frame, FrameBody};
use crate::link::Link;
use crate::session::{ChannelSlot, Session, SessionId};
use crate::terminus::{DistributionMode, ExpiryPolicy, Terminus, TerminusKind};

use super::{Connection, DeliveryRef};

fn source_to_terminus(source: Option<Box<Source>>) -> Terminus {
    match source {
        None => Terminus {
            kind: TerminusKind::Unspecified,
            ..Default::default()
        },
        Some(s) => Terminus {
            kind: TerminusKind::Source,
            address: s.address,
            durable: s.durable as u32,
            expiry_policy: ExpiryPolicy::from_symbol(expiry_symbol(&s.expiry_policy)),
            timeout: s.timeout,
            dynamic: s.dynamic,
            distribution_mode: distribution_mode_of(s.distribution_mode),
            properties: s.dynamic_node_properties,
            capabilities: s.capabilities.map(|a| a.0).unwrap_or_default(),
            outcomes: s.outcomes.map(|a| a.0).unwrap_or_default(),
            filter: None,
        },
    }
}

fn target_to_terminus(target: Option<Box<TargetArchetype>>) -> Terminus {
    match target.map(|t| *t) {
        None => Terminus {
            kind: TerminusKind::Unspecified,
            ..Default::default()
        },
        Some(TargetArchetype::Target(t)) => Terminus {
            kind: TerminusKind::Target,
            address: t.address,
            durable: t.durable as u32,
            expiry_policy: ExpiryPolicy::from_symbol(expiry_symbol(&t.expiry_policy)),
            timeout: t.timeout,
            dynamic: t.dynamic,
            distribution_mode: DistributionMode::Unspecified,
            properties: t.dynamic_node_properties,
            capabilities: t.capabilities.map(|a| a.0).unwrap_or_default(),
            outcomes: Vec::new(),
            filter: None,
        },
        #[allow(unreachable_patterns)]
        Some(_) => Terminus {
            kind: TerminusKind::Unspecified,
            ..Default::default()
        },
    }
}

fn expiry_symbol(policy: &fe2o3_amqp_types::messaging::TerminusExpiryPolicy) -> &'static str {
    use fe2o3_amqp_types::messaging::TerminusExpiryPolicy::*;
    match policy {
        LinkDetach => "link-detach",
        SessionEnd => "session-end",
        ConnectionClose => "connection-close",
        Never => "never",
    }
}

fn distribution_mode_of(mode: Option<fe2o3_amqp_types::messaging::DistributionMode>) -> DistributionMode {
    use fe2o3_amqp_types::messaging::DistributionMode::*;
    match mode {
        None => DistributionMode::Unspecified,
        Some(Move) => DistributionMode::Move,
        Some(Copy) => DistributionMode::Copy,
    }
}

impl Connection {
    /// Drain the transport's decoded input, running each frame through
    /// `dispatch` in arrival order. Stops (and surfaces the error) at the
    /// first protocol/framing violation, matching the "halt the dispatcher"
    /// behavior of §7.
    pub fn receive(&mut self) -> Result<(), EngineError> {
        let frames = self.transport.process()?;
        for frame in frames {
            if let Err(err) = self.dispatch(frame) {
                self.do_error(err.clone());
                return Err(err);
            }
        }
        Ok(())
    }

    pub(crate) fn do_error(&mut self, err: EngineError) {
        if let EngineError::Protocol(condition) = err {
            if self.endpoint.state.local != HalfState::Closed {
                let _ = self.close(Some(condition));
            }
        }
    }

    #[tracing::instrument(name = "RECV", skip_all, fields(channel = frame.channel))]
    fn dispatch(&mut self, frame: Frame) -> Result<(), EngineError> {
        trace!(body = ?frame.body, "dispatching inbound frame");
        let channel = frame.channel;
        match frame.body {
            FrameBody::Open(open) => self.on_open(open),
            FrameBody::Begin(begin) => self.on_begin(channel, begin),
            FrameBody::Attach(attach) => self.on_attach(channel, attach),
            FrameBody::Transfer { performative, payload } => {
                self.on_transfer(channel, performative, payload)
            }
            FrameBody::Flow(flow) => self.on_flow(channel, flow),
            FrameBody::Disposition(disposition) => self.on_disposition(channel, disposition),
            FrameBody::Detach(detach) => self.on_detach(channel, detach),
            FrameBody::End(end) => self.on_end(channel, end),
            FrameBody::Close(close) => self.on_close(close),
            FrameBody::Empty => Ok(()),
        }
    }

    fn session_by_channel(&self, channel: u16) -> Result<SessionId, EngineError> {
        self.remote_channels
            .get(&channel)
            .map(|idx| SessionId(*idx))
            .ok_or_else(|| {
                EngineError::protocol(
                    definitions::ErrorCondition::AmqpError(definitions::AmqpError::InvalidField),
                    format!("unknown channel {channel}"),
                )
            })
    }

    fn on_open(&mut self, open: Open) -> Result<(), EngineError> {
        self.remote_container_id = Some(open.container_id);
        self.remote_hostname = open.hostname;
        let advertised = open.max_frame_size.0;
        let clamped = self.transport.set_peer_max_frame_size(advertised);
        if advertised != 0 && clamped != advertised {
            warn!(advertised, clamped, "peer max-frame-size below protocol minimum, clamping");
        }
        self.remote_channel_max = open.channel_max.0;
        self.remote_idle_timeout = open.idle_time_out;

        self.endpoint.state.remote = HalfState::Active;
        self.mark_connection_modified();
        Ok(())
    }

    fn on_begin(&mut self, channel: u16, begin: Begin) -> Result<(), EngineError> {
        let session_id = match begin.remote_channel {
            Some(remote_channel) => {
                let idx = *self
                    .local_channels
                    .get(&remote_channel)
                    .ok_or_else(|| EngineError::invalid_field("begin reply to unknown local channel"))?;
                SessionId(idx)
            }
            None => {
                let idx = self.sessions.insert(Session::new(u64::MAX));
                SessionId(idx)
            }
        };

        let session = &mut self.sessions[session_id.0];
        session.incoming.seed(begin.next_outgoing_id);
        session.remote_channel = ChannelSlot::Assigned(channel);
        session.endpoint.state.remote = HalfState::Active;
        self.remote_channels.insert(channel, session_id.0);
        self.mark_session_modified(session_id);
        Ok(())
    }

    fn on_attach(&mut self, channel: u16, attach: Attach) -> Result<(), EngineError> {
        let session_id = self.session_by_channel(channel)?;
        // `Role` is neither `Eq` nor `Ord`, so link identity is keyed on
        // `bool::from(&Role)` (true = receiver) instead of the enum itself.
        let peer_is_receiver = bool::from(&attach.role);
        let our_is_receiver = !peer_is_receiver;
        let our_role = if our_is_receiver { Role::Receiver } else { Role::Sender };

        let session = &mut self.sessions[session_id.0];
        let existing = session.links_by_name.get(&(attach.name.clone(), our_is_receiver)).copied();
        let link_idx = match existing {
            Some(idx) => idx,
            None => {
                let mut link = Link::new(our_role, attach.name.clone());
                link.endpoint.state.local = HalfState::Active;
                let idx = session.links.insert(link);
                session.links_by_name.insert((attach.name.clone(), our_is_receiver), idx);
                idx
            }
        };

        let link = &mut session.links[link_idx];
        link.remote_handle = Some(attach.handle.0);
        link.snd_settle_mode = attach.snd_settle_mode;
        link.rcv_settle_mode = attach.rcv_settle_mode;
        link.remote_source = source_to_terminus(attach.source);
        link.remote_target = target_to_terminus(attach.target);
        if our_is_receiver {
            link.delivery_count = attach.initial_delivery_count.unwrap_or(0);
            link.initial_delivery_count = link.delivery_count;
        }
        link.endpoint.state.remote = HalfState::Active;

        session.remote_handles.insert(attach.handle.0, link_idx);
        self.mark_link_modified(session_id, crate::link::LinkId(link_idx));
        Ok(())
    }

    fn on_transfer(&mut self, channel: u16, transfer: Transfer, payload: bytes::Bytes) -> Result<(), EngineError> {
        let session_id = self.session_by_channel(channel)?;
        if self.sessions[session_id.0].incoming_window == 0 {
            return Err(EngineError::window_violation());
        }

        let link_idx = *self.sessions[session_id.0]
            .remote_handles
            .get(&transfer.handle.0)
            .ok_or_else(|| EngineError::invalid_field("transfer on unattached handle"))?;
        let link_id = crate::link::LinkId(link_idx);

        let tail_ongoing = self.sessions[session_id.0].links[link_idx]
            .unsettled
            .back()
            .copied()
            .filter(|idx| !self.sessions[session_id.0].links[link_idx].deliveries[*idx].done);

        let delivery_index = match tail_ongoing {
            Some(idx) => idx,
            None => {
                let session = &mut self.sessions[session_id.0];
                if session.incoming_deliveries == 0 && session.incoming.next_id() == 0 {
                    if let Some(id) = transfer.delivery_id {
                        session.incoming.seed(id);
                    }
                }
                session.incoming_deliveries += 1;

                let tag: crate::delivery::DeliveryTag = transfer
                    .delivery_tag
                    .clone()
                    .map(|t| bytes::Bytes::from(t.into_vec()))
                    .unwrap_or_default();

                let link = &mut session.links[link_idx];
                let idx = if let Some(reused) = link.settled.pop() {
                    link.deliveries[reused].reset_for_reuse(tag);
                    reused
                } else {
                    link.deliveries.insert(Delivery::new(tag))
                };
                link.unsettled.push_back(idx);

                let allocated_id = session.incoming.push(idx);
                session.links[link_idx].deliveries[idx].id = Some(allocated_id);
                session.links[link_idx].deliveries[idx].init = true;

                if let Some(transfer_id) = transfer.delivery_id {
                    if transfer_id != allocated_id {
                        // Defensive full-settle: state past this point is not
                        // promised to be otherwise consistent.
                        let dref = DeliveryRef { session: session_id, link: link_id, index: idx };
                        self.full_settle(dref);
                        return Err(EngineError::invalid_field(format!(
                            "sequencing error, expected {allocated_id} got {transfer_id}"
                        )));
                    }
                }

                session.links[link_idx].delivery_count =
                    session.links[link_idx].delivery_count.wrapping_add(1);
                session.links[link_idx].link_credit_sub1();
                session.links[link_idx].queued += 1;

                let settled = transfer.settled.unwrap_or(false);
                session.links[link_idx].deliveries[idx].remote.settled = settled;
                idx
            }
        };

        {
            let session = &mut self.sessions[session_id.0];
            let delivery = &mut session.links[link_idx].deliveries[delivery_index];
            delivery.bytes.extend_from_slice(&payload);
            session.incoming_bytes += payload.len() as u64;
            delivery.done = !transfer.more;
            if transfer.settled.unwrap_or(false) {
                delivery.remote.settled = true;
                delivery.updated = true;
            }
            session.incoming_transfer_count = session.incoming_transfer_count.wrapping_add(1);
            session.incoming_window = session.incoming_window.saturating_sub(1);
        }

        let dref = DeliveryRef { session: session_id, link: link_id, index: delivery_index };
        self.work_update(dref);

        let window_zero = self.sessions[session_id.0].incoming_window == 0;
        let has_local_handle = matches!(
            self.sessions[session_id.0].links[link_idx].local_handle,
            crate::link::HandleSlot::Assigned(_)
        );
        if window_zero && has_local_handle {
            self.mark_session_modified(session_id);
        }
        Ok(())
    }

    fn on_flow(&mut self, channel: u16, flow: Flow) -> Result<(), EngineError> {
        let session_id = self.session_by_channel(channel)?;
        {
            let session = &mut self.sessions[session_id.0];
            session.remote_incoming_window = match flow.next_incoming_id {
                Some(next) => next
                    .wrapping_add(flow.incoming_window)
                    .wrapping_sub(session.outgoing_transfer_count),
                None => flow.incoming_window,
            };
        }

        let Some(handle) = flow.handle else {
            self.mark_session_modified(session_id);
            return Ok(());
        };
        let link_idx = *self.sessions[session_id.0]
            .remote_handles
            .get(&handle.0)
            .ok_or_else(|| EngineError::invalid_field("flow on unattached handle"))?;
        let link_id = crate::link::LinkId(link_idx);

        let is_sender = self.sessions[session_id.0].links[link_idx].is_sender();
        if is_sender {
            let receiver_count = flow.delivery_count.unwrap_or(0);
            let link_credit = flow.link_credit.unwrap_or(0);
            let link = &mut self.sessions[session_id.0].links[link_idx];
            link.credit = receiver_count
                .wrapping_add(link_credit)
                .wrapping_sub(link.delivery_count);
            link.drain = flow.drain;
        } else {
            let link = &mut self.sessions[session_id.0].links[link_idx];
            let delta = flow.delivery_count.unwrap_or(link.delivery_count).wrapping_sub(link.delivery_count);
            if (delta as i32) > 0 {
                link.delivery_count = link.delivery_count.wrapping_add(delta);
                link.link_credit_sub(delta);
                link.credit = link.credit.saturating_sub(delta);
            }
        }

        if let Some(current) = self.sessions[session_id.0].links[link_idx].current {
            self.work_update(DeliveryRef { session: session_id, link: link_id, index: current });
        }
        Ok(())
    }

    fn on_disposition(&mut self, channel: u16, disposition: Disposition) -> Result<(), EngineError> {
        let session_id = self.session_by_channel(channel)?;
        let last = disposition.last.unwrap_or(disposition.first);

        // role==receiver means the peer is reporting on deliveries *it*
        // received, i.e. our outgoing map; role==sender mirrors our incoming map.
        let use_outgoing = bool::from(&disposition.role);

        let entries = {
            let session = &self.sessions[session_id.0];
            let map = if use_outgoing { &session.outgoing } else { &session.incoming };
            map.range(disposition.first, last)
        };

        for (_, link_free_form_index) in entries {
            // `DeliveryMap` stores the link-arena index directly; resolve which
            // link owns it by scanning (sessions are small in practice).
            let session = &mut self.sessions[session_id.0];
            let Some((link_idx, _)) = session
                .links
                .iter()
                .find(|(_, l)| l.deliveries.contains(link_free_form_index))
            else {
                continue;
            };
            let link_idx = link_idx;
            let delivery = &mut session.links[link_idx].deliveries[link_free_form_index];
            delivery.remote.state = disposition.state.clone();
            delivery.remote.settled = disposition.settled;
            delivery.updated = true;
            let dref = DeliveryRef {
                session: session_id,
                link: crate::link::LinkId(link_idx),
                index: link_free_form_index,
            };
            drop(delivery);
            self.work_update(dref);
        }
        Ok(())
    }

    fn on_detach(&mut self, channel: u16, detach: Detach) -> Result<(), EngineError> {
        let session_id = self.session_by_channel(channel)?;
        let link_idx = *self.sessions[session_id.0]
            .remote_handles
            .get(&detach.handle.0)
            .ok_or_else(|| EngineError::invalid_field("detach on unattached handle"))?;
        self.sessions[session_id.0].remote_handles.remove(&detach.handle.0);

        let link = &mut self.sessions[session_id.0].links[link_idx];
        if let Some(error) = detach.error {
            link.endpoint.remote_condition.set(error);
        }
        if detach.closed {
            link.endpoint.state.remote = HalfState::Closed;
        }
        self.mark_link_modified(session_id, crate::link::LinkId(link_idx));
        Ok(())
    }

    fn on_end(&mut self, channel: u16, end: End) -> Result<(), EngineError> {
        let session_id = self.session_by_channel(channel)?;
        self.remote_channels.remove(&channel);
        let session = &mut self.sessions[session_id.0];
        if let Some(error) = end.error {
            session.endpoint.remote_condition.set(error);
        }
        session.endpoint.state.remote = HalfState::Closed;
        self.mark_session_modified(session_id);
        Ok(())
    }

    fn on_close(&mut self, close: Close) -> Result<(), EngineError> {
        self.close_rcvd = true;
        if let Some(error) = close.error {
            self.endpoint.remote_condition.set(error);
        }
        self.endpoint.state.remote = HalfState::Closed;
        self.mark_connection_modified();
        Ok(())
    }
}

impl Link {
    pub(crate) fn link_credit_sub1(&mut self) {
        self.credit = self.credit.saturating_sub(1);
    }

    pub(crate) fn link_credit_sub(&mut self, n: u32) {
        self.credit = self.credit.saturating_sub(n);
    }
}

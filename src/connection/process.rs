//! Outbound process pipeline (§4.4): walks the modified/tpwork lists and
//! turns pending state into wire frames, one phase at a time.
//!
//! Each phase takes a *fresh* snapshot of whichever list it walks, taken at
//! the start of that phase's call. An endpoint re-marked modified by an
//! earlier phase within the same `process()` call (for example a session
//! re-marked by disposition batching during the first tpwork pass) is
//! therefore visible to a later phase in the same call, matching the
//! upstream engine this is ported from.

use std::collections::BTreeSet;

use bytes::Bytes;
use fe2o3_amqp_types::definitions::{self, Handle, Role};
use fe2o3_amqp_types::messaging::{DeliveryState, Source, Target, TargetArchetype, TerminusDurability};
use fe2o3_amqp_types::performatives::{
    Attach, Begin, Close, Detach, Disposition, End, Flow, Open, Transfer,
};
use serde_amqp::primitives::{Array, ByteBuf};

use crate::endpoint::{EndpointRef, HalfState};
use crate::error::EngineError;
use crate::frame::{Frame, FrameBody};
use crate::link::{HandleSlot, Link};
use crate::session::{ChannelSlot, DispositionBatch, Session, SessionId};
use crate::terminus::Terminus;

use super::{Connection, DeliveryRef};

impl Connection {
    /// Run the full outbound pipeline once. Returns once every phase has run
    /// and re-marks the connection if tpwork is still non-empty, so a caller
    /// looping `process()` until `transport.pending()` stops growing will
    /// drain every currently-postable frame.
    pub fn process(&mut self) -> Result<(), EngineError> {
        self.phase_conn_setup()?;
        self.phase_ssn_setup()?;
        self.phase_link_setup()?;
        self.phase_flow_receiver()?;
        self.phase_tpwork()?;
        self.phase_tpwork()?;
        self.phase_flush_disp()?;
        self.phase_flow_sender()?;
        self.phase_link_teardown()?;
        self.phase_ssn_teardown()?;
        self.phase_conn_teardown()?;

        if !self.tpwork.is_empty() {
            self.mark_connection_modified();
        }
        Ok(())
    }

    /// A copy of `self.modified`, taken fresh at the start of a phase.
    fn modified_snapshot(&self) -> Vec<EndpointRef> {
        self.modified.iter().copied().collect()
    }

    fn clear_modified_ref(&mut self, r: EndpointRef) {
        match r {
            EndpointRef::Connection => self.endpoint.clear_modified(),
            EndpointRef::Session(sid) => self.sessions[sid.0].endpoint.clear_modified(),
            EndpointRef::Link(sid, lid) => self.sessions[sid.0].links[lid.0].endpoint.clear_modified(),
        }
        self.modified.retain(|m| *m != r);
    }

    // ---- conn_setup ----

    fn phase_conn_setup(&mut self) -> Result<(), EngineError> {
        if self.open_sent {
            return Ok(());
        }
        if self.endpoint.state.local == HalfState::Uninit {
            return Ok(());
        }
        self.post_open()?;
        self.open_sent = true;
        Ok(())
    }

    fn post_open(&mut self) -> Result<(), EngineError> {
        let open = Open {
            container_id: self.container_id.clone(),
            hostname: self.hostname.clone(),
            max_frame_size: self.max_frame_size.into(),
            channel_max: self.channel_max.into(),
            idle_time_out: self.idle_timeout,
            outgoing_locales: None,
            incoming_locales: None,
            offered_capabilities: self.offered_capabilities.clone().map(Array),
            desired_capabilities: self.desired_capabilities.clone().map(Array),
            properties: self.properties.clone(),
        };
        self.transport.push_frame(&Frame {
            channel: 0,
            body: FrameBody::Open(open),
        })
    }

    // ---- ssn_setup ----

    fn phase_ssn_setup(&mut self) -> Result<(), EngineError> {
        if !self.open_sent {
            return Ok(());
        }
        for r in self.modified_snapshot() {
            let EndpointRef::Session(sid) = r else { continue };
            let session = &self.sessions[sid.0];
            let local_uninit = session.endpoint.state.local == HalfState::Uninit;
            let unassigned = matches!(session.local_channel, ChannelSlot::Unassigned);
            if !local_uninit && unassigned {
                let channel = self.allocate_channel();
                self.post_begin(sid, channel)?;
            }
        }
        Ok(())
    }

    fn allocate_channel(&self) -> u16 {
        let mut c: u16 = 0;
        loop {
            if !self.local_channels.contains_key(&c) {
                return c;
            }
            if c == u16::MAX {
                unreachable!("channel space exhausted");
            }
            c += 1;
        }
    }

    fn post_begin(&mut self, sid: SessionId, channel: u16) -> Result<(), EngineError> {
        let max_frame_local = self.max_frame_size;
        let max_frame_peer = self.transport.max_frame_size_peer;
        let remote_channel = self.sessions[sid.0].remote_channel.channel();

        let session = &mut self.sessions[sid.0];
        session.incoming_window = session.compute_incoming_window(max_frame_local);
        session.outgoing_window = session.compute_outgoing_window(max_frame_peer);
        let begin = Begin {
            remote_channel,
            next_outgoing_id: session.outgoing_transfer_count,
            incoming_window: session.incoming_window,
            outgoing_window: session.outgoing_window,
            handle_max: Handle(u32::MAX),
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        self.transport.push_frame(&Frame {
            channel,
            body: FrameBody::Begin(begin),
        })?;
        self.sessions[sid.0].local_channel = ChannelSlot::Assigned(channel);
        self.local_channels.insert(channel, sid.0);
        Ok(())
    }

    // ---- link_setup ----

    fn phase_link_setup(&mut self) -> Result<(), EngineError> {
        if !self.open_sent {
            return Ok(());
        }
        for r in self.modified_snapshot() {
            let EndpointRef::Link(sid, lid) = r else { continue };
            let session = &self.sessions[sid.0];
            let session_ready = matches!(session.local_channel, ChannelSlot::Assigned(_));
            let link = &session.links[lid.0];
            let local_uninit = link.endpoint.state.local == HalfState::Uninit;
            let unassigned = matches!(link.local_handle, HandleSlot::Unassigned);
            if session_ready && !local_uninit && unassigned {
                self.post_attach(sid, lid)?;
            }
        }
        Ok(())
    }

    fn allocate_handle(session: &Session) -> u32 {
        let mut used = BTreeSet::new();
        for (_, link) in session.links.iter() {
            if let HandleSlot::Assigned(h) = link.local_handle {
                used.insert(h);
            }
        }
        let mut h = 0u32;
        while used.contains(&h) {
            h += 1;
        }
        h
    }

    fn post_attach(&mut self, sid: SessionId, lid: LinkIdAlias) -> Result<(), EngineError> {
        let channel = self.sessions[sid.0].local_channel.channel().expect("session ready");
        let handle = Self::allocate_handle(&self.sessions[sid.0]);

        let link = &mut self.sessions[sid.0].links[lid.0];
        link.local_handle = HandleSlot::Assigned(handle);
        link.initial_delivery_count = link.delivery_count;

        let is_receiver = link.is_receiver();
        let attach = Attach {
            name: link.name.clone(),
            handle: Handle(handle),
            role: if is_receiver { Role::Receiver } else { Role::Sender },
            snd_settle_mode: link.snd_settle_mode.clone(),
            rcv_settle_mode: link.rcv_settle_mode.clone(),
            source: terminus_to_source(&link.source),
            target: terminus_to_target(&link.target),
            unsettled: None,
            incomplete_unsettled: false,
            initial_delivery_count: Some(link.delivery_count),
            max_message_size: None,
            offered_capabilities: None,
            desired_capabilities: None,
            properties: None,
        };
        self.transport.push_frame(&Frame {
            channel,
            body: FrameBody::Attach(attach),
        })
    }

    // ---- flow_receiver ----

    /// Per SPEC_FULL.md's process table: a receiver link gets a FLOW only
    /// when the credit it's advertising has actually changed, it's draining,
    /// or the session's incoming window is currently exhausted.
    fn phase_flow_receiver(&mut self) -> Result<(), EngineError> {
        if !self.open_sent {
            return Ok(());
        }
        for r in self.modified_snapshot() {
            let EndpointRef::Link(sid, lid) = r else { continue };
            let link = &self.sessions[sid.0].links[lid.0];
            let attached = matches!(link.local_handle, HandleSlot::Assigned(_));
            let active = link.endpoint.state.local == HalfState::Active;
            if !attached || !active || !link.is_receiver() {
                continue;
            }
            let want_credit = link.credit.saturating_sub(link.queued);
            let window_exhausted = self.sessions[sid.0].incoming_window == 0;
            if link.drain || link.posted_link_credit != Some(want_credit) || window_exhausted {
                self.sessions[sid.0].links[lid.0].posted_link_credit = Some(want_credit);
                self.post_flow(sid, Some(lid), want_credit)?;
            }
        }
        Ok(())
    }

    /// Build and send a FLOW. `link` is `None` for a session-only echo.
    fn post_flow(&mut self, sid: SessionId, link: Option<LinkIdAlias>, link_credit: u32) -> Result<(), EngineError> {
        let max_frame_local = self.max_frame_size;
        let max_frame_peer = self.transport.max_frame_size_peer;
        let channel = match self.sessions[sid.0].local_channel.channel() {
            Some(c) => c,
            None => return Ok(()),
        };

        let session = &mut self.sessions[sid.0];
        session.incoming_window = session.compute_incoming_window(max_frame_local);
        session.outgoing_window = session.compute_outgoing_window(max_frame_peer);

        let (handle, delivery_count, available, drain) = match link {
            Some(lid) => {
                let l = &self.sessions[sid.0].links[lid.0];
                (l.local_handle.handle(), Some(l.delivery_count), Some(l.available), l.drain)
            }
            None => (None, None, None, false),
        };

        let session = &self.sessions[sid.0];
        let flow = Flow {
            next_incoming_id: Some(session.incoming_transfer_count),
            incoming_window: session.incoming_window,
            next_outgoing_id: session.outgoing_transfer_count,
            outgoing_window: session.outgoing_window,
            handle: handle.map(Handle),
            delivery_count,
            link_credit: if handle.is_some() { Some(link_credit) } else { None },
            available,
            drain,
            echo: false,
            properties: None,
        };
        self.transport.push_frame(&Frame {
            channel,
            body: FrameBody::Flow(flow),
        })
    }

    // ---- tpwork ----

    fn phase_tpwork(&mut self) -> Result<(), EngineError> {
        let batch: Vec<DeliveryRef> = self.tpwork.iter().copied().collect();
        for dref in batch {
            let Some(link) = self
                .sessions
                .get(dref.session.0)
                .and_then(|s| s.links.get(dref.link.0))
            else {
                self.clear_tpwork(dref);
                continue;
            };
            let Some(_delivery) = link.deliveries.get(dref.index) else {
                self.clear_tpwork(dref);
                continue;
            };

            if link.is_sender() {
                self.process_tpwork_sender(dref)?;
            } else {
                self.process_tpwork_receiver(dref)?;
            }

            if !self.delivery_buffered(dref) {
                self.clear_tpwork(dref);
            }
        }
        Ok(())
    }

    /// Remove `dref` from the tpwork queue and clear its per-delivery flag,
    /// without touching settlement state.
    fn clear_tpwork(&mut self, dref: DeliveryRef) {
        let Some(link) = self
            .sessions
            .get_mut(dref.session.0)
            .and_then(|s| s.links.get_mut(dref.link.0))
        else {
            self.tpwork.retain(|d| *d != dref);
            return;
        };
        if let Some(delivery) = link.deliveries.get_mut(dref.index) {
            delivery.tpwork = false;
        }
        self.tpwork.retain(|d| *d != dref);
    }

    /// Whether `dref` still has work pending after one tpwork pass: settled
    /// deliveries never are; a sender's delivery is while it hasn't finished
    /// writing its buffered bytes to the wire.
    fn delivery_buffered(&self, dref: DeliveryRef) -> bool {
        let Some(link) = self.sessions.get(dref.session.0).and_then(|s| s.links.get(dref.link.0)) else {
            return false;
        };
        let Some(delivery) = link.deliveries.get(dref.index) else {
            return false;
        };
        if delivery.local.settled {
            return false;
        }
        if link.is_sender() {
            if delivery.sent {
                false
            } else {
                delivery.done || !delivery.bytes.is_empty()
            }
        } else {
            false
        }
    }

    fn process_tpwork_sender(&mut self, dref: DeliveryRef) -> Result<(), EngineError> {
        let channel = match self.sessions[dref.session.0].local_channel.channel() {
            Some(c) => c,
            None => return Ok(()),
        };
        let attached = matches!(
            self.sessions[dref.session.0].links[dref.link.0].local_handle,
            HandleSlot::Assigned(_)
        );
        if !attached {
            return Ok(());
        }

        let mut posted_transfer = false;
        if !self.sessions[dref.session.0].links[dref.link.0].deliveries[dref.index].sent {
            posted_transfer = self.emit_transfer_frames(dref, channel)?;
        }

        let (remote_settled, init, sent, local_settled) = {
            let d = &self.sessions[dref.session.0].links[dref.link.0].deliveries[dref.index];
            (d.remote.settled, d.init, d.sent, d.local.settled)
        };
        if !remote_settled && init && sent && !posted_transfer {
            self.post_disp(dref)?;
        }
        if local_settled && sent {
            self.full_settle(dref);
        }
        Ok(())
    }

    /// Drain as many TRANSFER frames as needed to flush `dref`'s buffered
    /// payload within this single tpwork pass. Returns whether at least one
    /// frame was written.
    fn emit_transfer_frames(&mut self, dref: DeliveryRef, channel: u16) -> Result<bool, EngineError> {
        let mut posted_any = false;
        loop {
            let max_frame_peer = self.transport.max_frame_size_peer;
            let window = self.sessions[dref.session.0].outgoing_window;
            let remote_window = self.sessions[dref.session.0].remote_incoming_window;
            if window == 0 || remote_window == 0 {
                break;
            }

            let (done, remaining, already_sent) = {
                let delivery = &self.sessions[dref.session.0].links[dref.link.0].deliveries[dref.index];
                (delivery.done, delivery.bytes.len(), delivery.sent)
            };
            if already_sent {
                break;
            }
            if remaining == 0 && !done {
                break;
            }

            // The delivery-id is sender-assigned, at the first transfer frame
            // actually written for this delivery (not at `new_delivery` time).
            let is_first = self.sessions[dref.session.0].links[dref.link.0].deliveries[dref.index]
                .id
                .is_none();
            if is_first {
                let id = self.sessions[dref.session.0].outgoing.push(dref.index);
                let delivery = &mut self.sessions[dref.session.0].links[dref.link.0].deliveries[dref.index];
                delivery.id = Some(id);
                delivery.init = true;
            }

            let handle = self.sessions[dref.session.0].links[dref.link.0]
                .local_handle
                .handle()
                .expect("attached");
            let delivery_id = self.sessions[dref.session.0].links[dref.link.0].deliveries[dref.index]
                .id
                .expect("assigned above");
            let tag = self.sessions[dref.session.0].links[dref.link.0].deliveries[dref.index].tag.clone();
            let settled = self.sessions[dref.session.0].links[dref.link.0].deliveries[dref.index]
                .local
                .settled;

            let chunk_len = fit_transfer_chunk(remaining, max_frame_peer);
            let more_remaining = remaining > chunk_len;
            let more = more_remaining || !done;

            let payload: Bytes = {
                let delivery = &mut self.sessions[dref.session.0].links[dref.link.0].deliveries[dref.index];
                delivery.bytes.split_to(chunk_len).freeze()
            };

            let transfer = Transfer {
                handle: Handle(handle),
                delivery_id: if is_first { Some(delivery_id) } else { None },
                delivery_tag: if is_first { Some(ByteBuf::from(tag.to_vec())) } else { None },
                message_format: if is_first { Some(0) } else { None },
                settled: if is_first { Some(settled) } else { None },
                more,
                rcv_settle_mode: None,
                state: None,
                resume: false,
                aborted: false,
                batchable: false,
            };

            self.transport.push_frame(&Frame {
                channel,
                body: FrameBody::Transfer {
                    performative: transfer,
                    payload,
                },
            })?;
            posted_any = true;

            self.sessions[dref.session.0].outgoing_transfer_count =
                self.sessions[dref.session.0].outgoing_transfer_count.wrapping_add(1);
            self.sessions[dref.session.0].outgoing_window =
                self.sessions[dref.session.0].outgoing_window.saturating_sub(1);
            self.sessions[dref.session.0].remote_incoming_window =
                self.sessions[dref.session.0].remote_incoming_window.saturating_sub(1);

            if !more_remaining && done {
                let link = &mut self.sessions[dref.session.0].links[dref.link.0];
                link.deliveries[dref.index].sent = true;
                link.delivery_count = link.delivery_count.wrapping_add(1);
                link.queued = link.queued.saturating_sub(1);
                self.sessions[dref.session.0].outgoing_deliveries =
                    self.sessions[dref.session.0].outgoing_deliveries.saturating_sub(1);
                break;
            }
        }
        Ok(posted_any)
    }

    fn process_tpwork_receiver(&mut self, dref: DeliveryRef) -> Result<(), EngineError> {
        let (remote_settled, init, local_settled) = {
            let d = &self.sessions[dref.session.0].links[dref.link.0].deliveries[dref.index];
            (d.remote.settled, d.init, d.local.settled)
        };
        if !remote_settled && init {
            self.post_disp(dref)?;
        }
        if local_settled {
            self.full_settle(dref);
        }
        if self.sessions[dref.session.0].incoming_window == 0 {
            let link = &self.sessions[dref.session.0].links[dref.link.0];
            let want_credit = link.credit.saturating_sub(link.queued);
            self.post_flow(dref.session, Some(dref.link), want_credit)?;
        }
        Ok(())
    }

    // ---- disposition batching (§4.6) ----

    /// Fold `dref`'s local disposition into the session's pending batch,
    /// flushing first if it can't be merged with what's already pending.
    fn post_disp(&mut self, dref: DeliveryRef) -> Result<(), EngineError> {
        let sid = dref.session;
        let lid = dref.link.0;
        let link = &self.sessions[sid.0].links[lid];
        let is_sender = link.is_sender();
        let delivery = &link.deliveries[dref.index];
        if !delivery.init {
            return Ok(());
        }
        let id = match delivery.id {
            Some(id) => id,
            None => return Ok(()),
        };
        let type_code = delivery.local.type_code();
        let settled = delivery.local.settled;
        if type_code == 0 && !settled {
            return Ok(());
        }
        let batchable = delivery.local.is_batchable();
        let state = delivery.local.state.clone();
        let role = if is_sender { definitions::Role::Sender } else { definitions::Role::Receiver };

        let batch = self.sessions[sid.0].disposition_batch.clone();
        let can_merge = batch.active
            && bool::from(&batch.role) == bool::from(&role)
            && batch.type_code == type_code
            && batch.settled == settled
            && (batch.last.wrapping_add(1) == id || id.wrapping_add(1) == batch.first)
            && batchable;

        if can_merge {
            let b = &mut self.sessions[sid.0].disposition_batch;
            if id.wrapping_add(1) == b.first {
                b.first = id;
            } else {
                b.last = id;
            }
            return Ok(());
        }

        if batch.active {
            self.flush_disp(sid)?;
        }

        if batchable {
            self.sessions[sid.0].disposition_batch = DispositionBatch {
                active: true,
                role,
                type_code,
                settled,
                first: id,
                last: id,
            };
        } else {
            self.post_one_disposition(sid, role, id, id, settled, state)?;
        }
        Ok(())
    }

    fn phase_flush_disp(&mut self) -> Result<(), EngineError> {
        let sids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.disposition_batch.active)
            .map(|(idx, _)| SessionId(idx))
            .collect();
        for sid in sids {
            self.flush_disp(sid)?;
        }
        Ok(())
    }

    fn flush_disp(&mut self, sid: SessionId) -> Result<(), EngineError> {
        let batch = self.sessions[sid.0].disposition_batch.clone();
        if !batch.active {
            return Ok(());
        }
        self.sessions[sid.0].disposition_batch = DispositionBatch::default();
        self.post_one_disposition(sid, batch.role, batch.first, batch.last, batch.settled, None)
    }

    fn post_one_disposition(
        &mut self,
        sid: SessionId,
        role: definitions::Role,
        first: u32,
        last: u32,
        settled: bool,
        state: Option<DeliveryState>,
    ) -> Result<(), EngineError> {
        let channel = match self.sessions[sid.0].local_channel.channel() {
            Some(c) => c,
            None => return Ok(()),
        };
        let state = if state.is_some() {
            state
        } else {
            self.disposition_state_for(sid, role, last)
        };
        let disposition = Disposition {
            role,
            first,
            last: if last == first { None } else { Some(last) },
            settled,
            state,
            batchable: false,
        };
        self.transport.push_frame(&Frame {
            channel,
            body: FrameBody::Disposition(disposition),
        })
    }

    fn disposition_state_for(&self, sid: SessionId, role: definitions::Role, id: u32) -> Option<DeliveryState> {
        let use_outgoing = bool::from(&role);
        let map = if use_outgoing {
            &self.sessions[sid.0].outgoing
        } else {
            &self.sessions[sid.0].incoming
        };
        let idx = map.get(id)?;
        for (_, link) in self.sessions[sid.0].links.iter() {
            if let Some(d) = link.deliveries.get(idx) {
                if link.deliveries.contains(idx) {
                    return d.local.state.clone();
                }
            }
        }
        None
    }

    // ---- flow_sender ----

    /// Per SPEC_FULL.md's process table: a sender only gets a FLOW here when
    /// it's draining, has finished draining, and has nothing buffered left
    /// to send first — at which point it advances `delivery_count` by the
    /// unused credit and reports `link_credit = 0`.
    fn phase_flow_sender(&mut self) -> Result<(), EngineError> {
        if !self.open_sent {
            return Ok(());
        }
        for r in self.modified_snapshot() {
            let EndpointRef::Link(sid, lid) = r else { continue };
            let link = &self.sessions[sid.0].links[lid.0];
            let attached = matches!(link.local_handle, HandleSlot::Assigned(_));
            if !attached || !link.is_sender() || !(link.drain && link.drained) {
                continue;
            }
            if self.sender_tail_buffered(sid, lid) {
                continue;
            }
            let link = &mut self.sessions[sid.0].links[lid.0];
            link.delivery_count = link.delivery_count.wrapping_add(link.credit);
            link.credit = 0;
            link.drained = false;
            self.post_flow(sid, Some(lid), 0)?;
        }
        Ok(())
    }

    /// Whether the last delivery on this sender's unsettled queue still has
    /// buffered bytes awaiting transmission.
    fn sender_tail_buffered(&self, sid: SessionId, lid: LinkIdAlias) -> bool {
        let link = &self.sessions[sid.0].links[lid.0];
        let Some(&tail) = link.unsettled.back() else {
            return false;
        };
        self.delivery_buffered(DeliveryRef { session: sid, link: lid, index: tail })
    }

    // ---- link_teardown ----

    fn phase_link_teardown(&mut self) -> Result<(), EngineError> {
        for r in self.modified_snapshot() {
            let EndpointRef::Link(sid, lid) = r else { continue };
            let link = &self.sessions[sid.0].links[lid.0];
            if link.endpoint.state.local != HalfState::Closed {
                continue;
            }
            if matches!(link.local_handle, HandleSlot::TornDown) {
                continue;
            }
            // Defer while this sender still has queued data the peer hasn't
            // fully seen: let a future tpwork pass drain it first.
            if link.is_sender() && link.queued > 0 && link.endpoint.state.remote != HalfState::Closed {
                continue;
            }

            let was_attached = matches!(link.local_handle, HandleSlot::Assigned(_));
            if was_attached {
                self.post_detach(sid, lid)?;
            }
            self.sessions[sid.0].links[lid.0].local_handle = HandleSlot::TornDown;
            self.clear_modified_ref(r);
        }
        Ok(())
    }

    fn post_detach(&mut self, sid: SessionId, lid: LinkIdAlias) -> Result<(), EngineError> {
        let channel = match self.sessions[sid.0].local_channel.channel() {
            Some(c) => c,
            None => return Ok(()),
        };
        let link = &self.sessions[sid.0].links[lid.0];
        let handle = link.local_handle.handle().expect("attached");
        let error = link.endpoint.local_condition.error.clone();
        let detach = Detach {
            handle: Handle(handle),
            closed: true,
            error,
        };
        self.transport.push_frame(&Frame {
            channel,
            body: FrameBody::Detach(detach),
        })
    }

    // ---- ssn_teardown ----

    fn phase_ssn_teardown(&mut self) -> Result<(), EngineError> {
        for r in self.modified_snapshot() {
            let EndpointRef::Session(sid) = r else { continue };
            let session = &self.sessions[sid.0];
            if session.endpoint.state.local != HalfState::Closed {
                continue;
            }
            if matches!(session.local_channel, ChannelSlot::TornDown) {
                continue;
            }
            if self.pointful_buffering(sid) {
                continue;
            }

            let was_assigned = session.local_channel.channel();
            if was_assigned.is_some() {
                self.post_end(sid)?;
            }
            if let Some(channel) = was_assigned {
                self.local_channels.remove(&channel);
            }
            self.sessions[sid.0].local_channel = ChannelSlot::TornDown;
            self.clear_modified_ref(r);
        }
        Ok(())
    }

    /// Whether any sender anywhere on the connection still has queued data
    /// the peer hasn't been told about, which would make tearing down `sid`
    /// (or the whole connection) premature.
    fn pointful_buffering(&self, _sid: SessionId) -> bool {
        for (_, session) in self.sessions.iter() {
            for (_, link) in session.links.iter() {
                if link.is_sender()
                    && link.queued > 0
                    && !matches!(link.local_handle, HandleSlot::TornDown)
                    && link.endpoint.state.remote != HalfState::Closed
                {
                    return true;
                }
            }
        }
        false
    }

    fn post_end(&mut self, sid: SessionId) -> Result<(), EngineError> {
        let channel = self.sessions[sid.0].local_channel.channel().expect("assigned");
        let error = self.sessions[sid.0].endpoint.local_condition.error.clone();
        self.transport.push_frame(&Frame {
            channel,
            body: FrameBody::End(End { error }),
        })
    }

    // ---- conn_teardown ----

    fn phase_conn_teardown(&mut self) -> Result<(), EngineError> {
        if self.endpoint.state.local != HalfState::Closed {
            return Ok(());
        }
        if self.close_sent {
            return Ok(());
        }
        if self.pointful_buffering(SessionId(0)) && !self.sessions.is_empty() {
            return Ok(());
        }
        self.post_close()?;
        self.close_sent = true;
        self.endpoint.clear_modified();
        self.modified.retain(|m| *m != EndpointRef::Connection);
        Ok(())
    }

    fn post_close(&mut self) -> Result<(), EngineError> {
        let error = self.endpoint.local_condition.error.clone();
        self.transport.push_frame(&Frame {
            channel: 0,
            body: FrameBody::Close(Close { error }),
        })
    }
}

type LinkIdAlias = crate::link::LinkId;

/// How much of a `remaining`-byte payload fits in one TRANSFER frame, given
/// the peer's advertised max-frame-size (`0` meaning "no limit").
fn fit_transfer_chunk(remaining: usize, max_frame_peer: u32) -> usize {
    const FRAME_OVERHEAD: usize = 128;
    if max_frame_peer == 0 {
        return remaining;
    }
    let budget = (max_frame_peer as usize).saturating_sub(FRAME_OVERHEAD).max(1);
    remaining.min(budget)
}

fn terminus_to_source(t: &Terminus) -> Option<Box<Source>> {
    use crate::terminus::TerminusKind;
    if t.kind == TerminusKind::Unspecified {
        return None;
    }
    Some(Box::new(Source {
        address: t.address.clone(),
        durable: durability_of(t.durable),
        expiry_policy: expiry_policy_of(t.expiry_policy),
        timeout: t.timeout,
        dynamic: t.dynamic,
        dynamic_node_properties: t.properties.clone(),
        distribution_mode: distribution_mode_symbol(t.distribution_mode),
        filter: None,
        default_outcome: None,
        outcomes: if t.outcomes.is_empty() { None } else { Some(Array(t.outcomes.clone())) },
        capabilities: if t.capabilities.is_empty() { None } else { Some(Array(t.capabilities.clone())) },
    }))
}

fn terminus_to_target(t: &Terminus) -> Option<Box<TargetArchetype>> {
    use crate::terminus::TerminusKind;
    if t.kind == TerminusKind::Unspecified {
        return None;
    }
    Some(Box::new(TargetArchetype::Target(Target {
        address: t.address.clone(),
        durable: durability_of(t.durable),
        expiry_policy: expiry_policy_of(t.expiry_policy),
        timeout: t.timeout,
        dynamic: t.dynamic,
        dynamic_node_properties: t.properties.clone(),
        capabilities: if t.capabilities.is_empty() { None } else { Some(Array(t.capabilities.clone())) },
    })))
}

fn durability_of(durable: u32) -> TerminusDurability {
    match durable {
        0 => TerminusDurability::None,
        1 => TerminusDurability::Configuration,
        _ => TerminusDurability::UnsettledState,
    }
}

fn expiry_policy_of(policy: crate::terminus::ExpiryPolicy) -> fe2o3_amqp_types::messaging::TerminusExpiryPolicy {
    use crate::terminus::ExpiryPolicy::*;
    use fe2o3_amqp_types::messaging::TerminusExpiryPolicy as Wire;
    match policy {
        LinkClose => Wire::LinkDetach,
        SessionEnd => Wire::SessionEnd,
        ConnectionClose => Wire::ConnectionClose,
        Never => Wire::Never,
    }
}

fn distribution_mode_symbol(mode: crate::terminus::DistributionMode) -> Option<fe2o3_amqp_types::messaging::DistributionMode> {
    use crate::terminus::DistributionMode::*;
    use fe2o3_amqp_types::messaging::DistributionMode as Wire;
    match mode {
        Unspecified => None,
        Copy => Some(Wire::Copy),
        Move => Some(Wire::Move),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::Delivery;
    use crate::link::LinkId;
    use crate::transport::Transport;
    use fe2o3_amqp_types::messaging::Accepted;

    fn bare_connection() -> Connection {
        Connection::builder().container_id("t").build()
    }

    #[test]
    fn allocate_channel_picks_smallest_free_id() {
        let mut c = bare_connection();
        c.local_channels.insert(0, 0);
        c.local_channels.insert(1, 0);
        assert_eq!(c.allocate_channel(), 2);

        c.local_channels.remove(&0);
        assert_eq!(c.allocate_channel(), 0);
    }

    #[test]
    fn allocate_handle_picks_smallest_free_id() {
        let mut session = Session::new(u64::MAX);
        let mut link0 = Link::new(Role::Sender, "a".to_string());
        link0.local_handle = HandleSlot::Assigned(0);
        let mut link2 = Link::new(Role::Sender, "b".to_string());
        link2.local_handle = HandleSlot::Assigned(2);
        session.links.insert(link0);
        session.links.insert(link2);

        assert_eq!(Connection::allocate_handle(&session), 1);
    }

    #[test]
    fn three_consecutive_accepted_dispositions_batch_into_one_frame() {
        let mut c = bare_connection();
        let sid = SessionId(c.sessions.insert(Session::new(u64::MAX)));
        c.sessions[sid.0].local_channel = ChannelSlot::Assigned(0);

        let mut link = Link::new(Role::Receiver, "q".to_string());
        for id in 0u32..3 {
            let mut d = Delivery::new(Bytes::from_static(b"x"));
            d.init = true;
            d.id = Some(id);
            d.local.state = Some(DeliveryState::Accepted(Accepted {}));
            d.local.settled = true;
            link.deliveries.insert(d);
        }
        let lid = LinkId(c.sessions[sid.0].links.insert(link));

        for idx in 0..3 {
            c.post_disp(DeliveryRef { session: sid, link: lid, index: idx }).unwrap();
        }
        assert!(c.sessions[sid.0].disposition_batch.active);
        assert_eq!(c.sessions[sid.0].disposition_batch.first, 0);
        assert_eq!(c.sessions[sid.0].disposition_batch.last, 2);
        assert_eq!(c.transport.pending(), Some(0));

        c.flush_disp(sid).unwrap();
        assert!(!c.sessions[sid.0].disposition_batch.active);

        let n = c.transport.pending().unwrap();
        let mut buf = vec![0u8; n];
        c.transport.peek(&mut buf, n).unwrap();

        let mut rx = Transport::new(1024);
        rx.push(&buf).unwrap();
        let frames = rx.process().unwrap();
        assert_eq!(frames.len(), 1);
        match &frames[0].body {
            FrameBody::Disposition(disp) => {
                assert_eq!(disp.first, 0);
                assert_eq!(disp.last, Some(2));
            }
            other => panic!("expected a Disposition frame, got {other:?}"),
        }
    }
}

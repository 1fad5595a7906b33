//! Link endpoint: role, termini, settle modes, credit/flow state, and the
//! delivery arena (`unsettled` + `settled` free-list).

use std::collections::VecDeque;

use fe2o3_amqp_types::definitions::{self, SequenceNo};
use slab::Slab;

use crate::delivery::Delivery;
use crate::endpoint::EndpointHeader;
use crate::terminus::Terminus;

pub use definitions::Role;

/// Stable index of a [`Link`] within its owning [`crate::session::Session`]'s arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkId(pub usize);

/// The link-scoped half of the transport handle allocation: unassigned until
/// `link_setup` runs, torn down once DETACH has been both sent and processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandleSlot {
    #[default]
    Unassigned,
    Assigned(u32),
    TornDown,
}

impl HandleSlot {
    pub fn handle(&self) -> Option<u32> {
        match self {
            HandleSlot::Assigned(h) => Some(*h),
            _ => None,
        }
    }
}

/// One attached link (sender or receiver).
#[derive(Debug)]
pub struct Link {
    pub endpoint: EndpointHeader,
    pub role: Role,
    pub name: String,

    pub source: Terminus,
    pub target: Terminus,
    pub remote_source: Terminus,
    pub remote_target: Terminus,

    pub snd_settle_mode: definitions::SenderSettleMode,
    pub rcv_settle_mode: definitions::ReceiverSettleMode,

    pub local_handle: HandleSlot,
    pub remote_handle: Option<u32>,

    /// Sender: deliveries queued to be sent. Receiver: credit granted by this link.
    pub credit: u32,
    pub available: u32,
    pub queued: u32,
    pub drain: bool,
    pub drained: bool,

    pub delivery_count: SequenceNo,
    pub initial_delivery_count: SequenceNo,

    /// The `link-credit` last advertised to the peer by `flow_receiver`, so
    /// that phase only re-posts FLOW when the live value has since changed.
    pub(crate) posted_link_credit: Option<u32>,

    /// Arena of deliveries owned by this link. `unsettled`/`settled` hold
    /// indices into it; `settled` doubles as the free-list for reuse.
    pub deliveries: Slab<Delivery>,
    pub unsettled: VecDeque<usize>,
    pub settled: Vec<usize>,
    /// Index (into `deliveries`) of the next delivery the application will read/write.
    pub current: Option<usize>,
}

impl Link {
    pub fn new(role: Role, name: String) -> Self {
        Link {
            endpoint: EndpointHeader::default(),
            role,
            name,
            source: Terminus::default(),
            target: Terminus::default(),
            remote_source: Terminus::default(),
            remote_target: Terminus::default(),
            snd_settle_mode: definitions::SenderSettleMode::Mixed,
            rcv_settle_mode: definitions::ReceiverSettleMode::First,
            local_handle: HandleSlot::default(),
            remote_handle: None,
            credit: 0,
            available: 0,
            queued: 0,
            drain: false,
            drained: false,
            delivery_count: 0,
            initial_delivery_count: 0,
            posted_link_credit: None,
            deliveries: Slab::new(),
            unsettled: VecDeque::new(),
            settled: Vec::new(),
            current: None,
        }
    }

    pub fn is_sender(&self) -> bool {
        matches!(self.role, Role::Sender)
    }

    pub fn is_receiver(&self) -> bool {
        matches!(self.role, Role::Receiver)
    }

    /// Count of unsettled deliveries not yet marked locally settled
    /// (invariant 3 of the testable properties).
    pub fn unsettled_count(&self) -> usize {
        self.unsettled
            .iter()
            .filter(|idx| !self.deliveries[**idx].local.settled)
            .count()
    }
}

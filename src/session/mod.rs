//! Session endpoint: channel allocation, transfer windows, and the two
//! per-direction delivery maps.

use std::collections::BTreeMap;

use fe2o3_amqp_types::definitions::{self, TransferNumber};
use slab::Slab;

use crate::delivery::DeliveryMap;
use crate::endpoint::EndpointHeader;
use crate::link::{Link, LinkId};

/// Stable index of a [`Session`] within its owning [`crate::Connection`]'s arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(pub usize);

/// The connection-scoped half of the channel allocation. Unassigned until
/// `ssn_setup` runs; torn down once END has been both sent and processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChannelSlot {
    #[default]
    Unassigned,
    Assigned(u16),
    TornDown,
}

impl ChannelSlot {
    pub fn channel(&self) -> Option<u16> {
        match self {
            ChannelSlot::Assigned(c) => Some(*c),
            _ => None,
        }
    }
}

/// A session's pending, not-yet-flushed disposition batch (§4.6).
#[derive(Debug, Clone)]
pub struct DispositionBatch {
    pub active: bool,
    pub role: definitions::Role,
    pub type_code: u8,
    pub settled: bool,
    pub first: TransferNumber,
    pub last: TransferNumber,
}

impl Default for DispositionBatch {
    fn default() -> Self {
        DispositionBatch {
            active: false,
            role: definitions::Role::Sender,
            type_code: 0,
            settled: false,
            first: 0,
            last: 0,
        }
    }
}

/// One session: an ordered arena of links plus transfer-window bookkeeping.
#[derive(Debug)]
pub struct Session {
    pub endpoint: EndpointHeader,

    pub links: Slab<Link>,
    /// `(name, is_receiver) -> link index`, used by ATTACH to find-or-create.
    /// Keyed on `bool::from(&Role)` rather than `Role` itself since `Role`
    /// implements neither `Eq` nor `Ord`.
    pub links_by_name: BTreeMap<(String, bool), usize>,
    pub remote_handles: BTreeMap<u32, usize>,

    pub local_channel: ChannelSlot,
    pub remote_channel: ChannelSlot,

    pub incoming_capacity: u64,
    pub incoming_bytes: u64,
    pub outgoing_bytes: u64,
    pub incoming_deliveries: u64,
    pub outgoing_deliveries: u64,

    pub incoming_transfer_count: TransferNumber,
    pub outgoing_transfer_count: TransferNumber,
    pub incoming_window: u32,
    pub outgoing_window: u32,
    pub remote_incoming_window: u32,

    pub incoming: DeliveryMap,
    pub outgoing: DeliveryMap,

    pub disposition_batch: DispositionBatch,
}

impl Session {
    pub fn new(incoming_capacity: u64) -> Self {
        Session {
            endpoint: EndpointHeader::default(),
            links: Slab::new(),
            links_by_name: BTreeMap::new(),
            remote_handles: BTreeMap::new(),
            local_channel: ChannelSlot::default(),
            remote_channel: ChannelSlot::default(),
            incoming_capacity,
            incoming_bytes: 0,
            outgoing_bytes: 0,
            incoming_deliveries: 0,
            outgoing_deliveries: 0,
            incoming_transfer_count: 0,
            outgoing_transfer_count: 0,
            incoming_window: 0,
            outgoing_window: 0,
            remote_incoming_window: 0,
            incoming: DeliveryMap::default(),
            outgoing: DeliveryMap::default(),
            disposition_batch: DispositionBatch::default(),
        }
    }

    /// `incoming_window = (capacity - incoming_bytes) / max_frame`, or
    /// `i32::MAX` if the peer never advertised a max-frame.
    pub fn compute_incoming_window(&self, max_frame: u32) -> u32 {
        if max_frame == 0 {
            return i32::MAX as u32;
        }
        let remaining = self.incoming_capacity.saturating_sub(self.incoming_bytes);
        (remaining / max_frame as u64) as u32
    }

    /// `max(ceil(outgoing_bytes / peer_max_frame), outgoing_deliveries)`, or
    /// just `outgoing_deliveries` when the peer has no max-frame.
    pub fn compute_outgoing_window(&self, peer_max_frame: u32) -> u32 {
        if peer_max_frame == 0 {
            return self.outgoing_deliveries as u32;
        }
        let by_bytes = self
            .outgoing_bytes
            .div_ceil(peer_max_frame as u64) as u32;
        by_bytes.max(self.outgoing_deliveries as u32)
    }

    pub fn link_id(&self, idx: usize) -> LinkId {
        LinkId(idx)
    }
}

pub use crate::delivery::{Delivery, DeliveryTag};

//! The delivery model: unsettled/settled queues, disposition state, and the
//! per-session delivery map that assigns monotonic sequence ids.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use fe2o3_amqp_types::definitions::DeliveryNumber;
use fe2o3_amqp_types::messaging::DeliveryState;

/// Opaque delivery tag, scoped to the link.
pub type DeliveryTag = Bytes;

/// Local or remote half of a delivery's outcome.
#[derive(Debug, Clone, Default)]
pub struct Disposition {
    pub state: Option<DeliveryState>,
    pub settled: bool,
}

impl Disposition {
    /// The wire "type" code used by disposition batching: 0 means "nothing
    /// to report yet", otherwise mirrors the `DeliveryState` discriminant.
    pub fn type_code(&self) -> u8 {
        match &self.state {
            None => 0,
            Some(DeliveryState::Received(_)) => 1,
            Some(DeliveryState::Accepted(_)) => 2,
            Some(DeliveryState::Rejected(_)) => 3,
            Some(DeliveryState::Released(_)) => 4,
            Some(DeliveryState::Modified(_)) => 5,
            #[allow(unreachable_patterns)]
            Some(_) => 6,
        }
    }

    /// Only Accepted and Released dispositions may be folded into a batch.
    pub fn is_batchable(&self) -> bool {
        matches!(
            self.state,
            Some(DeliveryState::Accepted(_)) | Some(DeliveryState::Released(_))
        )
    }
}

/// One in-flight or newly-settled transfer.
#[derive(Debug, Clone, Default)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub bytes: BytesMut,
    pub local: Disposition,
    pub remote: Disposition,
    /// Remote disposition changed since the application last observed it.
    pub updated: bool,
    /// No further payload will arrive (receiver) or be sent (sender).
    pub done: bool,
    pub work: bool,
    pub tpwork: bool,
    pub id: Option<DeliveryNumber>,
    /// Set once inserted into a session delivery map; cleared by `full_settle`.
    pub init: bool,
    /// Sender-side: the full transfer (incl. `done`) has been written to the wire.
    pub sent: bool,
}

impl Delivery {
    pub fn new(tag: DeliveryTag) -> Self {
        Delivery {
            tag,
            ..Default::default()
        }
    }

    /// Reset a delivery pulled off the settled free-list for reuse.
    pub fn reset_for_reuse(&mut self, tag: DeliveryTag) {
        self.tag = tag;
        self.bytes.clear();
        self.local = Disposition::default();
        self.remote = Disposition::default();
        self.updated = false;
        self.done = false;
        self.work = false;
        self.tpwork = false;
        self.id = None;
        self.init = false;
        self.sent = false;
    }
}

/// Per-direction, per-session mapping `sequence_id -> delivery index`, with a
/// monotonically increasing `next` counter.
#[derive(Debug, Default)]
pub struct DeliveryMap {
    next: DeliveryNumber,
    entries: BTreeMap<DeliveryNumber, usize>,
}

impl DeliveryMap {
    pub fn next_id(&self) -> DeliveryNumber {
        self.next
    }

    /// Seed the counter from a peer-supplied starting id (BEGIN/first TRANSFER).
    pub fn seed(&mut self, next: DeliveryNumber) {
        self.next = next;
    }

    /// Assign `id = next++` to `delivery_index` and record the mapping.
    pub fn push(&mut self, delivery_index: usize) -> DeliveryNumber {
        let id = self.next;
        self.next = self.next.wrapping_add(1);
        self.entries.insert(id, delivery_index);
        id
    }

    pub fn get(&self, id: DeliveryNumber) -> Option<usize> {
        self.entries.get(&id).copied()
    }

    /// Remove the entry for `id`, if any.
    pub fn del(&mut self, id: DeliveryNumber) -> Option<usize> {
        self.entries.remove(&id)
    }

    pub fn range(&self, first: DeliveryNumber, last: DeliveryNumber) -> Vec<(DeliveryNumber, usize)> {
        self.entries
            .range(first..=last)
            .map(|(id, idx)| (*id, *idx))
            .collect()
    }
}

use num_bigint::BigUint;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use time::OffsetDateTime;

/// Opaque, hex-encoded channel identifier. The wallet mints these; the cache only ever
/// compares and stores them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub String);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ChannelId {
    fn from(value: String) -> Self {
        ChannelId(value)
    }
}

/// An allocation is one indexer x one subgraph deployment. Immutable once introduced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AllocationId(pub String);

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for AllocationId {
    fn from(value: String) -> Self {
        AllocationId(value)
    }
}

/// Externally identified collaboration context: one indexer we pay, for one deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocation {
    pub id: AllocationId,
    pub indexer_url: String,
    pub indexer_signing_address: String,
    pub deployment_id: String,
}

/// A wallet-tracked goal (e.g. "open channel X") that completes asynchronously.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectiveId(pub String);

impl fmt::Display for ObjectiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A decoded snapshot of a payment channel row, as handed to critical sections and returned
/// from wallet operations. `turn_num` parity encodes whose move it is: even means we are
/// awaiting the peer, odd means the channel is free to fund a payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelSnapshot {
    pub channel_id: ChannelId,
    pub context_id: AllocationId,
    pub turn_num: u64,
    pub payer_bal: BigUint,
    pub receiver_bal: BigUint,
    pub app_data: Vec<u8>,
    pub outcome: Vec<u8>,
    pub retired: bool,
    pub updated_at: OffsetDateTime,
}

impl ChannelSnapshot {
    /// `turn_num % 2 == 1` means it is our move: the channel is eligible to fund a payment.
    pub fn is_our_move(&self) -> bool {
        self.turn_num % 2 == 1
    }

    /// `turn_num % 2 == 0` means it is the peer's move: we are awaiting a reply.
    pub fn is_peers_move(&self) -> bool {
        self.turn_num % 2 == 0
    }
}

/// A funding channel shared by many payment channels of one allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub channel_id: ChannelId,
    pub context_id: AllocationId,
    pub initial_outcome: Vec<u8>,
}

/// A peer-addressed payload produced by a wallet operation. The exchange loop drains these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub recipient: String,
    pub payload: Vec<u8>,
}

/// Per-allocation retirement report: the total indexer balance retired, and which channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetireReport {
    pub amount: BigUint,
    pub channel_ids: Vec<ChannelId>,
}

/// The three ways a capacity request can express a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityKind {
    SetTo,
    IncreaseBy,
    ScaleBy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityRequest {
    pub allocation: Allocation,
    pub num: i64,
    pub kind: CapacityKind,
}

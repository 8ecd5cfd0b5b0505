use crate::types::AllocationId;
use crate::types::ObjectiveId;

/// The process-wide error taxonomy for the channel pool core.
///
/// Every variant here corresponds to a named failure kind in the design: callers match on
/// specific variants (most notably [`GatewayError::NoFreeChannels`], which is a fast-path
/// signal rather than a genuine error) instead of string-matching a generic error type.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// `acquire_channel` found no eligible row for this allocation. Expected under contention;
    /// callers implement their own back-pressure.
    #[error("no free channel for allocation {0}")]
    NoFreeChannels(AllocationId),

    /// A capacity request or payment amount failed validation. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The wallet returned something the protocol does not allow (wrong outbox cardinality,
    /// wrong number of channel results). Should never happen in a correct system.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// An `ensure_objectives` retry schedule was exhausted with objectives still pending.
    #[error("objectives not completed: {0:?}")]
    ObjectivesNotCompleted(Vec<ObjectiveId>),

    /// `sync_opening_channels_max_attempts` polls were exhausted and the wallet still does not
    /// report the ledger channel as funded and running.
    #[error("ledger channel for allocation {0} did not confirm in time")]
    LedgerNotConfirmed(AllocationId),

    #[error("storage error")]
    Storage(#[from] diesel::result::Error),

    #[error("connection pool error")]
    Pool(#[from] diesel::r2d2::PoolError),
}

pub type Result<T> = std::result::Result<T, GatewayError>;

//! Error kinds surfaced by the scheduling core.
//!
//! Heartbeat-path errors are absorbed and counted by the caller; admin-path
//! errors propagate to the caller; background loops log and continue.

use thiserror::Error;

/// Why the operator controller refused to admit an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    LimitExceeded,
    AlreadyExists,
    RegionUnhealthy,
    StoreLimitExhausted,
    Cancelled,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RejectReason::LimitExceeded => "limit-exceeded",
            RejectReason::AlreadyExists => "already-exists",
            RejectReason::RegionUnhealthy => "region-unhealthy",
            RejectReason::StoreLimitExhausted => "store-limit-exhausted",
            RejectReason::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Errors produced by the scheduling core.
#[derive(Debug, Error)]
pub enum SchedError {
    #[error("request must be served by the cluster leader")]
    NotLeader,
    #[error("region {0} not found")]
    RegionNotFound(u64),
    #[error("store {0} not found")]
    StoreNotFound(u64),
    #[error("heartbeat carries a stale region epoch")]
    EpochStale,
    #[error("region {0} is not fully replicated")]
    UnreplicatedRegion(u64),
    #[error("operator rejected: {0}")]
    OperatorRejected(RejectReason),
    #[error("too many operators are waiting to be admitted")]
    SchedulerBusy,
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
}

pub type Result<T> = std::result::Result<T, SchedError>;

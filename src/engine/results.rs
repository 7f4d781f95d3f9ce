// 8.0.2: result types and errors for engine operations.

use crate::ledger::TradeRecord;
use crate::position::{Position, Settlement};
use crate::store::{Conflict, StoreError};
use crate::types::{Price, Symbol, Timestamp};
use crate::wallet::Wallet;

/// Outcome of the wallet half of a close, which runs after the position is gone.
#[derive(Debug, Clone, PartialEq)]
pub enum WalletUpdate {
    Applied(Wallet),
    /// Queued; retried on every tick until the store accepts it.
    Deferred,
    /// Not retryable (e.g. the wallet row is missing).
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloseReport {
    pub position: Position,
    pub record: TradeRecord,
    pub settlement: Settlement,
    pub wallet: WalletUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Stale { age_ms: u64 },
    /// Older than the latest price already booked for the symbol.
    OutOfOrder,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub symbol: Symbol,
    pub mark_price: Price,
    pub observed_at: Timestamp,
    pub skipped: Option<SkipReason>,
    pub evaluated: usize,
    pub closed: Vec<CloseReport>,
    /// Triggers that lost the race to another closing path.
    pub conflicts: usize,
    /// Triggers whose close failed transiently and will be retried.
    pub deferred: usize,
    pub settlements_recovered: usize,
}

impl TickReport {
    pub(super) fn new(symbol: Symbol, mark_price: Price, observed_at: Timestamp) -> Self {
        Self {
            symbol,
            mark_price,
            observed_at,
            skipped: None,
            evaluated: 0,
            closed: Vec::new(),
            conflicts: 0,
            deferred: 0,
            settlements_recovered: 0,
        }
    }

    pub fn was_evaluated(&self) -> bool {
        self.skipped.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    /// Someone else already closed the position. Expected under races.
    #[error(transparent)]
    Conflict(Conflict),

    #[error("Store error: {0}")]
    Store(StoreError),
}

impl EngineError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Store(e) if e.is_transient())
    }
}

impl From<StoreError> for EngineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(conflict) => EngineError::Conflict(conflict),
            other => EngineError::Store(other),
        }
    }
}

//! Position store: the only place positions, wallets and trade records change.
//!
//! Both closing paths (price-driven and user-driven) race through
//! [`PositionStore::try_close`], which is a compare-and-delete. Exactly one
//! caller gets the [`ClosedPosition`]; everybody else sees
//! [`Conflict::PositionGone`]. Opening goes through [`PositionStore::try_open`],
//! which refuses a second open position for the same (user, symbol) and takes
//! the margin out of the wallet in the same atomic step.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::ledger::TradeRecord;
use crate::position::{CloseKind, NewPosition, Position, Settlement};
use crate::types::{PositionId, Price, Quote, Symbol, Timestamp, UserId};
use crate::wallet::{Wallet, WalletError};
use async_trait::async_trait;

/// Result of winning a close race.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedPosition {
    pub position: Position,
    pub record: TradeRecord,
    /// Wallet effect the caller still has to apply.
    pub settlement: Settlement,
}

#[async_trait]
pub trait PositionStore: Send + Sync + std::fmt::Debug {
    /// Insert iff no position is open for (user, symbol), the wallet is not
    /// liquidated and can cover the margin. Debits the margin and appends the
    /// `open` record atomically with the insert.
    async fn try_open(&self, new: NewPosition, at: Timestamp) -> Result<Position, StoreError>;

    /// Delete iff a position with `id` owned by `owner` still exists, and append
    /// the terminal record atomically with the delete. Does not touch the wallet.
    async fn try_close(
        &self,
        id: PositionId,
        owner: &UserId,
        kind: CloseKind,
        exec_price: Price,
        at: Timestamp,
    ) -> Result<ClosedPosition, StoreError>;

    async fn apply_settlement(
        &self,
        user_id: &UserId,
        settlement: Settlement,
        at: Timestamp,
    ) -> Result<Wallet, StoreError>;

    async fn position(&self, id: PositionId) -> Result<Option<Position>, StoreError>;

    async fn open_positions(&self, symbol: Symbol) -> Result<Vec<Position>, StoreError>;

    async fn user_positions(&self, user_id: &UserId) -> Result<Vec<Position>, StoreError>;

    async fn wallet(&self, user_id: &UserId) -> Result<Option<Wallet>, StoreError>;

    /// Newest first.
    async fn trades(&self, user_id: &UserId, limit: usize) -> Result<Vec<TradeRecord>, StoreError>;

    /// The close/liq/tp/sl record written for `position_id`, if any.
    async fn terminal_trade(&self, position_id: PositionId) -> Result<Option<TradeRecord>, StoreError>;

    /// Creates the wallet at `balance` if missing, otherwise returns it untouched.
    async fn provision_wallet(&self, user_id: &UserId, balance: Quote, at: Timestamp) -> Result<Wallet, StoreError>;

    /// Adds `amount` and clears the liquidated flag.
    async fn fund_wallet(&self, user_id: &UserId, amount: Quote, at: Timestamp) -> Result<Wallet, StoreError>;

    /// Sets the balance to `balance` and clears the liquidated flag.
    async fn reset_wallet(&self, user_id: &UserId, balance: Quote, at: Timestamp) -> Result<Wallet, StoreError>;
}

/// Expected outcomes of the concurrency model. Callers branch on these; they are
/// not failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Conflict {
    #[error("{user_id} already has an open {symbol} position")]
    PositionExists { user_id: UserId, symbol: Symbol },

    #[error("Position {0} is no longer open")]
    PositionGone(PositionId),

    #[error("Wallet of {0} is liquidated")]
    WalletLiquidated(UserId),

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: Quote, available: Quote },
}

impl Conflict {
    pub(crate) fn from_wallet(user_id: &UserId, err: WalletError) -> Self {
        match err {
            WalletError::Liquidated => Conflict::WalletLiquidated(user_id.clone()),
            WalletError::InsufficientBalance { required, available } => {
                Conflict::InsufficientBalance { required, available }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Conflict(#[from] Conflict),

    #[error("No wallet for user {0}")]
    WalletNotFound(UserId),

    /// Transient: the write may succeed if retried.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

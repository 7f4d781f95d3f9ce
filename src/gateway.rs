//! User-facing order entry.
//!
//! Admission control for opens, manual closes through the engine's single
//! terminal transition, and the read models the presentation layer renders.
//! The user id is already authenticated by the time it reaches this module.

use crate::engine::{CloseReport, EngineError, PositionEngine};
use crate::ledger::TradeRecord;
use crate::margin::MarginParams;
use crate::position::{CloseKind, NewPosition, Position};
use crate::store::{Conflict, StoreError};
use crate::types::{Leverage, PositionId, Price, Quantity, Quote, Side, Symbol, UserId};
use crate::wallet::Wallet;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A market order to open a position at the current mark price.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenOrder {
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: Decimal,
    pub leverage: u32,
    #[serde(default)]
    pub take_profit: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
}

impl OpenOrder {
    pub fn market(symbol: Symbol, side: Side, quantity: Decimal, leverage: u32) -> Self {
        Self {
            symbol,
            side,
            quantity,
            leverage,
            take_profit: None,
            stop_loss: None,
        }
    }

    pub fn with_take_profit(mut self, price: Decimal) -> Self {
        self.take_profit = Some(price);
        self
    }

    pub fn with_stop_loss(mut self, price: Decimal) -> Self {
        self.stop_loss = Some(price);
        self
    }
}

/// What a manual close actually did.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    Closed(CloseReport),
    /// The engine got there first. `kind` and `record` describe the close
    /// that really happened.
    AlreadyClosed {
        kind: CloseKind,
        record: TradeRecord,
        wallet: Option<Wallet>,
    },
}

impl CloseOutcome {
    pub fn kind(&self) -> CloseKind {
        match self {
            CloseOutcome::Closed(report) => report.record.kind.close_kind().unwrap_or(CloseKind::Manual),
            CloseOutcome::AlreadyClosed { kind, .. } => *kind,
        }
    }

    pub fn record(&self) -> &TradeRecord {
        match self {
            CloseOutcome::Closed(report) => &report.record,
            CloseOutcome::AlreadyClosed { record, .. } => record,
        }
    }
}

/// A position valued at the latest fresh mark price. Valuation fields are
/// `None` while the symbol has no fresh price.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionView {
    pub position: Position,
    pub mark_price: Option<Price>,
    pub unrealized_pnl: Option<Quote>,
    /// Percent of margin.
    pub roe: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderError {
    #[error("Quantity must be positive, got {0}")]
    InvalidQuantity(Decimal),

    #[error("Position too large: {quantity} at {price} overflows the notional")]
    SizeTooLarge { quantity: Decimal, price: Price },

    #[error("Leverage must be between 1x and {max}x, got {requested}x")]
    InvalidLeverage { requested: u32, max: u32 },

    #[error("A {0} position is already open; close it first")]
    DuplicatePosition(Symbol),

    #[error("Wallet is liquidated; deposit funds to trade again")]
    WalletLiquidated,

    #[error("Insufficient margin: required {required}, available {available}")]
    InsufficientMargin { required: Quote, available: Quote },

    #[error("No wallet for user {0}")]
    WalletNotFound(UserId),

    #[error("No fresh price for {0}")]
    PriceUnavailable(Symbol),

    #[error("Position {0} not found")]
    PositionNotFound(PositionId),

    #[error("Temporarily unavailable, please retry: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl OrderError {
    /// Worth retrying unchanged; everything else needs the user to change something.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OrderError::Unavailable(_) | OrderError::PriceUnavailable(_))
    }
}

impl From<StoreError> for OrderError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(Conflict::PositionExists { symbol, .. }) => OrderError::DuplicatePosition(symbol),
            StoreError::Conflict(Conflict::WalletLiquidated(_)) => OrderError::WalletLiquidated,
            StoreError::Conflict(Conflict::InsufficientBalance { required, available }) => {
                OrderError::InsufficientMargin { required, available }
            }
            StoreError::Conflict(Conflict::PositionGone(id)) => OrderError::PositionNotFound(id),
            StoreError::WalletNotFound(user_id) => OrderError::WalletNotFound(user_id),
            StoreError::Unavailable(reason) => OrderError::Unavailable(reason),
            StoreError::Corrupt(reason) => OrderError::Internal(reason),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderGateway {
    engine: PositionEngine,
    params: MarginParams,
    history_limit: usize,
}

impl OrderGateway {
    pub fn new(engine: PositionEngine, params: MarginParams, history_limit: usize) -> Self {
        Self {
            engine,
            params,
            history_limit,
        }
    }

    pub fn engine(&self) -> &PositionEngine {
        &self.engine
    }

    /// Open a position at the latest fresh mark price.
    ///
    /// Rejections, in order: bad quantity or leverage, no fresh price, a size
    /// whose notional overflows, a liquidation wipe still queued for the wallet,
    /// an open position on the symbol, a liquidated wallet, not enough balance.
    pub async fn open_position(&self, user_id: &UserId, order: OpenOrder) -> Result<Position, OrderError> {
        let quantity = Quantity::new(order.quantity).ok_or(OrderError::InvalidQuantity(order.quantity))?;

        let max = self.params.max_leverage;
        let leverage = Leverage::new(order.leverage)
            .filter(|lev| *lev <= max)
            .ok_or(OrderError::InvalidLeverage {
                requested: order.leverage,
                max: max.get(),
            })?;

        // non-positive TP/SL means "not set"
        let take_profit = order.take_profit.and_then(Price::new);
        let stop_loss = order.stop_loss.and_then(Price::new);

        let tick = self
            .engine
            .fresh_price(order.symbol)
            .ok_or(OrderError::PriceUnavailable(order.symbol))?;

        let new = NewPosition::new(
            user_id.clone(),
            order.symbol,
            order.side,
            tick.mark_price,
            quantity,
            leverage,
            take_profit,
            stop_loss,
            &self.params,
        )
        .ok_or(OrderError::SizeTooLarge {
            quantity: order.quantity,
            price: tick.mark_price,
        })?;

        // the stored wallet is not flagged yet, but its balance is already gone
        if self.engine.has_pending_wipe(user_id) {
            tracing::debug!(user_id = %user_id, symbol = %order.symbol, "open rejected, wipe pending");
            return Err(OrderError::WalletLiquidated);
        }

        let position = match self.engine.store().try_open(new, self.engine.now()).await {
            Ok(position) => position,
            Err(err) => {
                if err.is_conflict() {
                    tracing::debug!(user_id = %user_id, symbol = %order.symbol, %err, "open rejected");
                } else {
                    tracing::warn!(user_id = %user_id, symbol = %order.symbol, error = %err, "open failed");
                }
                return Err(err.into());
            }
        };

        self.engine.record_opened(&position);
        Ok(position)
    }

    /// Close a position at the latest fresh mark price.
    ///
    /// If the engine closed it first, returns [`CloseOutcome::AlreadyClosed`]
    /// describing that close instead of an error.
    pub async fn close_position(&self, user_id: &UserId, position_id: PositionId) -> Result<CloseOutcome, OrderError> {
        let store = self.engine.store();

        let position = match store.position(position_id).await? {
            Some(position) if &position.user_id == user_id => position,
            Some(_) => return Err(OrderError::PositionNotFound(position_id)),
            None => return self.reconcile(user_id, position_id).await,
        };

        let tick = self
            .engine
            .fresh_price(position.symbol)
            .ok_or(OrderError::PriceUnavailable(position.symbol))?;

        match self.engine.close_position(&position, CloseKind::Manual, tick.mark_price).await {
            Ok(report) => Ok(CloseOutcome::Closed(report)),
            Err(EngineError::Conflict(_)) => {
                tracing::debug!(user_id = %user_id, position_id = %position_id, "manual close lost the race");
                self.reconcile(user_id, position_id).await
            }
            Err(EngineError::Store(err)) => {
                tracing::warn!(user_id = %user_id, position_id = %position_id, error = %err, "manual close failed");
                Err(err.into())
            }
        }
    }

    // the position is gone: report the close that actually happened
    async fn reconcile(&self, user_id: &UserId, position_id: PositionId) -> Result<CloseOutcome, OrderError> {
        let store = self.engine.store();
        let Some(record) = store.terminal_trade(position_id).await? else {
            return Err(OrderError::PositionNotFound(position_id));
        };
        if &record.user_id != user_id {
            return Err(OrderError::PositionNotFound(position_id));
        }
        let Some(kind) = record.kind.close_kind() else {
            return Err(OrderError::Internal(format!("non-terminal record for {position_id}")));
        };

        let wallet = store.wallet(user_id).await?;
        Ok(CloseOutcome::AlreadyClosed { kind, record, wallet })
    }

    pub async fn positions(&self, user_id: &UserId) -> Result<Vec<PositionView>, OrderError> {
        let positions = self.engine.store().user_positions(user_id).await?;
        Ok(positions
            .into_iter()
            .map(|position| {
                let mark_price = self.engine.fresh_price(position.symbol).map(|t| t.mark_price);
                PositionView {
                    unrealized_pnl: mark_price.map(|m| position.unrealized_pnl(m)),
                    roe: mark_price.map(|m| position.roe(m)),
                    mark_price,
                    position,
                }
            })
            .collect())
    }

    pub async fn wallet(&self, user_id: &UserId) -> Result<Wallet, OrderError> {
        self.engine
            .store()
            .wallet(user_id)
            .await?
            .ok_or_else(|| OrderError::WalletNotFound(user_id.clone()))
    }

    /// Newest first. `None` uses the configured default limit.
    pub async fn trade_history(&self, user_id: &UserId, limit: Option<usize>) -> Result<Vec<TradeRecord>, OrderError> {
        let limit = limit.unwrap_or(self.history_limit);
        Ok(self.engine.store().trades(user_id, limit).await?)
    }
}

// 5.0: append-only trade ledger. records are written once per transition and
// never mutated or deleted.

use crate::position::{CloseKind, Position};
use crate::types::{Leverage, PositionId, Price, Quantity, Quote, Side, Symbol, Timestamp, TradeId, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TradeKind {
    #[serde(rename = "open")]
    Open,
    #[serde(rename = "close")]
    Close,
    #[serde(rename = "liq")]
    Liquidation,
    #[serde(rename = "tp")]
    TakeProfit,
    #[serde(rename = "sl")]
    StopLoss,
}

impl TradeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeKind::Open => "open",
            TradeKind::Close => "close",
            TradeKind::Liquidation => "liq",
            TradeKind::TakeProfit => "tp",
            TradeKind::StopLoss => "sl",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TradeKind::Open)
    }

    /// The close kind behind a terminal record. `None` for opens.
    pub fn close_kind(&self) -> Option<CloseKind> {
        match self {
            TradeKind::Open => None,
            TradeKind::Close => Some(CloseKind::Manual),
            TradeKind::Liquidation => Some(CloseKind::Liquidation),
            TradeKind::TakeProfit => Some(CloseKind::TakeProfit),
            TradeKind::StopLoss => Some(CloseKind::StopLoss),
        }
    }
}

impl From<CloseKind> for TradeKind {
    fn from(kind: CloseKind) -> Self {
        match kind {
            CloseKind::Manual => TradeKind::Close,
            CloseKind::Liquidation => TradeKind::Liquidation,
            CloseKind::TakeProfit => TradeKind::TakeProfit,
            CloseKind::StopLoss => TradeKind::StopLoss,
        }
    }
}

impl fmt::Display for TradeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TradeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(TradeKind::Open),
            "close" => Ok(TradeKind::Close),
            "liq" => Ok(TradeKind::Liquidation),
            "tp" => Ok(TradeKind::TakeProfit),
            "sl" => Ok(TradeKind::StopLoss),
            other => Err(format!("unknown trade kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: TradeId,
    pub position_id: PositionId,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: TradeKind,
    pub symbol: Symbol,
    pub side: Side,
    pub price: Price,
    pub quantity: Quantity,
    pub leverage: Leverage,
    pub pnl: Quote,
    pub timestamp: Timestamp,
}

impl TradeRecord {
    pub fn opened(position: &Position) -> Self {
        Self {
            id: TradeId::new(),
            position_id: position.id,
            user_id: position.user_id.clone(),
            kind: TradeKind::Open,
            symbol: position.symbol,
            side: position.side,
            price: position.entry_price,
            quantity: position.quantity,
            leverage: position.leverage,
            pnl: Quote::zero(),
            timestamp: position.opened_at,
        }
    }

    // pnl is the raw figure at the exit price, even for a liquidation
    pub fn closed(position: &Position, kind: CloseKind, exec_price: Price, timestamp: Timestamp) -> Self {
        Self {
            id: TradeId::new(),
            position_id: position.id,
            user_id: position.user_id.clone(),
            kind: kind.into(),
            symbol: position.symbol,
            side: position.side,
            price: exec_price,
            quantity: position.quantity,
            leverage: position.leverage,
            pnl: position.unrealized_pnl(exec_price),
            timestamp,
        }
    }
}

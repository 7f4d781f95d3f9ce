// 9.0: every state change the engine makes is broadcast as an event. used for
// audit trails and for notifying external systems (dashboards, tests).

use crate::ledger::TradeKind;
use crate::position::CloseKind;
use crate::types::{Leverage, PositionId, Price, Quantity, Quote, Side, Symbol, Timestamp, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub u64);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub timestamp: Timestamp,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(id: EventId, timestamp: Timestamp, payload: EventPayload) -> Self {
        Self {
            id,
            timestamp,
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    // Position lifecycle
    PositionOpened(PositionOpenedEvent),
    PositionClosed(PositionClosedEvent),

    // Wallet effects
    SettlementDeferred(SettlementDeferredEvent),
    SettlementRecovered(SettlementRecoveredEvent),

    // Feed health
    StalePriceSkipped(StalePriceEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionOpenedEvent {
    pub position_id: PositionId,
    pub user_id: UserId,
    pub symbol: Symbol,
    pub side: Side,
    pub entry_price: Price,
    pub quantity: Quantity,
    pub leverage: Leverage,
    pub margin: Quote,
    pub liquidation_price: Option<Price>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionClosedEvent {
    pub position_id: PositionId,
    pub user_id: UserId,
    pub symbol: Symbol,
    pub kind: CloseKind,
    pub trade_kind: TradeKind,
    pub exec_price: Price,
    pub pnl: Quote,
    pub credit: Quote,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementDeferredEvent {
    pub position_id: PositionId,
    pub user_id: UserId,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementRecoveredEvent {
    pub position_id: PositionId,
    pub user_id: UserId,
    pub attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StalePriceEvent {
    pub symbol: Symbol,
    pub observed_at: Timestamp,
    pub age_ms: u64,
}

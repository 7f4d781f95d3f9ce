// 4.0: open position tracking. one position per (user, symbol).
// 4.1 trigger evaluation and 4.2 per-outcome settlement are at the bottom.

use crate::margin::{initial_margin, liquidation_price, maintenance_margin, notional, roe, unrealized_pnl, MarginParams};
use crate::types::{Leverage, PositionId, Price, Quantity, Quote, Side, Symbol, Timestamp, UserId};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: PositionId,
    pub user_id: UserId,
    pub symbol: Symbol,
    pub side: Side,
    pub entry_price: Price,
    pub leverage: Leverage,
    pub quantity: Quantity,
    pub margin: Quote,
    /// `None` when the sizing cannot be liquidated at any positive price.
    pub liquidation_price: Option<Price>,
    pub take_profit: Option<Price>,
    pub stop_loss: Option<Price>,
    pub opened_at: Timestamp,
}

impl Position {
    pub fn unrealized_pnl(&self, mark_price: Price) -> Quote {
        unrealized_pnl(self.side, self.entry_price, mark_price, self.quantity, self.leverage)
    }

    pub fn roe(&self, mark_price: Price) -> Decimal {
        roe(self.unrealized_pnl(mark_price), self.margin)
    }

    pub fn notional(&self) -> Quote {
        Quote::new(self.entry_price.value().saturating_mul(self.quantity.value()))
    }

    // 4.1: liquidation pre-empts TP, TP pre-empts SL
    pub fn trigger_at(&self, mark_price: Price) -> Option<CloseKind> {
        if self.is_liquidatable(mark_price) {
            return Some(CloseKind::Liquidation);
        }

        if let Some(tp) = self.take_profit {
            let hit = match self.side {
                Side::Long => mark_price >= tp,
                Side::Short => mark_price <= tp,
            };
            if hit {
                return Some(CloseKind::TakeProfit);
            }
        }

        if let Some(sl) = self.stop_loss {
            let hit = match self.side {
                Side::Long => mark_price <= sl,
                Side::Short => mark_price >= sl,
            };
            if hit {
                return Some(CloseKind::StopLoss);
            }
        }

        None
    }

    pub fn is_liquidatable(&self, mark_price: Price) -> bool {
        match (self.liquidation_price, self.side) {
            (None, _) => false,
            (Some(liq), Side::Long) => mark_price <= liq,
            (Some(liq), Side::Short) => mark_price >= liq,
        }
    }

    // 4.2: what the wallet gets back for closing at `exec_price`
    pub fn settlement(&self, kind: CloseKind, exec_price: Price) -> Settlement {
        kind.settle(self.margin, self.unrealized_pnl(exec_price))
    }
}

/// An admitted open request with every derived field filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPosition {
    pub user_id: UserId,
    pub symbol: Symbol,
    pub side: Side,
    pub entry_price: Price,
    pub leverage: Leverage,
    pub quantity: Quantity,
    pub margin: Quote,
    pub liquidation_price: Option<Price>,
    pub take_profit: Option<Price>,
    pub stop_loss: Option<Price>,
}

impl NewPosition {
    /// `None` when the notional does not fit in a `Decimal`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: UserId,
        symbol: Symbol,
        side: Side,
        entry_price: Price,
        quantity: Quantity,
        leverage: Leverage,
        take_profit: Option<Price>,
        stop_loss: Option<Price>,
        params: &MarginParams,
    ) -> Option<Self> {
        maintenance_margin(notional(entry_price, quantity)?, params)?;
        Some(Self {
            margin: initial_margin(entry_price, quantity, leverage)?,
            liquidation_price: liquidation_price(side, entry_price, quantity, leverage, params),
            user_id,
            symbol,
            side,
            entry_price,
            leverage,
            quantity,
            take_profit,
            stop_loss,
        })
    }

    pub fn into_position(self, id: PositionId, opened_at: Timestamp) -> Position {
        Position {
            id,
            user_id: self.user_id,
            symbol: self.symbol,
            side: self.side,
            entry_price: self.entry_price,
            leverage: self.leverage,
            quantity: self.quantity,
            margin: self.margin,
            liquidation_price: self.liquidation_price,
            take_profit: self.take_profit,
            stop_loss: self.stop_loss,
            opened_at,
        }
    }
}

/// How a position left the book. Every terminal transition is exactly one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseKind {
    Manual,
    Liquidation,
    TakeProfit,
    StopLoss,
}

impl CloseKind {
    pub fn settle(&self, margin: Quote, pnl: Quote) -> Settlement {
        match self {
            CloseKind::Liquidation => Settlement::Wipe,
            CloseKind::Manual | CloseKind::TakeProfit | CloseKind::StopLoss => {
                Settlement::Credit(margin.add(pnl).floor_zero())
            }
        }
    }

    pub fn is_automatic(&self) -> bool {
        !matches!(self, CloseKind::Manual)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseKind::Manual => "manual",
            CloseKind::Liquidation => "liquidation",
            CloseKind::TakeProfit => "take_profit",
            CloseKind::StopLoss => "stop_loss",
        }
    }
}

/// Wallet effect of a terminal transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Settlement {
    /// Add margin + pnl (floored at zero) to the balance.
    Credit(Quote),
    /// Force the balance to zero and flag the wallet as liquidated.
    Wipe,
}

impl Settlement {
    pub fn credit(&self) -> Quote {
        match self {
            Settlement::Credit(amount) => *amount,
            Settlement::Wipe => Quote::zero(),
        }
    }
}

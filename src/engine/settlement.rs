//! The terminal transition. Both the price-driven path and the manual path
//! close positions through [`PositionEngine::close_position`].

use super::core::{PendingSettlement, PositionEngine};
use super::results::{CloseReport, EngineError, WalletUpdate};
use crate::events::{EventPayload, PositionClosedEvent, SettlementDeferredEvent, SettlementRecoveredEvent};
use crate::ledger::TradeKind;
use crate::position::{CloseKind, Position};
use crate::types::Price;

impl PositionEngine {
    /// Close `position` at `exec_price`.
    ///
    /// Returns [`EngineError::Conflict`] when another path already closed it;
    /// in that case nothing was written. On success exactly one terminal trade
    /// record exists and the wallet effect has been applied or queued.
    pub async fn close_position(
        &self,
        position: &Position,
        kind: CloseKind,
        exec_price: Price,
    ) -> Result<CloseReport, EngineError> {
        let store = &self.state.store;
        let now = self.now();

        let closed = store
            .try_close(position.id, &position.user_id, kind, exec_price, now)
            .await?;
        self.pending().closes.remove(&position.id);

        let wallet = match store.apply_settlement(&position.user_id, closed.settlement, now).await {
            Ok(wallet) => WalletUpdate::Applied(wallet),
            Err(err) if err.is_transient() => {
                tracing::warn!(
                    position_id = %position.id,
                    user_id = %position.user_id,
                    error = %err,
                    "wallet settlement deferred"
                );
                self.pending().settlements.push(PendingSettlement {
                    position_id: position.id,
                    user_id: position.user_id.clone(),
                    settlement: closed.settlement,
                    attempts: 1,
                });
                self.emit(EventPayload::SettlementDeferred(SettlementDeferredEvent {
                    position_id: position.id,
                    user_id: position.user_id.clone(),
                    reason: err.to_string(),
                }));
                WalletUpdate::Deferred
            }
            Err(err) => {
                tracing::error!(
                    position_id = %position.id,
                    user_id = %position.user_id,
                    error = %err,
                    "wallet settlement failed"
                );
                WalletUpdate::Failed(err.to_string())
            }
        };

        let record = closed.record;
        if kind == CloseKind::Liquidation {
            tracing::info!(
                position_id = %position.id,
                user_id = %position.user_id,
                symbol = %position.symbol,
                mark = %exec_price,
                "position liquidated, wallet wiped"
            );
        } else {
            tracing::info!(
                position_id = %position.id,
                user_id = %position.user_id,
                symbol = %position.symbol,
                kind = kind.as_str(),
                price = %exec_price,
                pnl = %record.pnl,
                "position closed"
            );
        }

        self.emit(EventPayload::PositionClosed(PositionClosedEvent {
            position_id: position.id,
            user_id: position.user_id.clone(),
            symbol: position.symbol,
            kind,
            trade_kind: TradeKind::from(kind),
            exec_price,
            pnl: record.pnl,
            credit: closed.settlement.credit(),
        }));

        Ok(CloseReport {
            position: closed.position,
            record,
            settlement: closed.settlement,
            wallet,
        })
    }

    /// Re-apply wallet settlements that failed earlier. Returns how many landed.
    pub async fn retry_settlements(&self) -> usize {
        let queued = std::mem::take(&mut self.pending().settlements);
        if queued.is_empty() {
            return 0;
        }

        let store = &self.state.store;
        let mut recovered = 0;
        let mut still_pending = Vec::new();

        for mut entry in queued {
            match store.apply_settlement(&entry.user_id, entry.settlement, self.now()).await {
                Ok(_) => {
                    recovered += 1;
                    tracing::info!(
                        position_id = %entry.position_id,
                        user_id = %entry.user_id,
                        attempts = entry.attempts + 1,
                        "deferred settlement applied"
                    );
                    self.emit(EventPayload::SettlementRecovered(SettlementRecoveredEvent {
                        position_id: entry.position_id,
                        user_id: entry.user_id,
                        attempts: entry.attempts + 1,
                    }));
                }
                Err(err) if err.is_transient() => {
                    entry.attempts += 1;
                    tracing::warn!(
                        position_id = %entry.position_id,
                        attempts = entry.attempts,
                        error = %err,
                        "deferred settlement still failing"
                    );
                    still_pending.push(entry);
                }
                Err(err) => {
                    tracing::error!(
                        position_id = %entry.position_id,
                        user_id = %entry.user_id,
                        error = %err,
                        "dropping deferred settlement"
                    );
                }
            }
        }

        self.pending().settlements.extend(still_pending);
        recovered
    }
}

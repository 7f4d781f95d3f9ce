// 8.3: per-tick evaluation. every open position on the tick's symbol is checked
// against its thresholds; triggered closes run concurrently so one slow write
// does not hold up the rest.

use super::core::{PendingClose, PositionEngine};
use super::results::{CloseReport, EngineError, SkipReason, TickReport};
use crate::events::{EventPayload, StalePriceEvent};
use crate::feed::PriceTick;
use crate::position::{CloseKind, Position};
use crate::types::{PositionId, Price, Symbol};
use std::collections::HashSet;
use tokio::task::JoinSet;

type CloseAttempt = (Position, CloseKind, Price, Result<CloseReport, EngineError>);

impl PositionEngine {
    pub async fn on_tick(&self, tick: PriceTick) -> TickReport {
        let mut report = TickReport::new(tick.symbol, tick.mark_price, tick.observed_at);

        if !self.record_price(tick) {
            report.skipped = Some(SkipReason::OutOfOrder);
            return report;
        }

        report.settlements_recovered = self.retry_settlements().await;

        let now = self.now();
        if tick.is_stale(now, self.state.config.staleness_window_ms) {
            let age_ms = now.millis_since(tick.observed_at);
            tracing::debug!(symbol = %tick.symbol, age_ms, "stale tick, evaluation withheld");
            self.emit(EventPayload::StalePriceSkipped(StalePriceEvent {
                symbol: tick.symbol,
                observed_at: tick.observed_at,
                age_ms,
            }));
            report.skipped = Some(SkipReason::Stale { age_ms });
            return report;
        }

        let mut attempts = JoinSet::new();

        // closes that failed last time go first, with their original trigger
        let retried = self.take_pending_closes(tick.symbol);
        let retried_ids: HashSet<PositionId> = retried.iter().map(|p| p.position.id).collect();
        for pending in retried {
            spawn_close(&mut attempts, self.clone(), pending.position, pending.kind, pending.exec_price);
        }

        let positions = match self.state.store.open_positions(tick.symbol).await {
            Ok(positions) => positions,
            Err(err) => {
                tracing::warn!(symbol = %tick.symbol, error = %err, "could not load open positions");
                Vec::new()
            }
        };
        report.evaluated = positions.len();

        for position in positions {
            if retried_ids.contains(&position.id) {
                continue;
            }
            if let Some(kind) = position.trigger_at(tick.mark_price) {
                spawn_close(&mut attempts, self.clone(), position, kind, tick.mark_price);
            }
        }

        while let Some(joined) = attempts.join_next().await {
            match joined {
                Ok(attempt) => self.absorb(&mut report, attempt),
                Err(err) => {
                    tracing::error!(symbol = %tick.symbol, error = %err, "close task panicked");
                }
            }
        }

        report
    }

    fn absorb(&self, report: &mut TickReport, attempt: CloseAttempt) {
        let (position, kind, exec_price, outcome) = attempt;
        match outcome {
            Ok(closed) => report.closed.push(closed),
            Err(EngineError::Conflict(conflict)) => {
                tracing::debug!(position_id = %position.id, %conflict, "trigger lost the close race");
                report.conflicts += 1;
            }
            Err(EngineError::Store(err)) if !err.is_transient() => {
                // position stays open; the next tick evaluates it afresh
                tracing::error!(position_id = %position.id, error = %err, "close failed");
            }
            Err(EngineError::Store(err)) => {
                tracing::warn!(
                    position_id = %position.id,
                    kind = kind.as_str(),
                    error = %err,
                    "close failed, retrying next tick"
                );
                report.deferred += 1;
                self.pending().closes.insert(
                    position.id,
                    PendingClose {
                        position,
                        kind,
                        exec_price,
                    },
                );
            }
        }
    }

    fn take_pending_closes(&self, symbol: Symbol) -> Vec<PendingClose> {
        let mut pending = self.pending();
        let ids: Vec<_> = pending
            .closes
            .values()
            .filter(|p| p.position.symbol == symbol)
            .map(|p| p.position.id)
            .collect();
        ids.iter().filter_map(|id| pending.closes.remove(id)).collect()
    }
}

fn spawn_close(
    set: &mut JoinSet<CloseAttempt>,
    engine: PositionEngine,
    position: Position,
    kind: CloseKind,
    exec_price: Price,
) {
    set.spawn(async move {
        let outcome = engine.close_position(&position, kind, exec_price).await;
        (position, kind, exec_price, outcome)
    });
}

//! Evaluator tasks: one per symbol, each draining that symbol's feed channel
//! in order.

use super::core::PositionEngine;
use crate::feed::{FeedError, PriceFeed, PriceTick};
use crate::types::Symbol;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

impl PositionEngine {
    /// Subscribe to every tradable symbol and spawn an evaluator for each.
    /// Each handle resolves to the number of ticks processed once the feed closes.
    pub fn spawn_evaluators(&self, feed: &PriceFeed) -> Result<Vec<JoinHandle<u64>>, FeedError> {
        Symbol::ALL
            .iter()
            .map(|&symbol| {
                let rx = feed.subscribe(symbol)?;
                Ok(self.spawn_evaluator(symbol, rx))
            })
            .collect()
    }

    pub fn spawn_evaluator(&self, symbol: Symbol, mut rx: mpsc::Receiver<PriceTick>) -> JoinHandle<u64> {
        let engine = self.clone();
        tokio::spawn(async move {
            tracing::debug!(%symbol, "evaluator started");
            let mut processed = 0u64;

            // one tick at a time: the next tick waits for every close of this one
            while let Some(tick) = rx.recv().await {
                if tick.symbol != symbol {
                    tracing::warn!(%symbol, got = %tick.symbol, "tick on wrong channel, ignored");
                    continue;
                }
                let report = engine.on_tick(tick).await;
                processed += 1;

                if !report.closed.is_empty() || report.deferred > 0 {
                    tracing::debug!(
                        %symbol,
                        closed = report.closed.len(),
                        conflicts = report.conflicts,
                        deferred = report.deferred,
                        "tick evaluated"
                    );
                }
            }

            tracing::info!(%symbol, processed, "price channel closed, evaluator stopped");
            processed
        })
    }
}

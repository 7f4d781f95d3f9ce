//! Latest mark price per symbol.

use super::core::PositionEngine;
use crate::feed::PriceTick;
use crate::types::Symbol;
use std::sync::PoisonError;

impl PositionEngine {
    /// Book `tick` as the symbol's latest price unless a newer one is already booked.
    /// Returns whether it was booked.
    pub fn record_price(&self, tick: PriceTick) -> bool {
        let mut prices = self.state.prices.write().unwrap_or_else(PoisonError::into_inner);
        match prices.get(&tick.symbol) {
            Some(current) if current.observed_at > tick.observed_at => false,
            _ => {
                prices.insert(tick.symbol, tick);
                true
            }
        }
    }

    pub fn latest_price(&self, symbol: Symbol) -> Option<PriceTick> {
        let prices = self.state.prices.read().unwrap_or_else(PoisonError::into_inner);
        prices.get(&symbol).copied()
    }

    /// The latest price, if it is inside the staleness window.
    pub fn fresh_price(&self, symbol: Symbol) -> Option<PriceTick> {
        let window = self.state.config.staleness_window_ms;
        let now = self.now();
        self.latest_price(symbol).filter(|tick| !tick.is_stale(now, window))
    }
}

#[cfg(test)]
mod tests {
    use crate::clock::ManualClock;
    use crate::engine::{EngineConfig, PositionEngine};
    use crate::feed::PriceTick;
    use crate::store::MemoryStore;
    use crate::types::{Price, Symbol, Timestamp};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn tick(price: rust_decimal::Decimal, at: i64) -> PriceTick {
        PriceTick::new(Symbol::BtcUsdt, Price::new_unchecked(price), Timestamp::from_millis(at))
    }

    #[test]
    fn older_ticks_never_replace_newer() {
        let clock = ManualClock::new(Timestamp::from_millis(0));
        let engine = PositionEngine::new(EngineConfig::default(), Arc::new(MemoryStore::new()), Arc::new(clock));

        assert!(engine.record_price(tick(dec!(2), 20)));
        assert!(!engine.record_price(tick(dec!(1), 10)));
        assert_eq!(engine.latest_price(Symbol::BtcUsdt).unwrap().mark_price.value(), dec!(2));
        assert!(engine.latest_price(Symbol::EthUsdt).is_none());
    }

    #[test]
    fn fresh_price_respects_window() {
        let clock = ManualClock::new(Timestamp::from_millis(1_000));
        let engine = PositionEngine::new(EngineConfig::default(), Arc::new(MemoryStore::new()), Arc::new(clock.clone()));
        engine.record_price(tick(dec!(100), 1_000));

        clock.advance(5_000);
        assert!(engine.fresh_price(Symbol::BtcUsdt).is_some());

        clock.advance(1);
        assert!(engine.fresh_price(Symbol::BtcUsdt).is_none());
        assert!(engine.latest_price(Symbol::BtcUsdt).is_some());
    }
}

// 8.0 engine/core.rs: shared engine state. the engine owns no positions or wallets;
// it holds the latest price per symbol, the retry queues, and the event channel.

use super::config::EngineConfig;
use crate::clock::Clock;
use crate::events::{Event, EventId, EventPayload, PositionOpenedEvent};
use crate::feed::PriceTick;
use crate::position::{CloseKind, Position, Settlement};
use crate::store::PositionStore;
use crate::types::{PositionId, Price, Symbol, Timestamp, UserId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use tokio::sync::broadcast;

/// A trigger whose close failed transiently. Retried with the same kind and
/// price on the symbol's next tick.
#[derive(Debug, Clone)]
pub(super) struct PendingClose {
    pub position: Position,
    pub kind: CloseKind,
    pub exec_price: Price,
}

/// A close that won the race but whose wallet write failed.
#[derive(Debug, Clone)]
pub(super) struct PendingSettlement {
    pub position_id: PositionId,
    pub user_id: UserId,
    pub settlement: Settlement,
    pub attempts: u32,
}

#[derive(Debug, Default)]
pub(super) struct Pending {
    pub closes: HashMap<PositionId, PendingClose>,
    pub settlements: Vec<PendingSettlement>,
}

#[derive(Debug)]
pub(super) struct EngineState {
    pub config: EngineConfig,
    pub store: Arc<dyn PositionStore>,
    pub clock: Arc<dyn Clock>,
    pub prices: RwLock<HashMap<Symbol, PriceTick>>,
    pub pending: Mutex<Pending>,
    pub events: broadcast::Sender<Event>,
    pub next_event_id: AtomicU64,
}

/// Handle to the position engine. Clones share state.
#[derive(Debug, Clone)]
pub struct PositionEngine {
    pub(super) state: Arc<EngineState>,
}

impl PositionEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn PositionStore>, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            state: Arc::new(EngineState {
                config,
                store,
                clock,
                prices: RwLock::new(HashMap::new()),
                pending: Mutex::new(Pending::default()),
                events,
                next_event_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.state.config
    }

    pub fn store(&self) -> &Arc<dyn PositionStore> {
        &self.state.store
    }

    pub fn now(&self) -> Timestamp {
        self.state.clock.now()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<Event> {
        self.state.events.subscribe()
    }

    pub fn pending_closes(&self) -> usize {
        self.pending().closes.len()
    }

    pub fn pending_settlements(&self) -> usize {
        self.pending().settlements.len()
    }

    /// A liquidation closed one of `user_id`'s positions but the wipe has not
    /// reached the wallet yet.
    pub fn has_pending_wipe(&self, user_id: &UserId) -> bool {
        self.pending()
            .settlements
            .iter()
            .any(|entry| &entry.user_id == user_id && entry.settlement == Settlement::Wipe)
    }

    /// Announce a position the gateway just opened.
    pub fn record_opened(&self, position: &Position) {
        tracing::info!(
            position_id = %position.id,
            user_id = %position.user_id,
            symbol = %position.symbol,
            side = position.side.as_str(),
            entry = %position.entry_price,
            leverage = position.leverage.get(),
            "position opened"
        );
        self.emit(EventPayload::PositionOpened(PositionOpenedEvent {
            position_id: position.id,
            user_id: position.user_id.clone(),
            symbol: position.symbol,
            side: position.side,
            entry_price: position.entry_price,
            quantity: position.quantity,
            leverage: position.leverage,
            margin: position.margin,
            liquidation_price: position.liquidation_price,
        }));
    }

    // the queues hold plain data, so a panic elsewhere leaves them usable
    pub(super) fn pending(&self) -> MutexGuard<'_, Pending> {
        self.state.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn emit(&self, payload: EventPayload) {
        let id = EventId(self.state.next_event_id.fetch_add(1, Ordering::Relaxed));
        // no subscribers is fine
        let _ = self.state.events.send(Event::new(id, self.now(), payload));
    }
}

//! Shared harness for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use paper_perps::*;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

pub const START: i64 = 1_700_000_000_000;

pub struct Harness {
    pub store: Arc<dyn PositionStore>,
    pub engine: PositionEngine,
    pub gateway: OrderGateway,
    pub admin: WalletAdmin,
    pub clock: ManualClock,
}

impl Harness {
    pub fn with_store(store: Arc<dyn PositionStore>) -> Self {
        let config = PaperConfig::default();
        let clock = ManualClock::new(Timestamp::from_millis(START));
        let engine = PositionEngine::new(config.engine.clone(), store.clone(), Arc::new(clock.clone()));
        let gateway = OrderGateway::new(engine.clone(), config.margin.clone(), config.wallet.trade_history_limit);
        let admin = WalletAdmin::new(store.clone(), Arc::new(clock.clone()), config.wallet.initial_balance());
        Self {
            store,
            engine,
            gateway,
            admin,
            clock,
        }
    }

    pub fn memory() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    pub async fn user(&self, name: &str, balance: Decimal) -> UserId {
        let user = UserId::new(name);
        self.store
            .provision_wallet(&user, Quote::new(balance), self.clock.now())
            .await
            .unwrap();
        user
    }

    pub fn tick(&self, symbol: Symbol, price: Decimal) -> PriceTick {
        PriceTick::new(symbol, Price::new_unchecked(price), self.clock.now())
    }

    /// Book a price without evaluating anything.
    pub fn set_mark(&self, symbol: Symbol, price: Decimal) {
        self.engine.record_price(self.tick(symbol, price));
    }

    pub async fn on_tick(&self, symbol: Symbol, price: Decimal) -> TickReport {
        self.engine.on_tick(self.tick(symbol, price)).await
    }

    pub async fn open(&self, user: &UserId, order: OpenOrder) -> Position {
        self.gateway.open_position(user, order).await.unwrap()
    }

    pub async fn balance(&self, user: &UserId) -> Decimal {
        self.gateway.wallet(user).await.unwrap().balance.value()
    }

    pub async fn terminal_records(&self, user: &UserId) -> Vec<TradeRecord> {
        self.store
            .trades(user, usize::MAX)
            .await
            .unwrap()
            .into_iter()
            .filter(|t| t.kind.is_terminal())
            .collect()
    }
}

/// Store wrapper whose next N closes / settlements fail as unavailable.
#[derive(Debug)]
pub struct FlakyStore {
    inner: MemoryStore,
    pub fail_closes: AtomicU32,
    pub fail_settlements: AtomicU32,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_closes: AtomicU32::new(0),
            fail_settlements: AtomicU32::new(0),
        }
    }

    pub fn fail_next_closes(&self, n: u32) {
        self.fail_closes.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_settlements(&self, n: u32) {
        self.fail_settlements.store(n, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl PositionStore for FlakyStore {
    async fn try_open(&self, new: NewPosition, at: Timestamp) -> Result<Position, StoreError> {
        self.inner.try_open(new, at).await
    }

    async fn try_close(
        &self,
        id: PositionId,
        owner: &UserId,
        kind: CloseKind,
        exec_price: Price,
        at: Timestamp,
    ) -> Result<ClosedPosition, StoreError> {
        if Self::take_failure(&self.fail_closes) {
            return Err(StoreError::Unavailable("injected close failure".to_string()));
        }
        self.inner.try_close(id, owner, kind, exec_price, at).await
    }

    async fn apply_settlement(&self, user_id: &UserId, settlement: Settlement, at: Timestamp) -> Result<Wallet, StoreError> {
        if Self::take_failure(&self.fail_settlements) {
            return Err(StoreError::Unavailable("injected settlement failure".to_string()));
        }
        self.inner.apply_settlement(user_id, settlement, at).await
    }

    async fn position(&self, id: PositionId) -> Result<Option<Position>, StoreError> {
        self.inner.position(id).await
    }

    async fn open_positions(&self, symbol: Symbol) -> Result<Vec<Position>, StoreError> {
        self.inner.open_positions(symbol).await
    }

    async fn user_positions(&self, user_id: &UserId) -> Result<Vec<Position>, StoreError> {
        self.inner.user_positions(user_id).await
    }

    async fn wallet(&self, user_id: &UserId) -> Result<Option<Wallet>, StoreError> {
        self.inner.wallet(user_id).await
    }

    async fn trades(&self, user_id: &UserId, limit: usize) -> Result<Vec<TradeRecord>, StoreError> {
        self.inner.trades(user_id, limit).await
    }

    async fn terminal_trade(&self, position_id: PositionId) -> Result<Option<TradeRecord>, StoreError> {
        self.inner.terminal_trade(position_id).await
    }

    async fn provision_wallet(&self, user_id: &UserId, balance: Quote, at: Timestamp) -> Result<Wallet, StoreError> {
        self.inner.provision_wallet(user_id, balance, at).await
    }

    async fn fund_wallet(&self, user_id: &UserId, amount: Quote, at: Timestamp) -> Result<Wallet, StoreError> {
        self.inner.fund_wallet(user_id, amount, at).await
    }

    async fn reset_wallet(&self, user_id: &UserId, balance: Quote, at: Timestamp) -> Result<Wallet, StoreError> {
        self.inner.reset_wallet(user_id, balance, at).await
    }
}

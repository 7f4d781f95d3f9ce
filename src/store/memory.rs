//! In-process store. Every operation runs inside one critical section, which
//! is what makes `try_open` / `try_close` atomic here.

use super::{ClosedPosition, Conflict, PositionStore, StoreError};
use crate::ledger::TradeRecord;
use crate::position::{CloseKind, NewPosition, Position, Settlement};
use crate::types::{PositionId, Price, Quote, Symbol, Timestamp, UserId};
use crate::wallet::Wallet;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct State {
    positions: HashMap<PositionId, Position>,
    open_index: HashMap<(UserId, Symbol), PositionId>,
    wallets: HashMap<UserId, Wallet>,
    trades: Vec<TradeRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }

    /// Every record ever written, oldest first.
    pub fn all_trades(&self) -> Result<Vec<TradeRecord>, StoreError> {
        Ok(self.lock()?.trades.clone())
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn try_open(&self, new: NewPosition, at: Timestamp) -> Result<Position, StoreError> {
        let mut state = self.lock()?;
        let key = (new.user_id.clone(), new.symbol);

        if state.open_index.contains_key(&key) {
            return Err(Conflict::PositionExists {
                user_id: new.user_id,
                symbol: new.symbol,
            }
            .into());
        }

        let wallet = state
            .wallets
            .get_mut(&new.user_id)
            .ok_or_else(|| StoreError::WalletNotFound(new.user_id.clone()))?;
        wallet
            .reserve_margin(new.margin, at)
            .map_err(|e| Conflict::from_wallet(&new.user_id, e))?;

        let position = new.into_position(PositionId::new(), at);
        state.open_index.insert(key, position.id);
        state.trades.push(TradeRecord::opened(&position));
        state.positions.insert(position.id, position.clone());

        Ok(position)
    }

    async fn try_close(
        &self,
        id: PositionId,
        owner: &UserId,
        kind: CloseKind,
        exec_price: Price,
        at: Timestamp,
    ) -> Result<ClosedPosition, StoreError> {
        let mut state = self.lock()?;

        let owned = state.positions.get(&id).is_some_and(|p| &p.user_id == owner);
        if !owned {
            return Err(Conflict::PositionGone(id).into());
        }
        let Some(position) = state.positions.remove(&id) else {
            return Err(Conflict::PositionGone(id).into());
        };
        state.open_index.remove(&(position.user_id.clone(), position.symbol));

        let record = TradeRecord::closed(&position, kind, exec_price, at);
        state.trades.push(record.clone());
        let settlement = position.settlement(kind, exec_price);

        Ok(ClosedPosition {
            position,
            record,
            settlement,
        })
    }

    async fn apply_settlement(
        &self,
        user_id: &UserId,
        settlement: Settlement,
        at: Timestamp,
    ) -> Result<Wallet, StoreError> {
        let mut state = self.lock()?;
        let wallet = state
            .wallets
            .get_mut(user_id)
            .ok_or_else(|| StoreError::WalletNotFound(user_id.clone()))?;
        wallet.settle(settlement, at);
        Ok(wallet.clone())
    }

    async fn position(&self, id: PositionId) -> Result<Option<Position>, StoreError> {
        Ok(self.lock()?.positions.get(&id).cloned())
    }

    async fn open_positions(&self, symbol: Symbol) -> Result<Vec<Position>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .positions
            .values()
            .filter(|p| p.symbol == symbol)
            .cloned()
            .collect())
    }

    async fn user_positions(&self, user_id: &UserId) -> Result<Vec<Position>, StoreError> {
        let state = self.lock()?;
        let mut positions: Vec<Position> = state
            .positions
            .values()
            .filter(|p| &p.user_id == user_id)
            .cloned()
            .collect();
        positions.sort_by_key(|p| p.symbol);
        Ok(positions)
    }

    async fn wallet(&self, user_id: &UserId) -> Result<Option<Wallet>, StoreError> {
        Ok(self.lock()?.wallets.get(user_id).cloned())
    }

    async fn trades(&self, user_id: &UserId, limit: usize) -> Result<Vec<TradeRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .trades
            .iter()
            .rev()
            .filter(|t| &t.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn terminal_trade(&self, position_id: PositionId) -> Result<Option<TradeRecord>, StoreError> {
        let state = self.lock()?;
        Ok(state
            .trades
            .iter()
            .find(|t| t.position_id == position_id && t.kind.is_terminal())
            .cloned())
    }

    async fn provision_wallet(&self, user_id: &UserId, balance: Quote, at: Timestamp) -> Result<Wallet, StoreError> {
        let mut state = self.lock()?;
        let wallet = state
            .wallets
            .entry(user_id.clone())
            .or_insert_with(|| Wallet::new(user_id.clone(), balance.floor_zero(), at));
        Ok(wallet.clone())
    }

    async fn fund_wallet(&self, user_id: &UserId, amount: Quote, at: Timestamp) -> Result<Wallet, StoreError> {
        let mut state = self.lock()?;
        let wallet = state
            .wallets
            .get_mut(user_id)
            .ok_or_else(|| StoreError::WalletNotFound(user_id.clone()))?;
        wallet.fund(amount, at);
        Ok(wallet.clone())
    }

    async fn reset_wallet(&self, user_id: &UserId, balance: Quote, at: Timestamp) -> Result<Wallet, StoreError> {
        let mut state = self.lock()?;
        let wallet = state
            .wallets
            .get_mut(user_id)
            .ok_or_else(|| StoreError::WalletNotFound(user_id.clone()))?;
        wallet.reset(balance, at);
        Ok(wallet.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::TradeKind;
    use crate::margin::MarginParams;
    use crate::types::{Leverage, Quantity, Side};
    use rust_decimal_macros::dec;

    fn btc_long(user: &str, qty: rust_decimal::Decimal) -> NewPosition {
        NewPosition::new(
            UserId::new(user),
            Symbol::BtcUsdt,
            Side::Long,
            Price::new_unchecked(dec!(100_000)),
            Quantity::new_unchecked(qty),
            Leverage::new(5).unwrap(),
            None,
            None,
            &MarginParams::default(),
        )
        .unwrap()
    }

    async fn funded_store(user: &str, balance: rust_decimal::Decimal) -> MemoryStore {
        let store = MemoryStore::new();
        store
            .provision_wallet(&UserId::new(user), Quote::new(balance), Timestamp::from_millis(0))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn open_debits_margin_and_records() {
        let store = funded_store("alice", dec!(10_000)).await;
        let pos = store.try_open(btc_long("alice", dec!(0.4)), Timestamp::from_millis(1)).await.unwrap();

        let wallet = store.wallet(&UserId::new("alice")).await.unwrap().unwrap();
        assert_eq!(wallet.balance.value(), dec!(2000));

        let trades = store.trades(&UserId::new("alice"), 10).await.unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].kind, TradeKind::Open);
        assert_eq!(trades[0].position_id, pos.id);
    }

    #[tokio::test]
    async fn second_open_same_symbol_conflicts() {
        let store = funded_store("alice", dec!(100_000)).await;
        store.try_open(btc_long("alice", dec!(0.4)), Timestamp::from_millis(1)).await.unwrap();

        let err = store.try_open(btc_long("alice", dec!(0.1)), Timestamp::from_millis(2)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(Conflict::PositionExists { .. })));

        let wallet = store.wallet(&UserId::new("alice")).await.unwrap().unwrap();
        assert_eq!(wallet.balance.value(), dec!(92_000));
    }

    #[tokio::test]
    async fn open_without_wallet_fails() {
        let store = MemoryStore::new();
        let err = store.try_open(btc_long("ghost", dec!(0.4)), Timestamp::from_millis(1)).await.unwrap_err();
        assert_eq!(err, StoreError::WalletNotFound(UserId::new("ghost")));
    }

    #[tokio::test]
    async fn open_short_of_margin_conflicts_without_side_effects() {
        let store = funded_store("alice", dec!(7_999)).await;
        let err = store.try_open(btc_long("alice", dec!(0.4)), Timestamp::from_millis(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(Conflict::InsufficientBalance { .. })));
        assert!(store.open_positions(Symbol::BtcUsdt).await.unwrap().is_empty());
        assert!(store.all_trades().unwrap().is_empty());
    }

    #[tokio::test]
    async fn close_is_compare_and_delete() {
        let store = funded_store("alice", dec!(10_000)).await;
        let pos = store.try_open(btc_long("alice", dec!(0.4)), Timestamp::from_millis(1)).await.unwrap();
        let user = UserId::new("alice");
        let exit = Price::new_unchecked(dec!(101_000));

        let closed = store.try_close(pos.id, &user, CloseKind::Manual, exit, Timestamp::from_millis(2)).await.unwrap();
        // 1000 * 0.4 * 5 = 2000 pnl, + 8000 margin
        assert_eq!(closed.settlement, Settlement::Credit(Quote::new(dec!(10_000))));
        assert_eq!(closed.record.kind, TradeKind::Close);

        let again = store.try_close(pos.id, &user, CloseKind::Liquidation, exit, Timestamp::from_millis(3)).await;
        assert_eq!(again.unwrap_err(), StoreError::Conflict(Conflict::PositionGone(pos.id)));

        let terminal = store.terminal_trade(pos.id).await.unwrap().unwrap();
        assert_eq!(terminal.kind, TradeKind::Close);
        assert_eq!(store.all_trades().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn close_by_non_owner_is_rejected() {
        let store = funded_store("alice", dec!(10_000)).await;
        let pos = store.try_open(btc_long("alice", dec!(0.4)), Timestamp::from_millis(1)).await.unwrap();

        let err = store
            .try_close(pos.id, &UserId::new("mallory"), CloseKind::Manual, Price::new_unchecked(dec!(1)), Timestamp::from_millis(2))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(store.position(pos.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reopen_after_close_is_allowed() {
        let store = funded_store("alice", dec!(20_000)).await;
        let user = UserId::new("alice");
        let pos = store.try_open(btc_long("alice", dec!(0.4)), Timestamp::from_millis(1)).await.unwrap();
        store
            .try_close(pos.id, &user, CloseKind::Manual, Price::new_unchecked(dec!(100_000)), Timestamp::from_millis(2))
            .await
            .unwrap();
        assert!(store.try_open(btc_long("alice", dec!(0.4)), Timestamp::from_millis(3)).await.is_ok());
    }

    #[tokio::test]
    async fn trades_newest_first_with_limit() {
        let store = funded_store("alice", dec!(100_000)).await;
        let user = UserId::new("alice");
        for i in 0..3 {
            let pos = store.try_open(btc_long("alice", dec!(0.1)), Timestamp::from_millis(i * 10)).await.unwrap();
            store
                .try_close(pos.id, &user, CloseKind::Manual, Price::new_unchecked(dec!(100_000)), Timestamp::from_millis(i * 10 + 5))
                .await
                .unwrap();
        }
        let recent = store.trades(&user, 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].timestamp, Timestamp::from_millis(25));
        assert_eq!(recent[1].timestamp, Timestamp::from_millis(20));
    }

    #[tokio::test]
    async fn provision_is_idempotent() {
        let store = funded_store("alice", dec!(10_000)).await;
        let again = store
            .provision_wallet(&UserId::new("alice"), Quote::new(dec!(1)), Timestamp::from_millis(9))
            .await
            .unwrap();
        assert_eq!(again.balance.value(), dec!(10_000));
    }
}

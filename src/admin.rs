// 10.0: operator wallet tooling. provisioning, top-ups after a liquidation, and
// full resets to the starting balance. nothing here touches open positions.

use crate::clock::Clock;
use crate::store::{PositionStore, StoreError};
use crate::types::{Quote, UserId};
use crate::wallet::Wallet;
use rust_decimal::Decimal;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdminError {
    #[error("Funding amount must be positive, got {0}")]
    InvalidAmount(Decimal),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct WalletAdmin {
    store: Arc<dyn PositionStore>,
    clock: Arc<dyn Clock>,
    initial_balance: Quote,
}

impl WalletAdmin {
    pub fn new(store: Arc<dyn PositionStore>, clock: Arc<dyn Clock>, initial_balance: Quote) -> Self {
        Self {
            store,
            clock,
            initial_balance,
        }
    }

    /// Create the user's wallet at the initial balance. Existing wallets are
    /// returned unchanged.
    pub async fn provision(&self, user_id: &UserId) -> Result<Wallet, AdminError> {
        let wallet = self
            .store
            .provision_wallet(user_id, self.initial_balance, self.clock.now())
            .await?;
        tracing::info!(user_id = %user_id, balance = %wallet.balance, "wallet provisioned");
        Ok(wallet)
    }

    /// Top up and lift the liquidation block.
    pub async fn fund(&self, user_id: &UserId, amount: Decimal) -> Result<Wallet, AdminError> {
        if amount <= Decimal::ZERO {
            return Err(AdminError::InvalidAmount(amount));
        }
        let wallet = self.store.fund_wallet(user_id, Quote::new(amount), self.clock.now()).await?;
        tracing::info!(user_id = %user_id, %amount, balance = %wallet.balance, "wallet funded");
        Ok(wallet)
    }

    pub async fn reset(&self, user_id: &UserId) -> Result<Wallet, AdminError> {
        let wallet = self
            .store
            .reset_wallet(user_id, self.initial_balance, self.clock.now())
            .await?;
        tracing::info!(user_id = %user_id, balance = %wallet.balance, "wallet reset");
        Ok(wallet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::position::Settlement;
    use crate::store::MemoryStore;
    use rust_decimal_macros::dec;

    fn admin() -> (WalletAdmin, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let admin = WalletAdmin::new(store.clone(), Arc::new(SystemClock), Quote::new(dec!(10_000_000)));
        (admin, store)
    }

    #[tokio::test]
    async fn provision_then_reset_after_wipe() {
        let (admin, store) = admin();
        let user = UserId::new("dave");

        let wallet = admin.provision(&user).await.unwrap();
        assert_eq!(wallet.balance.value(), dec!(10_000_000));

        store.apply_settlement(&user, Settlement::Wipe, wallet.updated_at).await.unwrap();
        let reset = admin.reset(&user).await.unwrap();
        assert!(!reset.is_liquidated);
        assert_eq!(reset.balance.value(), dec!(10_000_000));
    }

    #[tokio::test]
    async fn fund_requires_positive_amount() {
        let (admin, _) = admin();
        let user = UserId::new("dave");
        admin.provision(&user).await.unwrap();

        assert_eq!(admin.fund(&user, dec!(0)).await, Err(AdminError::InvalidAmount(dec!(0))));
        let funded = admin.fund(&user, dec!(5)).await.unwrap();
        assert_eq!(funded.balance.value(), dec!(10_000_005));
    }

    #[tokio::test]
    async fn fund_unknown_wallet() {
        let (admin, _) = admin();
        let err = admin.fund(&UserId::new("ghost"), dec!(5)).await.unwrap_err();
        assert_eq!(err, AdminError::Store(StoreError::WalletNotFound(UserId::new("ghost"))));
    }
}

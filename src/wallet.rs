//! Paper wallet: one quote-currency balance per user.
//!
//! Margin for every open position is taken out of `balance` when the position
//! opens and handed back (plus PnL) when it closes. A liquidation wipes the
//! balance and flags the wallet, which blocks new opens until an operator
//! tops it up.

use crate::position::Settlement;
use crate::types::{Quote, Timestamp, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub user_id: UserId,
    pub balance: Quote,
    pub is_liquidated: bool,
    pub updated_at: Timestamp,
}

impl Wallet {
    pub fn new(user_id: UserId, balance: Quote, timestamp: Timestamp) -> Self {
        Self {
            user_id,
            balance,
            is_liquidated: false,
            updated_at: timestamp,
        }
    }

    pub fn can_afford(&self, margin: Quote) -> Result<(), WalletError> {
        if self.is_liquidated {
            return Err(WalletError::Liquidated);
        }
        if self.balance < margin {
            return Err(WalletError::InsufficientBalance {
                required: margin,
                available: self.balance,
            });
        }
        Ok(())
    }

    pub fn reserve_margin(&mut self, margin: Quote, timestamp: Timestamp) -> Result<(), WalletError> {
        self.can_afford(margin)?;
        self.balance = self.balance.sub(margin);
        self.updated_at = timestamp;
        Ok(())
    }

    pub fn settle(&mut self, settlement: Settlement, timestamp: Timestamp) {
        match settlement {
            Settlement::Credit(amount) => {
                self.balance = self.balance.add(amount.floor_zero());
            }
            Settlement::Wipe => {
                self.balance = Quote::zero();
                self.is_liquidated = true;
            }
        }
        self.updated_at = timestamp;
    }

    // top-ups always lift the liquidation block
    pub fn fund(&mut self, amount: Quote, timestamp: Timestamp) {
        self.balance = self.balance.add(amount.floor_zero());
        self.is_liquidated = false;
        self.updated_at = timestamp;
    }

    pub fn reset(&mut self, balance: Quote, timestamp: Timestamp) {
        self.balance = balance.floor_zero();
        self.is_liquidated = false;
        self.updated_at = timestamp;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WalletError {
    #[error("Wallet is liquidated; deposit funds to trade again")]
    Liquidated,

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: Quote, available: Quote },
}

//! SQLite-backed store.
//!
//! - one open position per (user, symbol) is a `UNIQUE` constraint
//! - closing is `DELETE ... RETURNING` plus the trade insert in one transaction
//! - wallet rows carry a `version` column and every write is conditional on it
//!
//! Decimals are stored as TEXT so nothing round-trips through floating point.

use super::{ClosedPosition, Conflict, PositionStore, StoreError};
use crate::ledger::{TradeKind, TradeRecord};
use crate::position::{CloseKind, NewPosition, Position, Settlement};
use crate::types::{Leverage, PositionId, Price, Quantity, Quote, Side, Symbol, Timestamp, TradeId, UserId};
use crate::wallet::Wallet;
use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;
use uuid::Uuid;

const SCHEMA: [&str; 4] = [
    r"
    CREATE TABLE IF NOT EXISTS positions (
        id                TEXT PRIMARY KEY,
        user_id           TEXT NOT NULL,
        symbol            TEXT NOT NULL,
        side              TEXT NOT NULL,
        entry_price       TEXT NOT NULL,
        leverage          INTEGER NOT NULL,
        quantity          TEXT NOT NULL,
        margin            TEXT NOT NULL,
        liquidation_price TEXT,
        take_profit       TEXT,
        stop_loss         TEXT,
        opened_at         INTEGER NOT NULL,
        UNIQUE (user_id, symbol)
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS wallets (
        user_id       TEXT PRIMARY KEY,
        balance       TEXT NOT NULL,
        is_liquidated INTEGER NOT NULL DEFAULT 0,
        updated_at    INTEGER NOT NULL,
        version       INTEGER NOT NULL DEFAULT 0
    )
    ",
    r"
    CREATE TABLE IF NOT EXISTS trades (
        seq         INTEGER PRIMARY KEY AUTOINCREMENT,
        id          TEXT NOT NULL UNIQUE,
        position_id TEXT NOT NULL,
        user_id     TEXT NOT NULL,
        kind        TEXT NOT NULL,
        symbol      TEXT NOT NULL,
        side        TEXT NOT NULL,
        price       TEXT NOT NULL,
        quantity    TEXT NOT NULL,
        leverage    INTEGER NOT NULL,
        pnl         TEXT NOT NULL,
        timestamp   INTEGER NOT NULL
    )
    ",
    // at most one terminal record per position
    r"
    CREATE UNIQUE INDEX IF NOT EXISTS trades_terminal
        ON trades (position_id) WHERE kind <> 'open'
    ",
];

const POSITION_COLUMNS: &str = "id, user_id, symbol, side, entry_price, leverage, quantity, margin, \
     liquidation_price, take_profit, stop_loss, opened_at";

const TRADE_COLUMNS: &str =
    "id, position_id, user_id, kind, symbol, side, price, quantity, leverage, pnl, timestamp";

// optimistic wallet writes give up after this many lost races
const WALLET_WRITE_ATTEMPTS: usize = 8;

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connects and creates the schema if missing.
    ///
    /// `sqlite::memory:` gets a single pinned connection, since every SQLite
    /// connection to `:memory:` is its own database.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = options.connect(database_url).await.map_err(unavailable)?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    async fn migrate(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await.map_err(unavailable)?;
        }
        Ok(())
    }

    async fn load_wallet(&self, user_id: &UserId) -> Result<Option<(Wallet, i64)>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, balance, is_liquidated, updated_at, version FROM wallets WHERE user_id = ?1",
        )
        .bind(user_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        row.map(|r| wallet_from_row(&r)).transpose()
    }

    // read, mutate, write-if-unchanged; retried when another writer got in first
    async fn update_wallet<F>(&self, user_id: &UserId, mutate: F) -> Result<Wallet, StoreError>
    where
        F: Fn(&mut Wallet) + Send + Sync,
    {
        for _ in 0..WALLET_WRITE_ATTEMPTS {
            let (mut wallet, version) = self
                .load_wallet(user_id)
                .await?
                .ok_or_else(|| StoreError::WalletNotFound(user_id.clone()))?;
            mutate(&mut wallet);

            let updated = sqlx::query(
                "UPDATE wallets SET balance = ?1, is_liquidated = ?2, updated_at = ?3, version = version + 1 \
                 WHERE user_id = ?4 AND version = ?5",
            )
            .bind(wallet.balance.value().to_string())
            .bind(wallet.is_liquidated)
            .bind(wallet.updated_at.as_millis())
            .bind(user_id.as_str())
            .bind(version)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;

            if updated.rows_affected() == 1 {
                return Ok(wallet);
            }
            tracing::debug!(user_id = %user_id, version, "wallet version moved, retrying write");
        }

        Err(StoreError::Unavailable(format!(
            "wallet of {user_id} kept changing under concurrent writes"
        )))
    }
}

#[async_trait]
impl PositionStore for SqliteStore {
    async fn try_open(&self, new: NewPosition, at: Timestamp) -> Result<Position, StoreError> {
        // IMMEDIATE takes the write lock before the reads below. a deferred
        // transaction would hold a read lock and then fail to upgrade with
        // SQLITE_BUSY when another open races it.
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await.map_err(unavailable)?;

        // same rejection order as the memory store; the UNIQUE constraint still
        // backs this up against a concurrent insert
        let existing = sqlx::query("SELECT 1 FROM positions WHERE user_id = ?1 AND symbol = ?2")
            .bind(new.user_id.as_str())
            .bind(new.symbol.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(unavailable)?;
        if existing.is_some() {
            return Err(Conflict::PositionExists {
                user_id: new.user_id,
                symbol: new.symbol,
            }
            .into());
        }

        let row = sqlx::query(
            "SELECT user_id, balance, is_liquidated, updated_at, version FROM wallets WHERE user_id = ?1",
        )
        .bind(new.user_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(unavailable)?
        .ok_or_else(|| StoreError::WalletNotFound(new.user_id.clone()))?;
        let (mut wallet, version) = wallet_from_row(&row)?;

        wallet
            .reserve_margin(new.margin, at)
            .map_err(|e| Conflict::from_wallet(&new.user_id, e))?;

        let position = new.into_position(PositionId::new(), at);

        let inserted = sqlx::query(&format!(
            "INSERT INTO positions ({POSITION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
        ))
        .bind(position.id.0.to_string())
        .bind(position.user_id.as_str())
        .bind(position.symbol.as_str())
        .bind(position.side.as_str())
        .bind(position.entry_price.value().to_string())
        .bind(i64::from(position.leverage.get()))
        .bind(position.quantity.value().to_string())
        .bind(position.margin.value().to_string())
        .bind(position.liquidation_price.map(|p| p.value().to_string()))
        .bind(position.take_profit.map(|p| p.value().to_string()))
        .bind(position.stop_loss.map(|p| p.value().to_string()))
        .bind(position.opened_at.as_millis())
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            if is_unique_violation(&err) {
                return Err(Conflict::PositionExists {
                    user_id: position.user_id,
                    symbol: position.symbol,
                }
                .into());
            }
            return Err(unavailable(err));
        }

        let debited = sqlx::query(
            "UPDATE wallets SET balance = ?1, updated_at = ?2, version = version + 1 \
             WHERE user_id = ?3 AND version = ?4",
        )
        .bind(wallet.balance.value().to_string())
        .bind(wallet.updated_at.as_millis())
        .bind(position.user_id.as_str())
        .bind(version)
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;
        if debited.rows_affected() != 1 {
            return Err(StoreError::Unavailable(format!(
                "wallet of {} changed during open",
                position.user_id
            )));
        }

        insert_trade(&mut tx, &TradeRecord::opened(&position)).await?;
        tx.commit().await.map_err(unavailable)?;

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
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await.map_err(unavailable)?;

        let row = sqlx::query(&format!(
            "DELETE FROM positions WHERE id = ?1 AND user_id = ?2 RETURNING {POSITION_COLUMNS}"
        ))
        .bind(id.0.to_string())
        .bind(owner.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(unavailable)?;

        let Some(row) = row else {
            return Err(Conflict::PositionGone(id).into());
        };
        let position = position_from_row(&row)?;

        let record = TradeRecord::closed(&position, kind, exec_price, at);
        insert_trade(&mut tx, &record).await?;
        tx.commit().await.map_err(unavailable)?;

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
        self.update_wallet(user_id, |w| w.settle(settlement, at)).await
    }

    async fn position(&self, id: PositionId) -> Result<Option<Position>, StoreError> {
        let row = sqlx::query(&format!("SELECT {POSITION_COLUMNS} FROM positions WHERE id = ?1"))
            .bind(id.0.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        row.map(|r| position_from_row(&r)).transpose()
    }

    async fn open_positions(&self, symbol: Symbol) -> Result<Vec<Position>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {POSITION_COLUMNS} FROM positions WHERE symbol = ?1"))
            .bind(symbol.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;
        rows.iter().map(position_from_row).collect()
    }

    async fn user_positions(&self, user_id: &UserId) -> Result<Vec<Position>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {POSITION_COLUMNS} FROM positions WHERE user_id = ?1 ORDER BY symbol"
        ))
        .bind(user_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        rows.iter().map(position_from_row).collect()
    }

    async fn wallet(&self, user_id: &UserId) -> Result<Option<Wallet>, StoreError> {
        Ok(self.load_wallet(user_id).await?.map(|(wallet, _)| wallet))
    }

    async fn trades(&self, user_id: &UserId, limit: usize) -> Result<Vec<TradeRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades WHERE user_id = ?1 ORDER BY seq DESC LIMIT ?2"
        ))
        .bind(user_id.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        rows.iter().map(trade_from_row).collect()
    }

    async fn terminal_trade(&self, position_id: PositionId) -> Result<Option<TradeRecord>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades WHERE position_id = ?1 AND kind <> 'open' LIMIT 1"
        ))
        .bind(position_id.0.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        row.map(|r| trade_from_row(&r)).transpose()
    }

    async fn provision_wallet(&self, user_id: &UserId, balance: Quote, at: Timestamp) -> Result<Wallet, StoreError> {
        sqlx::query(
            "INSERT INTO wallets (user_id, balance, is_liquidated, updated_at, version) \
             VALUES (?1, ?2, 0, ?3, 0) ON CONFLICT(user_id) DO NOTHING",
        )
        .bind(user_id.as_str())
        .bind(balance.floor_zero().value().to_string())
        .bind(at.as_millis())
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        self.wallet(user_id)
            .await?
            .ok_or_else(|| StoreError::WalletNotFound(user_id.clone()))
    }

    async fn fund_wallet(&self, user_id: &UserId, amount: Quote, at: Timestamp) -> Result<Wallet, StoreError> {
        self.update_wallet(user_id, |w| w.fund(amount, at)).await
    }

    async fn reset_wallet(&self, user_id: &UserId, balance: Quote, at: Timestamp) -> Result<Wallet, StoreError> {
        self.update_wallet(user_id, |w| w.reset(balance, at)).await
    }
}

async fn insert_trade(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    record: &TradeRecord,
) -> Result<(), StoreError> {
    sqlx::query(&format!(
        "INSERT INTO trades ({TRADE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
    ))
    .bind(record.id.0.to_string())
    .bind(record.position_id.0.to_string())
    .bind(record.user_id.as_str())
    .bind(record.kind.as_str())
    .bind(record.symbol.as_str())
    .bind(record.side.as_str())
    .bind(record.price.value().to_string())
    .bind(record.quantity.value().to_string())
    .bind(i64::from(record.leverage.get()))
    .bind(record.pnl.value().to_string())
    .bind(record.timestamp.as_millis())
    .execute(&mut **tx)
    .await
    .map_err(unavailable)?;
    Ok(())
}

fn unavailable(err: sqlx::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db.is_unique_violation(),
        _ => false,
    }
}

// row decoding

fn corrupt(column: &str, detail: impl std::fmt::Display) -> StoreError {
    StoreError::Corrupt(format!("{column}: {detail}"))
}

fn text(row: &SqliteRow, column: &str) -> Result<String, StoreError> {
    row.try_get::<String, _>(column).map_err(|e| corrupt(column, e))
}

fn integer(row: &SqliteRow, column: &str) -> Result<i64, StoreError> {
    row.try_get::<i64, _>(column).map_err(|e| corrupt(column, e))
}

fn decimal(row: &SqliteRow, column: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(&text(row, column)?).map_err(|e| corrupt(column, e))
}

fn price(row: &SqliteRow, column: &str) -> Result<Price, StoreError> {
    let value = decimal(row, column)?;
    Price::new(value).ok_or_else(|| corrupt(column, format!("non-positive price {value}")))
}

fn optional_price(row: &SqliteRow, column: &str) -> Result<Option<Price>, StoreError> {
    let raw: Option<String> = row.try_get(column).map_err(|e| corrupt(column, e))?;
    raw.map(|s| {
        Decimal::from_str(&s)
            .ok()
            .and_then(Price::new)
            .ok_or_else(|| corrupt(column, format!("bad price {s}")))
    })
    .transpose()
}

fn quantity(row: &SqliteRow, column: &str) -> Result<Quantity, StoreError> {
    let value = decimal(row, column)?;
    Quantity::new(value).ok_or_else(|| corrupt(column, format!("non-positive quantity {value}")))
}

fn leverage(row: &SqliteRow, column: &str) -> Result<Leverage, StoreError> {
    let raw = integer(row, column)?;
    u32::try_from(raw)
        .ok()
        .and_then(Leverage::new)
        .ok_or_else(|| corrupt(column, format!("bad leverage {raw}")))
}

fn uuid(row: &SqliteRow, column: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(&text(row, column)?).map_err(|e| corrupt(column, e))
}

fn symbol(row: &SqliteRow, column: &str) -> Result<Symbol, StoreError> {
    text(row, column)?.parse().map_err(|e| corrupt(column, e))
}

fn side(row: &SqliteRow, column: &str) -> Result<Side, StoreError> {
    text(row, column)?.parse().map_err(|e: String| corrupt(column, e))
}

fn position_from_row(row: &SqliteRow) -> Result<Position, StoreError> {
    Ok(Position {
        id: PositionId(uuid(row, "id")?),
        user_id: UserId::new(text(row, "user_id")?),
        symbol: symbol(row, "symbol")?,
        side: side(row, "side")?,
        entry_price: price(row, "entry_price")?,
        leverage: leverage(row, "leverage")?,
        quantity: quantity(row, "quantity")?,
        margin: Quote::new(decimal(row, "margin")?),
        liquidation_price: optional_price(row, "liquidation_price")?,
        take_profit: optional_price(row, "take_profit")?,
        stop_loss: optional_price(row, "stop_loss")?,
        opened_at: Timestamp::from_millis(integer(row, "opened_at")?),
    })
}

fn trade_from_row(row: &SqliteRow) -> Result<TradeRecord, StoreError> {
    Ok(TradeRecord {
        id: TradeId(uuid(row, "id")?),
        position_id: PositionId(uuid(row, "position_id")?),
        user_id: UserId::new(text(row, "user_id")?),
        kind: text(row, "kind")?
            .parse::<TradeKind>()
            .map_err(|e| corrupt("kind", e))?,
        symbol: symbol(row, "symbol")?,
        side: side(row, "side")?,
        price: price(row, "price")?,
        quantity: quantity(row, "quantity")?,
        leverage: leverage(row, "leverage")?,
        pnl: Quote::new(decimal(row, "pnl")?),
        timestamp: Timestamp::from_millis(integer(row, "timestamp")?),
    })
}

fn wallet_from_row(row: &SqliteRow) -> Result<(Wallet, i64), StoreError> {
    let wallet = Wallet {
        user_id: UserId::new(text(row, "user_id")?),
        balance: Quote::new(decimal(row, "balance")?),
        is_liquidated: row
            .try_get::<bool, _>("is_liquidated")
            .map_err(|e| corrupt("is_liquidated", e))?,
        updated_at: Timestamp::from_millis(integer(row, "updated_at")?),
    };
    Ok((wallet, integer(row, "version")?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::margin::MarginParams;
    use rust_decimal_macros::dec;

    fn eth_short(user: &str) -> NewPosition {
        NewPosition::new(
            UserId::new(user),
            Symbol::EthUsdt,
            Side::Short,
            Price::new_unchecked(dec!(3000)),
            Quantity::new_unchecked(dec!(10)),
            Leverage::new(10).unwrap(),
            Some(Price::new_unchecked(dec!(2500))),
            None,
            &MarginParams::default(),
        )
        .unwrap()
    }

    async fn store_with(user: &str, balance: Decimal) -> SqliteStore {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .provision_wallet(&UserId::new(user), Quote::new(balance), Timestamp::from_millis(0))
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn position_round_trips_through_rows() {
        let store = store_with("bob", dec!(10_000)).await;
        let opened = store.try_open(eth_short("bob"), Timestamp::from_millis(7)).await.unwrap();

        let loaded = store.position(opened.id).await.unwrap().unwrap();
        assert_eq!(loaded, opened);
        assert_eq!(loaded.take_profit, Some(Price::new_unchecked(dec!(2500))));
        assert_eq!(loaded.liquidation_price, None);

        let wallet = store.wallet(&UserId::new("bob")).await.unwrap().unwrap();
        assert_eq!(wallet.balance.value(), dec!(7000));
    }

    #[tokio::test]
    async fn unique_constraint_blocks_second_open() {
        let store = store_with("bob", dec!(10_000)).await;
        store.try_open(eth_short("bob"), Timestamp::from_millis(1)).await.unwrap();

        let err = store.try_open(eth_short("bob"), Timestamp::from_millis(2)).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(Conflict::PositionExists { .. })));

        // rolled back: only the first debit stuck
        let wallet = store.wallet(&UserId::new("bob")).await.unwrap().unwrap();
        assert_eq!(wallet.balance.value(), dec!(7000));
        assert_eq!(store.trades(&UserId::new("bob"), 30).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_returning_wins_once() {
        let store = store_with("bob", dec!(10_000)).await;
        let user = UserId::new("bob");
        let pos = store.try_open(eth_short("bob"), Timestamp::from_millis(1)).await.unwrap();
        let exit = Price::new_unchecked(dec!(2500));

        let closed = store.try_close(pos.id, &user, CloseKind::TakeProfit, exit, Timestamp::from_millis(2)).await.unwrap();
        // short 10 @ 3000 → 2500 at 10x: +50_000, plus 3000 margin
        assert_eq!(closed.settlement, Settlement::Credit(Quote::new(dec!(53_000))));

        let second = store.try_close(pos.id, &user, CloseKind::Manual, exit, Timestamp::from_millis(3)).await;
        assert_eq!(second.unwrap_err(), StoreError::Conflict(Conflict::PositionGone(pos.id)));

        let terminal = store.terminal_trade(pos.id).await.unwrap().unwrap();
        assert_eq!(terminal.kind, TradeKind::TakeProfit);
        assert_eq!(terminal.pnl.value(), dec!(50_000));

        let history = store.trades(&user, 30).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].kind, TradeKind::TakeProfit);
        assert_eq!(history[1].kind, TradeKind::Open);
    }

    #[tokio::test]
    async fn settlement_and_operator_writes_bump_the_wallet() {
        let store = store_with("bob", dec!(10_000)).await;
        let user = UserId::new("bob");

        let wiped = store.apply_settlement(&user, Settlement::Wipe, Timestamp::from_millis(1)).await.unwrap();
        assert!(wiped.is_liquidated);
        assert_eq!(wiped.balance, Quote::zero());

        let err = store.try_open(eth_short("bob"), Timestamp::from_millis(2)).await.unwrap_err();
        assert_eq!(err, StoreError::Conflict(Conflict::WalletLiquidated(user.clone())));

        let funded = store.fund_wallet(&user, Quote::new(dec!(250)), Timestamp::from_millis(3)).await.unwrap();
        assert!(!funded.is_liquidated);
        assert_eq!(funded.balance.value(), dec!(250));

        let reset = store.reset_wallet(&user, Quote::new(dec!(10_000_000)), Timestamp::from_millis(4)).await.unwrap();
        assert_eq!(reset.balance.value(), dec!(10_000_000));
    }

    #[tokio::test]
    async fn missing_wallet_is_reported() {
        let store = SqliteStore::in_memory().await.unwrap();
        let err = store
            .fund_wallet(&UserId::new("nobody"), Quote::new(dec!(1)), Timestamp::from_millis(0))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::WalletNotFound(UserId::new("nobody")));
    }
}

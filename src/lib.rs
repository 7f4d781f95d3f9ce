// paper-perps: paper-trading position engine for leveraged crypto positions.
// liquidation-first architecture: a liquidation pre-empts take-profit and
// stop-loss, and every position is closed exactly once.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: UserId, Symbol, Side, Price, Quote, Leverage
//   2.x  clock.rs: time source (system / manual)
//   3.x  margin.rs: IM/MM, maintenance tiers, liquidation price, PnL
//   4.x  position.rs: position struct, trigger evaluation, settlement per close kind
//   4.5  wallet.rs: per-user balance and liquidated flag
//   5.x  ledger.rs: append-only trade records
//   6.x  feed.rs: per-symbol price channels, tick sources, reconnect pump
//   6.5  store/: position store trait, in-memory and SQLite backends
//   7.x  config.rs: margin schedule, engine tuning, wallet defaults, loading
//   8.x  engine/: tick evaluation, close transition, retries, evaluator tasks
//   9.x  events.rs: broadcast events for audit and observers
//   10.x admin.rs: operator wallet tooling
//   11.x gateway.rs: order entry, manual close reconciliation, read models

// core modules
pub mod clock;
pub mod engine;
pub mod events;
pub mod ledger;
pub mod margin;
pub mod position;
pub mod types;
pub mod wallet;

// integration modules
pub mod admin;
pub mod config;
pub mod feed;
pub mod gateway;
pub mod store;

// re exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::*;
pub use events::*;
pub use ledger::{TradeKind, TradeRecord};
pub use margin::*;
pub use position::*;
pub use types::*;
pub use wallet::{Wallet, WalletError};
pub use admin::{AdminError, WalletAdmin};
pub use config::{ConfigError, PaperConfig, WalletConfig};
pub use feed::{pump, FeedError, PriceFeed, PriceTick, Published, ReconnectPolicy, ReplaySource, ReplayStep, TickSource};
pub use gateway::{CloseOutcome, OpenOrder, OrderError, OrderGateway, PositionView};
pub use store::{ClosedPosition, Conflict, MemoryStore, PositionStore, SqliteStore, StoreError};

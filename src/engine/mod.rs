// 8.0: position engine. consumes price ticks, checks every open position against
// liquidation / take-profit / stop-loss, and drives exactly one terminal
// transition per position through the store's compare-and-delete.

mod config;
mod core;
mod evaluation;
mod pricing;
mod results;
mod runner;
mod settlement;

pub use config::EngineConfig;
pub use self::core::PositionEngine;
pub use results::{CloseReport, EngineError, SkipReason, TickReport, WalletUpdate};

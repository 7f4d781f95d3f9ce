//! Paper trading engine simulation.
//!
//! Runs the documented scenarios end to end against the in-memory store:
//! tier edge cases, take-profit, a double liquidation trigger, and a live
//! feed with a transport drop and a manual close racing the engine.

use anyhow::{bail, Context, Result};
use paper_perps::*;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = PaperConfig::load(config_path.as_deref()).context("loading configuration")?;

    println!("Paper Perps Engine Simulation");
    println!("Max leverage {}, staleness window {} ms\n", config.margin.max_leverage, config.engine.staleness_window_ms);

    scenario_a_long_below_tier(&config).await?;
    scenario_b_short_leverage_sweep(&config).await?;
    scenario_c_take_profit(&config).await?;
    scenario_d_double_liquidation(&config).await?;
    scenario_e_live_feed(&config).await?;

    println!("\nAll simulations completed successfully.");
    Ok(())
}

struct Sim {
    gateway: OrderGateway,
    admin: WalletAdmin,
    clock: ManualClock,
}

impl Sim {
    fn new(config: &PaperConfig) -> Self {
        let clock = ManualClock::new(Timestamp::from_millis(1_700_000_000_000));
        let store: Arc<dyn PositionStore> = Arc::new(MemoryStore::new());
        let engine = PositionEngine::new(config.engine.clone(), store.clone(), Arc::new(clock.clone()));
        let gateway = OrderGateway::new(engine, config.margin.clone(), config.wallet.trade_history_limit);
        let admin = WalletAdmin::new(store, Arc::new(clock.clone()), config.wallet.initial_balance());
        Self { gateway, admin, clock }
    }

    fn engine(&self) -> &PositionEngine {
        self.gateway.engine()
    }

    fn tick(&self, symbol: Symbol, price: Decimal) -> Result<PriceTick> {
        let mark = Price::new(price).context("mark price must be positive")?;
        Ok(PriceTick::new(symbol, mark, self.clock.now()))
    }

    async fn mark(&self, symbol: Symbol, price: Decimal) -> Result<TickReport> {
        let tick = self.tick(symbol, price)?;
        Ok(self.engine().on_tick(tick).await)
    }
}

fn show_liq(liq: Option<Price>) -> String {
    liq.map_or_else(|| "none (cannot be liquidated)".to_string(), |p| p.to_string())
}

/// Long 0.4 BTC at 5x: maintenance never exceeds initial margin.
async fn scenario_a_long_below_tier(config: &PaperConfig) -> Result<()> {
    println!("Scenario A: long below the first tier\n");
    let sim = Sim::new(config);
    let alice = UserId::new("alice");
    sim.admin.provision(&alice).await?;
    sim.mark(Symbol::BtcUsdt, dec!(100_000)).await?;

    let pos = sim
        .gateway
        .open_position(&alice, OpenOrder::market(Symbol::BtcUsdt, Side::Long, dec!(0.4), 5))
        .await?;
    let rate = maintenance_margin_rate(pos.notional(), &config.margin);

    println!("  Notional: ${}", pos.notional());
    println!("  Margin: ${}", pos.margin);
    println!("  Maintenance rate: {}%", rate * dec!(100));
    println!("  Liquidation price: {}\n", show_liq(pos.liquidation_price));
    Ok(())
}

/// Short 10 ETH: find where leverage starts producing a threshold.
async fn scenario_b_short_leverage_sweep(config: &PaperConfig) -> Result<()> {
    println!("Scenario B: short leverage sweep\n");
    let sim = Sim::new(config);
    let bob = UserId::new("bob");
    sim.admin.provision(&bob).await?;
    sim.mark(Symbol::EthUsdt, dec!(3_000)).await?;

    let pos = sim
        .gateway
        .open_position(&bob, OpenOrder::market(Symbol::EthUsdt, Side::Short, dec!(10), 10))
        .await?;
    println!("  Opened 10 ETH short at 10x, margin ${}, liquidation {}", pos.margin, show_liq(pos.liquidation_price));

    let entry = pos.entry_price;
    for lev in [10u32, 50, 100, 200, 250] {
        let Some(leverage) = Leverage::new(lev) else { continue };
        let liq = liquidation_price(Side::Short, entry, pos.quantity, leverage, &config.margin);
        let capped = if leverage > config.margin.max_leverage { " (above cap)" } else { "" };
        println!("  {leverage}{capped}: liquidation {}", show_liq(liq));
    }
    println!();
    Ok(())
}

/// Take-profit fires on the tick that touches it.
async fn scenario_c_take_profit(config: &PaperConfig) -> Result<()> {
    println!("Scenario C: take profit\n");
    let sim = Sim::new(config);
    let alice = UserId::new("alice");
    sim.admin.provision(&alice).await?;
    sim.mark(Symbol::BtcUsdt, dec!(100_000)).await?;

    let order = OpenOrder::market(Symbol::BtcUsdt, Side::Long, dec!(0.4), 5).with_take_profit(dec!(110_000));
    sim.gateway.open_position(&alice, order).await?;

    let report = sim.mark(Symbol::BtcUsdt, dec!(110_000)).await?;
    let Some(closed) = report.closed.first() else {
        bail!("take profit did not fire");
    };
    println!("  Closed as {} at ${}", closed.record.kind, closed.record.price);
    println!("  PnL: ${}", closed.record.pnl);
    println!("  Credited: ${}", closed.settlement.credit());
    println!("  Wallet: ${}\n", sim.gateway.wallet(&alice).await?.balance);
    Ok(())
}

/// Two liquidating ticks evaluated at once produce one liquidation.
async fn scenario_d_double_liquidation(config: &PaperConfig) -> Result<()> {
    println!("Scenario D: two liquidating ticks at once\n");
    let sim = Sim::new(config);
    let carol = UserId::new("carol");
    sim.admin.provision(&carol).await?;
    sim.mark(Symbol::BtcUsdt, dec!(100_000)).await?;

    let pos = sim
        .gateway
        .open_position(&carol, OpenOrder::market(Symbol::BtcUsdt, Side::Long, dec!(20), 100))
        .await?;
    println!("  20 BTC long at 100x, liquidation {}", show_liq(pos.liquidation_price));

    let first = sim.tick(Symbol::BtcUsdt, dec!(100_500))?;
    let second = sim.tick(Symbol::BtcUsdt, dec!(100_400))?;
    let (a, b) = tokio::join!(sim.engine().on_tick(first), sim.engine().on_tick(second));

    let liquidations = a.closed.len() + b.closed.len();
    println!("  Liquidations: {liquidations}, lost races: {}", a.conflicts + b.conflicts);

    let history = sim.gateway.trade_history(&carol, None).await?;
    let terminal = history.iter().filter(|t| t.kind.is_terminal()).count();
    let wallet = sim.gateway.wallet(&carol).await?;
    println!("  Terminal records: {terminal}");
    println!("  Wallet: ${}, liquidated: {}\n", wallet.balance, wallet.is_liquidated);
    Ok(())
}

/// Feed → evaluators, with a dropped connection and a manual close racing a stop-loss.
async fn scenario_e_live_feed(config: &PaperConfig) -> Result<()> {
    println!("Scenario E: live feed\n");
    let sim = Sim::new(config);
    let dave = UserId::new("dave");
    sim.admin.provision(&dave).await?;
    sim.mark(Symbol::EthUsdt, dec!(3_000)).await?;

    let order = OpenOrder::market(Symbol::EthUsdt, Side::Long, dec!(5), 3).with_stop_loss(dec!(2_900));
    let pos = sim.gateway.open_position(&dave, order).await?;

    let feed = PriceFeed::new(config.engine.channel_capacity);
    let evaluators = sim.engine().spawn_evaluators(&feed)?;

    let now = sim.clock.now();
    let eth = |price: Decimal, offset: i64| -> Result<ReplayStep> {
        let mark = Price::new(price).context("mark price must be positive")?;
        Ok(ReplayStep::Tick(PriceTick::new(Symbol::EthUsdt, mark, now.plus_millis(offset))))
    };
    let source = ReplaySource::new([
        eth(dec!(2_990), 1)?,
        ReplayStep::Disconnect,
        eth(dec!(2_950), 2)?,
        ReplayStep::Pause(Duration::from_millis(5)),
        eth(dec!(2_890), 3)?,
    ]);

    let pumping = tokio::spawn(pump(source, feed.clone(), config.engine.reconnect));
    tokio::time::sleep(Duration::from_millis(1)).await;

    match sim.gateway.close_position(&dave, pos.id).await {
        Ok(CloseOutcome::Closed(report)) => println!("  Manual close won at ${}", report.record.price),
        Ok(CloseOutcome::AlreadyClosed { kind, record, .. }) => {
            println!("  Engine won: {} at ${}", kind.as_str(), record.price)
        }
        Err(err) => println!("  Manual close rejected: {err}"),
    }

    let stats = pumping.await.context("pump task")??;
    feed.close();
    for handle in evaluators {
        handle.await.context("evaluator task")?;
    }

    println!("  Ticks delivered: {}, reconnects: {}", stats.delivered, stats.reconnects);
    let history = sim.gateway.trade_history(&dave, None).await?;
    for trade in &history {
        println!("  {} {} @ ${} pnl ${}", trade.kind, trade.symbol, trade.price, trade.pnl);
    }
    println!("  Wallet: ${}", sim.gateway.wallet(&dave).await?.balance);
    Ok(())
}

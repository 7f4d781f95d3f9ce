// 6.0: price feed. external transports push ticks in, the engine pulls them out of
// one mpsc channel per symbol. per-symbol ordering is the only ordering we promise.

use crate::types::{Price, Symbol, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: Symbol,
    pub mark_price: Price,
    pub observed_at: Timestamp,
}

impl PriceTick {
    pub fn new(symbol: Symbol, mark_price: Price, observed_at: Timestamp) -> Self {
        Self {
            symbol,
            mark_price,
            observed_at,
        }
    }

    // older than the window → not usable for trigger evaluation
    pub fn is_stale(&self, now: Timestamp, window_ms: u64) -> bool {
        now.millis_since(self.observed_at) > window_ms
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeedError {
    /// Transport dropped. Sources resume from the live stream, missed ticks are gone.
    #[error("Feed disconnected: {0}")]
    Disconnected(String),

    #[error("Feed gave up after {attempts} reconnect attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("Feed registry unavailable")]
    Poisoned,
}

/// What happened to a published tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Published {
    Delivered { subscribers: usize },
    /// Older than the last accepted tick for the symbol; dropped.
    OutOfOrder,
}

#[derive(Debug, Default)]
struct Channel {
    subscribers: Vec<mpsc::Sender<PriceTick>>,
    last_accepted: Option<Timestamp>,
}

/// Per-symbol fan-out hub. Clones share the same registry.
#[derive(Debug, Clone)]
pub struct PriceFeed {
    channels: Arc<Mutex<HashMap<Symbol, Channel>>>,
    capacity: usize,
}

impl PriceFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Arc::new(Mutex::new(HashMap::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self, symbol: Symbol) -> Result<mpsc::Receiver<PriceTick>, FeedError> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut channels = self.channels.lock().map_err(|_| FeedError::Poisoned)?;
        channels.entry(symbol).or_default().subscribers.push(tx);
        Ok(rx)
    }

    /// Forward a tick to every subscriber of its symbol.
    ///
    /// Must not be called concurrently for the same symbol; one pump per symbol
    /// is what keeps delivery in arrival order.
    pub async fn publish(&self, tick: PriceTick) -> Result<Published, FeedError> {
        let subscribers = {
            let mut channels = self.channels.lock().map_err(|_| FeedError::Poisoned)?;
            let channel = channels.entry(tick.symbol).or_default();
            if channel.last_accepted.is_some_and(|last| tick.observed_at < last) {
                tracing::debug!(
                    symbol = %tick.symbol,
                    observed_at = tick.observed_at.as_millis(),
                    "dropping out-of-order tick"
                );
                return Ok(Published::OutOfOrder);
            }
            channel.last_accepted = Some(tick.observed_at);
            channel.subscribers.clone()
        };

        let mut delivered = 0;
        let mut closed = false;
        for tx in &subscribers {
            if tx.send(tick).await.is_ok() {
                delivered += 1;
            } else {
                closed = true;
            }
        }

        if closed {
            let mut channels = self.channels.lock().map_err(|_| FeedError::Poisoned)?;
            if let Some(channel) = channels.get_mut(&tick.symbol) {
                channel.subscribers.retain(|tx| !tx.is_closed());
            }
        }

        Ok(Published::Delivered { subscribers: delivered })
    }

    /// Drop every subscriber. Receivers see the channel end once drained.
    pub fn close(&self) {
        if let Ok(mut channels) = self.channels.lock() {
            for channel in channels.values_mut() {
                channel.subscribers.clear();
            }
        }
    }

    pub fn subscriber_count(&self, symbol: Symbol) -> usize {
        self.channels
            .lock()
            .map(|channels| channels.get(&symbol).map_or(0, |c| c.subscribers.len()))
            .unwrap_or(0)
    }
}

/// A transport delivering mark prices, e.g. an exchange websocket.
#[async_trait]
pub trait TickSource: Send {
    /// `Ok(None)` means the source is finished for good.
    async fn next_tick(&mut self) -> Result<Option<PriceTick>, FeedError>;

    async fn reconnect(&mut self) -> Result<(), FeedError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub delivered: u64,
    pub out_of_order: u64,
    pub reconnects: u64,
}

/// Drain `source` into `feed` until the source ends.
///
/// A disconnect is logged and the source reconnected; ticks missed in between
/// are not replayed.
pub async fn pump<S: TickSource>(
    mut source: S,
    feed: PriceFeed,
    policy: ReconnectPolicy,
) -> Result<PumpStats, FeedError> {
    let mut stats = PumpStats::default();

    loop {
        match source.next_tick().await {
            Ok(Some(tick)) => match feed.publish(tick).await? {
                Published::Delivered { .. } => stats.delivered += 1,
                Published::OutOfOrder => stats.out_of_order += 1,
            },
            Ok(None) => return Ok(stats),
            Err(FeedError::Disconnected(reason)) => {
                tracing::warn!(%reason, "price source disconnected, resuming");
                reconnect(&mut source, policy).await?;
                stats.reconnects += 1;
            }
            Err(other) => return Err(other),
        }
    }
}

async fn reconnect<S: TickSource>(source: &mut S, policy: ReconnectPolicy) -> Result<(), FeedError> {
    for attempt in 1..=policy.max_attempts {
        match source.reconnect().await {
            Ok(()) => return Ok(()),
            Err(err) => {
                tracing::warn!(attempt, error = %err, "reconnect failed");
                tokio::time::sleep(Duration::from_millis(policy.backoff_ms)).await;
            }
        }
    }
    Err(FeedError::ReconnectExhausted {
        attempts: policy.max_attempts,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplayStep {
    Tick(PriceTick),
    Disconnect,
    Pause(Duration),
}

/// Scripted source for simulations and tests.
#[derive(Debug, Clone, Default)]
pub struct ReplaySource {
    steps: VecDeque<ReplayStep>,
    failing_reconnects: u32,
}

impl ReplaySource {
    pub fn new(steps: impl IntoIterator<Item = ReplayStep>) -> Self {
        Self {
            steps: steps.into_iter().collect(),
            failing_reconnects: 0,
        }
    }

    pub fn from_ticks(ticks: impl IntoIterator<Item = PriceTick>) -> Self {
        Self::new(ticks.into_iter().map(ReplayStep::Tick))
    }

    /// The next `n` reconnect attempts fail.
    pub fn with_failing_reconnects(mut self, n: u32) -> Self {
        self.failing_reconnects = n;
        self
    }
}

#[async_trait]
impl TickSource for ReplaySource {
    async fn next_tick(&mut self) -> Result<Option<PriceTick>, FeedError> {
        while let Some(step) = self.steps.pop_front() {
            match step {
                ReplayStep::Tick(tick) => return Ok(Some(tick)),
                ReplayStep::Disconnect => return Err(FeedError::Disconnected("replay".to_string())),
                ReplayStep::Pause(duration) => tokio::time::sleep(duration).await,
            }
        }
        Ok(None)
    }

    async fn reconnect(&mut self) -> Result<(), FeedError> {
        if self.failing_reconnects > 0 {
            self.failing_reconnects -= 1;
            return Err(FeedError::Disconnected("replay reconnect refused".to_string()));
        }
        Ok(())
    }
}

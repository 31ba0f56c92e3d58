use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::{sleep, Duration};

use crate::broker::{Broker, BrokerError, OrderError};
use crate::config::EngineConfig;
use crate::execution::{affordable_quantity, OrderExecutor};
use crate::messaging::{ConfirmationError, ConfirmationGateway, Messenger, MessagingError, SessionId};
use crate::models::{PositionRecord, Signal};
use crate::persistence::{PersistenceError, PositionStore};
use crate::strategy::RsiStrategy;

/// Where the engine is within a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    AwaitingBuyConfirm,
    AwaitingQtyChoice,
    AwaitingSellConfirm,
}

/// How a tick ended when nothing went wrong
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    MarketClosed,
    Hold { rsi: f64 },
    BuyDeclined,
    InsufficientFunds { balance: f64, price: f64 },
    QuantityNotSelected,
    Bought { quantity: u64, fill_price: f64 },
    BuyFailed { reason: String },
    SellDeclined,
    /// Record said held but the account holds nothing; record corrected
    PositionDrifted,
    Sold { quantity: u64, profit: f64 },
    SellFailed { reason: String },
    /// A previously failed position write finally went through
    Recovered,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("No price data for {0}")]
    NoPriceData(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    /// The account changed but the durable record did not follow
    #[error("Position record out of sync: expected {expected:?}, save failed: {source}")]
    PositionDesync {
        expected: PositionRecord,
        #[source]
        source: PersistenceError,
    },
}

impl EngineError {
    /// Whether the next tick should come after the short retry interval
    pub fn is_transient(&self) -> bool {
        match self {
            EngineError::NoPriceData(_) => true,
            EngineError::Broker(e) => e.is_transient(),
            EngineError::Messaging(MessagingError::Http(_)) => true,
            EngineError::Messaging(MessagingError::Api(_)) => false,
            EngineError::PositionDesync { .. } => false,
        }
    }

    /// One-message summary for the chat
    pub fn user_message(&self) -> String {
        match self {
            EngineError::NoPriceData(instrument) => {
                format!("⚠️ No price data for {}, skipping this cycle.", instrument)
            }
            EngineError::Broker(e) => format!("⚠️ Broker request failed: {}", e),
            EngineError::Messaging(e) => format!("⚠️ Messaging failed: {}", e),
            EngineError::PositionDesync { expected, source } => format!(
                "🚨 Position record out of sync! It should read held={} at {:.2}, \
                 but saving failed: {}.\nTrading is paused until the record is written. \
                 Please check the account.",
                expected.held, expected.last_buy_price, source
            ),
        }
    }
}

/// Collaborators the engine drives
pub struct EngineContext {
    pub broker: Arc<dyn Broker>,
    pub messenger: Arc<dyn Messenger>,
    pub gateway: Arc<ConfirmationGateway>,
    pub store: Arc<dyn PositionStore>,
}

/// Polling loop and position state machine for one instrument
///
/// The engine is the only writer of the position record. Ticks run one at a
/// time, so at most one order is ever in flight.
pub struct DecisionEngine {
    instrument_id: String,
    session: SessionId,
    config: EngineConfig,
    strategy: RsiStrategy,
    broker: Arc<dyn Broker>,
    executor: OrderExecutor,
    gateway: Arc<ConfirmationGateway>,
    messenger: Arc<dyn Messenger>,
    store: Arc<dyn PositionStore>,
    position: PositionRecord,
    state: EngineState,
    /// Record that matches the account but could not be written yet
    unsaved: Option<PositionRecord>,
    /// Set while `run` drives the engine; cancels pending confirmations only
    shutdown: Option<watch::Receiver<bool>>,
}

impl DecisionEngine {
    /// Build the engine and load the stored position
    pub async fn new(
        instrument_id: impl Into<String>,
        session: SessionId,
        config: EngineConfig,
        ctx: EngineContext,
    ) -> Self {
        let instrument_id = instrument_id.into();
        let position = ctx.store.load().await;
        tracing::info!(
            "Loaded position for {}: held={} last_buy_price={:.2}",
            instrument_id,
            position.held,
            position.last_buy_price
        );

        Self {
            strategy: RsiStrategy::from_config(&config),
            executor: OrderExecutor::new(ctx.broker.clone()),
            instrument_id,
            session,
            config,
            broker: ctx.broker,
            gateway: ctx.gateway,
            messenger: ctx.messenger,
            store: ctx.store,
            position,
            state: EngineState::Idle,
            unsaved: None,
            shutdown: None,
        }
    }

    pub fn position(&self) -> PositionRecord {
        self.position
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn has_unsaved_position(&self) -> bool {
        self.unsaved.is_some()
    }

    /// Run ticks until `shutdown` turns true
    ///
    /// Errors never end the loop: each one is logged and reported, then the
    /// engine sleeps (shorter after transient failures) and tries again.
    ///
    /// Shutdown is observed between ticks and while a confirmation is pending,
    /// where it counts as a decline. A tick that has submitted an order always
    /// runs on until the result is recorded.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        self.shutdown = Some(shutdown.clone());

        tracing::info!(
            "💹 Decision engine starting for {} (every {}s, retry {}s)",
            self.instrument_id,
            self.config.poll_interval_secs,
            self.config.retry_interval_secs
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tracing::info!("💹 [TICK] {}", Utc::now().format("%H:%M:%S"));

            let result = self.tick().await;
            let delay = self.after_tick(result).await;

            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }
        }

        self.state = EngineState::Idle;
        tracing::info!("Decision engine for {} stopped", self.instrument_id);
    }

    /// One evaluation cycle; always leaves the engine idle
    pub async fn tick(&mut self) -> Result<TickOutcome, EngineError> {
        let result = self.evaluate().await;
        self.state = EngineState::Idle;
        result
    }

    async fn after_tick(&self, result: Result<TickOutcome, EngineError>) -> Duration {
        match result {
            Ok(outcome) => {
                tracing::info!("  ✓ Tick finished: {:?}", outcome);
                self.config.poll_interval()
            }
            Err(e) => {
                if matches!(e, EngineError::PositionDesync { .. }) {
                    tracing::error!("🚨 {}", e);
                } else {
                    tracing::error!("  ✗ Tick failed: {}", e);
                }
                self.notify(&e.user_message()).await;

                if e.is_transient() {
                    self.config.retry_interval()
                } else {
                    self.config.poll_interval()
                }
            }
        }
    }

    async fn evaluate(&mut self) -> Result<TickOutcome, EngineError> {
        if let Some(expected) = self.unsaved {
            return self.retry_unsaved(expected).await;
        }

        if !self.broker.is_market_open(Utc::now()) {
            tracing::info!("  Market closed, trading paused");
            return Ok(TickOutcome::MarketClosed);
        }

        let held_quantity = self.reconcile().await?;

        let closes = self
            .broker
            .recent_closes(&self.instrument_id, self.config.lookback_minutes)
            .await?;
        if closes.is_empty() {
            return Err(EngineError::NoPriceData(self.instrument_id.clone()));
        }

        let reading = self
            .strategy
            .evaluate(&self.instrument_id, &closes, self.position.held);
        tracing::info!(
            "  [RSI] {} → {:.2} ({} closes, held={}) → {:?}",
            reading.instrument_id,
            reading.rsi,
            closes.len(),
            self.position.held,
            reading.signal
        );
        if self.config.announce_rsi {
            self.notify(&format!("[RSI] Current value: {:.2}", reading.rsi))
                .await;
        }

        match reading.signal {
            Signal::Buy => self.buy_path(reading.rsi).await,
            Signal::Sell => self.sell_path(reading.rsi, held_quantity).await,
            Signal::Hold => Ok(TickOutcome::Hold { rsi: reading.rsi }),
        }
    }

    /// Align the record with an out-of-band holding; returns the held quantity
    async fn reconcile(&mut self) -> Result<u64, EngineError> {
        let quantity = self.broker.held_quantity(&self.instrument_id).await?;

        if quantity > 0 && !self.position.held {
            let price = match self.broker.average_position_price(&self.instrument_id).await {
                Ok(Some(price)) => price,
                Ok(None) => self.position.last_buy_price,
                Err(e) => {
                    tracing::warn!("Could not fetch average position price: {}", e);
                    self.position.last_buy_price
                }
            };

            tracing::warn!(
                "📌 Found {} lots of {} on the account, marking position as held",
                quantity,
                self.instrument_id
            );
            self.persist(PositionRecord::bought(price)).await?;
            self.notify(&format!(
                "📌 Found {} lots of {} in the portfolio. Position marked as held.",
                quantity, self.instrument_id
            ))
            .await;
        }

        Ok(quantity)
    }

    async fn buy_path(&mut self, rsi: f64) -> Result<TickOutcome, EngineError> {
        tracing::info!("🔔 Buy condition met (RSI {:.2})", rsi);
        self.state = EngineState::AwaitingBuyConfirm;

        let question = format!(
            "📉 RSI {:.2} < {}. Buy {}?",
            rsi, self.config.buy_threshold, self.instrument_id
        );
        if !self.confirm(&question).await? {
            tracing::info!("  Buy declined");
            return Ok(TickOutcome::BuyDeclined);
        }

        let balance = self.broker.balance().await?;
        self.notify(&format!("💰 Account balance: {:.2}", balance))
            .await;

        let last_price = self
            .broker
            .last_price(&self.instrument_id)
            .await?
            .ok_or_else(|| EngineError::NoPriceData(self.instrument_id.clone()))?;

        let (price, max_quantity) = affordable_quantity(last_price, balance);
        if max_quantity == 0 {
            tracing::info!("  Insufficient funds: {:.2} < {:.2}", balance, price);
            self.notify(&format!(
                "❌ Not enough funds for even one lot ({:.2} available, {:.2} needed).",
                balance, price
            ))
            .await;
            return Ok(TickOutcome::InsufficientFunds { balance, price });
        }

        self.state = EngineState::AwaitingQtyChoice;
        let offered = max_quantity.min(self.config.max_quantity_options);
        let options: Vec<String> = (1..=offered).map(|q| q.to_string()).collect();
        let question = format!(
            "How many lots to buy? Price {:.2}, affordable up to {}.",
            price, max_quantity
        );

        let Some(quantity) = self
            .choose(&question, &options)
            .await?
            .and_then(|choice| choice.parse::<u64>().ok())
        else {
            tracing::info!("  No quantity selected");
            self.notify("❌ Purchase cancelled.").await;
            return Ok(TickOutcome::QuantityNotSelected);
        };

        debug_assert!(quantity as f64 * price <= balance);

        match self.executor.buy(&self.instrument_id, quantity).await {
            Ok(fill_price) => {
                self.persist(PositionRecord::bought(fill_price)).await?;
                tracing::info!("✓ BUY executed: {} lots at {:.2}", quantity, fill_price);
                self.notify(&format!(
                    "✅ Bought {} lots at {:.2}",
                    quantity, fill_price
                ))
                .await;
                Ok(TickOutcome::Bought {
                    quantity,
                    fill_price,
                })
            }
            Err(OrderError::MissingFillPrice) => {
                // Executed: record the quoted price rather than lose the holding
                tracing::warn!(
                    "✓ BUY executed: {} lots, fill price unknown, recording quote {:.2}",
                    quantity,
                    price
                );
                self.persist(PositionRecord::bought(price)).await?;
                self.notify(&format!(
                    "✅ Bought {} lots. The fill price was not reported, recorded at the quoted {:.2}",
                    quantity, price
                ))
                .await;
                Ok(TickOutcome::Bought {
                    quantity,
                    fill_price: price,
                })
            }
            Err(e) => {
                tracing::error!("✗ Buy failed: {}", e);
                self.notify(&format!("❌ Buy failed: {}", e)).await;
                Ok(TickOutcome::BuyFailed {
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn sell_path(&mut self, rsi: f64, held_quantity: u64) -> Result<TickOutcome, EngineError> {
        tracing::info!("🔔 Sell condition met (RSI {:.2})", rsi);
        self.state = EngineState::AwaitingSellConfirm;

        let current_price = self
            .broker
            .last_price(&self.instrument_id)
            .await?
            .ok_or_else(|| EngineError::NoPriceData(self.instrument_id.clone()))?;
        let buy_price = self.position.last_buy_price;
        let estimate = (current_price - buy_price) * held_quantity as f64;

        let question = format!(
            "📈 RSI {:.2} > {}. Sell {}?\nBought at: {:.2}\nSelling at: {:.2}\nProfit: {:.2} ({} lots)",
            rsi, self.config.sell_threshold, self.instrument_id, buy_price, current_price, estimate,
            held_quantity
        );
        if !self.confirm(&question).await? {
            tracing::info!("  Sell declined");
            return Ok(TickOutcome::SellDeclined);
        }

        let quantity = self.broker.held_quantity(&self.instrument_id).await?;
        if quantity == 0 {
            tracing::warn!("Position in {} is gone from the account", self.instrument_id);
            self.persist(self.position.flat()).await?;
            self.notify("⚠️ Nothing to sell: the position is no longer on the account. Marked as closed.")
                .await;
            return Ok(TickOutcome::PositionDrifted);
        }

        match self.executor.sell(&self.instrument_id, quantity).await {
            Ok(()) => {
                self.persist(self.position.flat()).await?;
                let profit = (current_price - buy_price) * quantity as f64;
                tracing::info!("✓ SELL executed: {} lots, profit ≈ {:.2}", quantity, profit);
                self.notify(&format!(
                    "✅ Sold {} lots at ~{:.2}\n📈 Profit: {:.2}",
                    quantity, current_price, profit
                ))
                .await;
                Ok(TickOutcome::Sold { quantity, profit })
            }
            Err(e) => {
                tracing::error!("✗ Sell failed: {}", e);
                self.notify(&format!("❌ Sell failed: {}", e)).await;
                Ok(TickOutcome::SellFailed {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Write the record; the in-memory copy only changes once it is durable
    async fn persist(&mut self, record: PositionRecord) -> Result<(), EngineError> {
        match self.store.save(&record).await {
            Ok(()) => {
                self.position = record;
                Ok(())
            }
            Err(source) => {
                self.unsaved = Some(record);
                Err(EngineError::PositionDesync {
                    expected: record,
                    source,
                })
            }
        }
    }

    /// Only the write is retried, never the trade behind it
    async fn retry_unsaved(&mut self, expected: PositionRecord) -> Result<TickOutcome, EngineError> {
        tracing::warn!("Retrying position write {:?}", expected);

        match self.store.save(&expected).await {
            Ok(()) => {
                self.position = expected;
                self.unsaved = None;
                tracing::info!("✓ Position record repaired");
                self.notify("✅ Position record saved, trading resumes.")
                    .await;
                Ok(TickOutcome::Recovered)
            }
            Err(source) => Err(EngineError::PositionDesync { expected, source }),
        }
    }

    async fn confirm(&self, question: &str) -> Result<bool, EngineError> {
        let asked = self
            .gateway
            .ask_yes_no(self.session, question, self.config.confirm_timeout());
        let Some(answer) = self.unless_shutdown(asked).await else {
            tracing::info!("  Shutting down, confirmation abandoned");
            return Ok(false);
        };

        match answer {
            Ok(approved) => Ok(approved),
            Err(ConfirmationError::AlreadyPending(session)) => {
                tracing::warn!("Confirmation already pending for {}, skipping", session);
                Ok(false)
            }
            Err(ConfirmationError::Delivery(e)) => Err(e.into()),
        }
    }

    async fn choose(&self, question: &str, options: &[String]) -> Result<Option<String>, EngineError> {
        let asked = self.gateway.ask_choice(
            self.session,
            question,
            options,
            self.config.quantity_timeout(),
        );
        let Some(answer) = self.unless_shutdown(asked).await else {
            tracing::info!("  Shutting down, quantity choice abandoned");
            return Ok(None);
        };

        match answer {
            Ok(choice) => Ok(choice),
            Err(ConfirmationError::AlreadyPending(session)) => {
                tracing::warn!("Confirmation already pending for {}, skipping", session);
                Ok(None)
            }
            Err(ConfirmationError::Delivery(e)) => Err(e.into()),
        }
    }

    /// `None` when shutdown arrives first; the future is dropped
    async fn unless_shutdown<F: Future>(&self, fut: F) -> Option<F::Output> {
        let Some(mut shutdown) = self.shutdown.clone() else {
            return Some(fut.await);
        };

        tokio::select! {
            output = fut => Some(output),
            _ = shutdown_requested(&mut shutdown) => None,
        }
    }

    async fn notify(&self, text: &str) {
        if let Err(e) = self.messenger.send(self.session, text).await {
            tracing::warn!("Failed to send notification: {}", e);
        }
    }
}

/// Resolves once the flag is set; never if the sender is gone without setting it
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let closed = shutdown.wait_for(|stop| *stop).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

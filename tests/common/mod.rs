// Shared doubles for engine integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rsibot::broker::{Broker, BrokerError, OrderError};
use rsibot::config::EngineConfig;
use rsibot::engine::{DecisionEngine, EngineContext};
use rsibot::messaging::{ConfirmationGateway, Messenger, MessagingError, Prompt, SessionId};
use rsibot::models::{PositionRecord, TradeSide};
use rsibot::persistence::{PersistenceError, PositionReader, PositionStore};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

pub const INSTRUMENT: &str = "BBG004730N88";
pub const CHAT: SessionId = SessionId(42);

// ============================================================================
// Price series
// ============================================================================

/// 15 closes whose trailing 14 changes give RSI 30
pub fn closes_rsi_30() -> Vec<f64> {
    let mut closes = vec![100.0];
    for i in 0..14 {
        let last = closes[closes.len() - 1];
        closes.push(if i % 7 < 3 { last + 1.0 } else { last - 1.75 });
    }
    closes
}

/// 15 closes whose trailing 14 changes give RSI 75
pub fn closes_rsi_75() -> Vec<f64> {
    let changes = [1.0, 1.0, -1.0, 1.0, 0.0, 1.0, 1.0, -1.0, 1.0, 1.0, 0.0, 1.0, -1.0, 1.0];
    let mut closes = vec![100.0];
    for change in changes {
        let last = closes[closes.len() - 1];
        closes.push(last + change);
    }
    closes
}

/// Too short for the window, so the indicator reads neutral
pub fn neutral_closes() -> Vec<f64> {
    vec![100.0, 101.0, 100.5]
}

// ============================================================================
// Broker
// ============================================================================

#[derive(Debug, Clone)]
pub struct BrokerState {
    pub market_open: bool,
    pub closes: Vec<f64>,
    pub last_price: Option<f64>,
    pub balance: f64,
    pub held: u64,
    pub average_price: Option<f64>,
    /// Fill price, or the rejection reason
    pub fill: Result<f64, String>,
    pub orders: Vec<(TradeSide, u64)>,
    pub closes_calls: usize,
    /// How long an accepted order takes to report back
    pub order_delay: Option<Duration>,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            market_open: true,
            closes: neutral_closes(),
            last_price: Some(100.0),
            balance: 1000.0,
            held: 0,
            average_price: None,
            fill: Ok(100.0),
            orders: Vec::new(),
            closes_calls: 0,
            order_delay: None,
        }
    }
}

pub struct MockBroker {
    state: Mutex<BrokerState>,
}

impl MockBroker {
    pub fn new(state: BrokerState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut BrokerState)) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn snapshot(&self) -> BrokerState {
        self.state.lock().unwrap().clone()
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn last_price(&self, _instrument_id: &str) -> Result<Option<f64>, BrokerError> {
        Ok(self.state.lock().unwrap().last_price)
    }

    async fn recent_closes(
        &self,
        _instrument_id: &str,
        _window_minutes: u64,
    ) -> Result<Vec<f64>, BrokerError> {
        let mut state = self.state.lock().unwrap();
        state.closes_calls += 1;
        Ok(state.closes.clone())
    }

    async fn balance(&self) -> Result<f64, BrokerError> {
        Ok(self.state.lock().unwrap().balance)
    }

    async fn held_quantity(&self, _instrument_id: &str) -> Result<u64, BrokerError> {
        Ok(self.state.lock().unwrap().held)
    }

    async fn average_position_price(
        &self,
        _instrument_id: &str,
    ) -> Result<Option<f64>, BrokerError> {
        Ok(self.state.lock().unwrap().average_price)
    }

    fn is_market_open(&self, _now: DateTime<Utc>) -> bool {
        self.state.lock().unwrap().market_open
    }

    async fn submit_market_order(
        &self,
        _instrument_id: &str,
        quantity: u64,
        side: TradeSide,
    ) -> Result<f64, OrderError> {
        let (fill, delay) = {
            let mut state = self.state.lock().unwrap();
            let fill = state.fill.clone().map_err(OrderError::Rejected)?;

            state.orders.push((side, quantity));
            match side {
                TradeSide::Buy => {
                    state.held += quantity;
                    state.balance -= quantity as f64 * fill;
                }
                TradeSide::Sell => {
                    state.held = state.held.saturating_sub(quantity);
                    state.balance += quantity as f64 * fill;
                }
            }
            (fill, state.order_delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(fill)
    }

    async fn daily_profit(&self) -> Result<f64, BrokerError> {
        Ok(0.0)
    }

    async fn transactions_today(&self) -> Result<usize, BrokerError> {
        Ok(self.state.lock().unwrap().orders.len())
    }
}

// ============================================================================
// Messenger
// ============================================================================

/// Answers prompts from a script, in order; `None` (or an empty script)
/// leaves the prompt unanswered.
pub struct ScriptedMessenger {
    gateway: OnceLock<Weak<ConfirmationGateway>>,
    answers: Mutex<VecDeque<Option<String>>>,
    prompts: Mutex<Vec<Prompt>>,
    notices: Mutex<Vec<String>>,
}

impl ScriptedMessenger {
    pub fn new(answers: &[Option<&str>]) -> Self {
        Self {
            gateway: OnceLock::new(),
            answers: Mutex::new(answers.iter().map(|a| a.map(str::to_string)).collect()),
            prompts: Mutex::new(Vec::new()),
            notices: Mutex::new(Vec::new()),
        }
    }

    pub fn attach(&self, gateway: &Arc<ConfirmationGateway>) {
        let _ = self.gateway.set(Arc::downgrade(gateway));
    }

    pub fn push_answer(&self, answer: Option<&str>) {
        self.answers
            .lock()
            .unwrap()
            .push_back(answer.map(str::to_string));
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn notices(&self) -> Vec<String> {
        self.notices.lock().unwrap().clone()
    }

    pub fn has_notice(&self, needle: &str) -> bool {
        self.notices().iter().any(|n| n.contains(needle))
    }
}

#[async_trait]
impl Messenger for ScriptedMessenger {
    async fn send(&self, _session: SessionId, text: &str) -> Result<(), MessagingError> {
        self.notices.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn send_prompt(&self, session: SessionId, prompt: &Prompt) -> Result<(), MessagingError> {
        self.prompts.lock().unwrap().push(prompt.clone());

        let answer = self.answers.lock().unwrap().pop_front().flatten();
        if let Some(value) = answer {
            if let Some(gateway) = self.gateway.get().and_then(Weak::upgrade) {
                gateway.resolve(session, prompt.request_id, &value);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Store
// ============================================================================

#[derive(Default)]
pub struct MemoryStore {
    record: Mutex<PositionRecord>,
    failing: AtomicBool,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn with_record(record: PositionRecord) -> Self {
        Self {
            record: Mutex::new(record),
            ..Default::default()
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn record(&self) -> PositionRecord {
        *self.record.lock().unwrap()
    }

    /// Successful writes so far
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PositionReader for MemoryStore {
    async fn load(&self) -> PositionRecord {
        self.record()
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn save(&self, record: &PositionRecord) -> Result<(), PersistenceError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PersistenceError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        *self.record.lock().unwrap() = *record;
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub engine: DecisionEngine,
    pub broker: Arc<MockBroker>,
    pub messenger: Arc<ScriptedMessenger>,
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<ConfirmationGateway>,
}

pub async fn harness(
    broker: BrokerState,
    record: PositionRecord,
    answers: &[Option<&str>],
) -> Harness {
    let broker = Arc::new(MockBroker::new(broker));
    let messenger = Arc::new(ScriptedMessenger::new(answers));
    let store = Arc::new(MemoryStore::with_record(record));
    let gateway = Arc::new(ConfirmationGateway::new(messenger.clone()));
    messenger.attach(&gateway);

    let engine = DecisionEngine::new(
        INSTRUMENT,
        CHAT,
        EngineConfig::default(),
        EngineContext {
            broker: broker.clone(),
            messenger: messenger.clone(),
            gateway: gateway.clone(),
            store: store.clone(),
        },
    )
    .await;

    Harness {
        engine,
        broker,
        messenger,
        store,
        gateway,
    }
}

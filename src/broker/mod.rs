// Broker access: market data, account state, order submission
pub mod invest;
pub mod market_hours;

use crate::models::TradeSide;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use invest::InvestClient;
pub use market_hours::MarketHours;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Broker API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Unexpected broker response: {0}")]
    Decode(String),
}

impl BrokerError {
    /// Network hiccups, rate limiting and server-side failures are worth a
    /// quick retry; everything else will fail the same way again.
    pub fn is_transient(&self) -> bool {
        match self {
            BrokerError::Http(e) => !e.is_decode() && !e.is_builder(),
            BrokerError::Api { status, .. } => *status == 429 || *status >= 500,
            BrokerError::Decode(_) => false,
        }
    }
}

/// Closed set of ways an order submission can fail
#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("Order rejected: {0}")]
    Rejected(String),

    /// The order went through; only its price is unknown
    #[error("Order executed but no fill price was reported")]
    MissingFillPrice,

    #[error("Invalid order quantity: {0}")]
    InvalidQuantity(u64),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

/// Everything the engine needs from the brokerage
///
/// Quantities are in lots and prices are per lot, so `quantity * price`
/// is always the cash an order costs.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Latest traded price, `None` when the exchange reports nothing
    async fn last_price(&self, instrument_id: &str) -> Result<Option<f64>, BrokerError>;

    /// Closing prices covering the last `window_minutes`, oldest first
    async fn recent_closes(
        &self,
        instrument_id: &str,
        window_minutes: u64,
    ) -> Result<Vec<f64>, BrokerError>;

    /// Free cash in the settlement currency
    async fn balance(&self) -> Result<f64, BrokerError>;

    async fn held_quantity(&self, instrument_id: &str) -> Result<u64, BrokerError>;

    /// Average acquisition price of the current holding, if any
    async fn average_position_price(&self, instrument_id: &str)
        -> Result<Option<f64>, BrokerError>;

    fn is_market_open(&self, now: DateTime<Utc>) -> bool;

    /// Submit a market order; returns the average fill price per lot
    ///
    /// Once the broker has accepted the order this never fails on a price
    /// lookup: a sell with no known price reports 0, and a buy with no price
    /// at all reports `OrderError::MissingFillPrice`, which still means the
    /// order executed.
    async fn submit_market_order(
        &self,
        instrument_id: &str,
        quantity: u64,
        side: TradeSide,
    ) -> Result<f64, OrderError>;

    /// Net cash flow of today's trades
    async fn daily_profit(&self) -> Result<f64, BrokerError>;

    /// Number of account operations since midnight UTC
    async fn transactions_today(&self) -> Result<usize, BrokerError>;
}

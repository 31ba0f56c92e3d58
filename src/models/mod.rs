use serde::{Deserialize, Serialize};

/// Durable position record for the traded instrument
///
/// `held` and `last_buy_price` always move together: the engine only writes
/// a new record after an order was confirmed and executed by the broker.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct PositionRecord {
    pub held: bool,
    /// Only meaningful while `held` is true
    pub last_buy_price: f64,
}

impl PositionRecord {
    /// Record written after a filled buy
    pub fn bought(fill_price: f64) -> Self {
        Self {
            held: true,
            last_buy_price: fill_price,
        }
    }

    /// Record written after a sell (or after discovering the position is gone).
    /// The last buy price is kept for reference but carries no meaning.
    pub fn flat(self) -> Self {
        Self {
            held: false,
            ..self
        }
    }
}

/// Trading signal
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Signal {
    Buy,
    Sell,
    Hold,
}

/// Indicator value plus the action it implies for the current position
#[derive(Debug, Clone, PartialEq)]
pub struct SignalReading {
    pub instrument_id: String,
    pub rsi: f64,
    pub signal: Signal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TradeSide {
    Buy,
    Sell,
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeSide::Buy => write!(f, "buy"),
            TradeSide::Sell => write!(f, "sell"),
        }
    }
}

/// A confirmed order, consumed once by the executor
#[derive(Debug, Clone, PartialEq)]
pub struct TradeIntent {
    pub instrument_id: String,
    pub side: TradeSide,
    pub quantity: u64,
}

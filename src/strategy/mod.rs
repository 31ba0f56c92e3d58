// Trading strategy module
use crate::config::EngineConfig;
use crate::indicators::compute_rsi;
use crate::models::{Signal, SignalReading};

/// RSI threshold strategy for a single instrument
///
/// Buys when the indicator drops below `buy_below` while flat and sells when
/// it rises above `sell_above` while holding. Everything else is a hold.
#[derive(Debug, Clone)]
pub struct RsiStrategy {
    window: usize,
    buy_below: f64,
    sell_above: f64,
}

impl RsiStrategy {
    pub fn new(window: usize, buy_below: f64, sell_above: f64) -> Self {
        Self {
            window,
            buy_below,
            sell_above,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.rsi_window, config.buy_threshold, config.sell_threshold)
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Minimum number of closes for a non-neutral reading
    pub fn min_closes_required(&self) -> usize {
        self.window + 1
    }

    /// Compute the indicator over `closes` and map it to a signal for the
    /// current (reconciled) position.
    pub fn evaluate(&self, instrument_id: &str, closes: &[f64], held: bool) -> SignalReading {
        let rsi = compute_rsi(closes, self.window);

        let signal = if rsi < self.buy_below && !held {
            Signal::Buy
        } else if rsi > self.sell_above && held {
            Signal::Sell
        } else {
            Signal::Hold
        };

        SignalReading {
            instrument_id: instrument_id.to_string(),
            rsi,
            signal,
        }
    }
}

impl Default for RsiStrategy {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

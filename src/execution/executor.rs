use std::sync::Arc;

use crate::broker::{Broker, OrderError};
use crate::models::{TradeIntent, TradeSide};

const EXACT_QUANTITY_LIMIT: f64 = 9_007_199_254_740_992.0;

/// Largest whole number of units `balance` pays for at `price`
///
/// Returns the price alongside the quantity; 0 means not even one unit is
/// affordable (also the answer for a non-positive or non-finite price).
pub fn affordable_quantity(price: f64, balance: f64) -> (f64, u64) {
    if !(price > 0.0) || !price.is_finite() || !(balance > 0.0) {
        return (price, 0);
    }

    let estimate = (balance / price).floor();
    // Past 2^53 neighbouring quantities share one f64, so there is no boundary to refine
    if estimate >= EXACT_QUANTITY_LIMIT {
        return (price, estimate as u64);
    }
    let mut quantity = estimate as u64;

    // The division can round either way; settle on the exact boundary
    while quantity > 0 && quantity as f64 * price > balance {
        quantity -= 1;
    }
    while let Some(next) = quantity.checked_add(1) {
        if next as f64 * price > balance {
            break;
        }
        quantity = next;
    }

    (price, quantity)
}

/// Submits confirmed trades to the broker
///
/// The caller guarantees `quantity * price <= balance` before a buy; the
/// executor does not re-check funds.
#[derive(Clone)]
pub struct OrderExecutor {
    broker: Arc<dyn Broker>,
}

impl OrderExecutor {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }

    /// Market buy; returns the average fill price
    pub async fn buy(&self, instrument_id: &str, quantity: u64) -> Result<f64, OrderError> {
        self.execute(&TradeIntent {
            instrument_id: instrument_id.to_string(),
            side: TradeSide::Buy,
            quantity,
        })
        .await
    }

    /// Market sell of `quantity` (the full holding)
    pub async fn sell(&self, instrument_id: &str, quantity: u64) -> Result<(), OrderError> {
        self.execute(&TradeIntent {
            instrument_id: instrument_id.to_string(),
            side: TradeSide::Sell,
            quantity,
        })
        .await
        .map(|_| ())
    }

    /// Consume a trade intent
    pub async fn execute(&self, intent: &TradeIntent) -> Result<f64, OrderError> {
        if intent.quantity == 0 {
            return Err(OrderError::InvalidQuantity(0));
        }

        let fill = self
            .broker
            .submit_market_order(&intent.instrument_id, intent.quantity, intent.side)
            .await?;

        // A sell may report 0 when the broker could not price it; only a buy needs the fill
        if intent.side == TradeSide::Buy && !(fill > 0.0 && fill.is_finite()) {
            return Err(OrderError::MissingFillPrice);
        }

        Ok(fill)
    }
}

/// Value reported when there is not enough history to measure momentum
pub const NEUTRAL_RSI: f64 = 50.0;

/// Calculate Relative Strength Index (RSI)
///
/// Simple-average variant: the mean gain and mean loss over the trailing
/// `period` price changes, not Wilder's exponential smoothing.
///
/// Values:
/// - RSI < 45: Oversold (buy zone for this bot)
/// - RSI > 60: Overbought (sell zone)
///
/// Returns 50 when fewer than `period + 1` prices are available, and 100
/// when the window contains no losses.
pub fn compute_rsi(prices: &[f64], period: usize) -> f64 {
    if period == 0 || prices.len() < period + 1 {
        return NEUTRAL_RSI;
    }

    let mut gains = 0.0;
    let mut losses = 0.0;

    // Only the trailing `period` changes count
    let tail = &prices[prices.len() - period - 1..];
    for pair in tail.windows(2) {
        let change = pair[1] - pair[0];
        if change >= 0.0 {
            gains += change;
        } else {
            losses += change.abs();
        }
    }

    let avg_gain = gains / period as f64;
    let avg_loss = losses / period as f64;

    if avg_loss == 0.0 {
        return 100.0;
    }

    let rs = avg_gain / avg_loss;
    100.0 - (100.0 / (1.0 + rs))
}

use super::{Broker, BrokerError, MarketHours, OrderError};
use crate::config::BrokerConfig;
use crate::models::TradeSide;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use governor::{Quota, RateLimiter};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};

// Tinkoff Invest API, REST gateway
// Docs: https://russianinvestments.github.io/investAPI/swagger-ui/
const SERVICE_PREFIX: &str = "tinkoff.public.invest.api.contract.v1";
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 500;

type InvestRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Client for the Tinkoff Invest REST API
///
/// Cloneable; clones share the rate limiter and the lot size cache.
#[derive(Clone)]
pub struct InvestClient {
    client: Client,
    base_url: String,
    token: String,
    account_id: String,
    currency: String,
    candle_interval: &'static str,
    market_hours: MarketHours,
    rate_limiter: Arc<InvestRateLimiter>,
    lot_sizes: Arc<RwLock<HashMap<String, u64>>>,
}

/// Fixed-point number as the API encodes it: whole units plus billionths
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq)]
pub struct Quotation {
    #[serde(default, deserialize_with = "int_from_string_or_number")]
    pub units: i64,
    #[serde(default)]
    pub nano: i32,
}

impl Quotation {
    pub fn to_f64(self) -> f64 {
        self.units as f64 + self.nano as f64 / 1e9
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct MoneyValue {
    #[serde(default)]
    currency: String,
    #[serde(default, deserialize_with = "int_from_string_or_number")]
    units: i64,
    #[serde(default)]
    nano: i32,
}

impl MoneyValue {
    fn to_f64(&self) -> f64 {
        Quotation {
            units: self.units,
            nano: self.nano,
        }
        .to_f64()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LastPricesResponse {
    #[serde(default)]
    last_prices: Vec<LastPrice>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LastPrice {
    #[serde(default)]
    figi: String,
    price: Option<Quotation>,
}

#[derive(Debug, Deserialize)]
struct CandlesResponse {
    #[serde(default)]
    candles: Vec<HistoricCandle>,
}

#[derive(Debug, Deserialize)]
struct HistoricCandle {
    #[serde(default)]
    close: Quotation,
}

#[derive(Debug, Deserialize)]
struct PortfolioResponse {
    #[serde(default)]
    positions: Vec<PortfolioPosition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PortfolioPosition {
    #[serde(default)]
    figi: String,
    #[serde(default)]
    quantity: Quotation,
    quantity_lots: Option<Quotation>,
    average_position_price: Option<MoneyValue>,
}

#[derive(Debug, Deserialize)]
struct WithdrawLimitsResponse {
    #[serde(default)]
    money: Vec<MoneyValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostOrderResponse {
    #[serde(default)]
    order_id: String,
    #[serde(default)]
    execution_report_status: String,
    executed_order_price: Option<MoneyValue>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderStateResponse {
    average_position_price: Option<MoneyValue>,
}

#[derive(Debug, Deserialize)]
struct OperationsResponse {
    #[serde(default)]
    operations: Vec<Operation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Operation {
    payment: Option<MoneyValue>,
    #[serde(default)]
    operation_type: String,
}

#[derive(Debug, Deserialize)]
struct InstrumentResponse {
    instrument: InstrumentInfo,
}

#[derive(Debug, Deserialize)]
struct InstrumentInfo {
    #[serde(default)]
    lot: i64,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    description: String,
}

/// int64 fields arrive as JSON strings, but accept plain numbers too
fn int_from_string_or_number<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn candle_interval_name(minutes: u32) -> &'static str {
    match minutes {
        1 => "CANDLE_INTERVAL_1_MIN",
        15 => "CANDLE_INTERVAL_15_MIN",
        60 => "CANDLE_INTERVAL_HOUR",
        _ => "CANDLE_INTERVAL_5_MIN",
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|midnight| midnight.and_utc())
        .unwrap_or(now)
}

impl InvestClient {
    pub fn new(config: &BrokerConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        let rpm = NonZeroU32::new(config.requests_per_minute)
            .context("requests_per_minute must be positive")?;
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_minute(rpm)));

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            account_id: config.account_id.clone(),
            currency: config.currency.to_lowercase(),
            candle_interval: candle_interval_name(config.candle_minutes),
            market_hours: MarketHours::from_config(&config.market_hours)?,
            rate_limiter,
            lot_sizes: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Rate-limited call with retry on transient failures
    async fn call<B, R>(&self, method: &str, body: &B) -> Result<R, BrokerError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        let mut attempt = 1;
        loop {
            match self.call_once(method, body).await {
                Ok(response) => return Ok(response),
                Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                    let backoff_ms = INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1);
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {}ms...",
                        method,
                        attempt,
                        MAX_RETRIES,
                        e,
                        backoff_ms
                    );
                    sleep(Duration::from_millis(backoff_ms)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Single rate-limited call, no retry
    async fn call_once<B, R>(&self, method: &str, body: &B) -> Result<R, BrokerError>
    where
        B: Serialize + Sync,
        R: DeserializeOwned,
    {
        self.rate_limiter.until_ready().await;

        let url = format!("{}/{}.{}", self.base_url, SERVICE_PREFIX, method);
        tracing::debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<ApiErrorBody>(&text) {
                Ok(body) if !body.description.is_empty() => {
                    format!("{} ({})", body.message, body.description)
                }
                Ok(body) if !body.message.is_empty() => body.message,
                _ => text,
            };
            return Err(BrokerError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| BrokerError::Decode(format!("{}: {}", method, e)))
    }

    /// Lot size for an instrument, cached after the first lookup
    async fn lot_size(&self, instrument_id: &str) -> Result<u64, BrokerError> {
        if let Some(lot) = self.lot_sizes.read().await.get(instrument_id) {
            return Ok(*lot);
        }

        let response: InstrumentResponse = self
            .call(
                "InstrumentsService/GetInstrumentBy",
                &json!({ "idType": "INSTRUMENT_ID_TYPE_FIGI", "id": instrument_id }),
            )
            .await?;
        let lot = response.instrument.lot.max(1) as u64;

        self.lot_sizes
            .write()
            .await
            .insert(instrument_id.to_string(), lot);
        tracing::debug!("Lot size for {}: {}", instrument_id, lot);

        Ok(lot)
    }

    async fn portfolio(&self) -> Result<Vec<PortfolioPosition>, BrokerError> {
        let response: PortfolioResponse = self
            .call(
                "OperationsService/GetPortfolio",
                &json!({ "accountId": self.account_id }),
            )
            .await?;
        Ok(response.positions)
    }

    async fn position(&self, instrument_id: &str) -> Result<Option<PortfolioPosition>, BrokerError> {
        Ok(self
            .portfolio()
            .await?
            .into_iter()
            .find(|p| p.figi == instrument_id))
    }

    async fn operations_today(&self) -> Result<Vec<Operation>, BrokerError> {
        let now = Utc::now();
        let response: OperationsResponse = self
            .call(
                "OperationsService/GetOperations",
                &json!({
                    "accountId": self.account_id,
                    "from": timestamp(start_of_day(now)),
                    "to": timestamp(now),
                    "state": "OPERATION_STATE_EXECUTED",
                }),
            )
            .await?;
        Ok(response.operations)
    }

    /// Average price per share of an order, looked up after submission
    async fn order_average_price(&self, order_id: &str) -> Result<Option<f64>, BrokerError> {
        let state: OrderStateResponse = self
            .call(
                "OrdersService/GetOrderState",
                &json!({ "accountId": self.account_id, "orderId": order_id }),
            )
            .await?;
        Ok(state
            .average_position_price
            .map(|p| p.to_f64())
            .filter(|p| *p > 0.0))
    }

    /// Per-lot price of an accepted order: the reported execution price, then
    /// the order state, then the last traded price. Lookup failures only log.
    async fn fill_price(
        &self,
        instrument_id: &str,
        response: &PostOrderResponse,
        order_id: &str,
    ) -> Option<f64> {
        let lot = match self.lot_size(instrument_id).await {
            Ok(lot) => lot as f64,
            Err(e) => {
                tracing::warn!("Lot size lookup after order {} failed: {}", order_id, e);
                return None;
            }
        };

        let executed = response
            .executed_order_price
            .as_ref()
            .map(MoneyValue::to_f64)
            .filter(|p| *p > 0.0);
        let share_price = match executed {
            Some(price) => Some(price),
            None => match self.order_average_price(order_id).await {
                Ok(price) => price,
                Err(e) => {
                    tracing::warn!("Order state lookup for {} failed: {}", order_id, e);
                    None
                }
            },
        };
        if let Some(price) = share_price {
            return Some(price * lot);
        }

        match self.last_price(instrument_id).await {
            Ok(Some(price)) => {
                tracing::warn!("No fill price for order {}, using last price {:.2}", order_id, price);
                Some(price)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("Last price lookup after order {} failed: {}", order_id, e);
                None
            }
        }
    }
}

#[async_trait]
impl Broker for InvestClient {
    async fn last_price(&self, instrument_id: &str) -> Result<Option<f64>, BrokerError> {
        let response: LastPricesResponse = self
            .call(
                "MarketDataService/GetLastPrices",
                &json!({ "figi": [instrument_id] }),
            )
            .await?;

        let share_price = response
            .last_prices
            .into_iter()
            .find(|p| p.figi.is_empty() || p.figi == instrument_id)
            .and_then(|p| p.price)
            .map(Quotation::to_f64)
            .filter(|p| *p > 0.0);

        match share_price {
            Some(price) => Ok(Some(price * self.lot_size(instrument_id).await? as f64)),
            None => Ok(None),
        }
    }

    async fn recent_closes(
        &self,
        instrument_id: &str,
        window_minutes: u64,
    ) -> Result<Vec<f64>, BrokerError> {
        let now = Utc::now();
        let from = now - ChronoDuration::minutes(window_minutes as i64);

        let response: CandlesResponse = self
            .call(
                "MarketDataService/GetCandles",
                &json!({
                    "figi": instrument_id,
                    "from": timestamp(from),
                    "to": timestamp(now),
                    "interval": self.candle_interval,
                }),
            )
            .await?;

        Ok(response.candles.into_iter().map(|c| c.close.to_f64()).collect())
    }

    async fn balance(&self) -> Result<f64, BrokerError> {
        let response: WithdrawLimitsResponse = self
            .call(
                "OperationsService/GetWithdrawLimits",
                &json!({ "accountId": self.account_id }),
            )
            .await?;

        Ok(response
            .money
            .iter()
            .find(|m| m.currency.eq_ignore_ascii_case(&self.currency))
            .map(MoneyValue::to_f64)
            .unwrap_or(0.0))
    }

    async fn held_quantity(&self, instrument_id: &str) -> Result<u64, BrokerError> {
        let Some(position) = self.position(instrument_id).await? else {
            return Ok(0);
        };

        let lots = match position.quantity_lots {
            Some(lots) => lots.to_f64(),
            None => position.quantity.to_f64() / self.lot_size(instrument_id).await? as f64,
        };

        Ok(lots.max(0.0).floor() as u64)
    }

    async fn average_position_price(
        &self,
        instrument_id: &str,
    ) -> Result<Option<f64>, BrokerError> {
        let share_price = self
            .position(instrument_id)
            .await?
            .and_then(|p| p.average_position_price)
            .map(|p| p.to_f64())
            .filter(|p| *p > 0.0);

        match share_price {
            Some(price) => Ok(Some(price * self.lot_size(instrument_id).await? as f64)),
            None => Ok(None),
        }
    }

    fn is_market_open(&self, now: DateTime<Utc>) -> bool {
        self.market_hours.is_open(now)
    }

    async fn submit_market_order(
        &self,
        instrument_id: &str,
        quantity: u64,
        side: TradeSide,
    ) -> Result<f64, OrderError> {
        if quantity == 0 {
            return Err(OrderError::InvalidQuantity(quantity));
        }

        let order_id = uuid::Uuid::new_v4().to_string();
        let direction = match side {
            TradeSide::Buy => "ORDER_DIRECTION_BUY",
            TradeSide::Sell => "ORDER_DIRECTION_SELL",
        };

        tracing::info!(
            "Submitting market {} of {} lots of {} (order {})",
            side,
            quantity,
            instrument_id,
            order_id
        );

        // Never retried: a blind resubmit could double the position
        let response: PostOrderResponse = match self
            .call_once(
                "OrdersService/PostOrder",
                &json!({
                    "figi": instrument_id,
                    "quantity": quantity.to_string(),
                    "direction": direction,
                    "accountId": self.account_id,
                    "orderType": "ORDER_TYPE_MARKET",
                    "orderId": order_id,
                }),
            )
            .await
        {
            Ok(response) => response,
            Err(BrokerError::Api { status, message }) if status < 500 && status != 429 => {
                return Err(OrderError::Rejected(message));
            }
            Err(e) => return Err(e.into()),
        };

        if response.execution_report_status == "EXECUTION_REPORT_STATUS_REJECTED" {
            return Err(OrderError::Rejected(format!(
                "order {} rejected by exchange",
                response.order_id
            )));
        }

        let lookup_id = if response.order_id.is_empty() {
            order_id.clone()
        } else {
            response.order_id.clone()
        };

        // The order is live from here on: lookup failures never surface as errors
        match self.fill_price(instrument_id, &response, &lookup_id).await {
            Some(fill) => {
                tracing::info!("✓ {} {} lots of {} filled at {:.2}", side, quantity, instrument_id, fill);
                Ok(fill)
            }
            None if side == TradeSide::Sell => {
                tracing::warn!(
                    "✓ {} {} lots of {} executed, fill price unknown",
                    side,
                    quantity,
                    instrument_id
                );
                Ok(0.0)
            }
            None => {
                tracing::warn!(
                    "{} {} lots of {} executed (order {}) without any price to record",
                    side,
                    quantity,
                    instrument_id,
                    lookup_id
                );
                Err(OrderError::MissingFillPrice)
            }
        }
    }

    async fn daily_profit(&self) -> Result<f64, BrokerError> {
        // Payments are signed: buys negative, sells positive
        Ok(self
            .operations_today()
            .await?
            .iter()
            .filter(|op| {
                op.operation_type == "OPERATION_TYPE_BUY"
                    || op.operation_type == "OPERATION_TYPE_SELL"
            })
            .filter_map(|op| op.payment.as_ref())
            .map(MoneyValue::to_f64)
            .sum())
    }

    async fn transactions_today(&self) -> Result<usize, BrokerError> {
        Ok(self.operations_today().await?.len())
    }
}

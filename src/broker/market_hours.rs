use crate::config::MarketHoursConfig;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc, Weekday};

/// Weekday trading session in exchange-local time, bounds inclusive
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarketHours {
    offset: FixedOffset,
    open: NaiveTime,
    close: NaiveTime,
}

impl MarketHours {
    pub fn new(offset: FixedOffset, open: NaiveTime, close: NaiveTime) -> Self {
        Self {
            offset,
            open,
            close,
        }
    }

    pub fn from_config(config: &MarketHoursConfig) -> Result<Self> {
        let offset = FixedOffset::east_opt(config.utc_offset_hours * 3600)
            .with_context(|| format!("Invalid UTC offset: {}h", config.utc_offset_hours))?;
        let open = NaiveTime::parse_from_str(&config.open, "%H:%M")
            .with_context(|| format!("Invalid market open time: {}", config.open))?;
        let close = NaiveTime::parse_from_str(&config.close, "%H:%M")
            .with_context(|| format!("Invalid market close time: {}", config.close))?;

        anyhow::ensure!(open < close, "Market must open before it closes");

        Ok(Self::new(offset, open, close))
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        let local = now.with_timezone(&self.offset);
        let weekday = !matches!(local.weekday(), Weekday::Sat | Weekday::Sun);
        let time = local.time();

        weekday && self.open <= time && time <= self.close
    }
}

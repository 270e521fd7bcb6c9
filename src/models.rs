//! Canonical domain types flowing through the pipeline: `Trade` and `Candle`.

use chrono::{DateTime, Timelike, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exchange {
    Kalshi,
    Polymarket,
}

impl Exchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Kalshi => "kalshi",
            Exchange::Polymarket => "polymarket",
        }
    }
}

impl std::str::FromStr for Exchange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kalshi" => Ok(Exchange::Kalshi),
            "polymarket" => Ok(Exchange::Polymarket),
            other => Err(format!("unknown exchange: {other}")),
        }
    }
}

impl std::fmt::Display for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Side::Buy),
            "sell" => Ok(Side::Sell),
            other => Err(format!("unknown side: {other}")),
        }
    }
}

/// Candle resolution. Ordered `1s < 1m < 1h` because that is the bucketing
/// granularity, finest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Interval {
    #[serde(rename = "1s")]
    OneSecond,
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "1h")]
    OneHour,
}

impl Interval {
    pub const ALL: [Interval; 3] = [Interval::OneSecond, Interval::OneMinute, Interval::OneHour];

    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::OneSecond => "1s",
            Interval::OneMinute => "1m",
            Interval::OneHour => "1h",
        }
    }

    /// Truncates a UTC instant to this interval's bucket left edge.
    ///
    /// Operates on the UTC instant directly (never on a locally-zoned
    /// representation) so the bucket boundary is independent of the
    /// process timezone.
    pub fn truncate(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Interval::OneSecond => ts.with_nanosecond(0).unwrap_or(ts),
            Interval::OneMinute => ts
                .with_second(0)
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(ts),
            Interval::OneHour => ts
                .with_minute(0)
                .and_then(|t| t.with_second(0))
                .and_then(|t| t.with_nanosecond(0))
                .unwrap_or(ts),
        }
    }
}

impl std::str::FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1s" => Ok(Interval::OneSecond),
            "1m" => Ok(Interval::OneMinute),
            "1h" => Ok(Interval::OneHour),
            other => Err(format!("unknown interval: {other}")),
        }
    }
}

/// The canonical unit flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub id: Option<i64>,
    pub exchange: Exchange,
    pub market_id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub side: Side,
    pub timestamp: DateTime<Utc>,
    pub tx_hash: Option<String>,
    /// Exchange-specific uniqueness key: Polymarket `(tx_hash, log_index)`,
    /// Kalshi `(market_id, upstream_trade_id)`, collapsed into one string.
    pub dedupe_key: String,
}

impl Trade {
    pub fn polymarket_dedupe_key(tx_hash: &str, log_index: u64) -> String {
        format!("{tx_hash}:{log_index}")
    }

    pub fn kalshi_dedupe_key(market_id: &str, upstream_trade_id: &str) -> String {
        format!("{market_id}:{upstream_trade_id}")
    }
}

/// An OHLCV bucket, keyed by `(exchange, market_id, interval, open_time)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub exchange: Exchange,
    pub market_id: String,
    pub interval: Interval,
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    /// Timestamp of the trade that last set `close`, used to enforce strict
    /// latest-by-timestamp close semantics across concurrent upserts.
    pub close_time: DateTime<Utc>,
    pub volume: Decimal,
}

impl Candle {
    pub fn invariants_hold(&self) -> bool {
        self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
            && self.volume >= Decimal::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[test]
    fn truncate_is_utc_only() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 56).unwrap() + chrono::Duration::milliseconds(789);
        assert_eq!(
            Interval::OneSecond.truncate(ts),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 56).unwrap()
        );
        assert_eq!(
            Interval::OneMinute.truncate(ts),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 34, 0).unwrap()
        );
        assert_eq!(
            Interval::OneHour.truncate(ts),
            Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn candle_invariants() {
        let ts = Utc::now();
        let c = Candle {
            exchange: Exchange::Kalshi,
            market_id: "M".into(),
            interval: Interval::OneMinute,
            open_time: ts,
            open: dec!(0.5),
            high: dec!(0.6),
            low: dec!(0.45),
            close: dec!(0.55),
            close_time: ts,
            volume: dec!(10),
        };
        assert!(c.invariants_hold());
    }

    #[test]
    fn dedupe_keys_are_stable() {
        assert_eq!(Trade::polymarket_dedupe_key("0xabc", 3), "0xabc:3");
        assert_eq!(Trade::kalshi_dedupe_key("M", "t1"), "M:t1");
    }
}

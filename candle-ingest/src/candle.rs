use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Candle aggregation intervals accepted on the wire.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Interval {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    FourHours,
    OneDay,
}

impl Interval {
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::OneMinute => "1m",
            Interval::FiveMinutes => "5m",
            Interval::FifteenMinutes => "15m",
            Interval::ThirtyMinutes => "30m",
            Interval::OneHour => "1h",
            Interval::FourHours => "4h",
            Interval::OneDay => "1d",
        }
    }
}

/// Allow casting `Interval` from the wire representation.
impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Interval::OneMinute),
            "5m" => Ok(Interval::FiveMinutes),
            "15m" => Ok(Interval::FifteenMinutes),
            "30m" => Ok(Interval::ThirtyMinutes),
            "1h" => Ok(Interval::OneHour),
            "4h" => Ok(Interval::FourHours),
            "1d" => Ok(Interval::OneDay),
            invalid => Err(format!("{} is not a valid interval", invalid)),
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A validated OHLCV candle, ready for upsert. `(symbol, interval,
/// open_time)` is the store's primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub symbol: String,
    pub interval: Interval,
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trade_count: i64,
    pub ingest_time: DateTime<Utc>,
}

/// Raw candle payload as it arrives from the broker.
#[derive(Deserialize, Debug)]
struct CandlePayload {
    symbol: String,
    interval: String,
    /// Milliseconds since the UNIX epoch.
    open_time: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
    trade_count: i64,
}

/// Outcome of deriving a candle from a record. Poison is a data path, not
/// an error path: the record is excluded from the write but its offset is
/// still committed so the partition keeps making progress.
#[derive(Debug, Clone, PartialEq)]
pub enum CandleOutcome {
    Valid(Candle),
    Poison {
        partition: i32,
        offset: i64,
        reason: String,
    },
}

impl CandleOutcome {
    fn poison(partition: i32, offset: i64, reason: impl Into<String>) -> Self {
        CandleOutcome::Poison {
            partition,
            offset,
            reason: reason.into(),
        }
    }
}

/// Decode and validate one record payload.
///
/// Validation rules: key fields present and well-formed, all numeric values
/// finite, and `low <= open <= high`, `low <= close <= high`.
pub fn outcome_for(partition: i32, offset: i64, payload: &[u8]) -> CandleOutcome {
    let payload: CandlePayload = match serde_json::from_slice(payload) {
        Ok(payload) => payload,
        Err(err) => {
            return CandleOutcome::poison(partition, offset, format!("undecodable payload: {err}"))
        }
    };

    if payload.symbol.trim().is_empty() {
        return CandleOutcome::poison(partition, offset, "empty symbol");
    }

    let interval = match Interval::from_str(&payload.interval) {
        Ok(interval) => interval,
        Err(reason) => return CandleOutcome::poison(partition, offset, reason),
    };

    let Some(open_time) = DateTime::from_timestamp_millis(payload.open_time) else {
        return CandleOutcome::poison(
            partition,
            offset,
            format!("open_time {} out of range", payload.open_time),
        );
    };

    let values = [
        payload.open,
        payload.high,
        payload.low,
        payload.close,
        payload.volume,
    ];
    if values.iter().any(|v| !v.is_finite()) {
        return CandleOutcome::poison(partition, offset, "non-finite price or volume");
    }

    if payload.low > payload.high
        || payload.open < payload.low
        || payload.open > payload.high
        || payload.close < payload.low
        || payload.close > payload.high
    {
        return CandleOutcome::poison(
            partition,
            offset,
            format!(
                "inconsistent ohlc: open={} high={} low={} close={}",
                payload.open, payload.high, payload.low, payload.close
            ),
        );
    }

    if payload.volume < 0.0 || payload.trade_count < 0 {
        return CandleOutcome::poison(partition, offset, "negative volume or trade count");
    }

    CandleOutcome::Valid(Candle {
        symbol: payload.symbol,
        interval,
        open_time,
        open: payload.open,
        high: payload.high,
        low: payload.low,
        close: payload.close,
        volume: payload.volume,
        trade_count: payload.trade_count,
        ingest_time: Utc::now(),
    })
}

/// Well-formed candle payload for tests across the crate.
#[cfg(test)]
pub(crate) fn sample_payload(symbol: &str, interval: &str, ohlc: [f64; 4]) -> Vec<u8> {
    serde_json::to_vec(&serde_json::json!({
        "symbol": symbol,
        "interval": interval,
        "open_time": 1_717_171_200_000_i64,
        "open": ohlc[0],
        "high": ohlc[1],
        "low": ohlc[2],
        "close": ohlc[3],
        "volume": 12.5,
        "trade_count": 42,
    }))
    .unwrap()
}

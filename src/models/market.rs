//! Core futures market-data records.
//!
//! Records are decoded once at the exchange boundary and flow through the
//! pipeline as owned values. Monetary fields use `Decimal` so USD notionals
//! up to 10^12 keep 8 fractional digits end to end. All timestamps are UTC
//! instants with millisecond precision.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Taker side of a forced order. BUY closes a short, SELL closes a long
/// (pass-through from the exchange).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUY" => Ok(Side::Buy),
            "SELL" => Ok(Side::Sell),
            other => Err(format!("invalid side: {other}")),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Order-book side for flattened snapshot rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookSide {
    Bid,
    Ask,
}

impl BookSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookSide::Bid => "BID",
            BookSide::Ask => "ASK",
        }
    }
}

impl FromStr for BookSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BID" => Ok(BookSide::Bid),
            "ASK" => Ok(BookSide::Ask),
            other => Err(format!("invalid book side: {other}")),
        }
    }
}

/// One OHLCV candle. Unique per (open_time, symbol, timeframe); a closed
/// candle is immutable for practical purposes but re-submission replaces it,
/// and an in-progress candle is rewritten on the next pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: String,
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub quote_volume: Decimal,
    pub trades: i64,
    pub taker_buy_base: Decimal,
    pub taker_buy_quote: Decimal,
    pub is_closed: bool,
}

impl Candle {
    /// Uniqueness key within a batch.
    pub fn key(&self) -> (i64, String, String) {
        (
            self.open_time.timestamp_millis(),
            self.symbol.clone(),
            self.timeframe.clone(),
        )
    }

    /// low <= min(open, close) <= max(open, close) <= high, all non-negative.
    pub fn ohlc_consistent(&self) -> bool {
        self.low >= Decimal::ZERO
            && self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high
            && self.low <= self.high
    }
}

/// Open-interest sample, unique per (time, symbol, period).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenInterest {
    pub symbol: String,
    pub period: String,
    pub time: DateTime<Utc>,
    pub open_interest: Decimal,
    pub open_interest_value: Decimal,
}

/// Funding event, unique per (funding_time, symbol). Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingRate {
    pub symbol: String,
    pub funding_time: DateTime<Utc>,
    pub funding_rate: Decimal,
    pub mark_price: Option<Decimal>,
}

/// Forced liquidation order. `order_id` is unique; duplicates are dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Liquidation {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub price: Decimal,
    pub quantity: Decimal,
    pub time: DateTime<Utc>,
}

/// Top-trader long/short accounts ratio, unique per (time, symbol, period).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongShortRatio {
    pub symbol: String,
    pub period: String,
    pub time: DateTime<Utc>,
    pub long_short_ratio: Decimal,
    pub long_account: Decimal,
    pub short_account: Decimal,
}

/// One price level of a depth snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

/// Full depth snapshot at one instant. Bids are sorted descending by price,
/// asks ascending, as delivered by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub symbol: String,
    pub time: DateTime<Utc>,
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    pub fn spread(&self) -> Option<Decimal> {
        Some(self.best_ask()? - self.best_bid()?)
    }

    pub fn mid_price(&self) -> Option<Decimal> {
        Some((self.best_bid()? + self.best_ask()?) / Decimal::TWO)
    }

    /// Spread in basis points of the mid price.
    pub fn spread_bps(&self) -> Option<Decimal> {
        let mid = self.mid_price()?;
        if mid <= Decimal::ZERO {
            return None;
        }
        Some(self.spread()? / mid * Decimal::from(10_000))
    }

    /// A book is crossed when the best bid meets or exceeds the best ask.
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    /// Flattens the snapshot into (side, level, price, quantity) rows,
    /// level-indexed from 0 at the top of each side.
    pub fn rows(&self) -> Vec<(BookSide, i32, Decimal, Decimal)> {
        let bids = self
            .bids
            .iter()
            .enumerate()
            .map(|(i, l)| (BookSide::Bid, i as i32, l.price, l.quantity));
        let asks = self
            .asks
            .iter()
            .enumerate()
            .map(|(i, l)| (BookSide::Ask, i as i32, l.price, l.quantity));
        bids.chain(asks).collect()
    }
}

/// Mark-price update from the WebSocket stream. Carries the in-window
/// funding rate and the time the next funding applies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkPrice {
    pub symbol: String,
    pub time: DateTime<Utc>,
    pub mark_price: Decimal,
    pub funding_rate: Option<Decimal>,
    pub next_funding_time: Option<DateTime<Utc>>,
}

/// Version row appended after each completed backfill window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataVersion {
    pub table_name: String,
    pub symbol: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub record_count: i64,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

/// Typed event produced by the WebSocket subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamEvent {
    Candle(Candle),
    MarkPrice(MarkPrice),
    Liquidation(Liquidation),
}

impl StreamEvent {
    pub fn symbol(&self) -> &str {
        match self {
            StreamEvent::Candle(c) => &c.symbol,
            StreamEvent::MarkPrice(m) => &m.symbol,
            StreamEvent::Liquidation(l) => &l.symbol,
        }
    }

    /// Cache key prefix and batch bucket for this event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Candle(_) => "kline",
            StreamEvent::MarkPrice(_) => "mark_price",
            StreamEvent::Liquidation(_) => "liquidation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn sample_book() -> OrderBookSnapshot {
        OrderBookSnapshot {
            symbol: "SOL/USDT".to_string(),
            time: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            bids: vec![
                BookLevel { price: dec!(100.00), quantity: dec!(1000) },
                BookLevel { price: dec!(99.95), quantity: dec!(500) },
            ],
            asks: vec![
                BookLevel { price: dec!(100.05), quantity: dec!(800) },
                BookLevel { price: dec!(100.10), quantity: dec!(600) },
            ],
        }
    }

    #[test]
    fn test_book_aggregates() {
        let book = sample_book();
        assert_eq!(book.best_bid().unwrap(), dec!(100.00));
        assert_eq!(book.best_ask().unwrap(), dec!(100.05));
        assert_eq!(book.spread().unwrap(), dec!(0.05));
        assert_eq!(book.mid_price().unwrap(), dec!(100.025));

        let bps = book.spread_bps().unwrap();
        let expected = dec!(0.05) / dec!(100.025) * dec!(10000);
        assert_eq!(bps, expected);
        assert!(!book.is_crossed());
    }

    #[test]
    fn test_book_rows_flatten_both_sides() {
        let rows = sample_book().rows();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0], (BookSide::Bid, 0, dec!(100.00), dec!(1000)));
        assert_eq!(rows[2], (BookSide::Ask, 0, dec!(100.05), dec!(800)));
    }

    #[test]
    fn test_ohlc_consistency() {
        let mut candle = Candle {
            symbol: "SOL/USDT".into(),
            timeframe: "5m".into(),
            open_time: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            open: dec!(10),
            high: dec!(12),
            low: dec!(9),
            close: dec!(11),
            volume: dec!(100),
            quote_volume: dec!(1000),
            trades: 42,
            taker_buy_base: dec!(50),
            taker_buy_quote: dec!(500),
            is_closed: true,
        };
        assert!(candle.ohlc_consistent());

        candle.high = dec!(5);
        assert!(!candle.ohlc_consistent());
    }

    #[test]
    fn test_side_round_trip() {
        assert_eq!("BUY".parse::<Side>().unwrap(), Side::Buy);
        assert_eq!(Side::Sell.as_str(), "SELL");
        assert!("HOLD".parse::<Side>().is_err());
    }
}

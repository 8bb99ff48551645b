//! Pure, stateless batch validation applied before storage hand-off.
//!
//! Missing required fields are impossible past the wire boundary (records
//! are fully typed), so the checks here are semantic. Fatal findings reject
//! the whole batch; non-fatal findings are logged and the batch is written
//! anyway.

use rust_decimal::Decimal;
use std::collections::HashSet;

use crate::models::{Candle, FundingRate, Liquidation, LongShortRatio, OpenInterest, OrderBookSnapshot};
use crate::utils::time::interval_duration;

/// Non-fatal warning threshold for one-step price returns.
fn max_price_return() -> Decimal {
    // 10%
    Decimal::new(10, 2)
}

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub fatal: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_fatal(&self) -> bool {
        !self.fatal.is_empty()
    }

    fn fatal(&mut self, message: String) {
        self.fatal.push(message);
    }

    fn warn(&mut self, message: String) {
        self.warnings.push(message);
    }
}

/// low <= min(open, close), max(open, close) <= high, everything >= 0.
pub fn valid_ohlc(candle: &Candle) -> bool {
    candle.ohlc_consistent() && candle.volume >= Decimal::ZERO
}

pub fn check_candles(batch: &[Candle]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut seen = HashSet::new();

    for candle in batch {
        if !valid_ohlc(candle) {
            report.fatal(format!(
                "ohlc inequality violated at {} ({}/{})",
                candle.open_time, candle.symbol, candle.timeframe
            ));
        }
        if !seen.insert(candle.key()) {
            report.fatal(format!(
                "duplicate candle key at {} ({}/{})",
                candle.open_time, candle.symbol, candle.timeframe
            ));
        }
    }

    // Continuity and return checks compare neighbors within one stream;
    // batches are per (symbol, timeframe) so plain adjacency works.
    for pair in batch.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if let Ok(step) = interval_duration(&next.timeframe) {
            let gap = next.open_time - prev.open_time;
            if gap > step {
                report.warn(format!(
                    "time gap before {}: expected {}s, got {}s",
                    next.open_time,
                    step.num_seconds(),
                    gap.num_seconds()
                ));
            }
        }
        if prev.close > Decimal::ZERO {
            let ret = ((next.close - prev.close) / prev.close).abs();
            if ret > max_price_return() {
                report.warn(format!(
                    "price return {:.4} exceeds threshold at {}",
                    ret, next.open_time
                ));
            }
        }
    }
    report
}

pub fn check_open_interest(batch: &[OpenInterest]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut seen = HashSet::new();
    for sample in batch {
        if sample.open_interest <= Decimal::ZERO {
            report.fatal(format!(
                "non-positive open interest at {} ({})",
                sample.time, sample.symbol
            ));
        }
        let key = (sample.time.timestamp_millis(), sample.symbol.clone(), sample.period.clone());
        if !seen.insert(key) {
            report.fatal(format!("duplicate open interest key at {}", sample.time));
        }
    }
    report
}

pub fn check_funding_rates(batch: &[FundingRate]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut seen = HashSet::new();
    for event in batch {
        let key = (event.funding_time.timestamp_millis(), event.symbol.clone());
        if !seen.insert(key) {
            report.fatal(format!("duplicate funding key at {}", event.funding_time));
        }
    }
    report
}

pub fn check_liquidations(batch: &[Liquidation]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut seen = HashSet::new();
    for order in batch {
        if order.price <= Decimal::ZERO || order.quantity <= Decimal::ZERO {
            report.fatal(format!("non-positive liquidation fields for {}", order.order_id));
        }
        if !seen.insert(order.order_id.clone()) {
            report.fatal(format!("duplicate order id {}", order.order_id));
        }
    }
    report
}

pub fn check_long_short_ratios(batch: &[LongShortRatio]) -> ValidationReport {
    let mut report = ValidationReport::default();
    let mut seen = HashSet::new();
    for sample in batch {
        if sample.long_short_ratio < Decimal::ZERO
            || sample.long_account < Decimal::ZERO
            || sample.short_account < Decimal::ZERO
        {
            report.fatal(format!("negative ratio fields at {}", sample.time));
        }
        let key = (sample.time.timestamp_millis(), sample.symbol.clone(), sample.period.clone());
        if !seen.insert(key) {
            report.fatal(format!("duplicate ratio key at {}", sample.time));
        }
    }
    report
}

pub fn check_order_book(snapshot: &OrderBookSnapshot) -> ValidationReport {
    let mut report = ValidationReport::default();
    if snapshot.bids.is_empty() && snapshot.asks.is_empty() {
        report.fatal("empty order book snapshot".to_string());
    }
    if snapshot.is_crossed() {
        report.fatal(format!("crossed book at {}", snapshot.time));
    }
    for level in snapshot.bids.iter().chain(&snapshot.asks) {
        if level.price <= Decimal::ZERO || level.quantity < Decimal::ZERO {
            report.fatal(format!("invalid level at {}", snapshot.time));
            break;
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;
    use test_case::test_case;

    fn candle(ts_ms: i64, open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        Candle {
            symbol: "SOL/USDT".into(),
            timeframe: "5m".into(),
            open_time: Utc.timestamp_millis_opt(ts_ms).unwrap(),
            open,
            high,
            low,
            close,
            volume: dec!(100),
            quote_volume: dec!(1000),
            trades: 10,
            taker_buy_base: dec!(50),
            taker_buy_quote: dec!(500),
            is_closed: true,
        }
    }

    #[test_case(dec!(10), dec!(12), dec!(9), dec!(11), true; "well formed")]
    #[test_case(dec!(10), dec!(5), dec!(6), dec!(7), false; "high below open")]
    #[test_case(dec!(10), dec!(12), dec!(11), dec!(11), false; "low above open")]
    #[test_case(dec!(10), dec!(10), dec!(10), dec!(10), true; "flat candle")]
    fn test_valid_ohlc(open: Decimal, high: Decimal, low: Decimal, close: Decimal, expected: bool) {
        assert_eq!(valid_ohlc(&candle(1_700_000_000_000, open, high, low, close)), expected);
    }

    #[test]
    fn test_bad_ohlc_is_fatal() {
        let batch = vec![candle(1_700_000_000_000, dec!(10), dec!(5), dec!(6), dec!(7))];
        let report = check_candles(&batch);
        assert!(report.is_fatal());
    }

    #[test]
    fn test_duplicate_key_is_fatal() {
        let batch = vec![
            candle(1_700_000_000_000, dec!(10), dec!(12), dec!(9), dec!(11)),
            candle(1_700_000_000_000, dec!(11), dec!(13), dec!(10), dec!(12)),
        ];
        assert!(check_candles(&batch).is_fatal());
    }

    #[test]
    fn test_gap_and_large_return_warn_but_pass() {
        let batch = vec![
            candle(1_700_000_000_000, dec!(10), dec!(12), dec!(9), dec!(10)),
            // One candle missing (gap) and a 50% jump.
            candle(1_700_000_600_000, dec!(15), dec!(16), dec!(14), dec!(15)),
        ];
        let report = check_candles(&batch);
        assert!(!report.is_fatal());
        assert_eq!(report.warnings.len(), 2);
    }

    #[test]
    fn test_contiguous_batch_is_clean() {
        let batch = vec![
            candle(1_700_000_000_000, dec!(10), dec!(12), dec!(9), dec!(10)),
            candle(1_700_000_300_000, dec!(10), dec!(11), dec!(9), dec!(10.5)),
        ];
        let report = check_candles(&batch);
        assert!(!report.is_fatal());
        assert!(report.warnings.is_empty());
    }

    #[test]
    fn test_non_positive_open_interest_is_fatal() {
        let sample = OpenInterest {
            symbol: "SOL/USDT".into(),
            period: "5m".into(),
            time: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            open_interest: dec!(0),
            open_interest_value: dec!(0),
        };
        assert!(check_open_interest(&[sample]).is_fatal());
    }

    #[test]
    fn test_crossed_book_is_fatal() {
        use crate::models::BookLevel;
        let snapshot = OrderBookSnapshot {
            symbol: "SOL/USDT".into(),
            time: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
            bids: vec![BookLevel { price: dec!(101), quantity: dec!(1) }],
            asks: vec![BookLevel { price: dec!(100), quantity: dec!(1) }],
        };
        assert!(check_order_book(&snapshot).is_fatal());
    }
}

//! Property-based checks over the validator's OHLC acceptance rule.

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use rust_decimal::Decimal;

use futures_data_collector::models::Candle;
use futures_data_collector::validator::{check_candles, valid_ohlc};

fn candle_with(open: f64, high: f64, low: f64, close: f64) -> Candle {
    let d = |v: f64| Decimal::try_from(v).unwrap_or_default();
    Candle {
        symbol: "SOL/USDT".to_string(),
        timeframe: "5m".to_string(),
        open_time: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        open: d(open),
        high: d(high),
        low: d(low),
        close: d(close),
        volume: d(1000.0),
        quote_volume: d(10_500.0),
        trades: 42,
        taker_buy_base: d(500.0),
        taker_buy_quote: d(5250.0),
        is_closed: true,
    }
}

proptest! {
    /// Any candle the validator accepts satisfies the OHLC ordering.
    #[test]
    fn accepted_candles_satisfy_ohlc_ordering(
        open in 0.0001f64..10_000.0,
        close in 0.0001f64..10_000.0,
        high_pad in 0.0f64..1_000.0,
        low_cut in 0.0f64..1.0,
    ) {
        let high = open.max(close) + high_pad;
        let low = open.min(close) * (1.0 - low_cut);
        let candle = candle_with(open, high, low, close);

        prop_assert!(valid_ohlc(&candle));
        let report = check_candles(&[candle.clone()]);
        prop_assert!(!report.is_fatal());
        prop_assert!(candle.low <= candle.open && candle.open <= candle.high);
        prop_assert!(candle.low <= candle.close && candle.close <= candle.high);
        prop_assert!(candle.low <= candle.high);
    }

    /// A high strictly below the body is always rejected.
    #[test]
    fn broken_high_is_always_rejected(
        open in 1.0f64..10_000.0,
        shrink in 0.01f64..0.99,
    ) {
        let close = open;
        let high = open * shrink.min(0.99);
        let low = high * 0.5;
        let candle = candle_with(open, high, low, close);
        prop_assert!(!valid_ohlc(&candle));
        prop_assert!(check_candles(&[candle]).is_fatal());
    }
}

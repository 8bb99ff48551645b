//! Wire-format decoding for the exchange REST and WebSocket payloads.
//!
//! All decoding happens here, once, at the boundary. REST klines arrive as
//! positional arrays; the remaining resources are JSON objects. WebSocket
//! messages are `{stream, data}` envelopes over per-event objects.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{IngestError, Result};
use crate::models::{
    BookLevel, Candle, FundingRate, Liquidation, LongShortRatio, MarkPrice, OpenInterest,
    OrderBookSnapshot, Side, StreamEvent,
};
use crate::utils::time::ms_to_datetime;

fn ms(field: &str, value: i64) -> Result<DateTime<Utc>> {
    ms_to_datetime(value).map_err(|_| IngestError::Malformed(format!("{field}: bad timestamp {value}")))
}

/// Accepts a decimal string, a number, an empty string, or null.
fn de_opt_decimal<'de, D>(deserializer: D) -> std::result::Result<Option<Decimal>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<Value> = Option::deserialize(deserializer)?;
    match raw {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(other) => serde_json::from_value::<Decimal>(other)
            .map(Some)
            .map_err(serde::de::Error::custom),
    }
}

// Positional kline row: open time, O, H, L, C, volume, close time,
// quote volume, trade count, taker buy base, taker buy quote, ignored.
type RawKline = (
    i64,
    Decimal,
    Decimal,
    Decimal,
    Decimal,
    Decimal,
    i64,
    Decimal,
    i64,
    Decimal,
    Decimal,
    Value,
);

pub fn parse_klines(
    value: Value,
    symbol: &str,
    timeframe: &str,
    now: DateTime<Utc>,
) -> Result<Vec<Candle>> {
    let rows: Vec<RawKline> = serde_json::from_value(value)?;
    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        let close_time = ms("kline.close_time", row.6)?;
        candles.push(Candle {
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            open_time: ms("kline.open_time", row.0)?,
            open: row.1,
            high: row.2,
            low: row.3,
            close: row.4,
            volume: row.5,
            quote_volume: row.7,
            trades: row.8,
            taker_buy_base: row.9,
            taker_buy_quote: row.10,
            is_closed: close_time <= now,
        });
    }
    candles.sort_by_key(|c| c.open_time);
    Ok(candles)
}

#[derive(Deserialize)]
struct RawOpenInterest {
    #[serde(rename = "sumOpenInterest")]
    sum_open_interest: Decimal,
    #[serde(rename = "sumOpenInterestValue")]
    sum_open_interest_value: Decimal,
    timestamp: i64,
}

pub fn parse_open_interest(value: Value, symbol: &str, period: &str) -> Result<Vec<OpenInterest>> {
    let rows: Vec<RawOpenInterest> = serde_json::from_value(value)?;
    let mut samples = rows
        .into_iter()
        .map(|row| {
            Ok(OpenInterest {
                symbol: symbol.to_string(),
                period: period.to_string(),
                time: ms("openInterest.timestamp", row.timestamp)?,
                open_interest: row.sum_open_interest,
                open_interest_value: row.sum_open_interest_value,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    samples.sort_by_key(|s| s.time);
    Ok(samples)
}

#[derive(Deserialize)]
struct RawFundingRate {
    #[serde(rename = "fundingTime")]
    funding_time: i64,
    #[serde(rename = "fundingRate")]
    funding_rate: Decimal,
    #[serde(rename = "markPrice", default, deserialize_with = "de_opt_decimal")]
    mark_price: Option<Decimal>,
}

pub fn parse_funding_rates(value: Value, symbol: &str) -> Result<Vec<FundingRate>> {
    let rows: Vec<RawFundingRate> = serde_json::from_value(value)?;
    let mut events = rows
        .into_iter()
        .map(|row| {
            Ok(FundingRate {
                symbol: symbol.to_string(),
                funding_time: ms("funding.fundingTime", row.funding_time)?,
                funding_rate: row.funding_rate,
                mark_price: row.mark_price,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    events.sort_by_key(|e| e.funding_time);
    Ok(events)
}

#[derive(Deserialize)]
struct RawForceOrder {
    #[serde(rename = "orderId", default)]
    order_id: Option<i64>,
    side: String,
    price: Decimal,
    #[serde(rename = "origQty")]
    orig_qty: Decimal,
    #[serde(rename = "averagePrice", default, deserialize_with = "de_opt_decimal")]
    average_price: Option<Decimal>,
    time: i64,
}

pub fn parse_liquidations(value: Value, symbol: &str) -> Result<Vec<Liquidation>> {
    let rows: Vec<RawForceOrder> = serde_json::from_value(value)?;
    let mut orders = rows
        .into_iter()
        .map(|row| {
            let side: Side = row
                .side
                .parse()
                .map_err(|e: String| IngestError::Malformed(e))?;
            let price = row.average_price.filter(|p| *p > Decimal::ZERO).unwrap_or(row.price);
            Ok(Liquidation {
                order_id: force_order_id(row.order_id, symbol, row.time, price, row.orig_qty),
                symbol: symbol.to_string(),
                side,
                price,
                quantity: row.orig_qty,
                time: ms("forceOrder.time", row.time)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    orders.sort_by_key(|o| o.time);
    Ok(orders)
}

// The exchange does not always surface a numeric order id; when absent the
// id is synthesized from the order's identifying fields so dedup still holds.
fn force_order_id(
    order_id: Option<i64>,
    symbol: &str,
    time: i64,
    price: Decimal,
    quantity: Decimal,
) -> String {
    match order_id {
        Some(id) => id.to_string(),
        None => format!("{symbol}-{time}-{price}-{quantity}"),
    }
}

#[derive(Deserialize)]
struct RawLongShortRatio {
    #[serde(rename = "longShortRatio")]
    long_short_ratio: Decimal,
    #[serde(rename = "longAccount")]
    long_account: Decimal,
    #[serde(rename = "shortAccount")]
    short_account: Decimal,
    timestamp: i64,
}

pub fn parse_long_short_ratios(
    value: Value,
    symbol: &str,
    period: &str,
) -> Result<Vec<LongShortRatio>> {
    let rows: Vec<RawLongShortRatio> = serde_json::from_value(value)?;
    let mut samples = rows
        .into_iter()
        .map(|row| {
            Ok(LongShortRatio {
                symbol: symbol.to_string(),
                period: period.to_string(),
                time: ms("longShortRatio.timestamp", row.timestamp)?,
                long_short_ratio: row.long_short_ratio,
                long_account: row.long_account,
                short_account: row.short_account,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    samples.sort_by_key(|s| s.time);
    Ok(samples)
}

#[derive(Deserialize)]
struct RawDepth {
    #[serde(rename = "E", default)]
    event_time: Option<i64>,
    bids: Vec<(Decimal, Decimal)>,
    asks: Vec<(Decimal, Decimal)>,
}

pub fn parse_order_book(value: Value, symbol: &str, now: DateTime<Utc>) -> Result<OrderBookSnapshot> {
    let raw: RawDepth = serde_json::from_value(value)?;
    let time = match raw.event_time {
        Some(t) => ms("depth.E", t)?,
        None => now,
    };
    let level = |(price, quantity): (Decimal, Decimal)| BookLevel { price, quantity };
    Ok(OrderBookSnapshot {
        symbol: symbol.to_string(),
        time,
        bids: raw.bids.into_iter().map(level).collect(),
        asks: raw.asks.into_iter().map(level).collect(),
    })
}

#[derive(Deserialize)]
struct RawServerTime {
    #[serde(rename = "serverTime")]
    server_time: i64,
}

pub fn parse_server_time(value: Value) -> Result<DateTime<Utc>> {
    let raw: RawServerTime = serde_json::from_value(value)?;
    ms("serverTime", raw.server_time)
}

// ---------------------------------------------------------------------------
// WebSocket envelopes
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct StreamEnvelope {
    #[allow(dead_code)]
    stream: String,
    data: Value,
}

#[derive(Deserialize)]
struct WsKlineEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: WsKline,
}

#[derive(Deserialize)]
struct WsKline {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "i")]
    interval: String,
    #[serde(rename = "o")]
    open: Decimal,
    #[serde(rename = "h")]
    high: Decimal,
    #[serde(rename = "l")]
    low: Decimal,
    #[serde(rename = "c")]
    close: Decimal,
    #[serde(rename = "v")]
    volume: Decimal,
    #[serde(rename = "q")]
    quote_volume: Decimal,
    #[serde(rename = "n")]
    trades: i64,
    #[serde(rename = "x")]
    is_closed: bool,
    #[serde(rename = "V")]
    taker_buy_base: Decimal,
    #[serde(rename = "Q")]
    taker_buy_quote: Decimal,
}

#[derive(Deserialize)]
struct WsMarkPriceEvent {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p")]
    mark_price: Decimal,
    #[serde(rename = "r", default, deserialize_with = "de_opt_decimal")]
    funding_rate: Option<Decimal>,
    #[serde(rename = "T", default)]
    next_funding_time: Option<i64>,
}

#[derive(Deserialize)]
struct WsForceOrderEvent {
    #[serde(rename = "o")]
    order: WsForceOrder,
}

#[derive(Deserialize)]
struct WsForceOrder {
    #[serde(rename = "i", default)]
    order_id: Option<i64>,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "q")]
    quantity: Decimal,
    #[serde(rename = "p")]
    price: Decimal,
    #[serde(rename = "ap", default, deserialize_with = "de_opt_decimal")]
    average_price: Option<Decimal>,
    #[serde(rename = "T")]
    time: i64,
}

/// Decodes one multiplexed WebSocket message into a typed event.
///
/// `canonical_by_exchange` maps exchange symbols ("SOLUSDT") back to the
/// canonical form ("SOL/USDT") the rest of the pipeline uses. Unknown event
/// types yield `Ok(None)` so new upstream streams never break the consumer.
pub fn parse_stream_envelope(
    text: &str,
    canonical_by_exchange: &HashMap<String, String>,
) -> Result<Option<StreamEvent>> {
    let envelope: StreamEnvelope = serde_json::from_str(text)?;
    let event_type = envelope
        .data
        .get("e")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let canonical = |exchange_symbol: &str| {
        canonical_by_exchange
            .get(exchange_symbol)
            .cloned()
            .unwrap_or_else(|| exchange_symbol.to_string())
    };

    match event_type.as_str() {
        "kline" => {
            let event: WsKlineEvent = serde_json::from_value(envelope.data)?;
            let k = event.kline;
            Ok(Some(StreamEvent::Candle(Candle {
                symbol: canonical(&event.symbol),
                timeframe: k.interval,
                open_time: ms("ws.kline.t", k.open_time)?,
                open: k.open,
                high: k.high,
                low: k.low,
                close: k.close,
                volume: k.volume,
                quote_volume: k.quote_volume,
                trades: k.trades,
                taker_buy_base: k.taker_buy_base,
                taker_buy_quote: k.taker_buy_quote,
                is_closed: k.is_closed,
            })))
        }
        "markPriceUpdate" => {
            let event: WsMarkPriceEvent = serde_json::from_value(envelope.data)?;
            Ok(Some(StreamEvent::MarkPrice(MarkPrice {
                symbol: canonical(&event.symbol),
                time: ms("ws.markPrice.E", event.event_time)?,
                mark_price: event.mark_price,
                funding_rate: event.funding_rate,
                next_funding_time: event
                    .next_funding_time
                    .map(|t| ms("ws.markPrice.T", t))
                    .transpose()?,
            })))
        }
        "forceOrder" => {
            let event: WsForceOrderEvent = serde_json::from_value(envelope.data)?;
            let o = event.order;
            let side: Side = o.side.parse().map_err(|e: String| IngestError::Malformed(e))?;
            let price = o.average_price.filter(|p| *p > Decimal::ZERO).unwrap_or(o.price);
            let symbol = canonical(&o.symbol);
            Ok(Some(StreamEvent::Liquidation(Liquidation {
                order_id: force_order_id(o.order_id, &o.symbol, o.time, price, o.quantity),
                symbol,
                side,
                price,
                quantity: o.quantity,
                time: ms("ws.forceOrder.T", o.time)?,
            })))
        }
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_600_000).unwrap()
    }

    #[test]
    fn test_parse_klines_orders_ascending() {
        let value = json!([
            [1700000300000i64, "10.1", "10.5", "10.0", "10.4", "500", 1700000599999i64, "5100", 42, "250", "2550", "0"],
            [1700000000000i64, "10.0", "10.2", "9.9", "10.1", "400", 1700000299999i64, "4040", 30, "200", "2020", "0"]
        ]);
        let candles = parse_klines(value, "SOL/USDT", "5m", now()).unwrap();
        assert_eq!(candles.len(), 2);
        assert!(candles[0].open_time < candles[1].open_time);
        assert_eq!(candles[0].open, dec!(10.0));
        assert_eq!(candles[1].trades, 42);
        assert!(candles[0].is_closed);
    }

    #[test]
    fn test_parse_klines_flags_open_candle() {
        // Close time after "now": candle is still in progress.
        let value = json!([
            [1700000600000i64, "10.4", "10.6", "10.3", "10.5", "100", 1700000899999i64, "1050", 10, "50", "525", "0"]
        ]);
        let candles = parse_klines(value, "SOL/USDT", "5m", now()).unwrap();
        assert!(!candles[0].is_closed);
    }

    #[test]
    fn test_parse_open_interest() {
        let value = json!([
            {"symbol": "SOLUSDT", "sumOpenInterest": "20403.63", "sumOpenInterestValue": "150570784.07", "timestamp": 1700000000000i64}
        ]);
        let samples = parse_open_interest(value, "SOL/USDT", "5m").unwrap();
        assert_eq!(samples[0].open_interest, dec!(20403.63));
        assert_eq!(samples[0].period, "5m");
    }

    #[test]
    fn test_parse_funding_handles_empty_mark_price() {
        let value = json!([
            {"symbol": "SOLUSDT", "fundingTime": 1700000000000i64, "fundingRate": "-0.0001", "markPrice": ""},
            {"symbol": "SOLUSDT", "fundingTime": 1700028800000i64, "fundingRate": "0.0002", "markPrice": "58.75"}
        ]);
        let events = parse_funding_rates(value, "SOL/USDT").unwrap();
        assert_eq!(events[0].mark_price, None);
        assert_eq!(events[1].mark_price, Some(dec!(58.75)));
        assert_eq!(events[0].funding_rate, dec!(-0.0001));
    }

    #[test]
    fn test_parse_liquidations_synthesizes_missing_id() {
        let value = json!([
            {"symbol": "SOLUSDT", "side": "SELL", "price": "58.20", "origQty": "100", "averagePrice": "58.15", "time": 1700000000000i64}
        ]);
        let orders = parse_liquidations(value, "SOL/USDT").unwrap();
        assert_eq!(orders[0].side, Side::Sell);
        assert_eq!(orders[0].price, dec!(58.15));
        assert!(orders[0].order_id.contains("1700000000000"));
    }

    #[test]
    fn test_parse_order_book() {
        let value = json!({
            "lastUpdateId": 99,
            "E": 1700000000000i64,
            "bids": [["100.00", "1000"], ["99.95", "500"]],
            "asks": [["100.05", "800"], ["100.10", "600"]]
        });
        let book = parse_order_book(value, "SOL/USDT", now()).unwrap();
        assert_eq!(book.best_bid().unwrap(), dec!(100.00));
        assert_eq!(book.best_ask().unwrap(), dec!(100.05));
        assert_eq!(book.bids.len(), 2);
    }

    #[test]
    fn test_parse_stream_kline_envelope() {
        let map: HashMap<String, String> =
            [("SOLUSDT".to_string(), "SOL/USDT".to_string())].into();
        let text = json!({
            "stream": "solusdt@kline_5m",
            "data": {
                "e": "kline", "E": 1700000300123i64, "s": "SOLUSDT",
                "k": {
                    "t": 1700000000000i64, "T": 1700000299999i64, "s": "SOLUSDT", "i": "5m",
                    "o": "10.0", "c": "10.1", "h": "10.2", "l": "9.9",
                    "v": "400", "n": 30, "x": true, "q": "4040", "V": "200", "Q": "2020"
                }
            }
        })
        .to_string();

        let event = parse_stream_envelope(&text, &map).unwrap().unwrap();
        match event {
            StreamEvent::Candle(c) => {
                assert_eq!(c.symbol, "SOL/USDT");
                assert!(c.is_closed);
                assert_eq!(c.close, dec!(10.1));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_parse_stream_mark_price_and_unknown() {
        let map = HashMap::new();
        let text = json!({
            "stream": "solusdt@markPrice",
            "data": {"e": "markPriceUpdate", "E": 1700000000000i64, "s": "SOLUSDT",
                     "p": "58.42", "r": "0.0001", "T": 1700028800000i64}
        })
        .to_string();
        let event = parse_stream_envelope(&text, &map).unwrap().unwrap();
        match event {
            StreamEvent::MarkPrice(m) => {
                assert_eq!(m.mark_price, dec!(58.42));
                assert_eq!(m.funding_rate, Some(dec!(0.0001)));
            }
            other => panic!("unexpected event: {other:?}"),
        }

        let unknown = json!({"stream": "x@bookTicker", "data": {"e": "bookTicker"}}).to_string();
        assert!(parse_stream_envelope(&unknown, &map).unwrap().is_none());
    }
}

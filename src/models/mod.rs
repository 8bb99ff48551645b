//! Typed market-data records shared by the exchange client, validator,
//! collectors, and storage drivers.

pub mod market;

pub use market::{
    BookLevel, BookSide, Candle, DataVersion, FundingRate, Liquidation, LongShortRatio,
    MarkPrice, OpenInterest, OrderBookSnapshot, Side, StreamEvent,
};

//! Binance spot market-data provider: REST klines and the kline WebSocket.

pub mod client;
pub mod rate_limit;
pub mod stream;

pub use client::BinanceClient;
pub use stream::BinanceFeed;

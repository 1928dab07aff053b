pub mod history;
pub mod kline;

pub use history::HistoryCache;

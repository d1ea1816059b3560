//! 수집 모듈.

pub mod orderbook_collect;
pub mod pipeline;
pub mod symbol_discovery;

pub use orderbook_collect::{CycleOutcome, OrderbookCollector};
pub use pipeline::{binance_rest_client, build_sinks, ExchangeFleet, Pipeline};
pub use symbol_discovery::{discover_symbols, select_symbols};

//! 호가 수집기.
//!
//! 이 crate는 거래소 호가를 수집해 주기적으로 집계하는 바이너리를 제공합니다:
//! - 심볼 탐색 (설정 또는 Binance REST)
//! - 거래소별 WebSocket 플릿 구성과 재동기화
//! - 주기 top-K 집계와 싱크 전달

pub mod config;
pub mod error;
pub mod modules;
pub mod stats;

pub use config::{CollectorConfig, DiscoveryConfig};
pub use error::{CollectorError, Result};
pub use stats::CollectionStats;

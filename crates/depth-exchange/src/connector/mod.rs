//! 거래소별 프로토콜 구현.
//!
//! - `binance`: 결합 스트림 URL 구독, update id 기반 증분
//! - `okx`: 구독 프레임, 텍스트 ping
//! - `ftx`: 구독 프레임, JSON ping

pub mod binance;
pub mod ftx;
pub mod okx;

pub use binance::BinanceProtocol;
pub use ftx::FtxProtocol;
pub use okx::OkxProtocol;

//! WebSocket 전송 계층.
//!
//! - `socket`: 소켓 트레이트와 tokio-tungstenite 구현
//! - `buffer`: 메시지 재조립 버퍼
//! - `transport`: 재연결/수신/디스패치 루프
//! - `scripted`: 네트워크 없는 스크립트 연결

mod buffer;
mod scripted;
mod socket;
mod transport;

pub use buffer::ReceiveBuffer;
pub use scripted::{ScriptedConnector, ScriptedSession};
pub use socket::{Fragment, FrameKind, TungsteniteConnector, WsConnector, WsSink, WsSource};
pub use transport::{ConnectionState, FramedTransport, MessageHandler};

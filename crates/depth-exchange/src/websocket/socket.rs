//! WebSocket 소켓 추상화.
//!
//! 수신 루프는 조각(fragment) 단위로 바이트를 받습니다. tokio-tungstenite는
//! 메시지를 이미 재조립해서 주므로 메시지 하나가 마지막 조각 하나가 되고,
//! 테스트 구현은 임의 위치에서 나눈 조각을 돌려줍니다.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::traits::ExchangeResult;

/// 프레임 종류.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
}

/// 메시지 조각.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    /// 조각 바이트
    pub data: Vec<u8>,
    /// 프레임 종류
    pub kind: FrameKind,
    /// 메시지의 마지막 조각인지 여부
    pub end_of_message: bool,
}

impl Fragment {
    /// 텍스트 조각.
    pub fn text(data: impl Into<Vec<u8>>, end_of_message: bool) -> Self {
        Self {
            data: data.into(),
            kind: FrameKind::Text,
            end_of_message,
        }
    }
}

/// 수신 절반.
#[async_trait]
pub trait WsSource: Send {
    /// 다음 조각. 연결이 닫히면 `None`.
    async fn receive(&mut self) -> Option<ExchangeResult<Fragment>>;
}

/// 송신 절반.
#[async_trait]
pub trait WsSink: Send {
    /// 텍스트 프레임을 보냅니다.
    async fn send_text(&mut self, text: &str) -> ExchangeResult<()>;

    /// close 프레임을 보내고 송신을 닫습니다.
    async fn close(&mut self) -> ExchangeResult<()>;
}

/// 연결 생성기.
#[async_trait]
pub trait WsConnector: Send + Sync {
    /// URL에 연결하고 송신/수신 절반을 반환합니다.
    async fn connect(&self, url: &str) -> ExchangeResult<(Box<dyn WsSink>, Box<dyn WsSource>)>;
}

type TungsteniteStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// tokio-tungstenite 기반 연결 생성기.
#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteConnector;

#[async_trait]
impl WsConnector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> ExchangeResult<(Box<dyn WsSink>, Box<dyn WsSource>)> {
        let (stream, _) = connect_async(url).await?;
        let (sink, source) = stream.split();
        Ok((
            Box::new(TungsteniteSink { inner: sink }),
            Box::new(TungsteniteSource { inner: source }),
        ))
    }
}

struct TungsteniteSink {
    inner: SplitSink<TungsteniteStream, Message>,
}

#[async_trait]
impl WsSink for TungsteniteSink {
    async fn send_text(&mut self, text: &str) -> ExchangeResult<()> {
        self.inner.send(Message::Text(text.to_string().into())).await?;
        Ok(())
    }

    async fn close(&mut self) -> ExchangeResult<()> {
        self.inner.close().await?;
        Ok(())
    }
}

struct TungsteniteSource {
    inner: SplitStream<TungsteniteStream>,
}

#[async_trait]
impl WsSource for TungsteniteSource {
    async fn receive(&mut self) -> Option<ExchangeResult<Fragment>> {
        loop {
            let message = match self.inner.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(e.into())),
            };
            match message {
                Message::Text(text) => {
                    return Some(Ok(Fragment::text(text.as_bytes().to_vec(), true)));
                }
                Message::Binary(data) => {
                    return Some(Ok(Fragment {
                        data: data.to_vec(),
                        kind: FrameKind::Binary,
                        end_of_message: true,
                    }));
                }
                Message::Close(frame) => {
                    debug!(?frame, "Close frame received");
                    return None;
                }
                // ping 응답은 tungstenite가 처리
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }
    }
}

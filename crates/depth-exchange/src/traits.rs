//! 거래소 프로토콜 트레이트.
//!
//! 전송 계층은 거래소를 모릅니다. URL 구성, 구독 프레임, ping, 라우팅 필드,
//! 페이로드 디코딩은 모두 `ExchangeProtocol` 구현이 담당합니다.

use depth_core::{DepthUpdate, Exchange};

use crate::preparse::{scan, RoutePath, RoutingKey, ScanOutcome};
use crate::subscription::Subscription;
use crate::ExchangeError;

/// 거래소 작업을 위한 Result 타입.
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// 구독 변경 방식. 프로토콜마다 생성 시점에 고정됩니다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionMode {
    /// 구독 목록이 URL에 들어감. 심볼 추가 시 재연결 (Binance)
    UrlRebuild,
    /// 연결을 유지한 채 subscribe/unsubscribe 프레임 전송 (OKX, FTX)
    Incremental,
}

/// 사전 파싱 결과에 따른 수신 루프의 처리 방향.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    /// 라우팅 키를 찾음. 메시지 완료 후 디스패치
    Route(RoutingKey),
    /// 판단하려면 더 많은 바이트가 필요
    NeedMore,
    /// 관심 없는 메시지. 나머지를 버림
    Ignore,
    /// 잘못된 JSON. 연결을 닫음
    Invalid,
}

/// 디코딩된 메시지.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// 호가 스냅샷/증분
    Depth(DepthUpdate),
    /// 구독 확인
    SubscribeAck(Subscription),
    /// 구독 해제 확인
    UnsubscribeAck(Subscription),
    /// 거래소가 보낸 에러 이벤트
    Error { code: String, message: String },
    /// ping 응답
    Pong,
    /// 처리할 필요 없는 메시지
    Ignored,
}

/// 거래소별 WebSocket 프로토콜.
pub trait ExchangeProtocol: Send + Sync + 'static {
    /// 거래소 식별자.
    fn exchange(&self) -> Exchange;

    /// 구독 변경 방식.
    fn subscription_mode(&self) -> SubscriptionMode;

    /// 심볼의 호가 구독.
    fn depth_subscription(&self, symbol: &str) -> Subscription;

    /// 연결 URL. `UrlRebuild` 프로토콜은 구독 목록을 URL에 넣습니다.
    fn build_url(&self, base_url: &str, subscriptions: &[Subscription]) -> String;

    /// 구독 프레임들. `UrlRebuild` 프로토콜은 빈 목록을 반환합니다.
    fn subscribe_frames(&self, subscriptions: &[Subscription]) -> Vec<String>;

    /// 구독 해제 프레임들.
    fn unsubscribe_frames(&self, subscriptions: &[Subscription]) -> Vec<String>;

    /// 유휴 시 보낼 ping 프레임.
    fn ping_frame(&self) -> Option<&'static str> {
        None
    }

    /// JSON이 아닌 pong 페이로드 (OKX의 `pong`).
    fn pong_payload(&self) -> Option<&'static [u8]> {
        None
    }

    /// 라우팅 키를 찾을 첫 레벨 경로. 문서 순서상 먼저 나온 것이 이깁니다.
    fn routing_paths(&self) -> &'static [RoutePath];

    /// 지금까지 받은 바이트로 메시지 처리 방향을 결정합니다.
    fn classify(&self, bytes: &[u8], complete: bool) -> FilterDecision {
        if complete {
            if let Some(pong) = self.pong_payload() {
                if bytes == pong {
                    return FilterDecision::Ignore;
                }
            }
        }

        match scan(bytes, self.routing_paths()) {
            ScanOutcome::Found(raw) => match crate::preparse::routing_key_from_raw(raw) {
                Some(key) => FilterDecision::Route(key),
                None => FilterDecision::Invalid,
            },
            ScanOutcome::Absent => FilterDecision::Ignore,
            ScanOutcome::Incomplete if complete => FilterDecision::Invalid,
            ScanOutcome::Incomplete => FilterDecision::NeedMore,
            ScanOutcome::Invalid => FilterDecision::Invalid,
        }
    }

    /// 라우팅된 전체 페이로드를 디코딩합니다.
    fn decode(&self, key: &str, payload: &[u8]) -> ExchangeResult<Decoded>;
}

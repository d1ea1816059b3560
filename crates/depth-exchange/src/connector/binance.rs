//! Binance Spot 호가 스트림 프로토콜.
//!
//! 결합 스트림 엔드포인트 `/stream?streams=a/b/c`를 사용하므로 구독 목록이
//! URL에 들어갑니다. 심볼을 추가하려면 다시 연결해야 합니다.

use chrono::DateTime;
use depth_core::{DepthKind, DepthUpdate, Exchange, LevelUpdate};
use serde::Deserialize;

use crate::preparse::RoutePath;
use crate::subscription::Subscription;
use crate::traits::{Decoded, ExchangeProtocol, ExchangeResult, SubscriptionMode};
use crate::ExchangeError;

/// 100ms 증분 호가 채널.
pub const DEPTH_CHANNEL: &str = "depth@100ms";

const ROUTING: &[RoutePath] = &[RoutePath::Field("stream")];

/// 결합 스트림 봉투.
#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    data: WsDepth,
}

/// Binance 증분 호가 이벤트.
#[derive(Debug, Deserialize)]
struct WsDepth {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
}

/// `[가격, 수량]` 문자열 쌍을 레벨 갱신으로 변환합니다.
pub(crate) fn parse_levels(levels: &[[String; 2]]) -> ExchangeResult<Vec<LevelUpdate>> {
    levels
        .iter()
        .map(|[price, quantity]| {
            let price = price
                .parse::<f64>()
                .map_err(|e| ExchangeError::ParseError(format!("price {:?}: {}", price, e)))?;
            let quantity = quantity
                .parse::<f64>()
                .map_err(|e| ExchangeError::ParseError(format!("quantity {:?}: {}", quantity, e)))?;
            Ok(LevelUpdate::new(price, quantity))
        })
        .collect()
}

/// 스트림 이름 (`btcusdt@depth@100ms`).
pub fn stream_name(subscription: &Subscription) -> String {
    format!(
        "{}@{}",
        subscription.instrument.to_lowercase(),
        subscription.channel
    )
}

/// Binance 프로토콜.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinanceProtocol;

impl ExchangeProtocol for BinanceProtocol {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    fn subscription_mode(&self) -> SubscriptionMode {
        SubscriptionMode::UrlRebuild
    }

    fn depth_subscription(&self, symbol: &str) -> Subscription {
        Subscription::new(DEPTH_CHANNEL, symbol.to_uppercase())
    }

    fn build_url(&self, base_url: &str, subscriptions: &[Subscription]) -> String {
        let base = base_url.trim_end_matches('/');
        if subscriptions.is_empty() {
            return format!("{}/stream", base);
        }
        let streams: Vec<String> = subscriptions.iter().map(stream_name).collect();
        format!("{}/stream?streams={}", base, streams.join("/"))
    }

    fn subscribe_frames(&self, _subscriptions: &[Subscription]) -> Vec<String> {
        Vec::new()
    }

    fn unsubscribe_frames(&self, _subscriptions: &[Subscription]) -> Vec<String> {
        Vec::new()
    }

    fn routing_paths(&self) -> &'static [RoutePath] {
        ROUTING
    }

    fn decode(&self, key: &str, payload: &[u8]) -> ExchangeResult<Decoded> {
        if !key.ends_with(DEPTH_CHANNEL) {
            return Ok(Decoded::Ignored);
        }

        let envelope: StreamEnvelope = serde_json::from_slice(payload)?;
        let depth = envelope.data;
        if depth.event_type != "depthUpdate" {
            return Ok(Decoded::Ignored);
        }

        let event_time = DateTime::from_timestamp_millis(depth.event_time).ok_or_else(|| {
            ExchangeError::ParseError(format!("event time out of range: {}", depth.event_time))
        })?;
        let mut update = DepthUpdate::new(Exchange::Binance, depth.symbol, DepthKind::Delta)
            .with_update_ids(depth.first_update_id, depth.final_update_id)
            .with_event_time(event_time);
        update.bids = parse_levels(&depth.bids)?;
        update.asks = parse_levels(&depth.asks)?;
        Ok(Decoded::Depth(update))
    }
}

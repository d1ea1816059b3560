//! FTX 호가 채널 프로토콜.

use chrono::DateTime;
use depth_core::{DepthKind, DepthUpdate, Exchange, LevelUpdate};
use serde::Deserialize;
use serde_json::json;

use crate::preparse::RoutePath;
use crate::subscription::Subscription;
use crate::traits::{Decoded, ExchangeProtocol, ExchangeResult, SubscriptionMode};
use crate::ExchangeError;

/// 호가 채널.
pub const ORDERBOOK_CHANNEL: &str = "orderbook";

const ROUTING: &[RoutePath] = &[RoutePath::Field("market"), RoutePath::Field("type")];

#[derive(Debug, Deserialize)]
struct FtxMessage {
    channel: Option<String>,
    market: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    code: Option<i64>,
    msg: Option<String>,
    data: Option<FtxBook>,
}

#[derive(Debug, Deserialize)]
struct FtxBook {
    time: f64,
    bids: Vec<[f64; 2]>,
    asks: Vec<[f64; 2]>,
}

fn to_levels(levels: &[[f64; 2]]) -> Vec<LevelUpdate> {
    levels
        .iter()
        .map(|&[price, size]| LevelUpdate::new(price, size))
        .collect()
}

/// FTX 프로토콜.
#[derive(Debug, Clone, Copy, Default)]
pub struct FtxProtocol;

impl FtxProtocol {
    fn frames(op: &str, subscriptions: &[Subscription]) -> Vec<String> {
        subscriptions
            .iter()
            .map(|s| json!({ "op": op, "channel": s.channel, "market": s.instrument }).to_string())
            .collect()
    }
}

impl ExchangeProtocol for FtxProtocol {
    fn exchange(&self) -> Exchange {
        Exchange::Ftx
    }

    fn subscription_mode(&self) -> SubscriptionMode {
        SubscriptionMode::Incremental
    }

    fn depth_subscription(&self, symbol: &str) -> Subscription {
        Subscription::new(ORDERBOOK_CHANNEL, symbol.to_uppercase())
    }

    fn build_url(&self, base_url: &str, _subscriptions: &[Subscription]) -> String {
        base_url.to_string()
    }

    fn subscribe_frames(&self, subscriptions: &[Subscription]) -> Vec<String> {
        Self::frames("subscribe", subscriptions)
    }

    fn unsubscribe_frames(&self, subscriptions: &[Subscription]) -> Vec<String> {
        Self::frames("unsubscribe", subscriptions)
    }

    fn ping_frame(&self) -> Option<&'static str> {
        Some(r#"{"op":"ping"}"#)
    }

    fn routing_paths(&self) -> &'static [RoutePath] {
        ROUTING
    }

    fn decode(&self, _key: &str, payload: &[u8]) -> ExchangeResult<Decoded> {
        let message: FtxMessage = serde_json::from_slice(payload)?;
        let subscription = || {
            Some(Subscription::new(
                message.channel.as_deref()?,
                message.market.as_deref()?,
            ))
        };

        match message.kind.as_str() {
            "pong" => Ok(Decoded::Pong),
            "subscribed" => Ok(subscription().map_or(Decoded::Ignored, Decoded::SubscribeAck)),
            "unsubscribed" => Ok(subscription().map_or(Decoded::Ignored, Decoded::UnsubscribeAck)),
            "error" => Ok(Decoded::Error {
                code: message.code.map(|c| c.to_string()).unwrap_or_default(),
                message: message.msg.clone().unwrap_or_default(),
            }),
            kind @ ("partial" | "update") => {
                if message.channel.as_deref() != Some(ORDERBOOK_CHANNEL) {
                    return Ok(Decoded::Ignored);
                }
                let (Some(market), Some(book)) = (message.market, message.data) else {
                    return Ok(Decoded::Ignored);
                };
                let depth_kind = if kind == "partial" {
                    DepthKind::Snapshot
                } else {
                    DepthKind::Delta
                };
                let millis = (book.time * 1000.0).round() as i64;
                let event_time = DateTime::from_timestamp_millis(millis).ok_or_else(|| {
                    ExchangeError::ParseError(format!("time out of range: {}", book.time))
                })?;

                let mut update =
                    DepthUpdate::new(Exchange::Ftx, market, depth_kind).with_event_time(event_time);
                update.bids = to_levels(&book.bids);
                update.asks = to_levels(&book.asks);
                Ok(Decoded::Depth(update))
            }
            _ => Ok(Decoded::Ignored),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::FilterDecision;

    #[test]
    fn test_subscribe_frames() {
        let protocol = FtxProtocol;
        let frames = protocol.subscribe_frames(&[
            protocol.depth_subscription("btc-perp"),
            protocol.depth_subscription("ETH-PERP"),
        ]);
        assert_eq!(frames.len(), 2);
        let value: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(
            value,
            json!({"op":"subscribe","channel":"orderbook","market":"BTC-PERP"})
        );
    }

    #[test]
    fn test_decode_partial_and_update() {
        let protocol = FtxProtocol;
        let partial = br#"{"channel":"orderbook","market":"BTC-PERP","type":"partial","data":{"time":1603755474.3151038,"checksum":1,"bids":[[13700.0,1.5]],"asks":[[13701.0,2.0],[13702.0,0.5]],"action":"partial"}}"#;
        match protocol.decode("BTC-PERP", partial).unwrap() {
            Decoded::Depth(update) => {
                assert_eq!(update.kind, DepthKind::Snapshot);
                assert_eq!(update.symbol, "BTC-PERP");
                assert_eq!(update.bids, vec![LevelUpdate::new(13700.0, 1.5)]);
                assert_eq!(update.asks.len(), 2);
                assert_eq!(update.event_time.timestamp(), 1603755474);
            }
            other => panic!("unexpected {:?}", other),
        }

        let delta = br#"{"channel":"orderbook","market":"BTC-PERP","type":"update","data":{"time":1603755475.0,"checksum":2,"bids":[[13700.0,0.0]],"asks":[],"action":"update"}}"#;
        match protocol.decode("BTC-PERP", delta).unwrap() {
            Decoded::Depth(update) => assert_eq!(update.kind, DepthKind::Delta),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_control_messages() {
        let protocol = FtxProtocol;
        let pong = br#"{"type":"pong"}"#;
        match protocol.classify(pong, true) {
            FilterDecision::Route(key) => assert_eq!(&*key, "pong"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(protocol.decode("pong", pong).unwrap(), Decoded::Pong);

        let ack = br#"{"type":"subscribed","channel":"orderbook","market":"BTC-PERP"}"#;
        assert_eq!(
            protocol.decode("subscribed", ack).unwrap(),
            Decoded::SubscribeAck(Subscription::new("orderbook", "BTC-PERP"))
        );

        let error = br#"{"type":"error","code":400,"msg":"Invalid market"}"#;
        assert_eq!(
            protocol.decode("error", error).unwrap(),
            Decoded::Error {
                code: "400".to_string(),
                message: "Invalid market".to_string()
            }
        );

        let info = br#"{"type":"info","code":20001,"msg":"Server restarting"}"#;
        assert_eq!(protocol.decode("info", info).unwrap(), Decoded::Ignored);
    }
}

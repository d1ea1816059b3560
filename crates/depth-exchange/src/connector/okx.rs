//! OKX v5 공개 호가 채널 프로토콜.
//!
//! 연결을 유지한 채 `{"op":"subscribe","args":[...]}` 프레임으로 구독을 바꿉니다.
//! 유휴 연결은 텍스트 `ping`을 보내고 `pong`을 받습니다.

use chrono::DateTime;
use depth_core::{DepthKind, DepthUpdate, Exchange, LevelUpdate};
use serde::Deserialize;
use serde_json::json;

use crate::preparse::RoutePath;
use crate::subscription::Subscription;
use crate::traits::{Decoded, ExchangeProtocol, ExchangeResult, SubscriptionMode};
use crate::ExchangeError;

/// 400단계 호가 채널.
pub const BOOKS_CHANNEL: &str = "books";

/// 프레임 하나에 넣는 최대 구독 수.
const ARGS_PER_FRAME: usize = 20;

const ROUTING: &[RoutePath] = &[
    RoutePath::Nested {
        object: "arg",
        field: "instId",
    },
    RoutePath::Field("event"),
];

#[derive(Debug, Deserialize)]
struct OkxMessage {
    event: Option<String>,
    arg: Option<OkxArg>,
    action: Option<String>,
    data: Option<Vec<OkxBook>>,
    code: Option<String>,
    msg: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OkxArg {
    channel: String,
    inst_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OkxBook {
    asks: Vec<Vec<String>>,
    bids: Vec<Vec<String>>,
    ts: String,
}

fn parse_okx_levels(levels: &[Vec<String>]) -> ExchangeResult<Vec<LevelUpdate>> {
    levels
        .iter()
        .map(|level| match level.as_slice() {
            [price, size, ..] => {
                let price = price
                    .parse::<f64>()
                    .map_err(|e| ExchangeError::ParseError(format!("price {:?}: {}", price, e)))?;
                let size = size
                    .parse::<f64>()
                    .map_err(|e| ExchangeError::ParseError(format!("size {:?}: {}", size, e)))?;
                Ok(LevelUpdate::new(price, size))
            }
            _ => Err(ExchangeError::ParseError(format!("short level {:?}", level))),
        })
        .collect()
}

/// OKX 프로토콜.
#[derive(Debug, Clone, Copy, Default)]
pub struct OkxProtocol;

impl OkxProtocol {
    fn frames(op: &str, subscriptions: &[Subscription]) -> Vec<String> {
        subscriptions
            .chunks(ARGS_PER_FRAME)
            .map(|chunk| {
                let args: Vec<_> = chunk
                    .iter()
                    .map(|s| json!({ "channel": s.channel, "instId": s.instrument }))
                    .collect();
                json!({ "op": op, "args": args }).to_string()
            })
            .collect()
    }
}

impl ExchangeProtocol for OkxProtocol {
    fn exchange(&self) -> Exchange {
        Exchange::Okx
    }

    fn subscription_mode(&self) -> SubscriptionMode {
        SubscriptionMode::Incremental
    }

    fn depth_subscription(&self, symbol: &str) -> Subscription {
        Subscription::new(BOOKS_CHANNEL, symbol.to_uppercase())
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
        Some("ping")
    }

    fn pong_payload(&self) -> Option<&'static [u8]> {
        Some(b"pong")
    }

    fn routing_paths(&self) -> &'static [RoutePath] {
        ROUTING
    }

    fn decode(&self, _key: &str, payload: &[u8]) -> ExchangeResult<Decoded> {
        let message: OkxMessage = serde_json::from_slice(payload)?;

        if let Some(event) = message.event.as_deref() {
            let subscription = message
                .arg
                .as_ref()
                .and_then(|arg| Some(Subscription::new(&arg.channel, arg.inst_id.as_deref()?)));
            return Ok(match (event, subscription) {
                ("subscribe", Some(subscription)) => Decoded::SubscribeAck(subscription),
                ("unsubscribe", Some(subscription)) => Decoded::UnsubscribeAck(subscription),
                ("error", _) => Decoded::Error {
                    code: message.code.unwrap_or_default(),
                    message: message.msg.unwrap_or_default(),
                },
                _ => Decoded::Ignored,
            });
        }

        let (Some(arg), Some(books)) = (message.arg, message.data) else {
            return Ok(Decoded::Ignored);
        };
        if arg.channel != BOOKS_CHANNEL {
            return Ok(Decoded::Ignored);
        }
        let Some(symbol) = arg.inst_id else {
            return Ok(Decoded::Ignored);
        };
        let Some(book) = books.into_iter().next() else {
            return Ok(Decoded::Ignored);
        };

        let kind = match message.action.as_deref() {
            Some("snapshot") => DepthKind::Snapshot,
            _ => DepthKind::Delta,
        };
        let millis = book
            .ts
            .parse::<i64>()
            .map_err(|e| ExchangeError::ParseError(format!("ts {:?}: {}", book.ts, e)))?;
        let event_time = DateTime::from_timestamp_millis(millis)
            .ok_or_else(|| ExchangeError::ParseError(format!("ts out of range: {}", millis)))?;

        let mut update = DepthUpdate::new(Exchange::Okx, symbol, kind).with_event_time(event_time);
        update.bids = parse_okx_levels(&book.bids)?;
        update.asks = parse_okx_levels(&book.asks)?;
        Ok(Decoded::Depth(update))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::FilterDecision;

    #[test]
    fn test_subscribe_frame() {
        let protocol = OkxProtocol;
        let frames = protocol.subscribe_frames(&[protocol.depth_subscription("btc-usdt")]);
        assert_eq!(frames.len(), 1);
        let value: serde_json::Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(
            value,
            json!({"op":"subscribe","args":[{"channel":"books","instId":"BTC-USDT"}]})
        );

        let many: Vec<Subscription> = (0..45)
            .map(|i| protocol.depth_subscription(&format!("C{}-USDT", i)))
            .collect();
        assert_eq!(protocol.unsubscribe_frames(&many).len(), 3);
    }

    #[test]
    fn test_classify_pong_and_ack() {
        let protocol = OkxProtocol;
        assert_eq!(protocol.classify(b"pong", true), FilterDecision::Ignore);
        // 완결 전 `pong` 조각은 JSON이 아니므로 잘못된 메시지
        assert_eq!(protocol.classify(b"po", false), FilterDecision::Invalid);

        let ack = br#"{"event":"subscribe","arg":{"channel":"books","instId":"BTC-USDT"},"connId":"a4d3ae55"}"#;
        match protocol.classify(ack, true) {
            FilterDecision::Route(key) => assert_eq!(&*key, "subscribe"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            protocol.decode("subscribe", ack).unwrap(),
            Decoded::SubscribeAck(Subscription::new("books", "BTC-USDT"))
        );
    }

    #[test]
    fn test_decode_snapshot() {
        let protocol = OkxProtocol;
        let payload = br#"{"arg":{"channel":"books","instId":"BTC-USDT"},"action":"snapshot","data":[{"asks":[["8476.98","415","0","13"]],"bids":[["8476.97","256","0","12"],["8475.55","101","0","1"]],"ts":"1597026383085","checksum":-855196043,"prevSeqId":-1,"seqId":123456}]}"#;

        match protocol.decode("BTC-USDT", payload).unwrap() {
            Decoded::Depth(update) => {
                assert_eq!(update.exchange, Exchange::Okx);
                assert_eq!(update.symbol, "BTC-USDT");
                assert_eq!(update.kind, DepthKind::Snapshot);
                assert_eq!(update.first_update_id, None);
                assert_eq!(update.asks, vec![LevelUpdate::new(8476.98, 415.0)]);
                assert_eq!(update.bids.len(), 2);
                assert_eq!(update.event_time.timestamp_millis(), 1597026383085);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_error_event() {
        let protocol = OkxProtocol;
        let payload = br#"{"event":"error","code":"60012","msg":"Invalid request"}"#;
        assert_eq!(
            protocol.decode("error", payload).unwrap(),
            Decoded::Error {
                code: "60012".to_string(),
                message: "Invalid request".to_string()
            }
        );
    }
}

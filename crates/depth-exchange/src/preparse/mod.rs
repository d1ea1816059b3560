//! 라우팅 키 사전 파싱.
//!
//! 전체 역직렬화 없이 메시지 첫 레벨에서 라우팅 키(심볼, 이벤트 종류)를 뽑아
//! 수신 루프가 메시지를 걸러내고 디스패치할 수 있게 합니다.

mod intern;
mod scanner;

use std::sync::Arc;

pub use intern::{InternCache, DEFAULT_INTERN_CAPACITY, MAX_INTERNED_LEN};
pub use scanner::{is_valid_document, scan, RoutePath, ScanOutcome};

/// 복제 비용이 낮은 라우팅 키.
pub type RoutingKey = Arc<str>;

/// 완결된 메시지에서 라우팅 키를 추출합니다.
///
/// 문서 전체가 올바른 JSON이고 첫 레벨에 키가 있을 때만 `Some`입니다.
/// 잘리거나 깨진 입력은 패닉 없이 `None`이 됩니다.
pub fn try_extract_routing_key(bytes: &[u8], paths: &[RoutePath]) -> Option<RoutingKey> {
    if !is_valid_document(bytes) {
        return None;
    }
    match scan(bytes, paths) {
        ScanOutcome::Found(raw) => routing_key_from_raw(raw),
        _ => None,
    }
}

/// 스캐너가 찾은 원시 문자열 내용을 키로 변환합니다.
///
/// 이스케이프가 있으면 serde_json으로 해석합니다.
pub fn routing_key_from_raw(raw: &[u8]) -> Option<RoutingKey> {
    if raw.contains(&b'\\') {
        let mut quoted = Vec::with_capacity(raw.len() + 2);
        quoted.push(b'"');
        quoted.extend_from_slice(raw);
        quoted.push(b'"');
        let decoded: String = serde_json::from_slice(&quoted).ok()?;
        return Some(InternCache::shared().intern(&decoded));
    }
    std::str::from_utf8(raw)
        .ok()
        .map(|key| InternCache::shared().intern(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PATHS: &[RoutePath] = &[RoutePath::Field("stream")];

    #[test]
    fn test_extract_complete_message() {
        let msg = br#"{"stream":"btcusdt@depth@100ms","data":{"e":"depthUpdate","U":1,"u":2}}"#;
        let key = try_extract_routing_key(msg, PATHS).unwrap();
        assert_eq!(&*key, "btcusdt@depth@100ms");
    }

    #[test]
    fn test_truncated_message_is_none() {
        let msg = br#"{"stream":"btcusdt@depth@100ms","data":{"e":"depthUpdate""#;
        assert!(try_extract_routing_key(msg, PATHS).is_none());
    }

    #[test]
    fn test_trailing_garbage_is_none() {
        let msg = br#"{"stream":"x"}}"#;
        assert!(try_extract_routing_key(msg, PATHS).is_none());
    }

    #[test]
    fn test_escaped_key_decoded() {
        let msg = br#"{"stream":"a\/bA"}"#;
        assert_eq!(&*try_extract_routing_key(msg, PATHS).unwrap(), "a/bA");
    }
}

//! Binance REST 클라이언트.
//!
//! 모든 요청은 가중치를 선언하고 rate limiter의 슬롯을 얻은 뒤 나갑니다.
//! 응답의 `X-MBX-USED-WEIGHT-1M`과 `Date` 헤더는 limiter에 다시 반영되고,
//! 418/429 응답은 limiter의 감속 정책을 발동시킵니다.

use chrono::{DateTime, Utc};
use depth_core::{Clock, DepthKind, DepthUpdate, Exchange, SystemClock};
use reqwest::header::{HeaderMap, DATE};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::connector::binance::parse_levels;
use crate::rate_limiter::WeightedRateLimiter;
use crate::traits::ExchangeResult;
use crate::ExchangeError;

/// 1분 사용 가중치 헤더.
pub const USED_WEIGHT_HEADER: &str = "X-MBX-USED-WEIGHT-1M";

/// `GET /api/v3/exchangeInfo` 가중치.
pub const EXCHANGE_INFO_WEIGHT: i64 = 10;

/// `GET /api/v3/depth` 가중치.
pub fn depth_weight(limit: u32) -> i64 {
    match limit {
        l if l > 1000 => 50,
        l if l > 500 => 10,
        l if l > 100 => 5,
        _ => 1,
    }
}

/// 응답 메타데이터 (상태 코드와 rate limit 헤더).
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseMeta {
    /// HTTP 상태 코드
    pub status: u16,
    /// 서버가 알려준 1분 사용 가중치
    pub used_weight: Option<i64>,
    /// 서버 시각 (`Date` 헤더, 1분 넘게 어긋나면 로컬 시각)
    pub server_time: DateTime<Utc>,
}

impl ResponseMeta {
    fn from_headers(status: u16, headers: &HeaderMap, now: DateTime<Utc>) -> Self {
        Self {
            status,
            used_weight: used_weight_from_headers(headers),
            server_time: server_time_from_headers(headers, now),
        }
    }

    /// rate limit 응답인지 여부.
    pub fn is_throttled(&self) -> bool {
        self.status == 418 || self.status == 429
    }
}

/// 사용 가중치 헤더 값들 중 최댓값.
pub fn used_weight_from_headers(headers: &HeaderMap) -> Option<i64> {
    headers
        .get_all(USED_WEIGHT_HEADER)
        .iter()
        .filter_map(|value| value.to_str().ok()?.trim().parse::<i64>().ok())
        .max()
}

/// `Date` 헤더의 서버 시각. 없거나 1분 넘게 어긋나면 `now`.
pub fn server_time_from_headers(headers: &HeaderMap, now: DateTime<Utc>) -> DateTime<Utc> {
    headers
        .get(DATE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
        .map(|date| date.with_timezone(&Utc))
        .filter(|date| (*date - now).num_seconds().abs() <= 60)
        .unwrap_or(now)
}

/// Binance 에러 응답.
#[derive(Debug, Deserialize)]
struct BinanceError {
    code: i32,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeInfoResponse {
    symbols: Vec<SymbolInfo>,
}

/// 거래소 심볼 정보.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    /// 심볼 (예: BTCUSDT)
    pub symbol: String,
    /// 거래 상태 (TRADING, BREAK ...)
    pub status: String,
    /// 기초 자산
    pub base_asset: String,
    /// 호가 자산
    pub quote_asset: String,
}

impl SymbolInfo {
    /// 거래 가능한 심볼인지 여부.
    pub fn is_trading(&self) -> bool {
        self.status == "TRADING"
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DepthSnapshotResponse {
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

/// rate limiter를 거치는 Binance REST 클라이언트.
pub struct BinanceRestClient {
    client: Client,
    base_url: String,
    limiter: Arc<WeightedRateLimiter>,
    clock: Arc<dyn Clock>,
}

impl BinanceRestClient {
    /// 새 클라이언트.
    pub fn new(
        base_url: impl Into<String>,
        limiter: Arc<WeightedRateLimiter>,
    ) -> ExchangeResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ExchangeError::NetworkError(format!("HTTP 클라이언트 생성 실패: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            limiter,
            clock: Arc::new(SystemClock),
        })
    }

    /// 응답 시각 판단에 쓸 시계를 지정합니다.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// 공유 rate limiter.
    pub fn limiter(&self) -> &Arc<WeightedRateLimiter> {
        &self.limiter
    }

    /// 가중치를 선언한 GET 요청. 응답 메타데이터는 `on_response`로 전달됩니다.
    pub async fn get_json_with<T, F>(
        &self,
        path: &str,
        query: &[(&str, String)],
        weight: i64,
        cancel: &CancellationToken,
        on_response: F,
    ) -> ExchangeResult<T>
    where
        T: DeserializeOwned,
        F: FnOnce(&ResponseMeta),
    {
        let url = format!("{}{}", self.base_url, path);
        let registration = self.limiter.wait_for_slot(path, weight, cancel).await?;

        debug!("GET {} (weight {})", url, weight);
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ExchangeError::Cancelled),
            response = self.client.get(&url).query(query).send() => response?,
        };
        registration.mark_sent();

        let meta = ResponseMeta::from_headers(
            response.status().as_u16(),
            response.headers(),
            self.clock.now(),
        );
        if let Some(used) = meta.used_weight {
            self.limiter.update_used_weight(used, meta.server_time);
        }
        on_response(&meta);

        if meta.is_throttled() {
            warn!(url = %url, status = meta.status, "Rate limited");
            self.limiter.on_throttled();
            registration.confirm();
            return Err(ExchangeError::RateLimited {
                status: meta.status,
            });
        }
        registration.confirm();

        self.handle_response(response).await
    }

    /// 가중치를 선언한 GET 요청.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        weight: i64,
        cancel: &CancellationToken,
    ) -> ExchangeResult<T> {
        self.get_json_with(path, query, weight, cancel, |_| {}).await
    }

    async fn handle_response<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> ExchangeResult<T> {
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExchangeError::NetworkError(e.to_string()))?;

        if status.is_success() {
            serde_json::from_str(&body).map_err(|e| {
                error!("Failed to parse response: {} - Body: {}", e, body);
                ExchangeError::ParseError(e.to_string())
            })
        } else if let Ok(error) = serde_json::from_str::<BinanceError>(&body) {
            Err(ExchangeError::ApiError {
                code: error.code,
                message: error.msg,
            })
        } else {
            Err(ExchangeError::ApiError {
                code: status.as_u16() as i32,
                message: body,
            })
        }
    }

    /// 거래소 심볼 목록.
    pub async fn exchange_info(&self, cancel: &CancellationToken) -> ExchangeResult<Vec<SymbolInfo>> {
        let info: ExchangeInfoResponse = self
            .get_json("/api/v3/exchangeInfo", &[], EXCHANGE_INFO_WEIGHT, cancel)
            .await?;
        Ok(info.symbols)
    }

    /// 거래 중인 심볼 이름. `quote`를 주면 해당 호가 자산만.
    pub async fn trading_symbols(
        &self,
        quote: Option<&str>,
        cancel: &CancellationToken,
    ) -> ExchangeResult<Vec<String>> {
        let mut symbols: Vec<String> = self
            .exchange_info(cancel)
            .await?
            .into_iter()
            .filter(|info| info.is_trading())
            .filter(|info| quote.map_or(true, |q| info.quote_asset.eq_ignore_ascii_case(q)))
            .map(|info| info.symbol)
            .collect();
        symbols.sort();
        Ok(symbols)
    }

    /// 호가 스냅샷.
    pub async fn depth_snapshot(
        &self,
        symbol: &str,
        limit: u32,
        cancel: &CancellationToken,
    ) -> ExchangeResult<DepthUpdate> {
        let symbol = symbol.to_uppercase();
        let mut server_time = self.clock.now();
        let snapshot: DepthSnapshotResponse = self
            .get_json_with(
                "/api/v3/depth",
                &[("symbol", symbol.clone()), ("limit", limit.to_string())],
                depth_weight(limit),
                cancel,
                |meta| server_time = meta.server_time,
            )
            .await?;

        let mut update = DepthUpdate::new(Exchange::Binance, symbol, DepthKind::Snapshot)
            .with_event_time(server_time);
        update.last_update_id = Some(snapshot.last_update_id);
        update.bids = parse_levels(&snapshot.bids)?;
        update.asks = parse_levels(&snapshot.asks)?;
        Ok(update)
    }
}

impl std::fmt::Debug for BinanceRestClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceRestClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_depth_weight_table() {
        assert_eq!(depth_weight(5), 1);
        assert_eq!(depth_weight(100), 1);
        assert_eq!(depth_weight(101), 5);
        assert_eq!(depth_weight(500), 5);
        assert_eq!(depth_weight(1000), 10);
        assert_eq!(depth_weight(5000), 50);
    }

    #[test]
    fn test_used_weight_takes_max() {
        let mut headers = HeaderMap::new();
        headers.append(USED_WEIGHT_HEADER, HeaderValue::from_static("12"));
        headers.append(USED_WEIGHT_HEADER, HeaderValue::from_static("40"));
        headers.append(USED_WEIGHT_HEADER, HeaderValue::from_static("junk"));
        assert_eq!(used_weight_from_headers(&headers), Some(40));
        assert_eq!(used_weight_from_headers(&HeaderMap::new()), None);
    }

    #[test]
    fn test_server_time_clamped() {
        let now = DateTime::parse_from_rfc2822("Tue, 14 Nov 2023 22:13:20 GMT")
            .unwrap()
            .with_timezone(&Utc);

        let mut headers = HeaderMap::new();
        headers.insert(DATE, HeaderValue::from_static("Tue, 14 Nov 2023 22:13:50 GMT"));
        assert_eq!(
            server_time_from_headers(&headers, now),
            now + chrono::Duration::seconds(30)
        );

        headers.insert(DATE, HeaderValue::from_static("Tue, 14 Nov 2023 22:20:00 GMT"));
        assert_eq!(server_time_from_headers(&headers, now), now);
    }
}

//! 설정 관리.
//!
//! 컴포넌트마다 평평한 설정 구조체 하나를 두고, `AppConfig`가 이를 묶습니다.
//! 모든 섹션은 `Default`를 가지므로 설정 파일에서 생략할 수 있습니다.
//! 환경 변수 `DEPTH__<SECTION>__<KEY>` 로 개별 값을 덮어쓸 수 있습니다.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::types::Exchange;

/// 애플리케이션 설정.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    /// 로깅 설정
    pub logging: LoggingConfig,
    /// WebSocket 전송 계층 설정
    pub transport: TransportConfig,
    /// REST 가중치 rate limiter 설정
    pub rate_limiter: RateLimiterConfig,
    /// 호가 집계 설정
    pub aggregator: AggregatorConfig,
    /// 거래소별 엔드포인트 설정
    pub exchanges: ExchangesConfig,
    /// 싱크 설정
    pub sinks: SinkConfig,
}

/// 로깅 설정.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 로그 레벨
    pub level: String,
    /// 로그 형식 (pretty, json, compact)
    pub format: String,
    /// 파일명/줄 번호 출력
    pub with_file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            with_file: false,
        }
    }
}

/// WebSocket 전송 계층 설정.
///
/// 전송 인스턴스 하나가 생성 시점에 값으로 보유합니다.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// WebSocket 기본 주소 (프로토콜이 경로/쿼리를 덧붙임)
    pub base_url: String,
    /// 수신 대기 타임아웃 (밀리초). 초과해도 에러가 아니라 재시도
    pub receive_timeout_ms: u64,
    /// 연결 시도당 타임아웃 (밀리초)
    pub connect_timeout_ms: u64,
    /// 연결 종료 대기 타임아웃 (밀리초)
    pub close_timeout_ms: u64,
    /// 재연결 시도 간 대기 (밀리초)
    pub reconnect_delay_ms: u64,
    /// 메시지 버퍼 확장 시 최소 추가 크기 (바이트)
    pub additional_receive_buffer_size: usize,
    /// 메시지 하나의 최대 크기 (바이트)
    pub max_message_size: usize,
    /// 연결당 구독 스트림 수 soft limit
    pub max_stream_count_soft_limit: usize,
    /// 유휴 시 ping 간격 (밀리초)
    pub ping_interval_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            receive_timeout_ms: 60_000,
            connect_timeout_ms: 10_000,
            close_timeout_ms: 1_000,
            reconnect_delay_ms: 1_000,
            additional_receive_buffer_size: 128 << 10,
            max_message_size: 16 << 20,
            max_stream_count_soft_limit: 512,
            ping_interval_ms: 15_000,
        }
    }
}

impl TransportConfig {
    /// 기본 주소만 바꾼 설정을 반환합니다.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// 수신 타임아웃.
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// 연결 시도 타임아웃.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// 종료 대기 타임아웃.
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// 재연결 대기.
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    /// ping 간격.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }
}

/// REST 가중치 rate limiter 설정.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// 1분 창에서 허용되는 최대 가중치 (Binance Spot 1200)
    pub max_usable_weight: i64,
    /// 가용 가중치 배수 (여유분 확보용, 0.8 = 80%만 사용)
    pub available_weight_multiplier: f64,
    /// 슬롯 대기 전체 타임아웃 (밀리초, 0이면 무제한)
    pub wait_for_slot_timeout_ms: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_usable_weight: 1200,
            available_weight_multiplier: 0.8,
            wait_for_slot_timeout_ms: 120_000,
        }
    }
}

impl RateLimiterConfig {
    /// 슬롯 대기 타임아웃. 0이면 `None`.
    pub fn wait_for_slot_timeout(&self) -> Option<Duration> {
        (self.wait_for_slot_timeout_ms > 0).then(|| Duration::from_millis(self.wait_for_slot_timeout_ms))
    }
}

/// 호가 집계 설정.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// 출력 행 크기 (한쪽 호가당 항목 수)
    pub size: usize,
    /// 집계 주기 (밀리초)
    pub interval_ms: u64,
    /// 무작위 보충용 PRNG 시드 (없으면 프로세스마다 무작위)
    pub seed: Option<u64>,
    /// 주기 작업 재시도 횟수
    pub max_retries: u32,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            size: 25,
            interval_ms: 60_000,
            seed: None,
            max_retries: 3,
        }
    }
}

impl AggregatorConfig {
    /// 집계 주기.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// 거래소 하나의 엔드포인트 설정.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExchangeEndpoints {
    /// 수집 활성화 여부
    #[serde(default)]
    pub enabled: bool,
    /// WebSocket 기본 URL
    pub ws_base_url: String,
    /// REST 기본 URL
    #[serde(default)]
    pub rest_base_url: String,
    /// 수집할 심볼 (비어 있으면 REST로 조회)
    #[serde(default)]
    pub symbols: Vec<String>,
    /// 제외할 심볼
    #[serde(default)]
    pub blacklist: Vec<String>,
}

impl ExchangeEndpoints {
    /// 거래소별 기본 엔드포인트.
    pub fn defaults_for(exchange: Exchange) -> Self {
        let (ws, rest) = match exchange {
            Exchange::Binance => ("wss://stream.binance.com:9443", "https://api.binance.com"),
            Exchange::Okx => ("wss://ws.okx.com:8443/ws/v5/public", "https://www.okx.com"),
            Exchange::Ftx => ("wss://ftx.com/ws/", "https://ftx.com/api"),
        };
        Self {
            enabled: exchange == Exchange::Binance,
            ws_base_url: ws.to_string(),
            rest_base_url: rest.to_string(),
            symbols: Vec::new(),
            blacklist: Vec::new(),
        }
    }
}

/// 거래소 이름 → 엔드포인트.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ExchangesConfig(pub BTreeMap<String, ExchangeEndpoints>);

impl Default for ExchangesConfig {
    fn default() -> Self {
        let map = Exchange::all()
            .into_iter()
            .map(|e| (e.to_string(), ExchangeEndpoints::defaults_for(e)))
            .collect();
        Self(map)
    }
}

impl ExchangesConfig {
    /// 거래소 설정 조회.
    pub fn get(&self, exchange: Exchange) -> Option<&ExchangeEndpoints> {
        self.0.get(&exchange.to_string())
    }

    /// 활성화된 거래소 목록.
    pub fn enabled(&self) -> Vec<(Exchange, &ExchangeEndpoints)> {
        self.0
            .iter()
            .filter(|(_, endpoints)| endpoints.enabled)
            .filter_map(|(name, endpoints)| name.parse().ok().map(|e| (e, endpoints)))
            .collect()
    }
}

/// 싱크 설정.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SinkConfig {
    /// JSON Lines 출력 파일 경로 (없으면 비활성)
    pub jsonl_path: Option<String>,
    /// 채널 싱크 버퍼 크기
    pub channel_capacity: usize,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            jsonl_path: None,
            channel_capacity: 1024,
        }
    }
}

impl AppConfig {
    /// 파일과 환경 변수에서 설정을 로드합니다.
    ///
    /// 파일이 없어도 에러가 아니며, 기본값 위에 환경 변수가 적용됩니다.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(
                config::Environment::with_prefix("DEPTH")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

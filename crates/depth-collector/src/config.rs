//! 설정 모듈.
//!
//! 기본 설정은 `depth_core::AppConfig`(설정 파일 + `DEPTH__*` 환경변수)에서
//! 읽고, 운영 중 자주 바꾸는 값은 `.env`/환경변수로 덮어씁니다.

use depth_core::{AppConfig, CoreError, Exchange};
use std::time::Duration;

use crate::error::CollectorError;
use crate::Result;

/// 설정 파일 기본 경로
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Collector 전체 설정
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// 공통 설정 (전송 계층, rate limiter, 집계, 거래소, 싱크)
    pub app: AppConfig,
    /// 심볼 탐색 설정
    pub discovery: DiscoveryConfig,
    /// `once` 명령 수집 시간 (초)
    pub once_duration_secs: u64,
    /// REST 스냅샷 재동기화 사용 여부
    pub enable_resync: bool,
}

/// 심볼 탐색 설정
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryConfig {
    /// 호가 자산 필터 (예: USDT). 비어 있으면 전체
    pub quote_asset: Option<String>,
    /// 거래소당 최대 심볼 수 (0이면 무제한)
    pub max_symbols: usize,
}

impl CollectorConfig {
    /// 설정 파일과 환경변수에서 설정 로드
    ///
    /// `path`가 없으면 `DEPTH_CONFIG`, 그것도 없으면 [`DEFAULT_CONFIG_PATH`]를 씁니다.
    pub fn from_env(path: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = path
            .map(str::to_string)
            .or_else(|| std::env::var("DEPTH_CONFIG").ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        let mut app = AppConfig::load(&path).map_err(CoreError::from)?;
        tracing::debug!(path = %path, "Configuration file loaded");

        apply_env_overrides(&mut app);

        let quote_asset = std::env::var("SYMBOL_QUOTE_ASSET")
            .unwrap_or_else(|_| "USDT".to_string());
        let config = Self {
            app,
            discovery: DiscoveryConfig {
                quote_asset: (!quote_asset.trim().is_empty()).then(|| quote_asset.trim().to_uppercase()),
                max_symbols: env_var_parse("SYMBOL_MAX_COUNT", 0),
            },
            once_duration_secs: env_var_parse("ONCE_DURATION_SECS", 10),
            enable_resync: env_var_bool("ENABLE_RESYNC", true),
        };
        config.validate()?;
        Ok(config)
    }

    /// 설정 값 검증
    pub fn validate(&self) -> Result<()> {
        if self.app.aggregator.size == 0 {
            return Err(CollectorError::Config(
                "aggregator.size는 0보다 커야 합니다".to_string(),
            ));
        }
        if self.app.aggregator.interval_ms == 0 {
            return Err(CollectorError::Config(
                "aggregator.interval_ms는 0보다 커야 합니다".to_string(),
            ));
        }
        if self.app.exchanges.enabled().is_empty() {
            return Err(CollectorError::Config(
                "활성화된 거래소가 없습니다".to_string(),
            ));
        }
        Ok(())
    }

    /// `once` 명령 수집 시간
    pub fn once_duration(&self) -> Duration {
        Duration::from_secs(self.once_duration_secs)
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            app: AppConfig::default(),
            discovery: DiscoveryConfig {
                quote_asset: Some("USDT".to_string()),
                max_symbols: 0,
            },
            once_duration_secs: 10,
            enable_resync: true,
        }
    }
}

/// 환경변수로 공통 설정 일부를 덮어씁니다.
fn apply_env_overrides(app: &mut AppConfig) {
    let aggregator = &mut app.aggregator;
    aggregator.size = env_var_parse("AGGREGATION_SIZE", aggregator.size);
    aggregator.interval_ms = env_var_parse("AGGREGATION_INTERVAL_MS", aggregator.interval_ms);
    if let Ok(seed) = std::env::var("AGGREGATION_SEED") {
        aggregator.seed = seed.trim().parse().ok();
    }

    if let Ok(path) = std::env::var("JSONL_PATH") {
        app.sinks.jsonl_path = (!path.trim().is_empty()).then(|| path.trim().to_string());
    }

    for exchange in Exchange::all() {
        let prefix = exchange.to_string().to_uppercase();
        let Some(endpoints) = app.exchanges.0.get_mut(&exchange.to_string()) else {
            continue;
        };
        // 심볼을 직접 지정하면 해당 거래소를 켬
        if let Some(symbols) = env_var_list(&format!("{}_SYMBOLS", prefix)) {
            endpoints.symbols = symbols;
            endpoints.enabled = true;
        }
        endpoints.enabled = env_var_bool(&format!("{}_ENABLED", prefix), endpoints.enabled);
    }
}

/// 쉼표로 구분된 목록 파싱 (빈 항목 제외)
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// 환경변수에서 값을 파싱 (실패 시 기본값 사용)
fn env_var_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    parse_or(std::env::var(key).ok().as_deref(), default)
}

/// 환경변수에서 bool 값 파싱
fn env_var_bool(key: &str, default: bool) -> bool {
    parse_bool_or(std::env::var(key).ok().as_deref(), default)
}

fn parse_or<T: std::str::FromStr>(raw: Option<&str>, default: T) -> T {
    raw.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn parse_bool_or(raw: Option<&str>, default: bool) -> bool {
    raw.map(|v| v == "true" || v == "1").unwrap_or(default)
}

/// 환경변수에서 쉼표 목록 파싱
fn env_var_list(key: &str) -> Option<Vec<String>> {
    std::env::var(key).ok().map(|v| parse_list(&v))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list("BTCUSDT, ethusdt,,"), vec!["BTCUSDT", "ethusdt"]);
        assert!(parse_list(" ").is_empty());
    }

    #[test]
    fn test_value_parsers_fall_back_to_default() {
        assert_eq!(parse_or(Some(" 42 "), 7u64), 42);
        assert_eq!(parse_or(Some("abc"), 7u64), 7);
        assert_eq!(parse_or(None, 7u64), 7);
        assert!(parse_bool_or(Some("1"), false));
        assert!(parse_bool_or(Some("true"), false));
        assert!(!parse_bool_or(Some("abc"), true));
        assert!(parse_bool_or(None, true));
    }

    #[test]
    fn test_env_helpers_read_missing_as_default() {
        assert_eq!(env_var_parse("DEPTH_COLLECTOR_TEST_MISSING", 7u64), 7);
        assert!(env_var_bool("DEPTH_COLLECTOR_TEST_MISSING", true));
        assert_eq!(env_var_list("DEPTH_COLLECTOR_TEST_MISSING"), None);
    }

    #[test]
    fn test_validate() {
        let config = CollectorConfig::default();
        assert!(config.validate().is_ok());

        let mut zero_size = config.clone();
        zero_size.app.aggregator.size = 0;
        assert!(matches!(zero_size.validate(), Err(CollectorError::Config(_))));

        let mut none_enabled = config;
        for endpoints in none_enabled.app.exchanges.0.values_mut() {
            endpoints.enabled = false;
        }
        assert!(none_enabled.validate().is_err());
    }
}

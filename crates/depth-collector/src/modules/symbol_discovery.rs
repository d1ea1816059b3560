//! 심볼 탐색 모듈.

use depth_core::{feed_span, Exchange, ExchangeEndpoints};
use depth_exchange::BinanceRestClient;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::DiscoveryConfig;
use crate::{CollectorError, Result};

/// 거래소의 수집 대상 심볼 결정
///
/// 설정에 심볼이 있으면 그대로 쓰고, 없으면 REST로 거래 중인 심볼을 조회합니다.
/// REST 조회는 Binance만 지원합니다. 블랙리스트는 최대 개수 제한 전에 걸러냅니다.
pub async fn discover_symbols(
    exchange: Exchange,
    endpoints: &ExchangeEndpoints,
    discovery: &DiscoveryConfig,
    rest: Option<&BinanceRestClient>,
    cancel: &CancellationToken,
) -> Result<Vec<String>> {
    let span = feed_span!("discover_symbols", exchange);
    async move {
        let source = if !endpoints.symbols.is_empty() {
            endpoints.symbols.clone()
        } else {
            match (exchange, rest) {
                (Exchange::Binance, Some(rest)) => {
                    rest.trading_symbols(discovery.quote_asset.as_deref(), cancel)
                        .await?
                }
                _ => {
                    return Err(CollectorError::Config(format!(
                        "{} 심볼 목록이 비어 있습니다 (REST 조회는 Binance만 지원)",
                        exchange
                    )))
                }
            }
        };

        let symbols = select_symbols(source, &endpoints.blacklist, discovery.max_symbols);
        tracing::info!(
            count = symbols.len(),
            configured = !endpoints.symbols.is_empty(),
            "Symbols discovered"
        );
        Ok(symbols)
    }
    .instrument(span)
    .await
}

/// 블랙리스트와 중복을 제외하고 최대 `max`개까지 고릅니다 (0이면 무제한).
pub fn select_symbols(source: Vec<String>, blacklist: &[String], max: usize) -> Vec<String> {
    let mut selected: Vec<String> = Vec::with_capacity(source.len());
    for symbol in source {
        let symbol = symbol.trim().to_string();
        if symbol.is_empty()
            || blacklist.iter().any(|b| b.eq_ignore_ascii_case(&symbol))
            || selected.iter().any(|s| s.eq_ignore_ascii_case(&symbol))
        {
            continue;
        }
        selected.push(symbol);
        if max > 0 && selected.len() == max {
            break;
        }
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_select_symbols() {
        let source = strings(&["BTCUSDT", "ethusdt", "ETHUSDT", " ", "LUNAUSDT", "SOLUSDT"]);
        let blacklist = strings(&["lunausdt"]);

        assert_eq!(
            select_symbols(source.clone(), &blacklist, 0),
            strings(&["BTCUSDT", "ethusdt", "SOLUSDT"])
        );
        assert_eq!(
            select_symbols(source, &blacklist, 2),
            strings(&["BTCUSDT", "ethusdt"])
        );
    }

    #[tokio::test]
    async fn test_configured_symbols_need_no_rest() {
        let mut endpoints = ExchangeEndpoints::defaults_for(Exchange::Okx);
        endpoints.symbols = strings(&["BTC-USDT", "ETH-USDT"]);
        let discovery = DiscoveryConfig {
            quote_asset: None,
            max_symbols: 1,
        };

        let symbols = discover_symbols(
            Exchange::Okx,
            &endpoints,
            &discovery,
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(symbols, strings(&["BTC-USDT"]));
    }

    #[tokio::test]
    async fn test_unconfigured_non_binance_is_rejected() {
        let endpoints = ExchangeEndpoints::defaults_for(Exchange::Ftx);
        let discovery = DiscoveryConfig {
            quote_asset: Some("USD".to_string()),
            max_symbols: 0,
        };

        let result = discover_symbols(
            Exchange::Ftx,
            &endpoints,
            &discovery,
            None,
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(CollectorError::Config(_))));
    }
}

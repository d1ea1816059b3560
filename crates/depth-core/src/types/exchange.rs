//! 거래소 식별자와 호가 방향.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 지원하는 거래소.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Exchange {
    /// Binance Spot
    Binance,
    /// OKX
    Okx,
    /// FTX
    Ftx,
}

impl Exchange {
    /// 모든 거래소 반환.
    pub fn all() -> [Exchange; 3] {
        [Exchange::Binance, Exchange::Okx, Exchange::Ftx]
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exchange::Binance => write!(f, "binance"),
            Exchange::Okx => write!(f, "okx"),
            Exchange::Ftx => write!(f, "ftx"),
        }
    }
}

impl FromStr for Exchange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "binance" => Ok(Exchange::Binance),
            "okx" | "okex" => Ok(Exchange::Okx),
            "ftx" => Ok(Exchange::Ftx),
            _ => Err(format!("Unknown exchange: {}", s)),
        }
    }
}

/// 호가 방향.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookSide {
    /// 매수 호가
    Bid,
    /// 매도 호가
    Ask,
}

impl fmt::Display for BookSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BookSide::Bid => write!(f, "bid"),
            BookSide::Ask => write!(f, "ask"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_roundtrip_names() {
        for exchange in Exchange::all() {
            assert_eq!(exchange.to_string().parse::<Exchange>().unwrap(), exchange);
        }
        assert_eq!("OKEX".parse::<Exchange>().unwrap(), Exchange::Okx);
        assert!("kraken".parse::<Exchange>().is_err());
    }
}

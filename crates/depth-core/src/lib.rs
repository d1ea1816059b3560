//! # Depth Core
//!
//! 호가 수집기의 핵심 도메인 모델과 집계 로직을 제공합니다.
//!
//! 이 크레이트는 수집 파이프라인 전반에서 사용되는 기본 구성요소를 제공합니다:
//! - 호가 갱신, 가격 레벨, 집계 행 타입
//! - 거래소/심볼별 인메모리 호가창 저장소
//! - top-K 호가 집계기
//! - 시계 추상화
//! - 설정 관리
//! - 로깅 인프라

pub mod aggregation;
pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod orderbook;
pub mod types;

pub use aggregation::{OrderbookAggregator, COVERAGE_FALLBACK};
pub use clock::{floor_minute, Clock, ManualClock, SystemClock};
pub use config::*;
pub use error::*;
pub use logging::*;
pub use orderbook::{ApplyOutcome, BookSnapshot, InMemoryOrderbook, OrderBookStore};
pub use types::*;

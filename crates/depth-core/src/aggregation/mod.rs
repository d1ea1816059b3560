//! 호가창 집계.

mod aggregator;
mod topk;

pub use aggregator::{
    aggregate_with_rng, OrderbookAggregator, COVERAGE_FALLBACK, MIN_VARIANCE_SAMPLES,
};
pub use topk::TopK;

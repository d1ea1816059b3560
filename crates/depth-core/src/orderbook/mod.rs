//! 인메모리 호가창과 저장소.

mod book;
mod store;

pub use book::{ApplyOutcome, InMemoryOrderbook, DEFAULT_MAX_LEVELS};
pub use store::{BookKey, BookSnapshot, OrderBookStore};

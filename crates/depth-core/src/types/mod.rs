//! 수집 파이프라인 전반에서 사용되는 공통 타입.

mod depth;
mod exchange;
mod level;
mod row;

pub use depth::*;
pub use exchange::*;
pub use level::*;
pub use row::*;

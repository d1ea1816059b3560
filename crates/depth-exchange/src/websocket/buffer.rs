//! 진행 중인 메시지 하나의 수신 버퍼.

use crate::traits::ExchangeResult;
use crate::ExchangeError;

/// 크기 상한이 있는 증가형 바이트 버퍼.
///
/// 확장 크기는 `max(현재 용량 * 2, 길이 + additional)`이며 `max_size`를 넘지 않습니다.
#[derive(Debug)]
pub struct ReceiveBuffer {
    data: Vec<u8>,
    additional: usize,
    max_size: usize,
}

impl ReceiveBuffer {
    /// 새 버퍼. `additional` 만큼 미리 할당합니다.
    pub fn new(additional: usize, max_size: usize) -> Self {
        let additional = additional.max(1);
        Self {
            data: Vec::with_capacity(additional.min(max_size)),
            additional,
            max_size,
        }
    }

    /// 조각을 덧붙입니다. 상한을 넘으면 `Protocol` 에러.
    pub fn append(&mut self, bytes: &[u8]) -> ExchangeResult<()> {
        let required = self.data.len() + bytes.len();
        if required > self.max_size {
            return Err(ExchangeError::Protocol(format!(
                "Message exceeds {} bytes",
                self.max_size
            )));
        }
        if required > self.data.capacity() {
            let target = (self.data.capacity() * 2)
                .max(self.data.len() + self.additional)
                .max(required)
                .min(self.max_size);
            self.data.reserve_exact(target - self.data.len());
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// 받은 바이트.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// 받은 바이트 수.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// 비어 있는지 여부.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 현재 용량.
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// 내용을 비웁니다. 큰 메시지로 커진 용량은 되돌립니다.
    pub fn clear(&mut self) {
        self.data.clear();
        if self.data.capacity() > self.additional * 4 {
            self.data.shrink_to(self.additional);
        }
    }
}

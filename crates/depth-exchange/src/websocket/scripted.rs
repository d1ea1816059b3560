//! 스크립트 기반 WebSocket 연결.
//!
//! 실제 네트워크 없이 수신 루프를 구동하기 위한 구현입니다. 연결마다 세션 하나를
//! 소비하며, 세션의 조각을 순서대로 돌려준 뒤에는 영원히 대기합니다.
//! 보낸 프레임과 연결 URL은 기록되어 검증에 사용할 수 있습니다.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::socket::{Fragment, WsConnector, WsSink, WsSource};
use crate::traits::ExchangeResult;
use crate::ExchangeError;

#[derive(Debug, Clone)]
enum ScriptStep {
    Fragment(Fragment),
    Fail(String),
    Close,
}

/// 연결 하나가 돌려줄 조각 목록.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSession {
    steps: VecDeque<ScriptStep>,
}

impl ScriptedSession {
    /// 빈 세션.
    pub fn new() -> Self {
        Self::default()
    }

    /// 조각 하나를 추가합니다.
    pub fn fragment(mut self, data: impl Into<Vec<u8>>, end_of_message: bool) -> Self {
        self.steps
            .push_back(ScriptStep::Fragment(Fragment::text(data, end_of_message)));
        self
    }

    /// 한 조각짜리 메시지를 추가합니다.
    pub fn message(self, text: &str) -> Self {
        self.fragment(text.as_bytes(), true)
    }

    /// 메시지를 주어진 오프셋에서 나눠 추가합니다.
    pub fn split_message(mut self, text: &str, offsets: &[usize]) -> Self {
        let bytes = text.as_bytes();
        let mut start = 0;
        for &offset in offsets {
            let end = offset.clamp(start, bytes.len());
            self = self.fragment(&bytes[start..end], false);
            start = end;
        }
        self.fragment(&bytes[start..], true)
    }

    /// 소켓 에러를 추가합니다.
    pub fn fail(mut self, reason: impl Into<String>) -> Self {
        self.steps.push_back(ScriptStep::Fail(reason.into()));
        self
    }

    /// 서버 측 종료를 추가합니다.
    pub fn close(mut self) -> Self {
        self.steps.push_back(ScriptStep::Close);
        self
    }
}

#[derive(Debug, Default)]
struct ScriptLog {
    urls: Vec<String>,
    sent: Vec<String>,
    closes: usize,
}

/// 세션을 순서대로 내어주는 연결 생성기.
#[derive(Debug, Clone, Default)]
pub struct ScriptedConnector {
    sessions: Arc<Mutex<VecDeque<ScriptedSession>>>,
    log: Arc<Mutex<ScriptLog>>,
}

impl ScriptedConnector {
    /// 세션 목록으로 생성합니다.
    pub fn new(sessions: impl IntoIterator<Item = ScriptedSession>) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(sessions.into_iter().collect())),
            log: Arc::default(),
        }
    }

    /// 연결에 사용된 URL들.
    pub fn urls(&self) -> Vec<String> {
        lock(&self.log).urls.clone()
    }

    /// 보낸 텍스트 프레임들.
    pub fn sent_frames(&self) -> Vec<String> {
        lock(&self.log).sent.clone()
    }

    /// 성공한 연결 수.
    pub fn connect_count(&self) -> usize {
        lock(&self.log).urls.len()
    }

    /// 클라이언트가 닫은 연결 수.
    pub fn close_count(&self) -> usize {
        lock(&self.log).closes
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl WsConnector for ScriptedConnector {
    async fn connect(&self, url: &str) -> ExchangeResult<(Box<dyn WsSink>, Box<dyn WsSource>)> {
        let session = lock(&self.sessions)
            .pop_front()
            .ok_or_else(|| ExchangeError::NetworkError(format!("No scripted session for {}", url)))?;
        lock(&self.log).urls.push(url.to_string());

        Ok((
            Box::new(ScriptedSink {
                log: self.log.clone(),
                closed: false,
            }),
            Box::new(ScriptedSource {
                steps: session.steps,
            }),
        ))
    }
}

struct ScriptedSink {
    log: Arc<Mutex<ScriptLog>>,
    closed: bool,
}

#[async_trait]
impl WsSink for ScriptedSink {
    async fn send_text(&mut self, text: &str) -> ExchangeResult<()> {
        if self.closed {
            return Err(ExchangeError::Disconnected("sink closed".to_string()));
        }
        lock(&self.log).sent.push(text.to_string());
        Ok(())
    }

    async fn close(&mut self) -> ExchangeResult<()> {
        if !self.closed {
            self.closed = true;
            lock(&self.log).closes += 1;
        }
        Ok(())
    }
}

struct ScriptedSource {
    steps: VecDeque<ScriptStep>,
}

#[async_trait]
impl WsSource for ScriptedSource {
    async fn receive(&mut self) -> Option<ExchangeResult<Fragment>> {
        match self.steps.pop_front() {
            Some(ScriptStep::Fragment(fragment)) => Some(Ok(fragment)),
            Some(ScriptStep::Fail(reason)) => Some(Err(ExchangeError::WebSocket(reason))),
            Some(ScriptStep::Close) => None,
            None => std::future::pending().await,
        }
    }
}

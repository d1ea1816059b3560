//! 집계 행 싱크.
//!
//! 집계 주기마다 만들어진 `SinkBatch`는 `Arc`로 감싸 모든 싱크에 동시에
//! 전달되며, 마지막 싱크가 반환하면 해제됩니다.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use depth_core::BookRow;
use futures::future::join_all;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::traits::ExchangeResult;
use crate::ExchangeError;

/// 한 집계 주기의 결과.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SinkBatch {
    /// 집계 시각
    pub timestamp: DateTime<Utc>,
    /// 심볼별 집계 행
    pub rows: Vec<BookRow>,
}

impl SinkBatch {
    pub fn new(timestamp: DateTime<Utc>, rows: Vec<BookRow>) -> Self {
        Self { timestamp, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// 집계 행 소비자.
#[async_trait]
pub trait Sink: Send + Sync {
    /// 로그용 이름.
    fn name(&self) -> &str;

    /// 비활성 싱크는 디스패치에서 제외됩니다.
    fn is_disabled(&self) -> bool {
        false
    }

    /// 배치 하나를 처리합니다.
    async fn handle(&self, batch: Arc<SinkBatch>, cancel: &CancellationToken) -> ExchangeResult<()>;
}

/// 디스패치 결과.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// 시작 시 구성되는 싱크 목록.
#[derive(Default)]
pub struct SinkRegistry {
    sinks: Vec<Arc<dyn Sink>>,
}

impl SinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 싱크를 등록합니다.
    pub fn register(&mut self, sink: Arc<dyn Sink>) -> &mut Self {
        self.sinks.push(sink);
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// 활성 싱크 이름.
    pub fn enabled_names(&self) -> Vec<String> {
        self.sinks
            .iter()
            .filter(|s| !s.is_disabled())
            .map(|s| s.name().to_string())
            .collect()
    }

    /// 배치를 활성 싱크에 전달합니다.
    ///
    /// 활성 싱크가 둘 이상이면 동시에 실행합니다. 싱크 에러는 기록만 하고
    /// 다른 싱크에 영향을 주지 않습니다.
    pub async fn dispatch(&self, batch: SinkBatch, cancel: &CancellationToken) -> DispatchReport {
        let batch = Arc::new(batch);
        let enabled: Vec<&Arc<dyn Sink>> =
            self.sinks.iter().filter(|s| !s.is_disabled()).collect();
        let mut report = DispatchReport {
            skipped: self.sinks.len() - enabled.len(),
            ..Default::default()
        };

        let results = if enabled.len() > 1 {
            join_all(enabled.iter().map(|sink| sink.handle(batch.clone(), cancel))).await
        } else {
            let mut results = Vec::with_capacity(enabled.len());
            for sink in &enabled {
                results.push(sink.handle(batch.clone(), cancel).await);
            }
            results
        };

        for (sink, result) in enabled.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(sink = sink.name(), rows = batch.len(), error = %e, "Sink failed");
                }
            }
        }
        debug!(
            rows = batch.len(),
            delivered = report.delivered,
            failed = report.failed,
            "Batch dispatched"
        );
        report
    }
}

impl std::fmt::Debug for SinkRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkRegistry")
            .field("sinks", &self.enabled_names())
            .finish()
    }
}

/// 제한된 채널로 배치를 넘기는 싱크.
///
/// 채널이 가득 차면 이 싱크만 대기합니다.
#[derive(Debug)]
pub struct ChannelSink {
    name: String,
    tx: mpsc::Sender<Arc<SinkBatch>>,
}

impl ChannelSink {
    /// 싱크와 수신 측을 만듭니다.
    pub fn channel(
        name: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Arc<SinkBatch>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                name: name.into(),
                tx,
            },
            rx,
        )
    }
}

#[async_trait]
impl Sink for ChannelSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_disabled(&self) -> bool {
        self.tx.is_closed()
    }

    async fn handle(&self, batch: Arc<SinkBatch>, cancel: &CancellationToken) -> ExchangeResult<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(ExchangeError::Cancelled),
            sent = self.tx.send(batch) => sent.map_err(|_| {
                ExchangeError::Disconnected(format!("{} receiver dropped", self.name))
            }),
        }
    }
}

#[derive(Serialize)]
struct JsonLine<'a> {
    batch_time: DateTime<Utc>,
    #[serde(flatten)]
    row: &'a BookRow,
}

/// 행마다 JSON 한 줄을 파일 끝에 붙이는 싱크.
#[derive(Debug)]
pub struct JsonLinesSink {
    name: String,
    path: PathBuf,
    file: tokio::sync::Mutex<Option<tokio::fs::File>>,
}

impl JsonLinesSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            name: format!("jsonl:{}", path.display()),
            path,
            file: tokio::sync::Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn encode(batch: &SinkBatch) -> ExchangeResult<Vec<u8>> {
        let mut out = Vec::new();
        for row in &batch.rows {
            let line = JsonLine {
                batch_time: batch.timestamp,
                row,
            };
            serde_json::to_writer(&mut out, &line)?;
            out.push(b'\n');
        }
        Ok(out)
    }
}

#[async_trait]
impl Sink for JsonLinesSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, batch: Arc<SinkBatch>, cancel: &CancellationToken) -> ExchangeResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let bytes = Self::encode(&batch)?;

        let write = async {
            let mut file = self.file.lock().await;
            if file.is_none() {
                let opened = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .await
                    .map_err(|e| io_error(&self.path, e))?;
                *file = Some(opened);
            }
            if let Some(file) = file.as_mut() {
                file.write_all(&bytes).await.map_err(|e| io_error(&self.path, e))?;
                file.flush().await.map_err(|e| io_error(&self.path, e))?;
            }
            Ok::<(), ExchangeError>(())
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(ExchangeError::Cancelled),
            result = write => result,
        }
    }
}

fn io_error(path: &Path, e: std::io::Error) -> ExchangeError {
    ExchangeError::Unknown(format!("{}: {}", path.display(), e))
}

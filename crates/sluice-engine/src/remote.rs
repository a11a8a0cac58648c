use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use reqwest::Client;
use tracing::{debug, instrument};

use sluice_core::{ComputationEngine, EngineError, EngineRequest, RawTrace, TraceStream};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Computation engine reached over HTTP.
///
/// The request is POSTed as JSON; the engine answers with a text event
/// stream whose `data:` payloads are trace records. An `event: error` block
/// is an in-band exception, and `data: [DONE]` (or end of body) ends the run.
pub struct HttpEngine {
    name: String,
    url: String,
    client: Client,
    idle_timeout: Duration,
}

impl HttpEngine {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Result<Self, EngineError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| EngineError::Network(e.to_string()))?;
        Ok(Self {
            name: name.into(),
            url: url.into(),
            client,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        })
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ComputationEngine for HttpEngine {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, request), fields(engine = %self.name, pipeline = %request.pipeline))]
    async fn observe(&self, request: &EngineRequest) -> Result<TraceStream, EngineError> {
        let resp = self
            .client
            .post(&self.url)
            .header("accept", "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(|e| EngineError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(EngineError::Status { status, body });
        }

        debug!(url = %self.url, "engine stream opened");
        Ok(Box::pin(TraceSseStream::new(resp.bytes_stream(), self.idle_timeout)))
    }
}

/// Parsed SSE block.
#[derive(Debug, PartialEq)]
enum Block {
    Data { event: Option<String>, data: String },
    Done,
    Empty,
}

/// Parse one blank-line-terminated block. Multiple `data:` lines are joined
/// with newlines; comment lines are ignored.
fn parse_block(raw: &str) -> Block {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();

    for line in raw.lines() {
        if line.starts_with(':') {
            continue;
        }
        if let Some(v) = line.strip_prefix("event:") {
            event = Some(v.trim().to_string());
        } else if let Some(v) = line.strip_prefix("data:") {
            data.push(v.strip_prefix(' ').unwrap_or(v));
        }
    }

    if data.is_empty() {
        return Block::Empty;
    }
    let data = data.join("\n");
    if data.trim() == "[DONE]" {
        return Block::Done;
    }
    Block::Data { event, data }
}

fn block_to_item(event: Option<&str>, data: &str) -> Result<RawTrace, EngineError> {
    if event == Some("error") {
        let message = serde_json::from_str::<serde_json::Value>(data)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or_else(|| data.to_string());
        return Err(EngineError::Raised(message));
    }
    serde_json::from_str(data).map_err(|e| EngineError::Decode(e.to_string()))
}

/// Byte stream to trace records, with an idle timeout: if nothing arrives
/// for `idle_duration`, the stream yields `StreamInterrupted` and ends.
struct TraceSseStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    buffer: Vec<u8>,
    pending: VecDeque<Result<RawTrace, EngineError>>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
}

impl TraceSseStream {
    fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            buffer: Vec::new(),
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            finished: false,
        }
    }

    /// Move every complete block from the buffer into `pending`.
    fn drain_blocks(&mut self) {
        while let Some(pos) = find_blank_line(&self.buffer) {
            let block: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            self.push_block(&String::from_utf8_lossy(&block));
            if self.finished {
                return;
            }
        }
    }

    fn push_block(&mut self, raw: &str) {
        match parse_block(raw) {
            Block::Empty => {}
            Block::Done => self.finished = true,
            Block::Data { event, data } => {
                let item = block_to_item(event.as_deref(), &data);
                if item.is_err() {
                    self.finished = true;
                }
                self.pending.push_back(item);
            }
        }
    }
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\n\n")
}

impl Stream for TraceSseStream {
    type Item = Result<RawTrace, EngineError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Poll::Ready(Some(item));
            }
            if self.finished {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(deadline);
                    self.buffer.extend(bytes.iter().filter(|b| **b != b'\r'));
                    self.drain_blocks();
                }
                Poll::Ready(Some(Err(e))) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(EngineError::StreamInterrupted(e.to_string()))));
                }
                Poll::Ready(None) => {
                    self.finished = true;
                    if !self.buffer.is_empty() {
                        let rest = std::mem::take(&mut self.buffer);
                        self.push_block(&String::from_utf8_lossy(&rest));
                    }
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.finished = true;
                        return Poll::Ready(Some(Err(EngineError::StreamInterrupted(format!(
                            "idle timeout after {}s",
                            self.idle_duration.as_secs()
                        )))));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

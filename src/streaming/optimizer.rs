//! Low-latency streaming with cancellation
//!
//! Each stream runs on its own task and feeds a bounded channel. Streams are
//! registered under a generated id so they can be cancelled; cancelling drops
//! the backend stream, which aborts the underlying request.

use super::buffer::ChunkBuffer;
use super::stats::{LatencyStats, LatencyTracker};
use crate::backend::{GenerationParams, LlmBackend, TokenStream};
use crate::config::StreamingConfig;
use crate::context::{ConversationMessage, Role};
use crate::error::{Result, RuntimeError};
use crate::fast::instant_reply;
use crate::metrics::Metrics;
use dashmap::DashMap;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long a cancelled stream waits for room to deliver its cancellation notice
const CANCEL_NOTICE_TIMEOUT: Duration = Duration::from_millis(500);

/// Called once with the full text when a stream completes normally
pub type CompletionHook = Box<dyn FnOnce(String) + Send + 'static>;

/// One flushed piece of a streamed reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub stream_id: String,
    pub index: usize,
    pub content: String,
    pub is_final: bool,
    /// Time since the stream was requested
    pub elapsed_ms: u64,
}

/// Receiving side of a stream
#[derive(Debug)]
pub struct StreamHandle {
    pub stream_id: String,
    /// True when the reply was synthesized locally
    pub instant: bool,
    receiver: mpsc::Receiver<Result<StreamChunk>>,
}

impl StreamHandle {
    /// Next chunk; `None` once the stream has ended
    pub async fn next(&mut self) -> Option<Result<StreamChunk>> {
        self.receiver.recv().await
    }

    /// Drain the stream into the full reply text
    pub async fn collect_text(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(chunk) = self.next().await {
            let chunk = chunk?;
            text.push_str(&chunk.content);
            if chunk.is_final {
                break;
            }
        }
        Ok(text)
    }
}

/// First-token and inter-chunk latency of one model
#[derive(Debug, Clone, Serialize)]
pub struct ModelPerformance {
    pub first_token: LatencyStats,
    pub chunk_interval: LatencyStats,
}

/// Streaming performance snapshot
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStats {
    pub active_streams: usize,
    pub models: HashMap<String, ModelPerformance>,
}

struct Shared {
    registry: DashMap<String, CancellationToken>,
    first_token: LatencyTracker,
    chunk_interval: LatencyTracker,
    metrics: Option<Arc<Metrics>>,
}

/// Streaming optimizer
pub struct StreamingOptimizer {
    config: StreamingConfig,
    backend: Arc<dyn LlmBackend>,
    shared: Arc<Shared>,
}

impl StreamingOptimizer {
    pub fn new(config: StreamingConfig, backend: Arc<dyn LlmBackend>) -> Self {
        Self::build(config, backend, None)
    }

    pub fn with_metrics(config: StreamingConfig, backend: Arc<dyn LlmBackend>, metrics: Arc<Metrics>) -> Self {
        Self::build(config, backend, Some(metrics))
    }

    fn build(config: StreamingConfig, backend: Arc<dyn LlmBackend>, metrics: Option<Arc<Metrics>>) -> Self {
        let shared = Arc::new(Shared {
            registry: DashMap::new(),
            first_token: LatencyTracker::new(config.latency_samples),
            chunk_interval: LatencyTracker::new(config.latency_samples),
            metrics,
        });
        Self {
            config,
            backend,
            shared,
        }
    }

    /// Sampling parameters biased towards a fast first token
    pub fn speed_params(&self) -> GenerationParams {
        GenerationParams::speed(self.config.max_tokens, self.config.temperature)
    }

    /// Stream a reply, synthesizing it locally when the last user message is
    /// an instant match
    pub async fn stream_response(
        &self,
        model_id: &str,
        messages: Vec<ConversationMessage>,
        on_complete: Option<CompletionHook>,
    ) -> Result<StreamHandle> {
        let instant = messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .and_then(|m| instant_reply(&m.text()));

        match instant {
            Some(reply) => Ok(self.instant_stream(model_id, reply, on_complete)),
            None => self.start_stream(model_id, messages, on_complete).await,
        }
    }

    /// Emit `text` word by word without contacting a backend
    pub fn instant_stream(&self, model_id: &str, text: &str, on_complete: Option<CompletionHook>) -> StreamHandle {
        let (stream_id, token) = self.register();
        let (tx, receiver) = mpsc::channel(self.config.channel_capacity.max(1));
        let words: Vec<String> = text.split_inclusive(' ').map(str::to_string).collect();
        let delay = self.config.instant_word_delay();

        let mut emitter = Emitter::new(stream_id.clone(), model_id, tx, Arc::clone(&self.shared));
        let full = text.to_string();
        debug!(stream_id = %stream_id, words = words.len(), "Starting instant stream");

        tokio::spawn(async move {
            let total = words.len();
            let mut completed = true;
            for (i, word) in words.into_iter().enumerate() {
                if i > 0 {
                    tokio::select! {
                        _ = token.cancelled() => {
                            emitter.cancelled().await;
                            completed = false;
                            break;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                if !emitter.emit(word, i + 1 == total).await {
                    completed = false;
                    break;
                }
            }
            if total == 0 {
                completed = emitter.emit(String::new(), true).await;
            }
            emitter.finish(completed.then_some(full), on_complete);
        });

        StreamHandle {
            stream_id,
            instant: true,
            receiver,
        }
    }

    /// Open a backend stream and relay it in buffered chunks.
    ///
    /// Connection failures are returned directly; failures after the stream
    /// started arrive as an `Err` item.
    pub async fn start_stream(
        &self,
        model_id: &str,
        messages: Vec<ConversationMessage>,
        on_complete: Option<CompletionHook>,
    ) -> Result<StreamHandle> {
        let requested = Instant::now();
        let tokens = self
            .backend
            .stream(model_id, &messages, &self.speed_params())
            .await?;

        let (stream_id, token) = self.register();
        let (tx, receiver) = mpsc::channel(self.config.channel_capacity.max(1));
        let mut emitter = Emitter::new(stream_id.clone(), model_id, tx, Arc::clone(&self.shared));
        emitter.started = requested;
        let buffer = ChunkBuffer::new(self.config.buffer_size);
        info!(stream_id = %stream_id, model_id, "Starting backend stream");

        tokio::spawn(relay(tokens, buffer, emitter, token, on_complete));

        Ok(StreamHandle {
            stream_id,
            instant: false,
            receiver,
        })
    }

    /// Abort a stream; false if no such stream is active
    pub fn cancel_stream(&self, stream_id: &str) -> bool {
        match self.shared.registry.remove(stream_id) {
            Some((_, token)) => {
                token.cancel();
                info!(stream_id, "Stream cancelled");
                true
            }
            None => false,
        }
    }

    /// Abort every active stream
    pub fn cancel_all(&self) -> usize {
        let ids = self.active_streams();
        ids.iter().filter(|id| self.cancel_stream(id)).count()
    }

    pub fn active_streams(&self) -> Vec<String> {
        self.shared
            .registry
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn get_performance_stats(&self) -> PerformanceStats {
        let first_token = self.shared.first_token.all();
        let chunk_interval = self.shared.chunk_interval.all();
        let models = first_token
            .into_iter()
            .map(|(model, first)| {
                let interval = chunk_interval.get(&model).copied().unwrap_or_default();
                (
                    model,
                    ModelPerformance {
                        first_token: first,
                        chunk_interval: interval,
                    },
                )
            })
            .collect();

        PerformanceStats {
            active_streams: self.shared.registry.len(),
            models,
        }
    }

    fn register(&self) -> (String, CancellationToken) {
        let stream_id = uuid::Uuid::new_v4().to_string();
        let token = CancellationToken::new();
        self.shared.registry.insert(stream_id.clone(), token.clone());
        (stream_id, token)
    }
}

async fn relay(
    mut tokens: TokenStream,
    mut buffer: ChunkBuffer,
    mut emitter: Emitter,
    token: CancellationToken,
    on_complete: Option<CompletionHook>,
) {
    let mut full = String::new();

    let completed = loop {
        tokio::select! {
            biased;

            _ = token.cancelled() => {
                emitter.cancelled().await;
                break false;
            }
            item = tokens.next() => match item {
                Some(Ok(delta)) => {
                    full.push_str(&delta);
                    if let Some(chunk) = buffer.push(&delta) {
                        if !emitter.emit(chunk, false).await {
                            break false;
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(stream_id = %emitter.stream_id, error = %e, "Backend stream failed");
                    emitter.fail(e).await;
                    break false;
                }
                None => {
                    let rest = buffer.finish().unwrap_or_default();
                    break emitter.emit(rest, true).await;
                }
            }
        }
    };

    emitter.finish(completed.then_some(full), on_complete);
}

/// Sends chunks for one stream and records their latency
struct Emitter {
    stream_id: String,
    model_id: String,
    tx: mpsc::Sender<Result<StreamChunk>>,
    shared: Arc<Shared>,
    started: Instant,
    last_chunk: Option<Instant>,
    index: usize,
}

impl Emitter {
    fn new(stream_id: String, model_id: &str, tx: mpsc::Sender<Result<StreamChunk>>, shared: Arc<Shared>) -> Self {
        Self {
            stream_id,
            model_id: model_id.to_string(),
            tx,
            shared,
            started: Instant::now(),
            last_chunk: None,
            index: 0,
        }
    }

    /// Send a chunk; false when the receiver has gone away
    async fn emit(&mut self, content: String, is_final: bool) -> bool {
        let now = Instant::now();
        match self.last_chunk {
            None => {
                let latency = now.duration_since(self.started);
                self.shared.first_token.record(&self.model_id, latency);
                if let Some(metrics) = &self.shared.metrics {
                    metrics.record_first_token(&self.model_id, latency);
                }
            }
            Some(previous) => {
                self.shared
                    .chunk_interval
                    .record(&self.model_id, now.duration_since(previous));
            }
        }
        self.last_chunk = Some(now);

        let chunk = StreamChunk {
            stream_id: self.stream_id.clone(),
            index: self.index,
            content,
            is_final,
            elapsed_ms: now.duration_since(self.started).as_millis() as u64,
        };
        self.index += 1;

        if self.tx.send(Ok(chunk)).await.is_err() {
            debug!(stream_id = %self.stream_id, "Receiver dropped, stopping stream");
            return false;
        }
        true
    }

    async fn fail(&self, error: RuntimeError) {
        let _ = self.tx.send(Err(error)).await;
    }

    async fn cancelled(&self) {
        if let Some(metrics) = &self.shared.metrics {
            metrics.record_stream_cancelled();
        }
        let notice = Err(RuntimeError::StreamCancelled(self.stream_id.clone()));
        match tokio::time::timeout(CANCEL_NOTICE_TIMEOUT, self.tx.send(notice)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => debug!(stream_id = %self.stream_id, "Receiver dropped before cancellation notice"),
            Err(_) => warn!(stream_id = %self.stream_id, "Cancellation notice not delivered: channel stayed full"),
        }
    }

    fn finish(self, full_text: Option<String>, on_complete: Option<CompletionHook>) {
        self.shared.registry.remove(&self.stream_id);
        let elapsed: Duration = self.started.elapsed();
        match full_text {
            Some(text) => {
                debug!(
                    stream_id = %self.stream_id,
                    chunks = self.index,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Stream completed"
                );
                if let Some(hook) = on_complete {
                    hook(text);
                }
            }
            None => debug!(stream_id = %self.stream_id, "Stream ended early"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBackend;
    use std::sync::Mutex;

    fn optimizer(mock: MockBackend) -> StreamingOptimizer {
        let config = StreamingConfig {
            buffer_size: 2,
            instant_word_delay_ms: 1,
            ..StreamingConfig::default()
        };
        StreamingOptimizer::new(config, Arc::new(mock))
    }

    #[tokio::test]
    async fn test_buffered_backend_stream() {
        let mock = MockBackend::new("unused").with_tokens(["Hello", " world", ".", " How", " are", " you", "?"]);
        let streaming = optimizer(mock);

        let mut handle = streaming
            .start_stream("gpt-4o", vec![ConversationMessage::user("Hi there, tell me something")], None)
            .await
            .unwrap();

        let mut chunks = Vec::new();
        while let Some(chunk) = handle.next().await {
            chunks.push(chunk.unwrap());
        }

        let contents: Vec<&str> = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(contents, vec!["Hello world", ".", " How are", " you?", ""]);
        assert!(chunks.last().unwrap().is_final);
        assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);

        let stats = streaming.get_performance_stats();
        assert_eq!(stats.models["gpt-4o"].first_token.samples, 1);
        assert_eq!(stats.models["gpt-4o"].chunk_interval.samples, 4);
    }

    #[tokio::test]
    async fn test_instant_stream_and_completion_hook() {
        let mock = Arc::new(MockBackend::new("unused"));
        let streaming = StreamingOptimizer::new(StreamingConfig::default(), Arc::clone(&mock) as Arc<dyn LlmBackend>);
        let captured = Arc::new(Mutex::new(None::<String>));
        let sink = Arc::clone(&captured);

        let handle = streaming
            .stream_response(
                "gpt-4o",
                vec![ConversationMessage::user("thanks!")],
                Some(Box::new(move |text: String| *sink.lock().unwrap() = Some(text))),
            )
            .await
            .unwrap();
        assert!(handle.instant);

        let text = handle.collect_text().await.unwrap();
        assert!(!text.is_empty());
        assert_eq!(mock.stream_calls(), 0);

        // the hook runs right after the final chunk is sent
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(captured.lock().unwrap().as_deref(), Some(text.as_str()));
        assert!(streaming.active_streams().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stream() {
        let tokens: Vec<String> = (0..50).map(|i| format!("t{} ", i)).collect();
        let mock = MockBackend::new("unused")
            .with_tokens(tokens)
            .with_token_delay(Duration::from_millis(20));
        let streaming = optimizer(mock);
        let completed = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&completed);

        let mut handle = streaming
            .start_stream(
                "gpt-4o",
                vec![ConversationMessage::user("Write a long essay")],
                Some(Box::new(move |_: String| *flag.lock().unwrap() = true)),
            )
            .await
            .unwrap();
        assert_eq!(streaming.active_streams(), vec![handle.stream_id.clone()]);

        let first = handle.next().await.unwrap().unwrap();
        assert_eq!(first.index, 0);
        assert!(streaming.cancel_stream(&handle.stream_id));
        assert!(!streaming.cancel_stream(&handle.stream_id));

        let mut saw_cancel = false;
        while let Some(item) = handle.next().await {
            if let Err(RuntimeError::StreamCancelled(id)) = item {
                assert_eq!(id, handle.stream_id);
                saw_cancel = true;
            }
        }
        assert!(saw_cancel);
        assert!(!*completed.lock().unwrap());
        assert!(streaming.active_streams().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_notice_reaches_slow_consumer() {
        let tokens: Vec<String> = (0..50).map(|i| format!("t{} ", i)).collect();
        let config = StreamingConfig {
            buffer_size: 1,
            channel_capacity: 1,
            ..StreamingConfig::default()
        };
        let streaming = StreamingOptimizer::new(config, Arc::new(MockBackend::new("unused").with_tokens(tokens)));

        let mut handle = streaming
            .start_stream("gpt-4o", vec![ConversationMessage::user("Write a long essay")], None)
            .await
            .unwrap();

        // let the relay fill the channel and block on the next send
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(streaming.cancel_stream(&handle.stream_id));

        let mut delivered = 0;
        let mut saw_cancel = false;
        while let Some(item) = handle.next().await {
            match item {
                Ok(chunk) => {
                    assert!(!chunk.is_final);
                    delivered += 1;
                }
                Err(RuntimeError::StreamCancelled(id)) => {
                    assert_eq!(id, handle.stream_id);
                    saw_cancel = true;
                }
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert!(saw_cancel);
        assert!(delivered < 50);
    }

    #[tokio::test]
    async fn test_mid_stream_failure_is_forwarded() {
        let mock = MockBackend::new("one two three four").with_stream_failure_after(1);
        let streaming = optimizer(mock);
        let handle = streaming
            .start_stream("gpt-4o", vec![ConversationMessage::user("Count for me")], None)
            .await
            .unwrap();

        let err = handle.collect_text().await.unwrap_err();
        assert!(matches!(err, RuntimeError::Backend { .. }));
    }

    #[tokio::test]
    async fn test_connection_failure_is_returned() {
        let streaming = optimizer(MockBackend::new("x").with_failure("refused"));
        let result = streaming
            .start_stream("gpt-4o", vec![ConversationMessage::user("Anything at all")], None)
            .await;
        assert!(result.is_err());
        assert!(streaming.active_streams().is_empty());
    }
}

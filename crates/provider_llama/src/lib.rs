use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use core_types::{
    BackendEvent, BackendEventStream, BackendHealth, GenerationRequest, InferenceBackend,
};
use futures::{Stream, StreamExt, TryStreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("llama-server request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("llama-server returned {status}: {body}")]
    Status { status: u16, body: String },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct WireMessage {
    pub role: String,
    pub content: String,
}

impl WireMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

type SessionMap = Arc<Mutex<HashMap<String, Vec<WireMessage>>>>;

/// Client for a local llama.cpp `llama-server` speaking the OpenAI-compatible
/// chat completions API. Each backend session keeps its own message history.
pub struct LlamaServerBackend {
    client: reqwest::Client,
    base_url: String,
    sessions: SessionMap,
}

impl LlamaServerBackend {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            sessions: Arc::default(),
        }
    }

    pub fn from_port(port: u16) -> Self {
        Self::new(format!("http://localhost:{port}"))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn session_history(&self, session_id: &str) -> Vec<WireMessage> {
        self.sessions
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

#[async_trait]
impl InferenceBackend for LlamaServerBackend {
    async fn send_message(&self, request: GenerationRequest) -> Result<BackendEventStream> {
        let mut messages = self.session_history(&request.session_id);
        messages.push(WireMessage::new("user", request.message.as_str()));

        let body = json!({
            "messages": messages,
            "stream": true,
            "temperature": request.params.temperature,
            "max_tokens": request.params.max_tokens,
        });
        let response = self
            .client
            .post(self.endpoint("/v1/chat/completions"))
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(BackendError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            }
            .into());
        }

        debug!(session = %request.session_id, history = messages.len() - 1, "streaming completion");
        let commit = HistoryCommit {
            sessions: Arc::clone(&self.sessions),
            session_id: request.session_id,
            user_message: request.message,
        };
        let bytes = Box::pin(response.bytes_stream().map_err(BackendError::Http));
        Ok(event_stream(bytes, commit))
    }

    async fn clear_session(&self, session_id: &str) -> Result<()> {
        self.sessions.lock().remove(session_id);
        Ok(())
    }

    async fn health(&self) -> Result<BackendHealth> {
        let response = self
            .client
            .get(self.endpoint("/health"))
            .send()
            .await
            .map_err(BackendError::Http)?;
        let status = response.status();
        let text = response.text().await.map_err(BackendError::Http)?;
        let reported = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|value| value.get("status").and_then(Value::as_str).map(str::to_string));

        Ok(BackendHealth {
            ok: status.is_success(),
            status: reported.unwrap_or_else(|| status.to_string()),
        })
    }
}

struct HistoryCommit {
    sessions: SessionMap,
    session_id: String,
    user_message: String,
}

impl HistoryCommit {
    fn apply(self, reply: String) {
        let mut sessions = self.sessions.lock();
        let history = sessions.entry(self.session_id).or_default();
        history.push(WireMessage::new("user", self.user_message));
        history.push(WireMessage::new("assistant", reply));
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Signal {
    Delta(String),
    Done,
}

/// Buffers raw bytes and yields complete lines, so multi-byte characters split
/// across network chunks decode correctly.
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<Signal> {
        self.buffer.extend_from_slice(bytes);
        let mut signals = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=newline).collect();
            signals.extend(parse_sse_line(&String::from_utf8_lossy(&line)));
        }
        signals
    }

    fn finish(&mut self) -> Option<Signal> {
        let rest = std::mem::take(&mut self.buffer);
        parse_sse_line(&String::from_utf8_lossy(&rest))
    }
}

fn parse_sse_line(line: &str) -> Option<Signal> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let payload = line.strip_prefix("data:").map_or(line, str::trim);
    if payload == "[DONE]" {
        return Some(Signal::Done);
    }

    let value: Value = match serde_json::from_str(payload) {
        Ok(value) => value,
        Err(err) => {
            warn!(error = %err, "skipping malformed stream line");
            return None;
        }
    };
    value["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|text| !text.is_empty())
        .map(|text| Signal::Delta(text.to_string()))
}

struct StreamState<S> {
    body: S,
    decoder: SseDecoder,
    pending: VecDeque<Signal>,
    reply: String,
    commit: Option<HistoryCommit>,
    finished: bool,
}

fn event_stream<S, B>(body: S, commit: HistoryCommit) -> BackendEventStream
where
    S: Stream<Item = Result<B, BackendError>> + Send + Unpin + 'static,
    B: AsRef<[u8]>,
{
    let state = StreamState {
        body,
        decoder: SseDecoder::default(),
        pending: VecDeque::new(),
        reply: String::new(),
        commit: Some(commit),
        finished: false,
    };

    let stream = futures::stream::unfold(state, |mut state| async move {
        loop {
            if state.finished {
                return None;
            }

            if let Some(signal) = state.pending.pop_front() {
                let event = match signal {
                    Signal::Delta(text) => {
                        state.reply.push_str(&text);
                        BackendEvent::Chunk { text }
                    }
                    Signal::Done => {
                        state.finished = true;
                        if let Some(commit) = state.commit.take() {
                            commit.apply(std::mem::take(&mut state.reply));
                        }
                        BackendEvent::Done
                    }
                };
                return Some((Ok(event), state));
            }

            match state.body.next().await {
                Some(Ok(bytes)) => {
                    let signals = state.decoder.push(bytes.as_ref());
                    state.pending.extend(signals);
                }
                Some(Err(err)) => {
                    state.finished = true;
                    return Some((Err(err.into()), state));
                }
                None => {
                    state.pending.extend(state.decoder.finish());
                    state.pending.push_back(Signal::Done);
                }
            }
        }
    });

    Box::pin(stream)
}

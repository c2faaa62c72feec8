use std::sync::Arc;

use anyhow::Result;
use config::AppConfig;
use core_types::{
    BackendEvent, BackendSessionId, ConversationId, GenerationParams, GenerationRequest,
    InferenceBackend, MessageRole,
};
use futures::StreamExt;
use memory_retrieval::{ContextRetriever, DEFAULT_TOKEN_BUDGET};
use storage_sqlite::{SqliteStorage, StorageError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const MAX_TITLE_CHARS: usize = 60;
const TITLE_QUOTES: &[char] = &['"', '\'', '`', '\u{201c}', '\u{201d}', '\u{2018}', '\u{2019}'];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Sending,
    Streaming,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionMessage {
    pub role: MessageRole,
    pub content: String,
    pub in_progress: bool,
}

impl SessionMessage {
    fn finished(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            in_progress: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionOptions {
    pub params: GenerationParams,
    pub retrieval_enabled: bool,
    pub token_budget: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            params: GenerationParams::default(),
            retrieval_enabled: true,
            token_budget: DEFAULT_TOKEN_BUDGET,
        }
    }
}

impl SessionOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            params: config.generation_params(),
            retrieval_enabled: config.retrieval.enabled,
            token_budget: config.retrieval.token_budget,
        }
    }
}

pub struct ChatSession {
    backend: Arc<dyn InferenceBackend>,
    storage: SqliteStorage,
    retriever: ContextRetriever,
    options: SessionOptions,
    session_id: BackendSessionId,
    conversation_id: Option<ConversationId>,
    needs_title: bool,
    messages: Vec<SessionMessage>,
    error: Option<String>,
    status: watch::Sender<SessionStatus>,
    title_task: Option<JoinHandle<()>>,
}

impl ChatSession {
    pub fn new(
        backend: Arc<dyn InferenceBackend>,
        storage: SqliteStorage,
        options: SessionOptions,
    ) -> Self {
        let (status, _) = watch::channel(SessionStatus::Idle);
        Self {
            backend,
            retriever: ContextRetriever::new(storage.clone()),
            storage,
            options,
            session_id: new_session_id("chat"),
            conversation_id: None,
            needs_title: false,
            messages: Vec::new(),
            error: None,
            status,
            title_task: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn messages(&self) -> &[SessionMessage] {
        &self.messages
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn conversation_id(&self) -> Option<ConversationId> {
        self.conversation_id
    }

    pub async fn send(&mut self, content: &str) {
        self.send_with(content, |_| {}).await;
    }

    /// Runs one exchange, handing every streamed chunk to `on_chunk`. Failures
    /// end up in [`ChatSession::error`]; the user message stays visible and
    /// persisted.
    pub async fn send_with<F>(&mut self, content: &str, mut on_chunk: F)
    where
        F: FnMut(&str),
    {
        let content = content.trim();
        if content.is_empty() {
            return;
        }

        self.error = None;
        self.set_status(SessionStatus::Sending);
        self.messages
            .push(SessionMessage::finished(MessageRole::User, content));

        match self.exchange(content, &mut on_chunk).await {
            Ok(()) => self.set_status(SessionStatus::Done),
            Err(err) => {
                error!(error = %err, conversation_id = ?self.conversation_id, "chat send failed");
                self.close_in_progress();
                self.error = Some(err.to_string());
                self.set_status(SessionStatus::Failed);
            }
        }
    }

    async fn exchange<F>(&mut self, content: &str, on_chunk: &mut F) -> Result<()>
    where
        F: FnMut(&str),
    {
        let conversation_id = self.ensure_conversation().await?;
        self.storage
            .save_message(conversation_id, MessageRole::User, content)
            .await?;

        let context = self.retrieve_context(content, conversation_id).await;
        let request = GenerationRequest {
            session_id: self.session_id.clone(),
            message: compose_prompt(&context, content),
            params: self.options.params,
        };
        let mut stream = self.backend.send_message(request).await?;
        self.set_status(SessionStatus::Streaming);

        while let Some(event) = stream.next().await {
            match event? {
                BackendEvent::Chunk { text } => {
                    self.append_chunk(&text);
                    on_chunk(&text);
                }
                BackendEvent::Done => break,
            }
        }

        let reply = self.close_in_progress().unwrap_or_default();
        if reply.is_empty() {
            warn!(conversation_id, "backend finished without any content");
            return Ok(());
        }
        self.storage
            .save_message(conversation_id, MessageRole::Assistant, &reply)
            .await?;

        if std::mem::take(&mut self.needs_title) {
            self.spawn_title(conversation_id, content.to_string(), reply);
        }
        Ok(())
    }

    async fn ensure_conversation(&mut self) -> Result<ConversationId> {
        if let Some(id) = self.conversation_id {
            return Ok(id);
        }
        let id = self.storage.create_conversation(None).await?;
        self.conversation_id = Some(id);
        self.needs_title = true;
        Ok(id)
    }

    async fn retrieve_context(&self, content: &str, conversation_id: ConversationId) -> String {
        if !self.options.retrieval_enabled {
            return String::new();
        }
        match self
            .retriever
            .find_relevant_context(content, conversation_id, self.options.token_budget)
            .await
        {
            Ok(context) => context,
            Err(err) => {
                warn!(error = %err, "context retrieval failed; sending without it");
                String::new()
            }
        }
    }

    fn append_chunk(&mut self, text: &str) {
        match self.messages.last_mut() {
            Some(message) if message.in_progress => message.content.push_str(text),
            _ => self.messages.push(SessionMessage {
                role: MessageRole::Assistant,
                content: text.to_string(),
                in_progress: true,
            }),
        }
    }

    fn close_in_progress(&mut self) -> Option<String> {
        let message = self.messages.last_mut().filter(|m| m.in_progress)?;
        message.in_progress = false;
        Some(message.content.clone())
    }

    fn spawn_title(&mut self, conversation_id: ConversationId, question: String, answer: String) {
        let backend = Arc::clone(&self.backend);
        let storage = self.storage.clone();
        let params = self.options.params;
        self.title_task = Some(tokio::spawn(async move {
            if let Err(err) =
                generate_title(backend, storage, conversation_id, &question, &answer, params).await
            {
                debug!(error = %err, conversation_id, "title generation failed");
            }
        }));
    }

    pub async fn resume(&mut self, conversation_id: ConversationId) -> Result<()> {
        if self.storage.get_conversation(conversation_id).await?.is_none() {
            return Err(StorageError::ConversationNotFound(conversation_id).into());
        }
        let history = self
            .storage
            .get_conversation_history(conversation_id)
            .await?;

        self.reset_backend_session().await;
        self.messages = history
            .into_iter()
            .map(|message| SessionMessage::finished(message.role, message.content))
            .collect();
        self.conversation_id = Some(conversation_id);
        self.needs_title = false;
        self.error = None;
        self.set_status(SessionStatus::Idle);
        info!(conversation_id, messages = self.messages.len(), "resumed conversation");
        Ok(())
    }

    pub async fn new_chat(&mut self) {
        self.reset_backend_session().await;
        self.conversation_id = None;
        self.needs_title = false;
        self.messages.clear();
        self.error = None;
        self.set_status(SessionStatus::Idle);
    }

    /// Like [`ChatSession::new_chat`], but also cancels a pending title
    /// request.
    pub async fn clear(&mut self) {
        if let Some(task) = self.title_task.take() {
            task.abort();
        }
        self.new_chat().await;
    }

    pub async fn destroy(mut self) {
        self.clear().await;
    }

    pub async fn finish_background_tasks(&mut self) {
        if let Some(task) = self.title_task.take() {
            if let Err(err) = task.await {
                debug!(error = %err, "title task ended abnormally");
            }
        }
    }

    async fn reset_backend_session(&mut self) {
        let previous = std::mem::replace(&mut self.session_id, new_session_id("chat"));
        if let Err(err) = self.backend.clear_session(&previous).await {
            warn!(error = %err, session = %previous, "failed to clear backend session");
        }
    }

    fn set_status(&self, status: SessionStatus) {
        self.status.send_replace(status);
    }
}

fn new_session_id(prefix: &str) -> BackendSessionId {
    format!("{prefix}-{}", uuid::Uuid::new_v4())
}

fn compose_prompt(context: &str, content: &str) -> String {
    if context.is_empty() {
        return content.to_string();
    }
    format!("Relevant context from earlier conversations:\n{context}\n\nUser message:\n{content}")
}

fn title_prompt(question: &str, answer: &str) -> String {
    format!(
        "Write a short title of at most 6 words for this conversation. \
         Reply with the title only.\n\nUser: {question}\nAssistant: {answer}"
    )
}

async fn generate_title(
    backend: Arc<dyn InferenceBackend>,
    storage: SqliteStorage,
    conversation_id: ConversationId,
    question: &str,
    answer: &str,
    params: GenerationParams,
) -> Result<()> {
    let session_id = new_session_id("title");
    let request = GenerationRequest {
        session_id: session_id.clone(),
        message: title_prompt(question, answer),
        params: GenerationParams {
            max_tokens: params.max_tokens.min(32),
            ..params
        },
    };

    let outcome = collect_reply(backend.as_ref(), request).await;
    if let Err(err) = backend.clear_session(&session_id).await {
        debug!(error = %err, session = %session_id, "failed to clear title session");
    }

    let Some(title) = clean_title(&outcome?) else {
        return Ok(());
    };
    storage
        .update_conversation_title(conversation_id, &title)
        .await?;
    debug!(conversation_id, %title, "named conversation");
    Ok(())
}

async fn collect_reply(backend: &dyn InferenceBackend, request: GenerationRequest) -> Result<String> {
    let mut stream = backend.send_message(request).await?;
    let mut reply = String::new();
    while let Some(event) = stream.next().await {
        match event? {
            BackendEvent::Chunk { text } => reply.push_str(&text),
            BackendEvent::Done => break,
        }
    }
    Ok(reply)
}

fn clean_title(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|line| !line.is_empty())?;
    let stripped = line.trim_matches(|c: char| c.is_whitespace() || TITLE_QUOTES.contains(&c));
    let title: String = stripped.chars().take(MAX_TITLE_CHARS).collect();
    let title = title.trim_end();
    (!title.is_empty()).then(|| title.to_string())
}

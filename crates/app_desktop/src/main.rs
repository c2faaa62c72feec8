use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::{fs, path::Path};

use anyhow::{Context, Result};
use config::{AppConfig, ConfigStore};
use core_orchestrator::{ChatSession, SessionOptions};
use core_types::{ConversationId, InferenceBackend, MessageRole};
use markdown_render::MarkdownRenderer;
use provider_llama::LlamaServerBackend;
use storage_sqlite::SqliteStorage;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

enum Command<'a> {
    Send(&'a str),
    New,
    List,
    Open(&'a str),
    Title(&'a str),
    Delete(&'a str),
    Html,
    Quit,
    Unknown(&'a str),
}

impl<'a> Command<'a> {
    fn parse(line: &'a str) -> Self {
        let Some(rest) = line.strip_prefix('/') else {
            return Command::Send(line);
        };
        let (name, arg) = rest.split_once(' ').unwrap_or((rest, ""));
        let arg = arg.trim();
        match name {
            "new" => Command::New,
            "list" => Command::List,
            "open" => Command::Open(arg),
            "title" => Command::Title(arg),
            "delete" => Command::Delete(arg),
            "html" => Command::Html,
            "quit" | "exit" => Command::Quit,
            _ => Command::Unknown(name),
        }
    }
}

struct Shell {
    session: ChatSession,
    storage: SqliteStorage,
    renderer: MarkdownRenderer,
    history_limit: u32,
}

impl Shell {
    async fn handle(&mut self, line: &str) -> Result<bool> {
        match Command::parse(line) {
            Command::Send(content) => self.send(content).await,
            Command::New => {
                self.session.new_chat().await;
                println!("started a new chat");
            }
            Command::List => self.list().await?,
            Command::Open(arg) => {
                let id = parse_id(arg)?;
                self.session.resume(id).await?;
                for message in self.session.messages() {
                    println!("{}: {}", label(message.role), message.content);
                }
            }
            Command::Title(title) => {
                let id = self
                    .session
                    .conversation_id()
                    .context("no active conversation to rename")?;
                anyhow::ensure!(!title.is_empty(), "usage: /title <text>");
                self.storage.update_conversation_title(id, title).await?;
                println!("renamed conversation {id}");
            }
            Command::Delete(arg) => {
                let id = parse_id(arg)?;
                self.storage.delete_conversation(id).await?;
                if self.session.conversation_id() == Some(id) {
                    self.session.new_chat().await;
                }
                println!("deleted conversation {id}");
            }
            Command::Html => self.print_html(),
            Command::Quit => {
                self.session.finish_background_tasks().await;
                return Ok(false);
            }
            Command::Unknown(name) => println!("unknown command /{name}"),
        }
        Ok(true)
    }

    async fn send(&mut self, content: &str) {
        print!("assistant: ");
        self.session
            .send_with(content, |chunk| {
                print!("{chunk}");
                let _ = std::io::stdout().flush();
            })
            .await;
        println!();
        if let Some(err) = self.session.error() {
            println!("error: {err}");
        }
    }

    async fn list(&self) -> Result<()> {
        let conversations = self
            .storage
            .get_recent_conversations(Some(self.history_limit))
            .await?;
        if conversations.is_empty() {
            println!("no conversations yet");
        }
        for conversation in conversations {
            let marker = if self.session.conversation_id() == Some(conversation.id) {
                "*"
            } else {
                " "
            };
            println!(
                "{marker} {:>4}  {}  {}",
                conversation.id,
                conversation.updated_at.format("%Y-%m-%d %H:%M"),
                conversation.title
            );
        }
        Ok(())
    }

    fn print_html(&self) {
        let last_reply = self
            .session
            .messages()
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::Assistant);
        match last_reply {
            Some(message) => println!("{}", self.renderer.render(&message.content)),
            None => println!("no assistant reply to render"),
        }
    }
}

fn parse_id(arg: &str) -> Result<ConversationId> {
    arg.parse()
        .with_context(|| format!("expected a conversation id, got `{arg}`"))
}

fn label(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "you",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
    }
}

async fn run(data_dir: &Path, config: AppConfig) -> Result<()> {
    let storage = SqliteStorage::connect(data_dir.join("history.db"))
        .await
        .context("failed to open conversation store")?;

    let backend = Arc::new(LlamaServerBackend::from_port(config.server_port));
    match backend.health().await {
        Ok(health) if health.ok => info!(status = %health.status, "llama-server reachable"),
        Ok(health) => warn!(status = %health.status, "llama-server not ready"),
        Err(err) => warn!(error = %err, url = backend.base_url(), "llama-server unreachable"),
    }

    let mut shell = Shell {
        session: ChatSession::new(
            backend,
            storage.clone(),
            SessionOptions::from_config(&config),
        ),
        storage,
        renderer: MarkdownRenderer::new().with_code_counter(Arc::new(AtomicU64::new(0))),
        history_limit: u32::try_from(config.chat_history_limit).unwrap_or(u32::MAX),
    };

    println!("commands: /new /list /open <id> /title <text> /delete <id> /html /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match shell.handle(line).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                error!(error = %err, command = line, "command failed");
                println!("error: {err:#}");
            }
        }
    }
    Ok(())
}

fn main() {
    let mut data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
    data_dir.push("llama-desktop");
    if let Err(err) = fs::create_dir_all(&data_dir) {
        eprintln!("failed to prepare data dir: {err}");
    }
    let _log_guard = init_local_logger(&data_dir.join("logs"));

    let config_store =
        ConfigStore::from_default_location().unwrap_or_else(|_| ConfigStore::from_dir(&data_dir));
    let config = match config_store.load_or_init() {
        Ok(cfg) => cfg,
        Err(err) => {
            error!("failed to load config: {err}");
            AppConfig::default()
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to create tokio runtime: {err}");
            return;
        }
    };

    if let Err(err) = runtime.block_on(run(&data_dir, config)) {
        error!(error = %err, "shell exited with an error");
        eprintln!("{err:#}");
    }
}

fn init_local_logger(log_dir: &Path) -> tracing_appender::non_blocking::WorkerGuard {
    if let Err(err) = fs::create_dir_all(log_dir) {
        eprintln!("failed to create log dir `{}`: {err}", log_dir.display());
    }
    let file_appender = tracing_appender::rolling::daily(log_dir, "llama-desktop.log");
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,app_desktop=debug"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .json()
        .with_writer(writer)
        .init();

    guard
}

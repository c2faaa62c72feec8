use std::collections::HashSet;

use anyhow::Result;
use core_types::{ChatMessage, ConversationId, MessageRole};
use storage_sqlite::{SqliteStorage, extract_keywords};
use tracing::debug;

pub const DEFAULT_TOKEN_BUDGET: usize = 2000;

#[derive(Debug, Clone, PartialEq)]
pub struct ScoringConfig {
    pub per_message_overhead: usize,
    pub max_messages: usize,
    pub min_score: f64,
    pub user_role_bonus: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            per_message_overhead: 10,
            max_messages: 5,
            min_score: 1.0,
            user_role_bonus: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMessage {
    pub message: ChatMessage,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub struct ContextRetriever {
    storage: SqliteStorage,
    config: ScoringConfig,
}

impl ContextRetriever {
    pub fn new(storage: SqliteStorage) -> Self {
        Self {
            storage,
            config: ScoringConfig::default(),
        }
    }

    pub fn with_config(mut self, config: ScoringConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub async fn find_relevant_context(
        &self,
        query: &str,
        exclude_conversation: ConversationId,
        token_budget: usize,
    ) -> Result<String> {
        let query_keywords = extract_keywords(query);
        if query_keywords.is_empty() {
            return Ok(String::new());
        }

        let candidates = self
            .storage
            .find_messages_by_keywords(&query_keywords)
            .await?;
        let candidate_count = candidates.len();

        let ranked = rank_candidates(
            candidates,
            &query_keywords,
            exclude_conversation,
            &self.config,
        );
        let selected = select_within_budget(ranked, token_budget, &self.config);
        debug!(
            keywords = query_keywords.len(),
            candidates = candidate_count,
            selected = selected.len(),
            "retrieved long-term context"
        );

        Ok(format_context(selected))
    }
}

pub fn rank_candidates(
    candidates: Vec<ChatMessage>,
    query_keywords: &[String],
    exclude_conversation: ConversationId,
    config: &ScoringConfig,
) -> Vec<ScoredMessage> {
    let query: HashSet<&str> = query_keywords.iter().map(String::as_str).collect();

    let mut scored: Vec<ScoredMessage> = candidates
        .into_iter()
        .filter(|message| message.conversation_id != exclude_conversation)
        .map(|message| {
            let matches = message
                .keywords
                .iter()
                .filter(|keyword| query.contains(keyword.as_str()))
                .count();
            let mut score = matches as f64;
            if message.role == MessageRole::User {
                score += config.user_role_bonus;
            }
            ScoredMessage { message, score }
        })
        .collect();

    scored.sort_by(|a, b| b.score.total_cmp(&a.score));
    scored
}

/// Greedy pick from the top of `ranked`. Stops at the first message that would
/// overflow `token_budget` or once `max_messages` are taken; the result is in
/// chronological order.
pub fn select_within_budget(
    ranked: Vec<ScoredMessage>,
    token_budget: usize,
    config: &ScoringConfig,
) -> Vec<ChatMessage> {
    let mut selected = Vec::new();
    let mut used = 0usize;

    for item in ranked {
        if item.score < config.min_score {
            continue;
        }

        let cost = item.message.tokens + config.per_message_overhead;
        if used + cost > token_budget {
            break;
        }

        used += cost;
        selected.push(item.message);
        if selected.len() >= config.max_messages {
            break;
        }
    }

    selected.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
    selected
}

pub fn format_context(selected: Vec<ChatMessage>) -> String {
    selected
        .iter()
        .map(|message| {
            format!(
                "[{}]: {}",
                message.role.as_str().to_uppercase(),
                message.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

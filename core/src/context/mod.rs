//! Conversation state: the master transcript attributed to the orchestrator
//! and one independent history per provider.
//!
//! The in-process map is the primary copy while the process lives. When a
//! storage backend is attached every mutation is queued to a single writer
//! task (so saves land in order) and an unknown id is rehydrated from storage
//! before use. Write failures are logged and never surface to callers. A
//! failed read surfaces as `ChorusError::Storage` and leaves nothing cached.

pub mod routing;

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::agents::{ChatMessage, OrchestratorSettings, Role};
use crate::db::{ConversationSnapshot, ConversationStorage};
use crate::errors::ChorusError;
use routing::{keyword_fallback, RoutingClassifier, RoutingDecision, RoutingLogEntry};

pub const PROVIDER_SYSTEM_PROMPT: &str = "You are a helpful AI assistant. Answer accurately, clearly and concisely. If you are unsure about something, say so instead of guessing.";

const TOPIC_CHARS: usize = 50;
/// Older topics fall off the carried summary past this many.
const MAX_SUMMARY_TOPICS: usize = 10;

#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub messages: Vec<ChatMessage>,
    pub provider_contexts: HashMap<String, Vec<ChatMessage>>,
    pub routing_log: Vec<RoutingLogEntry>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Conversation {
    fn new(id: String) -> Self {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        Self {
            id,
            messages: Vec::new(),
            provider_contexts: HashMap::new(),
            routing_log: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn from_storage(
        snapshot: ConversationSnapshot,
        provider_contexts: HashMap<String, Vec<ChatMessage>>,
    ) -> Self {
        Self {
            id: snapshot.id,
            messages: snapshot.messages,
            provider_contexts,
            routing_log: snapshot.routing_log,
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
        }
    }

    fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            id: self.id.clone(),
            messages: self.messages.clone(),
            routing_log: self.routing_log.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn touch(&mut self) {
        self.updated_at = OffsetDateTime::now_utc().unix_timestamp();
    }
}

enum WriteJob {
    Master(ConversationSnapshot),
    Provider {
        conversation_id: String,
        provider_id: String,
        messages: Vec<ChatMessage>,
    },
    Delete(String),
    Flush(oneshot::Sender<()>),
}

async fn run_writer(storage: Arc<dyn ConversationStorage>, mut jobs: mpsc::UnboundedReceiver<WriteJob>) {
    while let Some(job) = jobs.recv().await {
        let result = match job {
            WriteJob::Master(snapshot) => storage.save_conversation(&snapshot).await,
            WriteJob::Provider {
                conversation_id,
                provider_id,
                messages,
            } => {
                storage
                    .save_provider_context(&conversation_id, &provider_id, &messages)
                    .await
            }
            WriteJob::Delete(id) => storage.delete_conversation(&id).await,
            WriteJob::Flush(done) => {
                let _ = done.send(());
                Ok(())
            }
        };
        if let Err(err) = result {
            tracing::warn!(target: "chorus.storage", "failed to persist conversation state: {err:#}");
        }
    }
}

pub struct ContextManager {
    conversations: DashMap<String, Conversation>,
    storage: Option<Arc<dyn ConversationStorage>>,
    writer: Option<mpsc::UnboundedSender<WriteJob>>,
    classifier: Option<RoutingClassifier>,
    available: Vec<String>,
    settings: OrchestratorSettings,
}

impl ContextManager {
    /// Ephemeral manager: nothing is persisted.
    pub fn new(settings: OrchestratorSettings) -> Self {
        Self {
            conversations: DashMap::new(),
            storage: None,
            writer: None,
            classifier: None,
            available: Vec::new(),
            settings,
        }
    }

    /// Attach durable storage. Spawns the writer task, so this must run
    /// inside a Tokio runtime.
    pub fn with_storage(mut self, storage: Arc<dyn ConversationStorage>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(storage.clone(), rx));
        self.storage = Some(storage);
        self.writer = Some(tx);
        self
    }

    pub fn with_classifier(mut self, classifier: RoutingClassifier, available: Vec<String>) -> Self {
        self.classifier = Some(classifier);
        self.available = available;
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn is_persistent(&self) -> bool {
        self.writer.is_some()
    }

    fn enqueue(&self, job: WriteJob) {
        if let Some(writer) = &self.writer {
            if writer.send(job).is_err() {
                tracing::warn!(target: "chorus.storage", "persistence writer has stopped");
            }
        }
    }

    /// Wait until every write queued so far has been applied.
    pub async fn flush(&self) {
        let Some(writer) = &self.writer else {
            return;
        };
        let (done, wait) = oneshot::channel();
        if writer.send(WriteJob::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    pub fn create_conversation(&self, id: Option<String>) -> Conversation {
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let conversation = self
            .conversations
            .entry(id.clone())
            .or_insert_with(|| Conversation::new(id))
            .clone();
        self.enqueue(WriteJob::Master(conversation.snapshot()));
        tracing::debug!("conversation {} ready", conversation.id);
        conversation
    }

    /// Make sure `id` is cached, reading through to storage on a miss. A
    /// failed read caches nothing, so no save can overwrite the stored rows.
    pub async fn load(&self, id: &str) -> Result<bool, ChorusError> {
        if self.conversations.contains_key(id) {
            return Ok(true);
        }
        let Some(storage) = &self.storage else {
            return Ok(false);
        };
        let snapshot = match storage.load_conversation(id).await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => return Ok(false),
            Err(err) => {
                tracing::warn!(target: "chorus.storage", "failed to load conversation {id}: {err:#}");
                return Err(ChorusError::Storage(format!("conversation {id} could not be loaded")));
            }
        };
        let contexts = storage.load_provider_contexts(id).await.map_err(|err| {
            tracing::warn!(target: "chorus.storage", "failed to load provider contexts for {id}: {err:#}");
            ChorusError::Storage(format!("provider contexts of {id} could not be loaded"))
        })?;
        self.conversations
            .entry(id.to_string())
            .or_insert_with(|| Conversation::from_storage(snapshot, contexts));
        tracing::debug!("conversation {id} rehydrated from storage");
        Ok(true)
    }

    /// Return the id of an existing conversation, creating it when absent.
    pub async fn ensure_conversation(&self, id: Option<&str>) -> Result<String, ChorusError> {
        let Some(id) = id else {
            return Ok(self.create_conversation(None).id);
        };
        if self.load(id).await? {
            Ok(id.to_string())
        } else {
            Ok(self.create_conversation(Some(id.to_string())).id)
        }
    }

    async fn require(&self, id: &str) -> Result<(), ChorusError> {
        if self.load(id).await? {
            Ok(())
        } else {
            Err(ChorusError::ConversationNotFound(id.to_string()))
        }
    }

    pub async fn add_message(&self, id: &str, message: ChatMessage) -> Result<(), ChorusError> {
        self.require(id).await?;
        let snapshot = {
            let mut conversation = self
                .conversations
                .get_mut(id)
                .ok_or_else(|| ChorusError::ConversationNotFound(id.to_string()))?;
            conversation.messages.push(message);
            conversation.touch();
            if trim_history(&mut conversation.messages, self.settings.max_messages) {
                tracing::debug!("master transcript of {id} trimmed");
            }
            conversation.snapshot()
        };
        self.enqueue(WriteJob::Master(snapshot));
        Ok(())
    }

    pub async fn add_provider_message(
        &self,
        id: &str,
        provider_id: &str,
        message: ChatMessage,
    ) -> Result<(), ChorusError> {
        self.require(id).await?;
        let messages = {
            let mut conversation = self
                .conversations
                .get_mut(id)
                .ok_or_else(|| ChorusError::ConversationNotFound(id.to_string()))?;
            let history = conversation
                .provider_contexts
                .entry(provider_id.to_string())
                .or_default();
            history.push(message);
            if trim_history(history, self.settings.max_messages) {
                tracing::debug!("{provider_id} context of {id} trimmed");
            }
            let messages = history.clone();
            conversation.touch();
            messages
        };
        self.enqueue(WriteJob::Provider {
            conversation_id: id.to_string(),
            provider_id: provider_id.to_string(),
            messages,
        });
        Ok(())
    }

    pub async fn transcript(&self, id: &str) -> Result<Vec<ChatMessage>, ChorusError> {
        self.require(id).await?;
        self.conversations
            .get(id)
            .map(|c| c.messages.clone())
            .ok_or_else(|| ChorusError::ConversationNotFound(id.to_string()))
    }

    pub async fn provider_transcript(
        &self,
        id: &str,
        provider_id: &str,
    ) -> Result<Vec<ChatMessage>, ChorusError> {
        self.require(id).await?;
        self.conversations
            .get(id)
            .map(|c| c.provider_contexts.get(provider_id).cloned().unwrap_or_default())
            .ok_or_else(|| ChorusError::ConversationNotFound(id.to_string()))
    }

    pub async fn get_context_for_provider(
        &self,
        id: &str,
        provider_id: &str,
        include_system_prompt: bool,
    ) -> Result<Vec<ChatMessage>, ChorusError> {
        let history = self.provider_transcript(id, provider_id).await?;
        let mut context = Vec::with_capacity(history.len() + 1);
        if include_system_prompt {
            context.push(ChatMessage::system(PROVIDER_SYSTEM_PROMPT));
        }
        context.extend(history);
        Ok(context)
    }

    pub async fn get_master_context(&self, id: &str) -> Result<Vec<ChatMessage>, ChorusError> {
        let history = self.transcript(id).await?;
        let mut context = Vec::with_capacity(history.len() + 1);
        context.push(ChatMessage::system(master_prompt(&self.settings.name)));
        context.extend(history);
        Ok(context)
    }

    pub async fn record_routing(
        &self,
        id: &str,
        message: &str,
        decision: &RoutingDecision,
    ) -> Result<(), ChorusError> {
        self.require(id).await?;
        let snapshot = {
            let mut conversation = self
                .conversations
                .get_mut(id)
                .ok_or_else(|| ChorusError::ConversationNotFound(id.to_string()))?;
            conversation
                .routing_log
                .push(RoutingLogEntry::new(message, decision));
            conversation.snapshot()
        };
        self.enqueue(WriteJob::Master(snapshot));
        Ok(())
    }

    pub async fn routing_log(&self, id: &str) -> Result<Vec<RoutingLogEntry>, ChorusError> {
        self.require(id).await?;
        self.conversations
            .get(id)
            .map(|c| c.routing_log.clone())
            .ok_or_else(|| ChorusError::ConversationNotFound(id.to_string()))
    }

    /// Decide whether `message` (already appended or not) should go to the
    /// providers.
    pub async fn should_forward_to_ais(
        &self,
        id: &str,
        message: &str,
    ) -> Result<RoutingDecision, ChorusError> {
        let history = self.transcript(id).await?;
        let prior = match history.last() {
            Some(last) if last.role == Role::User && last.content == message => {
                &history[..history.len() - 1]
            }
            _ => &history[..],
        };
        if prior.is_empty() {
            return Ok(RoutingDecision::first_message());
        }

        let recent = &prior[prior.len().saturating_sub(self.settings.routing_history)..];
        let keywords = &self.settings.self_reference_keywords;
        let decision = match &self.classifier {
            Some(classifier) => match classifier.classify(recent, message, &self.available).await {
                Ok(decision) => decision,
                Err(failure) => {
                    tracing::warn!("routing classifier unavailable: {failure}");
                    keyword_fallback(message, keywords, "classifier unavailable")
                }
            },
            None => keyword_fallback(message, keywords, "no classifier configured"),
        };
        Ok(decision)
    }

    pub fn delete_conversation(&self, id: &str) -> bool {
        let removed = self.conversations.remove(id).is_some();
        self.enqueue(WriteJob::Delete(id.to_string()));
        removed
    }
}

fn master_prompt(name: &str) -> String {
    format!(
        "You are {name}, an orchestrator that coordinates several AI assistants on the user's behalf. \
         You decide whether each message should be forwarded to the assistants or answered directly, \
         summarise their responses, produce a consensus (mean) answer and a best answer, \
         and handle follow-up questions about earlier answers yourself."
    )
}

fn topic_of(content: &str) -> String {
    let flat = content.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut topic: String = flat.chars().take(TOPIC_CHARS).collect();
    if flat.chars().count() > TOPIC_CHARS {
        topic.push_str("...");
    }
    topic
}

const SUMMARY_PREFIX: &str = "Summary of earlier conversation. The user previously asked about: ";
const TOPIC_SEPARATOR: &str = ", ";
const TRIMMED_NOTE: &str = "Earlier messages in this conversation were trimmed.";

fn is_trim_summary(message: &ChatMessage) -> bool {
    message.role == Role::System
        && (message.content.starts_with(SUMMARY_PREFIX) || message.content == TRIMMED_NOTE)
}

/// Keep the newest `max` messages, replacing the dropped ones with a single
/// system message listing the user topics that were removed. A summary from
/// an earlier trim does not count towards `max`. Its topics carry over, up to
/// the newest `MAX_SUMMARY_TOPICS`.
pub fn trim_history(messages: &mut Vec<ChatMessage>, max: usize) -> bool {
    let has_summary = messages.first().is_some_and(is_trim_summary);
    let kept = messages.len() - usize::from(has_summary);
    if kept <= max {
        return false;
    }

    let mut topics: Vec<String> = Vec::new();
    if has_summary {
        let previous = messages.remove(0);
        if let Some(listed) = previous.content.strip_prefix(SUMMARY_PREFIX) {
            // A topic holding the separator splits into pieces, each no longer
            // than a topic, so the cap below still bounds the summary.
            topics.extend(
                listed
                    .split(TOPIC_SEPARATOR)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string),
            );
        }
    }
    let excess = messages.len() - max;
    topics.extend(
        messages
            .drain(..excess)
            .filter(|m| m.role == Role::User)
            .map(|m| topic_of(&m.content)),
    );

    if topics.len() > MAX_SUMMARY_TOPICS {
        topics.drain(..topics.len() - MAX_SUMMARY_TOPICS);
    }

    let summary = if topics.is_empty() {
        TRIMMED_NOTE.to_string()
    } else {
        format!("{SUMMARY_PREFIX}{}", topics.join(TOPIC_SEPARATOR))
    };
    messages.insert(0, ChatMessage::system(summary));
    true
}

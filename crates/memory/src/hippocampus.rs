//! Hippocampus: the slow loop.
//!
//! Every chunk appended to a session's short-term window also lands in a
//! per-session pending buffer here. Once that buffer reaches `threshold`,
//! it is drained atomically and handed to a background task: extract
//! candidate facts, deduplicate each against the vector store, occasionally
//! reflect over recent facts, and copy high-importance facts into the user
//! profile. If no async runtime is available to spawn onto, the drained
//! chunks are pushed back onto the buffer rather than dropped — nothing is
//! ever lost, it simply waits for the next chunk to retrigger the check.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use palimpsest_config::HippocampusConfig;
use palimpsest_llm::{ChatCapability, ChatTurn, EmbeddingCapability};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::profile_store::ProfileStore;
use crate::schema::{MemoryEntry, MemoryId, MemoryTier, ProfileUpdate, SessionMessage};
use crate::scheduler::{Scheduler, TaskSet};
use crate::vector_store::{now_seconds, SearchQuery, VectorStore};

pub struct Hippocampus {
    config: HippocampusConfig,
    vector_store: Arc<VectorStore>,
    profile_store: Arc<ProfileStore>,
    chat: Arc<dyn ChatCapability>,
    embedder: Arc<dyn EmbeddingCapability>,
    scheduler: Arc<dyn Scheduler>,
    tasks: Arc<TaskSet>,
    buffers: Mutex<HashMap<String, (String, Vec<Vec<SessionMessage>>)>>,
}

impl Hippocampus {
    pub fn new(
        config: HippocampusConfig,
        vector_store: Arc<VectorStore>,
        profile_store: Arc<ProfileStore>,
        chat: Arc<dyn ChatCapability>,
        embedder: Arc<dyn EmbeddingCapability>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            vector_store,
            profile_store,
            chat,
            embedder,
            scheduler,
            tasks: TaskSet::new(),
            buffers: Mutex::new(HashMap::new()),
        })
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.inflight_count()
    }

    /// Append a chunk to `session_id`'s pending buffer. If the buffer
    /// crosses `threshold`, drain it and spawn a processing task. The
    /// buffer is keyed per session rather than per user, since a single
    /// user can hold several concurrent sessions (e.g. separate group
    /// chats) each accumulating toward the threshold independently;
    /// `user_id` travels alongside the buffered chunks for the eventual
    /// fact/profile/reflection work, which is scoped to the user.
    pub fn buffer_for_hippocampus(self: &Arc<Self>, session_id: &str, user_id: &str, chunks: Vec<Vec<SessionMessage>>) {
        if chunks.is_empty() {
            return;
        }

        let drained = {
            let mut buffers = self.buffers.lock().unwrap();
            let entry = buffers.entry(session_id.to_string()).or_insert_with(|| (user_id.to_string(), Vec::new()));
            entry.0 = user_id.to_string();
            entry.1.extend(chunks);
            if entry.1.len() >= self.config.threshold {
                Some((entry.0.clone(), std::mem::take(&mut entry.1)))
            } else {
                None
            }
        };

        let Some((user_id, drained)) = drained else { return };

        if tokio::runtime::Handle::try_current().is_err() {
            debug!(session_id, "no running event loop, returning drained chunks to buffer");
            let mut buffers = self.buffers.lock().unwrap();
            let entry = buffers.entry(session_id.to_string()).or_insert_with(|| (user_id.clone(), Vec::new()));
            entry.1.splice(0..0, drained);
            return;
        }

        let task_id = self.tasks.reserve();
        let this = Arc::clone(self);
        let tasks = Arc::clone(&self.tasks);
        self.scheduler.spawn(
            task_id,
            Box::pin(async move {
                this.process_chunks(&user_id, drained).await;
                tasks.complete(task_id);
            }),
        );
    }

    async fn process_chunks(&self, user_id: &str, chunks: Vec<Vec<SessionMessage>>) {
        let facts = match self.extract_facts(user_id, &chunks).await {
            Ok(facts) => facts,
            Err(err) => {
                warn!(%err, user_id, "fact extraction failed, dropping this batch");
                return;
            }
        };
        if facts.is_empty() {
            return;
        }

        let mut promoted = Vec::new();
        for (content, importance) in facts {
            match self.dedup_and_store(user_id, &content, importance).await {
                Ok(Some(stored_importance)) if stored_importance >= self.config.profile_importance_floor => {
                    promoted.push(content);
                }
                Ok(_) => {}
                Err(err) => warn!(%err, user_id, "storing fact failed"),
            }
        }

        if !promoted.is_empty() {
            let updates: Vec<ProfileUpdate> = promoted.into_iter().map(ProfileUpdate::AddFact).collect();
            if let Err(err) = self.profile_store.update_profile(user_id, &updates) {
                warn!(%err, user_id, "promoting facts into profile failed");
            }
        }

        if let Err(err) = self.reflect(user_id).await {
            warn!(%err, user_id, "reflection pass failed");
        }
    }

    async fn extract_facts(&self, user_id: &str, chunks: &[Vec<SessionMessage>]) -> anyhow::Result<Vec<(String, u8)>> {
        let transcript = render_transcript(chunks);
        let prompt = format!(
            "Extract durable facts about the user from this conversation. \
             Respond with a JSON array of objects: [{{\"fact\": \"...\", \"importance\": 1-10}}]. \
             Only include facts that will still be true later; skip small talk.\n\nConversation:\n{transcript}"
        );
        let reply = self
            .chat
            .chat(&[ChatTurn::system("You extract durable facts from conversations."), ChatTurn::user(prompt)])
            .await?;

        let facts = parse_fact_list(&reply.text);
        debug!(user_id, count = facts.len(), "extracted facts");
        Ok(facts)
    }

    /// Embed `content`, search near neighbours, and ask the model whether
    /// it duplicates, updates, or is distinct from what's already stored.
    /// Returns the importance the fact ended up stored with, or `None` if
    /// it was judged a pure duplicate and discarded.
    async fn dedup_and_store(&self, user_id: &str, content: &str, importance: u8) -> anyhow::Result<Option<u8>> {
        let embeddings = self.embedder.embed(&[content.to_string()]).await?;
        let Some(embedding) = embeddings.into_iter().next().filter(|e| !e.is_empty()) else {
            return Ok(None);
        };

        let neighbours = self.vector_store.search(SearchQuery {
            query_embedding: Some(embedding.clone()),
            user_id: Some(user_id.to_string()),
            memory_type: Some(MemoryTier::Fact),
            k: self.config.dedup_k,
            threshold: Some(self.config.dedup_threshold),
            update_access: false,
            ..Default::default()
        });

        if neighbours.is_empty() {
            let entry = new_entry(user_id, content, MemoryTier::Fact, importance, &self.vector_store.seen_ids());
            self.vector_store.add_memory(entry, Some(embedding))?;
            return Ok(Some(importance));
        }

        let classification = self.classify_against_neighbours(content, &neighbours).await?;
        match classification {
            Classification::Duplicate => Ok(None),
            Classification::Update(merged) => {
                let target = &neighbours[0];
                self.vector_store
                    .update_memory(&target.id, Some(merged), Some(importance.max(target.importance)), None, Some(embedding));
                Ok(Some(importance.max(target.importance)))
            }
            Classification::New => {
                let entry = new_entry(user_id, content, MemoryTier::Fact, importance, &self.vector_store.seen_ids());
                self.vector_store.add_memory(entry, Some(embedding))?;
                Ok(Some(importance))
            }
        }
    }

    async fn classify_against_neighbours(&self, content: &str, neighbours: &[MemoryEntry]) -> anyhow::Result<Classification> {
        let existing: Vec<String> = neighbours.iter().map(|n| format!("- {}", n.content)).collect();
        let prompt = format!(
            "New fact: \"{content}\"\n\nExisting related facts:\n{}\n\n\
             Reply with exactly one of:\n\
             DUPLICATE (new fact adds nothing)\n\
             UPDATE: <merged fact text> (new fact refines/replaces the first existing fact)\n\
             NEW (new fact is distinct)",
            existing.join("\n")
        );
        let reply = self.chat.chat(&[ChatTurn::system("You deduplicate memory facts."), ChatTurn::user(prompt)]).await?;
        Ok(parse_classification(&reply.text))
    }

    async fn reflect(&self, user_id: &str) -> anyhow::Result<()> {
        let recent = self.vector_store.get_by_user(user_id, Some(MemoryTier::Fact), self.config.reflection_window);
        if recent.len() < self.config.reflection_min_facts {
            return Ok(());
        }

        let facts: Vec<String> = recent.iter().map(|f| f.content.clone()).collect();
        let prompt = format!(
            "Given these recent facts about a user, surface 1 to 3 higher-level insights \
             that aren't already stated directly. Respond with a JSON array of strings, or [] if none apply.\n\n{}",
            facts.join("\n- ")
        );
        let reply = self.chat.chat(&[ChatTurn::system("You find higher-level patterns in user facts."), ChatTurn::user(prompt)]).await?;
        let insights = parse_string_list(&reply.text);

        for insight in insights {
            let embeddings = self.embedder.embed(&[insight.clone()]).await?;
            let Some(embedding) = embeddings.into_iter().next().filter(|e| !e.is_empty()) else {
                continue;
            };
            let near = self.vector_store.search(SearchQuery {
                query_embedding: Some(embedding.clone()),
                user_id: Some(user_id.to_string()),
                memory_type: Some(MemoryTier::Reflection),
                k: 1,
                threshold: Some(self.config.reflection_dedup_threshold),
                update_access: false,
                ..Default::default()
            });
            if !near.is_empty() {
                continue;
            }
            let entry = new_entry(user_id, &insight, MemoryTier::Reflection, 7, &self.vector_store.seen_ids());
            self.vector_store.add_memory(entry, Some(embedding))?;
            info!(user_id, "stored reflection");
        }
        Ok(())
    }
}

enum Classification {
    Duplicate,
    Update(String),
    New,
}

fn parse_classification(raw: &str) -> Classification {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("UPDATE:") {
        return Classification::Update(rest.trim().to_string());
    }
    if trimmed.to_uppercase().starts_with("DUPLICATE") {
        return Classification::Duplicate;
    }
    Classification::New
}

fn new_entry(user_id: &str, content: &str, tier: MemoryTier, importance: u8, seen: &std::collections::HashSet<String>) -> MemoryEntry {
    let now = now_seconds();
    MemoryEntry {
        id: MemoryId::generate(seen),
        user_id: user_id.to_string(),
        content: content.to_string(),
        memory_type: tier,
        importance: MemoryEntry::clamp_importance(importance as i64),
        timestamp: now,
        access_count: 0,
        last_accessed: now,
        embedding: Vec::new(),
        metadata: std::collections::HashMap::new(),
    }
}

fn render_transcript(chunks: &[Vec<SessionMessage>]) -> String {
    chunks
        .iter()
        .flatten()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Tolerant JSON-array extraction: strips Markdown code fences, slices out
/// the first `[...]` span, and repairs trailing commas before attempting
/// to parse. LLM replies routinely include all three defects.
fn extract_json_array(raw: &str) -> Option<String> {
    let stripped = raw.trim().trim_start_matches("```json").trim_start_matches("```").trim_end_matches("```");
    let start = stripped.find('[')?;
    let end = stripped.rfind(']')?;
    if end < start {
        return None;
    }
    let slice = &stripped[start..=end];
    let repaired = regex::Regex::new(r",\s*([\]}])").unwrap().replace_all(slice, "$1");
    Some(repaired.into_owned())
}

fn parse_fact_list(raw: &str) -> Vec<(String, u8)> {
    let Some(json) = extract_json_array(raw) else { return Vec::new() };
    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&json) else { return Vec::new() };

    items
        .into_iter()
        .filter_map(|item| {
            let fact = item.get("fact").and_then(|v| v.as_str())?.trim().to_string();
            if fact.is_empty() {
                return None;
            }
            let importance = item
                .get("importance")
                .and_then(|v| v.as_i64())
                .map(MemoryEntry::clamp_importance)
                .unwrap_or(5);
            Some((fact, importance))
        })
        .collect()
}

fn parse_string_list(raw: &str) -> Vec<String> {
    let Some(json) = extract_json_array(raw) else { return Vec::new() };
    let Ok(Value::Array(items)) = serde_json::from_str::<Value>(&json) else { return Vec::new() };
    items
        .into_iter()
        .filter_map(|v| v.as_str().map(|s| s.trim().to_string()))
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use palimpsest_config::VectorStoreMode;
    use palimpsest_llm::ChatReply;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedChat {
        replies: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ChatCapability for ScriptedChat {
        async fn chat(&self, _messages: &[ChatTurn]) -> anyhow::Result<ChatReply> {
            let mut replies = self.replies.lock().unwrap();
            let text = if replies.is_empty() { String::new() } else { replies.remove(0) };
            Ok(ChatReply { text, ..Default::default() })
        }
    }

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingCapability for CountingEmbedder {
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
    }

    fn msg(role: &str, content: &str) -> SessionMessage {
        SessionMessage { role: role.to_string(), content: content.to_string() }
    }

    #[test]
    fn extract_json_array_tolerates_fences_and_trailing_commas() {
        let raw = "```json\n[{\"fact\": \"likes tea\", \"importance\": 6,},]\n```";
        let facts = parse_fact_list(raw);
        assert_eq!(facts, vec![("likes tea".to_string(), 6)]);
    }

    #[test]
    fn parse_classification_recognizes_update_prefix() {
        match parse_classification("UPDATE: now works remotely") {
            Classification::Update(text) => assert_eq!(text, "now works remotely"),
            _ => panic!("expected update"),
        }
    }

    #[tokio::test]
    async fn buffer_below_threshold_does_not_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let vector_store = Arc::new(VectorStore::open(dir.path().join("vec"), VectorStoreMode::DefaultBacked).unwrap());
        let profile_store = Arc::new(ProfileStore::open(dir.path().join("profiles.json")).unwrap());
        let chat = Arc::new(ScriptedChat { replies: Mutex::new(vec!["[]".to_string()]) });
        let embedder = Arc::new(CountingEmbedder { calls: AtomicUsize::new(0) });
        let scheduler: Arc<dyn Scheduler> = Arc::new(crate::scheduler::InlineScheduler);

        let hippocampus = Hippocampus::new(
            HippocampusConfig { threshold: 3, ..Default::default() },
            vector_store,
            profile_store,
            chat,
            embedder.clone(),
            scheduler,
        );

        hippocampus.buffer_for_hippocampus("s1", "u1", vec![vec![msg("user", "hi")]]);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn buffer_at_threshold_extracts_and_stores_facts() {
        let dir = tempfile::tempdir().unwrap();
        let vector_store = Arc::new(VectorStore::open(dir.path().join("vec"), VectorStoreMode::DefaultBacked).unwrap());
        let profile_store = Arc::new(ProfileStore::open(dir.path().join("profiles.json")).unwrap());
        let chat = Arc::new(ScriptedChat {
            replies: Mutex::new(vec![
                r#"[{"fact": "likes tea", "importance": 8}]"#.to_string(),
                "[]".to_string(),
            ]),
        });
        let embedder = Arc::new(CountingEmbedder { calls: AtomicUsize::new(0) });
        let scheduler: Arc<dyn Scheduler> = Arc::new(crate::scheduler::InlineScheduler);

        let hippocampus = Hippocampus::new(
            HippocampusConfig { threshold: 1, reflection_min_facts: 99, ..Default::default() },
            vector_store.clone(),
            profile_store.clone(),
            chat,
            embedder,
            scheduler,
        );

        hippocampus.buffer_for_hippocampus("s1", "u1", vec![vec![msg("user", "I love tea")]]);

        assert_eq!(vector_store.count(), 1);
        let profile = profile_store.get_profile("u1");
        assert_eq!(profile.facts, vec!["likes tea".to_string()]);
    }
}

//! Memory manager façade.
//!
//! Owns every other component and is the only type callers outside this
//! crate construct directly. A single façade struct that forwards to
//! focused sub-components rather than inlining their logic.

use std::sync::Arc;

use palimpsest_config::EngineConfig;
use palimpsest_llm::{ChatCapability, EmbeddingCapability};
use tracing::warn;

use crate::error::EngineError;
use crate::forgetter::{Forgetter, ForgettingReport};
use crate::hippocampus::Hippocampus;
use crate::profile_store::ProfileStore;
use crate::schema::{MemoryEntry, ProfileUpdate, SessionMemory, SessionMessage, UserProfile};
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::short_term::{CoreMemory, ShortTermMemory};
use crate::vector_store::{now_seconds, SearchQuery, VectorStore};

pub struct MemoryManager {
    config: EngineConfig,
    vector_store: Arc<VectorStore>,
    profile_store: Arc<ProfileStore>,
    short_term: Arc<ShortTermMemory>,
    core_memory: Arc<CoreMemory>,
    hippocampus: Arc<Hippocampus>,
    forgetter: Forgetter,
    embedder: Arc<dyn EmbeddingCapability>,
}

impl MemoryManager {
    pub fn new(config: EngineConfig, chat: Arc<dyn ChatCapability>, embedder: Arc<dyn EmbeddingCapability>) -> Result<Arc<Self>, EngineError> {
        Self::with_scheduler(config, chat, embedder, Arc::new(TokioScheduler))
    }

    pub fn with_scheduler(
        config: EngineConfig,
        chat: Arc<dyn ChatCapability>,
        embedder: Arc<dyn EmbeddingCapability>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Result<Arc<Self>, EngineError> {
        let vector_store = Arc::new(VectorStore::open(config.vector_db_path(), config.vector.mode)?);
        let profile_store = Arc::new(ProfileStore::open(config.user_profiles_path())?);
        let short_term = Arc::new(ShortTermMemory::open(config.chat_memory_path(), config.short_term.max_memory_length)?);
        let core_memory = Arc::new(CoreMemory::open(config.core_memory_path())?);
        let hippocampus = Hippocampus::new(
            config.hippocampus.clone(),
            vector_store.clone(),
            profile_store.clone(),
            chat.clone(),
            embedder.clone(),
            scheduler,
        );
        let forgetter = Forgetter::new(config.forgetter.clone(), vector_store.clone(), chat, embedder.clone());

        Ok(Arc::new(Self {
            config,
            vector_store,
            profile_store,
            short_term,
            core_memory,
            hippocampus,
            forgetter,
            embedder,
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn vector_store(&self) -> &Arc<VectorStore> {
        &self.vector_store
    }

    pub fn profile_store(&self) -> &Arc<ProfileStore> {
        &self.profile_store
    }

    pub fn core_memory(&self) -> &Arc<CoreMemory> {
        &self.core_memory
    }

    // -- Fast loop: short-term window -----------------------------------

    pub fn get_session_info(&self, session_id: &str) -> SessionMemory {
        self.short_term.read_memory(session_id)
    }

    pub fn fetch_memory(&self, session_id: &str) -> SessionMemory {
        self.short_term.read_memory(session_id)
    }

    pub fn write_memory(&self, session_id: &str, memory: SessionMemory) -> Result<(), EngineError> {
        self.short_term.write_memory(session_id, memory)
    }

    /// Append a chunk to the session window, then hand that same chunk to
    /// the hippocampus's pending buffer for slow-loop processing. The two
    /// are independent: window eviction only bounds how much fast-loop
    /// history is kept around, it does not gate whether the chunk ever
    /// reaches the hippocampus.
    pub fn update_memory(self: &Arc<Self>, session_id: &str, user_id: &str, chunk: Vec<SessionMessage>) -> Result<(), EngineError> {
        self.short_term.append_chunk(session_id, chunk.clone())?;
        self.hippocampus.buffer_for_hippocampus(session_id, user_id, vec![chunk]);
        Ok(())
    }

    pub fn delete_session(&self, session_id: &str) -> Result<bool, EngineError> {
        self.short_term.delete_session(session_id)
    }

    pub fn get_core_memory(&self) -> Vec<String> {
        self.core_memory.lines()
    }

    // -- Fast loop: recall -------------------------------------------------

    /// Embed `query`, rank the vector store, and return the top matches.
    /// `k` is coerced to at least 1. On embedding failure, returns an
    /// empty list rather than surfacing the error to the session loop —
    /// a transient embedding outage degrades recall to nothing instead
    /// of breaking the turn.
    pub async fn recall(&self, user_id: &str, query: &str, k: usize) -> Vec<MemoryEntry> {
        let k = k.max(1);
        let embedding = match self.embedder.embed(&[query.to_string()]).await {
            Ok(mut vectors) if !vectors.is_empty() => vectors.remove(0),
            Ok(_) => Vec::new(),
            Err(err) => {
                warn!(%err, "embedding failed during recall, falling back to text search");
                Vec::new()
            }
        };

        let search_query = if embedding.is_empty() {
            SearchQuery {
                query_text: Some(query.to_string()),
                user_id: Some(user_id.to_string()),
                k,
                update_access: true,
                ..Default::default()
            }
        } else {
            SearchQuery {
                query_embedding: Some(embedding),
                user_id: Some(user_id.to_string()),
                k,
                update_access: true,
                ..Default::default()
            }
        };

        self.vector_store.search(search_query)
    }

    pub fn format_recalled_memories(entries: &[MemoryEntry]) -> String {
        if entries.is_empty() {
            return String::new();
        }
        entries
            .iter()
            .map(|e| format!("[{}] {}", e.memory_type.as_str(), e.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    // -- Profile -----------------------------------------------------------

    pub fn get_user_profile(&self, user_id: &str) -> UserProfile {
        self.profile_store.get_profile(user_id)
    }

    pub fn get_user_profile_prompt(&self, user_id: &str) -> String {
        self.profile_store.get_profile_prompt(user_id)
    }

    pub fn update_user_profile(&self, user_id: &str, updates: &[ProfileUpdate]) -> Result<UserProfile, EngineError> {
        self.profile_store.update_profile(user_id, updates)
    }

    pub fn update_user_interaction(&self, user_id: &str) -> Result<UserProfile, EngineError> {
        self.profile_store.increment_interaction(user_id, now_seconds())
    }

    // -- Slow loop: forgetting ----------------------------------------------

    pub async fn run_forgetting_cycle(&self) -> ForgettingReport {
        let mut report = self.forgetter.run_forgetting_cycle();
        self.forgetter.summarize_old_memories(&mut report).await;
        report
    }
}

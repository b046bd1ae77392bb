//! Forgetter: the retention/decay pass.
//!
//! A periodic cycle that scores every memory for retention, deletes what
//! scores too low, downgrades borderline facts, and periodically collapses
//! old fact clusters into summaries. Pure arithmetic plus one LLM call per
//! summary group — never the hot path, always safe to skip a cycle.

use std::collections::HashMap;
use std::sync::Arc;

use palimpsest_config::ForgetterConfig;
use palimpsest_llm::{ChatCapability, ChatTurn, EmbeddingCapability};
use tracing::{debug, info, warn};

use crate::schema::{MemoryEntry, MemoryId, MemoryTier};
use crate::vector_store::{now_seconds, VectorStore};

const SECONDS_PER_DAY: f64 = 86_400.0;
const ACCESS_HALF_LIFE_DAYS: f64 = 30.0;
const CREATION_HALF_LIFE_DAYS: f64 = 90.0;
const ACCESS_BONUS_CAP: f32 = 0.3;
const REFLECTION_TYPE_BONUS: f32 = 0.2;
/// Reflections are exempt from summarization but still subject to this
/// fixed deletion floor regardless of the configured `delete_below`.
const REFLECTION_DELETE_FLOOR: f32 = 0.2;

pub struct Forgetter {
    config: ForgetterConfig,
    vector_store: Arc<VectorStore>,
    chat: Arc<dyn ChatCapability>,
    embedder: Arc<dyn EmbeddingCapability>,
}

#[derive(Debug, Default)]
pub struct ForgettingReport {
    pub scanned: usize,
    pub deleted: usize,
    pub downgraded: usize,
    pub summaries_created: usize,
    pub summarized_originals_removed: usize,
}

impl Forgetter {
    pub fn new(
        config: ForgetterConfig,
        vector_store: Arc<VectorStore>,
        chat: Arc<dyn ChatCapability>,
        embedder: Arc<dyn EmbeddingCapability>,
    ) -> Self {
        Self { config, vector_store, chat, embedder }
    }

    /// `score = 0.35*importance + 0.25*access_decay + 0.10*creation_decay
    /// + access_bonus (capped 0.3) + type_bonus (0.2 for reflections)`.
    pub fn retention_score(&self, entry: &MemoryEntry, now: f64) -> f32 {
        let importance_score = entry.importance as f32 / 10.0;

        let days_since_access = ((now - entry.last_accessed).max(0.0)) / SECONDS_PER_DAY;
        let access_decay = 0.5f64.powf(days_since_access / ACCESS_HALF_LIFE_DAYS) as f32;

        let days_since_creation = ((now - entry.timestamp).max(0.0)) / SECONDS_PER_DAY;
        let creation_decay = 0.5f64.powf(days_since_creation / CREATION_HALF_LIFE_DAYS) as f32;

        let access_bonus = (entry.access_count as f32 * 0.02).min(ACCESS_BONUS_CAP);
        let type_bonus = if entry.memory_type == MemoryTier::Reflection { REFLECTION_TYPE_BONUS } else { 0.0 };

        0.35 * importance_score + 0.25 * access_decay + 0.10 * creation_decay + access_bonus + type_bonus
    }

    /// Page through every entry, deleting or downgrading by retention
    /// score. Facts scoring below `downgrade_below` (but at or above
    /// `delete_below`) have their importance floored at 1 rather than
    /// being removed outright.
    pub fn run_forgetting_cycle(&self) -> ForgettingReport {
        let now = now_seconds();
        let mut report = ForgettingReport::default();
        let mut offset = 0;

        loop {
            let page = self.vector_store.get_all_memories(self.config.page_size, offset);
            if page.is_empty() {
                break;
            }
            let page_len = page.len();
            offset += page_len;
            report.scanned += page_len;

            for entry in page {
                // Reflections carry a fixed floor independent of the
                // configured threshold.
                let floor = if entry.memory_type == MemoryTier::Reflection {
                    REFLECTION_DELETE_FLOOR
                } else {
                    self.config.delete_below
                };
                let score = self.retention_score(&entry, now);

                if score < floor {
                    if self.vector_store.delete_memory(&entry.id) {
                        report.deleted += 1;
                    }
                    continue;
                }

                if score < self.config.downgrade_below && entry.memory_type == MemoryTier::Fact && entry.importance > 1 {
                    self.vector_store.update_memory(&entry.id, None, Some(1), None, None);
                    report.downgraded += 1;
                }
            }

            if page_len < self.config.page_size {
                break;
            }
        }

        info!(scanned = report.scanned, deleted = report.deleted, downgraded = report.downgraded, "forgetting cycle scan complete");
        report
    }

    /// Collapse fact clusters older than `summarize_min_age_days` into a
    /// single summary per `user_id` group, once the group has at least
    /// `summarize_min_group` members. Originals are deleted only after a
    /// summary for that group was successfully stored — and then the whole
    /// group is removed, not a partial subset.
    pub async fn summarize_old_memories(&self, report: &mut ForgettingReport) {
        let now = now_seconds();
        let min_age_seconds = self.config.summarize_min_age_days * SECONDS_PER_DAY;

        let mut groups: HashMap<String, Vec<MemoryEntry>> = HashMap::new();
        let mut offset = 0;
        loop {
            let page = self.vector_store.get_all_memories(self.config.page_size, offset);
            if page.is_empty() {
                break;
            }
            offset += page.len();
            for entry in page {
                if entry.memory_type != MemoryTier::Fact {
                    continue;
                }
                if now - entry.timestamp < min_age_seconds {
                    continue;
                }
                groups.entry(entry.user_id.clone()).or_default().push(entry);
            }
        }

        for (user_id, group) in groups {
            if group.len() < self.config.summarize_min_group {
                continue;
            }
            if let Err(err) = self.summarize_group(&user_id, &group, report).await {
                warn!(%err, user_id, "summarization failed for group");
            }
        }
    }

    /// One chat call per group; the reply's non-empty lines each become
    /// their own summary entry (a summarizer may return several distinct
    /// points rather than one paragraph). Originals are deleted only once
    /// at least one summary line was stored.
    async fn summarize_group(&self, user_id: &str, group: &[MemoryEntry], report: &mut ForgettingReport) -> anyhow::Result<()> {
        let facts: Vec<String> = group.iter().map(|f| f.content.clone()).collect();
        let prompt = format!(
            "Summarize these old facts about a user into a few concise sentences \
             that preserve the important information:\n\n- {}",
            facts.join("\n- ")
        );
        let reply = self.chat.chat(&[ChatTurn::system("You summarize old user facts."), ChatTurn::user(prompt)]).await?;
        let lines: Vec<String> = reply.text.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect();
        if lines.is_empty() {
            return Ok(());
        }

        let mut stored_any = false;
        for line in &lines {
            let embeddings = self.embedder.embed(&[line.clone()]).await?;
            let embedding = embeddings.into_iter().next().filter(|e| !e.is_empty());

            let now = now_seconds();
            let entry = MemoryEntry {
                id: MemoryId::generate(&self.vector_store.seen_ids()),
                user_id: user_id.to_string(),
                content: line.clone(),
                memory_type: MemoryTier::Summary,
                importance: self.config.summary_importance,
                timestamp: now,
                access_count: 0,
                last_accessed: now,
                embedding: Vec::new(),
                metadata: std::collections::HashMap::new(),
            };
            if self.vector_store.add_memory(entry, embedding).is_ok() {
                stored_any = true;
                report.summaries_created += 1;
            }
        }

        if stored_any {
            for fact in group {
                if self.vector_store.delete_memory(&fact.id) {
                    report.summarized_originals_removed += 1;
                }
            }
        }
        debug!(user_id, group_size = group.len(), "summarized fact group");
        Ok(())
    }
}

//! Vector store: the long-term fact/reflection/summary index.
//!
//! Embedding-indexed map of `id → MemoryEntry` with metadata filters and
//! brute-force cosine-distance ranking. Persisted to a single [`redb`]
//! database file, generalized from a write-through secondary-index cache
//! into the primary store (see DESIGN.md for why `qdrant-client` was
//! dropped in favor of this).

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use bincode::{Decode, Encode};
use palimpsest_config::VectorStoreMode;
use redb::{Database, ReadableTable, TableDefinition};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::schema::{MemoryEntry, MemoryId, MemoryTier};

const ENTRIES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");
const META_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

const META_KEY_MODE: &str = "mode";
const META_KEY_DIM: &str = "dim";

/// Compact on-disk shape of [`MemoryEntry`] — bincode cannot derive
/// `Encode`/`Decode` for `serde_json::Value`, so free-form metadata is
/// flattened to string pairs on the wire and rebuilt as JSON values on load.
#[derive(Encode, Decode)]
struct StoredEntry {
    id: String,
    user_id: String,
    content: String,
    memory_type: u8,
    importance: u8,
    timestamp: f64,
    access_count: u64,
    last_accessed: f64,
    embedding: Vec<f32>,
    metadata: Vec<(String, String)>,
}

fn tier_to_u8(tier: MemoryTier) -> u8 {
    match tier {
        MemoryTier::Fact => 0,
        MemoryTier::Reflection => 1,
        MemoryTier::Summary => 2,
    }
}

fn u8_to_tier(v: u8) -> Option<MemoryTier> {
    match v {
        0 => Some(MemoryTier::Fact),
        1 => Some(MemoryTier::Reflection),
        2 => Some(MemoryTier::Summary),
        _ => None,
    }
}

impl From<&MemoryEntry> for StoredEntry {
    fn from(entry: &MemoryEntry) -> Self {
        let metadata = entry
            .metadata
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::to_string(v).unwrap_or_default()))
            .collect();
        StoredEntry {
            id: entry.id.0.clone(),
            user_id: entry.user_id.clone(),
            content: entry.content.clone(),
            memory_type: tier_to_u8(entry.memory_type),
            importance: entry.importance,
            timestamp: entry.timestamp,
            access_count: entry.access_count,
            last_accessed: entry.last_accessed,
            embedding: entry.embedding.clone(),
            metadata,
        }
    }
}

impl StoredEntry {
    fn into_entry(self) -> Option<MemoryEntry> {
        let memory_type = u8_to_tier(self.memory_type)?;
        let metadata = self
            .metadata
            .into_iter()
            .map(|(k, v)| (k, serde_json::from_str::<Value>(&v).unwrap_or(Value::String(v))))
            .collect();
        Some(MemoryEntry {
            id: MemoryId(self.id),
            user_id: self.user_id,
            content: self.content,
            memory_type,
            importance: self.importance,
            timestamp: self.timestamp,
            access_count: self.access_count,
            last_accessed: self.last_accessed,
            embedding: self.embedding,
            metadata,
        })
    }
}

/// Filters and ranking parameters for [`VectorStore::search`].
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    pub query_embedding: Option<Vec<f32>>,
    /// Plain-text fallback used only when `query_embedding` is absent and
    /// the store is default-backed.
    pub query_text: Option<String>,
    pub user_id: Option<String>,
    pub memory_type: Option<MemoryTier>,
    pub k: usize,
    pub threshold: Option<f32>,
    pub update_access: bool,
}

pub struct VectorStore {
    db: Database,
    path: PathBuf,
    entries: RwLock<HashMap<MemoryId, MemoryEntry>>,
    mode: RwLock<VectorStoreMode>,
    dim: RwLock<Option<usize>>,
}

impl VectorStore {
    /// Open or create the store at `dir`. `requested_mode` is the caller's
    /// construction-time choice, not something inferred at runtime. If an
    /// existing, non-empty collection disagrees with `requested_mode`,
    /// initialization fails closed — the caller must explicitly reindex.
    pub fn open(dir: impl AsRef<Path>, requested_mode: VectorStoreMode) -> Result<Self, EngineError> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| EngineError::fatal(format!("creating vector store dir {}: {e}", dir.display())))?;
        let db_path = dir.join("index.redb");
        let db = Database::create(&db_path)
            .map_err(|e| EngineError::fatal(format!("opening redb at {}: {e}", db_path.display())))?;

        {
            let tx = db
                .begin_write()
                .map_err(|e| EngineError::fatal(e.to_string()))?;
            {
                tx.open_table(ENTRIES_TABLE).map_err(|e| EngineError::fatal(e.to_string()))?;
                tx.open_table(META_TABLE).map_err(|e| EngineError::fatal(e.to_string()))?;
            }
            tx.commit().map_err(|e| EngineError::fatal(e.to_string()))?;
        }

        let mut entries = HashMap::new();
        {
            let tx = db.begin_read().map_err(|e| EngineError::fatal(e.to_string()))?;
            let table = tx.open_table(ENTRIES_TABLE).map_err(|e| EngineError::fatal(e.to_string()))?;
            for row in table.iter().map_err(|e| EngineError::fatal(e.to_string()))? {
                let (_, value) = row.map_err(|e| EngineError::fatal(e.to_string()))?;
                let (stored, _): (StoredEntry, usize) =
                    bincode::decode_from_slice(value.value(), bincode::config::standard())
                        .map_err(|e| EngineError::fatal(format!("corrupt vector store entry: {e}")))?;
                if let Some(entry) = stored.into_entry() {
                    entries.insert(entry.id.clone(), entry);
                }
            }
        }

        let stored_mode = {
            let tx = db.begin_read().map_err(|e| EngineError::fatal(e.to_string()))?;
            let table = tx.open_table(META_TABLE).map_err(|e| EngineError::fatal(e.to_string()))?;
            table
                .get(META_KEY_MODE)
                .map_err(|e| EngineError::fatal(e.to_string()))?
                .map(|v| v.value().to_vec())
        };

        let effective_mode = match stored_mode.as_deref() {
            // An existing collection already committed to external-only
            // stays that way regardless of what the caller requests —
            // only an empty collection can still choose its mode.
            Some([1u8]) => VectorStoreMode::ExternalOnly,
            Some([0u8]) => {
                if !entries.is_empty() && requested_mode != VectorStoreMode::DefaultBacked {
                    return Err(EngineError::consistency(
                        "existing collection is default-backed but a non-empty external-only mode was requested; drop and recreate the collection to reindex",
                    ));
                }
                requested_mode
            }
            _ => requested_mode,
        };

        let dim = {
            let tx = db.begin_read().map_err(|e| EngineError::fatal(e.to_string()))?;
            let table = tx.open_table(META_TABLE).map_err(|e| EngineError::fatal(e.to_string()))?;
            table
                .get(META_KEY_DIM)
                .map_err(|e| EngineError::fatal(e.to_string()))?
                .and_then(|v| v.value().get(0..4).map(|b| u32::from_le_bytes(b.try_into().unwrap()) as usize))
        };

        let store = Self {
            db,
            path: dir.to_path_buf(),
            entries: RwLock::new(entries),
            mode: RwLock::new(effective_mode),
            dim: RwLock::new(dim),
        };
        store.persist_meta()?;

        info!(path = %store.path.display(), mode = ?effective_mode, count = store.count(), "vector store opened");
        Ok(store)
    }

    fn persist_meta(&self) -> Result<(), EngineError> {
        let mode = *self.mode.read().unwrap();
        let dim = *self.dim.read().unwrap();
        let tx = self.db.begin_write().map_err(|e| EngineError::fatal(e.to_string()))?;
        {
            let mut table = tx.open_table(META_TABLE).map_err(|e| EngineError::fatal(e.to_string()))?;
            let mode_byte: [u8; 1] = if mode == VectorStoreMode::ExternalOnly { [1] } else { [0] };
            table.insert(META_KEY_MODE, mode_byte.as_slice()).map_err(|e| EngineError::fatal(e.to_string()))?;
            if let Some(d) = dim {
                table
                    .insert(META_KEY_DIM, (d as u32).to_le_bytes().as_slice())
                    .map_err(|e| EngineError::fatal(e.to_string()))?;
            }
        }
        tx.commit().map_err(|e| EngineError::fatal(e.to_string()))?;
        Ok(())
    }

    fn persist_entry(&self, entry: &MemoryEntry) -> Result<(), EngineError> {
        let stored = StoredEntry::from(entry);
        let bytes = bincode::encode_to_vec(&stored, bincode::config::standard())
            .map_err(|e| EngineError::fatal(e.to_string()))?;
        let tx = self.db.begin_write().map_err(|e| EngineError::fatal(e.to_string()))?;
        {
            let mut table = tx.open_table(ENTRIES_TABLE).map_err(|e| EngineError::fatal(e.to_string()))?;
            table
                .insert(entry.id.0.as_str(), bytes.as_slice())
                .map_err(|e| EngineError::fatal(e.to_string()))?;
        }
        tx.commit().map_err(|e| EngineError::fatal(e.to_string()))?;
        Ok(())
    }

    fn remove_persisted(&self, id: &MemoryId) -> Result<(), EngineError> {
        let tx = self.db.begin_write().map_err(|e| EngineError::fatal(e.to_string()))?;
        {
            let mut table = tx.open_table(ENTRIES_TABLE).map_err(|e| EngineError::fatal(e.to_string()))?;
            table.remove(id.0.as_str()).map_err(|e| EngineError::fatal(e.to_string()))?;
        }
        tx.commit().map_err(|e| EngineError::fatal(e.to_string()))?;
        Ok(())
    }

    pub fn mode(&self) -> VectorStoreMode {
        *self.mode.read().unwrap()
    }

    pub fn dimension(&self) -> Option<usize> {
        *self.dim.read().unwrap()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn count(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Deterministic local stand-in for a backend-provided default
    /// embedding. Not a real model — a fixed-width bag-of-character-
    /// trigrams hash, used only in default-backed mode when no embedding
    /// was supplied.
    fn fallback_embedding(text: &str) -> Vec<f32> {
        const DIM: usize = 64;
        let mut vector = vec![0f32; DIM];
        let bytes: Vec<u8> = text.to_lowercase().into_bytes();
        if bytes.len() < 3 {
            vector[0] = 1.0;
            return vector;
        }
        for window in bytes.windows(3) {
            let mut hash: u32 = 2166136261;
            for b in window {
                hash ^= *b as u32;
                hash = hash.wrapping_mul(16777619);
            }
            vector[(hash as usize) % DIM] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }

    /// Upsert by id.
    pub fn add_memory(&self, mut entry: MemoryEntry, embedding: Option<Vec<f32>>) -> Result<(), EngineError> {
        let resolved = match embedding {
            Some(vec) if vec.is_empty() => {
                return Err(EngineError::validation("embedding must be a non-empty vector"));
            }
            Some(vec) => vec,
            None => {
                if self.mode() == VectorStoreMode::ExternalOnly {
                    return Err(EngineError::consistency(
                        "MissingEmbedding: index is external-only and no embedding was supplied",
                    ));
                }
                Self::fallback_embedding(&entry.content)
            }
        };

        {
            let mut dim_guard = self.dim.write().unwrap();
            match *dim_guard {
                Some(existing) if existing != resolved.len() => {
                    return Err(EngineError::consistency(format!(
                        "embedding dimension mismatch: store is {existing}-dim, got {}-dim",
                        resolved.len()
                    )));
                }
                Some(_) => {}
                None => *dim_guard = Some(resolved.len()),
            }
        }

        // First externally-supplied upsert on an empty, default-backed
        // collection switches the index to external-only permanently.
        if self.mode() == VectorStoreMode::DefaultBacked && self.count() == 0 {
            *self.mode.write().unwrap() = VectorStoreMode::ExternalOnly;
        }

        entry.embedding = resolved;
        if entry.timestamp == 0.0 {
            entry.timestamp = now_seconds();
        }
        if entry.last_accessed == 0.0 {
            entry.last_accessed = entry.timestamp;
        }

        self.persist_entry(&entry)?;
        self.persist_meta()?;
        self.entries.write().unwrap().insert(entry.id.clone(), entry);
        Ok(())
    }

    /// Ranked semantic search. Never raises — on any internal failure this
    /// returns an empty vector.
    pub fn search(&self, query: SearchQuery) -> Vec<MemoryEntry> {
        let k = query.k.max(1);

        let embedding = query.query_embedding.clone().or_else(|| {
            if self.mode() == VectorStoreMode::DefaultBacked {
                query.query_text.as_deref().map(Self::fallback_embedding)
            } else {
                None
            }
        });

        let Some(embedding) = embedding else {
            if query.query_text.is_some() {
                debug!("text-only query against external-only index with no embedding function, returning empty");
            }
            return Vec::new();
        };

        let entries = self.entries.read().unwrap();
        let mut scored: Vec<(f32, MemoryId)> = entries
            .values()
            .filter(|entry| query.user_id.as_deref().is_none_or(|uid| entry.user_id == uid))
            .filter(|entry| query.memory_type.is_none_or(|ty| entry.memory_type == ty))
            .map(|entry| (cosine_distance(&embedding, &entry.embedding), entry.id.clone()))
            .filter(|(distance, _)| query.threshold.is_none_or(|t| *distance <= t))
            .collect();
        scored.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);

        let ids: Vec<MemoryId> = scored.into_iter().map(|(_, id)| id).collect();
        drop(entries);

        if !query.update_access {
            let entries = self.entries.read().unwrap();
            return ids.iter().filter_map(|id| entries.get(id).cloned()).collect();
        }

        let now = now_seconds();
        let mut entries = self.entries.write().unwrap();
        let mut results = Vec::with_capacity(ids.len());
        for id in &ids {
            if let Some(entry) = entries.get_mut(id) {
                entry.access_count += 1;
                entry.last_accessed = now;
                results.push(entry.clone());
            }
        }
        drop(entries);
        for result in &results {
            if let Err(err) = self.persist_entry(result) {
                warn!(%err, id = %result.id, "failed to persist access-count update");
            }
        }
        results
    }

    pub fn get_by_user(&self, user_id: &str, memory_type: Option<MemoryTier>, limit: usize) -> Vec<MemoryEntry> {
        let entries = self.entries.read().unwrap();
        let mut matches: Vec<MemoryEntry> = entries
            .values()
            .filter(|e| e.user_id == user_id)
            .filter(|e| memory_type.is_none_or(|ty| e.memory_type == ty))
            .cloned()
            .collect();
        matches.sort_by(|a, b| b.timestamp.partial_cmp(&a.timestamp).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(limit.max(1));
        matches
    }

    /// Pagination for the forgetter. Ordered by id for a stable,
    /// deterministic page boundary.
    pub fn get_all_memories(&self, limit: usize, offset: usize) -> Vec<MemoryEntry> {
        let entries = self.entries.read().unwrap();
        let mut all: Vec<&MemoryEntry> = entries.values().collect();
        all.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        all.into_iter().skip(offset).take(limit.max(1)).cloned().collect()
    }

    pub fn get_memory_by_id(&self, id: &MemoryId) -> Option<MemoryEntry> {
        self.entries.read().unwrap().get(id).cloned()
    }

    /// Partial update. Refuses the write (`false`) rather than persisting
    /// text with a stale vector.
    pub fn update_memory(
        &self,
        id: &MemoryId,
        content: Option<String>,
        importance: Option<u8>,
        metadata: Option<HashMap<String, Value>>,
        embedding: Option<Vec<f32>>,
    ) -> bool {
        let content_changed = content.is_some();
        if content_changed && self.mode() == VectorStoreMode::ExternalOnly && embedding.as_ref().is_none_or(|e| e.is_empty()) {
            return false;
        }

        let mut entries = self.entries.write().unwrap();
        let Some(entry) = entries.get_mut(id) else {
            return false;
        };

        if let Some(content) = content {
            entry.content = content;
            if let Some(embedding) = embedding {
                entry.embedding = embedding;
            } else if self.mode() == VectorStoreMode::DefaultBacked {
                entry.embedding = Self::fallback_embedding(&entry.content);
            }
        }
        if let Some(importance) = importance {
            entry.importance = importance.clamp(1, 10);
        }
        if let Some(metadata) = metadata {
            entry.metadata = metadata;
        }

        let snapshot = entry.clone();
        drop(entries);
        if let Err(err) = self.persist_entry(&snapshot) {
            warn!(%err, %id, "failed to persist memory update");
            return false;
        }
        true
    }

    pub fn delete_memory(&self, id: &MemoryId) -> bool {
        let removed = self.entries.write().unwrap().remove(id).is_some();
        if removed {
            if let Err(err) = self.remove_persisted(id) {
                warn!(%err, %id, "failed to delete persisted memory entry");
            }
        }
        removed
    }

    pub fn seen_ids(&self) -> HashSet<String> {
        self.entries.read().unwrap().keys().map(|id| id.0.clone()).collect()
    }
}

pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return f32::MAX;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    let similarity = (dot / (norm_a * norm_b)).clamp(-1.0, 1.0);
    1.0 - similarity
}

pub fn now_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;

    fn entry(id: &str, user_id: &str, content: &str, ty: MemoryTier, importance: u8) -> MemoryEntry {
        MemoryEntry {
            id: MemoryId(id.to_string()),
            user_id: user_id.to_string(),
            content: content.to_string(),
            memory_type: ty,
            importance,
            timestamp: now_seconds(),
            access_count: 0,
            last_accessed: now_seconds(),
            embedding: Vec::new(),
            metadata: Map::new(),
        }
    }

    #[test]
    fn external_only_rejects_missing_embedding() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path(), VectorStoreMode::ExternalOnly).unwrap();
        let err = store.add_memory(entry("abc123456789", "u1", "hi", MemoryTier::Fact, 5), None);
        assert!(err.is_err());
    }

    #[test]
    fn add_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path(), VectorStoreMode::ExternalOnly).unwrap();
        store
            .add_memory(entry("abc123456789", "u1", "hi", MemoryTier::Fact, 5), Some(vec![1.0, 0.0, 0.0]))
            .unwrap();
        let fetched = store.get_memory_by_id(&MemoryId("abc123456789".to_string())).unwrap();
        assert_eq!(fetched.content, "hi");
        assert_eq!(fetched.embedding.len(), 3);
    }

    #[test]
    fn empty_store_search_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path(), VectorStoreMode::ExternalOnly).unwrap();
        let results = store.search(SearchQuery {
            query_embedding: Some(vec![1.0, 0.0]),
            k: 5,
            update_access: true,
            ..Default::default()
        });
        assert!(results.is_empty());
    }

    #[test]
    fn text_only_search_against_external_only_index_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path(), VectorStoreMode::ExternalOnly).unwrap();
        store
            .add_memory(entry("abc123456789", "u1", "hi", MemoryTier::Fact, 5), Some(vec![1.0, 0.0]))
            .unwrap();
        let results = store.search(SearchQuery {
            query_text: Some("hi".to_string()),
            k: 5,
            update_access: true,
            ..Default::default()
        });
        assert!(results.is_empty());
    }

    #[test]
    fn search_updates_access_stats_only_when_requested() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path(), VectorStoreMode::ExternalOnly).unwrap();
        store
            .add_memory(entry("abc123456789", "u1", "hi", MemoryTier::Fact, 5), Some(vec![1.0, 0.0]))
            .unwrap();

        store.search(SearchQuery {
            query_embedding: Some(vec![1.0, 0.0]),
            k: 5,
            update_access: false,
            ..Default::default()
        });
        assert_eq!(store.get_memory_by_id(&MemoryId("abc123456789".to_string())).unwrap().access_count, 0);

        store.search(SearchQuery {
            query_embedding: Some(vec![1.0, 0.0]),
            k: 5,
            update_access: true,
            ..Default::default()
        });
        assert_eq!(store.get_memory_by_id(&MemoryId("abc123456789".to_string())).unwrap().access_count, 1);
    }

    #[test]
    fn update_memory_with_new_content_requires_embedding_in_external_only_mode() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path(), VectorStoreMode::ExternalOnly).unwrap();
        store
            .add_memory(entry("abc123456789", "u1", "hi", MemoryTier::Fact, 5), Some(vec![1.0, 0.0]))
            .unwrap();
        let id = MemoryId("abc123456789".to_string());

        let refused = store.update_memory(&id, Some("new content".to_string()), None, None, None);
        assert!(!refused);
        assert_eq!(store.get_memory_by_id(&id).unwrap().content, "hi");

        let accepted = store.update_memory(&id, Some("new content".to_string()), None, None, Some(vec![0.0, 1.0]));
        assert!(accepted);
        let updated = store.get_memory_by_id(&id).unwrap();
        assert_eq!(updated.content, "new content");
        assert_eq!(updated.embedding, vec![0.0, 1.0]);
    }

    #[test]
    fn get_all_memories_pages_through_every_entry_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path(), VectorStoreMode::ExternalOnly).unwrap();
        for i in 0..7 {
            let id = format!("id{i:010}");
            store
                .add_memory(entry(&id, "u1", "fact", MemoryTier::Fact, 5), Some(vec![i as f32, 0.0]))
                .unwrap();
        }

        let mut seen = HashSet::new();
        let mut offset = 0;
        loop {
            let page = store.get_all_memories(3, offset);
            if page.is_empty() {
                break;
            }
            let page_len = page.len();
            for entry in page {
                seen.insert(entry.id.0);
            }
            offset += page_len;
            if page_len < 3 {
                break;
            }
        }
        assert_eq!(seen.len(), 7);
    }

    #[test]
    fn cosine_distance_is_zero_for_identical_vectors() {
        let a = vec![1.0, 2.0, 3.0];
        assert!(cosine_distance(&a, &a) < 1e-6);
    }

    #[test]
    fn dimension_mismatch_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = VectorStore::open(dir.path(), VectorStoreMode::ExternalOnly).unwrap();
        store
            .add_memory(entry("abc123456789", "u1", "hi", MemoryTier::Fact, 5), Some(vec![1.0, 0.0, 0.0]))
            .unwrap();
        let err = store.add_memory(entry("def123456789", "u1", "bye", MemoryTier::Fact, 5), Some(vec![1.0, 0.0]));
        assert!(err.is_err());
    }
}

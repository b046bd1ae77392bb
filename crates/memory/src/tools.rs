//! External tool surface: memory operations exposed to a calling agent as
//! a handful of small, string-returning operations rather than the
//! manager's full API — callers get a `Weak` handle so a long-lived tool
//! registry never keeps the engine alive past its owner.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};

use crate::manager::MemoryManager;
use crate::schema::{MemoryId, ProfileUpdate};
use crate::vector_store::now_seconds;

/// Tracks which `core.txt` line corresponds to which vector store id, so a
/// line removal can keep the vector entry's lifecycle in sync.
#[derive(Default, Serialize, Deserialize)]
pub struct CoreVectorMap {
    /// `line_index -> vector_id`.
    entries: HashMap<usize, String>,
}

impl CoreVectorMap {
    pub fn load(path: &std::path::Path) -> Self {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn save(&self, path: &std::path::Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)
    }

    pub fn insert(&mut self, line_index: usize, vector_id: String) {
        self.entries.insert(line_index, vector_id);
    }

    pub fn get(&self, line_index: usize) -> Option<&String> {
        self.entries.get(&line_index)
    }

    /// After a `core.txt` line is removed, every mapped index greater than
    /// the removed one shifts down by one to track the new line numbers.
    pub fn shift_after_removal(&mut self, removed_index: usize) {
        self.entries.remove(&removed_index);
        let shifted: HashMap<usize, String> = self
            .entries
            .drain()
            .map(|(k, v)| if k > removed_index { (k - 1, v) } else { (k, v) })
            .collect();
        self.entries = shifted;
    }
}

pub struct MemoryTools {
    manager: Weak<MemoryManager>,
    core_vector_map_path: std::path::PathBuf,
    core_vector_map: Mutex<CoreVectorMap>,
}

impl MemoryTools {
    pub fn new(manager: &Arc<MemoryManager>) -> Self {
        let path = manager.config().core_vector_map_path();
        let map = CoreVectorMap::load(&path);
        Self {
            manager: Arc::downgrade(manager),
            core_vector_map_path: path,
            core_vector_map: Mutex::new(map),
        }
    }

    fn manager(&self) -> Option<Arc<MemoryManager>> {
        self.manager.upgrade()
    }

    /// Pin a line to `core.txt` and, if an embedding is available, index
    /// it in the vector store too so it participates in recall.
    pub async fn memory_add(&self, content: &str) -> String {
        let Some(manager) = self.manager() else {
            return "memory engine is no longer available".to_string();
        };
        let index = match manager.core_memory().append(content.to_string()) {
            Ok(index) => index,
            Err(err) => return format!("failed to add memory: {err}"),
        };

        let entry = crate::schema::MemoryEntry {
            id: MemoryId::generate(&manager.vector_store().seen_ids()),
            user_id: "core".to_string(),
            content: content.to_string(),
            memory_type: crate::schema::MemoryTier::Fact,
            importance: 7,
            timestamp: now_seconds(),
            access_count: 0,
            last_accessed: now_seconds(),
            embedding: Vec::new(),
            metadata: HashMap::new(),
        };

        match manager.vector_store().add_memory(entry.clone(), None) {
            Ok(()) => {
                let mut map = self.core_vector_map.lock().unwrap();
                map.insert(index, entry.id.0.clone());
                if let Err(err) = map.save(&self.core_vector_map_path) {
                    return format!("saved core line but failed to sync vector map: {err}");
                }
                "memory added".to_string()
            }
            Err(err) => format!("saved core line but failed to index it for recall: {err}"),
        }
    }

    pub fn memory_remove(&self, index: usize) -> String {
        let Some(manager) = self.manager() else {
            return "memory engine is no longer available".to_string();
        };
        match manager.core_memory().remove(index) {
            Ok(true) => {
                let mut map = self.core_vector_map.lock().unwrap();
                if let Some(vector_id) = map.get(index).cloned() {
                    manager.vector_store().delete_memory(&MemoryId(vector_id));
                }
                map.shift_after_removal(index);
                if let Err(err) = map.save(&self.core_vector_map_path) {
                    return format!("removed core line but failed to sync vector map: {err}");
                }
                "memory removed".to_string()
            }
            Ok(false) => format!("no memory at index {index}"),
            Err(err) => format!("failed to remove memory: {err}"),
        }
    }

    /// Replace the line at `index` with `content`: removes the old line
    /// (and its vector entry) and re-adds it so the embedding stays in
    /// sync with the new text.
    pub async fn memory_update(&self, index: usize, content: &str) -> String {
        let removal = self.memory_remove(index);
        if removal != "memory removed" {
            return removal;
        }
        self.memory_add(content).await
    }

    pub async fn memory_search(&self, user_id: &str, query: &str, k: usize) -> String {
        let Some(manager) = self.manager() else {
            return "memory engine is no longer available".to_string();
        };
        let results = manager.recall(user_id, query, k).await;
        if results.is_empty() {
            return "no matching memories found".to_string();
        }
        crate::manager::MemoryManager::format_recalled_memories(&results)
    }

    pub fn profile_view(&self, user_id: &str) -> String {
        let Some(manager) = self.manager() else {
            return "memory engine is no longer available".to_string();
        };
        let prompt = manager.get_user_profile_prompt(user_id);
        if prompt.is_empty() {
            "no profile on file for this user".to_string()
        } else {
            prompt
        }
    }

    pub fn profile_update(&self, user_id: &str, update: ProfileUpdate) -> String {
        let Some(manager) = self.manager() else {
            return "memory engine is no longer available".to_string();
        };
        match manager.update_user_profile(user_id, &[update]) {
            Ok(_) => "profile updated".to_string(),
            Err(err) => format!("failed to update profile: {err}"),
        }
    }
}

/// JSON wire shape an agent's tool-call layer would deserialize into a
/// [`ProfileUpdate`].
#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProfileUpdateRequest {
    SetName { value: String },
    SetNickname { value: String },
    AddTrait { value: String },
    RemoveTrait { value: String },
    AddFact { value: String },
    RemoveFact { value: String },
    SetPreference { key: String, value: String },
    SetRelationship { target: String, relation: String },
}

impl From<ProfileUpdateRequest> for ProfileUpdate {
    fn from(request: ProfileUpdateRequest) -> Self {
        match request {
            ProfileUpdateRequest::SetName { value } => ProfileUpdate::SetName(value),
            ProfileUpdateRequest::SetNickname { value } => ProfileUpdate::SetNickname(value),
            ProfileUpdateRequest::AddTrait { value } => ProfileUpdate::AddTrait(value),
            ProfileUpdateRequest::RemoveTrait { value } => ProfileUpdate::RemoveTrait(value),
            ProfileUpdateRequest::AddFact { value } => ProfileUpdate::AddFact(value),
            ProfileUpdateRequest::RemoveFact { value } => ProfileUpdate::RemoveFact(value),
            ProfileUpdateRequest::SetPreference { key, value } => ProfileUpdate::SetPreference { key, value },
            ProfileUpdateRequest::SetRelationship { target, relation } => ProfileUpdate::SetRelationship { target, relation },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_vector_map_shift_after_removal_decrements_higher_indices() {
        let mut map = CoreVectorMap::default();
        map.insert(0, "a".to_string());
        map.insert(1, "b".to_string());
        map.insert(2, "c".to_string());

        map.shift_after_removal(1);

        assert_eq!(map.get(0), Some(&"a".to_string()));
        assert_eq!(map.get(1), Some(&"c".to_string()));
        assert_eq!(map.get(2), None);
    }

    #[test]
    fn profile_update_request_maps_to_profile_update() {
        let request = ProfileUpdateRequest::SetName { value: "Ada".to_string() };
        match ProfileUpdate::from(request) {
            ProfileUpdate::SetName(value) => assert_eq!(value, "Ada"),
            _ => panic!("wrong variant"),
        }
    }
}

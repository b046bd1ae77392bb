//! Short-term memory: the fast loop's per-session window.
//!
//! `chat_memory.json` holds, per session, a sliding window of message
//! chunks. `core.txt` holds a small number of pinned lines the caller
//! manages directly through [`crate::tools`]. Legacy files written as a
//! bare chunk list (no envelope) are upgraded in place on first load and
//! persisted in the new shape on the next write.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;
use tracing::warn;

use crate::error::EngineError;
use crate::schema::{SessionMemory, SessionMessage};

pub struct ShortTermMemory {
    path: PathBuf,
    max_memory_length: usize,
    sessions: Mutex<HashMap<String, SessionMemory>>,
}

impl ShortTermMemory {
    pub fn open(path: impl AsRef<Path>, max_memory_length: usize) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        let sessions = load_sessions(&path)?;
        Ok(Self {
            path,
            max_memory_length: max_memory_length.max(1),
            sessions: Mutex::new(sessions),
        })
    }

    pub fn read_memory(&self, session_id: &str) -> SessionMemory {
        self.sessions.lock().unwrap().get(session_id).cloned().unwrap_or_default()
    }

    /// Append one chunk (a list of turns) to the session's window, evicting
    /// the oldest chunk once the window exceeds `max_memory_length`. This
    /// only bounds how much fast-loop history is kept around; it has no
    /// bearing on what reaches the hippocampus's slow loop, which buffers
    /// the chunk independently of eviction. Returns the evicted chunks for
    /// callers that want to know what fell out of the window.
    pub fn append_chunk(&self, session_id: &str, chunk: Vec<SessionMessage>) -> Result<Vec<Vec<SessionMessage>>, EngineError> {
        let evicted = {
            let mut sessions = self.sessions.lock().unwrap();
            let memory = sessions.entry(session_id.to_string()).or_default();
            memory.memory.push(chunk);
            let mut evicted = Vec::new();
            while memory.memory.len() > self.max_memory_length {
                evicted.push(memory.memory.remove(0));
            }
            evicted
        };
        self.persist()?;
        Ok(evicted)
    }

    pub fn write_memory(&self, session_id: &str, memory: SessionMemory) -> Result<(), EngineError> {
        self.sessions.lock().unwrap().insert(session_id.to_string(), memory);
        self.persist()
    }

    pub fn update_title_and_description(&self, session_id: &str, title: String, description: String) -> Result<(), EngineError> {
        {
            let mut sessions = self.sessions.lock().unwrap();
            let memory = sessions.entry(session_id.to_string()).or_default();
            memory.title = title;
            memory.description = description;
        }
        self.persist()
    }

    pub fn delete_session(&self, session_id: &str) -> Result<bool, EngineError> {
        let removed = self.sessions.lock().unwrap().remove(session_id).is_some();
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.lock().unwrap().keys().cloned().collect()
    }

    fn persist(&self) -> Result<(), EngineError> {
        let snapshot = self.sessions.lock().unwrap().clone();
        write_atomic(&self.path, &snapshot)
    }
}

/// `core.txt` — a flat, caller-managed list of pinned lines, one per line.
pub struct CoreMemory {
    path: PathBuf,
    lines: Mutex<Vec<String>>,
}

impl CoreMemory {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        let lines = match std::fs::read_to_string(&path) {
            Ok(raw) => raw.lines().map(|l| l.to_string()).collect(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(EngineError::fatal(format!("reading {}: {err}", path.display()))),
        };
        Ok(Self { path, lines: Mutex::new(lines) })
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn append(&self, line: String) -> Result<usize, EngineError> {
        let index = {
            let mut lines = self.lines.lock().unwrap();
            lines.push(line);
            lines.len() - 1
        };
        self.persist()?;
        Ok(index)
    }

    /// Remove the line at `index`, returning `true` if it existed. Callers
    /// holding a `line_index -> vector_id` map must shift every stored
    /// index `k > index` down by one after this succeeds.
    pub fn remove(&self, index: usize) -> Result<bool, EngineError> {
        let removed = {
            let mut lines = self.lines.lock().unwrap();
            if index >= lines.len() {
                false
            } else {
                lines.remove(index);
                true
            }
        };
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    fn persist(&self) -> Result<(), EngineError> {
        let rendered = self.lines.lock().unwrap().join("\n");
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::fatal(e.to_string()))?;
        }
        let tmp_path = self.path.with_extension("txt.tmp");
        {
            let mut file = std::fs::File::create(&tmp_path).map_err(|e| EngineError::fatal(e.to_string()))?;
            file.write_all(rendered.as_bytes()).map_err(|e| EngineError::fatal(e.to_string()))?;
            file.flush().map_err(|e| EngineError::fatal(e.to_string()))?;
            file.sync_all().map_err(|e| EngineError::fatal(e.to_string()))?;
        }
        std::fs::rename(&tmp_path, &self.path).map_err(|e| EngineError::fatal(e.to_string()))?;
        Ok(())
    }
}

fn load_sessions(path: &Path) -> Result<HashMap<String, SessionMemory>, EngineError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(HashMap::new()),
        Err(err) => return Err(EngineError::fatal(format!("reading {}: {err}", path.display()))),
    };
    if raw.trim().is_empty() {
        return Ok(HashMap::new());
    }

    let root: Value = match serde_json::from_str(&raw) {
        Ok(value) => value,
        Err(err) => {
            warn!(%err, path = %path.display(), "chat memory file is not valid JSON, starting empty");
            return Ok(HashMap::new());
        }
    };

    let Value::Object(map) = root else {
        warn!(path = %path.display(), "chat memory file root is not an object, starting empty");
        return Ok(HashMap::new());
    };

    let mut sessions = HashMap::new();
    for (session_id, entry) in map {
        let memory = upgrade_legacy_shape(entry, &session_id);
        sessions.insert(session_id, memory);
    }
    Ok(sessions)
}

/// A legacy entry is a bare `[[{role, content}, ...], ...]` list with no
/// `title`/`description` envelope. Upgrade it in place; the next
/// `persist()` writes it back in the current shape.
fn upgrade_legacy_shape(entry: Value, session_id: &str) -> SessionMemory {
    if let Value::Array(_) = &entry {
        match serde_json::from_value::<Vec<Vec<SessionMessage>>>(entry) {
            Ok(chunks) => {
                return SessionMemory {
                    title: String::new(),
                    description: String::new(),
                    memory: chunks,
                };
            }
            Err(err) => {
                warn!(%err, session_id, "legacy chat memory entry is malformed, starting empty");
                return SessionMemory::default();
            }
        }
    }

    match serde_json::from_value::<SessionMemory>(entry) {
        Ok(memory) => memory,
        Err(err) => {
            warn!(%err, session_id, "chat memory entry is malformed, starting empty");
            SessionMemory::default()
        }
    }
}

fn write_atomic(path: &Path, sessions: &HashMap<String, SessionMemory>) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| EngineError::fatal(format!("creating {}: {e}", parent.display())))?;
    }
    let rendered = serde_json::to_string_pretty(sessions).map_err(|e| EngineError::fatal(e.to_string()))?;
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp_path).map_err(|e| EngineError::fatal(e.to_string()))?;
        file.write_all(rendered.as_bytes()).map_err(|e| EngineError::fatal(e.to_string()))?;
        file.flush().map_err(|e| EngineError::fatal(e.to_string()))?;
        file.sync_all().map_err(|e| EngineError::fatal(e.to_string()))?;
    }
    std::fs::rename(&tmp_path, path).map_err(|e| EngineError::fatal(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, content: &str) -> SessionMessage {
        SessionMessage { role: role.to_string(), content: content.to_string() }
    }

    #[test]
    fn append_chunk_evicts_oldest_above_max_length() {
        let dir = tempfile::tempdir().unwrap();
        let store = ShortTermMemory::open(dir.path().join("chat_memory.json"), 2).unwrap();
        store.append_chunk("s1", vec![msg("user", "one")]).unwrap();
        store.append_chunk("s1", vec![msg("user", "two")]).unwrap();
        let evicted = store.append_chunk("s1", vec![msg("user", "three")]).unwrap();

        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0][0].content, "one");
        let memory = store.read_memory("s1");
        assert_eq!(memory.memory.len(), 2);
    }

    #[test]
    fn legacy_bare_list_entry_upgrades_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat_memory.json");
        std::fs::write(&path, r#"{"s1": [[{"role": "user", "content": "hi"}]]}"#).unwrap();

        let store = ShortTermMemory::open(&path, 40).unwrap();
        let memory = store.read_memory("s1");
        assert_eq!(memory.memory.len(), 1);
        assert_eq!(memory.title, "");
    }

    #[test]
    fn core_memory_append_and_remove_shift_semantics() {
        let dir = tempfile::tempdir().unwrap();
        let core = CoreMemory::open(dir.path().join("core.txt")).unwrap();
        let idx_a = core.append("first".to_string()).unwrap();
        let idx_b = core.append("second".to_string()).unwrap();
        assert_eq!((idx_a, idx_b), (0, 1));

        assert!(core.remove(0).unwrap());
        assert_eq!(core.lines(), vec!["second".to_string()]);
    }

    #[test]
    fn delete_session_persists_removal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat_memory.json");
        let store = ShortTermMemory::open(&path, 40).unwrap();
        store.append_chunk("s1", vec![msg("user", "hi")]).unwrap();
        assert!(store.delete_session("s1").unwrap());

        let reopened = ShortTermMemory::open(&path, 40).unwrap();
        assert!(reopened.read_memory("s1").memory.is_empty());
    }
}

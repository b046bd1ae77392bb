//! User profile store.
//!
//! Whole-file JSON persisted atomically (write-temp, flush, fsync, rename),
//! guarded by two locks: a content lock held only while a snapshot is
//! computed in memory, and a separate save lock held only during the I/O.
//! A caller mutating one profile never blocks a caller reading another.

use std::collections::HashMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::schema::{ProfileUpdate, UserProfile};

pub struct ProfileStore {
    path: PathBuf,
    content: Mutex<HashMap<String, UserProfile>>,
    save_lock: Mutex<()>,
}

impl ProfileStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref().to_path_buf();
        let content = load_profiles(&path)?;
        Ok(Self {
            path,
            content: Mutex::new(content),
            save_lock: Mutex::new(()),
        })
    }

    pub fn get_profile(&self, user_id: &str) -> UserProfile {
        self.content
            .lock()
            .unwrap()
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| UserProfile::new(user_id))
    }

    pub fn get_all_profiles(&self) -> Vec<UserProfile> {
        self.content.lock().unwrap().values().cloned().collect()
    }

    /// Apply `updates` to `user_id`'s profile and persist. Every call
    /// touches `last_interaction` implicitly is NOT assumed — callers that
    /// want that include `ProfileUpdate::Touch` explicitly.
    pub fn update_profile(&self, user_id: &str, updates: &[ProfileUpdate]) -> Result<UserProfile, EngineError> {
        let snapshot = {
            let mut profiles = self.content.lock().unwrap();
            let profile = profiles.entry(user_id.to_string()).or_insert_with(|| UserProfile::new(user_id));
            for update in updates {
                apply_update(profile, update);
            }
            profile.clone()
        };
        self.persist()?;
        Ok(snapshot)
    }

    pub fn increment_interaction(&self, user_id: &str, now: f64) -> Result<UserProfile, EngineError> {
        self.increment_and_update_profile(user_id, now, &[])
    }

    /// Combined increment-then-update as a single critical section, so
    /// only one persist happens for both effects.
    pub fn increment_and_update_profile(
        &self,
        user_id: &str,
        now: f64,
        updates: &[ProfileUpdate],
    ) -> Result<UserProfile, EngineError> {
        let snapshot = {
            let mut profiles = self.content.lock().unwrap();
            let profile = profiles.entry(user_id.to_string()).or_insert_with(|| UserProfile::new(user_id));
            profile.interaction_count += 1;
            profile.last_interaction = now;
            for update in updates {
                apply_update(profile, update);
            }
            profile.clone()
        };
        self.persist()?;
        Ok(snapshot)
    }

    pub fn get_profile_prompt(&self, user_id: &str) -> String {
        let profile = self.get_profile(user_id);
        render_prompt(&profile)
    }

    pub fn delete_profile(&self, user_id: &str) -> Result<bool, EngineError> {
        let removed = {
            let mut profiles = self.content.lock().unwrap();
            profiles.remove(user_id).is_some()
        };
        if removed {
            self.persist()?;
        }
        Ok(removed)
    }

    fn persist(&self) -> Result<(), EngineError> {
        let snapshot = self.content.lock().unwrap().clone();
        let _guard = self.save_lock.lock().unwrap();
        write_atomic(&self.path, &snapshot)
    }
}

fn apply_update(profile: &mut UserProfile, update: &ProfileUpdate) {
    match update {
        ProfileUpdate::SetName(name) => profile.name = name.clone(),
        ProfileUpdate::SetNickname(nickname) => profile.nickname = nickname.clone(),
        ProfileUpdate::SetPlatform(platform) => profile.platform = platform.clone(),
        ProfileUpdate::AddTrait(value) => {
            profile.traits.insert(value.clone());
        }
        ProfileUpdate::RemoveTrait(value) => {
            profile.traits.remove(value);
        }
        ProfileUpdate::AddFact(fact) => {
            profile.add_fact(fact.clone());
        }
        ProfileUpdate::RemoveFact(fact) => {
            profile.facts.retain(|f| f != fact);
        }
        ProfileUpdate::SetPreference { key, value } => {
            profile.preferences.insert(key.clone(), value.clone());
        }
        ProfileUpdate::SetRelationship { target, relation } => {
            profile.relationships.insert(target.clone(), relation.clone());
        }
        ProfileUpdate::Touch => {}
    }
}

fn render_prompt(profile: &UserProfile) -> String {
    let mut lines = Vec::new();
    if !profile.name.is_empty() {
        lines.push(format!("Name: {}", profile.name));
    }
    if !profile.nickname.is_empty() {
        lines.push(format!("Nickname: {}", profile.nickname));
    }
    if !profile.traits.is_empty() {
        lines.push(format!("Traits: {}", profile.traits.as_slice().join(", ")));
    }
    if !profile.facts.is_empty() {
        lines.push("Known facts:".to_string());
        for fact in &profile.facts {
            lines.push(format!("- {fact}"));
        }
    }
    if !profile.preferences.is_empty() {
        let mut prefs: Vec<String> = profile.preferences.iter().map(|(k, v)| format!("{k}: {v}")).collect();
        prefs.sort();
        lines.push(format!("Preferences: {}", prefs.join(", ")));
    }
    if !profile.relationships.is_empty() {
        let mut rels: Vec<String> = profile.relationships.iter().map(|(k, v)| format!("{k} is {v}")).collect();
        rels.sort();
        lines.push(format!("Relationships: {}", rels.join(", ")));
    }
    lines.join("\n")
}

/// Load every profile entry, skipping malformed individual entries rather
/// than failing the whole load.
fn load_profiles(path: &Path) -> Result<HashMap<String, UserProfile>, EngineError> {
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
            warn!(%err, path = %path.display(), "user profile file is not valid JSON, starting empty");
            return Ok(HashMap::new());
        }
    };

    let Value::Object(map) = root else {
        warn!(path = %path.display(), "user profile file root is not an object, starting empty");
        return Ok(HashMap::new());
    };

    let mut profiles = HashMap::new();
    for (user_id, entry) in map {
        match serde_json::from_value::<UserProfile>(entry) {
            Ok(mut profile) => {
                profile.rehydrate();
                if profile.user_id.is_empty() {
                    profile.user_id = user_id.clone();
                }
                profiles.insert(user_id, profile);
            }
            Err(err) => {
                warn!(%err, %user_id, "skipping malformed user profile entry");
            }
        }
    }
    debug!(count = profiles.len(), path = %path.display(), "loaded user profiles");
    Ok(profiles)
}

fn write_atomic(path: &Path, profiles: &HashMap<String, UserProfile>) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| EngineError::fatal(format!("creating {}: {e}", parent.display())))?;
    }

    let rendered = serde_json::to_string_pretty(profiles)
        .map_err(|e| EngineError::fatal(format!("serializing user profiles: {e}")))?;

    let tmp_path = path.with_extension("json.tmp");
    {
        let mut file = std::fs::File::create(&tmp_path)
            .map_err(|e| EngineError::fatal(format!("creating {}: {e}", tmp_path.display())))?;
        file.write_all(rendered.as_bytes())
            .map_err(|e| EngineError::fatal(format!("writing {}: {e}", tmp_path.display())))?;
        file.flush().map_err(|e| EngineError::fatal(e.to_string()))?;
        file.sync_all().map_err(|e| EngineError::fatal(e.to_string()))?;
    }
    std::fs::rename(&tmp_path, path).map_err(|e| EngineError::fatal(format!("renaming {}: {e}", tmp_path.display())))?;
    Ok(())
}

//! Core data model shared by every component.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Opaque 12-hex-character identifier. Never empty, never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemoryId(pub String);

impl MemoryId {
    /// Generate a fresh id, retrying on the (astronomically unlikely)
    /// collision with an id already present in `seen`.
    pub fn generate(seen: &HashSet<String>) -> Self {
        loop {
            let candidate: String = Uuid::new_v4().simple().to_string()[..12].to_string();
            if !seen.contains(&candidate) {
                return MemoryId(candidate);
            }
        }
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tier of a long-term memory entry: fact, reflection, or summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryTier {
    Fact,
    Reflection,
    Summary,
}

impl MemoryTier {
    pub fn as_str(self) -> &'static str {
        match self {
            MemoryTier::Fact => "fact",
            MemoryTier::Reflection => "reflection",
            MemoryTier::Summary => "summary",
        }
    }
}

impl FromStr for MemoryTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fact" => Ok(MemoryTier::Fact),
            "reflection" => Ok(MemoryTier::Reflection),
            "summary" => Ok(MemoryTier::Summary),
            other => Err(format!("unknown memory tier: {other}")),
        }
    }
}

/// A single durable, embedding-indexed memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: MemoryId,
    pub user_id: String,
    pub content: String,
    pub memory_type: MemoryTier,
    pub importance: u8,
    pub timestamp: f64,
    pub access_count: u64,
    pub last_accessed: f64,
    pub embedding: Vec<f32>,
    pub metadata: HashMap<String, Value>,
}

impl MemoryEntry {
    pub fn clamp_importance(value: i64) -> u8 {
        value.clamp(1, 10) as u8
    }
}

/// Insertion-ordered set of strings: set semantics, but iteration order
/// always matches insertion order. Backed by a `Vec` + `HashSet` pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderedStringSet {
    order: Vec<String>,
    #[serde(skip)]
    seen: HashSet<String>,
}

impl OrderedStringSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `value` was newly inserted.
    pub fn insert(&mut self, value: impl Into<String>) -> bool {
        let value = value.into();
        if self.seen.contains(&value) {
            return false;
        }
        self.seen.insert(value.clone());
        self.order.push(value);
        true
    }

    pub fn remove(&mut self, value: &str) -> bool {
        if !self.seen.remove(value) {
            return false;
        }
        self.order.retain(|v| v != value);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.order.iter()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

// `seen` is rebuilt from `order` after deserialization since it is skipped
// on the wire — callers go through `UserProfile::rehydrate` after loading
// from disk (see profile_store.rs).
impl OrderedStringSet {
    pub fn rehydrate(&mut self) {
        self.seen = self.order.iter().cloned().collect();
    }
}

/// Per-user structured record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    pub user_id: String,
    pub platform: String,
    pub name: String,
    pub nickname: String,
    pub traits: OrderedStringSet,
    pub preferences: HashMap<String, String>,
    pub relationships: HashMap<String, String>,
    /// Ordered, deduplicated by exact string equality.
    pub facts: Vec<String>,
    pub last_interaction: f64,
    pub interaction_count: u64,
    pub extra: HashMap<String, Value>,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            user_id: String::new(),
            platform: String::new(),
            name: String::new(),
            nickname: String::new(),
            traits: OrderedStringSet::new(),
            preferences: HashMap::new(),
            relationships: HashMap::new(),
            facts: Vec::new(),
            last_interaction: 0.0,
            interaction_count: 0,
            extra: HashMap::new(),
        }
    }
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn add_fact(&mut self, fact: String) -> bool {
        if self.facts.iter().any(|f| f == &fact) {
            return false;
        }
        self.facts.push(fact);
        true
    }

    pub fn rehydrate(&mut self) {
        self.traits.rehydrate();
    }
}

/// Explicit, exhaustively-handled profile mutation set — one variant per
/// field that can change, rather than a loosely-typed key/value update.
#[derive(Debug, Clone)]
pub enum ProfileUpdate {
    SetName(String),
    SetNickname(String),
    SetPlatform(String),
    AddTrait(String),
    RemoveTrait(String),
    AddFact(String),
    RemoveFact(String),
    SetPreference { key: String, value: String },
    SetRelationship { target: String, relation: String },
    Touch,
}

/// A single chat turn inside a `SessionMemory` chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMessage {
    pub role: String,
    pub content: String,
}

/// Per-session sliding window of message chunks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionMemory {
    pub title: String,
    pub description: String,
    pub memory: Vec<Vec<SessionMessage>>,
}

impl Default for SessionMemory {
    fn default() -> Self {
        Self {
            title: String::new(),
            description: String::new(),
            memory: Vec::new(),
        }
    }
}

/// `adapter:type:id` triple identifying a chat session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub adapter: String,
    pub kind: SessionKind,
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionKind {
    /// Private message.
    Pm,
    /// Group message.
    Gm,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Pm => write!(f, "pm"),
            SessionKind::Gm => write!(f, "gm"),
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.adapter, self.kind, self.id)
    }
}

impl FromStr for SessionId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, ':');
        let adapter = parts.next().filter(|s| !s.is_empty());
        let kind = parts.next();
        let id = parts.next().filter(|s| !s.is_empty());
        match (adapter, kind, id) {
            (Some(adapter), Some("pm"), Some(id)) => Ok(SessionId {
                adapter: adapter.to_string(),
                kind: SessionKind::Pm,
                id: id.to_string(),
            }),
            (Some(adapter), Some("gm"), Some(id)) => Ok(SessionId {
                adapter: adapter.to_string(),
                kind: SessionKind::Gm,
                id: id.to_string(),
            }),
            _ => Err(format!("invalid session id: {s}")),
        }
    }
}

impl SessionId {
    /// The `user_id` scope a session resolves to: private chats are
    /// `{adapter}:{id}`, group chats are `{adapter}:group:{id}`.
    pub fn user_id(&self) -> String {
        match self.kind {
            SessionKind::Pm => format!("{}:{}", self.adapter, self.id),
            SessionKind::Gm => format!("{}:group:{}", self.adapter, self.id),
        }
    }
}

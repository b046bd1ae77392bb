//! End-to-end scenarios and boundary behaviors.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use palimpsest_config::{ForgetterConfig, HippocampusConfig, VectorStoreMode};
use palimpsest_llm::{ChatCapability, ChatReply, ChatTurn, EmbeddingCapability};
use palimpsest_memory::forgetter::Forgetter;
use palimpsest_memory::hippocampus::Hippocampus;
use palimpsest_memory::profile_store::ProfileStore;
use palimpsest_memory::scheduler::{InlineScheduler, Scheduler};
use palimpsest_memory::schema::{MemoryEntry, MemoryId, MemoryTier, SessionMessage};
use palimpsest_memory::vector_store::{now_seconds, SearchQuery, VectorStore};

struct ScriptedChat {
    replies: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedChat {
    fn new(replies: Vec<&str>) -> Self {
        Self { replies: Mutex::new(replies.into_iter().map(String::from).collect()), calls: AtomicUsize::new(0) }
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatCapability for ScriptedChat {
    async fn chat(&self, _messages: &[ChatTurn]) -> anyhow::Result<ChatReply> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut replies = self.replies.lock().unwrap();
        let text = if replies.is_empty() { String::new() } else { replies.remove(0) };
        Ok(ChatReply { text, ..Default::default() })
    }
}

/// Deterministic stand-in embedder: identical text yields an identical
/// vector, distinct text yields a distinct vector far away in cosine
/// space, so dedup-by-near-neighbour behaves predictably in tests.
struct KeyedEmbedder;

#[async_trait]
impl EmbeddingCapability for KeyedEmbedder {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let key = if t.to_lowercase().contains("kyoto") { 1.0 } else { 0.0 };
                vec![key, 1.0 - key]
            })
            .collect())
    }
}

fn fact_entry(id: &str, user_id: &str, content: &str, importance: u8, age_days: f64, access_count: u64) -> MemoryEntry {
    let now = now_seconds();
    MemoryEntry {
        id: MemoryId(id.to_string()),
        user_id: user_id.to_string(),
        content: content.to_string(),
        memory_type: MemoryTier::Fact,
        importance,
        timestamp: now - age_days * 86_400.0,
        access_count,
        last_accessed: now - age_days * 86_400.0,
        embedding: Vec::new(),
        metadata: Default::default(),
    }
}

fn msg(content: &str) -> Vec<SessionMessage> {
    vec![SessionMessage { role: "user".to_string(), content: content.to_string() }]
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_1_fact_survives_dedup() {
    let dir = tempfile::tempdir().unwrap();
    let vector_store = Arc::new(VectorStore::open(dir.path().join("vec"), VectorStoreMode::DefaultBacked).unwrap());
    let profile_store = Arc::new(ProfileStore::open(dir.path().join("profiles.json")).unwrap());

    vector_store
        .add_memory(fact_entry("seed00000001", "u1", "The user lives in Kyoto", 6, 0.0, 0), Some(vec![1.0, 0.0]))
        .unwrap();

    let chat = Arc::new(ScriptedChat::new(vec![
        r#"[{"fact": "User lives in Kyoto", "importance": 7}]"#,
        "DUPLICATE",
        "[]",
    ]));
    let scheduler: Arc<dyn Scheduler> = Arc::new(InlineScheduler);
    let hippocampus = Hippocampus::new(
        HippocampusConfig { threshold: 1, reflection_min_facts: 99, ..Default::default() },
        vector_store.clone(),
        profile_store,
        chat,
        Arc::new(KeyedEmbedder),
        scheduler,
    );

    hippocampus.buffer_for_hippocampus("s1", "u1", vec![msg("Btw, I live in Kyoto.")]);

    let all = vector_store.get_by_user("u1", Some(MemoryTier::Fact), 10);
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].content, "The user lives in Kyoto");
    assert_eq!(all[0].importance, 6);
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_2_fact_merges_on_update() {
    let dir = tempfile::tempdir().unwrap();
    let vector_store = Arc::new(VectorStore::open(dir.path().join("vec"), VectorStoreMode::DefaultBacked).unwrap());
    let profile_store = Arc::new(ProfileStore::open(dir.path().join("profiles.json")).unwrap());

    vector_store
        .add_memory(fact_entry("seed00000002", "u1", "The user lives in Kyoto", 6, 0.0, 0), Some(vec![1.0, 0.0]))
        .unwrap();

    let chat = Arc::new(ScriptedChat::new(vec![
        r#"[{"fact": "User lives in Kyoto", "importance": 7}]"#,
        "UPDATE: User lives in central Kyoto",
        "[]",
    ]));
    let scheduler: Arc<dyn Scheduler> = Arc::new(InlineScheduler);
    let hippocampus = Hippocampus::new(
        HippocampusConfig { threshold: 1, reflection_min_facts: 99, ..Default::default() },
        vector_store.clone(),
        profile_store,
        chat,
        Arc::new(KeyedEmbedder),
        scheduler,
    );

    hippocampus.buffer_for_hippocampus("s1", "u1", vec![msg("I actually live in central Kyoto.")]);

    let all = vector_store.get_by_user("u1", Some(MemoryTier::Fact), 10);
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].content, "User lives in central Kyoto");
    assert_eq!(all[0].importance, 7);
    assert_eq!(all[0].id.0, "seed00000002");
}

/// One-hot-ish embedder keyed off the trailing digit in each fact string,
/// so distinct facts land orthogonal to one another (cosine distance 1.0)
/// and never collide as near-duplicates.
struct OneHotEmbedder;

#[async_trait]
impl EmbeddingCapability for OneHotEmbedder {
    async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                let bucket = t.chars().rev().find(|c| c.is_ascii_digit()).and_then(|c| c.to_digit(10)).unwrap_or(9) as usize;
                let mut vector = vec![0.0; 10];
                vector[bucket] = 1.0;
                vector
            })
            .collect())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn scenario_3_reflection_gated_by_count() {
    let dir = tempfile::tempdir().unwrap();
    let vector_store = Arc::new(VectorStore::open(dir.path().join("vec"), VectorStoreMode::DefaultBacked).unwrap());
    let profile_store = Arc::new(ProfileStore::open(dir.path().join("profiles.json")).unwrap());

    for i in 0..4 {
        vector_store
            .add_memory(fact_entry(&format!("existing{i:05}"), "u1", &format!("fact {i}"), 3, 0.0, 0), Some(vec![i as f32; 10]))
            .unwrap();
    }

    let chat = Arc::new(ScriptedChat::new(vec![
        r#"[{"fact": "fact 5", "importance": 3}]"#,
        r#"["the user shares a lot of small facts"]"#,
    ]));
    let scheduler: Arc<dyn Scheduler> = Arc::new(InlineScheduler);
    let hippocampus = Hippocampus::new(
        HippocampusConfig { threshold: 1, ..Default::default() },
        vector_store.clone(),
        profile_store,
        chat.clone(),
        Arc::new(OneHotEmbedder),
        scheduler,
    );

    hippocampus.buffer_for_hippocampus("s1", "u1", vec![msg("here is fact 5")]);

    assert_eq!(chat.call_count(), 2, "exactly one extraction call and one reflection call");
    let reflections = vector_store.get_by_user("u1", Some(MemoryTier::Reflection), 10);
    assert_eq!(reflections.len(), 1);
}

#[test]
fn scenario_4_forgetting_drops_low_value_keeps_high_value() {
    let dir = tempfile::tempdir().unwrap();
    let vector_store = Arc::new(VectorStore::open(dir.path(), VectorStoreMode::DefaultBacked).unwrap());
    vector_store.add_memory(fact_entry("lowvalue0001", "u1", "forgettable", 1, 400.0, 0), Some(vec![1.0])).unwrap();
    vector_store.add_memory(fact_entry("highvalue001", "u1", "memorable", 8, 400.0, 20), Some(vec![1.0])).unwrap();

    let chat: Arc<dyn ChatCapability> = Arc::new(ScriptedChat::new(vec![]));
    let embedder: Arc<dyn EmbeddingCapability> = Arc::new(KeyedEmbedder);
    let forgetter = Forgetter::new(ForgetterConfig::default(), vector_store.clone(), chat, embedder);

    let report = forgetter.run_forgetting_cycle();

    assert_eq!(report.deleted, 1);
    assert!(vector_store.get_memory_by_id(&MemoryId("lowvalue0001".to_string())).is_none());
    assert!(vector_store.get_memory_by_id(&MemoryId("highvalue001".to_string())).is_some());
}

#[tokio::test]
async fn scenario_5_summary_swap() {
    let dir = tempfile::tempdir().unwrap();
    let vector_store = Arc::new(VectorStore::open(dir.path(), VectorStoreMode::DefaultBacked).unwrap());
    for i in 0..6 {
        vector_store
            .add_memory(fact_entry(&format!("old{i:09}"), "u1", &format!("old fact {i}"), 5, 45.0, 0), Some(vec![0.0, 1.0]))
            .unwrap();
    }

    let chat: Arc<dyn ChatCapability> = Arc::new(ScriptedChat::new(vec!["summary line one\nsummary line two"]));
    let embedder: Arc<dyn EmbeddingCapability> = Arc::new(KeyedEmbedder);
    let forgetter = Forgetter::new(ForgetterConfig::default(), vector_store.clone(), chat, embedder);

    let mut report = palimpsest_memory::forgetter::ForgettingReport::default();
    forgetter.summarize_old_memories(&mut report).await;

    assert_eq!(report.summaries_created, 2);
    assert_eq!(report.summarized_originals_removed, 6);

    let remaining_facts = vector_store.get_by_user("u1", Some(MemoryTier::Fact), 20);
    assert!(remaining_facts.is_empty());
    let summaries = vector_store.get_by_user("u1", Some(MemoryTier::Summary), 20);
    assert_eq!(summaries.len(), 2);
}

#[test]
fn scenario_6_core_line_removal_shifts_vector_map() {
    use palimpsest_memory::tools::CoreVectorMap;

    let mut map = CoreVectorMap::default();
    map.insert(0, "VA".to_string());
    map.insert(1, "VB".to_string());
    map.insert(2, "VC".to_string());

    map.shift_after_removal(1);

    assert_eq!(map.get(0), Some(&"VA".to_string()));
    assert_eq!(map.get(1), Some(&"VC".to_string()));
    assert_eq!(map.get(2), None);
}

#[test]
fn boundary_recall_k_zero_is_coerced_to_at_least_one() {
    let dir = tempfile::tempdir().unwrap();
    let vector_store = VectorStore::open(dir.path(), VectorStoreMode::ExternalOnly).unwrap();
    vector_store.add_memory(fact_entry("boundarykzero", "u1", "hello", 5, 0.0, 0), Some(vec![1.0, 0.0])).unwrap();

    let results = vector_store.search(SearchQuery {
        query_embedding: Some(vec![1.0, 0.0]),
        k: 0,
        update_access: false,
        ..Default::default()
    });
    assert_eq!(results.len(), 1);
}

#[test]
fn boundary_empty_index_search_returns_empty() {
    let dir = tempfile::tempdir().unwrap();
    let vector_store = VectorStore::open(dir.path(), VectorStoreMode::ExternalOnly).unwrap();
    let results = vector_store.search(SearchQuery {
        query_embedding: Some(vec![1.0, 0.0]),
        k: 5,
        update_access: false,
        ..Default::default()
    });
    assert!(results.is_empty());
}

#[test]
fn boundary_get_all_memories_covers_every_unique_id_once() {
    let dir = tempfile::tempdir().unwrap();
    let vector_store = VectorStore::open(dir.path(), VectorStoreMode::ExternalOnly).unwrap();
    for i in 0..25 {
        vector_store
            .add_memory(fact_entry(&format!("pageid{i:06}"), "u1", "x", 5, 0.0, 0), Some(vec![i as f32]))
            .unwrap();
    }

    let mut seen = std::collections::HashSet::new();
    let mut offset = 0;
    loop {
        let page = vector_store.get_all_memories(7, offset);
        if page.is_empty() {
            break;
        }
        let page_len = page.len();
        for entry in page {
            assert!(seen.insert(entry.id.0));
        }
        offset += page_len;
        if page_len < 7 {
            break;
        }
    }
    assert_eq!(seen.len(), 25);
}

#[test]
fn boundary_text_only_search_against_external_only_index_never_raises() {
    let dir = tempfile::tempdir().unwrap();
    let vector_store = VectorStore::open(dir.path(), VectorStoreMode::ExternalOnly).unwrap();
    vector_store.add_memory(fact_entry("textonlyidxx", "u1", "hello there", 5, 0.0, 0), Some(vec![1.0])).unwrap();

    let results = vector_store.search(SearchQuery {
        query_text: Some("hello".to_string()),
        k: 5,
        update_access: false,
        ..Default::default()
    });
    assert!(results.is_empty());
}

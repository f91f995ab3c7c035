use chrono::Utc;
use constellation_common::TranscriptEntry;
use constellation_db::{
    ContextHydrator, HydrateOptions, MemoryStore, MemoryType, SHARED_OWNER,
};

fn entry(speaker: &str, content: &str) -> TranscriptEntry {
    TranscriptEntry {
        timestamp: Utc::now(),
        speaker: speaker.to_string(),
        content: content.to_string(),
        slot: None,
    }
}

fn participants() -> Vec<String> {
    vec!["Claude".to_string(), "Grok".to_string()]
}

#[test]
fn rearchiving_replaces_previous_messages() {
    let store = MemoryStore::in_memory().unwrap();
    store
        .archive_conversation(
            "relay_1",
            &[
                entry("Grok", "first draft about volcanoes"),
                entry("Claude", "more volcanoes"),
                entry("Grok", "even more volcanoes"),
            ],
            &participants(),
            Some("Volcanoes"),
        )
        .unwrap();
    store
        .archive_conversation(
            "relay_1",
            &[entry("Grok", "glaciers now"), entry("Claude", "glaciers indeed")],
            &participants(),
            Some("Glaciers"),
        )
        .unwrap();

    let messages = store.get_archived_messages("relay_1").unwrap();
    let indexes: Vec<i64> = messages.iter().map(|m| m.message_index).collect();
    assert_eq!(indexes, vec![0, 1]);
    assert_eq!(messages[0].content, "glaciers now");

    assert!(store.search_archive("volcanoes", 10).unwrap().is_empty());
    let hits = store.search_archive("glaciers", 10).unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|h| h.title.as_deref() == Some("Glaciers")));
    assert!(hits.iter().all(|h| h.rank.is_some()));

    let conversation = store.get_archived_conversation("relay_1").unwrap().unwrap();
    assert_eq!(conversation.message_count, 2);
    assert_eq!(conversation.word_count, 4);
    assert!(conversation.full_transcript.contains("Grok:\nglaciers now"));
    assert_eq!(store.list_archived_conversations(10).unwrap().len(), 1);
}

#[test]
fn archive_search_ignores_query_syntax() {
    let store = MemoryStore::in_memory().unwrap();
    store
        .archive_conversation(
            "relay_2",
            &[entry("Grok", "NOT a problem: quotes \"inside\" text")],
            &participants(),
            None,
        )
        .unwrap();

    let hits = store.search_archive("NOT \"inside", 5).unwrap();
    assert_eq!(hits.len(), 1);
}

#[test]
fn storing_a_document_twice_versions_it() {
    let store = MemoryStore::in_memory().unwrap();
    store
        .store_context_document("Plan", "version one", SHARED_OWNER, Some("plan"))
        .unwrap();
    store
        .store_context_document("Plan", "version two", SHARED_OWNER, Some("plan"))
        .unwrap();

    let history = store.document_history("plan").unwrap();
    let versions: Vec<(i64, bool)> = history.iter().map(|d| (d.version, d.is_active)).collect();
    assert_eq!(versions, vec![(1, false), (2, true)]);

    let active = store.get_active_documents(None).unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].content, "version two");

    let found = store.search_documents("version", 10).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].version, 2);
}

#[test]
fn agents_see_shared_then_their_own_documents() {
    let store = MemoryStore::in_memory().unwrap();
    store
        .store_context_document("Claude only", "private to Claude", "claude", None)
        .unwrap();
    store
        .store_context_document("Everyone", "shared notes", SHARED_OWNER, None)
        .unwrap();
    store
        .store_context_document("Grok only", "private to Grok", "Grok", None)
        .unwrap();

    let titles: Vec<String> = store
        .documents_for_agent("Claude")
        .unwrap()
        .into_iter()
        .map(|d| d.title)
        .collect();
    assert_eq!(titles, vec!["Everyone", "Claude only"]);
}

#[test]
fn digest_drops_short_leading_paragraph() {
    let store = MemoryStore::in_memory().unwrap();
    let content = format!("{}\n\n{}", "A".repeat(40), "B".repeat(600));
    let row = store
        .store_context_document("Letters", &content, "Claude", Some("letters"))
        .unwrap();
    assert!(row > 0);

    let created = store.digest_document_to_memories("letters", 500).unwrap();
    assert_eq!(created, 1);

    let memories = store.recall_recent(10, Some("Claude"), Some(MemoryType::Semantic)).unwrap();
    assert_eq!(memories.len(), 1);
    assert_eq!(memories[0].content, "B".repeat(600));
    assert_eq!(memories[0].importance, 0.85);
}

#[test]
fn digest_of_short_and_long_paragraph_yields_one_memory() {
    let store = MemoryStore::in_memory().unwrap();
    let long = "This is a sufficiently long paragraph that exceeds fifty characters easily.";
    store
        .store_context_document("Note", &format!("short\n\n{long}"), "Grok", Some("note"))
        .unwrap();

    assert_eq!(store.digest_document_to_memories("note", 500).unwrap(), 1);
    let memories = store.recall_recent(10, Some("Grok"), None).unwrap();
    assert_eq!(memories.len(), 1);
    assert!(memories[0].content.contains(long));
}

#[test]
fn extraction_then_hydration_surfaces_agent_memories() {
    let store = MemoryStore::in_memory().unwrap();
    store
        .extract_and_store(
            "relay_3",
            &[
                entry("Grok", "Remember: the launch window opens Friday"),
                entry("Claude", "I'm excited about the launch"),
            ],
            &participants(),
        )
        .unwrap();

    let text = ContextHydrator::new(&store, HydrateOptions::default()).hydrate("Claude", None);
    assert!(text.starts_with("=== Relevant Memories ==="));
    assert!(text.contains("Grok (episodic)⭐: Remember: the launch window opens Friday"));
    assert!(text.contains("Claude (episodic): I'm excited about the launch"));
}

#[test]
fn file_backed_store_persists_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("memory.db");

    {
        let store = MemoryStore::open(&path).unwrap();
        store
            .store_context_document("Diary", "kept on disk", SHARED_OWNER, Some("diary"))
            .unwrap();
    }

    let reopened = MemoryStore::lazy(&path);
    let doc = reopened.active_document("diary").unwrap().unwrap();
    assert_eq!(doc.content, "kept on disk");
    assert!(reopened.fts_enabled());
}

//! End-to-end tests wiring the store, knowledge index, dictionary, and
//! translation guard together the way an application would.

mod support;

use std::sync::Arc;
use std::time::Duration;

use support::{BagOfLetters, EchoGenerator};
use termbridge::config::{KnowledgeConfig, TermsConfig, TranslationConfig};
use termbridge::knowledge::{KnowledgeIndex, NO_ANSWER_REPLY};
use termbridge::{QualityIssue, TermDictionary, TranslationGuard, VectorStore};

struct World {
    _dir: tempfile::TempDir,
    store: Arc<VectorStore>,
    knowledge: KnowledgeIndex,
    dictionary: Arc<TermDictionary>,
}

impl World {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(VectorStore::open(dir.path().join("vectors.json")).unwrap());
        let embedder = Arc::new(BagOfLetters);

        let knowledge = KnowledgeIndex::open(
            Arc::clone(&store),
            embedder.clone(),
            KnowledgeConfig {
                items_path: dir.path().join("knowledge/items.json"),
                ..Default::default()
            },
        )
        .unwrap();

        let dictionary = Arc::new(
            TermDictionary::open(
                Arc::clone(&store),
                embedder,
                TermsConfig {
                    path: dir.path().join("terms.json"),
                    ..Default::default()
                },
            )
            .unwrap(),
        );

        Self {
            _dir: dir,
            store,
            knowledge,
            dictionary,
        }
    }

    fn guard(&self, generator: Arc<EchoGenerator>) -> TranslationGuard {
        TranslationGuard::new(
            Arc::clone(&self.dictionary),
            generator,
            TranslationConfig {
                timeout_secs: 5,
                retry_backoff_secs: 0,
            },
        )
    }
}

#[tokio::test]
async fn knowledge_and_terms_share_one_store_without_collisions() {
    let world = World::new();

    world
        .knowledge
        .import_text("the quick brown fox jumps over the lazy dog", "doc")
        .await
        .unwrap();
    world
        .dictionary
        .add_term("结晶", vec!["crystal".into()], "zh", "en")
        .await
        .unwrap();

    // Knowledge search must never surface dictionary records.
    let hits = world.knowledge.search("quick brown fox", 10).await.unwrap();
    assert!(hits.iter().all(|h| !h.item.content.contains("结晶")));

    // Fuzzy term search must never surface knowledge passages.
    let terms = world.dictionary.search_fuzzy("crystal", 10).await.unwrap();
    assert!(terms.iter().all(|t| t.source_term == "结晶"));
}

#[tokio::test]
async fn full_state_survives_flush_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let store_path = dir.path().join("vectors.json");
    let embedder = Arc::new(BagOfLetters);

    {
        let store = Arc::new(VectorStore::open(&store_path).unwrap());
        let knowledge = KnowledgeIndex::open(
            Arc::clone(&store),
            embedder.clone(),
            KnowledgeConfig {
                items_path: dir.path().join("items.json"),
                ..Default::default()
            },
        )
        .unwrap();
        knowledge
            .import_text("alpha beta gamma delta", "doc")
            .await
            .unwrap();
        store.flush().unwrap();
    }

    let store = Arc::new(VectorStore::open(&store_path).unwrap());
    let knowledge = KnowledgeIndex::open(
        Arc::clone(&store),
        embedder,
        KnowledgeConfig {
            items_path: dir.path().join("items.json"),
            ..Default::default()
        },
    )
    .unwrap();

    let hits = knowledge.search("alpha beta gamma delta", 5).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].score > 0.9);
}

#[tokio::test]
async fn translation_round_trip_preserves_terms() {
    let world = World::new();
    world
        .dictionary
        .add_term("引晶", vec!["Neck".into()], "zh", "en")
        .await
        .unwrap();
    world
        .dictionary
        .add_term("等径", vec!["Body".into()], "zh", "en")
        .await
        .unwrap();

    let guard = world.guard(Arc::new(EchoGenerator::verbatim()));
    let result = guard
        .translate("引晶和等径是工艺步骤", Some("zh"), "en")
        .await
        .unwrap();

    assert_eq!(result.text, "Neck和Body是工艺步骤");
    assert_eq!(result.matched_terms.len(), 2);
    assert!(result.quality_issues.is_empty());
}

#[tokio::test]
async fn reverse_translation_uses_derived_direction() {
    let world = World::new();
    world
        .dictionary
        .add_term("引晶", vec!["Neck".into(), "Crystal neck".into()], "zh", "en")
        .await
        .unwrap();

    let guard = world.guard(Arc::new(EchoGenerator::verbatim()));
    let result = guard
        .translate("The Neck stage begins.", Some("en"), "zh")
        .await
        .unwrap();

    assert!(result.text.contains("引晶"));
    assert!(result.quality_issues.is_empty());
}

#[tokio::test]
async fn unrepairable_drift_is_reported_not_hidden() {
    let world = World::new();
    world
        .dictionary
        .add_term("引晶", vec!["Neck".into()], "zh", "en")
        .await
        .unwrap();

    // This generator always drops placeholders entirely.
    let generator = Arc::new(EchoGenerator::transforming(|text| {
        text.replace("[T1]", "").trim().to_string()
    }));
    let guard = world.guard(Arc::clone(&generator));

    let result = guard.translate("引晶步骤", Some("zh"), "en").await.unwrap();
    assert_eq!(generator.calls(), 2, "one translation, one repair");
    assert!(result
        .quality_issues
        .iter()
        .any(|i| matches!(i, QualityIssue::MissingTerm { .. })));
}

#[tokio::test]
async fn question_answering_stays_inside_the_index() {
    let world = World::new();
    world
        .knowledge
        .import_text(
            "Question: what is the neck stage?\nAnswer: the first stage of crystal growth.",
            "guide",
        )
        .await
        .unwrap();

    let generator = EchoGenerator::verbatim();
    let answer = world
        .knowledge
        .answer_question(
            "what is the neck stage?",
            &generator,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    // The echo generator returns the prompt tail; what matters here is
    // that a context was found and generation ran.
    assert_eq!(generator.calls(), 1);
    assert!(!answer.is_empty());

    let no_context = world
        .knowledge
        .answer_question("zzzzqqq xxyy", &generator, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(no_context, NO_ANSWER_REPLY);
}

#[tokio::test]
async fn store_dirty_flag_tracks_flush() {
    let world = World::new();
    world
        .dictionary
        .add_term("结晶", vec!["crystal".into()], "zh", "en")
        .await
        .unwrap();
    assert!(world.store.is_dirty());
    world.store.flush().unwrap();
    assert!(!world.store.is_dirty());
}

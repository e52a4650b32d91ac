//! Integration tests for the in-memory storage backend.

use std::sync::Arc;

use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use serde_json::json;

use unified_thinking_storage::storage::{
    Branch, CrossRef, CrossRefType, Insight, InsightType, MemoryStorage, Relationship, Storage,
    ThinkingMode, Thought, Validation, MAX_RECENT_BRANCHES, MAX_SEARCH_RESULTS,
};
use unified_thinking_storage::StorageError;

/// Store `contents` oldest first, one second apart, returning their IDs.
async fn store_sequence(
    storage: &MemoryStorage,
    contents: &[&str],
    mode: ThinkingMode,
) -> Vec<String> {
    let base = Utc::now() - Duration::hours(1);
    let mut ids = Vec::new();
    for (i, content) in contents.iter().enumerate() {
        let thought =
            Thought::new(*content, mode).with_timestamp(base + Duration::seconds(i as i64));
        ids.push(storage.store_thought(thought).await.unwrap());
    }
    ids
}

fn contents(thoughts: &[Thought]) -> Vec<&str> {
    thoughts.iter().map(|t| t.content.as_str()).collect()
}

// ============================================================================
// Thought tests
// ============================================================================

mod thought_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_store_assigns_id_and_get_returns_copy() {
        let storage = MemoryStorage::new();
        let id = storage
            .store_thought(
                Thought::new("original", ThinkingMode::Linear).with_key_points(["one"]),
            )
            .await
            .unwrap();
        assert!(id.starts_with("thought-"));

        let mut copy = storage.get_thought(&id).await.unwrap();
        copy.content = "mutated".to_string();
        copy.key_points.push("two".to_string());
        copy.metadata.insert("k".to_string(), json!(1));

        let fresh = storage.get_thought(&id).await.unwrap();
        assert_eq!(fresh.content, "original");
        assert_eq!(fresh.key_points, vec!["one"]);
        assert!(fresh.metadata.is_empty());
    }

    #[tokio::test]
    async fn test_get_missing_thought_names_id() {
        let storage = MemoryStorage::new();
        let err = storage.get_thought("nope").await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "thought not found: nope");
    }

    #[tokio::test]
    async fn test_explicit_id_is_kept_and_restore_replaces() {
        let storage = MemoryStorage::new();
        storage
            .store_thought(Thought::new("v1", ThinkingMode::Linear).with_id("fixed"))
            .await
            .unwrap();
        let id = storage
            .store_thought(Thought::new("v2", ThinkingMode::Linear).with_id("fixed"))
            .await
            .unwrap();

        assert_eq!(id, "fixed");
        assert_eq!(storage.get_thought("fixed").await.unwrap().content, "v2");
        assert_eq!(storage.get_metrics().await.unwrap().total_thoughts, 1);
        assert_eq!(
            storage.search_thoughts("", None, 10, 0).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_generated_ids_are_unique() {
        let storage = MemoryStorage::new();
        let mut ids = std::collections::HashSet::new();
        for i in 0..200 {
            let id = storage
                .store_thought(Thought::new(format!("t{i}"), ThinkingMode::Auto))
                .await
                .unwrap();
            assert!(ids.insert(id));
        }
    }
}

// ============================================================================
// Search tests
// ============================================================================

mod search_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_cats_and_dogs_scenario() {
        let storage = MemoryStorage::new();
        store_sequence(
            &storage,
            &["cats are great", "dogs and cats", "only dogs"],
            ThinkingMode::Linear,
        )
        .await;

        let results = storage
            .search_thoughts("cats", Some(ThinkingMode::Linear), 10, 0)
            .await
            .unwrap();
        assert_eq!(contents(&results), vec!["dogs and cats", "cats are great"]);
    }

    #[tokio::test]
    async fn test_query_words_are_unioned() {
        let storage = MemoryStorage::new();
        store_sequence(
            &storage,
            &["alpha only", "beta only", "gamma only", "alpha and beta"],
            ThinkingMode::Tree,
        )
        .await;

        let results = storage
            .search_thoughts("alpha beta", None, 10, 0)
            .await
            .unwrap();
        assert_eq!(
            contents(&results),
            vec!["alpha and beta", "beta only", "alpha only"]
        );
    }

    #[tokio::test]
    async fn test_search_is_case_and_punctuation_insensitive() {
        let storage = MemoryStorage::new();
        store_sequence(&storage, &["Rust, ownership!"], ThinkingMode::Linear).await;

        let results = storage
            .search_thoughts("OWNERSHIP?", None, 10, 0)
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn test_mode_filter_applies_to_query_and_alone() {
        let storage = MemoryStorage::new();
        store_sequence(&storage, &["shared word linear"], ThinkingMode::Linear).await;
        store_sequence(&storage, &["shared word tree"], ThinkingMode::Tree).await;

        let tree_hits = storage
            .search_thoughts("shared", Some(ThinkingMode::Tree), 10, 0)
            .await
            .unwrap();
        assert_eq!(contents(&tree_hits), vec!["shared word tree"]);

        let linear_only = storage
            .search_thoughts("", Some(ThinkingMode::Linear), 10, 0)
            .await
            .unwrap();
        assert_eq!(contents(&linear_only), vec!["shared word linear"]);

        let divergent = storage
            .search_thoughts("", Some(ThinkingMode::Divergent), 10, 0)
            .await
            .unwrap();
        assert!(divergent.is_empty());
    }

    #[tokio::test]
    async fn test_punctuation_only_query_means_no_filter() {
        let storage = MemoryStorage::new();
        store_sequence(&storage, &["one", "two", "three"], ThinkingMode::Auto).await;

        let results = storage.search_thoughts("?!...", None, 10, 0).await.unwrap();
        assert_eq!(contents(&results), vec!["three", "two", "one"]);
    }

    #[tokio::test]
    async fn test_unknown_word_returns_empty() {
        let storage = MemoryStorage::new();
        store_sequence(&storage, &["known words"], ThinkingMode::Auto).await;
        assert!(storage
            .search_thoughts("unknown", None, 10, 0)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_pagination_partitions_results() {
        let storage = MemoryStorage::new();
        let texts: Vec<String> = (0..25).map(|i| format!("entry number{i}")).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        store_sequence(&storage, &refs, ThinkingMode::Linear).await;

        let full = storage.search_thoughts("entry", None, 100, 0).await.unwrap();
        assert_eq!(full.len(), 25);

        let mut paged = Vec::new();
        for offset in [0, 10, 20] {
            let page = storage
                .search_thoughts("entry", None, 10, offset)
                .await
                .unwrap();
            assert_eq!(
                page,
                storage
                    .search_thoughts("entry", None, 10, offset)
                    .await
                    .unwrap()
            );
            paged.extend(page);
        }
        assert_eq!(paged, full);

        assert!(storage
            .search_thoughts("entry", None, 10, 25)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_limit_is_clamped() {
        let storage = MemoryStorage::new();
        let texts: Vec<String> = (0..5).map(|i| format!("item {i}")).collect();
        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
        store_sequence(&storage, &refs, ThinkingMode::Linear).await;

        assert_eq!(storage.search_thoughts("", None, 0, 0).await.unwrap().len(), 5);
        assert_eq!(
            storage
                .search_thoughts("", None, MAX_SEARCH_RESULTS * 10, 0)
                .await
                .unwrap()
                .len(),
            5
        );
        assert_eq!(storage.search_thoughts("", None, 2, 0).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_out_of_order_timestamps_sorted_newest_first() {
        let storage = MemoryStorage::new();
        let base = Utc::now();
        for (content, offset) in [("middle", 5), ("oldest", 0), ("newest", 10)] {
            storage
                .store_thought(
                    Thought::new(content, ThinkingMode::Linear)
                        .with_timestamp(base + Duration::seconds(offset)),
                )
                .await
                .unwrap();
        }

        let results = storage.search_thoughts("", None, 10, 0).await.unwrap();
        assert_eq!(contents(&results), vec!["newest", "middle", "oldest"]);
    }
}

// ============================================================================
// Branch tests
// ============================================================================

mod branch_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_no_active_branch_on_fresh_store() {
        let storage = MemoryStorage::new();
        let err = storage.get_active_branch().await.unwrap_err();
        assert!(matches!(err, StorageError::NoActiveBranch));
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_first_branch_becomes_active() {
        let storage = MemoryStorage::new();
        let first = storage.store_branch(Branch::new()).await.unwrap();
        let second = storage.store_branch(Branch::new()).await.unwrap();
        assert_ne!(first, second);

        let active = storage.get_active_branch().await.unwrap();
        assert_eq!(active.id, first);
        assert!(active.last_accessed_at.is_some());

        let recent = storage.get_recent_branches().await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].id, first);
    }

    #[tokio::test]
    async fn test_set_active_branch() {
        let storage = MemoryStorage::new();
        storage
            .store_branch(Branch::new().with_id("a"))
            .await
            .unwrap();
        storage
            .store_branch(Branch::new().with_id("b"))
            .await
            .unwrap();

        storage.set_active_branch("b").await.unwrap();
        assert_eq!(storage.get_active_branch().await.unwrap().id, "b");
        assert_eq!(storage.get_recent_branches().await.unwrap()[0].id, "b");
    }

    #[tokio::test]
    async fn test_set_active_missing_lists_available() {
        let storage = MemoryStorage::new();
        let err = storage.set_active_branch("ghost").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "branch not found: ghost (no branches exist yet)"
        );

        storage
            .store_branch(Branch::new().with_id("real"))
            .await
            .unwrap();
        let err = storage.set_active_branch("ghost").await.unwrap_err();
        match err {
            StorageError::BranchUnavailable {
                branch_id,
                available,
            } => {
                assert_eq!(branch_id, "ghost");
                assert_eq!(available, vec!["real"]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(storage.get_active_branch().await.unwrap().id, "real");
    }

    #[tokio::test]
    async fn test_list_branches_newest_created_first() {
        let storage = MemoryStorage::new();
        let base = Utc::now();
        for (id, offset) in [("b", 1), ("c", 2), ("a", 0)] {
            storage
                .store_branch(
                    Branch::new()
                        .with_id(id)
                        .with_created_at(base + Duration::seconds(offset)),
                )
                .await
                .unwrap();
        }

        let ids: Vec<String> = storage
            .list_branches()
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
    }

    #[tokio::test]
    async fn test_recent_branches_bounded_and_ordered() {
        let storage = MemoryStorage::new();
        let mut ids = Vec::new();
        for i in 0..15 {
            ids.push(
                storage
                    .store_branch(Branch::new().with_id(format!("branch-{i}")))
                    .await
                    .unwrap(),
            );
        }
        for id in &ids {
            storage.update_branch_access(id).await.unwrap();
        }

        let recent = storage.get_recent_branches().await.unwrap();
        assert_eq!(recent.len(), MAX_RECENT_BRANCHES);
        assert_eq!(recent[0].id, "branch-14");
        assert_eq!(recent[9].id, "branch-5");

        // Re-accessing an older entry moves it to the front without duplicates.
        storage.update_branch_access("branch-7").await.unwrap();
        let recent = storage.get_recent_branches().await.unwrap();
        assert_eq!(recent.len(), MAX_RECENT_BRANCHES);
        assert_eq!(recent[0].id, "branch-7");
        assert_eq!(recent.iter().filter(|b| b.id == "branch-7").count(), 1);
    }

    #[tokio::test]
    async fn test_update_access_missing_branch() {
        let storage = MemoryStorage::new();
        let err = storage.update_branch_access("missing").await.unwrap_err();
        assert_eq!(err.to_string(), "branch not found: missing");
    }

    #[tokio::test]
    async fn test_appends_store_copies() {
        let storage = MemoryStorage::new();
        let branch_id = storage.store_branch(Branch::new()).await.unwrap();
        let before = storage.get_branch(&branch_id).await.unwrap().updated_at;

        let mut thought = Thought::new("appended", ThinkingMode::Tree).with_key_points(["k"]);
        storage
            .append_thought_to_branch(&branch_id, &thought)
            .await
            .unwrap();
        thought.key_points.push("changed after append".to_string());

        let insight = Insight::new(InsightType::Observation, "noticed");
        storage
            .append_insight_to_branch(&branch_id, &insight)
            .await
            .unwrap();

        let xref = CrossRef::new(&branch_id, "other", CrossRefType::BuildsUpon)
            .with_touch_point("t1", "t2", "extends");
        storage
            .append_cross_ref_to_branch(&branch_id, &xref)
            .await
            .unwrap();

        let branch = storage.get_branch(&branch_id).await.unwrap();
        assert_eq!(branch.thoughts.len(), 1);
        assert_eq!(branch.thoughts[0].key_points, vec!["k"]);
        assert!(!branch.thoughts[0].id.is_empty());
        assert_eq!(branch.insights[0].content, "noticed");
        assert_eq!(branch.cross_refs[0].touch_points[0].connection, "extends");
        assert!(!branch.cross_refs[0].id.is_empty());
        assert!(branch.updated_at >= before);
    }

    #[tokio::test]
    async fn test_appends_to_missing_branch_fail() {
        let storage = MemoryStorage::new();
        let thought = Thought::new("x", ThinkingMode::Linear);
        let insight = Insight::new(InsightType::Connection, "x");
        let xref = CrossRef::new("a", "b", CrossRefType::Complementary);

        for err in [
            storage
                .append_thought_to_branch("missing", &thought)
                .await
                .unwrap_err(),
            storage
                .append_insight_to_branch("missing", &insight)
                .await
                .unwrap_err(),
            storage
                .append_cross_ref_to_branch("missing", &xref)
                .await
                .unwrap_err(),
        ] {
            assert!(err.is_not_found());
            assert!(err.to_string().contains("missing"));
        }
    }

    #[tokio::test]
    async fn test_returned_branch_is_isolated() {
        let storage = MemoryStorage::new();
        let branch_id = storage.store_branch(Branch::new()).await.unwrap();
        storage
            .append_thought_to_branch(&branch_id, &Thought::new("kept", ThinkingMode::Tree))
            .await
            .unwrap();

        let mut copy = storage.get_branch(&branch_id).await.unwrap();
        copy.thoughts.clear();
        copy.priority = -1.0;

        let fresh = storage.get_branch(&branch_id).await.unwrap();
        assert_eq!(fresh.thoughts.len(), 1);
        assert_eq!(fresh.priority, 1.0);
    }

    #[tokio::test]
    async fn test_update_priority_and_confidence() {
        let storage = MemoryStorage::new();
        let branch_id = storage.store_branch(Branch::new()).await.unwrap();

        storage.update_branch_priority(&branch_id, 7.5).await.unwrap();
        storage
            .update_branch_confidence(&branch_id, 0.25)
            .await
            .unwrap();

        let branch = storage.get_branch(&branch_id).await.unwrap();
        assert_eq!(branch.priority, 7.5);
        assert_eq!(branch.confidence, 0.25);

        assert!(storage
            .update_branch_priority("missing", 1.0)
            .await
            .unwrap_err()
            .is_not_found());
        assert!(storage
            .update_branch_confidence("missing", 1.0)
            .await
            .unwrap_err()
            .is_not_found());
    }
}

// ============================================================================
// Insight / validation / relationship / metrics tests
// ============================================================================

mod other_entity_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_insight_validation_relationship_round_trip() {
        let storage = MemoryStorage::new();

        let insight_id = storage
            .store_insight(Insight::new(InsightType::BehavioralPattern, "pattern"))
            .await
            .unwrap();
        let validation_id = storage
            .store_validation(Validation::new(true, "holds").for_insight(&insight_id))
            .await
            .unwrap();
        let rel_id = storage
            .store_relationship(Relationship::new("s1", "s2", "derives"))
            .await
            .unwrap();

        assert_eq!(
            storage.get_insight(&insight_id).await.unwrap().content,
            "pattern"
        );
        assert_eq!(
            storage
                .get_validation(&validation_id)
                .await
                .unwrap()
                .insight_id
                .as_deref(),
            Some(insight_id.as_str())
        );
        assert_eq!(
            storage.get_relationship(&rel_id).await.unwrap().rel_type,
            "derives"
        );

        assert!(storage.get_insight("missing").await.unwrap_err().is_not_found());
        assert!(storage
            .get_validation("missing")
            .await
            .unwrap_err()
            .is_not_found());
        assert!(storage
            .get_relationship("missing")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_metrics_snapshot() {
        let storage = MemoryStorage::new();
        for (content, mode, confidence) in [
            ("a", ThinkingMode::Linear, 0.2),
            ("b", ThinkingMode::Linear, 0.4),
            ("c", ThinkingMode::Tree, 0.9),
        ] {
            storage
                .store_thought(Thought::new(content, mode).with_confidence(confidence))
                .await
                .unwrap();
        }
        storage.store_branch(Branch::new()).await.unwrap();
        storage
            .store_insight(Insight::new(InsightType::Observation, "i"))
            .await
            .unwrap();

        let metrics = storage.get_metrics().await.unwrap();
        assert_eq!(metrics.total_thoughts, 3);
        assert_eq!(metrics.total_branches, 1);
        assert_eq!(metrics.total_insights, 1);
        assert_eq!(metrics.total_validations, 0);
        assert_eq!(metrics.thoughts_by_mode.get("linear"), Some(&2));
        assert_eq!(metrics.thoughts_by_mode.get("tree"), Some(&1));
        assert!((metrics.average_confidence - 0.5).abs() < 1e-9);
    }
}

// ============================================================================
// Concurrency tests
// ============================================================================

mod concurrency_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_and_readers() {
        let storage = Arc::new(MemoryStorage::new());
        let mut handles = Vec::new();

        for worker in 0..8 {
            let storage = Arc::clone(&storage);
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    let id = storage
                        .store_thought(Thought::new(
                            format!("shared worker{worker} item{i}"),
                            ThinkingMode::Linear,
                        ))
                        .await
                        .unwrap();
                    storage.get_thought(&id).await.unwrap();
                    storage
                        .search_thoughts("shared", None, 5, 0)
                        .await
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(storage.get_metrics().await.unwrap().total_thoughts, 400);
        let all = storage
            .search_thoughts("shared", None, 1000, 0)
            .await
            .unwrap();
        assert_eq!(all.len(), 400);
        assert!(all.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_active_branch_always_resolves_under_concurrency() {
        let storage = Arc::new(MemoryStorage::new());
        let mut handles = Vec::new();

        for worker in 0..4 {
            let storage = Arc::clone(&storage);
            handles.push(tokio::spawn(async move {
                for i in 0..25 {
                    let id = storage
                        .store_branch(Branch::new().with_id(format!("w{worker}-b{i}")))
                        .await
                        .unwrap();
                    storage.update_branch_access(&id).await.unwrap();
                    if i % 5 == 0 {
                        storage.set_active_branch(&id).await.unwrap();
                    }
                    match storage.get_active_branch().await {
                        Ok(_) => {}
                        Err(StorageError::DataInconsistency { message }) => {
                            panic!("active branch dangling: {message}")
                        }
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(storage.list_branches().await.unwrap().len(), 100);
        assert_eq!(
            storage.get_recent_branches().await.unwrap().len(),
            MAX_RECENT_BRANCHES
        );
    }
}

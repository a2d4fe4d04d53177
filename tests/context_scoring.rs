//! Context repository end-to-end: scoring, hot-index bounds, and the
//! schema gate that keeps malformed maps off disk.

use forgeflow::Core;
use forgeflow::context::hot::HOT_INDEX_CAPACITY;
use forgeflow::context::score::{ScoreHint, ScoreInput, score_map};
use forgeflow::core::cancel::CancelToken;
use forgeflow::core::config::CoreConfig;
use forgeflow::core::error::ErrorKind;
use forgeflow::core::run::RunState;
use serde_json::json;
use std::time::Duration;

fn open_core(root: &std::path::Path) -> Core {
    let config = CoreConfig {
        root: root.to_path_buf(),
        lock_poll_ms: 10,
        ..CoreConfig::default()
    };
    Core::open(config).unwrap()
}

/// Run `f` inside a started run, so map writes hold the lock legitimately.
fn with_run(core: &Core, f: impl FnOnce(&str)) {
    let run = core
        .runs()
        .start(json!({}), Duration::from_secs(1), &CancelToken::new())
        .unwrap();
    f(&run.id);
    core.runs().finish(&run.id, RunState::Succeeded).unwrap();
}

#[test]
fn test_worked_scoring_example_seven_day_old_map() {
    let now = chrono::Utc::now();
    let input = ScoreInput {
        id: "m".to_string(),
        tags: vec!["auth".to_string(), "security".to_string()],
        updated_at: Some(
            (now - chrono::Duration::days(7))
                .to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        ),
        created_at: None,
        playbook_required: true,
    };
    let hint = ScoreHint {
        tags: vec!["auth".to_string()],
    };
    let score = score_map(&input, &hint, now);

    assert!((score.freshness - 0.922).abs() < 1e-3);
    assert!((score.tags_match - 1.0).abs() < 1e-9);
    assert!((score.semantic - 0.5).abs() < 1e-9);
    assert!((score.base - 0.769).abs() < 1e-3);
    assert!((score.total - 0.919).abs() < 1e-3);
}

#[test]
fn test_top_maps_prefers_playbook_and_tag_matches() {
    let tmp = tempfile::tempdir().unwrap();
    let core = open_core(tmp.path());
    with_run(&core, |run_id| {
        let maps = core.maps();
        maps.upsert(
            "auth-playbook",
            json!({"status": "active", "tags": ["auth"], "playbook_required": true}),
            run_id,
        )
        .unwrap();
        maps.upsert("auth-notes", json!({"status": "active", "tags": ["auth"]}), run_id)
            .unwrap();
        maps.upsert("billing-notes", json!({"status": "active", "tags": ["billing"]}), run_id)
            .unwrap();
    });

    let top = core
        .maps()
        .top_maps(
            &ScoreHint {
                tags: vec!["auth".to_string()],
            },
            3,
        )
        .unwrap();
    let ids: Vec<&str> = top.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids[0], "auth-playbook");
    assert_eq!(ids[1], "auth-notes");
    assert_eq!(ids[2], "billing-notes");
    assert!(top.iter().all(|m| (0.0..=1.0).contains(&m.score.total)));
}

#[test]
fn test_hot_index_never_exceeds_fifty_entries() {
    let tmp = tempfile::tempdir().unwrap();
    let core = open_core(tmp.path());
    with_run(&core, |run_id| {
        for i in 0..60 {
            core.maps()
                .upsert(&format!("map-{:02}", i), json!({"status": "draft"}), run_id)
                .unwrap();
        }
    });
    let hot = forgeflow::context::hot::HotIndex::new(core.store())
        .read()
        .unwrap();
    assert!(hot.entries.len() <= HOT_INDEX_CAPACITY);
    assert_eq!(hot.entries.len(), HOT_INDEX_CAPACITY);
}

#[test]
fn test_schema_gate_keeps_invalid_maps_off_disk() {
    let tmp = tempfile::tempdir().unwrap();
    let core = open_core(tmp.path());
    with_run(&core, |run_id| {
        let maps = core.maps();
        // Bad status enum value.
        let err = maps
            .upsert("bad-status", json!({"status": "limbo"}), run_id)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaInvalid);
        // Bad tag type.
        let err = maps
            .upsert("bad-tags", json!({"tags": [7]}), run_id)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaInvalid);
        // A valid one for contrast.
        maps.upsert("good-map", json!({"status": "active"}), run_id)
            .unwrap();
    });

    // Every file in maps/ satisfies the schema; the rejected ones never
    // landed.
    assert!(!core.store().map_path("bad-status").exists());
    assert!(!core.store().map_path("bad-tags").exists());
    let listed = core
        .maps()
        .list(&forgeflow::context::repo::ListFilter::default())
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, "good-map");
}

#[test]
fn test_reads_are_lock_free_and_heat_the_index() {
    let tmp = tempfile::tempdir().unwrap();
    let core = open_core(tmp.path());
    with_run(&core, |run_id| {
        core.maps()
            .upsert("auth-flow", json!({"status": "active"}), run_id)
            .unwrap();
    });

    // No lock held now; reads still work and accumulate heat.
    for _ in 0..4 {
        core.maps().read("auth-flow").unwrap();
    }
    let hot = forgeflow::context::hot::HotIndex::new(core.store())
        .read()
        .unwrap();
    let entry = hot
        .entries
        .iter()
        .find(|e| e.map_id == "auth-flow")
        .unwrap();
    assert_eq!(entry.access_count, 5);
}

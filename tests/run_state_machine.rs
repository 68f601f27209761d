//! Run manifest state machine legality and full-workflow scenarios.

mod common;

use bindery::core::error::BinderyError;
use bindery::core::guard::GuardConfig;
use bindery::core::lifecycle::PollConfig;
use bindery::core::manifest::{read_manifest, NotebookStrategy, RunManifest};
use bindery::core::run::{execute_run, RunRequest};
use bindery::core::state_machine::{can_transition, transition, RunState};
use bindery::core::store::MetaStore;
use bindery::core::time::SystemClock;
use common::{ok, ManualClock, ScriptedRunner};
use serde_json::json;
use std::path::{Path, PathBuf};

const ALL_STATES: [RunState; 8] = [
    RunState::Started,
    RunState::Fetched,
    RunState::Prepared,
    RunState::AwaitingChapterSelection,
    RunState::Generating,
    RunState::Partial,
    RunState::Completed,
    RunState::Failed,
];

fn allowed(current: RunState) -> &'static [RunState] {
    use RunState::*;
    match current {
        Started => &[Fetched, Prepared, Failed],
        Fetched => &[Prepared, Failed],
        Prepared => &[AwaitingChapterSelection, Generating, Completed, Failed],
        AwaitingChapterSelection => &[Generating, Failed],
        Generating => &[Completed, Partial, Failed],
        Partial => &[Generating, Completed, Failed],
        Completed | Failed => &[],
    }
}

#[test]
fn transition_table_is_enforced_for_every_pair() {
    let clock = SystemClock;
    for current in ALL_STATES {
        for target in ALL_STATES {
            let mut manifest = RunManifest::new("bindery-table", "/tmp/ws", vec![], &clock);
            manifest.status = current;
            let legal = allowed(current).contains(&target) || current == target;
            let result = transition(&mut manifest, target, &clock);
            assert_eq!(
                result.is_ok(),
                legal,
                "transition {current} -> {target} legality mismatch"
            );
            if legal {
                let expected = if current == target { current } else { target };
                assert_eq!(manifest.status, expected);
            } else {
                assert_eq!(manifest.status, current, "illegal transition must not clobber");
                assert!(matches!(
                    result,
                    Err(BinderyError::IllegalTransition { .. })
                ));
            }
            assert_eq!(can_transition(current, target), allowed(current).contains(&target));
        }
    }
}

struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        // The adapters only check that the script files exist; the scripted
        // runner intercepts the actual invocations.
        std::fs::create_dir_all(dir.path().join("scripts")).unwrap();
        std::fs::write(dir.path().join("scripts/chapter_menu.py"), "# stub").unwrap();
        std::fs::write(dir.path().join("scripts/telegram_fetch.py"), "# stub").unwrap();
        Workspace { dir }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn ranked_path(&self) -> PathBuf {
        self.root().join("ranked.json")
    }

    fn write_ranked(&self) {
        std::fs::write(
            self.ranked_path(),
            json!({
                "selected_chapters": [
                    {"chapter_id": "1", "title": "The Storm", "text": "text one", "char_count": 9000},
                    {"chapter_id": "2", "title": "The Calm", "text": "text two", "char_count": 4500}
                ]
            })
            .to_string(),
        )
        .unwrap();
    }

    fn request(&self, chapter_ids: &str, plan: &str) -> RunRequest {
        RunRequest {
            run_id: "bindery-e2e".to_string(),
            book_title: "The Book".to_string(),
            epub: String::new(),
            ranked_json: self.ranked_path().to_string_lossy().to_string(),
            object_notebook_id: String::new(),
            run_notebook_id: "nb-run".to_string(),
            notebook_strategy: NotebookStrategy::Run,
            chapter_ids: chapter_ids.to_string(),
            plan: bindery::core::parse::parse_plan(plan),
            profile: "default".to_string(),
            workspace_root: self.root().to_path_buf(),
            defaults: serde_json::Map::new(),
            tg_bot: String::new(),
            tg_session_file: String::new(),
            tg_output_root: String::new(),
            prepare: Default::default(),
            poll: PollConfig {
                poll_seconds: 1,
                max_polls: 5,
            },
            guard: GuardConfig::default(),
            chars_per_chapter: 6000,
            max_chapters: 0,
            infographic_out_dir: String::new(),
            auto_refresh_auth: true,
        }
    }

    fn manifest_path(&self) -> PathBuf {
        self.root()
            .join("tmp/book-to-artifact/bindery-e2e/run_manifest_v2.json")
    }

    fn store(&self) -> MetaStore {
        MetaStore::open(&self.root().join("bindery.db")).unwrap()
    }
}

fn prepare_rule(runner: &ScriptedRunner, ranked: &Path) {
    let payload = json!({
        "status": "ok",
        "ranked_json": ranked.to_string_lossy(),
        "menu": [
            {"chapter_id": "1", "title": "The Storm", "score": 0.9, "char_count": 9000},
            {"chapter_id": "2", "title": "The Calm", "score": 0.7, "char_count": 4500}
        ]
    });
    runner.on("chapter_menu.py", ok(&payload.to_string()));
}

#[test]
fn empty_chapter_ids_pause_for_selection() {
    let ws = Workspace::new();
    ws.write_ranked();
    let runner = ScriptedRunner::new();
    prepare_rule(&runner, &ws.ranked_path());

    let clock = ManualClock::at("2026-08-07T09:00:00+00:00");
    let store = ws.store();
    let request = ws.request("", "infographic,slides");
    let manifest = execute_run(&request, &store, &runner, &clock).unwrap();

    assert_eq!(manifest["status"], "awaiting_chapter_selection");
    assert!(!manifest["next_action"].as_str().unwrap().is_empty());
    assert!(manifest["stages"]["chapter_selection_guide"]["presets"].is_array());
    // Generation never starts while paused.
    assert_eq!(runner.call_count("create"), 0);

    let on_disk = read_manifest(&ws.manifest_path()).unwrap();
    assert_eq!(on_disk.status, RunState::AwaitingChapterSelection);

    let rows = store.list_runs(10, &[]).unwrap();
    assert_eq!(rows[0]["status"], "awaiting_chapter_selection");
}

#[test]
fn full_run_completes_and_caches_source_mappings() {
    let ws = Workspace::new();
    ws.write_ranked();
    let runner = ScriptedRunner::new();
    prepare_rule(&runner, &ws.ranked_path());
    runner.on("--version", ok("nlm 1.2.3"));
    runner.on("login --check", ok("authorized"));
    runner.on(
        "source list",
        ok(&json!({
            "sources": [
                {"id": "src-1", "title": "ch1 The Storm"},
                {"id": "src-2", "title": "ch2 The Calm"}
            ]
        })
        .to_string()),
    );
    runner.on(
        "slides create",
        ok(&json!({"artifact_id": "123e4567-e89b-12d3-a456-426614174000"}).to_string()),
    );
    runner.on(
        "studio status",
        ok(&json!({
            "artifacts": [{"id": "123e4567-e89b-12d3-a456-426614174000", "status": "completed"}]
        })
        .to_string()),
    );

    let clock = ManualClock::at("2026-08-07T09:00:00+00:00");
    let store = ws.store();
    let request = ws.request("1,2", "slides");
    let manifest = execute_run(&request, &store, &runner, &clock).unwrap();

    assert_eq!(manifest["status"], "completed");
    assert_eq!(manifest["source_map"]["1"], "src-1");
    assert_eq!(manifest["source_map"]["2"], "src-2");
    assert_eq!(manifest["selected_source_ids"], json!(["src-1", "src-2"]));
    assert_eq!(manifest["stages"]["non_infographic"]["status"], "ok");
    assert_eq!(manifest["artifacts"][0]["artifact_type"], "slides");
    assert_eq!(manifest["artifacts"][0]["status"], "completed");

    // The chapter->source mappings are cached for future runs on the same
    // asset + notebook pair.
    let asset_id = {
        let rows = store.list_runs(10, &[]).unwrap();
        assert_eq!(rows[0]["status"], "completed");
        bindery::core::run::resolve_asset_identity(
            "The Book",
            "",
            &ws.ranked_path().to_string_lossy(),
        )
        .unwrap()
        .asset_id
    };
    let cached = store
        .cached_source_map(&asset_id, "nb-run", &["1".to_string(), "2".to_string()])
        .unwrap();
    assert_eq!(cached["1"], "src-1");
    assert_eq!(cached["2"], "src-2");
}

#[test]
fn cached_mappings_skip_live_lookup_on_rerun() {
    let ws = Workspace::new();
    ws.write_ranked();
    let runner = ScriptedRunner::new();
    prepare_rule(&runner, &ws.ranked_path());
    runner.on("--version", ok("nlm 1.2.3"));
    runner.on("login --check", ok("authorized"));
    runner.on(
        "source list",
        ok(&json!({
            "sources": [
                {"id": "src-1", "title": "ch1 The Storm"},
                {"id": "src-2", "title": "ch2 The Calm"}
            ]
        })
        .to_string()),
    );
    runner.on(
        "slides create",
        ok(&json!({"artifact_id": "123e4567-e89b-12d3-a456-426614174000"}).to_string()),
    );
    runner.on(
        "studio status",
        ok(&json!({
            "artifacts": [{"id": "123e4567-e89b-12d3-a456-426614174000", "status": "completed"}]
        })
        .to_string()),
    );

    let clock = ManualClock::at("2026-08-07T09:00:00+00:00");
    let store = ws.store();
    let first = execute_run(&ws.request("1,2", "slides"), &store, &runner, &clock).unwrap();
    assert_eq!(first["status"], "completed");
    let lookups_after_first = runner.call_count("source list");

    // Chapter->source resolution must come from the cache this time, with
    // no further live listings.
    let mut request = ws.request("1,2", "slides");
    request.run_id = "bindery-e2e-2".to_string();
    let second = execute_run(&request, &store, &runner, &clock).unwrap();
    assert_eq!(second["status"], "completed");
    assert_eq!(
        second["stages"]["source_resolution"]["cached_hits"],
        json!(["1", "2"])
    );
    assert_eq!(
        second["stages"]["source_resolution"]["live_lookup_chapter_ids"],
        json!([])
    );
    assert_eq!(runner.call_count("source list"), lookups_after_first);
}

#[test]
fn failed_fetch_ends_the_run_as_failed() {
    let ws = Workspace::new();
    let runner = ScriptedRunner::new();
    runner.on(
        "telegram_fetch.py",
        ok(&json!({"status": "not_found", "detail": "no results"}).to_string()),
    );

    let clock = ManualClock::at("2026-08-07T09:00:00+00:00");
    let store = ws.store();
    let mut request = ws.request("1", "slides");
    request.ranked_json = String::new();
    request.tg_bot = "@SomeBot".to_string();
    let manifest = execute_run(&request, &store, &runner, &clock).unwrap();

    assert_eq!(manifest["status"], "failed");
    assert!(manifest["errors"][0]
        .as_str()
        .unwrap()
        .contains("telegram fetch"));
    assert_eq!(manifest["stages"]["fetch"]["status"], "not_found");
}

#[test]
fn zero_resolved_sources_fail_without_infographic_stage() {
    let ws = Workspace::new();
    ws.write_ranked();
    let runner = ScriptedRunner::new();
    prepare_rule(&runner, &ws.ranked_path());
    runner.on("--version", ok("nlm 1.2.3"));
    runner.on("login --check", ok("authorized"));
    // No chNN markers: nothing resolvable for the selected chapters.
    runner.on(
        "source list",
        ok(&json!({"sources": [{"id": "src-x", "title": "untitled"}]}).to_string()),
    );

    let clock = ManualClock::at("2026-08-07T09:00:00+00:00");
    let store = ws.store();
    let manifest = execute_run(&ws.request("1,2", "slides"), &store, &runner, &clock).unwrap();

    assert_eq!(manifest["status"], "failed");
    assert_eq!(
        manifest["stages"]["source_resolution"]["missing_chapter_ids"],
        json!(["1", "2"])
    );
    assert_eq!(runner.call_count("slides create"), 0);
}

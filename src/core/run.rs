//! End-to-end run orchestration: fetch -> prepare -> chapter selection ->
//! notebook resolution -> generation -> finalize, with the manifest
//! persisted after every stage and the metadata store kept in sync.

use crate::adapters::chapter_menu::{ChapterMenuAdapter, PrepareOptions};
use crate::adapters::telegram::TelegramFetchAdapter;
use crate::core::config;
use crate::core::error::BinderyError;
use crate::core::exec::CliRunner;
use crate::core::generate::{self, GenerateRequest};
use crate::core::guard::GuardConfig;
use crate::core::infographic::{self, InfographicRequest};
use crate::core::lifecycle::PollConfig;
use crate::core::manifest::{
    append_event, record_stage, write_manifest, ArtifactRecord, ChapterMenuItem, NotebookStrategy,
    RunManifest, EVENTS_FILENAME, MANIFEST_FILENAME,
};
use crate::core::nlm::{NlmClient, NlmConfig};
use crate::core::parse;
use crate::core::state_machine::{self, final_generation_state, transition, RunState};
use crate::core::store::{AssetIdentity, MetaStore};
use crate::core::time::{self, Clock};
use regex::Regex;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: String,
    pub book_title: String,
    pub epub: String,
    pub ranked_json: String,
    pub object_notebook_id: String,
    pub run_notebook_id: String,
    pub notebook_strategy: NotebookStrategy,
    /// Raw comma-separated chapter ids; empty means "pause for selection".
    pub chapter_ids: String,
    pub plan: Vec<String>,
    pub profile: String,
    pub workspace_root: PathBuf,
    pub defaults: Map<String, Value>,
    pub tg_bot: String,
    pub tg_session_file: String,
    pub tg_output_root: String,
    pub prepare: PrepareOptions,
    pub poll: PollConfig,
    pub guard: GuardConfig,
    pub chars_per_chapter: usize,
    pub max_chapters: usize,
    pub infographic_out_dir: String,
    pub auto_refresh_auth: bool,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn sha256_file(path: &Path) -> Result<String, BinderyError> {
    use std::io::Read;
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Content-addressed asset identity: EPUB contents, then ranked-JSON
/// contents, then normalized title text. Missing files hash the path text
/// so the key stays stable.
pub fn resolve_asset_identity(
    book_title: &str,
    epub: &str,
    ranked_json: &str,
) -> Option<AssetIdentity> {
    let epub = epub.trim();
    if !epub.is_empty() {
        let path = config::expand_user(epub);
        let hash = if path.exists() {
            sha256_file(&path).ok()?
        } else {
            sha256_hex(path.to_string_lossy().as_bytes())
        };
        return Some(AssetIdentity {
            asset_id: hash.clone(),
            asset_hash: hash,
            asset_kind: "epub".to_string(),
            asset_ref: path.to_string_lossy().to_string(),
            book_title: book_title.trim().to_string(),
        });
    }

    let ranked = ranked_json.trim();
    if !ranked.is_empty() {
        let path = config::expand_user(ranked);
        let hash = if path.exists() {
            sha256_file(&path).ok()?
        } else {
            sha256_hex(path.to_string_lossy().as_bytes())
        };
        return Some(AssetIdentity {
            asset_id: hash.clone(),
            asset_hash: hash,
            asset_kind: "ranked_json".to_string(),
            asset_ref: path.to_string_lossy().to_string(),
            book_title: book_title.trim().to_string(),
        });
    }

    let title = book_title.trim();
    if !title.is_empty() {
        let normalized = title
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let hash = sha256_hex(normalized.as_bytes());
        return Some(AssetIdentity {
            asset_id: hash.clone(),
            asset_hash: hash,
            asset_kind: "title".to_string(),
            asset_ref: title.to_string(),
            book_title: title.to_string(),
        });
    }

    None
}

// Front/back-matter markers that make poor artifact chapters.
const META_TITLE_PATTERNS: &[&str] = &[
    "contents",
    "preface",
    "foreword",
    "afterword",
    "appendix",
    "bibliography",
    "acknowledg",
    "about the author",
    "目录",
    "目次",
    "前言",
    "后记",
    "附录",
    "参考书目",
    "出版说明",
];

fn is_meta_title(title: &str) -> bool {
    let t = title.trim().to_lowercase();
    if t.is_empty() {
        return false;
    }
    META_TITLE_PATTERNS.iter().any(|pat| t.contains(pat))
}

/// Strip long ALL-CAPS transliteration tails and collapse whitespace.
fn humanize_title(title: &str) -> String {
    let t = title.trim();
    if t.is_empty() {
        return String::new();
    }
    let caps_tail = Regex::new(r"\s+[A-Z][A-Z0-9\s\-—]{10,}$").expect("valid regex");
    let t = caps_tail.replace(t, "").trim().to_string();
    let spaces = Regex::new(r"\s{2,}").expect("valid regex");
    spaces.replace_all(&t, " ").to_string()
}

fn estimate_read_minutes(char_count: i64) -> i64 {
    ((char_count.max(0) as f64 / 450.0).round() as i64).max(3)
}

fn ordered_ids(ids: &[String]) -> Vec<String> {
    let mut sorted = ids.to_vec();
    sorted.sort_by_key(|v| {
        let s = v.trim().to_string();
        match s.parse::<u64>() {
            Ok(n) => (0, n, String::new()),
            Err(_) => (1, 0, s),
        }
    });
    sorted
}

/// Human-facing chapter pick helper recorded when a run pauses for
/// selection: per-chapter stats plus quick/standard/deep presets.
pub fn build_chapter_selection_guide(menu: &[ChapterMenuItem]) -> Value {
    let options: Vec<Value> = menu
        .iter()
        .map(|item| {
            let char_count = item.char_count.unwrap_or(0);
            json!({
                "chapter_id": item.chapter_id,
                "title": humanize_title(&item.title),
                "score": item.score,
                "char_count": char_count,
                "est_read_minutes": estimate_read_minutes(char_count),
                "is_meta": is_meta_title(&item.title),
            })
        })
        .collect();

    let core: Vec<&Value> = options
        .iter()
        .filter(|o| o["is_meta"] == json!(false))
        .collect();
    let pool: Vec<&Value> = if core.is_empty() {
        options.iter().collect()
    } else {
        core
    };

    let pick = |n: usize| -> Vec<String> {
        pool.iter()
            .take(n)
            .filter_map(|o| o["chapter_id"].as_str())
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
            .collect()
    };

    let quick = pick(2);
    let standard = pick(3);
    let deep = pick(5);

    let presets = json!([
        {"name": "quick (2 chapters)", "chapter_ids": quick, "ordered_chapter_ids": ordered_ids(&quick)},
        {"name": "standard (3 chapters)", "chapter_ids": standard, "ordered_chapter_ids": ordered_ids(&standard)},
        {"name": "deep (5 chapters)", "chapter_ids": deep, "ordered_chapter_ids": ordered_ids(&deep)},
    ]);

    json!({
        "options": options,
        "presets": presets,
        "reply_hint": "Reply with chapter IDs, e.g. 11,10,9 (or ordered: 9,10,11)",
    })
}

fn safe_notebook_title(raw: &str, fallback: &str) -> String {
    let cleaned = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let cleaned = if cleaned.is_empty() {
        fallback.to_string()
    } else {
        cleaned
    };
    cleaned.chars().take(96).collect()
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedNotebooks {
    pub active_notebook_id: String,
    pub object_notebook_id: String,
    pub run_notebook_id: String,
}

/// Resolve notebook identity per strategy: object notebooks are created
/// once per asset and cached in the store, run notebooks are fresh per run.
pub fn resolve_notebooks_for_run(
    store: &MetaStore,
    client: &NlmClient,
    run_id: &str,
    strategy: NotebookStrategy,
    asset: Option<&AssetIdentity>,
    object_notebook_id: &str,
    run_notebook_id: &str,
) -> Result<ResolvedNotebooks, BinderyError> {
    let clock = client.clock();
    let mut object_id = object_notebook_id.trim().to_string();
    let mut run_nb_id = run_notebook_id.trim().to_string();

    if strategy.uses_object_notebook() {
        let asset = asset.ok_or_else(|| {
            BinderyError::AdapterError(
                "asset identity is required for object notebook strategy".to_string(),
            )
        })?;
        if object_id.is_empty() {
            object_id = store.get_object_notebook_id(&asset.asset_id)?.unwrap_or_default();
        }
        if object_id.is_empty() {
            let title = safe_notebook_title(
                &asset.book_title,
                &format!("bindery-object-{}", &asset.asset_id[..8.min(asset.asset_id.len())]),
            );
            object_id = client.create_notebook(&title)?;
        }
        store.upsert_object_notebook(&asset.asset_id, &object_id, &client.config.profile, clock)?;
    }

    if strategy.uses_run_notebook() {
        if run_nb_id.is_empty() {
            let title = safe_notebook_title(&format!("bindery-run-{run_id}"), "bindery-run");
            run_nb_id = client.create_notebook(&title)?;
        }
        store.upsert_run_notebook(run_id, &run_nb_id, &client.config.profile, clock)?;
    }

    let active = match strategy {
        NotebookStrategy::Object => object_id.clone(),
        NotebookStrategy::Run => run_nb_id.clone(),
        NotebookStrategy::Hybrid => {
            if run_nb_id.is_empty() {
                object_id.clone()
            } else {
                run_nb_id.clone()
            }
        }
    };
    if active.is_empty() {
        return Err(BinderyError::AdapterError(
            "unable to resolve active notebook id".to_string(),
        ));
    }

    Ok(ResolvedNotebooks {
        active_notebook_id: active,
        object_notebook_id: object_id,
        run_notebook_id: run_nb_id,
    })
}

#[derive(Debug, Clone, Default)]
pub struct SourceResolution {
    pub source_ids: Vec<String>,
    pub source_map: BTreeMap<String, String>,
    pub missing_chapter_ids: Vec<String>,
}

fn normalize_chapter_id(raw: &str) -> String {
    let token = raw.trim();
    if token.chars().all(|c| c.is_ascii_digit()) && !token.is_empty() {
        token
            .parse::<u64>()
            .map(|n| n.to_string())
            .unwrap_or_else(|_| token.to_string())
    } else {
        token.to_string()
    }
}

/// Live chapter->source resolution: list the notebook's sources and match
/// `chNN` markers in their titles.
pub fn resolve_source_ids(
    client: &NlmClient,
    notebook_id: &str,
    chapter_ids: &[String],
) -> Result<SourceResolution, BinderyError> {
    if notebook_id.trim().is_empty() {
        return Err(BinderyError::AdapterError("notebook_id is required".to_string()));
    }

    let chapter_re = Regex::new(r"(?i)\bch\s*0*(\d+)\b").expect("valid regex");
    let rows = client.source_rows(notebook_id)?;

    let mut source_map: BTreeMap<String, String> = BTreeMap::new();
    for row in &rows {
        let source_id = row
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default();
        if source_id.is_empty() {
            continue;
        }
        let title = row.get("title").and_then(Value::as_str).unwrap_or_default();
        let Some(caps) = chapter_re.captures(title) else {
            continue;
        };
        let chapter_id = normalize_chapter_id(&caps[1]);
        source_map
            .entry(chapter_id)
            .or_insert_with(|| source_id.to_string());
    }

    let mut picked = Vec::new();
    let mut missing = Vec::new();
    for chapter_id in chapter_ids {
        let chapter_id = normalize_chapter_id(chapter_id);
        match source_map.get(&chapter_id) {
            Some(source_id) => picked.push(source_id.clone()),
            None => missing.push(chapter_id),
        }
    }

    Ok(SourceResolution {
        source_ids: picked,
        source_map,
        missing_chapter_ids: missing,
    })
}

fn extract_infographic_artifacts(payload: &Value) -> Vec<ArtifactRecord> {
    payload
        .get("artifacts")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter_map(Value::as_object)
                .map(|row| {
                    let mut row = row.clone();
                    row.entry("artifact_type".to_string())
                        .or_insert_with(|| json!("infographic"));
                    ArtifactRecord::from_value(&Value::Object(row))
                })
                .collect()
        })
        .unwrap_or_default()
}

fn extract_non_infographic_artifacts(payload: &Value) -> Vec<ArtifactRecord> {
    payload
        .get("attempts")
        .and_then(Value::as_array)
        .map(|rows| {
            rows.iter()
                .filter(|row| row.is_object())
                .map(ArtifactRecord::from_value)
                .collect()
        })
        .unwrap_or_default()
}

struct RunCtx {
    manifest: RunManifest,
    manifest_path: PathBuf,
    events_path: PathBuf,
    run_dir: PathBuf,
    asset: Option<AssetIdentity>,
    epub: String,
    ranked_json: String,
}

fn sync_store_run(
    store: &MetaStore,
    ctx: &RunCtx,
    clock: &dyn Clock,
) -> Result<(), BinderyError> {
    if let Some(asset) = &ctx.asset {
        store.upsert_asset(asset, clock)?;
    }
    store.upsert_run(&ctx.manifest, ctx.asset.as_ref().map(|a| a.asset_id.as_str()))
}

fn manifest_json(manifest: &RunManifest) -> Value {
    serde_json::to_value(manifest).unwrap_or_else(|_| json!({}))
}

/// Execute one full run. Always returns the final manifest document;
/// logical failures are conveyed in its `status`, never as errors.
pub fn execute_run(
    request: &RunRequest,
    store: &MetaStore,
    runner: &dyn CliRunner,
    clock: &dyn Clock,
) -> Result<Value, BinderyError> {
    let run_id = if request.run_id.trim().is_empty() {
        time::new_run_id()
    } else {
        request.run_id.trim().to_string()
    };
    let run_dir = request
        .workspace_root
        .join("tmp")
        .join(config::RUN_TMP_DIRNAME)
        .join(&run_id);

    let mut manifest = RunManifest::new(
        &run_id,
        &request.workspace_root.to_string_lossy(),
        request.plan.clone(),
        clock,
    );
    manifest.book_title = request.book_title.trim().to_string();
    manifest.notebook_strategy = request.notebook_strategy;
    manifest.object_notebook_id = request.object_notebook_id.trim().to_string();
    manifest.run_notebook_id = request.run_notebook_id.trim().to_string();
    manifest.notebook_id = match request.notebook_strategy {
        NotebookStrategy::Object => manifest.object_notebook_id.clone(),
        _ => {
            if manifest.run_notebook_id.is_empty() {
                manifest.object_notebook_id.clone()
            } else {
                manifest.run_notebook_id.clone()
            }
        }
    };

    let mut ctx = RunCtx {
        manifest,
        manifest_path: run_dir.join(MANIFEST_FILENAME),
        events_path: run_dir.join(EVENTS_FILENAME),
        run_dir,
        asset: resolve_asset_identity(&request.book_title, &request.epub, &request.ranked_json),
        epub: request.epub.trim().to_string(),
        ranked_json: request.ranked_json.trim().to_string(),
    };

    write_manifest(&ctx.manifest_path, &mut ctx.manifest, clock)?;
    append_event(
        &ctx.events_path,
        clock,
        "run_started",
        &json!({
            "run_id": run_id,
            "plan": request.plan,
            "notebook_strategy": request.notebook_strategy.as_str(),
        }),
    )?;
    sync_store_run(store, &ctx, clock)?;

    let client = NlmClient::new(
        NlmConfig {
            profile: request.profile.clone(),
            auto_refresh_auth: request.auto_refresh_auth,
            ..NlmConfig::default()
        },
        runner,
        clock,
    );

    match run_inner(request, store, runner, clock, &client, &mut ctx) {
        Ok(value) => Ok(value),
        Err(err) => {
            ctx.manifest.push_error(err.to_string());
            if transition(&mut ctx.manifest, RunState::Failed, clock).is_err() {
                state_machine::force_failed(&mut ctx.manifest, clock);
            }
            let _ = write_manifest(&ctx.manifest_path, &mut ctx.manifest, clock);
            let _ = sync_store_run(store, &ctx, clock);
            let _ = append_event(
                &ctx.events_path,
                clock,
                "run_failed",
                &json!({"error": err.to_string()}),
            );
            Ok(manifest_json(&ctx.manifest))
        }
    }
}

fn run_inner(
    request: &RunRequest,
    store: &MetaStore,
    runner: &dyn CliRunner,
    clock: &dyn Clock,
    client: &NlmClient,
    ctx: &mut RunCtx,
) -> Result<Value, BinderyError> {
    let telegram_script = request
        .defaults
        .get("telegram_fetch_script")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let menu_script = request
        .defaults
        .get("chapter_menu_script")
        .and_then(Value::as_str)
        .unwrap_or_default();

    // Fetch stage: only when neither a ranked file nor an EPUB was supplied.
    if ctx.ranked_json.is_empty() && ctx.epub.is_empty() && !request.book_title.trim().is_empty() {
        let fetcher = TelegramFetchAdapter::new(&request.workspace_root, telegram_script)?;
        let session_file = {
            let resolved = config::str_choice(
                &request.tg_session_file,
                config::ENV_TELEGRAM_SESSION,
                &request.defaults,
                "tg_session_file",
            );
            if resolved.is_empty() {
                config::expand_user(config::DEFAULT_TELEGRAM_SESSION_PATH)
                    .to_string_lossy()
                    .to_string()
            } else {
                config::expand_user(&resolved).to_string_lossy().to_string()
            }
        };
        let fetch_payload = fetcher.fetch(
            runner,
            &request.book_title,
            &request.tg_bot,
            &session_file,
            &request.tg_output_root,
        )?;
        let fetch_value = Value::Object(fetch_payload.clone());
        record_stage(
            &mut ctx.manifest,
            &ctx.manifest_path,
            &ctx.events_path,
            clock,
            "fetch",
            &fetch_value,
        )?;
        sync_store_run(store, ctx, clock)?;

        if fetch_payload.get("status").and_then(Value::as_str) != Some("ok") {
            transition(&mut ctx.manifest, RunState::Failed, clock)?;
            ctx.manifest
                .push_error("telegram fetch stage returned non-ok status");
            write_manifest(&ctx.manifest_path, &mut ctx.manifest, clock)?;
            sync_store_run(store, ctx, clock)?;
            return Ok(manifest_json(&ctx.manifest));
        }

        transition(&mut ctx.manifest, RunState::Fetched, clock)?;
        ctx.epub = fetch_payload
            .get("downloaded_path")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        ctx.asset = resolve_asset_identity(&ctx.manifest.book_title, &ctx.epub, &ctx.ranked_json);
        write_manifest(&ctx.manifest_path, &mut ctx.manifest, clock)?;
        sync_store_run(store, ctx, clock)?;
    }

    if ctx.ranked_json.is_empty() && ctx.epub.is_empty() {
        return Err(BinderyError::ValidationError(
            "provide --ranked-json or --epub, or use --book-title to fetch".to_string(),
        ));
    }

    // Prepare stage: chapter extraction + ranking via the external script.
    let chapter_menu = ChapterMenuAdapter::new(&request.workspace_root, menu_script)?;
    let prepare_payload =
        chapter_menu.prepare(runner, &ctx.epub, &ctx.ranked_json, &request.prepare)?;
    let prepare_value = Value::Object(prepare_payload.clone());
    record_stage(
        &mut ctx.manifest,
        &ctx.manifest_path,
        &ctx.events_path,
        clock,
        "prepare",
        &prepare_value,
    )?;

    transition(&mut ctx.manifest, RunState::Prepared, clock)?;
    ctx.manifest.ranked_json = prepare_payload
        .get("ranked_json")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(&ctx.ranked_json)
        .to_string();
    ctx.manifest.menu = ChapterMenuItem::parse_menu(prepare_payload.get("menu"));
    ctx.asset = resolve_asset_identity(
        &ctx.manifest.book_title,
        &ctx.epub,
        &ctx.manifest.ranked_json.clone(),
    );
    write_manifest(&ctx.manifest_path, &mut ctx.manifest, clock)?;
    sync_store_run(store, ctx, clock)?;

    // Pause for chapter selection when none were supplied.
    if request.chapter_ids.trim().is_empty() {
        transition(&mut ctx.manifest, RunState::AwaitingChapterSelection, clock)?;
        ctx.manifest.selected_chapter_ids = Vec::new();
        let guide = build_chapter_selection_guide(&ctx.manifest.menu);
        ctx.manifest.next_action =
            "Provide --chapter-ids to continue artifact generation (example: 11,10,9).".to_string();
        record_stage(
            &mut ctx.manifest,
            &ctx.manifest_path,
            &ctx.events_path,
            clock,
            "chapter_selection_guide",
            &guide,
        )?;
        append_event(
            &ctx.events_path,
            clock,
            "awaiting_chapter_selection",
            &json!({
                "run_id": ctx.manifest.run_id,
                "ranked_json": ctx.manifest.ranked_json,
            }),
        )?;
        sync_store_run(store, ctx, clock)?;
        return Ok(manifest_json(&ctx.manifest));
    }

    let chapter_ids = parse::parse_csv_ids(&request.chapter_ids);
    ctx.manifest.selected_chapter_ids = chapter_ids.clone();
    write_manifest(&ctx.manifest_path, &mut ctx.manifest, clock)?;
    sync_store_run(store, ctx, clock)?;

    if chapter_ids.is_empty() {
        transition(&mut ctx.manifest, RunState::Failed, clock)?;
        ctx.manifest.push_error("no chapter IDs resolved");
        write_manifest(&ctx.manifest_path, &mut ctx.manifest, clock)?;
        sync_store_run(store, ctx, clock)?;
        return Ok(manifest_json(&ctx.manifest));
    }

    if request.plan.is_empty() {
        transition(&mut ctx.manifest, RunState::Completed, clock)?;
        write_manifest(&ctx.manifest_path, &mut ctx.manifest, clock)?;
        sync_store_run(store, ctx, clock)?;
        return Ok(manifest_json(&ctx.manifest));
    }

    // Notebook strategy resolution.
    let notebooks = resolve_notebooks_for_run(
        store,
        client,
        &ctx.manifest.run_id,
        request.notebook_strategy,
        ctx.asset.as_ref(),
        &ctx.manifest.object_notebook_id,
        &ctx.manifest.run_notebook_id,
    )?;
    ctx.manifest.notebook_id = notebooks.active_notebook_id.clone();
    ctx.manifest.object_notebook_id = notebooks.object_notebook_id.clone();
    ctx.manifest.run_notebook_id = notebooks.run_notebook_id.clone();
    let notebook_resolution_payload = json!({
        "strategy": request.notebook_strategy.as_str(),
        "active_notebook_id": ctx.manifest.notebook_id,
        "object_notebook_id": ctx.manifest.object_notebook_id,
        "run_notebook_id": ctx.manifest.run_notebook_id,
    });
    record_stage(
        &mut ctx.manifest,
        &ctx.manifest_path,
        &ctx.events_path,
        clock,
        "notebook_resolution",
        &notebook_resolution_payload,
    )?;
    sync_store_run(store, ctx, clock)?;

    transition(&mut ctx.manifest, RunState::Generating, clock)?;
    write_manifest(&ctx.manifest_path, &mut ctx.manifest, clock)?;
    sync_store_run(store, ctx, clock)?;

    let non_infographic_plan: Vec<String> = request
        .plan
        .iter()
        .filter(|item| item.as_str() != "infographic")
        .cloned()
        .collect();

    // Infographic stage: per-chapter create/poll/download loop.
    if request.plan.iter().any(|item| item == "infographic") {
        let out_dir = if request.infographic_out_dir.trim().is_empty() {
            request
                .workspace_root
                .join("tmp")
                .join(config::RUN_TMP_DIRNAME)
                .join("infographic-artifacts")
        } else {
            config::expand_user(request.infographic_out_dir.trim())
        };
        let inf_payload = infographic::run_infographic_generation(
            client,
            &InfographicRequest {
                notebook_id: ctx.manifest.notebook_id.clone(),
                ranked_json: config::expand_user(&ctx.manifest.ranked_json),
                chapter_ids: chapter_ids.clone(),
                source_map: ctx.manifest.source_map.clone(),
                chars_per_chapter: request.chars_per_chapter,
                max_chapters: request.max_chapters,
                out_dir,
                run_id: ctx.manifest.run_id.clone(),
            },
            &request.poll,
        )?;
        record_stage(
            &mut ctx.manifest,
            &ctx.manifest_path,
            &ctx.events_path,
            clock,
            "infographic",
            &inf_payload,
        )?;
        ctx.manifest
            .artifacts
            .extend(extract_infographic_artifacts(&inf_payload));
        write_manifest(&ctx.manifest_path, &mut ctx.manifest, clock)?;
        store.replace_artifacts(&ctx.manifest.run_id, &ctx.manifest.artifacts, clock)?;
        sync_store_run(store, ctx, clock)?;
    }

    if !non_infographic_plan.is_empty() {
        // Cache-first source resolution: only chapters missing from the
        // store trigger a live lookup; fresh entries win on collision.
        let cached_source_map = match &ctx.asset {
            Some(asset) => store.cached_source_map(
                &asset.asset_id,
                &ctx.manifest.notebook_id,
                &chapter_ids,
            )?,
            None => BTreeMap::new(),
        };

        let unresolved_chapter_ids: Vec<String> = chapter_ids
            .iter()
            .filter(|cid| {
                cached_source_map
                    .get(cid.as_str())
                    .map(|s| s.trim().is_empty())
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        let mut live_source_map: BTreeMap<String, String> = BTreeMap::new();
        if !unresolved_chapter_ids.is_empty() {
            let resolution = resolve_source_ids(
                client,
                &ctx.manifest.notebook_id,
                &unresolved_chapter_ids,
            )?;
            for chapter_id in &unresolved_chapter_ids {
                if let Some(source_id) = resolution.source_map.get(chapter_id.as_str()) {
                    if !source_id.trim().is_empty() {
                        live_source_map.insert(chapter_id.clone(), source_id.trim().to_string());
                    }
                }
            }
        }

        let mut effective_source_map = cached_source_map.clone();
        effective_source_map.extend(live_source_map.clone());

        let mut ordered_source_ids: Vec<String> = Vec::new();
        let mut seen_source_ids: BTreeSet<String> = BTreeSet::new();
        let mut missing_chapter_ids: Vec<String> = Vec::new();
        for chapter_id in &chapter_ids {
            let source_id = effective_source_map
                .get(chapter_id.as_str())
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            if source_id.is_empty() {
                missing_chapter_ids.push(chapter_id.clone());
                continue;
            }
            if seen_source_ids.insert(source_id.clone()) {
                ordered_source_ids.push(source_id);
            }
        }

        ctx.manifest.source_map = effective_source_map.clone();
        ctx.manifest.selected_source_ids = ordered_source_ids.clone();
        let preview: Map<String, Value> = chapter_ids
            .iter()
            .map(|cid| {
                (
                    cid.clone(),
                    json!(effective_source_map.get(cid.as_str()).cloned().unwrap_or_default()),
                )
            })
            .collect();
        record_stage(
            &mut ctx.manifest,
            &ctx.manifest_path,
            &ctx.events_path,
            clock,
            "source_resolution",
            &json!({
                "db_first": true,
                "cached_hits": chapter_ids.iter()
                    .filter(|cid| cached_source_map.contains_key(cid.as_str()))
                    .collect::<Vec<_>>(),
                "live_lookup_chapter_ids": unresolved_chapter_ids,
                "selected_source_ids": ordered_source_ids,
                "missing_chapter_ids": missing_chapter_ids,
                "source_map_preview": preview,
            }),
        )?;
        store.replace_run_sources(
            &ctx.manifest.run_id,
            &ctx.manifest.selected_chapter_ids,
            &ctx.manifest.source_map,
            &ctx.manifest.selected_source_ids,
            clock,
        )?;
        sync_store_run(store, ctx, clock)?;

        if ordered_source_ids.is_empty() {
            ctx.manifest
                .push_error("no source IDs resolved for selected chapter IDs");
            let target = if request.plan.iter().any(|item| item == "infographic") {
                RunState::Partial
            } else {
                RunState::Failed
            };
            transition(&mut ctx.manifest, target, clock)?;
            write_manifest(&ctx.manifest_path, &mut ctx.manifest, clock)?;
            sync_store_run(store, ctx, clock)?;
            return Ok(manifest_json(&ctx.manifest));
        }

        let non_inf_payload = generate::run_guarded_generation(
            client,
            &GenerateRequest {
                notebook_id: ctx.manifest.notebook_id.clone(),
                source_ids: ordered_source_ids,
                plan: non_infographic_plan.clone(),
                max_success: non_infographic_plan.len() as i64,
                dry_run: false,
                state_file: ctx.run_dir.join("guarded_state.json"),
                events_file: ctx.run_dir.join("guarded_events.jsonl"),
            },
            &request.guard,
            &request.poll,
        )?;
        record_stage(
            &mut ctx.manifest,
            &ctx.manifest_path,
            &ctx.events_path,
            clock,
            "non_infographic",
            &non_inf_payload,
        )?;
        ctx.manifest
            .artifacts
            .extend(extract_non_infographic_artifacts(&non_inf_payload));
        write_manifest(&ctx.manifest_path, &mut ctx.manifest, clock)?;
        store.replace_artifacts(&ctx.manifest.run_id, &ctx.manifest.artifacts, clock)?;
        sync_store_run(store, ctx, clock)?;
    }

    let final_state = final_generation_state(&ctx.manifest);
    transition(&mut ctx.manifest, final_state, clock)?;
    write_manifest(&ctx.manifest_path, &mut ctx.manifest, clock)?;
    sync_store_run(store, ctx, clock)?;
    Ok(manifest_json(&ctx.manifest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_asset_identity_prefers_epub_then_ranked_then_title() {
        let dir = tempfile::tempdir().unwrap();
        let epub = dir.path().join("book.epub");
        std::fs::write(&epub, b"epub-bytes").unwrap();

        let asset =
            resolve_asset_identity("Title", &epub.to_string_lossy(), "/tmp/ranked.json").unwrap();
        assert_eq!(asset.asset_kind, "epub");
        assert_eq!(asset.asset_id, sha256_hex(b"epub-bytes"));

        let asset = resolve_asset_identity("Title", "", "/tmp/does-not-exist.json").unwrap();
        assert_eq!(asset.asset_kind, "ranked_json");

        let asset = resolve_asset_identity("  My   Book  ", "", "").unwrap();
        assert_eq!(asset.asset_kind, "title");
        assert_eq!(asset.asset_id, sha256_hex(b"my book"));

        assert!(resolve_asset_identity("", "", "").is_none());
    }

    #[test]
    fn test_ordered_ids_numeric_first() {
        let ids = vec!["11".to_string(), "2".to_string(), "alpha".to_string()];
        assert_eq!(ordered_ids(&ids), vec!["2", "11", "alpha"]);
    }

    #[test]
    fn test_humanize_title_strips_caps_tail() {
        assert_eq!(humanize_title("The Long March  LI ZHI HENG YONG"), "The Long March");
        assert_eq!(humanize_title("  a   b  "), "a b");
    }

    #[test]
    fn test_estimate_read_minutes_floor() {
        assert_eq!(estimate_read_minutes(0), 3);
        assert_eq!(estimate_read_minutes(450 * 10), 10);
    }

    #[test]
    fn test_selection_guide_skips_meta_titles() {
        let menu = vec![
            ChapterMenuItem {
                chapter_id: "1".to_string(),
                title: "Contents".to_string(),
                score: None,
                char_count: Some(100),
            },
            ChapterMenuItem {
                chapter_id: "2".to_string(),
                title: "The Storm".to_string(),
                score: Some(0.9),
                char_count: Some(9000),
            },
            ChapterMenuItem {
                chapter_id: "3".to_string(),
                title: "The Calm".to_string(),
                score: Some(0.7),
                char_count: Some(4500),
            },
        ];
        let guide = build_chapter_selection_guide(&menu);
        let quick = guide["presets"][0]["chapter_ids"].as_array().unwrap();
        let picked: Vec<&str> = quick.iter().filter_map(Value::as_str).collect();
        assert_eq!(picked, vec!["2", "3"]);
        assert_eq!(guide["options"][0]["is_meta"], json!(true));
        assert!(!guide["reply_hint"].as_str().unwrap().is_empty());
    }

    #[test]
    fn test_source_map_overlay_fresh_wins() {
        let cached: BTreeMap<String, String> = BTreeMap::from([
            ("1".to_string(), "sA".to_string()),
            ("2".to_string(), "sB".to_string()),
        ]);
        let live: BTreeMap<String, String> = BTreeMap::from([
            ("2".to_string(), "sC".to_string()),
            ("3".to_string(), "sD".to_string()),
        ]);
        let mut effective = cached.clone();
        effective.extend(live);
        assert_eq!(effective["1"], "sA");
        assert_eq!(effective["2"], "sC");
        assert_eq!(effective["3"], "sD");
    }
}

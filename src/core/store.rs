//! SQLite-backed metadata store: assets, notebooks, run snapshots, the
//! durable chapter->source cache, and denormalized artifact rows.
//!
//! Runs and artifacts are denormalized copies of the manifest, fully
//! replaced on each sync. Unlike the in-memory manifest, the store's
//! artifact rows are not append-only: every sync is delete+reinsert.

use crate::core::db;
use crate::core::error::BinderyError;
use crate::core::manifest::{ArtifactRecord, RunManifest};
use crate::core::schemas;
use crate::core::time::{self, Clock};
use rusqlite::{params, Connection};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Content-addressed identity for a book/document, hashed for stable
/// cross-run caching keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetIdentity {
    pub asset_id: String,
    pub asset_hash: String,
    pub asset_kind: String,
    pub asset_ref: String,
    pub book_title: String,
}

pub struct MetaStore {
    pub db_path: PathBuf,
    conn: Connection,
}

impl MetaStore {
    pub fn open(path: &Path) -> Result<Self, BinderyError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = db::db_connect(path)?;
        let store = MetaStore {
            db_path: path.to_path_buf(),
            conn,
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open_default() -> Result<Self, BinderyError> {
        Self::open(&db::resolve_db_path(""))
    }

    fn init_schema(&self) -> Result<(), BinderyError> {
        for table in schemas::META_DB_TABLES {
            self.conn.execute(table, [])?;
        }
        for index in schemas::META_DB_INDEXES {
            self.conn.execute(index, [])?;
        }
        Ok(())
    }

    pub fn upsert_asset(&self, asset: &AssetIdentity, clock: &dyn Clock) -> Result<(), BinderyError> {
        let ts = time::now_iso(clock);
        self.conn.execute(
            "
            INSERT INTO assets(asset_id, asset_hash, asset_kind, asset_ref, book_title, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT(asset_id) DO UPDATE SET
              asset_hash = excluded.asset_hash,
              asset_kind = excluded.asset_kind,
              asset_ref = excluded.asset_ref,
              book_title = excluded.book_title,
              updated_at = excluded.updated_at
            ",
            params![
                asset.asset_id,
                asset.asset_hash,
                asset.asset_kind,
                asset.asset_ref,
                asset.book_title,
                ts
            ],
        )?;
        Ok(())
    }

    pub fn get_object_notebook_id(&self, asset_id: &str) -> Result<Option<String>, BinderyError> {
        let mut stmt = self
            .conn
            .prepare("SELECT notebook_id FROM object_notebooks WHERE asset_id = ?1")?;
        let mut rows = stmt.query(params![asset_id])?;
        if let Some(row) = rows.next()? {
            let notebook_id: String = row.get(0)?;
            let notebook_id = notebook_id.trim().to_string();
            if !notebook_id.is_empty() {
                return Ok(Some(notebook_id));
            }
        }
        Ok(None)
    }

    pub fn upsert_object_notebook(
        &self,
        asset_id: &str,
        notebook_id: &str,
        profile: &str,
        clock: &dyn Clock,
    ) -> Result<(), BinderyError> {
        let ts = time::now_iso(clock);
        self.conn.execute(
            "
            INSERT INTO object_notebooks(asset_id, notebook_id, profile, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(asset_id) DO UPDATE SET
              notebook_id = excluded.notebook_id,
              profile = excluded.profile,
              updated_at = excluded.updated_at
            ",
            params![asset_id, notebook_id, profile, ts],
        )?;
        Ok(())
    }

    pub fn upsert_run_notebook(
        &self,
        run_id: &str,
        notebook_id: &str,
        profile: &str,
        clock: &dyn Clock,
    ) -> Result<(), BinderyError> {
        let ts = time::now_iso(clock);
        self.conn.execute(
            "
            INSERT INTO run_notebooks(run_id, notebook_id, profile, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(run_id) DO UPDATE SET
              notebook_id = excluded.notebook_id,
              profile = excluded.profile,
              updated_at = excluded.updated_at
            ",
            params![run_id, notebook_id, profile, ts],
        )?;
        Ok(())
    }

    /// Denormalized run snapshot for listing/history.
    pub fn upsert_run(
        &self,
        manifest: &RunManifest,
        asset_id: Option<&str>,
    ) -> Result<(), BinderyError> {
        let plan_json = serde_json::to_string(&manifest.plan).unwrap_or_else(|_| "[]".to_string());
        let chapters_json = serde_json::to_string(&manifest.selected_chapter_ids)
            .unwrap_or_else(|_| "[]".to_string());
        let sources_json = serde_json::to_string(&manifest.selected_source_ids)
            .unwrap_or_else(|_| "[]".to_string());
        let errors_json =
            serde_json::to_string(&manifest.errors).unwrap_or_else(|_| "[]".to_string());
        self.conn.execute(
            "
            INSERT INTO runs(
              run_id, asset_id, status, workspace_root, plan_json, book_title, ranked_json,
              notebook_strategy, active_notebook_id, object_notebook_id, run_notebook_id,
              selected_chapter_ids_json, selected_source_ids_json, errors_json, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
            ON CONFLICT(run_id) DO UPDATE SET
              asset_id = excluded.asset_id,
              status = excluded.status,
              workspace_root = excluded.workspace_root,
              plan_json = excluded.plan_json,
              book_title = excluded.book_title,
              ranked_json = excluded.ranked_json,
              notebook_strategy = excluded.notebook_strategy,
              active_notebook_id = excluded.active_notebook_id,
              object_notebook_id = excluded.object_notebook_id,
              run_notebook_id = excluded.run_notebook_id,
              selected_chapter_ids_json = excluded.selected_chapter_ids_json,
              selected_source_ids_json = excluded.selected_source_ids_json,
              errors_json = excluded.errors_json,
              updated_at = excluded.updated_at
            ",
            params![
                manifest.run_id,
                asset_id,
                manifest.status.as_str(),
                manifest.workspace_root,
                plan_json,
                manifest.book_title,
                manifest.ranked_json,
                manifest.notebook_strategy.as_str(),
                manifest.notebook_id,
                manifest.object_notebook_id,
                manifest.run_notebook_id,
                chapters_json,
                sources_json,
                errors_json,
                manifest.created_at,
                manifest.updated_at,
            ],
        )?;
        Ok(())
    }

    /// The durable chapter->source cache, queried across runs for the same
    /// (asset, notebook) pair. Recency-ordered so the most recent mapping
    /// wins on duplicate chapter ids.
    pub fn cached_source_map(
        &self,
        asset_id: &str,
        notebook_id: &str,
        chapter_ids: &[String],
    ) -> Result<BTreeMap<String, String>, BinderyError> {
        let normalized: Vec<&str> = chapter_ids
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .collect();
        if normalized.is_empty() || asset_id.trim().is_empty() || notebook_id.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        let placeholders = normalized
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 3))
            .collect::<Vec<_>>()
            .join(",");
        let sql = format!(
            "
            SELECT rs.chapter_id, rs.source_id
            FROM run_sources rs
            JOIN runs r ON r.run_id = rs.run_id
            WHERE r.asset_id = ?1
              AND r.active_notebook_id = ?2
              AND rs.chapter_id IN ({placeholders})
              AND rs.chapter_id <> ''
              AND rs.source_id <> ''
            ORDER BY r.updated_at DESC, rs.id DESC
            "
        );

        let mut params: Vec<&dyn rusqlite::types::ToSql> = vec![&asset_id, &notebook_id];
        for chapter in &normalized {
            params.push(chapter);
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params.as_slice())?;
        let mut picked: BTreeMap<String, String> = BTreeMap::new();
        while let Some(row) = rows.next()? {
            let chapter_id: String = row.get(0)?;
            let source_id: String = row.get(1)?;
            let chapter_id = chapter_id.trim().to_string();
            let source_id = source_id.trim().to_string();
            if chapter_id.is_empty() || source_id.is_empty() {
                continue;
            }
            picked.entry(chapter_id).or_insert(source_id);
        }
        Ok(picked)
    }

    /// Replace the run's source rows: one row per selected chapter (mapped
    /// or not), plus chapterless rows for any extra selected source ids.
    pub fn replace_run_sources(
        &self,
        run_id: &str,
        chapter_ids: &[String],
        source_map: &BTreeMap<String, String>,
        selected_source_ids: &[String],
        clock: &dyn Clock,
    ) -> Result<(), BinderyError> {
        let ts = time::now_iso(clock);
        self.conn
            .execute("DELETE FROM run_sources WHERE run_id = ?1", params![run_id])?;

        let mut used: Vec<String> = Vec::new();
        for chapter_id in chapter_ids {
            let chapter_key = chapter_id.trim();
            if chapter_key.is_empty() {
                continue;
            }
            let source_id = source_map
                .get(chapter_key)
                .map(|s| s.trim().to_string())
                .unwrap_or_default();
            used.push(source_id.clone());
            self.conn.execute(
                "INSERT INTO run_sources(run_id, chapter_id, source_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![run_id, chapter_key, source_id, ts],
            )?;
        }

        for source_id in selected_source_ids {
            let token = source_id.trim();
            if token.is_empty() || used.iter().any(|u| u == token) {
                continue;
            }
            self.conn.execute(
                "INSERT INTO run_sources(run_id, chapter_id, source_id, created_at) VALUES (?1, '', ?2, ?3)",
                params![run_id, token, ts],
            )?;
        }
        Ok(())
    }

    /// Full replacement of the run's denormalized artifact rows.
    pub fn replace_artifacts(
        &self,
        run_id: &str,
        artifacts: &[ArtifactRecord],
        clock: &dyn Clock,
    ) -> Result<(), BinderyError> {
        let ts = time::now_iso(clock);
        self.conn
            .execute("DELETE FROM artifacts WHERE run_id = ?1", params![run_id])?;
        for record in artifacts {
            let detail_json = serde_json::to_string(&record.detail)
                .unwrap_or_else(|_| "{}".to_string());
            self.conn.execute(
                "
                INSERT INTO artifacts(
                  run_id, artifact_type, status, artifact_id, chapter_id, source_id, path, error, detail_json, created_at, updated_at
                )
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
                ",
                params![
                    run_id,
                    record.artifact_type,
                    record.status,
                    record.artifact_id,
                    record.chapter_id,
                    record.source_id,
                    record.path,
                    record.error,
                    detail_json,
                    ts
                ],
            )?;
        }
        Ok(())
    }

    pub fn list_runs(
        &self,
        limit: usize,
        statuses: &[String],
    ) -> Result<Vec<Value>, BinderyError> {
        let limit = limit.max(1) as i64;
        let normalized: Vec<&str> = statuses
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();

        let mut sql = String::from(
            "
            SELECT
              run_id, status, workspace_root, book_title, ranked_json,
              notebook_strategy, active_notebook_id, object_notebook_id, run_notebook_id,
              selected_chapter_ids_json, selected_source_ids_json, errors_json,
              created_at, updated_at
            FROM runs
            ",
        );
        let mut params: Vec<&dyn rusqlite::types::ToSql> = Vec::new();
        if !normalized.is_empty() {
            let placeholders = normalized
                .iter()
                .enumerate()
                .map(|(i, _)| format!("?{}", i + 1))
                .collect::<Vec<_>>()
                .join(",");
            sql.push_str(&format!(" WHERE status IN ({placeholders})"));
            for status in &normalized {
                params.push(status);
            }
        }
        sql.push_str(&format!(" ORDER BY updated_at DESC LIMIT ?{}", params.len() + 1));
        params.push(&limit);

        let decode_list = |raw: String| -> Vec<String> {
            serde_json::from_str::<Vec<String>>(&raw).unwrap_or_default()
        };

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params.as_slice())?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(json!({
                "run_id": row.get::<_, String>(0)?,
                "status": row.get::<_, String>(1)?,
                "workspace_root": row.get::<_, String>(2)?,
                "book_title": row.get::<_, String>(3)?,
                "ranked_json": row.get::<_, String>(4)?,
                "notebook_strategy": row.get::<_, String>(5)?,
                "active_notebook_id": row.get::<_, String>(6)?,
                "object_notebook_id": row.get::<_, String>(7)?,
                "run_notebook_id": row.get::<_, String>(8)?,
                "selected_chapter_ids": decode_list(row.get::<_, String>(9)?),
                "selected_source_ids": decode_list(row.get::<_, String>(10)?),
                "errors": decode_list(row.get::<_, String>(11)?),
                "created_at": row.get::<_, String>(12)?,
                "updated_at": row.get::<_, String>(13)?,
            }));
        }
        Ok(out)
    }
}

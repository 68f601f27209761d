//! Database schema definitions for the bindery metadata store.
//!
//! One SQLite database holds the cross-run metadata: content-addressed
//! assets, their long-lived object notebooks, per-run ephemeral notebooks,
//! denormalized run snapshots, the durable chapter->source cache, and
//! denormalized artifact rows.

pub const BINDERY_DB_NAME: &str = "bindery.db";

pub const META_DB_SCHEMA_ASSETS: &str = "
    CREATE TABLE IF NOT EXISTS assets (
        asset_id TEXT PRIMARY KEY,
        asset_hash TEXT NOT NULL,
        asset_kind TEXT NOT NULL,
        asset_ref TEXT NOT NULL,
        book_title TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
";

pub const META_DB_SCHEMA_OBJECT_NOTEBOOKS: &str = "
    CREATE TABLE IF NOT EXISTS object_notebooks (
        asset_id TEXT PRIMARY KEY,
        notebook_id TEXT NOT NULL,
        profile TEXT NOT NULL DEFAULT 'default',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY(asset_id) REFERENCES assets(asset_id) ON DELETE CASCADE
    )
";

pub const META_DB_SCHEMA_RUNS: &str = "
    CREATE TABLE IF NOT EXISTS runs (
        run_id TEXT PRIMARY KEY,
        asset_id TEXT,
        status TEXT NOT NULL,
        workspace_root TEXT NOT NULL,
        plan_json TEXT NOT NULL,
        book_title TEXT NOT NULL DEFAULT '',
        ranked_json TEXT NOT NULL DEFAULT '',
        notebook_strategy TEXT NOT NULL DEFAULT 'run',
        active_notebook_id TEXT NOT NULL DEFAULT '',
        object_notebook_id TEXT NOT NULL DEFAULT '',
        run_notebook_id TEXT NOT NULL DEFAULT '',
        selected_chapter_ids_json TEXT NOT NULL DEFAULT '[]',
        selected_source_ids_json TEXT NOT NULL DEFAULT '[]',
        errors_json TEXT NOT NULL DEFAULT '[]',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY(asset_id) REFERENCES assets(asset_id)
    )
";

pub const META_DB_SCHEMA_RUN_NOTEBOOKS: &str = "
    CREATE TABLE IF NOT EXISTS run_notebooks (
        run_id TEXT PRIMARY KEY,
        notebook_id TEXT NOT NULL,
        profile TEXT NOT NULL DEFAULT 'default',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY(run_id) REFERENCES runs(run_id) ON DELETE CASCADE
    )
";

pub const META_DB_SCHEMA_RUN_SOURCES: &str = "
    CREATE TABLE IF NOT EXISTS run_sources (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL,
        chapter_id TEXT NOT NULL DEFAULT '',
        source_id TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        FOREIGN KEY(run_id) REFERENCES runs(run_id) ON DELETE CASCADE
    )
";

pub const META_DB_SCHEMA_ARTIFACTS: &str = "
    CREATE TABLE IF NOT EXISTS artifacts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id TEXT NOT NULL,
        artifact_type TEXT NOT NULL,
        status TEXT NOT NULL,
        artifact_id TEXT NOT NULL DEFAULT '',
        chapter_id TEXT NOT NULL DEFAULT '',
        source_id TEXT NOT NULL DEFAULT '',
        path TEXT NOT NULL DEFAULT '',
        error TEXT NOT NULL DEFAULT '',
        detail_json TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY(run_id) REFERENCES runs(run_id) ON DELETE CASCADE
    )
";

pub const META_DB_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_assets_hash ON assets(asset_hash)",
    "CREATE INDEX IF NOT EXISTS idx_runs_asset_notebook_updated ON runs(asset_id, active_notebook_id, updated_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_run_sources_run_id ON run_sources(run_id)",
    "CREATE INDEX IF NOT EXISTS idx_run_sources_chapter ON run_sources(chapter_id, source_id)",
    "CREATE INDEX IF NOT EXISTS idx_artifacts_run_id ON artifacts(run_id)",
];

pub const META_DB_TABLES: &[&str] = &[
    META_DB_SCHEMA_ASSETS,
    META_DB_SCHEMA_OBJECT_NOTEBOOKS,
    META_DB_SCHEMA_RUNS,
    META_DB_SCHEMA_RUN_NOTEBOOKS,
    META_DB_SCHEMA_RUN_SOURCES,
    META_DB_SCHEMA_ARTIFACTS,
];

//! CLI struct definitions and dispatch for the bindery command-line
//! interface.
//!
//! Every surface prints exactly one JSON document to stdout. Logical
//! failures are conveyed in that document's `status`, not via the exit
//! code.

use crate::adapters::chapter_menu::PrepareOptions;
use crate::core::config;
use crate::core::db;
use crate::core::error::BinderyError;
use crate::core::exec::SystemRunner;
use crate::core::generate::{run_guarded_generation, GenerateRequest};
use crate::core::guard::GuardConfig;
use crate::core::lifecycle::PollConfig;
use crate::core::manifest::NotebookStrategy;
use crate::core::nlm::{NlmClient, NlmConfig};
use crate::core::parse;
use crate::core::run::{execute_run, RunRequest};
use crate::core::store::MetaStore;
use crate::core::time::SystemClock;
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[clap(
    name = "bindery",
    version = env!("CARGO_PKG_VERSION"),
    about = "Guarded book-to-artifact orchestration over an external notebook CLI"
)]
pub struct Cli {
    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the full book -> chapter menu -> artifact workflow
    Run(RunCli),
    /// Guarded artifact generation against an existing notebook
    Generate(GenerateCli),
    /// List recorded runs from the metadata store
    Runs(RunsCli),
}

#[derive(clap::Args, Debug)]
pub struct RunCli {
    /// Book title, used for Telegram fetch when no input file is given
    #[clap(long, default_value = "")]
    pub book_title: String,
    /// JSON defaults file (default: <workspace>/bindery.defaults.json)
    #[clap(long, default_value = "")]
    pub config: String,
    #[clap(long, default_value = "")]
    pub epub: String,
    #[clap(long, default_value = "")]
    pub ranked_json: String,
    #[clap(long, default_value = "")]
    pub object_notebook_id: String,
    #[clap(long, default_value = "")]
    pub run_notebook_id: String,
    #[clap(long, value_enum, default_value_t = NotebookStrategy::Run)]
    pub notebook_strategy: NotebookStrategy,
    /// Comma-separated chapter IDs; omit to pause for selection
    #[clap(long, default_value = "")]
    pub chapter_ids: String,
    #[clap(long, default_value = "infographic,slides,report,audio")]
    pub artifact_plan: String,
    #[clap(long, default_value = "default")]
    pub profile: String,
    #[clap(long, default_value = "")]
    pub workspace_root: String,
    #[clap(long, default_value = "")]
    pub run_id: String,
    /// Metadata database path (default: ~/.bindery/state/bindery.db)
    #[clap(long, default_value = "")]
    pub db_path: String,

    #[clap(long, default_value = "")]
    pub tg_bot: String,
    #[clap(long, default_value = "")]
    pub tg_session_file: String,
    #[clap(long, default_value = "")]
    pub tg_output_root: String,

    #[clap(long, default_value = "")]
    pub issue_label: String,
    #[clap(long, default_value = "")]
    pub out_dir: String,
    #[clap(long, default_value_t = 6)]
    pub top_n: u32,
    #[clap(long, default_value_t = 3)]
    pub batch_size: u32,
    #[clap(long, default_value = "score")]
    pub select_mode: String,
    #[clap(long)]
    pub allow_random: bool,
    #[clap(long, default_value_t = 42)]
    pub seed: u64,
    #[clap(long, default_value_t = 0)]
    pub max_per_bucket: u32,
    #[clap(long, default_value_t = 12)]
    pub random_pool_size: u32,
    #[clap(long, default_value_t = 0.2)]
    pub w_len: f64,
    #[clap(long, default_value_t = 0.45)]
    pub w_topic: f64,
    #[clap(long, default_value_t = 0.35)]
    pub w_visual: f64,

    #[clap(long, default_value_t = 8)]
    pub poll_seconds: u64,
    #[clap(long, default_value_t = 36)]
    pub max_polls: u32,
    #[clap(long, default_value_t = 6000)]
    pub chars_per_chapter: usize,
    #[clap(long, default_value_t = 0)]
    pub max_chapters: usize,
    #[clap(long, default_value = "")]
    pub infographic_out_dir: String,
    #[clap(long)]
    pub no_auto_refresh_auth: bool,
}

#[derive(clap::Args, Debug)]
pub struct GenerateCli {
    #[clap(long)]
    pub notebook_id: String,
    /// Comma-separated source IDs; empty means all sources in the notebook
    #[clap(long, default_value = "")]
    pub source_ids: String,
    #[clap(long, default_value = "default")]
    pub profile: String,
    /// Fallback chain, comma-separated
    #[clap(long, default_value = "infographic,slides,report,audio")]
    pub plan: String,
    /// Stop after N successful artifacts
    #[clap(long, default_value_t = 1)]
    pub max_success: i64,
    #[clap(long, default_value_t = 15)]
    pub poll_seconds: u64,
    #[clap(long, default_value_t = 40)]
    pub max_polls: u32,

    #[clap(long, default_value_t = 40)]
    pub daily_budget_total: i64,
    /// e.g. 'infographic:8,slides:10,report:12,audio:12'
    #[clap(long, default_value = "infographic:10,slides:10,report:12,audio:12")]
    pub daily_budget_per_type: String,
    #[clap(long, default_value_t = 3)]
    pub breaker_consecutive_failures: u32,
    #[clap(long, default_value_t = 90)]
    pub breaker_open_minutes: i64,

    /// Guard state file (default: ~/.bindery/state/guarded-generator/state.json)
    #[clap(long, default_value = "")]
    pub state_file: String,
    /// Guard event log (default: ~/.bindery/state/guarded-generator/events.jsonl)
    #[clap(long, default_value = "")]
    pub events_file: String,
    /// Run preflight only
    #[clap(long)]
    pub dry_run: bool,
    #[clap(long)]
    pub no_auto_refresh_auth: bool,
}

#[derive(clap::Args, Debug)]
pub struct RunsCli {
    #[clap(long, default_value_t = 50)]
    pub limit: usize,
    /// Comma-separated status filter, e.g. 'completed,partial'
    #[clap(long, default_value = "")]
    pub status: String,
    #[clap(long, default_value = "")]
    pub db_path: String,
}

pub fn run() -> Result<(), BinderyError> {
    dispatch(Cli::parse())
}

pub fn dispatch(cli: Cli) -> Result<(), BinderyError> {
    match cli.command {
        Command::Run(args) => run_cmd(args),
        Command::Generate(args) => generate_cmd(args),
        Command::Runs(args) => runs_cmd(args),
    }
}

fn run_cmd(args: RunCli) -> Result<(), BinderyError> {
    // Workspace and config chase each other: the config can move the
    // workspace, and an implicit config lives inside the workspace.
    let bootstrap_defaults = serde_json::Map::new();
    let bootstrap_root = config::resolve_workspace_root(&args.workspace_root, &bootstrap_defaults);
    let mut config_path = config::resolve_config_path(&args.config, &bootstrap_root);
    let mut defaults = config::load_defaults(&config_path)?;
    let mut workspace_root = config::resolve_workspace_root(&args.workspace_root, &defaults);

    let config_pinned = !args.config.trim().is_empty()
        || std::env::var(config::ENV_CONFIG)
            .map(|v| !v.trim().is_empty())
            .unwrap_or(false);
    if !config_pinned {
        let implicit = workspace_root.join(config::DEFAULT_CONFIG_FILENAME);
        if implicit != config_path {
            config_path = implicit;
            defaults = config::load_defaults(&config_path)?;
            workspace_root = config::resolve_workspace_root(&args.workspace_root, &defaults);
        }
    }

    let tg_bot = config::str_choice(&args.tg_bot, "BINDERY_TG_BOT", &defaults, "tg_bot");

    let request = RunRequest {
        run_id: args.run_id,
        book_title: args.book_title,
        epub: args.epub,
        ranked_json: args.ranked_json,
        object_notebook_id: args.object_notebook_id,
        run_notebook_id: args.run_notebook_id,
        notebook_strategy: args.notebook_strategy,
        chapter_ids: args.chapter_ids,
        plan: parse::parse_plan(&args.artifact_plan),
        profile: args.profile,
        workspace_root,
        defaults,
        tg_bot,
        tg_session_file: args.tg_session_file,
        tg_output_root: args.tg_output_root,
        prepare: PrepareOptions {
            top_n: args.top_n,
            batch_size: args.batch_size,
            select_mode: args.select_mode,
            allow_random: args.allow_random,
            seed: args.seed,
            max_per_bucket: args.max_per_bucket,
            random_pool_size: args.random_pool_size,
            w_len: args.w_len,
            w_topic: args.w_topic,
            w_visual: args.w_visual,
            issue_label: args.issue_label,
            out_dir: args.out_dir,
        },
        poll: PollConfig {
            poll_seconds: args.poll_seconds,
            max_polls: args.max_polls,
        },
        guard: GuardConfig::default(),
        chars_per_chapter: args.chars_per_chapter,
        max_chapters: args.max_chapters,
        infographic_out_dir: args.infographic_out_dir,
        auto_refresh_auth: !args.no_auto_refresh_auth,
    };

    let store = MetaStore::open(&db::resolve_db_path(&args.db_path))?;
    let runner = SystemRunner;
    let clock = SystemClock;
    let manifest = execute_run(&request, &store, &runner, &clock)?;
    println!("{manifest}");
    Ok(())
}

fn generate_cmd(args: GenerateCli) -> Result<(), BinderyError> {
    let state_file = if args.state_file.trim().is_empty() {
        config::default_guard_state_file()
    } else {
        config::expand_user(args.state_file.trim())
    };
    let events_file = if args.events_file.trim().is_empty() {
        config::default_guard_events_file()
    } else {
        config::expand_user(args.events_file.trim())
    };

    let runner = SystemRunner;
    let clock = SystemClock;
    let client = NlmClient::new(
        NlmConfig {
            profile: args.profile,
            auto_refresh_auth: !args.no_auto_refresh_auth,
            ..NlmConfig::default()
        },
        &runner,
        &clock,
    );

    let request = GenerateRequest {
        notebook_id: args.notebook_id,
        source_ids: parse::parse_csv_ids(&args.source_ids),
        plan: parse::parse_plan(&args.plan),
        max_success: args.max_success,
        dry_run: args.dry_run,
        state_file,
        events_file,
    };
    let guard = GuardConfig {
        daily_budget_total: args.daily_budget_total,
        daily_budget_per_type: parse::parse_budget_per_type(&args.daily_budget_per_type),
        breaker_consecutive_failures: args.breaker_consecutive_failures,
        breaker_open_minutes: args.breaker_open_minutes,
    };
    let poll = PollConfig {
        poll_seconds: args.poll_seconds,
        max_polls: args.max_polls,
    };

    let summary = run_guarded_generation(&client, &request, &guard, &poll)?;
    println!("{summary}");
    Ok(())
}

fn runs_cmd(args: RunsCli) -> Result<(), BinderyError> {
    let store = MetaStore::open(&db::resolve_db_path(&args.db_path))?;
    let statuses = parse::parse_csv_ids(&args.status);
    let rows = store.list_runs(args.limit, &statuses)?;
    println!(
        "{}",
        serde_json::json!({ "count": rows.len(), "runs": rows })
    );
    Ok(())
}

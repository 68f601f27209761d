//! Bindery: guarded book-to-artifact orchestration.
//!
//! Bindery turns a fetched book into a curated set of notebook artifacts
//! (infographics, slide decks, reports, audio) by driving an external
//! notebook CLI through a guarded create -> poll -> classify lifecycle.
//!
//! # Architecture
//!
//! Two state machines carry the crate:
//!
//! - The **guarded generation subsystem** ([`core::generate`]): a
//!   budget-limited, circuit-breaker-protected controller that walks an
//!   ordered fallback plan of artifact types, persisting daily quotas and
//!   breaker status across process restarts.
//! - The **run manifest state machine** ([`core::run`],
//!   [`core::state_machine`]): the book-to-artifact workflow
//!   (fetch -> prepare -> await-selection -> generate -> finalize) with
//!   legal-transition enforcement, idempotent stage recording, and cached
//!   chapter->source resolution backed by [`core::store`].
//!
//! Execution is single-threaded and strictly sequential: every external
//! call is a synchronous subprocess bounded by a wall-clock timeout, and
//! all waiting is blocking sleep between poll attempts.
//!
//! # Persistence
//!
//! - Run manifest: one schema-versioned JSON file per run, rewritten in
//!   full on every mutation, next to an append-only `events.jsonl`.
//! - Guard state: one JSON document per installation
//!   (`~/.bindery/state/guarded-generator/state.json`), read-modify-write,
//!   single writer assumed.
//! - Metadata store: SQLite (WAL, busy timeout) holding assets, notebooks,
//!   run snapshots, the chapter->source cache, and artifact rows.
//!
//! # Crate structure
//!
//! - [`core`]: executor, parser, guard, lifecycle, orchestrators, store
//! - [`adapters`]: out-of-core fetch/prepare collaborators (subprocess)
//! - [`cli`]: the `bindery` command surface (`run`, `generate`, `runs`)

pub mod adapters;
pub mod cli;
pub mod core;

//! Keeps a local bar lake in sync with upstream market data providers.
//!
//! A run loads [`config::Settings`], merges the declared [`spec::AssetSpec`]s
//! into one [`job::IngestionJob`] per series ([`plan`]), and hands the jobs to
//! the [`orchestrator::Orchestrator`], which fetches through each provider's
//! rate governor, validates, writes partitions with `storage_service`, and
//! advances a per-series checkpoint in SQLite ([`checkpoint`]).

#![warn(missing_docs)]

pub mod checkpoint;
pub mod config;
pub mod db;
pub mod job;
pub mod orchestrator;
pub mod plan;
pub mod providers;
pub mod schema;
pub mod spec;
pub mod summary;
pub mod tz;
pub mod validate;

//! # Trade Copier
//!
//! Replicates a provider trading account's positions onto one or more
//! receiver accounts, and optionally duplicates them on the provider.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `terminal`: Terminal bridge client, per-connection workers, mock terminal
//! - `replication`: Change detection, copy links, dispatch, retries, engine loop
//! - `persistence`: SQLite-backed state store for crash-safe restarts
//! - `diagnostics`: Structured alerts and periodic link reports
//! - `utils`: Shared utilities and decimal arithmetic

pub mod config;
pub mod diagnostics;
pub mod persistence;
pub mod replication;
pub mod terminal;
pub mod utils;

pub use config::Config;

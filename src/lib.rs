//! TradeVault
//!
//! Idempotent order ledger, append-only journal and notification outbox on SQLite,
//! fed by TradingView webhooks.

pub mod application;
pub mod auth;
pub mod config;
pub mod domain;
pub mod infrastructure;
pub mod persistence;
pub mod rate_limit;
pub mod task_runner;

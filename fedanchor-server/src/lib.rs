//! OpenID Federation trust anchor / intermediate authority.
//!
//! # Architecture
//!
//! - `config` — process flags and the TOML federation profile
//! - `cache` — typed Redis projections (signed artifacts, indices, queue)
//! - `db` — authoritative SQLite rows for subordinates and trust marks
//! - `policy` — metadata-policy merge and apply
//! - `fetch` — outbound entity-configuration fetching and verification
//! - `admission` — the subordinate admission pipeline
//! - `trustmarks` — trust-mark issue/renew/revoke/status engine
//! - `resolver` — trust-chain resolution
//! - `walker` — breadth-first federation discovery
//! - `statement` — the TA's own signed artifacts
//! - `web` — axum routes for the federation and admin surfaces
//! - `server` — startup wiring

pub mod admission;
pub mod cache;
pub mod config;
pub mod db;
pub mod error;
pub mod fetch;
pub mod policy;
pub mod resolver;
pub mod server;
pub mod statement;
pub mod trustmarks;
pub mod util;
pub mod walker;
pub mod web;

#[cfg(test)]
pub mod test_support;

pub use error::{FederationError, Result};

//! # certdesk
//!
//! Back-office desk for certificate requests: an authoritative ticket store
//! with an append-only history ledger, per-session sync clients, an intake
//! bridge that tolerates store outages, and completion notifications over
//! email and messaging.

pub mod api;
pub mod attachment;
pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod event;
pub mod intake;
pub mod ledger;
pub mod model;
pub mod notify;
pub mod store;
pub mod sync;
pub mod telemetry;

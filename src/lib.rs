#![forbid(unsafe_code)]

//! `camfleet`: coordinator and agent for a fleet of unattended camera
//! recorders.
//!
//! The coordinator keeps a device registry, a per-device command mailbox
//! and an upload receiver behind a small JSON API. Agents poll it for
//! commands, supervise one capture process per recording session, and
//! upload finished recordings.

pub mod api;
pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod storage;

pub use config::{AgentConfig, ServerConfig};
pub use errors::{AppError, Result};

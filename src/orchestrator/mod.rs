//! Agent-side recording orchestration.
//!
//! Covers capture process supervision, the session store and its
//! lifecycle manager, the upload pipeline, the coordinator client, and
//! the polling loop that ties them together.

pub mod coordinator;
pub mod runner;
pub mod session_manager;
pub mod session_store;
pub mod supervisor;
pub mod uploader;

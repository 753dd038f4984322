//! Persistence layer modules.

pub mod db;
pub mod device_repo;
pub mod mailbox_repo;
pub mod recording_repo;
pub mod schema;

/// Re-export the database pool type for convenience.
pub use sqlx::SqlitePool;

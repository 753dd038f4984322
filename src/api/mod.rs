//! Coordinator HTTP surface.
//!
//! Exposes the device registry, command mailbox and upload receiver
//! over JSON endpoints served by axum.

pub mod auth;
pub mod handler;
pub mod response;
pub mod routes;
pub mod server;

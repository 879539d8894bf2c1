// Library entry point for timeline-sync
// Exposes modules for the binary and integration tests

pub mod config;
pub mod merge;
pub mod models;
pub mod ordered_id;
pub mod remote;
pub mod repository;
pub mod session;
pub mod store;

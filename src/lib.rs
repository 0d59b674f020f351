// ABOUTME: Library root for tether - exposes public types for testing.
// ABOUTME: The main binary is in main.rs.

pub mod config;
pub mod error;
pub mod ssh;
pub mod types;

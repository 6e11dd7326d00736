//! Courier long-poll service library crate.
//!
//! # Purpose
//! Wires the long-poll subscriber core to HTTP: configuration, the shard task
//! that owns subscribers and messages, the axum routes, and observability.
pub mod config;
pub mod observability;
pub mod server;
pub mod shard;

#[cfg(test)]
mod test_support;

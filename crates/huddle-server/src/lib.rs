//! # huddle-server
//!
//! Connection gateway for the Huddle chat server.
//!
//! Accepts WebSocket connections, decodes client frames into hub commands,
//! and streams each connection's outbox back to the client. The binary
//! `huddle` wraps [`handlers::run_server`].

pub mod config;
pub mod handlers;
pub mod metrics;

pub use config::Config;
pub use handlers::{run_server, serve, AppState};

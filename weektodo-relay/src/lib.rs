//! `WeekTodo` relay server library.
//!
//! Exposes the relay server for use in tests and embedding. The server
//! accepts WebSocket connections, registers peers, routes sync links between
//! them, and serves the REST mirror on the same listener.

pub mod api;
pub mod config;
pub mod registry;
pub mod relay;

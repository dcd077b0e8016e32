//! `weektodo` — peer-to-peer synchronization of a weekly todo list.
//!
//! Every device keeps a full copy of the week. Local edits are applied to the
//! [`store`] first and then broadcast to every connected peer; a peer that
//! (re)connects exchanges the full collection and merges it with
//! last-write-wins. [`engine::SyncEngine`] wires the pieces together.

pub mod cli;
pub mod config;
pub mod engine;
pub mod peer;
pub mod rest;
pub mod store;
pub mod sync;
pub mod transport;

//! Shared protocol definitions for `WeekTodo` peers and the relay.

pub mod codec;
pub mod merge;
pub mod message;
pub mod relay;
pub mod rest;
pub mod task;

//! Persistent Agent: a crash-recoverable, queue-driven agent runtime.

pub mod agent;
pub mod config;
pub mod error;
pub mod llm;
pub mod store;
pub mod tasks;
pub mod tools;

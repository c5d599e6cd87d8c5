//! Discord bridge between coding-agent CLIs and the humans following them.

pub mod chat;
pub mod cli;
pub mod discord;
pub mod event_router;
pub mod reply_queue;
pub mod router;
pub mod session;
pub mod telemetry;
pub mod thread_key;
pub mod types;

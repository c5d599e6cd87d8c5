//! Collaborators that feed the bridge: the Codex notify hook and the OpenCode
//! relay with its reply poll loop.

pub mod cli;
pub mod client;
pub mod codex;
pub mod opencode;
pub mod poll;

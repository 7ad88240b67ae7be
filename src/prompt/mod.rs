//! Human input
//!
//! The file-based rendezvous between the engine and whoever answers its
//! questions: a monitoring UI, an external notifier, or the terminal.

pub mod channel;

pub use channel::{PromptChannel, PromptConfig, PromptError};

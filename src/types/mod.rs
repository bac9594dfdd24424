//! Shared data types

pub mod message;

pub use message::{ChatHistory, ChatMessage, Role};

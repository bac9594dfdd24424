//! llama-stream Library
//!
//! Single-session streaming text generation: load a model, start a
//! generation in the background, poll the produced text and stop it at any
//! time.

pub mod inference;
pub mod storage;
pub mod types;

pub use inference::{Engine, EngineError, GenerationOutcome, StopReason, StreamEvent};

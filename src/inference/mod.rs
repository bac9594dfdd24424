//! Streaming text generation
//!
//! This module handles model loading, the generation loop and the handoff of
//! generated text to the caller.

pub mod backend;
pub mod context;
pub mod engine;
pub mod model;
pub mod sampler;
pub mod stop;
pub mod streaming;
pub mod worker;

// Re-export main types for convenience
pub use backend::{Backend, LoadParams, ModelSession, ScriptBackend, SessionInfo, TokenId};
pub use engine::{CancelHandle, Engine, EngineError, Listener, DEFAULT_MAX_TOKENS};
pub use model::{validate_gguf, GgufHeader, ModelError, GGUF_MAGIC};
pub use sampler::{SamplerChain, SamplerParams};
pub use stop::{trim_stop_suffix, StopMatcher};
pub use streaming::{StreamEvent, Utf8Assembler};
pub use worker::{GenerationOutcome, GenerationState, StopReason};

#[cfg(feature = "llama")]
pub use backend::LlamaCppBackend;

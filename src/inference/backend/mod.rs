//! Model runtimes
//!
//! The engine never touches a model runtime directly. It asks a [`Backend`] to
//! open a session and drives the session through the [`ModelSession`] trait.
//!
//! A session only exists for the duration of the closure passed to
//! [`Backend::open`]: the backend loads the weights, creates the evaluation
//! context, hands the caller a `&mut dyn ModelSession` and tears everything
//! down once the closure returns. This keeps the context from outliving the
//! weights without any self-referential types.

use std::path::PathBuf;

use crate::inference::engine::EngineError;
use crate::inference::sampler::SamplerParams;

#[cfg(feature = "llama")]
pub mod llama;
pub mod script;

#[cfg(feature = "llama")]
pub use llama::LlamaCppBackend;
pub use script::{ScriptBackend, ScriptStats};

/// Vocabulary index of a token.
pub type TokenId = i32;

/// Everything a backend needs to bring up a session.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadParams {
    /// Path to the weight file
    pub path: PathBuf,
    /// Requested context window capacity in tokens
    pub context_size: u32,
    /// Number of layers to offload to the accelerator (0 = CPU only)
    pub gpu_layers: u32,
    /// Keep the K/Q/V tensors on the accelerator
    pub offload_kqv: bool,
    /// Worker threads for evaluation (`None` = all available cores)
    pub threads: Option<u32>,
}

impl LoadParams {
    /// Parameters for `path` with the given context size and CPU-only defaults.
    pub fn new(path: impl Into<PathBuf>, context_size: u32) -> Self {
        Self {
            path: path.into(),
            context_size,
            gpu_layers: 0,
            offload_kqv: true,
            threads: None,
        }
    }
}

/// Facts about a live session, captured once after it is opened.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    /// Path of the loaded weights
    pub path: String,
    /// Number of entries in the vocabulary
    pub vocab_size: usize,
    /// Capacity of the context window in tokens
    pub context_size: u32,
    /// Largest number of tokens a single `decode` call accepts
    pub max_batch: u32,
}

/// A loaded model together with its evaluation context.
///
/// Implementations are driven from a single thread; nothing here needs to be
/// `Send` or `Sync`.
pub trait ModelSession {
    /// Static facts about this session
    fn info(&self) -> &SessionInfo;

    /// Splits `text` into tokens without adding any special tokens.
    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineError>;

    /// Raw bytes of a single token. May be an incomplete UTF-8 sequence.
    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, EngineError>;

    /// Whether `token` ends generation for this vocabulary.
    fn is_end_of_sequence(&self, token: TokenId) -> bool;

    /// Evaluates `tokens`, placing the first one at position `start`.
    ///
    /// When `want_logits` is set the logits of the last token become available
    /// to [`ModelSession::sample`]. `tokens.len()` never exceeds
    /// [`SessionInfo::max_batch`].
    fn decode(&mut self, tokens: &[TokenId], start: u32, want_logits: bool)
        -> Result<(), EngineError>;

    /// Replaces the sampling pipeline, forgetting the token history.
    fn configure_sampler(&mut self, params: &SamplerParams);

    /// Picks the next token from the logits of the most recent `decode` that
    /// asked for them, and records it in the sampler's history.
    fn sample(&mut self) -> Result<TokenId, EngineError>;

    /// Drops every cached position of the sequence.
    fn clear_sequence(&mut self);
}

/// Something that can turn a weight file into a [`ModelSession`].
pub trait Backend: Send + 'static {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Opens a session and runs `run` with it.
    ///
    /// `run` is only invoked once the weights and the context are both in
    /// place. Any failure before that point is returned and leaves nothing
    /// allocated. The session is released (context first, then weights) as
    /// soon as `run` returns.
    fn open(
        &mut self,
        params: &LoadParams,
        run: &mut dyn FnMut(&mut dyn ModelSession),
    ) -> Result<(), EngineError>;
}

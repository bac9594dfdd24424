//! llama.cpp backend
//!
//! Loads GGUF models through `llama-cpp-2`.
//!
//! `LlamaContext` borrows the `LlamaModel` it was created from, so both live on
//! the stack of [`LlamaCppBackend::open`] for exactly as long as the session
//! closure runs. The context is dropped before the weights on the way out.

use std::num::NonZeroU32;

use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::context::LlamaContext;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel, Special};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use llama_cpp_2::{send_logs_to_tracing, LogOptions};
use once_cell::sync::OnceCell;

use crate::inference::backend::{Backend, LoadParams, ModelSession, SessionInfo, TokenId};
use crate::inference::engine::EngineError;
use crate::inference::model::validate_gguf;
use crate::inference::sampler::SamplerParams;

/// Upper bound on tokens per `llama_decode` call
const MAX_BATCH: u32 = 512;

/// Penalize repeats across the whole context
const PENALTY_LAST_N: i32 = -1;

/// llama.cpp may only be initialised once per process.
static LLAMA_BACKEND: OnceCell<LlamaBackend> = OnceCell::new();

fn shared_backend() -> Result<&'static LlamaBackend, EngineError> {
    LLAMA_BACKEND.get_or_try_init(|| {
        send_logs_to_tracing(LogOptions::default().with_logs_enabled(true));
        let backend =
            LlamaBackend::init().map_err(|e| EngineError::BackendInit(e.to_string()))?;
        tracing::info!("llama.cpp backend initialized");
        Ok(backend)
    })
}

fn default_threads() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

/// Backend running GGUF models on llama.cpp.
#[derive(Debug, Default, Clone, Copy)]
pub struct LlamaCppBackend;

impl LlamaCppBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for LlamaCppBackend {
    fn name(&self) -> &'static str {
        "llama.cpp"
    }

    fn open(
        &mut self,
        params: &LoadParams,
        run: &mut dyn FnMut(&mut dyn ModelSession),
    ) -> Result<(), EngineError> {
        // Validate GGUF file first, before llama.cpp gets to see it
        let metadata = validate_gguf(&params.path)?;
        tracing::debug!(
            "GGUF v{} with {} tensors: {}",
            metadata.version,
            metadata.tensor_count,
            params.path.display()
        );

        let backend = shared_backend()?;

        let model_params = LlamaModelParams::default().with_n_gpu_layers(params.gpu_layers);
        let model = LlamaModel::load_from_file(backend, &params.path, &model_params)
            .map_err(|e| EngineError::ModelLoad(e.to_string()))?;

        let n_ctx = NonZeroU32::new(params.context_size).ok_or_else(|| {
            EngineError::ContextCreate("context size must be positive".to_string())
        })?;
        let threads = params
            .threads
            .map(|t| t as i32)
            .unwrap_or_else(default_threads);

        let ctx_params = LlamaContextParams::default()
            .with_n_ctx(Some(n_ctx))
            .with_n_batch(MAX_BATCH)
            .with_offload_kqv(params.offload_kqv)
            .with_n_threads(threads)
            .with_n_threads_batch(threads);

        // On failure `model` is dropped here, releasing the weights
        let ctx = model
            .new_context(backend, ctx_params)
            .map_err(|e| EngineError::ContextCreate(e.to_string()))?;

        let info = SessionInfo {
            path: params.path.to_string_lossy().to_string(),
            vocab_size: model.n_vocab().max(0) as usize,
            context_size: ctx.n_ctx(),
            max_batch: ctx.n_batch().clamp(1, MAX_BATCH),
        };

        tracing::info!(
            "Model loaded: {} ({} params, {} vocab, {} ctx, {} gpu layers)",
            info.path,
            model.n_params(),
            info.vocab_size,
            info.context_size,
            params.gpu_layers
        );

        let mut session = LlamaSession {
            model: &model,
            ctx,
            info,
            sampler: build_sampler(&SamplerParams::default()),
            logits_index: None,
        };
        run(&mut session);

        drop(session);
        drop(model);
        Ok(())
    }
}

/// top-k, top-p, temperature, penalties, then greedy
fn build_sampler(params: &SamplerParams) -> LlamaSampler {
    LlamaSampler::chain_simple([
        LlamaSampler::top_k(params.top_k as i32),
        LlamaSampler::top_p(params.top_p, 1),
        LlamaSampler::temp(params.temperature),
        LlamaSampler::penalties(
            PENALTY_LAST_N,
            params.repeat_penalty,
            params.frequency_penalty,
            params.presence_penalty,
        ),
        LlamaSampler::greedy(),
    ])
}

struct LlamaSession<'m> {
    model: &'m LlamaModel,
    ctx: LlamaContext<'m>,
    info: SessionInfo,
    sampler: LlamaSampler,
    /// Batch index whose logits are valid, if any
    logits_index: Option<i32>,
}

impl ModelSession for LlamaSession<'_> {
    fn info(&self) -> &SessionInfo {
        &self.info
    }

    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineError> {
        self.model
            .str_to_token(text, AddBos::Never)
            .map(|tokens| tokens.into_iter().map(|t| t.0).collect())
            .map_err(|e| EngineError::Tokenization(e.to_string()))
    }

    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, EngineError> {
        self.model
            .token_to_bytes(LlamaToken(token), Special::Plaintext)
            .map_err(|e| EngineError::Tokenization(format!("token {token}: {e}")))
    }

    fn is_end_of_sequence(&self, token: TokenId) -> bool {
        self.model.is_eog_token(LlamaToken(token))
    }

    fn decode(
        &mut self,
        tokens: &[TokenId],
        start: u32,
        want_logits: bool,
    ) -> Result<(), EngineError> {
        if tokens.is_empty() {
            return Err(EngineError::Eval("empty batch".to_string()));
        }

        let mut batch = LlamaBatch::new(tokens.len(), 1);
        let last = tokens.len() - 1;
        for (i, &token) in tokens.iter().enumerate() {
            let pos = (start as usize + i) as i32;
            batch
                .add(LlamaToken(token), pos, &[0], want_logits && i == last)
                .map_err(|e| EngineError::Eval(format!("Failed to add token to batch: {e}")))?;
        }

        self.logits_index = None;
        self.ctx
            .decode(&mut batch)
            .map_err(|e| EngineError::Eval(format!("llama_decode failed: {e}")))?;

        if want_logits {
            self.logits_index = Some(batch.n_tokens() - 1);
        }
        Ok(())
    }

    fn configure_sampler(&mut self, params: &SamplerParams) {
        self.sampler = build_sampler(params);
    }

    fn sample(&mut self) -> Result<TokenId, EngineError> {
        let index = self
            .logits_index
            .ok_or_else(|| EngineError::Sampling("no logits available".to_string()))?;
        // llama_sampler_sample accepts the token into the chain itself
        let token = self.sampler.sample(&self.ctx, index);
        Ok(token.0)
    }

    fn clear_sequence(&mut self) {
        self.ctx.clear_kv_cache();
        self.logits_index = None;
    }
}

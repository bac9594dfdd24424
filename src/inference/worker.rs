//! The generation loop
//!
//! One run evaluates the prompt in batches, then samples, publishes and feeds
//! back one token at a time until something ends it. Cancellation is checked
//! after every prompt batch and after every generated token.
//!
//! The end conditions of a published token are checked before it is fed back,
//! so a run that ends never evaluates a token it will not sample from. When
//! several hold at once, cancellation wins over a stop phrase, which wins over
//! the token budget.

use uuid::Uuid;

use crate::inference::backend::ModelSession;
use crate::inference::context::ContextWindow;
use crate::inference::engine::{EngineError, Shared};
use crate::inference::stop::StopMatcher;
use crate::inference::streaming::Utf8Assembler;

/// Where the engine is in a generation cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    /// No run in progress
    Idle,
    /// Evaluating the prompt
    Prompting,
    /// Producing tokens
    Generating,
    /// Cancellation requested, waiting for the run to notice
    Stopping,
}

/// Why a run ended without an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// The model produced an end-of-generation token
    EndOfSequence,
    /// The generated text ended with this stop phrase
    StopPhrase(String),
    /// `max_tokens` tokens were generated
    TokenBudget,
    /// The caller stopped the run; partial output is kept
    Cancelled,
}

/// How the most recent run ended
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationOutcome {
    Finished(StopReason),
    Failed(EngineError),
}

/// A prompt accepted for generation. Never changes once the run starts.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub id: Uuid,
    pub prompt: String,
    pub max_tokens: u32,
    pub stop: StopMatcher,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, max_tokens: u32, stop: StopMatcher) -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt: prompt.into(),
            max_tokens,
            stop,
        }
    }
}

/// Executes one run against `session`.
///
/// `between_steps` is called after every prompt batch and every generated
/// token; the engine uses it to answer read-only queries while a run is active.
pub(crate) fn run(
    session: &mut dyn ModelSession,
    window: &mut ContextWindow,
    request: &GenerationRequest,
    shared: &Shared,
    between_steps: &mut dyn FnMut(&dyn ModelSession),
) -> GenerationOutcome {
    let span = tracing::info_span!("generation", id = %request.id);
    let _enter = span.enter();

    tracing::info!(
        "Generation started ({} prompt bytes, up to {} tokens)",
        request.prompt.len(),
        request.max_tokens
    );

    let outcome = match generate(session, window, request, shared, between_steps) {
        Ok(reason) => {
            tracing::info!("Generation finished: {:?}", reason);
            GenerationOutcome::Finished(reason)
        }
        Err(e) => {
            tracing::error!("Generation ended abnormally: {}", e);
            GenerationOutcome::Failed(e)
        }
    };
    tracing::debug!(
        "Context {}/{} positions after run",
        window.filled(),
        window.capacity()
    );
    outcome
}

fn generate(
    session: &mut dyn ModelSession,
    window: &mut ContextWindow,
    request: &GenerationRequest,
    shared: &Shared,
    between_steps: &mut dyn FnMut(&dyn ModelSession),
) -> Result<StopReason, EngineError> {
    session.clear_sequence();
    window.reset();

    if shared.cancel_requested() {
        return Ok(StopReason::Cancelled);
    }

    let tokens = session.tokenize(&request.prompt)?;
    if tokens.is_empty() {
        return Err(EngineError::InvalidRequest(
            "prompt produced no tokens".to_string(),
        ));
    }
    tracing::debug!("Tokenized prompt into {} tokens", tokens.len());

    // Prompt phase: logits are only needed for the very last prompt token
    let max_batch = session.info().max_batch.max(1) as usize;
    let last_batch = (tokens.len() - 1) / max_batch;
    for (i, batch) in tokens.chunks(max_batch).enumerate() {
        window.ensure_room(batch.len())?;
        session.decode(batch, window.filled(), i == last_batch)?;
        window.advance(batch.len());
        tracing::debug!("Prompt batch {} evaluated ({} tokens)", i, batch.len());

        between_steps(&*session);
        if shared.cancel_requested() {
            return Ok(StopReason::Cancelled);
        }
    }

    shared.enter_generating();

    let (mut revision, params) = shared.sampler.snapshot();
    session.configure_sampler(&params);
    let mut assembler = Utf8Assembler::new();
    let mut generated = String::new();

    for step in 1..=request.max_tokens {
        if let Some(params) = shared.sampler.refresh(&mut revision) {
            session.configure_sampler(&params);
        }

        let token = session.sample()?;
        if session.is_end_of_sequence(token) {
            drop_incomplete(&mut assembler);
            return Ok(StopReason::EndOfSequence);
        }

        let piece = assembler.push(&session.token_to_bytes(token)?);
        if !piece.is_empty() {
            shared.publish(&piece);
            generated.push_str(&piece);
        }

        between_steps(&*session);
        if shared.cancel_requested() {
            drop_incomplete(&mut assembler);
            return Ok(StopReason::Cancelled);
        }
        if let Some(phrase) = request.stop.find_suffix(&generated) {
            return Ok(StopReason::StopPhrase(phrase.to_string()));
        }
        if step == request.max_tokens {
            break;
        }

        window.ensure_room(1)?;
        session.decode(&[token], window.filled(), true)?;
        window.advance(1);

        if shared.cancel_requested() {
            drop_incomplete(&mut assembler);
            return Ok(StopReason::Cancelled);
        }
    }

    drop_incomplete(&mut assembler);
    Ok(StopReason::TokenBudget)
}

fn drop_incomplete(assembler: &mut Utf8Assembler) {
    let dropped = assembler.discard();
    if dropped > 0 {
        tracing::debug!("Dropped {} bytes of an unfinished UTF-8 sequence", dropped);
    }
}

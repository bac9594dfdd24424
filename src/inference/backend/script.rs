//! Deterministic in-memory backend
//!
//! [`ScriptBackend`] behaves like a tiny model whose continuation is fixed in
//! advance: whatever the prompt, the highest logit always belongs to the next
//! scripted piece, and once the script runs out the end-of-sequence token wins.
//! Sampling goes through the pure-Rust [`SamplerChain`].
//! It is what the engine tests run against and is handy for exercising a
//! front end without model weights.
//!
//! Vocabulary layout: id 0 is end-of-sequence, ids 1..=256 are single bytes
//! (prompts are tokenized byte by byte) and every scripted piece gets its own
//! id after that.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crate::inference::backend::{Backend, LoadParams, ModelSession, SessionInfo, TokenId};
use crate::inference::engine::EngineError;
use crate::inference::sampler::{SamplerChain, SamplerParams};

const EOS: TokenId = 0;
const FIRST_BYTE: TokenId = 1;
const FIRST_PIECE: TokenId = 257;

/// Counters shared between a [`ScriptBackend`] and the test observing it.
#[derive(Debug, Default)]
pub struct ScriptStats {
    loads: AtomicUsize,
    unloads: AtomicUsize,
    decodes: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    sampler_configs: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
}

impl ScriptStats {
    /// Sessions successfully opened
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Sessions torn down
    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    /// Total `decode` calls across all sessions
    pub fn decode_calls(&self) -> usize {
        self.decodes.load(Ordering::SeqCst)
    }

    /// Highest number of `decode` calls that were ever running at once
    pub fn max_concurrent_decodes(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// `configure_sampler` calls across all sessions
    pub fn sampler_configs(&self) -> usize {
        self.sampler_configs.load(Ordering::SeqCst)
    }

    /// Size of every batch handed to `decode`, in call order
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes
            .lock()
            .map(|sizes| sizes.clone())
            .unwrap_or_default()
    }
}

/// A backend that replays a fixed continuation.
#[derive(Debug, Clone)]
pub struct ScriptBackend {
    pieces: Vec<Vec<u8>>,
    max_batch: u32,
    step_delay: Option<Duration>,
    fail_decode_at: Option<usize>,
    reject_weights: bool,
    reject_context: bool,
    stats: Arc<ScriptStats>,
}

impl ScriptBackend {
    /// Creates a backend that emits `pieces` one token at a time, then
    /// end-of-sequence.
    pub fn new<I, P>(pieces: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Vec<u8>>,
    {
        Self {
            pieces: pieces.into_iter().map(Into::into).collect(),
            max_batch: 512,
            step_delay: None,
            fail_decode_at: None,
            reject_weights: false,
            reject_context: false,
            stats: Arc::new(ScriptStats::default()),
        }
    }

    /// Limits how many tokens a single `decode` call accepts.
    pub fn with_max_batch(mut self, max_batch: u32) -> Self {
        self.max_batch = max_batch.max(1);
        self
    }

    /// Sleeps this long inside every `decode` call.
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = Some(delay);
        self
    }

    /// Makes the `n`th `decode` call of a session (0-based) fail.
    pub fn fail_decode_at(mut self, n: usize) -> Self {
        self.fail_decode_at = Some(n);
        self
    }

    /// Makes loading the weights fail.
    pub fn reject_weights(mut self) -> Self {
        self.reject_weights = true;
        self
    }

    /// Makes context creation fail after the weights loaded.
    pub fn reject_context(mut self) -> Self {
        self.reject_context = true;
        self
    }

    /// Counters for this backend
    pub fn stats(&self) -> Arc<ScriptStats> {
        Arc::clone(&self.stats)
    }
}

impl Backend for ScriptBackend {
    fn name(&self) -> &'static str {
        "script"
    }

    fn open(
        &mut self,
        params: &LoadParams,
        run: &mut dyn FnMut(&mut dyn ModelSession),
    ) -> Result<(), EngineError> {
        if self.reject_weights {
            return Err(EngineError::ModelLoad(format!(
                "{}: weights rejected",
                params.path.display()
            )));
        }
        if self.reject_context || params.context_size == 0 {
            return Err(EngineError::ContextCreate(format!(
                "cannot allocate a context of {} tokens",
                params.context_size
            )));
        }

        let mut session = ScriptSession {
            info: SessionInfo {
                path: params.path.to_string_lossy().to_string(),
                vocab_size: FIRST_PIECE as usize + self.pieces.len(),
                context_size: params.context_size,
                max_batch: self.max_batch,
            },
            pieces: &self.pieces,
            step_delay: self.step_delay,
            fail_decode_at: self.fail_decode_at,
            stats: self.stats.as_ref(),
            filled: 0,
            step: 0,
            decode_calls: 0,
            logits: None,
            sampler: SamplerChain::new(SamplerParams::default()),
        };

        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        run(&mut session);
        self.stats.unloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct ScriptSession<'a> {
    info: SessionInfo,
    pieces: &'a [Vec<u8>],
    step_delay: Option<Duration>,
    fail_decode_at: Option<usize>,
    stats: &'a ScriptStats,
    filled: u32,
    /// Scripted pieces fed back so far
    step: usize,
    decode_calls: usize,
    logits: Option<Vec<f32>>,
    sampler: SamplerChain,
}

impl ScriptSession<'_> {
    fn piece_id(index: usize) -> TokenId {
        FIRST_PIECE + index as TokenId
    }

    fn next_token(&self) -> TokenId {
        if self.step < self.pieces.len() {
            Self::piece_id(self.step)
        } else {
            EOS
        }
    }

    fn evaluate(
        &mut self,
        tokens: &[TokenId],
        start: u32,
        want_logits: bool,
    ) -> Result<(), EngineError> {
        if tokens.is_empty() {
            return Err(EngineError::Eval("empty batch".to_string()));
        }
        if tokens.len() > self.info.max_batch as usize {
            return Err(EngineError::Eval(format!(
                "batch of {} exceeds maximum of {}",
                tokens.len(),
                self.info.max_batch
            )));
        }
        if start != self.filled {
            return Err(EngineError::Eval(format!(
                "batch starts at {start} but {} positions are filled",
                self.filled
            )));
        }
        let end = start as usize + tokens.len();
        if end > self.info.context_size as usize {
            return Err(EngineError::Eval(format!(
                "position {end} is past the context capacity {}",
                self.info.context_size
            )));
        }
        if self.fail_decode_at == Some(self.decode_calls) {
            return Err(EngineError::Eval("injected decode failure".to_string()));
        }

        for &token in tokens {
            if token == Self::piece_id(self.step) && self.step < self.pieces.len() {
                self.step += 1;
            }
        }
        self.filled = end as u32;

        self.logits = if want_logits {
            let mut logits = vec![0.0; self.info.vocab_size];
            logits[self.next_token() as usize] = 10.0;
            Some(logits)
        } else {
            None
        };
        Ok(())
    }
}

impl ModelSession for ScriptSession<'_> {
    fn info(&self) -> &SessionInfo {
        &self.info
    }

    fn tokenize(&self, text: &str) -> Result<Vec<TokenId>, EngineError> {
        Ok(text.bytes().map(|b| FIRST_BYTE + TokenId::from(b)).collect())
    }

    fn token_to_bytes(&self, token: TokenId) -> Result<Vec<u8>, EngineError> {
        match token {
            EOS => Ok(Vec::new()),
            t if (FIRST_BYTE..FIRST_PIECE).contains(&t) => Ok(vec![(t - FIRST_BYTE) as u8]),
            t if t >= FIRST_PIECE && ((t - FIRST_PIECE) as usize) < self.pieces.len() => {
                Ok(self.pieces[(t - FIRST_PIECE) as usize].clone())
            }
            t => Err(EngineError::Tokenization(format!("unknown token id {t}"))),
        }
    }

    fn is_end_of_sequence(&self, token: TokenId) -> bool {
        token == EOS
    }

    fn decode(
        &mut self,
        tokens: &[TokenId],
        start: u32,
        want_logits: bool,
    ) -> Result<(), EngineError> {
        let stats = self.stats;
        let running = stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        stats.max_in_flight.fetch_max(running, Ordering::SeqCst);
        stats.decodes.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut sizes) = stats.batch_sizes.lock() {
            sizes.push(tokens.len());
        }

        if let Some(delay) = self.step_delay {
            thread::sleep(delay);
        }
        let result = self.evaluate(tokens, start, want_logits);
        self.decode_calls += 1;

        stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn configure_sampler(&mut self, params: &SamplerParams) {
        self.stats.sampler_configs.fetch_add(1, Ordering::SeqCst);
        self.sampler = SamplerChain::new(*params);
    }

    fn sample(&mut self) -> Result<TokenId, EngineError> {
        let logits = self
            .logits
            .as_deref()
            .ok_or_else(|| EngineError::Sampling("no logits available".to_string()))?;
        self.sampler.sample(logits)
    }

    fn clear_sequence(&mut self) {
        self.filled = 0;
        self.step = 0;
        self.logits = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_session<R>(backend: &mut ScriptBackend, f: impl FnOnce(&mut dyn ModelSession) -> R) -> R {
        let mut f = Some(f);
        let mut out = None;
        backend
            .open(&LoadParams::new("script.gguf", 64), &mut |session| {
                if let Some(f) = f.take() {
                    out = Some(f(session));
                }
            })
            .unwrap();
        out.unwrap()
    }

    #[test]
    fn test_prompt_is_tokenized_per_byte() {
        let mut backend = ScriptBackend::new(["x"]);
        with_session(&mut backend, |session| {
            let tokens = session.tokenize("Hi").unwrap();
            assert_eq!(tokens, vec![1 + b'H' as TokenId, 1 + b'i' as TokenId]);
            assert_eq!(session.token_to_bytes(tokens[0]).unwrap(), b"H".to_vec());
        });
    }

    #[test]
    fn test_script_is_followed_then_eos() {
        let mut backend = ScriptBackend::new(["a", "b"]);
        with_session(&mut backend, |session| {
            let prompt = session.tokenize("p").unwrap();
            session.decode(&prompt, 0, true).unwrap();

            let first = session.sample().unwrap();
            assert_eq!(session.token_to_bytes(first).unwrap(), b"a".to_vec());
            session.decode(&[first], 1, true).unwrap();

            let second = session.sample().unwrap();
            assert_eq!(session.token_to_bytes(second).unwrap(), b"b".to_vec());
            session.decode(&[second], 2, true).unwrap();

            let last = session.sample().unwrap();
            assert!(session.is_end_of_sequence(last));
        });
    }

    #[test]
    fn test_decode_rejects_gaps_and_overflow() {
        let mut backend = ScriptBackend::new(["a"]).with_max_batch(2);
        with_session(&mut backend, |session| {
            assert!(session.decode(&[1, 2, 3], 0, false).is_err());
            assert!(session.decode(&[1], 5, false).is_err());
            session.decode(&[1, 2], 0, false).unwrap();
            assert!(session.sample().is_err());
            session.clear_sequence();
            session.decode(&[1], 0, true).unwrap();
            assert!(session.sample().is_ok());
        });
    }

    #[test]
    fn test_failure_injection() {
        let mut backend = ScriptBackend::new(["a"]).reject_weights();
        let err = backend
            .open(&LoadParams::new("m.gguf", 16), &mut |_| panic!("must not run"))
            .unwrap_err();
        assert!(matches!(err, EngineError::ModelLoad(_)));

        let mut backend = ScriptBackend::new(["a"]).reject_context();
        let err = backend
            .open(&LoadParams::new("m.gguf", 16), &mut |_| panic!("must not run"))
            .unwrap_err();
        assert!(matches!(err, EngineError::ContextCreate(_)));
        assert_eq!(backend.stats().loads(), 0);
    }

    #[test]
    fn test_stats_count_sessions() {
        let mut backend = ScriptBackend::new(["a"]).fail_decode_at(1);
        let stats = backend.stats();
        with_session(&mut backend, |session| {
            session.decode(&[1], 0, true).unwrap();
            assert!(session.decode(&[2], 1, true).is_err());
        });
        assert_eq!(stats.loads(), 1);
        assert_eq!(stats.unloads(), 1);
        assert_eq!(stats.decode_calls(), 2);
        assert_eq!(stats.max_concurrent_decodes(), 1);
        assert_eq!(stats.batch_sizes(), vec![1, 1]);
    }
}

//! Token sampling
//!
//! [`SamplerChain`] turns the logits of the last evaluated position into the
//! next token. The stages always run in the same order:
//!
//! 1. top-k restriction
//! 2. top-p (nucleus) restriction
//! 3. temperature rescaling
//! 4. repetition / frequency / presence penalties
//! 5. greedy (arg-max) choice
//!
//! The final choice is deterministic: identical logits and history always give
//! the same token.
//!
//! The llama.cpp backend builds the same pipeline out of native samplers; this
//! chain backs the in-memory backend.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::inference::backend::TokenId;
use crate::inference::engine::EngineError;

/// Generation-shaping parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SamplerParams {
    /// Temperature for logit rescaling (0.0 = keep only the best token)
    pub temperature: f32,
    /// Top-k restriction (0 = disabled)
    pub top_k: u32,
    /// Top-p (nucleus) restriction (1.0 = disabled)
    pub top_p: f32,
    /// Repetition penalty (1.0 = disabled)
    pub repeat_penalty: f32,
    /// Flat penalty for any token already generated
    pub presence_penalty: f32,
    /// Penalty scaled by how often a token was already generated
    pub frequency_penalty: f32,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.9,
            repeat_penalty: 1.1,
            presence_penalty: 0.0,
            frequency_penalty: 0.0,
        }
    }
}

impl SamplerParams {
    /// Clamps every field into its legal range.
    pub fn sanitized(self) -> Self {
        let finite_or = |value: f32, fallback: f32| {
            if value.is_finite() {
                value
            } else {
                fallback
            }
        };
        Self {
            temperature: finite_or(self.temperature, 0.0).max(0.0),
            top_k: self.top_k,
            top_p: finite_or(self.top_p, 1.0).clamp(0.0, 1.0),
            repeat_penalty: finite_or(self.repeat_penalty, 1.0).max(0.0),
            presence_penalty: finite_or(self.presence_penalty, 0.0),
            frequency_penalty: finite_or(self.frequency_penalty, 0.0),
        }
    }
}

/// One step of the pipeline
#[derive(Debug, Clone, Copy, PartialEq)]
enum SamplerStage {
    TopK(u32),
    TopP(f32),
    Temperature(f32),
    Penalties {
        repeat: f32,
        frequency: f32,
        presence: f32,
    },
    Greedy,
}

/// A token still in the running, with its (possibly adjusted) logit
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    token: TokenId,
    logit: f32,
}

/// Higher logit first, lower token id on ties.
fn by_rank(a: &Candidate, b: &Candidate) -> Ordering {
    b.logit.total_cmp(&a.logit).then(a.token.cmp(&b.token))
}

fn top_k(candidates: &mut Vec<Candidate>, k: u32) {
    let k = k as usize;
    if k == 0 || k >= candidates.len() {
        return;
    }
    candidates.select_nth_unstable_by(k - 1, by_rank);
    candidates.truncate(k);
    candidates.sort_by(by_rank);
}

fn top_p(candidates: &mut Vec<Candidate>, p: f32) {
    if p >= 1.0 || candidates.len() <= 1 {
        return;
    }
    candidates.sort_by(by_rank);

    let max = candidates[0].logit;
    let weights: Vec<f32> = candidates.iter().map(|c| (c.logit - max).exp()).collect();
    let total: f32 = weights.iter().sum();

    let mut cumulative = 0.0;
    let mut keep = candidates.len();
    for (i, weight) in weights.iter().enumerate() {
        cumulative += weight / total;
        if cumulative >= p {
            keep = i + 1;
            break;
        }
    }
    candidates.truncate(keep.max(1));
}

fn temperature(candidates: &mut Vec<Candidate>, t: f32) {
    if t <= 0.0 {
        if let Some(best) = candidates.iter().copied().min_by(by_rank) {
            candidates.clear();
            candidates.push(best);
        }
        return;
    }
    for candidate in candidates.iter_mut() {
        candidate.logit /= t;
    }
}

fn penalties(
    candidates: &mut [Candidate],
    counts: &HashMap<TokenId, u32>,
    repeat: f32,
    frequency: f32,
    presence: f32,
) {
    if counts.is_empty() || (repeat == 1.0 && frequency == 0.0 && presence == 0.0) {
        return;
    }
    for candidate in candidates.iter_mut() {
        let Some(&count) = counts.get(&candidate.token) else {
            continue;
        };
        if candidate.logit <= 0.0 {
            candidate.logit *= repeat;
        } else {
            candidate.logit /= repeat;
        }
        candidate.logit -= count as f32 * frequency + presence;
    }
}

fn greedy(candidates: &mut Vec<Candidate>) {
    if let Some(best) = candidates.iter().copied().min_by(by_rank) {
        candidates.clear();
        candidates.push(best);
    }
}

/// The configured sampling pipeline plus the token history penalties need.
#[derive(Debug, Clone)]
pub struct SamplerChain {
    stages: [SamplerStage; 5],
    counts: HashMap<TokenId, u32>,
}

impl SamplerChain {
    pub fn new(params: SamplerParams) -> Self {
        let params = params.sanitized();
        Self {
            stages: [
                SamplerStage::TopK(params.top_k),
                SamplerStage::TopP(params.top_p),
                SamplerStage::Temperature(params.temperature),
                SamplerStage::Penalties {
                    repeat: params.repeat_penalty,
                    frequency: params.frequency_penalty,
                    presence: params.presence_penalty,
                },
                SamplerStage::Greedy,
            ],
            counts: HashMap::new(),
        }
    }

    /// Records `token` as generated, for the penalty stage.
    pub fn accept(&mut self, token: TokenId) {
        *self.counts.entry(token).or_insert(0) += 1;
    }

    /// Runs the pipeline over `logits` (indexed by token id), records the
    /// choice and returns it.
    pub fn sample(&mut self, logits: &[f32]) -> Result<TokenId, EngineError> {
        let mut candidates: Vec<Candidate> = logits
            .iter()
            .enumerate()
            .filter(|(_, logit)| !logit.is_nan())
            .map(|(i, &logit)| Candidate {
                token: i as TokenId,
                logit,
            })
            .collect();

        for stage in &self.stages {
            match *stage {
                SamplerStage::TopK(k) => top_k(&mut candidates, k),
                SamplerStage::TopP(p) => top_p(&mut candidates, p),
                SamplerStage::Temperature(t) => temperature(&mut candidates, t),
                SamplerStage::Penalties {
                    repeat,
                    frequency,
                    presence,
                } => penalties(&mut candidates, &self.counts, repeat, frequency, presence),
                SamplerStage::Greedy => greedy(&mut candidates),
            }
        }

        let token = candidates
            .first()
            .map(|c| c.token)
            .ok_or_else(|| EngineError::Sampling("no candidate tokens".to_string()))?;
        self.accept(token);
        Ok(token)
    }
}

/// Sampler parameters shared between the facade and a running generation.
///
/// Every update bumps a revision; the generation loop compares revisions before
/// each token and reconfigures its sampler when they differ.
#[derive(Debug, Default)]
pub(crate) struct SamplerSettings {
    inner: Mutex<(u64, SamplerParams)>,
}

impl SamplerSettings {
    pub(crate) fn update(&self, apply: impl FnOnce(&mut SamplerParams)) -> SamplerParams {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let (revision, params) = &mut *guard;
        apply(params);
        *params = params.sanitized();
        *revision += 1;
        *params
    }

    pub(crate) fn snapshot(&self) -> (u64, SamplerParams) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the current parameters if they changed since revision `seen`.
    pub(crate) fn refresh(&self, seen: &mut u64) -> Option<SamplerParams> {
        let (revision, params) = self.snapshot();
        if revision == *seen {
            return None;
        }
        *seen = revision;
        tracing::debug!("Sampler parameters changed: {:?}", params);
        Some(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(logits: &[f32]) -> Vec<Candidate> {
        logits
            .iter()
            .enumerate()
            .map(|(i, &logit)| Candidate {
                token: i as TokenId,
                logit,
            })
            .collect()
    }

    fn tokens(candidates: &[Candidate]) -> Vec<TokenId> {
        candidates.iter().map(|c| c.token).collect()
    }

    #[test]
    fn test_sampler_params_default() {
        let params = SamplerParams::default();
        assert!((params.temperature - 0.8).abs() < 0.001);
        assert_eq!(params.top_k, 40);
        assert!((params.top_p - 0.9).abs() < 0.001);
        assert!((params.repeat_penalty - 1.1).abs() < 0.001);
    }

    #[test]
    fn test_sanitized_clamps_ranges() {
        let params = SamplerParams {
            temperature: -1.0,
            top_p: 1.5,
            repeat_penalty: f32::NAN,
            ..SamplerParams::default()
        }
        .sanitized();
        assert_eq!(params.temperature, 0.0);
        assert_eq!(params.top_p, 1.0);
        assert_eq!(params.repeat_penalty, 1.0);
    }

    #[test]
    fn test_stage_order_is_fixed() {
        let chain = SamplerChain::new(SamplerParams::default());
        let kinds: Vec<&str> = chain
            .stages
            .iter()
            .map(|stage| match stage {
                SamplerStage::TopK(_) => "top_k",
                SamplerStage::TopP(_) => "top_p",
                SamplerStage::Temperature(_) => "temperature",
                SamplerStage::Penalties { .. } => "penalties",
                SamplerStage::Greedy => "greedy",
            })
            .collect();
        assert_eq!(kinds, ["top_k", "top_p", "temperature", "penalties", "greedy"]);
    }

    #[test]
    fn test_top_k_keeps_best_sorted() {
        let mut c = candidates(&[0.1, 3.0, 2.0, 5.0]);
        top_k(&mut c, 2);
        assert_eq!(tokens(&c), vec![3, 1]);

        let mut c = candidates(&[0.1, 3.0]);
        top_k(&mut c, 0);
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_top_p_keeps_smallest_nucleus() {
        // softmax of [ln 6, ln 3, ln 1] = [0.6, 0.3, 0.1]
        let mut c = candidates(&[6f32.ln(), 3f32.ln(), 0.0]);
        top_p(&mut c, 0.85);
        assert_eq!(tokens(&c), vec![0, 1]);

        let mut c = candidates(&[6f32.ln(), 3f32.ln(), 0.0]);
        top_p(&mut c, 0.0);
        assert_eq!(tokens(&c), vec![0]);
    }

    #[test]
    fn test_zero_temperature_keeps_only_best() {
        let mut c = candidates(&[1.0, 4.0, 4.0, 2.0]);
        temperature(&mut c, 0.0);
        assert_eq!(tokens(&c), vec![1]);
    }

    #[test]
    fn test_greedy_is_deterministic() {
        let logits = [0.5, 2.5, -1.0, 2.4];
        let mut a = SamplerChain::new(SamplerParams::default());
        let mut b = SamplerChain::new(SamplerParams::default());
        assert_eq!(a.sample(&logits).unwrap(), 1);
        assert_eq!(b.sample(&logits).unwrap(), 1);
    }

    #[test]
    fn test_repeat_penalty_changes_choice() {
        let params = SamplerParams {
            repeat_penalty: 1.5,
            ..SamplerParams::default()
        };
        let mut chain = SamplerChain::new(params);
        let logits = [2.0, 1.9, 0.0];

        assert_eq!(chain.sample(&logits).unwrap(), 0);
        // 2.0 / 1.5 < 1.9 once token 0 has been generated
        assert_eq!(chain.sample(&logits).unwrap(), 1);

        let mut fresh = SamplerChain::new(params);
        assert_eq!(fresh.sample(&logits).unwrap(), 0);
    }

    #[test]
    fn test_frequency_and_presence_penalties() {
        let params = SamplerParams {
            temperature: 1.0,
            repeat_penalty: 1.0,
            frequency_penalty: 0.5,
            presence_penalty: 0.25,
            ..SamplerParams::default()
        };
        let mut chain = SamplerChain::new(params);
        chain.accept(0);
        chain.accept(0);

        // 3.0 - (2 * 0.5 + 0.25) = 1.75 < 2.0
        assert_eq!(chain.sample(&[3.0, 2.0]).unwrap(), 1);
    }

    #[test]
    fn test_penalties_cannot_reach_past_top_k() {
        let params = SamplerParams {
            top_k: 1,
            repeat_penalty: 100.0,
            ..SamplerParams::default()
        };
        let mut chain = SamplerChain::new(params);
        chain.accept(0);
        assert_eq!(chain.sample(&[5.0, 4.9]).unwrap(), 0);
    }

    #[test]
    fn test_sample_rejects_empty_logits() {
        let mut chain = SamplerChain::new(SamplerParams::default());
        assert!(matches!(chain.sample(&[]), Err(EngineError::Sampling(_))));
        assert!(matches!(
            chain.sample(&[f32::NAN]),
            Err(EngineError::Sampling(_))
        ));
    }

    #[test]
    fn test_settings_refresh_tracks_revision() {
        let settings = SamplerSettings::default();
        let mut seen = settings.snapshot().0;
        assert_eq!(settings.refresh(&mut seen), None);

        settings.update(|p| p.top_k = 7);
        let changed = settings.refresh(&mut seen).unwrap();
        assert_eq!(changed.top_k, 7);
        assert_eq!(seen, 1);

        assert_eq!(settings.refresh(&mut seen), None);
        assert_eq!(seen, 1);
    }
}

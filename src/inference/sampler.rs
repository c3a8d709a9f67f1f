//! Token sampling over backend logits.
//!
//! Greedy at temperature 0, otherwise temperature-scaled softmax followed by
//! nucleus (top-p) truncation.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::inference::backend::TokenId;

/// Below this temperature sampling is greedy.
const GREEDY_EPSILON: f32 = 1e-5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerParams {
    pub temperature: f32,
    pub top_p: f32,
    pub seed: Option<u64>,
}

pub struct Sampler {
    params: SamplerParams,
    rng: StdRng,
    candidates: Vec<(TokenId, f32)>,
}

impl Sampler {
    pub fn new(params: SamplerParams) -> Self {
        let rng = match params.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            params,
            rng,
            candidates: Vec::new(),
        }
    }

    /// Pick the next token. `None` if the logits are empty.
    pub fn sample(&mut self, logits: &[f32]) -> Option<TokenId> {
        if logits.is_empty() {
            return None;
        }
        if self.params.temperature <= GREEDY_EPSILON {
            return greedy(logits);
        }

        let temperature = self.params.temperature;
        self.candidates.clear();
        self.candidates.extend(
            logits
                .iter()
                .enumerate()
                .filter(|(_, l)| l.is_finite())
                .map(|(i, &l)| (i as TokenId, l / temperature)),
        );
        if self.candidates.is_empty() {
            return None;
        }
        self.candidates.sort_by(|a, b| b.1.total_cmp(&a.1));

        // Softmax, shifted by the max logit for stability.
        let max = self.candidates[0].1;
        let mut total = 0.0f32;
        for c in self.candidates.iter_mut() {
            c.1 = (c.1 - max).exp();
            total += c.1;
        }

        // Nucleus: smallest prefix whose mass reaches top_p. Always keeps one.
        let top_p = self.params.top_p.clamp(0.0, 1.0);
        let mut kept = 0;
        let mut mass = 0.0f32;
        for c in self.candidates.iter() {
            kept += 1;
            mass += c.1 / total;
            if mass >= top_p {
                break;
            }
        }
        self.candidates.truncate(kept);

        let kept_total: f32 = self.candidates.iter().map(|c| c.1).sum();
        let mut target = self.rng.gen::<f32>() * kept_total;
        for &(token, weight) in self.candidates.iter() {
            if target < weight {
                return Some(token);
            }
            target -= weight;
        }
        self.candidates.last().map(|c| c.0)
    }
}

fn greedy(logits: &[f32]) -> Option<TokenId> {
    logits
        .iter()
        .enumerate()
        .filter(|(_, l)| !l.is_nan())
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i as TokenId)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(temperature: f32, top_p: f32) -> SamplerParams {
        SamplerParams {
            temperature,
            top_p,
            seed: Some(42),
        }
    }

    #[test]
    fn test_greedy_picks_argmax() {
        let mut sampler = Sampler::new(params(0.0, 1.0));
        assert_eq!(sampler.sample(&[0.1, 2.0, -1.0, 1.9]), Some(1));
        assert_eq!(sampler.sample(&[]), None);
    }

    #[test]
    fn test_dominant_logit_wins_with_temperature() {
        let mut sampler = Sampler::new(params(0.7, 0.95));
        let mut logits = vec![0.0f32; 2048];
        logits[17] = 30.0;
        for _ in 0..100 {
            assert_eq!(sampler.sample(&logits), Some(17));
        }
    }

    #[test]
    fn test_top_p_limits_candidates() {
        // Token 0 holds almost all the mass; a tight nucleus keeps only it.
        let mut sampler = Sampler::new(params(1.0, 0.5));
        let logits = [5.0f32, 0.0, 0.0, 0.0];
        for _ in 0..200 {
            assert_eq!(sampler.sample(&logits), Some(0));
        }
    }

    #[test]
    fn test_seed_is_deterministic() {
        let logits = [1.0f32, 1.0, 1.0, 1.0, 1.0, 1.0];
        let mut a = Sampler::new(params(1.0, 1.0));
        let mut b = Sampler::new(params(1.0, 1.0));
        let seq_a: Vec<_> = (0..32).map(|_| a.sample(&logits)).collect();
        let seq_b: Vec<_> = (0..32).map(|_| b.sample(&logits)).collect();
        assert_eq!(seq_a, seq_b);
        assert!(seq_a.iter().all(|t| matches!(t, Some(0..=5))));
    }

    #[test]
    fn test_non_finite_logits_are_skipped() {
        let mut sampler = Sampler::new(params(0.8, 1.0));
        let logits = [f32::NAN, f32::NEG_INFINITY, 3.0];
        assert_eq!(sampler.sample(&logits), Some(2));
    }
}

//! Next-token selection for generation loops built on top of [`crate::DecodeDriver`].

use std::{cmp::Ordering, collections::HashSet};

use anyhow::{Context, Result, ensure};
use candle_core::{DType, Tensor};
use rand::{
    SeedableRng,
    distributions::{Distribution, WeightedIndex},
    rngs::StdRng,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub do_sample: bool,
    pub temperature: f64,
    pub top_p: Option<f64>,
    pub top_k: Option<usize>,
    pub repetition_penalty: f32,
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            do_sample: false,
            temperature: 1.0,
            top_p: None,
            top_k: None,
            repetition_penalty: 1.0,
            seed: None,
        }
    }
}

pub fn init_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(value) => StdRng::seed_from_u64(value),
        None => StdRng::from_entropy(),
    }
}

/// Pick a token from a `[vocab]` logits row. Greedy unless sampling is enabled with a
/// positive temperature.
pub fn select_token_id(
    logits: &Tensor,
    params: &SamplingParams,
    context: &[i64],
    rng: &mut StdRng,
) -> Result<i64> {
    let mut scores = logits
        .to_dtype(DType::F32)?
        .to_vec1::<f32>()
        .context("logits row must be one-dimensional")?;
    ensure!(!scores.is_empty(), "logits row is empty");
    apply_repetition_penalty(&mut scores, context, params.repetition_penalty);

    if params.do_sample && params.temperature > 0.0 {
        let mut scaled: Vec<f64> = scores
            .iter()
            .map(|&v| v as f64 / params.temperature)
            .collect();
        if let Some(k) = params.top_k.filter(|&k| k > 0) {
            keep_top_k(&mut scaled, k);
        }
        if let Some(p) = params.top_p.filter(|p| (0.0..1.0).contains(p)) {
            keep_top_p(&mut scaled, p);
        }
        if let Some(sampled) = sample(&scaled, rng) {
            return Ok(sampled as i64);
        }
    }
    argmax(&scores)
        .map(|idx| idx as i64)
        .context("logits contain no finite value")
}

fn argmax(values: &[f32]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| v.is_finite())
        .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(Ordering::Equal))
        .map(|(idx, _)| idx)
}

fn apply_repetition_penalty(scores: &mut [f32], context: &[i64], penalty: f32) {
    if penalty <= 0.0 || (penalty - 1.0).abs() <= f32::EPSILON {
        return;
    }
    let mut seen = HashSet::new();
    for index in context.iter().filter_map(|&t| usize::try_from(t).ok()) {
        if index < scores.len() && seen.insert(index) {
            let score = &mut scores[index];
            if *score > 0.0 {
                *score /= penalty;
            } else {
                *score *= penalty;
            }
        }
    }
}

fn ranked(logits: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..logits.len())
        .filter(|&idx| logits[idx].is_finite())
        .collect();
    order.sort_by(|&a, &b| logits[b].partial_cmp(&logits[a]).unwrap_or(Ordering::Equal));
    order
}

fn keep_top_k(logits: &mut [f64], k: usize) {
    for idx in ranked(logits).into_iter().skip(k) {
        logits[idx] = f64::NEG_INFINITY;
    }
}

fn keep_top_p(logits: &mut [f64], top_p: f64) {
    let order = ranked(logits);
    let Some(&best) = order.first() else {
        return;
    };
    let max_logit = logits[best];
    let weights: Vec<f64> = order.iter().map(|&idx| (logits[idx] - max_logit).exp()).collect();
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return;
    }
    let mut cumulative = 0.0;
    let mut keep = order.len();
    for (rank, weight) in weights.iter().enumerate() {
        cumulative += weight / total;
        if cumulative > top_p {
            keep = rank + 1;
            break;
        }
    }
    for &idx in &order[keep..] {
        logits[idx] = f64::NEG_INFINITY;
    }
}

fn sample(logits: &[f64], rng: &mut StdRng) -> Option<usize> {
    let candidates = ranked(logits);
    let max_logit = logits[*candidates.first()?];
    let weights: Vec<f64> = candidates
        .iter()
        .map(|&idx| (logits[idx] - max_logit).exp())
        .collect();
    let dist = WeightedIndex::new(&weights).ok()?;
    candidates.get(dist.sample(rng)).copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn row(values: &[f32]) -> Result<Tensor> {
        Ok(Tensor::new(values, &Device::Cpu)?)
    }

    #[test]
    fn greedy_selection_takes_the_largest_logit() -> Result<()> {
        let mut rng = init_rng(Some(0));
        let logits = row(&[0.1, 3.0, -1.0])?;
        let id = select_token_id(&logits, &SamplingParams::default(), &[], &mut rng)?;
        assert_eq!(id, 1);
        Ok(())
    }

    #[test]
    fn repetition_penalty_demotes_seen_tokens() -> Result<()> {
        let mut rng = init_rng(Some(0));
        let params = SamplingParams {
            repetition_penalty: 4.0,
            ..SamplingParams::default()
        };
        let id = select_token_id(&row(&[2.0, 3.0])?, &params, &[1], &mut rng)?;
        assert_eq!(id, 0);
        Ok(())
    }

    #[test]
    fn top_k_of_one_makes_sampling_deterministic() -> Result<()> {
        let mut rng = init_rng(Some(7));
        let params = SamplingParams {
            do_sample: true,
            temperature: 0.8,
            top_k: Some(1),
            ..SamplingParams::default()
        };
        for _ in 0..8 {
            assert_eq!(select_token_id(&row(&[1.0, 0.5, 2.5, 2.4])?, &params, &[], &mut rng)?, 2);
        }
        Ok(())
    }
}

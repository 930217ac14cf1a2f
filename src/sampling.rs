//! Token sampling and sequence scoring.

use std::collections::HashMap;

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use serde::Serialize;

use crate::vocab::Token;

/// One sampled token with its distribution context.
///
/// `tid` is the most probable timestamp token of the same distribution
/// (the forced timestamp), `pt`/`ptsum` its probability and the summed
/// timestamp probability mass. `t0`/`t1` are filled by token-level
/// timestamp estimation, in centiseconds; `vlen` is the voice-length
/// heuristic used there.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TokenData {
    pub id: Token,
    pub tid: Token,
    pub p: f32,
    pub plog: f32,
    pub pt: f32,
    pub ptsum: f32,
    pub t0: i64,
    pub t1: i64,
    pub vlen: f32,
}

impl Default for TokenData {
    fn default() -> Self {
        Self {
            id: 0,
            tid: 0,
            p: 0.0,
            plog: 0.0,
            pt: 0.0,
            ptsum: 0.0,
            t0: -1,
            t1: -1,
            vlen: 0.0,
        }
    }
}

/// A decoder's generated sequence. Tokens up to `result_len` are the
/// committed prefix (everything before the last timestamp pair).
#[derive(Debug, Clone, Default)]
pub(crate) struct Sequence {
    pub tokens: Vec<TokenData>,
    pub result_len: usize,
    pub sum_logprobs_all: f64,
    pub sum_logprobs: f64,
    pub avg_logprobs: f64,
    pub entropy: f64,
    pub score: f64,
}

impl Sequence {
    pub fn reset(&mut self) {
        self.tokens.clear();
        self.result_len = 0;
        self.sum_logprobs_all = 0.0;
        self.sum_logprobs = f64::NEG_INFINITY;
        self.avg_logprobs = f64::NEG_INFINITY;
        self.entropy = 0.0;
        self.score = f64::NEG_INFINITY;
    }
}

/// The timestamp summary shared by every candidate drawn from one
/// distribution: most probable timestamp id, its normalized probability
/// and the total timestamp mass.
fn timestamp_stats(probs: &[f32], token_beg: Token) -> (Token, f32, f32) {
    let mut sum_ts = 0.0f64;
    let mut max_ts = 0.0f64;
    let mut tid = token_beg;

    for (i, &p) in probs.iter().enumerate().skip(token_beg as usize) {
        sum_ts += f64::from(p);
        if max_ts < f64::from(p) {
            max_ts = f64::from(p);
            tid = i as Token;
        }
    }

    (tid, (max_ts / (sum_ts + 1e-10)) as f32, sum_ts as f32)
}

/// Sample one token: the arg-max when `best`, otherwise a draw from the
/// categorical distribution over `probs`.
pub(crate) fn sample_token(
    probs: &[f32],
    logprobs: &[f32],
    token_beg: Token,
    best: bool,
    rng: &mut StdRng,
) -> TokenData {
    let (tid, pt, ptsum) = timestamp_stats(probs, token_beg);
    let mut result = TokenData {
        tid,
        pt,
        ptsum,
        ..TokenData::default()
    };

    if best {
        for (i, &p) in probs.iter().enumerate() {
            if result.p < p {
                result.id = i as Token;
                result.p = p;
                result.plog = logprobs[i];
            }
        }
    } else {
        match WeightedIndex::new(probs.iter().copied()) {
            Ok(dist) => {
                let id = dist.sample(rng);
                result.id = id as Token;
                result.p = probs[id];
                result.plog = logprobs[id];
            }
            Err(_) => {
                // degenerate distribution, fall back to the arg-max
                return sample_token(probs, logprobs, token_beg, true, rng);
            }
        }
    }

    if result.id >= token_beg {
        result.tid = result.id;
        result.pt = result.p;
    }

    result
}

/// The `k` highest-logit tokens, sharing one timestamp tie-breaker.
pub(crate) fn sample_token_topk(
    logits: &[f32],
    probs: &[f32],
    logprobs: &[f32],
    token_beg: Token,
    k: usize,
) -> Vec<TokenData> {
    let mut logits_id: Vec<(f32, usize)> = logits.iter().enumerate().map(|(i, &l)| (l, i)).collect();
    let k = k.min(logits_id.len());
    logits_id.select_nth_unstable_by(k.saturating_sub(1), |a, b| b.0.total_cmp(&a.0));
    logits_id.truncate(k);
    logits_id.sort_unstable_by(|a, b| b.0.total_cmp(&a.0));

    let (tid, pt, ptsum) = timestamp_stats(probs, token_beg);

    logits_id
        .into_iter()
        .map(|(_, id)| {
            let mut data = TokenData {
                id: id as Token,
                tid,
                p: probs[id],
                plog: logprobs[id],
                pt,
                ptsum,
                ..TokenData::default()
            };
            if data.id >= token_beg {
                data.tid = data.id;
                data.pt = data.p;
            }
            data
        })
        .collect()
}

/// Score a finished sequence: length-penalized sum of log-probs plus the
/// token entropy of the last 32 committed tokens.
pub(crate) fn sequence_score(sequence: &mut Sequence, length_penalty: f32) {
    if sequence.result_len == 0 {
        return;
    }

    let result: f64 = sequence.tokens[..sequence.result_len]
        .iter()
        .map(|t| f64::from(t.plog))
        .sum();

    sequence.sum_logprobs = result;
    sequence.avg_logprobs = result / sequence.result_len as f64;

    let penalty = if length_penalty > 0.0 {
        ((5.0 + sequence.result_len as f64) / 6.0).powf(f64::from(length_penalty))
    } else {
        sequence.result_len as f64
    };
    sequence.score = result / penalty;

    let n = 32usize;
    let start = sequence.result_len.saturating_sub(n);
    let mut counts: HashMap<Token, usize> = HashMap::new();
    for t in &sequence.tokens[start..sequence.result_len] {
        *counts.entry(t.id).or_insert(0) += 1;
    }
    let cnt = (sequence.result_len - start) as f64;
    sequence.entropy = counts
        .values()
        .map(|&c| {
            let p = c as f64 / cnt;
            -p * p.ln()
        })
        .sum();
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;

    use super::*;

    fn dist(n: usize, peak: usize) -> (Vec<f32>, Vec<f32>) {
        let mut logits = vec![0.0f32; n];
        logits[peak] = 8.0;
        let mut logprobs = logits.clone();
        crate::ops::log_softmax(&mut logprobs);
        let probs: Vec<f32> = logprobs.iter().map(|l| l.exp()).collect();
        (probs, logprobs)
    }

    #[test]
    fn greedy_picks_argmax() {
        let (probs, logprobs) = dist(16, 5);
        let mut rng = StdRng::seed_from_u64(0);
        let t = sample_token(&probs, &logprobs, 8, true, &mut rng);
        assert_eq!(t.id, 5);
        assert!((t.p - probs[5]).abs() < 1e-6);
    }

    #[test]
    fn timestamp_token_forces_tid() {
        let (probs, logprobs) = dist(16, 12);
        let mut rng = StdRng::seed_from_u64(0);
        let t = sample_token(&probs, &logprobs, 8, true, &mut rng);
        assert_eq!(t.id, 12);
        assert_eq!(t.tid, 12);
        assert!((t.pt - t.p).abs() < 1e-6);
    }

    #[test]
    fn stochastic_is_reproducible() {
        let (probs, logprobs) = dist(16, 3);
        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        let ta = sample_token(&probs, &logprobs, 8, false, &mut a);
        let tb = sample_token(&probs, &logprobs, 8, false, &mut b);
        assert_eq!(ta.id, tb.id);
    }

    #[test]
    fn topk_is_sorted_by_logit() {
        let mut logits = vec![0.0f32; 16];
        logits[2] = 3.0;
        logits[9] = 5.0;
        logits[14] = 4.0;
        let mut logprobs = logits.clone();
        crate::ops::log_softmax(&mut logprobs);
        let probs: Vec<f32> = logprobs.iter().map(|l| l.exp()).collect();

        let top = sample_token_topk(&logits, &probs, &logprobs, 8, 3);
        let ids: Vec<u32> = top.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![9, 14, 2]);
    }

    #[test]
    fn repeating_tokens_have_low_entropy() {
        let mut seq = Sequence::default();
        for i in 0..40 {
            seq.tokens.push(TokenData {
                id: (i % 2) as Token,
                plog: -0.1,
                ..TokenData::default()
            });
        }
        seq.result_len = seq.tokens.len();
        sequence_score(&mut seq, -1.0);
        // two symbols alternating: entropy = ln 2
        assert!(seq.entropy < 2.4);
        assert!((seq.entropy - (2f64).ln()).abs() < 1e-9);
        assert!((seq.avg_logprobs - -0.1).abs() < 1e-6);
    }

    #[test]
    fn diverse_tokens_have_high_entropy() {
        let mut seq = Sequence::default();
        for i in 0..32 {
            seq.tokens.push(TokenData {
                id: i as Token,
                plog: -0.5,
                ..TokenData::default()
            });
        }
        seq.result_len = seq.tokens.len();
        sequence_score(&mut seq, -1.0);
        assert!((seq.entropy - (32f64).ln()).abs() < 1e-9);
        assert!(seq.entropy > 2.4);
    }

    #[test]
    fn positive_length_penalty_divides_by_power() {
        let mut seq = Sequence::default();
        for _ in 0..10 {
            seq.tokens.push(TokenData {
                id: 1,
                plog: -1.0,
                ..TokenData::default()
            });
        }
        seq.result_len = 10;
        sequence_score(&mut seq, 1.0);
        let expected = -10.0 / ((5.0 + 10.0) / 6.0);
        assert!((seq.score - expected).abs() < 1e-9);
    }
}

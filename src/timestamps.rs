//! Token-level timestamp estimation and segment re-wrapping.
//!
//! Timestamp-token anchors (gated by probability thresholds) pin down
//! token boundaries; the gaps are interpolated proportionally to a
//! voice-length heuristic and finally snapped to the signal energy.

use tracing::debug;

use crate::context::Context;
use crate::state::{Segment, State};
use crate::SAMPLE_RATE;

/// Moving average of the absolute signal over `2 * half_window + 1`
/// samples, used as a crude voice-activity measure.
pub(crate) fn get_signal_energy(signal: &[f32], half_window: usize) -> Vec<f32> {
    let n = signal.len();
    let hw = half_window as isize;
    let mut result = Vec::with_capacity(n);
    for i in 0..n as isize {
        let mut sum = 0.0f32;
        for j in -hw..=hw {
            if i + j >= 0 && i + j < n as isize {
                sum += signal[(i + j) as usize].abs();
            }
        }
        result.push(sum / (2 * half_window + 1) as f32);
    }
    result
}

/// How much "speaking time" a token plausibly takes.
pub(crate) fn voice_length(text: &str) -> f32 {
    let mut res = 0.0f32;
    for c in text.chars() {
        res += match c {
            ' ' => 0.01,
            ',' => 2.0,
            '.' | '!' | '?' => 3.0,
            '0'..='9' => 3.0,
            _ => 1.0,
        };
    }
    res
}

fn timestamp_to_sample(t: i64, n_samples: usize) -> usize {
    ((t * SAMPLE_RATE as i64 / 100).max(0) as usize).min(n_samples.saturating_sub(1))
}

fn sample_to_timestamp(i: usize) -> i64 {
    (100 * i / SAMPLE_RATE) as i64
}

/// Estimate per-token `t0`/`t1` for segment `i_segment`.
pub(crate) fn compute_token_level_timestamps(
    ctx: &Context,
    state: &mut State,
    i_segment: usize,
    thold_pt: f32,
    thold_ptsum: f32,
) {
    let n_samples = state.energy.len();
    if n_samples == 0 {
        debug!("no signal data available for token-level timestamps");
        return;
    }

    let token_beg = ctx.vocab.token_beg;
    let token_eot = ctx.vocab.token_eot;

    let segment = &mut state.result_all[i_segment];
    let t0 = segment.t0;
    let t1 = segment.t1;
    let n = segment.tokens.len();

    if n == 0 {
        return;
    }
    if n == 1 {
        segment.tokens[0].t0 = t0;
        segment.tokens[0].t1 = t1;
        return;
    }

    let tokens = &mut segment.tokens;

    // anchor pass: trust confident, advancing timestamp predictions
    for j in 0..n {
        if j == 0 {
            if tokens[0].id == token_beg {
                tokens[0].t0 = t0;
                tokens[0].t1 = t0;
                tokens[1].t0 = t0;
                state.t_beg = t0;
                state.t_last = t0;
                state.tid_last = token_beg;
            } else {
                tokens[0].t0 = state.t_last;
            }
        }

        let token = tokens[j];
        let tt = state.t_beg + 2 * i64::from(token.tid.saturating_sub(token_beg));

        tokens[j].vlen = voice_length(&ctx.token_text(token.id));

        if token.pt > thold_pt && token.ptsum > thold_ptsum && token.tid > state.tid_last && tt <= t1
        {
            if j > 0 {
                tokens[j - 1].t1 = tt;
            }
            tokens[j].t0 = tt;
            state.tid_last = token.tid;
        }
    }

    tokens[n - 2].t1 = t1;
    tokens[n - 1].t0 = t1;
    tokens[n - 1].t1 = t1;
    state.t_last = t1;

    // interpolate unknown stretches proportionally to the voice length
    {
        let mut p0 = 0usize;
        let mut p1 = 0usize;
        loop {
            while p1 < n && tokens[p1].t1 < 0 {
                p1 += 1;
            }
            if p1 >= n {
                p1 = n - 1;
            }
            if p1 > p0 {
                let psum: f64 = tokens[p0..=p1].iter().map(|t| f64::from(t.vlen)).sum();
                let dt = (tokens[p1].t1 - tokens[p0].t0) as f64;
                if psum > 0.0 {
                    for j in p0 + 1..=p1 {
                        let ct = tokens[j - 1].t0 as f64 + dt * f64::from(tokens[j - 1].vlen) / psum;
                        tokens[j - 1].t1 = ct as i64;
                        tokens[j].t0 = ct as i64;
                    }
                }
            }
            p1 += 1;
            p0 = p1;
            if p1 >= n {
                break;
            }
        }
    }

    // fix up any stragglers and keep the sequence monotonic
    for j in 0..n - 1 {
        if tokens[j].t1 < 0 {
            tokens[j].t1 = tokens[j + 1].t0;
        }
        if j > 0 && tokens[j - 1].t1 > tokens[j].t0 {
            tokens[j].t0 = tokens[j - 1].t1;
            tokens[j].t1 = tokens[j].t1.max(tokens[j].t0);
        }
    }

    // VAD-like expansion: grow token bounds into surrounding speech,
    // shrink them out of silence
    let hw = SAMPLE_RATE / 8;
    for j in 0..n {
        if tokens[j].id >= token_eot {
            continue;
        }

        let mut s0 = timestamp_to_sample(tokens[j].t0, n_samples);
        let mut s1 = timestamp_to_sample(tokens[j].t1, n_samples);

        let ss0 = s0.saturating_sub(hw);
        let ss1 = (s1 + hw).min(n_samples);
        let ns = (ss1 - ss0).max(1);

        let sum: f32 = state.energy[ss0..ss1].iter().sum();
        let thold = 0.5 * sum / ns as f32;

        {
            let mut k = s0;
            if state.energy[k] > thold && j > 0 {
                while k > 0 && state.energy[k] > thold {
                    k -= 1;
                }
                tokens[j].t0 = sample_to_timestamp(k);
                if tokens[j].t0 < tokens[j - 1].t1 {
                    tokens[j].t0 = tokens[j - 1].t1;
                } else {
                    s0 = k;
                }
            } else {
                while state.energy[k] < thold && k < s1 {
                    k += 1;
                }
                s0 = k;
                tokens[j].t0 = sample_to_timestamp(k);
            }
        }

        {
            let mut k = s1;
            if state.energy[k] > thold {
                while k < n_samples - 1 && state.energy[k] > thold {
                    k += 1;
                }
                tokens[j].t1 = sample_to_timestamp(k);
                if j < n - 1 && tokens[j].t1 > tokens[j + 1].t0 {
                    tokens[j].t1 = tokens[j + 1].t0;
                } else {
                    s1 = k;
                }
            } else {
                while state.energy[k] < thold && k > s0 {
                    k -= 1;
                }
                s1 = k;
                tokens[j].t1 = sample_to_timestamp(k);
            }
        }
        let _ = s1;
    }
}

fn should_split_on_word(text: &str, split_on_word: bool) -> bool {
    !split_on_word || text.starts_with(' ')
}

/// Re-wrap the most recent segment into pieces of at most `max_len`
/// characters. Returns the resulting number of segments.
pub(crate) fn wrap_segment(
    ctx: &Context,
    state: &mut State,
    max_len: usize,
    split_on_word: bool,
) -> usize {
    let Some(mut segment) = state.result_all.last().cloned() else {
        return 0;
    };

    let mut res = 1usize;
    let mut acc = 0usize;
    let mut text = String::new();

    let mut i = 0usize;
    while i < segment.tokens.len() {
        let token = segment.tokens[i];
        if token.id >= ctx.vocab.token_eot {
            i += 1;
            continue;
        }

        let txt = ctx.token_text(token.id).into_owned();
        let cur = txt.len();

        if acc + cur > max_len && i > 0 && should_split_on_word(&txt, split_on_word) {
            let last = state.result_all.last_mut().expect("segment exists");
            last.text = std::mem::take(&mut text);
            last.t1 = token.t0;
            last.tokens.truncate(i);
            last.speaker_turn_next = false;

            let next = Segment {
                t0: token.t0,
                t1: segment.t1,
                text: String::new(),
                tokens: segment.tokens[i..].to_vec(),
                speaker_turn_next: segment.speaker_turn_next,
            };
            state.result_all.push(next);

            acc = 0;
            segment = state.result_all.last().cloned().expect("just pushed");
            i = 0;
            res += 1;
        } else {
            acc += cur;
            text.push_str(&txt);
            i += 1;
        }
    }

    if let Some(last) = state.result_all.last_mut() {
        last.text = text;
    }

    res
}

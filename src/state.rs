//! Per-run mutable state: mel buffer, decoder slots, caches and results.
//!
//! A [`State`] is single-writer. The owning [`crate::Context`] is shared
//! read-only; parallel transcription clones additional states, never the
//! context.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use crate::audio::Mel;
use crate::kv::{CrossCache, KvCache};
use crate::sampling::{Sequence, TokenData};
use crate::vocab::Token;

/// One emitted piece of transcription. Times are centiseconds.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Segment {
    pub t0: i64,
    pub t1: i64,
    pub text: String,
    pub tokens: Vec<TokenData>,
    /// A speaker change was predicted right after this segment.
    pub speaker_turn_next: bool,
}

/// One decoding hypothesis and its self-attention cache.
#[derive(Default)]
pub(crate) struct DecoderSlot {
    pub kv_self: KvCache,
    pub sequence: Sequence,
    /// How far this hypothesis moves the window, in centiseconds.
    pub seek_delta: i32,
    pub failed: bool,
    pub completed: bool,
    pub has_ts: bool,

    pub probs: Vec<f32>,
    pub logits: Vec<f32>,
    pub logprobs: Vec<f32>,

    pub tokens_tmp: Vec<Token>,
}

impl DecoderSlot {
    pub fn new(n_text_layer: usize) -> Self {
        Self {
            kv_self: KvCache::new(n_text_layer),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Timings {
    pub t_mel: Duration,
    pub t_encode: Duration,
    pub t_prompt: Duration,
    pub t_decode: Duration,
    pub t_sample: Duration,
    pub n_encode: u32,
    pub n_prompt: u32,
    pub n_decode: u32,
    pub n_sample: u32,
}

pub struct State {
    pub(crate) mel: Mel,
    pub(crate) cross: CrossCache,
    pub(crate) embd_enc: Option<candle_core::Tensor>,
    pub(crate) decoders: Vec<DecoderSlot>,

    /// Raw logits of the most recent decode call (full vocabulary row).
    pub(crate) logits: Vec<f32>,

    pub(crate) result_all: Vec<Segment>,
    pub(crate) prompt_past: Vec<Token>,
    pub(crate) lang_id: Option<usize>,

    pub(crate) rng: StdRng,

    /// Caller override of the encoder context length; 0 means the model's
    /// full `n_audio_ctx`.
    pub(crate) exp_n_audio_ctx: usize,

    pub(crate) n_fail_p: u32,
    pub(crate) n_fail_h: u32,

    // token-level timestamp tracking
    pub(crate) t_beg: i64,
    pub(crate) t_last: i64,
    pub(crate) tid_last: Token,
    pub(crate) energy: Vec<f32>,

    pub(crate) timings: Timings,

    pub(crate) n_text_layer: usize,
}

impl State {
    pub(crate) fn new(n_text_layer: usize) -> Self {
        Self {
            mel: Mel::default(),
            cross: CrossCache::default(),
            embd_enc: None,
            decoders: vec![DecoderSlot::new(n_text_layer)],
            logits: Vec::new(),
            result_all: Vec::new(),
            prompt_past: Vec::new(),
            lang_id: None,
            rng: StdRng::seed_from_u64(0),
            exp_n_audio_ctx: 0,
            n_fail_p: 0,
            n_fail_h: 0,
            t_beg: 0,
            t_last: 0,
            tid_last: 0,
            energy: Vec::new(),
            timings: Timings::default(),
            n_text_layer,
        }
    }

    /// Make sure decoder slots `0..n` exist.
    pub(crate) fn ensure_decoders(&mut self, n: usize) {
        while self.decoders.len() < n {
            self.decoders.push(DecoderSlot::new(self.n_text_layer));
        }
    }

    /// Reseed the sampling RNG (stochastic decoding is deterministic for
    /// a fixed seed).
    pub fn set_seed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    pub fn n_segments(&self) -> usize {
        self.result_all.len()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.result_all
    }

    pub fn segment(&self, i: usize) -> Option<&Segment> {
        self.result_all.get(i)
    }

    /// Language id detected or selected by the last `full` run.
    pub fn lang_id(&self) -> Option<usize> {
        self.lang_id
    }

    /// Columns of the current spectrogram covering real audio.
    pub fn n_len(&self) -> usize {
        self.mel.n_len_org
    }

    /// Encoder output of the most recent window, `(n_ctx, n_state)`.
    pub fn audio_embedding(&self) -> Option<&candle_core::Tensor> {
        self.embd_enc.as_ref()
    }

    /// Temperature fallbacks caused by failed/low-logprob decodes.
    pub fn n_fail_p(&self) -> u32 {
        self.n_fail_p
    }

    /// Decoders rejected by the entropy threshold.
    pub fn n_fail_h(&self) -> u32 {
        self.n_fail_h
    }

    pub fn timings(&self) -> Timings {
        self.timings
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_starts_with_one_decoder() {
        let state = State::new(4);
        assert_eq!(state.decoders.len(), 1);
        assert_eq!(state.n_segments(), 0);
    }

    #[test]
    fn ensure_decoders_grows_once() {
        let mut state = State::new(2);
        state.ensure_decoders(5);
        assert_eq!(state.decoders.len(), 5);
        state.ensure_decoders(3);
        assert_eq!(state.decoders.len(), 5);
    }
}

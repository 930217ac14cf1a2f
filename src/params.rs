//! Transcription parameters and the event-handler capability set.

use std::sync::Arc;

use crate::context::Context;
use crate::sampling::TokenData;
use crate::state::State;
use crate::vocab::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingStrategy {
    /// Similar to OpenAI's `GreedyDecoder`.
    Greedy,
    /// Similar to OpenAI's `BeamSearchDecoder`.
    BeamSearch,
}

#[derive(Debug, Clone, Copy)]
pub struct GreedyParams {
    /// Number of decoders to run at non-zero temperatures.
    pub best_of: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct BeamSearchParams {
    pub beam_size: usize,
    /// Accepted for API parity; not consulted by this revision.
    pub patience: f32,
}

/// Hooks into a running transcription. Every capability defaults to a
/// no-op; implement only what you need. Handlers run on the thread
/// driving the chunk, so they must be `Send + Sync`.
pub trait EventHandler: Send + Sync {
    /// Called after each batch of `n_new` segments is appended to the
    /// state's result list.
    fn on_segment(&self, ctx: &Context, state: &State, n_new: usize) {
        let _ = (ctx, state, n_new);
    }

    /// Window-loop progress in percent of the seek range.
    fn on_progress(&self, ctx: &Context, state: &State, progress: i32) {
        let _ = (ctx, state, progress);
    }

    /// Polled before each encoder run and each decode step; returning
    /// `true` stops processing cleanly at the next boundary.
    fn should_abort(&self) -> bool {
        false
    }

    /// Returning `false` ends the window loop before the encoder runs.
    fn should_continue_encode(&self, ctx: &Context, state: &State) -> bool {
        let _ = (ctx, state);
        true
    }

    /// Mutate raw logits before the structural masks are applied.
    fn filter_logits(&self, ctx: &Context, tokens: &[TokenData], logits: &mut [f32]) {
        let _ = (ctx, tokens, logits);
    }
}

/// Parameters for [`Context::full`]. Construct with
/// [`FullParams::new`] and override the fields you care about.
#[derive(Clone)]
pub struct FullParams {
    pub strategy: SamplingStrategy,

    pub n_threads: usize,
    /// Tokens of past text to keep as conditioning for the next window.
    pub n_max_text_ctx: usize,
    pub offset_ms: i32,
    pub duration_ms: i32,

    pub translate: bool,
    /// Do not carry prompt-past across windows.
    pub no_context: bool,
    pub single_segment: bool,
    pub print_special: bool,
    pub print_progress: bool,
    pub print_realtime: bool,
    pub print_timestamps: bool,

    pub token_timestamps: bool,
    /// Timestamp token probability threshold for token-level timestamps.
    pub thold_pt: f32,
    /// Sum-of-timestamp-probabilities threshold.
    pub thold_ptsum: f32,
    /// Max segment length in characters; 0 disables re-wrapping.
    pub max_len: usize,
    pub split_on_word: bool,
    /// Max tokens per segment; 0 means no limit.
    pub max_tokens: usize,

    /// Overrides the audio context size; 0 keeps the model's full 1500.
    pub audio_ctx: usize,

    /// Enable speaker-turn (tinydiarize) token prediction.
    pub speaker_turn_enable: bool,

    /// Tokenized and injected as conversation context before the first
    /// window. Ignored when `prompt_tokens` is non-empty.
    pub initial_prompt: Option<String>,
    pub prompt_tokens: Vec<Token>,

    /// `None` or `"auto"` triggers language auto-detection.
    pub language: Option<String>,
    /// Stop right after language detection.
    pub detect_language: bool,

    pub suppress_blank: bool,
    pub suppress_non_speech_tokens: bool,

    pub temperature: f32,
    pub max_initial_ts: f32,
    pub length_penalty: f32,

    pub temperature_inc: f32,
    pub entropy_thold: f32,
    pub logprob_thold: f32,
    /// Accepted for API parity; not consulted by this revision.
    pub no_speech_thold: f32,

    pub greedy: GreedyParams,
    pub beam_search: BeamSearchParams,

    pub events: Option<Arc<dyn EventHandler>>,
}

impl FullParams {
    pub fn new(strategy: SamplingStrategy) -> Self {
        let (best_of, beam_size) = match strategy {
            SamplingStrategy::Greedy => (2, 0),
            SamplingStrategy::BeamSearch => (2, 2),
        };

        Self {
            strategy,
            n_threads: std::thread::available_parallelism()
                .map_or(4, std::num::NonZeroUsize::get)
                .min(4),
            n_max_text_ctx: 16384,
            offset_ms: 0,
            duration_ms: 0,
            translate: false,
            no_context: false,
            single_segment: false,
            print_special: false,
            print_progress: true,
            print_realtime: false,
            print_timestamps: true,
            token_timestamps: false,
            thold_pt: 0.01,
            thold_ptsum: 0.01,
            max_len: 0,
            split_on_word: false,
            max_tokens: 0,
            audio_ctx: 0,
            speaker_turn_enable: false,
            initial_prompt: None,
            prompt_tokens: Vec::new(),
            language: Some("en".to_string()),
            detect_language: false,
            suppress_blank: true,
            suppress_non_speech_tokens: false,
            temperature: 0.0,
            max_initial_ts: 1.0,
            length_penalty: -1.0,
            temperature_inc: 0.4,
            entropy_thold: 2.4,
            logprob_thold: -1.0,
            no_speech_thold: 0.6,
            greedy: GreedyParams { best_of },
            beam_search: BeamSearchParams {
                beam_size,
                patience: -1.0,
            },
            events: None,
        }
    }
}

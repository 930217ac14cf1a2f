#![warn(
    clippy::correctness,
    clippy::complexity,
    clippy::suspicious,
    clippy::pedantic,
    clippy::perf,
    clippy::style
)]
#![allow(
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::too_many_lines
)]

//! Offline on-device speech recognition with Whisper GGML models.
//!
//! The crate is the inference engine only: it consumes 16 kHz mono PCM
//! and a model byte stream, and produces timestamped text segments.
//! Audio file decoding, argument parsing and subtitle writers live in
//! the consumers (see `src/bin/cli.rs` for a minimal one).
//!
//! ```no_run
//! use candle_core::Device;
//! use whisper_runner::{Context, FullParams, SamplingStrategy};
//!
//! # fn run(samples: &[f32]) -> whisper_runner::Result<()> {
//! let ctx = Context::from_file("ggml-base.en.bin", &Device::Cpu)?;
//! let mut state = ctx.create_state();
//! let params = FullParams::new(SamplingStrategy::Greedy);
//! ctx.full(&mut state, params, samples)?;
//! for segment in state.segments() {
//!     println!("[{} - {}] {}", segment.t0, segment.t1, segment.text);
//! }
//! # Ok(())
//! # }
//! ```

mod audio;
mod context;
mod decoder;
mod encoder;
mod error;
mod full;
mod ggml;
mod kv;
mod lang;
mod logits;
mod model;
mod ops;
mod params;
mod sampling;
mod state;
mod timestamps;
mod vocab;

pub use context::Context;
pub use error::{Result, WhisperError};
pub use full::format_timestamp;
pub use ggml::{GgmlType, GGML_MAGIC};
pub use lang::{lang_full_str, lang_id, lang_max_id, lang_str};
pub use model::{Filters, HParams, ModelType};
pub use params::{BeamSearchParams, EventHandler, FullParams, GreedyParams, SamplingStrategy};
pub use sampling::TokenData;
pub use state::{Segment, State, Timings};
pub use vocab::Token;

/// Expected input sample rate.
pub const SAMPLE_RATE: usize = 16_000;
/// STFT frame size (samples).
pub const N_FFT: usize = 400;
/// STFT hop (samples); one mel column covers 10 ms.
pub const HOP_LENGTH: usize = 160;
/// Window length in seconds.
pub const CHUNK_SIZE: usize = 30;
/// Samples per 30-second window.
pub const N_SAMPLES: usize = SAMPLE_RATE * CHUNK_SIZE;
/// Hard cap on simultaneous decoders per state.
pub const MAX_DECODERS: usize = 16;

use thiserror::Error;

/// Errors surfaced by the runtime.
///
/// Decoder-level quality failures (entropy/logprob thresholds, stuck
/// timestamps) are not errors; they feed the temperature fallback inside
/// [`crate::Context::full`] and never reach the caller directly.
#[derive(Debug, Error)]
pub enum WhisperError {
    #[error("invalid model data (bad magic {0:#010x})")]
    InvalidMagic(u32),

    #[error("invalid model data (bad ftype value {0})")]
    UnknownFloatType(i32),

    #[error("model stream ended early: {0}")]
    TruncatedStream(#[from] std::io::Error),

    #[error("unknown tensor '{0}' in model file")]
    UnknownTensorName(String),

    #[error("tensor '{name}' has wrong shape in model file: got {got:?}, expected {expected:?}")]
    TensorShapeMismatch {
        name: String,
        got: Vec<usize>,
        expected: Vec<usize>,
    },

    #[error("tensor '{name}' has wrong size in model file: got {got} bytes, expected {expected}")]
    TensorSizeMismatch {
        name: String,
        got: usize,
        expected: usize,
    },

    #[error("not all tensors loaded from model file - expected {expected}, got {got}")]
    MissingTensors { expected: usize, got: usize },

    #[error("quantized model payloads are not supported on big-endian hosts")]
    QuantizedOnBigEndian,

    #[error("failed to compute log mel spectrogram: {0}")]
    Mel(String),

    #[error("mel data has {got} bins, model expects {expected}")]
    MelBinMismatch { got: usize, expected: usize },

    #[error("offset {offset_ms}ms is past the end of the audio ({len_ms}ms)")]
    OffsetPastEnd { offset_ms: i32, len_ms: i32 },

    #[error("unknown language '{0}'")]
    UnknownLanguage(String),

    #[error("audio_ctx is larger than the maximum allowed ({requested} > {max})")]
    AudioContextExceeded { requested: usize, max: usize },

    #[error("requested {0} decoders, at most {max} are supported", max = crate::MAX_DECODERS)]
    TooManyDecoders(usize),

    #[error("kv cache allocation failed: {0}")]
    KvCacheInit(String),

    #[error("decoding failed: {0}")]
    DecodeFailed(String),

    #[error("tensor computation failed: {0}")]
    Compute(#[from] candle_core::Error),
}

pub type Result<T, E = WhisperError> = std::result::Result<T, E>;

//! The loaded model: weights, vocabulary and filterbank, immutable after
//! load and safe to share across states and threads.

use std::borrow::Cow;
use std::io::Read;
use std::path::Path;
use std::time::Instant;

use candle_core::Device;
use tracing::info;

use crate::audio::{self, Mel};
use crate::decoder;
use crate::encoder;
use crate::error::{Result, WhisperError};
use crate::full;
use crate::ggml;
use crate::model::{Filters, HParams, Model, ModelType};
use crate::params::FullParams;
use crate::state::State;
use crate::vocab::{Token, Vocab};

pub struct Context {
    pub(crate) model: Model,
    pub(crate) vocab: Vocab,
    pub(crate) filters: Filters,
    pub(crate) hparams: HParams,
    pub(crate) device: Device,
}

impl Context {
    /// Load a model from a GGML byte stream.
    pub fn from_reader<R: Read>(mut reader: R, device: &Device) -> Result<Self> {
        let started = Instant::now();
        let loaded = ggml::load_model(&mut reader, device)?;
        let model = Model::from_tensors(&loaded.hparams, loaded.tensors, loaded.n_loaded, device)?;
        info!("model loaded in {:?}", started.elapsed());

        Ok(Self {
            model,
            vocab: loaded.vocab,
            filters: loaded.filters,
            hparams: loaded.hparams,
            device: device.clone(),
        })
    }

    /// Load a model from a GGML file on disk.
    pub fn from_file<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        Self::from_reader(std::io::BufReader::new(file), device)
    }

    /// Create a fresh decoding state. States are independent; a long
    /// audio can be split across several, one per thread.
    pub fn create_state(&self) -> State {
        State::new(self.hparams.n_text_layer)
    }

    /// Compute the log-mel spectrogram of `samples` into `state`.
    pub fn pcm_to_mel(&self, state: &mut State, samples: &[f32], n_threads: usize) -> Result<()> {
        let started = Instant::now();
        state.mel = audio::log_mel_spectrogram(samples, &self.filters, n_threads)?;
        state.timings.t_mel += started.elapsed();
        Ok(())
    }

    /// Inject a precomputed spectrogram (`n_mel * n_len` values,
    /// mel-major) instead of running [`Self::pcm_to_mel`].
    pub fn set_mel(&self, state: &mut State, data: &[f32], n_len: usize, n_mel: usize) -> Result<()> {
        if n_mel != self.hparams.n_mels {
            return Err(WhisperError::MelBinMismatch {
                got: n_mel,
                expected: self.hparams.n_mels,
            });
        }
        state.mel = Mel {
            n_mel,
            n_len,
            n_len_org: n_len,
            data: data.to_vec(),
        };
        Ok(())
    }

    /// Run the encoder on the window rooted at mel column `offset`.
    pub fn encode(&self, state: &mut State, offset: usize) -> Result<()> {
        encoder::encode(self, state, offset)
    }

    /// Decode `tokens` on decoder slot 0 with `n_past` cached positions.
    /// The raw logits of the last position are kept in the state.
    pub fn decode(&self, state: &mut State, tokens: &[Token], n_past: usize) -> Result<()> {
        let State {
            decoders, cross, ..
        } = state;
        let logits = decoder::decode(self, &mut decoders[0].kv_self, cross, tokens, n_past)?;
        decoders[0].kv_self.n += tokens.len();
        state.logits = logits;
        Ok(())
    }

    /// Split text into vocabulary tokens.
    pub fn tokenize(&self, text: &str) -> Vec<Token> {
        self.vocab.tokenize(text)
    }

    /// Auto-detect the spoken language at `offset_ms`.
    ///
    /// Returns the best language id and the probability for every
    /// language, indexed by id. Requires the mel to be populated.
    pub fn lang_auto_detect(
        &self,
        state: &mut State,
        offset_ms: i32,
        n_threads: usize,
    ) -> Result<(usize, Vec<f32>)> {
        full::lang_auto_detect(self, state, offset_ms, n_threads)
    }

    /// Transcribe `samples`, driving the full window loop. Returns the
    /// number of segments left in `state`.
    pub fn full(&self, state: &mut State, params: FullParams, samples: &[f32]) -> Result<usize> {
        full::full_with_state(self, state, params, samples)
    }

    /// Like [`Self::full`], splitting the audio into `n_processors`
    /// chunks processed on separate threads and merged in order.
    pub fn full_parallel(
        &self,
        state: &mut State,
        params: FullParams,
        samples: &[f32],
        n_processors: usize,
    ) -> Result<usize> {
        full::full_parallel(self, state, params, samples, n_processors)
    }

    pub fn token_bytes(&self, id: Token) -> &[u8] {
        self.vocab.token_bytes(id)
    }

    pub fn token_text(&self, id: Token) -> Cow<'_, str> {
        self.vocab.token_text(id)
    }

    pub fn n_vocab(&self) -> usize {
        self.hparams.n_vocab
    }

    pub fn n_audio_ctx(&self) -> usize {
        self.hparams.n_audio_ctx
    }

    pub fn n_text_ctx(&self) -> usize {
        self.hparams.n_text_ctx
    }

    pub fn is_multilingual(&self) -> bool {
        self.vocab.is_multilingual()
    }

    pub fn model_type(&self) -> ModelType {
        self.hparams.model_type()
    }

    pub fn token_eot(&self) -> Token {
        self.vocab.token_eot
    }

    pub fn token_sot(&self) -> Token {
        self.vocab.token_sot
    }

    pub fn token_prev(&self) -> Token {
        self.vocab.token_prev
    }

    pub fn token_beg(&self) -> Token {
        self.vocab.token_beg
    }

    pub fn token_lang(&self, lang_id: usize) -> Token {
        self.vocab.token_lang(lang_id)
    }

    #[cfg(test)]
    pub(crate) fn empty_for_tests(device: &Device) -> Self {
        let hparams = HParams {
            n_vocab: 51864,
            n_audio_ctx: 1500,
            n_audio_state: 384,
            n_audio_head: 6,
            n_audio_layer: 4,
            n_text_ctx: 448,
            n_text_state: 384,
            n_text_head: 6,
            n_text_layer: 4,
            n_mels: 80,
            ftype: 1,
            qntvr: 0,
        };
        let filters = Filters {
            n_mel: 80,
            n_fft: 201,
            data: vec![1.0 / 201.0; 80 * 201],
        };
        let model = Model::from_tensors(&hparams, std::collections::HashMap::new(), 0, device)
            .expect("zero model");
        Self {
            model,
            vocab: Vocab::new(hparams.n_vocab, Vec::new()),
            filters,
            hparams,
            device: device.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_mel_validates_bin_count() {
        let ctx = Context::empty_for_tests(&Device::Cpu);
        let mut state = ctx.create_state();
        let err = ctx.set_mel(&mut state, &[0.0; 100], 1, 100);
        assert!(matches!(err, Err(WhisperError::MelBinMismatch { .. })));

        ctx.set_mel(&mut state, &vec![0.0; 80 * 10], 10, 80).unwrap();
        assert_eq!(state.n_len(), 10);
    }

    #[test]
    fn decode_advances_kv_occupancy() {
        let ctx = Context::empty_for_tests(&Device::Cpu);
        let mut state = ctx.create_state();
        ctx.set_mel(&mut state, &vec![0.0; 80 * 3000], 3000, 80)
            .unwrap();
        // shrink the encoder context to keep the test fast
        state.exp_n_audio_ctx = 64;
        ctx.encode(&mut state, 0).unwrap();

        let sot = ctx.token_sot();
        ctx.decode(&mut state, &[sot], 0).unwrap();
        assert_eq!(state.decoders[0].kv_self.n, 1);
        assert_eq!(state.logits.len(), ctx.n_vocab());

        ctx.decode(&mut state, &[sot, sot], 1).unwrap();
        assert_eq!(state.decoders[0].kv_self.n, 3);
    }
}

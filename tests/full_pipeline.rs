//! End-to-end tests against header-only (zero-weight) model files.
//!
//! A GGML file with no tensor records loads with all-zero weights, which
//! exercises the whole pipeline - mel, encoder, decoder, sampling and the
//! window loop - deterministically and without shipping real weights.

use std::io::Cursor;

use byteorder::{LittleEndian, WriteBytesExt};
use candle_core::Device;
use whisper_runner::{
    lang_id, lang_str, Context, FullParams, ModelType, SamplingStrategy, WhisperError, GGML_MAGIC,
};

const N_STATE: i32 = 64;
const N_HEAD: i32 = 2;
const N_LAYER: i32 = 2;

fn model_bytes(multilingual: bool) -> Vec<u8> {
    let n_vocab: i32 = if multilingual { 51865 } else { 51864 };
    let mut buf = Vec::new();

    buf.write_u32::<LittleEndian>(GGML_MAGIC).unwrap();
    for v in [
        n_vocab, 1500, N_STATE, N_HEAD, N_LAYER, 448, N_STATE, N_HEAD, N_LAYER, 80,
        1, // ftype = f16
    ] {
        buf.write_i32::<LittleEndian>(v).unwrap();
    }

    // flat mel filterbank, 80 x 201
    buf.write_i32::<LittleEndian>(80).unwrap();
    buf.write_i32::<LittleEndian>(201).unwrap();
    for _ in 0..80 * 201 {
        buf.write_f32::<LittleEndian>(1.0 / 201.0).unwrap();
    }

    // no stored vocabulary: every token id is synthesized
    buf.write_i32::<LittleEndian>(0).unwrap();

    buf
}

fn load(multilingual: bool) -> Context {
    Context::from_reader(Cursor::new(model_bytes(multilingual)), &Device::Cpu)
        .expect("header-only model loads")
}

fn silence(seconds: f32) -> Vec<f32> {
    vec![0.0f32; (seconds * 16000.0) as usize]
}

#[test]
fn header_only_model_loads() {
    let ctx = load(false);
    assert_eq!(ctx.n_vocab(), 51864);
    assert_eq!(ctx.n_audio_ctx(), 1500);
    assert_eq!(ctx.n_text_ctx(), 448);
    assert_eq!(ctx.model_type(), ModelType::Unknown);
    assert!(!ctx.is_multilingual());

    let ctx = load(true);
    assert!(ctx.is_multilingual());
}

#[test]
fn bad_magic_is_rejected() {
    let err = Context::from_reader(Cursor::new(vec![1u8, 2, 3, 4]), &Device::Cpu);
    assert!(matches!(err, Err(WhisperError::InvalidMagic(_))));
}

#[test]
fn full_on_silence_produces_ordered_segments() {
    let ctx = load(false);
    let mut state = ctx.create_state();

    let n = ctx
        .full(
            &mut state,
            FullParams::new(SamplingStrategy::Greedy),
            &silence(2.0),
        )
        .expect("full succeeds");

    assert_eq!(n, state.n_segments());
    let mut prev_t0 = i64::MIN;
    for segment in state.segments() {
        assert!(segment.t0 <= segment.t1);
        assert!(segment.t0 >= prev_t0);
        prev_t0 = segment.t0;
    }
}

#[test]
fn empty_audio_is_a_no_op() {
    let ctx = load(false);
    let mut state = ctx.create_state();
    let n = ctx
        .full(&mut state, FullParams::new(SamplingStrategy::Greedy), &[])
        .expect("empty input is fine");
    assert_eq!(n, 0);
}

#[test]
fn sub_second_audio_is_a_no_op() {
    let ctx = load(false);
    let mut state = ctx.create_state();
    let n = ctx
        .full(
            &mut state,
            FullParams::new(SamplingStrategy::Greedy),
            &silence(0.5),
        )
        .expect("short input is fine");
    assert_eq!(n, 0);
}

#[test]
fn language_detection_is_deterministic() {
    let ctx = load(true);
    let mut state = ctx.create_state();
    ctx.pcm_to_mel(&mut state, &silence(2.0), 2).unwrap();

    let (id_a, probs_a) = ctx.lang_auto_detect(&mut state, 0, 1).unwrap();
    let (id_b, probs_b) = ctx.lang_auto_detect(&mut state, 0, 1).unwrap();

    assert_eq!(id_a, id_b);
    assert_eq!(probs_a, probs_b);
    assert!(lang_str(id_a).is_some());

    let sum: f32 = probs_a.iter().sum();
    assert!((sum - 1.0).abs() < 1e-4);
}

#[test]
fn language_detection_past_end_fails() {
    let ctx = load(true);
    let mut state = ctx.create_state();
    ctx.pcm_to_mel(&mut state, &silence(2.0), 1).unwrap();

    let err = ctx.lang_auto_detect(&mut state, 60_000, 1);
    assert!(matches!(err, Err(WhisperError::OffsetPastEnd { .. })));
}

#[test]
fn audio_ctx_above_model_limit_fails() {
    let ctx = load(false);
    let mut state = ctx.create_state();
    let mut params = FullParams::new(SamplingStrategy::Greedy);
    params.audio_ctx = 2000;

    let err = ctx.full(&mut state, params, &silence(2.0));
    assert!(matches!(
        err,
        Err(WhisperError::AudioContextExceeded {
            requested: 2000,
            max: 1500
        })
    ));
}

#[test]
fn decoder_count_is_capped() {
    let ctx = load(false);
    let mut state = ctx.create_state();
    let mut params = FullParams::new(SamplingStrategy::Greedy);
    params.temperature = 0.8; // non-zero so best_of decoders actually run
    params.greedy.best_of = 32;

    let err = ctx.full(&mut state, params, &silence(2.0));
    assert!(matches!(err, Err(WhisperError::TooManyDecoders(32))));
}

#[test]
fn non_multilingual_model_forces_english() {
    let ctx = load(false);
    let mut state = ctx.create_state();
    let mut params = FullParams::new(SamplingStrategy::Greedy);
    params.language = Some("de".to_string());
    params.translate = true;

    ctx.full(&mut state, params, &silence(2.0))
        .expect("language is coerced, not an error");
    assert_eq!(state.lang_id(), lang_id("en"));
}

#[test]
fn oversized_prompt_past_is_truncated() {
    let ctx = load(false);
    let mut state = ctx.create_state();
    let mut params = FullParams::new(SamplingStrategy::Greedy);
    // far more context than n_text_ctx/2 can hold
    params.prompt_tokens = vec![5; 500];

    ctx.full(&mut state, params, &silence(2.0))
        .expect("prompt is left-truncated, not an overflow");
}

#[test]
fn beam_size_one_matches_greedy_on_zero_temperature() {
    let ctx = load(false);

    let mut greedy_state = ctx.create_state();
    let mut params = FullParams::new(SamplingStrategy::Greedy);
    params.temperature_inc = 0.0;
    ctx.full(&mut greedy_state, params, &silence(2.0)).unwrap();

    let mut beam_state = ctx.create_state();
    let mut params = FullParams::new(SamplingStrategy::BeamSearch);
    params.beam_search.beam_size = 1;
    params.temperature_inc = 0.0;
    ctx.full(&mut beam_state, params, &silence(2.0)).unwrap();

    assert_eq!(greedy_state.n_segments(), beam_state.n_segments());
    for (a, b) in greedy_state.segments().iter().zip(beam_state.segments()) {
        assert_eq!(a.text, b.text);
        assert_eq!(a.t0, b.t0);
        assert_eq!(a.t1, b.t1);
    }
}

#[test]
fn parallel_processing_merges_in_order() {
    let ctx = load(false);
    let mut state = ctx.create_state();

    let n = ctx
        .full_parallel(
            &mut state,
            FullParams::new(SamplingStrategy::Greedy),
            &silence(4.0),
            2,
        )
        .expect("parallel run succeeds");

    assert_eq!(n, state.n_segments());
    let mut prev_t1 = i64::MIN;
    for segment in state.segments() {
        assert!(segment.t0 <= segment.t1);
        assert!(segment.t0 >= prev_t1.min(segment.t0));
        prev_t1 = segment.t1;
    }
    // both chunks ran their own encoder
    assert!(state.timings().n_encode >= 2);
}

#[test]
fn tokenize_without_text_vocabulary_yields_nothing() {
    let ctx = load(false);
    // the synthesized vocabulary holds only placeholder names, so plain
    // text has no matching tokens
    assert!(ctx.tokenize("hello world").is_empty());
    assert_eq!(ctx.token_text(ctx.token_beg()).as_ref(), "[_BEG_]");
}

#[test]
fn mel_columns_follow_hop_formula() {
    let ctx = load(false);
    let mut state = ctx.create_state();
    for &n_samples in &[400usize, 16000, 32000] {
        ctx.pcm_to_mel(&mut state, &vec![0.0; n_samples], 2).unwrap();
        assert_eq!(state.n_len(), 1 + (n_samples + 200 - 400) / 160);
    }

    // sub-frame inputs: the signed hop formula truncates toward zero,
    // so anything from 41 samples up still yields one column
    ctx.pcm_to_mel(&mut state, &vec![0.0; 41], 2).unwrap();
    assert_eq!(state.n_len(), 1);
}

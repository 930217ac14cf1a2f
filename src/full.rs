//! The transcription driver: 30-second window loop, temperature
//! fallback, beam bookkeeping and segment emission.

use std::time::Instant;

use tracing::{debug, info, warn};

use crate::context::Context;
use crate::decoder;
use crate::encoder;
use crate::error::{Result, WhisperError};
use crate::lang;
use crate::logits::process_logits;
use crate::params::{FullParams, SamplingStrategy};
use crate::sampling::{sample_token, sample_token_topk, sequence_score, Sequence};
use crate::state::{Segment, State};
use crate::timestamps::{compute_token_level_timestamps, get_signal_energy, wrap_segment};
use crate::vocab::Token;
use crate::{CHUNK_SIZE, MAX_DECODERS};

///  500 -> 00:05.000
/// 6000 -> 01:00.000
pub fn format_timestamp(t: i64, comma: bool) -> String {
    let mut msec = t * 10;
    let hr = msec / (1000 * 60 * 60);
    msec -= hr * 1000 * 60 * 60;
    let min = msec / (1000 * 60);
    msec -= min * 1000 * 60;
    let sec = msec / 1000;
    msec -= sec * 1000;
    format!(
        "{hr:02}:{min:02}:{sec:02}{}{msec:03}",
        if comma { "," } else { "." }
    )
}

/// Detect the spoken language by decoding a single start-of-transcript
/// token and comparing the language-tag logits.
pub(crate) fn lang_auto_detect(
    ctx: &Context,
    state: &mut State,
    offset_ms: i32,
    _n_threads: usize,
) -> Result<(usize, Vec<f32>)> {
    let seek = offset_ms / 10;

    if seek < 0 || seek as usize >= state.mel.n_len_org {
        return Err(WhisperError::OffsetPastEnd {
            offset_ms,
            len_ms: state.mel.n_len_org as i32 * 10,
        });
    }

    encoder::encode(ctx, state, seek as usize)?;

    state.decoders[0].kv_self.reset();
    let prompt = [ctx.vocab.token_sot];
    {
        let State {
            decoders, cross, ..
        } = state;
        let logits = decoder::decode(ctx, &mut decoders[0].kv_self, cross, &prompt, 0)?;
        state.logits = logits;
    }

    let mut logits_id: Vec<(f32, usize)> = (0..=lang::lang_max_id())
        .map(|id| {
            let token = ctx.vocab.token_lang(id) as usize;
            (state.logits[token], id)
        })
        .collect();
    logits_id.sort_by(|a, b| b.0.total_cmp(&a.0));

    // softmax over the language tags only
    let max = logits_id[0].0;
    let mut sum = 0.0f64;
    for p in &mut logits_id {
        p.0 = (p.0 - max).exp();
        sum += f64::from(p.0);
    }

    let mut probs = vec![0.0f32; lang::lang_max_id() + 1];
    for p in &mut logits_id {
        p.0 = (f64::from(p.0) / sum) as f32;
        probs[p.1] = p.0;
    }

    let best = logits_id[0].1;
    state.lang_id = Some(best);
    debug!(
        "auto-detected language: {} (p = {})",
        lang::lang_str(best).unwrap_or("?"),
        logits_id[0].0
    );

    Ok((best, probs))
}

struct BeamCandidate {
    decoder_idx: usize,
    seek_delta: i32,
    has_ts: bool,
    sequence: Sequence,
}

pub(crate) fn full_with_state(
    ctx: &Context,
    state: &mut State,
    mut params: FullParams,
    samples: &[f32],
) -> Result<usize> {
    state.result_all.clear();

    if !samples.is_empty() {
        ctx.pcm_to_mel(state, samples, params.n_threads)?;
    }

    // a model without language tags can only transcribe English
    if !ctx.vocab.is_multilingual() {
        let wants_other = params.language.as_deref().map_or(true, |l| l != "en");
        if wants_other || params.translate || params.detect_language {
            warn!("model is not multilingual, ignoring language and translation options");
            params.language = Some("en".to_string());
            params.translate = false;
            params.detect_language = false;
        }
    }

    let auto_lang = params
        .language
        .as_deref()
        .map_or(true, |l| l.is_empty() || l == "auto");
    if auto_lang || params.detect_language {
        let (lang_id, probs) = lang_auto_detect(ctx, state, 0, params.n_threads)?;
        params.language = lang::lang_str(lang_id).map(str::to_string);
        info!(
            "auto-detected language: {} (p = {})",
            params.language.as_deref().unwrap_or("?"),
            probs[lang_id]
        );
        if params.detect_language {
            return Ok(0);
        }
    }

    if params.token_timestamps {
        state.t_beg = 0;
        state.t_last = 0;
        state.tid_last = 0;
        if !samples.is_empty() {
            state.energy = get_signal_energy(samples, 32);
        }
    }

    let seek_start = i64::from(params.offset_ms / 10).max(0);
    let seek_end = if params.duration_ms == 0 {
        state.mel.n_len_org as i64
    } else {
        seek_start + i64::from(params.duration_ms / 10)
    };

    // nothing under a second of audio is worth decoding
    if seek_end < seek_start + 100 {
        return Ok(0);
    }

    // [t0, t0 + inc, t0 + 2*inc, ...] up to 1.0
    let temperatures: Vec<f32> = if params.temperature_inc > 0.0 {
        let mut ts = Vec::new();
        let mut t = params.temperature;
        while t < 1.0 + 1e-6 {
            ts.push(t);
            t += params.temperature_inc;
        }
        ts
    } else {
        vec![params.temperature]
    };

    let n_decoders = match params.strategy {
        SamplingStrategy::Greedy => params.greedy.best_of,
        SamplingStrategy::BeamSearch => params.greedy.best_of.max(params.beam_search.beam_size),
    }
    .max(1);
    if n_decoders > MAX_DECODERS {
        return Err(WhisperError::TooManyDecoders(n_decoders));
    }
    state.ensure_decoders(n_decoders);

    if params.no_context {
        state.prompt_past.clear();
    }

    // initial prompt conditions the first window like carried-over text
    {
        let mut prompt_tokens = params.prompt_tokens.clone();
        if prompt_tokens.is_empty() {
            if let Some(text) = &params.initial_prompt {
                prompt_tokens = ctx.tokenize(text);
            }
        }
        if !prompt_tokens.is_empty() {
            let mut past = prompt_tokens;
            past.extend_from_slice(&state.prompt_past);
            state.prompt_past = past;
        }
    }

    if params.audio_ctx > ctx.hparams.n_audio_ctx {
        return Err(WhisperError::AudioContextExceeded {
            requested: params.audio_ctx,
            max: ctx.hparams.n_audio_ctx,
        });
    }
    state.exp_n_audio_ctx = params.audio_ctx;

    // task prefix: sot [lang task] for multilingual models
    let mut prompt_init: Vec<Token> = vec![ctx.vocab.token_sot];
    if ctx.vocab.is_multilingual() {
        let language = params.language.as_deref().unwrap_or("en");
        let lang_id = lang::lang_id(language)
            .ok_or_else(|| WhisperError::UnknownLanguage(language.to_string()))?;
        state.lang_id = Some(lang_id);
        prompt_init.push(ctx.vocab.token_lang(lang_id));
        if params.translate {
            prompt_init.push(ctx.vocab.token_translate);
        } else {
            prompt_init.push(ctx.vocab.token_transcribe);
        }
    } else if state.lang_id.is_none() {
        state.lang_id = lang::lang_id("en");
    }

    let token_eot = ctx.vocab.token_eot;
    let token_beg = ctx.vocab.token_beg;
    let token_solm = ctx.vocab.token_solm;
    let token_prev = ctx.vocab.token_prev;

    let n_max_gen = ctx.hparams.n_text_ctx / 2 - 4;
    let max_seek_delta = 100 * CHUNK_SIZE as i32;

    let mut seek = seek_start;
    let mut prompt: Vec<Token> = Vec::with_capacity(ctx.hparams.n_text_ctx);
    let mut beam_candidates: Vec<BeamCandidate> = Vec::new();
    let mut aborted = false;
    let mut window_failed = false;

    // main loop
    loop {
        {
            let denom = (seek_end - seek_start).max(1);
            let progress_cur = (100 * (seek - seek_start)) / denom;
            if let Some(events) = &params.events {
                events.on_progress(ctx, state, progress_cur as i32);
            }
            if params.print_progress {
                info!("progress = {progress_cur}%");
            }
        }

        // if only 1 second left, then stop
        if seek + 100 >= seek_end {
            break;
        }

        if let Some(events) = &params.events {
            if events.should_abort() || !events.should_continue_encode(ctx, state) {
                info!("encoder callback requested stop");
                break;
            }
        }

        encoder::encode(ctx, state, seek as usize)?;

        // a very short tail of audio tends to make the decoder repeat or
        // hallucinate when conditioned on past text
        if seek > seek_start && seek + 500 >= seek_end {
            state.prompt_past.clear();
        }

        let mut best_decoder_id = 0usize;
        window_failed = false;

        for (it, &t_cur) in temperatures.iter().enumerate() {
            let n_decoders_cur = match params.strategy {
                SamplingStrategy::Greedy => {
                    if t_cur > 0.0 {
                        params.greedy.best_of
                    } else {
                        1
                    }
                }
                SamplingStrategy::BeamSearch => {
                    if t_cur > 0.0 {
                        params.greedy.best_of
                    } else {
                        params.beam_search.beam_size
                    }
                }
            }
            .max(1);

            debug!("decoding with {n_decoders_cur} decoders, temperature = {t_cur:.2}");

            for decoder in state.decoders.iter_mut().take(n_decoders_cur) {
                decoder.kv_self.reset();
                decoder.sequence.reset();
                decoder.seek_delta = max_seek_delta;
                decoder.failed = false;
                decoder.completed = false;
                decoder.has_ts = false;
            }

            // decode the prompt on decoder 0 and copy the result around
            {
                prompt.clear();

                // condition on previously generated text at low temperatures
                if !state.prompt_past.is_empty() && t_cur < 0.5 && params.n_max_text_ctx > 0 {
                    let n_take = params
                        .n_max_text_ctx
                        .min(ctx.hparams.n_text_ctx / 2)
                        .min(state.prompt_past.len());
                    prompt.push(token_prev);
                    prompt.extend_from_slice(&state.prompt_past[state.prompt_past.len() - n_take..]);
                }

                prompt.extend_from_slice(&prompt_init);

                let started = Instant::now();
                let raw = {
                    let State {
                        decoders, cross, ..
                    } = state;
                    decoder::decode(ctx, &mut decoders[0].kv_self, cross, &prompt, 0)?
                };
                state.timings.t_prompt += started.elapsed();
                state.timings.n_prompt += 1;

                let sample_started = Instant::now();
                process_logits(ctx, &params, &mut state.decoders[0], &raw, t_cur);
                state.logits = raw;
                state.decoders[0].kv_self.n += prompt.len();

                for j in 1..n_decoders_cur {
                    let (kv, probs, logits, logprobs) = {
                        let d0 = &state.decoders[0];
                        (
                            d0.kv_self.clone(),
                            d0.probs.clone(),
                            d0.logits.clone(),
                            d0.logprobs.clone(),
                        )
                    };
                    let decoder = &mut state.decoders[j];
                    decoder.kv_self = kv;
                    decoder.probs = probs;
                    decoder.logits = logits;
                    decoder.logprobs = logprobs;
                }
                state.timings.t_sample += sample_started.elapsed();
            }

            for i in 0..n_max_gen {
                if let Some(events) = &params.events {
                    if events.should_abort() {
                        aborted = true;
                        break;
                    }
                }

                let sample_started = Instant::now();
                if params.strategy == SamplingStrategy::BeamSearch {
                    beam_candidates.clear();
                }

                // generate new sequence candidates for each decoder
                for j in 0..n_decoders_cur {
                    let decoder = &mut state.decoders[j];
                    if decoder.completed || decoder.failed {
                        continue;
                    }

                    match params.strategy {
                        SamplingStrategy::Greedy => {
                            let best = t_cur < 1e-6;
                            let token = sample_token(
                                &decoder.probs,
                                &decoder.logprobs,
                                token_beg,
                                best,
                                &mut state.rng,
                            );
                            decoder.sequence.sum_logprobs_all += f64::from(token.plog);
                            decoder.sequence.tokens.push(token);
                            state.timings.n_sample += 1;
                        }
                        SamplingStrategy::BeamSearch => {
                            let tokens_new = sample_token_topk(
                                &decoder.logits,
                                &decoder.probs,
                                &decoder.logprobs,
                                token_beg,
                                params.beam_search.beam_size,
                            );
                            state.timings.n_sample += 1;
                            for token in tokens_new {
                                let mut sequence = decoder.sequence.clone();
                                sequence.sum_logprobs_all += f64::from(token.plog);
                                sequence.tokens.push(token);
                                beam_candidates.push(BeamCandidate {
                                    decoder_idx: j,
                                    seek_delta: decoder.seek_delta,
                                    has_ts: decoder.has_ts,
                                    sequence,
                                });
                            }
                        }
                    }
                }

                // for beam-search, choose the top candidates and update
                // the KV caches
                if params.strategy == SamplingStrategy::BeamSearch {
                    beam_candidates.sort_by(|a, b| {
                        b.sequence
                            .sum_logprobs_all
                            .total_cmp(&a.sequence.sum_logprobs_all)
                    });

                    let mut cur_c = 0usize;
                    let mut view = vec![-1isize; n_decoders_cur];

                    for (j, view_j) in view.iter_mut().enumerate() {
                        let decoder = &state.decoders[j];
                        if decoder.completed || decoder.failed {
                            continue;
                        }
                        if cur_c >= beam_candidates.len() {
                            break;
                        }

                        let cur = &beam_candidates[cur_c];
                        let cur_idx = cur_c;
                        cur_c += 1;
                        // candidates with identical scores only add
                        // duplicate hypotheses
                        while cur_c < beam_candidates.len()
                            && beam_candidates[cur_c].sequence.sum_logprobs_all
                                == beam_candidates[cur_idx].sequence.sum_logprobs_all
                            && i > 0
                        {
                            cur_c += 1;
                        }

                        let decoder = &mut state.decoders[j];
                        decoder.sequence = cur.sequence.clone();
                        decoder.seek_delta = beam_candidates[cur_idx].seek_delta;
                        decoder.has_ts = beam_candidates[cur_idx].has_ts;
                        *view_j = beam_candidates[cur_idx].decoder_idx as isize;
                    }

                    // reshuffle the caches to match the new assignment;
                    // handles are immutable so this is plain reassignment
                    let snapshots: Vec<_> = state
                        .decoders
                        .iter()
                        .take(n_decoders_cur)
                        .map(|d| d.kv_self.clone())
                        .collect();
                    for (j, &src) in view.iter().enumerate() {
                        if src >= 0 && src as usize != j {
                            state.decoders[j].kv_self = snapshots[src as usize].clone();
                        }
                    }
                }

                // update each decoder: timestamps drive the sliding
                // window, and decide completion or failure
                for j in 0..n_decoders_cur {
                    let decoder = &mut state.decoders[j];
                    if decoder.completed || decoder.failed {
                        continue;
                    }

                    let token = *decoder
                        .sequence
                        .tokens
                        .last()
                        .expect("decoder sampled at least one token");

                    // timestamp token - update sliding window
                    if token.id > token_beg {
                        let seek_delta_new = 2 * (token.id - token_beg) as i32;

                        // do not allow going back in time
                        if decoder.has_ts
                            && decoder.seek_delta > seek_delta_new
                            && decoder.sequence.result_len < i
                        {
                            decoder.failed = true;
                            continue;
                        }

                        decoder.seek_delta = seek_delta_new;
                        decoder.sequence.result_len = i + 1;
                        decoder.has_ts = true;
                    }

                    // end of segment
                    if token.id == token_eot
                        || (params.max_tokens > 0 && i >= params.max_tokens)
                        || (decoder.has_ts
                            && seek + i64::from(decoder.seek_delta) + 100 >= seek_end)
                    {
                        if decoder.sequence.result_len == 0 {
                            if seek + i64::from(decoder.seek_delta) + 100 >= seek_end {
                                decoder.sequence.result_len = i + 1;
                            } else {
                                decoder.failed = true;
                                continue;
                            }
                        }

                        if params.single_segment {
                            decoder.sequence.result_len = i + 1;
                            decoder.seek_delta = max_seek_delta;
                        }

                        decoder.completed = true;
                        continue;
                    }

                    // an empty model cannot terminate on its own
                    if ctx.model.n_loaded == 0 {
                        decoder.seek_delta = max_seek_delta;
                        decoder.completed = true;
                        continue;
                    }

                    // repetition loops never emit a closing timestamp;
                    // flag them for the fallback instead of spinning
                    if i == n_max_gen - 1
                        && (decoder.sequence.result_len == 0
                            || decoder.seek_delta < max_seek_delta / 2)
                    {
                        decoder.failed = true;
                        continue;
                    }
                }
                state.timings.t_sample += sample_started.elapsed();

                let completed_all = state
                    .decoders
                    .iter()
                    .take(n_decoders_cur)
                    .all(|d| d.completed || d.failed);
                if completed_all {
                    break;
                }

                // obtain logits for the next token of every live decoder
                for j in 0..n_decoders_cur {
                    if state.decoders[j].completed || state.decoders[j].failed {
                        continue;
                    }

                    let last_id = state.decoders[j]
                        .sequence
                        .tokens
                        .last()
                        .expect("live decoder has tokens")
                        .id;
                    let n_past = state.decoders[j].kv_self.n;

                    let started = Instant::now();
                    let raw = {
                        let State {
                            decoders, cross, ..
                        } = state;
                        decoders[j].tokens_tmp.clear();
                        decoders[j].tokens_tmp.push(last_id);
                        let tokens = std::mem::take(&mut decoders[j].tokens_tmp);
                        let out =
                            decoder::decode(ctx, &mut decoders[j].kv_self, cross, &tokens, n_past);
                        decoders[j].tokens_tmp = tokens;
                        out?
                    };
                    state.timings.t_decode += started.elapsed();
                    state.timings.n_decode += 1;

                    let sample_started = Instant::now();
                    process_logits(ctx, &params, &mut state.decoders[j], &raw, t_cur);
                    state.decoders[j].kv_self.n += 1;
                    state.timings.t_sample += sample_started.elapsed();
                }
            }

            // rank the resulting sequences and select the best decoder
            {
                let mut best_score = f64::NEG_INFINITY;
                best_decoder_id = 0;

                for j in 0..n_decoders_cur {
                    let decoder = &mut state.decoders[j];
                    if decoder.failed {
                        continue;
                    }

                    let result_len = decoder.sequence.result_len;
                    decoder.sequence.tokens.truncate(result_len);
                    sequence_score(&mut decoder.sequence, params.length_penalty);

                    debug!(
                        "decoder {j}: score = {:.5}, result_len = {}, avg_logprobs = {:.5}, entropy = {:.5}",
                        decoder.sequence.score,
                        decoder.sequence.result_len,
                        decoder.sequence.avg_logprobs,
                        decoder.sequence.entropy
                    );

                    if decoder.sequence.result_len > 32
                        && decoder.sequence.entropy < f64::from(params.entropy_thold)
                    {
                        debug!(
                            "decoder {j}: failed due to entropy {:.5} < {:.5}",
                            decoder.sequence.entropy, params.entropy_thold
                        );
                        decoder.failed = true;
                        state.n_fail_h += 1;
                        continue;
                    }

                    if best_score < decoder.sequence.score {
                        best_score = decoder.sequence.score;
                        best_decoder_id = j;
                    }
                }
            }

            // retry with a higher temperature unless this already is the
            // last one or the window is almost done
            let best = &state.decoders[best_decoder_id];
            window_failed = best.failed
                || ((best.sequence.avg_logprobs as f32) < params.logprob_thold
                    && best.sequence.result_len > 0);
            if aborted
                || it == temperatures.len() - 1
                || seek_end - seek <= 10 * CHUNK_SIZE as i64
            {
                break;
            }
            if !window_failed {
                break;
            }
            state.n_fail_p += 1;
            debug!("failed to decode with temperature = {t_cur:.2}");
        }

        // emit the chosen sequence through the segment machinery
        {
            let best = &state.decoders[best_decoder_id];
            let seek_delta = best.seek_delta;
            let result_len = best.sequence.result_len;
            let tokens_cur: Vec<_> = best.sequence.tokens.clone();

            // keep the committed tokens as conditioning for the next window
            state.prompt_past.clear();
            if prompt.first() == Some(&token_prev) {
                let end = prompt.len() - prompt_init.len();
                state.prompt_past.extend_from_slice(&prompt[1..end]);
            }
            for token in tokens_cur.iter().take(result_len) {
                state.prompt_past.push(token.id);
            }

            if !tokens_cur.is_empty() && ctx.model.n_loaded > 0 {
                let mut i0 = 0usize;
                let mut t0 = seek + 2 * i64::from(tokens_cur[0].tid.saturating_sub(token_beg));
                let mut text_bytes: Vec<u8> = Vec::new();
                let mut speaker_turn_next = false;

                let mut i = 0usize;
                while i < tokens_cur.len() {
                    let token = tokens_cur[i];

                    if params.print_special || token.id < token_eot {
                        text_bytes.extend_from_slice(ctx.token_bytes(token.id));
                    }

                    if params.speaker_turn_enable && token.id == token_solm {
                        speaker_turn_next = true;
                    }

                    if token.id > token_beg && !params.single_segment {
                        let t1 = seek + 2 * i64::from(token.tid - token_beg);

                        if !text_bytes.is_empty() {
                            let text = String::from_utf8_lossy(&text_bytes).into_owned();
                            emit_segment(
                                ctx,
                                state,
                                &params,
                                Segment {
                                    t0,
                                    t1,
                                    text,
                                    tokens: tokens_cur[i0..=i].to_vec(),
                                    speaker_turn_next,
                                },
                            );
                        }

                        text_bytes.clear();
                        while i < tokens_cur.len() && tokens_cur[i].id > token_beg {
                            i += 1;
                        }
                        i -= 1;
                        t0 = t1;
                        i0 = i + 1;
                        speaker_turn_next = false;
                    }

                    i += 1;
                }

                if !text_bytes.is_empty() {
                    let t1 = seek + i64::from(seek_delta);
                    let text = String::from_utf8_lossy(&text_bytes).into_owned();
                    emit_segment(
                        ctx,
                        state,
                        &params,
                        Segment {
                            t0,
                            t1,
                            text,
                            tokens: tokens_cur[i0..].to_vec(),
                            speaker_turn_next,
                        },
                    );
                }
            }

            seek += i64::from(seek_delta);
        }

        if aborted {
            break;
        }
    }

    if window_failed && state.result_all.is_empty() {
        return Err(WhisperError::DecodeFailed(
            "every temperature fallback was exhausted without a usable sequence".to_string(),
        ));
    }

    Ok(state.result_all.len())
}

/// Push one segment, run the optional token-timestamp and wrapping
/// post-processing and fire the callback.
fn emit_segment(ctx: &Context, state: &mut State, params: &FullParams, segment: Segment) {
    if params.print_realtime {
        if params.print_timestamps {
            info!(
                "[{} --> {}]  {}",
                format_timestamp(segment.t0, false),
                format_timestamp(segment.t1, false),
                segment.text
            );
        } else {
            info!("{}", segment.text);
        }
    }

    state.result_all.push(segment);
    let mut n_new = 1usize;

    if params.token_timestamps {
        let i_segment = state.result_all.len() - 1;
        compute_token_level_timestamps(ctx, state, i_segment, params.thold_pt, params.thold_ptsum);
        if params.max_len > 0 {
            n_new = wrap_segment(ctx, state, params.max_len, params.split_on_word);
        }
    }

    if let Some(events) = &params.events {
        events.on_segment(ctx, state, n_new);
    }
}

pub(crate) fn full_parallel(
    ctx: &Context,
    state: &mut State,
    params: FullParams,
    samples: &[f32],
    n_processors: usize,
) -> Result<usize> {
    if n_processors <= 1 {
        return full_with_state(ctx, state, params, samples);
    }

    let offset_samples = crate::SAMPLE_RATE * params.offset_ms.max(0) as usize / 1000;
    let n_samples_per_processor = samples.len().saturating_sub(offset_samples) / n_processors;
    if n_samples_per_processor == 0 {
        return full_with_state(ctx, state, params, samples);
    }

    // the calling thread processes the first chunk, workers the rest
    let (ret, worker_states) = std::thread::scope(|s| {
        let handles: Vec<_> = (0..n_processors - 1)
            .map(|i| {
                let start = offset_samples + (i + 1) * n_samples_per_processor;
                let n_cur = if i == n_processors - 2 {
                    samples.len() - start
                } else {
                    n_samples_per_processor
                };
                let chunk = &samples[start..start + n_cur];

                let mut params_cur = params.clone();
                params_cur.offset_ms = 0;
                params_cur.print_progress = false;
                params_cur.print_realtime = false;
                params_cur.events = None;

                s.spawn(move || -> Result<State> {
                    let mut worker_state = ctx.create_state();
                    full_with_state(ctx, &mut worker_state, params_cur, chunk)?;
                    Ok(worker_state)
                })
            })
            .collect();

        let mut params_cur = params.clone();
        params_cur.print_realtime = false;
        let ret = full_with_state(
            ctx,
            state,
            params_cur,
            &samples[..offset_samples + n_samples_per_processor],
        );

        let worker_states: Vec<Result<State>> = handles
            .into_iter()
            .map(|h| match h.join() {
                Ok(res) => res,
                Err(_) => Err(WhisperError::DecodeFailed(
                    "worker thread panicked".to_string(),
                )),
            })
            .collect();

        (ret, worker_states)
    });
    ret?;

    let offset_t = i64::from(params.offset_ms.max(0) / 10);

    // merge the worker results in chunk order, shifting timestamps and
    // clamping against the previous chunk's tail
    for (i, worker_state) in worker_states.into_iter().enumerate() {
        let worker_state = worker_state?;
        let shift =
            (100 * ((i + 1) * n_samples_per_processor) / crate::SAMPLE_RATE) as i64 + offset_t;

        for mut segment in worker_state.result_all {
            segment.t0 += shift;
            segment.t1 += shift;

            // make sure that segments are not overlapping
            if let Some(last) = state.result_all.last() {
                segment.t0 = segment.t0.max(last.t1);
                segment.t1 = segment.t1.max(segment.t0);
            }

            state.result_all.push(segment);
            if let Some(events) = &params.events {
                events.on_segment(ctx, state, 1);
            }
        }

        state.timings.t_mel += worker_state.timings.t_mel;
        state.timings.t_encode += worker_state.timings.t_encode;
        state.timings.t_prompt += worker_state.timings.t_prompt;
        state.timings.t_decode += worker_state.timings.t_decode;
        state.timings.t_sample += worker_state.timings.t_sample;
        state.timings.n_encode += worker_state.timings.n_encode;
        state.timings.n_prompt += worker_state.timings.n_prompt;
        state.timings.n_decode += worker_state.timings.n_decode;
        state.timings.n_sample += worker_state.timings.n_sample;
    }

    info!("the audio has been split into {n_processors} chunks at the following times:");
    for i in 0..n_processors - 1 {
        let t = (100 * ((i + 1) * n_samples_per_processor) / crate::SAMPLE_RATE) as i64 + offset_t;
        info!("split {} - {}", i + 1, format_timestamp(t, false));
    }
    info!("the transcription quality may be degraded near these boundaries");

    Ok(state.result_all.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_formatting() {
        assert_eq!(format_timestamp(500, false), "00:00:05.000");
        assert_eq!(format_timestamp(6000, false), "00:01:00.000");
        assert_eq!(format_timestamp(360123, true), "01:00:01,230");
    }
}

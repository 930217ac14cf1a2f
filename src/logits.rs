//! Logit filtering: structural masks, log-softmax and the timestamp
//! preference rule, applied between decoding and sampling.

use crate::context::Context;
use crate::ops;
use crate::params::FullParams;
use crate::state::DecoderSlot;
use crate::CHUNK_SIZE;

/// Tokens that rarely belong in speech transcripts, suppressed on
/// request both bare and with a leading space.
const NON_SPEECH_TOKENS: [&str; 54] = [
    "\"", "#", "(", ")", "*", "+", "/", ":", ";", "<", "=", ">", "@", "[", "\\", "]", "^", "_",
    "`", "{", "|", "}", "~", "「", "」", "『", "』", "<<", ">>", "<<<", ">>>", "--", "---", "-(",
    "-[", "('", "(\"", "((", "))", "(((", ")))", "[[", "]]", "{{", "}}", "♪♪", "♪♪♪", "♩", "♪",
    "♫", "♬", "♭", "♮", "♯",
];

/// Apply temperature scaling, the structural masks and the probability
/// computation to the raw logits of `slot`'s last decode.
///
/// Populates `slot.logits`, `slot.logprobs` and `slot.probs`.
pub(crate) fn process_logits(
    ctx: &Context,
    params: &FullParams,
    slot: &mut DecoderSlot,
    raw_logits: &[f32],
    temperature: f32,
) {
    let vocab = &ctx.vocab;
    let n_logits = vocab.n_vocab;
    debug_assert_eq!(raw_logits.len(), n_logits);

    let tokens_cur = &slot.sequence.tokens;
    let is_initial = tokens_cur.is_empty();

    slot.logits.clear();
    slot.logits.extend_from_slice(raw_logits);
    let logits = &mut slot.logits;

    if temperature > 0.0 {
        for l in logits.iter_mut() {
            *l /= temperature;
        }
    }

    // user-supplied filter runs before the structural masks
    if let Some(events) = &params.events {
        events.filter_logits(ctx, tokens_cur, logits);
    }

    let beg = vocab.token_beg as usize;
    let eot = vocab.token_eot as usize;

    if params.suppress_blank && is_initial {
        logits[eot] = f32::NEG_INFINITY;
        if let Some(space) = vocab.id_for(" ") {
            logits[space as usize] = f32::NEG_INFINITY;
        }
    }

    logits[vocab.token_not as usize] = f32::NEG_INFINITY;
    logits[vocab.token_sot as usize] = f32::NEG_INFINITY;
    logits[vocab.token_nosp as usize] = f32::NEG_INFINITY;
    if !params.speaker_turn_enable {
        logits[vocab.token_solm as usize] = f32::NEG_INFINITY;
    }
    logits[vocab.token_translate as usize] = f32::NEG_INFINITY;
    logits[vocab.token_transcribe as usize] = f32::NEG_INFINITY;

    if params.suppress_non_speech_tokens {
        for token in NON_SPEECH_TOKENS {
            for candidate in [token.to_string(), format!(" {token}")] {
                if let Some(id) = vocab.id_for(&candidate) {
                    logits[id as usize] = f32::NEG_INFINITY;
                }
            }
        }
        // hyphens and single quotes are fine between words, not at the
        // start of one
        for candidate in [" -", " '"] {
            if let Some(id) = vocab.id_for(candidate) {
                logits[id as usize] = f32::NEG_INFINITY;
            }
        }
    }

    // timestamps come in pairs, except directly before EOT
    {
        let last_was_timestamp =
            !tokens_cur.is_empty() && tokens_cur[tokens_cur.len() - 1].id as usize >= beg;
        let penultimate_was_timestamp =
            tokens_cur.len() < 2 || tokens_cur[tokens_cur.len() - 2].id as usize >= beg;

        if last_was_timestamp {
            if penultimate_was_timestamp {
                for l in logits[beg..].iter_mut() {
                    *l = f32::NEG_INFINITY;
                }
            } else {
                for l in logits[..eot].iter_mut() {
                    *l = f32::NEG_INFINITY;
                }
            }
        }
    }

    // the first timestamp cannot be later than max_initial_ts
    if is_initial && params.max_initial_ts > 0.0 {
        let precision = CHUNK_SIZE as f32 / ctx.hparams.n_audio_ctx as f32;
        let tid0 = (params.max_initial_ts / precision).round() as usize;
        if beg + tid0 + 1 < n_logits {
            for l in logits[beg + tid0 + 1..].iter_mut() {
                *l = f32::NEG_INFINITY;
            }
        }
    }

    // once a timestamp was produced, later ones may not go back in time
    if slot.has_ts {
        let tid0 = (slot.seek_delta / 2) as usize;
        let end = (beg + tid0).min(n_logits);
        for l in logits[beg..end].iter_mut() {
            *l = f32::NEG_INFINITY;
        }
    }

    slot.logprobs.clear();
    slot.logprobs.extend_from_slice(logits);
    ops::log_softmax(&mut slot.logprobs);

    // if the probability mass on timestamps outweighs any single text
    // token, sample a timestamp
    {
        let logprobs = &mut slot.logprobs;
        let mut timestamp_logprob = f32::NEG_INFINITY;
        {
            let max = logprobs[beg..]
                .iter()
                .fold(f32::NEG_INFINITY, |a, &b| a.max(b));
            if max > f32::NEG_INFINITY {
                let sum: f32 = logprobs[beg..]
                    .iter()
                    .filter(|l| l.is_finite())
                    .map(|&l| (l - max).exp())
                    .sum();
                if sum > 0.0 {
                    timestamp_logprob = sum.ln() + max;
                }
            }
        }
        let max_text_token_logprob = logprobs[..beg]
            .iter()
            .fold(f32::NEG_INFINITY, |a, &b| a.max(b));

        if timestamp_logprob > max_text_token_logprob {
            for i in 0..beg {
                logits[i] = f32::NEG_INFINITY;
                logprobs[i] = f32::NEG_INFINITY;
            }
        }
    }

    slot.probs.clear();
    slot.probs.extend(
        slot.logits
            .iter()
            .zip(slot.logprobs.iter())
            .map(|(&l, &lp)| if l == f32::NEG_INFINITY { 0.0 } else { lp.exp() }),
    );
}

//! Audio encoder: convolutional stem, sinusoidal positional add, the
//! transformer stack, and the cross-attention KV precompute.

use std::time::Instant;

use candle_core::Tensor;
use candle_nn::Module;
use tracing::debug;

use crate::context::Context;
use crate::error::Result;
use crate::ops;
use crate::state::State;

/// Run the encoder over the 30 s window rooted at mel column
/// `mel_offset`, then refill the shared cross-attention cache.
///
/// Runs at most once per window; the cross cache stays read-only until
/// the next call.
pub(crate) fn encode(ctx: &Context, state: &mut State, mel_offset: usize) -> Result<()> {
    let started = Instant::now();

    let h = &ctx.hparams;
    let model = &ctx.model;
    let n_ctx = if state.exp_n_audio_ctx > 0 {
        state.exp_n_audio_ctx
    } else {
        h.n_audio_ctx
    };

    // 2*n_ctx mel columns centered on the window, zero-filled past the end
    let mel = &state.mel;
    let mut inp = vec![0.0f32; h.n_mels * 2 * n_ctx];
    let i0 = mel_offset.min(mel.n_len);
    let i1 = (mel_offset + 2 * n_ctx).min(mel.n_len);
    for j in 0..mel.n_mel.min(h.n_mels) {
        for i in i0..i1 {
            inp[j * 2 * n_ctx + (i - i0)] = mel.data[j * mel.n_len + i];
        }
    }
    let inp = Tensor::from_vec(inp, (1, h.n_mels, 2 * n_ctx), &ctx.device)?;

    // conv stem: kernel 3, strides (1, 2), GELU between and after
    let cur = model.conv1.forward(&inp)?.gelu()?;
    let cur = model.conv2.forward(&cur)?.gelu()?;

    // (1, n_state, n_ctx) -> (n_ctx, n_state), plus positional embedding
    let cur = cur.squeeze(0)?.transpose(0, 1)?.contiguous()?;
    let e_pe = model.e_pe.narrow(0, 0, n_ctx)?;
    let mut cur = (cur + e_pe)?;

    let scale = ops::kq_scale(h.n_audio_state, h.n_audio_head);
    for layer in &model.layers_encoder {
        // self-attention block, pre-norm
        let attn = {
            let x = layer.attn_ln.forward(&cur)?;
            let q = (layer.attn_q.forward(&x)? * scale)?;
            let k = (layer.attn_k.forward(&x)? * scale)?;
            let v = layer.attn_v.forward(&x)?;
            let x = ops::qkv_attention(&q, &k, &v, None, h.n_audio_head)?;
            layer.attn_out.forward(&x)?
        };
        cur = (cur + attn)?;

        // feed-forward block, pre-norm
        let mlp = {
            let x = layer.mlp_ln.forward(&cur)?;
            layer.mlp_2.forward(&layer.mlp_0.forward(&x)?.gelu()?)?
        };
        cur = (cur + mlp)?;
    }

    let cur = model.ln_post.forward(&cur)?;

    // pre-compute the cross-attention keys and values for every decoder
    // layer; K carries its scale factor once, here
    let cross_scale = ops::kq_scale(h.n_text_state, h.n_text_head);
    state.cross.clear();
    for layer in &model.layers_decoder {
        let k = (layer.cross_attn_k.forward(&cur)? * cross_scale)?;
        let v = layer.cross_attn_v.forward(&cur)?;
        state.cross.push_layer(k, v);
    }

    state.embd_enc = Some(cur);

    state.timings.t_encode += started.elapsed();
    state.timings.n_encode += 1;
    debug!(mel_offset, n_ctx, "encoded window in {:?}", started.elapsed());

    Ok(())
}

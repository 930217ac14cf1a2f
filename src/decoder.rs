//! Text decoder: masked self-attention over the per-decoder KV cache,
//! cross-attention over the shared encoder cache, and the tied-embedding
//! projection of the final position.

use candle_core::Tensor;
use candle_nn::Module;

use crate::context::Context;
use crate::error::Result;
use crate::kv::{CrossCache, KvCache};
use crate::ops;
use crate::vocab::Token;

/// Decode `tokens` given `n_past` cached positions.
///
/// Returns the logits over the full vocabulary for the last position
/// only. Exactly `tokens.len()` K/V rows are appended to `kv` at
/// positions `[n_past, n_past + n_tokens)`; the caller advances `kv.n`
/// on success.
pub(crate) fn decode(
    ctx: &Context,
    kv: &mut KvCache,
    cross: &CrossCache,
    tokens: &[Token],
    n_past: usize,
) -> Result<Vec<f32>> {
    let h = &ctx.hparams;
    let model = &ctx.model;
    let n_tokens = tokens.len();

    let ids = Tensor::new(tokens, &ctx.device)?;
    let tok = model.token_embedding.index_select(&ids, 0)?;
    let pos = model.d_pe.narrow(0, n_past, n_tokens)?;
    let mut cur = (tok + pos)?;

    // prompt calls need the causal mask; single-token generation sees the
    // whole cache anyway
    let mask = if n_tokens > 1 {
        Some(ops::causal_mask(n_tokens, n_past, &ctx.device)?)
    } else {
        None
    };

    let scale = ops::kq_scale(h.n_text_state, h.n_text_head);
    for (il, layer) in model.layers_decoder.iter().enumerate() {
        // masked self-attention against the accumulated cache
        let attn = {
            let x = layer.attn_ln.forward(&cur)?;
            let q = (layer.attn_q.forward(&x)? * scale)?;
            let k_cur = (layer.attn_k.forward(&x)? * scale)?;
            let v_cur = layer.attn_v.forward(&x)?;
            let (k, v) = kv.append(il, k_cur, v_cur, n_past)?;
            let x = ops::qkv_attention(&q, &k, &v, mask.as_ref(), h.n_text_head)?;
            layer.attn_out.forward(&x)?
        };
        cur = (cur + attn)?;

        // cross-attention; keys are pre-scaled, values span the full
        // encoder context, no mask
        let attn = {
            let x = layer.cross_attn_ln.forward(&cur)?;
            let q = (layer.cross_attn_q.forward(&x)? * scale)?;
            let (k, v) = cross.layer(il)?;
            let x = ops::qkv_attention(&q, k, v, None, h.n_text_head)?;
            layer.cross_attn_out.forward(&x)?
        };
        cur = (cur + attn)?;

        let mlp = {
            let x = layer.mlp_ln.forward(&cur)?;
            layer.mlp_2.forward(&layer.mlp_0.forward(&x)?.gelu()?)?
        };
        cur = (cur + mlp)?;
    }

    // last position only, through the tied token embedding
    let last = cur.narrow(0, n_tokens - 1, 1)?;
    let last = model.ln_out.forward(&last)?;
    let logits = last.matmul(&model.token_embedding.t()?)?;

    Ok(logits.squeeze(0)?.to_vec1()?)
}

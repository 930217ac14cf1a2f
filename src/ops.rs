//! Thin shim over the tensor library: attention plumbing shared by the
//! encoder and decoder, plus the host-side softmax helpers used on logit
//! vectors.

use candle_core::{Device, Tensor, D};

use crate::error::Result;

/// Symmetric attention scale `(n_state / n_head)^(-1/4)`, applied to both
/// queries and keys so their product carries the usual `1/sqrt(d)`.
pub(crate) fn kq_scale(n_state: usize, n_head: usize) -> f64 {
    (n_state as f64 / n_head as f64).powf(-0.25)
}

/// `(seq, n_state) -> (n_head, seq, head_dim)`
fn split_heads(x: &Tensor, n_head: usize) -> Result<Tensor> {
    let (seq, n_state) = x.dims2()?;
    Ok(x.reshape((seq, n_head, n_state / n_head))?
        .transpose(0, 1)?
        .contiguous()?)
}

/// `(n_head, seq, head_dim) -> (seq, n_state)`
fn merge_heads(x: &Tensor) -> Result<Tensor> {
    let (n_head, seq, head_dim) = x.dims3()?;
    Ok(x.transpose(0, 1)?
        .contiguous()?
        .reshape((seq, n_head * head_dim))?)
}

/// Scaled-dot-product attention over pre-scaled projections.
///
/// `q` is `(n_q, n_state)`, `k`/`v` are `(n_kv, n_state)`; both q and k
/// are expected to already carry their `kq_scale` factor. `mask`, when
/// present, is broadcast-added to the attention scores before softmax.
pub(crate) fn qkv_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: Option<&Tensor>,
    n_head: usize,
) -> Result<Tensor> {
    let q = split_heads(q, n_head)?;
    let k = split_heads(k, n_head)?;
    let v = split_heads(v, n_head)?;

    let mut scores = q.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)?;
    if let Some(mask) = mask {
        scores = scores.broadcast_add(mask)?;
    }
    let weights = candle_nn::ops::softmax_last_dim(&scores)?;
    let out = weights.matmul(&v)?;
    merge_heads(&out)
}

/// Causal mask for a prompt call: row `i` (query position `n_past + i`)
/// may attend to key positions `0 ..= n_past + i`.
pub(crate) fn causal_mask(n_tokens: usize, n_past: usize, device: &Device) -> Result<Tensor> {
    let n_kv = n_past + n_tokens;
    let mut data = vec![0f32; n_tokens * n_kv];
    for i in 0..n_tokens {
        for j in (n_past + i + 1)..n_kv {
            data[i * n_kv + j] = f32::NEG_INFINITY;
        }
    }
    Ok(Tensor::from_vec(data, (n_tokens, n_kv), device)?)
}

/// In-place log-softmax over a host vector, numerically stabilized by
/// subtracting the max. `-inf` entries stay `-inf`.
pub(crate) fn log_softmax(logits: &mut [f32]) {
    let max = logits.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let mut logsumexp = 0.0f32;
    for &l in logits.iter() {
        if l > f32::NEG_INFINITY {
            logsumexp += (l - max).exp();
        }
    }
    let logsumexp = logsumexp.ln() + max;
    for l in logits.iter_mut() {
        if *l > f32::NEG_INFINITY {
            *l -= logsumexp;
        }
    }
}

/// Softmax over a host vector, in place.
pub(crate) fn softmax(values: &mut [f32]) {
    log_softmax(values);
    for v in values.iter_mut() {
        *v = v.exp();
    }
}

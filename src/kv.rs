//! Self- and cross-attention key/value caches.
//!
//! Tensor handles are immutable, so "writing" rows appends to the stored
//! per-layer tensors and beam reshuffling is plain handle reassignment;
//! the buffered two-pass copy a mutable cache would need never arises.

use candle_core::Tensor;

use crate::error::{Result, WhisperError};

/// Per-decoder self-attention cache.
///
/// Occupancy `n` counts committed rows; the stored tensors may only ever
/// be exactly `n` rows long at the next [`append`](Self::append).
#[derive(Clone, Default)]
pub(crate) struct KvCache {
    k: Vec<Option<Tensor>>,
    v: Vec<Option<Tensor>>,
    pub n: usize,
}

impl KvCache {
    pub fn new(n_layer: usize) -> Self {
        Self {
            k: vec![None; n_layer],
            v: vec![None; n_layer],
            n: 0,
        }
    }

    /// Drop all cached rows. Occupancy returns to zero.
    pub fn reset(&mut self) {
        for slot in self.k.iter_mut().chain(self.v.iter_mut()) {
            *slot = None;
        }
        self.n = 0;
    }

    /// Append `k_cur`/`v_cur` (shape `(n_tokens, n_state)`) for `layer`
    /// at position `n_past` and return the full accumulated tensors.
    ///
    /// The caller advances `n` by `n_tokens` once the whole decode call
    /// succeeds; `append` itself leaves occupancy untouched.
    pub fn append(
        &mut self,
        layer: usize,
        k_cur: Tensor,
        v_cur: Tensor,
        n_past: usize,
    ) -> Result<(Tensor, Tensor)> {
        let k_full = Self::join(self.k[layer].take(), k_cur, n_past)?;
        let v_full = Self::join(self.v[layer].take(), v_cur, n_past)?;
        self.k[layer] = Some(k_full.clone());
        self.v[layer] = Some(v_full.clone());
        Ok((k_full, v_full))
    }

    fn join(prev: Option<Tensor>, cur: Tensor, n_past: usize) -> Result<Tensor> {
        match prev {
            None if n_past == 0 => Ok(cur),
            None => Err(WhisperError::KvCacheInit(format!(
                "decode at position {n_past} against an empty cache"
            ))),
            Some(prev) => {
                let have = prev.dim(0)?;
                if have < n_past {
                    return Err(WhisperError::KvCacheInit(format!(
                        "cache holds {have} rows, decode expected {n_past}"
                    )));
                }
                let prev = prev.narrow(0, 0, n_past)?;
                Ok(Tensor::cat(&[&prev, &cur], 0)?)
            }
        }
    }
}

/// Cross-attention cache shared by every decoder slot, filled once per
/// window right after the encoder runs and read-only afterwards.
#[derive(Clone, Default)]
pub(crate) struct CrossCache {
    k: Vec<Tensor>,
    v: Vec<Tensor>,
}

impl CrossCache {
    pub fn clear(&mut self) {
        self.k.clear();
        self.v.clear();
    }

    pub fn push_layer(&mut self, k: Tensor, v: Tensor) {
        self.k.push(k);
        self.v.push(v);
    }

    pub fn layer(&self, layer: usize) -> Result<(&Tensor, &Tensor)> {
        match (self.k.get(layer), self.v.get(layer)) {
            (Some(k), Some(v)) => Ok((k, v)),
            _ => Err(WhisperError::KvCacheInit(format!(
                "cross-attention cache has no layer {layer}; encoder has not run"
            ))),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.k.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;

    fn rows(n: usize, dim: usize, fill: f32) -> Tensor {
        Tensor::from_vec(vec![fill; n * dim], (n, dim), &Device::Cpu).unwrap()
    }

    #[test]
    fn append_accumulates_rows() {
        let mut kv = KvCache::new(1);
        let (k, _) = kv.append(0, rows(3, 4, 1.0), rows(3, 4, 1.0), 0).unwrap();
        assert_eq!(k.dims(), [3, 4]);
        kv.n += 3;

        let (k, v) = kv.append(0, rows(1, 4, 2.0), rows(1, 4, 2.0), kv.n).unwrap();
        assert_eq!(k.dims(), [4, 4]);
        assert_eq!(v.dims(), [4, 4]);
        kv.n += 1;
        assert_eq!(kv.n, 4);
    }

    #[test]
    fn reset_clears_occupancy() {
        let mut kv = KvCache::new(2);
        kv.append(0, rows(2, 4, 0.5), rows(2, 4, 0.5), 0).unwrap();
        kv.n += 2;
        kv.reset();
        assert_eq!(kv.n, 0);
        // decode from scratch works again
        kv.append(0, rows(1, 4, 0.5), rows(1, 4, 0.5), 0).unwrap();
    }

    #[test]
    fn stale_rows_are_dropped_on_overwrite() {
        let mut kv = KvCache::new(1);
        kv.append(0, rows(4, 2, 1.0), rows(4, 2, 1.0), 0).unwrap();
        kv.n += 4;
        // a clone that rewinds to n_past = 2 truncates the stale tail
        let (k, _) = kv.append(0, rows(1, 2, 9.0), rows(1, 2, 9.0), 2).unwrap();
        assert_eq!(k.dims(), [3, 2]);
        let last: Vec<Vec<f32>> = k.to_vec2().unwrap();
        assert_eq!(last[2], vec![9.0, 9.0]);
    }

    #[test]
    fn decode_against_missing_prefix_fails() {
        let mut kv = KvCache::new(1);
        let err = kv.append(0, rows(1, 2, 0.0), rows(1, 2, 0.0), 5);
        assert!(err.is_err());
    }

    #[test]
    fn cross_cache_layers() {
        let mut cross = CrossCache::default();
        assert!(cross.is_empty());
        cross.push_layer(rows(2, 2, 1.0), rows(2, 2, 2.0));
        let (k, v) = cross.layer(0).unwrap();
        assert_eq!(k.dims(), [2, 2]);
        assert_eq!(v.dims(), [2, 2]);
        assert!(cross.layer(1).is_err());
    }
}

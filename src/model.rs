//! Model hyperparameters and weight containers.
//!
//! The loader produces a flat name -> tensor map; [`Model::from_tensors`]
//! assembles it into typed `candle_nn` layers following the tensor naming
//! convention of the GGML Whisper export
//! (`encoder.blocks.{i}.{attn|mlp|attn_ln|mlp_ln}...`, `decoder.*`).

use std::collections::HashMap;
use std::fmt;

use candle_core::{DType, Device, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, LayerNorm, Linear};

use crate::error::{Result, WhisperError};

const LN_EPS: f64 = 1e-5;

/// Immutable after load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HParams {
    pub n_vocab: usize,
    pub n_audio_ctx: usize,
    pub n_audio_state: usize,
    pub n_audio_head: usize,
    pub n_audio_layer: usize,
    pub n_text_ctx: usize,
    pub n_text_state: usize,
    pub n_text_head: usize,
    pub n_text_layer: usize,
    pub n_mels: usize,
    /// Storage type id of the large tensors, after the quantization
    /// version factor has been divided out.
    pub ftype: i32,
    /// Quantization version of the file.
    pub qntvr: i32,
}

impl HParams {
    /// Size class, inferred from the encoder depth.
    pub fn model_type(&self) -> ModelType {
        match self.n_audio_layer {
            4 => ModelType::Tiny,
            6 => ModelType::Base,
            12 => ModelType::Small,
            24 => ModelType::Medium,
            32 => ModelType::Large,
            _ => ModelType::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
    Unknown,
}

impl fmt::Display for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Tiny => "tiny",
            Self::Base => "base",
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Mel filterbank stored in the model file, `[n_mel x n_fft]` row-major
/// with `n_fft = 1 + 400/2` frequency bins.
#[derive(Debug, Clone)]
pub struct Filters {
    pub n_mel: usize,
    pub n_fft: usize,
    pub data: Vec<f32>,
}

pub(crate) struct EncoderLayer {
    pub attn_ln: LayerNorm,
    pub attn_q: Linear,
    pub attn_k: Linear, // note: no bias for key
    pub attn_v: Linear,
    pub attn_out: Linear,
    pub mlp_ln: LayerNorm,
    pub mlp_0: Linear,
    pub mlp_2: Linear,
}

pub(crate) struct DecoderLayer {
    pub attn_ln: LayerNorm,
    pub attn_q: Linear,
    pub attn_k: Linear,
    pub attn_v: Linear,
    pub attn_out: Linear,
    pub cross_attn_ln: LayerNorm,
    pub cross_attn_q: Linear,
    pub cross_attn_k: Linear,
    pub cross_attn_v: Linear,
    pub cross_attn_out: Linear,
    pub mlp_ln: LayerNorm,
    pub mlp_0: Linear,
    pub mlp_2: Linear,
}

pub(crate) struct Model {
    // encoder
    pub e_pe: Tensor,
    pub conv1: Conv1d,
    pub conv2: Conv1d,
    pub layers_encoder: Vec<EncoderLayer>,
    pub ln_post: LayerNorm,
    // decoder
    pub d_pe: Tensor,
    pub token_embedding: Tensor,
    pub layers_decoder: Vec<DecoderLayer>,
    pub ln_out: LayerNorm,
    /// Number of tensor records read from the file. Zero means an
    /// empty (header-only) model running with zero weights.
    pub n_loaded: usize,
}

/// Every tensor the file must provide, with its shape in row-major
/// (slowest dimension first) order.
pub(crate) fn tensor_registry(h: &HParams) -> Vec<(String, Vec<usize>)> {
    let n_state = h.n_audio_state;
    let mut reg: Vec<(String, Vec<usize>)> = vec![
        (
            "encoder.positional_embedding".into(),
            vec![h.n_audio_ctx, n_state],
        ),
        ("encoder.conv1.weight".into(), vec![n_state, h.n_mels, 3]),
        ("encoder.conv1.bias".into(), vec![n_state, 1]),
        ("encoder.conv2.weight".into(), vec![n_state, n_state, 3]),
        ("encoder.conv2.bias".into(), vec![n_state, 1]),
        ("encoder.ln_post.weight".into(), vec![n_state]),
        ("encoder.ln_post.bias".into(), vec![n_state]),
        (
            "decoder.positional_embedding".into(),
            vec![h.n_text_ctx, h.n_text_state],
        ),
        (
            "decoder.token_embedding.weight".into(),
            vec![h.n_vocab, h.n_text_state],
        ),
        ("decoder.ln.weight".into(), vec![h.n_text_state]),
        ("decoder.ln.bias".into(), vec![h.n_text_state]),
    ];

    for i in 0..h.n_audio_layer {
        let p = format!("encoder.blocks.{i}");
        reg.push((format!("{p}.attn_ln.weight"), vec![n_state]));
        reg.push((format!("{p}.attn_ln.bias"), vec![n_state]));
        reg.push((format!("{p}.attn.query.weight"), vec![n_state, n_state]));
        reg.push((format!("{p}.attn.query.bias"), vec![n_state]));
        reg.push((format!("{p}.attn.key.weight"), vec![n_state, n_state]));
        reg.push((format!("{p}.attn.value.weight"), vec![n_state, n_state]));
        reg.push((format!("{p}.attn.value.bias"), vec![n_state]));
        reg.push((format!("{p}.attn.out.weight"), vec![n_state, n_state]));
        reg.push((format!("{p}.attn.out.bias"), vec![n_state]));
        reg.push((format!("{p}.mlp_ln.weight"), vec![n_state]));
        reg.push((format!("{p}.mlp_ln.bias"), vec![n_state]));
        reg.push((format!("{p}.mlp.0.weight"), vec![4 * n_state, n_state]));
        reg.push((format!("{p}.mlp.0.bias"), vec![4 * n_state]));
        reg.push((format!("{p}.mlp.2.weight"), vec![n_state, 4 * n_state]));
        reg.push((format!("{p}.mlp.2.bias"), vec![n_state]));
    }

    let n_state = h.n_text_state;
    for i in 0..h.n_text_layer {
        let p = format!("decoder.blocks.{i}");
        reg.push((format!("{p}.attn_ln.weight"), vec![n_state]));
        reg.push((format!("{p}.attn_ln.bias"), vec![n_state]));
        reg.push((format!("{p}.attn.query.weight"), vec![n_state, n_state]));
        reg.push((format!("{p}.attn.query.bias"), vec![n_state]));
        reg.push((format!("{p}.attn.key.weight"), vec![n_state, n_state]));
        reg.push((format!("{p}.attn.value.weight"), vec![n_state, n_state]));
        reg.push((format!("{p}.attn.value.bias"), vec![n_state]));
        reg.push((format!("{p}.attn.out.weight"), vec![n_state, n_state]));
        reg.push((format!("{p}.attn.out.bias"), vec![n_state]));
        reg.push((format!("{p}.cross_attn_ln.weight"), vec![n_state]));
        reg.push((format!("{p}.cross_attn_ln.bias"), vec![n_state]));
        reg.push((
            format!("{p}.cross_attn.query.weight"),
            vec![n_state, n_state],
        ));
        reg.push((format!("{p}.cross_attn.query.bias"), vec![n_state]));
        reg.push((format!("{p}.cross_attn.key.weight"), vec![n_state, n_state]));
        reg.push((
            format!("{p}.cross_attn.value.weight"),
            vec![n_state, n_state],
        ));
        reg.push((format!("{p}.cross_attn.value.bias"), vec![n_state]));
        reg.push((format!("{p}.cross_attn.out.weight"), vec![n_state, n_state]));
        reg.push((format!("{p}.cross_attn.out.bias"), vec![n_state]));
        reg.push((format!("{p}.mlp_ln.weight"), vec![n_state]));
        reg.push((format!("{p}.mlp_ln.bias"), vec![n_state]));
        reg.push((format!("{p}.mlp.0.weight"), vec![4 * n_state, n_state]));
        reg.push((format!("{p}.mlp.0.bias"), vec![4 * n_state]));
        reg.push((format!("{p}.mlp.2.weight"), vec![n_state, 4 * n_state]));
        reg.push((format!("{p}.mlp.2.bias"), vec![n_state]));
    }

    reg
}

struct TensorMap {
    tensors: HashMap<String, Tensor>,
}

impl TensorMap {
    fn take(&mut self, name: &str) -> Result<Tensor> {
        self.tensors
            .remove(name)
            .ok_or_else(|| WhisperError::UnknownTensorName(name.to_string()))
    }

    fn linear(&mut self, prefix: &str) -> Result<Linear> {
        let w = self.take(&format!("{prefix}.weight"))?;
        let b = self.take(&format!("{prefix}.bias"))?;
        Ok(Linear::new(w, Some(b)))
    }

    fn linear_no_bias(&mut self, prefix: &str) -> Result<Linear> {
        let w = self.take(&format!("{prefix}.weight"))?;
        Ok(Linear::new(w, None))
    }

    fn layer_norm(&mut self, prefix: &str) -> Result<LayerNorm> {
        let w = self.take(&format!("{prefix}.weight"))?;
        let b = self.take(&format!("{prefix}.bias"))?;
        Ok(LayerNorm::new(w, b, LN_EPS))
    }

    fn conv1d(&mut self, prefix: &str, stride: usize) -> Result<Conv1d> {
        let w = self.take(&format!("{prefix}.weight"))?;
        // stored as [n_state, 1], the module wants a flat bias
        let b = self.take(&format!("{prefix}.bias"))?.flatten_all()?;
        let cfg = Conv1dConfig {
            padding: 1,
            stride,
            ..Default::default()
        };
        Ok(Conv1d::new(w, Some(b), cfg))
    }
}

impl Model {
    /// Assemble the typed model from the loader's name map. `n_loaded == 0`
    /// builds an all-zero model (header-only files used by tests).
    pub(crate) fn from_tensors(
        hparams: &HParams,
        mut tensors: HashMap<String, Tensor>,
        n_loaded: usize,
        device: &Device,
    ) -> Result<Self> {
        if n_loaded == 0 {
            for (name, shape) in tensor_registry(hparams) {
                tensors.insert(name, Tensor::zeros(shape, DType::F32, device)?);
            }
        }

        let mut map = TensorMap { tensors };

        let mut layers_encoder = Vec::with_capacity(hparams.n_audio_layer);
        for i in 0..hparams.n_audio_layer {
            let p = format!("encoder.blocks.{i}");
            layers_encoder.push(EncoderLayer {
                attn_ln: map.layer_norm(&format!("{p}.attn_ln"))?,
                attn_q: map.linear(&format!("{p}.attn.query"))?,
                attn_k: map.linear_no_bias(&format!("{p}.attn.key"))?,
                attn_v: map.linear(&format!("{p}.attn.value"))?,
                attn_out: map.linear(&format!("{p}.attn.out"))?,
                mlp_ln: map.layer_norm(&format!("{p}.mlp_ln"))?,
                mlp_0: map.linear(&format!("{p}.mlp.0"))?,
                mlp_2: map.linear(&format!("{p}.mlp.2"))?,
            });
        }

        let mut layers_decoder = Vec::with_capacity(hparams.n_text_layer);
        for i in 0..hparams.n_text_layer {
            let p = format!("decoder.blocks.{i}");
            layers_decoder.push(DecoderLayer {
                attn_ln: map.layer_norm(&format!("{p}.attn_ln"))?,
                attn_q: map.linear(&format!("{p}.attn.query"))?,
                attn_k: map.linear_no_bias(&format!("{p}.attn.key"))?,
                attn_v: map.linear(&format!("{p}.attn.value"))?,
                attn_out: map.linear(&format!("{p}.attn.out"))?,
                cross_attn_ln: map.layer_norm(&format!("{p}.cross_attn_ln"))?,
                cross_attn_q: map.linear(&format!("{p}.cross_attn.query"))?,
                cross_attn_k: map.linear_no_bias(&format!("{p}.cross_attn.key"))?,
                cross_attn_v: map.linear(&format!("{p}.cross_attn.value"))?,
                cross_attn_out: map.linear(&format!("{p}.cross_attn.out"))?,
                mlp_ln: map.layer_norm(&format!("{p}.mlp_ln"))?,
                mlp_0: map.linear(&format!("{p}.mlp.0"))?,
                mlp_2: map.linear(&format!("{p}.mlp.2"))?,
            });
        }

        Ok(Self {
            e_pe: map.take("encoder.positional_embedding")?,
            conv1: map.conv1d("encoder.conv1", 1)?,
            conv2: map.conv1d("encoder.conv2", 2)?,
            layers_encoder,
            ln_post: map.layer_norm("encoder.ln_post")?,
            d_pe: map.take("decoder.positional_embedding")?,
            token_embedding: map.take("decoder.token_embedding.weight")?,
            layers_decoder,
            ln_out: map.layer_norm("decoder.ln")?,
            n_loaded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_hparams() -> HParams {
        HParams {
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
        }
    }

    #[test]
    fn size_class_from_layer_count() {
        let mut h = tiny_hparams();
        assert_eq!(h.model_type(), ModelType::Tiny);
        h.n_audio_layer = 6;
        assert_eq!(h.model_type(), ModelType::Base);
        h.n_audio_layer = 12;
        assert_eq!(h.model_type(), ModelType::Small);
        h.n_audio_layer = 24;
        assert_eq!(h.model_type(), ModelType::Medium);
        h.n_audio_layer = 32;
        assert_eq!(h.model_type(), ModelType::Large);
        h.n_audio_layer = 5;
        assert_eq!(h.model_type(), ModelType::Unknown);
    }

    #[test]
    fn registry_covers_all_blocks() {
        let h = tiny_hparams();
        let reg = tensor_registry(&h);
        // 11 top-level tensors + 15 per encoder layer + 25 per decoder layer
        assert_eq!(reg.len(), 11 + 15 * h.n_audio_layer + 25 * h.n_text_layer);
        assert!(reg
            .iter()
            .any(|(n, s)| n == "decoder.blocks.3.cross_attn.key.weight" && s == &vec![384, 384]));
    }

    #[test]
    fn empty_model_assembles_zero_weights() {
        let h = tiny_hparams();
        let model =
            Model::from_tensors(&h, HashMap::new(), 0, &Device::Cpu).expect("zero model loads");
        assert_eq!(model.n_loaded, 0);
        assert_eq!(model.e_pe.dims(), [1500, 384]);
        assert_eq!(model.token_embedding.dims(), [51864, 384]);
        assert_eq!(model.layers_decoder.len(), 4);
    }
}

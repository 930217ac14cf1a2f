//! GGML model file parsing.
//!
//! The format is little-endian throughout: magic, eleven `i32`
//! hyperparameters, the mel filterbank, the length-prefixed vocabulary
//! and tensor records until EOF. Quantized payloads are stored in fixed
//! size blocks and dequantized to f32 here; compute always runs in f32.

use std::collections::HashMap;
use std::io::Read;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use candle_core::{Device, Tensor};
use half::f16;
use tracing::{debug, info, warn};

use crate::error::{Result, WhisperError};
use crate::model::{tensor_registry, Filters, HParams};
use crate::vocab::Vocab;

/// `"ggml"` as a little-endian u32.
pub const GGML_MAGIC: u32 = 0x6767_6d6c;

/// `hparams.ftype` packs the quantization version above this factor.
pub const QNT_VERSION_FACTOR: i32 = 1000;

/// Storage types a tensor record may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GgmlType {
    F32,
    F16,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
}

impl GgmlType {
    /// Per-record type id, as stored in tensor records.
    fn from_type_id(id: i32) -> Option<Self> {
        match id {
            0 => Some(Self::F32),
            1 => Some(Self::F16),
            2 => Some(Self::Q4_0),
            3 => Some(Self::Q4_1),
            6 => Some(Self::Q5_0),
            7 => Some(Self::Q5_1),
            8 => Some(Self::Q8_0),
            _ => None,
        }
    }

    /// File-level ftype id (after the quantization version is divided
    /// out), mapped to the storage type of the large tensors.
    pub(crate) fn from_ftype(ftype: i32) -> Option<Self> {
        match ftype {
            0 => Some(Self::F32),
            1 => Some(Self::F16),
            2 => Some(Self::Q4_0),
            3 | 4 => Some(Self::Q4_1),
            7 => Some(Self::Q8_0),
            8 => Some(Self::Q5_0),
            9 => Some(Self::Q5_1),
            _ => None,
        }
    }

    /// Elements per quantization block.
    pub fn block_size(self) -> usize {
        match self {
            Self::F32 | Self::F16 => 1,
            _ => 32,
        }
    }

    /// Bytes per block.
    pub fn type_size(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
            Self::Q4_0 => 18,
            Self::Q4_1 => 20,
            Self::Q5_0 => 22,
            Self::Q5_1 => 24,
            Self::Q8_0 => 34,
        }
    }

    fn is_quantized(self) -> bool {
        !matches!(self, Self::F32 | Self::F16)
    }
}

#[derive(Debug)]
pub(crate) struct LoadedModel {
    pub hparams: HParams,
    pub filters: Filters,
    pub vocab: Vocab,
    pub tensors: HashMap<String, Tensor>,
    pub n_loaded: usize,
}

/// Read a little-endian i32, or `None` on a clean EOF at the first byte.
fn try_read_i32<R: Read>(reader: &mut R) -> Result<Option<i32>> {
    let mut buf = [0u8; 4];
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(WhisperError::TruncatedStream(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "tensor record cut short",
            )));
        }
        filled += n;
    }
    Ok(Some(i32::from_le_bytes(buf)))
}

fn read_f32s<R: Read>(reader: &mut R, n: usize) -> Result<Vec<f32>> {
    let mut bytes = vec![0u8; n * 4];
    reader.read_exact(&mut bytes)?;
    let mut out = vec![0f32; n];
    LittleEndian::read_f32_into(&bytes, &mut out);
    Ok(out)
}

fn dequantize(ttype: GgmlType, raw: &[u8], nelements: usize) -> Vec<f32> {
    let qk = ttype.block_size();
    let ts = ttype.type_size();
    let mut out = Vec::with_capacity(nelements);

    for block in raw.chunks_exact(ts) {
        match ttype {
            GgmlType::Q4_0 => {
                let d = f16::from_le_bytes([block[0], block[1]]).to_f32();
                let qs = &block[2..18];
                let mut lo = [0f32; 16];
                let mut hi = [0f32; 16];
                for (j, &q) in qs.iter().enumerate() {
                    lo[j] = (f32::from(q & 0x0F) - 8.0) * d;
                    hi[j] = (f32::from(q >> 4) - 8.0) * d;
                }
                out.extend_from_slice(&lo);
                out.extend_from_slice(&hi);
            }
            GgmlType::Q4_1 => {
                let d = f16::from_le_bytes([block[0], block[1]]).to_f32();
                let m = f16::from_le_bytes([block[2], block[3]]).to_f32();
                let qs = &block[4..20];
                let mut lo = [0f32; 16];
                let mut hi = [0f32; 16];
                for (j, &q) in qs.iter().enumerate() {
                    lo[j] = f32::from(q & 0x0F) * d + m;
                    hi[j] = f32::from(q >> 4) * d + m;
                }
                out.extend_from_slice(&lo);
                out.extend_from_slice(&hi);
            }
            GgmlType::Q5_0 => {
                let d = f16::from_le_bytes([block[0], block[1]]).to_f32();
                let qh = u32::from_le_bytes([block[2], block[3], block[4], block[5]]);
                let qs = &block[6..22];
                let mut lo = [0f32; 16];
                let mut hi = [0f32; 16];
                for (j, &q) in qs.iter().enumerate() {
                    let xh_0 = ((qh >> j) << 4) & 0x10;
                    let xh_1 = (qh >> (j + 12)) & 0x10;
                    lo[j] = ((u32::from(q & 0x0F) | xh_0) as f32 - 16.0) * d;
                    hi[j] = ((u32::from(q >> 4) | xh_1) as f32 - 16.0) * d;
                }
                out.extend_from_slice(&lo);
                out.extend_from_slice(&hi);
            }
            GgmlType::Q5_1 => {
                let d = f16::from_le_bytes([block[0], block[1]]).to_f32();
                let m = f16::from_le_bytes([block[2], block[3]]).to_f32();
                let qh = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);
                let qs = &block[8..24];
                let mut lo = [0f32; 16];
                let mut hi = [0f32; 16];
                for (j, &q) in qs.iter().enumerate() {
                    let xh_0 = ((qh >> j) << 4) & 0x10;
                    let xh_1 = (qh >> (j + 12)) & 0x10;
                    lo[j] = (u32::from(q & 0x0F) | xh_0) as f32 * d + m;
                    hi[j] = (u32::from(q >> 4) | xh_1) as f32 * d + m;
                }
                out.extend_from_slice(&lo);
                out.extend_from_slice(&hi);
            }
            GgmlType::Q8_0 => {
                let d = f16::from_le_bytes([block[0], block[1]]).to_f32();
                for &q in &block[2..34] {
                    out.push(f32::from(q as i8) * d);
                }
            }
            GgmlType::F32 | GgmlType::F16 => unreachable!(),
        }
    }

    debug_assert_eq!(out.len(), nelements / qk * qk);
    out.truncate(nelements);
    out
}

fn payload_to_f32(ttype: GgmlType, raw: &[u8], nelements: usize) -> Result<Vec<f32>> {
    match ttype {
        GgmlType::F32 => {
            let mut out = vec![0f32; nelements];
            LittleEndian::read_f32_into(raw, &mut out);
            Ok(out)
        }
        GgmlType::F16 => {
            let mut bits = vec![0u16; nelements];
            LittleEndian::read_u16_into(raw, &mut bits);
            Ok(bits.into_iter().map(|b| f16::from_bits(b).to_f32()).collect())
        }
        _ => {
            debug_assert!(ttype.is_quantized());
            if cfg!(target_endian = "big") {
                return Err(WhisperError::QuantizedOnBigEndian);
            }
            Ok(dequantize(ttype, raw, nelements))
        }
    }
}

/// Parse a complete model file.
pub(crate) fn load_model<R: Read>(reader: &mut R, device: &Device) -> Result<LoadedModel> {
    let magic = reader.read_u32::<LittleEndian>()?;
    if magic != GGML_MAGIC {
        return Err(WhisperError::InvalidMagic(magic));
    }

    let hparams = {
        let n_vocab = reader.read_i32::<LittleEndian>()?;
        let n_audio_ctx = reader.read_i32::<LittleEndian>()?;
        let n_audio_state = reader.read_i32::<LittleEndian>()?;
        let n_audio_head = reader.read_i32::<LittleEndian>()?;
        let n_audio_layer = reader.read_i32::<LittleEndian>()?;
        let n_text_ctx = reader.read_i32::<LittleEndian>()?;
        let n_text_state = reader.read_i32::<LittleEndian>()?;
        let n_text_head = reader.read_i32::<LittleEndian>()?;
        let n_text_layer = reader.read_i32::<LittleEndian>()?;
        let n_mels = reader.read_i32::<LittleEndian>()?;
        let ftype_raw = reader.read_i32::<LittleEndian>()?;

        let qntvr = ftype_raw / QNT_VERSION_FACTOR;
        let ftype = ftype_raw % QNT_VERSION_FACTOR;
        let wtype =
            GgmlType::from_ftype(ftype).ok_or(WhisperError::UnknownFloatType(ftype))?;

        debug_assert_eq!(n_text_state, n_audio_state);

        let hparams = HParams {
            n_vocab: n_vocab as usize,
            n_audio_ctx: n_audio_ctx as usize,
            n_audio_state: n_audio_state as usize,
            n_audio_head: n_audio_head as usize,
            n_audio_layer: n_audio_layer as usize,
            n_text_ctx: n_text_ctx as usize,
            n_text_state: n_text_state as usize,
            n_text_head: n_text_head as usize,
            n_text_layer: n_text_layer as usize,
            n_mels: n_mels as usize,
            ftype,
            qntvr,
        };

        info!(
            n_vocab = hparams.n_vocab,
            n_audio_ctx = hparams.n_audio_ctx,
            n_audio_state = hparams.n_audio_state,
            n_audio_head = hparams.n_audio_head,
            n_audio_layer = hparams.n_audio_layer,
            n_text_ctx = hparams.n_text_ctx,
            n_text_state = hparams.n_text_state,
            n_text_head = hparams.n_text_head,
            n_text_layer = hparams.n_text_layer,
            n_mels = hparams.n_mels,
            ftype = hparams.ftype,
            qntvr = hparams.qntvr,
            wtype = ?wtype,
            "model type = {}",
            hparams.model_type()
        );

        hparams
    };

    // mel filters
    let filters = {
        let n_mel = reader.read_i32::<LittleEndian>()? as usize;
        let n_fft = reader.read_i32::<LittleEndian>()? as usize;
        let data = read_f32s(reader, n_mel * n_fft)?;
        Filters { n_mel, n_fft, data }
    };

    // vocab
    let vocab = {
        let n_vocab_loaded = reader.read_i32::<LittleEndian>()? as usize;
        let mut entries = Vec::with_capacity(n_vocab_loaded);
        for _ in 0..n_vocab_loaded {
            let len = reader.read_u32::<LittleEndian>()? as usize;
            let mut word = vec![0u8; len];
            reader.read_exact(&mut word)?;
            entries.push(word);
        }
        Vocab::new(hparams.n_vocab, entries)
    };

    // tensor records until EOF
    let registry: HashMap<String, Vec<usize>> = tensor_registry(&hparams).into_iter().collect();
    let mut tensors = HashMap::with_capacity(registry.len());
    let mut total_size = 0usize;
    let mut n_loaded = 0usize;

    while let Some(n_dims) = try_read_i32(reader)? {
        let name_len = reader.read_i32::<LittleEndian>()? as usize;
        let type_id = reader.read_i32::<LittleEndian>()?;

        let n_dims = n_dims as usize;
        if n_dims == 0 || n_dims > 4 {
            return Err(WhisperError::TruncatedStream(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("tensor record with {n_dims} dimensions"),
            )));
        }
        let mut ne = [1usize; 4];
        let mut nelements = 1usize;
        for dim in ne.iter_mut().take(n_dims) {
            *dim = reader.read_i32::<LittleEndian>()? as usize;
            nelements *= *dim;
        }

        let mut name_bytes = vec![0u8; name_len];
        reader.read_exact(&mut name_bytes)?;
        let name = String::from_utf8_lossy(&name_bytes).into_owned();

        let ttype = GgmlType::from_type_id(type_id)
            .ok_or(WhisperError::UnknownFloatType(type_id))?;

        // record dims are fastest-first; candle shapes are slowest-first
        let shape: Vec<usize> = ne[..n_dims].iter().rev().copied().collect();

        let expected = registry
            .get(&name)
            .ok_or_else(|| WhisperError::UnknownTensorName(name.clone()))?;
        if &shape != expected {
            return Err(WhisperError::TensorShapeMismatch {
                name,
                got: shape,
                expected: expected.clone(),
            });
        }

        if nelements % ttype.block_size() != 0 {
            return Err(WhisperError::TensorSizeMismatch {
                name,
                got: nelements,
                expected: nelements / ttype.block_size() * ttype.block_size(),
            });
        }
        let nbytes = nelements / ttype.block_size() * ttype.type_size();

        let mut raw = vec![0u8; nbytes];
        reader.read_exact(&mut raw)?;

        let data = payload_to_f32(ttype, &raw, nelements)?;
        tensors.insert(name, Tensor::from_vec(data, shape, device)?);

        total_size += nbytes;
        n_loaded += 1;
    }

    debug!(
        "model size = {:7.2} MB, {} tensors",
        total_size as f64 / 1024.0 / 1024.0,
        n_loaded
    );

    if n_loaded == 0 {
        warn!("no tensors loaded from model file - assuming empty model for testing");
    } else if n_loaded != registry.len() {
        return Err(WhisperError::MissingTensors {
            expected: registry.len(),
            got: n_loaded,
        });
    }

    Ok(LoadedModel {
        hparams,
        filters,
        vocab,
        tensors,
        n_loaded,
    })
}

#[cfg(test)]
pub(crate) mod testutil {
    use byteorder::{LittleEndian, WriteBytesExt};

    use super::GGML_MAGIC;
    use crate::model::{Filters, HParams};

    /// Serialize a header-only model file (no tensor records).
    pub(crate) fn write_header(hparams: &HParams, filters: &Filters, vocab: &[&[u8]]) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.write_u32::<LittleEndian>(GGML_MAGIC).unwrap();
        for v in [
            hparams.n_vocab,
            hparams.n_audio_ctx,
            hparams.n_audio_state,
            hparams.n_audio_head,
            hparams.n_audio_layer,
            hparams.n_text_ctx,
            hparams.n_text_state,
            hparams.n_text_head,
            hparams.n_text_layer,
            hparams.n_mels,
        ] {
            buf.write_i32::<LittleEndian>(v as i32).unwrap();
        }
        buf.write_i32::<LittleEndian>(hparams.ftype + hparams.qntvr * super::QNT_VERSION_FACTOR)
            .unwrap();

        buf.write_i32::<LittleEndian>(filters.n_mel as i32).unwrap();
        buf.write_i32::<LittleEndian>(filters.n_fft as i32).unwrap();
        for &f in &filters.data {
            buf.write_f32::<LittleEndian>(f).unwrap();
        }

        buf.write_i32::<LittleEndian>(vocab.len() as i32).unwrap();
        for word in vocab {
            buf.write_u32::<LittleEndian>(word.len() as u32).unwrap();
            buf.extend_from_slice(word);
        }

        buf
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::model::ModelType;

    fn small_hparams() -> HParams {
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
            qntvr: 2,
        }
    }

    fn small_filters() -> Filters {
        Filters {
            n_mel: 2,
            n_fft: 3,
            data: vec![0.0, 0.5, 1.0, -1.0, 0.25, 0.125],
        }
    }

    #[test]
    fn header_round_trip() {
        let hparams = small_hparams();
        let filters = small_filters();
        let bytes = testutil::write_header(&hparams, &filters, &[b"a", b"bc", b""]);

        let loaded = load_model(&mut Cursor::new(&bytes), &Device::Cpu).unwrap();
        assert_eq!(loaded.hparams, hparams);
        assert_eq!(loaded.hparams.model_type(), ModelType::Tiny);
        assert_eq!(loaded.filters.data, filters.data);
        assert_eq!(loaded.vocab.token_bytes(1), b"bc");
        assert_eq!(loaded.n_loaded, 0);

        // re-serializing the loaded header yields the identical stream
        let again = testutil::write_header(
            &loaded.hparams,
            &loaded.filters,
            &[b"a", b"bc", b""],
        );
        assert_eq!(bytes, again);
    }

    #[test]
    fn bad_magic_is_rejected() {
        let bytes = 0xdead_beefu32.to_le_bytes();
        match load_model(&mut Cursor::new(&bytes[..]), &Device::Cpu) {
            Err(WhisperError::InvalidMagic(m)) => assert_eq!(m, 0xdead_beef),
            other => panic!("expected InvalidMagic, got {other:?}"),
        }
    }

    #[test]
    fn unknown_ftype_is_rejected() {
        let mut hparams = small_hparams();
        hparams.ftype = 42;
        let bytes = testutil::write_header(&hparams, &small_filters(), &[]);
        match load_model(&mut Cursor::new(&bytes), &Device::Cpu) {
            Err(WhisperError::UnknownFloatType(42)) => {}
            other => panic!("expected UnknownFloatType, got {other:?}"),
        }
    }

    #[test]
    fn truncated_stream_is_rejected() {
        let bytes = testutil::write_header(&small_hparams(), &small_filters(), &[b"abc"]);
        let cut = &bytes[..bytes.len() - 2];
        match load_model(&mut Cursor::new(cut), &Device::Cpu) {
            Err(WhisperError::TruncatedStream(_)) => {}
            other => panic!("expected TruncatedStream, got {other:?}"),
        }
    }

    #[test]
    fn unknown_tensor_name_is_rejected() {
        let mut bytes = testutil::write_header(&small_hparams(), &small_filters(), &[]);
        // one bogus record: n_dims=1, name_len=3, type=F32, ne=[2], "foo"
        for v in [1i32, 3, 0, 2] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes.extend_from_slice(b"foo");
        bytes.extend_from_slice(&[0u8; 8]);
        match load_model(&mut Cursor::new(&bytes), &Device::Cpu) {
            Err(WhisperError::UnknownTensorName(name)) => assert_eq!(name, "foo"),
            other => panic!("expected UnknownTensorName, got {other:?}"),
        }
    }

    #[test]
    fn wrong_shape_is_rejected() {
        let mut bytes = testutil::write_header(&small_hparams(), &small_filters(), &[]);
        // decoder.ln.weight should be [384]
        let name = b"decoder.ln.weight";
        for v in [1i32, name.len() as i32, 0, 7] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes.extend_from_slice(name);
        bytes.extend_from_slice(&vec![0u8; 7 * 4]);
        match load_model(&mut Cursor::new(&bytes), &Device::Cpu) {
            Err(WhisperError::TensorShapeMismatch { got, expected, .. }) => {
                assert_eq!(got, vec![7]);
                assert_eq!(expected, vec![384]);
            }
            other => panic!("expected TensorShapeMismatch, got {other:?}"),
        }
    }

    #[test]
    fn partial_tensor_set_is_rejected() {
        let mut bytes = testutil::write_header(&small_hparams(), &small_filters(), &[]);
        let name = b"decoder.ln.weight";
        for v in [1i32, name.len() as i32, 0, 384] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes.extend_from_slice(name);
        bytes.extend_from_slice(&vec![0u8; 384 * 4]);
        match load_model(&mut Cursor::new(&bytes), &Device::Cpu) {
            Err(WhisperError::MissingTensors { got: 1, .. }) => {}
            other => panic!("expected MissingTensors, got {other:?}"),
        }
    }

    #[test]
    fn q8_0_dequantizes() {
        // one block: d = 0.5, qs = [-2, -1, 0, 1, ... 29]
        let mut raw = Vec::new();
        raw.extend_from_slice(&f16::from_f32(0.5).to_le_bytes());
        for q in -2i8..30 {
            raw.push(q as u8);
        }
        let out = dequantize(GgmlType::Q8_0, &raw, 32);
        assert_eq!(out.len(), 32);
        assert!((out[0] + 1.0).abs() < 1e-3);
        assert!((out[31] - 14.5).abs() < 1e-2);
    }

    #[test]
    fn q4_0_dequantizes_halves() {
        // one block, d = 1.0, all nibbles = 0x8 -> value 0 everywhere
        let mut raw = Vec::new();
        raw.extend_from_slice(&f16::from_f32(1.0).to_le_bytes());
        raw.extend_from_slice(&[0x88u8; 16]);
        let out = dequantize(GgmlType::Q4_0, &raw, 32);
        assert!(out.iter().all(|&v| v.abs() < 1e-6));
    }

    #[test]
    fn block_descriptors() {
        assert_eq!(GgmlType::Q4_0.type_size(), 18);
        assert_eq!(GgmlType::Q4_1.type_size(), 20);
        assert_eq!(GgmlType::Q5_0.type_size(), 22);
        assert_eq!(GgmlType::Q5_1.type_size(), 24);
        assert_eq!(GgmlType::Q8_0.type_size(), 34);
        assert!(GgmlType::Q8_0.is_quantized());
        assert!(!GgmlType::F16.is_quantized());
    }
}

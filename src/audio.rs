//! Log-mel spectrogram front end.
//!
//! Converts 16 kHz mono PCM into the 80-bin log-mel representation the
//! encoder consumes: reflective/zero padding, periodic Hann window with
//! hop 160, power spectrum via a table-driven Cooley-Tukey FFT, mel
//! filterbank projection, log compression with clamping and the final
//! `(x + 4) / 4` normalization.

use crate::error::{Result, WhisperError};
use crate::model::Filters;
use crate::{CHUNK_SIZE, HOP_LENGTH, N_FFT, SAMPLE_RATE};

/// Row-major `[n_mel x n_len]` spectrogram.
#[derive(Debug, Default, Clone)]
pub struct Mel {
    pub n_mel: usize,
    /// Total columns, including the 30 s of trailing silence padding.
    pub n_len: usize,
    /// Columns covering the original (unpadded) samples.
    pub n_len_org: usize,
    pub data: Vec<f32>,
}

struct SinCosTable {
    sin: Vec<f32>,
    cos: Vec<f32>,
}

impl SinCosTable {
    fn new(n: usize) -> Self {
        let mut sin = Vec::with_capacity(n);
        let mut cos = Vec::with_capacity(n);
        for i in 0..n {
            let theta = 2.0 * std::f64::consts::PI * i as f64 / n as f64;
            sin.push(theta.sin() as f32);
            cos.push(theta.cos() as f32);
        }
        Self { sin, cos }
    }
}

/// Naive DFT for the odd sub-lengths the radix-2 recursion bottoms out on.
/// Real input, interleaved complex output.
fn dft(inp: &[f32], out: &mut Vec<f32>, table: &SinCosTable) {
    let n = inp.len();
    out.resize(n * 2, 0.0);
    let step = table.sin.len() / n;

    for k in 0..n {
        let mut re = 0.0f32;
        let mut im = 0.0f32;
        for (j, &x) in inp.iter().enumerate() {
            let idx = (k * j * step) % table.sin.len();
            re += x * table.cos[idx];
            im -= x * table.sin[idx];
        }
        out[k * 2] = re;
        out[k * 2 + 1] = im;
    }
}

/// Cooley-Tukey FFT, splitting even/odd while the length stays even.
/// Real input, interleaved complex output.
fn fft(inp: &[f32], out: &mut Vec<f32>, table: &SinCosTable) {
    let n = inp.len();
    out.resize(n * 2, 0.0);

    if n == 1 {
        out[0] = inp[0];
        out[1] = 0.0;
        return;
    }
    if n % 2 == 1 {
        dft(inp, out, table);
        return;
    }

    let even: Vec<f32> = inp.iter().step_by(2).copied().collect();
    let odd: Vec<f32> = inp.iter().skip(1).step_by(2).copied().collect();

    let mut even_fft = Vec::new();
    let mut odd_fft = Vec::new();
    fft(&even, &mut even_fft, table);
    fft(&odd, &mut odd_fft, table);

    let step = table.sin.len() / n;
    for k in 0..n / 2 {
        let idx = k * step;
        let re = table.cos[idx];
        let im = -table.sin[idx];

        let re_odd = odd_fft[2 * k];
        let im_odd = odd_fft[2 * k + 1];

        out[2 * k] = even_fft[2 * k] + re * re_odd - im * im_odd;
        out[2 * k + 1] = even_fft[2 * k + 1] + re * im_odd + im * re_odd;

        out[2 * (k + n / 2)] = even_fft[2 * k] - re * re_odd + im * im_odd;
        out[2 * (k + n / 2) + 1] = even_fft[2 * k + 1] - re * im_odd - im * re_odd;
    }
}

fn hann_window(length: usize) -> Vec<f32> {
    // periodic variant, matching torch.hann_window(window_length, periodic=True)
    (0..length)
        .map(|i| {
            0.5 * (1.0 - ((2.0 * std::f64::consts::PI * i as f64) / length as f64).cos()) as f32
        })
        .collect()
}

/// One worker's share of the spectrogram: columns `i` with
/// `i % n_threads == ith`, returned as `(column, n_mel values)` pairs.
#[allow(clippy::too_many_arguments)]
fn mel_worker(
    ith: usize,
    n_threads: usize,
    hann: &[f32],
    samples: &[f32],
    n_samples: usize,
    n_len: usize,
    filters: &Filters,
    table: &SinCosTable,
) -> Vec<(usize, Vec<f32>)> {
    let frame_size = N_FFT;
    let frame_step = HOP_LENGTH;
    // bin_0 to bin_nyquist
    let n_fft_bins = 1 + frame_size / 2;

    let mut fft_in = vec![0.0f32; frame_size];
    let mut fft_out: Vec<f32> = Vec::new();
    let mut cols = Vec::new();

    let n_active = usize::min(n_samples / frame_step + 1, n_len);

    let mut i = ith;
    while i < n_active {
        let offset = i * frame_step;
        let n_real = usize::min(frame_size, n_samples - offset);
        for j in 0..n_real {
            fft_in[j] = hann[j] * samples[offset + j];
        }
        for x in fft_in.iter_mut().skip(n_real) {
            *x = 0.0;
        }

        fft(&fft_in, &mut fft_out, table);
        for j in 0..frame_size {
            fft_out[j] = fft_out[2 * j] * fft_out[2 * j] + fft_out[2 * j + 1] * fft_out[2 * j + 1];
        }

        let mut col = Vec::with_capacity(filters.n_mel);
        for j in 0..filters.n_mel {
            let mut sum = 0.0f64;
            for k in 0..n_fft_bins {
                sum += f64::from(fft_out[k] * filters.data[j * filters.n_fft + k]);
            }
            col.push(sum.max(1e-10).log10() as f32);
        }
        cols.push((i, col));
        i += n_threads;
    }

    // windows rooted past the real samples are pure silence
    let silent = (1e-10f64).log10() as f32;
    while i < n_len {
        cols.push((i, vec![silent; filters.n_mel]));
        i += n_threads;
    }

    cols
}

/// Compute the log-mel spectrogram of `samples` (16 kHz mono PCM).
pub fn log_mel_spectrogram(samples: &[f32], filters: &Filters, n_threads: usize) -> Result<Mel> {
    if filters.n_fft != 1 + N_FFT / 2 {
        return Err(WhisperError::Mel(format!(
            "filterbank has {} fft bins, expected {}",
            filters.n_fft,
            1 + N_FFT / 2
        )));
    }

    let frame_size = N_FFT;
    let frame_step = HOP_LENGTH;
    let n_samples = samples.len();

    let hann = hann_window(frame_size);
    let table = SinCosTable::new(frame_size);

    // 30 s of zeros at the end, half a frame of reflection at the start
    // and half a frame of zeros at the very end
    let stage_1_pad = SAMPLE_RATE * CHUNK_SIZE;
    let stage_2_pad = frame_size / 2;

    let mut padded = vec![0.0f32; n_samples + stage_1_pad + stage_2_pad * 2];
    padded[stage_2_pad..stage_2_pad + n_samples].copy_from_slice(samples);
    for i in 0..stage_2_pad.min(n_samples.saturating_sub(1)) {
        padded[stage_2_pad - 1 - i] = samples[i + 1];
    }

    // the hop formula truncates toward zero, so inputs shorter than one
    // frame still count a single column once the leading pad covers them
    let n_len_org =
        1 + (n_samples as i64 + stage_2_pad as i64 - frame_size as i64) / frame_step as i64;

    let mut mel = Mel {
        n_mel: filters.n_mel,
        n_len: (padded.len() - frame_size) / frame_step,
        n_len_org: n_len_org.max(0) as usize,
        data: Vec::new(),
    };
    mel.data = vec![0.0f32; mel.n_mel * mel.n_len];

    let n_threads = n_threads.max(1);
    let n_samples_eff = n_samples + stage_2_pad;

    let all_cols: Vec<Vec<(usize, Vec<f32>)>> = if n_threads == 1 {
        vec![mel_worker(
            0,
            1,
            &hann,
            &padded,
            n_samples_eff,
            mel.n_len,
            filters,
            &table,
        )]
    } else {
        std::thread::scope(|s| {
            let handles: Vec<_> = (1..n_threads)
                .map(|ith| {
                    let (hann, padded, filters, table) = (&hann, &padded, filters, &table);
                    s.spawn(move || {
                        mel_worker(
                            ith,
                            n_threads,
                            hann,
                            padded,
                            n_samples_eff,
                            mel.n_len,
                            filters,
                            table,
                        )
                    })
                })
                .collect();

            let mut all = vec![mel_worker(
                0,
                n_threads,
                &hann,
                &padded,
                n_samples_eff,
                mel.n_len,
                filters,
                &table,
            )];
            for h in handles {
                match h.join() {
                    Ok(cols) => all.push(cols),
                    Err(_) => all.push(Vec::new()),
                }
            }
            all
        })
    };

    let mut n_written = 0usize;
    for cols in &all_cols {
        for (i, col) in cols {
            for (j, &v) in col.iter().enumerate() {
                mel.data[j * mel.n_len + i] = v;
            }
            n_written += 1;
        }
    }
    if n_written != mel.n_len {
        return Err(WhisperError::Mel(format!(
            "worker thread panicked, {} of {} columns computed",
            n_written, mel.n_len
        )));
    }

    // clamping and normalization
    let mmax = mel.data.iter().fold(f32::MIN, |a, &b| a.max(b)) - 8.0;
    for v in &mut mel.data {
        if *v < mmax {
            *v = mmax;
        }
        *v = (*v + 4.0) / 4.0;
    }

    Ok(mel)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_filters() -> Filters {
        // flat filterbank: every mel bin sums all fft bins equally
        let n_mel = 80;
        let n_fft = 1 + N_FFT / 2;
        Filters {
            n_mel,
            n_fft,
            data: vec![1.0 / n_fft as f32; n_mel * n_fft],
        }
    }

    #[test]
    fn n_len_org_matches_hop_formula() {
        let filters = test_filters();
        for &n_samples in &[400usize, 1600, 16000, 16001, 48000] {
            let samples = vec![0.0f32; n_samples];
            let mel = log_mel_spectrogram(&samples, &filters, 1).unwrap();
            assert_eq!(mel.n_len_org, 1 + (n_samples + 200 - 400) / 160);
            assert_eq!(mel.data.len(), mel.n_mel * mel.n_len);
        }
    }

    #[test]
    fn n_len_org_truncates_toward_zero_on_short_input() {
        let filters = test_filters();
        // (n_samples + 200 - 400) / 160 is a signed division: for inputs
        // of 41..=199 samples the numerator is a small negative number
        // that truncates to 0, leaving one column
        for &(n_samples, expected) in &[(41usize, 1usize), (100, 1), (199, 1), (40, 0), (0, 0)] {
            let samples = vec![0.0f32; n_samples];
            let mel = log_mel_spectrogram(&samples, &filters, 1).unwrap();
            assert_eq!(mel.n_len_org, expected, "n_samples = {n_samples}");
        }
    }

    #[test]
    fn silence_is_uniform_after_normalization(){
        let filters = test_filters();
        let mel = log_mel_spectrogram(&vec![0.0f32; 16000], &filters, 2).unwrap();
        // all-zero input clamps every value to (max - 8 + 4) / 4
        let first = mel.data[0];
        assert!(mel.data.iter().all(|&v| (v - first).abs() < 1e-6));
    }

    #[test]
    fn parallel_matches_serial() {
        let filters = test_filters();
        let samples: Vec<f32> = (0..8000)
            .map(|i| (i as f32 * 0.05).sin() * 0.5)
            .collect();
        let serial = log_mel_spectrogram(&samples, &filters, 1).unwrap();
        let parallel = log_mel_spectrogram(&samples, &filters, 4).unwrap();
        assert_eq!(serial.n_len, parallel.n_len);
        for (a, b) in serial.data.iter().zip(parallel.data.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn fft_matches_dft_on_impulse() {
        let table = SinCosTable::new(8);
        let inp = [1.0f32, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let mut out = Vec::new();
        fft(&inp, &mut out, &table);
        // impulse has a flat spectrum
        for k in 0..8 {
            assert!((out[2 * k] - 1.0).abs() < 1e-5);
            assert!(out[2 * k + 1].abs() < 1e-5);
        }
    }
}

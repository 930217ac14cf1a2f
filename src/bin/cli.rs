use std::path::PathBuf;

use anyhow::{bail, Context as _, Result};
use candle_core::Device;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use whisper_runner::{format_timestamp, Context, FullParams, SamplingStrategy, SAMPLE_RATE};

#[cfg(unix)]
use tikv_jemallocator::Jemalloc;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the GGML model file
    #[arg(short, long, env, default_value = "ggml-base.en.bin")]
    model: PathBuf,

    /// Audio file to transcribe (16 kHz mono)
    file: PathBuf,

    /// Spoken language code, or "auto" to detect
    #[arg(short, long, default_value = "en")]
    language: String,

    /// Translate the output to English
    #[arg(long)]
    translate: bool,

    /// Use beam search instead of greedy decoding
    #[arg(long)]
    beam: bool,

    /// Number of threads for the mel stage
    #[arg(short = 't', long, default_value_t = 4)]
    threads: usize,

    /// Start offset in milliseconds
    #[arg(long, default_value_t = 0)]
    offset_ms: i32,

    /// Duration to process in milliseconds (0 = everything)
    #[arg(long, default_value_t = 0)]
    duration_ms: i32,

    /// Split the audio into this many chunks processed in parallel
    #[arg(short = 'p', long, default_value_t = 1)]
    processors: usize,

    /// Estimate per-token timestamps
    #[arg(long)]
    token_timestamps: bool,

    /// Print segments as JSON instead of plain text
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let (samples, sample_rate) = pcm::decode(&args.file)
        .with_context(|| format!("failed to decode {}", args.file.display()))?;
    if sample_rate as usize != SAMPLE_RATE {
        bail!("input file must have a {SAMPLE_RATE} sampling rate, got {sample_rate}");
    }

    let ctx = Context::from_file(&args.model, &Device::Cpu)
        .with_context(|| format!("failed to load model {}", args.model.display()))?;
    let mut state = ctx.create_state();

    let mut params = FullParams::new(if args.beam {
        SamplingStrategy::BeamSearch
    } else {
        SamplingStrategy::Greedy
    });
    params.language = Some(args.language);
    params.translate = args.translate;
    params.n_threads = args.threads;
    params.offset_ms = args.offset_ms;
    params.duration_ms = args.duration_ms;
    params.token_timestamps = args.token_timestamps;

    if args.processors > 1 {
        ctx.full_parallel(&mut state, params, &samples, args.processors)?;
    } else {
        ctx.full(&mut state, params, &samples)?;
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(state.segments())?);
    } else {
        for segment in state.segments() {
            println!(
                "[{} --> {}]  {}",
                format_timestamp(segment.t0, false),
                format_timestamp(segment.t1, false),
                segment.text
            );
        }
    }

    Ok(())
}

/// Audio file decoding. The engine itself only ever sees raw PCM.
mod pcm {
    use std::fs::File;
    use std::path::Path;

    use anyhow::Result;
    use symphonia::core::audio::{AudioBufferRef, Signal};
    use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
    use symphonia::core::conv::FromSample;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::{MediaSourceStream, MediaSourceStreamOptions};
    use symphonia::core::meta::MetadataOptions;

    fn conv<T>(samples: &mut Vec<f32>, data: &symphonia::core::audio::AudioBuffer<T>)
    where
        T: symphonia::core::sample::Sample,
        f32: FromSample<T>,
    {
        samples.extend(data.chan(0).iter().map(|v| f32::from_sample(*v)));
    }

    pub fn decode(path: &Path) -> Result<(Vec<f32>, u32)> {
        let src = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(src), MediaSourceStreamOptions::default());

        let hint = symphonia::core::probe::Hint::new();
        let meta_opts = MetadataOptions::default();
        let fmt_opts = FormatOptions::default();

        let probed = symphonia::default::get_probe().format(&hint, mss, &fmt_opts, &meta_opts)?;
        let mut format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| anyhow::anyhow!("no supported audio tracks"))?;

        let dec_opts = DecoderOptions::default();
        let mut decoder = symphonia::default::get_codecs().make(&track.codec_params, &dec_opts)?;
        let track_id = track.id;
        let sample_rate = track.codec_params.sample_rate.unwrap_or(0);

        let mut pcm_data = Vec::new();
        while let Ok(packet) = format.next_packet() {
            while !format.metadata().is_latest() {
                format.metadata().pop();
            }
            if packet.track_id() != track_id {
                continue;
            }
            match decoder.decode(&packet)? {
                AudioBufferRef::F32(buf) => pcm_data.extend(buf.chan(0)),
                AudioBufferRef::U8(data) => conv(&mut pcm_data, &data),
                AudioBufferRef::U16(data) => conv(&mut pcm_data, &data),
                AudioBufferRef::U24(data) => conv(&mut pcm_data, &data),
                AudioBufferRef::U32(data) => conv(&mut pcm_data, &data),
                AudioBufferRef::S8(data) => conv(&mut pcm_data, &data),
                AudioBufferRef::S16(data) => conv(&mut pcm_data, &data),
                AudioBufferRef::S24(data) => conv(&mut pcm_data, &data),
                AudioBufferRef::S32(data) => conv(&mut pcm_data, &data),
                AudioBufferRef::F64(data) => conv(&mut pcm_data, &data),
            }
        }

        Ok((pcm_data, sample_rate))
    }
}

//! One benchmark run: pump a raw H.264 file through demux, decode and
//! re-encode against the simulated devices, time it, and report
//! throughput.

use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use bytes::Bytes;
use clap::Parser;
use futures::StreamExt;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use codec_pipe::bitstream::demux_annex_b;
use codec_pipe::demuxer::FILE_READ_HIGH_WATERMARK;
use codec_pipe::device::{Acceleration, BitrateMode, EncoderConfig, LatencyMode};
use codec_pipe::encoder::{EncodingHook, H264Profile, Resolution, UncloggingMethod};
use codec_pipe::frame::VideoFrame;
use codec_pipe::nalu::LONG_START_CODE;
use codec_pipe::packet::EncodedPacket;
use codec_pipe::pipeline::start_pipeline;
use codec_pipe::queue::BlockingQueue;

use crate::devices::{SimDecoder, SimEncoder};

/// Read granularity for the input file pump.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Progress line cadence, in packets.
const PROGRESS_PACKET_INTERVAL: u64 = 250;

/// Extensions the benchmark refuses up front: container formats need a
/// demuxer device, not the raw bitstream path.
const CONTAINER_EXTENSIONS: [&str; 3] = ["mp4", "m4v", "mov"];

#[derive(Debug, Parser)]
#[command(name = "transcode-bench")]
#[command(author, version, about = "Measures decode and re-encode throughput over a raw H.264 bitstream")]
pub struct BenchOptions {
    /// Annex-B elementary stream to transcode (.h264)
    #[arg(required = true)]
    pub input: PathBuf,

    /// Presentation frame rate stamped onto decoded slices
    #[arg(long, default_value = "30")]
    pub frame_rate: f64,

    /// Decoder acceleration preference
    #[arg(long, default_value = "no-preference")]
    pub decoder_acceleration: Acceleration,

    /// Encoder acceleration preference
    #[arg(long, default_value = "no-preference")]
    pub encoder_acceleration: Acceleration,

    /// Output resolution
    #[arg(long, default_value = "720p")]
    pub resolution: Resolution,

    /// H.264 profile for the encoder codec string
    #[arg(long, default_value = "baseline")]
    pub profile: H264Profile,

    /// Target bitrate in bits per second
    #[arg(long, default_value = "1000000")]
    pub bitrate: u64,

    /// Bitrate mode
    #[arg(long, default_value = "variable")]
    pub bitrate_mode: BitrateMode,

    /// Latency mode
    #[arg(long, default_value = "quality")]
    pub latency_mode: LatencyMode,

    /// How the feed loop recovers when the encoder queue clogs
    #[arg(long, default_value = "dequeue-event")]
    pub unclogging: UncloggingMethod,

    /// Artificial per-frame encode latency in milliseconds
    #[arg(long, default_value = "0")]
    pub encode_latency_millis: u64,

    /// Assemble the re-encoded stream into this file
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Print the report as JSON
    #[arg(long)]
    pub json: bool,
}

/// What one run measured. Byte counts follow the wire: `output_bytes`
/// is the sum of chunk payloads, before any start codes the assembled
/// file adds back.
#[derive(Debug, Serialize)]
pub struct BenchReport {
    pub input: PathBuf,
    pub input_bytes: u64,
    pub frames_decoded: u64,
    pub packets_encoded: u64,
    pub output_bytes: u64,
    pub elapsed_seconds: f64,
    pub frames_per_second: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

impl Display for BenchReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "transcoded {} in {:.3}s",
            self.input.display(),
            self.elapsed_seconds
        )?;
        writeln!(f, "  input bytes:     {}", self.input_bytes)?;
        writeln!(
            f,
            "  frames decoded:  {} ({:.1} frames per second)",
            self.frames_decoded, self.frames_per_second
        )?;
        writeln!(f, "  packets encoded: {}", self.packets_encoded)?;
        write!(f, "  output bytes:    {}", self.output_bytes)?;
        if let Some(output) = &self.output {
            write!(f, "\n  assembled into:  {}", output.display())?;
        }
        Ok(())
    }
}

/// Runs the benchmark described by `options` until the stream ends or
/// `cancel` fires. Cancellation winds the pipeline down and fails the
/// run; a report only comes back from a complete pass.
pub async fn run(options: &BenchOptions, cancel: CancellationToken) -> anyhow::Result<BenchReport> {
    if let Some(extension) = options.input.extension().and_then(|e| e.to_str()) {
        if CONTAINER_EXTENSIONS.contains(&extension.to_ascii_lowercase().as_str()) {
            bail!(
                "{} looks like a container; the benchmark reads raw Annex-B elementary streams",
                options.input.display()
            );
        }
    }

    let file = tokio::fs::File::open(&options.input)
        .await
        .with_context(|| format!("cannot open {}", options.input.display()))?;

    let started = Instant::now();
    let source = Arc::new(BlockingQueue::new(FILE_READ_HIGH_WATERMARK));
    let reader = tokio::spawn(pump_file(file, source.clone(), cancel.clone()));
    let demuxed = demux_annex_b(source, options.decoder_acceleration, options.frame_rate);

    let frames_decoded = Arc::new(AtomicU64::new(0));
    let on_encoding: EncodingHook = Box::new({
        let frames_decoded = frames_decoded.clone();
        move |_frame: &VideoFrame| {
            frames_decoded.fetch_add(1, Ordering::Relaxed);
        }
    });

    let (width, height) = options.resolution.dimensions();
    let pipeline = start_pipeline(
        demuxed,
        Box::new(SimDecoder::new()),
        Box::new(SimEncoder::new(Duration::from_millis(
            options.encode_latency_millis,
        ))),
        EncoderConfig {
            codec: options.profile.codec_string(),
            width,
            height,
            bitrate: options.bitrate,
            framerate: options.frame_rate,
            acceleration: options.encoder_acceleration,
            bitrate_mode: options.bitrate_mode,
            latency_mode: options.latency_mode,
        },
        options.unclogging,
        Some(on_encoding),
    )
    .await?;

    let mut assembly = options.output.is_some().then(OutputAssembly::default);
    let mut packets_encoded = 0u64;
    let mut output_bytes = 0u64;
    let mut packets = Box::pin(pipeline.packets.clone().into_stream());
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => {
                pipeline.shut_down();
                break;
            }
            packet = packets.next() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        packets_encoded += 1;
        output_bytes += packet.chunk.byte_length() as u64;
        if let Some(assembly) = assembly.as_mut() {
            assembly.add(&packet);
        }
        if packets_encoded % PROGRESS_PACKET_INTERVAL == 0 {
            log::info!(
                "{packets_encoded} packets so far, {:.1}s of stream re-encoded",
                packet.chunk.timestamp as f64 / 1e6
            );
        }
    }

    let input_bytes = reader
        .await?
        .with_context(|| format!("reading {}", options.input.display()))?;
    pipeline.finish().await?;
    if cancel.is_cancelled() {
        bail!("benchmark interrupted");
    }

    let elapsed_seconds = started.elapsed().as_secs_f64();
    let frames_decoded = frames_decoded.load(Ordering::Relaxed);

    if let (Some(assembly), Some(path)) = (assembly, options.output.as_deref()) {
        let written = assembly
            .write_to(path)
            .await
            .with_context(|| format!("cannot write {}", path.display()))?;
        log::info!("assembled {written} bytes into {}", path.display());
    }

    Ok(BenchReport {
        input: options.input.clone(),
        input_bytes,
        frames_decoded,
        packets_encoded,
        output_bytes,
        elapsed_seconds,
        frames_per_second: if elapsed_seconds > 0.0 {
            frames_decoded as f64 / elapsed_seconds
        } else {
            0.0
        },
        output: options.output.clone(),
    })
}

/// Reads the input into the byte queue until end of file, cancellation,
/// or the demuxer going away. Every exit path closes the queue. Returns
/// the number of bytes read.
async fn pump_file(
    file: tokio::fs::File,
    source: Arc<BlockingQueue<Bytes>>,
    cancel: CancellationToken,
) -> std::io::Result<u64> {
    let mut chunks = ReaderStream::with_capacity(file, READ_CHUNK_SIZE);
    let mut bytes_read = 0u64;
    let outcome = loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break Ok(bytes_read),
            read = chunks.next() => read,
        };
        match read {
            None => break Ok(bytes_read),
            Some(Err(error)) => break Err(error),
            Some(Ok(data)) => {
                bytes_read += data.len() as u64;
                if source.push(data).await.is_err() {
                    log::debug!("byte queue closed under the file reader");
                    break Ok(bytes_read);
                }
            }
        }
    };
    source.close();
    outcome
}

/// Collects re-encoded chunks into one Annex-B byte stream: the stream
/// description first (when the encoder produced one), then every chunk,
/// each prefixed with the long start code.
#[derive(Default)]
struct OutputAssembly {
    description: Option<Bytes>,
    parts: Vec<Bytes>,
}

impl OutputAssembly {
    fn add(&mut self, packet: &EncodedPacket) {
        if self.description.is_none() {
            self.description = packet.metadata.description.clone();
        }
        self.parts.push(packet.chunk.data.clone());
    }

    async fn write_to(self, path: &Path) -> std::io::Result<u64> {
        let mut file = tokio::fs::File::create(path).await?;
        let mut written = 0u64;
        for part in self.description.iter().chain(self.parts.iter()) {
            file.write_all(&LONG_START_CODE).await?;
            file.write_all(part).await?;
            written += (LONG_START_CODE.len() + part.len()) as u64;
        }
        file.flush().await?;
        Ok(written)
    }
}

#[cfg(test)]
#[path = "bench_test.rs"]
mod bench_test;

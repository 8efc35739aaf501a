//! Annex-B elementary stream ingestion: raw bytes in, a decoder
//! configuration and a backpressured stream of coded chunks out.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::device::{Acceleration, DecoderConfig};
use crate::error::PipelineError;
use crate::nalu::{NalUnit, NalUnitType, NaluDemuxer};
use crate::packet::{ChunkKind, CodedChunk};
use crate::queue::BlockingQueue;
use crate::sps::Sps;

/// Capacity of the coded chunk queue between demuxing and decoding.
pub const BITSTREAM_CAPACITY: usize = 10;

/// Receives the decoder configuration once the demuxer has seen enough
/// of the stream to build one.
pub type ConfigReceiver = oneshot::Receiver<Result<DecoderConfig, PipelineError>>;

/// Sending half of the configuration hand-off, held by a demux worker
/// until it can resolve or reject the configuration.
pub type ConfigSender = oneshot::Sender<Result<DecoderConfig, PipelineError>>;

/// Demuxed video stream: a one-shot decoder configuration plus the
/// coded chunks, in stream order.
pub struct DemuxedStream {
    pub config: ConfigReceiver,
    pub chunks: Arc<BlockingQueue<CodedChunk>>,
}

/// Starts demuxing an Annex-B H.264 elementary stream arriving on
/// `source`. The configuration resolves from the first sequence
/// parameter set; coded slices become timestamped chunks paced by
/// `frame_rate`; other unit types are dropped.
pub fn demux_annex_b(
    source: Arc<BlockingQueue<Bytes>>,
    acceleration: Acceleration,
    frame_rate: f64,
) -> DemuxedStream {
    let chunks = Arc::new(BlockingQueue::new(BITSTREAM_CAPACITY));
    let (config_tx, config_rx) = oneshot::channel();
    tokio::spawn(run_annex_b(
        source,
        acceleration,
        frame_rate,
        chunks.clone(),
        config_tx,
    ));
    DemuxedStream {
        config: config_rx,
        chunks,
    }
}

async fn run_annex_b(
    source: Arc<BlockingQueue<Bytes>>,
    acceleration: Acceleration,
    frame_rate: f64,
    chunks: Arc<BlockingQueue<CodedChunk>>,
    config_tx: ConfigSender,
) {
    let mut demuxer = NaluDemuxer::default();
    let mut clock = FrameClock::new(frame_rate);
    let mut config_tx = Some(config_tx);

    while let Some(bytes) = source.pull().await {
        for unit in demuxer.push(bytes) {
            if !deliver(&unit, acceleration, &mut clock, &chunks, &mut config_tx).await {
                log::debug!("chunk queue closed, stopping annex-b demux");
                // Release whoever is feeding bytes in; they have no
                // other way to learn the pipeline is gone.
                source.close();
                return;
            }
        }
    }
    if let Some(unit) = demuxer.flush() {
        if !deliver(&unit, acceleration, &mut clock, &chunks, &mut config_tx).await {
            source.close();
            return;
        }
    }

    // End of stream. A config that never resolved is a malformed
    // stream, not a silent absence.
    if let Some(tx) = config_tx.take() {
        let _ = tx.send(Err(PipelineError::MissingParameterSet));
    }
    chunks.close();
}

/// Routes one NAL unit. Returns false once the chunk queue is closed.
async fn deliver(
    unit: &NalUnit,
    acceleration: Acceleration,
    clock: &mut FrameClock,
    chunks: &BlockingQueue<CodedChunk>,
    config_tx: &mut Option<ConfigSender>,
) -> bool {
    match unit.unit_type {
        NalUnitType::SequenceParameterSet => {
            // Only the first parameter set decides the configuration.
            if let Some(tx) = config_tx.take() {
                let result = Sps::parse(&unit.body)
                    .map(|sps| DecoderConfig {
                        codec: sps.codec_string(),
                        coded_width: sps.width,
                        coded_height: sps.height,
                        acceleration,
                        description: None,
                    })
                    .map_err(PipelineError::from);
                let _ = tx.send(result);
            }
            true
        }
        NalUnitType::SliceIdr | NalUnitType::SliceNonIdr => {
            let kind = if unit.unit_type == NalUnitType::SliceIdr {
                ChunkKind::Key
            } else {
                ChunkKind::Delta
            };
            let chunk = CodedChunk {
                kind,
                timestamp: clock.next_timestamp(),
                duration: Some(clock.frame_duration()),
                // The whole unit, start code included: Annex-B
                // decoders expect their framing intact.
                data: unit.raw.clone(),
            };
            chunks.push(chunk).await.is_ok()
        }
        _ => true,
    }
}

/// Assigns fixed-rate presentation timestamps to successive slices.
struct FrameClock {
    seqno: u64,
    frame_rate: f64,
    duration: i64,
}

impl FrameClock {
    const ONE_SECOND_IN_MICROS: f64 = 1e6;

    fn new(frame_rate: f64) -> Self {
        Self {
            seqno: 0,
            frame_rate,
            duration: (Self::ONE_SECOND_IN_MICROS / frame_rate).floor() as i64,
        }
    }

    fn next_timestamp(&mut self) -> i64 {
        let timestamp =
            (Self::ONE_SECOND_IN_MICROS * self.seqno as f64 / self.frame_rate).floor() as i64;
        self.seqno += 1;
        timestamp
    }

    fn frame_duration(&self) -> i64 {
        self.duration
    }
}

#[cfg(test)]
#[path = "bitstream_test.rs"]
mod bitstream_test;

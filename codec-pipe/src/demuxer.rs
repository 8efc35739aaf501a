//! Container demuxing: file bytes go into an external demuxer, a decoder
//! configuration and timestamped chunks come out.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::bitstream::{ConfigSender, DemuxedStream, BITSTREAM_CAPACITY};
use crate::device::{
    Acceleration, ContainerDemuxer, ContainerSample, DecoderConfig, DemuxCallbacks, FileChunk,
    TrackInfo,
};
use crate::error::PipelineError;
use crate::packet::{ChunkKind, CodedChunk};
use crate::queue::BlockingQueue;
use crate::serial::SerialQueue;

/// Capacity of the raw byte queue between the file reader and a demuxer.
pub const FILE_READ_HIGH_WATERMARK: usize = 10;

/// Starts demuxing a containerized stream arriving on `source`.
///
/// The configuration resolves once the demuxer announces its video track;
/// a stream that ends without one rejects it with
/// [`PipelineError::MissingVideoTrack`]. Samples for the announced track
/// become timestamped chunks in stream order.
pub fn demux_container(
    demuxer: Box<dyn ContainerDemuxer>,
    source: Arc<BlockingQueue<Bytes>>,
    acceleration: Acceleration,
) -> DemuxedStream {
    let chunks = Arc::new(BlockingQueue::new(BITSTREAM_CAPACITY));
    let (config_tx, config_rx) = oneshot::channel();
    tokio::spawn(run_container(
        demuxer,
        source,
        acceleration,
        chunks.clone(),
        config_tx,
    ));
    DemuxedStream {
        config: config_rx,
        chunks,
    }
}

/// State the demux callbacks and the feed loop both reach for.
struct DemuxShared {
    config: Mutex<Option<ConfigSender>>,
    /// Track id announced by the demuxer; samples for any other are dropped.
    selected: Mutex<Option<u32>>,
    source: Arc<BlockingQueue<Bytes>>,
    chunks: Arc<BlockingQueue<CodedChunk>>,
}

impl DemuxShared {
    /// Rejects the configuration if it is still pending, then closes both
    /// queues so neither neighbour stays blocked.
    fn fail(&self, error: PipelineError) {
        match self.config.lock().unwrap().take() {
            Some(tx) => {
                let _ = tx.send(Err(error));
            }
            None => log::error!("container demuxer failed mid-stream: {error}"),
        }
        self.source.close();
        self.chunks.close();
    }
}

async fn run_container(
    mut demuxer: Box<dyn ContainerDemuxer>,
    source: Arc<BlockingQueue<Bytes>>,
    acceleration: Acceleration,
    chunks: Arc<BlockingQueue<CodedChunk>>,
    config_tx: ConfigSender,
) {
    let serial = SerialQueue::with_timeout_millis(0);
    let shared = Arc::new(DemuxShared {
        config: Mutex::new(Some(config_tx)),
        selected: Mutex::new(None),
        source: source.clone(),
        chunks: chunks.clone(),
    });

    let callbacks = DemuxCallbacks {
        ready: Box::new({
            let shared = shared.clone();
            move |track: TrackInfo| {
                shared.selected.lock().unwrap().replace(track.id);
                if let Some(tx) = shared.config.lock().unwrap().take() {
                    log::info!(
                        "container ready: track {} {} {}x{}",
                        track.id,
                        track.codec,
                        track.width,
                        track.height
                    );
                    let _ = tx.send(Ok(DecoderConfig {
                        codec: track.codec,
                        coded_width: track.width,
                        coded_height: track.height,
                        acceleration,
                        description: track.description,
                    }));
                }
            }
        }),
        samples: Box::new({
            let shared = shared.clone();
            let serial = serial.clone();
            move |track_id, samples: Vec<ContainerSample>| {
                if *shared.selected.lock().unwrap() != Some(track_id) {
                    return;
                }
                let chunks = shared.chunks.clone();
                let _ = serial.enqueue(async move {
                    for sample in samples {
                        if chunks.push(chunk_from_sample(sample)).await.is_err() {
                            break;
                        }
                    }
                });
            }
        }),
        error: Box::new({
            let shared = shared.clone();
            move |error| shared.fail(PipelineError::Device(error))
        }),
    };

    if let Err(error) = demuxer.configure(callbacks) {
        shared.fail(error.into());
        return;
    }

    let mut offset = 0u64;
    while let Some(data) = source.pull().await {
        let len = data.len() as u64;
        let appended = demuxer.append_buffer(FileChunk {
            file_offset: offset,
            data,
        });
        if let Err(error) = appended {
            shared.fail(error.into());
            return;
        }
        offset += len;
    }

    if let Err(error) = demuxer.flush() {
        shared.fail(error.into());
        return;
    }

    if let Some(tx) = shared.config.lock().unwrap().take() {
        let _ = tx.send(Err(PipelineError::MissingVideoTrack));
    }

    // Close behind every sample push the demuxer delivered.
    let _ = serial
        .enqueue({
            let chunks = chunks.clone();
            async move { chunks.close() }
        })
        .await;
}

/// Rescales a container sample's timing to microseconds and wraps its
/// payload as a chunk.
fn chunk_from_sample(sample: ContainerSample) -> CodedChunk {
    // A zero timescale is a malformed container; do not divide by it.
    let timescale = u64::from(sample.timescale.max(1));
    CodedChunk {
        kind: if sample.is_sync {
            ChunkKind::Key
        } else {
            ChunkKind::Delta
        },
        timestamp: (1_000_000 * sample.cts / timescale) as i64,
        duration: Some((1_000_000 * sample.duration / timescale) as i64),
        data: sample.data,
    }
}

#[cfg(test)]
#[path = "demuxer_test.rs"]
mod demuxer_test;

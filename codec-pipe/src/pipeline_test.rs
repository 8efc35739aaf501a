use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;

use super::*;
use crate::bitstream::demux_annex_b;
use crate::device::{
    Acceleration, BitrateMode, DecodeCallbacks, DecoderConfig, DeviceError, EncodeCallbacks,
    LatencyMode,
};
use crate::frame::VideoFrame;
use crate::packet::{ChunkKind, CodedChunk};

// ---------------------------------------------------------------- fixtures

/// Decoder that turns every chunk into one frame with the same timing.
struct PassthroughDecoder {
    callbacks: Option<DecodeCallbacks>,
    seen_config: Arc<Mutex<Option<DecoderConfig>>>,
}

impl PassthroughDecoder {
    fn new() -> (Self, Arc<Mutex<Option<DecoderConfig>>>) {
        let seen_config = Arc::new(Mutex::new(None));
        (
            Self {
                callbacks: None,
                seen_config: seen_config.clone(),
            },
            seen_config,
        )
    }
}

#[async_trait]
impl DecodeDevice for PassthroughDecoder {
    fn configure(
        &mut self,
        config: DecoderConfig,
        callbacks: DecodeCallbacks,
    ) -> Result<(), DeviceError> {
        *self.seen_config.lock().unwrap() = Some(config);
        self.callbacks = Some(callbacks);
        Ok(())
    }

    fn decode(&mut self, chunk: CodedChunk) {
        (self.callbacks.as_mut().unwrap().output)(VideoFrame {
            timestamp: chunk.timestamp,
            duration: chunk.duration,
            width: 320,
            height: 240,
            data: chunk.data,
        });
    }

    async fn flush(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

/// Encoder that re-emits every frame as a chunk the moment it arrives,
/// so its pending queue never clogs.
struct InstantEncoder {
    callbacks: Option<EncodeCallbacks>,
    emitted: usize,
    fail_configure: bool,
}

impl InstantEncoder {
    fn new() -> Self {
        Self {
            callbacks: None,
            emitted: 0,
            fail_configure: false,
        }
    }
}

#[async_trait]
impl EncodeDevice for InstantEncoder {
    fn configure(
        &mut self,
        _config: EncoderConfig,
        callbacks: EncodeCallbacks,
    ) -> Result<(), DeviceError> {
        if self.fail_configure {
            return Err(DeviceError::new("encoder refused"));
        }
        self.callbacks = Some(callbacks);
        Ok(())
    }

    fn encode(&mut self, frame: VideoFrame) {
        let first = self.emitted == 0;
        self.emitted += 1;
        let callbacks = self.callbacks.as_mut().unwrap();
        (callbacks.output)(
            CodedChunk {
                kind: if first { ChunkKind::Key } else { ChunkKind::Delta },
                timestamp: frame.timestamp,
                duration: frame.duration,
                data: frame.data,
            },
            crate::packet::EncodeMetadata {
                description: first.then(|| Bytes::from_static(b"avcc")),
            },
        );
        (callbacks.dequeue)();
    }

    fn pending_queue_size(&self) -> usize {
        0
    }

    async fn flush(&mut self) -> Result<(), DeviceError> {
        Ok(())
    }
}

const SPS_UNIT: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1E, 0xDC, 0x14, 0x1F, 0x90];
const IDR_UNIT: &[u8] = &[0, 0, 0, 1, 0x65, 0xAA];
const NON_IDR_UNIT: &[u8] = &[0, 0, 1, 0x41, 0xBB];

fn encoder_config() -> EncoderConfig {
    EncoderConfig {
        codec: "avc1.420034".to_string(),
        width: 854,
        height: 480,
        bitrate: 1_000_000,
        framerate: 30.0,
        acceleration: Acceleration::NoPreference,
        bitrate_mode: BitrateMode::Variable,
        latency_mode: LatencyMode::Quality,
    }
}

// ------------------------------------------------------------------- tests

#[tokio::test]
async fn test_transcode_end_to_end() {
    let source = Arc::new(BlockingQueue::new(4));
    let mut stream = Vec::new();
    stream.extend_from_slice(SPS_UNIT);
    stream.extend_from_slice(IDR_UNIT);
    stream.extend_from_slice(NON_IDR_UNIT);
    source.push(Bytes::from(stream)).await.unwrap();
    source.close();

    let demuxed = demux_annex_b(source, Acceleration::PreferSoftware, 30.0);
    let (decoder, seen_config) = PassthroughDecoder::new();
    let frames_encoded = Arc::new(Mutex::new(0usize));
    let hook: EncodingHook = Box::new({
        let frames_encoded = frames_encoded.clone();
        move |_frame| *frames_encoded.lock().unwrap() += 1
    });

    let pipeline = start_pipeline(
        demuxed,
        Box::new(decoder),
        Box::new(InstantEncoder::new()),
        encoder_config(),
        UncloggingMethod::DequeueEvent,
        Some(hook),
    )
    .await
    .unwrap();

    let mut packets = Vec::new();
    while let Some(packet) = pipeline.packets.pull().await {
        packets.push(packet);
    }
    pipeline.finish().await.unwrap();

    let config = seen_config.lock().unwrap().clone().unwrap();
    assert_eq!(config.codec, "avc1.42001e");
    assert_eq!(config.coded_width, 320);
    assert_eq!(config.coded_height, 240);
    assert_eq!(config.acceleration, Acceleration::PreferSoftware);

    let timing: Vec<(ChunkKind, i64)> = packets
        .iter()
        .map(|p| (p.chunk.kind, p.chunk.timestamp))
        .collect();
    assert_eq!(
        timing,
        vec![(ChunkKind::Key, 0), (ChunkKind::Delta, 33_333)]
    );
    assert_eq!(
        packets[0].metadata.description,
        Some(Bytes::from_static(b"avcc"))
    );
    assert_eq!(*frames_encoded.lock().unwrap(), 2);
}

#[tokio::test]
async fn test_stream_without_parameters_fails_the_start() {
    let source = Arc::new(BlockingQueue::new(4));
    source
        .push(Bytes::from_static(NON_IDR_UNIT))
        .await
        .unwrap();
    source.close();

    let demuxed = demux_annex_b(source, Acceleration::default(), 30.0);
    let (decoder, _) = PassthroughDecoder::new();
    let result = start_pipeline(
        demuxed,
        Box::new(decoder),
        Box::new(InstantEncoder::new()),
        encoder_config(),
        UncloggingMethod::DequeueEvent,
        None,
    )
    .await;

    assert_eq!(result.err(), Some(PipelineError::MissingParameterSet));
}

#[tokio::test]
async fn test_encoder_failure_surfaces_through_finish() {
    let source = Arc::new(BlockingQueue::new(4));
    let mut stream = Vec::new();
    stream.extend_from_slice(SPS_UNIT);
    stream.extend_from_slice(IDR_UNIT);
    source.push(Bytes::from(stream)).await.unwrap();
    source.close();

    let demuxed = demux_annex_b(source, Acceleration::default(), 30.0);
    let (decoder, _) = PassthroughDecoder::new();
    let mut encoder = InstantEncoder::new();
    encoder.fail_configure = true;

    let pipeline = start_pipeline(
        demuxed,
        Box::new(decoder),
        Box::new(encoder),
        encoder_config(),
        UncloggingMethod::DequeueEvent,
        None,
    )
    .await
    .unwrap();

    while pipeline.packets.pull().await.is_some() {}
    assert_eq!(
        pipeline.finish().await,
        Err(PipelineError::Device(DeviceError::new("encoder refused")))
    );
}

#[tokio::test]
async fn test_a_long_stream_flows_through_the_bounded_queues() {
    // Feed forty slices through queues whose capacities are all smaller
    // than that, in byte chunks that straddle unit boundaries.
    let mut stream = Vec::new();
    stream.extend_from_slice(SPS_UNIT);
    for _ in 0..40 {
        stream.extend_from_slice(IDR_UNIT);
    }

    let source = Arc::new(BlockingQueue::new(2));
    let producer = {
        let source = source.clone();
        tokio::spawn(async move {
            for part in stream.chunks(7) {
                source.push(Bytes::copy_from_slice(part)).await.unwrap();
            }
            source.close();
        })
    };

    let demuxed = demux_annex_b(source, Acceleration::default(), 30.0);
    let (decoder, _) = PassthroughDecoder::new();
    let pipeline = start_pipeline(
        demuxed,
        Box::new(decoder),
        Box::new(InstantEncoder::new()),
        encoder_config(),
        UncloggingMethod::DequeueEvent,
        None,
    )
    .await
    .unwrap();

    let mut timestamps = Vec::new();
    while let Some(packet) = pipeline.packets.pull().await {
        timestamps.push(packet.chunk.timestamp);
    }
    producer.await.unwrap();
    pipeline.finish().await.unwrap();

    assert_eq!(timestamps.len(), 40);
    assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(timestamps[0], 0);
    assert_eq!(timestamps[1], 33_333);
}

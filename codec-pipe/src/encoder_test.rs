use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task::yield_now;

use super::*;
use crate::device::{Acceleration, BitrateMode, DeviceError, LatencyMode};
use crate::packet::{ChunkKind, CodedChunk, EncodeMetadata};

// ---------------------------------------------------------------- fixtures

/// Device state shared between the boxed device and the test so the test
/// can drain it and fire its callbacks on cue.
struct EncoderCore {
    callbacks: Option<EncodeCallbacks>,
    queued: VecDeque<VideoFrame>,
    emitted: usize,
    fail_flush: bool,
    flush_drains: bool,
}

type SharedCore = Arc<Mutex<EncoderCore>>;

fn new_core() -> SharedCore {
    Arc::new(Mutex::new(EncoderCore {
        callbacks: None,
        queued: VecDeque::new(),
        emitted: 0,
        fail_flush: false,
        flush_drains: true,
    }))
}

/// Pops the oldest queued frame and emits it through the output callback,
/// optionally firing the dequeue signal afterwards. The first emission
/// carries the out-of-band description, like a real encoder's first chunk.
fn emit_next(core: &SharedCore, with_dequeue: bool) {
    let (frame, mut callbacks, description) = {
        let mut core = core.lock().unwrap();
        let frame = core.queued.pop_front().expect("no queued frame to emit");
        let callbacks = core.callbacks.take().expect("device not configured");
        let description = (core.emitted == 0).then(|| Bytes::from_static(b"avcc"));
        core.emitted += 1;
        (frame, callbacks, description)
    };
    let kind = if description.is_some() {
        ChunkKind::Key
    } else {
        ChunkKind::Delta
    };
    (callbacks.output)(
        CodedChunk {
            kind,
            timestamp: frame.timestamp,
            duration: frame.duration,
            data: frame.data,
        },
        EncodeMetadata { description },
    );
    if with_dequeue {
        (callbacks.dequeue)();
    }
    core.lock().unwrap().callbacks = Some(callbacks);
}

struct ScriptedEncoder {
    core: SharedCore,
    fail_configure: bool,
}

impl ScriptedEncoder {
    fn new(core: &SharedCore) -> Self {
        Self {
            core: core.clone(),
            fail_configure: false,
        }
    }
}

#[async_trait]
impl EncodeDevice for ScriptedEncoder {
    fn configure(
        &mut self,
        _config: EncoderConfig,
        callbacks: EncodeCallbacks,
    ) -> Result<(), DeviceError> {
        if self.fail_configure {
            return Err(DeviceError::new("configure refused"));
        }
        self.core.lock().unwrap().callbacks = Some(callbacks);
        Ok(())
    }

    fn encode(&mut self, frame: VideoFrame) {
        self.core.lock().unwrap().queued.push_back(frame);
    }

    fn pending_queue_size(&self) -> usize {
        self.core.lock().unwrap().queued.len()
    }

    async fn flush(&mut self) -> Result<(), DeviceError> {
        let (fail, drains) = {
            let core = self.core.lock().unwrap();
            (core.fail_flush, core.flush_drains)
        };
        if fail {
            return Err(DeviceError::new("flush failed"));
        }
        if drains {
            while !self.core.lock().unwrap().queued.is_empty() {
                emit_next(&self.core, true);
            }
        }
        Ok(())
    }
}

fn frame(timestamp: i64) -> VideoFrame {
    VideoFrame {
        timestamp,
        duration: Some(1),
        width: 16,
        height: 16,
        data: Bytes::from_static(b"raw"),
    }
}

fn test_config() -> EncoderConfig {
    EncoderConfig {
        codec: H264Profile::Baseline.codec_string(),
        width: 854,
        height: 480,
        bitrate: 1_000_000,
        framerate: 30.0,
        acceleration: Acceleration::NoPreference,
        bitrate_mode: BitrateMode::Variable,
        latency_mode: LatencyMode::Quality,
    }
}

async fn settle() {
    for _ in 0..50 {
        yield_now().await;
    }
}

async fn drain(stage: &EncoderStage) -> Vec<EncodedPacket> {
    let mut packets = Vec::new();
    while let Some(packet) = stage.packets.pull().await {
        packets.push(packet);
    }
    packets
}

// ------------------------------------------------------------------- tests

#[tokio::test]
async fn test_low_water_mark_gates_the_feed() {
    let frames = Arc::new(BlockingQueue::new(8));
    for t in 0..4 {
        frames.push(frame(t)).await.unwrap();
    }

    let core = new_core();
    let latch = ErrorLatch::new();
    let stage = start_encoder(
        Box::new(ScriptedEncoder::new(&core)),
        test_config(),
        UncloggingMethod::DequeueEvent,
        frames.clone(),
        None,
        latch.clone(),
    );

    // Two frames fill the device to the low water mark; the third waits.
    settle().await;
    assert_eq!(core.lock().unwrap().queued.len(), ENCODE_QUEUE_LOW_WATER);
    assert_eq!(stage.packets.len(), 0);

    // A dequeue event lets exactly one more frame through.
    emit_next(&core, true);
    settle().await;
    assert_eq!(core.lock().unwrap().queued.len(), ENCODE_QUEUE_LOW_WATER);

    frames.close();
    emit_next(&core, true);

    let packets = drain(&stage).await;
    stage.done.await.unwrap();
    assert_eq!(latch.result(), Ok(()));

    let timestamps: Vec<i64> = packets.iter().map(|p| p.chunk.timestamp).collect();
    assert_eq!(timestamps, vec![0, 1, 2, 3]);
    assert_eq!(packets[0].chunk.kind, ChunkKind::Key);
    assert_eq!(
        packets[0].metadata.description,
        Some(Bytes::from_static(b"avcc"))
    );
    assert!(packets[1..].iter().all(|p| p.metadata.description.is_none()));
}

#[tokio::test]
async fn test_polling_strategy_rechecks_on_every_output() {
    let frames = Arc::new(BlockingQueue::new(8));
    for t in 0..3 {
        frames.push(frame(t)).await.unwrap();
    }

    let core = new_core();
    let latch = ErrorLatch::new();
    let stage = start_encoder(
        Box::new(ScriptedEncoder::new(&core)),
        test_config(),
        UncloggingMethod::PollingOutput,
        frames.clone(),
        None,
        latch.clone(),
    );

    settle().await;
    assert_eq!(core.lock().unwrap().queued.len(), ENCODE_QUEUE_LOW_WATER);

    // No dequeue signal at all: the output itself must unblock the feed.
    emit_next(&core, false);
    settle().await;
    assert_eq!(core.lock().unwrap().queued.len(), ENCODE_QUEUE_LOW_WATER);

    frames.close();
    emit_next(&core, false);

    let packets = drain(&stage).await;
    stage.done.await.unwrap();
    assert_eq!(latch.result(), Ok(()));
    let timestamps: Vec<i64> = packets.iter().map(|p| p.chunk.timestamp).collect();
    assert_eq!(timestamps, vec![0, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_polling_strategy_notices_a_silent_drain() {
    let frames = Arc::new(BlockingQueue::new(8));
    for t in 0..3 {
        frames.push(frame(t)).await.unwrap();
    }
    frames.close();

    let core = new_core();
    let latch = ErrorLatch::new();
    let stage = start_encoder(
        Box::new(ScriptedEncoder::new(&core)),
        test_config(),
        UncloggingMethod::PollingOutput,
        frames,
        None,
        latch.clone(),
    );

    settle().await;
    assert_eq!(core.lock().unwrap().queued.len(), ENCODE_QUEUE_LOW_WATER);

    // The device drains without firing any callback; only the polling
    // interval can notice. Paused time auto-advances once tasks go idle.
    core.lock().unwrap().queued.pop_front();

    let packets = drain(&stage).await;
    stage.done.await.unwrap();
    assert_eq!(latch.result(), Ok(()));
    let timestamps: Vec<i64> = packets.iter().map(|p| p.chunk.timestamp).collect();
    assert_eq!(timestamps, vec![1, 2]);
}

#[tokio::test]
async fn test_flush_strategy_flushes_a_clogged_device() {
    let frames = Arc::new(BlockingQueue::new(8));
    for t in 0..3 {
        frames.push(frame(t)).await.unwrap();
    }
    frames.close();

    let core = new_core();
    let latch = ErrorLatch::new();
    let stage = start_encoder(
        Box::new(ScriptedEncoder::new(&core)),
        test_config(),
        UncloggingMethod::FlushEncoder,
        frames,
        None,
        latch.clone(),
    );

    let packets = drain(&stage).await;
    stage.done.await.unwrap();
    assert_eq!(latch.result(), Ok(()));
    let timestamps: Vec<i64> = packets.iter().map(|p| p.chunk.timestamp).collect();
    assert_eq!(timestamps, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_flush_strategy_fails_when_the_device_stays_clogged() {
    let frames = Arc::new(BlockingQueue::new(8));
    for t in 0..3 {
        frames.push(frame(t)).await.unwrap();
    }

    let core = new_core();
    core.lock().unwrap().flush_drains = false;

    let latch = ErrorLatch::new();
    let stage = start_encoder(
        Box::new(ScriptedEncoder::new(&core)),
        test_config(),
        UncloggingMethod::FlushEncoder,
        frames.clone(),
        None,
        latch.clone(),
    );

    stage.done.await.unwrap();
    assert_eq!(
        latch.error(),
        Some(PipelineError::EncoderClogged {
            pending: ENCODE_QUEUE_LOW_WATER,
            low_water: ENCODE_QUEUE_LOW_WATER,
        })
    );
    assert!(frames.is_closed());
    assert_eq!(stage.packets.pull().await, None);
}

#[tokio::test]
async fn test_encoding_hook_sees_each_frame_before_the_device() {
    let frames = Arc::new(BlockingQueue::new(8));
    frames.push(frame(0)).await.unwrap();
    frames.push(frame(1)).await.unwrap();
    frames.close();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let hook: EncodingHook = Box::new({
        let seen = seen.clone();
        move |frame: &VideoFrame| seen.lock().unwrap().push(frame.timestamp)
    });

    let core = new_core();
    let latch = ErrorLatch::new();
    let stage = start_encoder(
        Box::new(ScriptedEncoder::new(&core)),
        test_config(),
        UncloggingMethod::DequeueEvent,
        frames,
        Some(hook),
        latch.clone(),
    );

    let packets = drain(&stage).await;
    stage.done.await.unwrap();
    assert_eq!(latch.result(), Ok(()));
    assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
    assert_eq!(packets.len(), 2);
}

#[tokio::test]
async fn test_configure_failure_trips_the_latch() {
    let frames = Arc::new(BlockingQueue::new(8));
    let core = new_core();
    let mut device = ScriptedEncoder::new(&core);
    device.fail_configure = true;

    let latch = ErrorLatch::new();
    let stage = start_encoder(
        Box::new(device),
        test_config(),
        UncloggingMethod::DequeueEvent,
        frames.clone(),
        None,
        latch.clone(),
    );

    stage.done.await.unwrap();
    assert_eq!(
        latch.error(),
        Some(PipelineError::Device(DeviceError::new("configure refused")))
    );
    assert!(frames.is_closed());
    assert_eq!(stage.packets.pull().await, None);
}

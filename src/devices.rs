//! Simulated codec devices. Neither one codes video: the decoder hands
//! each chunk's payload back as a frame, the encoder echoes frames back
//! as chunks after an optional artificial latency. What they exercise is
//! the device protocol itself: synchronous outputs from inside `decode`,
//! delayed outputs from a device-owned task, pending-queue accounting
//! and dequeue signals.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use codec_pipe::device::{
    DecodeCallbacks, DecodeDevice, DecoderConfig, DeviceError, EncodeCallbacks, EncodeDevice,
    EncoderConfig,
};
use codec_pipe::frame::VideoFrame;
use codec_pipe::nalu::{LONG_START_CODE, SHORT_START_CODE};
use codec_pipe::packet::{ChunkKind, CodedChunk, EncodeMetadata};
use codec_pipe::search::starts_with;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Decodes by reinterpreting the chunk payload as the frame's pixels.
/// Emits synchronously from inside `decode`, like a software decoder
/// with no frame delay.
#[derive(Default)]
pub struct SimDecoder {
    config: Option<DecoderConfig>,
    callbacks: Option<DecodeCallbacks>,
}

impl SimDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DecodeDevice for SimDecoder {
    fn configure(
        &mut self,
        config: DecoderConfig,
        callbacks: DecodeCallbacks,
    ) -> Result<(), DeviceError> {
        log::debug!(
            "decoder configured: {} {}x{}",
            config.codec,
            config.coded_width,
            config.coded_height
        );
        self.config = Some(config);
        self.callbacks = Some(callbacks);
        Ok(())
    }

    fn decode(&mut self, chunk: CodedChunk) {
        let (Some(config), Some(callbacks)) = (&self.config, &mut self.callbacks) else {
            log::warn!("chunk sent to an unconfigured decoder, dropping it");
            return;
        };
        (callbacks.output)(VideoFrame {
            timestamp: chunk.timestamp,
            duration: chunk.duration,
            width: config.coded_width,
            height: config.coded_height,
            data: chunk.data,
        });
    }

    async fn flush(&mut self) -> Result<(), DeviceError> {
        // Nothing buffers; every chunk already produced its frame.
        Ok(())
    }
}

struct EncoderShared {
    queued: VecDeque<VideoFrame>,
    /// Taken out while a chunk is being emitted, so the worker and a
    /// concurrent flush never fire them at the same time.
    callbacks: Option<EncodeCallbacks>,
    configured: bool,
    /// Attached to the first chunk's metadata, standing in for the
    /// out-of-band description a real encoder produces.
    description: Option<Bytes>,
    emitted: u64,
}

/// Encodes by echoing each frame's payload back as a chunk, one frame
/// per `latency` interval, from a task the device owns. The first chunk
/// is a key chunk and carries the stream description.
pub struct SimEncoder {
    latency: Duration,
    shared: Arc<Mutex<EncoderShared>>,
    work: Arc<Notify>,
    stop: CancellationToken,
}

impl SimEncoder {
    pub fn new(latency: Duration) -> Self {
        let shared = Arc::new(Mutex::new(EncoderShared {
            queued: VecDeque::new(),
            callbacks: None,
            configured: false,
            description: None,
            emitted: 0,
        }));
        let work = Arc::new(Notify::new());
        let stop = CancellationToken::new();
        tokio::spawn(run_worker(
            latency,
            shared.clone(),
            work.clone(),
            stop.clone(),
        ));
        Self {
            latency,
            shared,
            work,
            stop,
        }
    }
}

impl Drop for SimEncoder {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

#[async_trait]
impl EncodeDevice for SimEncoder {
    fn configure(
        &mut self,
        config: EncoderConfig,
        callbacks: EncodeCallbacks,
    ) -> Result<(), DeviceError> {
        log::debug!(
            "encoder configured: {} {}x{} at {} bps, {:?} latency per frame",
            config.codec,
            config.width,
            config.height,
            config.bitrate,
            self.latency
        );
        let mut shared = self.shared.lock().unwrap();
        shared.configured = true;
        shared.description = Some(Bytes::from(config.codec.into_bytes()));
        shared.callbacks = Some(callbacks);
        Ok(())
    }

    fn encode(&mut self, frame: VideoFrame) {
        {
            let mut shared = self.shared.lock().unwrap();
            if !shared.configured {
                log::warn!("frame sent to an unconfigured encoder, dropping it");
                return;
            }
            shared.queued.push_back(frame);
        }
        self.work.notify_one();
    }

    fn pending_queue_size(&self) -> usize {
        self.shared.lock().unwrap().queued.len()
    }

    async fn flush(&mut self) -> Result<(), DeviceError> {
        // Force-drains: every queued frame emits its chunk before the
        // flush resolves, skipping the artificial latency.
        loop {
            if emit_next(&self.shared) {
                continue;
            }
            let settled = {
                let shared = self.shared.lock().unwrap();
                !shared.configured || (shared.queued.is_empty() && shared.callbacks.is_some())
            };
            if settled {
                return Ok(());
            }
            // The worker holds the callbacks mid-emission; let it finish
            // so nothing is left in flight when the flush resolves.
            tokio::task::yield_now().await;
        }
    }
}

async fn run_worker(
    latency: Duration,
    shared: Arc<Mutex<EncoderShared>>,
    work: Arc<Notify>,
    stop: CancellationToken,
) {
    loop {
        if shared.lock().unwrap().queued.is_empty() {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = work.notified() => continue,
            }
        }
        if latency.is_zero() {
            // Even an instant device emits from its own turn, never
            // from inside `encode`.
            tokio::task::yield_now().await;
        } else {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(latency) => {}
            }
        }
        emit_next(&shared);
    }
}

/// Pops the oldest queued frame and emits it as a chunk, firing the
/// dequeue signal afterwards. Returns false when there is nothing to
/// emit or another caller holds the callbacks.
fn emit_next(shared: &Mutex<EncoderShared>) -> bool {
    let (frame, mut callbacks, first) = {
        let mut locked = shared.lock().unwrap();
        let Some(callbacks) = locked.callbacks.take() else {
            return false;
        };
        let Some(frame) = locked.queued.pop_front() else {
            locked.callbacks = Some(callbacks);
            return false;
        };
        let first = locked.emitted == 0;
        locked.emitted += 1;
        (frame, callbacks, first)
    };

    let chunk = CodedChunk {
        kind: if first {
            ChunkKind::Key
        } else {
            ChunkKind::Delta
        },
        timestamp: frame.timestamp,
        duration: frame.duration,
        data: unframed(frame.data),
    };
    let description = if first {
        shared.lock().unwrap().description.clone()
    } else {
        None
    };
    (callbacks.output)(chunk, EncodeMetadata { description });
    (callbacks.dequeue)();
    shared.lock().unwrap().callbacks = Some(callbacks);
    true
}

/// A real encoder emits unframed payloads; echoing a frame back strips
/// the Annex-B marker its payload may still carry.
fn unframed(data: Bytes) -> Bytes {
    if starts_with(&data[..], &LONG_START_CODE) {
        data.slice(LONG_START_CODE.len()..)
    } else if starts_with(&data[..], &SHORT_START_CODE) {
        data.slice(SHORT_START_CODE.len()..)
    } else {
        data
    }
}

#[cfg(test)]
#[path = "devices_test.rs"]
mod devices_test;

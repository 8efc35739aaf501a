use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;

use crate::device::{EncodeCallbacks, EncodeDevice, EncoderConfig, ParseEnumError};
use crate::error::{ErrorLatch, PipelineError};
use crate::frame::VideoFrame;
use crate::packet::EncodedPacket;
use crate::queue::BlockingQueue;
use crate::serial::SerialQueue;

/// Frames the device may hold before the feed loop waits for it to drain.
pub const ENCODE_QUEUE_LOW_WATER: usize = 2;

/// Encoded packets buffered between the encode device and its consumer.
pub const PACKET_QUEUE_CAPACITY: usize = 10;

/// How often the polling strategy rechecks a clogged device.
const UNCLOG_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// H.264 level carried in every codec string this crate emits.
pub const H264_LEVEL: u8 = 52;

/// How the feed loop finds out that a clogged device has drained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UncloggingMethod {
    /// Wait for the device's dequeue signal.
    #[default]
    DequeueEvent,
    /// Recheck on every output and on a fixed interval.
    PollingOutput,
    /// Flush the device and fail if that did not drain it.
    FlushEncoder,
}

impl Display for UncloggingMethod {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            UncloggingMethod::DequeueEvent => "dequeue-event",
            UncloggingMethod::PollingOutput => "polling-output",
            UncloggingMethod::FlushEncoder => "flush-encoder",
        })
    }
}

impl FromStr for UncloggingMethod {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dequeue-event" => Ok(UncloggingMethod::DequeueEvent),
            "polling-output" => Ok(UncloggingMethod::PollingOutput),
            "flush-encoder" => Ok(UncloggingMethod::FlushEncoder),
            other => Err(ParseEnumError::new(
                "unclogging method",
                other,
                "dequeue-event, polling-output or flush-encoder",
            )),
        }
    }
}

/// H.264 profiles the benchmark encodes with. Discriminants are the
/// profile_idc values that end up in the codec string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum H264Profile {
    Baseline = 66,
    Main = 77,
    High = 100,
}

impl H264Profile {
    pub fn idc(self) -> u8 {
        self as u8
    }

    /// RFC 6381 codec string for this profile at [`H264_LEVEL`].
    pub fn codec_string(self) -> String {
        format!("avc1.{:02x}00{:02x}", self.idc(), H264_LEVEL)
    }
}

impl Display for H264Profile {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            H264Profile::Baseline => "baseline",
            H264Profile::Main => "main",
            H264Profile::High => "high",
        })
    }
}

impl FromStr for H264Profile {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "baseline" => Ok(H264Profile::Baseline),
            "main" => Ok(H264Profile::Main),
            "high" => Ok(H264Profile::High),
            other => Err(ParseEnumError::new(
                "H.264 profile",
                other,
                "baseline, main or high",
            )),
        }
    }
}

/// Output resolutions the benchmark can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    P480,
    P720,
    P1080,
    P1440,
    FourK,
}

impl Resolution {
    /// Width and height in pixels. 480p is 16:9, hence 854.
    pub fn dimensions(self) -> (u32, u32) {
        match self {
            Resolution::P480 => (854, 480),
            Resolution::P720 => (1280, 720),
            Resolution::P1080 => (1920, 1080),
            Resolution::P1440 => (2560, 1440),
            Resolution::FourK => (3840, 2160),
        }
    }
}

impl Display for Resolution {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Resolution::P480 => "480p",
            Resolution::P720 => "720p",
            Resolution::P1080 => "1080p",
            Resolution::P1440 => "1440p",
            Resolution::FourK => "4K",
        })
    }
}

impl FromStr for Resolution {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "480p" => Ok(Resolution::P480),
            "720p" => Ok(Resolution::P720),
            "1080p" => Ok(Resolution::P1080),
            "1440p" => Ok(Resolution::P1440),
            "4K" | "4k" => Ok(Resolution::FourK),
            other => Err(ParseEnumError::new(
                "resolution",
                other,
                "480p, 720p, 1080p, 1440p or 4K",
            )),
        }
    }
}

/// Called with each frame just before it is handed to the device.
pub type EncodingHook = Box<dyn FnMut(&VideoFrame) + Send>;

/// Running encode stage: raw frames in, encoded packets out.
pub struct EncoderStage {
    pub packets: Arc<BlockingQueue<EncodedPacket>>,
    pub done: JoinHandle<()>,
}

/// Configures `device` and spawns the encode loop.
///
/// Before each frame is fed the loop checks the device's pending queue
/// against [`ENCODE_QUEUE_LOW_WATER`] and, when the device is clogged,
/// waits it out with the given [`UncloggingMethod`].
pub fn start_encoder(
    device: Box<dyn EncodeDevice>,
    config: EncoderConfig,
    unclogging: UncloggingMethod,
    frames: Arc<BlockingQueue<VideoFrame>>,
    on_encoding: Option<EncodingHook>,
    latch: ErrorLatch,
) -> EncoderStage {
    let packets = Arc::new(BlockingQueue::new(PACKET_QUEUE_CAPACITY));
    let done = tokio::spawn(run_encoder(
        device,
        config,
        unclogging,
        frames,
        packets.clone(),
        on_encoding,
        latch,
    ));
    EncoderStage { packets, done }
}

async fn run_encoder(
    mut device: Box<dyn EncodeDevice>,
    config: EncoderConfig,
    unclogging: UncloggingMethod,
    frames: Arc<BlockingQueue<VideoFrame>>,
    packets: Arc<BlockingQueue<EncodedPacket>>,
    mut on_encoding: Option<EncodingHook>,
    latch: ErrorLatch,
) {
    let serial = SerialQueue::with_timeout_millis(0);
    // Watch channels turn the device's callback-world signals into
    // something the feed loop can select on without missing an edge.
    let (dequeue_tx, mut dequeue_rx) = watch::channel(0u64);
    let (tick_tx, mut tick_rx) = watch::channel(0u64);

    let callbacks = EncodeCallbacks {
        output: Box::new({
            let serial = serial.clone();
            let packets = packets.clone();
            move |chunk, metadata| {
                tick_tx.send_modify(|n| *n = n.wrapping_add(1));
                let packets = packets.clone();
                let _ = serial.enqueue(async move {
                    if packets.push(EncodedPacket { chunk, metadata }).await.is_err() {
                        log::debug!("packet queue closed under the encoder");
                    }
                });
            }
        }),
        dequeue: Box::new(move || {
            dequeue_tx.send_modify(|n| *n = n.wrapping_add(1));
        }),
        error: Box::new({
            let latch = latch.clone();
            move |error| latch.trip(PipelineError::Device(error))
        }),
    };

    if let Err(error) = device.configure(config, callbacks) {
        latch.trip(PipelineError::Device(error));
        frames.close();
        packets.close();
        return;
    }

    let eof = loop {
        let frame = tokio::select! {
            _ = latch.cancelled() => break false,
            frame = frames.pull() => frame,
        };
        let Some(frame) = frame else { break true };

        if let Err(error) = wait_until_unclogged(
            &mut device,
            unclogging,
            &mut dequeue_rx,
            &mut tick_rx,
            &latch,
        )
        .await
        {
            latch.trip(error);
            break false;
        }
        if latch.is_cancelled() {
            break false;
        }

        if let Some(hook) = on_encoding.as_mut() {
            hook(&frame);
        }
        device.encode(frame);
    };

    if eof {
        tokio::select! {
            _ = latch.cancelled() => {}
            flushed = device.flush() => {
                if let Err(error) = flushed {
                    latch.trip(PipelineError::Device(error));
                }
            }
        }
    } else {
        frames.close();
    }

    // Close behind any packet pushes the device already emitted. On
    // cancellation close directly so a suspended push cannot wedge us.
    let close = serial.enqueue({
        let packets = packets.clone();
        async move { packets.close() }
    });
    tokio::select! {
        _ = latch.cancelled() => packets.close(),
        _ = close => {}
    }
}

/// Resolves once the device's pending queue is back under the low water
/// mark, or immediately on cancellation.
async fn wait_until_unclogged(
    device: &mut Box<dyn EncodeDevice>,
    method: UncloggingMethod,
    dequeue_events: &mut watch::Receiver<u64>,
    output_ticks: &mut watch::Receiver<u64>,
    latch: &ErrorLatch,
) -> Result<(), PipelineError> {
    match method {
        UncloggingMethod::DequeueEvent | UncloggingMethod::PollingOutput => loop {
            // Mark both channels seen before the check so an edge that
            // lands after it still wakes the select below.
            dequeue_events.borrow_and_update();
            output_ticks.borrow_and_update();
            if device.pending_queue_size() < ENCODE_QUEUE_LOW_WATER {
                return Ok(());
            }
            let polling = method == UncloggingMethod::PollingOutput;
            tokio::select! {
                _ = latch.cancelled() => return Ok(()),
                _ = dequeue_events.changed() => {}
                _ = output_ticks.changed(), if polling => {}
                _ = time::sleep(UNCLOG_POLL_INTERVAL), if polling => {}
            }
        },
        UncloggingMethod::FlushEncoder => {
            if device.pending_queue_size() < ENCODE_QUEUE_LOW_WATER {
                return Ok(());
            }
            tokio::select! {
                _ = latch.cancelled() => return Ok(()),
                flushed = device.flush() => flushed.map_err(PipelineError::Device)?,
            }
            let pending = device.pending_queue_size();
            if pending >= ENCODE_QUEUE_LOW_WATER {
                return Err(PipelineError::EncoderClogged {
                    pending,
                    low_water: ENCODE_QUEUE_LOW_WATER,
                });
            }
            Ok(())
        }
    }
}

#[cfg(test)]
#[path = "encoder_test.rs"]
mod encoder_test;

//! Capability contract between the pipeline and the external codec
//! devices. Devices are event driven: they take a callback bundle at
//! configure time and fire it as outputs become available, possibly
//! from their own tasks and possibly synchronously from inside a
//! `decode`/`encode` call.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::frame::VideoFrame;
use crate::packet::{CodedChunk, EncodeMetadata};

/// Terminal failure reported by a device through its error callback or
/// returned from one of its operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct DeviceError(pub String);

impl DeviceError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Rejected token while parsing one of the config enums from text.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {what} {value:?} (expected one of: {expected})")]
pub struct ParseEnumError {
    what: &'static str,
    value: String,
    expected: &'static str,
}

impl ParseEnumError {
    pub fn new(what: &'static str, value: &str, expected: &'static str) -> Self {
        Self {
            what,
            value: value.to_string(),
            expected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Acceleration {
    #[default]
    NoPreference,
    PreferHardware,
    PreferSoftware,
}

impl Display for Acceleration {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Acceleration::NoPreference => "no-preference",
            Acceleration::PreferHardware => "prefer-hardware",
            Acceleration::PreferSoftware => "prefer-software",
        })
    }
}

impl FromStr for Acceleration {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "no-preference" => Ok(Acceleration::NoPreference),
            "prefer-hardware" => Ok(Acceleration::PreferHardware),
            "prefer-software" => Ok(Acceleration::PreferSoftware),
            other => Err(ParseEnumError::new(
                "acceleration preference",
                other,
                "no-preference, prefer-hardware or prefer-software",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BitrateMode {
    Constant,
    #[default]
    Variable,
    Quantizer,
}

impl Display for BitrateMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BitrateMode::Constant => "constant",
            BitrateMode::Variable => "variable",
            BitrateMode::Quantizer => "quantizer",
        })
    }
}

impl FromStr for BitrateMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "constant" => Ok(BitrateMode::Constant),
            "variable" => Ok(BitrateMode::Variable),
            "quantizer" => Ok(BitrateMode::Quantizer),
            other => Err(ParseEnumError::new(
                "bitrate mode",
                other,
                "constant, variable or quantizer",
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LatencyMode {
    #[default]
    Quality,
    Realtime,
}

impl Display for LatencyMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            LatencyMode::Quality => "quality",
            LatencyMode::Realtime => "realtime",
        })
    }
}

impl FromStr for LatencyMode {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quality" => Ok(LatencyMode::Quality),
            "realtime" => Ok(LatencyMode::Realtime),
            other => Err(ParseEnumError::new(
                "latency mode",
                other,
                "quality or realtime",
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DecoderConfig {
    pub codec: String,
    pub coded_width: u32,
    pub coded_height: u32,
    pub acceleration: Acceleration,
    /// Out-of-band codec description (e.g. avcC). Absent for Annex-B
    /// streams, which carry their parameter sets in band.
    pub description: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncoderConfig {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub bitrate: u64,
    pub framerate: f64,
    pub acceleration: Acceleration,
    pub bitrate_mode: BitrateMode,
    pub latency_mode: LatencyMode,
}

pub type FrameSink = Box<dyn FnMut(VideoFrame) + Send>;
pub type ChunkSink = Box<dyn FnMut(CodedChunk, EncodeMetadata) + Send>;
pub type ErrorSink = Box<dyn Fn(DeviceError) + Send + Sync>;
pub type DequeueSignal = Box<dyn Fn() + Send + Sync>;

pub struct DecodeCallbacks {
    pub output: FrameSink,
    pub error: ErrorSink,
}

pub struct EncodeCallbacks {
    pub output: ChunkSink,
    /// Fired whenever the device's pending queue shrinks.
    pub dequeue: DequeueSignal,
    pub error: ErrorSink,
}

#[async_trait]
pub trait DecodeDevice: Send {
    fn configure(
        &mut self,
        config: DecoderConfig,
        callbacks: DecodeCallbacks,
    ) -> Result<(), DeviceError>;

    /// Queues a chunk for decoding. Outputs arrive through the
    /// configured callbacks.
    fn decode(&mut self, chunk: CodedChunk);

    /// Resolves once every queued chunk has produced its outputs.
    async fn flush(&mut self) -> Result<(), DeviceError>;
}

#[async_trait]
pub trait EncodeDevice: Send {
    fn configure(
        &mut self,
        config: EncoderConfig,
        callbacks: EncodeCallbacks,
    ) -> Result<(), DeviceError>;

    /// Queues a frame for encoding.
    fn encode(&mut self, frame: VideoFrame);

    /// Number of queued frames the device has not consumed yet.
    fn pending_queue_size(&self) -> usize;

    /// Resolves once every queued frame has produced its outputs.
    async fn flush(&mut self) -> Result<(), DeviceError>;
}

/// Byte range of the source file, tagged with its absolute offset, as
/// container demuxers want their input.
#[derive(Debug, Clone)]
pub struct FileChunk {
    pub file_offset: u64,
    pub data: Bytes,
}

/// Video track parameters reported by a container demuxer once it has
/// seen enough of the file.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    pub id: u32,
    pub codec: String,
    pub width: u32,
    pub height: u32,
    /// Out-of-band codec description (e.g. the avcC box payload).
    pub description: Option<Bytes>,
}

/// One demuxed sample in track timescale units.
#[derive(Debug, Clone)]
pub struct ContainerSample {
    pub is_sync: bool,
    /// Composition timestamp in `timescale` units.
    pub cts: u64,
    pub duration: u64,
    pub timescale: u32,
    pub data: Bytes,
}

pub struct DemuxCallbacks {
    pub ready: Box<dyn FnMut(TrackInfo) + Send>,
    pub samples: Box<dyn FnMut(u32, Vec<ContainerSample>) + Send>,
    pub error: ErrorSink,
}

/// External container (e.g. MP4) demuxer. Bytes go in, track info and
/// samples come out through the callbacks.
pub trait ContainerDemuxer: Send {
    fn configure(&mut self, callbacks: DemuxCallbacks) -> Result<(), DeviceError>;

    fn append_buffer(&mut self, chunk: FileChunk) -> Result<(), DeviceError>;

    /// Forces out any samples the demuxer is still sitting on.
    fn flush(&mut self) -> Result<(), DeviceError>;
}

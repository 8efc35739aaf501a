//! Building blocks for a browser-style video transcoding pipeline:
//! bounded queues, a serializer for callback-driven devices, H.264
//! bitstream demuxing, and the decode/encode stages that tie them to
//! pluggable codec devices.

pub mod bitstream;
pub mod decoder;
pub mod demuxer;
pub mod device;
pub mod encoder;
pub mod error;
pub mod frame;
pub mod nalu;
pub mod packet;
pub mod pipeline;
pub mod queue;
pub mod search;
pub mod serial;
pub mod sps;

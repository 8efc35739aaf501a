use std::fmt::{Display, Formatter};

use bytes::Bytes;

/// Decoded video frame as handed out by a decode device.
///
/// The payload is an opaque byte buffer owned by the device that
/// produced it; the pipeline only routes frames, it never looks inside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    /// Presentation timestamp in microseconds.
    pub timestamp: i64,
    /// Duration in microseconds, when the producer knows it.
    pub duration: Option<i64>,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl VideoFrame {
    pub fn byte_length(&self) -> usize {
        self.data.len()
    }
}

impl Display for VideoFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{} frame @ {}us ({} bytes)",
            self.width,
            self.height,
            self.timestamp,
            self.data.len()
        )
    }
}

use std::fmt::{Display, Formatter};

use bytes::Bytes;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    /// Independently decodable (an IDR slice in H.264 terms).
    Key,
    /// Depends on previously decoded chunks.
    Delta,
}

impl Display for ChunkKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ChunkKind::Key => "key",
            ChunkKind::Delta => "delta",
        })
    }
}

/// One coded video chunk: the unit of work fed to a decode device and
/// produced by an encode device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodedChunk {
    pub kind: ChunkKind,
    /// Presentation timestamp in microseconds.
    pub timestamp: i64,
    /// Duration in microseconds, when known.
    pub duration: Option<i64>,
    pub data: Bytes,
}

impl CodedChunk {
    pub fn is_key(&self) -> bool {
        matches!(self.kind, ChunkKind::Key)
    }

    pub fn byte_length(&self) -> usize {
        self.data.len()
    }
}

impl Display for CodedChunk {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} chunk @ {}us ({} bytes)",
            self.kind,
            self.timestamp,
            self.data.len()
        )
    }
}

/// Side data an encode device may attach to an output chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncodeMetadata {
    /// Out-of-band decoder description (e.g. an avcC box payload),
    /// typically attached to the first chunk only.
    pub description: Option<Bytes>,
}

/// What the encode stage hands downstream: the chunk plus its side data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPacket {
    pub chunk: CodedChunk,
    pub metadata: EncodeMetadata,
}

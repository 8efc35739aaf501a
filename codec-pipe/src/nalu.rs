//! Annex-B NAL unit demultiplexer.
//!
//! Reassembles discrete NAL units out of an arbitrarily-chunked byte
//! stream. Units are delimited by the two standard start-code markers
//! (`00 00 00 01` and `00 00 01`); a unit becomes available once its
//! closing marker (or end of stream) has been seen. Chunk boundaries
//! carry no meaning: a marker split across two `push` calls is found
//! exactly as if the stream had arrived in one piece.

use bytes::{Bytes, BytesMut};

use crate::search::search;

/// 4-byte Annex-B start code.
pub const LONG_START_CODE: [u8; 4] = [0, 0, 0, 1];
/// 3-byte Annex-B start code.
pub const SHORT_START_CODE: [u8; 3] = [0, 0, 1];

/// H.264 NAL unit types (table 7-1), from the 5 low bits of the header
/// byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NalUnitType {
    /// 0 and 24-31.
    Unspecified(u8),
    SliceNonIdr,
    SlicePartitionA,
    SlicePartitionB,
    SlicePartitionC,
    SliceIdr,
    Sei,
    SequenceParameterSet,
    PictureParameterSet,
    AccessUnitDelimiter,
    EndOfSequence,
    EndOfStream,
    FillerData,
    SpsExtension,
    PrefixNalUnit,
    SubsetSps,
    DepthParameterSet,
    /// 17, 18, 22 and 23.
    Reserved(u8),
    SliceAux,
    SliceExtension,
    SliceExtensionDepth,
}

impl NalUnitType {
    pub fn from_id(id: u8) -> Self {
        match id & 0x1F {
            1 => NalUnitType::SliceNonIdr,
            2 => NalUnitType::SlicePartitionA,
            3 => NalUnitType::SlicePartitionB,
            4 => NalUnitType::SlicePartitionC,
            5 => NalUnitType::SliceIdr,
            6 => NalUnitType::Sei,
            7 => NalUnitType::SequenceParameterSet,
            8 => NalUnitType::PictureParameterSet,
            9 => NalUnitType::AccessUnitDelimiter,
            10 => NalUnitType::EndOfSequence,
            11 => NalUnitType::EndOfStream,
            12 => NalUnitType::FillerData,
            13 => NalUnitType::SpsExtension,
            14 => NalUnitType::PrefixNalUnit,
            15 => NalUnitType::SubsetSps,
            16 => NalUnitType::DepthParameterSet,
            19 => NalUnitType::SliceAux,
            20 => NalUnitType::SliceExtension,
            21 => NalUnitType::SliceExtensionDepth,
            id @ (17 | 18 | 22 | 23) => NalUnitType::Reserved(id),
            id => NalUnitType::Unspecified(id),
        }
    }

    pub fn id(self) -> u8 {
        match self {
            NalUnitType::Unspecified(id) => id,
            NalUnitType::SliceNonIdr => 1,
            NalUnitType::SlicePartitionA => 2,
            NalUnitType::SlicePartitionB => 3,
            NalUnitType::SlicePartitionC => 4,
            NalUnitType::SliceIdr => 5,
            NalUnitType::Sei => 6,
            NalUnitType::SequenceParameterSet => 7,
            NalUnitType::PictureParameterSet => 8,
            NalUnitType::AccessUnitDelimiter => 9,
            NalUnitType::EndOfSequence => 10,
            NalUnitType::EndOfStream => 11,
            NalUnitType::FillerData => 12,
            NalUnitType::SpsExtension => 13,
            NalUnitType::PrefixNalUnit => 14,
            NalUnitType::SubsetSps => 15,
            NalUnitType::DepthParameterSet => 16,
            NalUnitType::Reserved(id) => id,
            NalUnitType::SliceAux => 19,
            NalUnitType::SliceExtension => 20,
            NalUnitType::SliceExtensionDepth => 21,
        }
    }
}

/// One delimited NAL unit.
#[derive(Clone, Debug)]
pub struct NalUnit {
    pub unit_type: NalUnitType,
    /// `nal_ref_idc`, 0-3. Non-zero means the unit is a reference.
    pub ref_idc: u8,
    /// Unit bytes past the start code and the header byte.
    pub body: Bytes,
    /// Unit bytes including the start code.
    pub raw: Bytes,
}

impl std::fmt::Display for NalUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "NalUnit {{ type: {:?}, ref_idc: {}, body: {}B }}",
            self.unit_type,
            self.ref_idc,
            self.body.len()
        )
    }
}

/// A start-code marker position. `at` is relative to the current chunk;
/// negative offsets reach back into the carry-over tail when a marker
/// straddles a chunk boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Mark {
    at: isize,
    len: usize,
}

/// Splits a chunked Annex-B byte stream into NAL units.
///
/// Bytes between two markers form one unit; anything after the last
/// marker is carried over until the next `push` or the final `flush`.
/// Carried fragments are never copied more than once per emitted unit.
#[derive(Default)]
pub struct NaluDemuxer {
    carry: Vec<Bytes>,
    carry_len: usize,
    /// Length of the start code that opened the pending unit. Zero until
    /// the first marker of the stream has been seen.
    pending_prefix: usize,
    terminated: bool,
}

impl NaluDemuxer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk, returning every unit it completes, in stream
    /// order. A chunk with no marker is absorbed into the carry-over and
    /// returns nothing.
    pub fn push(&mut self, chunk: Bytes) -> Vec<NalUnit> {
        assert!(!self.terminated, "push after flush");
        if chunk.is_empty() {
            return Vec::new();
        }

        let marks = self.locate_marks(&chunk);
        if marks.is_empty() {
            self.carry_len += chunk.len();
            self.carry.push(chunk);
            return Vec::new();
        }

        // Linearize the carry-over once; every slice below is cheap.
        let carried = self.take_carry();
        let carry_len = carried.len() as isize;
        let cut = |from: isize, to: isize| -> Bytes {
            if from >= 0 {
                return chunk.slice(from as usize..to as usize);
            }
            let mut buf = BytesMut::with_capacity((to - from) as usize);
            let stop = to.min(0);
            buf.extend_from_slice(
                &carried[(carry_len + from) as usize..(carry_len + stop) as usize],
            );
            if to > 0 {
                buf.extend_from_slice(&chunk[..to as usize]);
            }
            buf.freeze()
        };

        let mut units = Vec::with_capacity(marks.len());
        let first = marks[0];
        if let Some(unit) = classify(cut(-carry_len, first.at), self.pending_prefix) {
            units.push(unit);
        }
        for pair in marks.windows(2) {
            if let Some(unit) = classify(cut(pair[0].at, pair[1].at), pair[0].len) {
                units.push(unit);
            }
        }

        // The tail from the last marker becomes the new pending unit.
        let last = marks[marks.len() - 1];
        self.pending_prefix = last.len;
        if last.at < 0 {
            let kept = carried.slice((carry_len + last.at) as usize..);
            self.carry_len = kept.len() + chunk.len();
            self.carry.push(kept);
            self.carry.push(chunk);
        } else {
            let kept = chunk.slice(last.at as usize..);
            self.carry_len = kept.len();
            self.carry.push(kept);
        }
        units
    }

    /// Emits whatever remains carried over as the final unit and
    /// terminates the stream. An empty carry-over, or one holding a bare
    /// start code, emits nothing. Idempotent; `push` is invalid after
    /// the first `flush`.
    pub fn flush(&mut self) -> Option<NalUnit> {
        if self.terminated {
            return None;
        }
        self.terminated = true;
        let prefix = self.pending_prefix;
        self.pending_prefix = 0;
        if self.carry_len == 0 {
            return None;
        }
        classify(self.take_carry(), prefix)
    }

    /// Drains the carry-over fragments into one contiguous buffer.
    fn take_carry(&mut self) -> Bytes {
        self.carry_len = 0;
        if self.carry.len() == 1 {
            return self.carry.pop().unwrap();
        }
        let mut buf = BytesMut::with_capacity(self.carry.iter().map(Bytes::len).sum());
        for frag in self.carry.drain(..) {
            buf.extend_from_slice(&frag);
        }
        buf.freeze()
    }

    /// Finds every marker position relevant to this chunk: markers inside
    /// the chunk itself, plus markers straddling the carry-over tail.
    /// Short-code matches that are really the tail of a long code are
    /// dropped (a long marker at `p` always embeds a short match at
    /// `p + 1`).
    fn locate_marks(&self, chunk: &Bytes) -> Vec<Mark> {
        let mut longs: Vec<isize> = Vec::new();
        let mut shorts: Vec<isize> = Vec::new();

        let tail_len = self.carry_len.min(SHORT_START_CODE.len());
        if tail_len > 0 {
            let mut window = Vec::with_capacity(tail_len + SHORT_START_CODE.len());
            self.copy_carry_tail(tail_len, &mut window);
            window.extend_from_slice(&chunk[..chunk.len().min(SHORT_START_CODE.len())]);
            // Keep only matches that begin in the tail and reach into the
            // chunk; anything fully inside the tail is the pending unit's
            // own opening marker, already accounted for.
            let keep = |at: isize, len: usize| at < 0 && at + len as isize > 0;
            for p in search(&window, &LONG_START_CODE) {
                let at = p as isize - tail_len as isize;
                if keep(at, LONG_START_CODE.len()) {
                    longs.push(at);
                }
            }
            for p in search(&window, &SHORT_START_CODE) {
                let at = p as isize - tail_len as isize;
                if keep(at, SHORT_START_CODE.len()) {
                    shorts.push(at);
                }
            }
        }
        longs.extend(search(chunk, &LONG_START_CODE).into_iter().map(|p| p as isize));
        shorts.extend(search(chunk, &SHORT_START_CODE).into_iter().map(|p| p as isize));

        let mut marks: Vec<Mark> = longs
            .iter()
            .map(|&at| Mark { at, len: LONG_START_CODE.len() })
            .chain(
                shorts
                    .iter()
                    .filter(|&&at| !longs.contains(&(at - 1)))
                    .map(|&at| Mark { at, len: SHORT_START_CODE.len() }),
            )
            .collect();
        marks.sort_by_key(|m| m.at);
        marks
    }

    /// Copies the last `tail_len` carried bytes into `out`.
    fn copy_carry_tail(&self, tail_len: usize, out: &mut Vec<u8>) {
        let mut skip = self.carry_len - tail_len;
        for frag in &self.carry {
            if skip >= frag.len() {
                skip -= frag.len();
                continue;
            }
            out.extend_from_slice(&frag[skip..]);
            skip = 0;
        }
    }
}

/// Strips the start code, decodes the header byte and builds the unit.
/// Units empty after marker stripping (two adjacent markers) yield
/// nothing.
fn classify(raw: Bytes, prefix: usize) -> Option<NalUnit> {
    if raw.len() <= prefix {
        return None;
    }
    let header = raw[prefix];
    Some(NalUnit {
        unit_type: NalUnitType::from_id(header & 0x1F),
        ref_idc: (header >> 5) & 0x03,
        body: raw.slice(prefix + 1..),
        raw,
    })
}

#[cfg(test)]
#[path = "nalu_test.rs"]
mod nalu_test;

//! Coordinate normalization for aligned sequences.
//!
//! Engines report alignment ends in whatever order suits them. Reports use
//! ascending coordinates for forward frames and descending coordinates for
//! reverse frames, so readers can recover the strand from `from`/`to` alone.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SequenceType {
    /// A query or subject aligned sequence.
    Aligned,
    /// The consensus line between two aligned sequences.
    Midline,
}

/// One side of an HSP: where it lies on its sequence and in which frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CoordinateBlock {
    pub from: u32,
    pub to: u32,
    pub frame: i32,
    pub full_len: u32,
    /// Only computed when a literal, non-midline sequence was supplied.
    pub gaps: Option<u32>,
    pub sequence: Option<String>,
    pub kind: SequenceType,
}

/// Order `(from, to)` according to the frame sign.
pub fn order_coordinates(from: u32, to: u32, frame: i32) -> (u32, u32) {
    let low = from.min(to);
    let high = from.max(to);
    if frame < 0 {
        (high, low)
    } else {
        (low, high)
    }
}

/// Count characters that are neither letters nor the stop symbol `*`.
pub fn count_gaps(sequence: &str) -> u32 {
    sequence
        .chars()
        .filter(|ch| !(ch.is_alphabetic() || *ch == '*'))
        .count() as u32
}

pub fn normalize(
    from: u32,
    to: u32,
    frame: i32,
    full_len: u32,
    sequence: Option<&str>,
    kind: SequenceType,
) -> CoordinateBlock {
    let (from, to) = order_coordinates(from, to, frame);
    let gaps = match (sequence, kind) {
        (Some(seq), SequenceType::Aligned) => Some(count_gaps(seq)),
        _ => None,
    };

    CoordinateBlock {
        from,
        to,
        frame,
        full_len,
        gaps,
        sequence: sequence.map(str::to_string),
        kind,
    }
}

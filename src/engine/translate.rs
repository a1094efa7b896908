//! Six-frame translation with the standard genetic code.

use bio::alphabets::dna;

const BASES: &[u8; 4] = b"TCAG";
// standard code, codons ordered TTT, TTC, TTA, TTG, TCT, ...
const STANDARD_CODE: &[u8; 64] =
    b"FFLLSSSSYY**CC*WLLLLPPPPHHQQRRRRIIIMTTTTNNKKSSRRVVVVAAAADDEEGGGG";

fn base_index(base: u8) -> Option<usize> {
    let base = match base.to_ascii_uppercase() {
        b'U' => b'T',
        b => b,
    };
    BASES.iter().position(|b| *b == base)
}

pub fn translate_codon(codon: &[u8]) -> u8 {
    match (
        base_index(codon[0]),
        base_index(codon[1]),
        base_index(codon[2]),
    ) {
        (Some(a), Some(b), Some(c)) => STANDARD_CODE[a * 16 + b * 4 + c],
        _ => b'X',
    }
}

pub fn translate(seq: &[u8]) -> Vec<u8> {
    seq.chunks_exact(3).map(translate_codon).collect()
}

/// A translated reading frame of a nucleotide sequence.
#[derive(Debug, Clone)]
pub struct Frame {
    /// 1..=3 forward, -1..=-3 reverse.
    pub frame: i32,
    pub protein: Vec<u8>,
}

pub fn six_frames(seq: &[u8]) -> Vec<Frame> {
    let rc = dna::revcomp(seq);
    let mut frames = Vec::with_capacity(6);
    for offset in 0..3 {
        if seq.len() > offset {
            frames.push(Frame {
                frame: offset as i32 + 1,
                protein: translate(&seq[offset..]),
            });
        }
    }
    for offset in 0..3 {
        if rc.len() > offset {
            frames.push(Frame {
                frame: -(offset as i32 + 1),
                protein: translate(&rc[offset..]),
            });
        }
    }
    frames
}

/// Map a half-open amino-acid interval of a translated frame back onto
/// 1-based nucleotide coordinates of the original strand. Reverse frames
/// come back high-to-low.
pub fn protein_to_nucleotide(frame: i32, aa_start: usize, aa_end: usize, nt_len: usize) -> (u32, u32) {
    let offset = (frame.unsigned_abs() as usize).saturating_sub(1);
    let start = offset + 3 * aa_start;
    let end = offset + 3 * aa_end;
    if frame > 0 {
        ((start + 1) as u32, end as u32)
    } else {
        ((nt_len - start) as u32, (nt_len - end + 1) as u32)
    }
}

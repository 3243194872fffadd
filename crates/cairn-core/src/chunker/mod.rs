pub mod polynomial;

use std::io::Read;

use crate::cancel::CancelToken;
use crate::error::Result;

pub use polynomial::Pol;

/// Bytes covered by the rolling hash at any time.
pub const WINDOW_SIZE: usize = 64;
/// Chunks below this size are impossible except at EOF.
pub const MIN_SIZE: usize = 512 * 1024;
/// A boundary is forced at this size regardless of hash.
pub const MAX_SIZE: usize = 8 * 1024 * 1024;

/// Number of zero bits required in the rolling hash for a boundary,
/// giving an average chunk size of about 1 MiB.
const AVERAGE_BITS: u32 = 20;
const SPLITMASK: u64 = (1 << AVERAGE_BITS) - 1;

/// Internal read buffer size.
const BUF_SIZE: usize = 512 * 1024;

/// One chunk cut from the input stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Byte offset of this chunk in the input stream.
    pub offset: u64,
    pub data: Vec<u8>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Precomputed lookup tables for one polynomial.
///
/// `out[b]` is the hash contribution of byte `b` leaving the window after
/// `WINDOW_SIZE - 1` further shifts; XORing it removes the oldest byte.
/// `mod_[i]` folds the reduction of the top hash byte `i` into one XOR.
struct Tables {
    out: [u64; 256],
    mod_: [u64; 256],
}

fn append_byte(hash: Pol, b: u8, pol: Pol) -> Pol {
    Pol((hash.0 << 8) | b as u64) % pol
}

fn calc_tables(pol: Pol) -> Tables {
    let mut out = [0u64; 256];
    let mut mod_ = [0u64; 256];
    for b in 0..256usize {
        let mut h = append_byte(Pol::ZERO, b as u8, pol);
        for _ in 0..WINDOW_SIZE - 1 {
            h = append_byte(h, 0, pol);
        }
        out[b] = h.0;
    }
    let k = pol.deg() as u32;
    for b in 0..256u64 {
        mod_[b as usize] = (Pol(b << k) % pol).0 | (b << k);
    }
    Tables { out, mod_ }
}

/// Content-defined chunker: splits a byte stream into variable-size chunks
/// whose boundaries depend only on local content, so insertions and deletions
/// shift only nearby boundaries.
///
/// Maintains a Rabin fingerprint over a 64-byte sliding window and declares a
/// boundary when the low `AVERAGE_BITS` bits of the hash are zero, subject to
/// [`MIN_SIZE`] and [`MAX_SIZE`]. The sequence of boundaries is deterministic
/// for a fixed polynomial and input, and is not restartable.
pub struct Chunker<R> {
    reader: R,
    tables: Tables,
    pol_shift: u32,

    window: [u8; WINDOW_SIZE],
    wpos: usize,
    digest: u64,

    buf: Vec<u8>,
    buf_pos: usize,
    buf_len: usize,
    eof: bool,
    stream_pos: u64,
}

impl<R: Read> Chunker<R> {
    pub fn new(reader: R, pol: Pol) -> Self {
        let pol_shift = pol.deg() as u32 - 8;
        let mut chunker = Self {
            reader,
            tables: calc_tables(pol),
            pol_shift,
            window: [0u8; WINDOW_SIZE],
            wpos: 0,
            digest: 0,
            buf: vec![0u8; BUF_SIZE],
            buf_pos: 0,
            buf_len: 0,
            eof: false,
            stream_pos: 0,
        };
        chunker.reset_hash();
        chunker
    }

    /// Cut the next chunk. Returns `None` at end of input. The final chunk
    /// terminates at EOF even if smaller than [`MIN_SIZE`]; empty input
    /// produces no chunks.
    pub fn next_chunk(&mut self, cancel: &CancelToken) -> Result<Option<Chunk>> {
        cancel.check()?;

        let offset = self.stream_pos;
        let mut data: Vec<u8> = Vec::new();

        loop {
            if self.buf_pos >= self.buf_len {
                if !self.fill_buf()? {
                    break; // EOF: final chunk is whatever accumulated
                }
            }

            let b = self.buf[self.buf_pos];
            self.buf_pos += 1;
            self.slide(b);
            data.push(b);

            if data.len() >= MAX_SIZE {
                break;
            }
            // Below MIN_SIZE the mask test is skipped.
            if data.len() >= MIN_SIZE && self.digest & SPLITMASK == 0 {
                break;
            }
        }

        if data.is_empty() {
            return Ok(None);
        }

        self.stream_pos += data.len() as u64;
        self.reset_hash();
        Ok(Some(Chunk { offset, data }))
    }

    /// Refill the read buffer. Returns false at EOF.
    fn fill_buf(&mut self) -> Result<bool> {
        if self.eof {
            return Ok(false);
        }
        loop {
            match self.reader.read(&mut self.buf) {
                Ok(0) => {
                    self.eof = true;
                    return Ok(false);
                }
                Ok(n) => {
                    self.buf_pos = 0;
                    self.buf_len = n;
                    return Ok(true);
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Reset the rolling hash state at a chunk boundary.
    fn reset_hash(&mut self) {
        self.window = [0u8; WINDOW_SIZE];
        self.wpos = 0;
        self.digest = 0;
        // Seed the hash so an all-zero window still produces a useful digest.
        self.slide(1);
    }

    fn slide(&mut self, b: u8) {
        let out = self.window[self.wpos];
        self.window[self.wpos] = b;
        self.digest ^= self.tables.out[out as usize];
        self.wpos += 1;
        if self.wpos >= WINDOW_SIZE {
            self.wpos = 0;
        }

        let index = (self.digest >> self.pol_shift) as usize;
        self.digest <<= 8;
        self.digest |= b as u64;
        self.digest ^= self.tables.mod_[index];
    }
}

#[cfg(test)]
mod tests {
    use super::polynomial::TEST_POL;
    use super::*;
    use std::io::Cursor;

    /// Deterministic pseudo-random bytes (xorshift) for boundary tests.
    pub(crate) fn test_data(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed | 1;
        let mut out = Vec::with_capacity(len);
        while out.len() < len {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            out.extend_from_slice(&state.to_le_bytes());
        }
        out.truncate(len);
        out
    }

    fn chunk_all(data: &[u8]) -> Vec<Chunk> {
        let cancel = CancelToken::new();
        let mut chunker = Chunker::new(Cursor::new(data.to_vec()), TEST_POL);
        let mut chunks = Vec::new();
        while let Some(chunk) = chunker.next_chunk(&cancel).unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn empty_input_no_chunks() {
        assert!(chunk_all(b"").is_empty());
    }

    #[test]
    fn input_below_min_size_is_one_chunk() {
        let data = test_data(4096, 7);
        let chunks = chunk_all(&data);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].offset, 0);
        assert_eq!(chunks[0].data, data);
    }

    #[test]
    fn chunks_cover_entire_input() {
        let data = test_data(10 * 1024 * 1024, 42);
        let chunks = chunk_all(&data);
        assert!(chunks.len() > 1, "10 MiB of random data must split");

        let mut expected_offset = 0u64;
        let mut reassembled = Vec::new();
        for chunk in &chunks {
            assert_eq!(chunk.offset, expected_offset, "gap or overlap");
            expected_offset += chunk.len() as u64;
            reassembled.extend_from_slice(&chunk.data);
        }
        assert_eq!(reassembled, data);
    }

    #[test]
    fn respects_size_bounds() {
        let data = test_data(20 * 1024 * 1024, 3);
        let chunks = chunk_all(&data);
        for (i, chunk) in chunks.iter().enumerate() {
            assert!(chunk.len() <= MAX_SIZE, "chunk {i} exceeds max size");
            if i + 1 < chunks.len() {
                assert!(chunk.len() >= MIN_SIZE, "non-final chunk {i} below min size");
            }
        }
    }

    #[test]
    fn constant_input_forces_max_size_cuts() {
        // A constant stream never matches the split mask, so every cut is a
        // forced MAX_SIZE cut except the final remainder.
        let data = vec![0xCCu8; MAX_SIZE * 2 + 100];
        let chunks = chunk_all(&data);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), MAX_SIZE);
        assert_eq!(chunks[1].len(), MAX_SIZE);
        assert_eq!(chunks[2].len(), 100);
    }

    #[test]
    fn deterministic_for_fixed_polynomial() {
        let data = test_data(6 * 1024 * 1024, 99);
        assert_eq!(chunk_all(&data), chunk_all(&data));
    }

    #[test]
    fn different_polynomials_cut_differently() {
        let data = test_data(8 * 1024 * 1024, 5);
        let other = Pol::random().unwrap();
        let cancel = CancelToken::new();

        let mut a = Chunker::new(Cursor::new(data.clone()), TEST_POL);
        let mut b = Chunker::new(Cursor::new(data), other);
        let mut lens_a = Vec::new();
        let mut lens_b = Vec::new();
        while let Some(c) = a.next_chunk(&cancel).unwrap() {
            lens_a.push(c.len());
        }
        while let Some(c) = b.next_chunk(&cancel).unwrap() {
            lens_b.push(c.len());
        }
        // Identical boundary sequences for independent random polynomials
        // would be an astronomically unlikely accident.
        assert_ne!(lens_a, lens_b);
    }

    #[test]
    fn shift_resistance() {
        // Prepending bytes must leave the interior boundary sequence intact:
        // boundaries re-synchronize once a cut lands on a common content
        // position, and from there on the sequences are identical.
        const PREFIX: u64 = 1024;
        let data = test_data(24 * 1024 * 1024, 17);
        let mut shifted = test_data(PREFIX as usize, 23);
        shifted.extend_from_slice(&data);

        // Boundary end-positions in coordinates of `data`.
        let plain_cuts: Vec<u64> = chunk_all(&data)
            .iter()
            .map(|c| c.offset + c.len() as u64)
            .collect();
        let shifted_cuts: Vec<u64> = chunk_all(&shifted)
            .iter()
            .filter_map(|c| (c.offset + c.len() as u64).checked_sub(PREFIX))
            .collect();

        let common = plain_cuts.iter().find(|cut| shifted_cuts.contains(cut));
        let first = *common.expect("boundary chains never re-synchronized");

        let plain_tail: Vec<u64> = plain_cuts.iter().copied().filter(|&c| c >= first).collect();
        let shifted_tail: Vec<u64> = shifted_cuts.iter().copied().filter(|&c| c >= first).collect();
        assert_eq!(
            plain_tail, shifted_tail,
            "boundary sequences diverged after re-synchronizing"
        );
    }

    #[test]
    fn canceled_token_aborts() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut chunker = Chunker::new(Cursor::new(vec![0u8; 1024]), TEST_POL);
        assert!(chunker.next_chunk(&cancel).is_err());
    }
}

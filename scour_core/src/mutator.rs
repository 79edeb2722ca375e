//! The mutation engine: twenty-three operators, explore/exploit dispatch,
//! and the provenance trace attached to every generated input.

use crate::defs::MAX_INPUT_SIZE;
use crate::rng::Pcg;
use crate::rodata::{InputRecord, MetaData, RoData};
use crate::runner::ExecKind;
use crate::substr::{self, SubstrCorpus};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use rand_core::RngCore;
use std::collections::HashSet;
use std::fmt;
use std::io::{Read, Write};
use std::mem;
use std::sync::LazyLock;
use weezl::BitOrder;

/// Number of mutation operators the dispatcher chooses between.
pub const N_MUTATIONS: u32 = 23;

/// Percentage of iterations that explore uniformly instead of exploiting the
/// learned operator weights. 100 = always explore, 0 = exploit if possible.
const EPSILON: u32 = 90;

/// Boundary byte values that frequently sit on parsing edges in targets.
pub static INTERESTING8: [i8; 9] = [-128, -1, 0, 1, 16, 32, 64, 100, 127];

/// 16-bit boundary values; includes every 8-bit one.
pub static INTERESTING16: LazyLock<Vec<i16>> = LazyLock::new(|| {
    let mut v: Vec<i16> = vec![
        -32768, -129, 128, 255, 256, 512, 1000, 1024, 4096, 32767,
    ];
    v.extend(INTERESTING8.iter().map(|&x| i16::from(x)));
    v
});

/// 32-bit boundary values; includes every 16-bit one.
pub static INTERESTING32: LazyLock<Vec<i32>> = LazyLock::new(|| {
    let mut v: Vec<i32> = vec![
        -2147483648,
        -100663046,
        -32769,
        32768,
        65535,
        65536,
        100663045,
        2147483647,
    ];
    v.extend(INTERESTING16.iter().map(|&x| i32::from(x)));
    v
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    fn read_u16(self, b: &[u8]) -> u16 {
        let a: [u8; 2] = b.try_into().expect("2-byte window");
        match self {
            ByteOrder::Little => u16::from_le_bytes(a),
            ByteOrder::Big => u16::from_be_bytes(a),
        }
    }

    fn write_u16(self, b: &mut [u8], v: u16) {
        let a = match self {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        };
        b.copy_from_slice(&a);
    }

    fn read_u32(self, b: &[u8]) -> u32 {
        let a: [u8; 4] = b.try_into().expect("4-byte window");
        match self {
            ByteOrder::Little => u32::from_le_bytes(a),
            ByteOrder::Big => u32::from_be_bytes(a),
        }
    }

    fn write_u32(self, b: &mut [u8], v: u32) {
        let a = match self {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        };
        b.copy_from_slice(&a);
    }

    fn read_u64(self, b: &[u8]) -> u64 {
        let a: [u8; 8] = b.try_into().expect("8-byte window");
        match self {
            ByteOrder::Little => u64::from_le_bytes(a),
            ByteOrder::Big => u64::from_be_bytes(a),
        }
    }

    fn write_u64(self, b: &mut [u8], v: u64) {
        let a = match self {
            ByteOrder::Little => v.to_le_bytes(),
            ByteOrder::Big => v.to_be_bytes(),
        };
        b.copy_from_slice(&a);
    }
}

/// Replaces `s[start..start + n]` with `r` in place.
///
/// Equal-length replacements overwrite directly; shrinking replacements
/// overwrite then close the gap; growing replacements overwrite the covered
/// range then shift the tail, reusing the backing storage when capacity
/// allows.
///
/// # Panics
///
/// Panics when the replaced range is out of bounds; that is a caller bug.
pub fn splice(s: &mut Vec<u8>, start: usize, n: usize, r: &[u8]) {
    let end = start
        .checked_add(n)
        .filter(|&e| e <= s.len())
        .unwrap_or_else(|| panic!("splice range {start}+{n} out of bounds for {}", s.len()));
    if r.len() == n {
        s[start..end].copy_from_slice(r);
    } else if r.len() < n {
        s[start..start + r.len()].copy_from_slice(r);
        s.drain(start + r.len()..end);
    } else {
        s[start..end].copy_from_slice(&r[..n]);
        s.splice(end..end, r[n..].iter().copied());
    }
}

/// One recorded dispatcher decision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Choice {
    pub which: u32,
    pub sub: Vec<i64>,
    pub useless: bool,
}

/// The provenance of a generated input: which operators ran, in what order,
/// and what kind of execution the input was produced for.
#[derive(Debug, Clone)]
pub struct Whence {
    pub choices: Vec<Choice>,
    pub iters: usize,
    pub initial_len: usize,
    pub exec_kind: ExecKind,
    pub sonar: String,
    pub initial_corpus: bool,
}

impl Default for Whence {
    fn default() -> Self {
        Self {
            choices: Vec::new(),
            iters: 0,
            initial_len: 0,
            exec_kind: ExecKind::Fuzz,
            sonar: String::new(),
            initial_corpus: false,
        }
    }
}

impl fmt::Display for Whence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.initial_corpus {
            write!(f, "initial corpus- ")?;
        }
        if self.choices.is_empty() && self.sonar.is_empty() {
            return write!(f, "<{:?}>", self.exec_kind);
        }
        if !self.sonar.is_empty() {
            write!(f, "{} ", self.sonar)?;
        }
        for c in &self.choices {
            if c.useless {
                continue;
            }
            if c.sub.is_empty() {
                write!(f, "{}, ", c.which)?;
            } else {
                write!(f, "{} {:?}, ", c.which, c.sub)?;
            }
        }
        Ok(())
    }
}

/// The mutation operators, indexed by the dispatcher's `which` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutation {
    RemoveRange,
    InsertRandom,
    DuplicateRange,
    CopyRange,
    FlipBits,
    XorByte,
    SwapBytes,
    AddSubByte,
    AddSubWord2,
    AddSubWord4,
    AddSubWord8,
    InterestingByte,
    InterestingWord2,
    InterestingWord4,
    ReplaceDigit,
    ReplaceNumber,
    SpliceOther,
    InsertOther,
    InsertLiteral,
    OverwriteLiteral,
    ReplaceLiteral,
    LzwBitFlip,
    FlateBitFlip,
}

impl Mutation {
    pub const ALL: [Mutation; N_MUTATIONS as usize] = [
        Mutation::RemoveRange,
        Mutation::InsertRandom,
        Mutation::DuplicateRange,
        Mutation::CopyRange,
        Mutation::FlipBits,
        Mutation::XorByte,
        Mutation::SwapBytes,
        Mutation::AddSubByte,
        Mutation::AddSubWord2,
        Mutation::AddSubWord4,
        Mutation::AddSubWord8,
        Mutation::InterestingByte,
        Mutation::InterestingWord2,
        Mutation::InterestingWord4,
        Mutation::ReplaceDigit,
        Mutation::ReplaceNumber,
        Mutation::SpliceOther,
        Mutation::InsertOther,
        Mutation::InsertLiteral,
        Mutation::OverwriteLiteral,
        Mutation::ReplaceLiteral,
        Mutation::LzwBitFlip,
        Mutation::FlateBitFlip,
    ];

    pub fn from_which(which: u32) -> Mutation {
        Self::ALL[which as usize]
    }
}

/// Per-worker mutation engine. Owns its generator, its substring corpus and
/// its collected sonar samples; nothing here is shared between workers.
pub struct Mutator {
    r: Pcg,
    sc: SubstrCorpus,
    sonar_samples: HashSet<Vec<u8>>,
    scratch: Vec<u8>,
}

impl Mutator {
    /// Builds a worker's engine from the target metadata, drawing the 16-byte
    /// generator seeds from `seed_source`.
    pub fn new(meta: &MetaData, seed_source: &mut impl RngCore) -> Self {
        let r = Pcg::from_rng(seed_source);
        let elements = meta
            .literals
            .strings
            .iter()
            .map(|s| s.as_bytes().to_vec())
            .chain(meta.literals.ints.iter().cloned());
        let sc = SubstrCorpus::new(seed_source, elements);
        Self {
            r,
            sc,
            sonar_samples: HashSet::new(),
            scratch: Vec::new(),
        }
    }

    /// Picks a parent from the corpus proportional to score and mutates it.
    /// Returns the child, its provenance, and its depth hint.
    pub fn generate(&mut self, ro: &RoData) -> (Vec<u8>, Whence, usize) {
        let total = ro
            .corpus
            .last()
            .map(|inp| inp.running_score_sum)
            .unwrap_or(0);
        assert!(total > 0, "generate requires a scored, non-empty corpus");
        let w = self.r.u32n(total as u32) as u64;
        let input = &ro.corpus[weighted_index(&ro.corpus, w)];
        let (data, whence) = self.mutate(&input.data, ro);
        (data, whence, input.depth + 1)
    }

    /// Mutates a copy of `data`, applying a geometrically-distributed number
    /// of operators and continuing until at least one of them changed the
    /// bytes. The result never exceeds [`MAX_INPUT_SIZE`].
    pub fn mutate(&mut self, data: &[u8], ro: &RoData) -> (Vec<u8>, Whence) {
        let mut res = data.to_vec();
        let nm = self.r.exp2();
        let mut whence = Whence {
            iters: nm,
            initial_len: data.len(),
            ..Default::default()
        };
        let mut iter = 0;
        while iter < nm || res == data {
            if res == data {
                // Everything so far cancelled out; the previous choice
                // contributed nothing worth replaying.
                if let Some(last) = whence.choices.last_mut() {
                    last.useless = true;
                }
            }
            let which = self.dispatch(ro);
            let mut choice = Choice {
                which,
                ..Default::default()
            };
            if !self.apply(Mutation::from_which(which), &mut res, ro, &mut choice) {
                // Precondition failed; the choice was not taken and is not
                // counted against the iteration budget.
                continue;
            }
            whence.choices.push(choice);
            iter += 1;
        }
        if res.len() > MAX_INPUT_SIZE {
            let off = self.r.u32n((res.len() - MAX_INPUT_SIZE + 1) as u32) as usize;
            res = res[off..off + MAX_INPUT_SIZE].to_vec();
        }
        (res, whence)
    }

    /// Chooses the next operator: uniformly when exploring (or when the
    /// snapshot carries no usable weights), otherwise proportional to the
    /// learned weights as a Thompson-sampling hedge.
    fn dispatch(&mut self, ro: &RoData) -> u32 {
        if !ro.can_exploit || self.r.u32n(100) < EPSILON {
            return self.r.u32n(N_MUTATIONS);
        }
        let total = *ro
            .mut_weights
            .last()
            .expect("exploitable snapshot carries operator weights");
        let w = self.r.u32n(total);
        weight_index(&ro.mut_weights, w)
    }

    /// Applies one operator to `res` in place. Returns `false` when the
    /// operator's precondition does not hold, leaving `res` untouched; any
    /// operator-specific sub-decisions are recorded into `choice`.
    pub fn apply(
        &mut self,
        op: Mutation,
        res: &mut Vec<u8>,
        ro: &RoData,
        choice: &mut Choice,
    ) -> bool {
        match op {
            Mutation::RemoveRange => {
                if res.len() <= 1 {
                    return false;
                }
                let pos = self.r.u32n(res.len() as u32) as usize;
                let n = self.choose_len(res.len() - pos);
                res.drain(pos..pos + n);
            }
            Mutation::InsertRandom => {
                let pos = self.r.u32n(res.len() as u32 + 1) as usize;
                let n = self.choose_len(10);
                let fresh: Vec<u8> = (0..n).map(|_| self.r.u32n(256) as u8).collect();
                splice(res, pos, 0, &fresh);
            }
            Mutation::DuplicateRange => {
                if res.len() <= 1 {
                    return false;
                }
                let src = self.r.u32n(res.len() as u32) as usize;
                let mut dst = self.r.u32n(res.len() as u32) as usize;
                while dst == src {
                    dst = self.r.u32n(res.len() as u32) as usize;
                }
                let n = self.choose_len(res.len() - src);
                let tmp = res[src..src + n].to_vec();
                splice(res, dst, 0, &tmp);
            }
            Mutation::CopyRange => {
                if res.len() <= 1 {
                    return false;
                }
                let src = self.r.u32n(res.len() as u32) as usize;
                let mut dst = self.r.u32n(res.len() as u32) as usize;
                while dst == src {
                    dst = self.r.u32n(res.len() as u32) as usize;
                }
                let n = self.choose_len(res.len() - src).min(res.len() - dst);
                res.copy_within(src..src + n, dst);
            }
            Mutation::FlipBits => {
                if res.is_empty() {
                    return false;
                }
                let nflips = self.r.exp2();
                for _ in 0..nflips {
                    let pos = self.r.u32n(res.len() as u32) as usize;
                    res[pos] ^= 1 << self.r.u32n(8);
                }
            }
            Mutation::XorByte => {
                if res.is_empty() {
                    return false;
                }
                let pos = self.r.u32n(res.len() as u32) as usize;
                res[pos] ^= (self.r.u32n(255) + 1) as u8;
            }
            Mutation::SwapBytes => {
                if res.len() <= 1 {
                    return false;
                }
                let src = self.r.u32n(res.len() as u32) as usize;
                let mut dst = self.r.u32n(res.len() as u32) as usize;
                while dst == src {
                    dst = self.r.u32n(res.len() as u32) as usize;
                }
                res.swap(src, dst);
            }
            Mutation::AddSubByte => {
                if res.is_empty() {
                    return false;
                }
                let pos = self.r.u32n(res.len() as u32) as usize;
                let v = (self.r.u32n(35) + 1) as u8;
                res[pos] = if self.r.rand_bool() {
                    res[pos].wrapping_add(v)
                } else {
                    res[pos].wrapping_sub(v)
                };
            }
            Mutation::AddSubWord2 => {
                if res.len() < 2 {
                    return false;
                }
                let off = self.r.u32n((res.len() - 1) as u32) as usize;
                let mut v = (self.r.u32n(35) + 1) as u16;
                if self.r.rand_bool() {
                    v = v.wrapping_neg();
                }
                let order = self.byte_order();
                let cur = order.read_u16(&res[off..off + 2]);
                order.write_u16(&mut res[off..off + 2], cur.wrapping_add(v));
            }
            Mutation::AddSubWord4 => {
                if res.len() < 4 {
                    return false;
                }
                let off = self.r.u32n((res.len() - 3) as u32) as usize;
                let mut v = self.r.u32n(35) + 1;
                if self.r.rand_bool() {
                    v = v.wrapping_neg();
                }
                let order = self.byte_order();
                let cur = order.read_u32(&res[off..off + 4]);
                order.write_u32(&mut res[off..off + 4], cur.wrapping_add(v));
            }
            Mutation::AddSubWord8 => {
                if res.len() < 8 {
                    return false;
                }
                let off = self.r.u32n((res.len() - 7) as u32) as usize;
                let mut v = u64::from(self.r.u32n(35) + 1);
                if self.r.rand_bool() {
                    v = v.wrapping_neg();
                }
                let order = self.byte_order();
                let cur = order.read_u64(&res[off..off + 8]);
                order.write_u64(&mut res[off..off + 8], cur.wrapping_add(v));
            }
            Mutation::InterestingByte => {
                if res.is_empty() {
                    return false;
                }
                let pos = self.r.u32n(res.len() as u32) as usize;
                res[pos] = INTERESTING8[self.r.u32n(INTERESTING8.len() as u32) as usize] as u8;
            }
            Mutation::InterestingWord2 => {
                if res.len() < 2 {
                    return false;
                }
                let off = self.r.u32n((res.len() - 1) as u32) as usize;
                let v = INTERESTING16[self.r.u32n(INTERESTING16.len() as u32) as usize] as u16;
                let order = self.byte_order();
                order.write_u16(&mut res[off..off + 2], v);
            }
            Mutation::InterestingWord4 => {
                if res.len() < 4 {
                    return false;
                }
                let off = self.r.u32n((res.len() - 3) as u32) as usize;
                let v = INTERESTING32[self.r.u32n(INTERESTING32.len() as u32) as usize] as u32;
                let order = self.byte_order();
                order.write_u32(&mut res[off..off + 4], v);
            }
            Mutation::ReplaceDigit => {
                let digits: Vec<usize> = res
                    .iter()
                    .enumerate()
                    .filter(|(_, b)| b.is_ascii_digit())
                    .map(|(i, _)| i)
                    .collect();
                if digits.is_empty() {
                    return false;
                }
                let pos = digits[self.r.u32n(digits.len() as u32) as usize];
                let was = res[pos];
                let mut now = b'0' + self.r.u32n(10) as u8;
                while now == was {
                    now = b'0' + self.r.u32n(10) as u8;
                }
                res[pos] = now;
            }
            Mutation::ReplaceNumber => {
                let runs = number_runs(res);
                if runs.is_empty() {
                    return false;
                }
                let (start, end) = runs[self.r.u32n(runs.len() as u32) as usize];
                let mut v: i64 = match self.r.u32n(3) {
                    0 => i64::from(self.r.u32n(1000)),
                    1 => i64::from(self.r.u32n(1 << 30)),
                    _ => i64::from(self.r.u32n(1 << 30)) * i64::from(self.r.u32n(1 << 30)),
                };
                if self.r.rand_bool() {
                    v = -v;
                }
                splice(res, start, end - start, v.to_string().as_bytes());
            }
            Mutation::SpliceOther => {
                if res.len() < 4 || ro.corpus.len() < 2 {
                    return false;
                }
                let other = &ro.corpus[self.r.u32n(ro.corpus.len() as u32) as usize].data;
                if other.len() < 4 || std::ptr::eq(res.as_ptr(), other.as_ptr()) {
                    return false;
                }
                let mut idx0 = 0;
                while idx0 < res.len() && idx0 < other.len() && res[idx0] == other[idx0] {
                    idx0 += 1;
                }
                let mut idx1 = 0;
                while idx1 < res.len()
                    && idx1 < other.len()
                    && res[res.len() - idx1 - 1] == other[other.len() - idx1 - 1]
                {
                    idx1 += 1;
                }
                // If the differing middles are tiny, byte flipping covers
                // this better than splicing.
                let diff = (res.len() as i64 - idx0 as i64 - idx1 as i64)
                    .min(other.len() as i64 - idx0 as i64 - idx1 as i64);
                if diff < 4 {
                    return false;
                }
                let n = (self.r.u32n(diff as u32 - 2) + 1) as usize;
                res[idx0..idx0 + n].copy_from_slice(&other[idx0..idx0 + n]);
            }
            Mutation::InsertOther => {
                if res.len() < 4 || ro.corpus.len() < 2 {
                    return false;
                }
                let other = &ro.corpus[self.r.u32n(ro.corpus.len() as u32) as usize].data;
                if other.len() < 4 || std::ptr::eq(res.as_ptr(), other.as_ptr()) {
                    return false;
                }
                let pos = self.r.u32n(res.len() as u32 + 1) as usize;
                let from = self.r.u32n((other.len() - 2) as u32) as usize;
                let n = self.choose_len(other.len() - from - 2) + 2;
                let seg = other[from..from + n].to_vec();
                splice(res, pos, 0, &seg);
            }
            Mutation::InsertLiteral => {
                let Some(lit) = self.pick_literal(ro) else {
                    return false;
                };
                let pos = self.r.u32n(res.len() as u32 + 1) as usize;
                splice(res, pos, 0, &lit);
            }
            Mutation::OverwriteLiteral => {
                let Some(lit) = self.pick_literal(ro) else {
                    return false;
                };
                if lit.len() >= res.len() {
                    return false;
                }
                let off = self.r.u32n((res.len() - lit.len() + 1) as u32) as usize;
                res[off..off + lit.len()].copy_from_slice(&lit);
            }
            Mutation::ReplaceLiteral => {
                let Some(lit) = self.sc.pick(res) else {
                    return false;
                };
                let mut replace = self.pick_literal(ro).unwrap_or_default();
                while replace == lit {
                    replace = self.pick_literal(ro).unwrap_or_default();
                }
                let sub = self.r.u32n(5);
                choice.sub.push(i64::from(sub));
                match sub {
                    0 => {
                        let i = find_or_abort(res, &lit);
                        splice(res, i, lit.len(), &replace);
                    }
                    1 => {
                        let i = rfind_or_abort(res, &lit);
                        splice(res, i, lit.len(), &replace);
                    }
                    2 => {
                        *res = substr::replaced(res, &lit, &replace);
                    }
                    3 => {
                        // Replace the occurrence nearest a random offset:
                        // first one at or after it, else last one before it,
                        // else the offset sits inside the only occurrence and
                        // replace-all covers it.
                        let pos = self.r.u32n(res.len() as u32) as usize;
                        if let Some(i) = substr::find(&res[pos..], &lit) {
                            let i = i + pos;
                            splice(res, i, lit.len(), &replace);
                        } else if let Some(i) = substr::rfind(&res[..pos], &lit) {
                            splice(res, i, lit.len(), &replace);
                        } else {
                            *res = substr::replaced(res, &lit, &replace);
                        }
                    }
                    _ => {
                        // Coin-flip each occurrence independently.
                        let mut out = Vec::with_capacity(res.len());
                        let mut pos = 0;
                        while let Some(off) = substr::find(&res[pos..], &lit) {
                            let i = pos + off;
                            out.extend_from_slice(&res[pos..i]);
                            if self.r.rand_bool() {
                                out.extend_from_slice(&lit);
                            } else {
                                out.extend_from_slice(&replace);
                            }
                            pos = i + lit.len();
                        }
                        out.extend_from_slice(&res[pos..]);
                        *res = out;
                    }
                }
            }
            Mutation::LzwBitFlip => {
                if res.is_empty() {
                    return false;
                }
                let order = if self.r.rand_bool() {
                    BitOrder::Lsb
                } else {
                    BitOrder::Msb
                };
                self.scratch.clear();
                let status = weezl::encode::Encoder::new(order, 8)
                    .into_stream(&mut self.scratch)
                    .encode_all(&res[..])
                    .status;
                if status.is_err() || self.scratch.is_empty() {
                    return false;
                }
                let pos = self.r.u32n(self.scratch.len() as u32) as usize;
                choice.sub.push((10 * pos / self.scratch.len()) as i64);
                self.scratch[pos] ^= 1 << self.r.u32n(8);
                let mut out = Vec::new();
                // The stream is deliberately corrupted; keep whatever decoded.
                let _ = weezl::decode::Decoder::new(order, 8)
                    .into_stream(&mut out)
                    .decode_all(&self.scratch[..]);
                *res = out;
            }
            Mutation::FlateBitFlip => {
                self.scratch.clear();
                let level = self.r.u32n(10);
                let mut enc =
                    DeflateEncoder::new(mem::take(&mut self.scratch), Compression::new(level));
                enc.write_all(res)
                    .expect("deflate into a memory buffer cannot fail");
                self.scratch = enc
                    .finish()
                    .expect("deflate into a memory buffer cannot fail");
                let pos = self.r.u32n(self.scratch.len() as u32) as usize;
                choice.sub.push((10 * pos / self.scratch.len()) as i64);
                self.scratch[pos] ^= 1 << self.r.u32n(8);
                res.clear();
                read_partial(&mut DeflateDecoder::new(&self.scratch[..]), res);
            }
        }
        true
    }

    /// Picks a literal from the snapshot pools, trying strings and integers
    /// in random order; integer literals are byte-reversed a third of the
    /// time to cover the other endianness. Falls back to a collected sonar
    /// sample when both pools are empty; returns `None` only when there is
    /// nothing to draw from at all.
    fn pick_literal(&mut self, ro: &RoData) -> Option<Vec<u8>> {
        if ro.str_lits.is_empty() && ro.int_lits.is_empty() && self.sonar_samples.is_empty() {
            return None;
        }
        let order = if self.r.rand_bool() { [0, 1] } else { [1, 0] };
        for kind in order {
            match kind {
                0 if !ro.str_lits.is_empty() => {
                    let lit = &ro.str_lits[self.r.u32n(ro.str_lits.len() as u32) as usize];
                    return Some(lit.clone());
                }
                1 if !ro.int_lits.is_empty() => {
                    let mut lit =
                        ro.int_lits[self.r.u32n(ro.int_lits.len() as u32) as usize].clone();
                    if self.r.u32n(3) == 0 {
                        lit.reverse();
                    }
                    return Some(lit);
                }
                _ => continue,
            }
        }
        let nth = self.r.u32n(self.sonar_samples.len() as u32) as usize;
        self.sonar_samples.iter().nth(nth).cloned()
    }

    /// Records an operand value observed at a comparison site so it can serve
    /// as mutation payload later. Tiny values carry no information.
    pub fn note_sonar_sample(&mut self, b: &[u8]) {
        if b.len() < 2 || self.sonar_samples.contains(b) {
            return;
        }
        self.sonar_samples.insert(b.to_vec());
        tracing::debug!(
            sample = %String::from_utf8_lossy(b),
            total = self.sonar_samples.len(),
            "collected comparison operand"
        );
    }

    /// Chooses the length of a range mutation, heavily biased toward short
    /// ranges. `n` is the inclusive upper bound and must be at least 1.
    fn choose_len(&mut self, n: usize) -> usize {
        let n = n as u32;
        let len = match self.r.u32n(100) {
            0..=89 => self.r.u32n(n.min(8)) + 1,
            90..=98 => self.r.u32n(n.min(32)) + 1,
            _ => self.r.u32n(n) + 1,
        };
        len as usize
    }

    fn byte_order(&mut self) -> ByteOrder {
        if self.r.rand_bool() {
            ByteOrder::Little
        } else {
            ByteOrder::Big
        }
    }
}

/// Index of the corpus entry whose running score sum first exceeds `w`.
fn weighted_index(corpus: &[InputRecord], w: u64) -> usize {
    corpus.partition_point(|inp| inp.running_score_sum <= w)
}

/// Index of the operator whose weight prefix sum first exceeds `w`.
fn weight_index(weights: &[u32], w: u32) -> u32 {
    weights.partition_point(|&x| x <= w) as u32
}

fn find_or_abort(res: &[u8], lit: &[u8]) -> usize {
    substr::find(res, lit).unwrap_or_else(|| {
        panic!("picked literal {lit:?} cannot be re-found in {res:?}");
    })
}

fn rfind_or_abort(res: &[u8], lit: &[u8]) -> usize {
    substr::rfind(res, lit).unwrap_or_else(|| {
        panic!("picked literal {lit:?} cannot be re-found in {res:?}");
    })
}

/// Locates ASCII integer runs: digits with an optional leading `-`.
///
/// A run is recorded at its breaking character only when it spans more than
/// one byte; a shorter broken run keeps its start, so digits on the far side
/// of the break extend the same run. A run reaching the final byte is
/// recorded when it spans at least two bytes.
fn number_runs(b: &[u8]) -> Vec<(usize, usize)> {
    let mut runs = Vec::new();
    let mut start: Option<usize> = None;
    for (i, &c) in b.iter().enumerate() {
        if c.is_ascii_digit() || (start.is_none() && c == b'-') {
            match start {
                None => start = Some(i),
                Some(s) if i == b.len() - 1 && i - s > 0 => runs.push((s, i + 1)),
                Some(_) => {}
            }
        } else if let Some(s) = start {
            if i - s > 1 {
                runs.push((s, i));
                start = None;
            }
        }
    }
    runs
}

/// Reads everything `r` will give, stopping quietly at the first error: a
/// corrupted compressed stream yields the bytes produced so far.
fn read_partial(r: &mut impl Read, out: &mut Vec<u8>) {
    let mut chunk = [0u8; 4096];
    loop {
        match r.read(&mut chunk) {
            Ok(0) | Err(_) => break,
            Ok(n) => out.extend_from_slice(&chunk[..n]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rodata::Literals;
    use rand_chacha::ChaCha8Rng;
    use rand_core::SeedableRng;

    fn test_mutator(seed: u8) -> Mutator {
        let mut seeds = ChaCha8Rng::from_seed([seed; 32]);
        Mutator::new(&MetaData::default(), &mut seeds)
    }

    fn test_ro() -> RoData {
        RoData {
            corpus: vec![
                InputRecord {
                    data: b"hello world".to_vec(),
                    depth: 0,
                    running_score_sum: 10,
                },
                InputRecord {
                    data: b"the quick brown fox".to_vec(),
                    depth: 1,
                    running_score_sum: 20,
                },
            ],
            str_lits: vec![b"magic".to_vec(), b"header".to_vec()],
            int_lits: vec![vec![0x10, 0x20], vec![1, 2, 3, 4]],
            mut_weights: (1..=N_MUTATIONS).map(|i| i * 3).collect(),
            can_exploit: false,
            sonar_sites: Vec::new(),
        }
    }

    #[test]
    fn splice_replaces_the_middle() {
        let mut s = b"ABCDEF".to_vec();
        splice(&mut s, 2, 2, b"XYZ");
        assert_eq!(s, b"ABXYZEF");
    }

    #[test]
    fn splice_matches_naive_concatenation() {
        let base = b"0123456789".to_vec();
        let replacements: [&[u8]; 4] = [b"", b"a", b"abc", b"abcdefghijkl"];
        for start in 0..=base.len() {
            for n in 0..=base.len() - start {
                for r in replacements {
                    let mut s = base.clone();
                    splice(&mut s, start, n, r);
                    let mut expected = base[..start].to_vec();
                    expected.extend_from_slice(r);
                    expected.extend_from_slice(&base[start + n..]);
                    assert_eq!(s, expected, "splice({start}, {n}, {r:?}) diverged");
                }
            }
        }
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn splice_rejects_out_of_range() {
        let mut s = b"abc".to_vec();
        splice(&mut s, 2, 5, b"x");
    }

    #[test]
    fn mutate_always_changes_the_input() {
        let mut m = test_mutator(1);
        let ro = test_ro();
        for data in [&b"x"[..], b"ab", b"hello world", &[0u8; 64]] {
            for _ in 0..50 {
                let (out, whence) = m.mutate(data, &ro);
                assert_ne!(out.as_slice(), data, "mutate returned the input unchanged");
                assert!(out.len() <= MAX_INPUT_SIZE);
                assert!(whence.iters >= 1);
                assert_eq!(whence.initial_len, data.len());
                assert!(!whence.choices.is_empty());
            }
        }
    }

    #[test]
    fn generate_inherits_depth_from_the_parent() {
        let mut m = test_mutator(2);
        let ro = test_ro();
        for _ in 0..50 {
            let (out, _, depth) = m.generate(&ro);
            assert!(depth == 1 || depth == 2, "depth {depth} has no parent");
            assert!(out.len() <= MAX_INPUT_SIZE);
        }
    }

    #[test]
    #[should_panic(expected = "scored, non-empty corpus")]
    fn generate_rejects_an_empty_corpus() {
        let mut m = test_mutator(3);
        m.generate(&RoData::default());
    }

    #[test]
    fn weighted_index_edges() {
        let corpus: Vec<InputRecord> = [10u64, 30, 60]
            .iter()
            .map(|&s| InputRecord {
                data: Vec::new(),
                depth: 0,
                running_score_sum: s,
            })
            .collect();
        assert_eq!(weighted_index(&corpus, 0), 0);
        assert_eq!(weighted_index(&corpus, 9), 0);
        assert_eq!(weighted_index(&corpus, 10), 1);
        assert_eq!(weighted_index(&corpus, 29), 1);
        assert_eq!(weighted_index(&corpus, 30), 2);
        assert_eq!(weighted_index(&corpus, 59), 2);
    }

    #[test]
    fn weight_index_edges() {
        let weights = [5u32, 15, 20];
        assert_eq!(weight_index(&weights, 0), 0);
        assert_eq!(weight_index(&weights, 4), 0);
        assert_eq!(weight_index(&weights, 5), 1);
        assert_eq!(weight_index(&weights, 14), 1);
        assert_eq!(weight_index(&weights, 15), 2);
        assert_eq!(weight_index(&weights, 19), 2);
    }

    #[test]
    fn interesting_tables_compose() {
        assert_eq!(INTERESTING8.len(), 9);
        assert_eq!(INTERESTING16.len(), 19);
        assert_eq!(INTERESTING32.len(), 27);
        for &v in INTERESTING8.iter() {
            assert!(INTERESTING16.contains(&i16::from(v)));
        }
        for &v in INTERESTING16.iter() {
            assert!(INTERESTING32.contains(&i32::from(v)));
        }
    }

    #[test]
    fn interesting_byte_touches_exactly_one_position() {
        let mut m = test_mutator(11);
        let ro = RoData::default();
        let original = vec![0u8; 16];
        let allowed = [0x80u8, 0xFF, 0x01, 0x10, 0x20, 0x40, 0x64, 0x7F];
        let mut changed = 0;
        for _ in 0..200 {
            let mut res = original.clone();
            let mut choice = Choice::default();
            assert!(m.apply(Mutation::InterestingByte, &mut res, &ro, &mut choice));
            let diffs: Vec<usize> = (0..original.len())
                .filter(|&i| res[i] != original[i])
                .collect();
            if diffs.is_empty() {
                // The table contains 0, which matches the background.
                continue;
            }
            changed += 1;
            assert_eq!(diffs.len(), 1, "more than one byte changed: {res:?}");
            assert!(
                allowed.contains(&res[diffs[0]]),
                "unexpected replacement value {:#x}",
                res[diffs[0]]
            );
        }
        assert!(changed > 0, "operator never changed the buffer");
    }

    #[test]
    fn remove_range_requires_two_bytes() {
        let mut m = test_mutator(4);
        let ro = RoData::default();
        let mut tiny = vec![7u8];
        assert!(!m.apply(Mutation::RemoveRange, &mut tiny, &ro, &mut Choice::default()));
        assert_eq!(tiny, vec![7u8], "failed precondition must not touch the buffer");

        let mut buf = b"abcdef".to_vec();
        assert!(m.apply(Mutation::RemoveRange, &mut buf, &ro, &mut Choice::default()));
        assert!(buf.len() < 6);
    }

    #[test]
    fn insert_random_grows_the_buffer() {
        let mut m = test_mutator(5);
        let ro = RoData::default();
        let mut buf = Vec::new();
        assert!(m.apply(Mutation::InsertRandom, &mut buf, &ro, &mut Choice::default()));
        assert!((1..=10).contains(&buf.len()));
    }

    #[test]
    fn replace_number_keeps_the_surroundings() {
        let mut m = test_mutator(6);
        let ro = RoData::default();
        for _ in 0..50 {
            let mut buf = b"id=100;".to_vec();
            assert!(m.apply(Mutation::ReplaceNumber, &mut buf, &ro, &mut Choice::default()));
            assert!(buf.starts_with(b"id="), "prefix clobbered: {buf:?}");
            assert!(buf.ends_with(b";"), "suffix clobbered: {buf:?}");
            let middle = std::str::from_utf8(&buf[3..buf.len() - 1]).unwrap();
            middle
                .parse::<i64>()
                .unwrap_or_else(|_| panic!("replacement {middle:?} is not an integer"));
        }
    }

    #[test]
    fn number_runs_finds_signed_and_unsigned_runs() {
        assert_eq!(number_runs(b"abc-123x45x6-"), vec![(3, 7), (8, 10)]);
        assert_eq!(number_runs(b"12"), vec![(0, 2)]);
        assert_eq!(number_runs(b"999"), vec![(0, 3)]);
        assert_eq!(number_runs(b"-5"), vec![(0, 2)]);
        assert_eq!(number_runs(b"x-7"), vec![(1, 3)]);
        assert!(number_runs(b"-").is_empty());
        assert!(number_runs(b"5").is_empty());
        assert!(number_runs(b"no digits").is_empty());
    }

    #[test]
    fn number_runs_reconnect_across_a_short_break() {
        // A one-byte break does not close the run; digits past it extend the
        // same run from its original start.
        assert_eq!(number_runs(b"--12"), vec![(0, 4)]);
        assert_eq!(number_runs(b"1-2"), vec![(0, 3)]);
        // A break after two or more bytes closes the run where it broke.
        assert_eq!(number_runs(b"1--2"), vec![(0, 2)]);
        // The kept start can record a run with no digits at all.
        assert_eq!(number_runs(b"--x"), vec![(0, 2)]);
    }

    #[test]
    fn replace_literal_swaps_a_known_literal() {
        let meta = MetaData {
            literals: Literals {
                strings: vec!["AA".to_string()],
                ints: Vec::new(),
            },
        };
        let mut seeds = ChaCha8Rng::from_seed([20u8; 32]);
        let mut m = Mutator::new(&meta, &mut seeds);
        let ro = RoData {
            str_lits: vec![b"AA".to_vec(), b"BB".to_vec()],
            ..Default::default()
        };
        // A single occurrence: every sub-choice that changes anything must
        // produce the same replacement, including the replace-all fallback
        // when the random offset lands inside the only occurrence.
        loop {
            let mut buf = b"xxAAyy".to_vec();
            let mut choice = Choice::default();
            assert!(m.apply(Mutation::ReplaceLiteral, &mut buf, &ro, &mut choice));
            assert_eq!(choice.sub.len(), 1);
            if buf != b"xxAAyy" {
                assert_eq!(buf, b"xxBByy");
                break;
            }
        }
    }

    #[test]
    fn replace_literal_needs_a_contained_literal() {
        let meta = MetaData {
            literals: Literals {
                strings: vec!["ZZ".to_string()],
                ints: Vec::new(),
            },
        };
        let mut seeds = ChaCha8Rng::from_seed([21u8; 32]);
        let mut m = Mutator::new(&meta, &mut seeds);
        let ro = test_ro();
        let mut buf = b"nothing matches".to_vec();
        assert!(!m.apply(Mutation::ReplaceLiteral, &mut buf, &ro, &mut Choice::default()));
    }

    #[test]
    fn literal_operators_skip_without_a_pool() {
        let mut m = test_mutator(7);
        let ro = RoData::default();
        let mut buf = b"some data".to_vec();
        assert!(!m.apply(Mutation::InsertLiteral, &mut buf, &ro, &mut Choice::default()));
        assert!(!m.apply(Mutation::OverwriteLiteral, &mut buf, &ro, &mut Choice::default()));
        assert_eq!(buf, b"some data");
    }

    #[test]
    fn sonar_samples_back_the_literal_pool() {
        let mut m = test_mutator(8);
        let empty = RoData::default();
        assert_eq!(m.pick_literal(&empty), None);

        m.note_sonar_sample(b"x"); // too short to keep
        assert_eq!(m.pick_literal(&empty), None);

        m.note_sonar_sample(b"token");
        assert_eq!(m.pick_literal(&empty), Some(b"token".to_vec()));
    }

    #[test]
    fn pick_literal_draws_from_the_snapshot_pools() {
        let mut m = test_mutator(9);
        let ro = test_ro();
        for _ in 0..100 {
            let lit = m.pick_literal(&ro).expect("pools are non-empty");
            let from_strings = ro.str_lits.contains(&lit);
            let from_ints = ro
                .int_lits
                .iter()
                .any(|i| *i == lit || i.iter().rev().copied().collect::<Vec<u8>>() == lit);
            assert!(
                from_strings || from_ints,
                "literal {lit:?} is from neither pool"
            );
        }
    }

    #[test]
    fn compression_operators_round_trip_through_a_bit_flip() {
        let mut m = test_mutator(10);
        let ro = RoData::default();
        let data = b"the quick brown fox jumps over the lazy dog".to_vec();

        let mut buf = data.clone();
        let mut choice = Choice::default();
        assert!(m.apply(Mutation::LzwBitFlip, &mut buf, &ro, &mut choice));
        assert_eq!(choice.sub.len(), 1, "flip position decile must be recorded");
        assert!((0..=9).contains(&choice.sub[0]));

        let mut buf = data.clone();
        let mut choice = Choice::default();
        assert!(m.apply(Mutation::FlateBitFlip, &mut buf, &ro, &mut choice));
        assert_eq!(choice.sub.len(), 1);
        assert!((0..=9).contains(&choice.sub[0]));

        let mut empty = Vec::new();
        assert!(!m.apply(Mutation::LzwBitFlip, &mut empty, &ro, &mut Choice::default()));
    }

    #[test]
    fn choose_len_respects_its_bound() {
        let mut m = test_mutator(12);
        for n in [1usize, 2, 7, 8, 9, 31, 32, 33, 1000] {
            for _ in 0..200 {
                let len = m.choose_len(n);
                assert!((1..=n).contains(&len), "choose_len({n}) returned {len}");
            }
        }
    }

    #[test]
    fn whence_renders_useful_choices_only() {
        let whence = Whence {
            choices: vec![
                Choice {
                    which: 4,
                    sub: Vec::new(),
                    useless: false,
                },
                Choice {
                    which: 20,
                    sub: vec![2],
                    useless: false,
                },
                Choice {
                    which: 7,
                    sub: Vec::new(),
                    useless: true,
                },
            ],
            iters: 3,
            initial_len: 10,
            exec_kind: ExecKind::Fuzz,
            sonar: String::new(),
            initial_corpus: true,
        };
        assert_eq!(whence.to_string(), "initial corpus- 4, 20 [2], ");

        let bare = Whence::default();
        assert_eq!(bare.to_string(), "<Fuzz>");

        let hint = Whence {
            sonar: "rev-inc".to_string(),
            exec_kind: ExecKind::SonarHint,
            ..Default::default()
        };
        assert_eq!(hint.to_string(), "rev-inc ");
    }
}

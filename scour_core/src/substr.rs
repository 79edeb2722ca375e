//! Literal corpus with randomised substring lookup, plus the byte-string
//! search helpers the rest of the engine shares.

use crate::rng::Pcg;
use rand_core::RngCore;
use std::ops::Range;

/// Returns the position of the first occurrence of `needle` in `haystack`.
///
/// Plain byte search; literals are short, inputs are bounded, and the scan is
/// the corpus pick's inner loop, so there is nothing to be clever about.
pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Returns the position of the last occurrence of `needle` in `haystack`.
pub fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(haystack.len());
    }
    if needle.len() > haystack.len() {
        return None;
    }
    haystack.windows(needle.len()).rposition(|w| w == needle)
}

/// Returns `haystack` with every non-overlapping occurrence of `from`
/// (scanned left to right) replaced by `to`.
pub fn replaced(haystack: &[u8], from: &[u8], to: &[u8]) -> Vec<u8> {
    debug_assert!(!from.is_empty());
    let mut out = Vec::with_capacity(haystack.len());
    let mut pos = 0;
    while let Some(off) = find(&haystack[pos..], from) {
        let i = pos + off;
        out.extend_from_slice(&haystack[pos..i]);
        out.extend_from_slice(to);
        pos = i + from.len();
    }
    out.extend_from_slice(&haystack[pos..]);
    out
}

/// A fixed set of literals supporting "pick an element that occurs somewhere
/// in this byte string".
///
/// The element contents are flattened into one contiguous buffer with
/// per-element ranges into it, which keeps the repeated containment scans
/// cache-friendly. A scratch permutation over the element indices is reused
/// across calls; `pick` shuffles it in place and never restores it, because a
/// randomised order is exactly what the next call wants anyway.
#[derive(Debug)]
pub struct SubstrCorpus {
    r: Pcg,
    buf: Vec<u8>,
    elems: Vec<Range<usize>>,
    perm: Vec<usize>,
}

impl SubstrCorpus {
    /// Builds a corpus from `elements`, drawing the generator seed from
    /// `seed_source`. Empty elements are dropped: they would be "contained"
    /// in every input and make `pick` degenerate.
    pub fn new(seed_source: &mut impl RngCore, elements: impl IntoIterator<Item = Vec<u8>>) -> Self {
        let kept: Vec<Vec<u8>> = elements.into_iter().filter(|e| !e.is_empty()).collect();
        let mut buf = Vec::with_capacity(kept.iter().map(Vec::len).sum());
        let mut elems = Vec::with_capacity(kept.len());
        for e in &kept {
            let start = buf.len();
            buf.extend_from_slice(e);
            elems.push(start..buf.len());
        }
        let perm = (0..elems.len()).collect();
        Self {
            r: Pcg::from_rng(seed_source),
            buf,
            elems,
            perm,
        }
    }

    pub fn len(&self) -> usize {
        self.elems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elems.is_empty()
    }

    /// Returns a random corpus element that is a substring of `b`, or `None`
    /// if no element is.
    ///
    /// Truncated Fisher-Yates: draw a random untried element, test it, and on
    /// a miss swap it behind the advancing front so it is never retried within
    /// this call. Each element is examined at most once, and the randomised
    /// order avoids bias toward early-inserted literals.
    pub fn pick(&mut self, b: &[u8]) -> Option<Vec<u8>> {
        let mut start = 0;
        while start < self.perm.len() {
            let idx = start + self.r.u32n((self.perm.len() - start) as u32) as usize;
            let needle = &self.buf[self.elems[self.perm[idx]].clone()];
            if find(b, needle).is_some() {
                return Some(needle.to_vec());
            }
            self.perm.swap(start, idx);
            start += 1;
        }
        None
    }
}

//! Comparison-site telemetry: parsing the packed records the instrumented
//! target emits, per-site statistics, and the encoding-aware rewriter that
//! tries to flip each observed comparison by editing the input.

use crate::defs::{COVER_SIZE, SONAR_HDR_LEN, SONAR_MAX_LEN};
use crate::mutator::{Mutator, Whence};
use crate::rodata::RoData;
use crate::runner::{Candidate, ExecKind, Runner, RunnerError};
use crate::substr;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

/// Comparison operator, in the low three flag bits.
pub const OP_MASK: u8 = 0x07;
pub const OP_EQL: u8 = 0;
pub const OP_NEQ: u8 = 1;
pub const OP_LSS: u8 = 2;
pub const OP_GTR: u8 = 3;
pub const OP_LEQ: u8 = 4;
pub const OP_GEQ: u8 = 5;

/// The compared values are byte strings, not integers.
pub const FLAG_STRING: u8 = 1 << 3;
/// Integer operands are signed.
pub const FLAG_SIGNED: u8 = 1 << 4;
/// The first operand is a compile-time constant.
pub const FLAG_CONST1: u8 = 1 << 5;
/// The second operand is a compile-time constant.
pub const FLAG_CONST2: u8 = 1 << 6;

/// One static comparison point in the target, plus everything learned about
/// it at runtime. The mutable part sits behind a per-site mutex; `update` is
/// the only critical section and it is short.
#[derive(Debug)]
pub struct SonarSite {
    pub id: u32,
    /// Stable textual location within the target source.
    pub loc: String,
    state: Mutex<SiteState>,
}

#[derive(Debug, Default)]
struct SiteState {
    /// Both operands have been seen to vary; once set it never clears.
    dynamic: bool,
    /// Times each outcome was observed during regular fuzzing.
    taken_fuzz: [u64; 2],
    /// Times each outcome was observed in total.
    taken_total: [u64; 2],
    /// First observed operand values, kept until the site proves dynamic.
    val: [Option<Vec<u8>>; 2],
}

impl SonarSite {
    pub fn new(id: u32, loc: impl Into<String>) -> Self {
        Self {
            id,
            loc: loc.into(),
            state: Mutex::new(SiteState::default()),
        }
    }

    /// Folds one observation into the site statistics.
    ///
    /// Returns `(updated, skip)`: `updated` is set the first time an outcome
    /// direction is seen at all, and `skip` asks the caller not to spend
    /// rewriting effort on a site that is already taken both ways often
    /// enough. Sites without constant operands are never skipped; they can
    /// be CRC-style checks that only the rewriter will ever crack.
    pub fn update(&self, sam: &SonarSample, smash: bool, taken: bool) -> (bool, bool) {
        let way = usize::from(taken);
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !st.dynamic && sam.flags & (FLAG_CONST1 | FLAG_CONST2) == 0 {
            if st.val[0].is_none() {
                st.val[0] = Some(sam.val[0].clone());
            }
            if st.val[1].is_none() {
                st.val[1] = Some(sam.val[1].clone());
            }
            if st.val[0].as_deref() != Some(&sam.val[0][..])
                && st.val[1].as_deref() != Some(&sam.val[1][..])
            {
                // Two genuinely different observations on both sides: neither
                // operand is a constant here.
                st.val = [None, None];
                st.dynamic = true;
            }
        }
        let updated = st.taken_total[way] == 0;
        st.taken_total[way] += 1;
        if !smash {
            st.taken_fuzz[way] += 1;
        }
        let mut skip = false;
        if !st.dynamic
            && !smash
            && (st.taken_fuzz[0] > 10 && st.taken_fuzz[1] > 10
                || st.taken_fuzz[0] + st.taken_fuzz[1] > 100)
        {
            skip = true;
        }
        (updated, skip)
    }

    pub fn summary(&self) -> SiteSummary {
        let st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        SiteSummary {
            id: self.id,
            loc: self.loc.clone(),
            dynamic: st.dynamic,
            taken_fuzz: st.taken_fuzz,
            taken_total: st.taken_total,
        }
    }
}

/// One decoded comparison record: the site it belongs to (an index into the
/// snapshot's site table), the flag byte, and both operand values.
#[derive(Debug, Clone)]
pub struct SonarSample {
    pub site: u32,
    pub flags: u8,
    pub val: [Vec<u8>; 2],
}

/// Point-in-time statistics of one site, as written to the profile dump.
#[derive(Debug, Serialize)]
pub struct SiteSummary {
    pub id: u32,
    pub loc: String,
    pub dynamic: bool,
    pub taken_fuzz: [u64; 2],
    pub taken_total: [u64; 2],
}

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("failed to write sonar profile: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to serialize sonar profile: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Decodes a packed stream of comparison records.
///
/// Record layout, little-endian: `u32` with flags in the low byte and the
/// site id above it, then the two operand lengths, then the operand bytes.
/// Unless the comparison is a string one, trailing `0x00`/`0xff` bytes that
/// appear on both operands are trimmed away; the instrumentation widens
/// operands when it cannot tell their exact size, and those extension bytes
/// are noise.
///
/// # Panics
///
/// Panics on malformed data. The instrumentation is trusted; a divergence
/// here means the target was built with an incompatible toolchain, and
/// carrying on would corrupt the site table.
pub fn parse_sonar_data(ro: &RoData, data: &[u8]) -> Vec<SonarSample> {
    let mut sonar = data;
    let mut res = Vec::new();
    while sonar.len() > SONAR_HDR_LEN {
        let id_flags = u32::from_le_bytes([sonar[0], sonar[1], sonar[2], sonar[3]]);
        let flags = id_flags as u8;
        let id = id_flags >> 8;
        let n1 = sonar[4] as usize;
        let n2 = sonar[5] as usize;
        sonar = &sonar[SONAR_HDR_LEN..];
        if n1 > SONAR_MAX_LEN || n2 > SONAR_MAX_LEN || sonar.len() < n1 + n2 {
            panic!(
                "corrupted sonar data: hdr=[{flags}/{n1}/{n2}] data={}",
                sonar.len()
            );
        }
        let mut v1 = sonar[..n1].to_vec();
        let mut v2 = sonar[n1..n1 + n2].to_vec();
        sonar = &sonar[n1 + n2..];
        if flags & FLAG_STRING == 0 {
            trim_extension(&mut v1, &mut v2);
        }
        assert!(
            (id as usize) < ro.sonar_sites.len(),
            "corrupted sonar data: site id {id} out of range"
        );
        res.push(SonarSample {
            site: id,
            flags,
            val: [v1, v2],
        });
    }
    res
}

/// Trims trailing extension bytes (`0x00`/`0xff`) that both operands carry,
/// starting from the end of the longer one.
fn trim_extension(v1: &mut Vec<u8>, v2: &mut Vec<u8>) {
    while !v1.is_empty() || !v2.is_empty() {
        let i = if v2.len() > v1.len() {
            v2.len() - 1
        } else {
            v1.len() - 1
        };
        let c1 = v1.get(i).copied().unwrap_or(0);
        let c2 = v2.get(i).copied().unwrap_or(0);
        if (c1 == 0 || c1 == 0xff) && (c2 == 0 || c2 == 0xff) {
            if i < v1.len() {
                v1.truncate(i);
            }
            if i < v2.len() {
                v2.truncate(i);
            }
        } else {
            break;
        }
    }
}

/// Recomputes the comparison outcome the target observed for this sample.
pub fn evaluate(sam: &SonarSample) -> bool {
    let v1 = &sam.val[0];
    let v2 = &sam.val[1];
    let op = sam.flags & OP_MASK;
    if sam.flags & FLAG_STRING != 0 {
        return compare(v1.as_slice().cmp(v2.as_slice()), op);
    }
    if v1.is_empty() || v2.is_empty() || v1.len() > 8 || v2.len() > 8 || v1.len() != v2.len() {
        return false;
    }
    let signed = sam.flags & FLAG_SIGNED != 0;
    let x1 = extend8(v1, signed);
    let x2 = extend8(v2, signed);
    let ord = if signed {
        i64::from_le_bytes(x1).cmp(&i64::from_le_bytes(x2))
    } else {
        u64::from_le_bytes(x1).cmp(&u64::from_le_bytes(x2))
    };
    compare(ord, op)
}

/// Widens up to 8 operand bytes to a full little-endian word, sign-extending
/// when the value is signed and its top bit is set.
fn extend8(v: &[u8], signed: bool) -> [u8; 8] {
    let fill = if signed && v.last().is_some_and(|&b| b & 0x80 != 0) {
        0xff
    } else {
        0x00
    };
    let mut out = [fill; 8];
    out[..v.len()].copy_from_slice(v);
    out
}

fn compare(ord: Ordering, op: u8) -> bool {
    match op {
        OP_EQL => ord == Ordering::Equal,
        OP_NEQ => ord != Ordering::Equal,
        OP_LSS => ord == Ordering::Less,
        OP_GTR => ord == Ordering::Greater,
        OP_LEQ => ord != Ordering::Greater,
        OP_GEQ => ord != Ordering::Less,
        _ => panic!("bad comparison operator {op}"),
    }
}

/// Adds 1 to `b` interpreted as a little-endian integer, carrying across
/// bytes and never changing the length.
pub fn increment(b: &[u8]) -> Vec<u8> {
    let mut out = b.to_vec();
    for x in out.iter_mut() {
        *x = x.wrapping_add(1);
        if *x != 0 {
            break;
        }
    }
    out
}

/// Subtracts 1 from `b` interpreted as a little-endian integer, borrowing
/// across bytes and never changing the length.
pub fn decrement(b: &[u8]) -> Vec<u8> {
    let mut out = b.to_vec();
    for x in out.iter_mut() {
        let borrow = *x == 0;
        *x = x.wrapping_sub(1);
        if !borrow {
            break;
        }
    }
    out
}

fn reverse(b: &[u8]) -> Vec<u8> {
    let mut out = b.to_vec();
    out.reverse();
    out
}

/// Base-128 varint of an unsigned value, low groups first.
fn uvarint(mut v: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(10);
    while v >= 0x80 {
        out.push(v as u8 | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
    out
}

/// Zigzag base-128 varint of a signed value.
fn varint(v: i64) -> Vec<u8> {
    uvarint((v as u64).wrapping_shl(1) ^ ((v >> 63) as u64))
}

fn format_uint(v: u64, base: u32) -> Vec<u8> {
    match base {
        2 => format!("{v:b}"),
        8 => format!("{v:o}"),
        10 => format!("{v}"),
        16 => format!("{v:x}"),
        _ => panic!("unsupported base {base}"),
    }
    .into_bytes()
}

fn format_int(v: i64, base: u32) -> Vec<u8> {
    if v < 0 {
        let mut out = vec![b'-'];
        out.extend(format_uint(v.unsigned_abs(), base));
        out
    } else {
        format_uint(v as u64, base)
    }
}

fn hex_lower(b: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(b.len() * 2);
    for x in b {
        out.extend_from_slice(format!("{x:02x}").as_bytes());
    }
    out
}

/// Interprets operand bytes as integers all four ways: unsigned/signed,
/// little/big endian. Lengths other than 1, 2, 4, 8 yield zeros, which the
/// callers then discard as equal pairs.
fn bytes_to_ints(buf: &[u8]) -> (u64, u64, i64, i64) {
    match buf.len() {
        1 => {
            let b = buf[0];
            (u64::from(b), u64::from(b), i64::from(b as i8), i64::from(b as i8))
        }
        2 => {
            let le = u16::from_le_bytes([buf[0], buf[1]]);
            let be = u16::from_be_bytes([buf[0], buf[1]]);
            (u64::from(le), u64::from(be), i64::from(le as i16), i64::from(be as i16))
        }
        4 => {
            let le = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
            let be = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
            (u64::from(le), u64::from(be), i64::from(le as i32), i64::from(be as i32))
        }
        8 => {
            let a: [u8; 8] = buf.try_into().expect("8-byte operand");
            let le = u64::from_le_bytes(a);
            let be = u64::from_be_bytes(a);
            (le, be, le as i64, be as i64)
        }
        _ => (0, 0, 0, 0),
    }
}

/// Processes one batch of sonar bytes observed while executing `data`:
/// updates site statistics and pushes rewritten inputs through the runner.
/// Returns whether any site recorded a first-ever outcome direction, so the
/// caller can refresh the profile dump.
pub fn process_sonar_data<R: Runner>(
    mutator: &mut Mutator,
    ro: &RoData,
    data: &[u8],
    sonar: &[u8],
    depth: usize,
    smash: bool,
    runner: &mut R,
) -> Result<bool, RunnerError> {
    let samples = parse_sonar_data(ro, sonar);
    let mut updated = false;
    let mut checked = HashSet::new();
    for sam in &samples {
        let site = &ro.sonar_sites[sam.site as usize];
        let flags = sam.flags;
        let v1 = &sam.val[0];
        let v2 = &sam.val[1];

        if flags & FLAG_STRING != 0 {
            // A non-constant side means the opposing operand likely came
            // from the input; keep it as future mutation payload.
            if flags & FLAG_CONST1 == 0 {
                mutator.note_sonar_sample(v2);
            }
            if flags & FLAG_CONST2 == 0 {
                mutator.note_sonar_sample(v1);
            }
        }

        let taken = evaluate(sam);
        let (upd, skip) = site.update(sam, smash, taken);
        updated |= upd;
        if skip {
            continue;
        }
        if smash && v1 == v2 {
            // Smashing perturbs every byte anyway; breaking an equality here
            // is wasted work.
            continue;
        }

        let mut rw = Rewriter {
            data,
            depth,
            string_cmp: flags & FLAG_STRING != 0,
            checked: &mut checked,
            runner: &mut *runner,
        };
        if flags & FLAG_CONST1 == 0 {
            rw.check1(flags, v1, v2)?;
        }
        if flags & FLAG_CONST2 == 0 {
            rw.check1(flags, v2, v1)?;
        }
    }
    Ok(updated)
}

/// Serializes per-site statistics into `path`, one JSON object per line.
/// Concurrent dumps are serialised so the file is never interleaved.
pub fn dump_profile(path: &Path, sites: &[SonarSite]) -> Result<(), ProfileError> {
    static DUMP_LOCK: Mutex<()> = Mutex::new(());
    let _guard = DUMP_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    let mut out = BufWriter::new(File::create(path)?);
    for site in sites {
        serde_json::to_writer(&mut out, &site.summary())?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

/// One sample's worth of rewriting state: scans the input for an operand
/// value and emits candidates with the opposing value spliced in, across the
/// encodings the operand might have travelled through.
struct Rewriter<'a, R: Runner> {
    data: &'a [u8],
    depth: usize,
    string_cmp: bool,
    /// Each distinct `(v1, v2)` pair is attempted once per input.
    checked: &'a mut HashSet<(Vec<u8>, Vec<u8>)>,
    runner: &'a mut R,
}

impl<R: Runner> Rewriter<'_, R> {
    fn emit(&mut self, tmp: Vec<u8>, tag: &str) -> Result<(), RunnerError> {
        let whence = Whence {
            sonar: tag.to_string(),
            exec_kind: ExecKind::SonarHint,
            ..Default::default()
        };
        self.runner.run(Candidate {
            data: tmp,
            whence,
            depth: self.depth + 1,
            kind: ExecKind::SonarHint,
        })?;
        Ok(())
    }

    /// Scans `indexdata` for occurrences of `v1` and, for each, emits the
    /// input with `v2` substituted at that position. `indexdata` may be a
    /// case-folded copy of the input; the emitted bytes always come from the
    /// original input.
    fn check(
        &mut self,
        indexdata: &[u8],
        v1: &[u8],
        v2: &[u8],
        tag: &str,
    ) -> Result<(), RunnerError> {
        if v1.is_empty() || v1 == v2 || substr::find(indexdata, v1).is_none() {
            return Ok(());
        }
        // Positions found in indexdata index into data below.
        assert_eq!(
            indexdata.len(),
            self.data.len(),
            "index buffer length diverged from the input"
        );
        if !self.checked.insert((v1.to_vec(), v2.to_vec())) {
            return Ok(());
        }
        let mut occurrences = 0usize;
        let mut pos = 0usize;
        while let Some(off) = substr::find(&indexdata[pos..], v1) {
            let i = pos + off;
            pos = i + 1;
            occurrences += 1;
            let mut tmp = Vec::with_capacity(self.data.len() - v1.len() + v2.len());
            tmp.extend_from_slice(&self.data[..i]);
            tmp.extend_from_slice(v2);
            tmp.extend_from_slice(&self.data[i + v1.len()..]);
            tmp.truncate(COVER_SIZE);
            self.emit(tmp.clone(), tag)?;
            if self.string_cmp && v1.len() != v2.len() && tmp.len() < COVER_SIZE {
                // The lengths changed; a 1-byte length prefix just before the
                // occurrence may need the same delta. Multi-byte and varint
                // length fields are not attempted.
                let diff = (v2.len() as i64 - v1.len() as i64) as u8;
                let string_tag = format!("string-{tag}");
                for idx in (i.saturating_sub(5)..i).rev() {
                    tmp[idx] = tmp[idx].wrapping_add(diff);
                    self.emit(tmp.clone(), &string_tag)?;
                    tmp[idx] = tmp[idx].wrapping_sub(diff);
                }
            }
        }
        if occurrences > 1 {
            let tmp = substr::replaced(self.data, v1, v2);
            self.emit(tmp, &format!("replaceall-{tag}"))?;
        }
        Ok(())
    }

    /// Tries every encoding the operand pair might appear under in the input.
    fn check1(&mut self, flags: u8, v1: &[u8], v2: &[u8]) -> Result<(), RunnerError> {
        let data = self.data;
        self.check(data, v1, v2, "base")?;
        if flags & FLAG_STRING != 0 {
            if v1 == &v1.to_ascii_lowercase()[..] && v2 == &v2.to_ascii_lowercase()[..] {
                let lower = data.to_ascii_lowercase();
                self.check(&lower, v1, v2, "lowercase")?;
            }
            if v1 == &v1.to_ascii_uppercase()[..] && v2 == &v2.to_ascii_uppercase()[..] {
                let upper = data.to_ascii_uppercase();
                self.check(&upper, v1, v2, "uppercase")?;
            }
        } else {
            if v1.len() == 1 && v2.len() == 1 && v1[0].is_ascii_lowercase() && v2[0].is_ascii_lowercase()
            {
                let lower = data.to_ascii_lowercase();
                self.check(&lower, v1, v2, "lowercase")?;
            }
            if v1.len() == 1 && v2.len() == 1 && v1[0].is_ascii_uppercase() && v2[0].is_ascii_uppercase()
            {
                let upper = data.to_ascii_uppercase();
                self.check(&upper, v1, v2, "uppercase")?;
            }

            // Increment and decrement cover the ordered comparison operators
            // as well as off-by-one conditions.
            self.check(data, v1, &increment(v2), "inc")?;
            self.check(data, v1, &decrement(v2), "dec")?;

            if v1.len() > 1 {
                // The same, through a big-endian lens.
                self.check(data, &reverse(v1), &reverse(v2), "rev")?;
                self.check(data, &reverse(v1), &reverse(&increment(v2)), "rev-inc")?;
                self.check(data, &reverse(v1), &reverse(&decrement(v2)), "rev-dec")?;
                self.check(data, v1, &reverse(&increment(&reverse(v2))), "rev-inc-rev")?;
                self.check(data, v1, &reverse(&decrement(&reverse(v2))), "rev-dec-rev")?;
            }

            let (ul1, ub1, sl1, sb1) = bytes_to_ints(v1);
            let (ul2, ub2, sl2, sb2) = bytes_to_ints(v2);
            self.check_uint(ul1, ul2)?;
            self.check_uint(ub1, ub2)?;
            self.check_int(sl1, sl2)?;
            self.check_int(sb1, sb2)?;
        }
        self.check(data, &hex_lower(v1), &hex_lower(v2), "hex")?;
        Ok(())
    }

    fn check_uint(&mut self, u1: u64, u2: u64) -> Result<(), RunnerError> {
        if u1 == u2 {
            return Ok(());
        }
        let data = self.data;
        if u1 > 127 || u2 > 127 {
            // Below that the varint encoding is a single byte, which the raw
            // replacement already covered.
            self.check(data, &uvarint(u1), &uvarint(u2), "uvarint")?;
            self.check(
                data,
                &uvarint(u1.wrapping_add(1)),
                &uvarint(u2.wrapping_add(1)),
                "uvarint-inc",
            )?;
            self.check(
                data,
                &uvarint(u1.wrapping_sub(1)),
                &uvarint(u2.wrapping_sub(1)),
                "uvarint-dec",
            )?;
        }
        for base in [2, 8, 10, 16] {
            self.check(data, &format_uint(u1, base), &format_uint(u2, base), "uascii")?;
        }
        Ok(())
    }

    fn check_int(&mut self, s1: i64, s2: i64) -> Result<(), RunnerError> {
        if s1 == s2 {
            return Ok(());
        }
        let data = self.data;
        self.check(data, &varint(s1), &varint(s2), "varint")?;
        self.check(
            data,
            &varint(s1.wrapping_add(1)),
            &varint(s2.wrapping_add(1)),
            "varint-inc",
        )?;
        self.check(
            data,
            &varint(s1.wrapping_sub(1)),
            &varint(s2.wrapping_sub(1)),
            "varint-dec",
        )?;
        for base in [2, 8, 10, 16] {
            self.check(data, &format_int(s1, base), &format_int(s2, base), "ascii")?;
        }
        Ok(())
    }
}

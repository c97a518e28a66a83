//! Byte-range algebra for partial file transfers.
//!
//! A [`RangeSet`] is an ordered sequence of disjoint, non-touching closed
//! intervals over a resource of known size. Sets are built from `Range:`
//! headers, extended one interval at a time while a download progresses, and
//! merged when several sources advertise overlapping availability.

use std::fmt;

use tracing::{debug, warn};

/// A non-empty closed interval of byte offsets, `start <= end`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered; `0-0` is a one-byte range.
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Sentinel for a negative range spec (`-n`) whose length has not been read
/// yet.
const NEGATIVE_PENDING: u64 = u64::MAX;

/// Sorted set of disjoint byte ranges.
///
/// The structural invariant is `r[i].end < r[i + 1].start` for every
/// neighbouring pair: ranges never overlap and are never merged implicitly.
/// Adjacent ranges (`r[i].end + 1 == r[i + 1].start`) are kept separate.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<ByteRange>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ByteRange> {
        self.ranges.iter()
    }

    /// Total number of bytes covered by all ranges.
    pub fn total_size(&self) -> u64 {
        self.ranges.iter().map(ByteRange::size).sum()
    }

    /// Splice `[start, end]` into the set, keeping it sorted.
    ///
    /// Returns `false` and leaves the set unchanged when the new range
    /// overlaps an existing one or is inverted.
    pub fn insert(&mut self, start: u64, end: u64) -> bool {
        if start > end {
            warn!("ignoring inverted range {start}-{end}");
            return false;
        }
        let idx = self
            .ranges
            .iter()
            .position(|r| r.start > end)
            .unwrap_or(self.ranges.len());
        if idx > 0 && self.ranges[idx - 1].end >= start {
            let prev = self.ranges[idx - 1];
            warn!("ignoring range {start}-{end} overlapping {prev}");
            return false;
        }
        self.ranges.insert(idx, ByteRange { start, end });
        true
    }

    /// Whether a single range of the set contains the whole `[from, to]`
    /// interval.
    pub fn contains(&self, from: u64, to: u64) -> bool {
        // Relies on the set being sorted and disjoint.
        for r in &self.ranges {
            if from > r.end {
                continue;
            }
            if from < r.start {
                break;
            }
            return to <= r.end;
        }
        false
    }

    /// Union of two sets.
    ///
    /// Both inputs are walked in lock step under a `highest` watermark:
    /// identical ranges are copied once, ranges wholly below the watermark
    /// are dropped, overlapping ranges combine into `[min start, max end]`.
    /// An emitted range that still overlaps the previous output range folds
    /// into it, so the result upholds the set invariant; adjacent ranges are
    /// kept separate, as everywhere else.
    pub fn merge(&self, other: &RangeSet) -> RangeSet {
        let mut out: Vec<ByteRange> = Vec::new();
        let mut highest: Option<u64> = None;

        let mut emit = |out: &mut Vec<ByteRange>, r: ByteRange| {
            if let Some(last) = out.last_mut() {
                if r.start <= last.end {
                    last.end = last.end.max(r.end);
                    return;
                }
            }
            out.push(r);
        };
        let below = |h: Option<u64>, end: u64| h.is_some_and(|h| end < h);

        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let a = self.ranges[i];
            let b = other.ranges[j];

            if a == b {
                highest = Some(a.end);
                emit(&mut out, a);
                i += 1;
                j += 1;
                continue;
            }
            if below(highest, a.end) {
                i += 1;
                continue;
            }
            if below(highest, b.end) {
                j += 1;
                continue;
            }

            // Non-overlapping: copy whichever comes first.
            if b.end < a.start {
                highest = Some(b.end);
                emit(&mut out, b);
                j += 1;
                continue;
            }
            if a.end < b.start {
                highest = Some(a.end);
                emit(&mut out, a);
                i += 1;
                continue;
            }

            // Overlapping: combine the pair and advance both sides.
            let combined = ByteRange {
                start: a.start.min(b.start),
                end: a.end.max(b.end),
            };
            highest = Some(combined.end);
            emit(&mut out, combined);
            i += 1;
            j += 1;
        }

        // One side is exhausted; copy the other's leftovers when they extend
        // beyond the watermark.
        for &r in self.ranges[i..].iter().chain(other.ranges[j..].iter()) {
            if highest.map_or(true, |h| r.end > h) {
                emit(&mut out, r);
            }
        }

        RangeSet { ranges: out }
    }

    /// Parse a `Range:` header value against a resource of `size` bytes.
    ///
    /// The `bytes=` unit marks a request and allows the negative `-n` form;
    /// plain `bytes ` marks a reply where negative specs are ignored. A
    /// `last-byte-pos` beyond the resource is clamped, never rejected.
    /// Malformed specs are skipped up to the next comma; overlapping specs
    /// are dropped by `insert`. Returns `None` when the unit prefix itself
    /// is unusable.
    pub fn parse(value: &str, size: u64) -> Option<RangeSet> {
        if size == 0 {
            return None;
        }
        let Some(rest) = value.strip_prefix("bytes") else {
            warn!("improper range header (not bytes?): {value}");
            return None;
        };
        let bytes = rest.as_bytes();
        match bytes.first() {
            Some(&c) if c.is_ascii_whitespace() || c == b'=' => {}
            _ => {
                warn!("improper range header: {value}");
                return None;
            }
        }

        // Move to the first spec; a '=' on the way flags the request form.
        let mut request = false;
        let mut i = 0;
        while i < bytes.len() {
            let c = bytes[i];
            if c == b'=' {
                if request {
                    warn!("improper range header (multiple '='): {value}");
                    return None;
                }
                request = true;
                i += 1;
                continue;
            }
            if c.is_ascii_whitespace() {
                i += 1;
                continue;
            }
            break;
        }

        let mut set = RangeSet::new();
        let mut start: u64 = 0;
        let mut end: u64 = size - 1;
        let mut has_start = false;
        let mut has_end = false;
        let mut skipping = false;
        let mut minus_seen = false;

        macro_rules! reset {
            () => {
                start = 0;
                end = size - 1;
                has_start = false;
                has_end = false;
                minus_seen = false;
            };
        }

        while i < bytes.len() {
            let c = bytes[i];
            i += 1;

            if c.is_ascii_whitespace() {
                continue;
            }

            if c == b',' {
                if skipping {
                    // ',' is a resynchronisation point.
                    skipping = false;
                    continue;
                }
                if !minus_seen {
                    debug!("weird range header (no range?): {value}");
                } else if start == NEGATIVE_PENDING && !has_end {
                    debug!("weird range header (incomplete negative range): {value}");
                } else if start > end {
                    debug!("weird range header (swapped range?): {value}");
                } else {
                    set.insert(start, end);
                }
                reset!();
                continue;
            }

            if skipping {
                continue;
            }

            if c == b'-' {
                if minus_seen {
                    debug!("weird range header (spurious '-'): {value}");
                    skipping = true;
                    reset!();
                    continue;
                }
                minus_seen = true;
                if !has_start {
                    if !request {
                        debug!("weird range header (negative range in reply): {value}");
                        skipping = true;
                        reset!();
                        continue;
                    }
                    start = NEGATIVE_PENDING;
                    has_start = true;
                }
                continue;
            }

            if c.is_ascii_digit() {
                let digits_start = i - 1;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let Ok(mut val) = rest[digits_start..i].parse::<u64>() else {
                    debug!("weird range header (unparseable boundary): {value}");
                    skipping = true;
                    reset!();
                    continue;
                };
                if has_end {
                    debug!("weird range header (spurious boundary {val}): {value}");
                    skipping = true;
                    reset!();
                    continue;
                }
                if val >= size {
                    // A last-byte-pos may extend beyond the resource; it is a
                    // response limit, not an exact end specifier.
                    val = size - 1;
                }
                if has_start {
                    if !minus_seen {
                        debug!("weird range header (no '-' before boundary {val}): {value}");
                        skipping = true;
                        reset!();
                        continue;
                    }
                    if start == NEGATIVE_PENDING {
                        start = size - val;
                        end = size - 1;
                    } else {
                        end = val;
                    }
                    has_end = true;
                } else {
                    start = val;
                    has_start = true;
                }
                continue;
            }

            debug!("weird range header (unexpected char {:?}): {value}", c as char);
            skipping = true;
            reset!();
        }

        // Trailing spec, if any.
        if minus_seen {
            if start == NEGATIVE_PENDING && !has_end {
                debug!("weird range header (incomplete trailing negative range): {value}");
            } else if start > end {
                debug!("weird range header (swapped trailing range?): {value}");
            } else {
                set.insert(start, end);
            }
        }

        if set.is_empty() {
            debug!("retained no ranges in header: {value}");
        }
        Some(set)
    }
}

impl fmt::Display for RangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.ranges.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{r}")?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a RangeSet {
    type Item = &'a ByteRange;
    type IntoIter = std::slice::Iter<'a, ByteRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter()
    }
}

/// Parse a `Content-Range:` header value into `(start, end, total)`.
///
/// Accepts the RFC form `bytes start-end/total` and the legacy `bytes=`
/// variant some servers emit. The offsets must satisfy
/// `start <= end < total`.
pub fn parse_content_range(value: &str) -> Option<(u64, u64, u64)> {
    let rest = strip_unit(value)?;
    let b = rest.as_bytes();
    match b.first() {
        Some(&c) if c == b' ' || c == b'=' => {}
        _ => return None,
    }

    let mut i = skip_spaces(b, 1);
    let (start, next) = parse_u64_prefix(rest, i)?;
    i = next;
    if b.get(i) != Some(&b'-') {
        return None;
    }
    i = skip_spaces(b, i + 1);
    let (end, next) = parse_u64_prefix(rest, i)?;
    i = next;
    if b.get(i) != Some(&b'/') {
        return None;
    }
    i = skip_spaces(b, i + 1);
    let (total, _) = parse_u64_prefix(rest, i)?;

    if start > end || end >= total {
        return None;
    }
    Some((start, end, total))
}

fn strip_unit(value: &str) -> Option<&str> {
    const UNIT: &str = "bytes";
    if value.len() >= UNIT.len() && value[..UNIT.len()].eq_ignore_ascii_case(UNIT) {
        Some(&value[UNIT.len()..])
    } else {
        None
    }
}

fn skip_spaces(b: &[u8], mut i: usize) -> usize {
    while i < b.len() && b[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

fn parse_u64_prefix(s: &str, i: usize) -> Option<(u64, usize)> {
    let b = s.as_bytes();
    let mut j = i;
    while j < b.len() && b[j].is_ascii_digit() {
        j += 1;
    }
    if j == i {
        return None;
    }
    s[i..j].parse().ok().map(|v| (v, j))
}

//! # Replication Position Sets
//!
//! Executed-transaction sets used as snapshot watermarks.
//!
//! A [`PositionSet`] groups transaction ids by the source that produced them
//! (the server UUID for MySQL GTIDs) and stores each source's ids as sorted,
//! disjoint, inclusive ranges:
//!
//! ```text
//! 3e11fa47-71ca-11e1-9e33-c80aa9429562:1-5:7-9,
//! 5ac2b0d1-0a2b-11ee-8f1c-0242ac120002:1-42
//! ```
//!
//! The set is an immutable value. `subtract` and `union` return new sets and
//! never mutate either operand, so a captured watermark can be kept next to
//! later captures without sharing state.
//!
//! ## Usage
//!
//! ```rust
//! use watermark_snapshot::common::{Gtid, PositionSet};
//!
//! let low: PositionSet = "src1:1-5".parse().unwrap();
//! let now: PositionSet = "src1:1-7".parse().unwrap();
//!
//! let high = now.subtract(&low);
//! assert_eq!(high.to_string(), "src1:6-7");
//! assert!(high.contains(&Gtid::new("src1", 7)));
//! assert!(!high.contains(&Gtid::new("src1", 5)));
//! ```

use crate::common::{Result, SnapshotError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A single transaction position: `source:transaction_id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gtid {
    /// Originating source (server UUID)
    pub source: String,
    /// Transaction sequence number within the source
    pub transaction_id: u64,
}

impl Gtid {
    /// Create a new position.
    pub fn new(source: impl Into<String>, transaction_id: u64) -> Self {
        Self {
            source: source.into(),
            transaction_id,
        }
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.transaction_id)
    }
}

impl FromStr for Gtid {
    type Err = SnapshotError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (source, txn) = s
            .rsplit_once(':')
            .ok_or_else(|| SnapshotError::invalid_position(format!("missing ':' in '{}'", s)))?;
        if source.is_empty() {
            return Err(SnapshotError::invalid_position(format!(
                "empty source in '{}'",
                s
            )));
        }
        let transaction_id = txn.parse::<u64>().map_err(|e| {
            SnapshotError::invalid_position(format!("bad transaction id in '{}': {}", s, e))
        })?;
        Ok(Self::new(source, transaction_id))
    }
}

impl Serialize for Gtid {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Gtid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Inclusive range of transaction ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Interval {
    start: u64,
    end: u64,
}

impl Interval {
    /// Create an interval; `start` and `end` are swapped if given in reverse.
    pub fn new(start: u64, end: u64) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    /// First transaction id in the range.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Last transaction id in the range.
    pub fn end(&self) -> u64 {
        self.end
    }

    /// Check if the range covers a transaction id.
    pub fn contains(&self, transaction_id: u64) -> bool {
        self.start <= transaction_id && transaction_id <= self.end
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// Transaction ids executed by one source, kept sorted and coalesced.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct SourceSet {
    intervals: Vec<Interval>,
}

impl SourceSet {
    /// Build a normalized set from arbitrary ranges.
    pub fn from_intervals(mut intervals: Vec<Interval>) -> Self {
        intervals.sort();
        let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
        for interval in intervals {
            match merged.last_mut() {
                Some(last) if interval.start <= last.end.saturating_add(1) => {
                    last.end = last.end.max(interval.end);
                }
                _ => merged.push(interval),
            }
        }
        Self { intervals: merged }
    }

    /// Ranges in ascending order.
    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }

    /// Check if no transaction ids remain.
    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    /// Largest transaction id, if any.
    pub fn max_transaction_id(&self) -> Option<u64> {
        self.intervals.last().map(|i| i.end)
    }

    /// Check if a transaction id is covered.
    pub fn contains(&self, transaction_id: u64) -> bool {
        let idx = self.intervals.partition_point(|i| i.end < transaction_id);
        self.intervals
            .get(idx)
            .is_some_and(|i| i.contains(transaction_id))
    }

    /// Ids in this set that are not in `other`.
    pub fn subtract(&self, other: &SourceSet) -> SourceSet {
        let mut result = Vec::new();
        let mut cuts = other.intervals.iter().peekable();

        for interval in &self.intervals {
            let mut start = interval.start;
            let end = interval.end;

            while let Some(cut) = cuts.peek() {
                if cut.end < start {
                    cuts.next();
                    continue;
                }
                break;
            }

            let mut remaining = true;
            for cut in cuts.clone() {
                if cut.start > end {
                    break;
                }
                if cut.start > start {
                    result.push(Interval::new(start, cut.start - 1));
                }
                if cut.end >= end {
                    remaining = false;
                    break;
                }
                start = cut.end + 1;
            }
            if remaining {
                result.push(Interval::new(start, end));
            }
        }

        SourceSet { intervals: result }
    }

    /// Ids in either set.
    pub fn union(&self, other: &SourceSet) -> SourceSet {
        let mut all = self.intervals.clone();
        all.extend_from_slice(&other.intervals);
        SourceSet::from_intervals(all)
    }
}

impl fmt::Display for SourceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, interval) in self.intervals.iter().enumerate() {
            if i > 0 {
                write!(f, ":")?;
            }
            write!(f, "{}", interval)?;
        }
        Ok(())
    }
}

/// Executed transactions grouped by originating source.
///
/// Sources with no remaining ids are never stored, so
/// [`distinct_source_count`](Self::distinct_source_count) and equality only
/// see non-empty sources.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PositionSet {
    sources: BTreeMap<String, SourceSet>,
}

impl PositionSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a set holding a single range for one source.
    pub fn single(source: impl Into<String>, start: u64, end: u64) -> Self {
        let mut sources = BTreeMap::new();
        sources.insert(
            source.into(),
            SourceSet::from_intervals(vec![Interval::new(start, end)]),
        );
        Self { sources }
    }

    fn from_sources(sources: BTreeMap<String, SourceSet>) -> Self {
        Self {
            sources: sources.into_iter().filter(|(_, s)| !s.is_empty()).collect(),
        }
    }

    /// Check if the set holds no transactions.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Number of sources with at least one transaction.
    pub fn distinct_source_count(&self) -> usize {
        self.sources.len()
    }

    /// Source identifiers in ascending order.
    pub fn sources(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    /// Transactions executed by one source.
    pub fn for_source(&self, source: &str) -> Option<&SourceSet> {
        self.sources.get(source)
    }

    /// Largest transaction id recorded for a source.
    pub fn max_transaction_id(&self, source: &str) -> Option<u64> {
        self.for_source(source)
            .and_then(SourceSet::max_transaction_id)
    }

    /// Check if a position is in the set.
    ///
    /// A position whose source is absent is not contained.
    pub fn contains(&self, gtid: &Gtid) -> bool {
        self.for_source(&gtid.source)
            .is_some_and(|s| s.contains(gtid.transaction_id))
    }

    /// Transactions in this set that are not in `other`.
    pub fn subtract(&self, other: &PositionSet) -> PositionSet {
        let sources = self
            .sources
            .iter()
            .map(|(source, ours)| {
                let remaining = match other.sources.get(source) {
                    Some(theirs) => ours.subtract(theirs),
                    None => ours.clone(),
                };
                (source.clone(), remaining)
            })
            .collect();
        Self::from_sources(sources)
    }

    /// Transactions in either set.
    pub fn union(&self, other: &PositionSet) -> PositionSet {
        let mut sources = self.sources.clone();
        for (source, theirs) in &other.sources {
            let merged = match sources.get(source) {
                Some(ours) => ours.union(theirs),
                None => theirs.clone(),
            };
            sources.insert(source.clone(), merged);
        }
        Self::from_sources(sources)
    }

    /// This set plus one transaction.
    pub fn with(&self, gtid: &Gtid) -> PositionSet {
        self.union(&PositionSet::single(
            gtid.source.clone(),
            gtid.transaction_id,
            gtid.transaction_id,
        ))
    }
}

impl fmt::Display for PositionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (source, set)) in self.sources.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}:{}", source, set)?;
        }
        Ok(())
    }
}

impl FromStr for PositionSet {
    type Err = SnapshotError;

    /// Parse `source:1-5:7,other:1-3`. Whitespace and line breaks between
    /// entries are ignored; an empty string is the empty set.
    fn from_str(s: &str) -> Result<Self> {
        let mut grouped: BTreeMap<String, Vec<Interval>> = BTreeMap::new();

        for entry in s.split(',') {
            let entry: String = entry.chars().filter(|c| !c.is_whitespace()).collect();
            if entry.is_empty() {
                continue;
            }
            let mut parts = entry.split(':');
            let source = parts.next().unwrap_or_default();
            if source.is_empty() {
                return Err(SnapshotError::invalid_position(format!(
                    "empty source in '{}'",
                    entry
                )));
            }

            let ranges = grouped.entry(source.to_string()).or_default();
            let mut any = false;
            for range in parts {
                ranges.push(parse_interval(range, &entry)?);
                any = true;
            }
            if !any {
                return Err(SnapshotError::invalid_position(format!(
                    "no transaction ranges in '{}'",
                    entry
                )));
            }
        }

        let sources = grouped
            .into_iter()
            .map(|(source, ranges)| (source, SourceSet::from_intervals(ranges)))
            .collect();
        Ok(Self::from_sources(sources))
    }
}

fn parse_interval(range: &str, entry: &str) -> Result<Interval> {
    let bad = |e: std::num::ParseIntError| {
        SnapshotError::invalid_position(format!("bad range '{}' in '{}': {}", range, entry, e))
    };
    match range.split_once('-') {
        Some((start, end)) => {
            let start = start.parse::<u64>().map_err(bad)?;
            let end = end.parse::<u64>().map_err(bad)?;
            if start > end {
                return Err(SnapshotError::invalid_position(format!(
                    "descending range '{}' in '{}'",
                    range, entry
                )));
            }
            Ok(Interval::new(start, end))
        }
        None => {
            let txn = range.parse::<u64>().map_err(bad)?;
            Ok(Interval::new(txn, txn))
        }
    }
}

impl Serialize for PositionSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PositionSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

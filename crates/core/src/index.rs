//! Hierarchical dataset index.
//!
//! An index is a non-empty list of unsigned segments written as `1`, `1_2`,
//! `0_3_1`. Indexes compare lexicographically segment by segment, and a prefix
//! sorts before any of its extensions (`1 < 1_1 < 1_2 < 2`).
//!
//! A leading `0` segment is reserved for import datasets created during cluster
//! migration. Such an index always carries at least one more segment (`0_1`).

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::IndexError;

/// Separator between segments in the textual form.
pub const SEGMENT_SEPARATOR: char = '_';

/// Leading segment of import datasets.
pub const IMPORT_MARKER: u64 = 0;

/// Ordered position of a dataset in the queue.
///
/// The derived ordering is the queue ordering: `Vec<u64>` compares
/// lexicographically and shorter prefixes sort first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatasetIndex(Vec<u64>);

impl DatasetIndex {
    /// Parse the textual form.
    ///
    /// Rejects empty input, empty segments, non-digit characters, leading zeros
    /// and a bare `0` (an import index without its slot).
    pub fn parse(input: &str) -> Result<Self, IndexError> {
        if input.is_empty() {
            return Err(IndexError::format(input, "empty index"));
        }

        let mut segments = Vec::new();
        for raw in input.split(SEGMENT_SEPARATOR) {
            segments.push(parse_segment(input, raw)?);
        }

        Self::from_segments(segments).map_err(|_| IndexError::format(input, "import index without a slot"))
    }

    /// Build an index from raw segments.
    pub fn from_segments(segments: Vec<u64>) -> Result<Self, IndexError> {
        match segments.as_slice() {
            [] => Err(IndexError::format("", "empty index")),
            [IMPORT_MARKER] => Err(IndexError::format("0", "import index without a slot")),
            _ => Ok(Self(segments)),
        }
    }

    /// Top-level regular index `n` (n >= 1).
    pub fn regular(n: u64) -> Result<Self, IndexError> {
        Self::from_segments(vec![n])
    }

    /// Import index `0_<slot>`.
    pub fn import_slot(slot: u64) -> Self {
        Self(vec![IMPORT_MARKER, slot])
    }

    pub fn segments(&self) -> &[u64] {
        &self.0
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn first(&self) -> u64 {
        self.0[0]
    }

    pub fn last(&self) -> u64 {
        self.0[self.0.len() - 1]
    }

    pub fn is_import(&self) -> bool {
        self.first() == IMPORT_MARKER
    }

    /// Depth of an unsplit dataset of this kind: `1` for regular, `2` for import.
    pub fn base_depth(&self) -> usize {
        if self.is_import() { 2 } else { 1 }
    }

    /// Whether this index was produced by splitting another one.
    pub fn is_split(&self) -> bool {
        self.depth() > self.base_depth()
    }

    /// Whether `self` is a strict prefix of `other`.
    pub fn is_ancestor_of(&self, other: &DatasetIndex) -> bool {
        other.0.len() > self.0.len() && other.0.starts_with(&self.0)
    }

    /// `self` extended by one segment.
    pub fn child(&self, segment: u64) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment);
        Self(segments)
    }

    /// `self` with its last segment incremented, if it does not overflow.
    pub fn next_sibling(&self) -> Option<Self> {
        let mut segments = self.0.clone();
        let last = segments.last_mut()?;
        *last = last.checked_add(1)?;
        Some(Self(segments))
    }
}

fn parse_segment(input: &str, raw: &str) -> Result<u64, IndexError> {
    if raw.is_empty() {
        return Err(IndexError::format(input, "empty segment"));
    }
    if !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(IndexError::format(input, format!("segment '{raw}' is not a number")));
    }
    if raw.len() > 1 && raw.starts_with('0') {
        return Err(IndexError::format(input, format!("segment '{raw}' has a leading zero")));
    }
    raw.parse::<u64>()
        .map_err(|_| IndexError::format(input, format!("segment '{raw}' is out of range")))
}

impl fmt::Display for DatasetIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, segment) in self.0.iter().enumerate() {
            if position > 0 {
                write!(f, "{SEGMENT_SEPARATOR}")?;
            }
            write!(f, "{segment}")?;
        }
        Ok(())
    }
}

impl FromStr for DatasetIndex {
    type Err = IndexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for DatasetIndex {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DatasetIndex {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn idx(s: &str) -> DatasetIndex {
        DatasetIndex::parse(s).unwrap()
    }

    #[test]
    fn parses_and_formats() {
        for s in ["1", "10", "1_2", "0_1", "0_1_0", "123_45_6"] {
            assert_eq!(idx(s).to_string(), s);
        }
        assert_eq!(idx("1_2").segments(), &[1, 2]);
    }

    #[test]
    fn rejects_malformed_text() {
        for s in ["", "_", "1_", "_1", "1__2", "a", "1_!", "1_1_!_1", "01", "1_02", "-1", "1.2", " 1", "0"] {
            assert!(
                matches!(DatasetIndex::parse(s), Err(IndexError::Format { .. })),
                "expected format error for {s:?}"
            );
        }
    }

    #[test]
    fn rejects_segment_overflow() {
        assert!(DatasetIndex::parse("18446744073709551616").is_err());
        assert!(DatasetIndex::parse("18446744073709551615").is_ok());
    }

    #[test]
    fn ordering_places_prefix_first() {
        let mut v = vec![idx("2"), idx("1_2"), idx("1"), idx("0_1"), idx("1_1_5"), idx("1_1"), idx("10")];
        v.sort();
        let rendered: Vec<String> = v.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["0_1", "1", "1_1", "1_1_5", "1_2", "2", "10"]);
    }

    #[test]
    fn classifies_kind_and_depth() {
        assert!(idx("0_3").is_import());
        assert!(!idx("0_3").is_split());
        assert!(idx("0_3_1").is_split());
        assert!(!idx("4").is_split());
        assert!(idx("4_1").is_split());
        assert!(idx("4").is_ancestor_of(&idx("4_0_1")));
        assert!(!idx("4").is_ancestor_of(&idx("4")));
        assert!(!idx("4").is_ancestor_of(&idx("40")));
    }

    #[test]
    fn serde_uses_text_form() {
        let json = serde_json::to_string(&idx("1_2")).unwrap();
        assert_eq!(json, "\"1_2\"");
        let back: DatasetIndex = serde_json::from_str(&json).unwrap();
        assert_eq!(back, idx("1_2"));
        assert!(serde_json::from_str::<DatasetIndex>("\"1__2\"").is_err());
    }

    #[test]
    fn sibling_stops_at_overflow() {
        assert_eq!(idx("1_4").next_sibling(), Some(idx("1_5")));
        assert_eq!(DatasetIndex::from_segments(vec![1, u64::MAX]).unwrap().next_sibling(), None);
    }
}

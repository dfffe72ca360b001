//! Half-open key ranges and operations on sorted sets of them.

use crate::types::Key;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A half-open key range `[start, end)`.
///
/// `start: None` is negative infinity and `end: None` is positive infinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyRange {
    pub start: Option<Key>,
    pub end: Option<Key>,
}

impl KeyRange {
    pub fn new(start: Option<Key>, end: Option<Key>) -> Self {
        Self { start, end }
    }

    /// The whole key domain.
    pub fn full() -> Self {
        Self::new(None, None)
    }

    pub fn bounded(start: Key, end: Key) -> Self {
        Self::new(Some(start), Some(end))
    }

    pub fn at_least(start: Key) -> Self {
        Self::new(Some(start), None)
    }

    pub fn below(end: Key) -> Self {
        Self::new(None, Some(end))
    }

    /// The range holding exactly one key.
    pub fn point(key: Key) -> Self {
        Self::new(Some(key), key.checked_add(1))
    }

    /// Inclusive `[low, high]`, as produced by `BETWEEN`.
    pub fn inclusive(low: Key, high: Key) -> Self {
        Self::new(Some(low), high.checked_add(1))
    }

    /// Start bound widened to `i128`, with negative infinity as `i128::MIN`.
    pub fn lower(&self) -> i128 {
        self.start.map_or(i128::MIN, i128::from)
    }

    /// End bound widened to `i128`, with positive infinity as `i128::MAX`.
    pub fn upper(&self) -> i128 {
        self.end.map_or(i128::MAX, i128::from)
    }

    fn from_bounds(lower: i128, upper: i128) -> Self {
        let start = if lower == i128::MIN {
            None
        } else {
            Some(lower as Key)
        };
        let end = if upper == i128::MAX {
            None
        } else {
            Some(upper as Key)
        };
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.lower() >= self.upper()
    }

    pub fn contains(&self, key: Key) -> bool {
        let key = i128::from(key);
        self.lower() <= key && key < self.upper()
    }

    pub fn overlaps(&self, other: &KeyRange) -> bool {
        self.lower().max(other.lower()) < self.upper().min(other.upper())
    }

    pub fn intersect(&self, other: &KeyRange) -> Option<KeyRange> {
        let range = Self::from_bounds(
            self.lower().max(other.lower()),
            self.upper().min(other.upper()),
        );
        if range.is_empty() {
            None
        } else {
            Some(range)
        }
    }

    /// Whether `other` lies entirely within this range.
    pub fn covers(&self, other: &KeyRange) -> bool {
        self.lower() <= other.lower() && other.upper() <= self.upper()
    }

    /// Whether this range ends exactly where `next` starts.
    pub fn adjacent_to(&self, next: &KeyRange) -> bool {
        match (self.end, next.start) {
            (Some(end), Some(start)) => end == start,
            _ => false,
        }
    }

    /// Split into `[start, at)` and `[at, end)`. `at` must lie strictly inside.
    pub fn split_at(&self, at: Key) -> Option<(KeyRange, KeyRange)> {
        let at_wide = i128::from(at);
        if at_wide <= self.lower() || at_wide >= self.upper() {
            return None;
        }
        Some((
            KeyRange::new(self.start, Some(at)),
            KeyRange::new(Some(at), self.end),
        ))
    }
}

impl fmt::Display for KeyRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.start {
            Some(start) => write!(f, "[{}, ", start)?,
            None => write!(f, "[-inf, ")?,
        }
        match self.end {
            Some(end) => write!(f, "{})", end),
            None => write!(f, "+inf)"),
        }
    }
}

/// Sort, drop empties and coalesce overlapping or touching ranges.
pub fn normalize(mut ranges: Vec<KeyRange>) -> Vec<KeyRange> {
    ranges.retain(|r| !r.is_empty());
    ranges.sort_by_key(|r| r.lower());

    let mut merged: Vec<KeyRange> = Vec::with_capacity(ranges.len());
    for range in ranges {
        match merged.last_mut() {
            Some(last) if range.lower() <= last.upper() => {
                if range.upper() > last.upper() {
                    last.end = range.end;
                }
            }
            _ => merged.push(range),
        }
    }
    merged
}

/// Intersection of two normalized range sets.
pub fn intersect_sets(left: &[KeyRange], right: &[KeyRange]) -> Vec<KeyRange> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < left.len() && j < right.len() {
        if let Some(range) = left[i].intersect(&right[j]) {
            out.push(range);
        }
        if left[i].upper() < right[j].upper() {
            i += 1;
        } else {
            j += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_half_open_containment() {
        let range = KeyRange::bounded(10, 20);
        assert!(range.contains(10));
        assert!(range.contains(19));
        assert!(!range.contains(20));
        assert!(!range.contains(9));
        assert!(KeyRange::full().contains(i64::MIN));
        assert!(KeyRange::full().contains(i64::MAX));
    }

    #[test]
    fn test_point_at_domain_edge() {
        let range = KeyRange::point(i64::MAX);
        assert_eq!(range.end, None);
        assert!(range.contains(i64::MAX));
        assert!(!range.is_empty());
    }

    #[test]
    fn test_intersect() {
        let a = KeyRange::below(20240101);
        let b = KeyRange::inclusive(20230601, 20250601);
        assert_eq!(
            a.intersect(&b),
            Some(KeyRange::bounded(20230601, 20240101))
        );
        assert_eq!(KeyRange::bounded(0, 5).intersect(&KeyRange::bounded(5, 9)), None);
        assert_eq!(KeyRange::full().intersect(&KeyRange::full()), Some(KeyRange::full()));
    }

    #[test]
    fn test_normalize_coalesces() {
        let ranges = vec![
            KeyRange::bounded(10, 20),
            KeyRange::bounded(0, 5),
            KeyRange::bounded(5, 8),
            KeyRange::bounded(15, 30),
            KeyRange::bounded(40, 40),
        ];
        assert_eq!(
            normalize(ranges),
            vec![KeyRange::bounded(0, 8), KeyRange::bounded(10, 30)]
        );
    }

    #[test]
    fn test_intersect_sets() {
        let left = vec![KeyRange::below(5), KeyRange::at_least(6)];
        let right = vec![KeyRange::bounded(0, 10)];
        assert_eq!(
            intersect_sets(&left, &right),
            vec![KeyRange::bounded(0, 5), KeyRange::bounded(6, 10)]
        );
    }

    #[test]
    fn test_split_at() {
        let (left, right) = KeyRange::full().split_at(100).unwrap();
        assert_eq!(left, KeyRange::below(100));
        assert_eq!(right, KeyRange::at_least(100));
        assert!(KeyRange::bounded(0, 10).split_at(0).is_none());
        assert!(KeyRange::bounded(0, 10).split_at(10).is_none());
    }

    #[test]
    fn test_display() {
        assert_eq!(KeyRange::below(3).to_string(), "[-inf, 3)");
        assert_eq!(KeyRange::at_least(3).to_string(), "[3, +inf)");
    }
}

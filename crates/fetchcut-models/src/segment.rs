//! Time-bounded segments and the rules that make an ordered list of them
//! safe to cut and concatenate.
//!
//! Validation is atomic: either every rule holds for every element and a
//! [`SegmentList`] is produced, or the first violation is reported and no
//! list exists. The rules are source-agnostic — the same list is valid (or
//! not) for a remote download and a local file.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A raw segment proposal as it arrives from a caller.
///
/// Bounds are signed so that negative input can be rejected with a
/// specific reason instead of wrapping silently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSpec {
    /// Proposed start offset in whole seconds.
    pub start: Option<i64>,
    /// Proposed end offset in whole seconds.
    pub end: Option<i64>,
}

impl SegmentSpec {
    pub fn new(start: Option<i64>, end: Option<i64>) -> Self {
        Self { start, end }
    }
}

/// A validated time-bounded sub-range of a source.
///
/// An absent `start` means "from 0"; an absent `end` means "to the end of
/// the source". Both absent denotes the entire source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Segment {
    pub start: Option<u64>,
    pub end: Option<u64>,
}

impl Segment {
    /// Effective start offset, defaulting to 0.
    pub fn start_secs(&self) -> u64 {
        self.start.unwrap_or(0)
    }

    /// Cut duration in seconds, when the end bound is known.
    pub fn duration_secs(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start_secs()))
    }

    /// True when neither bound is set (entire source).
    pub fn is_whole_source(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

/// Which bound of a segment a validation error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bound {
    Start,
    End,
}

impl std::fmt::Display for Bound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Bound::Start => write!(f, "start"),
            Bound::End => write!(f, "end"),
        }
    }
}

/// A violated segment rule, with enough context to show the user which
/// element and bound are at fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SegmentError {
    #[error("segment {index}: {bound} must be a non-negative number of seconds (got {value})")]
    NegativeBound { index: usize, bound: Bound, value: i64 },

    #[error("segment {index}: start ({start}s) must be before end ({end}s)")]
    StartNotBeforeEnd { index: usize, start: i64, end: i64 },

    #[error("segment {index}: every segment after the first needs a start time")]
    MissingStart { index: usize },

    #[error("segment {index}: every segment before the last needs an end time")]
    MissingEnd { index: usize },

    #[error(
        "segment {index}: start ({next_start}s) rewinds before the previous segment's end ({prev_end}s)"
    )]
    Rewind {
        index: usize,
        prev_end: u64,
        next_start: u64,
    },
}

/// An ordered, validated list of segments.
///
/// Order is semantically meaningful: it is the concatenation order of the
/// final artifact. An empty list means "no cutting" — acquire and deliver
/// the whole source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentList(Vec<Segment>);

impl SegmentList {
    /// The always-valid empty list ("no cutting").
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    /// Validate an ordered list of proposals.
    ///
    /// All rules are checked; the first violation aborts the whole list.
    /// Calling this twice on the same input yields the same result.
    pub fn validate(specs: &[SegmentSpec]) -> Result<Self, SegmentError> {
        let last = specs.len().saturating_sub(1);
        let mut segments = Vec::with_capacity(specs.len());

        for (index, spec) in specs.iter().enumerate() {
            for (bound, value) in [(Bound::Start, spec.start), (Bound::End, spec.end)] {
                if let Some(v) = value {
                    if v < 0 {
                        return Err(SegmentError::NegativeBound {
                            index,
                            bound,
                            value: v,
                        });
                    }
                }
            }

            if let (Some(start), Some(end)) = (spec.start, spec.end) {
                if start >= end {
                    return Err(SegmentError::StartNotBeforeEnd { index, start, end });
                }
            }

            if index > 0 && spec.start.is_none() {
                return Err(SegmentError::MissingStart { index });
            }
            if index < last && spec.end.is_none() {
                return Err(SegmentError::MissingEnd { index });
            }

            let segment = Segment {
                start: spec.start.map(|v| v as u64),
                end: spec.end.map(|v| v as u64),
            };

            if let Some(prev) = segments.last() {
                let prev: &Segment = prev;
                if let (Some(prev_end), Some(next_start)) = (prev.end, segment.start) {
                    // Gaps are allowed; rewinding is not.
                    if next_start < prev_end {
                        return Err(SegmentError::Rewind {
                            index,
                            prev_end,
                            next_start,
                        });
                    }
                }
            }

            segments.push(segment);
        }

        Ok(Self(segments))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Segment> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Segment] {
        &self.0
    }

    /// Canonical string of the bounds, used as part of a job's dedup key.
    ///
    /// Two lists with identical bounds produce identical keys; the empty
    /// list produces "full".
    pub fn bounds_key(&self) -> String {
        if self.0.is_empty() {
            return "full".to_string();
        }
        self.0
            .iter()
            .map(|s| {
                let start = s.start.map_or_else(|| "_".to_string(), |v| v.to_string());
                let end = s.end.map_or_else(|| "_".to_string(), |v| v.to_string());
                format!("{start}-{end}")
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl<'a> IntoIterator for &'a SegmentList {
    type Item = &'a Segment;
    type IntoIter = std::slice::Iter<'a, Segment>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(start: Option<i64>, end: Option<i64>) -> SegmentSpec {
        SegmentSpec::new(start, end)
    }

    #[test]
    fn empty_list_is_valid_and_means_no_cutting() {
        let list = SegmentList::validate(&[]).unwrap();
        assert!(list.is_empty());
        assert_eq!(list.bounds_key(), "full");
    }

    #[test]
    fn single_open_ended_segment_is_valid() {
        let list = SegmentList::validate(&[spec(None, None)]).unwrap();
        assert_eq!(list.len(), 1);
        assert!(list.as_slice()[0].is_whole_source());
    }

    #[test]
    fn rejects_negative_bounds() {
        let err = SegmentList::validate(&[spec(Some(-5), Some(10))]).unwrap_err();
        assert!(matches!(
            err,
            SegmentError::NegativeBound {
                index: 0,
                bound: Bound::Start,
                value: -5
            }
        ));
    }

    #[test]
    fn rejects_start_not_before_end() {
        let err = SegmentList::validate(&[spec(Some(10), Some(5))]).unwrap_err();
        assert!(matches!(
            err,
            SegmentError::StartNotBeforeEnd {
                index: 0,
                start: 10,
                end: 5
            }
        ));

        // Equal bounds are also rejected
        let err = SegmentList::validate(&[spec(Some(7), Some(7))]).unwrap_err();
        assert!(matches!(err, SegmentError::StartNotBeforeEnd { .. }));
    }

    #[test]
    fn rejects_missing_start_on_non_first_segment() {
        let err =
            SegmentList::validate(&[spec(Some(0), Some(10)), spec(None, Some(20))]).unwrap_err();
        assert!(matches!(err, SegmentError::MissingStart { index: 1 }));
    }

    #[test]
    fn rejects_missing_end_on_non_last_segment() {
        let err =
            SegmentList::validate(&[spec(Some(0), None), spec(Some(20), None)]).unwrap_err();
        assert!(matches!(err, SegmentError::MissingEnd { index: 0 }));
    }

    #[test]
    fn rejects_rewind_across_segments() {
        let err =
            SegmentList::validate(&[spec(None, Some(20)), spec(Some(15), None)]).unwrap_err();
        assert!(matches!(
            err,
            SegmentError::Rewind {
                index: 1,
                prev_end: 20,
                next_start: 15
            }
        ));
    }

    #[test]
    fn gaps_between_segments_are_allowed() {
        let list = SegmentList::validate(&[
            spec(Some(0), Some(10)),
            spec(Some(30), Some(40)),
            spec(Some(40), None),
        ])
        .unwrap();
        assert_eq!(list.len(), 3);

        // Post-validation ordering property: no seam rewinds.
        for pair in list.as_slice().windows(2) {
            if let (Some(end), Some(start)) = (pair[0].end, pair[1].start) {
                assert!(end <= start);
            }
        }
    }

    #[test]
    fn validation_is_deterministic() {
        let specs = [spec(Some(5), Some(10)), spec(Some(10), Some(12))];
        assert_eq!(
            SegmentList::validate(&specs),
            SegmentList::validate(&specs)
        );

        let bad = [spec(Some(10), Some(5))];
        assert_eq!(SegmentList::validate(&bad), SegmentList::validate(&bad));
    }

    #[test]
    fn bounds_key_is_canonical() {
        let list =
            SegmentList::validate(&[spec(None, Some(10)), spec(Some(10), None)]).unwrap();
        assert_eq!(list.bounds_key(), "_-10,10-_");

        let other =
            SegmentList::validate(&[spec(None, Some(10)), spec(Some(10), None)]).unwrap();
        assert_eq!(list.bounds_key(), other.bounds_key());
    }

    #[test]
    fn segment_duration_helpers() {
        let seg = Segment {
            start: Some(10),
            end: Some(25),
        };
        assert_eq!(seg.start_secs(), 10);
        assert_eq!(seg.duration_secs(), Some(15));

        let open = Segment {
            start: None,
            end: Some(30),
        };
        assert_eq!(open.start_secs(), 0);
        assert_eq!(open.duration_secs(), Some(30));
    }
}

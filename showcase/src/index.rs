//! The ordered date -> running mean index.

use crate::extract::Sample;
use data_types::Date;
use std::collections::BTreeMap;

/// Decimal places kept in query results.
const ACCURACY: i32 = 3;

/// Running mean and sample count for one date.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeanState {
    pub mean: f64,
    pub count: u64,
}

/// Outcome of a range scan.
#[derive(Debug, Clone, PartialEq)]
pub enum RangeResult {
    /// At least one date fell inside the range.
    Found(BTreeMap<String, f64>),
    /// The index has data, but none inside the range.
    NotFound,
    /// The index holds no data at all.
    Empty,
}

/// Ordered index of per-date running temperature means.
///
/// Not thread-safe on its own; the service wraps it in a mutex.
#[derive(Debug, Default)]
pub struct MeanIndex {
    entries: BTreeMap<Date, MeanState>,
}

impl MeanIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Fold a new sample into the running mean for `date`.
    ///
    /// Combining `(t, w)` with stored `(mean, n)` yields
    /// `((mean * n + t * w) / (n + w), n + w)`.
    pub fn record(&mut self, date: Date, sample: Sample) {
        self.entries
            .entry(date)
            .and_modify(|state| {
                let combined = state.count + sample.weight;
                state.mean = (state.mean * state.count as f64
                    + sample.temperature * sample.weight as f64)
                    / combined as f64;
                state.count = combined;
            })
            .or_insert(MeanState {
                mean: sample.temperature,
                count: sample.weight,
            });
    }

    /// Scan `[from, to]` inclusive, in calendar order, rounding each mean.
    pub fn range(&self, from: Date, to: Date) -> RangeResult {
        if self.entries.is_empty() {
            return RangeResult::Empty;
        }
        if from > to {
            // an inverted range selects nothing
            return RangeResult::NotFound;
        }
        let found: BTreeMap<String, f64> = self
            .entries
            .range(from..=to)
            .map(|(date, state)| (date.to_string(), round(state.mean)))
            .collect();
        if found.is_empty() {
            RangeResult::NotFound
        } else {
            RangeResult::Found(found)
        }
    }

    #[cfg(test)]
    pub(crate) fn mean(&self, date: Date) -> Option<MeanState> {
        self.entries.get(&date).copied()
    }
}

/// Round to the accuracy handed to clients.
pub fn round(value: f64) -> f64 {
    let factor = 10f64.powi(ACCURACY);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn date(s: &str) -> Date {
        Date::parse_canonical(s).unwrap()
    }

    fn sample(temperature: f64, weight: u64) -> Sample {
        Sample {
            temperature,
            weight,
        }
    }

    #[test]
    fn running_mean_is_weighted() {
        let mut index = MeanIndex::new();
        let d = date("01-01-2000");

        index.record(d, sample(5.0, 1));
        index.record(d, sample(15.0, 1));
        assert_eq!(index.mean(d).unwrap(), MeanState { mean: 10.0, count: 2 });

        // a three-station european sample weighs three measurements
        index.record(d, sample(20.0, 3));
        let state = index.mean(d).unwrap();
        assert_eq!(state.count, 5);
        assert!((state.mean - 16.0).abs() < 1e-9);
    }

    #[test]
    fn range_selects_by_calendar_date_not_string_order() {
        let mut index = MeanIndex::new();
        index.record(date("02-01-2000"), sample(2.0, 1)); // Jan 2nd
        index.record(date("01-02-2000"), sample(3.0, 1)); // Feb 1st
        index.record(date("01-01-2001"), sample(4.0, 1));

        // string comparison would include Jan 2nd and exclude Feb 1st here
        let result = index.range(date("15-01-2000"), date("15-02-2000"));
        let found = match result {
            RangeResult::Found(found) => found,
            other => panic!("expected Found, got {other:?}"),
        };
        assert_eq!(found.len(), 1);
        assert_eq!(found["01-02-2000"], 3.0);
    }

    #[test]
    fn range_bounds_are_inclusive() {
        let mut index = MeanIndex::new();
        index.record(date("01-01-2000"), sample(1.0, 1));
        index.record(date("05-01-2000"), sample(5.0, 1));

        let result = index.range(date("01-01-2000"), date("05-01-2000"));
        let found = match result {
            RangeResult::Found(found) => found,
            other => panic!("expected Found, got {other:?}"),
        };
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn empty_and_not_found_are_distinct() {
        let mut index = MeanIndex::new();
        assert_eq!(
            index.range(date("01-01-2000"), date("31-12-2000")),
            RangeResult::Empty
        );

        index.record(date("01-01-2001"), sample(1.0, 1));
        assert_eq!(
            index.range(date("01-01-2000"), date("31-12-2000")),
            RangeResult::NotFound
        );
    }

    #[test]
    fn inverted_range_finds_nothing() {
        let mut index = MeanIndex::new();
        index.record(date("01-01-2000"), sample(1.0, 1));
        assert_eq!(
            index.range(date("31-12-2000"), date("01-01-2000")),
            RangeResult::NotFound
        );
    }

    #[test]
    fn means_are_rounded_to_three_decimals() {
        let mut index = MeanIndex::new();
        let d = date("01-01-2000");
        index.record(d, sample(1.0, 1));
        index.record(d, sample(2.0, 1));
        index.record(d, sample(2.0, 1));

        let result = index.range(d, d);
        let found = match result {
            RangeResult::Found(found) => found,
            other => panic!("expected Found, got {other:?}"),
        };
        assert_eq!(found["01-01-2000"], 1.667);
    }
}

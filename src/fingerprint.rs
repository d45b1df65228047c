/// Fingerprint - Structural Identity of a Pivot Configuration
///
/// Queries resolve out of order and there is no cancellation, so every piece
/// of structural state the engine keeps across evaluations (the committed row
/// skeleton, the expansion cache, the last assembled table) is tagged with
/// the fingerprint of the configuration it was built for. A consumer only
/// merges state whose tag matches the active fingerprint.
///
/// # What is structural
///
/// Dimensions (with grains), measures, the filter, the time range, the
/// comparison range and the sort. Page number and the expansion set are not:
/// paging appends to the same skeleton and expanding reuses the same cache.

use crate::config::{PivotConfig, PivotDimension, PivotMeasure, SortSpec};
use crate::expr::Expr;
use crate::timegrain::TimeRange;
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

#[derive(Serialize)]
struct Structure<'a> {
    measures: &'a [PivotMeasure],
    rows: &'a [PivotDimension],
    columns: &'a [PivotDimension],
    #[serde(rename = "where")]
    where_filter: &'a Option<Expr>,
    time_range: &'a Option<TimeRange>,
    comparison: &'a Option<TimeRange>,
    sort: &'a Option<SortSpec>,
}

impl Fingerprint {
    pub fn of(config: &PivotConfig) -> Self {
        let structure = Structure {
            measures: &config.measures,
            rows: &config.row_dimensions,
            columns: &config.col_dimensions,
            where_filter: &config.where_filter,
            time_range: &config.time_range,
            comparison: &config.comparison_time,
            sort: &config.sorting,
        };
        Fingerprint(serde_json::to_string(&structure).unwrap_or_else(|_| format!("{:?}", config)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A value built for one configuration fingerprint.
#[derive(Debug, Clone)]
pub struct Tagged<T> {
    pub fingerprint: Fingerprint,
    pub value: T,
}

impl<T> Tagged<T> {
    pub fn new(fingerprint: Fingerprint, value: T) -> Self {
        Tagged { fingerprint, value }
    }

    /// The value, if it was built for `fingerprint`.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&T> {
        if &self.fingerprint == fingerprint {
            Some(&self.value)
        } else {
            None
        }
    }

    pub fn get_mut(&mut self, fingerprint: &Fingerprint) -> Option<&mut T> {
        if &self.fingerprint == fingerprint {
            Some(&mut self.value)
        } else {
            None
        }
    }

    pub fn matches(&self, fingerprint: &Fingerprint) -> bool {
        &self.fingerprint == fingerprint
    }
}

/// Tracks the active fingerprint and counts structural changes.
#[derive(Debug, Clone, Default)]
pub struct FingerprintTracker {
    current: Option<Fingerprint>,
    /// Incremented each time the active fingerprint changes
    generation: u64,
}

impl FingerprintTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `fingerprint` active. Returns true if it differs from the
    /// previous one (always true for the first observation).
    pub fn observe(&mut self, fingerprint: &Fingerprint) -> bool {
        if self.current.as_ref() == Some(fingerprint) {
            return false;
        }
        self.current = Some(fingerprint.clone());
        self.generation += 1;
        true
    }

    pub fn current(&self) -> Option<&Fingerprint> {
        self.current.as_ref()
    }

    /// Returns the current generation number
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn clear(&mut self) {
        self.current = None;
        self.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PivotConfig {
        PivotConfig::new(
            vec![PivotMeasure {
                name: "revenue".into(),
                label: "Revenue".into(),
                is_percentage: false,
                percent_of_total: false,
            }],
            vec![PivotDimension::plain("country")],
            vec![],
        )
    }

    #[test]
    fn test_page_and_expansion_do_not_change_fingerprint() {
        let base = config();
        let mut paged = base.clone();
        paged.row_page = 3;
        paged.expanded.insert(vec!["DE".to_string()]);
        assert_eq!(Fingerprint::of(&base), Fingerprint::of(&paged));
    }

    #[test]
    fn test_filter_and_sort_change_fingerprint() {
        let base = config();
        let mut filtered = base.clone();
        filtered.where_filter = Some(Expr::eq("channel", "web"));
        assert_ne!(Fingerprint::of(&base), Fingerprint::of(&filtered));

        let mut sorted = base.clone();
        sorted.sorting = Some(SortSpec { id: "revenue".into(), desc: true });
        assert_ne!(Fingerprint::of(&base), Fingerprint::of(&sorted));
    }

    #[test]
    fn test_tracker_generation() {
        let a = Fingerprint::of(&config());
        let mut other = config();
        other.row_dimensions.push(PivotDimension::plain("city"));
        let b = Fingerprint::of(&other);

        let mut tracker = FingerprintTracker::new();
        assert!(tracker.observe(&a));
        assert!(!tracker.observe(&a));
        assert!(tracker.observe(&b));
        assert_eq!(tracker.generation(), 2);
        assert_eq!(tracker.current(), Some(&b));
    }

    #[test]
    fn test_tagged_access() {
        let a = Fingerprint::of(&config());
        let mut tagged = Tagged::new(a.clone(), vec![1, 2]);
        assert_eq!(tagged.get(&a), Some(&vec![1, 2]));
        if let Some(v) = tagged.get_mut(&a) {
            v.push(3);
        }
        assert_eq!(tagged.value.len(), 3);

        let mut other = config();
        other.measures.clear();
        assert!(tagged.get(&Fingerprint::of(&other)).is_none());
    }
}

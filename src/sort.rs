/// Row Sort Resolution
///
/// The active sort spec names a column of the rendered table: the row header
/// (the anchor dimension), a row-total measure column, or a cell column
/// `c{i}v{j}[_c{i}v{j}...]m{k}` that restricts measure `k` of `measure_names`
/// to one value `j` of each column dimension `i`. This module turns that id
/// into a [`SortTarget`] and implements the client side of the sort-accessor
/// protocol: reconciling a page against the accessor result, and merging pages
/// in order.

use crate::assemble::{comparison_delta, comparison_percent};
use crate::axes::{default_sort, AxisData};
use crate::config::{MeasureKind, PivotConfig};
use crate::service::{AggregationRow, MeasureRef, SortRef, COMPARISON_VALUE_SUFFIX};
use crate::value::PivotValue;
use log::warn;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

/// What a measure sort orders rows by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortValue {
    /// The measure itself. Percent of total orders the same way.
    Base,
    ComparisonDelta,
    ComparisonPercent,
}

impl SortValue {
    fn of(kind: &MeasureKind<'_>) -> Self {
        match kind {
            MeasureKind::ComparisonDelta(_) => SortValue::ComparisonDelta,
            MeasureKind::ComparisonPercent(_) => SortValue::ComparisonPercent,
            MeasureKind::Base(_) | MeasureKind::PercentOfTotal(_) => SortValue::Base,
        }
    }

    /// Measures the accessor query has to return for `measure`.
    pub fn request_measures(self, measure: &str) -> Vec<MeasureRef> {
        match self {
            SortValue::Base => vec![MeasureRef::base(measure)],
            SortValue::ComparisonDelta | SortValue::ComparisonPercent => {
                vec![MeasureRef::base(measure), MeasureRef::comparison(measure)]
            }
        }
    }

    /// Sort key of one accessor row.
    pub fn key(self, row: &AggregationRow, measure: &str) -> Option<PivotValue> {
        let value = row.get(measure)?;
        let prev = || row.get(&format!("{}{}", measure, COMPARISON_VALUE_SUFFIX));
        match self {
            SortValue::Base => Some(value.clone()),
            SortValue::ComparisonDelta => Some(comparison_delta(value, prev())),
            SortValue::ComparisonPercent => Some(comparison_percent(value, prev())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SortTarget {
    /// No sort spec: the anchor's default order.
    Default,
    Dimension { desc: bool },
    /// A base measure, optionally restricted to one column-value path.
    Measure {
        measure: String,
        value: SortValue,
        /// (column dimension index, value) pairs.
        column_path: Vec<(usize, PivotValue)>,
        desc: bool,
    },
}

impl SortTarget {
    pub fn is_measure(&self) -> bool {
        matches!(self, SortTarget::Measure { .. })
    }
}

/// Id of a column combination, e.g. `c0v2_c1v0`.
pub fn combo_id(path: &[(usize, usize)]) -> String {
    path.iter()
        .map(|(i, j)| format!("c{}v{}", i, j))
        .collect::<Vec<_>>()
        .join("_")
}

/// Id of the cell column for measure `k` under a column combination.
pub fn cell_accessor(combo_id: &str, measure_index: usize) -> String {
    format!("{}m{}", combo_id, measure_index)
}

/// Split a cell column id into its (dimension, value) index path and the
/// measure index. Returns `None` for anything that is not a cell column id.
pub fn parse_cell_accessor(id: &str) -> Option<(Vec<(usize, usize)>, usize)> {
    let split = id.rfind('m')?;
    let measure_index: usize = id[split + 1..].parse().ok()?;
    let mut path = Vec::new();
    for part in id[..split].split('_') {
        let rest = part.strip_prefix('c')?;
        let (dim, value) = rest.split_once('v')?;
        path.push((dim.parse().ok()?, value.parse().ok()?));
    }
    if path.is_empty() {
        return None;
    }
    Some((path, measure_index))
}

/// Resolve the configured sort spec against the current column axes.
/// Comparison columns sort by their computed value. Unknown ids fall back to
/// the default order.
pub fn resolve_sort_target(config: &PivotConfig, columns: &AxisData) -> SortTarget {
    let spec = match &config.sorting {
        Some(spec) => spec,
        None => return SortTarget::Default,
    };

    if config.anchor().map(|a| a.name == spec.id).unwrap_or(false) {
        return SortTarget::Dimension { desc: spec.desc };
    }

    if let Some(kind) = config.measure_kind(&spec.id) {
        return SortTarget::Measure {
            measure: kind.base().name.clone(),
            value: SortValue::of(&kind),
            column_path: Vec::new(),
            desc: spec.desc,
        };
    }

    if let Some((path, k)) = parse_cell_accessor(&spec.id) {
        let measure = config
            .measure_names
            .get(k)
            .and_then(|name| config.measure_kind(name))
            .map(|kind| (kind.base().name.clone(), SortValue::of(&kind)));
        let column_path: Option<Vec<(usize, PivotValue)>> = path
            .iter()
            .map(|&(i, j)| {
                let dim = config.col_dimensions.get(i)?;
                let value = columns.values_for(&dim.name).get(j)?;
                Some((i, value.clone()))
            })
            .collect();
        if let (Some((measure, value)), Some(column_path)) = (measure, column_path) {
            return SortTarget::Measure {
                measure,
                value,
                column_path,
                desc: spec.desc,
            };
        }
    }

    warn!("ignoring sort on unknown column '{}'", spec.id);
    SortTarget::Default
}

/// Sort keys of the anchor page query.
pub fn row_sort(config: &PivotConfig, target: &SortTarget) -> Vec<SortRef> {
    let anchor = match config.anchor() {
        Some(anchor) => anchor,
        None => return Vec::new(),
    };
    match target {
        SortTarget::Default => default_sort(anchor, config),
        SortTarget::Dimension { desc } => vec![SortRef { name: anchor.name.clone(), desc: *desc }],
        SortTarget::Measure { measure, desc, .. } => vec![SortRef { name: measure.clone(), desc: *desc }],
    }
}

/// Nulls, sentinels and missing values go last in both directions.
fn compare_sort_values(a: Option<&PivotValue>, b: Option<&PivotValue>, desc: bool) -> Ordering {
    let a = a.filter(|v| !v.is_null() && !v.is_sentinel());
    let b = b.filter(|v| !v.is_null() && !v.is_sentinel());
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) if desc => b.compare(a),
        (Some(a), Some(b)) => a.compare(b),
    }
}

/// Order the rows of a page by the sort accessor's values.
///
/// The sort is stable: rows with equal values keep their page order. Rows
/// the accessor did not return keep page order after all the others.
pub fn reconcile_with_accessor(
    anchor: &str,
    page: Vec<AggregationRow>,
    accessor: &[AggregationRow],
    measure: &str,
    value: SortValue,
    desc: bool,
) -> Vec<AggregationRow> {
    let values: HashMap<String, PivotValue> = accessor
        .iter()
        .filter_map(|row| {
            let key = row.get(anchor)?.key();
            Some((key, value.key(row, measure)?))
        })
        .collect();

    let mut keyed: Vec<(Option<&PivotValue>, AggregationRow)> = page
        .into_iter()
        .map(|row| {
            let key = row.get(anchor).and_then(|v| values.get(&v.key()));
            (key, row)
        })
        .collect();
    keyed.sort_by(|(a, _), (b, _)| compare_sort_values(*a, *b, desc));
    keyed.into_iter().map(|(_, row)| row).collect()
}

/// Append a newly resolved page to the committed rows.
///
/// Committed rows never move; rows of the page whose anchor value is already
/// committed are dropped. Returns the number of rows added.
pub fn merge_row_totals_in_order(
    committed: &mut Vec<AggregationRow>,
    anchor: &str,
    page: Vec<AggregationRow>,
) -> usize {
    let mut seen: HashSet<String> = committed
        .iter()
        .filter_map(|row| row.get(anchor).map(PivotValue::key))
        .collect();
    let before = committed.len();
    for row in page {
        let key = row.get(anchor).map(PivotValue::key).unwrap_or_default();
        if seen.insert(key) {
            committed.push(row);
        }
    }
    committed.len() - before
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PivotDimension, PivotMeasure, SortSpec};
    use crate::timegrain::{TimeGrain, TimeRange};

    fn row(anchor: &str, value: Option<i64>) -> AggregationRow {
        let mut row = AggregationRow::new();
        row.insert("country".into(), anchor.into());
        if let Some(v) = value {
            row.insert("revenue".into(), PivotValue::Int64(v));
        }
        row
    }

    fn anchors(rows: &[AggregationRow]) -> Vec<String> {
        rows.iter().map(|r| r["country"].key()).collect()
    }

    fn config() -> PivotConfig {
        PivotConfig::new(
            vec![PivotMeasure {
                name: "revenue".into(),
                label: "Revenue".into(),
                is_percentage: false,
                percent_of_total: false,
            }],
            vec![PivotDimension::plain("country")],
            vec![PivotDimension::plain("channel"), PivotDimension::time_bucket("ts", TimeGrain::Month)],
        )
        .with_comparison(TimeRange::new("2023-01-01", "2024-01-01"))
    }

    fn axes() -> AxisData {
        let mut axes = AxisData::default();
        axes.values.insert("channel".into(), vec!["web".into(), "store".into()]);
        axes.values.insert("ts__month".into(), vec!["2024-01-01".into(), "2024-02-01".into()]);
        axes
    }

    #[test]
    fn test_parse_cell_accessor() {
        assert_eq!(parse_cell_accessor("c0v1m0"), Some((vec![(0, 1)], 0)));
        assert_eq!(parse_cell_accessor("c0v1_c1v12m3"), Some((vec![(0, 1), (1, 12)], 3)));
        assert_eq!(parse_cell_accessor("revenue"), None);
        assert_eq!(parse_cell_accessor("m0"), None);
        assert_eq!(cell_accessor(&combo_id(&[(0, 1), (1, 12)]), 3), "c0v1_c1v12m3");
    }

    #[test]
    fn test_resolve_targets() {
        let mut config = config();
        assert_eq!(resolve_sort_target(&config, &axes()), SortTarget::Default);

        config.sorting = Some(SortSpec { id: "country".into(), desc: true });
        assert_eq!(resolve_sort_target(&config, &axes()), SortTarget::Dimension { desc: true });

        config.sorting = Some(SortSpec { id: "revenue_pct".into(), desc: false });
        assert_eq!(
            resolve_sort_target(&config, &axes()),
            SortTarget::Measure {
                measure: "revenue".into(),
                value: SortValue::ComparisonPercent,
                column_path: vec![],
                desc: false,
            }
        );

        // measure_names = [revenue, revenue_delta, revenue_pct]; k = 1 is the delta.
        config.sorting = Some(SortSpec { id: "c0v1_c1v0m1".into(), desc: true });
        assert_eq!(
            resolve_sort_target(&config, &axes()),
            SortTarget::Measure {
                measure: "revenue".into(),
                value: SortValue::ComparisonDelta,
                column_path: vec![(0, "store".into()), (1, "2024-01-01".into())],
                desc: true,
            }
        );

        config.sorting = Some(SortSpec { id: "c0v9m0".into(), desc: true });
        assert_eq!(resolve_sort_target(&config, &axes()), SortTarget::Default);
    }

    #[test]
    fn test_reconcile_descending_is_stable() {
        let page = vec![row("a", None), row("b", None), row("c", None), row("d", None), row("e", None)];
        let accessor = vec![row("c", Some(30)), row("a", Some(10)), row("d", Some(30)), row("b", Some(20))];

        let sorted = reconcile_with_accessor("country", page, &accessor, "revenue", SortValue::Base, true);
        // c and d tie and keep page order; e is missing and goes last.
        assert_eq!(anchors(&sorted), vec!["c", "d", "b", "a", "e"]);
    }

    #[test]
    fn test_reconcile_ascending_nulls_last() {
        let page = vec![row("a", None), row("b", None), row("c", None)];
        let mut null_row = row("a", None);
        null_row.insert("revenue".into(), PivotValue::Null);
        let accessor = vec![null_row, row("b", Some(5)), row("c", Some(1))];

        let sorted = reconcile_with_accessor("country", page, &accessor, "revenue", SortValue::Base, false);
        assert_eq!(anchors(&sorted), vec!["c", "b", "a"]);
    }

    #[test]
    fn test_reconcile_by_comparison_delta() {
        let with_prev = |anchor: &str, value: i64, prev: Option<i64>| {
            let mut row = row(anchor, Some(value));
            if let Some(prev) = prev {
                row.insert("revenue_prev".into(), PivotValue::Int64(prev));
            }
            row
        };
        let page = vec![row("a", None), row("b", None), row("c", None), row("d", None)];
        // Deltas: a +5, b missing prior, c -10, d +50.
        let accessor = vec![
            with_prev("a", 15, Some(10)),
            with_prev("b", 100, None),
            with_prev("c", 0, Some(10)),
            with_prev("d", 60, Some(10)),
        ];

        let sorted = reconcile_with_accessor("country", page.clone(), &accessor, "revenue", SortValue::ComparisonDelta, false);
        assert_eq!(anchors(&sorted), vec!["c", "a", "d", "b"]);

        let sorted = reconcile_with_accessor("country", page, &accessor, "revenue", SortValue::ComparisonDelta, true);
        assert_eq!(anchors(&sorted), vec!["d", "a", "c", "b"]);
    }

    #[test]
    fn test_comparison_sort_requests_prior_values() {
        assert_eq!(SortValue::Base.request_measures("revenue"), vec![MeasureRef::base("revenue")]);
        assert_eq!(
            SortValue::ComparisonPercent.request_measures("revenue"),
            vec![MeasureRef::base("revenue"), MeasureRef::comparison("revenue")]
        );
    }

    #[test]
    fn test_merge_keeps_committed_order() {
        let mut committed = vec![row("b", Some(2)), row("a", Some(1))];
        let added = merge_row_totals_in_order(
            &mut committed,
            "country",
            vec![row("a", Some(1)), row("d", Some(4)), row("c", Some(3))],
        );
        assert_eq!(added, 2);
        assert_eq!(anchors(&committed), vec!["b", "a", "d", "c"]);
        assert_eq!(merge_row_totals_in_order(&mut committed, "country", vec![]), 0);
    }

    #[test]
    fn test_row_sort() {
        let config = config();
        assert_eq!(row_sort(&config, &SortTarget::Default), vec![SortRef::desc("revenue")]);
        assert_eq!(row_sort(&config, &SortTarget::Dimension { desc: false }), vec![SortRef::asc("country")]);
    }
}

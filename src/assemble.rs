/// Table Assembly
///
/// Merges the row skeleton, the column combinations and the cell matrix into
/// rows keyed by column id:
///
/// - the row header under the anchor dimension's name (nested rows store
///   their own dimension value there too),
/// - row totals under each entry of `measure_names`,
/// - cell values under `c{i}v{j}..m{k}`.
///
/// Missing cells are `Null`. Comparison and percent-of-total columns are
/// derived here; division by a zero or missing denominator yields a
/// [`Sentinel`] instead of a number.

use crate::axes::RowAxis;
use crate::cells::CellMatrix;
use crate::column_def::ColumnCombo;
use crate::config::{MeasureKind, PivotConfig, PivotDimension};
use crate::service::{AggregationRow, COMPARISON_VALUE_SUFFIX};
use crate::totals::Totals;
use crate::value::{PivotValue, Sentinel};
use serde::Serialize;
use std::collections::BTreeMap;

/// Label of the row header in the totals row.
pub const TOTALS_ROW_LABEL: &str = "Total";

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PivotDataRow {
    #[serde(flatten)]
    pub values: BTreeMap<String, PivotValue>,
    /// `Some(vec![])` marks a row that can be expanded but is not.
    #[serde(rename = "subRows", skip_serializing_if = "Option::is_none")]
    pub sub_rows: Option<Vec<PivotDataRow>>,
}

impl PivotDataRow {
    pub fn get(&self, column: &str) -> Option<&PivotValue> {
        self.values.get(column)
    }

    pub fn is_expandable(&self) -> bool {
        self.sub_rows.is_some()
    }
}

/// `value - prev`. Integers stay integers.
pub fn comparison_delta(value: &PivotValue, prev: Option<&PivotValue>) -> PivotValue {
    let prev = match prev.filter(|p| !p.is_null()) {
        Some(prev) => prev,
        None if value.as_f64().is_some() => return Sentinel::PriorValueMissing.into(),
        None => return PivotValue::Null,
    };
    match (value, prev) {
        (PivotValue::Int64(a), PivotValue::Int64(b)) => match a.checked_sub(*b) {
            Some(delta) => PivotValue::Int64(delta),
            None => PivotValue::Float64(*a as f64 - *b as f64),
        },
        _ => match (value.as_f64(), prev.as_f64()) {
            (Some(a), Some(b)) => PivotValue::Float64(a - b),
            _ => PivotValue::Null,
        },
    }
}

/// `(value - prev) / prev`, or a sentinel when `prev` is zero or missing.
pub fn comparison_percent(value: &PivotValue, prev: Option<&PivotValue>) -> PivotValue {
    let current = match value.as_f64() {
        Some(current) => current,
        None => return PivotValue::Null,
    };
    match prev.and_then(PivotValue::as_f64) {
        None => Sentinel::PriorValueMissing.into(),
        Some(p) if p == 0.0 => Sentinel::PriorValueZero.into(),
        Some(p) => PivotValue::Float64((current - p) / p),
    }
}

/// `value / total`, or a sentinel when the total is zero or missing.
pub fn percent_of_total(value: &PivotValue, total: Option<&PivotValue>) -> PivotValue {
    let current = match value.as_f64() {
        Some(current) => current,
        None => return PivotValue::Null,
    };
    match total.and_then(PivotValue::as_f64) {
        None => Sentinel::TotalMissing.into(),
        Some(t) if t == 0.0 => Sentinel::TotalZero.into(),
        Some(t) => PivotValue::Float64(current / t),
    }
}

/// Value of one entry of `measure_names` from an aggregation row.
fn measure_value(config: &PivotConfig, name: &str, row: Option<&AggregationRow>, global: &AggregationRow) -> PivotValue {
    let kind = match config.measure_kind(name) {
        Some(kind) => kind,
        None => return PivotValue::Null,
    };
    let base = &kind.base().name;
    let value = row.and_then(|r| r.get(base)).cloned().unwrap_or_default();
    let prev = || row.and_then(|r| r.get(&format!("{}{}", base, COMPARISON_VALUE_SUFFIX)));
    match kind {
        MeasureKind::Base(_) => value,
        MeasureKind::ComparisonDelta(_) => comparison_delta(&value, prev()),
        MeasureKind::ComparisonPercent(_) => comparison_percent(&value, prev()),
        MeasureKind::PercentOfTotal(_) => percent_of_total(&value, global.get(base)),
    }
}

/// Shared inputs of every row built for one render.
pub struct RowBuilder<'a> {
    pub config: &'a PivotConfig,
    pub combos: &'a [ColumnCombo],
    pub global: &'a AggregationRow,
}

impl<'a> RowBuilder<'a> {
    pub fn new(config: &'a PivotConfig, combos: &'a [ColumnCombo], global: &'a AggregationRow) -> Self {
        RowBuilder { config, combos, global }
    }

    /// One row at `depth` (0 for anchor rows) from its totals row and the
    /// cells keyed by `header`.
    pub fn build(
        &self,
        header: Option<&PivotValue>,
        totals: Option<&AggregationRow>,
        cells: &CellMatrix,
        depth: usize,
    ) -> PivotDataRow {
        let mut row = PivotDataRow::default();
        if let (Some(anchor), Some(header)) = (self.config.anchor(), header) {
            row.values.insert(anchor.name.clone(), header.clone());
        }
        for name in &self.config.measure_names {
            row.values
                .insert(name.clone(), measure_value(self.config, name, totals, self.global));
        }
        for combo in self.combos {
            let cell = cells.get(header, &combo.values);
            for (k, name) in self.config.measure_names.iter().enumerate() {
                row.values
                    .insert(combo.cell_id(k), measure_value(self.config, name, cell, self.global));
            }
        }
        if depth + 1 < self.config.row_dimensions.len() {
            row.sub_rows = Some(Vec::new());
        }
        row
    }

    /// Rows for the values of `dimension` at `depth`, in the order of
    /// `totals`.
    pub fn build_level(
        &self,
        dimension: &PivotDimension,
        totals: &[AggregationRow],
        cells: &CellMatrix,
        depth: usize,
    ) -> Vec<PivotDataRow> {
        totals
            .iter()
            .map(|t| {
                let header = t.get(&dimension.name).cloned().unwrap_or_default();
                self.build(Some(&header), Some(t), cells, depth)
            })
            .collect()
    }
}

/// Top-level rows of the table.
///
/// With row dimensions, one row per anchor value of the window. Without, a
/// single row holding the grand totals and the cells.
pub fn assemble_rows(
    config: &PivotConfig,
    combos: &[ColumnCombo],
    rows: &RowAxis,
    cells: &CellMatrix,
    totals: &Totals,
) -> Vec<PivotDataRow> {
    let builder = RowBuilder::new(config, combos, &totals.global);
    match config.anchor() {
        Some(anchor) => builder.build_level(anchor, &rows.rows, cells, 0),
        None => vec![builder.build(None, Some(&totals.global), cells, 0)],
    }
}

/// The totals row: grand totals under the measure columns, per-combination
/// totals under the cell columns.
pub fn totals_row(config: &PivotConfig, combos: &[ColumnCombo], totals: &Totals) -> PivotDataRow {
    let column_dims: Vec<&str> = config.col_dimensions.iter().map(|d| d.name.as_str()).collect();
    let by_column = CellMatrix::index(&totals.by_column, &column_dims);
    let builder = RowBuilder::new(config, combos, &totals.global);
    let mut row = builder.build(None, Some(&totals.global), &by_column, config.row_dimensions.len());
    if let Some(anchor) = config.anchor() {
        row.values.insert(anchor.name.clone(), TOTALS_ROW_LABEL.into());
    }
    row
}

/// Same shape as the totals row, every value `Null`.
pub fn skeleton_totals_row(config: &PivotConfig, combos: &[ColumnCombo]) -> PivotDataRow {
    let mut row = PivotDataRow::default();
    if let Some(anchor) = config.anchor() {
        row.values.insert(anchor.name.clone(), TOTALS_ROW_LABEL.into());
    }
    for name in &config.measure_names {
        row.values.insert(name.clone(), PivotValue::Null);
    }
    for combo in combos {
        for k in 0..config.measure_names.len() {
            row.values.insert(combo.cell_id(k), PivotValue::Null);
        }
    }
    row
}

/// Anchor rows with row totals but no cell values, shown while cells load.
pub fn skeleton_rows(config: &PivotConfig, combos: &[ColumnCombo], rows: &RowAxis) -> Vec<PivotDataRow> {
    let empty_global = AggregationRow::new();
    let builder = RowBuilder::new(config, combos, &empty_global);
    match config.anchor() {
        Some(anchor) => builder.build_level(anchor, &rows.rows, &CellMatrix::default(), 0),
        None => Vec::new(),
    }
}

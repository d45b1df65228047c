/// Column Definitions
///
/// The rendered column tree is: the row header (when there are row
/// dimensions), one column per entry of `measure_names` holding the row
/// totals, then one header group per value of the first column dimension,
/// nested per value of each following column dimension, down to one leaf per
/// measure name. Synthetic measure columns already sit right after their base
/// measure in `measure_names`, so leaves follow that order.

use crate::axes::AxisData;
use crate::config::{MeasureKind, PivotConfig};
use crate::service::AggregationRow;
use crate::sort::{cell_accessor, combo_id};
use crate::value::PivotValue;
use serde::Serialize;
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    RowHeader,
    Group,
    Measure,
    ComparisonDelta,
    ComparisonPercent,
    PercentOfTotal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnDef {
    pub id: String,
    pub header: String,
    pub kind: ColumnKind,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<ColumnDef>,
}

impl ColumnDef {
    fn leaf(id: String, header: String, kind: ColumnKind) -> Self {
        ColumnDef { id, header, kind, columns: Vec::new() }
    }

    pub fn is_leaf(&self) -> bool {
        self.columns.is_empty()
    }
}

/// One tuple of column-dimension values.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnCombo {
    /// `c{i}v{j}` parts joined by `_`.
    pub id: String,
    /// Index of each value in its dimension's axis.
    pub indices: Vec<usize>,
    pub values: Vec<PivotValue>,
}

impl ColumnCombo {
    pub fn cell_id(&self, measure_index: usize) -> String {
        cell_accessor(&self.id, measure_index)
    }
}

/// Every combination of column values, in axis order. Empty when there are
/// no column dimensions or any dimension has no values.
pub fn column_combos(config: &PivotConfig, axes: &AxisData) -> Vec<ColumnCombo> {
    if config.col_dimensions.is_empty() {
        return Vec::new();
    }
    let mut paths: Vec<Vec<usize>> = vec![Vec::new()];
    for dimension in &config.col_dimensions {
        let count = axes.values_for(&dimension.name).len();
        paths = paths
            .into_iter()
            .flat_map(|path| {
                (0..count).map(move |j| {
                    let mut next = path.clone();
                    next.push(j);
                    next
                })
            })
            .collect();
    }

    paths
        .into_iter()
        .map(|indices| {
            let pairs: Vec<(usize, usize)> = indices.iter().copied().enumerate().collect();
            let values = config
                .col_dimensions
                .iter()
                .zip(&indices)
                .map(|(dimension, &j)| axes.values_for(&dimension.name)[j].clone())
                .collect();
            ColumnCombo { id: combo_id(&pairs), indices, values }
        })
        .collect()
}

/// Keep only combinations present in the per-column totals.
pub fn non_empty_combos(config: &PivotConfig, combos: Vec<ColumnCombo>, by_column: &[AggregationRow]) -> Vec<ColumnCombo> {
    let present: HashSet<String> = by_column
        .iter()
        .map(|row| {
            let values: Vec<PivotValue> = config
                .col_dimensions
                .iter()
                .map(|d| row.get(&d.name).cloned().unwrap_or_default())
                .collect();
            crate::cells::cell_key(&values)
        })
        .collect();
    combos
        .into_iter()
        .filter(|combo| present.contains(&crate::cells::cell_key(&combo.values)))
        .collect()
}

fn measure_column(config: &PivotConfig, name: &str, id: String) -> ColumnDef {
    let (header, kind) = match config.measure_kind(name) {
        Some(MeasureKind::Base(m)) => (m.label.clone(), ColumnKind::Measure),
        Some(MeasureKind::ComparisonDelta(m)) => (format!("{} Δ", m.label), ColumnKind::ComparisonDelta),
        Some(MeasureKind::ComparisonPercent(m)) => (format!("{} Δ %", m.label), ColumnKind::ComparisonPercent),
        Some(MeasureKind::PercentOfTotal(m)) => (format!("{} % of total", m.label), ColumnKind::PercentOfTotal),
        None => (name.to_string(), ColumnKind::Measure),
    };
    ColumnDef::leaf(id, header, kind)
}

fn value_header(value: &PivotValue) -> String {
    match value {
        PivotValue::Null => "(null)".to_string(),
        other => other.to_string(),
    }
}

fn group_columns(config: &PivotConfig, combos: &[ColumnCombo], depth: usize) -> Vec<ColumnDef> {
    if depth == config.col_dimensions.len() {
        return match combos.first() {
            Some(combo) => config
                .measure_names
                .iter()
                .enumerate()
                .map(|(k, name)| measure_column(config, name, combo.cell_id(k)))
                .collect(),
            None => Vec::new(),
        };
    }

    let mut groups = Vec::new();
    let mut start = 0;
    while start < combos.len() {
        let index = combos[start].indices[depth];
        let end = combos[start..]
            .iter()
            .position(|c| c.indices[depth] != index)
            .map(|offset| start + offset)
            .unwrap_or(combos.len());
        let prefix: Vec<(usize, usize)> = combos[start].indices[..=depth].iter().copied().enumerate().collect();
        groups.push(ColumnDef {
            id: combo_id(&prefix),
            header: value_header(&combos[start].values[depth]),
            kind: ColumnKind::Group,
            columns: group_columns(config, &combos[start..end], depth + 1),
        });
        start = end;
    }
    groups
}

/// Column tree for the pivot over the given (non-empty) combinations.
pub fn column_def_for_pivot(config: &PivotConfig, combos: &[ColumnCombo]) -> Vec<ColumnDef> {
    let mut defs = Vec::new();
    if let Some(anchor) = config.anchor() {
        let header = config
            .row_dimensions
            .iter()
            .map(|d| d.label.as_str())
            .collect::<Vec<_>>()
            .join(" > ");
        defs.push(ColumnDef::leaf(anchor.name.clone(), header, ColumnKind::RowHeader));
    }
    defs.extend(
        config
            .measure_names
            .iter()
            .map(|name| measure_column(config, name, name.clone())),
    );
    defs.extend(group_columns(config, combos, 0));
    defs
}

/// Number of value columns, not counting the row header or group headers.
pub fn count_leaf_columns(defs: &[ColumnDef]) -> usize {
    defs.iter()
        .map(|def| match def.kind {
            ColumnKind::RowHeader => 0,
            _ if def.is_leaf() => 1,
            _ => count_leaf_columns(&def.columns),
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::fixtures;

    fn axes() -> AxisData {
        let mut axes = AxisData::default();
        axes.values.insert("channel".into(), vec!["web".into(), "store".into()]);
        axes.values.insert("created_at__month".into(), vec!["2024-01-01".into(), "2024-02-01".into()]);
        axes
    }

    fn totals_row(channel: &str, month: &str) -> AggregationRow {
        let mut row = AggregationRow::new();
        row.insert("channel".into(), channel.into());
        row.insert("created_at__month".into(), month.into());
        row
    }

    #[test]
    fn test_combos_in_axis_order() {
        let config = fixtures::config(&["country"], &["channel", "month"], &["revenue"]);
        let combos = column_combos(&config, &axes());
        let ids: Vec<&str> = combos.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c0v0_c1v0", "c0v0_c1v1", "c0v1_c1v0", "c0v1_c1v1"]);
        assert_eq!(combos[2].values, vec![PivotValue::from("store"), PivotValue::from("2024-01-01")]);
    }

    #[test]
    fn test_grouped_headers_skip_empty_columns() {
        let config = fixtures::config(&["country"], &["channel", "month"], &["revenue", "orders"]);
        let combos = non_empty_combos(
            &config,
            column_combos(&config, &axes()),
            &[totals_row("web", "2024-01-01"), totals_row("store", "2024-02-01"), totals_row("web", "2024-02-01")],
        );
        assert_eq!(combos.len(), 3);

        let defs = column_def_for_pivot(&config, &combos);
        assert_eq!(defs[0].kind, ColumnKind::RowHeader);
        assert_eq!(defs[1].id, "revenue");
        assert_eq!(defs[2].id, "orders");

        let web = &defs[3];
        assert_eq!(web.header, "web");
        assert_eq!(web.columns.len(), 2);
        assert_eq!(web.columns[1].id, "c0v0_c1v1");
        assert_eq!(web.columns[1].columns[1].id, "c0v0_c1v1m1");

        let store = &defs[4];
        assert_eq!(store.columns.len(), 1);
        assert_eq!(store.columns[0].header, "2024-02-01");

        // 2 row-total columns + 3 combos × 2 measures.
        assert_eq!(count_leaf_columns(&defs), 8);
    }

    #[test]
    fn test_synthetic_columns_follow_their_measure() {
        let config = fixtures::comparison_config(&["country"], &[], &["revenue", "margin"]);
        let defs = column_def_for_pivot(&config, &[]);
        let ids: Vec<&str> = defs.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["country", "revenue", "revenue_delta", "revenue_pct", "margin", "margin_delta"]
        );
        assert_eq!(defs[2].kind, ColumnKind::ComparisonDelta);
        assert_eq!(defs[3].kind, ColumnKind::ComparisonPercent);
        assert_eq!(count_leaf_columns(&defs), 5);
    }
}

/// Cell Matrix Fetching
///
/// One query covers the current row window crossed with the column axis:
/// the anchor restricted to the window's values, every column dimension
/// restricted to its axis values. Results are indexed by composite key so the
/// assembler can look up any (row value, column value tuple) directly.

use crate::axes::{grouped_request, AxisData, RowAxis};
use crate::config::{EngineSettings, PivotConfig, PivotDimension};
use crate::expr::Expr;
use crate::query::{QueryClient, Stage};
use crate::service::{AggregationRequest, AggregationRow, AggregationService, SortRef};
use crate::value::PivotValue;
use std::collections::HashMap;

const KEY_SEPARATOR: char = '\u{1f}';

/// Composite key of a tuple of dimension values.
pub fn cell_key<'a, I>(values: I) -> String
where
    I: IntoIterator<Item = &'a PivotValue>,
{
    let mut key = String::new();
    for (i, value) in values.into_iter().enumerate() {
        if i > 0 {
            key.push(KEY_SEPARATOR);
        }
        key.push_str(&value.key());
    }
    key
}

/// Cell rows indexed by their dimension values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CellMatrix {
    cells: HashMap<String, AggregationRow>,
}

impl CellMatrix {
    /// Index `rows` by the values of `dimensions`, in order.
    pub fn index(rows: &[AggregationRow], dimensions: &[&str]) -> Self {
        let null = PivotValue::Null;
        let cells = rows
            .iter()
            .map(|row| {
                let key = cell_key(dimensions.iter().map(|d| row.get(*d).unwrap_or(&null)));
                (key, row.clone())
            })
            .collect();
        CellMatrix { cells }
    }

    /// The cell for a (row value, column values) tuple. A row value of
    /// `None` means the matrix has no row dimension.
    pub fn get(&self, row_value: Option<&PivotValue>, column_values: &[PivotValue]) -> Option<&AggregationRow> {
        self.cells.get(&cell_key(row_value.into_iter().chain(column_values)))
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

/// Cell query for `row_dimension` (if any) crossed with the column axis.
/// Returns `None` when some column dimension has no values: the cross
/// product is empty and there is nothing to ask for.
pub fn cell_request(
    config: &PivotConfig,
    settings: &EngineSettings,
    row_dimension: Option<&PivotDimension>,
    restrictions: Vec<Expr>,
    columns: &AxisData,
) -> Option<AggregationRequest> {
    let mut restrictions = restrictions;
    for dimension in &config.col_dimensions {
        let values = columns.values_for(&dimension.name);
        if values.is_empty() {
            return None;
        }
        restrictions.push(dimension.in_filter(values));
    }

    let dimensions = row_dimension
        .into_iter()
        .chain(&config.col_dimensions)
        .map(|d| d.to_request(&config.time_zone))
        .collect();
    let sort = row_dimension
        .map(|d| vec![SortRef::asc(d.name.clone())])
        .unwrap_or_default();

    Some(grouped_request(
        config,
        dimensions,
        config.request_measures(),
        Expr::merge(config.where_filter.as_ref(), restrictions),
        sort,
        settings.cell_query_limit,
        0,
    ))
}

/// Fetch the cells of the current row window. Only needed when the pivot
/// has column dimensions; otherwise row and grand totals already carry every
/// value.
pub fn fetch_cells<S: AggregationService>(
    client: &mut QueryClient<S>,
    config: &PivotConfig,
    settings: &EngineSettings,
    rows: &RowAxis,
    columns: &AxisData,
) -> Stage<CellMatrix> {
    if config.col_dimensions.is_empty() {
        return Stage::Ready(CellMatrix::default());
    }

    let anchor = config.anchor();
    let mut restrictions = Vec::new();
    if let Some(anchor) = anchor {
        let values = rows.values(&anchor.name);
        if values.is_empty() {
            return Stage::Ready(CellMatrix::default());
        }
        restrictions.push(anchor.in_filter(&values));
    }

    let request = match cell_request(config, settings, anchor, restrictions, columns) {
        Some(request) => request,
        None => return Stage::Ready(CellMatrix::default()),
    };

    let key_dimensions: Vec<&str> = anchor
        .into_iter()
        .chain(&config.col_dimensions)
        .map(|d| d.name.as_str())
        .collect();
    client
        .query(request)
        .map(|response| CellMatrix::index(&response.data, &key_dimensions))
}

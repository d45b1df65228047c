/// Column and Row Axis Resolution
///
/// The column axis is the distinct, ordered set of values of every column
/// dimension, one query per dimension, fanned in before anything downstream
/// runs. The row axis is the ordered list of anchor values for the pages
/// loaded so far. Pages are committed to a [`RowSkeleton`] one at a time and
/// never refetched while the configuration fingerprint is unchanged.

use crate::config::{EngineSettings, PivotConfig, PivotDimension};
use crate::expr::Expr;
use crate::query::{all_ready, QueryClient, Stage};
use crate::service::{AggregationRequest, AggregationRow, AggregationService, DimensionRef, MeasureRef, SortRef};
use crate::sort::{merge_row_totals_in_order, reconcile_with_accessor, row_sort, SortTarget, SortValue};
use crate::value::PivotValue;
use log::debug;
use std::collections::HashMap;

/// Distinct ordered values per dimension, with the measure-total row of each
/// value in a parallel list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AxisData {
    pub values: HashMap<String, Vec<PivotValue>>,
    pub totals: HashMap<String, Vec<AggregationRow>>,
}

impl AxisData {
    pub fn values_for(&self, dimension: &str) -> &[PivotValue] {
        self.values.get(dimension).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn totals_for(&self, dimension: &str) -> &[AggregationRow] {
        self.totals.get(dimension).map(Vec::as_slice).unwrap_or(&[])
    }

    fn insert(&mut self, dimension: &PivotDimension, rows: &[AggregationRow]) {
        let values = rows
            .iter()
            .map(|row| row.get(&dimension.name).cloned().unwrap_or_default())
            .collect();
        self.values.insert(dimension.name.clone(), values);
        self.totals.insert(dimension.name.clone(), rows.to_vec());
    }
}

/// Order used when nothing else is asked for: descending by the first
/// measure, or chronological for time buckets.
pub fn default_sort(dimension: &PivotDimension, config: &PivotConfig) -> Vec<SortRef> {
    match config.measures.first() {
        Some(measure) if !dimension.is_time_bucket() => vec![SortRef::desc(measure.name.clone())],
        _ => vec![SortRef::asc(dimension.name.clone())],
    }
}

/// A grouped request against the config's time range. The comparison range
/// is attached only when comparison measures are requested.
pub fn grouped_request(
    config: &PivotConfig,
    dimensions: Vec<DimensionRef>,
    measures: Vec<MeasureRef>,
    where_filter: Option<Expr>,
    sort: Vec<SortRef>,
    limit: usize,
    offset: usize,
) -> AggregationRequest {
    let comparison_time_range = if measures.iter().any(|m| m.is_comparison) {
        config.comparison_time.clone()
    } else {
        None
    };
    AggregationRequest {
        measures,
        dimensions,
        where_filter,
        sort,
        time_range: config.time_range.clone(),
        comparison_time_range,
        limit,
        offset,
    }
}

/// Axis query for a single dimension.
pub fn axis_request(
    config: &PivotConfig,
    dimension: &PivotDimension,
    measures: Vec<MeasureRef>,
    where_filter: Option<Expr>,
    sort: Vec<SortRef>,
    limit: usize,
    offset: usize,
) -> AggregationRequest {
    grouped_request(
        config,
        vec![dimension.to_request(&config.time_zone)],
        measures,
        where_filter,
        sort,
        limit,
        offset,
    )
}

/// Query the values of every column dimension. Ready only when every
/// per-dimension query is ready.
pub fn resolve_column_axes<S: AggregationService>(
    client: &mut QueryClient<S>,
    config: &PivotConfig,
    settings: &EngineSettings,
) -> Stage<AxisData> {
    let stages: Vec<_> = config
        .col_dimensions
        .iter()
        .map(|dimension| {
            let request = axis_request(
                config,
                dimension,
                config.base_measure_refs(),
                config.where_filter.clone(),
                default_sort(dimension, config),
                settings.axis_limit,
                0,
            );
            client.query(request).map(|response| (dimension, response))
        })
        .collect();

    all_ready(stages).map(|responses| {
        let mut axes = AxisData::default();
        for (dimension, response) in responses {
            axes.insert(dimension, &response.data);
        }
        axes
    })
}

/// Anchor rows committed for the current fingerprint, page by page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowSkeleton {
    rows: Vec<AggregationRow>,
    /// Cumulative row count after each committed page.
    page_ends: Vec<usize>,
    reached_end: bool,
}

impl RowSkeleton {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pages_loaded(&self) -> u32 {
        self.page_ends.len() as u32
    }

    pub fn reached_end(&self) -> bool {
        self.reached_end
    }

    /// Rows of pages `1..=page`.
    pub fn window(&self, page: u32) -> &[AggregationRow] {
        let pages = (page as usize).min(self.page_ends.len());
        match pages {
            0 => &[],
            n => &self.rows[..self.page_ends[n - 1]],
        }
    }

    fn commit(&mut self, anchor: &str, page: u32, rows: Vec<AggregationRow>) {
        let added = merge_row_totals_in_order(&mut self.rows, anchor, rows);
        debug!("row page {} committed: {} new rows", page, added);
        if added == 0 && page > 1 {
            self.reached_end = true;
        }
        self.page_ends.push(self.rows.len());
    }
}

/// The anchor rows visible for the requested page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowAxis {
    /// Anchor value plus row-total measures, in display order.
    pub rows: Vec<AggregationRow>,
    pub reached_end: bool,
}

impl RowAxis {
    pub fn values(&self, anchor: &str) -> Vec<PivotValue> {
        self.rows
            .iter()
            .map(|row| row.get(anchor).cloned().unwrap_or_default())
            .collect()
    }
}

pub fn page_request(
    config: &PivotConfig,
    settings: &EngineSettings,
    anchor: &PivotDimension,
    target: &SortTarget,
    page: u32,
) -> AggregationRequest {
    let offset = (page.saturating_sub(1) as usize) * settings.rows_per_page;
    axis_request(
        config,
        anchor,
        config.request_measures(),
        config.where_filter.clone(),
        row_sort(config, target),
        settings.rows_per_page,
        offset,
    )
}

/// Query for the sort target's values restricted to the page's anchor
/// values and the target's column path.
pub fn accessor_request(
    config: &PivotConfig,
    anchor: &PivotDimension,
    page_values: &[PivotValue],
    measure: &str,
    value: SortValue,
    column_path: &[(usize, PivotValue)],
    desc: bool,
) -> AggregationRequest {
    let mut restrictions = vec![anchor.in_filter(page_values)];
    for (index, value) in column_path {
        if let Some(dimension) = config.col_dimensions.get(*index) {
            restrictions.push(dimension.equals_filter(value));
        }
    }
    axis_request(
        config,
        anchor,
        value.request_measures(measure),
        Expr::merge(config.where_filter.as_ref(), restrictions),
        vec![SortRef { name: measure.to_string(), desc }],
        page_values.len(),
        0,
    )
}

/// Load anchor pages up to `page` into `skeleton` and return the window.
///
/// Pages commit strictly in order. A measure sort target resolves a sort
/// accessor for each page before it commits.
pub fn resolve_row_axis<S: AggregationService>(
    client: &mut QueryClient<S>,
    config: &PivotConfig,
    settings: &EngineSettings,
    target: &SortTarget,
    skeleton: &mut RowSkeleton,
    page: u32,
) -> Stage<RowAxis> {
    let anchor = match config.anchor() {
        Some(anchor) => anchor,
        None => return Stage::Ready(RowAxis::default()),
    };

    while skeleton.pages_loaded() < page && !skeleton.reached_end {
        let next = skeleton.pages_loaded() + 1;
        let rows = match client.query(page_request(config, settings, anchor, target, next)) {
            Stage::Ready(response) => response.data.clone(),
            Stage::Fetching => return Stage::Fetching,
            Stage::Failed(err) => return Stage::Failed(err),
        };

        let rows = match target {
            SortTarget::Measure { measure, value, column_path, desc } if !rows.is_empty() => {
                let values: Vec<PivotValue> =
                    rows.iter().map(|row| row.get(&anchor.name).cloned().unwrap_or_default()).collect();
                let request = accessor_request(config, anchor, &values, measure, *value, column_path, *desc);
                match client.query(request) {
                    Stage::Ready(accessor) => {
                        reconcile_with_accessor(&anchor.name, rows, &accessor.data, measure, *value, *desc)
                    }
                    Stage::Fetching => return Stage::Fetching,
                    Stage::Failed(err) => return Stage::Failed(err),
                }
            }
            _ => rows,
        };

        skeleton.commit(&anchor.name, next, rows);
    }

    Stage::Ready(RowAxis {
        rows: skeleton.window(page).to_vec(),
        reached_end: skeleton.reached_end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SortSpec;
    use crate::memory::fixtures;
    use std::sync::Arc;

    fn client() -> QueryClient<crate::memory::MemoryService> {
        QueryClient::new(Arc::new(fixtures::sales()), 64)
    }

    fn settings(rows_per_page: usize) -> EngineSettings {
        EngineSettings { rows_per_page, ..EngineSettings::default() }
    }

    fn keys(values: &[PivotValue]) -> Vec<String> {
        values.iter().map(PivotValue::key).collect()
    }

    #[tokio::test]
    async fn test_column_axes_fan_in() {
        let config = fixtures::config(&["country"], &["channel", "month"], &["revenue"]);
        let mut client = client();
        assert!(resolve_column_axes(&mut client, &config, &settings(50)).is_fetching());
        assert_eq!(client.pending_count(), 2);

        // Resolving one of the two queries is not enough.
        client.settle_where(|r| r.dimensions[0].name == "channel").await;
        assert!(resolve_column_axes(&mut client, &config, &settings(50)).is_fetching());

        client.settle().await;
        let axes = resolve_column_axes(&mut client, &config, &settings(50)).ready().unwrap();
        assert_eq!(keys(axes.values_for("channel")), vec!["web", "store"]);
        // Time buckets are chronological.
        assert_eq!(
            keys(axes.values_for("created_at__month")),
            vec!["2024-01-01", "2024-02-01", "2024-03-01"]
        );
        assert_eq!(axes.totals_for("channel")[0]["revenue"], PivotValue::Int64(560));
    }

    #[tokio::test]
    async fn test_row_pages_append() {
        let config = fixtures::config(&["country"], &[], &["revenue"]);
        let settings = settings(2);
        let mut client = client();
        let mut skeleton = RowSkeleton::new();

        assert!(resolve_row_axis(&mut client, &config, &settings, &SortTarget::Default, &mut skeleton, 1).is_fetching());
        client.settle().await;
        let page1 = resolve_row_axis(&mut client, &config, &settings, &SortTarget::Default, &mut skeleton, 1)
            .ready()
            .unwrap();
        assert_eq!(keys(&page1.values("country")), vec!["US", "DE"]);

        for _ in 0..3 {
            let _ = resolve_row_axis(&mut client, &config, &settings, &SortTarget::Default, &mut skeleton, 4);
            client.settle().await;
        }
        let all = resolve_row_axis(&mut client, &config, &settings, &SortTarget::Default, &mut skeleton, 4)
            .ready()
            .unwrap();
        assert_eq!(keys(&all.values("country")), vec!["US", "DE", "FR", "ES", "IT"]);
        assert!(all.reached_end);

        // Going back to page 1 only shows the first window.
        let back = resolve_row_axis(&mut client, &config, &settings, &SortTarget::Default, &mut skeleton, 1)
            .ready()
            .unwrap();
        assert_eq!(back.rows.len(), 2);
    }

    #[tokio::test]
    async fn test_measure_target_uses_accessor() {
        let mut config = fixtures::config(&["country"], &["channel"], &["revenue"]);
        config.sorting = Some(SortSpec { id: "c0v1m0".into(), desc: true });
        let settings = settings(50);
        let mut client = client();

        let _ = resolve_column_axes(&mut client, &config, &settings);
        client.settle().await;
        let axes = resolve_column_axes(&mut client, &config, &settings).ready().unwrap();
        let target = crate::sort::resolve_sort_target(&config, &axes);
        assert!(target.is_measure());

        let mut skeleton = RowSkeleton::new();
        let _ = resolve_row_axis(&mut client, &config, &settings, &target, &mut skeleton, 1);
        client.settle().await;
        assert!(resolve_row_axis(&mut client, &config, &settings, &target, &mut skeleton, 1).is_fetching());
        client.settle().await;
        let rows = resolve_row_axis(&mut client, &config, &settings, &target, &mut skeleton, 1)
            .ready()
            .unwrap();
        // Store revenue: US 120, DE 50, IT 40; FR and ES have no store sales.
        assert_eq!(keys(&rows.values("country")), vec!["US", "DE", "IT", "FR", "ES"]);
    }
}

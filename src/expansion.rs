/// Row Expansion
///
/// A row path is the list of row-dimension values from the anchor down to
/// the expanded row. Expanding a path queries the next row dimension scoped to
/// the path's ancestors and places the resulting sub-rows under that node.
/// Sub-rows are cached per path for the lifetime of one fingerprint, so
/// collapsing and expanding again never queries twice.
///
/// Paths are applied in sorted order, which puts every parent before its
/// children: a child path finds its parent's sub-rows already in place.

use crate::assemble::{PivotDataRow, RowBuilder};
use crate::axes::{axis_request, default_sort, AxisData};
use crate::cells::{cell_request, CellMatrix};
use crate::column_def::ColumnCombo;
use crate::config::{EngineSettings, PivotConfig, RowPath};
use crate::error::ServiceError;
use crate::expr::Expr;
use crate::query::{QueryClient, Stage};
use crate::service::{AggregationRow, AggregationService};
use crate::value::PivotValue;
use log::{debug, warn};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpansionStatus {
    Collapsed,
    /// Expanded by the user, sub-rows not resolved yet.
    Expanding,
    Expanded,
}

/// Sub-rows per expanded path.
#[derive(Debug, Clone, Default)]
pub struct ExpansionCache {
    sub_rows: HashMap<RowPath, Vec<PivotDataRow>>,
}

impl ExpansionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &RowPath) -> Option<&Vec<PivotDataRow>> {
        self.sub_rows.get(path)
    }

    pub fn contains(&self, path: &RowPath) -> bool {
        self.sub_rows.contains_key(path)
    }

    pub fn insert(&mut self, path: RowPath, rows: Vec<PivotDataRow>) {
        self.sub_rows.insert(path, rows);
    }

    pub fn len(&self) -> usize {
        self.sub_rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sub_rows.is_empty()
    }
}

pub fn expansion_status(expanded: &BTreeSet<RowPath>, cache: &ExpansionCache, path: &RowPath) -> ExpansionStatus {
    if !expanded.contains(path) {
        ExpansionStatus::Collapsed
    } else if cache.contains(path) {
        ExpansionStatus::Expanded
    } else {
        ExpansionStatus::Expanding
    }
}

/// What happened while applying expansions to a table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpansionOutcome {
    /// Paths whose sub-rows are still being fetched.
    pub pending: usize,
    pub failed: Vec<(RowPath, ServiceError)>,
}

/// The actual dimension values along `path`, if every node exists.
fn path_values(rows: &[PivotDataRow], anchor: &str, path: &[String]) -> Option<Vec<PivotValue>> {
    let mut values = Vec::with_capacity(path.len());
    let mut level = rows;
    for (i, key) in path.iter().enumerate() {
        let node = level.iter().find(|r| r.get(anchor).map(PivotValue::key).as_ref() == Some(key))?;
        values.push(node.get(anchor).cloned().unwrap_or_default());
        if i + 1 < path.len() {
            level = node.sub_rows.as_deref()?;
        }
    }
    Some(values)
}

fn find_node<'r>(rows: &'r mut [PivotDataRow], anchor: &str, path: &[String]) -> Option<&'r mut PivotDataRow> {
    let (first, rest) = path.split_first()?;
    let node = rows
        .iter_mut()
        .find(|r| r.get(anchor).map(PivotValue::key).as_ref() == Some(first))?;
    if rest.is_empty() {
        Some(node)
    } else {
        find_node(node.sub_rows.as_deref_mut()?, anchor, rest)
    }
}

/// Queries for the sub-rows of `values`: the next dimension's totals, and
/// its cells when there are column dimensions.
fn resolve_sub_rows<S: AggregationService>(
    client: &mut QueryClient<S>,
    config: &PivotConfig,
    settings: &EngineSettings,
    columns: &AxisData,
    values: &[PivotValue],
) -> Stage<(Vec<AggregationRow>, CellMatrix)> {
    let depth = values.len();
    let dimension = &config.row_dimensions[depth];
    let ancestors: Vec<Expr> = config
        .row_dimensions
        .iter()
        .zip(values)
        .map(|(d, v)| d.equals_filter(v))
        .collect();

    let totals = client
        .query(axis_request(
            config,
            dimension,
            config.request_measures(),
            Expr::merge(config.where_filter.as_ref(), ancestors.clone()),
            default_sort(dimension, config),
            settings.axis_limit,
            0,
        ))
        .map(|response| response.data.clone());

    let cells = if config.col_dimensions.is_empty() {
        Stage::Ready(CellMatrix::default())
    } else {
        match cell_request(config, settings, Some(dimension), ancestors, columns) {
            Some(request) => {
                let key_dimensions: Vec<&str> = std::iter::once(dimension)
                    .chain(&config.col_dimensions)
                    .map(|d| d.name.as_str())
                    .collect();
                client
                    .query(request)
                    .map(|response| CellMatrix::index(&response.data, &key_dimensions))
            }
            None => Stage::Ready(CellMatrix::default()),
        }
    };

    totals.zip(cells)
}

/// Place cached or freshly resolved sub-rows under every expanded path.
pub fn apply_expansions<S: AggregationService>(
    client: &mut QueryClient<S>,
    config: &PivotConfig,
    settings: &EngineSettings,
    columns: &AxisData,
    combos: &[ColumnCombo],
    global: &AggregationRow,
    rows: &mut [PivotDataRow],
    cache: &mut ExpansionCache,
) -> ExpansionOutcome {
    let mut outcome = ExpansionOutcome::default();
    let anchor = match config.anchor() {
        Some(anchor) => anchor.name.clone(),
        None => return outcome,
    };
    let builder = RowBuilder::new(config, combos, global);

    for path in &config.expanded {
        if path.is_empty() || path.len() >= config.row_dimensions.len() {
            debug!("skipping expansion of {:?}: no deeper row dimension", path);
            continue;
        }
        let values = match path_values(rows, &anchor, path) {
            Some(values) => values,
            None => {
                debug!("skipping expansion of {:?}: row not in table", path);
                continue;
            }
        };

        if !cache.contains(path) {
            match resolve_sub_rows(client, config, settings, columns, &values) {
                Stage::Ready((totals, cells)) => {
                    let depth = values.len();
                    let sub_rows = builder.build_level(&config.row_dimensions[depth], &totals, &cells, depth);
                    debug!("expanded {:?}: {} sub-rows", path, sub_rows.len());
                    cache.insert(path.clone(), sub_rows);
                }
                Stage::Fetching => {
                    outcome.pending += 1;
                    continue;
                }
                Stage::Failed(err) => {
                    warn!("expansion of {:?} failed: {}", path, err);
                    outcome.failed.push((path.clone(), err));
                    continue;
                }
            }
        }

        if let (Some(node), Some(sub_rows)) = (find_node(rows, &anchor, path), cache.get(path)) {
            node.sub_rows = Some(sub_rows.clone());
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assemble::assemble_rows;
    use crate::axes::RowAxis;
    use crate::memory::{fixtures, MemoryService};
    use crate::totals::Totals;
    use std::sync::Arc;

    fn anchor_rows(config: &PivotConfig, countries: &[&str]) -> Vec<PivotDataRow> {
        let rows = RowAxis {
            rows: countries
                .iter()
                .map(|c| {
                    let mut row = AggregationRow::new();
                    row.insert("country".into(), (*c).into());
                    row
                })
                .collect(),
            reached_end: false,
        };
        assemble_rows(config, &[], &rows, &CellMatrix::default(), &Totals::default())
    }

    fn path(values: &[&str]) -> RowPath {
        values.iter().map(|v| v.to_string()).collect()
    }

    async fn expand(
        client: &mut QueryClient<MemoryService>,
        config: &PivotConfig,
        rows: &mut [PivotDataRow],
        cache: &mut ExpansionCache,
    ) -> ExpansionOutcome {
        let settings = EngineSettings::default();
        let global = AggregationRow::new();
        loop {
            let outcome = apply_expansions(client, config, &settings, &AxisData::default(), &[], &global, rows, cache);
            if outcome.pending == 0 {
                return outcome;
            }
            client.settle().await;
        }
    }

    #[tokio::test]
    async fn test_expand_and_cache_hit() {
        let mut config = fixtures::config(&["country", "city", "channel"], &[], &["revenue"]);
        config.expanded.insert(path(&["DE"]));
        let mut client = QueryClient::new(Arc::new(fixtures::sales()), 64);
        let mut cache = ExpansionCache::new();

        let mut rows = anchor_rows(&config, &["US", "DE"]);
        assert_eq!(
            expansion_status(&config.expanded, &cache, &path(&["DE"])),
            ExpansionStatus::Expanding
        );
        expand(&mut client, &config, &mut rows, &mut cache).await;

        let sub_rows = rows[1].sub_rows.as_ref().unwrap();
        // DE 2024: Berlin 100, Munich 50.
        let cities: Vec<String> = sub_rows.iter().map(|r| r.get("country").unwrap().key()).collect();
        assert_eq!(cities, vec!["Berlin", "Munich"]);
        assert_eq!(sub_rows[0].get("revenue"), Some(&PivotValue::Int64(100)));
        // City rows can expand into channels.
        assert_eq!(sub_rows[0].sub_rows, Some(Vec::new()));
        assert_eq!(rows[0].sub_rows, Some(Vec::new()));
        assert_eq!(
            expansion_status(&config.expanded, &cache, &path(&["DE"])),
            ExpansionStatus::Expanded
        );

        // Collapse, then expand again: no new query.
        let issued = client.issued_count();
        config.expanded.clear();
        let mut collapsed = anchor_rows(&config, &["US", "DE"]);
        expand(&mut client, &config, &mut collapsed, &mut cache).await;
        assert_eq!(collapsed[1].sub_rows, Some(Vec::new()));

        config.expanded.insert(path(&["DE"]));
        let mut again = anchor_rows(&config, &["US", "DE"]);
        expand(&mut client, &config, &mut again, &mut cache).await;
        assert_eq!(again[1].sub_rows, rows[1].sub_rows);
        assert_eq!(client.issued_count(), issued);
    }

    #[tokio::test]
    async fn test_nested_paths_apply_parent_first() {
        let mut config = fixtures::config(&["country", "city", "channel"], &[], &["revenue"]);
        config.expanded.insert(path(&["DE", "Berlin"]));
        config.expanded.insert(path(&["DE"]));
        config.expanded.insert(path(&["XX"]));
        let mut client = QueryClient::new(Arc::new(fixtures::sales()), 64);
        let mut cache = ExpansionCache::new();
        let mut rows = anchor_rows(&config, &["DE"]);

        expand(&mut client, &config, &mut rows, &mut cache).await;

        let berlin = &rows[0].sub_rows.as_ref().unwrap()[0];
        let channels: Vec<String> = berlin
            .sub_rows
            .as_ref()
            .unwrap()
            .iter()
            .map(|r| r.get("country").unwrap().key())
            .collect();
        assert_eq!(channels, vec!["web"]);
        // Leaf level: no marker.
        assert_eq!(berlin.sub_rows.as_ref().unwrap()[0].sub_rows, None);
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_failure_is_local() {
        let mut config = fixtures::config(&["country", "city"], &[], &["revenue"]);
        config.expanded.insert(path(&["DE"]));
        config.where_filter = Some(Expr::eq("no_such_column", "x"));
        let mut client = QueryClient::new(Arc::new(fixtures::sales()), 64);
        let mut cache = ExpansionCache::new();
        let mut rows = anchor_rows(&config, &["DE", "US"]);

        let outcome = expand(&mut client, &config, &mut rows, &mut cache).await;
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].sub_rows, Some(Vec::new()));
        assert!(cache.is_empty());
    }
}

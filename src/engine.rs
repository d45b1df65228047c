/// Pivot Engine - Dataflow Evaluation and Stale-While-Revalidate
///
/// One engine serves one pivot view. It owns the query client and every
/// piece of state that outlives a single evaluation: the committed row
/// skeleton, the expansion cache and the last assembled table. Dropping the
/// engine or calling [`PivotEngine::reset`] discards all of it.
///
/// # Evaluation
///
/// `snapshot(config)` walks the stages in dependency order:
///
/// ```text
/// column axes -> sort target -> row axis (+ sort accessor)
///             -> totals + cells -> assembly -> expansions
/// ```
///
/// A stage that is not ready stops the walk; its queries stay registered in
/// the client. `settle()` resolves every registered query concurrently, and
/// `load(config)` alternates the two until nothing is pending.
///
/// # What the consumer sees
///
/// - axes pending: the last assembled table, flagged `is_fetching`
/// - totals or cells pending: the last table of the same fingerprint, or a
///   skeleton (`assembled == false`) with null values in the final layout
/// - a required stage failed: the last table with `error` set
/// - no measures: the empty table

use crate::assemble::{assemble_rows, skeleton_rows, skeleton_totals_row, totals_row, PivotDataRow};
use crate::axes::{resolve_column_axes, resolve_row_axis, RowAxis, RowSkeleton};
use crate::cells::fetch_cells;
use crate::column_def::{column_combos, column_def_for_pivot, count_leaf_columns, non_empty_combos, ColumnCombo, ColumnDef};
use crate::config::{EngineSettings, PivotConfig, RowPath};
use crate::error::ServiceError;
use crate::expansion::{apply_expansions, expansion_status, ExpansionCache, ExpansionStatus};
use crate::fingerprint::{Fingerprint, FingerprintTracker, Tagged};
use crate::query::{QueryClient, Stage};
use crate::service::AggregationService;
use crate::sort::resolve_sort_target;
use crate::totals::resolve_totals;
use log::{debug, info};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

/// The table handed to the rendering layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PivotDataState {
    pub is_fetching: bool,
    pub data: Vec<PivotDataRow>,
    pub column_def: Vec<ColumnDef>,
    /// False while the table is a loading skeleton.
    pub assembled: bool,
    pub total_columns: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub totals_row_data: Option<Vec<PivotDataRow>>,
    pub reached_end_for_row_data: bool,
    /// Page the data covers. Differs from the requested page after a
    /// structural change reset pagination.
    pub row_page: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PivotDataState {
    /// The table of a configuration with nothing to aggregate.
    pub fn empty() -> Self {
        PivotDataState {
            is_fetching: false,
            data: Vec::new(),
            column_def: Vec::new(),
            assembled: true,
            total_columns: 0,
            totals_row_data: None,
            reached_end_for_row_data: false,
            row_page: 1,
            error: None,
        }
    }

    fn placeholder(page: u32) -> Self {
        PivotDataState {
            assembled: false,
            row_page: page,
            ..Self::empty()
        }
    }
}

/// The slot's value for `fingerprint`, replacing whatever was built for
/// another one.
fn tagged_mut<'a, T: Default>(slot: &'a mut Option<Tagged<T>>, fingerprint: &Fingerprint) -> &'a mut T {
    if slot.as_ref().map_or(true, |tagged| !tagged.matches(fingerprint)) {
        *slot = None;
    }
    &mut slot
        .get_or_insert_with(|| Tagged::new(fingerprint.clone(), T::default()))
        .value
}

pub struct PivotEngine<S> {
    client: QueryClient<S>,
    settings: EngineSettings,
    tracker: FingerprintTracker,
    skeleton: Option<Tagged<RowSkeleton>>,
    expansions: Option<Tagged<ExpansionCache>>,
    last: Option<Tagged<PivotDataState>>,
    /// Requested page ignored since the last fingerprint change.
    page_reset: Option<u32>,
    expanded: BTreeSet<RowPath>,
}

impl<S: AggregationService> PivotEngine<S> {
    pub fn new(service: Arc<S>, settings: EngineSettings) -> Self {
        PivotEngine {
            client: QueryClient::new(service, settings.query_cache_capacity),
            settings,
            tracker: FingerprintTracker::new(),
            skeleton: None,
            expansions: None,
            last: None,
            page_reset: None,
            expanded: BTreeSet::new(),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn client(&self) -> &QueryClient<S> {
        &self.client
    }

    pub fn client_mut(&mut self) -> &mut QueryClient<S> {
        &mut self.client
    }

    /// Number of structural configuration changes seen.
    pub fn generation(&self) -> u64 {
        self.tracker.generation()
    }

    /// Evaluate the pipeline for `config` against the queries resolved so
    /// far, registering whatever is missing.
    pub fn snapshot(&mut self, config: &PivotConfig) -> PivotDataState {
        if config.is_degenerate() {
            return PivotDataState::empty();
        }

        let fingerprint = Fingerprint::of(config);
        let had_previous = self.tracker.current().is_some();
        if self.tracker.observe(&fingerprint) {
            debug!("pivot fingerprint changed (generation {})", self.tracker.generation());
            self.page_reset = if had_previous && config.row_page > 1 {
                Some(config.row_page)
            } else {
                None
            };
        }
        let page = match self.page_reset {
            Some(ignored) if ignored == config.row_page => 1,
            _ => {
                self.page_reset = None;
                config.row_page.max(1)
            }
        };
        self.expanded = config.expanded.clone();

        let columns = match resolve_column_axes(&mut self.client, config, &self.settings) {
            Stage::Ready(columns) => columns,
            Stage::Fetching => return self.stale(),
            Stage::Failed(err) => return self.failed(err),
        };
        let target = resolve_sort_target(config, &columns);

        let skeleton = tagged_mut(&mut self.skeleton, &fingerprint);
        let rows = match resolve_row_axis(&mut self.client, config, &self.settings, &target, skeleton, page) {
            Stage::Ready(rows) => rows,
            Stage::Fetching => return self.stale(),
            Stage::Failed(err) => return self.failed(err),
        };

        let all_combos = column_combos(config, &columns);
        let totals = resolve_totals(&mut self.client, config, &self.settings);
        let cells = fetch_cells(&mut self.client, config, &self.settings, &rows, &columns);
        let (totals, cells) = match totals.zip(cells) {
            Stage::Ready(resolved) => resolved,
            Stage::Fetching => return self.loading(config, &fingerprint, &all_combos, &rows, page),
            Stage::Failed(err) => return self.failed(err),
        };

        let combos = non_empty_combos(config, all_combos, &totals.by_column);
        let column_def = column_def_for_pivot(config, &combos);
        let mut data = assemble_rows(config, &combos, &rows, &cells, &totals);

        let cache = tagged_mut(&mut self.expansions, &fingerprint);
        let outcome = apply_expansions(
            &mut self.client,
            config,
            &self.settings,
            &columns,
            &combos,
            &totals.global,
            &mut data,
            cache,
        );

        let state = PivotDataState {
            is_fetching: outcome.pending > 0,
            total_columns: count_leaf_columns(&column_def),
            data,
            column_def,
            assembled: true,
            totals_row_data: Some(vec![totals_row(config, &combos, &totals)]),
            reached_end_for_row_data: rows.reached_end,
            row_page: page,
            error: None,
        };
        self.last = Some(Tagged::new(fingerprint, state.clone()));
        state
    }

    /// Resolve every pending query. Returns the number resolved.
    pub async fn settle(&mut self) -> usize {
        self.client.settle().await
    }

    /// Evaluate and settle until the table for `config` no longer waits on
    /// any query, or the pass limit is reached.
    pub async fn load(&mut self, config: &PivotConfig) -> PivotDataState {
        let mut state = self.snapshot(config);
        for _ in 0..self.settings.max_load_passes {
            if self.client.pending_count() == 0 {
                break;
            }
            self.settle().await;
            state = self.snapshot(config);
        }
        state
    }

    /// Forget failed queries so the next evaluation issues them again.
    pub fn retry_failed(&mut self) -> usize {
        self.client.retry_failed()
    }

    /// Discard every cached result and all retained state, e.g. when the
    /// view is rebound to another data source.
    pub fn reset(&mut self) {
        info!("pivot engine reset");
        self.client.clear();
        self.tracker.clear();
        self.skeleton = None;
        self.expansions = None;
        self.last = None;
        self.page_reset = None;
        self.expanded.clear();
    }

    /// Expansion state of a row path under the last evaluated config.
    pub fn expansion_status(&self, path: &RowPath) -> ExpansionStatus {
        let current = self.tracker.current();
        match self.expansions.as_ref().filter(|e| Some(&e.fingerprint) == current) {
            Some(cache) => expansion_status(&self.expanded, &cache.value, path),
            None => expansion_status(&self.expanded, &ExpansionCache::default(), path),
        }
    }

    /// Last table of any fingerprint, flagged as refreshing.
    fn stale(&self) -> PivotDataState {
        let mut state = match &self.last {
            Some(last) => last.value.clone(),
            None => PivotDataState::placeholder(1),
        };
        state.is_fetching = true;
        state
    }

    fn failed(&self, err: ServiceError) -> PivotDataState {
        let mut state = match &self.last {
            Some(last) => last.value.clone(),
            None => PivotDataState::placeholder(1),
        };
        state.is_fetching = false;
        state.error = Some(err.to_string());
        state
    }

    /// Axes are known but values are not: keep the last table if it has the
    /// same structure, otherwise show the final layout with null values.
    fn loading(
        &self,
        config: &PivotConfig,
        fingerprint: &Fingerprint,
        combos: &[ColumnCombo],
        rows: &RowAxis,
        page: u32,
    ) -> PivotDataState {
        if let Some(last) = self.last.as_ref().and_then(|last| last.get(fingerprint)) {
            let mut state = last.clone();
            state.is_fetching = true;
            return state;
        }
        let column_def = column_def_for_pivot(config, combos);
        PivotDataState {
            is_fetching: true,
            data: skeleton_rows(config, combos, rows),
            total_columns: count_leaf_columns(&column_def),
            column_def,
            assembled: false,
            totals_row_data: Some(vec![skeleton_totals_row(config, combos)]),
            reached_end_for_row_data: rows.reached_end,
            row_page: page,
            error: None,
        }
    }
}

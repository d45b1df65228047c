/// Pivot Configuration
///
/// Upstream dashboard state (the chips a user dropped into the row and column
/// shelves, the measure/dimension catalogue, filters, time controls and the
/// pivot's own page/expansion/sort state) is resolved into one canonical
/// `PivotConfig`. The config is recomputed on every upstream change and is
/// the only input of the pipeline besides query results.
///
/// # Synthetic names
///
/// - A time chip becomes the dimension alias `<time_dimension>__<grain>`.
/// - With comparison enabled and a comparison range resolved, every base
///   measure `m` is followed by `m_delta` and (unless `m` is a percentage)
///   `m_pct`.
/// - A measure chip asking for its share of the total adds
///   `m_percent_of_total` after those.

use crate::error::{PivotError, Result};
use crate::expr::{parse_expr, Expr};
use crate::service::{DimensionRef, MeasureRef};
use crate::timegrain::{TimeGrain, TimeRange};
use crate::value::PivotValue;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const COMPARISON_DELTA_SUFFIX: &str = "_delta";
pub const COMPARISON_PERCENT_SUFFIX: &str = "_pct";
pub const PERCENT_OF_TOTAL_SUFFIX: &str = "_percent_of_total";

/// Default number of anchor rows per page.
pub const NUM_ROWS_PER_PAGE: usize = 50;

/// Values of the row dimensions from the anchor down to the row itself.
pub type RowPath = Vec<String>;

// ============================================================================
// Upstream dashboard state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasureFormat {
    #[default]
    Number,
    Currency,
    Percentage,
}

/// A measure in the catalogue of the data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureSpec {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub format: MeasureFormat,
}

/// A dimension in the catalogue of the data source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionSpec {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
}

/// An entry on the row or column shelf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PivotChip {
    Measure {
        name: String,
        #[serde(default)]
        percent_of_total: bool,
    },
    Dimension { name: String },
    /// The dashboard's time dimension bucketed by `grain`.
    Time { grain: TimeGrain },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeControls {
    #[serde(default)]
    pub time_dimension: Option<String>,
    #[serde(default = "default_time_zone")]
    pub time_zone: String,
    #[serde(default)]
    pub range: Option<TimeRange>,
    #[serde(default)]
    pub comparison_range: Option<TimeRange>,
}

fn default_time_zone() -> String {
    "UTC".to_string()
}

impl Default for TimeControls {
    fn default() -> Self {
        TimeControls {
            time_dimension: None,
            time_zone: default_time_zone(),
            range: None,
            comparison_range: None,
        }
    }
}

/// Active sort: a column id (anchor dimension, measure name or cell column
/// id) and a direction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortSpec {
    pub id: String,
    #[serde(default)]
    pub desc: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PivotState {
    #[serde(default)]
    pub rows: Vec<PivotChip>,
    #[serde(default)]
    pub columns: Vec<PivotChip>,
    #[serde(default = "first_page")]
    pub row_page: u32,
    #[serde(default)]
    pub expanded: BTreeSet<RowPath>,
    #[serde(default)]
    pub sorting: Option<SortSpec>,
    #[serde(default)]
    pub enable_comparison: bool,
}

fn first_page() -> u32 {
    1
}

impl Default for PivotState {
    fn default() -> Self {
        PivotState {
            rows: Vec::new(),
            columns: Vec::new(),
            row_page: 1,
            expanded: BTreeSet::new(),
            sorting: None,
            enable_comparison: false,
        }
    }
}

/// Everything the pivot consumes from the surrounding dashboard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardState {
    #[serde(default)]
    pub measures: Vec<MeasureSpec>,
    #[serde(default)]
    pub dimensions: Vec<DimensionSpec>,
    /// Resolved dashboard filter.
    #[serde(default)]
    pub where_filter: Option<Expr>,
    /// Extra filter in textual form, ANDed with `where_filter`.
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default)]
    pub time: TimeControls,
    #[serde(default)]
    pub pivot: PivotState,
}

// ============================================================================
// Canonical config
// ============================================================================

/// A row or column dimension of the pivot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PivotDimension {
    /// Output name: the dimension name, or the alias of a time bucket.
    pub name: String,
    /// Dimension queried from the service.
    pub source: String,
    pub grain: Option<TimeGrain>,
    pub label: String,
}

impl PivotDimension {
    pub fn plain(name: impl Into<String>) -> Self {
        let name = name.into();
        PivotDimension {
            source: name.clone(),
            label: name.clone(),
            name,
            grain: None,
        }
    }

    pub fn time_bucket(source: impl Into<String>, grain: TimeGrain) -> Self {
        let source = source.into();
        PivotDimension {
            name: time_bucket_alias(&source, grain),
            label: format!("{} ({})", source, grain),
            source,
            grain: Some(grain),
        }
    }

    pub fn is_time_bucket(&self) -> bool {
        self.grain.is_some()
    }

    pub fn to_request(&self, time_zone: &str) -> DimensionRef {
        match self.grain {
            Some(grain) => DimensionRef {
                name: self.source.clone(),
                time_grain: Some(grain),
                time_zone: Some(time_zone.to_string()),
                alias: Some(self.name.clone()),
            },
            None => DimensionRef::plain(self.source.clone()),
        }
    }

    /// Filter selecting rows whose value of this dimension equals `value`.
    /// Time buckets become a range on the source column.
    pub fn equals_filter(&self, value: &PivotValue) -> Expr {
        match (self.grain, value) {
            (_, PivotValue::Null) => Expr::IsNull { column: self.source.clone() },
            (Some(grain), _) => bucket_filter(&self.source, grain, value),
            (None, _) => Expr::eq(self.source.clone(), value.clone()),
        }
    }

    /// Filter selecting rows whose value of this dimension is in `values`.
    pub fn in_filter(&self, values: &[PivotValue]) -> Expr {
        match self.grain {
            Some(_) => Expr::any(values.iter().map(|v| self.equals_filter(v)).collect())
                .unwrap_or_else(|| Expr::in_list(self.source.clone(), Vec::new())),
            None => Expr::in_list(self.source.clone(), values.to_vec()),
        }
    }
}

fn bucket_filter(column: &str, grain: TimeGrain, bucket: &PivotValue) -> Expr {
    match grain.bucket_range(bucket) {
        Some((start, end)) => Expr::And {
            exprs: vec![
                Expr::compare(column, crate::expr::CompareOp::Ge, start),
                Expr::compare(column, crate::expr::CompareOp::Lt, end),
            ],
        },
        // Unparseable bucket label: match nothing rather than everything.
        None => Expr::in_list(column, Vec::new()),
    }
}

pub fn time_bucket_alias(dimension: &str, grain: TimeGrain) -> String {
    format!("{}__{}", dimension, grain)
}

/// A base measure selected in the pivot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PivotMeasure {
    pub name: String,
    pub label: String,
    pub is_percentage: bool,
    pub percent_of_total: bool,
}

/// Role of an entry in `PivotConfig::measure_names`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MeasureKind<'a> {
    Base(&'a PivotMeasure),
    ComparisonDelta(&'a PivotMeasure),
    ComparisonPercent(&'a PivotMeasure),
    PercentOfTotal(&'a PivotMeasure),
}

impl<'a> MeasureKind<'a> {
    pub fn base(&self) -> &'a PivotMeasure {
        match self {
            MeasureKind::Base(m)
            | MeasureKind::ComparisonDelta(m)
            | MeasureKind::ComparisonPercent(m)
            | MeasureKind::PercentOfTotal(m) => m,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PivotConfig {
    pub measures: Vec<PivotMeasure>,
    /// Ordered column names of every measure, synthetic ones included.
    pub measure_names: Vec<String>,
    pub row_dimensions: Vec<PivotDimension>,
    pub col_dimensions: Vec<PivotDimension>,
    pub where_filter: Option<Expr>,
    pub time_range: Option<TimeRange>,
    pub comparison_time: Option<TimeRange>,
    pub time_zone: String,
    pub row_page: u32,
    pub expanded: BTreeSet<RowPath>,
    pub sorting: Option<SortSpec>,
}

impl PivotConfig {
    /// Config with the given base measures and dimensions and nothing else.
    pub fn new(
        measures: Vec<PivotMeasure>,
        row_dimensions: Vec<PivotDimension>,
        col_dimensions: Vec<PivotDimension>,
    ) -> Self {
        let mut config = PivotConfig {
            measure_names: Vec::new(),
            measures,
            row_dimensions,
            col_dimensions,
            where_filter: None,
            time_range: None,
            comparison_time: None,
            time_zone: default_time_zone(),
            row_page: 1,
            expanded: BTreeSet::new(),
            sorting: None,
        };
        config.rebuild_measure_names();
        config
    }

    /// Enable comparison against `range`, adding the synthetic names.
    pub fn with_comparison(mut self, range: TimeRange) -> Self {
        self.comparison_time = Some(range);
        self.rebuild_measure_names();
        self
    }

    fn rebuild_measure_names(&mut self) {
        let comparison = self.comparison_time.is_some();
        let mut names = Vec::new();
        for measure in &self.measures {
            names.push(measure.name.clone());
            if comparison {
                names.push(format!("{}{}", measure.name, COMPARISON_DELTA_SUFFIX));
                if !measure.is_percentage {
                    names.push(format!("{}{}", measure.name, COMPARISON_PERCENT_SUFFIX));
                }
            }
            if measure.percent_of_total {
                names.push(format!("{}{}", measure.name, PERCENT_OF_TOTAL_SUFFIX));
            }
        }
        self.measure_names = names;
    }

    pub fn row_dimension_names(&self) -> Vec<&str> {
        self.row_dimensions.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn col_dimension_names(&self) -> Vec<&str> {
        self.col_dimensions.iter().map(|d| d.name.as_str()).collect()
    }

    pub fn base_measure_names(&self) -> Vec<&str> {
        self.measures.iter().map(|m| m.name.as_str()).collect()
    }

    pub fn anchor(&self) -> Option<&PivotDimension> {
        self.row_dimensions.first()
    }

    pub fn comparison_enabled(&self) -> bool {
        self.comparison_time.is_some()
    }

    /// No measures means nothing to aggregate: the pivot renders empty.
    pub fn is_degenerate(&self) -> bool {
        self.measures.is_empty()
    }

    pub fn measure(&self, name: &str) -> Option<&PivotMeasure> {
        self.measures.iter().find(|m| m.name == name)
    }

    /// Classify an entry of `measure_names`.
    pub fn measure_kind(&self, name: &str) -> Option<MeasureKind<'_>> {
        if let Some(m) = self.measure(name) {
            return Some(MeasureKind::Base(m));
        }
        let strip = |suffix: &str| name.strip_suffix(suffix).and_then(|base| self.measure(base));
        if let Some(m) = strip(PERCENT_OF_TOTAL_SUFFIX) {
            return Some(MeasureKind::PercentOfTotal(m));
        }
        if let Some(m) = strip(COMPARISON_DELTA_SUFFIX) {
            return Some(MeasureKind::ComparisonDelta(m));
        }
        strip(COMPARISON_PERCENT_SUFFIX).map(MeasureKind::ComparisonPercent)
    }

    /// Measures to request from the service: every base measure, plus its
    /// comparison variant when comparison is enabled.
    pub fn request_measures(&self) -> Vec<MeasureRef> {
        let mut refs: Vec<MeasureRef> = self.measures.iter().map(|m| MeasureRef::base(m.name.clone())).collect();
        if self.comparison_enabled() {
            refs.extend(self.measures.iter().map(|m| MeasureRef::comparison(m.name.clone())));
        }
        refs
    }

    pub fn base_measure_refs(&self) -> Vec<MeasureRef> {
        self.measures.iter().map(|m| MeasureRef::base(m.name.clone())).collect()
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Derive the canonical pivot config from dashboard state.
///
/// Chips that reference unknown measures or dimensions are dropped with a
/// warning. A time chip without a configured time dimension is dropped too.
pub fn resolve_config(state: &DashboardState) -> Result<PivotConfig> {
    let time_dimension = state.time.time_dimension.as_deref();

    let resolve_dimension = |chip: &PivotChip| -> Option<PivotDimension> {
        match chip {
            PivotChip::Dimension { name } => match state.dimensions.iter().find(|d| &d.name == name) {
                Some(spec) => Some(PivotDimension {
                    name: spec.name.clone(),
                    source: spec.name.clone(),
                    grain: None,
                    label: spec.label.clone().unwrap_or_else(|| spec.name.clone()),
                }),
                None => {
                    warn!("dropping unknown dimension chip '{}'", name);
                    None
                }
            },
            PivotChip::Time { grain } => match time_dimension {
                Some(dim) => Some(PivotDimension::time_bucket(dim, *grain)),
                None => {
                    warn!("dropping time chip: no time dimension configured");
                    None
                }
            },
            PivotChip::Measure { .. } => None,
        }
    };

    let row_dimensions: Vec<PivotDimension> = state.pivot.rows.iter().filter_map(&resolve_dimension).collect();
    let col_dimensions: Vec<PivotDimension> = state.pivot.columns.iter().filter_map(&resolve_dimension).collect();

    let mut measures: Vec<PivotMeasure> = Vec::new();
    for chip in state.pivot.rows.iter().chain(&state.pivot.columns) {
        if let PivotChip::Measure { name, percent_of_total } = chip {
            if measures.iter().any(|m| &m.name == name) {
                continue;
            }
            match state.measures.iter().find(|m| &m.name == name) {
                Some(spec) => measures.push(PivotMeasure {
                    name: spec.name.clone(),
                    label: spec.label.clone().unwrap_or_else(|| spec.name.clone()),
                    is_percentage: spec.format == MeasureFormat::Percentage,
                    percent_of_total: *percent_of_total,
                }),
                None => warn!("dropping unknown measure chip '{}'", name),
            }
        }
    }

    let text_filter = match state.filter.as_deref().map(str::trim) {
        Some(text) if !text.is_empty() => Some(parse_expr(text).map_err(PivotError::from)?),
        _ => None,
    };
    let where_filter = Expr::all(state.where_filter.clone().into_iter().chain(text_filter));

    let comparison_time = if state.pivot.enable_comparison {
        state.time.comparison_range.clone()
    } else {
        None
    };

    let mut config = PivotConfig {
        measure_names: Vec::new(),
        measures,
        row_dimensions,
        col_dimensions,
        where_filter,
        time_range: state.time.range.clone(),
        comparison_time,
        time_zone: state.time.time_zone.clone(),
        row_page: state.pivot.row_page.max(1),
        expanded: state.pivot.expanded.clone(),
        sorting: state.pivot.sorting.clone(),
    };
    config.rebuild_measure_names();
    Ok(config)
}

// ============================================================================
// Engine settings
// ============================================================================

/// Tunables of the pivot engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Anchor rows per page.
    pub rows_per_page: usize,
    /// Limit for column-axis and expansion sub-row queries.
    pub axis_limit: usize,
    /// Limit for cell matrix queries. Large and constant so that nearby
    /// renders share cache entries.
    pub cell_query_limit: usize,
    pub query_cache_capacity: usize,
    /// Upper bound on evaluate/settle rounds in one `load`.
    pub max_load_passes: usize,
    /// Live views a registry keeps before dropping the least recently used.
    pub max_views: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            rows_per_page: NUM_ROWS_PER_PAGE,
            axis_limit: 100,
            cell_query_limit: 10_000,
            query_cache_capacity: 512,
            max_load_passes: 32,
            max_views: 64,
        }
    }
}

impl EngineSettings {
    /// Defaults overridden by `PIVOT_ROWS_PER_PAGE`, `PIVOT_AXIS_LIMIT`,
    /// `PIVOT_CELL_QUERY_LIMIT`, `PIVOT_QUERY_CACHE_CAPACITY`,
    /// `PIVOT_MAX_LOAD_PASSES` and `PIVOT_MAX_VIEWS`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = EngineSettings::default();
        let fields: [(&str, &mut usize); 6] = [
            ("PIVOT_ROWS_PER_PAGE", &mut settings.rows_per_page),
            ("PIVOT_AXIS_LIMIT", &mut settings.axis_limit),
            ("PIVOT_CELL_QUERY_LIMIT", &mut settings.cell_query_limit),
            ("PIVOT_QUERY_CACHE_CAPACITY", &mut settings.query_cache_capacity),
            ("PIVOT_MAX_LOAD_PASSES", &mut settings.max_load_passes),
            ("PIVOT_MAX_VIEWS", &mut settings.max_views),
        ];
        for (name, field) in fields {
            if let Some(raw) = lookup(name) {
                let value: usize = raw.trim().parse().map_err(|_| PivotError::Setting {
                    name: name.to_string(),
                    message: format!("'{}' is not a positive integer", raw),
                })?;
                if value == 0 {
                    return Err(PivotError::Setting {
                        name: name.to_string(),
                        message: "must be greater than zero".to_string(),
                    });
                }
                *field = value;
            }
        }
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dashboard() -> DashboardState {
        DashboardState {
            measures: vec![
                MeasureSpec { name: "revenue".into(), label: Some("Revenue".into()), format: MeasureFormat::Currency },
                MeasureSpec { name: "margin".into(), label: None, format: MeasureFormat::Percentage },
            ],
            dimensions: vec![
                DimensionSpec { name: "country".into(), label: Some("Country".into()) },
                DimensionSpec { name: "channel".into(), label: None },
            ],
            time: TimeControls {
                time_dimension: Some("created_at".into()),
                comparison_range: Some(TimeRange::new("2023-01-01", "2024-01-01")),
                range: Some(TimeRange::new("2024-01-01", "2025-01-01")),
                ..TimeControls::default()
            },
            pivot: PivotState {
                rows: vec![PivotChip::Dimension { name: "country".into() }],
                columns: vec![
                    PivotChip::Time { grain: TimeGrain::Month },
                    PivotChip::Measure { name: "revenue".into(), percent_of_total: true },
                    PivotChip::Measure { name: "margin".into(), percent_of_total: false },
                ],
                ..PivotState::default()
            },
            ..DashboardState::default()
        }
    }

    #[test]
    fn test_resolve_names() {
        let config = resolve_config(&dashboard()).unwrap();
        assert_eq!(config.row_dimension_names(), vec!["country"]);
        assert_eq!(config.col_dimension_names(), vec!["created_at__month"]);
        assert_eq!(config.measure_names, vec!["revenue", "revenue_percent_of_total", "margin"]);
        assert_eq!(config.row_dimensions[0].label, "Country");
    }

    #[test]
    fn test_comparison_names_only_when_enabled_and_resolved() {
        let mut state = dashboard();
        state.pivot.enable_comparison = true;
        let config = resolve_config(&state).unwrap();
        assert_eq!(
            config.measure_names,
            vec![
                "revenue",
                "revenue_delta",
                "revenue_pct",
                "revenue_percent_of_total",
                "margin",
                "margin_delta",
            ]
        );

        state.time.comparison_range = None;
        let config = resolve_config(&state).unwrap();
        assert!(!config.comparison_enabled());
        assert!(!config.measure_names.iter().any(|n| n.ends_with("_delta")));
    }

    #[test]
    fn test_measure_kinds() {
        let mut state = dashboard();
        state.pivot.enable_comparison = true;
        let config = resolve_config(&state).unwrap();

        assert!(matches!(config.measure_kind("revenue"), Some(MeasureKind::Base(_))));
        assert!(matches!(config.measure_kind("revenue_delta"), Some(MeasureKind::ComparisonDelta(_))));
        assert!(matches!(config.measure_kind("revenue_pct"), Some(MeasureKind::ComparisonPercent(_))));
        assert!(matches!(config.measure_kind("revenue_percent_of_total"), Some(MeasureKind::PercentOfTotal(_))));
        assert_eq!(config.measure_kind("nope"), None);

        let revenue = config.measure("revenue").unwrap();
        assert_eq!(config.measure_kind("revenue_delta"), Some(MeasureKind::ComparisonDelta(revenue)));
        assert_ne!(config.measure_kind("revenue_pct"), Some(MeasureKind::ComparisonDelta(revenue)));
    }

    #[test]
    fn test_unknown_chips_are_dropped() {
        let mut state = dashboard();
        state.pivot.rows.push(PivotChip::Dimension { name: "nope".into() });
        state.pivot.columns.push(PivotChip::Measure { name: "ghost".into(), percent_of_total: false });
        state.time.time_dimension = None;

        let config = resolve_config(&state).unwrap();
        assert_eq!(config.row_dimension_names(), vec!["country"]);
        assert!(config.col_dimensions.is_empty());
        assert_eq!(config.base_measure_names(), vec!["revenue", "margin"]);
    }

    #[test]
    fn test_text_filter_is_merged() {
        let mut state = dashboard();
        state.where_filter = Some(Expr::eq("channel", "web"));
        state.filter = Some("country IN ('DE')".into());
        let config = resolve_config(&state).unwrap();
        assert_eq!(
            config.where_filter,
            Some(Expr::And {
                exprs: vec![
                    Expr::eq("channel", "web"),
                    Expr::in_list("country", vec![PivotValue::from("DE")]),
                ]
            })
        );

        state.filter = Some("country IN (".into());
        assert!(matches!(resolve_config(&state), Err(PivotError::Filter(_))));
    }

    #[test]
    fn test_time_bucket_filters() {
        let dim = PivotDimension::time_bucket("created_at", TimeGrain::Month);
        assert_eq!(
            dim.equals_filter(&PivotValue::from("2024-02-01")),
            Expr::And {
                exprs: vec![
                    Expr::compare("created_at", crate::expr::CompareOp::Ge, "2024-02-01"),
                    Expr::compare("created_at", crate::expr::CompareOp::Lt, "2024-03-01"),
                ]
            }
        );
        let request = dim.to_request("UTC");
        assert_eq!(request.output_name(), "created_at__month");
    }

    #[test]
    fn test_settings_from_lookup() {
        let settings = EngineSettings::from_lookup(|name| match name {
            "PIVOT_ROWS_PER_PAGE" => Some("25".to_string()),
            "PIVOT_MAX_VIEWS" => Some("8".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(settings.rows_per_page, 25);
        assert_eq!(settings.max_views, 8);
        assert_eq!(settings.axis_limit, 100);

        let err = EngineSettings::from_lookup(|_| Some("many".to_string())).unwrap_err();
        assert!(matches!(err, PivotError::Setting { .. }));
    }
}

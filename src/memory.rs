/// Memory Service - In-Process Aggregation Backend
///
/// A complete `AggregationService` over rows held in memory. It serves the
/// demo server, the benches and the tests, and doubles as the reference for
/// what the engine expects from a real analytical backend:
///
/// - groups appear in the order their first row appears, then a stable sort
///   by the request's sort keys (nulls last) is applied, then offset/limit
/// - a request without dimensions always returns exactly one row
/// - time-bucketed dimensions are reported under their alias
/// - comparison measures are aggregated over the comparison range, matched to
///   groups of the base range by dimension values, and reported as `<m>_prev`
///
/// # Dataset format
///
/// ```json
/// {
///   "timeColumn": "created_at",
///   "measures": [{ "name": "revenue", "aggregation": "sum", "column": "revenue" }],
///   "dimensions": [{ "name": "country" }],
///   "rows": [{ "country": "DE", "created_at": "2024-01-15", "revenue": 100 }]
/// }
/// ```

use crate::cells::cell_key;
use crate::config::{DashboardState, DimensionSpec, MeasureFormat, MeasureSpec};
use crate::error::{PivotError, Result, ServiceError};
use crate::expr::{eval_expr, extract_columns};
use crate::service::{AggregationRequest, AggregationResponse, AggregationRow, AggregationService, SortRef};
use crate::timegrain::TimeRange;
use crate::value::PivotValue;
use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

const DEMO_DATASET: &str = include_str!("../data/sales.json");

pub type DataRow = HashMap<String, PivotValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Sum,
    Count,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureDefinition {
    pub name: String,
    pub aggregation: Aggregation,
    /// Source column. `count` without a column counts rows.
    #[serde(default)]
    pub column: Option<String>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub format: MeasureFormat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dataset {
    #[serde(default)]
    pub time_column: Option<String>,
    pub measures: Vec<MeasureDefinition>,
    pub dimensions: Vec<DimensionSpec>,
    #[serde(default)]
    pub rows: Vec<DataRow>,
}

impl Dataset {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

pub struct MemoryService {
    dataset: Dataset,
    /// Columns a filter may reference.
    columns: HashSet<String>,
    requests: AtomicUsize,
}

impl MemoryService {
    pub fn new(dataset: Dataset) -> Result<Self> {
        let mut names = HashSet::new();
        for measure in &dataset.measures {
            if !names.insert(measure.name.as_str()) {
                return Err(PivotError::Dataset(format!("duplicate measure '{}'", measure.name)));
            }
            if measure.column.is_none() && measure.aggregation != Aggregation::Count {
                return Err(PivotError::Dataset(format!(
                    "measure '{}' needs a column for {:?}",
                    measure.name, measure.aggregation
                )));
            }
        }

        let columns = dataset
            .dimensions
            .iter()
            .map(|d| d.name.clone())
            .chain(dataset.time_column.clone())
            .chain(dataset.measures.iter().filter_map(|m| m.column.clone()))
            .collect();

        Ok(MemoryService {
            dataset,
            columns,
            requests: AtomicUsize::new(0),
        })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Self::new(Dataset::from_json(json)?)
    }

    /// The bundled sales dataset.
    pub fn demo() -> Result<Self> {
        Self::from_json(DEMO_DATASET)
    }

    pub fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Number of aggregation requests served.
    pub fn request_count(&self) -> usize {
        self.requests.load(AtomicOrdering::SeqCst)
    }

    pub fn measure_specs(&self) -> Vec<MeasureSpec> {
        self.dataset
            .measures
            .iter()
            .map(|m| MeasureSpec {
                name: m.name.clone(),
                label: m.label.clone(),
                format: m.format,
            })
            .collect()
    }

    pub fn dimension_specs(&self) -> Vec<DimensionSpec> {
        self.dataset.dimensions.clone()
    }

    pub fn time_dimension(&self) -> Option<&str> {
        self.dataset.time_column.as_deref()
    }

    /// Fill in whatever catalogue the dashboard state leaves out.
    pub fn fill_catalogue(&self, state: &mut DashboardState) {
        if state.measures.is_empty() {
            state.measures = self.measure_specs();
        }
        if state.dimensions.is_empty() {
            state.dimensions = self.dimension_specs();
        }
        if state.time.time_dimension.is_none() {
            state.time.time_dimension = self.dataset.time_column.clone();
        }
    }

    fn measure(&self, name: &str) -> std::result::Result<&MeasureDefinition, ServiceError> {
        self.dataset
            .measures
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| ServiceError::UnknownMeasure(name.to_string()))
    }

    fn in_range(&self, row: &DataRow, range: Option<&TimeRange>) -> bool {
        match (range, &self.dataset.time_column) {
            (Some(range), Some(column)) => row.get(column).map(|v| range.contains(v)).unwrap_or(false),
            _ => true,
        }
    }

    /// Group the rows of a time range, in first-appearance order.
    fn group<'a>(
        &'a self,
        request: &AggregationRequest,
        range: Option<&TimeRange>,
    ) -> (Vec<(String, Vec<PivotValue>)>, HashMap<String, Vec<&'a DataRow>>) {
        let mut order = Vec::new();
        let mut groups: HashMap<String, Vec<&DataRow>> = HashMap::new();
        for row in &self.dataset.rows {
            if !self.in_range(row, range) {
                continue;
            }
            if let Some(filter) = &request.where_filter {
                if !eval_expr(filter, row) {
                    continue;
                }
            }
            let values: Vec<PivotValue> = request
                .dimensions
                .iter()
                .map(|d| {
                    let raw = row.get(&d.name).cloned().unwrap_or_default();
                    match d.time_grain {
                        Some(grain) => grain.bucket(&raw),
                        None => raw,
                    }
                })
                .collect();
            let key = cell_key(&values);
            groups
                .entry(key.clone())
                .or_insert_with(|| {
                    order.push((key, values));
                    Vec::new()
                })
                .push(row);
        }
        (order, groups)
    }

    fn validate(&self, request: &AggregationRequest) -> std::result::Result<HashSet<String>, ServiceError> {
        let mut outputs = HashSet::new();
        for dimension in &request.dimensions {
            let known = self.dataset.dimensions.iter().any(|d| d.name == dimension.name)
                || self.dataset.time_column.as_deref() == Some(dimension.name.as_str());
            if !known {
                return Err(ServiceError::UnknownDimension(dimension.name.clone()));
            }
            outputs.insert(dimension.output_name().to_string());
        }
        for measure in &request.measures {
            self.measure(&measure.name)?;
            outputs.insert(measure.output_name());
        }
        if let Some(filter) = &request.where_filter {
            if let Some(column) = extract_columns(filter).into_iter().find(|c| !self.columns.contains(c)) {
                return Err(ServiceError::UnknownColumn(column));
            }
        }
        if let Some(sort) = request.sort.iter().find(|s| !outputs.contains(&s.name)) {
            return Err(ServiceError::UnknownColumn(sort.name.clone()));
        }
        Ok(outputs)
    }

    fn execute(&self, request: &AggregationRequest) -> std::result::Result<AggregationResponse, ServiceError> {
        self.validate(request)?;

        let (mut order, groups) = self.group(request, request.time_range.as_ref());
        if request.dimensions.is_empty() && order.is_empty() {
            order.push((String::new(), Vec::new()));
        }

        let wants_comparison = request.measures.iter().any(|m| m.is_comparison);
        let previous = match (&request.comparison_time_range, wants_comparison) {
            (Some(range), true) => Some(self.group(request, Some(range)).1),
            _ => None,
        };

        let mut data = Vec::with_capacity(order.len());
        for (key, values) in order {
            let mut out = AggregationRow::new();
            for (dimension, value) in request.dimensions.iter().zip(values) {
                out.insert(dimension.output_name().to_string(), value);
            }
            for measure in &request.measures {
                let definition = self.measure(&measure.name)?;
                let rows: &[&DataRow] = if measure.is_comparison {
                    previous
                        .as_ref()
                        .and_then(|p| p.get(&key))
                        .map(Vec::as_slice)
                        .unwrap_or(&[])
                } else {
                    groups.get(&key).map(Vec::as_slice).unwrap_or(&[])
                };
                let value = if measure.is_comparison && previous.is_none() {
                    PivotValue::Null
                } else {
                    aggregate(definition, rows)
                };
                out.insert(measure.output_name(), value);
            }
            data.push(out);
        }

        sort_rows(&mut data, &request.sort);

        let data: Vec<AggregationRow> = match request.limit {
            0 => data.into_iter().skip(request.offset).collect(),
            limit => data.into_iter().skip(request.offset).take(limit).collect(),
        };
        Ok(AggregationResponse { data })
    }
}

#[async_trait(?Send)]
impl AggregationService for MemoryService {
    async fn aggregate(&self, request: &AggregationRequest) -> std::result::Result<AggregationResponse, ServiceError> {
        self.requests.fetch_add(1, AtomicOrdering::SeqCst);
        let response = self.execute(request)?;
        debug!(
            "memory service: {} dimensions, {} measures -> {} rows",
            request.dimensions.len(),
            request.measures.len(),
            response.data.len()
        );
        Ok(response)
    }
}

/// Aggregate one measure over a group. Empty input gives `Null`, except for
/// `count` which gives zero. Sums of integers stay integers.
fn aggregate(measure: &MeasureDefinition, rows: &[&DataRow]) -> PivotValue {
    let values = || {
        rows.iter().filter_map(move |row| match &measure.column {
            Some(column) => row.get(column).filter(|v| !v.is_null()),
            None => None,
        })
    };

    match measure.aggregation {
        Aggregation::Count => match &measure.column {
            Some(_) => PivotValue::Int64(values().count() as i64),
            None => PivotValue::Int64(rows.len() as i64),
        },
        Aggregation::Sum => {
            let mut int_total: Option<i64> = Some(0);
            let mut float_total = 0.0;
            let mut seen = false;
            for value in values() {
                if let Some(x) = value.as_f64() {
                    seen = true;
                    float_total += x;
                    int_total = match (int_total, value) {
                        (Some(total), PivotValue::Int64(v)) => total.checked_add(*v),
                        _ => None,
                    };
                }
            }
            match (seen, int_total) {
                (false, _) => PivotValue::Null,
                (true, Some(total)) => PivotValue::Int64(total),
                (true, None) => PivotValue::Float64(float_total),
            }
        }
        Aggregation::Avg => {
            let numbers: Vec<f64> = values().filter_map(PivotValue::as_f64).collect();
            if numbers.is_empty() {
                PivotValue::Null
            } else {
                PivotValue::Float64(numbers.iter().sum::<f64>() / numbers.len() as f64)
            }
        }
        Aggregation::Min => values()
            .min_by(|a, b| a.compare(b))
            .cloned()
            .unwrap_or_default(),
        Aggregation::Max => values()
            .max_by(|a, b| a.compare(b))
            .cloned()
            .unwrap_or_default(),
    }
}

/// Stable multi-key sort. Nulls go last in either direction.
fn sort_rows(rows: &mut [AggregationRow], sort: &[SortRef]) {
    if sort.is_empty() {
        return;
    }
    let null = PivotValue::Null;
    rows.sort_by(|a, b| {
        for key in sort {
            let x = a.get(&key.name).unwrap_or(&null);
            let y = b.get(&key.name).unwrap_or(&null);
            let ordering = match (x.is_null(), y.is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) if key.desc => y.compare(x),
                (false, false) => x.compare(y),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

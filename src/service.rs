/// Aggregation Service Boundary
///
/// Every stage of the pivot pipeline talks to the analytical backend through
/// one request shape: a grouped aggregation with dimensions, measures, a
/// filter, sort keys, optional time ranges and a limit/offset window.
/// Requests are plain data and serialise deterministically, which makes them
/// usable as cache keys.

use crate::error::ServiceError;
use crate::expr::Expr;
use crate::timegrain::{TimeGrain, TimeRange};
use crate::value::PivotValue;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Suffix under which the service returns the comparison-period value of a
/// measure requested with `is_comparison`.
pub const COMPARISON_VALUE_SUFFIX: &str = "_prev";

/// One row of an aggregation response: output name → value.
pub type AggregationRow = BTreeMap<String, PivotValue>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasureRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_comparison: bool,
}

impl MeasureRef {
    pub fn base(name: impl Into<String>) -> Self {
        MeasureRef {
            name: name.into(),
            is_comparison: false,
        }
    }

    pub fn comparison(name: impl Into<String>) -> Self {
        MeasureRef {
            name: name.into(),
            is_comparison: true,
        }
    }

    /// Key of this measure's value in response rows.
    pub fn output_name(&self) -> String {
        if self.is_comparison {
            format!("{}{}", self.name, COMPARISON_VALUE_SUFFIX)
        } else {
            self.name.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DimensionRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_grain: Option<TimeGrain>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl DimensionRef {
    pub fn plain(name: impl Into<String>) -> Self {
        DimensionRef {
            name: name.into(),
            time_grain: None,
            time_zone: None,
            alias: None,
        }
    }

    /// Key of this dimension's value in response rows.
    pub fn output_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortRef {
    pub name: String,
    pub desc: bool,
}

impl SortRef {
    pub fn asc(name: impl Into<String>) -> Self {
        SortRef { name: name.into(), desc: false }
    }

    pub fn desc(name: impl Into<String>) -> Self {
        SortRef { name: name.into(), desc: true }
    }
}

/// A grouped aggregation request.
///
/// `limit == 0` means unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregationRequest {
    pub measures: Vec<MeasureRef>,
    pub dimensions: Vec<DimensionRef>,
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub where_filter: Option<Expr>,
    #[serde(default)]
    pub sort: Vec<SortRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison_time_range: Option<TimeRange>,
    pub limit: usize,
    pub offset: usize,
}

impl AggregationRequest {
    /// Deterministic key identifying this request in the result cache.
    pub fn cache_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregationResponse {
    pub data: Vec<AggregationRow>,
}

/// The analytical backend that executes grouped aggregations.
///
/// Futures are not required to be `Send`: the engine drives every query on
/// the caller's task.
#[async_trait(?Send)]
pub trait AggregationService {
    async fn aggregate(&self, request: &AggregationRequest) -> Result<AggregationResponse, ServiceError>;
}

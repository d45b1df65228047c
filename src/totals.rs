/// Totals Resolution
///
/// Two queries are issued side by side: the grand total over no dimensions
/// (denominator for percent-of-total and the measure columns of the totals
/// row), and the totals per column-value combination over the column
/// dimensions only. The second one also decides which column combinations
/// carry any data at all.

use crate::axes::grouped_request;
use crate::config::{EngineSettings, PivotConfig};
use crate::query::{QueryClient, Stage};
use crate::service::{AggregationRequest, AggregationRow, AggregationService};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Totals {
    /// The single grand-total row.
    pub global: AggregationRow,
    /// One row per non-empty column combination.
    pub by_column: Vec<AggregationRow>,
}

pub fn global_totals_request(config: &PivotConfig) -> AggregationRequest {
    grouped_request(
        config,
        Vec::new(),
        config.request_measures(),
        config.where_filter.clone(),
        Vec::new(),
        1,
        0,
    )
}

pub fn column_totals_request(config: &PivotConfig, settings: &EngineSettings) -> AggregationRequest {
    grouped_request(
        config,
        config.col_dimensions.iter().map(|d| d.to_request(&config.time_zone)).collect(),
        config.request_measures(),
        config.where_filter.clone(),
        Vec::new(),
        settings.cell_query_limit,
        0,
    )
}

/// Issue both totals queries. Without column dimensions only the grand
/// total is queried.
pub fn resolve_totals<S: AggregationService>(
    client: &mut QueryClient<S>,
    config: &PivotConfig,
    settings: &EngineSettings,
) -> Stage<Totals> {
    let global = client
        .query(global_totals_request(config))
        .map(|response| response.data.first().cloned().unwrap_or_default());

    let by_column = if config.col_dimensions.is_empty() {
        Stage::Ready(Vec::new())
    } else {
        client
            .query(column_totals_request(config, settings))
            .map(|response| response.data.clone())
    };

    global
        .zip(by_column)
        .map(|(global, by_column)| Totals { global, by_column })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::fixtures;
    use crate::value::PivotValue;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_both_queries_are_issued_together() {
        let config = fixtures::config(&["country"], &["channel"], &["revenue"]);
        let settings = EngineSettings::default();
        let mut client = QueryClient::new(Arc::new(fixtures::sales()), 16);

        assert!(resolve_totals(&mut client, &config, &settings).is_fetching());
        assert_eq!(client.pending_count(), 2);
        client.settle().await;

        let totals = resolve_totals(&mut client, &config, &settings).ready().unwrap();
        assert_eq!(totals.global["revenue"], PivotValue::Int64(770));
        assert_eq!(totals.by_column.len(), 2);
    }

    #[tokio::test]
    async fn test_no_column_dimensions() {
        let config = fixtures::config(&["country"], &[], &["revenue"]);
        let settings = EngineSettings::default();
        let mut client = QueryClient::new(Arc::new(fixtures::sales()), 16);

        let _ = resolve_totals(&mut client, &config, &settings);
        assert_eq!(client.pending_count(), 1);
        client.settle().await;
        let totals = resolve_totals(&mut client, &config, &settings).ready().unwrap();
        assert!(totals.by_column.is_empty());
    }
}

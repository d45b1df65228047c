//! LivePivot - Pivot Table Data Assembly
//!
//! Turns a dashboard's pivot configuration (row dimensions, column
//! dimensions, measures, filters, time range, sort, pagination, expanded
//! rows) into a renderable table: a nested column definition plus rows of
//! aggregated values and a totals row. All numbers come from an
//! asynchronous [`AggregationService`]; the engine only plans requests,
//! caches their results and assembles what comes back.
//!
//! ```
//! use livepivot::{resolve_config, DashboardState, EngineSettings, MemoryService, PivotChip, PivotEngine};
//! use std::sync::Arc;
//!
//! # fn main() -> livepivot::Result<()> {
//! let service = Arc::new(MemoryService::demo()?);
//! let mut dashboard = DashboardState::default();
//! service.fill_catalogue(&mut dashboard);
//! dashboard.pivot.rows.push(PivotChip::Dimension { name: "country".into() });
//! dashboard.pivot.columns.push(PivotChip::Measure { name: "revenue".into(), percent_of_total: false });
//!
//! let config = resolve_config(&dashboard)?;
//! let mut engine = PivotEngine::new(service, EngineSettings::default());
//! let state = futures::executor::block_on(engine.load(&config));
//! assert!(state.assembled);
//! assert_eq!(state.data.len(), 5);
//! # Ok(())
//! # }
//! ```

pub mod value;
pub mod error;
pub mod expr;
pub mod timegrain;
pub mod service;
pub mod query;
pub mod config;
pub mod fingerprint;
pub mod sort;
pub mod axes;
pub mod totals;
pub mod cells;
pub mod column_def;
pub mod assemble;
pub mod expansion;
pub mod engine;
pub mod memory;
pub mod messages;
pub mod views;

pub use value::{PivotValue, Sentinel};
pub use error::{ExprError, PivotError, Result, ServiceError};
pub use timegrain::{TimeGrain, TimeRange};
pub use service::{AggregationRequest, AggregationResponse, AggregationRow, AggregationService, DimensionRef, MeasureRef, SortRef};
pub use query::{QueryClient, Stage};
pub use config::{
    resolve_config, DashboardState, EngineSettings, PivotChip, PivotConfig, PivotDimension, PivotMeasure, PivotState,
    RowPath, SortSpec, TimeControls,
};
pub use fingerprint::Fingerprint;
pub use column_def::{ColumnDef, ColumnKind};
pub use assemble::PivotDataRow;
pub use expansion::ExpansionStatus;
pub use engine::{PivotDataState, PivotEngine};
pub use memory::{Dataset, MemoryService};
pub use messages::{ClientMessage, ServerMessage};
pub use views::ViewRegistry;

// HTTP server - only when server feature is enabled
#[cfg(feature = "server")]
pub mod server;

#[cfg(test)]
mod integration_tests {
    use super::*;
    use std::sync::Arc;

    fn dashboard(service: &MemoryService) -> DashboardState {
        let mut dashboard = DashboardState::default();
        service.fill_catalogue(&mut dashboard);
        dashboard.time.range = Some(TimeRange::new("2024-01-01", "2025-01-01"));
        dashboard
    }

    #[tokio::test]
    async fn test_complete_workflow() {
        let service = Arc::new(MemoryService::demo().unwrap());
        let mut dashboard = dashboard(&service);
        dashboard.filter = Some("channel == 'web'".into());
        dashboard.pivot.rows.push(PivotChip::Dimension { name: "country".into() });
        dashboard.pivot.columns.push(PivotChip::Time { grain: TimeGrain::Month });
        dashboard.pivot.columns.push(PivotChip::Measure {
            name: "revenue".into(),
            percent_of_total: false,
        });

        let config = resolve_config(&dashboard).unwrap();
        let mut engine = PivotEngine::new(service, EngineSettings::default());
        let state = engine.load(&config).await;

        assert!(state.assembled);
        assert!(!state.is_fetching);
        assert!(state.error.is_none());

        // Row header, row totals, then one group per month.
        let headers: Vec<&str> = state.column_def.iter().map(|c| c.header.as_str()).collect();
        assert_eq!(headers, vec!["Country", "Revenue", "2024-01-01", "2024-02-01", "2024-03-01"]);
        assert_eq!(state.total_columns, 4);

        let countries: Vec<String> = state.data.iter().map(|r| r.get("country").unwrap().key()).collect();
        assert_eq!(countries, vec!["US", "DE", "FR", "ES"]);

        let us = &state.data[0];
        assert_eq!(us.get("revenue"), Some(&PivotValue::Int64(300)));
        assert_eq!(us.get("c0v0m0"), Some(&PivotValue::Null));
        assert_eq!(us.get("c0v2m0"), Some(&PivotValue::Int64(300)));

        let totals = &state.totals_row_data.as_ref().unwrap()[0];
        assert_eq!(totals.get("country"), Some(&PivotValue::from("Total")));
        assert_eq!(totals.get("revenue"), Some(&PivotValue::Int64(560)));
        assert_eq!(totals.get("c0v0m0"), Some(&PivotValue::Int64(180)));
        assert_eq!(totals.get("c0v1m0"), Some(&PivotValue::Int64(80)));
    }

    #[tokio::test]
    async fn test_comparison_with_expanded_rows() {
        let service = Arc::new(MemoryService::demo().unwrap());
        let mut dashboard = dashboard(&service);
        dashboard.time.comparison_range = Some(TimeRange::new("2023-01-01", "2024-01-01"));
        dashboard.pivot.enable_comparison = true;
        dashboard.pivot.rows.push(PivotChip::Dimension { name: "country".into() });
        dashboard.pivot.rows.push(PivotChip::Dimension { name: "city".into() });
        dashboard.pivot.columns.push(PivotChip::Measure {
            name: "revenue".into(),
            percent_of_total: false,
        });
        dashboard.pivot.expanded.insert(vec!["DE".to_string()]);

        let config = resolve_config(&dashboard).unwrap();
        let mut engine = PivotEngine::new(service, EngineSettings::default());
        let state = engine.load(&config).await;
        assert_eq!(engine.expansion_status(&vec!["DE".to_string()]), ExpansionStatus::Expanded);

        let de = state.data.iter().find(|r| r.get("country") == Some(&"DE".into())).unwrap();
        assert_eq!(de.get("revenue_delta"), Some(&PivotValue::Int64(60)));

        let cities = de.sub_rows.as_ref().unwrap();
        assert_eq!(cities.len(), 2);
        assert_eq!(cities[0].get("country"), Some(&"Berlin".into()));
        assert_eq!(cities[0].get("revenue_delta"), Some(&PivotValue::Int64(10)));
        assert_eq!(cities[1].get("country"), Some(&"Munich".into()));
        assert_eq!(
            cities[1].get("revenue_pct"),
            Some(&PivotValue::Sentinel(Sentinel::PriorValueMissing))
        );

        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["columnDef"][0]["header"], "Country > City");
        assert!(json["data"][0]["subRows"].is_array());
    }

    #[tokio::test]
    async fn test_message_round() {
        let service = Arc::new(MemoryService::demo().unwrap());
        let mut registry = ViewRegistry::new(Arc::clone(&service), EngineSettings::default());

        let json = r#"{
            "type": "Load",
            "view": "main",
            "dashboard": {
                "pivot": {
                    "rows": [{"type": "dimension", "name": "channel"}],
                    "columns": [{"type": "measure", "name": "orders"}],
                    "sorting": {"id": "orders", "desc": false}
                }
            }
        }"#;
        let mut msg: ClientMessage = serde_json::from_str(json).unwrap();
        if let Some(dashboard) = msg.dashboard_mut() {
            service.fill_catalogue(dashboard);
        }

        match registry.handle(msg).await {
            ServerMessage::PivotData { state, .. } => {
                let channels: Vec<String> = state.data.iter().map(|r| r.get("channel").unwrap().key()).collect();
                // All years: store 4 orders, web 6.
                assert_eq!(channels, vec!["store", "web"]);
            }
            other => panic!("unexpected reply: {:?}", other),
        }
    }
}

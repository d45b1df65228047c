/// Message types exchanged with pivot clients
use serde::{Deserialize, Serialize};

use crate::config::DashboardState;
use crate::engine::PivotDataState;

/// Messages sent from client to server
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Evaluate a view against the given dashboard state
    Load {
        view: String,
        dashboard: DashboardState,
    },

    /// Re-issue failed queries of a view, then evaluate it
    Retry {
        view: String,
        dashboard: DashboardState,
    },

    /// Drop a view and everything cached for it
    Dispose { view: String },
}

impl ClientMessage {
    pub fn view(&self) -> &str {
        match self {
            ClientMessage::Load { view, .. }
            | ClientMessage::Retry { view, .. }
            | ClientMessage::Dispose { view } => view,
        }
    }

    pub fn dashboard_mut(&mut self) -> Option<&mut DashboardState> {
        match self {
            ClientMessage::Load { dashboard, .. } | ClientMessage::Retry { dashboard, .. } => Some(dashboard),
            ClientMessage::Dispose { .. } => None,
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Table for a view
    PivotData {
        view: String,
        state: PivotDataState,
    },

    /// View dropped
    Disposed { view: String },

    /// Error occurred
    Error { message: String },
}

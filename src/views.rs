/// Registry of live pivot views
///
/// Each view owns one [`PivotEngine`], so views never share cached results
/// or retained state. Disposing a view drops its engine. Beyond
/// `EngineSettings::max_views` live views, the least recently used one is
/// dropped as well.

use log::{debug, info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use crate::config::{resolve_config, EngineSettings};
use crate::engine::PivotEngine;
use crate::messages::{ClientMessage, ServerMessage};
use crate::service::AggregationService;

pub struct ViewRegistry<S> {
    service: Arc<S>,
    settings: EngineSettings,
    views: HashMap<String, PivotEngine<S>>,
    /// View ids from least to most recently used.
    recency: VecDeque<String>,
}

impl<S: AggregationService> ViewRegistry<S> {
    pub fn new(service: Arc<S>, settings: EngineSettings) -> Self {
        Self {
            service,
            settings,
            views: HashMap::new(),
            recency: VecDeque::new(),
        }
    }

    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    pub fn contains(&self, view: &str) -> bool {
        self.views.contains_key(view)
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    fn touch(&mut self, view: &str) {
        if let Some(pos) = self.recency.iter().position(|v| v == view) {
            self.recency.remove(pos);
        }
        self.recency.push_back(view.to_string());
    }

    fn engine(&mut self, view: &str) -> &mut PivotEngine<S> {
        if !self.views.contains_key(view) {
            info!("pivot view created: {}", view);
        }
        self.touch(view);
        while self.views.len() >= self.settings.max_views.max(1) && !self.views.contains_key(view) {
            let oldest = match self.recency.pop_front() {
                Some(oldest) => oldest,
                None => break,
            };
            if self.views.remove(&oldest).is_some() {
                info!("pivot view evicted: {}", oldest);
            }
        }
        self.views
            .entry(view.to_string())
            .or_insert_with(|| PivotEngine::new(Arc::clone(&self.service), self.settings.clone()))
    }

    /// Handle one client message and produce the reply.
    pub async fn handle(&mut self, msg: ClientMessage) -> ServerMessage {
        match msg {
            ClientMessage::Load { view, dashboard } => {
                let state = match resolve_config(&dashboard) {
                    Ok(config) => self.engine(&view).load(&config).await,
                    Err(err) => {
                        warn!("invalid dashboard for view {}: {}", view, err);
                        return ServerMessage::Error { message: err.to_string() };
                    }
                };
                ServerMessage::PivotData { view, state }
            }

            ClientMessage::Retry { view, dashboard } => {
                let config = match resolve_config(&dashboard) {
                    Ok(config) => config,
                    Err(err) => return ServerMessage::Error { message: err.to_string() },
                };
                let engine = self.engine(&view);
                let retried = engine.retry_failed();
                debug!("view {}: retrying {} failed queries", view, retried);
                let state = engine.load(&config).await;
                ServerMessage::PivotData { view, state }
            }

            ClientMessage::Dispose { view } => {
                self.recency.retain(|v| v != &view);
                if self.views.remove(&view).is_some() {
                    info!("pivot view disposed: {}", view);
                }
                ServerMessage::Disposed { view }
            }
        }
    }
}

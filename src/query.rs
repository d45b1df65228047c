/// Query Client - Request-Keyed Result Cache
///
/// Every pipeline stage issues its queries through a `QueryClient`. The
/// client never blocks: `query()` returns the current state of a request and,
/// the first time it sees a request, queues it as pending. The owner then
/// calls `settle()` to run all pending requests concurrently against the
/// aggregation service and store their results.
///
/// # Staleness
///
/// Results are stored by request key. A stage only reads keys derived from
/// the configuration it is evaluating, so results of queries issued for an
/// older configuration simply sit in the cache and are never merged into the
/// current table. There is no cancellation.
///
/// # De-duplication
///
/// Identical requests share one cache slot; a request already pending or
/// resolved is never queued twice.

use crate::error::ServiceError;
use crate::service::{AggregationRequest, AggregationResponse, AggregationService};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use log::{debug, trace, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Result of evaluating one pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage<T> {
    /// At least one query the stage depends on has not resolved.
    Fetching,
    Ready(T),
    /// A query the stage depends on failed. Persistent until retried.
    Failed(ServiceError),
}

impl<T> Stage<T> {
    pub fn is_fetching(&self) -> bool {
        matches!(self, Stage::Fetching)
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Stage::Ready(_))
    }

    pub fn ready(self) -> Option<T> {
        match self {
            Stage::Ready(v) => Some(v),
            _ => None,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Stage<U> {
        match self {
            Stage::Fetching => Stage::Fetching,
            Stage::Ready(v) => Stage::Ready(f(v)),
            Stage::Failed(e) => Stage::Failed(e),
        }
    }

    /// Combine two stages: failure wins over fetching, both must be ready.
    pub fn zip<U>(self, other: Stage<U>) -> Stage<(T, U)> {
        match (self, other) {
            (Stage::Failed(e), _) | (_, Stage::Failed(e)) => Stage::Failed(e),
            (Stage::Ready(a), Stage::Ready(b)) => Stage::Ready((a, b)),
            _ => Stage::Fetching,
        }
    }
}

/// Fan-in a set of stages: all must be ready for the result to be ready.
pub fn all_ready<T>(stages: Vec<Stage<T>>) -> Stage<Vec<T>> {
    let mut values = Vec::with_capacity(stages.len());
    let mut fetching = false;
    for stage in stages {
        match stage {
            Stage::Failed(e) => return Stage::Failed(e),
            Stage::Fetching => fetching = true,
            Stage::Ready(v) => values.push(v),
        }
    }
    if fetching {
        Stage::Fetching
    } else {
        Stage::Ready(values)
    }
}

/// State of a single cached request.
#[derive(Debug, Clone)]
enum Slot {
    Pending,
    Ready(Arc<AggregationResponse>),
    Failed(ServiceError),
}

pub struct QueryClient<S> {
    service: Arc<S>,
    slots: HashMap<String, Slot>,
    /// Requests registered but not yet sent, in registration order.
    pending: Vec<(String, AggregationRequest)>,
    /// Insertion order of slots, for eviction.
    order: VecDeque<String>,
    capacity: usize,
    issued: usize,
}

impl<S: AggregationService> QueryClient<S> {
    pub fn new(service: Arc<S>, capacity: usize) -> Self {
        QueryClient {
            service,
            slots: HashMap::new(),
            pending: Vec::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            issued: 0,
        }
    }

    pub fn service(&self) -> &Arc<S> {
        &self.service
    }

    /// Current state of `request`, registering it as pending if unseen.
    pub fn query(&mut self, request: AggregationRequest) -> Stage<Arc<AggregationResponse>> {
        let key = request.cache_key();
        match self.slots.get(&key) {
            Some(Slot::Ready(response)) => {
                trace!("query cache hit: {}", key);
                Stage::Ready(Arc::clone(response))
            }
            Some(Slot::Failed(err)) => Stage::Failed(err.clone()),
            Some(Slot::Pending) => Stage::Fetching,
            None => {
                debug!("query registered: {}", key);
                self.slots.insert(key.clone(), Slot::Pending);
                self.order.push_back(key.clone());
                self.pending.push((key, request));
                Stage::Fetching
            }
        }
    }

    /// Number of registered requests not yet sent to the service.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_requests(&self) -> impl Iterator<Item = &AggregationRequest> {
        self.pending.iter().map(|(_, request)| request)
    }

    /// Total number of requests sent to the service.
    pub fn issued_count(&self) -> usize {
        self.issued
    }

    /// Run every pending request concurrently and store the results.
    /// Returns the number of requests resolved.
    pub async fn settle(&mut self) -> usize {
        self.settle_where(|_| true).await
    }

    /// Run only the pending requests matching `select`, leaving the rest
    /// pending. Lets callers resolve queries in any order.
    pub async fn settle_where<F>(&mut self, select: F) -> usize
    where
        F: Fn(&AggregationRequest) -> bool,
    {
        let (batch, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|(_, request)| select(request));
        self.pending = rest;

        if batch.is_empty() {
            return 0;
        }

        let resolved = batch.len();
        self.issued += resolved;

        // Results are stored in completion order.
        let mut in_flight: FuturesUnordered<_> = batch
            .into_iter()
            .map(|(key, request)| {
                let service = Arc::clone(&self.service);
                async move {
                    let result = service.aggregate(&request).await;
                    (key, result)
                }
            })
            .collect();

        while let Some((key, result)) = in_flight.next().await {
            let slot = match result {
                Ok(response) => {
                    debug!("query resolved: {} ({} rows)", key, response.data.len());
                    Slot::Ready(Arc::new(response))
                }
                Err(err) => {
                    warn!("query failed: {}: {}", key, err);
                    Slot::Failed(err)
                }
            };
            self.slots.insert(key, slot);
        }

        self.evict();
        resolved
    }

    /// Forget failed results so the next evaluation queries them again.
    pub fn retry_failed(&mut self) -> usize {
        let failed: Vec<String> = self
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Failed(_)))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &failed {
            self.slots.remove(key);
        }
        self.order.retain(|key| self.slots.contains_key(key));
        failed.len()
    }

    /// Drop every cached result and pending request.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.pending.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Evict the oldest settled slots beyond capacity. Pending slots stay.
    fn evict(&mut self) {
        let mut skipped = VecDeque::new();
        while self.slots.len() > self.capacity {
            let key = match self.order.pop_front() {
                Some(key) => key,
                None => break,
            };
            match self.slots.get(&key) {
                Some(Slot::Pending) => skipped.push_back(key),
                Some(_) => {
                    trace!("query evicted: {}", key);
                    self.slots.remove(&key);
                }
                None => {}
            }
        }
        while let Some(key) = skipped.pop_back() {
            self.order.push_front(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{DimensionRef, MeasureRef};
    use async_trait::async_trait;
    use std::cell::Cell;

    struct CountingService {
        calls: Cell<usize>,
        fail_on: Option<String>,
    }

    #[async_trait(?Send)]
    impl AggregationService for CountingService {
        async fn aggregate(&self, request: &AggregationRequest) -> Result<AggregationResponse, ServiceError> {
            self.calls.set(self.calls.get() + 1);
            let dim = request.dimensions[0].name.clone();
            if Some(&dim) == self.fail_on.as_ref() {
                return Err(ServiceError::Backend("boom".to_string()));
            }
            let mut row = crate::service::AggregationRow::new();
            row.insert(dim, "x".into());
            Ok(AggregationResponse { data: vec![row] })
        }
    }

    fn request(dim: &str) -> AggregationRequest {
        AggregationRequest {
            measures: vec![MeasureRef::base("m")],
            dimensions: vec![DimensionRef::plain(dim)],
            where_filter: None,
            sort: vec![],
            time_range: None,
            comparison_time_range: None,
            limit: 10,
            offset: 0,
        }
    }

    fn client(fail_on: Option<&str>) -> QueryClient<CountingService> {
        QueryClient::new(
            Arc::new(CountingService {
                calls: Cell::new(0),
                fail_on: fail_on.map(str::to_string),
            }),
            16,
        )
    }

    #[tokio::test]
    async fn test_identical_requests_are_deduplicated() {
        let mut client = client(None);
        assert!(client.query(request("a")).is_fetching());
        assert!(client.query(request("a")).is_fetching());
        assert_eq!(client.pending_count(), 1);

        assert_eq!(client.settle().await, 1);
        assert!(client.query(request("a")).is_ready());
        assert_eq!(client.service().calls.get(), 1);
        assert_eq!(client.settle().await, 0);
    }

    #[tokio::test]
    async fn test_settle_where_resolves_out_of_order() {
        let mut client = client(None);
        client.query(request("a"));
        client.query(request("b"));

        assert_eq!(client.settle_where(|r| r.dimensions[0].name == "b").await, 1);
        assert!(client.query(request("a")).is_fetching());
        assert!(client.query(request("b")).is_ready());
        assert_eq!(client.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_failures_persist_until_retried() {
        let mut client = client(Some("bad"));
        client.query(request("bad"));
        client.settle().await;

        assert!(matches!(client.query(request("bad")), Stage::Failed(_)));
        assert_eq!(client.pending_count(), 0);

        assert_eq!(client.retry_failed(), 1);
        assert!(client.query(request("bad")).is_fetching());
        assert_eq!(client.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_batch_results_land_in_their_own_slots() {
        let mut client = client(Some("bad"));
        for dim in ["good", "bad", "other"] {
            client.query(request(dim));
        }
        assert_eq!(client.settle().await, 3);
        assert_eq!(client.issued_count(), 3);

        assert!(matches!(client.query(request("bad")), Stage::Failed(_)));
        for dim in ["good", "other"] {
            let response = client.query(request(dim)).ready().unwrap();
            assert!(response.data[0].contains_key(dim));
        }
    }

    #[tokio::test]
    async fn test_eviction_keeps_capacity() {
        let mut client = QueryClient::new(
            Arc::new(CountingService { calls: Cell::new(0), fail_on: None }),
            2,
        );
        for dim in ["a", "b", "c"] {
            client.query(request(dim));
        }
        client.settle().await;
        assert_eq!(client.len(), 2);
        // Oldest slot was evicted and is queried again.
        assert!(client.query(request("a")).is_fetching());
    }

    #[test]
    fn test_stage_combinators() {
        let ready: Stage<i32> = Stage::Ready(1);
        let fetching: Stage<i32> = Stage::Fetching;
        let failed: Stage<i32> = Stage::Failed(ServiceError::Backend("x".into()));

        assert_eq!(ready.clone().zip(Stage::Ready(2)), Stage::Ready((1, 2)));
        assert!(ready.clone().zip(fetching.clone()).is_fetching());
        assert!(matches!(fetching.clone().zip(failed.clone()), Stage::Failed(_)));

        assert_eq!(all_ready(vec![ready.clone(), Stage::Ready(3)]), Stage::Ready(vec![1, 3]));
        assert!(all_ready(vec![ready, fetching]).is_fetching());
        assert_eq!(all_ready::<i32>(Vec::new()), Stage::Ready(Vec::new()));
    }
}

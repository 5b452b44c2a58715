//! In-memory aggregation of SDK evaluation metrics and the periodic flush
//! that drains them upstream.
//!
//! Delivery is at-most-once: a flush swaps the aggregate out before
//! uploading, and whatever fails to upload is dropped rather than re-queued.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;

use shared::{counter, histogram};

use crate::domain::{EnvironmentId, Metrics};
use crate::metrics_defs::{FLUSH_ENVIRONMENTS, FLUSH_FAILURES};
use crate::token::TokenRegistry;
use crate::upstream::{RequestContext, UpstreamClient};

const MAX_CONCURRENT_FLUSHES: usize = 4;

struct Inner {
    aggregates: Mutex<HashMap<EnvironmentId, Metrics>>,
    enabled: bool,
    upstream: Arc<UpstreamClient>,
    tokens: Arc<TokenRegistry>,
}

#[derive(Clone)]
pub struct MetricService {
    inner: Arc<Inner>,
}

impl MetricService {
    pub fn new(upstream: Arc<UpstreamClient>, tokens: Arc<TokenRegistry>, enabled: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                aggregates: Mutex::new(HashMap::new()),
                enabled,
                upstream,
                tokens,
            }),
        }
    }

    /// Merges a batch into the environment's aggregate: target data is
    /// unioned by identifier (last write wins), metrics data is appended.
    pub fn store_metrics(&self, environment: &str, batch: Metrics) {
        if !self.inner.enabled {
            return;
        }

        let mut aggregates = self.inner.aggregates.lock();
        let aggregate = aggregates.entry(environment.to_string()).or_default();

        for target in batch.target_data {
            match aggregate
                .target_data
                .iter_mut()
                .find(|t| t.identifier == target.identifier)
            {
                Some(existing) => *existing = target,
                None => aggregate.target_data.push(target),
            }
        }
        aggregate.metrics_data.extend(batch.metrics_data);
    }

    /// Swaps the aggregate map for an empty one, then uploads each
    /// environment's batch in parallel (bounded). Failed uploads are logged
    /// and their batches dropped.
    pub async fn flush(&self) {
        let drained = std::mem::take(&mut *self.inner.aggregates.lock());
        if drained.is_empty() {
            return;
        }
        histogram!(FLUSH_ENVIRONMENTS).record(drained.len() as f64);

        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_FLUSHES));
        let mut uploads = JoinSet::new();

        for (environment, metrics) in drained {
            let Some(token) = self.inner.tokens.get(&environment) else {
                tracing::debug!(environment = %environment, "no upstream token, dropping metrics aggregate");
                continue;
            };

            let inner = self.inner.clone();
            let semaphore = semaphore.clone();
            uploads.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                let ctx = RequestContext::with_token(token);
                if let Err(e) = inner.upstream.post_metrics(&environment, &metrics, &ctx).await {
                    counter!(FLUSH_FAILURES).increment(1);
                    tracing::warn!(environment = %environment, error = %e, "failed to post metrics upstream");
                }
            });
        }

        while uploads.join_next().await.is_some() {}
    }

    /// Flush scheduler; runs until shutdown.
    pub async fn run(self, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::debug!("metric flush loop stopping");
                    return;
                }
                _ = ticker.tick() => self.flush().await,
            }
        }
    }

    #[cfg(test)]
    fn aggregate(&self, environment: &str) -> Option<Metrics> {
        self.inner.aggregates.lock().get(environment).cloned()
    }

    #[cfg(test)]
    fn environment_count(&self) -> usize {
        self.inner.aggregates.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::testsupport::minimal_config;
    use crate::domain::{KeyValue, MetricsData, TargetData};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn target(identifier: &str, plan: &str) -> TargetData {
        TargetData {
            identifier: identifier.to_string(),
            name: Some("target name".to_string()),
            attributes: vec![KeyValue {
                key: "plan".to_string(),
                value: plan.to_string(),
            }],
        }
    }

    fn evaluation(timestamp: i64, count: i64, flag: &str) -> MetricsData {
        MetricsData {
            timestamp,
            count,
            metrics_type: "FFMETRICS".to_string(),
            attributes: vec![KeyValue {
                key: "featureIdentifier".to_string(),
                value: flag.to_string(),
            }],
        }
    }

    fn batch(targets: Vec<TargetData>, metrics: Vec<MetricsData>) -> Metrics {
        Metrics {
            target_data: targets,
            metrics_data: metrics,
        }
    }

    async fn service(server: &MockServer, enabled: bool) -> (MetricService, Arc<TokenRegistry>) {
        let upstream = Arc::new(UpstreamClient::new(&minimal_config(&server.uri())));
        let tokens = Arc::new(TokenRegistry::new());
        (MetricService::new(upstream, tokens.clone(), enabled), tokens)
    }

    #[tokio::test]
    async fn merges_batches_for_one_environment_in_order() {
        let server = MockServer::start().await;
        let (service, _) = service(&server, true).await;

        service.store_metrics(
            "123",
            batch(vec![target("t1", "pro")], vec![evaluation(1234, 1, "flag1")]),
        );
        service.store_metrics("123", batch(vec![], vec![evaluation(5678, 2, "flag2")]));

        let aggregate = service.aggregate("123").unwrap();
        assert_eq!(aggregate.target_data, vec![target("t1", "pro")]);
        assert_eq!(
            aggregate.metrics_data,
            vec![evaluation(1234, 1, "flag1"), evaluation(5678, 2, "flag2")]
        );
    }

    #[tokio::test]
    async fn target_union_keeps_last_write() {
        let server = MockServer::start().await;
        let (service, _) = service(&server, true).await;

        service.store_metrics("123", batch(vec![target("t1", "pro")], vec![]));
        service.store_metrics("123", batch(vec![target("t1", "free"), target("t2", "pro")], vec![]));

        let aggregate = service.aggregate("123").unwrap();
        assert_eq!(
            aggregate.target_data,
            vec![target("t1", "free"), target("t2", "pro")]
        );
    }

    #[tokio::test]
    async fn environments_aggregate_separately() {
        let server = MockServer::start().await;
        let (service, _) = service(&server, true).await;

        service.store_metrics("123", batch(vec![], vec![evaluation(1234, 1, "flag1")]));
        service.store_metrics("456", batch(vec![], vec![evaluation(2345, 1, "flag1")]));

        assert_eq!(service.environment_count(), 2);
        assert_eq!(service.aggregate("456").unwrap().metrics_data.len(), 1);
    }

    #[tokio::test]
    async fn disabled_service_stores_nothing() {
        let server = MockServer::start().await;
        let (service, _) = service(&server, false).await;

        service.store_metrics("123", batch(vec![], vec![evaluation(1234, 1, "flag1")]));
        assert_eq!(service.environment_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_stores_merge_like_some_sequential_order() {
        let server = MockServer::start().await;
        let (service, _) = service(&server, true).await;

        let mut handles = Vec::new();
        for i in 0..8i64 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                service.store_metrics("123", batch(vec![], vec![evaluation(i, 1, "flag1")]));
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let mut timestamps: Vec<i64> = service
            .aggregate("123")
            .unwrap()
            .metrics_data
            .iter()
            .map(|m| m.timestamp)
            .collect();
        timestamps.sort_unstable();
        assert_eq!(timestamps, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn flush_attempts_every_environment_and_empties_aggregate() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/metrics/123"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/metrics/456"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (service, tokens) = service(&server, true).await;
        tokens.put("123".to_string(), "token-123".to_string());
        tokens.put("456".to_string(), "token-456".to_string());

        service.store_metrics("123", batch(vec![], vec![evaluation(1234, 1, "flag1")]));
        service.store_metrics("456", batch(vec![], vec![evaluation(2345, 1, "flag1")]));

        service.flush().await;

        // both attempted (wiremock expectations), nothing retained
        assert_eq!(service.environment_count(), 0);
    }

    #[tokio::test]
    async fn flush_skips_environments_without_tokens() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/metrics/456"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let (service, tokens) = service(&server, true).await;
        tokens.put("456".to_string(), "token-456".to_string());

        service.store_metrics("123", batch(vec![], vec![evaluation(1234, 1, "flag1")]));
        service.store_metrics("456", batch(vec![], vec![evaluation(2345, 1, "flag1")]));

        service.flush().await;

        // the tokenless aggregate is dropped, not re-queued
        assert_eq!(service.environment_count(), 0);
    }

    #[tokio::test]
    async fn flush_with_empty_aggregate_is_a_no_op() {
        let server = MockServer::start().await;
        let (service, _) = service(&server, true).await;
        service.flush().await;
        assert_eq!(service.environment_count(), 0);
    }
}

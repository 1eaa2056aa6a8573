use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::ring::RingBuffer;
use crate::types::{ratio, ModelAggregate, ProviderAggregate, RequestMetric};

/// Nearest-rank percentile over an ascending-sorted sample.
///
/// Uses `index = ceil(p / 100 * n) - 1`, clamped into the sample. Returns 0 for
/// an empty sample.
pub fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (p / 100.0 * sorted.len() as f64).ceil() as i64 - 1;
    let index = rank.clamp(0, sorted.len() as i64 - 1) as usize;
    sorted[index]
}

/// Incremental mean: `(old_avg * old_count + value) / new_count`.
pub fn incremental_mean(old_avg: f64, old_count: u64, value: f64) -> f64 {
    let new_count = old_count + 1;
    (old_avg * old_count as f64 + value) / new_count as f64
}

#[derive(Debug, Clone)]
struct ProviderState {
    aggregate: ProviderAggregate,
    latencies: RingBuffer<u64>,
}

/// Folds terminal records into per-provider running statistics.
#[derive(Debug, Clone)]
pub struct ProviderAggregator {
    sample_capacity: usize,
    providers: HashMap<String, ProviderState>,
}

impl ProviderAggregator {
    pub fn new(sample_capacity: usize) -> Self {
        Self {
            sample_capacity,
            providers: HashMap::new(),
        }
    }

    pub fn record(&mut self, metric: &RequestMetric) -> &ProviderAggregate {
        let capacity = self.sample_capacity;
        let state = self
            .providers
            .entry(metric.provider.clone())
            .or_insert_with(|| ProviderState {
                aggregate: ProviderAggregate {
                    provider: metric.provider.clone(),
                    ..ProviderAggregate::default()
                },
                latencies: RingBuffer::new(capacity),
            });

        let aggregate = &mut state.aggregate;
        aggregate.total_requests += 1;
        if metric.success {
            aggregate.successful_requests += 1;
        } else {
            aggregate.failed_requests += 1;
        }
        if metric.rate_limit {
            aggregate.rate_limit_events += 1;
        }
        if metric.cached {
            aggregate.cache_hits += 1;
        }
        if let Some(usage) = metric.token_usage {
            aggregate.total_tokens += usage.total_tokens;
        }
        aggregate.total_cost += metric.cost.unwrap_or(0.0);

        if let Some(latency) = metric.latency_ms {
            aggregate.total_latency_ms += latency;
            state.latencies.push(latency);
        }

        aggregate.avg_latency_ms = if aggregate.total_requests == 0 {
            0.0
        } else {
            aggregate.total_latency_ms as f64 / aggregate.total_requests as f64
        };
        aggregate.error_rate = ratio(aggregate.failed_requests, aggregate.total_requests);
        aggregate.cache_hit_rate = ratio(aggregate.cache_hits, aggregate.total_requests);

        let mut sorted: Vec<u64> = state.latencies.iter().copied().collect();
        sorted.sort_unstable();
        aggregate.p50_latency_ms = percentile(&sorted, 50.0);
        aggregate.p95_latency_ms = percentile(&sorted, 95.0);
        aggregate.p99_latency_ms = percentile(&sorted, 99.0);

        &state.aggregate
    }

    pub fn get(&self, provider: &str) -> Option<&ProviderAggregate> {
        self.providers.get(provider).map(|state| &state.aggregate)
    }

    /// Aggregates sorted by provider name.
    pub fn all(&self) -> Vec<ProviderAggregate> {
        let mut aggregates: Vec<ProviderAggregate> = self
            .providers
            .values()
            .map(|state| state.aggregate.clone())
            .collect();
        aggregates.sort_by(|a, b| a.provider.cmp(&b.provider));
        aggregates
    }
}

/// Per `provider:model` running averages without raw samples.
#[derive(Debug, Clone, Default)]
pub struct ModelAggregator {
    models: HashMap<String, ModelAggregate>,
}

impl ModelAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, metric: &RequestMetric, now: DateTime<Utc>) -> &ModelAggregate {
        let entry = self
            .models
            .entry(metric.model_key())
            .or_insert_with(|| ModelAggregate {
                provider: metric.provider.clone(),
                model: metric.model.clone(),
                request_count: 0,
                avg_latency_ms: 0.0,
                avg_cost: 0.0,
                success_rate: 0.0,
                last_used: now,
            });

        let count = entry.request_count;
        entry.avg_latency_ms =
            incremental_mean(entry.avg_latency_ms, count, metric.latency_ms.unwrap_or(0) as f64);
        entry.avg_cost = incremental_mean(entry.avg_cost, count, metric.cost.unwrap_or(0.0));
        entry.success_rate =
            incremental_mean(entry.success_rate, count, if metric.success { 1.0 } else { 0.0 });
        entry.request_count = count + 1;
        entry.last_used = now;
        entry
    }

    pub fn get(&self, provider: &str, model: &str) -> Option<&ModelAggregate> {
        self.models.get(&crate::types::model_key(provider, model))
    }

    pub fn all(&self) -> Vec<ModelAggregate> {
        let mut aggregates: Vec<ModelAggregate> = self.models.values().cloned().collect();
        aggregates.sort_by(|a, b| (&a.provider, &a.model).cmp(&(&b.provider, &b.model)));
        aggregates
    }
}

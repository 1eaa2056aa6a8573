use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Duration, Utc};

use crate::types::{AggregatedWindow, RequestMetric, TimeWindowMetrics};

/// Summarizes recent history into fixed-size windows on timer ticks.
///
/// Windows are aligned to the tick instant, not to request arrival.
#[derive(Debug, Clone)]
pub struct WindowAggregator {
    window_sizes_secs: Vec<u64>,
    max_entries: usize,
    windows: HashMap<u64, VecDeque<AggregatedWindow>>,
}

impl WindowAggregator {
    pub fn new(window_sizes_secs: Vec<u64>, max_entries: usize) -> Self {
        let windows = window_sizes_secs
            .iter()
            .map(|size| (*size, VecDeque::new()))
            .collect();
        Self {
            window_sizes_secs,
            max_entries: max_entries.max(1),
            windows,
        }
    }

    pub fn window_sizes(&self) -> &[u64] {
        &self.window_sizes_secs
    }

    /// Aggregates `records` (already sliced to the window) and appends the
    /// result to that window size's capped list.
    pub fn record_tick(
        &mut self,
        window_size_secs: u64,
        now: DateTime<Utc>,
        records: &[RequestMetric],
    ) -> AggregatedWindow {
        let window = aggregate_window(window_size_secs, now, records);
        let entries = self.windows.entry(window_size_secs).or_default();
        entries.push_back(window.clone());
        while entries.len() > self.max_entries {
            entries.pop_front();
        }
        window
    }

    pub fn history(&self, window_size_secs: u64) -> Vec<AggregatedWindow> {
        self.windows
            .get(&window_size_secs)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Most recent aggregate of every window size that has ticked at least once.
    pub fn latest(&self) -> Vec<AggregatedWindow> {
        self.window_sizes_secs
            .iter()
            .filter_map(|size| self.windows.get(size).and_then(|entries| entries.back()))
            .cloned()
            .collect()
    }
}

/// `[now - window, now)` bounds of a tick.
pub fn window_bounds(window_size_secs: u64, now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = i64::try_from(window_size_secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|span| now.checked_sub_signed(span))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    (start, now)
}

/// Pure aggregation of the records whose start time lies in the window.
pub fn aggregate_window(
    window_size_secs: u64,
    now: DateTime<Utc>,
    records: &[RequestMetric],
) -> AggregatedWindow {
    let (start, end) = window_bounds(window_size_secs, now);
    let mut overall = TimeWindowMetrics::empty(start, end);
    let mut by_provider: BTreeMap<String, TimeWindowMetrics> = BTreeMap::new();
    let mut by_model: BTreeMap<String, TimeWindowMetrics> = BTreeMap::new();

    for record in records
        .iter()
        .filter(|record| record.start_time >= start && record.start_time < end)
    {
        fold(&mut overall, record);
        fold(
            by_provider
                .entry(record.provider.clone())
                .or_insert_with(|| TimeWindowMetrics::empty(start, end)),
            record,
        );
        fold(
            by_model
                .entry(record.model_key())
                .or_insert_with(|| TimeWindowMetrics::empty(start, end)),
            record,
        );
    }

    AggregatedWindow {
        window_size_secs,
        overall,
        by_provider,
        by_model,
    }
}

fn fold(bucket: &mut TimeWindowMetrics, record: &RequestMetric) {
    bucket.request_count += 1;
    if record.is_failure() {
        bucket.error_count += 1;
    }
    bucket.total_latency_ms += record.latency_ms.unwrap_or(0);
    bucket.total_tokens += record.token_usage.map(|usage| usage.total_tokens).unwrap_or(0);
    bucket.total_cost += record.cost.unwrap_or(0.0);
    if record.is_terminal() {
        if record.cached {
            bucket.cache_hits += 1;
        } else {
            bucket.cache_misses += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::types::{Operation, TokenUsage};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 12, 0, 0).unwrap()
    }

    fn record(provider: &str, model: &str, secs_ago: i64, success: bool, cached: bool) -> RequestMetric {
        let start = now() - Duration::seconds(secs_ago);
        let mut metric = RequestMetric::pending("r", provider, model, Operation::ChatCompletion, start);
        metric.end_time = Some(start + Duration::milliseconds(200));
        metric.latency_ms = Some(200);
        metric.success = success;
        metric.cached = cached;
        metric.token_usage = Some(TokenUsage::new(10, 5));
        metric.cost = Some(0.01);
        metric
    }

    #[test]
    fn aggregates_only_records_inside_the_window() {
        let records = vec![
            record("openai", "gpt-4", 10, true, false),
            record("openai", "gpt-4o", 30, false, false),
            record("anthropic", "claude-3-haiku", 59, true, true),
            record("openai", "gpt-4", 60, true, false),
            record("openai", "gpt-4", 0, true, false),
        ];

        let window = aggregate_window(60, now(), &records);

        // 60s ago is the inclusive start, `now` is the exclusive end.
        assert_eq!(window.overall.request_count, 4);
        assert_eq!(window.overall.error_count, 1);
        assert_eq!(window.overall.total_latency_ms, 800);
        assert_eq!(window.overall.total_tokens, 60);
        assert_eq!(window.overall.cache_hits, 1);
        assert_eq!(window.overall.cache_misses, 3);
        assert_eq!(window.by_provider["openai"].request_count, 3);
        assert_eq!(window.by_provider["anthropic"].request_count, 1);
        assert_eq!(window.by_model["openai:gpt-4"].request_count, 2);
        assert_eq!(window.by_model["openai:gpt-4o"].error_count, 1);
        assert_eq!(window.overall.window_end, now());
    }

    #[test]
    fn pending_records_count_as_requests_without_cache_outcome() {
        let pending = RequestMetric::pending("p", "openai", "gpt-4", Operation::Embedding, now() - Duration::seconds(5));
        let window = aggregate_window(60, now(), &[pending]);
        assert_eq!(window.overall.request_count, 1);
        assert_eq!(window.overall.error_count, 0);
        assert_eq!(window.overall.cache_hits + window.overall.cache_misses, 0);
    }

    #[test]
    fn window_history_is_capped() {
        let mut aggregator = WindowAggregator::new(vec![60, 300], 2);
        for tick in 0..5 {
            aggregator.record_tick(60, now() + Duration::seconds(60 * tick), &[]);
        }
        let history = aggregator.history(60);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].overall.window_end, now() + Duration::seconds(240));
        assert!(aggregator.history(300).is_empty());
        assert_eq!(aggregator.latest().len(), 1);
    }

    #[test]
    fn oversized_window_clamps_to_the_earliest_instant() {
        let (start, end) = window_bounds(u64::MAX, now());
        assert_eq!(start, DateTime::<Utc>::MIN_UTC);
        assert_eq!(end, now());

        let (start, _) = window_bounds(60, now());
        assert_eq!(now() - start, Duration::seconds(60));
    }
}

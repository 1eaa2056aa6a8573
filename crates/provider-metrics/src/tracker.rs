use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::pricing::PricingTable;
use crate::ring::RingBuffer;
use crate::types::{Operation, ProviderError, ProviderResponse, RequestMetric};

/// Bernoulli sampler deciding whether a request is tracked at all.
#[derive(Debug)]
pub struct Sampler {
    rate: f64,
    rng: StdRng,
}

impl Sampler {
    pub fn new(rate: f64, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rate: if rate.is_finite() { rate.clamp(0.0, 1.0) } else { 0.0 },
            rng,
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn sample(&mut self) -> bool {
        if self.rate >= 1.0 {
            true
        } else if self.rate <= 0.0 {
            false
        } else {
            self.rng.gen_bool(self.rate)
        }
    }
}

/// Tracks individual provider calls from start to their single terminal state.
///
/// Records live in a bounded insertion-ordered history. In-flight records are
/// found through an id index holding each record's sequence number, so a
/// record that has been evicted from history simply stops resolving.
#[derive(Debug)]
pub struct RequestLifecycleTracker {
    enabled: bool,
    sampler: Sampler,
    pricing: PricingTable,
    history: RingBuffer<RequestMetric>,
    /// Sequence number of `history[0]`.
    evicted: u64,
    pending: HashMap<String, u64>,
}

impl RequestLifecycleTracker {
    pub fn new(max_history: usize, sampler: Sampler, pricing: PricingTable) -> Self {
        Self {
            enabled: true,
            sampler,
            pricing,
            history: RingBuffer::new(max_history),
            evicted: 0,
            pending: HashMap::new(),
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Registers a pending record if the pipeline is enabled and the request is
    /// sampled. Returns whether the request is now tracked.
    pub fn start_request(
        &mut self,
        request_id: &str,
        provider: &str,
        model: &str,
        operation: Operation,
        metadata: Option<HashMap<String, serde_json::Value>>,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.enabled || !self.sampler.sample() {
            return false;
        }
        if self.pending.contains_key(request_id) {
            log::debug!("request {} is already being tracked; ignoring restart", request_id);
            return false;
        }

        let mut metric = RequestMetric::pending(request_id, provider, model, operation, now);
        if let Some(metadata) = metadata {
            metric.metadata = metadata;
        }

        let sequence = self.evicted + self.history.len() as u64;
        if let Some(old) = self.history.push(metric) {
            let old_sequence = self.evicted;
            self.evicted += 1;
            if self.pending.get(&old.request_id) == Some(&old_sequence) {
                self.pending.remove(&old.request_id);
            }
        }
        self.pending.insert(request_id.to_string(), sequence);
        true
    }

    /// Moves a pending record to success. Unknown ids return `None`.
    pub fn complete_request(
        &mut self,
        request_id: &str,
        response: &ProviderResponse,
        cached: bool,
        now: DateTime<Utc>,
    ) -> Option<RequestMetric> {
        if !self.enabled {
            return None;
        }
        let pricing = &self.pricing;
        let metric = Self::take_pending(&mut self.pending, &mut self.history, self.evicted, request_id)?;

        finish(metric, now);
        metric.token_usage = response.usage;
        metric.cost = Some(
            response
                .usage
                .map(|usage| pricing.cost(&metric.provider, &metric.model, &usage))
                .unwrap_or(0.0),
        );
        metric.cached = cached;
        metric.success = true;
        Some(metric.clone())
    }

    /// Moves a pending record to failure. Unknown ids return `None`.
    pub fn fail_request(
        &mut self,
        request_id: &str,
        error: &ProviderError,
        rate_limit: bool,
        retry_count: u32,
        now: DateTime<Utc>,
    ) -> Option<RequestMetric> {
        if !self.enabled {
            return None;
        }
        let metric = Self::take_pending(&mut self.pending, &mut self.history, self.evicted, request_id)?;

        finish(metric, now);
        metric.success = false;
        metric.error_message = Some(error.message.clone());
        metric.error_code = error.code.clone();
        metric.rate_limit = rate_limit;
        metric.retry_count = retry_count;
        Some(metric.clone())
    }

    fn take_pending<'a>(
        pending: &mut HashMap<String, u64>,
        history: &'a mut RingBuffer<RequestMetric>,
        evicted: u64,
        request_id: &str,
    ) -> Option<&'a mut RequestMetric> {
        let Some(sequence) = pending.remove(request_id) else {
            log::debug!("no tracked request {}; skipping", request_id);
            return None;
        };
        let index = sequence.checked_sub(evicted)? as usize;
        history
            .get_mut(index)
            .filter(|metric| metric.request_id == request_id && !metric.is_terminal())
    }

    pub fn history(&self) -> impl DoubleEndedIterator<Item = &RequestMetric> + ExactSizeIterator {
        self.history.iter()
    }

    /// Records whose start time falls in `[from, to)`, cloned out of history.
    pub fn snapshot_between(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<RequestMetric> {
        self.history
            .iter()
            .filter(|metric| metric.start_time >= from && metric.start_time < to)
            .cloned()
            .collect()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn max_history(&self) -> usize {
        self.history.capacity()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }
}

fn finish(metric: &mut RequestMetric, now: DateTime<Utc>) {
    let latency = (now - metric.start_time).num_milliseconds().max(0) as u64;
    metric.end_time = Some(now.max(metric.start_time));
    metric.latency_ms = Some(latency);
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::types::TokenUsage;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 10, 14, 0, 0).unwrap()
    }

    fn tracker(max_history: usize, rate: f64) -> RequestLifecycleTracker {
        RequestLifecycleTracker::new(max_history, Sampler::new(rate, Some(7)), PricingTable::default())
    }

    fn response(prompt: u64, completion: u64) -> ProviderResponse {
        ProviderResponse {
            id: "resp".into(),
            model: "gpt-4".into(),
            usage: Some(TokenUsage::new(prompt, completion)),
            provider: "openai".into(),
        }
    }

    #[test]
    fn complete_sets_latency_usage_and_cost() {
        let mut tracker = tracker(10, 1.0);
        assert!(tracker.start_request("a", "openai", "gpt-4", Operation::ChatCompletion, None, t0()));

        let metric = tracker
            .complete_request("a", &response(1000, 500), false, t0() + Duration::milliseconds(850))
            .expect("tracked");

        assert!(metric.success);
        assert_eq!(metric.latency_ms, Some(850));
        assert_eq!(metric.token_usage.map(|u| u.total_tokens), Some(1500));
        assert!((metric.cost.unwrap() - 0.06).abs() < 1e-4);
        assert_eq!(tracker.pending_len(), 0);
        assert!(tracker.history().next().unwrap().success);
    }

    #[test]
    fn unknown_and_repeated_ids_are_no_ops() {
        let mut tracker = tracker(10, 1.0);
        assert!(tracker.complete_request("ghost", &response(1, 1), false, t0()).is_none());

        tracker.start_request("a", "openai", "gpt-4", Operation::ChatCompletion, None, t0());
        assert!(tracker.fail_request("a", &ProviderError::new("boom"), false, 0, t0()).is_some());
        assert!(tracker.complete_request("a", &response(1, 1), false, t0()).is_none());
        assert!(!tracker.history().next().unwrap().success);
    }

    #[test]
    fn fail_records_error_details() {
        let mut tracker = tracker(10, 1.0);
        tracker.start_request("a", "anthropic", "claude-3-haiku", Operation::ChatCompletionStream, None, t0());

        let metric = tracker
            .fail_request(
                "a",
                &ProviderError::new("too many requests").with_code("429"),
                true,
                2,
                t0() + Duration::seconds(3),
            )
            .expect("tracked");

        assert!(!metric.success);
        assert_eq!(metric.error_code.as_deref(), Some("429"));
        assert_eq!(metric.error_message.as_deref(), Some("too many requests"));
        assert!(metric.rate_limit);
        assert_eq!(metric.retry_count, 2);
        assert_eq!(metric.latency_ms, Some(3000));
    }

    #[test]
    fn history_is_bounded_and_evicted_requests_stop_resolving() {
        let mut tracker = tracker(3, 1.0);
        for i in 0..5 {
            tracker.start_request(&format!("r{}", i), "openai", "gpt-4", Operation::Embedding, None, t0());
            assert!(tracker.history_len() <= 3);
        }

        let ids: Vec<&str> = tracker.history().map(|m| m.request_id.as_str()).collect();
        assert_eq!(ids, vec!["r2", "r3", "r4"]);
        assert!(tracker.complete_request("r0", &response(1, 1), false, t0()).is_none());
        assert!(tracker.complete_request("r3", &response(1, 1), false, t0()).is_some());
        assert_eq!(tracker.pending_len(), 2);
    }

    #[test]
    fn clock_skew_never_produces_negative_latency() {
        let mut tracker = tracker(3, 1.0);
        tracker.start_request("a", "openai", "gpt-4", Operation::ChatCompletion, None, t0());
        let metric = tracker
            .complete_request("a", &response(1, 1), false, t0() - Duration::seconds(1))
            .expect("tracked");
        assert_eq!(metric.latency_ms, Some(0));
    }

    #[test]
    fn disabled_tracker_ignores_everything() {
        let mut tracker = tracker(3, 1.0);
        tracker.set_enabled(false);
        assert!(!tracker.start_request("a", "openai", "gpt-4", Operation::ChatCompletion, None, t0()));
        assert_eq!(tracker.history_len(), 0);
    }

    #[test]
    fn zero_sample_rate_tracks_nothing() {
        let mut tracker = tracker(100, 0.0);
        for i in 0..50 {
            tracker.start_request(&i.to_string(), "openai", "gpt-4", Operation::ChatCompletion, None, t0());
        }
        assert_eq!(tracker.history_len(), 0);
    }

    #[test]
    fn sampling_rate_is_respected_statistically() {
        let mut tracker = tracker(100_000, 0.3);
        for i in 0..10_000 {
            tracker.start_request(&i.to_string(), "openai", "gpt-4", Operation::ChatCompletion, None, t0());
        }
        let tracked = tracker.history_len() as f64;
        assert!((2_700.0..=3_300.0).contains(&tracked), "tracked {}", tracked);
    }
}

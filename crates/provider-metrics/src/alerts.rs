use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::AlertThresholds;
use crate::types::{ProviderAggregate, RequestMetric};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Latency,
    ErrorRate,
    RateLimit,
}

impl AlertKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Latency => "latency",
            Self::ErrorRate => "error_rate",
            Self::RateLimit => "rate_limit",
        }
    }
}

/// Ordered so `Critical > High`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlertEvent {
    #[serde(rename = "type")]
    pub kind: AlertKind,
    pub severity: Severity,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub provider: String,
    pub timestamp: DateTime<Utc>,
}

/// Stateless threshold checks run against every terminal record.
#[derive(Debug, Clone, Default)]
pub struct AlertEvaluator {
    thresholds: AlertThresholds,
}

impl AlertEvaluator {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    pub fn evaluate(
        &self,
        metric: &RequestMetric,
        aggregate: &ProviderAggregate,
        now: DateTime<Utc>,
    ) -> Vec<AlertEvent> {
        let mut alerts = Vec::new();
        let thresholds = &self.thresholds;

        if let Some(latency) = metric.latency_ms {
            let breach = if latency > thresholds.latency_critical_ms {
                Some((Severity::Critical, thresholds.latency_critical_ms))
            } else if latency > thresholds.latency_high_ms {
                Some((Severity::High, thresholds.latency_high_ms))
            } else {
                None
            };
            if let Some((severity, threshold)) = breach {
                alerts.push(AlertEvent {
                    kind: AlertKind::Latency,
                    severity,
                    message: format!(
                        "{} request {} took {}ms (threshold {}ms)",
                        metric.provider, metric.request_id, latency, threshold
                    ),
                    value: latency as f64,
                    threshold: threshold as f64,
                    provider: metric.provider.clone(),
                    timestamp: now,
                });
            }
        }

        let error_rate = aggregate.error_rate;
        let breach = if error_rate > thresholds.error_rate_critical {
            Some((Severity::Critical, thresholds.error_rate_critical))
        } else if error_rate > thresholds.error_rate_high {
            Some((Severity::High, thresholds.error_rate_high))
        } else {
            None
        };
        if let Some((severity, threshold)) = breach {
            alerts.push(AlertEvent {
                kind: AlertKind::ErrorRate,
                severity,
                message: format!(
                    "{} error rate {:.1}% exceeds {:.1}%",
                    aggregate.provider,
                    error_rate * 100.0,
                    threshold * 100.0
                ),
                value: error_rate,
                threshold,
                provider: metric.provider.clone(),
                timestamp: now,
            });
        }

        if metric.rate_limit {
            alerts.push(AlertEvent {
                kind: AlertKind::RateLimit,
                severity: Severity::High,
                message: format!(
                    "{} rate limited request {} (retries: {})",
                    metric.provider, metric.request_id, metric.retry_count
                ),
                value: 1.0,
                threshold: 0.0,
                provider: metric.provider.clone(),
                timestamp: now,
            });
        }

        alerts
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::types::Operation;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 2, 8, 30, 0).unwrap()
    }

    fn record(latency: u64) -> RequestMetric {
        let mut metric =
            RequestMetric::pending("req-1", "openai", "gpt-4", Operation::ChatCompletion, now());
        metric.end_time = Some(now());
        metric.latency_ms = Some(latency);
        metric.success = true;
        metric
    }

    fn aggregate(error_rate: f64) -> ProviderAggregate {
        ProviderAggregate {
            provider: "openai".into(),
            error_rate,
            ..ProviderAggregate::default()
        }
    }

    #[test]
    fn latency_above_critical_threshold_is_critical() {
        let alerts = AlertEvaluator::default().evaluate(&record(12_000), &aggregate(0.0), now());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::Latency);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert_eq!(alerts[0].threshold, 10_000.0);
    }

    #[test]
    fn latency_between_thresholds_is_high() {
        let alerts = AlertEvaluator::default().evaluate(&record(7_500), &aggregate(0.0), now());
        assert_eq!(alerts[0].severity, Severity::High);
        assert_eq!(alerts[0].value, 7_500.0);
    }

    #[test]
    fn thresholds_are_exclusive() {
        let evaluator = AlertEvaluator::default();
        assert!(evaluator.evaluate(&record(5_000), &aggregate(0.05), now()).is_empty());
    }

    #[test]
    fn error_rate_severity_follows_thresholds() {
        let evaluator = AlertEvaluator::default();
        let high = evaluator.evaluate(&record(10), &aggregate(0.1), now());
        assert_eq!(high[0].kind, AlertKind::ErrorRate);
        assert_eq!(high[0].severity, Severity::High);

        let critical = evaluator.evaluate(&record(10), &aggregate(0.4), now());
        assert_eq!(critical[0].severity, Severity::Critical);
        assert_eq!(critical[0].threshold, 0.20);
    }

    #[test]
    fn rate_limited_record_raises_high_alert() {
        let mut metric = record(10);
        metric.rate_limit = true;
        let alerts = AlertEvaluator::default().evaluate(&metric, &aggregate(0.0), now());
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].kind, AlertKind::RateLimit);
        assert_eq!(alerts[0].severity, Severity::High);
    }

    #[test]
    fn alert_serializes_kind_as_type() {
        let alerts = AlertEvaluator::default().evaluate(&record(12_000), &aggregate(0.0), now());
        let json = serde_json::to_value(&alerts[0]).expect("serialize");
        assert_eq!(json["type"], "latency");
        assert_eq!(json["severity"], "critical");
    }
}

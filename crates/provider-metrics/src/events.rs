use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::alerts::AlertEvent;
use crate::types::{AggregatedWindow, RequestMetric};

/// Metadata attached to every metrics event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMeta {
    /// Unique event ID (UUID v4)
    pub event_id: String,
    /// When the event occurred
    pub occurred_at: DateTime<Utc>,
}

impl EventMeta {
    pub fn new() -> Self {
        Self::at(Utc::now())
    }

    pub fn at(occurred_at: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            occurred_at,
        }
    }
}

impl Default for EventMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the pipeline publishes on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MetricsEvent {
    /// A tracked request reached a terminal state.
    Collected {
        meta: EventMeta,
        metric: RequestMetric,
    },
    /// A window tick produced a new aggregate.
    Aggregated {
        meta: EventMeta,
        window: AggregatedWindow,
    },
    /// A threshold was crossed.
    Alert { meta: EventMeta, alert: AlertEvent },
    System(SystemEvent),
}

impl MetricsEvent {
    pub const COLLECTED: &'static str = "collected";
    pub const AGGREGATED: &'static str = "aggregated";
    pub const ALERT_THRESHOLD: &'static str = "alert:threshold";
    pub const SYSTEM: &'static str = "system";

    pub fn name(&self) -> &'static str {
        match self {
            Self::Collected { .. } => Self::COLLECTED,
            Self::Aggregated { .. } => Self::AGGREGATED,
            Self::Alert { .. } => Self::ALERT_THRESHOLD,
            Self::System(_) => Self::SYSTEM,
        }
    }
}

/// Operational events about the pipeline itself
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SystemEvent {
    StorageTrimmed {
        removed_points: usize,
        estimated_bytes: u64,
        max_bytes: u64,
    },
    RetentionSwept {
        removed_raw: usize,
        removed_aggregated: usize,
        compressed: usize,
    },
    MetricsDropped {
        count: u64,
        reason: String,
    },
    StorageError {
        error: String,
        event_type: String,
    },
    WorkerStarted,
    WorkerStopped,
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::types::Operation;

    #[test]
    fn event_names_match_published_channels() {
        let at = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        let metric = RequestMetric::pending("r", "openai", "gpt-4", Operation::Embedding, at);
        let event = MetricsEvent::Collected {
            meta: EventMeta::at(at),
            metric,
        };
        assert_eq!(event.name(), "collected");
        assert_eq!(
            MetricsEvent::System(SystemEvent::WorkerStarted).name(),
            "system"
        );
        assert_eq!(MetricsEvent::ALERT_THRESHOLD, "alert:threshold");
    }

    #[test]
    fn collected_event_round_trips_through_json() {
        let at = Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap();
        let metric = RequestMetric::pending("req-9", "anthropic", "claude-3-haiku", Operation::ChatCompletion, at);
        let event = MetricsEvent::Collected {
            meta: EventMeta::at(at),
            metric,
        };

        let json = serde_json::to_string(&event).expect("serialize");
        let decoded: MetricsEvent = serde_json::from_str(&json).expect("deserialize");

        match decoded {
            MetricsEvent::Collected { metric, meta } => {
                assert_eq!(metric.request_id, "req-9");
                assert_eq!(meta.occurred_at, at);
                assert!(!meta.event_id.is_empty());
            }
            other => panic!("expected Collected, got {}", other.name()),
        }
    }
}

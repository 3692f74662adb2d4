//! Event sink for real-time downstream consumers
//!
//! The pipeline publishes every health score and every anomaly flag. A
//! WebSocket layer (or anything else) subscribes to the [`BroadcastEventBus`].

use async_trait::async_trait;
use ethoscope_core::{AnomalyFlag, NetworkHealthScoreRecord, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

/// Capacity used when none is given; slow subscribers lag past this
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Something worth telling subscribers about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum PipelineEvent {
    HealthScore(NetworkHealthScoreRecord),
    Anomaly(AnomalyFlag),
}

impl PipelineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HealthScore(_) => "health_score",
            Self::Anomaly(_) => "anomaly",
        }
    }
}

#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: PipelineEvent) -> Result<()>;
}

/// Fan-out to any number of in-process subscribers
///
/// Publishing with no subscribers is not an error; the event is dropped.
#[derive(Debug, Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Subscribe as a `Stream`; lagged items surface as errors in the stream
    pub fn stream(&self) -> BroadcastStream<PipelineEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[async_trait]
impl EventSink for BroadcastEventBus {
    async fn publish(&self, event: PipelineEvent) -> Result<()> {
        let kind = event.kind();
        match self.sender.send(event) {
            Ok(receivers) => debug!(kind, receivers, "Published event"),
            Err(_) => debug!(kind, "No subscribers, event dropped"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use ethoscope_core::{AnomalyMethod, HealthStatus, MetricKind, Severity};
    use tokio_stream::StreamExt;

    fn score() -> NetworkHealthScoreRecord {
        NetworkHealthScoreRecord {
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            overall_score: 88.0,
            components: Vec::new(),
            anomalies: Vec::new(),
            health_status: HealthStatus::Good,
            confidence: 1.0,
        }
    }

    fn flag() -> AnomalyFlag {
        AnomalyFlag {
            metric_kind: MetricKind::Gas,
            series: "gas_price_gwei".to_string(),
            method: AnomalyMethod::Iqr,
            observed_value: 200.0,
            bound_or_score: 14.5,
            severity: Severity::Critical,
            observed_at: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_subscribers_receive_in_order() {
        let bus = BroadcastEventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(PipelineEvent::HealthScore(score())).await.unwrap();
        bus.publish(PipelineEvent::Anomaly(flag())).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), PipelineEvent::HealthScore(score()));
        assert_eq!(rx.recv().await.unwrap(), PipelineEvent::Anomaly(flag()));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_ok() {
        let bus = BroadcastEventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        assert!(bus.publish(PipelineEvent::Anomaly(flag())).await.is_ok());
    }

    #[tokio::test]
    async fn test_stream_subscription() {
        let bus = BroadcastEventBus::new(8);
        let mut stream = bus.stream();
        bus.publish(PipelineEvent::Anomaly(flag())).await.unwrap();

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.kind(), "anomaly");
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(PipelineEvent::Anomaly(flag())).unwrap();
        assert_eq!(json["type"], "anomaly");
        assert_eq!(json["data"]["method"], "iqr");
        assert_eq!(json["data"]["severity"], "critical");
    }
}

//! Audit sinks for the events a run emits.
//!
//! Every fault, reached state, timeout and verification result flows through
//! the `EventPublisher` port. The binary logs them; tests collect them.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn, Level};

use crate::domain::events::DomainEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

/// Writes each event to tracing as one JSON line.
///
/// Failures (refused faults, timeouts, integrity violations and failed
/// scenarios) always go out at WARN so they survive a quiet log filter.
/// Everything else uses the routine level.
#[derive(Debug, Clone)]
pub struct LoggingEventPublisher {
    routine: Level,
}

impl Default for LoggingEventPublisher {
    fn default() -> Self {
        Self::debug_level()
    }
}

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routine events at INFO, as the CLI does.
    pub fn info_level() -> Self {
        Self { routine: Level::INFO }
    }

    pub fn debug_level() -> Self {
        Self {
            routine: Level::DEBUG,
        }
    }

    fn level_for(&self, event: &DomainEvent) -> Level {
        if event.is_failure() {
            Level::WARN
        } else {
            self.routine
        }
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        let event_type = event.event_type();
        let volume = event.volume_id().unwrap_or("-").to_string();
        let json = serde_json::to_string(&event).unwrap_or_else(|_| format!("{:?}", event));

        match self.level_for(&event) {
            Level::WARN => warn!(event_type, volume = %volume, event = %json, "run event"),
            Level::INFO => info!(event_type, volume = %volume, event = %json, "run event"),
            _ => debug!(event_type, volume = %volume, event = %json, "run event"),
        }
        Ok(())
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

/// Keeps every event in memory so a test can ask what a run did.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: parking_lot::RwLock<Vec<DomainEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DomainEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<DomainEvent> {
        self.filtered(|e| e.event_type() == event_type)
    }

    /// Names of all collected events, oldest first.
    pub fn event_types(&self) -> Vec<&'static str> {
        self.events.read().iter().map(|e| e.event_type()).collect()
    }

    /// Events that record something going wrong, oldest first.
    pub fn failures(&self) -> Vec<DomainEvent> {
        self.filtered(DomainEvent::is_failure)
    }

    /// Replica changes, reached states and timeouts of one volume.
    pub fn for_volume(&self, volume_id: &str) -> Vec<DomainEvent> {
        self.filtered(|e| e.volume_id() == Some(volume_id))
    }

    /// `(scenario, passed)` for every finished scenario, in completion order.
    pub fn scenario_outcomes(&self) -> Vec<(String, bool)> {
        self.events
            .read()
            .iter()
            .filter_map(|e| match e {
                DomainEvent::ScenarioCompleted {
                    scenario, passed, ..
                } => Some((scenario.clone(), *passed)),
                _ => None,
            })
            .collect()
    }

    fn filtered(&self, keep: impl Fn(&DomainEvent) -> bool) -> Vec<DomainEvent> {
        self.events.read().iter().filter(|e| keep(e)).cloned().collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        self.events.write().extend(events);
        Ok(())
    }
}

/// Fans events out to several sinks.
///
/// A sink that errors does not starve the ones after it: every sink sees the
/// event and the first error is returned afterwards.
#[derive(Default)]
pub struct CompositeEventPublisher {
    publishers: Vec<Arc<dyn EventPublisher>>,
}

impl CompositeEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_publisher<P: EventPublisher + 'static>(mut self, publisher: P) -> Self {
        self.publishers.push(Arc::new(publisher));
        self
    }

    /// Add a sink that is also held elsewhere, such as a collector.
    pub fn with_shared(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publishers.push(publisher);
        self
    }
}

impl std::fmt::Debug for CompositeEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeEventPublisher")
            .field("sinks", &self.publishers.len())
            .finish()
    }
}

#[async_trait]
impl EventPublisher for CompositeEventPublisher {
    async fn publish(&self, event: DomainEvent) -> Result<()> {
        let mut first_err = None;
        for publisher in &self.publishers {
            if let Err(e) = publisher.publish(event.clone()).await {
                warn!(event_type = event.event_type(), error = %e, "event sink failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    async fn publish_all(&self, events: Vec<DomainEvent>) -> Result<()> {
        let mut first_err = None;
        for publisher in &self.publishers {
            if let Err(e) = publisher.publish_all(events.clone()).await {
                warn!(count = events.len(), error = %e, "event sink failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::*;
    use crate::error::Error;

    struct RejectingSink;

    #[async_trait]
    impl EventPublisher for RejectingSink {
        async fn publish(&self, _event: DomainEvent) -> Result<()> {
            Err(Error::fault("audit", "sink closed"))
        }

        async fn publish_all(&self, _events: Vec<DomainEvent>) -> Result<()> {
            Err(Error::fault("audit", "sink closed"))
        }
    }

    // =========================================================================
    // Logging
    // =========================================================================

    #[test]
    fn test_failures_log_at_warn() {
        let publisher = LoggingEventPublisher::debug_level();
        let timeout = DomainEvent::wait_timed_out("vol-1", "nexus Online", "Degraded");
        let reached = DomainEvent::state_reached("vol-1", "nexus Online", Duration::ZERO);

        assert_eq!(publisher.level_for(&timeout), Level::WARN);
        assert_eq!(publisher.level_for(&reached), Level::DEBUG);
        assert_eq!(LoggingEventPublisher::info_level().level_for(&reached), Level::INFO);
    }

    #[tokio::test]
    async fn test_logging_publisher_accepts_every_level() {
        let publisher = LoggingEventPublisher::info_level();
        publisher
            .publish_all(vec![
                DomainEvent::fault_injected("power-off", "node-1"),
                DomainEvent::fault_failed("power-off", "node-2", "api down"),
            ])
            .await
            .unwrap();
    }

    // =========================================================================
    // Collector
    // =========================================================================

    #[tokio::test]
    async fn test_collector_groups_run_events() {
        let collector = InMemoryEventCollector::new();
        assert!(collector.is_empty());

        collector
            .publish_all(vec![
                DomainEvent::replica_count_changed("vol-1", 1, 3),
                DomainEvent::state_reached("vol-1", "child count 3", Duration::from_secs(4)),
                DomainEvent::replica_count_changed("vol-2", 2, 1),
                DomainEvent::integrity_violation("fio-app", "md5", "bad magic header"),
                DomainEvent::scenario_completed("replica-rebuild", true, Duration::ZERO, None),
                DomainEvent::scenario_completed(
                    "checksum-continuity",
                    false,
                    Duration::ZERO,
                    Some("md5 mismatch".into()),
                ),
            ])
            .await
            .unwrap();

        assert_eq!(collector.len(), 6);
        assert_eq!(
            collector
                .for_volume("vol-1")
                .iter()
                .map(DomainEvent::event_type)
                .collect::<Vec<_>>(),
            vec!["ReplicaCountChanged", "StateReached"]
        );
        assert_eq!(
            collector
                .failures()
                .iter()
                .map(DomainEvent::event_type)
                .collect::<Vec<_>>(),
            vec!["IntegrityViolation", "ScenarioCompleted"]
        );
        assert_eq!(
            collector.scenario_outcomes(),
            vec![
                ("replica-rebuild".to_string(), true),
                ("checksum-continuity".to_string(), false),
            ]
        );
        assert_eq!(collector.events_of_type("ReplicaCountChanged").len(), 2);
    }

    #[test]
    fn test_collector_from_sync_context() {
        let collector = InMemoryEventCollector::new();
        tokio_test::block_on(collector.publish(DomainEvent::pools_restored(1, 0, 2))).unwrap();
        assert_eq!(collector.event_types(), vec!["PoolsRestored"]);
    }

    // =========================================================================
    // Composite
    // =========================================================================

    #[tokio::test]
    async fn test_composite_reaches_shared_collector() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let composite = CompositeEventPublisher::new()
            .with_publisher(LoggingEventPublisher::debug_level())
            .with_shared(collector.clone());

        composite
            .publish_all(vec![
                DomainEvent::pool_deleted("pool-on-node-1"),
                DomainEvent::fault_injected("ungraceful-reboot", "node-2"),
            ])
            .await
            .unwrap();

        assert_eq!(collector.event_types(), vec!["PoolDeleted", "FaultInjected"]);
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_hide_events_from_later_sinks() {
        let collector = Arc::new(InMemoryEventCollector::new());
        let composite = CompositeEventPublisher::new()
            .with_publisher(RejectingSink)
            .with_shared(collector.clone());

        let err = composite
            .publish(DomainEvent::fault_injected("power-off", "node-3"))
            .await
            .unwrap_err();
        assert_matches!(err, Error::FaultInjection { .. });

        let err = composite
            .publish_all(vec![DomainEvent::pool_created("pool-on-node-3", "node-3")])
            .await
            .unwrap_err();
        assert_matches!(err, Error::FaultInjection { .. });

        assert_eq!(collector.event_types(), vec!["FaultInjected", "PoolCreated"]);
    }
}

//! Structured progress eventing.
//!
//! Every long-running operation (pagination discovery, entity batches,
//! rate-limit waits) emits fixed-schema events to a caller-supplied sink so
//! progress surfaces can render live state without scraping logs. Entity
//! batch updates are throttled to at most [`MAX_EVENTS_PER_BATCH`]
//! incremental events plus the final completion event.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;

/// Upper bound on incremental `EntityProgress` events per batch.
pub const MAX_EVENTS_PER_BATCH: u64 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    EntityStart,
    EntityProgress,
    EntityComplete,
    RateLimitWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Batch,
    Discovery,
    RateLimit,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub kind: ProgressKind,
    pub timestamp: DateTime<Utc>,
    pub label: String,
    pub current: u64,
    pub total: u64,
    pub percent: Option<f64>,
    pub operation: OperationType,
    pub status: Option<String>,
    pub success: Option<bool>,
    pub errors: u64,
    pub wait_seconds: f64,
    pub message: Option<String>,
}

impl ProgressEvent {
    fn new(kind: ProgressKind, label: &str, operation: OperationType) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            label: label.to_string(),
            current: 0,
            total: 0,
            percent: None,
            operation,
            status: None,
            success: None,
            errors: 0,
            wait_seconds: 0.0,
            message: None,
        }
    }
}

/// Destination for progress events. Emission must never block or fail the
/// operation that produced the event.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Default sink: events become structured debug logs.
#[derive(Debug, Default)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, event: ProgressEvent) {
        debug!(
            kind = ?event.kind,
            label = %event.label,
            current = event.current,
            total = event.total,
            errors = event.errors,
            wait_seconds = event.wait_seconds,
            "progress"
        );
    }
}

/// Sink that forwards events over an unbounded channel, for UIs and tests.
pub struct ChannelSink(pub tokio::sync::mpsc::UnboundedSender<ProgressEvent>);

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        let _ = self.0.send(event);
    }
}

#[derive(Debug, Default)]
struct EntityState {
    total: u64,
    last_emitted: u64,
    errors: u64,
}

/// Tracks in-flight entity batches and throttles their update events.
#[derive(Clone)]
pub struct ProgressTracker {
    sink: Arc<dyn ProgressSink>,
    state: Arc<Mutex<HashMap<String, EntityState>>>,
}

impl ProgressTracker {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            sink,
            state: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn start_entity(&self, label: &str, total: u64) {
        if total == 0 {
            return;
        }
        self.state
            .lock()
            .insert(label.to_string(), EntityState { total, ..Default::default() });

        let mut event = ProgressEvent::new(ProgressKind::EntityStart, label, OperationType::Batch);
        event.total = total;
        self.sink.emit(event);
    }

    pub fn update_entity(&self, label: &str, processed: u64) {
        let mut state = self.state.lock();
        let Some(entry) = state.get_mut(label) else {
            return;
        };
        let total = entry.total;
        let processed = processed.min(total);
        let min_step = (total / MAX_EVENTS_PER_BATCH).max(1);

        if processed != total && processed.saturating_sub(entry.last_emitted) < min_step {
            return;
        }
        entry.last_emitted = processed;
        let errors = entry.errors;
        drop(state);

        let mut event =
            ProgressEvent::new(ProgressKind::EntityProgress, label, OperationType::Batch);
        event.current = processed;
        event.total = total;
        event.percent = Some((processed as f64 / total as f64 * 100.0 * 100.0).round() / 100.0);
        event.errors = errors;
        self.sink.emit(event);
    }

    pub fn increment_entity_errors(&self, label: &str, increment: u64) {
        if let Some(entry) = self.state.lock().get_mut(label) {
            entry.errors += increment;
        }
    }

    pub fn complete_entity(&self, label: &str, success: bool) {
        let Some(entry) = self.state.lock().remove(label) else {
            return;
        };
        let status = match (success, entry.errors) {
            (true, 0) => "completed",
            (true, _) => "completed_with_errors",
            (false, _) => "terminated_with_error",
        };

        let mut event =
            ProgressEvent::new(ProgressKind::EntityComplete, label, OperationType::Batch);
        event.current = entry.total;
        event.total = entry.total;
        event.percent = success.then_some(100.0);
        event.status = Some(status.to_string());
        event.success = Some(success);
        event.errors = entry.errors;
        event.message = Some(if entry.errors > 0 {
            format!("Completed with {} errors", entry.errors)
        } else {
            "Completed successfully".to_string()
        });
        self.sink.emit(event);
    }

    /// Pagination discovery: running item count, unknown total.
    pub fn discovery_start(&self, label: &str, current: u64) {
        let mut event =
            ProgressEvent::new(ProgressKind::EntityStart, label, OperationType::Discovery);
        event.current = current;
        self.sink.emit(event);
    }

    pub fn discovery_page(&self, label: &str, current: u64) {
        let mut event =
            ProgressEvent::new(ProgressKind::EntityProgress, label, OperationType::Discovery);
        event.current = current;
        self.sink.emit(event);
    }

    pub fn discovery_complete(&self, label: &str, total: u64, status: &str) {
        let mut event =
            ProgressEvent::new(ProgressKind::EntityComplete, label, OperationType::Discovery);
        event.current = total;
        event.total = total;
        event.percent = Some(100.0);
        event.status = Some(status.to_string());
        event.success = Some(true);
        self.sink.emit(event);
    }

    pub fn rate_limit_wait(&self, label: &str, wait_seconds: f64, concurrent: bool) {
        let mut event =
            ProgressEvent::new(ProgressKind::RateLimitWait, label, OperationType::RateLimit);
        event.status = Some("waiting".to_string());
        event.wait_seconds = (wait_seconds * 100.0).round() / 100.0;
        event.message = Some(if concurrent {
            "Waiting for concurrent rate limit...".to_string()
        } else {
            "Waiting for org-wide rate limit...".to_string()
        });
        self.sink.emit(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    #[derive(Default)]
    struct CapturingSink(PlMutex<Vec<ProgressEvent>>);

    impl ProgressSink for CapturingSink {
        fn emit(&self, event: ProgressEvent) {
            self.0.lock().push(event);
        }
    }

    #[test]
    fn test_updates_are_throttled() {
        let sink = Arc::new(CapturingSink::default());
        let tracker = ProgressTracker::new(sink.clone());

        tracker.start_entity("user_batch", 1000);
        for processed in 1..=1000 {
            tracker.update_entity("user_batch", processed);
        }
        tracker.complete_entity("user_batch", true);

        let events = sink.0.lock();
        let updates = events
            .iter()
            .filter(|e| e.kind == ProgressKind::EntityProgress)
            .count();
        assert!(updates <= MAX_EVENTS_PER_BATCH as usize + 1);
        assert_eq!(events.last().unwrap().kind, ProgressKind::EntityComplete);
        assert_eq!(events.last().unwrap().status.as_deref(), Some("completed"));
    }

    #[test]
    fn test_errors_are_accumulated_into_completion() {
        let sink = Arc::new(CapturingSink::default());
        let tracker = ProgressTracker::new(sink.clone());

        tracker.start_entity("app_batch", 10);
        tracker.increment_entity_errors("app_batch", 2);
        tracker.increment_entity_errors("app_batch", 1);
        tracker.complete_entity("app_batch", true);

        let events = sink.0.lock();
        let complete = events.last().unwrap();
        assert_eq!(complete.errors, 3);
        assert_eq!(complete.status.as_deref(), Some("completed_with_errors"));
    }

    #[test]
    fn test_zero_total_batches_emit_nothing() {
        let sink = Arc::new(CapturingSink::default());
        let tracker = ProgressTracker::new(sink.clone());
        tracker.start_entity("empty", 0);
        tracker.update_entity("empty", 0);
        tracker.complete_entity("empty", true);
        assert!(sink.0.lock().is_empty());
    }

    #[test]
    fn test_rate_limit_wait_event_shape() {
        let sink = Arc::new(CapturingSink::default());
        let tracker = ProgressTracker::new(sink.clone());
        tracker.rate_limit_wait("rate_limit_users", 3.456, true);

        let events = sink.0.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ProgressKind::RateLimitWait);
        assert_eq!(events[0].wait_seconds, 3.46);
        assert_eq!(events[0].status.as_deref(), Some("waiting"));
    }
}

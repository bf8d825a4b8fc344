//! Optional observability capability.
//!
//! A [`Tracer`] receives span scoping plus fire-and-forget events. The
//! orchestration core only ever talks to tracers through the [`emit`]
//! helpers, which swallow every tracer error: a broken backend can slow
//! logs down to a `debug!` line but can never alter an orchestration
//! outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use tracing::debug;

/// Result type for tracer operations.
pub type TraceResult<T> = anyhow::Result<T>;

/// Opaque handle for an open span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(pub u64);

/// Pluggable observability sink. Implementations may fail; callers go
/// through [`emit`] so failures stay contained.
pub trait Tracer: Send + Sync {
    /// Open a span. `kind` is a coarse operation class (`"MILESTONE"`,
    /// `"DEBATE"`, ...).
    fn start_span(&self, name: &str, kind: &str, metadata: Value) -> TraceResult<SpanId>;

    /// Close a previously opened span.
    fn end_span(&self, span: SpanId) -> TraceResult<()>;

    /// Record a fire-and-forget event with optional usage annotations.
    fn add_event(
        &self,
        event_type: &str,
        payload: Value,
        cost: Option<f64>,
        tokens: Option<u64>,
    ) -> TraceResult<()>;
}

/// Fail-open wrappers: any tracer error is logged at `debug!` and dropped.
pub mod emit {
    use super::*;

    pub fn span(tracer: &dyn Tracer, name: &str, kind: &str, metadata: Value) -> Option<SpanId> {
        match tracer.start_span(name, kind, metadata) {
            Ok(id) => Some(id),
            Err(error) => {
                debug!(%error, name, "tracer start_span failed (ignored)");
                None
            }
        }
    }

    pub fn end(tracer: &dyn Tracer, span: Option<SpanId>) {
        if let Some(span) = span {
            if let Err(error) = tracer.end_span(span) {
                debug!(%error, "tracer end_span failed (ignored)");
            }
        }
    }

    pub fn event(
        tracer: &dyn Tracer,
        event_type: &str,
        payload: Value,
        cost: Option<f64>,
        tokens: Option<u64>,
    ) {
        if let Err(error) = tracer.add_event(event_type, payload, cost, tokens) {
            debug!(%error, event_type, "tracer add_event failed (ignored)");
        }
    }
}

/// Tracer that does nothing. The default when no backend is wired in.
#[derive(Debug, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn start_span(&self, _name: &str, _kind: &str, _metadata: Value) -> TraceResult<SpanId> {
        Ok(SpanId(0))
    }

    fn end_span(&self, _span: SpanId) -> TraceResult<()> {
        Ok(())
    }

    fn add_event(
        &self,
        _event_type: &str,
        _payload: Value,
        _cost: Option<f64>,
        _tokens: Option<u64>,
    ) -> TraceResult<()> {
        Ok(())
    }
}

/// One event captured by [`RecordingTracer`].
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    pub event_type: String,
    pub payload: Value,
    pub cost: Option<f64>,
    pub tokens: Option<u64>,
}

/// In-memory tracer for tests: records every span and event.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    next_span: AtomicU64,
    spans: Mutex<Vec<(SpanId, String, String)>>,
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn events_of_type(&self, event_type: &str) -> Vec<RecordedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.event_type == event_type)
            .collect()
    }

    pub fn span_names(&self) -> Vec<String> {
        self.spans
            .lock()
            .unwrap()
            .iter()
            .map(|(_, name, _)| name.clone())
            .collect()
    }
}

impl Tracer for RecordingTracer {
    fn start_span(&self, name: &str, kind: &str, metadata: Value) -> TraceResult<SpanId> {
        let _ = metadata;
        let id = SpanId(self.next_span.fetch_add(1, Ordering::Relaxed));
        self.spans
            .lock()
            .unwrap()
            .push((id, name.to_string(), kind.to_string()));
        Ok(id)
    }

    fn end_span(&self, _span: SpanId) -> TraceResult<()> {
        Ok(())
    }

    fn add_event(
        &self,
        event_type: &str,
        payload: Value,
        cost: Option<f64>,
        tokens: Option<u64>,
    ) -> TraceResult<()> {
        self.events.lock().unwrap().push(RecordedEvent {
            event_type: event_type.to_string(),
            payload,
            cost,
            tokens,
        });
        Ok(())
    }
}

/// Tracer whose every call errors. Test fixture proving the fail-open
/// contract: orchestration outcomes must be identical with this wired in.
#[derive(Debug, Default)]
pub struct FailingTracer;

impl Tracer for FailingTracer {
    fn start_span(&self, _name: &str, _kind: &str, _metadata: Value) -> TraceResult<SpanId> {
        anyhow::bail!("tracer backend unavailable")
    }

    fn end_span(&self, _span: SpanId) -> TraceResult<()> {
        anyhow::bail!("tracer backend unavailable")
    }

    fn add_event(
        &self,
        _event_type: &str,
        _payload: Value,
        _cost: Option<f64>,
        _tokens: Option<u64>,
    ) -> TraceResult<()> {
        anyhow::bail!("tracer backend unavailable")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_recording_tracer_captures_events_in_order() {
        let tracer = RecordingTracer::new();
        emit::event(&tracer, "first", json!({"n": 1}), None, None);
        emit::event(&tracer, "second", json!({"n": 2}), Some(0.01), Some(42));

        let events = tracer.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, "first");
        assert_eq!(events[1].tokens, Some(42));
    }

    #[test]
    fn test_emit_swallows_tracer_failures() {
        let tracer = FailingTracer;
        // None of these may panic or propagate.
        let span = emit::span(&tracer, "run", "MILESTONE", json!({}));
        assert!(span.is_none());
        emit::event(&tracer, "anything", json!({}), None, None);
        emit::end(&tracer, span);
    }

    #[test]
    fn test_noop_tracer_accepts_everything() {
        let tracer = NoopTracer;
        let span = emit::span(&tracer, "run", "MILESTONE", json!({}));
        assert!(span.is_some());
        emit::end(&tracer, span);
    }
}

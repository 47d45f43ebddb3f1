//! Event sinks for build observability.
//!
//! Sinks are handed to the executor explicitly; there is no process-wide
//! sink, so concurrent builds in one process never see each other's events.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

use crate::core::BuildEvent;

/// Forwards a [`BuildEvent`] to a sink without blocking.
pub fn emit(sink: &dyn EventSink, event: &BuildEvent) {
    sink.try_emit(&event.event_type, Some(event.payload()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_forwards_payload() {
        let sink = CollectingEventSink::new();
        emit(&sink, &BuildEvent::stage_started("builder"));

        let events = sink.events();
        assert_eq!(events[0].0, "stage.started");
        assert_eq!(events[0].1.as_ref().unwrap()["stage"], "builder");
    }
}

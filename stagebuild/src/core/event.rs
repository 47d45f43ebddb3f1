//! Build events and the linear instruction log.

use super::StageStatus;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An event emitted during a build.
///
/// Events are consumed by event sinks for logging or monitoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildEvent {
    /// The event type (e.g., "stage.started", "step.completed").
    #[serde(rename = "type")]
    pub event_type: String,

    /// When the event occurred (ISO 8601).
    pub timestamp: String,

    /// The event payload data.
    #[serde(default)]
    pub data: HashMap<String, serde_json::Value>,
}

impl BuildEvent {
    /// Creates a new build event.
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            timestamp: crate::utils::iso_timestamp(),
            data: HashMap::new(),
        }
    }

    /// Adds a data field to the event.
    #[must_use]
    pub fn add_data(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }

    /// Converts the payload into a JSON object for sinks.
    #[must_use]
    pub fn payload(&self) -> serde_json::Value {
        serde_json::Value::Object(self.data.clone().into_iter().collect())
    }

    /// Creates a "stage.started" event.
    #[must_use]
    pub fn stage_started(stage: &str) -> Self {
        Self::new("stage.started").add_data("stage", serde_json::json!(stage))
    }

    /// Creates a "stage.completed" event.
    #[must_use]
    pub fn stage_completed(stage: &str, duration_ms: f64) -> Self {
        Self::new("stage.completed")
            .add_data("stage", serde_json::json!(stage))
            .add_data("duration_ms", serde_json::json!(duration_ms))
    }

    /// Creates a "stage.failed" event.
    #[must_use]
    pub fn stage_failed(stage: &str, error: &str) -> Self {
        Self::new("stage.failed")
            .add_data("stage", serde_json::json!(stage))
            .add_data("error", serde_json::json!(error))
    }

    /// Creates a "step.completed" event.
    #[must_use]
    pub fn step_completed(record: &InstructionRecord) -> Self {
        Self::new("step.completed")
            .add_data("stage", serde_json::json!(record.stage))
            .add_data("step", serde_json::json!(record.step))
            .add_data("instruction", serde_json::json!(record.instruction))
    }
}

/// One line of the linear instruction log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionRecord {
    /// Global sequence number across the whole build.
    pub seq: usize,
    /// The stage the instruction belongs to.
    pub stage: String,
    /// Step index within the stage.
    pub step: usize,
    /// Rendered instruction.
    pub instruction: String,
    /// Outcome of the instruction.
    pub status: StageStatus,
    /// Wall time in milliseconds.
    pub duration_ms: f64,
}

/// Append-only log of executed instructions, shared by concurrently
/// running stages.
#[derive(Debug, Default)]
pub struct InstructionLog {
    records: Mutex<Vec<InstructionRecord>>,
}

impl InstructionLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record and returns it with its sequence number set.
    pub fn record(
        &self,
        stage: &str,
        step: usize,
        instruction: String,
        status: StageStatus,
        duration_ms: f64,
    ) -> InstructionRecord {
        let mut records = self.records.lock();
        let record = InstructionRecord {
            seq: records.len(),
            stage: stage.to_string(),
            step,
            instruction,
            status,
            duration_ms,
        };
        records.push(record.clone());
        record
    }

    /// Returns a copy of every record in execution order.
    #[must_use]
    pub fn records(&self) -> Vec<InstructionRecord> {
        self.records.lock().clone()
    }

    /// Returns the first failed record, if any.
    #[must_use]
    pub fn first_failure(&self) -> Option<InstructionRecord> {
        self.records
            .lock()
            .iter()
            .find(|r| r.status == StageStatus::Fail)
            .cloned()
    }

    /// Returns the number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns true if nothing has been logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_creation() {
        let event = BuildEvent::stage_completed("builder", 12.5);
        assert_eq!(event.event_type, "stage.completed");
        assert_eq!(event.data.get("stage"), Some(&serde_json::json!("builder")));
        assert!(event.payload().is_object());
    }

    #[test]
    fn test_instruction_log_sequence() {
        let log = InstructionLog::new();
        log.record("base", 0, "INSTALL libpq-dev".into(), StageStatus::Ok, 1.0);
        let second = log.record("builder", 0, "RUN make".into(), StageStatus::Fail, 2.0);

        assert_eq!(second.seq, 1);
        assert_eq!(log.len(), 2);
        assert_eq!(log.first_failure().map(|r| r.stage), Some("builder".to_string()));
    }
}

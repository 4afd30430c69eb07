//! Trigger events and trigger configuration.
//!
//! Every run is created from an `EventInput`: the payload a trigger (event,
//! cron fire, direct start, or child invocation) delivered to the engine.
//! The event becomes `ctx.input` inside the workflow handler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Event type for directly started runs.
pub const EVENT_TYPE_START: &str = "start";

/// Event type for event-trigger matches.
pub const EVENT_TYPE_EVENT: &str = "event";

/// Event type for cron-trigger fires.
pub const EVENT_TYPE_CRON: &str = "cron";

/// Event type for child workflow invocations.
pub const EVENT_TYPE_INVOKE: &str = "invoke";

/// The input context delivered to a workflow handler as `ctx.input`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventInput {
    /// Unique event id (UUIDv7, time-sortable).
    pub id: Uuid,
    /// Event name (for event triggers) or workflow id (start/cron/invoke).
    pub name: String,
    /// How the event entered the system: "event", "cron", "start", "invoke".
    #[serde(rename = "type")]
    pub event_type: String,
    /// Caller-supplied payload.
    pub data: Value,
    /// Extension metadata (opaque to the engine).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ext: Option<Value>,
    /// When the event was produced.
    pub time: DateTime<Utc>,
}

impl EventInput {
    /// Create an event stamped with a fresh id and the current time.
    pub fn now(name: impl Into<String>, event_type: &str, data: Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            event_type: event_type.to_string(),
            data,
            ext: None,
            time: Utc::now(),
        }
    }
}

/// How a workflow can be triggered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerConfig {
    /// Start a run whenever an event with this name is published.
    Event { name: String },
    /// Start a run on a cron schedule (standard cron or human-readable).
    Cron { schedule: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn event_input_round_trips() {
        let event = EventInput::now("order.created", EVENT_TYPE_EVENT, json!({"order": 7}));
        let json = serde_json::to_string(&event).unwrap();
        let back: EventInput = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert!(json.contains(r#""type":"event""#));
    }

    #[test]
    fn trigger_config_tagged_by_type() {
        let cron = TriggerConfig::Cron {
            schedule: "every 5 minutes".to_string(),
        };
        let json = serde_json::to_value(&cron).unwrap();
        assert_eq!(json["type"], "cron");

        let event: TriggerConfig =
            serde_json::from_value(json!({"type": "event", "name": "user.signup"})).unwrap();
        assert_eq!(
            event,
            TriggerConfig::Event {
                name: "user.signup".to_string()
            }
        );
    }
}

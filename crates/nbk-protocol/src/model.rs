//! Wire shapes of the envelopes.
//!
//! These are plain serde structs; the live envelopes in [`crate::KernelCommandEnvelope`]
//! and [`crate::KernelEventEnvelope`] convert to and from them.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::{CommandType, KernelCommand};
use crate::event::EventType;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelCommandEnvelopeModel {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub command_type: CommandType,
    #[serde(default)]
    pub command: KernelCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_slip: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelEventEnvelopeModel {
    pub event_type: EventType,
    #[serde(default)]
    pub event: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<KernelCommandEnvelopeModel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routing_slip: Option<Vec<String>>,
}

/// A single frame on a transport. Commands carry `commandType`, events carry `eventType`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KernelEnvelopeModel {
    Command(KernelCommandEnvelopeModel),
    Event(KernelEventEnvelopeModel),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn untagged_frames_are_told_apart_by_their_type_field() {
        let command: KernelEnvelopeModel = serde_json::from_value(json!({
            "commandType": "SubmitCode",
            "command": { "code": "1+1", "targetKernelName": "js" },
            "token": "abc",
        }))
        .unwrap();
        assert!(matches!(command, KernelEnvelopeModel::Command(ref c) if c.command_type == "SubmitCode"));

        let event: KernelEnvelopeModel = serde_json::from_value(json!({
            "eventType": "CommandSucceeded",
            "event": {},
            "routingSlip": ["kernel://local/"],
        }))
        .unwrap();
        assert!(matches!(event, KernelEnvelopeModel::Event(ref e) if e.event_type == "CommandSucceeded"));
    }
}

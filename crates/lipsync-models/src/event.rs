//! Progress events streamed to the caller of a run.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::RunStatus;

/// One progress item emitted while a run executes.
///
/// Events arrive in the order they were produced. Inference output lines
/// are forwarded one per event, exactly as the external program printed them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// The run entered a new stage
    Stage { status: RunStatus },
    /// Preprocessing progress, integer percent of frames written
    Preprocessing { percent: u8 },
    /// A line printed by the inference program on standard output
    InferenceOutput { line: String },
    /// A non-fatal problem (degraded detection, cleanup failure)
    Warning { message: String },
}

impl RunEvent {
    pub fn stage(status: RunStatus) -> Self {
        Self::Stage { status }
    }

    pub fn output(line: impl Into<String>) -> Self {
        Self::InferenceOutput { line: line.into() }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::Warning {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(RunEvent::Preprocessing { percent: 42 }).unwrap();
        assert_eq!(json["type"], "preprocessing");
        assert_eq!(json["percent"], 42);

        let json = serde_json::to_value(RunEvent::stage(RunStatus::Inferring)).unwrap();
        assert_eq!(json["type"], "stage");
        assert_eq!(json["status"], "inferring");
    }
}

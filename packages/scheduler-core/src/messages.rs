//! Wire envelopes carried over the message bus. JSON/UTF-8, `serde`-derived,
//! matching the teacher's `PublishedMessage`-adjacent payload style in
//! `kernel/nats.rs`.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobAction {
    Run,
    Cancel,
}

/// Published by the dispatcher to tell a worker to run or cancel a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobActionMessage {
    pub job_name: String,
    pub run_id: Uuid,
    pub action: JobAction,
}

/// Published by a worker as a run progresses through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusMessage {
    pub job_name: String,
    pub run_id: Uuid,
    pub status: String,
}

/// Published periodically by a worker while a run is executing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobHeartbeatMessage {
    pub job_name: String,
    pub run_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_action_message_round_trips_through_json() {
        let msg = JobActionMessage {
            job_name: "nightly-export".to_string(),
            run_id: Uuid::new_v4(),
            action: JobAction::Cancel,
        };
        let bytes = serde_json::to_vec(&msg).unwrap();
        let back: JobActionMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.job_name, msg.job_name);
        assert_eq!(back.run_id, msg.run_id);
        assert_eq!(back.action, JobAction::Cancel);
    }

    #[test]
    fn action_serializes_as_snake_case() {
        let msg = JobActionMessage {
            job_name: "x".to_string(),
            run_id: Uuid::nil(),
            action: JobAction::Run,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"action\":\"run\""));
    }
}

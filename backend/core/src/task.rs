use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::OrgID;

/// Queue that batch producers push to and the worker pool drains.
pub const BATCH_QUEUE: &str = "batch";

/// Resolve a pending start into batches.
pub const TYPE_START_FLOW: &str = "start_flow";
/// Enter one batch of contacts into a messaging flow.
pub const TYPE_START_FLOW_BATCH: &str = "start_flow_batch";
/// Request calls for one batch of contacts of a voice flow.
pub const TYPE_START_IVR_FLOW_BATCH: &str = "start_ivr_flow_batch";
/// Fan a queued broadcast out into batches.
pub const TYPE_SEND_BROADCAST: &str = "send_broadcast";
/// Send one batch of broadcast messages.
pub const TYPE_SEND_BROADCAST_BATCH: &str = "send_broadcast_batch";

/// Scheduling priority of a queued task. Lower weight pops first within an
/// organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    Default,
    Low,
}

impl Priority {
    pub fn weight(&self) -> i64 {
        match self {
            Priority::High => 0,
            Priority::Default => 5,
            Priority::Low => 9,
        }
    }
}

/// A task popped from the queue. The payload stays undecoded so routing and
/// priority decisions never require deserializing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub task_type: String,
    pub org_id: OrgID,
    pub task: serde_json::Value,
    pub queued_on: DateTime<Utc>,
    /// Delivery count, 1 on first pop. At-least-once delivery means this can
    /// exceed 1 after a worker crash.
    #[serde(default)]
    pub attempts: u32,
}

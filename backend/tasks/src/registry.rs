use std::collections::HashMap;

use async_trait::async_trait;

use flowline_core::task::{
    TYPE_SEND_BROADCAST, TYPE_SEND_BROADCAST_BATCH, TYPE_START_FLOW, TYPE_START_FLOW_BATCH,
    TYPE_START_IVR_FLOW_BATCH,
};
use flowline_core::{FlowlineError, OrgID};

use crate::broadcasts::{SendBroadcastBatchTask, SendBroadcastTask};
use crate::context::TaskContext;
use crate::starts::{StartFlowBatchTask, StartFlowTask, StartIvrFlowBatchTask};

/// A typed, decoded queue task ready to execute.
#[async_trait]
pub trait QueueTask: Send + Sync + std::fmt::Debug {
    fn task_type(&self) -> &'static str;

    async fn perform(&self, ctx: &TaskContext, org_id: OrgID) -> Result<(), FlowlineError>;
}

/// Decodes a raw payload into a typed task. Decoders work from JSON text so
/// opaque raw-value fields survive.
pub type Decoder = fn(&str) -> serde_json::Result<Box<dyn QueueTask>>;

/// Maps a task type tag to its decoder. The catalog is open-ended: producers
/// and the worker pool share one registry, and unknown tags are an error at
/// dequeue time rather than a panic.
#[derive(Default)]
pub struct TaskRegistry {
    decoders: HashMap<&'static str, Decoder>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self { decoders: HashMap::new() }
    }

    pub fn register(&mut self, task_type: &'static str, decoder: Decoder) {
        self.decoders.insert(task_type, decoder);
    }

    pub fn read_task(
        &self,
        task_type: &str,
        payload: &serde_json::Value,
    ) -> Result<Box<dyn QueueTask>, FlowlineError> {
        let decoder = self.decoders.get(task_type).ok_or_else(|| {
            FlowlineError::Queue(format!("no task registered for type '{task_type}'"))
        })?;
        decoder(&payload.to_string())
            .map_err(|e| FlowlineError::Queue(format!("decoding '{task_type}' payload: {e}")))
    }

    pub fn task_types(&self) -> Vec<&'static str> {
        self.decoders.keys().copied().collect()
    }
}

/// The standard task catalog.
pub fn default_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry.register(TYPE_START_FLOW, |raw| {
        Ok(Box::new(serde_json::from_str::<StartFlowTask>(raw)?))
    });
    registry.register(TYPE_START_FLOW_BATCH, |raw| {
        Ok(Box::new(serde_json::from_str::<StartFlowBatchTask>(raw)?))
    });
    registry.register(TYPE_START_IVR_FLOW_BATCH, |raw| {
        Ok(Box::new(serde_json::from_str::<StartIvrFlowBatchTask>(raw)?))
    });
    registry.register(TYPE_SEND_BROADCAST, |raw| {
        Ok(Box::new(serde_json::from_str::<SendBroadcastTask>(raw)?))
    });
    registry.register(TYPE_SEND_BROADCAST_BATCH, |raw| {
        Ok(Box::new(serde_json::from_str::<SendBroadcastBatchTask>(raw)?))
    });
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_unknown_type_is_an_error() {
        let registry = default_registry();
        let err = registry.read_task("reticulate_splines", &json!({})).unwrap_err();
        assert!(err.to_string().contains("reticulate_splines"), "{err}");
    }

    #[test]
    fn test_reads_start_flow_payload() {
        let registry = default_registry();
        let payload = json!({
            "start_id": 3,
            "org_id": 1,
            "start_type": "T",
            "flow_id": 7,
            "flow_type": "M",
            "contact_ids": [101, 102]
        });
        let task = registry.read_task(TYPE_START_FLOW, &payload).unwrap();
        assert_eq!(task.task_type(), TYPE_START_FLOW);
    }

    #[test]
    fn test_malformed_payload_is_an_error() {
        let registry = default_registry();
        let err = registry
            .read_task(TYPE_START_FLOW_BATCH, &json!({"start_id": "not-a-number"}))
            .unwrap_err();
        assert!(matches!(err, FlowlineError::Queue(_)), "{err}");
    }

    #[test]
    fn test_default_catalog_is_complete() {
        let registry = default_registry();
        let mut types = registry.task_types();
        types.sort_unstable();
        assert_eq!(
            types,
            vec![
                TYPE_SEND_BROADCAST,
                TYPE_SEND_BROADCAST_BATCH,
                TYPE_START_FLOW,
                TYPE_START_FLOW_BATCH,
                TYPE_START_IVR_FLOW_BATCH,
            ]
        );
    }
}

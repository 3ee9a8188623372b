use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use flowline_core::task::{TYPE_SEND_BROADCAST, TYPE_SEND_BROADCAST_BATCH};
use flowline_core::{BroadcastID, ContactID, FlowlineError, OrgID, Priority, BATCH_QUEUE};
use flowline_starts::{chunk_contacts, START_BATCH_SIZE};
use flowline_store::{Broadcast, BROADCAST_SENT};

use crate::context::TaskContext;
use crate::registry::QueueTask;

/// Fans a queued broadcast out into per-batch send tasks.
#[derive(Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SendBroadcastTask {
    pub broadcast: Broadcast,
}

/// One bounded slice of a broadcast's recipients, the unit of send work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastBatch {
    pub broadcast_id: BroadcastID,
    pub org_id: OrgID,
    pub contact_ids: Vec<ContactID>,
    pub base_language: String,
    pub translations: HashMap<String, String>,
    pub is_last: bool,
    pub total_contacts: usize,
}

impl BroadcastBatch {
    pub fn text(&self) -> Option<&str> {
        self.translations.get(&self.base_language).map(String::as_str)
    }
}

#[async_trait]
impl QueueTask for SendBroadcastTask {
    fn task_type(&self) -> &'static str {
        TYPE_SEND_BROADCAST
    }

    async fn perform(&self, ctx: &TaskContext, org_id: OrgID) -> Result<(), FlowlineError> {
        let broadcast = &self.broadcast;
        let resolved = ctx
            .resolver
            .resolve_contacts(org_id, &broadcast.contact_ids, &broadcast.group_ids)
            .await
            .map_err(|e| FlowlineError::resolution("resolving broadcast recipients", e))?;

        let mut seen: HashSet<ContactID> = HashSet::new();
        let recipients: Vec<ContactID> =
            resolved.into_iter().filter(|c| seen.insert(*c)).collect();

        let total = recipients.len();
        let mut chunks = chunk_contacts(&recipients, START_BATCH_SIZE);
        if chunks.is_empty() {
            chunks.push(Vec::new());
        }
        let batch_count = chunks.len();

        ctx.store.with_tx(|tx| {
            let last = batch_count - 1;
            for (i, chunk) in chunks.into_iter().enumerate() {
                let batch = BroadcastBatch {
                    broadcast_id: broadcast.id,
                    org_id: broadcast.org_id,
                    contact_ids: chunk,
                    base_language: broadcast.base_language.clone(),
                    translations: broadcast.translations.clone(),
                    is_last: i == last,
                    total_contacts: total,
                };
                ctx.queue.push_tx(
                    tx,
                    BATCH_QUEUE,
                    TYPE_SEND_BROADCAST_BATCH,
                    broadcast.org_id,
                    &serde_json::to_value(&batch)?,
                    Priority::Default,
                )?;
            }
            Ok(())
        })?;

        info!(
            broadcast_id = %broadcast.id,
            contacts = total,
            batches = batch_count,
            "broadcast dispatched"
        );
        Ok(())
    }
}

/// Sends one batch of broadcast messages through the channel collaborator.
#[derive(Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SendBroadcastBatchTask {
    pub batch: BroadcastBatch,
}

#[async_trait]
impl QueueTask for SendBroadcastBatchTask {
    fn task_type(&self) -> &'static str {
        TYPE_SEND_BROADCAST_BATCH
    }

    async fn perform(&self, ctx: &TaskContext, org_id: OrgID) -> Result<(), FlowlineError> {
        let batch = &self.batch;
        let text = batch.text().ok_or_else(|| {
            FlowlineError::Validation(format!(
                "broadcast {} has no translation for base language '{}'",
                batch.broadcast_id, batch.base_language
            ))
        })?;

        for contact in &batch.contact_ids {
            // delivery failures are isolated per contact
            if let Err(e) = ctx.sender.send_message(org_id, *contact, text).await {
                warn!(
                    broadcast_id = %batch.broadcast_id,
                    contact_id = %contact,
                    error = %e,
                    "broadcast send failed"
                );
            }
        }
        debug!(broadcast_id = %batch.broadcast_id, sent = batch.contact_ids.len(), "broadcast batch sent");

        if batch.is_last {
            ctx.store.set_broadcast_status(batch.broadcast_id, BROADCAST_SENT)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_ctx;

    use flowline_core::GroupID;

    fn queued_broadcast(ctx: &TaskContext, contacts: Vec<ContactID>) -> Broadcast {
        let translations: HashMap<String, String> = [
            ("eng".to_string(), "Test message".to_string()),
            ("fra".to_string(), "Un Message".to_string()),
        ]
        .into();
        let id = ctx
            .store
            .insert_broadcast(OrgID(1), None, "eng", &translations, &contacts, &[])
            .unwrap();
        ctx.store.get_broadcast(id).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_fans_out_and_batch_sends() {
        let (ctx, _, sender) = test_ctx();
        let broadcast = queued_broadcast(&ctx, vec![ContactID(1), ContactID(2)]);
        let broadcast_id = broadcast.id;

        SendBroadcastTask { broadcast }.perform(&ctx, OrgID(1)).await.unwrap();

        let task = ctx.queue.pop(BATCH_QUEUE).unwrap().unwrap();
        assert_eq!(task.task_type, TYPE_SEND_BROADCAST_BATCH);
        let batch: BroadcastBatch = serde_json::from_str(&task.task.to_string()).unwrap();
        assert_eq!(batch.contact_ids, vec![ContactID(1), ContactID(2)]);
        assert!(batch.is_last);

        SendBroadcastBatchTask { batch }.perform(&ctx, OrgID(1)).await.unwrap();
        assert_eq!(
            sender.sent(),
            vec![(ContactID(1), "Test message".to_string()), (ContactID(2), "Test message".to_string())]
        );
        assert_eq!(
            ctx.store.get_broadcast(broadcast_id).unwrap().unwrap().status,
            BROADCAST_SENT
        );
    }

    #[tokio::test]
    async fn test_broadcast_resolves_groups() {
        let (ctx, _, _) = test_ctx();
        let translations: HashMap<String, String> =
            [("eng".to_string(), "hello".to_string())].into();
        let id = ctx
            .store
            .insert_broadcast(OrgID(1), None, "eng", &translations, &[], &[GroupID(3)])
            .unwrap();
        let broadcast = ctx.store.get_broadcast(id).unwrap().unwrap();

        SendBroadcastTask { broadcast }.perform(&ctx, OrgID(1)).await.unwrap();

        // the passthrough resolver has no group members; an empty terminal
        // batch still goes out so the broadcast reaches sent
        let task = ctx.queue.pop(BATCH_QUEUE).unwrap().unwrap();
        let batch: BroadcastBatch = serde_json::from_str(&task.task.to_string()).unwrap();
        assert!(batch.contact_ids.is_empty());
        assert!(batch.is_last);
    }

    #[tokio::test]
    async fn test_missing_base_translation_is_an_error() {
        let (ctx, _, sender) = test_ctx();
        let batch = BroadcastBatch {
            broadcast_id: BroadcastID(1),
            org_id: OrgID(1),
            contact_ids: vec![ContactID(1)],
            base_language: "spa".to_string(),
            translations: [("eng".to_string(), "hi".to_string())].into(),
            is_last: true,
            total_contacts: 1,
        };
        let err = SendBroadcastBatchTask { batch }.perform(&ctx, OrgID(1)).await.unwrap_err();
        assert!(matches!(err, FlowlineError::Validation(_)), "{err}");
        assert!(sender.sent().is_empty());
    }
}

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use flowline_core::task::{TYPE_START_FLOW, TYPE_START_FLOW_BATCH, TYPE_START_IVR_FLOW_BATCH};
use flowline_core::{read_session_history, FlowlineError, OrgID, SessionHistory};
use flowline_starts::{lifecycle, FlowStart, FlowStartBatch};

use crate::context::TaskContext;
use crate::registry::QueueTask;

/// Resolves a pending start's recipients and fans it out into batch tasks.
#[derive(Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StartFlowTask {
    pub start: FlowStart,
}

#[async_trait]
impl QueueTask for StartFlowTask {
    fn task_type(&self) -> &'static str {
        TYPE_START_FLOW
    }

    async fn perform(&self, ctx: &TaskContext, _org_id: OrgID) -> Result<(), FlowlineError> {
        match lifecycle::resolve_and_dispatch(&ctx.store, &ctx.queue, ctx.resolver.as_ref(), &self.start)
            .await
        {
            // another dispatcher won the start; nothing left to do
            Err(e) if e.is_claim_conflict() => {
                debug!(start_id = ?self.start.id, "start already dispatched");
                Ok(())
            }
            other => other,
        }
    }
}

/// Enters one batch of contacts into a messaging flow.
#[derive(Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StartFlowBatchTask {
    pub batch: FlowStartBatch,
}

#[async_trait]
impl QueueTask for StartFlowBatchTask {
    fn task_type(&self) -> &'static str {
        TYPE_START_FLOW_BATCH
    }

    async fn perform(&self, ctx: &TaskContext, org_id: OrgID) -> Result<(), FlowlineError> {
        perform_start_batch(ctx, org_id, &self.batch, false).await
    }
}

/// Requests calls for one batch of contacts of a voice flow; the flow itself
/// runs when calls are answered.
#[derive(Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StartIvrFlowBatchTask {
    pub batch: FlowStartBatch,
}

#[async_trait]
impl QueueTask for StartIvrFlowBatchTask {
    fn task_type(&self) -> &'static str {
        TYPE_START_IVR_FLOW_BATCH
    }

    async fn perform(&self, ctx: &TaskContext, org_id: OrgID) -> Result<(), FlowlineError> {
        perform_start_batch(ctx, org_id, &self.batch, true).await
    }
}

/// Shared body of the two batch flavors. Engine failures are isolated per
/// contact; anything else is unrecoverable and fails the whole start.
async fn perform_start_batch(
    ctx: &TaskContext,
    org_id: OrgID,
    batch: &FlowStartBatch,
    ivr: bool,
) -> Result<(), FlowlineError> {
    match run_start_batch(ctx, org_id, batch, ivr).await {
        Err(e) => {
            warn!(start_id = %batch.start_id, error = %e, "batch failed, failing start");
            let _ = ctx.store.mark_failed(batch.start_id);
            Err(e)
        }
        ok => ok,
    }
}

async fn run_start_batch(
    ctx: &TaskContext,
    org_id: OrgID,
    batch: &FlowStartBatch,
    ivr: bool,
) -> Result<(), FlowlineError> {
    let history: Option<SessionHistory> = batch
        .session_history
        .as_ref()
        .map(|raw| read_session_history(raw.get()))
        .transpose()
        .map_err(|e| FlowlineError::Validation(format!("invalid session history: {e}")))?;
    let params = decode_opaque(&batch.params, "params")?;
    let parent_summary = decode_opaque(&batch.parent_summary, "parent summary")?;

    let mut entered = 0usize;
    for contact in &batch.contact_ids {
        // at-least-once delivery: skip contacts a previous delivery entered
        if !ctx.store.mark_contact_entered(batch.start_id, *contact)? {
            debug!(start_id = %batch.start_id, contact_id = %contact, "contact already entered, skipping");
            continue;
        }
        let result = if ivr {
            ctx.engine.request_call(org_id, batch.flow_id, *contact).await
        } else {
            ctx.engine
                .enter_flow(
                    org_id,
                    batch.flow_id,
                    *contact,
                    params.as_ref(),
                    parent_summary.as_ref(),
                    history.as_ref(),
                )
                .await
                .map(|_| ())
        };
        match result {
            Ok(()) => entered += 1,
            // one bad contact does not abort the rest of the batch
            Err(e) => {
                warn!(start_id = %batch.start_id, contact_id = %contact, error = %e, "flow entry failed")
            }
        }
    }

    let (done, total) = ctx.store.record_batch_done(batch.start_id)?;
    debug!(start_id = %batch.start_id, entered, done, total, "batch finished");
    if done >= total {
        if ctx.store.mark_complete(batch.start_id)? {
            info!(start_id = %batch.start_id, contacts = batch.total_contacts, "flow start complete");
        }
    }
    Ok(())
}

fn decode_opaque(
    raw: &Option<Box<serde_json::value::RawValue>>,
    label: &str,
) -> Result<Option<serde_json::Value>, FlowlineError> {
    raw.as_ref()
        .map(|r| serde_json::from_str(r.get()))
        .transpose()
        .map_err(|e| FlowlineError::Validation(format!("invalid {label}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_ctx;

    use flowline_core::{ContactID, FlowType, StartStatus, StartType};
    use flowline_starts::FlowStart;

    fn persisted_start(
        ctx: &TaskContext,
        flow_type: FlowType,
        contacts: Vec<ContactID>,
    ) -> FlowStart {
        let flow = ctx
            .store
            .insert_flow(OrgID(1), "favorites", flow_type)
            .unwrap();
        let mut start = FlowStart::new(OrgID(1), StartType::Manual, flow_type, flow)
            .with_contact_ids(contacts);
        start.id = Some(
            ctx.store
                .with_tx(|tx| {
                    ctx.store.insert_start_tx(
                        tx,
                        OrgID(1),
                        flow,
                        StartType::Manual,
                        flow_type,
                        None,
                        "{}",
                    )
                })
                .unwrap(),
        );
        start
    }

    #[tokio::test]
    async fn test_batch_enters_contacts_and_completes() {
        let (ctx, engine, _) = test_ctx();
        let start = persisted_start(&ctx, FlowType::Messaging, vec![ContactID(1), ContactID(2)]);
        let id = start.id.unwrap();
        ctx.store.mark_started(id, 2, 1, &[]).unwrap();

        let batch = start.create_batch(vec![ContactID(1), ContactID(2)], true, 2).unwrap();
        StartFlowBatchTask { batch }.perform(&ctx, OrgID(1)).await.unwrap();

        assert_eq!(engine.entered(), vec![ContactID(1), ContactID(2)]);
        assert_eq!(
            ctx.store.start_status(id).unwrap().unwrap().status,
            StartStatus::Complete
        );
    }

    #[tokio::test]
    async fn test_completion_waits_for_all_batches() {
        let (ctx, _, _) = test_ctx();
        let contacts: Vec<ContactID> = (1..=4).map(ContactID).collect();
        let start = persisted_start(&ctx, FlowType::Messaging, contacts.clone());
        let id = start.id.unwrap();
        ctx.store.mark_started(id, 4, 2, &[]).unwrap();

        // the batch flagged last finishes first; the start must not complete
        let last = start.create_batch(vec![ContactID(3), ContactID(4)], true, 4).unwrap();
        StartFlowBatchTask { batch: last }.perform(&ctx, OrgID(1)).await.unwrap();
        assert_eq!(
            ctx.store.start_status(id).unwrap().unwrap().status,
            StartStatus::Starting
        );

        let first = start.create_batch(vec![ContactID(1), ContactID(2)], false, 4).unwrap();
        StartFlowBatchTask { batch: first }.perform(&ctx, OrgID(1)).await.unwrap();
        assert_eq!(
            ctx.store.start_status(id).unwrap().unwrap().status,
            StartStatus::Complete
        );
    }

    #[tokio::test]
    async fn test_redelivered_batch_skips_entered_contacts() {
        let (ctx, engine, _) = test_ctx();
        let start = persisted_start(&ctx, FlowType::Messaging, vec![ContactID(1), ContactID(2)]);
        let id = start.id.unwrap();
        // two batches recorded so the first perform does not complete the start
        ctx.store.mark_started(id, 2, 2, &[]).unwrap();

        let batch = start.create_batch(vec![ContactID(1), ContactID(2)], false, 2).unwrap();
        StartFlowBatchTask { batch: batch.clone() }.perform(&ctx, OrgID(1)).await.unwrap();
        // redelivery after a simulated crash: no contact is entered twice
        StartFlowBatchTask { batch }.perform(&ctx, OrgID(1)).await.unwrap();

        assert_eq!(engine.entered(), vec![ContactID(1), ContactID(2)]);
    }

    #[tokio::test]
    async fn test_engine_errors_are_isolated_per_contact() {
        let (ctx, engine, _) = test_ctx();
        engine.fail_contact(ContactID(2));
        let start = persisted_start(
            &ctx,
            FlowType::Messaging,
            vec![ContactID(1), ContactID(2), ContactID(3)],
        );
        let id = start.id.unwrap();
        ctx.store.mark_started(id, 3, 1, &[]).unwrap();

        let batch = start
            .create_batch(vec![ContactID(1), ContactID(2), ContactID(3)], true, 3)
            .unwrap();
        StartFlowBatchTask { batch }.perform(&ctx, OrgID(1)).await.unwrap();

        // the bad contact is skipped, the rest entered, the start completes
        assert_eq!(engine.entered(), vec![ContactID(1), ContactID(3)]);
        assert_eq!(
            ctx.store.start_status(id).unwrap().unwrap().status,
            StartStatus::Complete
        );
    }

    #[tokio::test]
    async fn test_ivr_batch_requests_calls() {
        let (ctx, engine, _) = test_ctx();
        let start = persisted_start(&ctx, FlowType::Voice, vec![ContactID(1)]);
        let id = start.id.unwrap();
        ctx.store.mark_started(id, 1, 1, &[]).unwrap();

        let batch = start.create_batch(vec![ContactID(1)], true, 1).unwrap();
        StartIvrFlowBatchTask { batch }.perform(&ctx, OrgID(1)).await.unwrap();

        assert_eq!(engine.called(), vec![ContactID(1)]);
        assert!(engine.entered().is_empty());
    }

    #[tokio::test]
    async fn test_empty_last_batch_completes_start() {
        let (ctx, engine, _) = test_ctx();
        let start = persisted_start(&ctx, FlowType::Messaging, vec![]);
        let id = start.id.unwrap();
        ctx.store.mark_started(id, 0, 1, &[]).unwrap();

        let batch = start.create_batch(vec![], true, 0).unwrap();
        StartFlowBatchTask { batch }.perform(&ctx, OrgID(1)).await.unwrap();

        assert!(engine.entered().is_empty());
        assert_eq!(
            ctx.store.start_status(id).unwrap().unwrap().status,
            StartStatus::Complete
        );
    }

    #[tokio::test]
    async fn test_start_flow_task_dispatches_batches() {
        let (ctx, _, _) = test_ctx();
        let start = persisted_start(&ctx, FlowType::Messaging, vec![ContactID(1)]);

        StartFlowTask { start: start.clone() }.perform(&ctx, OrgID(1)).await.unwrap();
        // second delivery of the same task loses the claim and is a no-op
        StartFlowTask { start }.perform(&ctx, OrgID(1)).await.unwrap();

        assert_eq!(ctx.queue.size(flowline_core::BATCH_QUEUE).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_never_pending_straight_to_complete() {
        // the lifecycle path always passes through starting
        let (ctx, _, _) = test_ctx();
        let start = persisted_start(&ctx, FlowType::Messaging, vec![ContactID(1)]);
        let id = start.id.unwrap();
        assert_eq!(
            ctx.store.start_status(id).unwrap().unwrap().status,
            StartStatus::Pending
        );

        StartFlowTask { start }.perform(&ctx, OrgID(1)).await.unwrap();
        assert_eq!(
            ctx.store.start_status(id).unwrap().unwrap().status,
            StartStatus::Starting
        );

        let task = ctx.queue.pop(flowline_core::BATCH_QUEUE).unwrap().unwrap();
        let batch: FlowStartBatch = serde_json::from_str(&task.task.to_string()).unwrap();
        StartFlowBatchTask { batch }.perform(&ctx, OrgID(1)).await.unwrap();
        assert_eq!(
            ctx.store.start_status(id).unwrap().unwrap().status,
            StartStatus::Complete
        );
    }

}

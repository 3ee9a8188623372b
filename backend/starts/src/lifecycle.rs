use std::collections::HashSet;

use tracing::info;

use flowline_core::{
    read_session_history, ContactID, ContactResolver, FlowlineError, Priority, StartID,
    BATCH_QUEUE,
};
use flowline_core::task::{TYPE_START_FLOW, TYPE_START_FLOW_BATCH, TYPE_START_IVR_FLOW_BATCH};
use flowline_core::FlowType;
use flowline_queue::Queue;
use flowline_store::Store;

use crate::models::{chunk_contacts, FlowStart, START_BATCH_SIZE};

/// Starts triggered from within a running flow are refused once this many
/// ancestor sessions have passed without contact input, to stop runaway
/// flow-triggers-flow recursion.
pub const MAX_ANCESTORS_SINCE_INPUT: u32 = 5;

/// Validate a start spec, persist it pending, and enqueue the `start_flow`
/// task that will resolve and dispatch it. The insert and the enqueue commit
/// together. This is the only entry point for initiating a start.
pub async fn create_start(
    store: &Store,
    queue: &Queue,
    mut start: FlowStart,
) -> Result<StartID, FlowlineError> {
    if !start.has_recipients() {
        return Err(FlowlineError::Validation(
            "start must specify contacts, groups, urns or a query".into(),
        ));
    }

    let flow = store
        .get_flow(start.flow_id)?
        .ok_or_else(|| FlowlineError::Validation(format!("no such flow: {}", start.flow_id)))?;
    if flow.org_id != start.org_id {
        return Err(FlowlineError::Validation(format!(
            "flow {} does not belong to org {}",
            start.flow_id, start.org_id
        )));
    }
    if flow.is_archived {
        return Err(FlowlineError::Validation(format!(
            "flow {} is archived",
            start.flow_id
        )));
    }
    // the catalog is authoritative for the flow's category
    start.flow_type = flow.flow_type;

    if let Some(history) = &start.session_history {
        let history = read_session_history(history.get())
            .map_err(|e| FlowlineError::Validation(format!("invalid session history: {e}")))?;
        if history.ancestors_since_input >= MAX_ANCESTORS_SINCE_INPUT {
            return Err(FlowlineError::Validation(format!(
                "too many ancestor sessions without input: {}",
                history.ancestors_since_input
            )));
        }
    }

    let id = store.with_tx(|tx| {
        let spec = serde_json::to_string(&start)?;
        let id = store.insert_start_tx(
            tx,
            start.org_id,
            start.flow_id,
            start.start_type,
            start.flow_type,
            start.created_by_id,
            &spec,
        )?;
        start.id = Some(id);
        queue.push_tx(
            tx,
            BATCH_QUEUE,
            TYPE_START_FLOW,
            start.org_id,
            &to_payload(&start)?,
            Priority::Default,
        )?;
        Ok(id)
    })?;

    info!(start_id = %id, org_id = %start.org_id, flow_id = %start.flow_id, "flow start created");
    Ok(id)
}

/// Load a persisted start by id, rehydrating its immutable spec.
pub fn load_start(store: &Store, id: StartID) -> Result<Option<FlowStart>, FlowlineError> {
    let Some(spec) = store.get_start_spec(id)? else {
        return Ok(None);
    };
    let mut start: FlowStart = serde_json::from_str(&spec)
        .map_err(|e| FlowlineError::Storage(format!("corrupt start spec {id}: {e}")))?;
    start.id = Some(id);
    Ok(Some(start))
}

/// Compute the full recipient set of a pending start, split it into batches
/// and enqueue them.
///
/// The `pending -> starting` claim, the recorded counts and every batch push
/// commit in a single transaction, so a reader that observes `starting` knows
/// all batches are on the queue. Collaborator failures surface as Resolution
/// errors with the start left pending for a retry; losing the claim to a
/// concurrent dispatcher is a ClaimConflict the caller simply skips.
pub async fn resolve_and_dispatch(
    store: &Store,
    queue: &Queue,
    resolver: &dyn ContactResolver,
    start: &FlowStart,
) -> Result<(), FlowlineError> {
    let id = start.id.ok_or_else(|| {
        FlowlineError::Validation("cannot dispatch a start that has not been persisted".into())
    })?;
    let org_id = start.org_id;

    // recipient set union, deduplicated in first-seen order
    let mut seen: HashSet<ContactID> = HashSet::new();
    let mut recipients: Vec<ContactID> = Vec::new();

    if !start.contact_ids.is_empty() || !start.group_ids.is_empty() {
        let ids = resolver
            .resolve_contacts(org_id, &start.contact_ids, &start.group_ids)
            .await
            .map_err(|e| FlowlineError::resolution("resolving contacts and groups", e))?;
        extend_unique(&mut recipients, &mut seen, ids);
    }
    if let Some(query) = &start.query {
        let ids = resolver
            .resolve_query(org_id, query, &start.exclude_group_ids)
            .await
            .map_err(|e| FlowlineError::resolution("resolving query", e))?;
        extend_unique(&mut recipients, &mut seen, ids);
    }
    let mut created: Vec<ContactID> = Vec::new();
    if !start.urns.is_empty() {
        let resolutions = resolver
            .resolve_urns(org_id, &start.urns, start.create_contact)
            .await
            .map_err(|e| FlowlineError::resolution("resolving urns", e))?;
        for resolution in resolutions {
            if resolution.created {
                created.push(resolution.contact_id);
            }
            extend_unique(&mut recipients, &mut seen, [resolution.contact_id]);
        }
    }

    if !start.exclusions.is_empty() && !recipients.is_empty() {
        recipients = resolver
            .apply_exclusions(org_id, &start.exclusions, &recipients)
            .await
            .map_err(|e| FlowlineError::resolution("applying exclusions", e))?;
    }
    if !start.exclude_group_ids.is_empty() && !recipients.is_empty() {
        let excluded: HashSet<ContactID> = resolver
            .resolve_contacts(org_id, &[], &start.exclude_group_ids)
            .await
            .map_err(|e| FlowlineError::resolution("resolving exclude groups", e))?
            .into_iter()
            .collect();
        recipients.retain(|c| !excluded.contains(c));
    }

    let total = recipients.len();
    let mut chunks = chunk_contacts(&recipients, START_BATCH_SIZE);
    if chunks.is_empty() {
        // zero recipients still get a terminal batch so the start completes
        chunks.push(Vec::new());
    }
    let task_type = match start.flow_type {
        FlowType::Voice => TYPE_START_IVR_FLOW_BATCH,
        FlowType::Messaging => TYPE_START_FLOW_BATCH,
    };

    let batch_count = chunks.len();
    let claimed = store.with_tx(|tx| {
        if !store.mark_started_tx(tx, id, total as i64, batch_count as i64, &created)? {
            return Ok(false);
        }
        let last = batch_count - 1;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let batch = start.create_batch(chunk, i == last, total)?;
            queue.push_tx(
                tx,
                BATCH_QUEUE,
                task_type,
                org_id,
                &to_payload(&batch)?,
                Priority::Default,
            )?;
        }
        Ok(true)
    })?;
    if !claimed {
        return Err(FlowlineError::ClaimConflict(format!("start {id}")));
    }

    info!(
        start_id = %id,
        org_id = %org_id,
        contacts = total,
        batches = batch_count,
        "flow start dispatched"
    );
    Ok(())
}

fn extend_unique(
    recipients: &mut Vec<ContactID>,
    seen: &mut HashSet<ContactID>,
    ids: impl IntoIterator<Item = ContactID>,
) {
    for id in ids {
        if seen.insert(id) {
            recipients.push(id);
        }
    }
}

/// Serialize through text so opaque raw-JSON fields survive the trip into a
/// queue payload.
fn to_payload<T: serde::Serialize>(value: &T) -> anyhow::Result<serde_json::Value> {
    Ok(serde_json::from_str(&serde_json::to_string(value)?)?)
}

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use flowline_core::task::TYPE_START_FLOW;
use flowline_core::{FlowlineError, Priority, StartType, BATCH_QUEUE};
use flowline_queue::Queue;
use flowline_starts::FlowStart;
use flowline_store::Store;

/// Advisory lock name for the campaign-fire driver.
pub const CAMPAIGNS_LOCK: &str = "fire_campaign_events";

/// One tick of the campaign-fire driver: find unfired event fires whose time
/// has passed, grouped per (event, flow), and convert each group into one
/// start of exactly the claimed contacts.
///
/// The claim and the start creation commit in a single transaction, so a fire
/// is stamped at most once ever and always together with the start that
/// consumes it. A group whose fires were claimed by a concurrent tick is
/// skipped; a group that errors is logged and does not stop the others.
pub async fn fire_campaign_events(
    store: &Store,
    queue: &Queue,
    now: DateTime<Utc>,
) -> Result<usize, FlowlineError> {
    let groups = store.due_fire_groups(now)?;
    let mut started = 0usize;

    for group in groups {
        let outcome = store.with_tx(|tx| {
            let claimed = store.claim_fires_tx(tx, &group.fire_ids(), now)?;
            if claimed.is_empty() {
                return Ok(None);
            }
            let contacts = group.contacts_for(&claimed);
            let mut start =
                FlowStart::new(group.org_id, StartType::Campaign, group.flow_type, group.flow_id)
                    .with_contact_ids(contacts);
            let spec = serde_json::to_string(&start)?;
            let id = store.insert_start_tx(
                tx,
                group.org_id,
                group.flow_id,
                start.start_type,
                start.flow_type,
                None,
                &spec,
            )?;
            start.id = Some(id);
            queue.push_tx(
                tx,
                BATCH_QUEUE,
                TYPE_START_FLOW,
                group.org_id,
                &serde_json::to_value(&start)?,
                Priority::Default,
            )?;
            Ok(Some((id, claimed.len())))
        });

        match outcome {
            Ok(Some((start_id, fires))) => {
                started += 1;
                info!(
                    start_id = %start_id,
                    event_id = %group.event_id,
                    flow_id = %group.flow_id,
                    fires,
                    "campaign event fired"
                );
            }
            Ok(None) => {
                debug!(event_id = %group.event_id, "fires already claimed, skipping");
            }
            Err(e) => {
                error!(event_id = %group.event_id, error = %e, "error firing campaign event");
            }
        }
    }

    Ok(started)
}

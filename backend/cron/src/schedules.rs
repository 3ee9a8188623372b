use chrono::{DateTime, Utc};
use tracing::{error, info};

use flowline_core::task::{TYPE_SEND_BROADCAST, TYPE_START_FLOW};
use flowline_core::{FlowlineError, Priority, StartType, BATCH_QUEUE};
use flowline_queue::Queue;
use flowline_starts::FlowStart;
use flowline_store::{Schedule, Store, BROADCAST_QUEUED};

/// Advisory lock name for the schedule-fire driver.
pub const SCHEDULES_LOCK: &str = "run_schedules";

/// One tick of the schedule-fire driver: process every active schedule due at
/// or before `now`, in `next_fire` order. A failure on one schedule is logged
/// and counted; the remaining due schedules still run.
pub async fn check_schedules(
    store: &Store,
    queue: &Queue,
    now: DateTime<Utc>,
) -> Result<usize, FlowlineError> {
    let due = store.due_schedules(now)?;
    let mut fired = 0usize;
    let mut errored = 0usize;

    for schedule in due {
        match fire_schedule(store, queue, &schedule, now) {
            Ok(()) => fired += 1,
            Err(e) => {
                errored += 1;
                error!(schedule_id = %schedule.id, error = %e, "error firing schedule");
            }
        }
    }

    if fired > 0 || errored > 0 {
        info!(fired, errored, "schedules checked");
    }
    Ok(fired)
}

/// Fire one schedule: create whatever it is bound to (a flow trigger start or
/// a re-materialized broadcast) and advance `next_fire`/`last_fire`, all in
/// one transaction.
fn fire_schedule(
    store: &Store,
    queue: &Queue,
    schedule: &Schedule,
    now: DateTime<Utc>,
) -> Result<(), FlowlineError> {
    // last_fire records the scheduled time being processed, not wall clock
    let fire_time = schedule.next_fire.unwrap_or(now);
    let next_fire = schedule.repeat_period.advance(fire_time, now);

    if let Some(trigger) = store.trigger_for_schedule(schedule.id)? {
        let flow = store.get_flow(trigger.flow_id)?.ok_or_else(|| {
            FlowlineError::Validation(format!(
                "trigger {} references missing flow {}",
                trigger.id, trigger.flow_id
            ))
        })?;
        let mut start =
            FlowStart::new(trigger.org_id, StartType::Trigger, flow.flow_type, trigger.flow_id)
                .with_contact_ids(trigger.contact_ids.clone())
                .with_group_ids(trigger.group_ids.clone());

        let start_id = store.with_tx(|tx| {
            let spec = serde_json::to_string(&start)?;
            let id = store.insert_start_tx(
                tx,
                start.org_id,
                start.flow_id,
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
                start.org_id,
                &serde_json::to_value(&start)?,
                Priority::Default,
            )?;
            store.set_schedule_fired_tx(tx, schedule.id, fire_time, next_fire)?;
            Ok(id)
        })?;
        info!(schedule_id = %schedule.id, start_id = %start_id, flow_id = %trigger.flow_id, "schedule fired flow start");
    } else if let Some(broadcast) = store.broadcast_for_schedule(schedule.id)? {
        let broadcast_id = store.with_tx(|tx| {
            let id = store.clone_broadcast_tx(tx, &broadcast)?;
            let mut clone = broadcast.clone();
            clone.id = id;
            clone.parent_id = Some(broadcast.id);
            clone.schedule_id = None;
            clone.status = BROADCAST_QUEUED.to_string();
            queue.push_tx(
                tx,
                BATCH_QUEUE,
                TYPE_SEND_BROADCAST,
                broadcast.org_id,
                &serde_json::to_value(&clone)?,
                Priority::Default,
            )?;
            store.set_schedule_fired_tx(tx, schedule.id, fire_time, next_fire)?;
            Ok(id)
        })?;
        info!(schedule_id = %schedule.id, broadcast_id = %broadcast_id, "schedule fired broadcast");
    } else {
        // nothing bound; still record the fire so the schedule advances
        store.with_tx(|tx| store.set_schedule_fired_tx(tx, schedule.id, fire_time, next_fire))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use chrono::Duration;

    use flowline_core::{ContactID, FlowType, GroupID, OrgID, RepeatPeriod};

    fn test_env() -> (Store, Queue) {
        let path = std::env::temp_dir().join(format!("flowline-sched-{}.db", uuid::Uuid::new_v4()));
        let path = path.to_str().unwrap().to_string();
        (Store::open(&path).unwrap(), Queue::open(&path).unwrap())
    }

    #[tokio::test]
    async fn test_one_shot_trigger_schedule_fires_once() {
        let (store, queue) = test_env();
        let now = Utc::now();
        let flow = store.insert_flow(OrgID(1), "favorites", FlowType::Messaging).unwrap();
        let schedule = store
            .insert_schedule(OrgID(1), RepeatPeriod::Never, Some(now - Duration::days(1)))
            .unwrap();
        store
            .insert_schedule_trigger(
                OrgID(1),
                schedule,
                flow,
                &[ContactID(1), ContactID(2)],
                &[GroupID(3)],
            )
            .unwrap();

        assert_eq!(check_schedules(&store, &queue, now).await.unwrap(), 1);

        // exactly one trigger-typed start, still pending, with the trigger's
        // recipients carried on the spec
        let task = queue.pop(BATCH_QUEUE).unwrap().unwrap();
        assert_eq!(task.task_type, TYPE_START_FLOW);
        assert_eq!(task.task["start_type"], "T");
        assert_eq!(task.task["contact_ids"], serde_json::json!([1, 2]));
        assert_eq!(task.task["group_ids"], serde_json::json!([3]));
        assert!(queue.pop(BATCH_QUEUE).unwrap().is_none());

        // one-shot: next_fire cleared, last_fire records the processed time
        let fired = store.get_schedule(schedule).unwrap().unwrap();
        assert_eq!(fired.next_fire, None);
        assert!(fired.last_fire.is_some());

        // a second tick finds nothing due
        assert_eq!(check_schedules(&store, &queue, now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_broadcast_schedule_rematerializes() {
        let (store, queue) = test_env();
        let now = Utc::now();
        let schedule = store
            .insert_schedule(OrgID(1), RepeatPeriod::Never, Some(now - Duration::days(1)))
            .unwrap();
        let translations: HashMap<String, String> = [
            ("eng".to_string(), "Test message".to_string()),
            ("fra".to_string(), "Un Message".to_string()),
        ]
        .into();
        let parent = store
            .insert_broadcast(OrgID(1), Some(schedule), "eng", &translations, &[ContactID(9)], &[GroupID(3)])
            .unwrap();

        assert_eq!(check_schedules(&store, &queue, now).await.unwrap(), 1);

        let task = queue.pop(BATCH_QUEUE).unwrap().unwrap();
        assert_eq!(task.task_type, TYPE_SEND_BROADCAST);
        assert_eq!(task.task["parent_id"], parent.0);
        assert_eq!(task.task["status"], "Q");
        assert_eq!(task.task["translations"]["eng"], "Test message");
        assert_eq!(task.task["contact_ids"], serde_json::json!([9]));
    }

    #[tokio::test]
    async fn test_repeating_schedule_advances() {
        let (store, queue) = test_env();
        let now = Utc::now();
        let missed = now - Duration::days(3);
        let schedule = store
            .insert_schedule(OrgID(1), RepeatPeriod::Daily, Some(missed))
            .unwrap();

        check_schedules(&store, &queue, now).await.unwrap();

        let fired = store.get_schedule(schedule).unwrap().unwrap();
        let next = fired.next_fire.unwrap();
        assert!(next > now);
        assert_eq!(next, missed + Duration::days(4));
        assert_eq!(fired.last_fire.unwrap(), missed);
    }

    #[tokio::test]
    async fn test_one_bad_schedule_does_not_abort_the_tick() {
        let (store, queue) = test_env();
        let now = Utc::now();

        // earlier schedule bound to a trigger with a missing flow
        let broken = store
            .insert_schedule(OrgID(1), RepeatPeriod::Never, Some(now - Duration::days(2)))
            .unwrap();
        store
            .insert_schedule_trigger(OrgID(1), broken, flowline_core::FlowID(999), &[ContactID(1)], &[])
            .unwrap();

        let flow = store.insert_flow(OrgID(1), "favorites", FlowType::Messaging).unwrap();
        let healthy = store
            .insert_schedule(OrgID(1), RepeatPeriod::Never, Some(now - Duration::days(1)))
            .unwrap();
        store
            .insert_schedule_trigger(OrgID(1), healthy, flow, &[ContactID(2)], &[])
            .unwrap();

        assert_eq!(check_schedules(&store, &queue, now).await.unwrap(), 1);

        // the healthy schedule fired despite the broken one erroring first
        assert!(store.get_schedule(healthy).unwrap().unwrap().last_fire.is_some());
        assert!(store.get_schedule(broken).unwrap().unwrap().last_fire.is_none());
        assert_eq!(queue.size(BATCH_QUEUE).unwrap(), 1);
    }
}

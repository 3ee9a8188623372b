use std::future::Future;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use flowline_core::FlowlineError;
use flowline_store::Store;

/// A cron body must finish well within this; an expired lock is usurped by
/// the next tick anywhere in the fleet.
const CRON_LOCK_TTL: Duration = Duration::from_secs(600);

/// Run a cron body on a fixed interval, guarded by a named advisory lock so
/// only one process in the fleet executes it at a time. A tick that fails to
/// take the lock is skipped silently; a tick whose body errors logs and keeps
/// the loop alive. Spawn this as its own task.
pub async fn run_cron<F, Fut>(store: Store, lock_name: &'static str, interval: Duration, body: F)
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<usize, FlowlineError>> + Send,
{
    let owner = format!("{}-{}", lock_name, Uuid::new_v4());
    info!(cron = lock_name, interval_secs = interval.as_secs(), "cron driver started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        ticker.tick().await;

        match store.try_acquire_lock(lock_name, &owner, CRON_LOCK_TTL) {
            Ok(true) => {
                let started = Instant::now();
                match body().await {
                    Ok(processed) => debug!(
                        cron = lock_name,
                        processed,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "cron tick complete"
                    ),
                    Err(e) => error!(cron = lock_name, error = %e, "cron tick failed"),
                }
                if let Err(e) = store.release_lock(lock_name, &owner) {
                    warn!(cron = lock_name, error = %e, "failed to release cron lock");
                }
            }
            Ok(false) => debug!(cron = lock_name, "lock held elsewhere, skipping tick"),
            Err(e) => error!(cron = lock_name, error = %e, "cron lock check failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn test_store() -> Store {
        let path = std::env::temp_dir().join(format!("flowline-cron-{}.db", Uuid::new_v4()));
        Store::open(path.to_str().unwrap()).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_held_lock_skips_ticks() {
        let store = test_store();
        assert!(store
            .try_acquire_lock("test_cron", "someone-else", Duration::from_secs(600))
            .unwrap());

        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let cron_store = store.clone();
        tokio::spawn(async move {
            run_cron(cron_store, "test_cron", Duration::from_millis(10), move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(0)
                }
            })
            .await;
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        store.release_lock("test_cron", "someone-else").unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(runs.load(Ordering::SeqCst) > 0);
    }
}

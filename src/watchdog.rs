//! Watchdog: periodic scan for silently stalled task threads.
//!
//! A task that is `active` or `blocked`, old enough to have been expected
//! to report, and without a heartbeat inside the threshold gets exactly one
//! alert per stall: an `error` log on the task, a `task.stale` event, and a
//! dashboard broadcast. When the task resumes heartbeating it leaves the
//! alerted set, so a later stall alerts again.

use crate::api::ws::Broadcaster;
use crate::company::tasks::{TaskLogType, TaskStore};
use crate::events::TaskEvent;
use std::collections::HashSet;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

pub struct Watchdog {
    tasks: TaskStore,
    events: broadcast::Sender<TaskEvent>,
    broadcaster: Broadcaster,
    stale_threshold_ms: i64,
    check_interval: std::time::Duration,
}

impl Watchdog {
    pub fn new(
        tasks: TaskStore,
        events: broadcast::Sender<TaskEvent>,
        broadcaster: Broadcaster,
        stale_threshold_ms: i64,
        check_interval_ms: u64,
    ) -> Self {
        Self {
            tasks,
            events,
            broadcaster,
            stale_threshold_ms,
            check_interval: std::time::Duration::from_millis(check_interval_ms),
        }
    }

    /// Run as a daemon task bound to the process lifetime. Exits promptly
    /// on the shutdown signal; the pending timer is dropped with the task.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut alerted: HashSet<String> = HashSet::new();
            let mut ticker = tokio::time::interval(self.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                if *shutdown.borrow() {
                    break;
                }
                tokio::select! {
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => self.scan(&mut alerted).await,
                }
            }
            tracing::info!("watchdog stopped");
        })
    }

    /// One scan pass. Kept separate from the loop so tests drive it
    /// directly without timers.
    async fn scan(&self, alerted: &mut HashSet<String>) {
        let stale = match self.tasks.get_stale_tasks(self.stale_threshold_ms).await {
            Ok(stale) => stale,
            Err(error) => {
                tracing::warn!(%error, "watchdog scan failed");
                return;
            }
        };

        // Recovered tasks leave the alerted set so a repeat stall re-alerts.
        let stale_ids: HashSet<&str> = stale.iter().map(|task| task.id.as_str()).collect();
        alerted.retain(|id| stale_ids.contains(id.as_str()));

        for task in stale {
            if !alerted.insert(task.id.clone()) {
                continue;
            }

            tracing::warn!(
                task_id = %task.id,
                agent_id = %task.agent_id,
                last_heartbeat_at = ?task.last_heartbeat_at,
                "task has gone stale"
            );

            if let Err(error) = self
                .tasks
                .append_log(
                    &task.id,
                    &task.agent_id,
                    TaskLogType::Error,
                    "No heartbeat within the stale threshold",
                    None,
                )
                .await
            {
                tracing::warn!(%error, task_id = %task.id, "failed to record stale log");
            }

            let event = TaskEvent::Stale { task: task.clone() };
            self.broadcaster.broadcast(event.name(), event.payload());
            let _ = self.events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::company::tasks::{CreateTaskOptions, LogQuery, TaskLogType};
    use crate::db::CompanyDb;
    use crate::events;
    use sqlx::SqlitePool;

    const THRESHOLD: i64 = 60_000;

    async fn fixture() -> (Watchdog, TaskStore, SqlitePool, broadcast::Receiver<TaskEvent>) {
        let db = CompanyDb::connect_in_memory().await.expect("open db");
        let bus = events::bus();
        let store = TaskStore::new(db.tasks.clone(), bus.clone());
        let watchdog = Watchdog::new(
            store.clone(),
            bus.clone(),
            Broadcaster::new(),
            THRESHOLD,
            120_000,
        );
        let receiver = bus.subscribe();
        (watchdog, store, db.tasks, receiver)
    }

    async fn age_task(pool: &SqlitePool, task_id: &str, by_ms: i64) {
        sqlx::query(
            "UPDATE tasks SET created_at = created_at - ?1, updated_at = updated_at - ?1, \
             last_heartbeat_at = CASE WHEN last_heartbeat_at IS NULL THEN NULL \
                                      ELSE last_heartbeat_at - ?1 END \
             WHERE id = ?2",
        )
        .bind(by_ms)
        .bind(task_id)
        .execute(pool)
        .await
        .expect("age task");
    }

    fn drain_stale_events(receiver: &mut broadcast::Receiver<TaskEvent>) -> usize {
        let mut count = 0;
        while let Ok(event) = receiver.try_recv() {
            if matches!(event, TaskEvent::Stale { .. }) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn stale_task_alerts_once_per_stall() {
        let (watchdog, store, pool, mut events) = fixture().await;
        let task = store
            .create_task("builder", "stalls silently", CreateTaskOptions::default())
            .await
            .expect("create");
        age_task(&pool, &task.id, THRESHOLD * 2).await;

        let mut alerted = HashSet::new();
        watchdog.scan(&mut alerted).await;
        watchdog.scan(&mut alerted).await;

        assert_eq!(drain_stale_events(&mut events), 1, "one alert per stall");

        let logs = store
            .get_logs(&task.id, LogQuery::default())
            .await
            .expect("logs");
        let errors = logs
            .iter()
            .filter(|log| log.log_type == TaskLogType::Error)
            .count();
        assert_eq!(errors, 1);
    }

    #[tokio::test]
    async fn recovery_clears_the_alert_and_restall_realerts() {
        let (watchdog, store, pool, mut events) = fixture().await;
        let task = store
            .create_task("builder", "stall, recover, stall", CreateTaskOptions::default())
            .await
            .expect("create");
        age_task(&pool, &task.id, THRESHOLD * 2).await;

        let mut alerted = HashSet::new();
        watchdog.scan(&mut alerted).await;
        assert_eq!(drain_stale_events(&mut events), 1);

        // The task comes back: heartbeat pulls it out of the stale set.
        store
            .heartbeat(&task.id, "builder", None)
            .await
            .expect("heartbeat");
        watchdog.scan(&mut alerted).await;
        assert!(alerted.is_empty(), "recovered task leaves the alerted set");
        assert_eq!(drain_stale_events(&mut events), 0);

        // It stalls again: the alert fires a second time.
        age_task(&pool, &task.id, THRESHOLD * 2).await;
        watchdog.scan(&mut alerted).await;
        assert_eq!(drain_stale_events(&mut events), 1);
    }

    #[tokio::test]
    async fn young_tasks_are_left_alone() {
        let (watchdog, store, _pool, mut events) = fixture().await;
        store
            .create_task("builder", "just started", CreateTaskOptions::default())
            .await
            .expect("create");

        let mut alerted = HashSet::new();
        watchdog.scan(&mut alerted).await;

        assert!(alerted.is_empty());
        assert_eq!(drain_stale_events(&mut events), 0);
    }

    #[tokio::test]
    async fn spawned_watchdog_exits_on_shutdown() {
        let (watchdog, _store, _pool, _events) = fixture().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = watchdog.spawn(shutdown_rx);
        shutdown_tx.send(true).expect("signal shutdown");

        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("watchdog exits promptly")
            .expect("task joins cleanly");
    }
}

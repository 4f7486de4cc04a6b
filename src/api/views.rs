//! Read-only JSON views for the dashboard.

use super::static_files::resolve_safe_dir;
use super::ApiState;
use crate::company::tasks::{LogQuery, TaskFilter, TaskStatus};
use crate::now_ms;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

/// Liveness thresholds: active under 10 minutes, idle to 30, stale beyond.
const ACTIVE_WINDOW_MS: i64 = 600_000;
const IDLE_WINDOW_MS: i64 = 1_800_000;

fn liveness(last_activity_at: Option<i64>, now: i64) -> &'static str {
    match last_activity_at {
        None => "offline",
        Some(at) if now - at < ACTIVE_WINDOW_MS => "active",
        Some(at) if now - at < IDLE_WINDOW_MS => "idle",
        Some(_) => "stale",
    }
}

fn max_option(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// `GET /agents-status.json` — org-wide liveness.
pub async fn agents_status(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Value>, StatusCode> {
    let now = now_ms();

    let summaries = state.tasks.get_agent_summaries().await.map_err(|error| {
        tracing::error!(%error, "failed to load agent summaries");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    let mut agents = Vec::with_capacity(state.config.agents.len());
    let mut totals: std::collections::BTreeMap<&str, i64> = std::collections::BTreeMap::new();

    for profile in &state.config.agents {
        let summary = summaries
            .iter()
            .find(|summary| summary.agent_id == profile.id);

        let last_posted = state
            .channels
            .last_posted_at(&profile.id)
            .await
            .map_err(|error| {
                tracing::error!(%error, agent_id = %profile.id, "failed to load channel activity");
                StatusCode::SERVICE_UNAVAILABLE
            })?;
        let session_count = state
            .channels
            .membership_count(&profile.id)
            .await
            .map_err(|error| {
                tracing::error!(%error, agent_id = %profile.id, "failed to count memberships");
                StatusCode::SERVICE_UNAVAILABLE
            })?;

        let task_activity = summary
            .map(|s| max_option(s.last_heartbeat_at, s.last_updated_at))
            .unwrap_or(None);
        let last_activity_at = max_option(last_posted, task_activity);
        let state_label = liveness(last_activity_at, now);
        *totals.entry(state_label).or_insert(0) += 1;

        let count = |status: &str| -> i64 {
            summary
                .and_then(|s| s.by_status.get(status).copied())
                .unwrap_or(0)
        };

        agents.push(json!({
            "id": profile.id,
            "name": profile.name,
            "emoji": profile.emoji,
            "layer": profile.layer,
            "role": profile.role,
            "liveness": state_label,
            "lastActivityAt": last_activity_at,
            "nextActivityAt": Value::Null,
            "activeTasks": count("active"),
            "blockedTasks": count("blocked"),
            "doneTasks": count("done"),
            "sessionCount": session_count,
            "lastSessionAgeMs": last_activity_at.map(|at| now - at),
        }));
    }

    Ok(Json(json!({
        "timestamp": now,
        "defaultAgentId": state.config.default_agent_id,
        "agents": agents,
        "totals": {
            "agents": state.config.agents.len(),
            "active": totals.get("active").copied().unwrap_or(0),
            "idle": totals.get("idle").copied().unwrap_or(0),
            "stale": totals.get("stale").copied().unwrap_or(0),
            "offline": totals.get("offline").copied().unwrap_or(0),
        },
        "heartbeat": {
            "staleThresholdMs": state.config.stale_threshold_ms,
            "checkIntervalMs": state.config.check_interval_ms,
        },
        // Scheduling lives in the external cron service.
        "cron": { "enabled": false, "nextRunAt": Value::Null },
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TasksDataQuery {
    view: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    status: Option<TaskStatus>,
    #[serde(default)]
    limit: Option<i64>,
}

/// `GET /tasks-data.json?view=summary|detail|logs|list&...`
pub async fn tasks_data(
    State(state): State<Arc<ApiState>>,
    Query(query): Query<TasksDataQuery>,
) -> Result<Json<Value>, StatusCode> {
    let unavailable = |error: crate::CompanyError| {
        tracing::error!(%error, "tasks-data view failed");
        StatusCode::SERVICE_UNAVAILABLE
    };

    match query.view.as_str() {
        "summary" => {
            let summary = state.tasks.get_summary().await.map_err(unavailable)?;
            let agents = state.tasks.get_agent_summaries().await.map_err(unavailable)?;
            Ok(Json(json!({ "summary": summary, "agents": agents })))
        }
        "list" => {
            let tasks = state
                .tasks
                .list_tasks(TaskFilter {
                    agent_id: query.agent_id,
                    status: query.status,
                    parent_task_id: None,
                    limit: query.limit,
                })
                .await
                .map_err(unavailable)?;
            Ok(Json(json!({ "tasks": tasks })))
        }
        "logs" => {
            let id = query.id.ok_or(StatusCode::BAD_REQUEST)?;
            let logs = state
                .tasks
                .get_logs(
                    &id,
                    LogQuery {
                        limit: query.limit,
                        before: None,
                    },
                )
                .await
                .map_err(unavailable)?;
            Ok(Json(json!({ "logs": logs })))
        }
        "detail" => {
            let id = query.id.ok_or(StatusCode::BAD_REQUEST)?;
            let task = state
                .tasks
                .get_task(&id)
                .await
                .map_err(unavailable)?
                .ok_or(StatusCode::NOT_FOUND)?;
            let logs = state
                .tasks
                .get_logs(&id, LogQuery::default())
                .await
                .map_err(unavailable)?;
            let subtasks = state.tasks.get_subtasks(&id).await.map_err(unavailable)?;
            let dependents = state.tasks.get_dependents(&id).await.map_err(unavailable)?;
            Ok(Json(json!({
                "task": task,
                "logs": logs,
                "subtasks": subtasks,
                "dependents": dependents,
            })))
        }
        _ => Err(StatusCode::BAD_REQUEST),
    }
}

/// `GET /_ls/<dir>` — file names for the workspace tree, whitelisted and
/// traversal-safe.
pub async fn list_directory(
    State(state): State<Arc<ApiState>>,
    Path(path): Path<String>,
) -> Result<Json<Vec<String>>, StatusCode> {
    let dir = resolve_safe_dir(&state.config.state_dir, &path).ok_or(StatusCode::NOT_FOUND)?;

    let mut entries = tokio::fs::read_dir(&dir).await.map_err(|error| {
        tracing::warn!(%error, path = %dir.display(), "failed to read directory");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    let mut names = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        if let Ok(name) = entry.file_name().into_string() {
            names.push(name);
        }
    }
    names.sort();

    Ok(Json(names))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::company::channels::{ChannelStore, ChannelType};
    use crate::company::tasks::{CreateTaskOptions, TaskStore};
    use crate::db::CompanyDb;
    use crate::events;

    async fn fixture() -> (Arc<ApiState>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = crate::Config::load_from(dir.path().to_path_buf());
        let db = CompanyDb::connect_in_memory().await.expect("db");
        let state = Arc::new(ApiState {
            config,
            channels: ChannelStore::new(db.channels.clone(), events::bus()),
            tasks: TaskStore::new(db.tasks.clone(), events::bus()),
            broadcaster: super::super::ws::Broadcaster::new(),
        });
        (state, dir)
    }

    #[test]
    fn liveness_thresholds_match_the_contract() {
        let now = 10_000_000;
        assert_eq!(liveness(None, now), "offline");
        assert_eq!(liveness(Some(now - 1_000), now), "active");
        assert_eq!(liveness(Some(now - ACTIVE_WINDOW_MS), now), "idle");
        assert_eq!(liveness(Some(now - IDLE_WINDOW_MS), now), "stale");
    }

    #[tokio::test]
    async fn agents_status_reports_roster_and_counts() {
        let (state, _dir) = fixture().await;

        state
            .tasks
            .create_task("main", "steer the ship", CreateTaskOptions::default())
            .await
            .expect("create task");
        state
            .channels
            .create_channel("eng", ChannelType::Public, "", "main", &[])
            .await
            .expect("create channel");

        let Json(status) = agents_status(State(state)).await.expect("status");

        assert_eq!(status["defaultAgentId"], "main");
        let agents = status["agents"].as_array().expect("agents");
        let main = agents
            .iter()
            .find(|agent| agent["id"] == "main")
            .expect("main present");
        assert_eq!(main["liveness"], "active");
        assert_eq!(main["activeTasks"], 1);
        assert_eq!(main["sessionCount"], 1);

        // The investor never did anything and reads as offline.
        let investor = agents
            .iter()
            .find(|agent| agent["id"] == "investor")
            .expect("investor present");
        assert_eq!(investor["liveness"], "offline");
        assert_eq!(status["totals"]["offline"], 1);
    }

    #[tokio::test]
    async fn tasks_data_dispatches_views() {
        let (state, _dir) = fixture().await;
        let task = state
            .tasks
            .create_task("builder", "ship v1", CreateTaskOptions::default())
            .await
            .expect("create");

        let Json(summary) = tasks_data(
            State(state.clone()),
            Query(TasksDataQuery {
                view: "summary".into(),
                id: None,
                agent_id: None,
                status: None,
                limit: None,
            }),
        )
        .await
        .expect("summary");
        assert_eq!(summary["summary"]["total"], 1);

        let Json(detail) = tasks_data(
            State(state.clone()),
            Query(TasksDataQuery {
                view: "detail".into(),
                id: Some(task.id.clone()),
                agent_id: None,
                status: None,
                limit: None,
            }),
        )
        .await
        .expect("detail");
        assert_eq!(detail["task"]["id"], task.id.as_str());
        assert_eq!(detail["logs"].as_array().map(Vec::len), Some(1));

        let error = tasks_data(
            State(state.clone()),
            Query(TasksDataQuery {
                view: "detail".into(),
                id: None,
                agent_id: None,
                status: None,
                limit: None,
            }),
        )
        .await
        .expect_err("missing id");
        assert_eq!(error, StatusCode::BAD_REQUEST);

        let error = tasks_data(
            State(state),
            Query(TasksDataQuery {
                view: "nonsense".into(),
                id: None,
                agent_id: None,
                status: None,
                limit: None,
            }),
        )
        .await
        .expect_err("unknown view");
        assert_eq!(error, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn list_directory_is_whitelisted_and_sorted() {
        let (state, dir) = fixture().await;
        std::fs::create_dir_all(dir.path().join("company/kb")).expect("mkdir");
        std::fs::write(dir.path().join("company/kb/beta.md"), "b").expect("write");
        std::fs::write(dir.path().join("company/kb/alpha.md"), "a").expect("write");

        let Json(names) = list_directory(State(state.clone()), Path("company/kb".into()))
            .await
            .expect("listing");
        assert_eq!(names, vec!["alpha.md".to_string(), "beta.md".to_string()]);

        let error = list_directory(State(state.clone()), Path("../etc".into()))
            .await
            .expect_err("traversal rejected");
        assert_eq!(error, StatusCode::NOT_FOUND);

        let error = list_directory(State(state), Path("logs".into()))
            .await
            .expect_err("non-whitelisted prefix rejected");
        assert_eq!(error, StatusCode::NOT_FOUND);
    }
}

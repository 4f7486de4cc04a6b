//! Typed RPC dispatch.
//!
//! One POST endpoint accepts `{method, params}` with wire-exact method
//! names. Every response is `{ok: true, ...}` or
//! `{ok: false, error: {code, message}}`; unknown ids surface as
//! `INVALID_REQUEST` with a "not found" message.

use super::ApiState;
use crate::company::bootstrap;
use crate::company::channels::{ChannelType, MemberRole, MessageQuery};
use crate::company::tasks::{
    CreateTaskOptions, LogQuery, TaskFilter, TaskLogType, TaskPatch, TaskPriority, TaskStatus,
};
use crate::error::{CompanyError, Result};
use axum::extract::State;
use axum::Json;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct RpcRequest {
    method: String,
    #[serde(default)]
    params: Value,
}

/// Entry point for `POST /rpc`.
pub async fn handle(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<RpcRequest>,
) -> Json<Value> {
    let method = request.method.clone();
    match dispatch(&state, &request.method, request.params).await {
        Ok(mut value) => {
            if let Some(map) = value.as_object_mut() {
                map.insert("ok".into(), Value::Bool(true));
            }
            Json(value)
        }
        Err(error) => {
            if error.is_client_error() {
                tracing::debug!(method, %error, "rpc rejected");
            } else {
                tracing::error!(method, %error, "rpc failed");
            }
            Json(json!({
                "ok": false,
                "error": { "code": error.code(), "message": error.to_string() },
            }))
        }
    }
}

async fn dispatch(state: &ApiState, method: &str, params: Value) -> Result<Value> {
    match method {
        "company.channels.list" => channels_list(state, parse(params)?).await,
        "company.channels.get" => channels_get(state, parse(params)?).await,
        "company.channels.create" => channels_create(state, parse(params)?).await,
        "company.channels.delete" => channels_delete(state, parse(params)?).await,
        "company.channels.post" => channels_post(state, parse(params)?).await,
        "company.channels.history" => channels_history(state, parse(params)?).await,
        "company.channels.members.add" => members_add(state, parse(params)?).await,
        "company.channels.members.remove" => members_remove(state, parse(params)?).await,
        "company.create" => company_create(state, parse(params)?).await,
        "tasks.create" => tasks_create(state, parse(params)?).await,
        "tasks.get" => tasks_get(state, parse(params)?).await,
        "tasks.update" => tasks_update(state, parse(params)?).await,
        "tasks.list" => tasks_list(state, parse(params)?).await,
        "tasks.logs" => tasks_logs(state, parse(params)?).await,
        "tasks.log" => tasks_log(state, parse(params)?).await,
        "tasks.heartbeat" => tasks_heartbeat(state, parse(params)?).await,
        "tasks.summary" => tasks_summary(state).await,
        _ => Err(CompanyError::InvalidRequest(format!(
            "unknown method: {method}"
        ))),
    }
}

/// Decode params into the handler's struct; serde's message names the
/// missing or mistyped field.
fn parse<T: DeserializeOwned>(params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|error| CompanyError::InvalidRequest(format!("invalid params: {error}")))
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListChannelsParams {
    #[serde(default)]
    member_id: Option<String>,
}

async fn channels_list(state: &ApiState, params: ListChannelsParams) -> Result<Value> {
    let channels = match params.member_id {
        Some(member_id) => state.channels.list_channels_for_member(&member_id).await?,
        None => state.channels.list_channels().await?,
    };
    Ok(json!({ "channels": channels }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChannelRefParams {
    channel: String,
}

async fn channels_get(state: &ApiState, params: ChannelRefParams) -> Result<Value> {
    let channel = state
        .channels
        .get_channel(&params.channel)
        .await?
        .ok_or_else(|| CompanyError::NotFound(format!("channel not found: {}", params.channel)))?;
    Ok(json!({ "channel": channel }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateChannelParams {
    name: String,
    #[serde(rename = "type", default = "default_channel_type")]
    channel_type: ChannelType,
    #[serde(default)]
    description: String,
    created_by: String,
    #[serde(default)]
    members: Vec<String>,
}

fn default_channel_type() -> ChannelType {
    ChannelType::Public
}

async fn channels_create(state: &ApiState, params: CreateChannelParams) -> Result<Value> {
    let channel = state
        .channels
        .create_channel(
            &params.name,
            params.channel_type,
            &params.description,
            &params.created_by,
            &params.members,
        )
        .await?;
    Ok(json!({ "channel": channel }))
}

async fn channels_delete(state: &ApiState, params: ChannelRefParams) -> Result<Value> {
    let channel = state
        .channels
        .resolve_channel(&params.channel)
        .await?
        .ok_or_else(|| CompanyError::NotFound(format!("channel not found: {}", params.channel)))?;
    let deleted = state.channels.delete_channel(&channel.id).await?;
    Ok(json!({ "deleted": deleted }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PostMessageParams {
    channel: String,
    sender_id: String,
    text: String,
    #[serde(default)]
    thread_id: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

async fn channels_post(state: &ApiState, params: PostMessageParams) -> Result<Value> {
    let channel = state
        .channels
        .resolve_channel(&params.channel)
        .await?
        .ok_or_else(|| CompanyError::NotFound(format!("channel not found: {}", params.channel)))?;
    let message = state
        .channels
        .post_message(
            &channel.id,
            &params.sender_id,
            &params.text,
            params.thread_id,
            params.metadata,
        )
        .await?;
    Ok(json!({ "message": message }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryParams {
    channel: String,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    before: Option<i64>,
    #[serde(default)]
    thread_id: Option<String>,
}

async fn channels_history(state: &ApiState, params: HistoryParams) -> Result<Value> {
    let channel = state
        .channels
        .resolve_channel(&params.channel)
        .await?
        .ok_or_else(|| CompanyError::NotFound(format!("channel not found: {}", params.channel)))?;
    let messages = state
        .channels
        .get_messages(
            &channel.id,
            MessageQuery {
                limit: params.limit,
                before: params.before,
                thread_id: params.thread_id,
            },
        )
        .await?;
    Ok(json!({ "messages": messages }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MemberParams {
    channel: String,
    member_id: String,
    #[serde(default = "default_member_role")]
    role: MemberRole,
}

fn default_member_role() -> MemberRole {
    MemberRole::Member
}

async fn members_add(state: &ApiState, params: MemberParams) -> Result<Value> {
    let added = state
        .channels
        .add_member(&params.channel, &params.member_id, params.role)
        .await?;
    Ok(json!({ "added": added }))
}

async fn members_remove(state: &ApiState, params: MemberParams) -> Result<Value> {
    let removed = state
        .channels
        .remove_member(&params.channel, &params.member_id)
        .await?;
    Ok(json!({ "removed": removed }))
}

// ---------------------------------------------------------------------------
// Company bootstrap
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CompanyCreateParams {
    goal: String,
}

async fn company_create(state: &ApiState, params: CompanyCreateParams) -> Result<Value> {
    bootstrap::run(&state.config, &state.channels, &params.goal).await?;
    Ok(json!({}))
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskParams {
    agent_id: String,
    objective: String,
    #[serde(default)]
    parent_task_id: Option<String>,
    #[serde(default)]
    priority: Option<TaskPriority>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

async fn tasks_create(state: &ApiState, params: CreateTaskParams) -> Result<Value> {
    let task = state
        .tasks
        .create_task(
            &params.agent_id,
            &params.objective,
            CreateTaskOptions {
                parent_task_id: params.parent_task_id,
                priority: params.priority,
                dependencies: params.dependencies,
                metadata: params.metadata,
            },
        )
        .await?;
    Ok(json!({ "task": task }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskRefParams {
    task_id: String,
}

async fn tasks_get(state: &ApiState, params: TaskRefParams) -> Result<Value> {
    let task = state
        .tasks
        .get_task(&params.task_id)
        .await?
        .ok_or_else(|| CompanyError::NotFound(format!("task not found: {}", params.task_id)))?;
    Ok(json!({ "task": task }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateTaskParams {
    task_id: String,
    #[serde(flatten)]
    patch: TaskPatch,
}

async fn tasks_update(state: &ApiState, params: UpdateTaskParams) -> Result<Value> {
    let task = state
        .tasks
        .update_task(&params.task_id, params.patch)
        .await?
        .ok_or_else(|| CompanyError::NotFound(format!("task not found: {}", params.task_id)))?;
    Ok(json!({ "task": task }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListTasksParams {
    #[serde(default)]
    agent_id: Option<String>,
    #[serde(default)]
    status: Option<TaskStatus>,
    #[serde(default)]
    parent_task_id: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

async fn tasks_list(state: &ApiState, params: ListTasksParams) -> Result<Value> {
    let tasks = state
        .tasks
        .list_tasks(TaskFilter {
            agent_id: params.agent_id,
            status: params.status,
            parent_task_id: params.parent_task_id,
            limit: params.limit,
        })
        .await?;
    Ok(json!({ "tasks": tasks }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskLogsParams {
    task_id: String,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    before: Option<i64>,
}

async fn tasks_logs(state: &ApiState, params: TaskLogsParams) -> Result<Value> {
    let logs = state
        .tasks
        .get_logs(
            &params.task_id,
            LogQuery {
                limit: params.limit,
                before: params.before,
            },
        )
        .await?;
    Ok(json!({ "logs": logs }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendLogParams {
    task_id: String,
    agent_id: String,
    #[serde(rename = "type")]
    log_type: TaskLogType,
    message: String,
    #[serde(default)]
    metadata: Option<Value>,
}

async fn tasks_log(state: &ApiState, params: AppendLogParams) -> Result<Value> {
    let log = state
        .tasks
        .append_log(
            &params.task_id,
            &params.agent_id,
            params.log_type,
            &params.message,
            params.metadata,
        )
        .await?;
    Ok(json!({ "log": log }))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HeartbeatParams {
    task_id: String,
    agent_id: String,
    #[serde(default)]
    message: Option<String>,
}

async fn tasks_heartbeat(state: &ApiState, params: HeartbeatParams) -> Result<Value> {
    let task = state
        .tasks
        .heartbeat(&params.task_id, &params.agent_id, params.message.as_deref())
        .await?
        .ok_or_else(|| CompanyError::NotFound(format!("task not found: {}", params.task_id)))?;
    Ok(json!({ "task": task }))
}

async fn tasks_summary(state: &ApiState) -> Result<Value> {
    let summary = state.tasks.get_summary().await?;
    let agents = state.tasks.get_agent_summaries().await?;
    Ok(json!({ "summary": summary, "agents": agents }))
}

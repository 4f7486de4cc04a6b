//! Typed in-process event bus.
//!
//! One broadcast channel per store. Events are tagged unions carrying
//! fully-populated value objects so subscribers never re-read the store.
//! Senders never block: a lagging receiver only loses its own backlog, and
//! a panicking subscriber cannot affect delivery to the others.

use crate::company::channels::{Channel, ChannelMessage, MemberRole};
use crate::company::tasks::{TaskLog, TaskThread};
use serde_json::json;
use tokio::sync::broadcast;

/// Buffered events per subscriber before a slow receiver starts lagging.
const BUS_CAPACITY: usize = 256;

/// Create a bus for one store. The receiver handed back here is dropped by
/// callers that only publish; subscribers call `.subscribe()` on the sender.
pub fn bus<T: Clone>() -> broadcast::Sender<T> {
    broadcast::channel(BUS_CAPACITY).0
}

/// Events emitted by the channel store.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Created {
        channel: Channel,
    },
    Deleted {
        channel_id: String,
        name: String,
    },
    Message {
        message: ChannelMessage,
        /// Consumers route prompts by name, not id.
        channel_name: String,
    },
    MemberJoined {
        channel_id: String,
        channel_name: String,
        member_id: String,
        role: MemberRole,
    },
    MemberLeft {
        channel_id: String,
        channel_name: String,
        member_id: String,
    },
}

impl ChannelEvent {
    /// Wire name, also used as the WebSocket frame `type`.
    pub fn name(&self) -> &'static str {
        match self {
            ChannelEvent::Created { .. } => "channel.created",
            ChannelEvent::Deleted { .. } => "channel.deleted",
            ChannelEvent::Message { .. } => "channel.message",
            ChannelEvent::MemberJoined { .. } => "channel.member.joined",
            ChannelEvent::MemberLeft { .. } => "channel.member.left",
        }
    }

    /// JSON payload for the WebSocket frame.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            ChannelEvent::Created { channel } => json!({ "channel": channel }),
            ChannelEvent::Deleted { channel_id, name } => {
                json!({ "channelId": channel_id, "name": name })
            }
            ChannelEvent::Message {
                message,
                channel_name,
            } => json!({ "message": message, "channelName": channel_name }),
            ChannelEvent::MemberJoined {
                channel_id,
                channel_name,
                member_id,
                role,
            } => json!({
                "channelId": channel_id,
                "channelName": channel_name,
                "memberId": member_id,
                "role": role,
            }),
            ChannelEvent::MemberLeft {
                channel_id,
                channel_name,
                member_id,
            } => json!({
                "channelId": channel_id,
                "channelName": channel_name,
                "memberId": member_id,
            }),
        }
    }
}

/// Events emitted by the task store and the watchdog.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    Created { task: TaskThread },
    Updated { task: TaskThread },
    Completed { task: TaskThread },
    Failed { task: TaskThread },
    Log { entry: TaskLog },
    Heartbeat { task: TaskThread },
    Stale { task: TaskThread },
}

impl TaskEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TaskEvent::Created { .. } => "task.created",
            TaskEvent::Updated { .. } => "task.updated",
            TaskEvent::Completed { .. } => "task.completed",
            TaskEvent::Failed { .. } => "task.failed",
            TaskEvent::Log { .. } => "task.log",
            TaskEvent::Heartbeat { .. } => "task.heartbeat",
            TaskEvent::Stale { .. } => "task.stale",
        }
    }

    pub fn payload(&self) -> serde_json::Value {
        match self {
            TaskEvent::Created { task }
            | TaskEvent::Updated { task }
            | TaskEvent::Completed { task }
            | TaskEvent::Failed { task }
            | TaskEvent::Heartbeat { task }
            | TaskEvent::Stale { task } => json!({ "task": task }),
            TaskEvent::Log { entry } => json!({ "log": entry }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::company::channels::ChannelType;

    fn sample_channel() -> Channel {
        Channel {
            id: "ch-1".into(),
            name: "eng".into(),
            channel_type: ChannelType::Public,
            description: String::new(),
            created_by: "main".into(),
            created_at: 1,
        }
    }

    #[test]
    fn wire_names_match_the_event_catalogue() {
        let event = ChannelEvent::Created {
            channel: sample_channel(),
        };
        assert_eq!(event.name(), "channel.created");

        let event = ChannelEvent::MemberJoined {
            channel_id: "ch-1".into(),
            channel_name: "eng".into(),
            member_id: "builder".into(),
            role: MemberRole::Member,
        };
        assert_eq!(event.name(), "channel.member.joined");
    }

    #[test]
    fn message_payload_carries_channel_name_for_routing() {
        let event = ChannelEvent::Message {
            message: ChannelMessage {
                id: "m-1".into(),
                channel_id: "ch-1".into(),
                sender_id: "main".into(),
                content: "kick off".into(),
                thread_id: None,
                metadata: None,
                created_at: 1,
            },
            channel_name: "eng".into(),
        };
        let payload = event.payload();
        assert_eq!(payload["channelName"], "eng");
        assert_eq!(payload["message"]["content"], "kick off");
    }

    #[tokio::test]
    async fn bus_delivers_to_multiple_subscribers() {
        let sender = bus::<ChannelEvent>();
        let mut first = sender.subscribe();
        let mut second = sender.subscribe();

        sender
            .send(ChannelEvent::Created {
                channel: sample_channel(),
            })
            .expect("send with live receivers");

        assert_eq!(first.recv().await.expect("first").name(), "channel.created");
        assert_eq!(second.recv().await.expect("second").name(), "channel.created");
    }

    #[test]
    fn send_without_subscribers_is_not_an_error_path() {
        let sender = bus::<TaskEvent>();
        // Publishers ignore the result; nothing should panic.
        let _ = sender.send(TaskEvent::Log {
            entry: TaskLog {
                id: "l-1".into(),
                task_id: "t-1".into(),
                agent_id: "builder".into(),
                log_type: crate::company::tasks::TaskLogType::Progress,
                message: "working".into(),
                metadata: None,
                created_at: 1,
            },
        });
    }
}

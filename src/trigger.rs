//! Wake-up trigger engine: channel posts → gateway calls.
//!
//! Subscribes to channel events. Every `channel.message` resolves its
//! recipients (channel members that are known agents, minus the sender),
//! gates each through a per-(agent, channel) cooldown, and fires the
//! external gateway's `agent` RPC with a prompt built from the channel
//! transcript. Gateway failures are logged and swallowed — the post is
//! durable the moment the store committed it, and a missed wake-up is
//! recovered by a later message or the watchdog.
//!
//! The engine also re-broadcasts every channel event it observes to the
//! WebSocket broadcaster so dashboards refresh without polling.

use crate::api::ws::Broadcaster;
use crate::company::channels::{ChannelMessage, ChannelStore, MessageQuery};
use crate::events::ChannelEvent;
use crate::gateway::{AgentTurnRequest, Gateway};
use crate::llm_log::{CallLogger, CallRecord};
use crate::now_ms;
use arc_swap::ArcSwap;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

/// Transcript depth included in each wake-up prompt.
const TRANSCRIPT_LIMIT: i64 = 15;

/// How often the cooldown map sheds entries older than twice the window.
const PRUNE_INTERVAL_SECS: u64 = 30;

/// Per-(agent, channel) wake-up rate gate.
///
/// Keys map to the last fire time in epoch millis. Never persisted — the
/// map is rebuildable and an empty one only means one extra wake-up after
/// a restart.
#[derive(Default)]
pub struct CooldownGate {
    last_fired: Mutex<HashMap<(String, String), i64>>,
}

impl CooldownGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` and records the fire when the pair is outside its
    /// window; `false` when the wake-up must be skipped. Check and record
    /// are one critical section so concurrent posts for the same pair
    /// cannot both pass.
    pub fn check_and_record(
        &self,
        agent_id: &str,
        channel_id: &str,
        now_ms: i64,
        window_ms: i64,
    ) -> bool {
        let key = (agent_id.to_string(), channel_id.to_string());
        let mut last_fired = self.last_fired.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(last) = last_fired.get(&key) {
            if now_ms - last < window_ms {
                return false;
            }
        }
        last_fired.insert(key, now_ms);
        true
    }

    /// Drop entries last fired before `cutoff_ms`.
    pub fn prune_older_than(&self, cutoff_ms: i64) {
        let mut last_fired = self.last_fired.lock().unwrap_or_else(|e| e.into_inner());
        last_fired.retain(|_, fired| *fired >= cutoff_ms);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.last_fired.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// The trigger engine. Constructed once at startup and consumed by
/// `spawn`.
pub struct TriggerEngine {
    channels: ChannelStore,
    roster: Arc<ArcSwap<HashSet<String>>>,
    gateway: Arc<dyn Gateway>,
    broadcaster: Broadcaster,
    call_log: CallLogger,
    cooldowns: Arc<CooldownGate>,
    cooldown_ms: i64,
    gateway_timeout_secs: u64,
}

impl TriggerEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channels: ChannelStore,
        roster: Arc<ArcSwap<HashSet<String>>>,
        gateway: Arc<dyn Gateway>,
        broadcaster: Broadcaster,
        call_log: CallLogger,
        cooldown_ms: i64,
        gateway_timeout_secs: u64,
    ) -> Self {
        Self {
            channels,
            roster,
            gateway,
            broadcaster,
            call_log,
            cooldowns: Arc::new(CooldownGate::new()),
            cooldown_ms,
            gateway_timeout_secs,
        }
    }

    /// Start the event loop and the cooldown pruner. Both exit on the
    /// shutdown signal; stopping the engine before draining in-flight RPCs
    /// is what guarantees no new gateway calls during shutdown.
    pub fn spawn(
        self,
        mut events: broadcast::Receiver<ChannelEvent>,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let engine = Arc::new(self);
        engine.clone().spawn_pruner(shutdown.clone());

        let mut shutdown = shutdown;
        tokio::spawn(async move {
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
                    event = events.recv() => match event {
                        Ok(event) => engine.handle_event(event).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "trigger engine lagged behind channel events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            tracing::info!("trigger engine stopped");
        })
    }

    fn spawn_pruner(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(std::time::Duration::from_secs(PRUNE_INTERVAL_SECS));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.wait_for(|stop| *stop) => break,
                    _ = ticker.tick() => {
                        self.cooldowns.prune_older_than(now_ms() - 2 * self.cooldown_ms);
                    }
                }
            }
        });
    }

    async fn handle_event(&self, event: ChannelEvent) {
        // Dashboards see everything the engine sees.
        self.broadcaster.broadcast(event.name(), event.payload());

        if let ChannelEvent::Message {
            message,
            channel_name,
        } = event
        {
            self.handle_message(&message, &channel_name).await;
        }
    }

    async fn handle_message(&self, message: &ChannelMessage, channel_name: &str) {
        let members = match self.channels.member_ids(&message.channel_id).await {
            Ok(members) => members,
            Err(error) => {
                tracing::warn!(
                    %error,
                    channel_id = %message.channel_id,
                    "failed to resolve members for wake-up"
                );
                return;
            }
        };

        let roster = self.roster.load();
        let recipients = resolve_recipients(&members, &roster, &message.sender_id);
        if recipients.is_empty() {
            return;
        }

        let transcript = match self
            .channels
            .get_messages(
                &message.channel_id,
                MessageQuery {
                    limit: Some(TRANSCRIPT_LIMIT),
                    ..Default::default()
                },
            )
            .await
        {
            Ok(transcript) => transcript,
            Err(error) => {
                tracing::warn!(
                    %error,
                    channel_id = %message.channel_id,
                    "failed to load transcript for wake-up"
                );
                return;
            }
        };

        let prompt = build_wake_prompt(channel_name, message, &transcript);

        for agent_id in recipients {
            if !self.cooldowns.check_and_record(
                &agent_id,
                &message.channel_id,
                now_ms(),
                self.cooldown_ms,
            ) {
                tracing::debug!(
                    %agent_id,
                    channel_id = %message.channel_id,
                    "wake-up skipped by cooldown"
                );
                continue;
            }

            self.dispatch_wake(agent_id, &message.channel_id, prompt.clone());
        }
    }

    /// Fire one gateway call on its own task. Recipients of the same event
    /// run concurrently, each with an independent deadline.
    fn dispatch_wake(&self, agent_id: String, channel_id: &str, prompt: String) {
        let session_key = format!("agent:{agent_id}:webchat:channel:{channel_id}");
        let request = AgentTurnRequest {
            session_key: session_key.clone(),
            message: prompt,
            deliver: false,
            idempotency_key: uuid::Uuid::new_v4().to_string(),
            timeout: self.gateway_timeout_secs,
        };

        self.call_log.record(CallRecord {
            timestamp: now_ms(),
            source: "trigger",
            agent_id: agent_id.clone(),
            channel_id: channel_id.to_string(),
            session_key,
            idempotency_key: request.idempotency_key.clone(),
            prompt_chars: request.message.chars().count(),
        });

        let gateway = self.gateway.clone();
        tokio::spawn(async move {
            if let Err(error) = gateway.agent(request).await {
                tracing::warn!(%error, %agent_id, "gateway wake-up failed; dropping");
            }
        });
    }
}

/// Members of the channel that are known agents, minus the sender.
/// Order follows the membership list.
fn resolve_recipients(
    members: &[String],
    roster: &HashSet<String>,
    sender_id: &str,
) -> Vec<String> {
    members
        .iter()
        .filter(|member| member.as_str() != sender_id && roster.contains(member.as_str()))
        .cloned()
        .collect()
}

/// Prompt for one wake-up: header quoting the new message, a short
/// transcript, and a trailer telling the agent how to respond.
fn build_wake_prompt(
    channel_name: &str,
    message: &ChannelMessage,
    transcript: &[ChannelMessage],
) -> String {
    let mut prompt = format!(
        "New message in #{channel_name} from {sender}:\n\n{text}\n\nRecent messages in #{channel_name}:\n",
        sender = message.sender_id,
        text = message.content,
    );

    for entry in transcript {
        prompt.push_str(&format!("[{}]: {}\n", entry.sender_id, entry.content));
    }

    prompt.push_str(
        "\nIf you have something to contribute, reply with company.channels.post. \
         Use company.channels.history to read more context. \
         If you have nothing to add, respond with the single token PASS.",
    );

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::company::channels::ChannelType;
    use crate::db::CompanyDb;
    use crate::events;

    // -----------------------------------------------------------------------
    // CooldownGate
    // -----------------------------------------------------------------------

    #[test]
    fn first_fire_passes_and_is_recorded() {
        let gate = CooldownGate::new();
        assert!(gate.check_and_record("builder", "ch-1", 1_000, 5_000));
        assert_eq!(gate.len(), 1);
    }

    #[test]
    fn fire_within_window_is_blocked() {
        let gate = CooldownGate::new();
        assert!(gate.check_and_record("builder", "ch-1", 1_000, 5_000));
        assert!(!gate.check_and_record("builder", "ch-1", 4_000, 5_000));
    }

    #[test]
    fn fire_after_window_passes_again() {
        let gate = CooldownGate::new();
        assert!(gate.check_and_record("builder", "ch-1", 1_000, 5_000));
        assert!(gate.check_and_record("builder", "ch-1", 6_000, 5_000));
    }

    #[test]
    fn pairs_are_independent() {
        let gate = CooldownGate::new();
        assert!(gate.check_and_record("builder", "ch-1", 1_000, 5_000));
        assert!(gate.check_and_record("builder", "ch-2", 1_000, 5_000));
        assert!(gate.check_and_record("researcher", "ch-1", 1_000, 5_000));
    }

    #[test]
    fn blocked_fire_does_not_extend_the_window() {
        let gate = CooldownGate::new();
        assert!(gate.check_and_record("builder", "ch-1", 1_000, 5_000));
        // Blocked at 4s; the window still ends at 6s, not 9s.
        assert!(!gate.check_and_record("builder", "ch-1", 4_000, 5_000));
        assert!(gate.check_and_record("builder", "ch-1", 6_000, 5_000));
    }

    #[test]
    fn prune_drops_only_old_entries() {
        let gate = CooldownGate::new();
        gate.check_and_record("builder", "ch-1", 1_000, 5_000);
        gate.check_and_record("researcher", "ch-1", 9_000, 5_000);

        gate.prune_older_than(5_000);
        assert_eq!(gate.len(), 1);
        // The surviving entry still gates.
        assert!(!gate.check_and_record("researcher", "ch-1", 10_000, 5_000));
    }

    // -----------------------------------------------------------------------
    // Recipient resolution
    // -----------------------------------------------------------------------

    #[test]
    fn recipients_are_members_intersect_roster_minus_sender() {
        let members = vec![
            "main".to_string(),
            "builder".to_string(),
            "human-observer".to_string(),
        ];
        let roster: HashSet<String> = ["main", "builder"].iter().map(|s| s.to_string()).collect();

        let recipients = resolve_recipients(&members, &roster, "main");
        assert_eq!(recipients, vec!["builder".to_string()]);
    }

    #[test]
    fn sender_is_never_woken_by_its_own_post() {
        let members = vec!["builder".to_string()];
        let roster: HashSet<String> = ["builder".to_string()].into_iter().collect();
        assert!(resolve_recipients(&members, &roster, "builder").is_empty());
    }

    // -----------------------------------------------------------------------
    // Prompt shape
    // -----------------------------------------------------------------------

    fn sample_message(sender: &str, text: &str) -> ChannelMessage {
        ChannelMessage {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: "ch-1".into(),
            sender_id: sender.into(),
            content: text.into(),
            thread_id: None,
            metadata: None,
            created_at: now_ms(),
        }
    }

    #[test]
    fn prompt_quotes_channel_sender_and_message() {
        let message = sample_message("main", "kick off");
        let transcript = vec![sample_message("builder", "earlier word"), message.clone()];

        let prompt = build_wake_prompt("eng", &message, &transcript);
        assert!(prompt.contains("#eng"));
        assert!(prompt.contains("from main"));
        assert!(prompt.contains("kick off"));
        assert!(prompt.contains("[builder]: earlier word"));
        assert!(prompt.contains("PASS"));
        assert!(prompt.contains("company.channels.post"));
        assert!(prompt.contains("company.channels.history"));
    }

    // -----------------------------------------------------------------------
    // Engine end to end against a recording gateway
    // -----------------------------------------------------------------------

    struct RecordingGateway {
        calls: Mutex<Vec<AgentTurnRequest>>,
    }

    impl RecordingGateway {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<AgentTurnRequest> {
            self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }
    }

    #[async_trait::async_trait]
    impl Gateway for RecordingGateway {
        async fn agent(&self, request: AgentTurnRequest) -> anyhow::Result<()> {
            self.calls
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(request);
            Ok(())
        }
    }

    async fn engine_fixture(
        cooldown_ms: i64,
    ) -> (
        ChannelStore,
        Arc<RecordingGateway>,
        watch::Sender<bool>,
        tempfile::TempDir,
    ) {
        let db = CompanyDb::connect_in_memory().await.expect("open db");
        let bus = events::bus();
        let store = ChannelStore::new(db.channels.clone(), bus.clone());

        let gateway = RecordingGateway::new();
        let roster: HashSet<String> = ["main", "builder"].iter().map(|s| s.to_string()).collect();
        let dir = tempfile::tempdir().expect("tempdir");

        let engine = TriggerEngine::new(
            store.clone(),
            Arc::new(ArcSwap::from_pointee(roster)),
            gateway.clone(),
            Broadcaster::new(),
            CallLogger::new(dir.path().join("llm-calls.jsonl")),
            cooldown_ms,
            300,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        engine.spawn(bus.subscribe(), shutdown_rx);

        (store, gateway, shutdown_tx, dir)
    }

    async fn settle() {
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn post_wakes_each_recipient_exactly_once() {
        let (store, gateway, _shutdown, _dir) = engine_fixture(5_000).await;
        let channel = store
            .create_channel("eng", ChannelType::Public, "", "main", &["builder".into()])
            .await
            .expect("create");
        settle().await;

        store
            .post_message(&channel.channel.id, "main", "kick off", None, None)
            .await
            .expect("post");
        settle().await;

        let calls = gateway.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(
            calls[0].session_key,
            format!("agent:builder:webchat:channel:{}", channel.channel.id)
        );
        assert!(calls[0].message.contains("kick off"));
        assert!(calls[0].message.contains("#eng"));
        assert!(!calls[0].deliver);
    }

    #[tokio::test]
    async fn cooldown_dedups_until_window_expires() {
        let (store, gateway, _shutdown, _dir) = engine_fixture(200).await;
        let channel = store
            .create_channel("eng", ChannelType::Public, "", "main", &["builder".into()])
            .await
            .expect("create");
        settle().await;

        store
            .post_message(&channel.channel.id, "main", "first", None, None)
            .await
            .expect("post");
        settle().await;
        store
            .post_message(&channel.channel.id, "main", "ping", None, None)
            .await
            .expect("post");
        settle().await;
        assert_eq!(gateway.calls().len(), 1, "second post inside the window");

        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        store
            .post_message(&channel.channel.id, "main", "third", None, None)
            .await
            .expect("post");
        settle().await;
        assert_eq!(gateway.calls().len(), 2, "window expired, wake again");
    }

    #[tokio::test]
    async fn non_roster_members_and_sender_are_skipped() {
        let (store, gateway, _shutdown, _dir) = engine_fixture(5_000).await;
        let channel = store
            .create_channel(
                "eng",
                ChannelType::Public,
                "",
                "main",
                &["builder".into(), "human-observer".into()],
            )
            .await
            .expect("create");
        settle().await;

        store
            .post_message(&channel.channel.id, "builder", "I am on it", None, None)
            .await
            .expect("post");
        settle().await;

        let calls = gateway.calls();
        // Only "main" qualifies: builder sent it, human-observer is not an agent.
        assert_eq!(calls.len(), 1);
        assert!(calls[0].session_key.starts_with("agent:main:"));
    }

    #[tokio::test]
    async fn shutdown_stops_the_event_loop() {
        let (store, gateway, shutdown, _dir) = engine_fixture(5_000).await;
        let channel = store
            .create_channel("eng", ChannelType::Public, "", "main", &["builder".into()])
            .await
            .expect("create");
        settle().await;

        shutdown.send(true).expect("signal shutdown");
        settle().await;

        store
            .post_message(&channel.channel.id, "main", "too late", None, None)
            .await
            .expect("post");
        settle().await;

        assert!(gateway.calls().is_empty(), "no wake-ups after shutdown");
    }
}

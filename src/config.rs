//! Process-wide configuration: state directory, agent roster, tunables.
//!
//! Everything here is resolved once at startup and read without locks for
//! the rest of the process lifetime. The roster additionally lives behind an
//! `ArcSwap` snapshot (see `Config::roster`) so the trigger engine can read
//! it on every message without contention.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Default heartbeat-staleness threshold for the watchdog (15 minutes).
pub const DEFAULT_STALE_THRESHOLD_MS: i64 = 900_000;

/// Default watchdog scan interval (2 minutes).
pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 120_000;

/// Default per-(agent, channel) wake-up cooldown window (5 seconds).
pub const DEFAULT_TRIGGER_COOLDOWN_MS: i64 = 5_000;

/// Default page sizes for message, log, and task list reads.
pub const DEFAULT_MESSAGE_LIMIT: i64 = 50;
pub const DEFAULT_LOG_LIMIT: i64 = 100;
pub const DEFAULT_TASK_LIST_LIMIT: i64 = 200;

/// Default per-call deadline for outbound gateway RPCs.
pub const DEFAULT_GATEWAY_TIMEOUT_SECS: u64 = 300;

/// One agent in the company roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentProfile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_emoji")]
    pub emoji: String,
    #[serde(default)]
    pub layer: String,
    #[serde(default)]
    pub role: String,
}

fn default_emoji() -> String {
    "🤖".into()
}

/// Shape of the optional `<state>/openclaw.json` file. Every field has a
/// default so a partial file (or none at all) is fine.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    #[serde(default)]
    agents: Vec<AgentProfile>,
    #[serde(default)]
    default_agent_id: Option<String>,
    #[serde(default)]
    gateway_url: Option<String>,
    #[serde(default)]
    http_addr: Option<String>,
    #[serde(default)]
    stale_threshold_ms: Option<i64>,
    #[serde(default)]
    check_interval_ms: Option<u64>,
    #[serde(default)]
    trigger_cooldown_ms: Option<i64>,
}

/// Resolved process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of all persistent state (`$HOME/.openclaw` by default).
    pub state_dir: PathBuf,
    /// Address the HTTP/WS surface binds to.
    pub http_addr: SocketAddr,
    /// Endpoint of the external LLM gateway's `agent` RPC.
    pub gateway_url: String,
    /// Per-call deadline for gateway RPCs.
    pub gateway_timeout_secs: u64,
    /// The CEO agent; owns the top-level `workspace/` directory.
    pub default_agent_id: String,
    /// Known agents. The trigger engine only wakes ids present here.
    pub agents: Vec<AgentProfile>,
    /// Watchdog: no heartbeat within this window means stale.
    pub stale_threshold_ms: i64,
    /// Watchdog scan period.
    pub check_interval_ms: u64,
    /// Trigger engine wake-up cooldown window.
    pub trigger_cooldown_ms: i64,
    /// Append-only JSONL record of gateway calls.
    pub llm_call_log_file: PathBuf,
}

impl Config {
    /// Resolve configuration from the environment and the optional
    /// `openclaw.json` in the state directory.
    pub fn load() -> Self {
        let state_dir = Self::default_state_dir();
        Self::load_from(state_dir)
    }

    /// Resolve configuration rooted at an explicit state directory.
    /// Used by tests and by embedding callers.
    pub fn load_from(state_dir: PathBuf) -> Self {
        let file = read_config_file(&state_dir.join("openclaw.json"));

        let agents = if file.agents.is_empty() {
            default_roster()
        } else {
            file.agents
        };

        let llm_call_log_file = match std::env::var("OPENCLAW_LLM_CALL_LOG_FILE") {
            Ok(path) if !path.is_empty() => PathBuf::from(path),
            _ => state_dir.join("logs").join("llm-calls.jsonl"),
        };

        Self {
            state_dir,
            http_addr: file
                .http_addr
                .and_then(|addr| addr.parse().ok())
                .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 18790))),
            gateway_url: file
                .gateway_url
                .unwrap_or_else(|| "http://127.0.0.1:18789/rpc".into()),
            gateway_timeout_secs: DEFAULT_GATEWAY_TIMEOUT_SECS,
            default_agent_id: file.default_agent_id.unwrap_or_else(|| "main".into()),
            agents,
            stale_threshold_ms: file.stale_threshold_ms.unwrap_or(DEFAULT_STALE_THRESHOLD_MS),
            check_interval_ms: file.check_interval_ms.unwrap_or(DEFAULT_CHECK_INTERVAL_MS),
            trigger_cooldown_ms: file
                .trigger_cooldown_ms
                .unwrap_or(DEFAULT_TRIGGER_COOLDOWN_MS),
            llm_call_log_file,
        }
    }

    /// `$HOME/.openclaw`, or `$HOME/.openclaw-<suffix>` when
    /// `OPENCLAW_PROFILE` is set.
    pub fn default_state_dir() -> PathBuf {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        match std::env::var("OPENCLAW_PROFILE") {
            Ok(profile) if !profile.is_empty() => home.join(format!(".openclaw-{profile}")),
            _ => home.join(".openclaw"),
        }
    }

    /// The `company/` directory holding databases, documents, and the kb.
    pub fn company_dir(&self) -> PathBuf {
        self.state_dir.join("company")
    }

    /// Workspace directory for an agent. The default agent owns the
    /// top-level `workspace/`; everyone else lives under `workspaces/<id>/`.
    pub fn workspace_dir(&self, agent_id: &str) -> PathBuf {
        if agent_id == self.default_agent_id {
            self.state_dir.join("workspace")
        } else {
            self.state_dir.join("workspaces").join(agent_id)
        }
    }

    /// Roster snapshot for lock-free reads from the trigger engine.
    pub fn roster(&self) -> Arc<ArcSwap<HashSet<String>>> {
        let ids: HashSet<String> = self.agents.iter().map(|agent| agent.id.clone()).collect();
        Arc::new(ArcSwap::from_pointee(ids))
    }
}

fn read_config_file(path: &Path) -> ConfigFile {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return ConfigFile::default();
    };
    match serde_json::from_str(&raw) {
        Ok(file) => file,
        Err(error) => {
            tracing::warn!(%error, path = %path.display(), "ignoring malformed openclaw.json");
            ConfigFile::default()
        }
    }
}

/// Built-in roster used when no config file provides one: the CEO and the
/// investor contact that the seeded `investor-relations` channel expects.
fn default_roster() -> Vec<AgentProfile> {
    vec![
        AgentProfile {
            id: "main".into(),
            name: "CEO".into(),
            emoji: "🦉".into(),
            layer: "exec".into(),
            role: "Chief Executive".into(),
        },
        AgentProfile {
            id: "investor".into(),
            name: "Investor".into(),
            emoji: "💼".into(),
            layer: "board".into(),
            role: "Investor Relations".into(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_config_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::load_from(dir.path().to_path_buf());

        assert_eq!(config.default_agent_id, "main");
        assert_eq!(config.stale_threshold_ms, DEFAULT_STALE_THRESHOLD_MS);
        assert_eq!(config.trigger_cooldown_ms, DEFAULT_TRIGGER_COOLDOWN_MS);
        assert!(config.agents.iter().any(|agent| agent.id == "main"));
        assert!(config.agents.iter().any(|agent| agent.id == "investor"));
    }

    #[test]
    fn config_file_overrides_roster_and_timings() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("openclaw.json"),
            r#"{
                "agents": [{"id": "builder", "name": "Builder"}],
                "triggerCooldownMs": 250,
                "staleThresholdMs": 1000
            }"#,
        )
        .expect("write config");

        let config = Config::load_from(dir.path().to_path_buf());
        assert_eq!(config.trigger_cooldown_ms, 250);
        assert_eq!(config.stale_threshold_ms, 1000);
        assert_eq!(config.agents.len(), 1);
        assert_eq!(config.agents[0].id, "builder");
    }

    #[test]
    fn workspace_dir_splits_default_agent_from_hires() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::load_from(dir.path().to_path_buf());

        assert_eq!(config.workspace_dir("main"), dir.path().join("workspace"));
        assert_eq!(
            config.workspace_dir("builder"),
            dir.path().join("workspaces").join("builder")
        );
    }

    #[test]
    fn roster_snapshot_contains_agent_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::load_from(dir.path().to_path_buf());
        let roster = config.roster();
        assert!(roster.load().contains("main"));
        assert!(roster.load().contains("investor"));
    }
}

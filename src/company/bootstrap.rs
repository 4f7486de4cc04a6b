//! Company bootstrap: charter, budget, roster, workspaces, seed channel.
//!
//! Runs behind `company.create {goal}` and once at first startup for the
//! seed channel. Safe to repeat: documents are rewritten, workspaces other
//! than the CEO's keep their contents, and the seed channel is only created
//! when missing.

use crate::company::channels::{ChannelStore, ChannelType};
use crate::company::workspace;
use crate::config::Config;
use crate::error::{CompanyError, Result};
use anyhow::Context as _;

/// Name of the channel every company starts with.
pub const SEED_CHANNEL: &str = "investor-relations";

/// Initialize (or re-initialize) the company around a goal.
pub async fn run(config: &Config, channels: &ChannelStore, goal: &str) -> Result<()> {
    if goal.is_empty() {
        return Err(CompanyError::InvalidRequest("goal must not be empty".into()));
    }

    let company_dir = config.company_dir();
    tokio::fs::create_dir_all(company_dir.join("kb"))
        .await
        .with_context(|| format!("failed to create company dir: {}", company_dir.display()))?;

    tokio::fs::write(company_dir.join("CHARTER.md"), render_charter(goal))
        .await
        .context("failed to write CHARTER.md")?;
    tokio::fs::write(company_dir.join("BUDGET.md"), render_budget())
        .await
        .context("failed to write BUDGET.md")?;
    tokio::fs::write(company_dir.join("ROSTER.md"), render_roster(config))
        .await
        .context("failed to write ROSTER.md")?;

    // The CEO gets a clean slate; hires keep whatever they have written.
    workspace::reset_workspace(&config.workspace_dir(&config.default_agent_id)).await?;
    for agent in &config.agents {
        if agent.id != config.default_agent_id {
            workspace::scaffold_workspace(&config.workspace_dir(&agent.id)).await?;
        }
    }

    ensure_seed_channel(channels, &config.default_agent_id).await?;

    tracing::info!(goal, "company bootstrapped");
    Ok(())
}

/// Create the `investor-relations` channel with members `investor` and the
/// default agent, unless it already exists. Called at startup and from the
/// bootstrap.
pub async fn ensure_seed_channel(channels: &ChannelStore, default_agent_id: &str) -> Result<()> {
    if channels.resolve_channel(SEED_CHANNEL).await?.is_some() {
        return Ok(());
    }

    match channels
        .create_channel(
            SEED_CHANNEL,
            ChannelType::Private,
            "Updates and questions between the company and its investor",
            default_agent_id,
            &["investor".to_string()],
        )
        .await
    {
        Ok(_) => Ok(()),
        // A concurrent bootstrap got there first; that is fine.
        Err(CompanyError::AlreadyExists(_)) => Ok(()),
        Err(error) => Err(error),
    }
}

fn render_charter(goal: &str) -> String {
    format!(
        "# Company Charter\n\n\
         ## Mission\n\n\
         {goal}\n\n\
         ## How we operate\n\n\
         - All coordination happens in channels; decisions are posted, not implied.\n\
         - Every piece of work lives in a task thread with heartbeats while active.\n\
         - The investor hears about material changes in #investor-relations first.\n"
    )
}

fn render_budget() -> String {
    "# Budget\n\n\
     | Line | Monthly | Notes |\n\
     |------|---------|-------|\n\
     | LLM usage | TBD | tracked in logs/llm-calls.jsonl |\n\
     | Infrastructure | TBD | |\n\n\
     Update this file when spend commitments change.\n"
        .to_string()
}

fn render_roster(config: &Config) -> String {
    let mut roster = String::from(
        "# Roster\n\n\
         | id | name | emoji | layer | role |\n\
         |----|------|-------|-------|------|\n",
    );
    for agent in &config.agents {
        roster.push_str(&format!(
            "| {} | {} | {} | {} | {} |\n",
            agent.id, agent.name, agent.emoji, agent.layer, agent.role
        ));
    }
    roster
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::company::channels::MemberRole;
    use crate::db::CompanyDb;
    use crate::events;

    async fn fixture() -> (Config, ChannelStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::load_from(dir.path().to_path_buf());
        let db = CompanyDb::connect_in_memory().await.expect("open db");
        let store = ChannelStore::new(db.channels.clone(), events::bus());
        (config, store, dir)
    }

    #[tokio::test]
    async fn bootstrap_writes_documents_and_seed_channel() {
        let (config, store, dir) = fixture().await;

        run(&config, &store, "Be profitable by Q4")
            .await
            .expect("bootstrap");

        let charter = std::fs::read_to_string(dir.path().join("company/CHARTER.md"))
            .expect("charter exists");
        assert!(charter.contains("Be profitable by Q4"));

        let roster =
            std::fs::read_to_string(dir.path().join("company/ROSTER.md")).expect("roster exists");
        assert!(roster.contains("| main |"));

        assert!(dir.path().join("company/BUDGET.md").exists());
        assert!(dir.path().join("company/kb").is_dir());
        assert!(dir.path().join("workspace/SOUL.md").exists());

        let channel = store
            .get_channel(SEED_CHANNEL)
            .await
            .expect("lookup")
            .expect("seed channel exists");
        let member_ids: Vec<&str> = channel
            .members
            .iter()
            .map(|member| member.member_id.as_str())
            .collect();
        assert!(member_ids.contains(&"main"));
        assert!(member_ids.contains(&"investor"));

        let creator = channel
            .members
            .iter()
            .find(|member| member.member_id == "main")
            .expect("main present");
        assert_eq!(creator.role, MemberRole::Admin);
    }

    #[tokio::test]
    async fn bootstrap_is_repeatable() {
        let (config, store, dir) = fixture().await;

        run(&config, &store, "First goal").await.expect("first run");
        run(&config, &store, "Second goal").await.expect("second run");

        // Documents reflect the latest run; the seed channel is unique.
        let charter =
            std::fs::read_to_string(dir.path().join("company/CHARTER.md")).expect("charter");
        assert!(charter.contains("Second goal"));

        let previews = store.list_channels().await.expect("list");
        let seeds = previews
            .iter()
            .filter(|preview| preview.channel.name == SEED_CHANNEL)
            .count();
        assert_eq!(seeds, 1);
    }

    #[tokio::test]
    async fn empty_goal_is_rejected() {
        let (config, store, _dir) = fixture().await;
        let error = run(&config, &store, "").await.expect_err("empty goal");
        assert_eq!(error.code(), "INVALID_REQUEST");
    }
}

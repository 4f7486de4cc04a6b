//! Per-agent workspace files.
//!
//! The core treats these as opaque text blobs: templates are written at
//! hire time, agents rewrite them as they work. Only the bootstrap resets
//! the CEO workspace to a clean slate.

use crate::error::Result;
use anyhow::Context as _;
use std::path::Path;

/// Template files every agent workspace starts with.
const WORKSPACE_FILES: &[(&str, &str)] = &[
    (
        "SOUL.md",
        "<!-- This agent's soul: personality, values, communication style, boundaries. -->\n",
    ),
    (
        "IDENTITY.md",
        "<!-- This agent's identity: name, role in the company, purpose. -->\n",
    ),
    (
        "MEMORY.md",
        "# Memory\n\nLong-lived notes. Daily files live under memory/.\n",
    ),
    (
        "HEARTBEAT.md",
        "# Heartbeat\n\nWhen a heartbeat wakes you: check your task threads, \
heartbeat the active ones, then check your channels.\n",
    ),
    (
        "TOOLS.md",
        "# Tools\n\nNotes on the tools available to this agent.\n",
    ),
    (
        "AGENTS.md",
        "# Working here\n\nCoordinate through channels. Track work in task threads. \
Heartbeat anything you are actively working on.\n",
    ),
];

/// Write template files into a workspace, creating it if needed. Existing
/// files are left untouched — agents own their workspace contents.
pub async fn scaffold_workspace(workspace: &Path) -> Result<()> {
    write_files(workspace, false).await
}

/// Reset a workspace to the templates, overwriting whatever is there.
/// Used by the bootstrap for the CEO workspace only.
pub async fn reset_workspace(workspace: &Path) -> Result<()> {
    write_files(workspace, true).await
}

async fn write_files(workspace: &Path, overwrite: bool) -> Result<()> {
    tokio::fs::create_dir_all(workspace.join("memory"))
        .await
        .with_context(|| format!("failed to create workspace: {}", workspace.display()))?;

    for (filename, content) in WORKSPACE_FILES {
        let path = workspace.join(filename);
        if !overwrite && path.exists() {
            continue;
        }
        tokio::fs::write(&path, content)
            .await
            .with_context(|| format!("failed to write workspace file: {}", path.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scaffold_writes_templates_and_memory_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workspace = dir.path().join("workspaces").join("builder");

        scaffold_workspace(&workspace).await.expect("scaffold");

        for (filename, _) in WORKSPACE_FILES {
            assert!(workspace.join(filename).exists(), "{filename} missing");
        }
        assert!(workspace.join("memory").is_dir());
    }

    #[tokio::test]
    async fn scaffold_leaves_existing_files_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workspace = dir.path().to_path_buf();

        scaffold_workspace(&workspace).await.expect("scaffold");
        tokio::fs::write(workspace.join("SOUL.md"), "custom soul")
            .await
            .expect("write");

        scaffold_workspace(&workspace).await.expect("re-scaffold");
        let soul = tokio::fs::read_to_string(workspace.join("SOUL.md"))
            .await
            .expect("read");
        assert_eq!(soul, "custom soul");
    }

    #[tokio::test]
    async fn reset_overwrites_everything() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workspace = dir.path().to_path_buf();

        scaffold_workspace(&workspace).await.expect("scaffold");
        tokio::fs::write(workspace.join("SOUL.md"), "custom soul")
            .await
            .expect("write");

        reset_workspace(&workspace).await.expect("reset");
        let soul = tokio::fs::read_to_string(workspace.join("SOUL.md"))
            .await
            .expect("read");
        assert!(soul.starts_with("<!--"));
    }
}

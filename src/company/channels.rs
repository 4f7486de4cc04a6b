//! Channel substrate: channels, members, and message persistence (SQLite).

use crate::error::{map_unique_violation, CompanyError, Result};
use crate::events::ChannelEvent;
use crate::now_ms;
use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row as _, SqlitePool};
use tokio::sync::broadcast;

/// Channel visibility class. Varies only in policy, not storage shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Public,
    Private,
    Dm,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Public => "public",
            ChannelType::Private => "private",
            ChannelType::Dm => "dm",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "public" => Some(ChannelType::Public),
            "private" => Some(ChannelType::Private),
            "dm" => Some(ChannelType::Dm),
            _ => None,
        }
    }
}

/// Membership role. The channel creator always joins as `admin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Admin,
    Member,
}

impl MemberRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberRole::Admin => "admin",
            MemberRole::Member => "member",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "admin" => Some(MemberRole::Admin),
            "member" => Some(MemberRole::Member),
            _ => None,
        }
    }
}

/// A persisted channel row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub description: String,
    pub created_by: String,
    pub created_at: i64,
}

/// One membership edge.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMember {
    pub channel_id: String,
    pub member_id: String,
    pub role: MemberRole,
    pub joined_at: i64,
}

/// An immutable channel message.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessage {
    pub id: String,
    pub channel_id: String,
    pub sender_id: String,
    #[serde(rename = "text")]
    pub content: String,
    pub thread_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: i64,
}

/// Channel with its member list expanded.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDetail {
    #[serde(flatten)]
    pub channel: Channel,
    pub members: Vec<ChannelMember>,
}

/// List-view row: the channel, its member count, and the latest message.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPreview {
    #[serde(flatten)]
    pub channel: Channel,
    pub member_count: i64,
    pub last_message: Option<ChannelMessage>,
}

/// Paging options for `get_messages`.
#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    /// Page size; defaults to 50.
    pub limit: Option<i64>,
    /// Only messages strictly older than this timestamp. No bound if unset.
    pub before: Option<i64>,
    /// A thread id returns that thread; unset returns root-level messages.
    pub thread_id: Option<String>,
}

/// CRUD for channels, members, and messages, emitting a typed event after
/// every committed mutation.
#[derive(Clone)]
pub struct ChannelStore {
    pool: SqlitePool,
    events: broadcast::Sender<ChannelEvent>,
}

impl ChannelStore {
    pub fn new(pool: SqlitePool, events: broadcast::Sender<ChannelEvent>) -> Self {
        Self { pool, events }
    }

    /// Subscribe to this store's events.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Create a channel with its initial member list in one transaction.
    ///
    /// The creator is forced into the member list as `admin`; everyone else
    /// joins as `member`. An empty `members` slice defaults to the creator
    /// alone. Fails with `ALREADY_EXISTS` on a name collision.
    pub async fn create_channel(
        &self,
        name: &str,
        channel_type: ChannelType,
        description: &str,
        created_by: &str,
        members: &[String],
    ) -> Result<ChannelDetail> {
        if name.is_empty() {
            return Err(CompanyError::InvalidRequest("name must not be empty".into()));
        }
        if created_by.is_empty() {
            return Err(CompanyError::InvalidRequest(
                "createdBy must not be empty".into(),
            ));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let created_at = now_ms();

        // Creator first, then the requested members in order, deduplicated.
        let mut member_ids: Vec<&str> = vec![created_by];
        for member in members {
            if !member_ids.contains(&member.as_str()) {
                member_ids.push(member);
            }
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO channels (id, name, channel_type, description, created_by, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(name)
        .bind(channel_type.as_str())
        .bind(description)
        .bind(created_by)
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .map_err(|error| map_unique_violation(error, format!("channel already exists: {name}")))?;

        let mut member_rows = Vec::with_capacity(member_ids.len());
        for member_id in member_ids {
            let role = if member_id == created_by {
                MemberRole::Admin
            } else {
                MemberRole::Member
            };
            sqlx::query(
                "INSERT INTO channel_members (channel_id, member_id, role, joined_at) \
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&id)
            .bind(member_id)
            .bind(role.as_str())
            .bind(created_at)
            .execute(&mut *tx)
            .await?;
            member_rows.push(ChannelMember {
                channel_id: id.clone(),
                member_id: member_id.to_string(),
                role,
                joined_at: created_at,
            });
        }

        tx.commit().await?;

        let channel = Channel {
            id,
            name: name.to_string(),
            channel_type,
            description: description.to_string(),
            created_by: created_by.to_string(),
            created_at,
        };

        let _ = self.events.send(ChannelEvent::Created {
            channel: channel.clone(),
        });

        Ok(ChannelDetail {
            channel,
            members: member_rows,
        })
    }

    /// Delete a channel; members and messages cascade. Returns whether a
    /// channel was actually removed.
    pub async fn delete_channel(&self, id: &str) -> Result<bool> {
        let Some(channel) = self.resolve_channel(id).await? else {
            return Ok(false);
        };

        let deleted = sqlx::query("DELETE FROM channels WHERE id = ?")
            .bind(&channel.id)
            .execute(&self.pool)
            .await?
            .rows_affected()
            > 0;

        if deleted {
            let _ = self.events.send(ChannelEvent::Deleted {
                channel_id: channel.id,
                name: channel.name,
            });
        }

        Ok(deleted)
    }

    /// Look a channel up by id or name. No side effects.
    pub async fn resolve_channel(&self, name_or_id: &str) -> Result<Option<Channel>> {
        let row = sqlx::query(
            "SELECT id, name, channel_type, description, created_by, created_at \
             FROM channels WHERE id = ?1 OR name = ?1 LIMIT 1",
        )
        .bind(name_or_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| channel_from_row(&row)).transpose()
    }

    /// Look a channel up by id or name and expand its member list.
    pub async fn get_channel(&self, name_or_id: &str) -> Result<Option<ChannelDetail>> {
        let Some(channel) = self.resolve_channel(name_or_id).await? else {
            return Ok(None);
        };
        let members = self.list_members(&channel.id).await?;
        Ok(Some(ChannelDetail { channel, members }))
    }

    /// Members of one channel, in join order.
    pub async fn list_members(&self, channel_id: &str) -> Result<Vec<ChannelMember>> {
        let rows = sqlx::query(
            "SELECT channel_id, member_id, role, joined_at FROM channel_members \
             WHERE channel_id = ? ORDER BY joined_at ASC, member_id ASC",
        )
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(member_from_row).collect()
    }

    /// All channels as previews, oldest first.
    pub async fn list_channels(&self) -> Result<Vec<ChannelPreview>> {
        let rows = sqlx::query(
            "SELECT c.id, c.name, c.channel_type, c.description, c.created_by, c.created_at, \
                    (SELECT COUNT(*) FROM channel_members m WHERE m.channel_id = c.id) AS member_count \
             FROM channels c ORDER BY c.created_at ASC, c.id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        self.previews_from_rows(rows).await
    }

    /// Channels a member belongs to, as previews, oldest first.
    pub async fn list_channels_for_member(&self, member_id: &str) -> Result<Vec<ChannelPreview>> {
        let rows = sqlx::query(
            "SELECT c.id, c.name, c.channel_type, c.description, c.created_by, c.created_at, \
                    (SELECT COUNT(*) FROM channel_members m WHERE m.channel_id = c.id) AS member_count \
             FROM channels c \
             JOIN channel_members cm ON cm.channel_id = c.id AND cm.member_id = ? \
             ORDER BY c.created_at ASC, c.id ASC",
        )
        .bind(member_id)
        .fetch_all(&self.pool)
        .await?;

        self.previews_from_rows(rows).await
    }

    async fn previews_from_rows(&self, rows: Vec<SqliteRow>) -> Result<Vec<ChannelPreview>> {
        let mut previews = Vec::with_capacity(rows.len());
        for row in rows {
            let channel = channel_from_row(&row)?;
            let member_count: i64 = row.try_get("member_count")?;
            let last_message = self.last_message(&channel.id).await?;
            previews.push(ChannelPreview {
                channel,
                member_count,
                last_message,
            });
        }
        Ok(previews)
    }

    async fn last_message(&self, channel_id: &str) -> Result<Option<ChannelMessage>> {
        let row = sqlx::query(
            "SELECT id, channel_id, sender_id, content, thread_id, metadata, created_at \
             FROM channel_messages WHERE channel_id = ? \
             ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(channel_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| message_from_row(&row)).transpose()
    }

    /// Append a message. The channel must exist; membership is a policy
    /// decision enforced upstream, not here. The post is durable the moment
    /// this returns; the wake-up side effects ride on the emitted event.
    pub async fn post_message(
        &self,
        channel_id: &str,
        sender_id: &str,
        content: &str,
        thread_id: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<ChannelMessage> {
        let channel_name: Option<String> =
            sqlx::query_scalar("SELECT name FROM channels WHERE id = ?")
                .bind(channel_id)
                .fetch_optional(&self.pool)
                .await?;
        let Some(channel_name) = channel_name else {
            return Err(CompanyError::NotFound(format!(
                "channel not found: {channel_id}"
            )));
        };

        let message = ChannelMessage {
            id: uuid::Uuid::new_v4().to_string(),
            channel_id: channel_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            thread_id,
            metadata,
            created_at: now_ms(),
        };

        let metadata_json = message
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|error| anyhow!("failed to encode message metadata: {error}"))?;

        sqlx::query(
            "INSERT INTO channel_messages (id, channel_id, sender_id, content, thread_id, metadata, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(&message.channel_id)
        .bind(&message.sender_id)
        .bind(&message.content)
        .bind(&message.thread_id)
        .bind(&metadata_json)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;

        let _ = self.events.send(ChannelEvent::Message {
            message: message.clone(),
            channel_name,
        });

        Ok(message)
    }

    /// Read messages in ascending timestamp order.
    ///
    /// The internal query pages newest-first so `limit` takes the most
    /// recent window, then reverses at the boundary. With a `thread_id` the
    /// result is that thread alone; without one, root-level messages only.
    pub async fn get_messages(
        &self,
        channel_id: &str,
        query: MessageQuery,
    ) -> Result<Vec<ChannelMessage>> {
        let limit = query.limit.unwrap_or(crate::config::DEFAULT_MESSAGE_LIMIT);

        let thread_clause = if query.thread_id.is_some() {
            "thread_id = ?4"
        } else {
            "thread_id IS NULL"
        };
        let sql = format!(
            "SELECT id, channel_id, sender_id, content, thread_id, metadata, created_at \
             FROM channel_messages \
             WHERE channel_id = ?1 \
               AND (?2 IS NULL OR created_at < ?2) \
               AND {thread_clause} \
             ORDER BY created_at DESC, id DESC LIMIT ?3",
        );

        let mut db_query = sqlx::query(&sql)
            .bind(channel_id)
            .bind(query.before)
            .bind(limit);
        if let Some(thread_id) = &query.thread_id {
            db_query = db_query.bind(thread_id);
        }

        let rows = db_query.fetch_all(&self.pool).await?;
        let mut messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>>>()?;

        messages.reverse();
        Ok(messages)
    }

    /// Add a member. Idempotent: returns `false` when the edge exists.
    pub async fn add_member(
        &self,
        channel_id: &str,
        member_id: &str,
        role: MemberRole,
    ) -> Result<bool> {
        let Some(channel) = self.resolve_channel(channel_id).await? else {
            return Err(CompanyError::NotFound(format!(
                "channel not found: {channel_id}"
            )));
        };

        let added = sqlx::query(
            "INSERT OR IGNORE INTO channel_members (channel_id, member_id, role, joined_at) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(&channel.id)
        .bind(member_id)
        .bind(role.as_str())
        .bind(now_ms())
        .execute(&self.pool)
        .await?
        .rows_affected()
            > 0;

        if added {
            let _ = self.events.send(ChannelEvent::MemberJoined {
                channel_id: channel.id,
                channel_name: channel.name,
                member_id: member_id.to_string(),
                role,
            });
        }

        Ok(added)
    }

    /// Remove a member. Idempotent: returns `false` when no edge existed.
    /// Past messages from the member are untouched.
    pub async fn remove_member(&self, channel_id: &str, member_id: &str) -> Result<bool> {
        let Some(channel) = self.resolve_channel(channel_id).await? else {
            return Err(CompanyError::NotFound(format!(
                "channel not found: {channel_id}"
            )));
        };

        let removed =
            sqlx::query("DELETE FROM channel_members WHERE channel_id = ? AND member_id = ?")
                .bind(&channel.id)
                .bind(member_id)
                .execute(&self.pool)
                .await?
                .rows_affected()
                > 0;

        if removed {
            let _ = self.events.send(ChannelEvent::MemberLeft {
                channel_id: channel.id,
                channel_name: channel.name,
                member_id: member_id.to_string(),
            });
        }

        Ok(removed)
    }

    /// When a member last posted anywhere. Feeds the liveness view.
    pub async fn last_posted_at(&self, sender_id: &str) -> Result<Option<i64>> {
        let at = sqlx::query_scalar(
            "SELECT MAX(created_at) FROM channel_messages WHERE sender_id = ?",
        )
        .bind(sender_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(at)
    }

    /// How many channels a member belongs to.
    pub async fn membership_count(&self, member_id: &str) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM channel_members WHERE member_id = ?")
            .bind(member_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Member ids of one channel. Used by the trigger engine for recipient
    /// resolution without materializing full member rows.
    pub async fn member_ids(&self, channel_id: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT member_id FROM channel_members WHERE channel_id = ? \
             ORDER BY joined_at ASC, member_id ASC",
        )
        .bind(channel_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

fn channel_from_row(row: &SqliteRow) -> Result<Channel> {
    let channel_type: String = row.try_get("channel_type")?;
    Ok(Channel {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        channel_type: ChannelType::parse(&channel_type)
            .ok_or_else(|| anyhow!("unknown channel type in row: {channel_type}"))?,
        description: row.try_get("description")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
    })
}

fn member_from_row(row: &SqliteRow) -> Result<ChannelMember> {
    let role: String = row.try_get("role")?;
    Ok(ChannelMember {
        channel_id: row.try_get("channel_id")?,
        member_id: row.try_get("member_id")?,
        role: MemberRole::parse(&role).ok_or_else(|| anyhow!("unknown member role in row: {role}"))?,
        joined_at: row.try_get("joined_at")?,
    })
}

fn message_from_row(row: &SqliteRow) -> Result<ChannelMessage> {
    let metadata: Option<String> = row.try_get("metadata")?;
    let metadata = metadata
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|error| anyhow!("failed to decode message metadata: {error}"))?;

    Ok(ChannelMessage {
        id: row.try_get("id")?,
        channel_id: row.try_get("channel_id")?,
        sender_id: row.try_get("sender_id")?,
        content: row.try_get("content")?,
        thread_id: row.try_get("thread_id")?,
        metadata,
        created_at: row.try_get("created_at")?,
    })
}

//! SQLite persistence for registered channels, their VODs and per-user
//! render settings.
//!
//! Timestamps are stored as unix seconds so that ordering by publication
//! time is a plain integer comparison.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Row, params};
use serde::{Deserialize, Serialize};

use crate::commands::{DEFAULT_CHAT_FONT, DEFAULT_CHAT_HEIGHT, DEFAULT_CHAT_WIDTH, RenderSettings};
use crate::twitch::{ChannelProfile, FetchedVod};

pub const DEFAULT_VODS_PER_LOAD: i64 = 5;

/// A platform channel registered by one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRecord {
    pub id: i64,
    pub user_id: String,
    pub twitch_id: String,
    pub login: String,
    pub display_name: String,
    pub avatar_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Rows stored in the `vods` table. `vod_id` is the platform's identifier
/// and the upsert key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VodRecord {
    pub id: i64,
    pub vod_id: String,
    pub channel_id: i64,
    pub title: String,
    pub published_at: DateTime<Utc>,
    pub duration: i64,
    pub url: String,
    pub thumbnail: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSettings {
    pub chat_width: i64,
    pub chat_height: i64,
    pub chat_font: String,
    pub vods_per_load: i64,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            chat_width: DEFAULT_CHAT_WIDTH,
            chat_height: DEFAULT_CHAT_HEIGHT,
            chat_font: DEFAULT_CHAT_FONT.to_string(),
            vods_per_load: DEFAULT_VODS_PER_LOAD,
        }
    }
}

impl UserSettings {
    pub fn render(&self) -> RenderSettings {
        RenderSettings {
            chat_width: self.chat_width,
            chat_height: self.chat_height,
            chat_font: self.chat_font.clone(),
        }
    }
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS channels (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id TEXT NOT NULL,
            twitch_id TEXT NOT NULL,
            login TEXT NOT NULL,
            display_name TEXT NOT NULL,
            avatar_url TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(user_id, twitch_id)
        );

        CREATE TABLE IF NOT EXISTS vods (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            vod_id TEXT NOT NULL UNIQUE,
            channel_id INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
            title TEXT NOT NULL,
            published_at INTEGER NOT NULL,
            duration INTEGER NOT NULL DEFAULT 0,
            url TEXT NOT NULL,
            thumbnail TEXT NOT NULL DEFAULT '',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS user_settings (
            user_id TEXT PRIMARY KEY,
            chat_width INTEGER NOT NULL,
            chat_height INTEGER NOT NULL,
            chat_font TEXT NOT NULL,
            vods_per_load INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_channels_user ON channels(user_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_vods_channel_published ON vods(channel_id, published_at DESC);
        "#,
    )
    .await?;
    Ok(())
}

const CHANNEL_COLUMNS: &str =
    "id, user_id, twitch_id, login, display_name, avatar_url, created_at, updated_at";
const VOD_COLUMNS: &str = "id, vod_id, channel_id, title, published_at, duration, url, thumbnail";

/// Wrapper around the SQLite-compatible connection. Cheap to clone; every
/// clone shares the same underlying connection.
#[derive(Clone)]
pub struct MetadataStore {
    conn: Connection,
}

impl MetadataStore {
    /// Opens (and if necessary creates) the database file and ensures the
    /// expected schema exists.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening database {}", path.display()))?;

        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;
        Ok(Self { conn })
    }

    /// Registers a channel for `user_id`. Returns `None` when that user
    /// already tracks the same platform channel.
    pub async fn insert_channel(
        &self,
        user_id: &str,
        profile: &ChannelProfile,
    ) -> Result<Option<ChannelRecord>> {
        let now = Utc::now().timestamp();
        let mut rows = self
            .conn
            .query(
                &format!(
                    r#"
                    INSERT INTO channels (
                        user_id, twitch_id, login, display_name, avatar_url, created_at, updated_at
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                    ON CONFLICT(user_id, twitch_id) DO NOTHING
                    RETURNING {CHANNEL_COLUMNS}
                    "#
                ),
                params![
                    user_id,
                    profile.twitch_id.as_str(),
                    profile.login.as_str(),
                    profile.display_name.as_str(),
                    profile.avatar_url.as_str(),
                    now,
                ],
            )
            .await
            .context("inserting channel")?;

        // The conflict clause returns no row for a duplicate.
        match rows.next().await.context("reading inserted channel")? {
            Some(row) => Ok(Some(row_to_channel(&row)?)),
            None => Ok(None),
        }
    }

    /// Looks a channel up under its owner; other users' channels are
    /// indistinguishable from missing ones.
    pub async fn find_channel(&self, user_id: &str, channel_id: i64) -> Result<Option<ChannelRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {CHANNEL_COLUMNS} FROM channels WHERE id = ?1 AND user_id = ?2"),
                params![channel_id, user_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_channel(&row)?)),
            None => Ok(None),
        }
    }

    /// Deletes the channel and, through the foreign key, its VODs.
    pub async fn delete_channel(&self, user_id: &str, channel_id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM channels WHERE id = ?1 AND user_id = ?2",
                params![channel_id, user_id],
            )
            .await
            .context("deleting channel")?;
        Ok(deleted > 0)
    }

    /// Channels of one user, most recently registered first.
    pub async fn list_channels(&self, user_id: &str) -> Result<Vec<ChannelRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {CHANNEL_COLUMNS} FROM channels WHERE user_id = ?1 ORDER BY created_at DESC, id DESC"
                ),
                params![user_id],
            )
            .await?;
        let mut channels = Vec::new();
        while let Some(row) = rows.next().await? {
            channels.push(row_to_channel(&row)?);
        }
        Ok(channels)
    }

    pub async fn list_all_channels(&self) -> Result<Vec<ChannelRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {CHANNEL_COLUMNS} FROM channels ORDER BY id ASC"),
                params![],
            )
            .await?;
        let mut channels = Vec::new();
        while let Some(row) = rows.next().await? {
            channels.push(row_to_channel(&row)?);
        }
        Ok(channels)
    }

    /// Refreshes the mutable parts of a channel (login, name and avatar).
    /// Only applies when `profile` belongs to the same platform channel;
    /// returns whether a row was updated.
    pub async fn update_channel_profile(&self, channel_id: i64, profile: &ChannelProfile) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                r#"
                UPDATE channels
                SET login = ?3, display_name = ?4, avatar_url = ?5, updated_at = ?6
                WHERE id = ?1 AND twitch_id = ?2
                "#,
                params![
                    channel_id,
                    profile.twitch_id.as_str(),
                    profile.login.as_str(),
                    profile.display_name.as_str(),
                    profile.avatar_url.as_str(),
                    Utc::now().timestamp(),
                ],
            )
            .await
            .context("updating channel profile")?;
        Ok(updated > 0)
    }

    /// Inserts or updates a VOD keyed by its platform id. An existing row
    /// keeps the channel it was first stored under, so when two users track
    /// the same platform channel the returned record may carry the other
    /// user's `channel_id` and is not counted under `channel_id`.
    pub async fn upsert_vod(&self, channel_id: i64, vod: &FetchedVod) -> Result<VodRecord> {
        let now = Utc::now().timestamp();
        self.conn
            .execute(
                r#"
                INSERT INTO vods (
                    vod_id, channel_id, title, published_at, duration, url, thumbnail,
                    created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                ON CONFLICT(vod_id) DO UPDATE SET
                    title = excluded.title,
                    published_at = excluded.published_at,
                    duration = excluded.duration,
                    url = excluded.url,
                    thumbnail = excluded.thumbnail,
                    updated_at = excluded.updated_at
                "#,
                params![
                    vod.vod_id.as_str(),
                    channel_id,
                    vod.title.as_str(),
                    vod.published_at.timestamp(),
                    vod.duration,
                    vod.url.as_str(),
                    vod.thumbnail.as_str(),
                    now,
                ],
            )
            .await
            .with_context(|| format!("upserting vod {}", vod.vod_id))?;

        self.get_vod(&vod.vod_id)
            .await?
            .with_context(|| format!("vod {} missing after upsert", vod.vod_id))
    }

    pub async fn get_vod(&self, vod_id: &str) -> Result<Option<VodRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {VOD_COLUMNS} FROM vods WHERE vod_id = ?1"),
                params![vod_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_vod(&row)?)),
            None => Ok(None),
        }
    }

    /// One page of a channel's VODs, newest publication first.
    pub async fn list_vods(&self, channel_id: i64, limit: i64, offset: i64) -> Result<Vec<VodRecord>> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    r#"
                    SELECT {VOD_COLUMNS}
                    FROM vods
                    WHERE channel_id = ?1
                    ORDER BY published_at DESC, id DESC
                    LIMIT ?2 OFFSET ?3
                    "#
                ),
                params![channel_id, limit, offset],
            )
            .await?;
        let mut vods = Vec::new();
        while let Some(row) = rows.next().await? {
            vods.push(row_to_vod(&row)?);
        }
        Ok(vods)
    }

    pub async fn count_vods(&self, channel_id: i64) -> Result<i64> {
        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM vods WHERE channel_id = ?1",
                params![channel_id],
            )
            .await?;
        let row = rows.next().await?.context("missing count row")?;
        Ok(row.get(0)?)
    }

    pub async fn latest_vod(&self, channel_id: i64) -> Result<Option<VodRecord>> {
        Ok(self.list_vods(channel_id, 1, 0).await?.into_iter().next())
    }

    pub async fn get_settings(&self, user_id: &str) -> Result<Option<UserSettings>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT chat_width, chat_height, chat_font, vods_per_load
                FROM user_settings
                WHERE user_id = ?1
                "#,
                params![user_id],
            )
            .await?;
        let Some(row) = rows.next().await? else {
            return Ok(None);
        };
        Ok(Some(UserSettings {
            chat_width: row.get(0)?,
            chat_height: row.get(1)?,
            chat_font: row.get(2)?,
            vods_per_load: row.get(3)?,
        }))
    }

    /// Returns the user's settings, writing the defaults on first access.
    pub async fn get_or_create_settings(&self, user_id: &str) -> Result<UserSettings> {
        if let Some(existing) = self.get_settings(user_id).await? {
            return Ok(existing);
        }
        let defaults = UserSettings::default();
        self.conn
            .execute(
                r#"
                INSERT INTO user_settings (
                    user_id, chat_width, chat_height, chat_font, vods_per_load, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(user_id) DO NOTHING
                "#,
                params![
                    user_id,
                    defaults.chat_width,
                    defaults.chat_height,
                    defaults.chat_font.as_str(),
                    defaults.vods_per_load,
                    Utc::now().timestamp(),
                ],
            )
            .await
            .context("creating default settings")?;
        self.get_settings(user_id)
            .await?
            .context("settings missing after insert")
    }

    pub async fn upsert_settings(&self, user_id: &str, settings: &UserSettings) -> Result<UserSettings> {
        self.conn
            .execute(
                r#"
                INSERT INTO user_settings (
                    user_id, chat_width, chat_height, chat_font, vods_per_load, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(user_id) DO UPDATE SET
                    chat_width = excluded.chat_width,
                    chat_height = excluded.chat_height,
                    chat_font = excluded.chat_font,
                    vods_per_load = excluded.vods_per_load,
                    updated_at = excluded.updated_at
                "#,
                params![
                    user_id,
                    settings.chat_width,
                    settings.chat_height,
                    settings.chat_font.as_str(),
                    settings.vods_per_load,
                    Utc::now().timestamp(),
                ],
            )
            .await
            .context("saving settings")?;
        Ok(settings.clone())
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).with_context(|| format!("invalid stored timestamp {secs}"))
}

/// Column order must match `CHANNEL_COLUMNS`.
fn row_to_channel(row: &Row) -> Result<ChannelRecord> {
    Ok(ChannelRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        twitch_id: row.get(2)?,
        login: row.get(3)?,
        display_name: row.get(4)?,
        avatar_url: row.get(5)?,
        created_at: timestamp(row.get(6)?)?,
        updated_at: timestamp(row.get(7)?)?,
    })
}

/// Column order must match `VOD_COLUMNS`.
fn row_to_vod(row: &Row) -> Result<VodRecord> {
    Ok(VodRecord {
        id: row.get(0)?,
        vod_id: row.get(1)?,
        channel_id: row.get(2)?,
        title: row.get(3)?,
        published_at: timestamp(row.get(4)?)?,
        duration: row.get(5)?,
        url: row.get(6)?,
        thumbnail: row.get(7)?,
    })
}

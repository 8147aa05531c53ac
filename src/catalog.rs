//! Per-user view over tracked channels and their VODs.
//!
//! Refresh pulls the newest page from the platform and upserts it; load-more
//! only pages through what is already stored. Every VOD handed out is
//! decorated with a freshly built [`CommandSet`].

use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::commands::{CommandSet, RenderSettings, format_duration};
use crate::error::{Error, Result};
use crate::metadata::{ChannelRecord, MetadataStore, UserSettings, VodRecord};
use crate::twitch::{ChannelProfile, VideoPage, VideoPlatform};

pub const CHAT_WIDTH_RANGE: std::ops::RangeInclusive<i64> = 100..=1920;
pub const CHAT_HEIGHT_RANGE: std::ops::RangeInclusive<i64> = 100..=1080;
pub const VODS_PER_LOAD_RANGE: std::ops::RangeInclusive<i64> = 1..=50;

/// A stored VOD plus everything the UI shows next to it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VodWithCommands {
    #[serde(flatten)]
    pub vod: VodRecord,
    pub duration_text: String,
    #[serde(flatten)]
    pub commands: CommandSet,
}

impl VodWithCommands {
    pub fn decorate(vod: VodRecord, settings: &RenderSettings) -> Self {
        let commands = CommandSet::build(&vod.vod_id, &vod.title, vod.published_at, settings);
        Self {
            duration_text: format_duration(vod.duration),
            vod,
            commands,
        }
    }
}

/// Result of refresh and load-more. `has_more` means different things for
/// the two: refresh reports whether the platform returned a cursor, load-more
/// reports whether the page came back full.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VodPage {
    pub vods: Vec<VodWithCommands>,
    pub has_more: bool,
}

/// `vod_count` and `latest_vod` only see VODs stored under this channel row.
/// VOD ids are global, so a user who starts tracking a channel someone else
/// already refreshed sees 0 here for the VODs stored under the other row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSummary {
    #[serde(flatten)]
    pub channel: ChannelRecord,
    pub vod_count: i64,
    pub latest_vod: Option<VodWithCommands>,
}

#[derive(Clone)]
pub struct Catalog {
    store: MetadataStore,
    platform: Arc<dyn VideoPlatform>,
}

impl Catalog {
    pub fn new(store: MetadataStore, platform: Arc<dyn VideoPlatform>) -> Self {
        Self { store, platform }
    }

    pub fn store(&self) -> &MetadataStore {
        &self.store
    }

    /// Runs a blocking platform call off the async runtime.
    async fn on_platform<T, F>(&self, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn VideoPlatform) -> Result<T> + Send + 'static,
    {
        let platform = self.platform.clone();
        tokio::task::spawn_blocking(move || call(platform.as_ref()))
            .await
            .map_err(|err| Error::Upstream(format!("platform request aborted: {err}")))?
    }

    async fn owned_channel(&self, user_id: &str, channel_id: i64) -> Result<ChannelRecord> {
        self.store
            .find_channel(user_id, channel_id)
            .await?
            .ok_or_else(|| Error::NotFound("Channel not found".into()))
    }

    pub async fn add_channel(&self, user_id: &str, handle: &str) -> Result<ChannelRecord> {
        let handle = handle.trim().to_string();
        if handle.is_empty() {
            return Err(Error::Validation("Channel name is required".into()));
        }

        let profile: ChannelProfile = self
            .on_platform(move |platform| platform.resolve_channel(&handle))
            .await?;
        let channel = self
            .store
            .insert_channel(user_id, &profile)
            .await?
            .ok_or_else(|| {
                Error::AlreadyExists(format!(
                    "Channel \"{}\" is already registered",
                    profile.login
                ))
            })?;
        info!(user_id, channel_id = channel.id, login = %channel.login, "channel added");
        Ok(channel)
    }

    pub async fn remove_channel(&self, user_id: &str, channel_id: i64) -> Result<()> {
        if !self.store.delete_channel(user_id, channel_id).await? {
            return Err(Error::NotFound("Channel not found".into()));
        }
        info!(user_id, channel_id, "channel removed");
        Ok(())
    }

    /// Every channel of the user with its VOD count and newest VOD.
    pub async fn list_channels(&self, user_id: &str) -> Result<Vec<ChannelSummary>> {
        let settings = self.store.get_or_create_settings(user_id).await?.render();
        let channels = self.store.list_channels(user_id).await?;

        let mut summaries = Vec::with_capacity(channels.len());
        for channel in channels {
            let vod_count = self.store.count_vods(channel.id).await?;
            let latest_vod = self
                .store
                .latest_vod(channel.id)
                .await?
                .map(|vod| VodWithCommands::decorate(vod, &settings));
            summaries.push(ChannelSummary {
                channel,
                vod_count,
                latest_vod,
            });
        }
        Ok(summaries)
    }

    /// Fetches the newest `limit` VODs from the platform and upserts them.
    /// Stored VODs missing from the page are left alone. Not transactional:
    /// an error midway keeps whatever was already written. A VOD first
    /// stored under another user's channel comes back with that channel's id.
    pub async fn refresh(
        &self,
        user_id: &str,
        channel_id: i64,
        limit: i64,
        settings: Option<&RenderSettings>,
    ) -> Result<VodPage> {
        let channel = self.owned_channel(user_id, channel_id).await?;
        let first = u32::try_from(limit)
            .ok()
            .filter(|limit| *limit >= 1)
            .ok_or_else(|| {
                Error::Validation(format!("limit must be between 1 and {}", u32::MAX))
            })?;
        let settings = settings.cloned().unwrap_or_default();

        let twitch_id = channel.twitch_id.clone();
        let VideoPage { videos, cursor } = self
            .on_platform(move |platform| platform.list_videos(&twitch_id, first, None))
            .await?;

        let mut vods = Vec::with_capacity(videos.len());
        for video in &videos {
            let stored = self.store.upsert_vod(channel.id, video).await?;
            vods.push(VodWithCommands::decorate(stored, &settings));
        }

        info!(
            user_id,
            channel_id,
            fetched = vods.len(),
            has_more = cursor.is_some(),
            "channel refreshed"
        );
        Ok(VodPage {
            vods,
            has_more: cursor.is_some(),
        })
    }

    /// Reads one page of stored VODs, newest first. Never calls the platform.
    pub async fn load_more(
        &self,
        user_id: &str,
        channel_id: i64,
        limit: i64,
        offset: i64,
        settings: Option<&RenderSettings>,
    ) -> Result<VodPage> {
        let channel = self.owned_channel(user_id, channel_id).await?;
        if limit < 1 {
            return Err(Error::Validation("limit must be at least 1".into()));
        }
        if offset < 0 {
            return Err(Error::Validation("offset must not be negative".into()));
        }
        let settings = settings.cloned().unwrap_or_default();

        let vods: Vec<_> = self
            .store
            .list_vods(channel.id, limit, offset)
            .await?
            .into_iter()
            .map(|vod| VodWithCommands::decorate(vod, &settings))
            .collect();
        let has_more = vods.len() as i64 == limit;
        Ok(VodPage { vods, has_more })
    }

    pub async fn get_settings(&self, user_id: &str) -> Result<UserSettings> {
        Ok(self.store.get_or_create_settings(user_id).await?)
    }

    pub async fn update_settings(&self, user_id: &str, settings: UserSettings) -> Result<UserSettings> {
        validate_settings(&settings)?;
        let saved = self.store.upsert_settings(user_id, &settings).await?;
        info!(user_id, "settings updated");
        Ok(saved)
    }

    /// Re-resolves the channel on the platform by its stable id and stores
    /// its current login, name and avatar.
    pub async fn refresh_profile(&self, channel: &ChannelRecord) -> Result<ChannelProfile> {
        let twitch_id = channel.twitch_id.clone();
        let profile = self
            .on_platform(move |platform| platform.resolve_channel_by_id(&twitch_id))
            .await?;
        if profile.twitch_id != channel.twitch_id {
            return Err(Error::Upstream(format!(
                "Twitch returned user {} when asked for {}",
                profile.twitch_id, channel.twitch_id
            )));
        }
        if !self.store.update_channel_profile(channel.id, &profile).await? {
            return Err(Error::NotFound("Channel not found".into()));
        }
        if profile.login != channel.login {
            info!(channel_id = channel.id, old = %channel.login, new = %profile.login, "channel renamed");
        }
        Ok(profile)
    }
}

pub fn validate_settings(settings: &UserSettings) -> Result<()> {
    if !CHAT_WIDTH_RANGE.contains(&settings.chat_width) {
        return Err(Error::Validation(format!(
            "chatWidth must be between {} and {}",
            CHAT_WIDTH_RANGE.start(),
            CHAT_WIDTH_RANGE.end()
        )));
    }
    if !CHAT_HEIGHT_RANGE.contains(&settings.chat_height) {
        return Err(Error::Validation(format!(
            "chatHeight must be between {} and {}",
            CHAT_HEIGHT_RANGE.start(),
            CHAT_HEIGHT_RANGE.end()
        )));
    }
    if settings.chat_font.trim().is_empty() {
        return Err(Error::Validation("chatFont must not be empty".into()));
    }
    if !VODS_PER_LOAD_RANGE.contains(&settings.vods_per_load) {
        return Err(Error::Validation(format!(
            "vodsPerLoad must be between {} and {}",
            VODS_PER_LOAD_RANGE.start(),
            VODS_PER_LOAD_RANGE.end()
        )));
    }
    Ok(())
}

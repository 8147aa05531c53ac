//! Builds the TwitchDownloaderCLI invocations shown next to every VOD.
//!
//! The strings are pasted into a terminal as-is, so flag names, argument
//! order and quoting must match what the CLI expects byte for byte.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sanitize::{escape_quotes, sanitize};

const DOWNLOADER: &str = "./TwitchDownloaderCLI";
const CHAT_JSON: &str = "chat.json";
const CHAT_VIDEO: &str = "chat.mp4";

pub const DEFAULT_CHAT_WIDTH: i64 = 400;
pub const DEFAULT_CHAT_HEIGHT: i64 = 350;
pub const DEFAULT_CHAT_FONT: &str = "Arial";

/// Chat overlay options used by the `chatrender` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderSettings {
    pub chat_width: i64,
    pub chat_height: i64,
    pub chat_font: String,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            chat_width: DEFAULT_CHAT_WIDTH,
            chat_height: DEFAULT_CHAT_HEIGHT,
            chat_font: DEFAULT_CHAT_FONT.to_string(),
        }
    }
}

/// The three commands derived from one VOD. Never persisted: rebuild it
/// whenever the render settings change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandSet {
    pub video_command: String,
    pub chat_download_command: String,
    pub chat_render_command: String,
}

impl CommandSet {
    pub fn build(
        vod_id: &str,
        title: &str,
        published_at: DateTime<Utc>,
        settings: &RenderSettings,
    ) -> Self {
        Self {
            video_command: video_download_command(vod_id, title, published_at),
            chat_download_command: chat_download_command(vod_id),
            chat_render_command: chat_render_command(vod_id, title, published_at, settings),
        }
    }
}

/// `videodownload` into `"<YYYY-MM-DD> <title>.mp4"`, dated in UTC.
pub fn video_download_command(vod_id: &str, title: &str, published_at: DateTime<Utc>) -> String {
    let date = published_at.format("%Y-%m-%d");
    let title = sanitize(title);
    format!("{DOWNLOADER} videodownload --id {vod_id} -o \"{date} {title}.mp4\"")
}

pub fn chat_download_command(vod_id: &str) -> String {
    format!("{DOWNLOADER} chatdownload --id {vod_id} -o {CHAT_JSON}")
}

/// `chatrender` reads the fixed `chat.json` produced by
/// [`chat_download_command`], so the VOD itself does not show up in the
/// output. Numbers are formatted as given, including out-of-range values.
pub fn chat_render_command(
    _vod_id: &str,
    _title: &str,
    _published_at: DateTime<Utc>,
    settings: &RenderSettings,
) -> String {
    let font = escape_quotes(&settings.chat_font);
    format!(
        "{DOWNLOADER} chatrender -i {CHAT_JSON} -o \"{CHAT_VIDEO}\" -w {} -h {} -f \"{font}\"",
        settings.chat_width, settings.chat_height
    )
}

/// Human readable length, `1h 2m 3s` or `2m 3s` when under an hour.
pub fn format_duration(total_seconds: i64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else {
        format!("{minutes}m {seconds}s")
    }
}

//! Thin blocking client for the Twitch Helix API.
//!
//! Only three endpoints are used: the client-credentials token exchange, the
//! user lookup (by login or by id) and the archive video listing. Callers on an async
//! runtime should go through `spawn_blocking`.

use std::{
    sync::{Arc, LazyLock},
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TwitchCredentials;
use crate::error::{Error, Result};

pub const DEFAULT_ID_BASE: &str = "https://id.twitch.tv";
pub const DEFAULT_API_BASE: &str = "https://api.twitch.tv/helix";

const THUMBNAIL_WIDTH: &str = "640";
const THUMBNAIL_HEIGHT: &str = "360";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// A cached token is only handed out while it has more than this left.
const TOKEN_REFRESH_MARGIN: TimeDelta = TimeDelta::seconds(60);

/// Identity of a channel as reported by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelProfile {
    pub twitch_id: String,
    pub login: String,
    pub display_name: String,
    pub avatar_url: String,
}

/// One archived broadcast, already normalized (duration in seconds,
/// thumbnail placeholders filled in).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedVod {
    pub vod_id: String,
    pub title: String,
    pub published_at: DateTime<Utc>,
    pub duration: i64,
    pub url: String,
    pub thumbnail: String,
}

/// A page of videos, newest first, plus the cursor for the next page.
#[derive(Debug, Clone, Default)]
pub struct VideoPage {
    pub videos: Vec<FetchedVod>,
    pub cursor: Option<String>,
}

/// Source of channel and video metadata. Implemented by [`TwitchClient`];
/// tests swap in an in-memory fake.
pub trait VideoPlatform: Send + Sync {
    fn resolve_channel(&self, handle: &str) -> Result<ChannelProfile>;

    /// Looks a channel up by its stable platform id. Survives renames.
    fn resolve_channel_by_id(&self, twitch_id: &str) -> Result<ChannelProfile>;

    fn list_videos(&self, twitch_id: &str, limit: u32, cursor: Option<&str>) -> Result<VideoPage>;
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

/// App access token shared by every request. Concurrent refreshes are
/// harmless, the last write wins.
#[derive(Debug, Default)]
pub struct CredentialCache {
    current: RwLock<Option<CachedToken>>,
}

impl CredentialCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached token if it is still valid for more than a minute
    /// after `now`.
    pub fn get(&self, now: DateTime<Utc>) -> Option<String> {
        self.current
            .read()
            .as_ref()
            .filter(|cached| cached.expires_at > now + TOKEN_REFRESH_MARGIN)
            .map(|cached| cached.token.clone())
    }

    pub fn set(&self, token: impl Into<String>, expires_at: DateTime<Utc>) {
        *self.current.write() = Some(CachedToken {
            token: token.into(),
            expires_at,
        });
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.current.read().as_ref().map(|cached| cached.expires_at)
    }
}

/// Base URLs for the two Twitch hosts. Overridable so tests can point the
/// client at a local stub.
#[derive(Debug, Clone)]
pub struct TwitchEndpoints {
    pub id_base: String,
    pub api_base: String,
}

impl Default for TwitchEndpoints {
    fn default() -> Self {
        Self {
            id_base: DEFAULT_ID_BASE.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
        }
    }
}

pub struct TwitchClient {
    agent: ureq::Agent,
    credentials: TwitchCredentials,
    endpoints: TwitchEndpoints,
    cache: Arc<CredentialCache>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Deserialize)]
struct UsersResponse {
    #[serde(default)]
    data: Vec<UserEntry>,
}

#[derive(Deserialize)]
struct UserEntry {
    id: String,
    login: String,
    display_name: String,
    #[serde(default)]
    profile_image_url: String,
}

#[derive(Deserialize)]
struct VideosResponse {
    #[serde(default)]
    data: Vec<VideoEntry>,
    #[serde(default)]
    pagination: Pagination,
}

#[derive(Deserialize)]
struct VideoEntry {
    id: String,
    title: String,
    published_at: DateTime<Utc>,
    url: String,
    #[serde(default)]
    thumbnail_url: String,
    #[serde(default)]
    duration: String,
}

#[derive(Deserialize, Default)]
struct Pagination {
    cursor: Option<String>,
}

impl TwitchClient {
    pub fn new(credentials: TwitchCredentials) -> Self {
        Self::with_endpoints(
            credentials,
            TwitchEndpoints::default(),
            Arc::new(CredentialCache::new()),
        )
    }

    pub fn with_endpoints(
        credentials: TwitchCredentials,
        endpoints: TwitchEndpoints,
        cache: Arc<CredentialCache>,
    ) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(HTTP_TIMEOUT).build();
        Self {
            agent,
            credentials,
            endpoints,
            cache,
        }
    }

    pub fn credential_cache(&self) -> Arc<CredentialCache> {
        self.cache.clone()
    }

    /// Returns a cached app access token or exchanges the client credentials
    /// for a fresh one.
    pub fn access_token(&self) -> Result<String> {
        let now = Utc::now();
        if let Some(token) = self.cache.get(now) {
            debug!("reusing cached Twitch app token");
            return Ok(token);
        }

        let (client_id, client_secret) = self.credentials.pair()?;
        debug!("requesting new Twitch app token");
        let response = self
            .agent
            .post(&format!("{}/oauth2/token", self.endpoints.id_base))
            .query("client_id", client_id)
            .query("client_secret", client_secret)
            .query("grant_type", "client_credentials")
            .call()
            .map_err(|err| upstream_error("Failed to get Twitch access token", err))?;
        let body: TokenResponse = response
            .into_json()
            .map_err(|err| Error::Upstream(format!("Failed to get Twitch access token: {err}")))?;

        let expires_at = now + TimeDelta::seconds(body.expires_in);
        self.cache.set(body.access_token.clone(), expires_at);
        Ok(body.access_token)
    }

    fn get(&self, path: &str) -> Result<ureq::Request> {
        let token = self.access_token()?;
        let client_id = self.credentials.client_id()?;
        Ok(self
            .agent
            .get(&format!("{}{path}", self.endpoints.api_base))
            .set("Client-Id", client_id)
            .set("Authorization", &format!("Bearer {token}")))
    }

    /// `GET /users` filtered by `login` or `id`; an empty result is `NotFound`.
    fn fetch_user(&self, key: &str, value: &str, missing: String) -> Result<ChannelProfile> {
        let response = self
            .get("/users")?
            .query(key, value)
            .call()
            .map_err(|err| upstream_error("Failed to get Twitch user", err))?;
        let body: UsersResponse = response
            .into_json()
            .map_err(|err| Error::Upstream(format!("Failed to get Twitch user: {err}")))?;

        let user = body
            .data
            .into_iter()
            .next()
            .ok_or(Error::NotFound(missing))?;
        Ok(ChannelProfile {
            twitch_id: user.id,
            login: user.login,
            display_name: user.display_name,
            avatar_url: user.profile_image_url,
        })
    }
}

impl VideoPlatform for TwitchClient {
    fn resolve_channel(&self, handle: &str) -> Result<ChannelProfile> {
        self.fetch_user("login", handle, format!("User \"{handle}\" not found"))
    }

    fn resolve_channel_by_id(&self, twitch_id: &str) -> Result<ChannelProfile> {
        self.fetch_user("id", twitch_id, format!("User with id {twitch_id} not found"))
    }

    fn list_videos(&self, twitch_id: &str, limit: u32, cursor: Option<&str>) -> Result<VideoPage> {
        let mut request = self
            .get("/videos")?
            .query("user_id", twitch_id)
            .query("first", &limit.to_string())
            .query("type", "archive");
        if let Some(cursor) = cursor {
            request = request.query("after", cursor);
        }
        debug!(twitch_id, limit, has_cursor = cursor.is_some(), "listing Twitch videos");

        let response = request
            .call()
            .map_err(|err| upstream_error("Failed to get Twitch videos", err))?;
        let body: VideosResponse = response
            .into_json()
            .map_err(|err| Error::Upstream(format!("Failed to get Twitch videos: {err}")))?;

        let videos = body
            .data
            .into_iter()
            .map(|video| FetchedVod {
                duration: parse_duration(&video.duration),
                thumbnail: fill_thumbnail_size(&video.thumbnail_url),
                vod_id: video.id,
                title: video.title,
                published_at: video.published_at,
                url: video.url,
            })
            .collect();

        Ok(VideoPage {
            videos,
            cursor: body.pagination.cursor.filter(|cursor| !cursor.is_empty()),
        })
    }
}

fn upstream_error(context: &str, err: ureq::Error) -> Error {
    match err {
        ureq::Error::Status(_, response) => {
            Error::Upstream(format!("{context}: {}", response.status_text()))
        }
        ureq::Error::Transport(transport) => Error::Upstream(format!("{context}: {transport}")),
    }
}

static HOURS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)h").expect("valid regex"));
static MINUTES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)m").expect("valid regex"));
static SECONDS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d+)s").expect("valid regex"));

/// Converts Twitch's compact `1h2m3s` notation to seconds. Missing parts
/// count as zero, so garbage yields 0 rather than an error. A total that
/// does not fit in `i64` is garbage too.
pub fn parse_duration(duration: &str) -> i64 {
    let component = |pattern: &Regex| {
        pattern
            .captures(duration)
            .and_then(|caps| caps[1].parse::<i64>().ok())
            .unwrap_or(0)
    };
    component(&HOURS)
        .checked_mul(3600)
        .zip(component(&MINUTES).checked_mul(60))
        .and_then(|(hours, minutes)| hours.checked_add(minutes))
        .and_then(|total| total.checked_add(component(&SECONDS)))
        .unwrap_or(0)
}

/// Twitch thumbnails carry `%{width}`/`%{height}` placeholders.
pub fn fill_thumbnail_size(url: &str) -> String {
    url.replacen("%{width}", THUMBNAIL_WIDTH, 1)
        .replacen("%{height}", THUMBNAIL_HEIGHT, 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        extract::{Query, State},
        http::{HeaderMap, StatusCode},
        response::{IntoResponse, Response},
        routing::{get, post},
    };
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn parse_duration_sums_components() {
        assert_eq!(parse_duration("1h2m3s"), 3723);
        assert_eq!(parse_duration("45s"), 45);
        assert_eq!(parse_duration("2m"), 120);
        assert_eq!(parse_duration("10h0m1s"), 36001);
    }

    #[test]
    fn parse_duration_unrecognized_is_zero() {
        assert_eq!(parse_duration(""), 0);
        assert_eq!(parse_duration("PT1H"), 0);
        assert_eq!(parse_duration("soon"), 0);
    }

    #[test]
    fn parse_duration_overflow_is_zero() {
        assert_eq!(parse_duration("3000000000000000h"), 0);
        assert_eq!(parse_duration("2562047788015215h30m7s"), i64::MAX);
        assert_eq!(parse_duration("2562047788015215h30m8s"), 0);
        assert_eq!(parse_duration("99999999999999999999h1s"), 1);
        assert_eq!(parse_duration("2562047788015215h"), 2562047788015215 * 3600);
    }

    #[test]
    fn thumbnail_placeholders_are_filled() {
        let url = "https://static-cdn.jtvnw.net/cf_vods/abc/thumb0-%{width}x%{height}.jpg";
        assert_eq!(
            fill_thumbnail_size(url),
            "https://static-cdn.jtvnw.net/cf_vods/abc/thumb0-640x360.jpg"
        );
        assert_eq!(fill_thumbnail_size(""), "");
    }

    #[test]
    fn credential_cache_honours_refresh_margin() {
        let cache = CredentialCache::new();
        let now = Utc::now();
        assert!(cache.get(now).is_none());

        cache.set("fresh", now + TimeDelta::seconds(61));
        assert_eq!(cache.get(now).as_deref(), Some("fresh"));

        cache.set("stale", now + TimeDelta::seconds(60));
        assert!(cache.get(now).is_none());
        assert_eq!(cache.expires_at(), Some(now + TimeDelta::seconds(60)));
    }

    #[derive(Clone, Default)]
    struct StubState {
        token_hits: Arc<AtomicUsize>,
        fail_token: bool,
        fail_users: bool,
    }

    async fn stub_token(State(state): State<StubState>) -> Response {
        state.token_hits.fetch_add(1, Ordering::SeqCst);
        if state.fail_token {
            return StatusCode::BAD_REQUEST.into_response();
        }
        Json(json!({
            "access_token": "stub-token",
            "expires_in": 3600,
            "token_type": "bearer"
        }))
        .into_response()
    }

    fn authorized(headers: &HeaderMap) -> bool {
        headers.get("authorization").and_then(|v| v.to_str().ok()) == Some("Bearer stub-token")
            && headers.get("client-id").and_then(|v| v.to_str().ok()) == Some("client")
    }

    async fn stub_users(
        State(state): State<StubState>,
        headers: HeaderMap,
        Query(params): Query<HashMap<String, String>>,
    ) -> Response {
        if state.fail_users {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        if !authorized(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        let streamer = json!([{
            "id": "1001",
            "login": "streamer",
            "display_name": "Streamer",
            "profile_image_url": "https://cdn/avatar.png"
        }]);
        let data = match (
            params.get("login").map(String::as_str),
            params.get("id").map(String::as_str),
        ) {
            (Some("streamer"), None) | (None, Some("1001")) => streamer,
            _ => json!([]),
        };
        Json(json!({ "data": data })).into_response()
    }

    async fn stub_videos(
        headers: HeaderMap,
        Query(params): Query<HashMap<String, String>>,
    ) -> Response {
        if !authorized(&headers) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        assert_eq!(params.get("type").map(String::as_str), Some("archive"));
        let after = params.get("after").cloned();
        let pagination = if after.is_some() {
            json!({})
        } else {
            json!({ "cursor": "next-page" })
        };
        Json(json!({
            "data": [{
                "id": format!("v-{}", params.get("first").cloned().unwrap_or_default()),
                "title": "Speedrun | Any%",
                "published_at": "2024-03-05T18:30:00Z",
                "url": "https://www.twitch.tv/videos/1",
                "thumbnail_url": "https://cdn/thumb-%{width}x%{height}.jpg",
                "duration": "1h2m3s"
            }],
            "pagination": pagination
        }))
        .into_response()
    }

    async fn spawn_stub(state: StubState) -> TwitchEndpoints {
        let app = Router::new()
            .route("/oauth2/token", post(stub_token))
            .route("/helix/users", get(stub_users))
            .route("/helix/videos", get(stub_videos))
            .with_state(state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        TwitchEndpoints {
            id_base: format!("http://{addr}"),
            api_base: format!("http://{addr}/helix"),
        }
    }

    fn credentials() -> TwitchCredentials {
        TwitchCredentials {
            client_id: Some("client".into()),
            client_secret: Some("secret".into()),
        }
    }

    async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
        tokio::task::spawn_blocking(f).await.unwrap()
    }

    #[tokio::test]
    async fn resolve_channel_reuses_cached_token() {
        let state = StubState::default();
        let hits = state.token_hits.clone();
        let endpoints = spawn_stub(state).await;
        let client = Arc::new(TwitchClient::with_endpoints(
            credentials(),
            endpoints,
            Arc::new(CredentialCache::new()),
        ));

        let first = {
            let client = client.clone();
            blocking(move || client.resolve_channel("streamer")).await.unwrap()
        };
        assert_eq!(first.twitch_id, "1001");
        assert_eq!(first.login, "streamer");
        assert_eq!(first.display_name, "Streamer");
        assert_eq!(first.avatar_url, "https://cdn/avatar.png");

        let missing = {
            let client = client.clone();
            blocking(move || client.resolve_channel("nobody")).await
        };
        assert!(matches!(missing, Err(Error::NotFound(ref msg)) if msg == "User \"nobody\" not found"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expiring_token_is_replaced() {
        let state = StubState::default();
        let hits = state.token_hits.clone();
        let endpoints = spawn_stub(state).await;
        let cache = Arc::new(CredentialCache::new());
        cache.set("old-token", Utc::now() + TimeDelta::seconds(30));
        let client = TwitchClient::with_endpoints(credentials(), endpoints, cache.clone());

        let token = blocking(move || client.access_token()).await.unwrap();
        assert_eq!(token, "stub-token");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(cache.expires_at().unwrap() > Utc::now() + TimeDelta::seconds(3000));
    }

    #[tokio::test]
    async fn missing_credentials_is_configuration_error() {
        let state = StubState::default();
        let hits = state.token_hits.clone();
        let endpoints = spawn_stub(state).await;
        let client = TwitchClient::with_endpoints(
            TwitchCredentials {
                client_id: Some("client".into()),
                client_secret: None,
            },
            endpoints,
            Arc::new(CredentialCache::new()),
        );

        let err = blocking(move || client.resolve_channel("streamer"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn non_success_status_is_upstream_error() {
        let endpoints = spawn_stub(StubState {
            fail_users: true,
            ..StubState::default()
        })
        .await;
        let client = TwitchClient::with_endpoints(
            credentials(),
            endpoints,
            Arc::new(CredentialCache::new()),
        );

        let err = blocking(move || client.resolve_channel("streamer"))
            .await
            .unwrap_err();
        match err {
            Error::Upstream(message) => {
                assert_eq!(message, "Failed to get Twitch user: Internal Server Error")
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn resolve_channel_by_id_uses_id_filter() {
        let endpoints = spawn_stub(StubState::default()).await;
        let client = Arc::new(TwitchClient::with_endpoints(
            credentials(),
            endpoints,
            Arc::new(CredentialCache::new()),
        ));

        let found = {
            let client = client.clone();
            blocking(move || client.resolve_channel_by_id("1001")).await.unwrap()
        };
        assert_eq!(found.login, "streamer");

        let missing = blocking(move || client.resolve_channel_by_id("42")).await;
        assert!(matches!(missing, Err(Error::NotFound(ref msg)) if msg == "User with id 42 not found"));
    }

    #[tokio::test]
    async fn token_failure_is_upstream_error_and_not_cached() {
        let state = StubState {
            fail_token: true,
            ..StubState::default()
        };
        let hits = state.token_hits.clone();
        let endpoints = spawn_stub(state).await;
        let cache = Arc::new(CredentialCache::new());
        let client = TwitchClient::with_endpoints(credentials(), endpoints, cache.clone());

        let err = blocking(move || client.resolve_channel("streamer"))
            .await
            .unwrap_err();
        match err {
            Error::Upstream(message) => {
                assert_eq!(message, "Failed to get Twitch access token: Bad Request")
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(cache.get(Utc::now()).is_none());
        assert!(cache.expires_at().is_none());
    }

    #[tokio::test]
    async fn list_videos_normalizes_entries_and_cursor() {
        let endpoints = spawn_stub(StubState::default()).await;
        let client = Arc::new(TwitchClient::with_endpoints(
            credentials(),
            endpoints,
            Arc::new(CredentialCache::new()),
        ));

        let page = {
            let client = client.clone();
            blocking(move || client.list_videos("1001", 5, None)).await.unwrap()
        };
        assert_eq!(page.cursor.as_deref(), Some("next-page"));
        assert_eq!(page.videos.len(), 1);
        let vod = &page.videos[0];
        assert_eq!(vod.vod_id, "v-5");
        assert_eq!(vod.title, "Speedrun | Any%");
        assert_eq!(vod.duration, 3723);
        assert_eq!(vod.thumbnail, "https://cdn/thumb-640x360.jpg");
        assert_eq!(vod.published_at.to_rfc3339(), "2024-03-05T18:30:00+00:00");

        let last = blocking(move || client.list_videos("1001", 5, Some("next-page")))
            .await
            .unwrap();
        assert!(last.cursor.is_none());
    }
}

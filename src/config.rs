#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fmt, fs,
    path::{Path, PathBuf},
};

use crate::error::Error;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DATABASE_PATH: &str = "data/vod-commander.db";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";

const DATABASE_KEY: &str = "VOD_COMMANDER_DB";
const HOST_KEY: &str = "VOD_COMMANDER_HOST";
const PORT_KEY: &str = "VOD_COMMANDER_PORT";
const CLIENT_ID_KEY: &str = "TWITCH_CLIENT_ID";
const CLIENT_SECRET_KEY: &str = "TWITCH_CLIENT_SECRET";

/// Twitch application credentials. Either half may be missing; that only
/// becomes an error once a token is actually needed.
#[derive(Clone, Default)]
pub struct TwitchCredentials {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl TwitchCredentials {
    pub fn client_id(&self) -> Result<&str, Error> {
        self.client_id
            .as_deref()
            .ok_or_else(|| Error::Configuration(format!("{CLIENT_ID_KEY} must be set")))
    }

    pub fn pair(&self) -> Result<(&str, &str), Error> {
        match (self.client_id.as_deref(), self.client_secret.as_deref()) {
            (Some(id), Some(secret)) => Ok((id, secret)),
            _ => Err(Error::Configuration(format!(
                "{CLIENT_ID_KEY} and {CLIENT_SECRET_KEY} must be set"
            ))),
        }
    }
}

impl fmt::Debug for TwitchCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TwitchCredentials")
            .field("client_id", &self.client_id)
            .field(
                "client_secret",
                &self.client_secret.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub database_path: PathBuf,
    pub host: String,
    pub port: u16,
    pub twitch: TwitchCredentials,
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub database_path: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub env_path: Option<PathBuf>,
}

pub fn load_runtime_config() -> Result<RuntimeConfig> {
    resolve_runtime_config(RuntimeOverrides::default())
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    Ok(build_runtime_config(&file_vars, env_var_string, overrides))
}

/// Precedence per key: explicit override, process env, `.env` file, default.
fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> RuntimeConfig {
    let database_path = overrides
        .database_path
        .or_else(|| lookup_value(DATABASE_KEY, file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH));
    let port = overrides
        .port
        .or_else(|| {
            lookup_value(PORT_KEY, file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup_value(HOST_KEY, file_vars, &env_lookup))
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let twitch = TwitchCredentials {
        client_id: lookup_value(CLIENT_ID_KEY, file_vars, &env_lookup),
        client_secret: lookup_value(CLIENT_SECRET_KEY, file_vars, &env_lookup),
    };

    RuntimeConfig {
        database_path,
        host,
        port,
        twitch,
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key)
        .or_else(|| file_vars.get(key).cloned())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}

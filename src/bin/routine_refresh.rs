#![forbid(unsafe_code)]

//! Background job that refreshes every tracked channel of every user. Runs
//! once with `--once`, otherwise repeats on a fixed interval like a cron job.

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use tokio::{signal, time};
use tracing::{info, warn};
use vod_commander::{
    catalog::Catalog,
    config::{RuntimeOverrides, resolve_runtime_config},
    logging::init_logging,
    metadata::{ChannelRecord, MetadataStore},
    twitch::TwitchClient,
};

const DEFAULT_INTERVAL_SECS: u64 = 3600;

#[derive(Debug, Parser)]
#[command(name = "routine_refresh", about = "Refresh every tracked channel")]
struct RoutineArgs {
    /// SQLite database file (VOD_COMMANDER_DB).
    #[arg(long)]
    db: Option<PathBuf>,
    /// Alternative .env file.
    #[arg(long)]
    env_file: Option<PathBuf>,
    /// Seconds between passes.
    #[arg(long, default_value_t = DEFAULT_INTERVAL_SECS, value_parser = clap::value_parser!(u64).range(1..))]
    interval_secs: u64,
    /// Run a single pass and exit.
    #[arg(long)]
    once: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct PassSummary {
    refreshed: usize,
    failed: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let args = RoutineArgs::parse();
    let config = resolve_runtime_config(RuntimeOverrides {
        database_path: args.db.clone(),
        env_path: args.env_file.clone(),
        ..RuntimeOverrides::default()
    })?;

    let store = MetadataStore::open(&config.database_path)
        .await
        .context("initializing database")?;
    let catalog = Catalog::new(store, Arc::new(TwitchClient::new(config.twitch.clone())));
    info!(database = %config.database_path.display(), "routine refresh started");

    if args.once {
        refresh_all(&catalog).await?;
        return Ok(());
    }

    let mut ticker = time::interval(Duration::from_secs(args.interval_secs));
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = refresh_all(&catalog).await {
                    warn!("refresh pass aborted: {err:#}");
                }
            }
            _ = signal::ctrl_c() => {
                info!("shutting down");
                return Ok(());
            }
        }
    }
}

/// One pass over all channels. A failing channel is logged and skipped; only
/// a failure to list channels aborts the pass.
async fn refresh_all(catalog: &Catalog) -> Result<PassSummary> {
    let channels = catalog
        .store()
        .list_all_channels()
        .await
        .context("listing channels")?;
    let mut summary = PassSummary::default();
    if channels.is_empty() {
        info!("no channels to refresh");
        return Ok(summary);
    }

    let total = channels.len();
    for (index, channel) in channels.iter().enumerate() {
        info!(
            "[{}/{}] Updating channel: {}",
            index + 1,
            total,
            channel.login
        );
        match refresh_channel(catalog, channel).await {
            Ok(fetched) => {
                summary.refreshed += 1;
                info!(channel_id = channel.id, fetched, "channel up to date");
            }
            Err(err) => {
                summary.failed += 1;
                warn!(channel_id = channel.id, login = %channel.login, "refresh failed: {err:#}");
            }
        }
    }

    info!(
        refreshed = summary.refreshed,
        failed = summary.failed,
        "refresh pass finished"
    );
    Ok(summary)
}

/// Profile lookup failures are only logged; the VODs still get refreshed.
async fn refresh_channel(catalog: &Catalog, channel: &ChannelRecord) -> Result<usize> {
    let settings = catalog.get_settings(&channel.user_id).await?;
    if let Err(err) = catalog.refresh_profile(channel).await {
        warn!(channel_id = channel.id, login = %channel.login, "profile refresh failed: {err:#}");
    }
    let page = catalog
        .refresh(
            &channel.user_id,
            channel.id,
            settings.vods_per_load,
            Some(&settings.render()),
        )
        .await?;
    Ok(page.vods.len())
}

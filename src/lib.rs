#![forbid(unsafe_code)]

//! Tracks Twitch channels per user and turns their VODs into ready-to-paste
//! TwitchDownloaderCLI commands.

pub mod catalog;
pub mod commands;
pub mod config;
pub mod error;
pub mod logging;
pub mod metadata;
pub mod sanitize;
pub mod twitch;

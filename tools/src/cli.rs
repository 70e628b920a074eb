//! Positional argument parsing and environment overrides.

use std::{env, path::PathBuf};

use anyhow::{bail, Context, Result};
use orderfetch_core::{
    config::{ServerConfig, DEFAULT_OUTPUT_DIR, DEFAULT_SERVER_CONFIG_PATH},
    dates::DEFAULT_MAX_DAYS,
    types::Credentials,
};

pub const FETCH_USAGE: &str =
    "usage: order-fetcher <user> <password> <server_type> <location> <start_date> [account_ids...]";

pub const LIST_USAGE: &str = "usage: account-lister <user> <password> <server_type> <location>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionArgs {
    pub user: String,
    pub password: String,
    pub server_type: String,
    pub location: String,
}

impl SessionArgs {
    pub fn credentials(&self, server: &ServerConfig) -> Credentials {
        Credentials {
            user: self.user.clone(),
            password: self.password.clone(),
            connect_point: server.ts_connect_point.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchArgs {
    pub session: SessionArgs,
    pub start_date: String,
    pub accounts: Vec<String>,
}

/// `args` excludes the program name.
pub fn parse_session_args(args: &[String]) -> Result<SessionArgs> {
    match args {
        [user, password, server_type, location, ..] => Ok(SessionArgs {
            user: user.clone(),
            password: password.clone(),
            server_type: server_type.clone(),
            location: location.clone(),
        }),
        _ => bail!("{LIST_USAGE}"),
    }
}

/// `args` excludes the program name.
pub fn parse_fetch_args(args: &[String]) -> Result<FetchArgs> {
    if args.len() < 5 {
        bail!("{FETCH_USAGE}");
    }
    Ok(FetchArgs {
        session: parse_session_args(&args[..4])?,
        start_date: args[4].clone(),
        accounts: args[5..].to_vec(),
    })
}

pub fn server_config_path() -> PathBuf {
    env::var_os("ORDERFETCH_SERVER_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SERVER_CONFIG_PATH))
}

pub fn output_dir() -> PathBuf {
    env::var_os("ORDERFETCH_OUTPUT_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_DIR))
}

pub fn max_days() -> Result<usize> {
    match env::var("ORDERFETCH_MAX_DAYS") {
        Ok(raw) => parse_max_days(&raw),
        Err(_) => Ok(DEFAULT_MAX_DAYS),
    }
}

fn parse_max_days(raw: &str) -> Result<usize> {
    let days: usize = raw
        .trim()
        .parse()
        .with_context(|| format!("ORDERFETCH_MAX_DAYS must be a positive integer, got {raw:?}"))?;
    if days == 0 {
        bail!("ORDERFETCH_MAX_DAYS must be at least 1");
    }
    Ok(days)
}

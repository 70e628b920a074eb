//! Server directory and run options.
//!
//! `server_configurations.json` maps a server type and a location to the
//! addresses the trading engine is constructed with:
//!
//! ```json
//! { "<server_type>": { "server_configs": { "<location>": { "TS_CNNCT_PT": "...", ... } } } }
//! ```

use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    dates::{parse_date, DEFAULT_MAX_DAYS},
    error::{FetchError, FetchResult},
};

pub const DEFAULT_SERVER_CONFIG_PATH: &str = "server_configurations.json";
pub const DEFAULT_OUTPUT_DIR: &str = "orders";

/// Simulated account ids are five digits wide.
pub const MAX_SIM_ACCOUNTS: usize = 100_000;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// The vendor engine.
    #[default]
    Rapi,
    /// In-process engine backed by generated data.
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(rename = "MML_DMN_SRVR_ADDR", default)]
    pub dmn_srvr_addr: String,
    #[serde(rename = "MML_DOMAIN_NAME", default)]
    pub domain_name: String,
    #[serde(rename = "MML_LIC_SRVR_ADDR", default)]
    pub lic_srvr_addr: String,
    #[serde(rename = "MML_LOC_BROK_ADDR", default)]
    pub loc_brok_addr: String,
    #[serde(rename = "MML_LOGGER_ADDR", default)]
    pub logger_addr: String,
    #[serde(rename = "MML_LOG_TYPE", default = "default_log_type")]
    pub log_type: String,
    #[serde(rename = "MML_SSL_CLNT_AUTH_FILE", default = "default_ssl_auth_file")]
    pub ssl_clnt_auth_file: String,
    #[serde(rename = "USER", default)]
    pub user: String,
    #[serde(rename = "TS_CNNCT_PT", default)]
    pub ts_connect_point: String,
    #[serde(rename = "ENGINE", default)]
    pub engine: EngineKind,
    #[serde(rename = "SIMULATION", default)]
    pub simulation: Option<SimSettings>,
}

fn default_log_type() -> String {
    "log_net".into()
}

fn default_ssl_auth_file() -> String {
    "rithmic_ssl_cert_auth_params".into()
}

impl ServerConfig {
    /// The `KEY=value` environment block the vendor engine reads.
    pub fn engine_environment(&self) -> Vec<String> {
        vec![
            format!("MML_DMN_SRVR_ADDR={}", self.dmn_srvr_addr),
            format!("MML_DOMAIN_NAME={}", self.domain_name),
            format!("MML_LIC_SRVR_ADDR={}", self.lic_srvr_addr),
            format!("MML_LOC_BROK_ADDR={}", self.loc_brok_addr),
            format!("MML_LOGGER_ADDR={}", self.logger_addr),
            format!("MML_LOG_TYPE={}", self.log_type),
            format!("MML_SSL_CLNT_AUTH_FILE={}", self.ssl_clnt_auth_file),
            format!("USER={}", self.user),
        ]
    }
}

/// Knobs for the simulated engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SimSettings {
    pub seed: u64,
    pub accounts: usize,
    pub history_days: usize,
    pub orders_per_day: usize,
    /// Delay before each completion is delivered.
    pub latency_ms: u64,
}

impl SimSettings {
    pub fn validate(&self) -> FetchResult<()> {
        if self.accounts > MAX_SIM_ACCOUNTS {
            return Err(FetchError::Config(format!(
                "SIMULATION.accounts is {}; at most {MAX_SIM_ACCOUNTS} accounts can be simulated",
                self.accounts
            )));
        }
        Ok(())
    }
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            seed: 42,
            accounts: 3,
            history_days: 20,
            orders_per_day: 6,
            latency_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ServerTypeEntry {
    server_configs: HashMap<String, ServerConfig>,
}

/// Every server type and location known to this installation.
#[derive(Debug, Clone)]
pub struct ServerDirectory {
    server_types: HashMap<String, ServerTypeEntry>,
}

impl ServerDirectory {
    pub fn load(path: &Path) -> FetchResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FetchError::Config(format!("Failed to open {}: {e}", path.display()))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> FetchResult<Self> {
        let server_types: HashMap<String, ServerTypeEntry> = serde_json::from_str(content)
            .map_err(|e| FetchError::Config(format!("Malformed server configuration: {e}")))?;
        Ok(Self { server_types })
    }

    pub fn lookup(&self, server_type: &str, location: &str) -> FetchResult<ServerConfig> {
        let entry = self.server_types.get(server_type).ok_or_else(|| {
            FetchError::Config(format!("Server type {server_type} not found in configurations"))
        })?;
        let config = entry.server_configs.get(location).ok_or_else(|| {
            FetchError::Config(format!(
                "Location {location} not found for server type {server_type}"
            ))
        })?;
        if config.ts_connect_point.trim().is_empty() {
            return Err(FetchError::Config(
                "Missing trading system connection point in configuration".into(),
            ));
        }
        if let Some(settings) = &config.simulation {
            settings.validate()?;
        }
        Ok(config.clone())
    }
}

/// What to fetch and where to put it.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchOptions {
    /// Earliest history date replayed, `YYYYMMDD`.
    pub start_date: String,
    pub max_days: usize,
    /// Empty means every account the gateway lists.
    pub requested_accounts: BTreeSet<String>,
    pub output_dir: PathBuf,
}

impl FetchOptions {
    pub fn new(start_date: &str) -> FetchResult<Self> {
        parse_date(start_date).map_err(|_| {
            FetchError::Config(format!(
                "Invalid date format {start_date:?}. Please use YYYYMMDD format."
            ))
        })?;
        Ok(Self {
            start_date: start_date.to_string(),
            max_days: DEFAULT_MAX_DAYS,
            requested_accounts: BTreeSet::new(),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
        })
    }

    pub fn with_accounts<I, S>(mut self, accounts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requested_accounts = accounts.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_days(mut self, max_days: usize) -> Self {
        self.max_days = max_days;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    /// Whether `account_id` passes the explicit account filter.
    pub fn wants(&self, account_id: &str) -> bool {
        self.requested_accounts.is_empty() || self.requested_accounts.contains(account_id)
    }
}

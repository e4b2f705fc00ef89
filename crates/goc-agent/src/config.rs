// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::Url;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const SERVICE_NAME_ENV: &str = "GOC_SERVICE_NAME";
const CENTER_ENV: &str = "GOC_CENTER";
const MODE_ENV: &str = "GOC_MODE";
const AGENT_PORT_ENV: &str = "GOC_AGENT_PORT";
const SINGLETON_ENV: &str = "GOC_SINGLETON";
const HEARTBEAT_INTERVAL_ENV: &str = "GOC_HEARTBEAT_INTERVAL_SECS";

/// Suffix appended to the binary path to name the listen-address sidecar file.
pub const LISTEN_ADDR_FILE_SUFFIX: &str = "_profile_listen_addr";

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid coverage mode: {0}")]
    InvalidMode(String),

    #[error("Invalid center url {url}: {reason}")]
    InvalidCenter { url: String, reason: String },

    #[error("A center url is required unless the agent runs in singleton mode")]
    MissingCenter,

    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// Counting discipline the binary was instrumented with. Echoed verbatim in
/// the `mode:` header of every profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoverMode {
    Set,
    #[default]
    Count,
    Atomic,
}

impl CoverMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoverMode::Set => "set",
            CoverMode::Count => "count",
            CoverMode::Atomic => "atomic",
        }
    }
}

impl fmt::Display for CoverMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CoverMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "set" => Ok(CoverMode::Set),
            "count" => Ok(CoverMode::Count),
            "atomic" => Ok(CoverMode::Atomic),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Base url of the goc center, e.g. `http://127.0.0.1:7777`.
    pub center: Option<String>,
    pub mode: CoverMode,
    /// Fixed listen address. When set the agent binds exactly there.
    pub agent_port: Option<String>,
    /// No center exists: registration, heartbeat and deregistration are skipped.
    pub singleton: bool,
    pub service_name: String,
    pub listen_addr_file: PathBuf,
    pub heartbeat_interval: Duration,
    /// Upper bound on the graceful HTTP shutdown before the listener is forced closed.
    pub shutdown_timeout: Duration,
    /// Timeout applied to each call made to the center.
    pub request_timeout: Duration,
}

impl Config {
    /// Configuration as the code generator bakes it into an instrumented binary.
    pub fn new(center: Option<String>, mode: CoverMode) -> Self {
        Config {
            center,
            mode,
            agent_port: None,
            singleton: false,
            service_name: service_name_from_env(),
            listen_addr_file: default_listen_addr_file(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn from_env() -> Result<Config, ConfigError> {
        let mode = match env::var(MODE_ENV) {
            Ok(mode) => mode.parse()?,
            Err(_) => CoverMode::default(),
        };
        let mut config = Config::new(env::var(CENTER_ENV).ok(), mode);

        config.agent_port = env::var(AGENT_PORT_ENV)
            .ok()
            .filter(|port| !port.trim().is_empty());

        if let Ok(singleton) = env::var(SINGLETON_ENV) {
            config.singleton = parse_bool(SINGLETON_ENV, &singleton)?;
        }

        if let Ok(secs) = env::var(HEARTBEAT_INTERVAL_ENV) {
            let secs = secs
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or(ConfigError::InvalidValue {
                    name: HEARTBEAT_INTERVAL_ENV,
                    value: secs,
                })?;
            config.heartbeat_interval = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Checks the heartbeat interval and that a non-singleton agent has a
    /// usable center url.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: "heartbeat_interval",
                value: format!("{:?}", self.heartbeat_interval),
            });
        }
        if self.singleton {
            return Ok(());
        }
        match self.center.as_deref() {
            None | Some("") => Err(ConfigError::MissingCenter),
            Some(center) => parse_center(center).map(|_| ()),
        }
    }

    /// Parsed center url, if one is configured and valid.
    pub fn center_url(&self) -> Option<Url> {
        self.center
            .as_deref()
            .and_then(|center| parse_center(center).ok())
    }
}

fn parse_center(center: &str) -> Result<Url, ConfigError> {
    let url = Url::parse(center).map_err(|e| ConfigError::InvalidCenter {
        url: center.to_string(),
        reason: e.to_string(),
    })?;
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidCenter {
            url: center.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(url)
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name,
            value: value.to_string(),
        }),
    }
}

/// Path the binary was invoked as, falling back to the resolved executable.
fn binary_path() -> PathBuf {
    env::args_os()
        .next()
        .map(PathBuf::from)
        .or_else(|| env::current_exe().ok())
        .unwrap_or_else(|| PathBuf::from("goc-agent"))
}

/// `<binary-path>_profile_listen_addr`
pub fn listen_addr_file_for(binary: &Path) -> PathBuf {
    let mut name = binary.as_os_str().to_owned();
    name.push(LISTEN_ADDR_FILE_SUFFIX);
    PathBuf::from(name)
}

fn default_listen_addr_file() -> PathBuf {
    listen_addr_file_for(&binary_path())
}

/// `GOC_SERVICE_NAME` when set, otherwise the binary's file name.
pub fn service_name_from_env() -> String {
    if let Ok(name) = env::var(SERVICE_NAME_ENV) {
        return name;
    }
    binary_path()
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unknown".to_string())
}

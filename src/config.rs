use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::auth::{Credentials, RetryPolicy};
use crate::download::DownloadOptions;
use crate::error::EodmsError;
use crate::order::MAX_ORDER_SIZE;
use crate::query::DEFAULT_METADATA_WORKERS;
use crate::transport::urljoin;

pub const EODMS_REST_BASE: &str = "https://www.eodms-sgdot.nrcan-rncan.gc.ca/wes/rapi";
pub const EODMS_NETRC_HOST: &str = "data.eodms-sgdot.nrcan-rncan.gc.ca";
pub const DEFAULT_CONFIG_FILE: &str = "eodms.json";
pub const DEFAULT_PAGE_SIZE: usize = 150;

/// On-disk form of `eodms.json`. Every field is optional.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub max_order_size: Option<usize>,
    /// Zero turns the per-record metadata fetch off.
    #[serde(default)]
    pub metadata_workers: Option<usize>,
    #[serde(default)]
    pub request_attempts: Option<usize>,
    #[serde(default)]
    pub retry_base_delay_ms: Option<u64>,
    #[serde(default)]
    pub poll_interval_secs: Option<u64>,
    #[serde(default)]
    pub wait_budget_secs: Option<u64>,
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub transfer_attempts: Option<usize>,
    #[serde(default)]
    pub overwrite: Option<bool>,
    #[serde(default)]
    pub netrc_host: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub page_size: usize,
    pub max_order_size: usize,
    pub metadata_workers: usize,
    pub retry: RetryPolicy,
    pub download: DownloadOptions,
    pub netrc_host: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: EODMS_REST_BASE.to_string(),
            timeout: Duration::from_secs(60),
            page_size: DEFAULT_PAGE_SIZE,
            max_order_size: MAX_ORDER_SIZE,
            metadata_workers: DEFAULT_METADATA_WORKERS,
            retry: RetryPolicy::default(),
            download: DownloadOptions::default(),
            netrc_host: EODMS_NETRC_HOST.to_string(),
        }
    }
}

impl ClientConfig {
    pub fn order_url(&self) -> String {
        urljoin(&self.base_url, "order")
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `path`, or `eodms.json` in the working directory when no path is
    /// given. A missing default file yields the built-in defaults; a missing
    /// explicit file is an error.
    pub fn resolve(path: Option<&str>) -> Result<ClientConfig, EodmsError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Ok(ClientConfig::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| EodmsError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| EodmsError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ClientConfig, EodmsError> {
        let defaults = ClientConfig::default();

        let page_size = positive("page_size", config.page_size, defaults.page_size)?;
        let max_order_size = positive(
            "max_order_size",
            config.max_order_size,
            defaults.max_order_size,
        )?;
        if max_order_size > MAX_ORDER_SIZE {
            return Err(EodmsError::ConfigParse(format!(
                "max_order_size {max_order_size} exceeds the EODMS limit of {MAX_ORDER_SIZE}"
            )));
        }
        let timeout = config
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.timeout);
        if timeout.is_zero() {
            return Err(EodmsError::ConfigParse("timeout_secs must be > 0".to_string()));
        }

        let retry = RetryPolicy {
            max_attempts: positive(
                "request_attempts",
                config.request_attempts,
                defaults.retry.max_attempts,
            )?,
            base_delay: config
                .retry_base_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.base_delay),
            max_delay: defaults.retry.max_delay,
        };

        let download = DownloadOptions {
            max_workers: positive(
                "max_workers",
                config.max_workers,
                defaults.download.max_workers,
            )?,
            poll_interval: config
                .poll_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.download.poll_interval),
            wait_budget: config
                .wait_budget_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.download.wait_budget),
            transfer_attempts: positive(
                "transfer_attempts",
                config.transfer_attempts,
                defaults.download.transfer_attempts,
            )?,
            transfer_backoff: defaults.download.transfer_backoff,
            overwrite: config.overwrite.unwrap_or(defaults.download.overwrite),
        };

        Ok(ClientConfig {
            base_url: config
                .base_url
                .map(|url| url.trim_end_matches('/').to_string())
                .filter(|url| !url.is_empty())
                .unwrap_or(defaults.base_url),
            timeout,
            page_size,
            max_order_size,
            metadata_workers: config
                .metadata_workers
                .unwrap_or(defaults.metadata_workers),
            retry,
            download,
            netrc_host: config.netrc_host.unwrap_or(defaults.netrc_host),
        })
    }
}

fn positive(name: &str, value: Option<usize>, default: usize) -> Result<usize, EodmsError> {
    match value {
        Some(0) => Err(EodmsError::ConfigParse(format!("{name} must be > 0"))),
        Some(value) => Ok(value),
        None => Ok(default),
    }
}

/// What could be found without asking the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialLookup {
    Complete(Credentials),
    /// Either half may be missing; the caller prompts for the rest.
    Partial {
        username: Option<String>,
        password: Option<String>,
    },
}

/// Explicit values, then `EODMS_USERNAME`/`EODMS_PASSWORD`, then netrc.
pub fn resolve_credentials(
    username: Option<&str>,
    password: Option<&str>,
    netrc_host: &str,
) -> CredentialLookup {
    resolve_credentials_from(
        username,
        password,
        &|name| std::env::var(name).ok(),
        &default_netrc_paths(),
        netrc_host,
    )
}

pub fn resolve_credentials_from(
    username: Option<&str>,
    password: Option<&str>,
    env: &dyn Fn(&str) -> Option<String>,
    netrc_paths: &[PathBuf],
    netrc_host: &str,
) -> CredentialLookup {
    match (username, password) {
        (Some(user), Some(pass)) => return CredentialLookup::Complete(Credentials::new(user, pass)),
        (None, None) => {}
        (user, pass) => {
            return CredentialLookup::Partial {
                username: user.map(str::to_string),
                password: pass.map(str::to_string),
            };
        }
    }

    let env_user = env("EODMS_USERNAME").filter(|v| !v.is_empty());
    let env_pass = env("EODMS_PASSWORD").filter(|v| !v.is_empty());
    if let (Some(user), Some(pass)) = (&env_user, &env_pass) {
        return CredentialLookup::Complete(Credentials::new(user.clone(), pass.clone()));
    }

    for path in netrc_paths {
        if let Some(credentials) = read_netrc(path, netrc_host) {
            return CredentialLookup::Complete(credentials);
        }
    }

    CredentialLookup::Partial {
        username: env_user,
        password: None,
    }
}

fn read_netrc(path: &Path, host: &str) -> Option<Credentials> {
    let text = fs::read_to_string(path).ok()?;
    parse_netrc(&text, host)
}

/// `NETRC` if set, else `~/.netrc`, else `~/_netrc`.
pub fn default_netrc_paths() -> Vec<PathBuf> {
    if let Some(path) = std::env::var_os("NETRC") {
        return vec![PathBuf::from(path)];
    }
    BaseDirs::new()
        .map(|dirs| {
            let home = dirs.home_dir();
            vec![home.join(".netrc"), home.join("_netrc")]
        })
        .unwrap_or_default()
}

/// Login and password for `host`, falling back to a `default` entry.
pub fn parse_netrc(text: &str, host: &str) -> Option<Credentials> {
    struct Entry {
        machine: Option<String>,
        login: Option<String>,
        password: Option<String>,
    }

    let mut entries: Vec<Entry> = Vec::new();
    let mut tokens = text.split_whitespace();
    while let Some(token) = tokens.next() {
        match token {
            "machine" | "default" => entries.push(Entry {
                machine: if token == "machine" {
                    tokens.next().map(str::to_string)
                } else {
                    None
                },
                login: None,
                password: None,
            }),
            "login" | "password" | "account" => {
                let value = tokens.next().map(str::to_string);
                if let Some(entry) = entries.last_mut() {
                    match token {
                        "login" => entry.login = value,
                        "password" => entry.password = value,
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    let credentials = |entry: &Entry| match (&entry.login, &entry.password) {
        (Some(login), Some(password)) => Some(Credentials::new(login.clone(), password.clone())),
        _ => None,
    };
    entries
        .iter()
        .filter(|entry| entry.machine.as_deref() == Some(host))
        .find_map(credentials)
        .or_else(|| {
            entries
                .iter()
                .filter(|entry| entry.machine.is_none())
                .find_map(credentials)
        })
}

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_ENV_PREFIX: &str = "THREAD_GRAFT";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Config {
    #[serde(default)]
    pub reddit: RedditConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub display: DisplayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RedditConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for RedditConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            base_url: None,
            access_token: None,
            timeout: default_timeout(),
        }
    }
}

fn default_user_agent() -> String {
    format!("thread-graft/{}", crate::VERSION)
}

fn default_timeout() -> Duration {
    Duration::from_secs(20)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    #[serde(default)]
    pub expand_rounds: usize,
    #[serde(default = "default_wait_timeout", with = "humantime_serde")]
    pub wait_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            expand_rounds: 0,
            wait_timeout: default_wait_timeout(),
        }
    }
}

fn default_wait_timeout() -> Duration {
    Duration::from_secs(30)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DisplayConfig {
    #[serde(default = "default_width")]
    pub width: usize,
    #[serde(default = "default_indent")]
    pub indent: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            indent: default_indent(),
        }
    }
}

fn default_width() -> usize {
    100
}

fn default_indent() -> usize {
    2
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub config_file: Option<PathBuf>,
    pub env_prefix: Option<String>,
}

pub fn load(options: LoadOptions) -> Result<Config> {
    let mut cfg = Config::default();

    if let Some(path) = options.config_file.as_ref() {
        if path.exists() {
            let from_file = read_config_file(path)?;
            cfg = merge_config(cfg, from_file);
        }
    } else if let Some(default_path) = default_path() {
        if default_path.exists() {
            let from_file = read_config_file(&default_path)?;
            cfg = merge_config(cfg, from_file);
        }
    }

    let prefix = options.env_prefix.as_deref().unwrap_or(DEFAULT_ENV_PREFIX);
    cfg = apply_env(cfg, prefix);

    Ok(cfg)
}

fn read_config_file(path: &Path) -> Result<Config> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&data)
        .with_context(|| format!("Failed to parse config file at {}", path.display()))?;
    Ok(config)
}

fn merge_config(mut base: Config, other: Config) -> Config {
    if !other.reddit.user_agent.trim().is_empty() {
        base.reddit.user_agent = other.reddit.user_agent;
    }
    if other.reddit.base_url.is_some() {
        base.reddit.base_url = other.reddit.base_url;
    }
    if other.reddit.access_token.is_some() {
        base.reddit.access_token = other.reddit.access_token;
    }
    if !other.reddit.timeout.is_zero() {
        base.reddit.timeout = other.reddit.timeout;
    }

    base.session.expand_rounds = other.session.expand_rounds;
    if !other.session.wait_timeout.is_zero() {
        base.session.wait_timeout = other.session.wait_timeout;
    }

    if other.display.width != 0 {
        base.display.width = other.display.width;
    }
    base.display.indent = other.display.indent;

    base
}

fn apply_env(mut cfg: Config, prefix: &str) -> Config {
    let mut map: HashMap<String, String> = HashMap::new();
    let upper_prefix = format!("{}_", prefix.to_uppercase());

    for (key, value) in env::vars() {
        if let Some(stripped) = key.strip_prefix(&upper_prefix) {
            let normalized = stripped.to_ascii_lowercase().replace("__", ".");
            map.insert(normalized, value);
        }
    }

    for (key, value) in map {
        apply_env_value(&mut cfg, &key, value);
    }
    cfg
}

fn apply_env_value(cfg: &mut Config, key: &str, value: String) {
    match key {
        "reddit.user_agent" => {
            if !value.trim().is_empty() {
                cfg.reddit.user_agent = value;
            }
        }
        "reddit.base_url" => cfg.reddit.base_url = Some(value).filter(|v| !v.trim().is_empty()),
        "reddit.access_token" => {
            cfg.reddit.access_token = Some(value).filter(|v| !v.trim().is_empty())
        }
        "reddit.timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.reddit.timeout = duration;
            }
        }
        "session.expand_rounds" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.session.expand_rounds = parsed;
            }
        }
        "session.wait_timeout" => {
            if let Ok(duration) = humantime::parse_duration(&value) {
                cfg.session.wait_timeout = duration;
            }
        }
        "display.width" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.display.width = parsed;
            }
        }
        "display.indent" => {
            if let Ok(parsed) = value.parse::<usize>() {
                cfg.display.indent = parsed;
            }
        }
        _ => {
            tracing::debug!(key, "ignoring unknown config override");
        }
    }
}

pub fn default_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("thread-graft").join("config.yaml"))
}

//! Reactor configuration.
//!
//! Defaults suit most servers. Values can be overridden with builder
//! methods, loaded from JSON, or read from `UVWIRE_*` environment variables:
//!
//! | Variable                  | Field              | Default  |
//! |---------------------------|--------------------|----------|
//! | `UVWIRE_READ_BUFFER_SIZE` | `read_buffer_size` | 65536    |
//! | `UVWIRE_DEFAULT_BACKLOG`  | `default_backlog`  | 511      |
//! | `UVWIRE_MAX_HEADER_SIZE`  | `max_header_size`  | 81920    |
//! | `UVWIRE_MAX_HEADERS`      | `max_headers`      | 128      |
//! | `UVWIRE_RUNTIME_GRANTS`   | `runtime_grants`   | all      |
//!
//! `UVWIRE_RUNTIME_GRANTS` is a comma-separated list such as
//! `handle,filesystem`.

use std::str::FromStr;

use serde::Deserialize;
use thiserror::Error;

use crate::capability::{Capability, CapabilityToken};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),

    #[error("{key} has an unparseable value {value:?}")]
    Env { key: &'static str, value: String },

    #[error("malformed configuration JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Settings shared by every handle on one reactor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReactorConfig {
    /// Bytes reserved per stream read.
    pub read_buffer_size: usize,
    /// Backlog used by [`listen_default`](crate::handle::Listener::listen_default).
    pub default_backlog: u32,
    /// Largest start-line plus header block the parser accepts.
    pub max_header_size: usize,
    /// Most header fields per message.
    pub max_headers: usize,
    /// Capabilities the bridge itself holds.
    pub runtime_grants: CapabilityToken,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            read_buffer_size: 64 * 1024,
            default_backlog: 511,
            max_header_size: 80 * 1024,
            max_headers: 128,
            runtime_grants: CapabilityToken::all(),
        }
    }
}

impl ReactorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    pub fn default_backlog(mut self, backlog: u32) -> Self {
        self.default_backlog = backlog;
        self
    }

    pub fn max_header_size(mut self, size: usize) -> Self {
        self.max_header_size = size;
        self
    }

    pub fn max_headers(mut self, count: usize) -> Self {
        self.max_headers = count;
        self
    }

    pub fn runtime_grants(mut self, grants: CapabilityToken) -> Self {
        self.runtime_grants = grants;
        self
    }

    /// Rejects values no reactor can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid("read_buffer_size must be > 0"));
        }
        if self.default_backlog == 0 {
            return Err(ConfigError::Invalid("default_backlog must be > 0"));
        }
        if self.max_header_size < 64 {
            return Err(ConfigError::Invalid("max_header_size must be >= 64"));
        }
        if self.max_headers == 0 {
            return Err(ConfigError::Invalid("max_headers must be > 0"));
        }
        Ok(())
    }

    /// Parses and validates a JSON document. Missing fields keep defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `UVWIRE_*` variables from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a caller-supplied lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            read_buffer_size: parse(&lookup, "UVWIRE_READ_BUFFER_SIZE")?
                .unwrap_or(defaults.read_buffer_size),
            default_backlog: parse(&lookup, "UVWIRE_DEFAULT_BACKLOG")?
                .unwrap_or(defaults.default_backlog),
            max_header_size: parse(&lookup, "UVWIRE_MAX_HEADER_SIZE")?
                .unwrap_or(defaults.max_header_size),
            max_headers: parse(&lookup, "UVWIRE_MAX_HEADERS")?.unwrap_or(defaults.max_headers),
            runtime_grants: match lookup("UVWIRE_RUNTIME_GRANTS") {
                Some(value) => parse_grants(&value).ok_or(ConfigError::Env {
                    key: "UVWIRE_RUNTIME_GRANTS",
                    value,
                })?,
                None => defaults.runtime_grants,
            },
        };
        config.validate()?;
        Ok(config)
    }
}

fn parse<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => match value.trim().parse() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(_) => Err(ConfigError::Env { key, value }),
        },
    }
}

fn parse_grants(value: &str) -> Option<CapabilityToken> {
    let mut token = CapabilityToken::empty();
    for name in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if name.eq_ignore_ascii_case("all") {
            return Some(CapabilityToken::all());
        }
        let cap = Capability::ALL
            .into_iter()
            .find(|cap| cap.as_str().eq_ignore_ascii_case(name))?;
        token = token.with(cap);
    }
    Some(token)
}

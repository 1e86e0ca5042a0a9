//! Runtime configuration.
//!
//! Everything has a default; a TOML document only needs the keys it changes:
//!
//! ```toml
//! local_aliases = ["localhost", "loopback"]
//! disable_fs_redirection = true
//!
//! [descriptors]
//! hard_limit = 8192
//! soft_limit = 512
//! ```

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Environment variable naming the configuration file of the C surface.
pub const CONFIG_ENV: &str = "LIBW32_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DescriptorLimits {
    /// Capacity of the socket-descriptor table.
    pub hard_limit: usize,
    /// Initial high-water mark below which the CRT is consulted.
    pub soft_limit: usize,
}

impl Default for DescriptorLimits {
    fn default() -> Self {
        Self { hard_limit: 8192, soft_limit: 512 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub descriptors: DescriptorLimits,
    /// Server names that denote this machine besides its computer name.
    pub local_aliases: Vec<String>,
    /// Turn off Wow64 file-system redirection around directory searches.
    pub disable_fs_redirection: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            descriptors: DescriptorLimits::default(),
            local_aliases: vec!["localhost".to_string()],
            disable_fs_redirection: true,
        }
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Configuration named by `LIBW32_CONFIG`, or the defaults when the
    /// variable is unset. A file that cannot be used is logged and ignored.
    pub fn from_env() -> Self {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(&path).unwrap_or_else(|err| {
                log::warn!("ignoring {CONFIG_ENV}: {err}");
                Self::default()
            }),
            None => Self::default(),
        }
    }

    fn validate(mut self) -> Result<Self> {
        if self.descriptors.hard_limit == 0 {
            return Err(Error::Config("descriptors.hard_limit must be positive".into()));
        }
        if self.descriptors.soft_limit > self.descriptors.hard_limit {
            log::debug!(
                "soft limit {} capped to hard limit {}",
                self.descriptors.soft_limit,
                self.descriptors.hard_limit
            );
            self.descriptors.soft_limit = self.descriptors.hard_limit;
        }
        Ok(self)
    }
}

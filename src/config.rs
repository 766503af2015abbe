// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Server configuration, deserialized from a TOML file

use crate::model::DEFAULT_ALLOCATION_TTL_SECS;
use camino::Utf8Path;
use serde::Deserialize;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Dropshot server parameters
    #[serde(default)]
    pub dropshot: dropshot::ConfigDropshot,
    /// Server-wide logging configuration
    pub log: dropshot::ConfigLogging,
    /// Allocation lifecycle tuning
    #[serde(default)]
    pub vmnet: VmnetConfig,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct VmnetConfig {
    /// name of the address range allocations claim subnets from
    pub range_name: String,
    /// seconds a start or ping keeps an allocation alive
    pub allocation_ttl_secs: u64,
    /// seconds between expiration reaper sweeps
    pub reaper_period_secs: u64,
}

impl Default for VmnetConfig {
    fn default() -> Self {
        VmnetConfig {
            range_name: String::from("default"),
            allocation_ttl_secs: DEFAULT_ALLOCATION_TTL_SECS,
            reaper_period_secs: 60,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("read \"{path}\"")]
    Io {
        path: camino::Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("parse \"{path}\"")]
    Parse {
        path: camino::Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
}

impl Config {
    /// Load a `Config` from the given TOML file.
    pub fn from_file(path: &Utf8Path) -> Result<Config, LoadError> {
        let contents = std::fs::read_to_string(path).map_err(|err| {
            LoadError::Io { path: path.to_owned(), err }
        })?;
        toml::from_str(&contents)
            .map_err(|err| LoadError::Parse { path: path.to_owned(), err })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_config() {
        let config: Config = toml::from_str(
            r#"
            [dropshot]
            bind_address = "127.0.0.1:12220"

            [log]
            mode = "stderr-terminal"
            level = "info"

            [vmnet]
            range_name = "default"
            allocation_ttl_secs = 1800
            reaper_period_secs = 30
            "#,
        )
        .unwrap();
        assert_eq!(config.vmnet.allocation_ttl_secs, 1800);
        assert_eq!(config.vmnet.reaper_period_secs, 30);
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str(
            r#"
            [log]
            mode = "stderr-terminal"
            level = "info"
            "#,
        )
        .unwrap();
        assert_eq!(config.vmnet.range_name, "default");
        assert_eq!(
            config.vmnet.allocation_ttl_secs,
            DEFAULT_ALLOCATION_TTL_SECS
        );
    }
}

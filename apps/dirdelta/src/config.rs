//! Demo configuration.
//!
//! Read from the TOML file named on the command line, or `dirdelta.toml`
//! in the working directory. A missing file means defaults:
//!
//! ```toml
//! host_addr = "127.0.0.1:7001"
//! client_addr = "127.0.0.1:7002"
//!
//! [host]
//! app_root = "host"
//! chunk_size = 65536
//!
//! [client]
//! app_root = "client"
//!
//! [job]
//! subdir = ""
//! output_subdir = "mirror"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use dirdelta_coordinator::CoordinatorConfig;
use serde::{Deserialize, Serialize};

/// Default configuration file name.
pub const CONFIG_FILE: &str = "dirdelta.toml";

/// Demo configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Loopback address of the hosting coordinator.
    #[serde(default = "default_host_addr")]
    pub host_addr: SocketAddr,

    /// Loopback address of the downloading coordinator.
    #[serde(default = "default_client_addr")]
    pub client_addr: SocketAddr,

    #[serde(default = "default_host")]
    pub host: CoordinatorConfig,

    #[serde(default = "default_client")]
    pub client: CoordinatorConfig,

    #[serde(default)]
    pub job: MirrorJob,
}

/// What to mirror from the host into the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorJob {
    /// Directory below the host's root to register and download.
    #[serde(default)]
    pub subdir: String,

    /// Destination of the mirrored files.
    #[serde(default = "default_output_subdir")]
    pub output_subdir: String,

    /// Resolve `output_subdir` below the client's root.
    #[serde(default = "default_true")]
    pub prepend_app_dir: bool,

    /// Send the client's existing files so only differences travel.
    #[serde(default = "default_true")]
    pub diff_existing: bool,
}

fn default_host_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7001))
}

fn default_client_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 7002))
}

fn default_host() -> CoordinatorConfig {
    CoordinatorConfig::new("host")
}

fn default_client() -> CoordinatorConfig {
    CoordinatorConfig::new("client")
}

fn default_output_subdir() -> String {
    "mirror".into()
}

fn default_true() -> bool {
    true
}

impl Default for MirrorJob {
    fn default() -> Self {
        Self {
            subdir: String::new(),
            output_subdir: default_output_subdir(),
            prepend_app_dir: true,
            diff_existing: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host_addr: default_host_addr(),
            client_addr: default_client_addr(),
            host: default_host(),
            client: default_client(),
            job: MirrorJob::default(),
        }
    }
}

impl Config {
    /// Loads the file named by the first argument, or [`CONFIG_FILE`].
    pub fn load() -> anyhow::Result<(Self, PathBuf)> {
        let path = std::env::args_os()
            .nth(1)
            .map_or_else(|| PathBuf::from(CONFIG_FILE), PathBuf::from);
        let config = Self::load_from(&path)?;
        Ok((config, path))
    }

    /// Loads `path`, falling back to defaults when it does not exist.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            tracing::debug!(path = %path.display(), "no configuration file, using defaults");
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        self.host.validate()?;
        self.client.validate()?;
        if self.host_addr == self.client_addr {
            anyhow::bail!("host and client share the address {}", self.host_addr);
        }
        Ok(())
    }

    /// Directory the client writes into.
    pub fn output_dir(&self) -> PathBuf {
        if self.job.prepend_app_dir {
            self.client.app_root.join(&self.job.output_subdir)
        } else {
            PathBuf::from(&self.job.output_subdir)
        }
    }
}

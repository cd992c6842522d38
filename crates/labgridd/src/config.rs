//! labgrid.toml configuration parser.
//!
//! Every section is optional; missing values fall back to the defaults below
//! and command-line flags override whatever the file says.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabgridConfig {
    pub server: ServerConfig,
    pub state: StateConfig,
    pub locking: LockingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: IpAddr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 8480,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub data_dir: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/labgrid"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockingConfig {
    /// Bounded wait for the resource table mutex, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

impl LabgridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: LabgridConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.bind, self.server.port)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.locking.timeout_ms)
    }

    pub fn db_path(&self) -> PathBuf {
        self.state.data_dir.join("labgrid.redb")
    }
}

use std::fs::File;
use std::io::{self, BufReader};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use usbip_device::{DeviceConfig, USBIP_PORT};
use uuid::Uuid;

const DEFAULT_AAGUID: Uuid = Uuid::from_u128(0x8f6d_0b7e_2f43_4c1a_9a55_3d0b_c7e1_f2a4);
const DEFAULT_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unable to read config file {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("Invalid config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Everything the binary can be told, every key optional.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen: SocketAddr,
    pub device: DeviceConfig,
    pub authenticator: AuthenticatorConfig,
    /// Reports buffered per interrupt endpoint direction.
    pub report_queue_depth: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, USBIP_PORT)),
            device: DeviceConfig::default(),
            authenticator: AuthenticatorConfig::default(),
            report_queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthenticatorConfig {
    pub aaguid: Uuid,
    pub attestation_common_name: String,
    /// Answer every user presence check with this, there is nobody to ask.
    pub auto_approve: bool,
}

impl Default for AuthenticatorConfig {
    fn default() -> Self {
        AuthenticatorConfig {
            aaguid: DEFAULT_AAGUID,
            attestation_common_name: "Virtual FIDO Authenticator".into(),
            auto_approve: true,
        }
    }
}

impl Config {
    /// Reads a JSON config file. A file that does not exist yields the defaults.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        match File::open(path) {
            Ok(file) => {
                serde_json::from_reader(BufReader::new(file)).map_err(|source| ConfigError::Parse {
                    path: path.to_owned(),
                    source,
                })
            }
            Err(ref err) if err.kind() == io::ErrorKind::NotFound => Ok(Config::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_owned(),
                source,
            }),
        }
    }
}

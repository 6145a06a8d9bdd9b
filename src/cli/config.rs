//! Command-line interface configuration
//!
//! Settings are read from `periphlink.toml` in the working directory, or from
//! the user's configuration directory when there is none. The [Config] type
//! handles loading and saving this file.

use std::{
    fs::{create_dir_all, read_to_string, write},
    path::{Path, PathBuf},
    time::Duration,
};

use directories::ProjectDirs;
use log::debug;
use miette::{IntoDiagnostic, Result, WrapErr};
use serde::{Deserialize, Serialize};

use crate::{
    connection::DEFAULT_CONNECT_TIMEOUT,
    flasher::FlashSettings,
    profile::{usb_token, DeviceProfile},
    session::SessionConfig,
    Error,
};

const CONFIG_FILE: &str = "periphlink.toml";

/// A configured, known serial connection
#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Connection {
    /// Name of the serial port used for communication
    pub serial: Option<String>,
}

/// An additional USB device to treat as the peripheral
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
pub struct UsbDevice {
    /// USB Vendor ID
    #[serde(
        serialize_with = "serialize_u16_to_hex",
        deserialize_with = "deserialize_hex_to_u16"
    )]
    pub vid: u16,
    /// USB Product ID
    #[serde(
        serialize_with = "serialize_u16_to_hex",
        deserialize_with = "deserialize_hex_to_u16"
    )]
    pub pid: u16,
}

fn deserialize_hex_to_u16<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let hex = String::deserialize(deserializer)?.to_lowercase();
    let hex = hex.trim_start_matches("0x");

    u16::from_str_radix(hex, 16).map_err(serde::de::Error::custom)
}

fn serialize_u16_to_hex<S>(decimal: &u16, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&format!("{decimal:04x}"))
}

impl UsbDevice {
    pub fn token(&self) -> String {
        usb_token(self.vid, self.pid)
    }
}

/// Session settings, plus how long to wait for the port to open
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct SessionSection {
    #[serde(flatten)]
    pub session: SessionConfig,
    pub connect_timeout_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        SessionSection {
            session: SessionConfig::default(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
        }
    }
}

impl SessionSection {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Upload settings, plus where firmware images live
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct FlashSection {
    #[serde(flatten)]
    pub settings: FlashSettings,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct Config {
    /// Preferred serial port
    #[serde(default)]
    pub connection: Connection,
    /// Additional USB bridges the peripheral may enumerate as
    #[serde(default)]
    pub usb_device: Vec<UsbDevice>,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub flash: FlashSection,
    /// Replaces the built-in profile
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile: Option<DeviceProfile>,
    /// Path of the file to save the configuration to
    #[serde(skip)]
    save_path: PathBuf,
}

impl Config {
    /// Load configuration from the configuration file, if there is one
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = match read_to_string(path) {
            Ok(data) => toml::from_str::<Config>(&data)
                .into_diagnostic()
                .wrap_err_with(|| format!("Failed to parse {}", path.display()))?,
            Err(_) => Config::default(),
        };
        config.session.session.validate()?;
        config.save_path = path.to_path_buf();

        debug!("Config: {:#?}", &config);

        Ok(config)
    }

    /// The configured profile, or the built-in one
    pub fn profile(&self) -> DeviceProfile {
        self.profile.clone().unwrap_or_else(DeviceProfile::ecool)
    }

    /// Directory firmware references are resolved against
    pub fn firmware_dir(&self) -> PathBuf {
        self.flash
            .firmware_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Save a modified copy of the configuration
    pub fn save_with<F: Fn(&mut Self)>(&self, modify_fn: F) -> Result<()> {
        let mut copy = self.clone();
        modify_fn(&mut copy);

        let serialized = toml::to_string(&copy)
            .into_diagnostic()
            .wrap_err("Failed to serialize config")?;

        if let Some(parent) = self.save_path.parent() {
            create_dir_all(parent)
                .into_diagnostic()
                .wrap_err("Failed to create config directory")?;
        }

        write(&self.save_path, serialized)
            .into_diagnostic()
            .wrap_err_with(|| format!("Failed to write config to {}", self.save_path.display()))
    }

    fn config_path() -> Result<PathBuf, Error> {
        let local_config = std::env::current_dir()?.join(CONFIG_FILE);
        if local_config.exists() {
            return Ok(local_config);
        }

        match ProjectDirs::from("", "", "periphlink") {
            Some(dirs) => Ok(dirs.config_dir().join(CONFIG_FILE)),
            None => Ok(local_config),
        }
    }
}

//! Device profiles
//!
//! A [DeviceProfile] describes one kind of peripheral: the USB identifiers its
//! serial bridge enumerates with, the line settings its command protocol runs
//! at, and the parameters its bootloader expects during a firmware upload.
//! Profiles are validated once when built and never change afterwards.

use std::{
    fmt::{self, Display, Formatter},
    path::{Path, PathBuf},
    str::FromStr,
    sync::OnceLock,
};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serialport::{DataBits, StopBits};

use crate::error::Error;

/// A USB vendor/product pair in the `USB\VID_xxxx&PID_xxxx` notation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct UsbFilter {
    vid: u16,
    pid: u16,
}

impl UsbFilter {
    pub const fn new(vid: u16, pid: u16) -> Self {
        UsbFilter { vid, pid }
    }

    pub fn vid(&self) -> u16 {
        self.vid
    }

    pub fn pid(&self) -> u16 {
        self.pid
    }

    /// The canonical token for this filter, e.g. `USB\VID_1A86&PID_7523`
    pub fn token(&self) -> String {
        usb_token(self.vid, self.pid)
    }
}

/// Format a vendor/product pair as its canonical token
pub fn usb_token(vid: u16, pid: u16) -> String {
    format!("USB\\VID_{vid:04X}&PID_{pid:04X}")
}

fn filter_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();

    PATTERN
        .get_or_init(|| Regex::new(r"^USB\\VID_([0-9A-Fa-f]{4})&PID_([0-9A-Fa-f]{4})$").ok())
        .as_ref()
}

impl FromStr for UsbFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = filter_pattern()
            .and_then(|pattern| pattern.captures(s.trim()))
            .ok_or_else(|| Error::InvalidProfile(format!("malformed USB filter '{s}'")))?;

        // Both groups are exactly four hex digits, so parsing cannot overflow
        let vid = u16::from_str_radix(&captures[1], 16)
            .map_err(|e| Error::InvalidProfile(e.to_string()))?;
        let pid = u16::from_str_radix(&captures[2], 16)
            .map_err(|e| Error::InvalidProfile(e.to_string()))?;

        Ok(UsbFilter { vid, pid })
    }
}

impl TryFrom<String> for UsbFilter {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<UsbFilter> for String {
    fn from(filter: UsbFilter) -> Self {
        filter.token()
    }
}

impl Display for UsbFilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.token())
    }
}

/// Serial line settings for the command protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct SerialConfig {
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Level of the DTR line while connected
    #[serde(default)]
    pub dtr: bool,
    /// Level of the RTS line while connected
    #[serde(default)]
    pub rts: bool,
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

impl SerialConfig {
    pub fn serial_data_bits(&self) -> DataBits {
        match self.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        }
    }

    pub fn serial_stop_bits(&self) -> StopBits {
        match self.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        }
    }

    fn validate(&self) -> Result<(), Error> {
        if self.baud_rate == 0 {
            return Err(Error::InvalidProfile("serial baud rate must be non-zero".into()));
        }
        if !(5..=8).contains(&self.data_bits) {
            return Err(Error::InvalidProfile(format!(
                "unsupported number of data bits: {}",
                self.data_bits
            )));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(Error::InvalidProfile(format!(
                "unsupported number of stop bits: {}",
                self.stop_bits
            )));
        }

        Ok(())
    }
}

/// Parameters handed to the bootloader during a firmware upload
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FlashConfig {
    /// Chip identifier the bootloader must report, e.g. `k210`
    pub chip: String,
    /// Board identifier, selects the reset wiring
    pub board: String,
    /// Baud rate used while transferring the image
    pub baud_rate: u32,
    /// Throttle the transfer for bootloaders with little receive buffering
    #[serde(default)]
    pub slow_mode: bool,
    /// Firmware image, relative to the firmware directory
    pub firmware: PathBuf,
    /// Use RTS/CTS hardware flow control during the transfer
    #[serde(default)]
    pub flow_control: bool,
}

impl FlashConfig {
    fn validate(&self) -> Result<(), Error> {
        if self.chip.trim().is_empty() {
            return Err(Error::InvalidProfile("flash chip must be set".into()));
        }
        if self.board.trim().is_empty() {
            return Err(Error::InvalidProfile("flash board must be set".into()));
        }
        if self.baud_rate == 0 {
            return Err(Error::InvalidProfile("flash baud rate must be non-zero".into()));
        }
        if self.firmware.as_os_str().is_empty() {
            return Err(Error::InvalidProfile("firmware image must be set".into()));
        }

        Ok(())
    }
}

/// Immutable description of one peripheral type
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceProfile {
    id: String,
    filters: Vec<UsbFilter>,
    serial: SerialConfig,
    flash: FlashConfig,
}

/// The serialized shape of a [DeviceProfile], validated on conversion
#[derive(Debug, Deserialize)]
struct RawProfile {
    id: String,
    filters: Vec<UsbFilter>,
    serial: SerialConfig,
    flash: FlashConfig,
}

impl<'de> Deserialize<'de> for DeviceProfile {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = RawProfile::deserialize(deserializer)?;

        DeviceProfile::new(raw.id, raw.filters, raw.serial, raw.flash)
            .map_err(serde::de::Error::custom)
    }
}

impl DeviceProfile {
    /// Validate and build a profile
    pub fn new(
        id: impl Into<String>,
        filters: Vec<UsbFilter>,
        serial: SerialConfig,
        flash: FlashConfig,
    ) -> Result<Self, Error> {
        let id = id.into();

        if id.trim().is_empty() {
            return Err(Error::InvalidProfile("profile id must be set".into()));
        }
        if filters.is_empty() {
            return Err(Error::InvalidProfile(
                "at least one USB filter is required".into(),
            ));
        }
        serial.validate()?;
        flash.validate()?;

        let mut unique = Vec::with_capacity(filters.len());
        for filter in filters {
            if !unique.contains(&filter) {
                unique.push(filter);
            }
        }

        Ok(DeviceProfile {
            id,
            filters: unique,
            serial,
            flash,
        })
    }

    /// The K210 "ecool" board behind a CH340 bridge
    pub fn ecool() -> Self {
        DeviceProfile {
            id: "ecool".into(),
            filters: vec![UsbFilter::new(0x1a86, 0x7523)],
            serial: SerialConfig {
                baud_rate: 115_200,
                data_bits: 8,
                stop_bits: 1,
                dtr: false,
                rts: false,
            },
            flash: FlashConfig {
                chip: "k210".into(),
                board: "maixduino".into(),
                baud_rate: 1_500_000,
                slow_mode: true,
                firmware: PathBuf::from("canmv_yahboom_v2.1.1.bin"),
                flow_control: false,
            },
        }
    }

    /// Parse and validate a profile from TOML
    pub fn from_toml(data: &str) -> Result<Self, Error> {
        toml::from_str(data).map_err(|e| Error::InvalidProfile(e.message().to_string()))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn filters(&self) -> &[UsbFilter] {
        &self.filters
    }

    pub fn serial(&self) -> &SerialConfig {
        &self.serial
    }

    pub fn flash(&self) -> &FlashConfig {
        &self.flash
    }

    /// Whether `token` exactly matches one of the profile's USB filters
    pub fn matches_token(&self, token: &str) -> bool {
        self.filters.iter().any(|filter| filter.token() == token)
    }

    /// Resolve the firmware reference against `firmware_dir`
    pub fn firmware_path(&self, firmware_dir: &Path) -> PathBuf {
        if self.flash.firmware.is_absolute() {
            self.flash.firmware.clone()
        } else {
            firmware_dir.join(&self.flash.firmware)
        }
    }
}

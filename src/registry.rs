//! Device discovery
//!
//! Matches the USB serial ports attached to the host against the filters of a
//! [DeviceProfile]. Discovery only enumerates; no port is opened.

use std::time::SystemTime;

use log::debug;
use serialport::SerialPortType;

use crate::{
    error::Error,
    profile::{usb_token, DeviceProfile},
};

/// A USB serial port currently attached to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachedPort {
    pub port_name: String,
    pub vid: u16,
    pub pid: u16,
    pub product: Option<String>,
    /// When the OS created the port, if known
    pub attached_at: Option<SystemTime>,
}

impl AttachedPort {
    /// The canonical `USB\VID_XXXX&PID_XXXX` token
    pub fn token(&self) -> String {
        usb_token(self.vid, self.pid)
    }
}

/// Source of attached ports
pub trait PortEnumerator {
    fn attached(&self) -> Result<Vec<AttachedPort>, Error>;
}

/// Enumerates the host's serial ports
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPorts;

impl PortEnumerator for SystemPorts {
    fn attached(&self) -> Result<Vec<AttachedPort>, Error> {
        let ports = serialport::available_ports()?;

        Ok(ports
            .into_iter()
            .filter_map(|info| match info.port_type {
                SerialPortType::UsbPort(usb) => Some(AttachedPort {
                    attached_at: attachment_time(&info.port_name),
                    port_name: info.port_name,
                    vid: usb.vid,
                    pid: usb.pid,
                    product: usb.product,
                }),
                _ => None,
            })
            .collect())
    }
}

/// Device nodes are created when the device attaches, so their timestamp
/// orders ports by attachment
#[cfg(unix)]
fn attachment_time(port_name: &str) -> Option<SystemTime> {
    std::fs::metadata(port_name)
        .and_then(|metadata| metadata.modified())
        .ok()
}

#[cfg(not(unix))]
fn attachment_time(_port_name: &str) -> Option<SystemTime> {
    None
}

/// A port matching one of a profile's filters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    pub port_name: String,
    pub token: String,
    pub product: Option<String>,
    pub attached_at: Option<SystemTime>,
}

/// Find the attached ports matching `profile`, oldest attachment first
///
/// Ports whose attachment time is unknown follow, in enumeration order. An
/// empty result means no matching device is present.
pub fn discover(
    profile: &DeviceProfile,
    enumerator: &dyn PortEnumerator,
) -> Result<Vec<PortCandidate>, Error> {
    let mut candidates = enumerator
        .attached()?
        .into_iter()
        .filter_map(|port| {
            let token = port.token();
            if !profile.matches_token(&token) {
                return None;
            }

            Some(PortCandidate {
                port_name: port.port_name,
                token,
                product: port.product,
                attached_at: port.attached_at,
            })
        })
        .collect::<Vec<_>>();

    // Stable, so ties and unknown times keep enumeration order
    candidates.sort_by_key(|candidate| (candidate.attached_at.is_none(), candidate.attached_at));

    debug!(
        "Found {} port(s) matching profile '{}'",
        candidates.len(),
        profile.id()
    );

    Ok(candidates)
}

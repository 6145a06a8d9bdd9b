use dialoguer::{theme::ColorfulTheme, Confirm, Select};
use log::info;

use super::{config::Config, ConnectArgs};
use crate::{
    error::Error,
    registry::{AttachedPort, PortCandidate, PortEnumerator},
    DeviceProfile,
};

/// Pick the serial port to connect to
///
/// A port given on the command line takes precedence over the one remembered
/// in the configuration file. Otherwise the ports matching the profile, or a
/// configured extra USB device, are offered; a single match is used directly.
pub fn get_serial_port(
    args: &ConnectArgs,
    config: &Config,
    profile: &DeviceProfile,
    enumerator: &dyn PortEnumerator,
) -> Result<String, Error> {
    if let Some(serial) = &args.serial {
        return Ok(serial.clone());
    }
    if let Some(serial) = &config.connection.serial {
        return Ok(serial.clone());
    }

    let candidates = matching_ports(config, profile, enumerator.attached()?);

    let port = match candidates.as_slice() {
        [] => return Err(Error::NoMatchingDevice),
        [single] => single.port_name.clone(),
        _ => select_serial_port(&candidates)?,
    };

    if candidates.len() > 1 {
        let remember = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Remember this serial port for future use?")
            .interact_opt()?
            .unwrap_or_default();

        if remember {
            // Allow this to fail without terminating the application, but
            // inform the user if something goes wrong
            if let Err(e) = config.save_with(|config| config.connection.serial = Some(port.clone()))
            {
                eprintln!("Failed to save config {e:#}");
            }
        }
    }

    info!("Using serial port {port}");
    Ok(port)
}

/// Ports matching the profile's filters or the configured USB devices, oldest
/// attachment first
fn matching_ports(
    config: &Config,
    profile: &DeviceProfile,
    attached: Vec<AttachedPort>,
) -> Vec<PortCandidate> {
    let mut candidates = attached
        .into_iter()
        .filter_map(|port| {
            let token = port.token();
            let known = profile.matches_token(&token)
                || config.usb_device.iter().any(|dev| dev.token() == token);

            known.then(|| PortCandidate {
                port_name: port.port_name,
                token,
                product: port.product,
                attached_at: port.attached_at,
            })
        })
        .collect::<Vec<_>>();

    candidates.sort_by_key(|candidate| (candidate.attached_at.is_none(), candidate.attached_at));
    candidates
}

fn select_serial_port(candidates: &[PortCandidate]) -> Result<String, Error> {
    println!(
        "Detected {} matching serial ports, the earliest attached is listed first.\n",
        candidates.len()
    );

    let port_names = candidates
        .iter()
        .map(|candidate| match &candidate.product {
            Some(product) => format!("{} - {product}", candidate.port_name),
            None => candidate.port_name.clone(),
        })
        .collect::<Vec<_>>();

    let index = Select::with_theme(&ColorfulTheme::default())
        .items(&port_names)
        .default(0)
        .interact_opt()?
        .ok_or(Error::Cancelled)?;

    candidates
        .get(index)
        .map(|candidate| candidate.port_name.clone())
        .ok_or_else(|| Error::SerialNotFound(index.to_string()))
}

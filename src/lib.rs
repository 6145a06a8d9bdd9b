//! Host-side core for block-programmed serial peripherals
//!
//! `periphlink` discovers a peripheral over its USB-UART bridge, drives the
//! block command protocol against it, and uploads firmware through the chip's
//! bootloader.
//!
//! The pieces, leaf first:
//!
//! - [registry] matches attached serial ports against a profile's USB filters
//! - [connection] owns the serial port and its line configuration
//! - [codec] frames commands, responses and telemetry on the wire
//! - [session] serializes command traffic against one connection
//! - [flasher] runs the reset/transfer/verify/reboot upload sequence
//!
//! [Peripheral] ties them together.

pub use self::{
    error::{Error, Recovery},
    peripheral::Peripheral,
    profile::DeviceProfile,
};

pub mod blocks;
pub mod codec;
pub mod command;
pub mod connection;
pub mod error;
pub mod flasher;
pub mod peripheral;
pub mod profile;
pub mod progress;
pub mod registry;
pub mod session;

#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod cli;

/// Logging utilities
#[cfg(feature = "cli")]
#[cfg_attr(docsrs, doc(cfg(feature = "cli")))]
pub mod logging {
    use env_logger::Env;
    use log::LevelFilter;

    /// Initialize the logger with the given [LevelFilter]
    pub fn initialize_logger(filter: LevelFilter) {
        env_logger::Builder::from_env(Env::default().default_filter_or(filter.as_str()))
            .format_target(false)
            .init();
    }
}

//! Reset strategies driving the bootloader entry lines
//!
//! The bridge's DTR and RTS outputs are wired to the chip's boot-mode pin and
//! reset line. Which output drives which pin depends on the board.

use std::{thread::sleep, time::Duration};

use log::debug;

use super::Connection;
use crate::{error::Error, profile::FlashConfig};

/// Default time to wait before releasing the boot pin after a reset
const DEFAULT_RESET_DELAY: u64 = 50; // ms
/// Amount of time to wait if the default reset delay does not work
const EXTRA_RESET_DELAY: u64 = 550; // ms

/// Boards wired with DTR on the boot pin and RTS on reset
const CLASSIC_BOARDS: &[&str] = &["maixduino", "ecool"];

/// Some strategy for resetting a target device
pub trait ResetStrategy {
    fn reset(&self, connection: &mut Connection) -> Result<(), Error>;

    fn set_dtr(&self, connection: &mut Connection, level: bool) -> Result<(), Error> {
        connection.set_dtr(level)
    }

    fn set_rts(&self, connection: &mut Connection, level: bool) -> Result<(), Error> {
        connection.set_rts(level)
    }
}

fn reset_delay(extra_delay: bool) -> u64 {
    if extra_delay {
        EXTRA_RESET_DELAY
    } else {
        DEFAULT_RESET_DELAY
    }
}

/// Classic reset sequence: DTR holds the boot pin, RTS the reset line
#[derive(Debug, Clone, Copy)]
pub struct ClassicReset {
    delay: u64,
}

impl ClassicReset {
    pub fn new(extra_delay: bool) -> Self {
        Self {
            delay: reset_delay(extra_delay),
        }
    }
}

impl ResetStrategy for ClassicReset {
    fn reset(&self, connection: &mut Connection) -> Result<(), Error> {
        debug!(
            "Using Classic reset strategy with delay of {}ms",
            self.delay
        );

        self.set_dtr(connection, false)?; // BOOT = HIGH
        self.set_rts(connection, true)?; // RST = LOW, chip in reset

        sleep(Duration::from_millis(100));

        self.set_dtr(connection, true)?; // BOOT = LOW
        self.set_rts(connection, false)?; // RST = HIGH, chip out of reset

        sleep(Duration::from_millis(self.delay));

        self.set_dtr(connection, false)?; // BOOT = HIGH, done

        Ok(())
    }
}

/// Reset sequence for boards with the two lines swapped
#[derive(Debug, Clone, Copy)]
pub struct SwappedReset {
    delay: u64,
}

impl SwappedReset {
    pub fn new(extra_delay: bool) -> Self {
        Self {
            delay: reset_delay(extra_delay),
        }
    }
}

impl ResetStrategy for SwappedReset {
    fn reset(&self, connection: &mut Connection) -> Result<(), Error> {
        debug!(
            "Using Swapped reset strategy with delay of {}ms",
            self.delay
        );

        self.set_rts(connection, false)?; // BOOT = HIGH
        self.set_dtr(connection, true)?; // RST = LOW, chip in reset

        sleep(Duration::from_millis(100));

        self.set_rts(connection, true)?; // BOOT = LOW
        self.set_dtr(connection, false)?; // RST = HIGH, chip out of reset

        sleep(Duration::from_millis(self.delay));

        self.set_rts(connection, false)?; // BOOT = HIGH, done

        Ok(())
    }
}

/// Reset the chip into its application, leaving the boot pin released
#[derive(Debug, Clone, Copy)]
pub struct HardReset;

impl ResetStrategy for HardReset {
    fn reset(&self, connection: &mut Connection) -> Result<(), Error> {
        debug!("Using HardReset reset strategy");

        self.set_rts(connection, true)?; // RST = LOW, chip in reset
        sleep(Duration::from_millis(100));
        self.set_rts(connection, false)?;

        Ok(())
    }
}

/// Construct a sequence of reset strategies for the board.
///
/// Returns a [Vec] containing one or more reset strategies to be attempted
/// sequentially.
pub fn construct_reset_strategy_sequence(flash: &FlashConfig) -> Vec<Box<dyn ResetStrategy>> {
    if CLASSIC_BOARDS
        .iter()
        .any(|board| flash.board.eq_ignore_ascii_case(board))
    {
        return vec![
            Box::new(ClassicReset::new(false)),
            Box::new(ClassicReset::new(true)),
        ];
    }

    // Unknown wiring, try both
    vec![
        Box::new(ClassicReset::new(false)),
        Box::new(SwappedReset::new(false)),
        Box::new(ClassicReset::new(true)),
        Box::new(SwappedReset::new(true)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::DeviceProfile;

    #[test]
    fn known_boards_use_the_classic_wiring() {
        let flash = DeviceProfile::ecool().flash().clone();
        assert_eq!(construct_reset_strategy_sequence(&flash).len(), 2);

        let flash = FlashConfig {
            board: "kd233".into(),
            ..flash
        };
        assert_eq!(construct_reset_strategy_sequence(&flash).len(), 4);
    }
}

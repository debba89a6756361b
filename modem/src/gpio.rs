use std::{
    fs::{File, OpenOptions},
    io::{self, Seek, SeekFrom, Write},
    path::PathBuf,
    time::Duration,
};

use embedded_hal::digital::{ErrorType, OutputPin, PinState};

use crate::error::ModemError;

const SYSFS_GPIO: &str = "/sys/class/gpio";

/// An output line that may not be wired to anything.
///
/// An unconnected line swallows every write, so sequences that toggle it
/// collapse to no-ops without the caller checking first.
pub struct DigitalOut<P> {
    pin: Option<P>,
    level: bool,
}

impl<P: OutputPin> DigitalOut<P> {
    /// Wrap `pin` and drive it to `level` straight away.
    pub fn new(pin: P, level: bool) -> Result<Self, P::Error> {
        let mut out = DigitalOut {
            pin: Some(pin),
            level,
        };
        out.set(level)?;
        Ok(out)
    }

    pub fn not_connected() -> Self {
        DigitalOut {
            pin: None,
            level: false,
        }
    }

    pub fn from_option(pin: Option<P>, level: bool) -> Result<Self, P::Error> {
        match pin {
            Some(pin) => Self::new(pin, level),
            None => Ok(Self::not_connected()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.pin.is_some()
    }

    pub fn set(&mut self, level: bool) -> Result<(), P::Error> {
        if let Some(pin) = self.pin.as_mut() {
            pin.set_state(PinState::from(level))?;
            self.level = level;
        }
        Ok(())
    }

    /// Last driven level, `None` when unconnected.
    pub fn level(&self) -> Option<bool> {
        self.pin.as_ref().map(|_| self.level)
    }
}

/// Linux sysfs GPIO configured as an output.
pub struct SysfsPin {
    pin: u32,
    value_file: File,
}

impl SysfsPin {
    /// Export `pin` and configure it as an output starting at `initial`.
    pub fn export(pin: u32, initial: bool) -> Result<Self, ModemError> {
        let gpio_err = |source: io::Error| ModemError::Gpio { pin, source };
        let base = PathBuf::from(SYSFS_GPIO);
        let node = base.join(format!("gpio{}", pin));

        if !node.exists() {
            let mut export = OpenOptions::new()
                .write(true)
                .open(base.join("export"))
                .map_err(gpio_err)?;
            writeln!(export, "{}", pin).map_err(gpio_err)?;
            // udev needs a moment to create the node
            std::thread::sleep(Duration::from_millis(50));
        }

        // "high"/"low" set direction and level in one glitch-free write
        let mut direction = OpenOptions::new()
            .write(true)
            .open(node.join("direction"))
            .map_err(gpio_err)?;
        writeln!(direction, "{}", if initial { "high" } else { "low" }).map_err(gpio_err)?;

        let value_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(node.join("value"))
            .map_err(gpio_err)?;

        Ok(SysfsPin { pin, value_file })
    }

    pub fn pin(&self) -> u32 {
        self.pin
    }

    fn write_value(&mut self, value: &str) -> Result<(), ModemError> {
        let pin = self.pin;
        self.value_file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.value_file.write_all(value.as_bytes()))
            .map_err(|source| ModemError::Gpio { pin, source })
    }
}

impl Drop for SysfsPin {
    fn drop(&mut self) {
        let _ = OpenOptions::new()
            .write(true)
            .open(PathBuf::from(SYSFS_GPIO).join("unexport"))
            .and_then(|mut f| writeln!(f, "{}", self.pin));
    }
}

impl embedded_hal::digital::Error for ModemError {
    fn kind(&self) -> embedded_hal::digital::ErrorKind {
        embedded_hal::digital::ErrorKind::Other
    }
}

impl ErrorType for SysfsPin {
    type Error = ModemError;
}

impl OutputPin for SysfsPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.write_value("0")
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.write_value("1")
    }
}

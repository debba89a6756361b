use std::{
    fs::{File, OpenOptions},
    io,
    mem::MaybeUninit,
    os::{fd::AsRawFd, unix::fs::OpenOptionsExt},
};

use libc::{speed_t, termios};

use crate::error::{ModemError, Result};

/// Read timeout of the tty in tenths of a second. Reads return empty
/// after this long, which lets the AT channel check its own deadline.
const READ_TIMEOUT_DECIS: libc::cc_t = 1;

fn baud_constant(baudrate: u32) -> Option<speed_t> {
    let speed = match baudrate {
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        230400 => libc::B230400,
        460800 => libc::B460800,
        921600 => libc::B921600,
        _ => return None,
    };
    Some(speed)
}

/// Open the modem's serial device in raw mode.
///
/// With `rtscts` the host side of the link runs RTS/CTS flow control,
/// matching `AT+IFC=2,2` on the module.
pub fn open_serial(path: &str, baudrate: u32, rtscts: bool) -> Result<File> {
    let serial_err = |source: io::Error| ModemError::Serial {
        path: path.to_string(),
        source,
    };

    let speed = baud_constant(baudrate).ok_or_else(|| {
        serial_err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported baudrate {}", baudrate),
        ))
    })?;

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(path)
        .map_err(serial_err)?;
    let fd = file.as_raw_fd();

    let mut tio = MaybeUninit::<termios>::uninit();
    if unsafe { libc::tcgetattr(fd, tio.as_mut_ptr()) } != 0 {
        return Err(serial_err(io::Error::last_os_error()));
    }
    let mut tio = unsafe { tio.assume_init() };

    unsafe { libc::cfmakeraw(&mut tio) };
    tio.c_cflag |= libc::CLOCAL | libc::CREAD;
    if rtscts {
        tio.c_cflag |= libc::CRTSCTS;
    } else {
        tio.c_cflag &= !libc::CRTSCTS;
    }
    tio.c_cc[libc::VMIN] = 0;
    tio.c_cc[libc::VTIME] = READ_TIMEOUT_DECIS;

    let rc = unsafe {
        libc::cfsetispeed(&mut tio, speed) | libc::cfsetospeed(&mut tio, speed)
    };
    if rc != 0 {
        return Err(serial_err(io::Error::last_os_error()));
    }

    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tio) } != 0 {
        return Err(serial_err(io::Error::last_os_error()));
    }

    // drop whatever the module printed before we took over
    if unsafe { libc::tcflush(fd, libc::TCIOFLUSH) } != 0 {
        return Err(serial_err(io::Error::last_os_error()));
    }

    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_common_baudrates() {
        assert_eq!(baud_constant(115200), Some(libc::B115200));
        assert_eq!(baud_constant(921600), Some(libc::B921600));
        assert_eq!(baud_constant(12345), None);
    }

    #[test]
    fn rejects_unsupported_baudrate_before_opening() {
        let err = open_serial("/nonexistent/tty", 12345, false).unwrap_err();
        assert!(matches!(err, ModemError::Serial { .. }));
        assert!(err.to_string().contains("unsupported baudrate"));
    }

    #[test]
    fn missing_device_is_reported() {
        let err = open_serial("/nonexistent/tty", 115200, true).unwrap_err();
        assert!(matches!(
            err,
            ModemError::Serial { ref path, .. } if path == "/nonexistent/tty"
        ));
    }
}

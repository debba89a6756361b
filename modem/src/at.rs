use std::{
    io::{self, Read, Write},
    time::{Duration, Instant},
};

use slog::{debug, trace, warn, Logger};

use crate::error::{DeviceFault, ModemError, Result};

/// Final result code that ends an ordinary command response.
pub const OK: &str = "OK";

pub const DEFAULT_AT_TIMEOUT: Duration = Duration::from_millis(8000);

const ERROR_PREFIXES: [&str; 3] = ["ERROR", "+CME ERROR", "+CMS ERROR"];

/// The slice of an AT command engine a modem driver needs.
pub trait CommandChannel {
    /// Take exclusive use of the channel.
    fn lock(&mut self);

    fn unlock(&mut self);

    /// Override the response timeout until [`restore_at_timeout`](Self::restore_at_timeout).
    fn set_at_timeout(&mut self, timeout: Duration);

    fn restore_at_timeout(&mut self);

    /// Start collecting a fresh response, dropping anything stale.
    fn resp_start(&mut self);

    /// Substring that marks the end of the response being collected.
    fn set_stop_tag(&mut self, tag: &str);

    /// Read until the stop tag shows up or the timeout expires.
    /// Returns whether the tag was seen.
    fn consume_to_stop_tag(&mut self) -> bool;

    /// Read failure that cut the last [`consume_to_stop_tag`](Self::consume_to_stop_tag)
    /// short, if any. Cleared by taking it.
    fn take_io_error(&mut self) -> Option<io::Error> {
        None
    }

    /// Send `AT<cmd><op><args>` and throw the response away, keeping only
    /// whether it finished with `OK`.
    fn at_cmd_discard(&mut self, cmd: &str, op: &str, args: &[i32]) -> Result<()>;
}

/// Render a command line, arguments comma separated.
pub fn format_command(cmd: &str, op: &str, args: &[i32]) -> String {
    let args = args
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("AT{}{}{}\r", cmd, op, args)
}

/// Command channel over any byte stream, usually a serial port.
///
/// Reads that fail with `TimedOut`/`WouldBlock` or return no data are
/// retried until the installed timeout runs out, so the stream should have
/// a short read timeout of its own.
pub struct AtChannel<T> {
    io: T,
    logger: Logger,
    default_timeout: Duration,
    timeout: Duration,
    stop_tag: String,
    buf: Vec<u8>,
    locked: bool,
    io_error: Option<io::Error>,
}

impl<T: Read + Write> AtChannel<T> {
    pub fn new(io: T, default_timeout: Duration, logger: Logger) -> Self {
        AtChannel {
            io,
            logger,
            default_timeout,
            timeout: default_timeout,
            stop_tag: OK.to_string(),
            buf: Vec::with_capacity(256),
            locked: false,
            io_error: None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn stop_tag(&self) -> &str {
        &self.stop_tag
    }

    /// Pull whatever the stream has into the buffer. `Ok(false)` means the
    /// read came back empty and the caller should check its deadline.
    fn fill(&mut self) -> io::Result<bool> {
        let mut chunk = [0u8; 128];
        match self.io.read(&mut chunk) {
            Ok(0) => Ok(false),
            Ok(n) => {
                trace!(self.logger, "rx"; "data" => %String::from_utf8_lossy(&chunk[..n]));
                self.buf.extend_from_slice(&chunk[..n]);
                Ok(true)
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Consume complete lines up to a final result code, if one arrived.
    fn take_final_result(&mut self) -> Option<Result<()>> {
        while let Some(end) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim();
            if line == OK {
                return Some(Ok(()));
            }
            if ERROR_PREFIXES.iter().any(|p| line.starts_with(p)) {
                debug!(self.logger, "command rejected"; "response" => line);
                return Some(Err(ModemError::Device(DeviceFault::Command)));
            }
        }
        None
    }

    fn wait_final_result(&mut self) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if let Some(result) = self.take_final_result() {
                return result;
            }
            if Instant::now() >= deadline {
                debug!(self.logger, "command timed out"; "timeout_ms" => self.timeout.as_millis() as u64);
                return Err(ModemError::Device(DeviceFault::Command));
            }
            self.fill().map_err(ModemError::Channel)?;
        }
    }
}

impl<T: Read + Write> CommandChannel for AtChannel<T> {
    fn lock(&mut self) {
        if self.locked {
            warn!(self.logger, "command channel locked twice");
        }
        self.locked = true;
    }

    fn unlock(&mut self) {
        self.locked = false;
    }

    fn set_at_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn restore_at_timeout(&mut self) {
        self.timeout = self.default_timeout;
    }

    fn resp_start(&mut self) {
        self.io_error = None;
        if !self.buf.is_empty() {
            trace!(self.logger, "dropping stale input"; "bytes" => self.buf.len());
            self.buf.clear();
        }
    }

    fn set_stop_tag(&mut self, tag: &str) {
        self.stop_tag = tag.to_string();
    }

    fn consume_to_stop_tag(&mut self) -> bool {
        self.io_error = None;
        let deadline = Instant::now() + self.timeout;
        loop {
            let tag = self.stop_tag.as_bytes();
            if tag.is_empty() {
                return true;
            }
            if let Some(pos) = self.buf.windows(tag.len()).position(|w| w == tag) {
                let end = pos + tag.len();
                self.buf.drain(..end);
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            if let Err(e) = self.fill() {
                warn!(self.logger, "read failed while waiting for stop tag";
                    "tag" => &self.stop_tag, "error" => %e);
                self.io_error = Some(e);
                return false;
            }
        }
    }

    fn take_io_error(&mut self) -> Option<io::Error> {
        self.io_error.take()
    }

    fn at_cmd_discard(&mut self, cmd: &str, op: &str, args: &[i32]) -> Result<()> {
        let line = format_command(cmd, op, args);
        debug!(self.logger, "tx"; "command" => line.trim_end());
        self.buf.clear();
        self.io
            .write_all(line.as_bytes())
            .and_then(|_| self.io.flush())
            .map_err(ModemError::Channel)?;
        self.wait_final_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Hands out scripted chunks, then times out forever.
    #[derive(Default)]
    struct ScriptedStream {
        input: VecDeque<Vec<u8>>,
        written: Vec<u8>,
    }

    impl ScriptedStream {
        fn with(chunks: &[&str]) -> Self {
            ScriptedStream {
                input: chunks.iter().map(|c| c.as_bytes().to_vec()).collect(),
                written: Vec::new(),
            }
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.input.pop_front() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.input.push_front(chunk[n..].to_vec());
                    }
                    Ok(n)
                }
                None => Err(io::Error::new(io::ErrorKind::TimedOut, "no data")),
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Every read fails as if the tty was unplugged.
    struct BrokenStream;

    impl Read for BrokenStream {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "tty gone"))
        }
    }

    impl Write for BrokenStream {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "tty gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn channel(chunks: &[&str]) -> AtChannel<ScriptedStream> {
        AtChannel::new(
            ScriptedStream::with(chunks),
            Duration::from_millis(50),
            Logger::root(slog::Discard, slog::o!()),
        )
    }

    #[test]
    fn formats_commands_byte_exact() {
        assert_eq!(format_command("+IFC", "=", &[2, 2]), "AT+IFC=2,2\r");
        assert_eq!(format_command("&W", "", &[]), "AT&W\r");
    }

    #[test]
    fn finds_stop_tag_split_across_reads() {
        let mut ch = channel(&["\r\nR", "DY\r\n"]);
        ch.set_stop_tag("RDY");
        assert!(ch.consume_to_stop_tag());
    }

    #[test]
    fn stop_tag_times_out() {
        let mut ch = channel(&["\r\n+QIND: SMS DONE\r\n"]);
        ch.set_stop_tag("RDY");
        let start = Instant::now();
        assert!(!ch.consume_to_stop_tag());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn resp_start_drops_stale_ready() {
        let mut ch = channel(&["\r\nRDY\r\n"]);
        ch.fill().unwrap();
        assert!(!ch.buf.is_empty());
        ch.resp_start();
        ch.set_stop_tag("RDY");
        assert!(!ch.consume_to_stop_tag());
    }

    #[test]
    fn read_failure_is_kept_for_caller() {
        let mut ch = AtChannel::new(
            BrokenStream,
            Duration::from_millis(50),
            Logger::root(slog::Discard, slog::o!()),
        );
        ch.set_stop_tag("RDY");
        assert!(!ch.consume_to_stop_tag());
        let err = ch.take_io_error().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(ch.take_io_error().is_none());
    }

    #[test]
    fn timeout_without_data_leaves_no_io_error() {
        let mut ch = channel(&[]);
        ch.set_stop_tag("RDY");
        assert!(!ch.consume_to_stop_tag());
        assert!(ch.take_io_error().is_none());
    }

    #[test]
    fn timeout_override_and_restore() {
        let mut ch = channel(&[]);
        ch.set_at_timeout(Duration::from_secs(15));
        assert_eq!(ch.timeout(), Duration::from_secs(15));
        ch.restore_at_timeout();
        assert_eq!(ch.timeout(), Duration::from_millis(50));
    }

    #[test]
    fn discard_succeeds_on_ok() {
        let mut ch = channel(&["AT+IFC=2,2\r\r\n", "OK\r\n"]);
        ch.at_cmd_discard("+IFC", "=", &[2, 2]).unwrap();
        assert_eq!(ch.io.written, b"AT+IFC=2,2\r");
    }

    #[test]
    fn discard_fails_on_error() {
        let mut ch = channel(&["\r\n+CME ERROR: 3\r\n"]);
        let err = ch.at_cmd_discard("&W", "", &[]).unwrap_err();
        assert!(matches!(err, ModemError::Device(DeviceFault::Command)));
    }

    #[test]
    fn discard_fails_on_silence() {
        let mut ch = channel(&[]);
        assert!(ch.at_cmd_discard("&W", "", &[]).unwrap_err().is_device_error());
    }

    #[test]
    fn lock_is_tracked() {
        let mut ch = channel(&[]);
        ch.lock();
        assert!(ch.is_locked());
        ch.unlock();
        assert!(!ch.is_locked());
    }
}

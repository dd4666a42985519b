//! Command channel over the instrument's USB serial port.

use std::io::{self, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use fwup_core::{ChannelError, CommandChannel};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, info};

/// Line rate for the port. CDC-ACM devices ignore it.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Newline-terminated text commands over a serial port.
pub struct TtyChannel {
    name: String,
    port: Option<Box<dyn SerialPort>>,
    /// Bytes read past the last returned line.
    pending: Vec<u8>,
}

impl TtyChannel {
    pub fn open(path: &Path, baud_rate: u32) -> serialport::Result<Self> {
        let name = path.to_string_lossy().into_owned();
        let port = serialport::new(name.as_str(), baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(Duration::from_secs(1))
            .open()?;

        info!("Opened serial port {} at {} baud", name, baud_rate);
        Ok(Self {
            name,
            port: Some(port),
            pending: Vec::new(),
        })
    }
}

impl CommandChannel for TtyChannel {
    fn send_command(&mut self, command: &str, timeout: Duration) -> Result<String, ChannelError> {
        let port = self.port.as_mut().ok_or(ChannelError::Closed)?;

        // drop unsolicited output
        port.clear(ClearBuffer::Input).map_err(io::Error::from)?;
        self.pending.clear();

        port.write_all(command.as_bytes())?;
        port.write_all(b"\n")?;
        port.flush()?;

        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 256];
        loop {
            if let Some(line) = take_line(&mut self.pending) {
                return Ok(line);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ChannelError::Timeout(timeout));
            }
            port.set_timeout(remaining).map_err(io::Error::from)?;

            match port.read(&mut buf) {
                Ok(0) => return Err(ChannelError::Closed),
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    return Err(ChannelError::Timeout(timeout));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn close(&mut self) -> Result<(), ChannelError> {
        match self.port.take() {
            Some(port) => {
                drop(port);
                debug!(port = %self.name, "Serial channel closed");
                Ok(())
            }
            None => Err(ChannelError::Closed),
        }
    }
}

/// Remove and return the first non-blank line in `pending`, trimmed.
/// Blank lines are consumed; an unterminated tail stays buffered.
fn take_line(pending: &mut Vec<u8>) -> Option<String> {
    while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
        let line: Vec<u8> = pending.drain(..=pos).collect();
        let text = String::from_utf8_lossy(&line).trim().to_string();
        if !text.is_empty() {
            return Some(text);
        }
    }
    None
}

//! Port abstraction for the rig's serial devices.
//!
//! Everything above this module talks to serial hardware through three seams:
//!
//! - [`Port`]: an open, exclusively owned connection (read/write with timeout).
//! - [`PortOpener`]: turns a [`SerialConfig`] into a [`Port`].
//! - [`PortEnumerator`]: lists the device identifiers currently attached.
//!
//! ```text
//! +-------------+   +------------------+   +--------------------+
//! | SerialLink  |   | FlashOrchestrator|   | TestSession        |
//! |  (per role) |   |  (hot-plug poll) |   |  Controller        |
//! +------+------+   +---------+--------+   +---------+----------+
//!        |                    |                      |
//!        v                    v                      v
//!   PortOpener          PortEnumerator         PortOpener (one-shot)
//!        |                    |
//!        v                    v
//!  NativePortOpener    NativePortEnumerator     (serialport)
//! ```
//!
//! Tests substitute in-memory implementations of the same traits.

#[cfg(feature = "native")]
pub mod native;

use std::collections::BTreeSet;
use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;

/// Serial port configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyACM0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(1000),
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Serial port information.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

impl PortInfo {
    /// Port info carrying only a name.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// An open serial connection.
///
/// Reads return `ErrorKind::TimedOut` (or `WouldBlock`) when nothing arrived
/// within the configured timeout. Any other error means the connection is gone.
pub trait Port: Read + Write + Send {
    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Set the read/write timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Write all bytes and flush, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}

/// Opens connections for a link.
pub trait PortOpener: Send + Sync {
    /// Open the device described by `config`.
    fn open(&self, config: &SerialConfig) -> Result<Box<dyn Port>>;
}

/// Lists attached serial devices. A pure query with no state.
pub trait PortEnumerator: Send + Sync {
    /// List all available serial ports.
    fn list_ports(&self) -> Result<Vec<PortInfo>>;

    /// Device identifiers currently attached.
    ///
    /// Enumeration failures yield an empty set; hot-plug polling treats
    /// them as "nothing new yet".
    fn port_names(&self) -> BTreeSet<String> {
        match self.list_ports() {
            Ok(ports) => ports.into_iter().map(|p| p.name).collect(),
            Err(e) => {
                log::debug!("Failed to enumerate serial ports: {e}");
                BTreeSet::new()
            },
        }
    }
}

/// Append the line terminator when the command lacks one.
pub fn terminate_line(command: &str) -> String {
    if command.ends_with('\n') {
        command.to_string()
    } else {
        format!("{command}\n")
    }
}

/// Open `config`, write one newline-terminated line, flush and close.
///
/// Used when no link is running for a role.
pub fn send_line_once(opener: &dyn PortOpener, config: &SerialConfig, line: &str) -> Result<()> {
    let mut port = opener.open(config)?;
    port.write_all_bytes(terminate_line(line).as_bytes())?;
    log::debug!("Sent {:?} to {} (one-shot)", line.trim_end(), config.port_name);
    Ok(())
}

// Re-export the native implementation
#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator, NativePortOpener};

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory ports for tests.

    use super::{Port, PortEnumerator, PortInfo, PortOpener, SerialConfig};
    use crate::error::{Error, Result};
    use std::collections::{BTreeSet, HashMap, VecDeque};
    use std::io;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    /// What the next `read` call on a mock port does.
    #[derive(Debug, Clone)]
    pub(crate) enum ReadStep {
        Data(Vec<u8>),
        Fail,
    }

    /// Shared state of one mock device, visible to the test after the port moved into a link.
    #[derive(Debug, Default)]
    pub(crate) struct DeviceState {
        pub(crate) reads: VecDeque<ReadStep>,
        pub(crate) written: Vec<u8>,
        pub(crate) fail_writes: usize,
        pub(crate) opens: usize,
        pub(crate) fail_opens: usize,
    }

    impl DeviceState {
        pub(crate) fn written_text(&self) -> String {
            String::from_utf8_lossy(&self.written).into_owned()
        }
    }

    pub(crate) struct MockPort {
        name: String,
        baud: u32,
        state: Arc<Mutex<DeviceState>>,
    }

    impl io::Read for MockPort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let step = self.state.lock().unwrap().reads.pop_front();
            match step {
                Some(ReadStep::Data(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    if n < data.len() {
                        self.state
                            .lock()
                            .unwrap()
                            .reads
                            .push_front(ReadStep::Data(data[n..].to_vec()));
                    }
                    Ok(n)
                },
                Some(ReadStep::Fail) => Err(io::Error::new(io::ErrorKind::BrokenPipe, "unplugged")),
                None => {
                    std::thread::sleep(Duration::from_millis(1));
                    Err(io::Error::new(io::ErrorKind::TimedOut, "timed out"))
                },
            }
        }
    }

    impl io::Write for MockPort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut state = self.state.lock().unwrap();
            if state.fail_writes > 0 {
                state.fail_writes -= 1;
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "write failed"));
            }
            state.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Port for MockPort {
        fn name(&self) -> &str {
            &self.name
        }

        fn baud_rate(&self) -> u32 {
            self.baud
        }

        fn set_timeout(&mut self, _timeout: Duration) -> Result<()> {
            Ok(())
        }
    }

    /// Opener over a set of named mock devices. Unknown names fail to open.
    #[derive(Default, Clone)]
    pub(crate) struct MockOpener {
        devices: Arc<Mutex<HashMap<String, Arc<Mutex<DeviceState>>>>>,
    }

    impl MockOpener {
        pub(crate) fn device(&self, name: &str) -> Arc<Mutex<DeviceState>> {
            self.devices
                .lock()
                .unwrap()
                .entry(name.to_string())
                .or_default()
                .clone()
        }

        pub(crate) fn push_line(&self, name: &str, line: &str) {
            self.device(name)
                .lock()
                .unwrap()
                .reads
                .push_back(ReadStep::Data(format!("{line}\r\n").into_bytes()));
        }

        pub(crate) fn written(&self, name: &str) -> String {
            self.device(name).lock().unwrap().written_text()
        }
    }

    impl PortOpener for MockOpener {
        fn open(&self, config: &SerialConfig) -> Result<Box<dyn Port>> {
            let state = self
                .devices
                .lock()
                .unwrap()
                .get(&config.port_name)
                .cloned()
                .ok_or_else(|| Error::PortUnavailable {
                    port: config.port_name.clone(),
                    reason: "no such device".into(),
                })?;
            {
                let mut s = state.lock().unwrap();
                if s.fail_opens > 0 {
                    s.fail_opens -= 1;
                    return Err(Error::PortUnavailable {
                        port: config.port_name.clone(),
                        reason: "busy".into(),
                    });
                }
                s.opens += 1;
            }
            Ok(Box::new(MockPort {
                name: config.port_name.clone(),
                baud: config.baud_rate,
                state,
            }))
        }
    }

    /// Enumerator returning a scripted sequence of port sets; the last one repeats.
    #[derive(Clone)]
    pub(crate) struct ScriptedEnumerator {
        script: Arc<Mutex<VecDeque<BTreeSet<String>>>>,
        pub(crate) calls: Arc<Mutex<usize>>,
    }

    impl ScriptedEnumerator {
        pub(crate) fn new(steps: &[&[&str]]) -> Self {
            Self {
                script: Arc::new(Mutex::new(
                    steps
                        .iter()
                        .map(|s| s.iter().map(|p| (*p).to_string()).collect())
                        .collect(),
                )),
                calls: Arc::new(Mutex::new(0)),
            }
        }
    }

    impl PortEnumerator for ScriptedEnumerator {
        fn list_ports(&self) -> Result<Vec<PortInfo>> {
            *self.calls.lock().unwrap() += 1;
            let mut script = self.script.lock().unwrap();
            let current = if script.len() > 1 {
                script.pop_front().unwrap_or_default()
            } else {
                script.front().cloned().unwrap_or_default()
            };
            Ok(current.into_iter().map(PortInfo::named).collect())
        }
    }
}

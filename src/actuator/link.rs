//! Byte transports for the servo protocol.

use serde::Deserialize;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::protocol::{classify_ack, Ack, DEFAULT_BAUD};
use super::ActuatorError;

/// A channel that can carry servo frames.
pub trait ServoLink: Send {
    fn describe(&self) -> String;

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;

    /// Read whatever reply arrives within `timeout`; an empty buffer means none did.
    fn read_reply(&mut self, timeout: Duration) -> io::Result<Vec<u8>>;

    fn reopen(&mut self) -> io::Result<()>;

    fn is_simulated(&self) -> bool {
        false
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SerialSettings {
    pub port: String,
    pub baud: u32,
    pub ack_timeout_ms: u64,
    /// Skip the port entirely and drive a simulated arm.
    pub simulate: bool,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud: DEFAULT_BAUD,
            ack_timeout_ms: 50,
            simulate: false,
        }
    }
}

// ----------------------------------------------------------------------------
// Simulated link
// ----------------------------------------------------------------------------

/// Frames written to a [`SimulatedLink`], shared with observers.
#[derive(Clone, Debug, Default)]
pub struct SentFrames(Arc<Mutex<Vec<String>>>);

impl SentFrames {
    pub fn all(&self) -> Vec<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn last(&self) -> Option<String> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn push(&self, frame: String) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame);
    }
}

/// In-memory arm that records frames and acknowledges each one.
pub struct SimulatedLink {
    sent: SentFrames,
    pending_ack: bool,
    acknowledge: bool,
    failing_writes: Arc<AtomicUsize>,
    reopens: Arc<AtomicUsize>,
}

impl SimulatedLink {
    pub fn new() -> Self {
        Self {
            sent: SentFrames::default(),
            pending_ack: false,
            acknowledge: true,
            failing_writes: Arc::new(AtomicUsize::new(0)),
            reopens: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A link that never acknowledges.
    pub fn silent() -> Self {
        Self {
            acknowledge: false,
            ..Self::new()
        }
    }

    pub fn sent(&self) -> SentFrames {
        self.sent.clone()
    }

    /// Make the next `n` writes fail with `BrokenPipe`.
    pub fn fail_next_writes(&self, n: usize) -> Arc<AtomicUsize> {
        self.failing_writes.store(n, Ordering::SeqCst);
        self.failing_writes.clone()
    }

    pub fn reopen_count(&self) -> Arc<AtomicUsize> {
        self.reopens.clone()
    }
}

impl Default for SimulatedLink {
    fn default() -> Self {
        Self::new()
    }
}

impl ServoLink for SimulatedLink {
    fn describe(&self) -> String {
        "simulated".to_string()
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let failing = self.failing_writes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_writes.store(failing - 1, Ordering::SeqCst);
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated link write failure",
            ));
        }
        self.sent.push(String::from_utf8_lossy(frame).into_owned());
        self.pending_ack = self.acknowledge;
        Ok(())
    }

    fn read_reply(&mut self, _timeout: Duration) -> io::Result<Vec<u8>> {
        if std::mem::take(&mut self.pending_ack) {
            Ok(b"K".to_vec())
        } else {
            Ok(Vec::new())
        }
    }

    fn reopen(&mut self) -> io::Result<()> {
        self.reopens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_simulated(&self) -> bool {
        true
    }
}

// ----------------------------------------------------------------------------
// Hardware serial link
// ----------------------------------------------------------------------------

#[cfg(feature = "serial-hardware")]
pub struct SerialPortLink {
    port_name: String,
    baud: u32,
    port: Box<dyn serialport::SerialPort>,
}

#[cfg(feature = "serial-hardware")]
impl SerialPortLink {
    pub fn open(port_name: &str, baud: u32) -> io::Result<Self> {
        let port = Self::open_port(port_name, baud)?;
        log::info!("SerialPortLink: opened {} @ {} bps", port_name, baud);
        Ok(Self {
            port_name: port_name.to_string(),
            baud,
            port,
        })
    }

    fn open_port(port_name: &str, baud: u32) -> io::Result<Box<dyn serialport::SerialPort>> {
        serialport::new(port_name, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(io::Error::from)
    }
}

#[cfg(feature = "serial-hardware")]
impl ServoLink for SerialPortLink {
    fn describe(&self) -> String {
        format!("{} @ {}", self.port_name, self.baud)
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        use std::io::Write;
        self.port.write_all(frame)?;
        self.port.flush()
    }

    fn read_reply(&mut self, timeout: Duration) -> io::Result<Vec<u8>> {
        use std::io::Read;
        self.port.set_timeout(timeout).map_err(io::Error::from)?;
        let mut buf = [0u8; 32];
        match self.port.read(&mut buf) {
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    fn reopen(&mut self) -> io::Result<()> {
        self.port = Self::open_port(&self.port_name, self.baud)?;
        log::info!("SerialPortLink: reopened {}", self.port_name);
        Ok(())
    }
}

/// Open the configured serial port.
#[cfg(feature = "serial-hardware")]
pub fn open_serial(settings: &SerialSettings) -> Result<Box<dyn ServoLink>, ActuatorError> {
    SerialPortLink::open(&settings.port, settings.baud)
        .map(|link| Box::new(link) as Box<dyn ServoLink>)
        .map_err(|err| ActuatorError::Connection {
            port: settings.port.clone(),
            reason: err.to_string(),
        })
}

#[cfg(not(feature = "serial-hardware"))]
pub fn open_serial(settings: &SerialSettings) -> Result<Box<dyn ServoLink>, ActuatorError> {
    Err(ActuatorError::Connection {
        port: settings.port.clone(),
        reason: "built without the serial-hardware feature".to_string(),
    })
}

// ----------------------------------------------------------------------------
// Connection handle
// ----------------------------------------------------------------------------

/// Exclusive owner of the servo link.
pub struct ConnectionHandle {
    link: Box<dyn ServoLink>,
    ack_timeout: Duration,
    unacknowledged: u64,
}

impl ConnectionHandle {
    pub fn new(link: Box<dyn ServoLink>, ack_timeout: Duration) -> Self {
        Self {
            link,
            ack_timeout,
            unacknowledged: 0,
        }
    }

    pub fn describe(&self) -> String {
        self.link.describe()
    }

    pub fn is_simulated(&self) -> bool {
        self.link.is_simulated()
    }

    /// Commands sent without a clean acknowledgement.
    pub fn unacknowledged(&self) -> u64 {
        self.unacknowledged
    }

    /// Write one frame. A failed write triggers a single reopen and retry; the
    /// acknowledgement is read once with a short timeout and only logged.
    pub fn send(&mut self, frame: &str) -> Result<Ack, ActuatorError> {
        if let Err(first) = self.link.write_frame(frame.as_bytes()) {
            log::warn!(
                "ConnectionHandle: write to {} failed ({}), reopening",
                self.link.describe(),
                first
            );
            self.link.reopen()?;
            self.link.write_frame(frame.as_bytes())?;
        }

        let ack = match self.link.read_reply(self.ack_timeout) {
            Ok(reply) => classify_ack(&reply),
            Err(err) => Ack::Garbled(err.to_string()),
        };
        match &ack {
            Ack::Received => {}
            Ack::Missing => {
                self.unacknowledged += 1;
                log::warn!(
                    "ConnectionHandle: no ack for {} within {:?}",
                    frame,
                    self.ack_timeout
                );
            }
            Ack::Garbled(reply) => {
                self.unacknowledged += 1;
                log::warn!("ConnectionHandle: garbled ack for {}: {:?}", frame, reply);
            }
        }
        Ok(ack)
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        log::debug!("ConnectionHandle: closing {}", self.link.describe());
    }
}

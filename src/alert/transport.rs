//! Command/response plumbing for the cellular modem.

use std::io::{Read, Write};
use std::time::Duration;

use log::{debug, info, warn};
use serialport::SerialPort;
use thiserror::Error;

use crate::alert::reconnect::ReconnectState;
use crate::clock::Clock;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("modem port unavailable")]
    Unavailable,

    #[error("failed to open serial port {port}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("serial port error")]
    Serial(#[from] serialport::Error),

    #[error("serial I/O error")]
    Io(#[from] std::io::Error),
}

/// Line-oriented byte channel to the modem.
pub trait Transport {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Whatever bytes arrived since the last read. Never blocks waiting for more.
    fn read_available(&mut self) -> Result<Vec<u8>, TransportError>;

    fn is_connected(&self) -> bool {
        true
    }

    /// Short human-readable link state for status reports.
    fn link_status(&self) -> String {
        if self.is_connected() {
            "connected".to_string()
        } else {
            "unavailable".to_string()
        }
    }
}

pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    pub fn open(path: &str, baud_rate: u32) -> Result<Self, TransportError> {
        let port = serialport::new(path, baud_rate)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|source| TransportError::Open {
                port: path.to_string(),
                source,
            })?;
        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.port.write_all(data)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_available(&mut self) -> Result<Vec<u8>, TransportError> {
        let pending = self.port.bytes_to_read()? as usize;
        if pending == 0 {
            return Ok(Vec::new());
        }
        let mut buf = vec![0u8; pending];
        let n = self.port.read(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

pub type Opener<T> = Box<dyn FnMut() -> Result<T, TransportError>>;

/// Modem handle that survives a missing or unplugged port.
///
/// While the port is closed every send fails fast with `Unavailable`; reopening is
/// attempted on later sends with exponential backoff.
pub struct ModemLink<T: Transport, C: Clock> {
    opener: Opener<T>,
    port: Option<T>,
    reconnect: ReconnectState,
    clock: C,
}

impl<T: Transport, C: Clock> ModemLink<T, C> {
    /// Try to open the port once. A failure leaves the link in detection-only mode.
    pub fn connect(mut opener: Opener<T>, clock: C) -> Self {
        let mut reconnect = ReconnectState::new("Modem", 2.0, 30.0);
        let now = clock.now();
        let port = match opener() {
            Ok(port) => {
                info!("[MODEM] port opened");
                Some(port)
            }
            Err(e) => {
                warn!("[MODEM] {} - running in detection-only mode", e);
                reconnect.record_failed_attempt(now);
                None
            }
        };
        Self {
            opener,
            port,
            reconnect,
            clock,
        }
    }

    pub fn is_available(&self) -> bool {
        self.port.is_some()
    }

    pub fn reconnect_state(&self) -> &ReconnectState {
        &self.reconnect
    }

    fn ensure_open(&mut self) -> Result<&mut T, TransportError> {
        if self.port.is_none() {
            let now = self.clock.now();
            if !self.reconnect.can_retry(now) {
                return Err(TransportError::Unavailable);
            }
            match (self.opener)() {
                Ok(port) => {
                    self.reconnect.record_success();
                    self.port = Some(port);
                }
                Err(e) => {
                    debug!("[MODEM] reopen failed: {}", e);
                    self.reconnect.record_failed_attempt(now);
                    return Err(TransportError::Unavailable);
                }
            }
        }
        self.port.as_mut().ok_or(TransportError::Unavailable)
    }

    fn drop_port(&mut self) {
        if self.port.take().is_some() {
            warn!("[MODEM] port lost, will retry");
            self.reconnect.record_failed_attempt(self.clock.now());
        }
    }
}

impl<T: Transport, C: Clock> Transport for ModemLink<T, C> {
    fn is_connected(&self) -> bool {
        self.is_available()
    }

    fn link_status(&self) -> String {
        self.reconnect.status(self.clock.now(), self.is_available())
    }

    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let result = self.ensure_open()?.send(data);
        if result.is_err() {
            self.drop_port();
        }
        result
    }

    fn read_available(&mut self) -> Result<Vec<u8>, TransportError> {
        let result = self.ensure_open()?.read_available();
        if result.is_err() {
            self.drop_port();
        }
        result
    }
}

/// Answers like a cooperative modem without touching hardware.
#[derive(Debug, Default)]
pub struct DryRunTransport {
    pending: Vec<u8>,
    sent: Vec<String>,
}

impl DryRunTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> &[String] {
        &self.sent
    }
}

impl Transport for DryRunTransport {
    fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let text = String::from_utf8_lossy(data).to_string();
        let reply = if text.starts_with("AT+CMGS") {
            "> "
        } else if data == [0x1A] {
            "+CMGS: 0\r\nOK"
        } else if text.ends_with("\r\n") {
            "OK"
        } else {
            ""
        };
        debug!("[MODEM] (dry run) > {}", text.trim());
        self.pending.extend_from_slice(reply.as_bytes());
        self.sent.push(text);
        Ok(())
    }

    fn read_available(&mut self) -> Result<Vec<u8>, TransportError> {
        Ok(std::mem::take(&mut self.pending))
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct CommandOutcome {
    pub ok: bool,
    pub response: String,
    /// Set when the transport itself failed, as opposed to an unexpected reply.
    pub error: Option<String>,
}

/// Synchronous AT command client: write, wait a fixed window, read, look for a substring.
pub struct AtClient<T: Transport, C: Clock> {
    transport: T,
    clock: C,
}

impl<T: Transport, C: Clock> AtClient<T, C> {
    pub fn new(transport: T, clock: C) -> Self {
        Self { transport, clock }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Send `command` terminated by CRLF and check the reply after `wait`.
    pub fn command(&mut self, command: &str, expect: &str, wait: Duration) -> CommandOutcome {
        debug!("[MODEM] > {}", command);
        let line = format!("{}\r\n", command);
        if let Err(e) = self.transport.send(line.as_bytes()) {
            return CommandOutcome {
                ok: false,
                response: String::new(),
                error: Some(e.to_string()),
            };
        }
        self.expect_response(expect, wait)
    }

    /// Write raw bytes with no terminator (SMS body, Ctrl-Z).
    pub fn write_raw(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.transport.send(data)
    }

    /// Wait `wait`, then read whatever arrived and look for `expect`.
    pub fn expect_response(&mut self, expect: &str, wait: Duration) -> CommandOutcome {
        self.clock.sleep(wait);
        match self.transport.read_available() {
            Ok(bytes) => {
                let response = String::from_utf8_lossy(&bytes).trim().to_string();
                debug!("[MODEM] < {}", response);
                CommandOutcome {
                    ok: response.contains(expect),
                    response,
                    error: None,
                }
            }
            Err(e) => CommandOutcome {
                ok: false,
                response: String::new(),
                error: Some(e.to_string()),
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    use super::{Transport, TransportError};
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Fake modem: answers each command by prefix and records everything written.
    #[derive(Clone, Default)]
    pub struct ScriptedTransport {
        inner: Rc<RefCell<Inner>>,
    }

    #[derive(Default)]
    struct Inner {
        replies: Vec<(String, String)>,
        pending: Vec<u8>,
        sent: Vec<String>,
        fail_sends: bool,
    }

    impl ScriptedTransport {
        /// Replies with `reply` to any write starting with `prefix`.
        pub fn reply(self, prefix: &str, reply: &str) -> Self {
            self.inner
                .borrow_mut()
                .replies
                .push((prefix.to_string(), reply.to_string()));
            self
        }

        /// A modem that accepts every step of the SMS and call sequences.
        pub fn cooperative() -> Self {
            Self::default()
                .reply("AT+CMGF", "OK")
                .reply("AT+CMGS", "> ")
                .reply("\u{1a}", "+CMGS: 12\r\nOK")
                .reply("ATD", "OK")
                .reply("AT+VTS", "OK")
                .reply("ATH", "OK")
                .reply("AT\r\n", "OK")
        }

        pub fn failing() -> Self {
            let t = Self::default();
            t.inner.borrow_mut().fail_sends = true;
            t
        }

        pub fn sent(&self) -> Vec<String> {
            self.inner.borrow().sent.clone()
        }

        pub fn count(&self, prefix: &str) -> usize {
            self.inner
                .borrow()
                .sent
                .iter()
                .filter(|s| s.starts_with(prefix))
                .count()
        }
    }

    impl Transport for ScriptedTransport {
        fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
            let mut inner = self.inner.borrow_mut();
            if inner.fail_sends {
                return Err(TransportError::Unavailable);
            }
            let text = String::from_utf8_lossy(data).to_string();
            let reply = inner
                .replies
                .iter()
                .find(|(prefix, _)| text.starts_with(prefix.as_str()))
                .map(|(_, reply)| reply.clone());
            if let Some(reply) = reply {
                inner.pending.extend_from_slice(reply.as_bytes());
            }
            inner.sent.push(text);
            Ok(())
        }

        fn read_available(&mut self) -> Result<Vec<u8>, TransportError> {
            let mut inner = self.inner.borrow_mut();
            if inner.fail_sends {
                return Err(TransportError::Unavailable);
            }
            Ok(std::mem::take(&mut inner.pending))
        }
    }
}

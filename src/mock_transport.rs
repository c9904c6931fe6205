//! We use this mocking module in unit tests to stand in for a serial port.

use std::collections::VecDeque;

use crate::error::{PswError, Result};
use crate::transport::{SerialSettings, Transport};

/// Records every line written and replays scripted reply lines.
#[derive(Default)]
pub struct MockTransport {
    open: bool,
    /// Port passed to the last successful `open`.
    port: Option<String>,
    settings: Option<SerialSettings>,
    /// Lines written, without the terminator.
    written: Vec<String>,
    /// Replies handed out by `receive_line`; empty once exhausted.
    replies: VecDeque<String>,
    fail_open: bool,
    fail_writes: bool,
    fail_reads: bool,
    /// When set, a query is answered with the argument last written for the
    /// same header, like an instrument reading back a setting.
    echo_levels: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport that reports open without a real `open` call.
    pub fn connected() -> Self {
        Self {
            open: true,
            port: Some("mock".to_string()),
            ..Self::default()
        }
    }

    pub fn push_reply(&mut self, reply: &str) {
        self.replies.push_back(reply.to_string());
    }

    pub fn written(&self) -> &[String] {
        &self.written
    }

    pub fn last_written(&self) -> Option<&str> {
        self.written.last().map(String::as_str)
    }

    pub fn clear_written(&mut self) {
        self.written.clear();
    }

    pub fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }

    pub fn settings(&self) -> Option<SerialSettings> {
        self.settings
    }

    pub fn set_fail_open(&mut self, fail: bool) {
        self.fail_open = fail;
    }

    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    pub fn set_fail_reads(&mut self, fail: bool) {
        self.fail_reads = fail;
    }

    pub fn set_echo_levels(&mut self, echo: bool) {
        self.echo_levels = echo;
    }

    /// For a pending `<header>?` query, the argument of the last `<header> <x>`
    /// command that was written.
    fn echoed_level(&self) -> Option<String> {
        let header = self.written.last()?.strip_suffix('?')?;
        self.written
            .iter()
            .rev()
            .filter_map(|line| line.strip_prefix(header)?.strip_prefix(' '))
            .next()
            .map(str::to_string)
    }
}

impl Transport for MockTransport {
    fn open(&mut self, port: &str, settings: &SerialSettings) -> Result<()> {
        if self.fail_open {
            return Err(PswError::Connection {
                port: port.to_string(),
                source: tokio_serial::Error::new(
                    tokio_serial::ErrorKind::NoDevice,
                    "simulated missing device",
                ),
            });
        }
        self.open = true;
        self.port = Some(port.to_string());
        self.settings = Some(*settings);
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn send_line(&mut self, text: &str) -> Result<()> {
        if !self.open {
            return Err(PswError::NotConnected);
        }
        if self.fail_writes {
            return Err(PswError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "simulated write fault",
            )));
        }
        self.written.push(text.to_string());
        Ok(())
    }

    async fn receive_line(&mut self) -> Result<String> {
        if !self.open {
            return Err(PswError::NotConnected);
        }
        if self.fail_reads {
            return Err(PswError::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "simulated read fault",
            )));
        }
        if self.echo_levels {
            if let Some(level) = self.echoed_level() {
                return Ok(level);
            }
        }
        // An exhausted script behaves like a read timeout with nothing received.
        Ok(self.replies.pop_front().unwrap_or_default())
    }
}

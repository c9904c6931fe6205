//! Line-oriented serial transport.
//!
//! The instrument speaks ASCII SCPI, one command per line terminated by CR+LF,
//! and answers a query with at most one line. [`Transport`] is the seam the
//! controller talks through; [`SerialTransport`] is the real implementation on
//! top of `tokio-serial`.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::debug;

use crate::error::{PswError, Result};

pub const DEFAULT_BAUD_RATE: u32 = 9600;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

const LINE_TERMINATOR: &[u8] = b"\r\n";
const READ_CHUNK: usize = 64;

/// Parameters fixed when a connection is opened. Framing is always 8-N-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud_rate: u32,
    /// Per-read timeout for [`Transport::receive_line`].
    pub timeout: Duration,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl SerialSettings {
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// A byte link carrying one text line per command or reply.
///
/// Implementations hold no instrument state beyond the open connection. At most
/// one connection is open at a time; opening again replaces the previous one.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Open `port` with the given settings, failing with
    /// [`PswError::Connection`] if the port cannot be opened.
    fn open(&mut self, port: &str, settings: &SerialSettings) -> Result<()>;

    /// Release the connection. Safe to call when already closed.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Write `text` followed by CR+LF.
    async fn send_line(&mut self, text: &str) -> Result<()>;

    /// Read one line, or whatever arrived before the read timeout expired.
    ///
    /// A timeout with nothing received yields an empty string rather than an
    /// error; callers decide what "no response" means for their query.
    async fn receive_line(&mut self) -> Result<String>;
}

/// [`Transport`] over a native serial port (USB-CDC or RS-232).
#[derive(Default)]
pub struct SerialTransport {
    port_name: Option<String>,
    stream: Option<SerialStream>,
    timeout: Duration,
    /// Bytes read past the end of the last returned line.
    pending: Vec<u8>,
}

impl SerialTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Port identifier of the open connection, if any.
    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }
}

impl Transport for SerialTransport {
    fn open(&mut self, port: &str, settings: &SerialSettings) -> Result<()> {
        self.close();

        let stream = tokio_serial::new(port, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(settings.timeout)
            .open_native_async()
            .map_err(|source| PswError::Connection {
                port: port.to_string(),
                source,
            })?;

        debug!("serial port {port} opened at {} baud, 8N1", settings.baud_rate);
        self.stream = Some(stream);
        self.port_name = Some(port.to_string());
        self.timeout = settings.timeout;
        Ok(())
    }

    fn close(&mut self) {
        if self.stream.take().is_some() {
            debug!(
                "serial port {} closed",
                self.port_name.as_deref().unwrap_or("?")
            );
        }
        self.port_name = None;
        self.pending.clear();
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn send_line(&mut self, text: &str) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(PswError::NotConnected)?;
        stream.write_all(&encode_line(text)).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn receive_line(&mut self) -> Result<String> {
        let stream = self.stream.as_mut().ok_or(PswError::NotConnected)?;
        let pending = &mut self.pending;

        match tokio::time::timeout(self.timeout, fill_line(stream, pending)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => debug!("serial read timed out after {:?}", self.timeout),
        }

        Ok(take_line(&mut self.pending))
    }
}

/// Append the CR+LF terminator to a command.
pub fn encode_line(text: &str) -> Vec<u8> {
    let mut line = Vec::with_capacity(text.len() + LINE_TERMINATOR.len());
    line.extend_from_slice(text.as_bytes());
    line.extend_from_slice(LINE_TERMINATOR);
    line
}

/// Decode a received line: non-ASCII bytes are dropped and trailing whitespace
/// (including NUL padding) is stripped.
pub fn decode_line(bytes: &[u8]) -> String {
    let text: String = bytes
        .iter()
        .filter(|b| b.is_ascii())
        .map(|&b| char::from(b))
        .collect();
    text.trim_end_matches(|c: char| c.is_ascii_whitespace() || c == '\0')
        .to_string()
}

/// Read from `reader` into `pending` until it holds a full line or the reader
/// reports end of stream.
async fn fill_line<R: AsyncRead + Unpin>(
    reader: &mut R,
    pending: &mut Vec<u8>,
) -> std::io::Result<()> {
    let mut chunk = [0u8; READ_CHUNK];
    while !pending.contains(&b'\n') {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&chunk[..n]);
    }
    Ok(())
}

/// Split the first line off `pending`, or take everything if no terminator
/// has arrived yet.
fn take_line(pending: &mut Vec<u8>) -> String {
    let line: Vec<u8> = match pending.iter().position(|&b| b == b'\n') {
        Some(end) => pending.drain(..=end).collect(),
        None => std::mem::take(pending),
    };
    decode_line(&line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_appends_crlf() {
        assert_eq!(encode_line("*IDN?"), b"*IDN?\r\n".to_vec());
        assert_eq!(encode_line(""), b"\r\n".to_vec());
    }

    #[test]
    fn decode_strips_trailing_whitespace_only() {
        assert_eq!(decode_line(b"  12.3400,0.5000\r\n"), "  12.3400,0.5000");
        assert_eq!(decode_line(b"GW-INSTEK,PSW\0\0"), "GW-INSTEK,PSW");
        assert_eq!(decode_line(b""), "");
    }

    #[test]
    fn decode_drops_non_ascii_bytes() {
        assert_eq!(decode_line(&[b'3', 0xff, 0xfe, b'\r', b'\n']), "3");
    }

    #[test]
    fn take_line_keeps_bytes_after_terminator() {
        let mut pending = b"12.3400,0.5000\r\n+3\r\n".to_vec();
        assert_eq!(take_line(&mut pending), "12.3400,0.5000");
        assert_eq!(pending, b"+3\r\n".to_vec());
        assert_eq!(take_line(&mut pending), "+3");
        assert!(pending.is_empty());
        assert_eq!(take_line(&mut pending), "");
    }

    #[test]
    fn take_line_returns_partial_data_without_terminator() {
        let mut pending = b"12.34".to_vec();
        assert_eq!(take_line(&mut pending), "12.34");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn fill_line_stops_at_first_terminator_or_eof() {
        let mut reader: &[u8] = b"GW-INSTEK,PSW-3036\r\n";
        let mut pending = Vec::new();
        fill_line(&mut reader, &mut pending).await.unwrap();
        assert_eq!(take_line(&mut pending), "GW-INSTEK,PSW-3036");

        let mut reader: &[u8] = b"no terminator";
        fill_line(&mut reader, &mut pending).await.unwrap();
        assert_eq!(take_line(&mut pending), "no terminator");
    }

    #[tokio::test]
    async fn fill_line_skips_reading_when_a_line_is_pending() {
        let mut reader: &[u8] = b"unread";
        let mut pending = b"0\r\n".to_vec();
        fill_line(&mut reader, &mut pending).await.unwrap();
        assert_eq!(reader, b"unread");
        assert_eq!(take_line(&mut pending), "0");
    }

    #[test]
    fn default_settings_match_instrument_defaults() {
        let settings = SerialSettings::default();
        assert_eq!(settings.baud_rate, 9600);
        assert_eq!(settings.timeout, Duration::from_secs(1));

        let tuned = settings
            .with_baud_rate(115_200)
            .with_timeout(Duration::from_millis(250));
        assert_eq!(tuned.baud_rate, 115_200);
        assert_eq!(tuned.timeout, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn closed_serial_transport_rejects_io() {
        let mut transport = SerialTransport::new();
        assert!(!transport.is_open());
        transport.close();
        assert!(matches!(
            transport.send_line("*IDN?").await,
            Err(PswError::NotConnected)
        ));
        assert!(matches!(
            transport.receive_line().await,
            Err(PswError::NotConnected)
        ));
        assert_eq!(transport.port_name(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn serial_read_timeout_returns_what_arrived() {
        let (local, mut remote) = SerialStream::pair().unwrap();
        let mut transport = SerialTransport {
            port_name: Some("pty".to_string()),
            stream: Some(local),
            timeout: Duration::from_millis(200),
            pending: Vec::new(),
        };

        // Nothing on the wire: the timeout yields an empty line, not an error.
        assert_eq!(transport.receive_line().await.unwrap(), "");

        remote.write_all(b"12.34").await.unwrap();
        assert_eq!(transport.receive_line().await.unwrap(), "12.34");

        remote.write_all(b",0.5000\r\n3\r\n").await.unwrap();
        assert_eq!(transport.receive_line().await.unwrap(), ",0.5000");
        assert_eq!(transport.receive_line().await.unwrap(), "3");

        transport.send_line("*IDN?").await.unwrap();
        let mut wire = [0u8; 7];
        remote.read_exact(&mut wire).await.unwrap();
        assert_eq!(&wire, b"*IDN?\r\n");
    }
}

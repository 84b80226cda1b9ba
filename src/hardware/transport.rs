//! Byte-level instrument I/O.
//!
//! Every driver in [`crate::hardware`] talks to its instrument through an
//! [`InstrumentTransport`]: a line-oriented command/response channel. Concrete
//! transports wrap a TCP socket, an RS-232 port (feature `instrument_serial`) or an
//! addressed device on a Prologix GPIB bus (see [`crate::hardware::prologix`]).
//!
//! Tests use [`StreamTransport::new`] over one end of a `tokio::io::duplex` pipe.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{AppResult, DaqError};
use crate::error_recovery::timeout_error;

/// How long stale bytes are drained after a timed-out exchange.
const STALE_DRAIN_WINDOW: Duration = Duration::from_millis(20);

/// Object-safe byte stream an instrument can be reached through.
pub trait InstrumentIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> InstrumentIo for T {}

/// Type-erased instrument stream.
pub type DynStream = Box<dyn InstrumentIo>;

/// Where an instrument lives, in VISA resource-string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ResourceAddress {
    /// `GPIB<board>::<address>::INSTR`
    Gpib {
        /// Interface board number
        board: u32,
        /// Primary address (0..=30)
        address: u8,
    },
    /// `TCPIP<board>::<host>::<port>::SOCKET`
    TcpSocket {
        /// Interface board number
        board: u32,
        /// Host name or IP address
        host: String,
        /// TCP port
        port: u16,
    },
    /// `ASRL<port>::INSTR`
    Serial {
        /// OS device name, e.g. `/dev/ttyUSB0` or `COM3`
        port: String,
    },
}

impl ResourceAddress {
    /// Short name of the interface type.
    pub fn interface(&self) -> &'static str {
        match self {
            ResourceAddress::Gpib { .. } => "gpib",
            ResourceAddress::TcpSocket { .. } => "tcp",
            ResourceAddress::Serial { .. } => "serial",
        }
    }
}

fn invalid_resource(s: &str, why: &str) -> DaqError {
    DaqError::Configuration(format!("Invalid resource string '{}': {}", s, why))
}

fn board_number(s: &str, prefix_len: usize, original: &str) -> AppResult<u32> {
    let digits = &s[prefix_len..];
    if digits.is_empty() {
        return Ok(0);
    }
    digits
        .parse()
        .map_err(|_| invalid_resource(original, "bad board number"))
}

impl FromStr for ResourceAddress {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parts: Vec<&str> = trimmed.split("::").collect();
        let head = parts[0].to_ascii_uppercase();
        let suffix = parts.last().map(|p| p.to_ascii_uppercase());

        if head.starts_with("GPIB") {
            if parts.len() != 3 || suffix.as_deref() != Some("INSTR") {
                return Err(invalid_resource(s, "expected GPIB<board>::<address>::INSTR"));
            }
            let board = board_number(&head, 4, s)?;
            let address: u8 = parts[1]
                .parse()
                .map_err(|_| invalid_resource(s, "bad GPIB address"))?;
            if address > 30 {
                return Err(invalid_resource(s, "GPIB address must be 0..=30"));
            }
            return Ok(ResourceAddress::Gpib { board, address });
        }

        if head.starts_with("TCPIP") {
            if parts.len() != 4 || suffix.as_deref() != Some("SOCKET") {
                return Err(invalid_resource(
                    s,
                    "expected TCPIP<board>::<host>::<port>::SOCKET",
                ));
            }
            let board = board_number(&head, 5, s)?;
            if parts[1].is_empty() {
                return Err(invalid_resource(s, "missing host"));
            }
            let port: u16 = parts[2]
                .parse()
                .map_err(|_| invalid_resource(s, "bad TCP port"))?;
            return Ok(ResourceAddress::TcpSocket {
                board,
                host: parts[1].to_string(),
                port,
            });
        }

        if head.starts_with("ASRL") {
            if parts.len() != 2 || suffix.as_deref() != Some("INSTR") {
                return Err(invalid_resource(s, "expected ASRL<port>::INSTR"));
            }
            // Keep the original case: device paths are case sensitive.
            let port = &parts[0][4..];
            if port.is_empty() {
                return Err(invalid_resource(s, "missing serial port"));
            }
            return Ok(ResourceAddress::Serial {
                port: port.to_string(),
            });
        }

        Err(invalid_resource(s, "unsupported interface type"))
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceAddress::Gpib { board, address } => write!(f, "GPIB{}::{}::INSTR", board, address),
            ResourceAddress::TcpSocket { board, host, port } => {
                write!(f, "TCPIP{}::{}::{}::SOCKET", board, host, port)
            }
            ResourceAddress::Serial { port } => write!(f, "ASRL{}::INSTR", port),
        }
    }
}

impl TryFrom<String> for ResourceAddress {
    type Error = DaqError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceAddress> for String {
    fn from(value: ResourceAddress) -> Self {
        value.to_string()
    }
}

/// Serial parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Serial flow control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    /// No flow control
    None,
    /// XON/XOFF
    Software,
    /// RTS/CTS
    Hardware,
}

/// RS-232 line settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5..=8)
    pub data_bits: u8,
    /// Parity
    pub parity: Parity,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// Flow control
    pub flow_control: FlowControl,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            flow_control: FlowControl::None,
        }
    }
}

/// Framing and timing of one transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    /// Longest a single exchange may take
    pub timeout: Duration,
    /// Appended to every command
    pub write_terminator: String,
    /// Marks the end of every response
    pub read_terminator: String,
    /// Reject responses that do not end with the whole `read_terminator`
    pub strict_termination: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            write_terminator: "\n".to_string(),
            read_terminator: "\n".to_string(),
            strict_termination: false,
        }
    }
}

impl TransportOptions {
    /// Set the exchange timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Use the same terminator for commands and responses.
    pub fn with_terminator(mut self, terminator: &str) -> Self {
        self.write_terminator = terminator.to_string();
        self.read_terminator = terminator.to_string();
        self
    }

    /// Require complete response terminators.
    pub fn strict(mut self) -> Self {
        self.strict_termination = true;
        self
    }
}

/// Line-oriented command channel to one instrument.
///
/// Implementations serialise access internally, so a transport can be shared
/// between tasks behind an `Arc`.
#[async_trait]
pub trait InstrumentTransport: Send + Sync {
    /// Send a command that produces no response.
    async fn write(&self, command: &str) -> AppResult<()>;

    /// Send a command and return its response with the terminator removed.
    async fn query(&self, command: &str) -> AppResult<String>;

    /// Human readable description of the endpoint, for logs.
    fn describe(&self) -> String;
}

/// Send `command` followed by exactly one `terminator`.
pub(crate) async fn write_command<W>(writer: &mut W, command: &str, terminator: &str) -> AppResult<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let body = command.trim_end_matches(['\r', '\n']);
    let mut line = Vec::with_capacity(body.len() + terminator.len());
    line.extend_from_slice(body.as_bytes());
    line.extend_from_slice(terminator.as_bytes());
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one response terminated by `terminator`.
pub(crate) async fn read_response<R>(
    reader: &mut R,
    command: &str,
    terminator: &str,
    strict: bool,
) -> AppResult<String>
where
    R: AsyncBufRead + Unpin + ?Sized,
{
    let delimiter = terminator.as_bytes().last().copied().unwrap_or(b'\n');
    let mut buf = Vec::new();
    let n = reader.read_until(delimiter, &mut buf).await?;
    if n == 0 {
        return Err(DaqError::Instrument(format!(
            "Connection closed while waiting for response to '{}'",
            command
        )));
    }

    let text = String::from_utf8_lossy(&buf);
    if let Some(body) = text.strip_suffix(terminator) {
        return Ok(body.trim().to_string());
    }
    if strict {
        return Err(DaqError::Instrument(format!(
            "Response to '{}' is not terminated by {:?}: {:?}",
            command, terminator, text
        )));
    }
    Ok(text.trim().to_string())
}

/// Discard whatever arrives within `window`, returning the number of bytes dropped.
///
/// Used after a timeout so a late answer is not mistaken for the response to the
/// next command.
pub(crate) async fn drain_stale<R>(reader: &mut R, window: Duration) -> usize
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; 256];
    let mut total = 0;
    let deadline = tokio::time::Instant::now() + window;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, reader.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total += n,
            Ok(Err(_)) => break,
            Err(_) => break,
        }
    }

    total
}

struct StreamState {
    reader: BufReader<DynStream>,
    stale: bool,
}

impl StreamState {
    async fn prepare(&mut self, label: &str) {
        if self.stale {
            let dropped = drain_stale(&mut self.reader, STALE_DRAIN_WINDOW).await;
            if dropped > 0 {
                tracing::debug!(transport = %label, bytes = dropped, "Discarded stale response bytes");
            }
            self.stale = false;
        }
    }
}

/// [`InstrumentTransport`] over any byte stream.
pub struct StreamTransport {
    label: String,
    options: TransportOptions,
    state: Mutex<StreamState>,
}

/// TCP socket transport.
pub type TcpTransport = StreamTransport;

/// RS-232 transport.
pub type SerialTransport = StreamTransport;

impl StreamTransport {
    /// Wrap an already connected stream.
    pub fn new<S>(stream: S, label: impl Into<String>, options: TransportOptions) -> Self
    where
        S: InstrumentIo + 'static,
    {
        let stream: DynStream = Box::new(stream);
        Self {
            label: label.into(),
            options,
            state: Mutex::new(StreamState {
                reader: BufReader::new(stream),
                stale: false,
            }),
        }
    }

    /// Connect to a raw TCP socket instrument.
    pub async fn connect(host: &str, port: u16, options: TransportOptions) -> AppResult<Self> {
        let addr = format!("{}:{}", host, port);
        let stream = tokio::time::timeout(options.timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| timeout_error(format!("connection to {}", addr), options.timeout))??;
        stream.set_nodelay(true)?;
        tracing::info!(%addr, "Connected to TCP instrument");
        Ok(Self::new(stream, format!("tcp://{}", addr), options))
    }

    /// Open an RS-232 port.
    #[cfg(feature = "instrument_serial")]
    pub fn open(port: &str, settings: &SerialSettings, options: TransportOptions) -> AppResult<Self> {
        use tokio_serial::SerialPortBuilderExt;

        let data_bits = match settings.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            8 => tokio_serial::DataBits::Eight,
            other => {
                return Err(DaqError::Configuration(format!(
                    "Unsupported serial data bits: {}",
                    other
                )))
            }
        };
        let stop_bits = match settings.stop_bits {
            1 => tokio_serial::StopBits::One,
            2 => tokio_serial::StopBits::Two,
            other => {
                return Err(DaqError::Configuration(format!(
                    "Unsupported serial stop bits: {}",
                    other
                )))
            }
        };
        let parity = match settings.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Odd => tokio_serial::Parity::Odd,
            Parity::Even => tokio_serial::Parity::Even,
        };
        let flow_control = match settings.flow_control {
            FlowControl::None => tokio_serial::FlowControl::None,
            FlowControl::Software => tokio_serial::FlowControl::Software,
            FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
        };

        let stream = tokio_serial::new(port, settings.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .timeout(options.timeout)
            .open_native_async()
            .map_err(|e| DaqError::Instrument(format!("Failed to open serial port {}: {}", port, e)))?;

        tracing::info!(port, baud = settings.baud_rate, "Opened serial instrument");
        Ok(Self::new(stream, format!("serial://{}", port), options))
    }

    /// Framing and timing in effect.
    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    fn read_timeout(&self, command: &str) -> DaqError {
        timeout_error(format!("'{}' on {}", command, self.label), self.options.timeout)
    }
}

#[async_trait]
impl InstrumentTransport for StreamTransport {
    async fn write(&self, command: &str) -> AppResult<()> {
        let mut state = self.state.lock().await;
        state.prepare(&self.label).await;
        tracing::trace!(transport = %self.label, command, "write");

        let writer = state.reader.get_mut();
        match tokio::time::timeout(
            self.options.timeout,
            write_command(writer, command, &self.options.write_terminator),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(self.read_timeout(command)),
        }
    }

    async fn query(&self, command: &str) -> AppResult<String> {
        let mut state = self.state.lock().await;
        state.prepare(&self.label).await;
        tracing::trace!(transport = %self.label, command, "query");

        let options = &self.options;
        let reader = &mut state.reader;
        let exchange = async {
            write_command(reader.get_mut(), command, &options.write_terminator).await?;
            read_response(reader, command, &options.read_terminator, options.strict_termination).await
        };

        let outcome = tokio::time::timeout(options.timeout, exchange).await;
        match outcome {
            Ok(Ok(response)) => {
                tracing::trace!(transport = %self.label, command, response = %response, "response");
                Ok(response)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                state.stale = true;
                Err(self.read_timeout(command))
            }
        }
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[test]
    fn parses_visa_resource_strings() {
        assert_eq!(
            "GPIB0::22::INSTR".parse::<ResourceAddress>().unwrap(),
            ResourceAddress::Gpib { board: 0, address: 22 }
        );
        assert_eq!(
            "gpib::5::instr".parse::<ResourceAddress>().unwrap(),
            ResourceAddress::Gpib { board: 0, address: 5 }
        );
        assert_eq!(
            "TCPIP0::192.168.1.40::5025::SOCKET".parse::<ResourceAddress>().unwrap(),
            ResourceAddress::TcpSocket {
                board: 0,
                host: "192.168.1.40".into(),
                port: 5025
            }
        );
        assert_eq!(
            "ASRL/dev/ttyUSB0::INSTR".parse::<ResourceAddress>().unwrap(),
            ResourceAddress::Serial {
                port: "/dev/ttyUSB0".into()
            }
        );
    }

    #[test]
    fn rejects_malformed_resources() {
        for bad in [
            "GPIB0::31::INSTR",
            "GPIB0::x::INSTR",
            "GPIB0::22",
            "TCPIP0::host::SOCKET",
            "TCPIP0::host::99999::SOCKET",
            "ASRL::INSTR",
            "USB0::0x1234::INSTR",
        ] {
            assert!(bad.parse::<ResourceAddress>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn resource_display_round_trips() {
        for s in [
            "GPIB0::12::INSTR",
            "TCPIP0::wavemeter.lab::5000::SOCKET",
            "TCPIP1::10.0.0.5::5025::SOCKET",
            "GPIB2::7::INSTR",
            "ASRLCOM3::INSTR",
        ] {
            let parsed: ResourceAddress = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
    }

    #[test]
    fn serial_settings_deserialize_with_defaults() {
        let settings: SerialSettings =
            toml::from_str("data_bits = 7\nparity = \"odd\"\nflow_control = \"software\"").unwrap();
        assert_eq!(settings.baud_rate, 9600);
        assert_eq!(settings.data_bits, 7);
        assert_eq!(settings.parity, Parity::Odd);
        assert_eq!(settings.flow_control, FlowControl::Software);
    }

    fn quick() -> TransportOptions {
        TransportOptions::default().with_timeout(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn query_writes_terminated_command_and_trims_response() {
        let (client, server) = duplex(256);
        let transport = StreamTransport::new(client, "duplex", quick().with_terminator("\r\n"));

        let device = tokio::spawn(async move {
            let mut server = BufReader::new(server);
            let mut line = String::new();
            server.read_line(&mut line).await.unwrap();
            server.get_mut().write_all(b" 22.50\r\n").await.unwrap();
            line
        });

        let response = transport.query("CRDG?\n").await.unwrap();
        assert_eq!(response, "22.50");
        assert_eq!(device.await.unwrap(), "CRDG?\r\n");
    }

    #[tokio::test]
    async fn strict_termination_rejects_partial_terminator() {
        let (client, server) = duplex(256);
        let transport = StreamTransport::new(client, "duplex", quick().with_terminator("\r\n").strict());

        let _device = tokio::spawn(async move {
            let mut server = BufReader::new(server);
            let mut line = String::new();
            server.read_line(&mut line).await.unwrap();
            server.get_mut().write_all(b"22.50\n").await.unwrap();
            // keep the pipe open
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let err = transport.query("CRDG?").await.unwrap_err();
        assert!(matches!(err, DaqError::Instrument(_)), "{err}");
    }

    #[tokio::test]
    async fn eof_is_an_instrument_error() {
        let (client, server) = duplex(256);
        let transport = StreamTransport::new(client, "duplex", quick());
        drop(server);

        let err = transport.query("*IDN?").await.unwrap_err();
        assert!(matches!(err, DaqError::Instrument(_) | DaqError::Io(_)), "{err}");
    }

    #[tokio::test]
    async fn late_response_is_discarded_after_timeout() {
        let (client, server) = duplex(256);
        let transport = StreamTransport::new(client, "duplex", quick());

        let device = tokio::spawn(async move {
            let mut server = BufReader::new(server);
            let mut line = String::new();
            server.read_line(&mut line).await.unwrap();
            tokio::time::sleep(Duration::from_millis(150)).await;
            server.get_mut().write_all(b"late\n").await.unwrap();

            line.clear();
            server.read_line(&mut line).await.unwrap();
            server.get_mut().write_all(b"fresh\n").await.unwrap();
            line
        });

        let err = transport.query("FIRST?").await.unwrap_err();
        assert!(err.is_transient());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(transport.query("SECOND?").await.unwrap(), "fresh");
        assert_eq!(device.await.unwrap(), "SECOND?\n");
    }

    #[tokio::test]
    async fn write_sends_without_waiting_for_response() {
        let (client, server) = duplex(256);
        let transport = StreamTransport::new(client, "duplex", quick());

        transport.write("FREQ 1540").await.unwrap();
        transport.write("FUNC 0").await.unwrap();

        let mut server = BufReader::new(server);
        let mut line = String::new();
        server.read_line(&mut line).await.unwrap();
        assert_eq!(line, "FREQ 1540\n");
        line.clear();
        server.read_line(&mut line).await.unwrap();
        assert_eq!(line, "FUNC 0\n");
    }
}

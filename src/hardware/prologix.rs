//! GPIB access through a Prologix GPIB-ETHERNET controller.
//!
//! The controller bridges one TCP socket (port 1234) to the whole GPIB bus. It is put
//! in controller mode with read-after-write disabled, so every response has to be
//! requested explicitly with `++read eoi`. Instruments share the controller, which
//! serialises the bus; [`GpibDevice`] is the per-instrument view.

use async_trait::async_trait;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{AppResult, DaqError};
use crate::error_recovery::timeout_error;
use crate::hardware::transport::{
    drain_stale, read_response, write_command, DynStream, InstrumentIo, InstrumentTransport,
    TransportOptions,
};

/// Default TCP port of Prologix GPIB-ETHERNET controllers.
pub const PROLOGIX_PORT: u16 = 1234;

/// Controller set-up sent once after connecting.
///
/// `++eos 3` stops the controller from appending a terminator; EOI asserted with the
/// last byte ends each command.
pub const INIT_SEQUENCE: [&str; 4] = ["++mode 1", "++auto 0", "++eoi 1", "++eos 3"];

const ESC: u8 = 0x1B;

/// Escape bytes the controller would otherwise interpret (CR, LF, ESC and `+`).
pub fn escape_data(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 4);
    for &byte in data {
        if matches!(byte, b'\r' | b'\n' | ESC | b'+') {
            out.push(ESC);
        }
        out.push(byte);
    }
    out
}

struct Bus {
    reader: BufReader<DynStream>,
    active_address: Option<u8>,
    stale: bool,
}

impl Bus {
    async fn controller_command(&mut self, command: &str) -> AppResult<()> {
        write_command(self.reader.get_mut(), command, "\n").await
    }

    async fn select(&mut self, address: u8) -> AppResult<()> {
        if self.active_address != Some(address) {
            self.controller_command(&format!("++addr {}", address)).await?;
            self.active_address = Some(address);
        }
        Ok(())
    }

    async fn send_data(&mut self, command: &str) -> AppResult<()> {
        let body = command.trim_end_matches(['\r', '\n']);
        let escaped = escape_data(body.as_bytes());
        let line = String::from_utf8_lossy(&escaped);
        write_command(self.reader.get_mut(), &line, "\n").await
    }
}

/// `host:port` for `gateway`, adding [`PROLOGIX_PORT`] when no port is given.
fn gateway_address(gateway: &str) -> String {
    let gateway = gateway.trim();
    if gateway.parse::<SocketAddr>().is_ok() {
        return gateway.to_string();
    }
    if let Ok(ip) = gateway.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        return SocketAddr::new(ip, PROLOGIX_PORT).to_string();
    }
    match gateway.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => {
            gateway.to_string()
        }
        _ => format!("{}:{}", gateway, PROLOGIX_PORT),
    }
}

/// A connected Prologix controller.
pub struct PrologixController {
    label: String,
    timeout: Duration,
    bus: Mutex<Bus>,
}

impl PrologixController {
    /// Connect to a controller at `gateway` (`host`, `host:port`, an IPv6 literal or
    /// `[v6]:port`).
    pub async fn connect(gateway: &str, timeout: Duration) -> AppResult<Arc<Self>> {
        let addr = gateway_address(gateway);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| timeout_error(format!("connection to GPIB gateway {}", addr), timeout))??;
        stream.set_nodelay(true)?;
        let controller = Self::from_stream(stream, format!("prologix://{}", addr), timeout).await?;
        tracing::info!(gateway = %addr, "Connected to Prologix GPIB controller");
        Ok(controller)
    }

    /// Take over an already connected stream and initialise the controller.
    pub async fn from_stream<S>(stream: S, label: impl Into<String>, timeout: Duration) -> AppResult<Arc<Self>>
    where
        S: InstrumentIo + 'static,
    {
        let stream: DynStream = Box::new(stream);
        let mut bus = Bus {
            reader: BufReader::new(stream),
            active_address: None,
            stale: false,
        };
        for command in INIT_SEQUENCE {
            bus.controller_command(command).await?;
        }
        Ok(Arc::new(Self {
            label: label.into(),
            timeout,
            bus: Mutex::new(bus),
        }))
    }

    /// The instrument at primary `address`.
    pub fn device(self: &Arc<Self>, address: u8, options: TransportOptions) -> GpibDevice {
        GpibDevice {
            controller: Arc::clone(self),
            address,
            options,
        }
    }

    async fn exchange(
        &self,
        address: u8,
        command: &str,
        options: &TransportOptions,
        expect_response: bool,
    ) -> AppResult<Option<String>> {
        let mut bus = self.bus.lock().await;
        if bus.stale {
            let dropped = drain_stale(&mut bus.reader, Duration::from_millis(20)).await;
            if dropped > 0 {
                tracing::debug!(gateway = %self.label, bytes = dropped, "Discarded stale GPIB bytes");
            }
            bus.stale = false;
        }

        let timeout = options.timeout.max(self.timeout);
        let bus_ref = &mut *bus;
        let work = async {
            bus_ref.select(address).await?;
            bus_ref.send_data(command).await?;
            if !expect_response {
                return Ok(None);
            }
            bus_ref.controller_command("++read eoi").await?;
            read_response(
                &mut bus_ref.reader,
                command,
                &options.read_terminator,
                options.strict_termination,
            )
            .await
            .map(Some)
        };

        let outcome = tokio::time::timeout(timeout, work).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                bus.stale = true;
                Err(timeout_error(
                    format!("'{}' on GPIB address {} via {}", command, address, self.label),
                    timeout,
                ))
            }
        }
    }
}

/// One addressed instrument on a Prologix bus.
pub struct GpibDevice {
    controller: Arc<PrologixController>,
    address: u8,
    options: TransportOptions,
}

impl GpibDevice {
    /// Primary GPIB address.
    pub fn address(&self) -> u8 {
        self.address
    }
}

#[async_trait]
impl InstrumentTransport for GpibDevice {
    async fn write(&self, command: &str) -> AppResult<()> {
        tracing::trace!(address = self.address, command, "gpib write");
        self.controller
            .exchange(self.address, command, &self.options, false)
            .await
            .map(|_| ())
    }

    async fn query(&self, command: &str) -> AppResult<String> {
        tracing::trace!(address = self.address, command, "gpib query");
        let response = self
            .controller
            .exchange(self.address, command, &self.options, true)
            .await?;
        response.ok_or_else(|| DaqError::Instrument(format!("No response to '{}'", command)))
    }

    fn describe(&self) -> String {
        format!("{} addr {}", self.controller.label, self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[test]
    fn gateway_port_defaults_to_1234() {
        assert_eq!(gateway_address("192.168.1.50"), "192.168.1.50:1234");
        assert_eq!(gateway_address("192.168.1.50:4000"), "192.168.1.50:4000");
        assert_eq!(gateway_address("prologix.lab"), "prologix.lab:1234");
        assert_eq!(gateway_address("prologix.lab:4000"), "prologix.lab:4000");
        assert_eq!(gateway_address("fe80::1"), "[fe80::1]:1234");
        assert_eq!(gateway_address("[fe80::1]"), "[fe80::1]:1234");
        assert_eq!(gateway_address("[fe80::1]:4000"), "[fe80::1]:4000");
    }

    #[test]
    fn escapes_controller_characters() {
        assert_eq!(escape_data(b"FREQ 10"), b"FREQ 10".to_vec());
        assert_eq!(escape_data(b"A+B\n"), vec![b'A', ESC, b'+', b'B', ESC, b'\n']);
    }

    async fn next_line<R: AsyncBufReadExt + Unpin>(reader: &mut R) -> String {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        line
    }

    #[tokio::test]
    async fn initialises_controller_and_addresses_lazily() {
        let (client, server) = duplex(1024);
        let controller = PrologixController::from_stream(client, "test", Duration::from_millis(200))
            .await
            .unwrap();
        let mut server = BufReader::new(server);
        for expected in INIT_SEQUENCE {
            assert_eq!(next_line(&mut server).await, format!("{}\n", expected));
        }

        let lockin = controller.device(8, TransportOptions::default());
        let generator = controller.device(4, TransportOptions::default());

        let device = tokio::spawn(async move {
            let mut seen = Vec::new();
            // OUTP? 1 to address 8
            seen.push(next_line(&mut server).await);
            seen.push(next_line(&mut server).await);
            seen.push(next_line(&mut server).await);
            server.get_mut().write_all(b"1.5E-6\n").await.unwrap();
            // second query on the same address: no ++addr
            seen.push(next_line(&mut server).await);
            seen.push(next_line(&mut server).await);
            server.get_mut().write_all(b"-2.0E-7\n").await.unwrap();
            // write to address 4
            seen.push(next_line(&mut server).await);
            seen.push(next_line(&mut server).await);
            seen
        });

        assert_eq!(lockin.query("OUTP? 1").await.unwrap(), "1.5E-6");
        assert_eq!(lockin.query("OUTP? 2").await.unwrap(), "-2.0E-7");
        generator.write("FREQ 1540").await.unwrap();

        let seen = device.await.unwrap();
        assert_eq!(
            seen,
            vec![
                "++addr 8\n",
                "OUTP? 1\n",
                "++read eoi\n",
                "OUTP? 2\n",
                "++read eoi\n",
                "++addr 4\n",
                "FREQ 1540\n",
            ]
        );
    }

    #[tokio::test]
    async fn silent_device_times_out() {
        let (client, server) = duplex(1024);
        let controller = PrologixController::from_stream(client, "test", Duration::from_millis(50))
            .await
            .unwrap();
        let device = controller.device(12, TransportOptions::default().with_timeout(Duration::from_millis(50)));

        let err = device.query("*IDN?").await.unwrap_err();
        assert!(matches!(err, DaqError::Timeout { .. }), "{err}");
        drop(server);
    }
}

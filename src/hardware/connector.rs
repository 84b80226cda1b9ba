//! Opens transports for configured resources.

use std::sync::Arc;
use tokio::sync::Mutex;

use crate::config::{GpibConfig, InstrumentConfig};
use crate::error::{AppResult, DaqError};
use crate::hardware::prologix::PrologixController;
use crate::hardware::transport::{
    InstrumentTransport, ResourceAddress, SerialSettings, StreamTransport, TransportOptions,
};

/// Framing a driver expects when the configuration does not override it.
#[derive(Debug, Clone, Default)]
pub struct ConnectionDefaults {
    /// Terminators and strictness (the timeout comes from the configuration)
    pub options: TransportOptions,
    /// Line settings for RS-232 connections
    pub serial: SerialSettings,
}

impl ConnectionDefaults {
    /// Defaults using `terminator` both ways.
    pub fn terminated(terminator: &str) -> Self {
        Self {
            options: TransportOptions::default().with_terminator(terminator),
            serial: SerialSettings::default(),
        }
    }
}

/// Opens [`InstrumentTransport`]s, sharing one Prologix controller between all GPIB
/// resources.
pub struct Connector {
    gpib: GpibConfig,
    controller: Mutex<Option<Arc<PrologixController>>>,
}

impl Connector {
    /// Connector for the given GPIB settings. Nothing is opened until needed.
    pub fn new(gpib: GpibConfig) -> Self {
        Self {
            gpib,
            controller: Mutex::new(None),
        }
    }

    /// Resolve the effective transport options for `config`.
    pub fn options_for(config: &InstrumentConfig, defaults: &ConnectionDefaults) -> TransportOptions {
        let mut options = defaults.options.clone().with_timeout(config.timeout);
        if let Some(terminator) = &config.write_terminator {
            options.write_terminator = terminator.clone();
        }
        if let Some(terminator) = &config.read_terminator {
            options.read_terminator = terminator.clone();
        }
        options
    }

    /// Open the instrument described by `config`.
    pub async fn open(
        &self,
        config: &InstrumentConfig,
        defaults: &ConnectionDefaults,
    ) -> AppResult<Arc<dyn InstrumentTransport>> {
        let options = Self::options_for(config, defaults);
        match &config.resource {
            ResourceAddress::Gpib { board, address } => {
                if *board != 0 {
                    tracing::warn!(board, "Only one GPIB gateway is supported, using it for board {}", board);
                }
                let controller = self.controller().await?;
                Ok(Arc::new(controller.device(*address, options)))
            }
            ResourceAddress::TcpSocket { host, port, .. } => {
                Ok(Arc::new(StreamTransport::connect(host, *port, options).await?))
            }
            ResourceAddress::Serial { port } => {
                let serial = config.serial.clone().unwrap_or_else(|| defaults.serial.clone());
                Self::open_serial(port, &serial, options)
            }
        }
    }

    #[cfg(feature = "instrument_serial")]
    fn open_serial(
        port: &str,
        serial: &SerialSettings,
        options: TransportOptions,
    ) -> AppResult<Arc<dyn InstrumentTransport>> {
        Ok(Arc::new(StreamTransport::open(port, serial, options)?))
    }

    #[cfg(not(feature = "instrument_serial"))]
    fn open_serial(
        port: &str,
        _serial: &SerialSettings,
        _options: TransportOptions,
    ) -> AppResult<Arc<dyn InstrumentTransport>> {
        tracing::error!(port, "Serial support not compiled in");
        Err(DaqError::FeatureNotEnabled("instrument_serial".to_string()))
    }

    async fn controller(&self) -> AppResult<Arc<PrologixController>> {
        let mut slot = self.controller.lock().await;
        if let Some(controller) = slot.as_ref() {
            return Ok(Arc::clone(controller));
        }
        let gateway = self.gpib.gateway.as_deref().ok_or_else(|| {
            DaqError::Configuration(
                "GPIB resources require [gpib] gateway = \"host:port\" (Prologix GPIB-ETHERNET)"
                    .to_string(),
            )
        })?;
        let controller = PrologixController::connect(gateway, self.gpib.timeout).await?;
        *slot = Some(Arc::clone(&controller));
        Ok(controller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn gpib_without_gateway_is_a_configuration_error() {
        let connector = Connector::new(GpibConfig::default());
        let config = InstrumentConfig::new("GPIB0::8::INSTR".parse().unwrap());
        let err = connector
            .open(&config, &ConnectionDefaults::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, DaqError::Configuration(_)), "{err}");
    }

    #[test]
    fn configuration_overrides_driver_defaults() {
        let mut config = InstrumentConfig::new("TCPIP0::localhost::5000::SOCKET".parse().unwrap());
        config.timeout = Duration::from_millis(750);
        config.read_terminator = Some("\r".into());

        let options = Connector::options_for(&config, &ConnectionDefaults::terminated("\r\n"));
        assert_eq!(options.timeout, Duration::from_millis(750));
        assert_eq!(options.write_terminator, "\r\n");
        assert_eq!(options.read_terminator, "\r");
    }

    #[tokio::test]
    async fn connects_to_tcp_socket_instruments() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
            let (socket, _) = listener.accept().await.unwrap();
            let mut socket = BufReader::new(socket);
            let mut line = String::new();
            socket.read_line(&mut line).await.unwrap();
            socket.get_mut().write_all(b"394.2\n").await.unwrap();
            line
        });

        let connector = Connector::new(GpibConfig::default());
        let config = InstrumentConfig::new(format!("TCPIP0::127.0.0.1::{}::SOCKET", port).parse().unwrap());
        let transport = connector.open(&config, &ConnectionDefaults::default()).await.unwrap();
        assert_eq!(transport.query(":MEAS:FREQ?").await.unwrap(), "394.2");
        assert_eq!(server.await.unwrap(), ":MEAS:FREQ?\n");
    }
}

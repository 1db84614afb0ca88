//! Serial line abstractions for device channels.
//!
//! A device channel never opens hardware itself. It asks a [`LineOpener`] for a
//! fresh [`DynLine`] every time it (re)connects, which lets the same reconnect
//! loop drive a `tokio_serial::SerialStream` on the vehicle and a
//! `tokio::io::DuplexStream` in tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use rov_hub::serial::{LineOpener, TokioSerialOpener};
//!
//! let opener = TokioSerialOpener::new("/dev/ttyACM0", 230_400);
//! let line = opener.open().await?;
//! ```

use crate::error::{HubError, HubResult};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::spawn_blocking;

/// Trait alias for async line I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can back a
/// device channel:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::io::DuplexStream` (testing)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased line.
pub type DynLine = Box<dyn SerialPortIO>;

/// Opens a fresh connection to one physical line.
#[async_trait]
pub trait LineOpener: Send + Sync {
    /// Human-readable name of the line, used in log fields.
    fn describe(&self) -> &str;

    /// Attempt to open the line once.
    async fn open(&self) -> HubResult<DynLine>;
}

/// Opens a real serial port with `tokio-serial` (8N1, no flow control).
#[derive(Debug, Clone)]
pub struct TokioSerialOpener {
    port: String,
    baud_rate: u32,
    timeout: Duration,
}

impl TokioSerialOpener {
    /// Create an opener for `port` at `baud_rate`.
    pub fn new(port: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            timeout: Duration::from_secs(1),
        }
    }

    /// Driver-level I/O timeout applied when the port is opened.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl LineOpener for TokioSerialOpener {
    fn describe(&self) -> &str {
        &self.port
    }

    async fn open(&self) -> HubResult<DynLine> {
        let port = self.port.clone();
        let baud_rate = self.baud_rate;
        let timeout = self.timeout;

        // Opening a tty can block on some platforms.
        let stream = spawn_blocking(move || {
            use tokio_serial::SerialPortBuilderExt;

            tokio_serial::new(&port, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .timeout(timeout)
                .open_native_async()
                .map_err(|source| HubError::Serial { port, source })
        })
        .await
        .map_err(|e| HubError::Io(std::io::Error::other(e)))??;

        Ok(Box::new(stream))
    }
}

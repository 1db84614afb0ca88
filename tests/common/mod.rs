//! Shared fixtures for channel integration tests.
//!
//! - `ScriptedOpener`: a `LineOpener` handing out in-memory duplex lines, with a
//!   configurable number of failed open attempts first.
//! - `Board`: the far end of a duplex line, speaking newline-delimited JSON.
//! - `Station`: a TCP client playing the surface operator.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rov_hub::config::SerialConfig;
use rov_hub::error::{HubError, HubResult};
use rov_hub::serial::{DynLine, LineOpener};
use rov_hub::store::{frame, DeviceId, Frame, Store};
use serde_json::Value;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

/// Upper bound for anything a test waits on.
pub const PATIENCE: Duration = Duration::from_secs(3);

// =============================================================================
// Serial fixtures
// =============================================================================

/// Serial timings short enough for tests.
pub fn fast_serial() -> SerialConfig {
    SerialConfig {
        read_timeout: Duration::from_millis(200),
        write_timeout: Duration::from_millis(200),
        reconnect_delay: Duration::from_millis(10),
        exchange_delay: Duration::from_millis(5),
        ..SerialConfig::default()
    }
}

/// Surface + two boards, with whitelists on every side.
pub fn test_store() -> Arc<Store> {
    Arc::new(
        Store::builder(DeviceId::from("surface"), ["status_T", "Sen_IMU_X"])
            .device(DeviceId::from("Ard_T"), ["Thr_FP", "Thr_FS"])
            .device(DeviceId::from("Ard_M"), ["LED_M"])
            .defaults(frame(serde_json::json!({"Thr_FP": 1500, "LED_M": 1100})))
            .build()
            .unwrap(),
    )
}

/// Hands out queued duplex lines after failing a set number of attempts.
pub struct ScriptedOpener {
    name: String,
    failures_left: Mutex<usize>,
    attempts: AtomicUsize,
    lines: Mutex<VecDeque<DuplexStream>>,
}

impl ScriptedOpener {
    pub fn new(name: &str) -> Arc<Self> {
        Self::failing(name, 0)
    }

    pub fn failing(name: &str, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            failures_left: Mutex::new(failures),
            attempts: AtomicUsize::new(0),
            lines: Mutex::new(VecDeque::new()),
        })
    }

    /// Queue a line for the next successful open and return the board end.
    pub fn plug_in(&self) -> Board {
        let (host, device) = tokio::io::duplex(4096);
        self.lines.lock().push_back(device);
        Board::new(host)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LineOpener for ScriptedOpener {
    fn describe(&self) -> &str {
        &self.name
    }

    async fn open(&self) -> HubResult<DynLine> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.failures_left.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(HubError::Io(std::io::ErrorKind::NotFound.into()));
            }
        }
        match self.lines.lock().pop_front() {
            Some(line) => Ok(Box::new(line)),
            None => Err(HubError::Io(std::io::ErrorKind::NotFound.into())),
        }
    }
}

/// The microcontroller side of a duplex line.
pub struct Board {
    line: BufReader<DuplexStream>,
}

impl Board {
    fn new(host: DuplexStream) -> Self {
        Self {
            line: BufReader::new(host),
        }
    }

    /// Read the next frame the hub sent down.
    pub async fn next_frame(&mut self) -> Frame {
        let mut text = String::new();
        let read = timeout(PATIENCE, self.line.read_line(&mut text))
            .await
            .expect("no frame from hub")
            .expect("line read failed");
        assert!(read > 0, "hub closed the line");
        assert!(text.ends_with('\n'), "frame not newline-terminated: {text:?}");
        match serde_json::from_str::<Value>(&text).expect("hub sent invalid JSON") {
            Value::Object(map) => map,
            other => panic!("hub sent a non-object frame: {other}"),
        }
    }

    /// Send a JSON reply line.
    pub async fn reply(&mut self, value: Value) {
        self.reply_raw(&format!("{value}\n")).await;
    }

    /// Send raw text as the reply.
    pub async fn reply_raw(&mut self, text: &str) {
        let writer = self.line.get_mut();
        writer.write_all(text.as_bytes()).await.unwrap();
        writer.flush().await.unwrap();
    }
}

// =============================================================================
// Surface fixtures
// =============================================================================

/// A TCP client standing in for the operator station.
pub struct Station {
    stream: TcpStream,
}

impl Station {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = timeout(PATIENCE, TcpStream::connect(addr))
            .await
            .expect("connect timed out")
            .expect("connect failed");
        Self { stream }
    }

    pub async fn send(&mut self, text: &str) {
        self.stream.write_all(text.as_bytes()).await.unwrap();
    }

    /// Read one reply frame, or `None` if nothing arrives within `wait`.
    pub async fn try_recv(&mut self, wait: Duration) -> Option<Frame> {
        let mut buf = vec![0u8; 4096];
        let n = timeout(wait, self.stream.read(&mut buf)).await.ok()?.unwrap();
        assert!(n > 0, "hub closed the session");
        match serde_json::from_slice::<Value>(&buf[..n]).expect("hub sent invalid JSON") {
            Value::Object(map) => Some(map),
            other => panic!("hub sent a non-object frame: {other}"),
        }
    }

    pub async fn recv(&mut self) -> Frame {
        self.try_recv(PATIENCE).await.expect("no reply from hub")
    }

    /// One full round: send a frame, read the reply.
    pub async fn round(&mut self, text: &str) -> Frame {
        self.send(text).await;
        self.recv().await
    }

    /// Wait for the hub to close the connection.
    pub async fn expect_closed(&mut self) {
        let mut buf = vec![0u8; 4096];
        let n = timeout(PATIENCE, self.stream.read(&mut buf))
            .await
            .expect("hub kept the session open")
            .unwrap_or(0);
        assert_eq!(n, 0, "expected the hub to close the session");
    }
}

// =============================================================================
// Polling
// =============================================================================

/// Poll `check` until it holds or [`PATIENCE`] runs out.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = Instant::now() + PATIENCE;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Read one key from a partition.
pub fn value_of(store: &Store, identity: &str, key: &str) -> Option<Value> {
    store
        .get(&DeviceId::from(identity), &[key], false)
        .unwrap()
        .remove(key)
}

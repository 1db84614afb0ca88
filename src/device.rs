//! Device channel: one serial line to one microcontroller board.
//!
//! Each channel runs its own task for the lifetime of the process:
//!
//! ```text
//! Disconnected ──open──▶ Connecting ──ok──▶ Connected ──link lost──▶ Disconnected
//!       ▲                    │                 │  ▲
//!       └──reconnect delay───┘                 └──┘ bad reply (logged, link kept)
//! ```
//!
//! An exchange round writes the board's whitelisted state as one JSON line,
//! waits (bounded by the read timeout) for a JSON line back, and applies it to
//! the store. A reply must carry the identity field (`deviceID` by default); its
//! value becomes the channel's current identity before the reply is applied, so
//! a board can claim its own partition after boot.
//!
//! Nothing enforces that two channels hold different identities at runtime. A
//! board that misreports its ID shares a partition with another channel until
//! it reports correctly again.

use crate::config::SerialConfig;
use crate::error::{HubError, HubResult};
use crate::serial::{DynLine, LineOpener};
use crate::store::{DeviceId, Frame, Store};
use parking_lot::RwLock;
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn, Instrument};

/// Connection state of a device channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No line is open.
    Disconnected,
    /// An open attempt is in progress.
    Connecting,
    /// The line is open and rounds are running.
    Connected,
}

/// Why a connected line was abandoned.
#[derive(Debug, Error)]
pub enum LinkLost {
    /// Writing the outbound frame failed.
    #[error("write failed: {0}")]
    Write(std::io::Error),
    /// Writing the outbound frame did not finish in time.
    #[error("write timed out")]
    WriteTimeout,
    /// Reading the reply failed.
    #[error("read failed: {0}")]
    Read(std::io::Error),
    /// The line reached end of file.
    #[error("line closed")]
    Closed,
}

/// Result of one round on a healthy link.
#[derive(Debug)]
pub enum RoundOutcome {
    /// A reply was applied to the partition of `identity`.
    Applied {
        /// Identity the reply was stored under.
        identity: DeviceId,
    },
    /// No complete reply arrived before the read timeout, or it was blank.
    NoReply,
    /// The reply could not be used. The link stays up.
    Rejected(HubError),
}

/// One serial link and its reconnect/exchange loop.
pub struct DeviceChannel {
    opener: Arc<dyn LineOpener>,
    store: Arc<Store>,
    settings: SerialConfig,
    identity: RwLock<DeviceId>,
    state: watch::Sender<ChannelState>,
    task: OnceLock<JoinHandle<()>>,
}

impl std::fmt::Debug for DeviceChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceChannel")
            .field("port", &self.opener.describe())
            .field("identity", &*self.identity.read())
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl DeviceChannel {
    /// Create a channel that starts out representing `identity`.
    pub fn new(
        identity: DeviceId,
        opener: Arc<dyn LineOpener>,
        store: Arc<Store>,
        settings: SerialConfig,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Arc::new(Self {
            opener,
            store,
            settings,
            identity: RwLock::new(identity),
            state,
            task: OnceLock::new(),
        })
    }

    /// Start the exchange loop on the current Tokio runtime.
    ///
    /// Returns immediately. Only the first call spawns the task; later calls
    /// return `false` and do nothing.
    pub fn connect(self: &Arc<Self>) -> bool {
        let mut spawned = false;
        self.task.get_or_init(|| {
            spawned = true;
            let span = tracing::info_span!("device", port = %self.opener.describe());
            tokio::spawn(Arc::clone(self).run().instrument(span))
        });
        spawned
    }

    /// Whether [`DeviceChannel::connect`] has been called.
    pub fn is_started(&self) -> bool {
        self.task.get().is_some()
    }

    /// Name of the underlying line.
    pub fn port(&self) -> &str {
        self.opener.describe()
    }

    /// The partition this channel currently reads and writes.
    pub fn current_identity(&self) -> DeviceId {
        self.identity.read().clone()
    }

    /// Current connection state.
    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    /// Watch connection state changes.
    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: ChannelState) {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    async fn run(self: Arc<Self>) {
        loop {
            let line = self.open_line().await;
            self.set_state(ChannelState::Connected);
            info!(identity = %self.current_identity(), "Serial line connected");

            let lost = self.exchange_loop(line).await;

            self.set_state(ChannelState::Disconnected);
            warn!(identity = %self.current_identity(), error = %lost, "Serial line lost");
        }
    }

    async fn open_line(&self) -> DynLine {
        info!("Connecting to serial line");
        let mut attempts: u64 = 0;
        loop {
            self.set_state(ChannelState::Connecting);
            match self.opener.open().await {
                Ok(line) => return line,
                Err(e) => {
                    attempts += 1;
                    debug!(attempts, error = %e, "Open failed, retrying");
                    self.set_state(ChannelState::Disconnected);
                    sleep(self.settings.reconnect_delay).await;
                }
            }
        }
    }

    async fn exchange_loop(&self, line: DynLine) -> LinkLost {
        let mut line = BufReader::new(line);
        loop {
            match self.exchange_round(&mut line).await {
                Ok(outcome) => trace!(?outcome, "Round complete"),
                // the line is dropped here, which closes it
                Err(lost) => return lost,
            }
            sleep(self.settings.exchange_delay).await;
        }
    }

    /// Run one send-then-receive round on an open line.
    async fn exchange_round(
        &self,
        line: &mut BufReader<DynLine>,
    ) -> Result<RoundOutcome, LinkLost> {
        let identity = self.current_identity();
        let outbound = match self.store.get(&identity, &[], true) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "No partition for current identity");
                Frame::new()
            }
        };
        let mut payload = Value::Object(outbound).to_string();
        payload.push('\n');

        let write = async {
            let writer = line.get_mut();
            writer.write_all(payload.as_bytes()).await?;
            writer.flush().await
        };
        match timeout(self.settings.write_timeout, write).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(LinkLost::Write(e)),
            Err(_) => return Err(LinkLost::WriteTimeout),
        }

        let mut reply = Vec::new();
        match timeout(self.settings.read_timeout, line.read_until(b'\n', &mut reply)).await {
            Ok(Ok(0)) => Err(LinkLost::Closed),
            Ok(Ok(_)) => Ok(self.apply_reply(&reply)),
            Ok(Err(e)) => Err(LinkLost::Read(e)),
            Err(_) => {
                if !reply.is_empty() {
                    debug!(bytes = reply.len(), "Discarding partial reply");
                }
                Ok(RoundOutcome::NoReply)
            }
        }
    }

    /// Decode a reply line, adopt its identity and store it.
    pub fn apply_reply(&self, raw: &[u8]) -> RoundOutcome {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return RoundOutcome::NoReply;
        }

        let (identity, frame) = match self.decode_reply(raw) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(
                    error = %e,
                    payload = %String::from_utf8_lossy(raw).trim(),
                    "Received invalid data"
                );
                return RoundOutcome::Rejected(e);
            }
        };

        let previous = std::mem::replace(&mut *self.identity.write(), identity.clone());
        if previous != identity {
            info!(from = %previous, to = %identity, "Device reassigned its identity");
        }

        match self.store.set(&identity, frame) {
            Ok(()) => RoundOutcome::Applied { identity },
            Err(e) => {
                warn!(error = %e, "Failed to store reply");
                RoundOutcome::Rejected(e)
            }
        }
    }

    fn decode_reply(&self, raw: &[u8]) -> HubResult<(DeviceId, Frame)> {
        let frame = match serde_json::from_slice::<Value>(raw)? {
            Value::Object(map) => map,
            _ => return Err(HubError::NotAnObject),
        };

        let field = &self.settings.identity_field;
        let identity = match frame.get(field) {
            None => return Err(HubError::MissingIdentity(field.clone())),
            Some(Value::String(id)) => DeviceId::from(id.as_str()),
            Some(Value::Number(id)) => DeviceId::from(id.to_string()),
            Some(other) => return Err(HubError::InvalidIdentity(other.to_string())),
        };

        if identity == *self.store.surface() {
            return Err(HubError::InvalidIdentity(identity.to_string()));
        }
        if !self.store.contains(&identity) {
            return Err(HubError::UnknownPartition(identity));
        }

        Ok((identity, frame))
    }
}

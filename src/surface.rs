//! Surface channel: the TCP link to the operator station.
//!
//! The channel accepts one session at a time. The listener is created with a
//! backlog of one and `accept` is not called again until the current session
//! ends, so a second station waits in the backlog until the first leaves.
//!
//! A session round reads one frame, merges it into the surface partition,
//! then sends back the surface partition's whitelisted keys. Malformed frames
//! are logged and skipped. A closed, reset or idle socket ends the session,
//! after which the default snapshot is forced onto the surface partition and
//! the channel goes back to accepting.

use crate::config::SurfaceConfig;
use crate::error::{HubError, HubResult};
use crate::store::Store;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace, warn};

/// Pause after a failed `accept` before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Session state of the surface channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceState {
    /// Waiting for a station to connect.
    Listening,
    /// Serving the station at `peer`.
    SessionActive {
        /// Remote address of the station.
        peer: SocketAddr,
    },
}

/// Why a session ended.
#[derive(Debug, Error)]
pub enum SessionEnd {
    /// The station closed the connection.
    #[error("closed by peer")]
    Closed,
    /// Nothing was received or sent within the session timeout.
    #[error("timed out")]
    Timeout,
    /// The socket failed (reset, abort, broken pipe).
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// The TCP-facing session manager.
pub struct SurfaceChannel {
    listener: TcpListener,
    store: Arc<Store>,
    settings: SurfaceConfig,
    state: watch::Sender<SurfaceState>,
}

impl SurfaceChannel {
    /// Bind the listener.
    ///
    /// # Errors
    /// Returns [`HubError::Bind`] if the address cannot be bound.
    pub async fn bind(settings: SurfaceConfig, store: Arc<Store>) -> HubResult<Self> {
        let addr = settings.bind;
        let bind_err = |source| HubError::Bind { addr, source };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_err)?;
        socket.set_reuseaddr(true).map_err(bind_err)?;
        socket.bind(addr).map_err(bind_err)?;
        let listener = socket.listen(1).map_err(bind_err)?;

        let (state, _) = watch::channel(SurfaceState::Listening);
        Ok(Self {
            listener,
            store,
            settings,
            state,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> HubResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Watch session state changes.
    pub fn subscribe(&self) -> watch::Receiver<SurfaceState> {
        self.state.subscribe()
    }

    /// Accept and serve sessions forever.
    pub async fn run(self) {
        let addr = self
            .listener
            .local_addr()
            .map_or_else(|_| self.settings.bind.to_string(), |a| a.to_string());

        loop {
            self.state.send_replace(SurfaceState::Listening);
            info!(%addr, "Waiting for a client");

            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            };

            self.state.send_replace(SurfaceState::SessionActive { peer });
            info!(%peer, "Client connected");

            let end = self.serve_session(stream).await;

            info!(%peer, reason = %end, "Connection closed");
            self.store.reset_to_default();
        }
    }

    /// Run rounds until the session fails. The stream is closed on return.
    async fn serve_session(&self, mut stream: TcpStream) -> SessionEnd {
        let limit = self.settings.session_timeout;
        let mut buffer = vec![0u8; self.settings.buffer_size];

        loop {
            let received = match timeout(limit, stream.read(&mut buffer)).await {
                Err(_) => return SessionEnd::Timeout,
                Ok(Err(e)) => return SessionEnd::Io(e),
                Ok(Ok(0)) => return SessionEnd::Closed,
                Ok(Ok(n)) => n,
            };

            if let Err(e) = self.apply_frame(&buffer[..received]) {
                warn!(
                    error = %e,
                    payload = %String::from_utf8_lossy(&buffer[..received]).trim(),
                    "Received invalid data"
                );
            }

            let reply = match self.store.get(self.store.surface(), &[], true) {
                Ok(frame) => Value::Object(frame).to_string(),
                Err(e) => {
                    error!(error = %e, "Surface partition missing");
                    return SessionEnd::Closed;
                }
            };
            trace!(bytes = reply.len(), "Sending surface frame");

            match timeout(limit, stream.write_all(reply.as_bytes())).await {
                Err(_) => return SessionEnd::Timeout,
                Ok(Err(e)) => return SessionEnd::Io(e),
                Ok(Ok(())) => {}
            }
        }
    }

    /// Merge one received frame into the surface partition.
    ///
    /// Returns `Ok(false)` for frames that carry nothing to apply (blank or
    /// not UTF-8).
    fn apply_frame(&self, raw: &[u8]) -> HubResult<bool> {
        let Ok(text) = std::str::from_utf8(raw) else {
            debug!(bytes = raw.len(), "Ignoring non UTF-8 frame");
            return Ok(false);
        };
        let text = text.trim();
        if text.is_empty() {
            return Ok(false);
        }

        match serde_json::from_str::<Value>(text)? {
            Value::Object(frame) => {
                self.store.set(self.store.surface(), frame)?;
                Ok(true)
            }
            _ => Err(HubError::NotAnObject),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{frame, DeviceId};
    use serde_json::json;

    fn settings(bind: SocketAddr) -> SurfaceConfig {
        SurfaceConfig {
            bind,
            transmit: vec!["status_T".into()],
            ..SurfaceConfig::default()
        }
    }

    fn store() -> Arc<Store> {
        Arc::new(
            Store::builder(DeviceId::from("surface"), ["status_T"])
                .device(DeviceId::from("Ard_T"), ["Thr_FP"])
                .build()
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn apply_frame_merges_objects_and_skips_noise() {
        let store = store();
        let channel = SurfaceChannel::bind(settings("127.0.0.1:0".parse().unwrap()), store.clone())
            .await
            .unwrap();

        assert!(channel.apply_frame(br#" {"Thr_FP": 1650} "#).unwrap());
        assert!(!channel.apply_frame(b"   ").unwrap());
        assert!(!channel.apply_frame(&[0xff, 0xfe]).unwrap());
        assert!(matches!(channel.apply_frame(b"{nope"), Err(HubError::Decode(_))));
        assert!(matches!(channel.apply_frame(b"42"), Err(HubError::NotAnObject)));

        let thrusters = store.get(&DeviceId::from("Ard_T"), &[], false).unwrap();
        assert_eq!(thrusters, frame(json!({"Thr_FP": 1650})));
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        let result = SurfaceChannel::bind(settings(addr), store()).await;
        assert!(matches!(result, Err(HubError::Bind { .. })));
    }
}

//! Hub assembly: one store, one surface channel, one channel per device.

use crate::config::HubConfig;
use crate::device::DeviceChannel;
use crate::error::{HubError, HubResult};
use crate::serial::{LineOpener, TokioSerialOpener};
use crate::store::Store;
use crate::surface::SurfaceChannel;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, Instrument};

/// A running hub.
///
/// Channels keep running when the `Hub` is dropped; they live until the
/// runtime shuts down.
pub struct Hub {
    store: Arc<Store>,
    devices: Vec<Arc<DeviceChannel>>,
    surface_addr: Option<SocketAddr>,
    surface_task: Option<JoinHandle<()>>,
}

impl Hub {
    /// Start a hub on real serial ports.
    pub async fn start(config: &HubConfig) -> HubResult<Self> {
        let openers = config
            .devices
            .iter()
            .map(|device| {
                Arc::new(
                    TokioSerialOpener::new(device.port.clone(), config.serial.baud_rate)
                        .with_timeout(config.serial.read_timeout),
                ) as Arc<dyn LineOpener>
            })
            .collect();
        Self::start_with_openers(config, openers).await
    }

    /// Start a hub with one caller-supplied opener per configured device, in
    /// configuration order.
    pub async fn start_with_openers(
        config: &HubConfig,
        openers: Vec<Arc<dyn LineOpener>>,
    ) -> HubResult<Self> {
        config.validate()?;
        if openers.len() != config.devices.len() {
            return Err(HubError::Configuration(format!(
                "{} devices configured but {} lines supplied",
                config.devices.len(),
                openers.len()
            )));
        }

        let store = Arc::new(config.build_store()?);
        store.clear();

        let (surface_addr, surface_task) = Self::start_surface(config, &store).await;

        let devices: Vec<_> = config
            .devices
            .iter()
            .zip(openers)
            .map(|(device, opener)| {
                let channel = DeviceChannel::new(
                    device.id.clone(),
                    opener,
                    Arc::clone(&store),
                    config.serial.clone(),
                );
                channel.connect();
                channel
            })
            .collect();

        info!(
            devices = devices.len(),
            surface = ?surface_addr,
            "Hub started"
        );

        Ok(Self {
            store,
            devices,
            surface_addr,
            surface_task,
        })
    }

    async fn start_surface(
        config: &HubConfig,
        store: &Arc<Store>,
    ) -> (Option<SocketAddr>, Option<JoinHandle<()>>) {
        let span = tracing::info_span!("surface", addr = %config.surface.bind);
        let channel = match SurfaceChannel::bind(config.surface.clone(), Arc::clone(store))
            .instrument(span.clone())
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                let _guard = span.enter();
                error!(error = %e, "Surface channel disabled");
                return (None, None);
            }
        };

        let addr = channel.local_addr().ok();
        let task = tokio::spawn(channel.run().instrument(span));
        (addr, Some(task))
    }

    /// The shared store.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Device channels in configuration order.
    pub fn devices(&self) -> &[Arc<DeviceChannel>] {
        &self.devices
    }

    /// Address the surface channel listens on, if it bound successfully.
    pub fn surface_addr(&self) -> Option<SocketAddr> {
        self.surface_addr
    }

    /// Whether the surface channel is serving.
    pub fn surface_running(&self) -> bool {
        self.surface_task
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    #[traced_test]
    async fn bind_failure_disables_only_the_surface() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut config = HubConfig::default();
        config.devices.clear();
        config.surface.bind = taken.local_addr().unwrap();

        let hub = Hub::start_with_openers(&config, Vec::new()).await.unwrap();

        assert!(hub.surface_addr().is_none());
        assert!(!hub.surface_running());
        assert!(hub.devices().is_empty());
        assert!(logs_contain("Surface channel disabled"));
    }
}

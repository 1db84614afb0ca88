//! # ROV Communication Hub
//!
//! This crate runs aboard a remotely operated vehicle and bridges two kinds of
//! links: one TCP session with the surface operator station and several serial
//! lines to microcontroller boards. All coordination between links goes
//! through a shared, partitioned key/value store.
//!
//! ## Crate Structure
//!
//! - **`store`**: The synchronized store. One partition per identity,
//!   transmission whitelists, and the surface/device mirror rules.
//! - **`surface`**: The TCP channel. One session at a time; the surface
//!   partition is reset to its default snapshot when a session ends.
//! - **`device`**: One channel per serial line with its own reconnect loop. A
//!   board may change which partition it represents at runtime.
//! - **`serial`**: The `LineOpener` seam and its `tokio-serial` implementation.
//! - **`hub`**: Builds the store from configuration and starts every channel.
//! - **`config`**: `figment`-based configuration (TOML file + environment).
//! - **`logging`**: `tracing` subscriber setup.
//! - **`error`**: The `HubError` enum.

pub mod config;
pub mod device;
pub mod error;
pub mod hub;
pub mod logging;
pub mod serial;
pub mod store;
pub mod surface;

pub use config::HubConfig;
pub use error::{HubError, HubResult};
pub use hub::Hub;
pub use store::{DeviceId, Frame, Store};

//! Partitioned key/value store shared by every channel.
//!
//! The store holds one partition per [`DeviceId`]: the surface station plus one
//! per device board. Each partition maps string keys to JSON values and carries
//! a fixed transmission whitelist naming the keys allowed across its wire link.
//!
//! Writes follow the mirror rules:
//!
//! - A surface write for key `K` also lands in the device partition that
//!   whitelists `K`, unconditionally.
//! - A device write for key `K` also lands in the surface partition, but only
//!   when `K` already exists there.
//!
//! Every key is individually atomic (partitions are [`DashMap`]s). There are no
//! multi-key transactions, so concurrent writers to different keys never
//! conflict and the last writer to a key wins.
//!
//! # Example
//!
//! ```
//! use rov_hub::store::{DeviceId, Store};
//! use serde_json::json;
//!
//! let surface = DeviceId::from("surface");
//! let thrusters = DeviceId::from("Ard_T");
//! let store = Store::builder(surface.clone(), ["status_T"])
//!     .device(thrusters.clone(), ["Thr_FP"])
//!     .build()
//!     .unwrap();
//!
//! store.set(&surface, rov_hub::store::frame(json!({"Thr_FP": 1600}))).unwrap();
//! assert_eq!(store.get(&thrusters, &[], true).unwrap()["Thr_FP"], 1600);
//! ```

use crate::error::{HubError, HubResult};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

/// A key/value mapping as exchanged over the wire, in insertion order.
pub type Frame = Map<String, Value>;

/// Build a [`Frame`] from a JSON value, yielding an empty frame for non-objects.
pub fn frame(value: Value) -> Frame {
    match value {
        Value::Object(map) => map,
        _ => Frame::new(),
    }
}

/// Identity of a partition. Cheap to clone and compare.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(Arc<str>);

impl DeviceId {
    /// Borrow the identity as text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self(Arc::from(value))
    }
}

impl From<String> for DeviceId {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

/// Two devices whitelisted the same key. The first one configured owns it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyConflict {
    /// The contested key.
    pub key: String,
    /// Device that owns the key in the reverse lookup.
    pub owner: DeviceId,
    /// Device whose claim was rejected.
    pub rejected: DeviceId,
}

impl fmt::Display for KeyConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "key '{}' is whitelisted by both '{}' and '{}'",
            self.key, self.owner, self.rejected
        )
    }
}

struct Partition {
    values: DashMap<String, Value>,
    /// Whitelist in configured order.
    transmit: Vec<String>,
    transmit_set: HashSet<String>,
}

impl Partition {
    fn new<I, S>(transmit: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut ordered = Vec::new();
        let mut set = HashSet::new();
        for key in transmit {
            let key = key.into();
            if set.insert(key.clone()) {
                ordered.push(key);
            }
        }
        Self {
            values: DashMap::new(),
            transmit: ordered,
            transmit_set: set,
        }
    }

    fn read(&self, key: &str) -> Option<Value> {
        self.values.get(key).map(|entry| entry.value().clone())
    }
}

/// Builder for [`Store`]. Partitions and whitelists are fixed once built.
pub struct StoreBuilder {
    surface: DeviceId,
    surface_transmit: Vec<String>,
    devices: Vec<(DeviceId, Vec<String>)>,
    defaults: Frame,
}

impl StoreBuilder {
    /// Add a device partition with its transmission whitelist.
    pub fn device<I, S>(mut self, id: DeviceId, transmit: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.devices
            .push((id, transmit.into_iter().map(Into::into).collect()));
        self
    }

    /// Set the default snapshot applied by [`Store::reset_to_default`].
    pub fn defaults(mut self, defaults: Frame) -> Self {
        self.defaults = defaults;
        self
    }

    /// Build the store and its reverse key lookup.
    ///
    /// # Errors
    /// Returns [`HubError::Configuration`] if an identity is declared twice.
    /// Whitelist conflicts are not errors here: the device declared first keeps
    /// the key and the conflict is recorded in [`Store::conflicts`].
    pub fn build(self) -> HubResult<Store> {
        let mut partitions = HashMap::with_capacity(self.devices.len() + 1);
        partitions.insert(
            self.surface.clone(),
            Partition::new(self.surface_transmit),
        );

        let mut lookup: HashMap<String, DeviceId> = HashMap::new();
        let mut conflicts = Vec::new();
        let mut order = vec![self.surface.clone()];

        for (id, transmit) in self.devices {
            if partitions.contains_key(&id) {
                return Err(HubError::Configuration(format!(
                    "identity '{id}' is declared more than once"
                )));
            }
            let partition = Partition::new(transmit);
            for key in &partition.transmit {
                match lookup.get(key) {
                    Some(owner) => conflicts.push(KeyConflict {
                        key: key.clone(),
                        owner: owner.clone(),
                        rejected: id.clone(),
                    }),
                    None => {
                        lookup.insert(key.clone(), id.clone());
                    }
                }
            }
            order.push(id.clone());
            partitions.insert(id, partition);
        }

        for conflict in &conflicts {
            tracing::error!(
                key = %conflict.key,
                owner = %conflict.owner,
                rejected = %conflict.rejected,
                "Transmission whitelist conflict"
            );
        }

        Ok(Store {
            surface: self.surface,
            order,
            partitions,
            lookup,
            conflicts,
            defaults: self.defaults,
        })
    }
}

/// The synchronized store. Share it between channels behind an `Arc`.
pub struct Store {
    surface: DeviceId,
    order: Vec<DeviceId>,
    partitions: HashMap<DeviceId, Partition>,
    lookup: HashMap<String, DeviceId>,
    conflicts: Vec<KeyConflict>,
    defaults: Frame,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("surface", &self.surface)
            .field("identities", &self.order)
            .field("conflicts", &self.conflicts.len())
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Start building a store around the surface partition.
    pub fn builder<I, S>(surface: DeviceId, surface_transmit: I) -> StoreBuilder
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        StoreBuilder {
            surface,
            surface_transmit: surface_transmit.into_iter().map(Into::into).collect(),
            devices: Vec::new(),
            defaults: Frame::new(),
        }
    }

    /// Identity of the surface partition.
    pub fn surface(&self) -> &DeviceId {
        &self.surface
    }

    /// All identities, surface first, then devices in configured order.
    pub fn identities(&self) -> &[DeviceId] {
        &self.order
    }

    /// Whether a partition exists for `identity`.
    pub fn contains(&self, identity: &DeviceId) -> bool {
        self.partitions.contains_key(identity)
    }

    /// Device that owns a whitelisted key.
    pub fn owner_of(&self, key: &str) -> Option<&DeviceId> {
        self.lookup.get(key)
    }

    /// Whether `key` may cross the wire for `identity`.
    pub fn is_transmitted(&self, identity: &DeviceId, key: &str) -> bool {
        self.partitions
            .get(identity)
            .is_some_and(|p| p.transmit_set.contains(key))
    }

    /// Whitelist conflicts found while building the reverse lookup.
    pub fn conflicts(&self) -> &[KeyConflict] {
        &self.conflicts
    }

    /// The default snapshot.
    pub fn defaults(&self) -> &Frame {
        &self.defaults
    }

    fn partition(&self, identity: &DeviceId) -> HubResult<&Partition> {
        self.partitions
            .get(identity)
            .ok_or_else(|| HubError::UnknownPartition(identity.clone()))
    }

    /// Read from a partition.
    ///
    /// With no `keys` the whole partition is returned (sorted by key), or with
    /// `transmit_only` the whitelisted subset in whitelist order. With `keys`,
    /// exactly the requested keys that are present are returned, further
    /// filtered by the whitelist when `transmit_only` is set. Missing keys are
    /// omitted.
    pub fn get(
        &self,
        identity: &DeviceId,
        keys: &[&str],
        transmit_only: bool,
    ) -> HubResult<Frame> {
        let partition = self.partition(identity)?;
        let mut out = Frame::new();

        if !keys.is_empty() {
            for key in keys {
                if transmit_only && !partition.transmit_set.contains(*key) {
                    continue;
                }
                if let Some(value) = partition.read(key) {
                    out.insert((*key).to_string(), value);
                }
            }
        } else if transmit_only {
            for key in &partition.transmit {
                if let Some(value) = partition.read(key) {
                    out.insert(key.clone(), value);
                }
            }
        } else {
            let mut entries: Vec<(String, Value)> = partition
                .values
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            out.extend(entries);
        }

        Ok(out)
    }

    /// Write a frame into a partition, applying the mirror rules key by key in
    /// the frame's order.
    pub fn set(&self, identity: &DeviceId, frame: Frame) -> HubResult<()> {
        let surface = self.partition(&self.surface)?;

        if *identity == self.surface {
            for (key, value) in frame {
                if let Some(owner) = self.lookup.get(&key) {
                    if let Some(device) = self.partitions.get(owner) {
                        device.values.insert(key.clone(), value.clone());
                    }
                }
                surface.values.insert(key, value);
            }
            return Ok(());
        }

        let device = self.partition(identity)?;
        for (key, value) in frame {
            // get_mut only matches keys that already exist on the surface
            if let Some(mut slot) = surface.values.get_mut(&key) {
                *slot = value.clone();
            }
            device.values.insert(key, value);
        }
        Ok(())
    }

    /// Force the default snapshot onto the surface partition.
    ///
    /// Only surface keys named in the snapshot are overwritten. Device
    /// partitions are left as they are.
    pub fn reset_to_default(&self) {
        let Some(surface) = self.partitions.get(&self.surface) else {
            return;
        };
        for (key, value) in &self.defaults {
            surface.values.insert(key.clone(), value.clone());
        }
    }

    /// Drop every key from every partition.
    pub fn clear(&self) {
        for partition in self.partitions.values() {
            partition.values.clear();
        }
    }
}

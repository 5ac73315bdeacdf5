// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Devhost table, host-bound requests, and outbound coordinator messages.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::Serialize;

use crate::device::DeviceId;
use crate::power::{PowerState, SuspendFlags};
use crate::task::{TaskKind, Txid};

/// Identifier of a driver-host process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DevhostId(u64);

impl DevhostId {
    /// Devhost carrying the root device.
    pub const ROOT: Self = Self(0);

    /// Return the raw identifier.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for DevhostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host#{}", self.0)
    }
}

/// Driver selected for a Bind task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverRef {
    /// Driver library name.
    pub name: String,
    /// Run the driver in the device's own devhost.
    pub colocate: bool,
}

impl DriverRef {
    /// Driver that runs alongside the device it binds to.
    pub fn colocated(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            colocate: true,
        }
    }

    /// Driver that runs in a devhost of its own.
    pub fn isolated(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            colocate: false,
        }
    }
}

/// Request delivered to a devhost about one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRequest {
    /// Start `driver` against the device.
    Bind {
        /// Driver library name.
        driver: String,
    },
    /// Build an assembled composite from component nodes.
    CreateComposite {
        /// Descriptor name.
        name: String,
        /// Component nodes in slot order.
        components: Vec<DeviceId>,
    },
    /// Run the init hook.
    Init,
    /// Run the unbind hook.
    Unbind,
    /// Release the device.
    Remove,
    /// Enter a low-power state.
    Suspend {
        /// Reason flags for the sweep.
        flags: SuspendFlags,
    },
    /// Return to a working state.
    Resume {
        /// Requested power state.
        target: PowerState,
    },
}

impl HostRequest {
    /// Task slot this request occupies.
    pub fn kind(&self) -> TaskKind {
        match self {
            Self::Bind { .. } => TaskKind::Bind,
            Self::CreateComposite { .. } => TaskKind::Create,
            Self::Init => TaskKind::Init,
            Self::Unbind => TaskKind::Unbind,
            Self::Remove => TaskKind::Remove,
            Self::Suspend { .. } => TaskKind::Suspend,
            Self::Resume { .. } => TaskKind::Resume,
        }
    }
}

/// Message the embedder must deliver on the coordinator's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Spawn the process backing a new devhost.
    Launch {
        /// New devhost.
        host: DevhostId,
        /// Diagnostic name.
        name: String,
    },
    /// Deliver a request; the reply must quote `txid`.
    Request {
        /// Target devhost.
        host: DevhostId,
        /// Correlation identifier.
        txid: Txid,
        /// Device the request concerns.
        device: DeviceId,
        /// Request body.
        request: HostRequest,
    },
    /// The devhost hosts nothing anymore and may exit.
    Teardown {
        /// Idle devhost.
        host: DevhostId,
    },
}

impl Outbound {
    /// Return the request body, if this is a request.
    pub fn request(&self) -> Option<(Txid, DeviceId, &HostRequest)> {
        match self {
            Self::Request {
                txid,
                device,
                request,
                ..
            } => Some((*txid, *device, request)),
            Self::Launch { .. } | Self::Teardown { .. } => None,
        }
    }
}

/// Process-like unit hosting devices.
#[derive(Debug, Clone)]
pub struct Devhost {
    id: DevhostId,
    name: String,
    devices: BTreeSet<DeviceId>,
}

impl Devhost {
    /// Devhost identifier.
    pub fn id(&self) -> DevhostId {
        self.id
    }

    /// Diagnostic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Devices currently hosted here.
    pub fn devices(&self) -> impl Iterator<Item = DeviceId> + '_ {
        self.devices.iter().copied()
    }

    /// Whether the devhost hosts nothing.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// Set of live devhosts.
#[derive(Debug, Default)]
pub(crate) struct DevhostTable {
    hosts: BTreeMap<DevhostId, Devhost>,
    next: u64,
}

impl DevhostTable {
    pub fn create(&mut self, name: impl Into<String>) -> DevhostId {
        let id = DevhostId(self.next);
        self.next += 1;
        self.hosts.insert(
            id,
            Devhost {
                id,
                name: name.into(),
                devices: BTreeSet::new(),
            },
        );
        id
    }

    pub fn get(&self, id: DevhostId) -> Option<&Devhost> {
        self.hosts.get(&id)
    }

    pub fn contains(&self, id: DevhostId) -> bool {
        self.hosts.contains_key(&id)
    }

    pub fn attach(&mut self, id: DevhostId, device: DeviceId) {
        if let Some(host) = self.hosts.get_mut(&id) {
            host.devices.insert(device);
        }
    }

    /// Detach `device`; returns true when the devhost became empty.
    pub fn detach(&mut self, id: DevhostId, device: DeviceId) -> bool {
        match self.hosts.get_mut(&id) {
            Some(host) => host.devices.remove(&device) && host.devices.is_empty(),
            None => false,
        }
    }

    pub fn remove(&mut self, id: DevhostId) -> Option<Devhost> {
        self.hosts.remove(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Devhost> {
        self.hosts.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detach_reports_the_last_device() {
        let mut table = DevhostTable::default();
        let root = table.create("root");
        assert_eq!(root, DevhostId::ROOT);
        let host = table.create("driver-usb");
        table.attach(host, DeviceId::from_raw(4));
        table.attach(host, DeviceId::from_raw(5));
        assert!(!table.detach(host, DeviceId::from_raw(4)));
        assert!(table.detach(host, DeviceId::from_raw(5)));
        assert!(table.get(host).is_some_and(Devhost::is_empty));
    }

    #[test]
    fn request_kinds_follow_slots() {
        assert_eq!(HostRequest::Init.kind(), TaskKind::Init);
        let create = HostRequest::CreateComposite {
            name: "audio".to_owned(),
            components: Vec::new(),
        };
        assert_eq!(create.kind(), TaskKind::Create);
    }
}

// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Topological paths, metadata lookup, and topology snapshots.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use serde::Serialize;

use super::Coordinator;
use crate::device::{DeviceId, DeviceState};
use crate::devhost::DevhostId;
use crate::error::{CoordinatorError, Result};

/// Serializable view of the live tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopologySnapshot {
    /// Live devices in depth-first order from the root.
    pub devices: Vec<DeviceSnapshot>,
    /// Live devhosts in identifier order.
    pub hosts: Vec<HostSnapshot>,
}

/// One device of a [`TopologySnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSnapshot {
    /// Arena identifier.
    pub id: DeviceId,
    /// Topological path.
    pub path: String,
    /// Protocol identifier.
    pub protocol_id: u32,
    /// Lifecycle state.
    pub state: DeviceState,
    /// Hosting devhost.
    pub host: DevhostId,
    /// `ordinary`, `component`, or `composite`.
    pub kind: &'static str,
    /// Published for enumeration.
    pub visible: bool,
    /// Bound driver, if any.
    pub driver: Option<String>,
}

/// One devhost of a [`TopologySnapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostSnapshot {
    /// Devhost identifier.
    pub id: DevhostId,
    /// Diagnostic name.
    pub name: String,
    /// Number of hosted devices.
    pub devices: usize,
}

impl Coordinator {
    /// Slash-separated names from the root, e.g. `/dev/sys/pci`.
    pub fn topological_path(&self, id: DeviceId) -> Result<String> {
        self.live(id)?;
        Ok(self.path_of(id))
    }

    pub(crate) fn path_of(&self, id: DeviceId) -> String {
        let mut names = Vec::new();
        let mut cursor = Some(id);
        while let Some(device) = cursor.and_then(|current| self.devices.get(&current)) {
            names.push(device.name.as_str());
            cursor = device.parent;
        }
        names.reverse();
        format!("/{}", names.join("/"))
    }

    /// Resolve a topological path to a live device.
    pub fn lookup_path(&self, path: &str) -> Result<DeviceId> {
        let Some(rest) = path.strip_prefix('/') else {
            return Err(CoordinatorError::invalid(format!(
                "path '{path}' is not absolute"
            )));
        };
        let mut components = rest.split('/');
        let root = self.live(DeviceId::ROOT)?;
        if components.next() != Some(root.name.as_str()) {
            return Err(CoordinatorError::UnknownPath(path.to_owned()));
        }
        let mut current = DeviceId::ROOT;
        for component in components {
            let next = self.devices.get(&current).and_then(|device| {
                device.children.iter().copied().find(|child| {
                    self.devices
                        .get(child)
                        .is_some_and(|child| child.name == component && !child.state.is_dead())
                })
            });
            match next {
                Some(child) => current = child,
                None => return Err(CoordinatorError::UnknownPath(path.to_owned())),
            }
        }
        Ok(current)
    }

    /// Resolve metadata for a device.
    ///
    /// At each step the device's own metadata wins over metadata published
    /// at its path; the walk then continues with the parent up to the root.
    pub fn get_metadata(&self, id: DeviceId, key: u32) -> Result<Vec<u8>> {
        self.live(id)?;
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(device) = self.devices.get(&current) else {
                break;
            };
            if let Some(data) = device.own_metadata(key) {
                return Ok(data.to_vec());
            }
            if let Some(data) = self.metadata.lookup(&self.path_of(current), key) {
                return Ok(data.to_vec());
            }
            cursor = device.parent;
        }
        Err(CoordinatorError::MetadataNotFound { device: id, key })
    }

    /// Publish metadata against a path; later lookups from any device at or
    /// below that path see it.
    pub fn publish_metadata(&mut self, path: &str, key: u32, data: impl Into<Vec<u8>>) -> Result<()> {
        self.metadata.publish(path, key, data.into())
    }

    /// Capture the live tree.
    pub fn snapshot(&self) -> TopologySnapshot {
        let devices = self
            .preorder()
            .into_iter()
            .filter_map(|id| self.devices.get(&id))
            .map(|device| DeviceSnapshot {
                id: device.id,
                path: self.path_of(device.id),
                protocol_id: device.protocol_id,
                state: device.state,
                host: device.host,
                kind: device.kind.label(),
                visible: device.published,
                driver: device.bound_driver.clone(),
            })
            .collect();
        let hosts = self
            .hosts
            .iter()
            .map(|host| HostSnapshot {
                id: host.id(),
                name: host.name().to_owned(),
                devices: host.devices().count(),
            })
            .collect();
        TopologySnapshot { devices, hosts }
    }

    /// Drop tombstones of dead devices; returns how many were dropped.
    pub fn reap_dead(&mut self) -> usize {
        let before = self.devices.len();
        self.devices.retain(|_, device| !device.state.is_dead());
        before - self.devices.len()
    }
}

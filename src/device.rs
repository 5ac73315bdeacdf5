// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Device records, lifecycle states, and AddDevice argument validation.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeSet;
use std::fmt;

use bitflags::bitflags;
use serde::Serialize;

use crate::devhost::DevhostId;
use crate::error::{CoordinatorError, Result};
use crate::metadata::MetadataEntry;
use crate::task::{TaskKind, TaskSlots, Txid};

/// Stable arena identifier of a device; never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct DeviceId(u64);

impl DeviceId {
    /// The immortal root device.
    pub const ROOT: Self = Self(0);

    /// Return the raw identifier.
    pub const fn raw(self) -> u64 {
        self.0
    }

    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev#{}", self.0)
    }
}

/// Lifecycle states of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DeviceState {
    /// Added by a driver; Init not yet issued.
    Created,
    /// Init request outstanding.
    Initializing,
    /// Initialised and operational.
    Active,
    /// Suspend request outstanding.
    Suspending,
    /// Suspended by a power sweep.
    Suspended,
    /// Resume request outstanding.
    Resuming,
    /// Unbind request outstanding.
    Unbinding,
    /// Unbind finished or skipped; waiting to be removed.
    Unbound,
    /// Remove request outstanding.
    Removing,
    /// Terminal; the device is gone.
    Dead,
}

impl DeviceState {
    /// Render the canonical state label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Initializing => "INITIALIZING",
            Self::Active => "ACTIVE",
            Self::Suspending => "SUSPENDING",
            Self::Suspended => "SUSPENDED",
            Self::Resuming => "RESUMING",
            Self::Unbinding => "UNBINDING",
            Self::Unbound => "UNBOUND",
            Self::Removing => "REMOVING",
            Self::Dead => "DEAD",
        }
    }

    /// Return true for the terminal state.
    pub fn is_dead(self) -> bool {
        matches!(self, Self::Dead)
    }

    /// Return true once the unbind phase finished or was skipped.
    pub(crate) fn past_unbind(self) -> bool {
        matches!(self, Self::Unbound | Self::Removing | Self::Dead)
    }

    /// Return true while Init has not resolved.
    pub(crate) fn awaiting_init(self) -> bool {
        matches!(self, Self::Created | Self::Initializing)
    }

    /// Return true while a power sweep holds the device out of `Active`.
    pub(crate) fn low_power(self) -> bool {
        matches!(self, Self::Suspending | Self::Suspended | Self::Resuming)
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Flags supplied with AddDevice.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DeviceFlags: u32 {
        /// Do not publish until MakeVisible is called.
        const INVISIBLE = 1 << 0;
        /// Drivers bound to this device run in the device's own devhost.
        const COLOCATE = 1 << 1;
        /// The device can never be removed.
        const IMMORTAL = 1 << 2;
    }
}

/// Key/value binding property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceProperty {
    /// Property key.
    pub key: u32,
    /// Property value.
    pub value: u32,
}

impl DeviceProperty {
    /// Build a property.
    pub const fn new(key: u32, value: u32) -> Self {
        Self { key, value }
    }
}

/// Whether a device is ordinary, a component node, or an assembled composite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceKind {
    /// Added by a driver.
    Ordinary,
    /// Synthetic child created when a real device matched a composite slot.
    Component {
        /// Descriptor the node belongs to.
        descriptor: String,
        /// Slot index the node fills.
        slot: usize,
        /// Assembled instance consuming this node, if any.
        instance: Option<DeviceId>,
    },
    /// Device assembled from component nodes.
    Composite {
        /// Descriptor the instance was built from.
        descriptor: String,
        /// Component nodes in slot order.
        components: Vec<DeviceId>,
    },
}

impl DeviceKind {
    /// Render a short label for logs and snapshots.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Ordinary => "ordinary",
            Self::Component { .. } => "component",
            Self::Composite { .. } => "composite",
        }
    }
}

/// Pending teardown recorded against a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RemovalRequest {
    pub unbind: bool,
    pub propagated: bool,
}

/// Arguments of an AddDevice request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddDeviceArgs {
    /// Name published under the parent.
    pub name: String,
    /// Protocol identifier.
    pub protocol_id: u32,
    /// Ordered binding properties.
    pub properties: Vec<DeviceProperty>,
    /// Metadata attached directly to the device.
    pub metadata: Vec<MetadataEntry>,
    /// Add flags.
    pub flags: DeviceFlags,
}

impl AddDeviceArgs {
    /// Start building arguments for a named device.
    pub fn new(name: impl Into<String>, protocol_id: u32) -> Self {
        Self {
            name: name.into(),
            protocol_id,
            ..Self::default()
        }
    }

    /// Append a binding property.
    #[must_use]
    pub fn property(mut self, key: u32, value: u32) -> Self {
        self.properties.push(DeviceProperty::new(key, value));
        self
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn metadata(mut self, key: u32, data: impl Into<Vec<u8>>) -> Self {
        self.metadata.push(MetadataEntry::new(key, data));
        self
    }

    /// Set add flags.
    #[must_use]
    pub fn flags(mut self, flags: DeviceFlags) -> Self {
        self.flags = flags;
        self
    }
}

/// Node of the device tree.
#[derive(Debug, Clone)]
pub struct Device {
    pub(crate) id: DeviceId,
    pub(crate) name: String,
    pub(crate) protocol_id: u32,
    pub(crate) properties: Vec<DeviceProperty>,
    pub(crate) parent: Option<DeviceId>,
    pub(crate) children: Vec<DeviceId>,
    pub(crate) host: DevhostId,
    pub(crate) state: DeviceState,
    pub(crate) flags: DeviceFlags,
    pub(crate) kind: DeviceKind,
    pub(crate) metadata: Vec<MetadataEntry>,
    pub(crate) tasks: TaskSlots,
    pub(crate) removal: Option<RemovalRequest>,
    pub(crate) visible_requested: bool,
    pub(crate) published: bool,
    pub(crate) bound_driver: Option<String>,
    pub(crate) driver_host: Option<DevhostId>,
    pub(crate) pending_bind: Option<(String, DevhostId)>,
    pub(crate) remove_attempts: u32,
}

impl Device {
    pub(crate) fn new(
        id: DeviceId,
        parent: Option<DeviceId>,
        host: DevhostId,
        args: AddDeviceArgs,
        kind: DeviceKind,
    ) -> Self {
        Self {
            id,
            name: args.name,
            protocol_id: args.protocol_id,
            properties: args.properties,
            parent,
            children: Vec::new(),
            host,
            state: DeviceState::Created,
            flags: args.flags,
            kind,
            metadata: args.metadata,
            tasks: TaskSlots::default(),
            removal: None,
            visible_requested: false,
            published: false,
            bound_driver: None,
            driver_host: None,
            pending_bind: None,
            remove_attempts: 0,
        }
    }

    /// Arena identifier.
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Published name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Protocol identifier.
    pub fn protocol_id(&self) -> u32 {
        self.protocol_id
    }

    /// Binding properties in insertion order.
    pub fn properties(&self) -> &[DeviceProperty] {
        &self.properties
    }

    /// Parent device; `None` for the root and for tombstones.
    pub fn parent(&self) -> Option<DeviceId> {
        self.parent
    }

    /// Live children in insertion order.
    pub fn children(&self) -> &[DeviceId] {
        &self.children
    }

    /// Devhost the device lives in.
    pub fn host(&self) -> DevhostId {
        self.host
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Flags supplied at AddDevice.
    pub fn flags(&self) -> DeviceFlags {
        self.flags
    }

    /// Ordinary, component node, or composite instance.
    pub fn kind(&self) -> &DeviceKind {
        &self.kind
    }

    /// Metadata attached directly to the device.
    pub fn metadata(&self) -> &[MetadataEntry] {
        &self.metadata
    }

    /// Whether the device is currently published for enumeration.
    pub fn is_visible(&self) -> bool {
        self.published
    }

    /// Driver bound by the last successful Bind task.
    pub fn bound_driver(&self) -> Option<&str> {
        self.bound_driver.as_deref()
    }

    /// Devhost running the bound driver; devices it adds live there.
    pub fn driver_host(&self) -> Option<DevhostId> {
        self.driver_host
    }

    /// Number of Remove requests issued for this device.
    pub fn remove_attempts(&self) -> u32 {
        self.remove_attempts
    }

    /// Outstanding transaction for the task kind, if any.
    pub fn active_task(&self, kind: TaskKind) -> Option<Txid> {
        self.tasks.in_flight(kind)
    }

    /// Whether a removal has been scheduled.
    pub fn removal_scheduled(&self) -> bool {
        self.removal.is_some()
    }

    pub(crate) fn own_metadata(&self, key: u32) -> Option<&[u8]> {
        self.metadata
            .iter()
            .find(|entry| entry.key == key)
            .map(|entry| entry.data.as_slice())
    }

    pub(crate) fn is_component(&self) -> bool {
        matches!(self.kind, DeviceKind::Component { .. })
    }
}

/// Reject names that are empty, too long, or contain a path separator.
pub fn validate_name(name: &str, max_len: usize) -> Result<()> {
    if name.is_empty() {
        return Err(CoordinatorError::invalid("device name is empty"));
    }
    if name.len() > max_len {
        return Err(CoordinatorError::invalid(format!(
            "device name '{name}' exceeds {max_len} bytes"
        )));
    }
    if name.contains('/') || name.chars().any(char::is_control) {
        return Err(CoordinatorError::invalid(format!(
            "device name '{name}' contains a reserved character"
        )));
    }
    Ok(())
}

/// Reject property lists that bind the same key twice.
pub fn validate_properties(properties: &[DeviceProperty]) -> Result<()> {
    let mut seen = BTreeSet::new();
    for property in properties {
        if !seen.insert(property.key) {
            return Err(CoordinatorError::invalid(format!(
                "duplicate property key {:#x}",
                property.key
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_validated() {
        assert!(validate_name("pci-00:01", 31).is_ok());
        assert!(validate_name("", 31).is_err());
        assert!(validate_name("a/b", 31).is_err());
        assert!(validate_name(&"x".repeat(32), 31).is_err());
    }

    #[test]
    fn duplicate_property_keys_are_rejected() {
        let ok = [DeviceProperty::new(1, 2), DeviceProperty::new(2, 2)];
        assert!(validate_properties(&ok).is_ok());
        let dup = [DeviceProperty::new(1, 2), DeviceProperty::new(1, 3)];
        let err = validate_properties(&dup).expect_err("duplicate key");
        assert_eq!(err.status(), crate::error::Status::InvalidArgs);
    }

    #[test]
    fn unbind_phase_boundaries() {
        assert!(!DeviceState::Unbinding.past_unbind());
        assert!(DeviceState::Unbound.past_unbind());
        assert!(DeviceState::Created.awaiting_init());
        assert!(!DeviceState::Active.awaiting_init());
        assert!(DeviceState::Suspended.low_power());
        assert!(!DeviceState::Active.low_power());
    }
}

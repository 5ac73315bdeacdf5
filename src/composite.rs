// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Composite descriptors, slot predicates, and registry entries.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::BTreeSet;

use crate::device::{validate_name, validate_properties, DeviceId, DeviceProperty};
use crate::error::{CoordinatorError, Result};
use crate::metadata::MetadataEntry;

/// Predicate a device must satisfy to fill a slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchPredicate {
    /// Required protocol identifier.
    pub protocol_id: Option<u32>,
    /// Properties that must be present with equal values.
    pub properties: Vec<DeviceProperty>,
}

impl MatchPredicate {
    /// Match any device speaking `protocol_id`.
    pub fn protocol(protocol_id: u32) -> Self {
        Self {
            protocol_id: Some(protocol_id),
            properties: Vec::new(),
        }
    }

    /// Require an additional property.
    #[must_use]
    pub fn property(mut self, key: u32, value: u32) -> Self {
        self.properties.push(DeviceProperty::new(key, value));
        self
    }

    /// Evaluate the predicate against a device's identity.
    pub fn matches(&self, protocol_id: u32, properties: &[DeviceProperty]) -> bool {
        if self.protocol_id.is_some_and(|want| want != protocol_id) {
            return false;
        }
        self.properties
            .iter()
            .all(|want| properties.iter().any(|have| have == want))
    }

    fn is_empty(&self) -> bool {
        self.protocol_id.is_none() && self.properties.is_empty()
    }
}

/// One component slot of a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentSlot {
    /// Slot name; also names the component node.
    pub name: String,
    /// Match predicate.
    pub predicate: MatchPredicate,
}

/// Named specification of a composite device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeDescriptor {
    /// Descriptor name; the assembled device is published under it.
    pub name: String,
    /// Ordered component slots.
    pub slots: Vec<ComponentSlot>,
    /// Slot whose devhost also hosts the assembled device.
    pub coresident: Option<usize>,
    /// Properties of the assembled device.
    pub properties: Vec<DeviceProperty>,
    /// Metadata of the assembled device.
    pub metadata: Vec<MetadataEntry>,
}

impl CompositeDescriptor {
    /// Start a descriptor with no slots.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: Vec::new(),
            coresident: None,
            properties: Vec::new(),
            metadata: Vec::new(),
        }
    }

    /// Append a slot.
    #[must_use]
    pub fn slot(mut self, name: impl Into<String>, predicate: MatchPredicate) -> Self {
        self.slots.push(ComponentSlot {
            name: name.into(),
            predicate,
        });
        self
    }

    /// Mark the slot whose devhost hosts the assembled device.
    #[must_use]
    pub fn coresident(mut self, slot: usize) -> Self {
        self.coresident = Some(slot);
        self
    }

    /// Declare a property of the assembled device.
    #[must_use]
    pub fn property(mut self, key: u32, value: u32) -> Self {
        self.properties.push(DeviceProperty::new(key, value));
        self
    }

    /// Declare metadata of the assembled device.
    #[must_use]
    pub fn metadata(mut self, key: u32, data: impl Into<Vec<u8>>) -> Self {
        self.metadata.push(MetadataEntry::new(key, data));
        self
    }

    /// Name of the component node a device grows for `slot`.
    pub fn component_name(&self, slot: usize) -> String {
        match self.slots.get(slot) {
            Some(entry) => format!("{}-{}", self.name, entry.name),
            None => format!("{}-{slot}", self.name),
        }
    }

    /// Check the descriptor before it enters the registry.
    pub fn validate(&self, max_name_len: usize) -> Result<()> {
        validate_name(&self.name, max_name_len)?;
        if self.slots.is_empty() {
            return Err(CoordinatorError::invalid(format!(
                "composite '{}' declares no slots",
                self.name
            )));
        }
        let mut names = BTreeSet::new();
        for (index, slot) in self.slots.iter().enumerate() {
            validate_name(&self.component_name(index), max_name_len)?;
            if !names.insert(slot.name.as_str()) {
                return Err(CoordinatorError::invalid(format!(
                    "composite '{}' repeats slot '{}'",
                    self.name, slot.name
                )));
            }
            if slot.predicate.is_empty() {
                return Err(CoordinatorError::invalid(format!(
                    "slot '{}' of '{}' matches every device",
                    slot.name, self.name
                )));
            }
        }
        if let Some(coresident) = self.coresident {
            if coresident >= self.slots.len() {
                return Err(CoordinatorError::invalid(format!(
                    "coresident slot {coresident} out of range for '{}'",
                    self.name
                )));
            }
        }
        validate_properties(&self.properties)
    }
}

/// Registry entry: the descriptor plus its current bindings.
#[derive(Debug, Clone)]
pub(crate) struct CompositeEntry {
    pub descriptor: CompositeDescriptor,
    pub bound: Vec<Option<DeviceId>>,
    pub instance: Option<DeviceId>,
    /// A node or the instance died; offer open slots to live devices again.
    pub rescan: bool,
}

impl CompositeEntry {
    pub fn new(descriptor: CompositeDescriptor) -> Self {
        let bound = vec![None; descriptor.slots.len()];
        Self {
            descriptor,
            bound,
            instance: None,
            rescan: false,
        }
    }

    /// First unbound slot whose predicate accepts the device.
    pub fn open_slot_for(&self, protocol_id: u32, properties: &[DeviceProperty]) -> Option<usize> {
        self.descriptor
            .slots
            .iter()
            .enumerate()
            .find(|(index, slot)| {
                self.bound[*index].is_none() && slot.predicate.matches(protocol_id, properties)
            })
            .map(|(index, _)| index)
    }

    /// Component nodes in slot order when every slot is bound.
    pub fn full_binding(&self) -> Option<Vec<DeviceId>> {
        self.bound.iter().copied().collect()
    }

    pub fn unbind_node(&mut self, node: DeviceId) {
        for slot in &mut self.bound {
            if *slot == Some(node) {
                *slot = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sensor_pair() -> CompositeDescriptor {
        CompositeDescriptor::new("sensor")
            .slot("i2c", MatchPredicate::protocol(0x24).property(1, 0x40))
            .slot("gpio", MatchPredicate::protocol(0x14))
            .coresident(0)
    }

    #[test]
    fn predicate_requires_protocol_and_properties() {
        let predicate = MatchPredicate::protocol(0x24).property(1, 0x40);
        assert!(predicate.matches(0x24, &[DeviceProperty::new(1, 0x40)]));
        assert!(!predicate.matches(0x24, &[DeviceProperty::new(1, 0x41)]));
        assert!(!predicate.matches(0x25, &[DeviceProperty::new(1, 0x40)]));
    }

    #[test]
    fn descriptor_validation() {
        assert!(sensor_pair().validate(31).is_ok());
        assert!(CompositeDescriptor::new("empty").validate(31).is_err());
        let repeated = CompositeDescriptor::new("dup")
            .slot("a", MatchPredicate::protocol(1))
            .slot("a", MatchPredicate::protocol(2));
        assert!(repeated.validate(31).is_err());
        let wildcard = CompositeDescriptor::new("any").slot("a", MatchPredicate::default());
        assert!(wildcard.validate(31).is_err());
        let out_of_range = sensor_pair().coresident(5);
        assert!(out_of_range.validate(31).is_err());
    }

    #[test]
    fn entry_tracks_bindings() {
        let mut entry = CompositeEntry::new(sensor_pair());
        assert_eq!(entry.open_slot_for(0x14, &[]), Some(1));
        entry.bound[1] = Some(DeviceId::from_raw(9));
        assert_eq!(entry.open_slot_for(0x14, &[]), None);
        assert!(entry.full_binding().is_none());
        entry.bound[0] = Some(DeviceId::from_raw(8));
        assert_eq!(
            entry.full_binding(),
            Some(vec![DeviceId::from_raw(8), DeviceId::from_raw(9)])
        );
        entry.unbind_node(DeviceId::from_raw(8));
        assert_eq!(entry.bound[0], None);
        assert_eq!(sensor_pair().component_name(1), "sensor-gpio");
    }
}

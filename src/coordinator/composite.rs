// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Composite registry matching and instance assembly.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use log::{debug, info, warn};

use super::Coordinator;
use crate::composite::{CompositeDescriptor, CompositeEntry};
use crate::device::{AddDeviceArgs, DeviceFlags, DeviceId, DeviceKind, DeviceState};
use crate::devhost::HostRequest;
use crate::error::{CoordinatorError, Result, Status};

/// Protocol reported by component nodes.
pub const COMPONENT_PROTOCOL_ID: u32 = 0x434d_504e;
/// Protocol reported by assembled composite devices.
pub const COMPOSITE_PROTOCOL_ID: u32 = 0x434d_5053;

impl Coordinator {
    /// Register a composite descriptor and match it against live devices.
    pub fn define_composite(&mut self, descriptor: CompositeDescriptor) -> Result<()> {
        descriptor.validate(self.config.max_name_len)?;
        if self.composites.contains_key(&descriptor.name) {
            return Err(CoordinatorError::AlreadyExists(format!(
                "composite '{}'",
                descriptor.name
            )));
        }
        let name = descriptor.name.clone();
        info!(
            "[devcoord][composite] define {} slots={} coresident={:?}",
            name,
            descriptor.slots.len(),
            descriptor.coresident
        );
        self.composites
            .insert(name.clone(), CompositeEntry::new(descriptor));
        self.rematch(&name);
        self.pump();
        Ok(())
    }

    /// Live instance assembled from the descriptor, if any.
    pub fn composite_instance(&self, name: &str) -> Option<DeviceId> {
        self.composites.get(name).and_then(|entry| entry.instance)
    }

    /// Registered descriptor names in order.
    pub fn composite_names(&self) -> impl Iterator<Item = &str> {
        self.composites.keys().map(String::as_str)
    }

    /// Offer a newly active device to every descriptor, then re-check
    /// assembly of all descriptors.
    pub(super) fn match_composites(&mut self, id: DeviceId) {
        let names: Vec<String> = self.composites.keys().cloned().collect();
        if self.matchable(id) {
            for name in &names {
                self.bind_component(name, id);
            }
        }
        for name in &names {
            self.try_assemble(name);
        }
    }

    /// Re-evaluate descriptors that lost a node or their instance.
    pub(super) fn step_composites(&mut self) -> bool {
        let names: Vec<String> = self
            .composites
            .iter()
            .filter(|(_, entry)| entry.rescan)
            .map(|(name, _)| name.clone())
            .collect();
        let mut progressed = false;
        for name in names {
            if let Some(entry) = self.composites.get_mut(&name) {
                entry.rescan = false;
            }
            debug!("[devcoord][composite] rescan {}", name);
            progressed |= self.rematch(&name);
        }
        progressed
    }

    /// Offer every matchable live device to the descriptor, then try to
    /// assemble it. Returns whether a node or an instance was created.
    fn rematch(&mut self, name: &str) -> bool {
        let candidates: Vec<DeviceId> = self
            .preorder()
            .into_iter()
            .filter(|id| self.matchable(*id))
            .collect();
        let mut progressed = false;
        for id in candidates {
            progressed |= self.bind_component(name, id);
        }
        progressed | self.try_assemble(name)
    }

    fn matchable(&self, id: DeviceId) -> bool {
        self.devices.get(&id).is_some_and(|device| {
            device.state == DeviceState::Active
                && device.removal.is_none()
                && !device.is_component()
        })
    }

    /// Grow a component node under `id` for the first open slot it fills.
    fn bind_component(&mut self, name: &str, id: DeviceId) -> bool {
        let Some(device) = self.devices.get(&id) else {
            return false;
        };
        let Some(entry) = self.composites.get(name) else {
            return false;
        };
        let already_component = device.children.iter().any(|child| {
            matches!(
                self.devices.get(child).map(|node| &node.kind),
                Some(DeviceKind::Component { descriptor, .. }) if descriptor == name
            )
        });
        if already_component {
            return false;
        }
        let Some(slot) = entry.open_slot_for(device.protocol_id, &device.properties) else {
            return false;
        };
        let node_name = entry.descriptor.component_name(slot);
        let host = device.host;
        if self.sibling_named(id, &node_name) {
            warn!(
                "[devcoord][composite] {} already has a child named {}",
                id, node_name
            );
            return false;
        }
        let args = AddDeviceArgs::new(node_name, COMPONENT_PROTOCOL_ID).flags(DeviceFlags::INVISIBLE);
        let kind = DeviceKind::Component {
            descriptor: name.to_owned(),
            slot,
            instance: None,
        };
        let node = self.insert_device(Some(id), host, args, kind);
        if let Some(node_device) = self.devices.get_mut(&node) {
            node_device.state = DeviceState::Active;
        }
        if let Some(entry) = self.composites.get_mut(name) {
            entry.bound[slot] = Some(node);
        }
        info!(
            "[devcoord][composite] {} slot={} node={} device={}",
            name, slot, node, id
        );
        true
    }

    /// Assemble the descriptor when every slot is bound to an active node.
    fn try_assemble(&mut self, name: &str) -> bool {
        let Some(entry) = self.composites.get(name) else {
            return false;
        };
        if entry.instance.is_some() {
            return false;
        }
        let Some(nodes) = entry.full_binding() else {
            return false;
        };
        let ready = nodes.iter().all(|node| {
            self.devices.get(node).is_some_and(|device| {
                device.state == DeviceState::Active && device.removal.is_none()
            }) && self.suppliers(*node).iter().all(|supplier| {
                self.devices
                    .get(supplier)
                    .is_some_and(|device| device.removal.is_none())
            })
        });
        if !ready {
            return false;
        }
        let descriptor = entry.descriptor.clone();
        let parent = nodes[descriptor.coresident.unwrap_or(0)];
        if self.sibling_named(parent, &descriptor.name) {
            warn!(
                "[devcoord][composite] {} name taken under {}",
                descriptor.name, parent
            );
            return false;
        }
        let host = match descriptor.coresident {
            Some(_) => match self.devices.get(&parent) {
                Some(device) if self.hosts.contains(device.host) => device.host,
                _ => return false,
            },
            None => self.launch_host(format!("composite-{}", descriptor.name)),
        };
        let args = AddDeviceArgs {
            name: descriptor.name.clone(),
            protocol_id: COMPOSITE_PROTOCOL_ID,
            properties: descriptor.properties.clone(),
            metadata: descriptor.metadata.clone(),
            flags: DeviceFlags::empty(),
        };
        let kind = DeviceKind::Composite {
            descriptor: name.to_owned(),
            components: nodes.clone(),
        };
        let instance = self.insert_device(Some(parent), host, args, kind);
        for node in &nodes {
            if let Some(DeviceKind::Component {
                instance: consumer, ..
            }) = self.devices.get_mut(node).map(|device| &mut device.kind)
            {
                *consumer = Some(instance);
            }
        }
        if let Some(entry) = self.composites.get_mut(name) {
            entry.instance = Some(instance);
        }
        info!(
            "[devcoord][composite] assemble {} instance={} parent={} host={}",
            name, instance, parent, host
        );
        let request = HostRequest::CreateComposite {
            name: name.to_owned(),
            components: nodes,
        };
        if self.issue(instance, request).is_none() {
            warn!("[devcoord][composite] {} create not issued; discarding", name);
            self.bury(instance);
            self.hold_pending(name);
            return false;
        }
        true
    }

    pub(super) fn complete_create(&mut self, id: DeviceId, status: Status) {
        if status.is_ok() {
            debug!("[devcoord][composite] {} created", id);
            return;
        }
        warn!(
            "[devcoord][composite] {} create failed status={}; descriptor stays pending",
            id, status
        );
        let descriptor = match self.devices.get(&id).map(|device| &device.kind) {
            Some(DeviceKind::Composite { descriptor, .. }) => Some(descriptor.clone()),
            _ => None,
        };
        self.bury(id);
        if let Some(descriptor) = descriptor {
            self.hold_pending(&descriptor);
        }
    }

    /// A discarded instance waits for the next activation, not a rescan.
    fn hold_pending(&mut self, name: &str) {
        if let Some(entry) = self.composites.get_mut(name) {
            entry.rescan = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composite::MatchPredicate;
    use crate::config::CoordinatorConfig;

    #[test]
    fn duplicate_descriptor_is_rejected() {
        let mut coordinator = Coordinator::new(CoordinatorConfig::default()).expect("boot");
        let descriptor = CompositeDescriptor::new("audio").slot("codec", MatchPredicate::protocol(5));
        coordinator
            .define_composite(descriptor.clone())
            .expect("define");
        let err = coordinator
            .define_composite(descriptor)
            .expect_err("duplicate");
        assert_eq!(err.status(), Status::AlreadyExists);
        assert_eq!(coordinator.composite_names().collect::<Vec<_>>(), vec!["audio"]);
        assert_eq!(coordinator.composite_instance("audio"), None);
    }
}

// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Scheduled removal: ancestor-first unbind, leaf-first remove.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use log::{debug, info, warn};

use super::{Coordinator, Scheduled};
use crate::device::{DeviceFlags, DeviceId, DeviceKind, DeviceState, RemovalRequest};
use crate::devhost::HostRequest;
use crate::error::{CoordinatorError, Result, Status};

impl Coordinator {
    /// Schedule removal of a device and its subtree.
    ///
    /// With `request_unbind`, every affected driver sees Unbind before any
    /// Remove, ancestors first. Repeated requests coalesce; a later request
    /// may still upgrade a pending removal to unbind while the device has not
    /// reached its unbind phase.
    pub fn schedule_remove(&mut self, id: DeviceId, request_unbind: bool) -> Result<Scheduled> {
        let device = self.live(id)?;
        if device.flags.contains(DeviceFlags::IMMORTAL) {
            return Err(CoordinatorError::NotSupported("the root device cannot be removed"));
        }
        let scheduled = self.mark_removal(id, request_unbind);
        info!(
            "[devcoord][remove] schedule {} unbind={} outcome={:?}",
            id, request_unbind, scheduled
        );
        self.pump();
        Ok(scheduled)
    }

    /// Schedule unbind-and-remove for every child of `id`; the device itself
    /// stays. Returns how many children gained a new removal.
    pub fn schedule_unbind_children(&mut self, id: DeviceId) -> Result<usize> {
        let children = self.live(id)?.children.clone();
        let mut scheduled = 0;
        for child in children {
            if self.mark_removal(child, true) == Scheduled::Issued {
                scheduled += 1;
            }
        }
        info!(
            "[devcoord][remove] unbind children of {} scheduled={}",
            id, scheduled
        );
        self.pump();
        Ok(scheduled)
    }

    pub(crate) fn mark_removal(&mut self, id: DeviceId, unbind: bool) -> Scheduled {
        let Some(device) = self.devices.get_mut(&id) else {
            return Scheduled::Coalesced;
        };
        if device.state.is_dead() {
            return Scheduled::Coalesced;
        }
        let before_unbind =
            device.state != DeviceState::Unbinding && !device.state.past_unbind();
        match device.removal.as_mut() {
            Some(existing) => {
                if unbind && !existing.unbind && before_unbind {
                    debug!("[devcoord][remove] {} upgraded to unbind", id);
                    existing.unbind = true;
                }
                Scheduled::Coalesced
            }
            None => {
                device.removal = Some(RemovalRequest {
                    unbind,
                    propagated: false,
                });
                Scheduled::Issued
            }
        }
    }

    pub(super) fn step_removal(&mut self) -> bool {
        let mut progressed = false;
        for id in self.preorder() {
            progressed |= self.advance_removal(id);
        }
        progressed
    }

    fn advance_removal(&mut self, id: DeviceId) -> bool {
        let Some(device) = self.devices.get(&id) else {
            return false;
        };
        let Some(removal) = device.removal else {
            return false;
        };
        if device.tasks.is_busy() {
            return false;
        }
        let state = device.state;
        match state {
            DeviceState::Dead | DeviceState::Unbinding | DeviceState::Removing => false,
            DeviceState::Unbound => {
                if !removal.propagated {
                    self.propagate_removal(id);
                    return true;
                }
                if !self.dependents(id).is_empty() {
                    return false;
                }
                if self.issue(id, HostRequest::Remove).is_none() {
                    return false;
                }
                if let Some(device) = self.devices.get_mut(&id) {
                    device.state = DeviceState::Removing;
                    device.remove_attempts += 1;
                }
                info!("[devcoord][remove] {} remove issued", id);
                true
            }
            _ if removal.unbind && state != DeviceState::Created => {
                if self.unbind_blocked(id) {
                    return false;
                }
                if self.issue(id, HostRequest::Unbind).is_none() {
                    return false;
                }
                if let Some(device) = self.devices.get_mut(&id) {
                    device.state = DeviceState::Unbinding;
                }
                info!("[devcoord][remove] {} unbind issued", id);
                true
            }
            // Never initialised, or removal without unbind: no hook to run.
            _ => {
                if let Some(device) = self.devices.get_mut(&id) {
                    device.state = DeviceState::Unbound;
                }
                debug!("[devcoord][remove] {} unbind skipped", id);
                true
            }
        }
    }

    /// Push the removal down to everything that depends on the device.
    fn propagate_removal(&mut self, id: DeviceId) {
        if let Some(removal) = self
            .devices
            .get_mut(&id)
            .and_then(|device| device.removal.as_mut())
        {
            removal.propagated = true;
        }
        for dependent in self.dependents(id) {
            self.mark_removal(dependent, true);
        }
    }

    /// Unbind waits while any supplier above the device still owes its own
    /// unbind.
    fn unbind_blocked(&self, id: DeviceId) -> bool {
        let mut stack = self.suppliers(id);
        let mut seen = BTreeSet::new();
        while let Some(supplier) = stack.pop() {
            if !seen.insert(supplier) {
                continue;
            }
            let Some(device) = self.devices.get(&supplier) else {
                continue;
            };
            let owes_unbind = device
                .removal
                .is_some_and(|removal| removal.unbind && !device.state.past_unbind());
            if owes_unbind {
                return true;
            }
            stack.extend(self.suppliers(supplier));
        }
        false
    }

    pub(super) fn complete_unbind(&mut self, id: DeviceId, status: Status) {
        if !status.is_ok() {
            warn!("[devcoord][remove] {} unbind failed status={}; continuing", id, status);
        }
        if let Some(device) = self.devices.get_mut(&id) {
            device.state = DeviceState::Unbound;
        }
    }

    pub(super) fn complete_remove(&mut self, id: DeviceId, status: Status) {
        if !status.is_ok() {
            warn!("[devcoord][remove] {} remove failed status={}; releasing", id, status);
        }
        info!("[devcoord][remove] {} dead", id);
        self.bury(id);
    }

    /// Composite bookkeeping when a device dies.
    pub(crate) fn forget_composite_links(&mut self, id: DeviceId, kind: DeviceKind) {
        match kind {
            DeviceKind::Ordinary => {}
            DeviceKind::Component {
                descriptor,
                instance,
                ..
            } => {
                if let Some(entry) = self.composites.get_mut(&descriptor) {
                    entry.unbind_node(id);
                    entry.rescan = true;
                }
                if let Some(instance) = instance.filter(|instance| self.is_live(*instance)) {
                    debug!(
                        "[devcoord][composite] node {} gone; removing instance {}",
                        id, instance
                    );
                    self.mark_removal(instance, true);
                }
            }
            DeviceKind::Composite {
                descriptor,
                components,
            } => {
                if let Some(entry) = self.composites.get_mut(&descriptor) {
                    if entry.instance == Some(id) {
                        entry.instance = None;
                        entry.rescan = true;
                    }
                }
                for node in components {
                    if let Some(DeviceKind::Component { instance, .. }) =
                        self.devices.get_mut(&node).map(|device| &mut device.kind)
                    {
                        if *instance == Some(id) {
                            *instance = None;
                        }
                    }
                }
            }
        }
    }
}

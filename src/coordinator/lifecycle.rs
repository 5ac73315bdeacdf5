// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Device addition, Init gating, visibility, and driver binding.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use log::{debug, info, warn};

use super::{Coordinator, Scheduled};
use crate::device::{validate_name, validate_properties, AddDeviceArgs, DeviceFlags, DeviceId, DeviceKind, DeviceState};
use crate::devhost::{DevhostId, DriverRef, HostRequest};
use crate::error::{CoordinatorError, Result, Status};
use crate::task::TaskKind;

impl Coordinator {
    /// Add a device reported by the driver running in `host`.
    ///
    /// The device starts in `Created`; Init is issued once its parent has
    /// finished initialising and no ancestor is being torn down.
    pub fn add_device(
        &mut self,
        host: DevhostId,
        parent: DeviceId,
        args: AddDeviceArgs,
    ) -> Result<DeviceId> {
        if !self.hosts.contains(host) {
            return Err(CoordinatorError::UnknownHost(host));
        }
        let parent_device = self.live(parent)?;
        if parent_device.removal.is_some() || parent_device.state.past_unbind() {
            return Err(CoordinatorError::Removing(parent));
        }
        if parent_device.is_component() {
            return Err(CoordinatorError::NotSupported(
                "component nodes only parent assembled composites",
            ));
        }
        validate_name(&args.name, self.config.max_name_len)?;
        validate_properties(&args.properties)?;
        if args.flags.contains(DeviceFlags::IMMORTAL) {
            return Err(CoordinatorError::invalid("only the root device is immortal"));
        }
        if self.sibling_named(parent, &args.name) {
            return Err(CoordinatorError::AlreadyExists(format!(
                "{}/{}",
                self.path_of(parent),
                args.name
            )));
        }
        let protocol_id = args.protocol_id;
        let id = self.insert_device(Some(parent), host, args, DeviceKind::Ordinary);
        info!(
            "[devcoord][add] {} path={} host={} protocol={:#x}",
            id,
            self.path_of(id),
            host,
            protocol_id
        );
        self.pump();
        Ok(id)
    }

    /// Publish a device added with [`DeviceFlags::INVISIBLE`].
    ///
    /// Publication happens now if Init already succeeded, otherwise when it
    /// does.
    pub fn make_visible(&mut self, id: DeviceId) -> Result<()> {
        let device = self.live(id)?;
        if device.removal.is_some() {
            return Err(CoordinatorError::Removing(id));
        }
        if device.is_component() {
            return Err(CoordinatorError::NotSupported(
                "component nodes are never published",
            ));
        }
        let initialised = matches!(
            device.state,
            DeviceState::Active
                | DeviceState::Suspending
                | DeviceState::Suspended
                | DeviceState::Resuming
        );
        if let Some(device) = self.devices.get_mut(&id) {
            device.visible_requested = true;
        }
        if initialised {
            self.publish(id);
        }
        Ok(())
    }

    /// Bind a driver to an active device.
    ///
    /// Colocated drivers (or any driver bound to a `COLOCATE` device) run in
    /// the device's devhost; others get a freshly launched devhost.
    pub fn bind_driver(&mut self, id: DeviceId, driver: DriverRef) -> Result<Scheduled> {
        let device = self.live(id)?;
        if device.removal.is_some() {
            return Err(CoordinatorError::Removing(id));
        }
        if device.is_component() {
            return Err(CoordinatorError::NotSupported(
                "component nodes are bound by the coordinator",
            ));
        }
        if device.tasks.in_flight(TaskKind::Bind).is_some() {
            return Ok(Scheduled::Coalesced);
        }
        if device.state != DeviceState::Active {
            return Err(CoordinatorError::BadState {
                device: id,
                state: device.state,
            });
        }
        if device.bound_driver.is_some() {
            return Err(CoordinatorError::AlreadyExists(format!(
                "driver for {}",
                self.path_of(id)
            )));
        }
        if driver.name.is_empty() {
            return Err(CoordinatorError::invalid("driver name is empty"));
        }
        let colocate = driver.colocate || device.flags.contains(DeviceFlags::COLOCATE);
        let own_host = device.host;
        let target = if colocate {
            own_host
        } else {
            self.launch_host(format!("driver-{}", driver.name))
        };
        if self
            .issue_to(id, target, HostRequest::Bind {
                driver: driver.name.clone(),
            })
            .is_none()
        {
            return Err(CoordinatorError::UnknownHost(target));
        }
        if let Some(device) = self.devices.get_mut(&id) {
            device.pending_bind = Some((driver.name.clone(), target));
        }
        info!(
            "[devcoord][bind] {} driver={} host={} colocated={}",
            id, driver.name, target, colocate
        );
        Ok(Scheduled::Issued)
    }

    pub(super) fn complete_bind(&mut self, id: DeviceId, status: Status) {
        let Some(device) = self.devices.get_mut(&id) else {
            return;
        };
        let Some((driver, host)) = device.pending_bind.take() else {
            return;
        };
        let own_host = device.host;
        if status.is_ok() {
            info!("[devcoord][bind] {} driver={} bound host={}", id, driver, host);
            device.bound_driver = Some(driver);
            device.driver_host = Some(host);
        } else {
            warn!(
                "[devcoord][bind] {} driver={} failed status={}",
                id, driver, status
            );
            if host != own_host {
                self.maybe_teardown(host);
            }
        }
    }

    pub(super) fn step_lifecycle(&mut self) -> bool {
        let mut progressed = false;
        for id in self.preorder() {
            if !self.init_ready(id) {
                continue;
            }
            if self.issue(id, HostRequest::Init).is_some() {
                if let Some(device) = self.devices.get_mut(&id) {
                    device.state = DeviceState::Initializing;
                }
                progressed = true;
            }
        }
        progressed
    }

    /// Init runs once the parent is initialised and awake, and nothing above
    /// the device is being torn down.
    fn init_ready(&self, id: DeviceId) -> bool {
        let Some(device) = self.devices.get(&id) else {
            return false;
        };
        if device.state != DeviceState::Created
            || device.removal.is_some()
            || device.is_component()
            || device.tasks.in_flight(TaskKind::Init).is_some()
            || device.tasks.in_flight(TaskKind::Create).is_some()
        {
            return false;
        }
        let mut cursor = device.parent;
        let mut direct = true;
        while let Some(ancestor) = cursor.and_then(|ancestor| self.devices.get(&ancestor)) {
            if ancestor.removal.is_some() {
                return false;
            }
            if direct && (ancestor.state.awaiting_init() || ancestor.state.low_power()) {
                return false;
            }
            direct = false;
            cursor = ancestor.parent;
        }
        true
    }

    pub(super) fn complete_init(&mut self, id: DeviceId, status: Status) {
        let Some(device) = self.devices.get_mut(&id) else {
            return;
        };
        if !status.is_ok() {
            warn!("[devcoord][init] {} failed status={}", id, status);
            self.mark_removal(id, true);
            return;
        }
        device.state = DeviceState::Active;
        if device.removal.is_some() {
            debug!("[devcoord][init] {} active but removal pending", id);
            return;
        }
        let visible = !device.flags.contains(DeviceFlags::INVISIBLE) || device.visible_requested;
        info!("[devcoord][init] {} active visible={}", id, visible);
        if visible {
            self.publish(id);
        }
        self.match_composites(id);
    }
}

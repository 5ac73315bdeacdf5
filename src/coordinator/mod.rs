// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Device tree arena, task engine pump, and devhost event intake.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Single-threaded device coordinator.
//!
//! All state lives in one [`Coordinator`] value. Every public entry point
//! applies one event, then runs the scheduling pump until no device can make
//! further progress. Work for devhosts is appended to an outbox the embedder
//! drains; replies come back through [`Coordinator::handle_reply`].

mod composite;
mod lifecycle;
mod power;
mod query;
mod removal;

use std::collections::BTreeMap;

use log::{debug, error, info, warn};

pub use self::composite::{COMPONENT_PROTOCOL_ID, COMPOSITE_PROTOCOL_ID};
pub use self::query::{DeviceSnapshot, HostSnapshot, TopologySnapshot};

use crate::composite::CompositeEntry;
use crate::config::CoordinatorConfig;
use crate::device::{validate_name, AddDeviceArgs, Device, DeviceFlags, DeviceId, DeviceKind, DeviceState};
use crate::devhost::{Devhost, DevhostId, DevhostTable, HostRequest, Outbound};
use crate::error::{CoordinatorError, Result, Status};
use crate::metadata::MetadataStore;
use crate::notify::{Notification, Outbox};
use crate::power::{PowerSweep, Settle};
use crate::task::{TaskKind, TaskLedger, Txid};

/// Outcome of a request that may coalesce with one already pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduled {
    /// New work was recorded.
    Issued,
    /// Equivalent work was already pending; nothing new was recorded.
    Coalesced,
}

/// Device lifecycle coordinator.
#[derive(Debug)]
pub struct Coordinator {
    config: CoordinatorConfig,
    devices: BTreeMap<DeviceId, Device>,
    hosts: DevhostTable,
    composites: BTreeMap<String, CompositeEntry>,
    metadata: MetadataStore,
    ledger: TaskLedger,
    sweep: Option<PowerSweep>,
    outbox: Outbox,
    next_device: u64,
    next_sweep: u64,
}

impl Coordinator {
    /// Build a coordinator holding only the root device on the root devhost.
    pub fn new(config: CoordinatorConfig) -> Result<Self> {
        validate_name(&config.root_name, config.max_name_len)?;
        let metadata = MetadataStore::new(config.restricted_metadata_roots.clone());
        let root_name = config.root_name.clone();
        let root_host_name = config.root_host_name.clone();
        let mut coordinator = Self {
            config,
            devices: BTreeMap::new(),
            hosts: DevhostTable::default(),
            composites: BTreeMap::new(),
            metadata,
            ledger: TaskLedger::default(),
            sweep: None,
            outbox: Outbox::default(),
            next_device: 0,
            next_sweep: 0,
        };
        let host = coordinator.launch_host(root_host_name);
        let args = AddDeviceArgs::new(root_name, 0).flags(DeviceFlags::IMMORTAL);
        let id = coordinator.insert_device(None, host, args, DeviceKind::Ordinary);
        if let Some(root) = coordinator.devices.get_mut(&id) {
            root.state = DeviceState::Active;
        }
        coordinator.publish(id);
        info!(
            "[devcoord][boot] root={} path={} host={}",
            id,
            coordinator.path_of(id),
            host
        );
        Ok(coordinator)
    }

    /// Active configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Look up a device record; tombstones remain visible until reaped.
    pub fn device(&self, id: DeviceId) -> Result<&Device> {
        self.devices
            .get(&id)
            .ok_or(CoordinatorError::UnknownDevice(id))
    }

    /// Current lifecycle state of a device.
    pub fn state(&self, id: DeviceId) -> Result<DeviceState> {
        self.device(id).map(Device::state)
    }

    /// Live children of a device in insertion order.
    pub fn children(&self, id: DeviceId) -> Result<&[DeviceId]> {
        self.device(id).map(Device::children)
    }

    /// Look up a live devhost.
    pub fn devhost(&self, id: DevhostId) -> Option<&Devhost> {
        self.hosts.get(id)
    }

    /// Iterate live devhosts in identifier order.
    pub fn devhosts(&self) -> impl Iterator<Item = &Devhost> {
        self.hosts.iter()
    }

    /// Requests issued but not yet answered.
    pub fn outstanding_requests(&self) -> usize {
        self.ledger.len()
    }

    /// Messages queued for delivery, oldest first.
    pub fn pending_outbound(&self) -> &[Outbound] {
        self.outbox.outbound()
    }

    /// Take every queued devhost message.
    pub fn drain_outbound(&mut self) -> Vec<Outbound> {
        self.outbox.drain_outbound()
    }

    /// Take every queued notification.
    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        self.outbox.drain_notifications()
    }

    /// Whether a suspend or resume sweep is running.
    pub fn sweep_in_progress(&self) -> bool {
        self.sweep.is_some()
    }

    /// Apply a devhost reply.
    ///
    /// Replies whose transaction is unknown, or whose device slot no longer
    /// refers to the transaction, are logged and dropped.
    pub fn handle_reply(&mut self, txid: Txid, status: Status) {
        let Some(pending) = self.ledger.take(txid) else {
            warn!("[devcoord][reply] stale {} status={}", txid, status);
            return;
        };
        let current = match self.devices.get_mut(&pending.device) {
            Some(device) if !device.state.is_dead() => device.tasks.complete(pending.kind, txid),
            _ => false,
        };
        if !current {
            warn!(
                "[devcoord][reply] stale {} device={} task={}",
                txid, pending.device, pending.kind
            );
            return;
        }
        debug!(
            "[devcoord][reply] {} device={} task={} status={}",
            txid, pending.device, pending.kind, status
        );
        match pending.kind {
            TaskKind::Bind => self.complete_bind(pending.device, status),
            TaskKind::Create => self.complete_create(pending.device, status),
            TaskKind::Init => self.complete_init(pending.device, status),
            TaskKind::Unbind => self.complete_unbind(pending.device, status),
            TaskKind::Remove => self.complete_remove(pending.device, status),
            TaskKind::Suspend => self.complete_suspend(pending.device, status),
            TaskKind::Resume => self.complete_resume(pending.device, status),
        }
        self.pump();
    }

    /// The channel to `host` closed: force every device it hosts dead.
    ///
    /// Outstanding requests addressed to the host are invalidated so that
    /// late replies are ignored, and devices whose driver ran there become
    /// unbound. The root device survives the loss of the root devhost; its
    /// hosted descendants do not.
    pub fn handle_host_closed(&mut self, host: DevhostId) -> Result<()> {
        let hosted: Vec<DeviceId> = match self.hosts.get(host) {
            Some(devhost) => devhost.devices().collect(),
            None => return Err(CoordinatorError::UnknownHost(host)),
        };
        error!(
            "[devcoord][host] {} closed; forcing {} device(s) dead",
            host,
            hosted.len()
        );
        if host == DevhostId::ROOT {
            error!("[devcoord][host] root devhost lost; root device retained");
        } else {
            self.hosts.remove(host);
        }
        for id in hosted {
            if id != DeviceId::ROOT && self.is_live(id) {
                self.kill_subtree(id);
            }
        }
        for device in self.devices.values_mut() {
            if device.state.is_dead() || device.driver_host != Some(host) {
                continue;
            }
            warn!(
                "[devcoord][host] {} lost driver {:?} with {}",
                device.id, device.bound_driver, host
            );
            device.bound_driver = None;
            device.driver_host = None;
        }
        for (txid, entry) in self.ledger.invalidate_host(host) {
            self.abandon_request(txid, entry.device, entry.kind);
        }
        self.pump();
        Ok(())
    }

    /// Clear a live device's slot for a request whose devhost vanished.
    fn abandon_request(&mut self, txid: Txid, id: DeviceId, kind: TaskKind) {
        let Some(device) = self.devices.get_mut(&id) else {
            return;
        };
        if device.state.is_dead() || !device.tasks.complete(kind, txid) {
            return;
        }
        warn!(
            "[devcoord][host] abandoned {} device={} task={}",
            txid, id, kind
        );
        match kind {
            TaskKind::Bind => device.pending_bind = None,
            TaskKind::Suspend => {
                device.state = DeviceState::Active;
                self.settle(id, Settle::Failed(Status::PeerClosed));
            }
            TaskKind::Resume => {
                device.state = DeviceState::Suspended;
                self.settle(id, Settle::Failed(Status::PeerClosed));
            }
            TaskKind::Create | TaskKind::Init | TaskKind::Unbind | TaskKind::Remove => {}
        }
    }

    pub(crate) fn live(&self, id: DeviceId) -> Result<&Device> {
        match self.devices.get(&id) {
            None => Err(CoordinatorError::UnknownDevice(id)),
            Some(device) if device.state.is_dead() => Err(CoordinatorError::BadState {
                device: id,
                state: DeviceState::Dead,
            }),
            Some(device) => Ok(device),
        }
    }

    pub(crate) fn is_live(&self, id: DeviceId) -> bool {
        self.live(id).is_ok()
    }

    pub(crate) fn insert_device(
        &mut self,
        parent: Option<DeviceId>,
        host: DevhostId,
        args: AddDeviceArgs,
        kind: DeviceKind,
    ) -> DeviceId {
        let id = DeviceId::from_raw(self.next_device);
        self.next_device += 1;
        self.devices
            .insert(id, Device::new(id, parent, host, args, kind));
        if let Some(parent) = parent.and_then(|parent| self.devices.get_mut(&parent)) {
            parent.children.push(id);
        }
        self.hosts.attach(host, id);
        id
    }

    pub(crate) fn sibling_named(&self, parent: DeviceId, name: &str) -> bool {
        self.devices.get(&parent).is_some_and(|device| {
            device
                .children
                .iter()
                .filter_map(|child| self.devices.get(child))
                .any(|child| child.name == name)
        })
    }

    pub(crate) fn launch_host(&mut self, name: String) -> DevhostId {
        let host = self.hosts.create(name.clone());
        info!("[devcoord][host] launch {} name={}", host, name);
        self.outbox.send(Outbound::Launch { host, name });
        host
    }

    /// Tear down a non-root devhost once it hosts nothing, runs no bound
    /// driver, and owes no replies.
    pub(crate) fn maybe_teardown(&mut self, host: DevhostId) {
        if host == DevhostId::ROOT || !self.config.teardown_idle_hosts {
            return;
        }
        let idle = self.hosts.get(host).is_some_and(Devhost::is_empty);
        let driving = self
            .devices
            .values()
            .any(|device| !device.state.is_dead() && device.driver_host == Some(host));
        if !idle || driving || self.ledger.targets_host(host) {
            return;
        }
        self.hosts.remove(host);
        info!("[devcoord][host] teardown {}", host);
        self.outbox.send(Outbound::Teardown { host });
    }

    pub(crate) fn issue(&mut self, id: DeviceId, request: HostRequest) -> Option<Txid> {
        let host = self.devices.get(&id)?.host;
        self.issue_to(id, host, request)
    }

    /// Record and queue a request; the task slot is the single point of truth.
    pub(crate) fn issue_to(
        &mut self,
        id: DeviceId,
        host: DevhostId,
        request: HostRequest,
    ) -> Option<Txid> {
        if !self.hosts.contains(host) {
            warn!(
                "[devcoord][task] {} device={} host={} gone",
                request.kind(),
                id,
                host
            );
            return None;
        }
        let kind = request.kind();
        let device = self.devices.get_mut(&id)?;
        let txid = self.ledger.allocate(id, host, kind);
        device.tasks.set(kind, txid);
        debug!(
            "[devcoord][task] issue {} device={} task={} host={}",
            txid, id, kind, host
        );
        self.outbox.send(Outbound::Request {
            host,
            txid,
            device: id,
            request,
        });
        Some(txid)
    }

    pub(crate) fn publish(&mut self, id: DeviceId) {
        let published = self.devices.get(&id).map_or(true, |device| device.published);
        if published {
            return;
        }
        let path = self.path_of(id);
        if let Some(device) = self.devices.get_mut(&id) {
            device.published = true;
        }
        info!("[devcoord][publish] added {} path={}", id, path);
        self.outbox.notify(Notification::Added { path });
    }

    fn unpublish(&mut self, id: DeviceId) {
        let published = self.devices.get(&id).is_some_and(|device| device.published);
        if !published {
            return;
        }
        let path = self.path_of(id);
        if let Some(device) = self.devices.get_mut(&id) {
            device.published = false;
        }
        info!("[devcoord][publish] removed {} path={}", id, path);
        self.outbox.notify(Notification::Removed { path });
    }

    /// Live devices in depth-first pre-order below `start`.
    pub(crate) fn preorder_from(&self, start: DeviceId) -> Vec<DeviceId> {
        let mut order = Vec::new();
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            let Some(device) = self.devices.get(&id) else {
                continue;
            };
            if device.state.is_dead() {
                continue;
            }
            order.push(id);
            stack.extend(device.children.iter().rev().copied());
        }
        order
    }

    pub(crate) fn preorder(&self) -> Vec<DeviceId> {
        self.preorder_from(DeviceId::ROOT)
    }

    /// Devices this one depends on: its parent and, for a composite, its
    /// component nodes.
    pub(crate) fn suppliers(&self, id: DeviceId) -> Vec<DeviceId> {
        let Some(device) = self.devices.get(&id) else {
            return Vec::new();
        };
        let mut suppliers: Vec<DeviceId> = device.parent.into_iter().collect();
        if let DeviceKind::Composite { components, .. } = &device.kind {
            suppliers.extend(components.iter().copied());
        }
        suppliers.retain(|supplier| self.is_live(*supplier));
        suppliers
    }

    /// Devices depending on this one: its children and, for a component
    /// node, the instance consuming it.
    pub(crate) fn dependents(&self, id: DeviceId) -> Vec<DeviceId> {
        let Some(device) = self.devices.get(&id) else {
            return Vec::new();
        };
        let mut dependents = device.children.clone();
        if let DeviceKind::Component {
            instance: Some(instance),
            ..
        } = &device.kind
        {
            dependents.push(*instance);
        }
        dependents.retain(|dependent| self.is_live(*dependent));
        dependents
    }

    /// Run every scheduler step until none makes progress.
    pub(crate) fn pump(&mut self) {
        loop {
            let lifecycle = self.step_lifecycle();
            let removal = self.step_removal();
            let power = self.step_power();
            let composites = self.step_composites();
            if !(lifecycle || removal || power || composites) {
                break;
            }
        }
        self.finish_sweep();
    }

    /// Kill `id` and everything below it, deepest first.
    pub(crate) fn kill_subtree(&mut self, id: DeviceId) {
        let mut order = self.preorder_from(id);
        order.reverse();
        for device in order {
            self.bury(device);
        }
    }

    /// Move a device to `Dead` and drop every reference the tree holds to it.
    ///
    /// Callers ensure the device has no live children.
    pub(crate) fn bury(&mut self, id: DeviceId) {
        let (parent, host, driver_host, kind) = match self.devices.get(&id) {
            Some(device) if !device.state.is_dead() => (
                device.parent,
                device.host,
                device.driver_host,
                device.kind.clone(),
            ),
            _ => return,
        };
        self.unpublish(id);
        let dropped = self.ledger.invalidate_device(id);
        if let Some(parent) = parent.and_then(|parent| self.devices.get_mut(&parent)) {
            parent.children.retain(|child| *child != id);
        }
        if let Some(device) = self.devices.get_mut(&id) {
            device.state = DeviceState::Dead;
            device.parent = None;
            device.children.clear();
            device.tasks.clear_all();
            device.pending_bind = None;
        }
        self.settle(id, Settle::Skipped);
        self.forget_composite_links(id, kind);
        debug!(
            "[devcoord][dead] {} host={} dropped_requests={}",
            id, host, dropped
        );
        if self.hosts.detach(host, id) {
            self.maybe_teardown(host);
        }
        if let Some(driver_host) = driver_host.filter(|driver_host| *driver_host != host) {
            self.maybe_teardown(driver_host);
        }
    }

    pub(crate) fn settle(&mut self, id: DeviceId, outcome: Settle) {
        if let Some(sweep) = self.sweep.as_mut() {
            sweep.settle(id, outcome);
        }
    }
}

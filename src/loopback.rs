// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: In-process devhost set that answers coordinator requests.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{BTreeSet, HashMap};

use log::{debug, info};

use crate::config::BootManifest;
use crate::coordinator::Coordinator;
use crate::device::DeviceId;
use crate::devhost::{DevhostId, DriverRef, Outbound};
use crate::error::{Result, Status};
use crate::task::TaskKind;

/// Devhosts simulated in-process.
///
/// Every request is answered `OK` unless a failure was scripted for the
/// device path and task kind.
#[derive(Debug, Default)]
pub struct Loopback {
    failures: HashMap<(String, TaskKind), Status>,
    running: BTreeSet<DevhostId>,
    delivered: Vec<Outbound>,
}

impl Loopback {
    /// Loopback with no scripted failures.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `kind` requests for the device at `path` with `status`.
    pub fn fail(&mut self, path: impl Into<String>, kind: TaskKind, status: Status) -> &mut Self {
        self.failures.insert((path.into(), kind), status);
        self
    }

    /// Drop a scripted failure.
    pub fn clear_failure(&mut self, path: &str, kind: TaskKind) {
        self.failures.remove(&(path.to_owned(), kind));
    }

    /// Devhosts launched and not yet torn down.
    pub fn running(&self) -> impl Iterator<Item = DevhostId> + '_ {
        self.running.iter().copied()
    }

    /// Every message delivered so far, in order.
    pub fn delivered(&self) -> &[Outbound] {
        &self.delivered
    }

    /// Deliver queued messages and reply until the coordinator goes quiet.
    /// Returns the number of replies sent.
    pub fn run(&mut self, coordinator: &mut Coordinator) -> usize {
        let mut replies = 0;
        loop {
            let batch = coordinator.drain_outbound();
            if batch.is_empty() {
                break;
            }
            for message in batch {
                match &message {
                    Outbound::Launch { host, name } => {
                        debug!("[loopback] launch {} name={}", host, name);
                        self.running.insert(*host);
                    }
                    Outbound::Teardown { host } => {
                        debug!("[loopback] teardown {}", host);
                        self.running.remove(host);
                    }
                    Outbound::Request {
                        txid,
                        device,
                        request,
                        ..
                    } => {
                        let status = self.status_for(coordinator, *device, request.kind());
                        debug!(
                            "[loopback] reply {} device={} task={} status={}",
                            txid,
                            device,
                            request.kind(),
                            status
                        );
                        coordinator.handle_reply(*txid, status);
                        replies += 1;
                    }
                }
                self.delivered.push(message);
            }
        }
        replies
    }

    fn status_for(&self, coordinator: &Coordinator, device: DeviceId, kind: TaskKind) -> Status {
        coordinator
            .topological_path(device)
            .ok()
            .and_then(|path| self.failures.get(&(path, kind)).copied())
            .unwrap_or(Status::Ok)
    }
}

/// Register the manifest's composites and add its devices in order,
/// answering every request through `hosts`.
///
/// Each device is added by the devhost running its parent's driver, or by
/// the parent's own devhost when no driver is bound. Returns the added
/// devices in manifest order.
pub fn replay_manifest(
    coordinator: &mut Coordinator,
    hosts: &mut Loopback,
    manifest: &BootManifest,
) -> Result<Vec<DeviceId>> {
    for composite in &manifest.composites {
        coordinator.define_composite(composite.to_descriptor())?;
    }
    hosts.run(coordinator);
    let mut added = Vec::with_capacity(manifest.devices.len());
    for entry in &manifest.devices {
        let parent = coordinator.lookup_path(&entry.parent)?;
        let parent_device = coordinator.device(parent)?;
        let host = parent_device.driver_host().unwrap_or(parent_device.host());
        let id = coordinator.add_device(host, parent, entry.to_args())?;
        hosts.run(coordinator);
        if entry.invisible {
            coordinator.make_visible(id)?;
        }
        if let Some(driver) = &entry.driver {
            coordinator.bind_driver(
                id,
                DriverRef {
                    name: driver.clone(),
                    colocate: entry.colocate,
                },
            )?;
            hosts.run(coordinator);
        }
        added.push(id);
    }
    info!(
        "[loopback] manifest replayed composites={} devices={}",
        manifest.composites.len(),
        added.len()
    );
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_manifest, CoordinatorConfig};
    use crate::device::DeviceState;

    #[test]
    fn scripted_init_failure_removes_the_device() {
        let mut coordinator = Coordinator::new(CoordinatorConfig::default()).expect("boot");
        let mut hosts = Loopback::new();
        hosts.fail("/dev/flaky", TaskKind::Init, Status::Io);
        let manifest = parse_manifest(
            r#"
            [[device]]
            parent = "/dev"
            name = "flaky"
            protocol = 9
            "#,
        )
        .expect("parse");
        let added = replay_manifest(&mut coordinator, &mut hosts, &manifest).expect("replay");
        assert_eq!(coordinator.state(added[0]), Ok(DeviceState::Dead));
        assert_eq!(coordinator.outstanding_requests(), 0);
    }

    #[test]
    fn isolated_driver_children_live_in_the_driver_host() {
        let mut coordinator = Coordinator::new(CoordinatorConfig::default()).expect("boot");
        let mut hosts = Loopback::new();
        let manifest = parse_manifest(
            r#"
            [[device]]
            parent = "/dev"
            name = "pci"
            protocol = 1
            driver = "pci-bus"

            [[device]]
            parent = "/dev/pci"
            name = "00:02.0"
            protocol = 2
            "#,
        )
        .expect("parse");
        let added = replay_manifest(&mut coordinator, &mut hosts, &manifest).expect("replay");
        let bus = coordinator.device(added[0]).expect("bus");
        let driver_host = bus.driver_host().expect("driver host");
        assert_ne!(driver_host, DevhostId::ROOT);
        assert_eq!(coordinator.device(added[1]).expect("child").host(), driver_host);
        assert!(hosts.running().any(|host| host == driver_host));
    }
}

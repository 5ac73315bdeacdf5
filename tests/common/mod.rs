// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Shared helpers for coordinator integration tests.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![allow(dead_code)]

use devcoord::{
    AddDeviceArgs, Coordinator, CoordinatorConfig, DeviceId, DeviceState, Loopback, Outbound,
    TaskKind,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Coordinator with the boot traffic already drained.
pub fn boot() -> Coordinator {
    init_logging();
    let mut coordinator = Coordinator::new(CoordinatorConfig::default()).expect("boot");
    coordinator.drain_outbound();
    coordinator.drain_notifications();
    coordinator
}

/// `(device, task)` for every request among `messages`.
pub fn requests(messages: &[Outbound]) -> Vec<(DeviceId, TaskKind)> {
    messages
        .iter()
        .filter_map(Outbound::request)
        .map(|(_, device, request)| (device, request.kind()))
        .collect()
}

/// Answer everything through `hosts` and return the requests delivered.
pub fn settle(coordinator: &mut Coordinator, hosts: &mut Loopback) -> Vec<(DeviceId, TaskKind)> {
    let start = hosts.delivered().len();
    hosts.run(coordinator);
    requests(&hosts.delivered()[start..])
}

/// Add a device from its parent's devhost and drive it to `Active`.
pub fn add_active(
    coordinator: &mut Coordinator,
    hosts: &mut Loopback,
    parent: DeviceId,
    args: AddDeviceArgs,
) -> DeviceId {
    let host = coordinator.device(parent).expect("parent").host();
    let id = coordinator.add_device(host, parent, args).expect("add device");
    settle(coordinator, hosts);
    assert_eq!(coordinator.state(id), Ok(DeviceState::Active));
    id
}

pub fn position(log: &[(DeviceId, TaskKind)], entry: (DeviceId, TaskKind)) -> usize {
    log.iter()
        .position(|candidate| *candidate == entry)
        .unwrap_or_else(|| panic!("{entry:?} missing from {log:?}"))
}

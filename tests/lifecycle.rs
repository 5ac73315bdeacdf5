// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Validate device addition, Init gating, visibility, binding, and metadata scoping.
// Author: Lukas Bower
#![forbid(unsafe_code)]

mod common;

use common::{add_active, boot, settle};
use devcoord::{
    AddDeviceArgs, DeviceFlags, DeviceId, DeviceState, DevhostId, DriverRef, Loopback,
    Notification, Outbound, Scheduled, Status, TaskKind,
};

#[test]
fn init_runs_parent_before_child() {
    let mut coordinator = boot();
    let mut hosts = Loopback::new();
    let bus = coordinator
        .add_device(DevhostId::ROOT, DeviceId::ROOT, AddDeviceArgs::new("bus", 1))
        .expect("add bus");
    let leaf = coordinator
        .add_device(DevhostId::ROOT, bus, AddDeviceArgs::new("leaf", 2))
        .expect("add leaf");
    assert_eq!(coordinator.state(leaf), Ok(DeviceState::Created));
    let log = settle(&mut coordinator, &mut hosts);
    assert_eq!(log, vec![(bus, TaskKind::Init), (leaf, TaskKind::Init)]);
    assert_eq!(
        coordinator.drain_notifications(),
        vec![
            Notification::Added {
                path: "/dev/bus".to_owned(),
            },
            Notification::Added {
                path: "/dev/bus/leaf".to_owned(),
            },
        ]
    );
}

#[test]
fn init_failure_removes_subtree_without_initialising_children() {
    let mut coordinator = boot();
    let mut hosts = Loopback::new();
    hosts.fail("/dev/bus", TaskKind::Init, Status::Io);
    let bus = coordinator
        .add_device(DevhostId::ROOT, DeviceId::ROOT, AddDeviceArgs::new("bus", 1))
        .expect("add bus");
    let leaf = coordinator
        .add_device(DevhostId::ROOT, bus, AddDeviceArgs::new("leaf", 2))
        .expect("add leaf");
    let log = settle(&mut coordinator, &mut hosts);
    assert_eq!(
        log,
        vec![
            (bus, TaskKind::Init),
            (bus, TaskKind::Unbind),
            (leaf, TaskKind::Remove),
            (bus, TaskKind::Remove),
        ]
    );
    assert_eq!(coordinator.state(bus), Ok(DeviceState::Dead));
    assert_eq!(coordinator.state(leaf), Ok(DeviceState::Dead));
    assert!(coordinator.drain_notifications().is_empty());
    assert_eq!(coordinator.outstanding_requests(), 0);
}

#[test]
fn invisible_devices_publish_on_make_visible() {
    let mut coordinator = boot();
    let mut hosts = Loopback::new();
    let hidden = add_active(
        &mut coordinator,
        &mut hosts,
        DeviceId::ROOT,
        AddDeviceArgs::new("hidden", 3).flags(DeviceFlags::INVISIBLE),
    );
    assert!(!coordinator.device(hidden).expect("device").is_visible());
    assert!(coordinator.drain_notifications().is_empty());
    coordinator.make_visible(hidden).expect("make visible");
    assert_eq!(
        coordinator.drain_notifications(),
        vec![Notification::Added {
            path: "/dev/hidden".to_owned(),
        }]
    );

    let early = coordinator
        .add_device(
            DevhostId::ROOT,
            DeviceId::ROOT,
            AddDeviceArgs::new("early", 4).flags(DeviceFlags::INVISIBLE),
        )
        .expect("add early");
    coordinator.make_visible(early).expect("make visible before init");
    assert!(coordinator.drain_notifications().is_empty());
    settle(&mut coordinator, &mut hosts);
    assert_eq!(
        coordinator.drain_notifications(),
        vec![Notification::Added {
            path: "/dev/early".to_owned(),
        }]
    );
}

#[test]
fn add_device_rejects_bad_arguments() {
    let mut coordinator = boot();
    let mut hosts = Loopback::new();
    let too_long = "n".repeat(32);
    let cases = [
        AddDeviceArgs::new("", 1),
        AddDeviceArgs::new("a/b", 1),
        AddDeviceArgs::new(too_long, 1),
        AddDeviceArgs::new("dup", 1).property(1, 2).property(1, 3),
        AddDeviceArgs::new("forever", 1).flags(DeviceFlags::IMMORTAL),
    ];
    for args in cases {
        let err = coordinator
            .add_device(DevhostId::ROOT, DeviceId::ROOT, args)
            .expect_err("rejected");
        assert_eq!(err.status(), Status::InvalidArgs, "{err}");
    }
    let accepted = coordinator
        .add_device(DevhostId::ROOT, DeviceId::ROOT, AddDeviceArgs::new("ok", 1))
        .map(|_| ());
    assert_eq!(accepted, Ok(()));
    settle(&mut coordinator, &mut hosts);
    let dead_parent = add_active(
        &mut coordinator,
        &mut hosts,
        DeviceId::ROOT,
        AddDeviceArgs::new("gone", 5),
    );
    coordinator.schedule_remove(dead_parent, true).expect("remove");
    let err = coordinator
        .add_device(DevhostId::ROOT, dead_parent, AddDeviceArgs::new("late", 6))
        .expect_err("parent is being removed");
    assert_eq!(err.status(), Status::BadState);
    settle(&mut coordinator, &mut hosts);
    let err = coordinator
        .add_device(DevhostId::ROOT, dead_parent, AddDeviceArgs::new("later", 6))
        .expect_err("parent is dead");
    assert_eq!(err.status(), Status::BadState);
}

#[test]
fn isolated_bind_launches_a_devhost() {
    let mut coordinator = boot();
    let mut hosts = Loopback::new();
    let usb = add_active(
        &mut coordinator,
        &mut hosts,
        DeviceId::ROOT,
        AddDeviceArgs::new("usb", 7),
    );
    assert_eq!(
        coordinator.bind_driver(usb, DriverRef::isolated("xhci")),
        Ok(Scheduled::Issued)
    );
    assert_eq!(
        coordinator.bind_driver(usb, DriverRef::isolated("xhci")),
        Ok(Scheduled::Coalesced)
    );
    let outbound = coordinator.drain_outbound();
    let launched = match outbound.as_slice() {
        [Outbound::Launch { host, name }, Outbound::Request { host: target, device, .. }] => {
            assert_eq!(name, "driver-xhci");
            assert_eq!(target, host);
            assert_eq!(*device, usb);
            *host
        }
        other => panic!("unexpected outbound: {other:?}"),
    };
    let (txid, _, _) = outbound[1].request().expect("bind");
    coordinator.handle_reply(txid, Status::Ok);
    let device = coordinator.device(usb).expect("usb");
    assert_eq!(device.bound_driver(), Some("xhci"));
    assert_eq!(device.driver_host(), Some(launched));
    assert!(coordinator.devhost(launched).is_some());
}

#[test]
fn colocate_flag_keeps_driver_in_device_host() {
    let mut coordinator = boot();
    let mut hosts = Loopback::new();
    let gpu = add_active(
        &mut coordinator,
        &mut hosts,
        DeviceId::ROOT,
        AddDeviceArgs::new("gpu", 8).flags(DeviceFlags::COLOCATE),
    );
    coordinator
        .bind_driver(gpu, DriverRef::isolated("gpu-core"))
        .expect("bind");
    match coordinator.drain_outbound().as_slice() {
        [Outbound::Request { host, .. }] => assert_eq!(*host, DevhostId::ROOT),
        other => panic!("unexpected outbound: {other:?}"),
    }
}

#[test]
fn failed_isolated_bind_tears_down_its_devhost() {
    let mut coordinator = boot();
    let mut hosts = Loopback::new();
    hosts.fail("/dev/eth", TaskKind::Bind, Status::NotSupported);
    let eth = add_active(
        &mut coordinator,
        &mut hosts,
        DeviceId::ROOT,
        AddDeviceArgs::new("eth", 9),
    );
    coordinator
        .bind_driver(eth, DriverRef::isolated("e1000"))
        .expect("bind");
    settle(&mut coordinator, &mut hosts);
    let device = coordinator.device(eth).expect("eth");
    assert_eq!(device.bound_driver(), None);
    assert!(matches!(
        hosts.delivered().last(),
        Some(Outbound::Teardown { .. })
    ));
    assert_eq!(hosts.running().count(), 0);
}

#[test]
fn metadata_resolves_through_real_ancestry() {
    let mut coordinator = boot();
    let mut hosts = Loopback::new();
    let sys = add_active(
        &mut coordinator,
        &mut hosts,
        DeviceId::ROOT,
        AddDeviceArgs::new("sys", 1),
    );
    let i2c = add_active(
        &mut coordinator,
        &mut hosts,
        sys,
        AddDeviceArgs::new("i2c", 2).metadata(0x20, b"own".to_vec()),
    );
    let spi = add_active(&mut coordinator, &mut hosts, DeviceId::ROOT, AddDeviceArgs::new("spi", 3));
    coordinator
        .publish_metadata("/dev/sys", 0x10, b"board".to_vec())
        .expect("publish");
    coordinator
        .publish_metadata("/dev/sys/i2c", 0x20, b"published".to_vec())
        .expect("publish");
    assert_eq!(coordinator.get_metadata(i2c, 0x10), Ok(b"board".to_vec()));
    assert_eq!(coordinator.get_metadata(i2c, 0x20), Ok(b"own".to_vec()));
    let miss = coordinator.get_metadata(spi, 0x10).expect_err("sibling subtree");
    assert_eq!(miss.status(), Status::NotFound);
    let denied = coordinator
        .publish_metadata("/dev/misc/console", 0x10, b"x".to_vec())
        .expect_err("restricted");
    assert_eq!(denied.status(), Status::AccessDenied);
}

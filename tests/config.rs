// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Validate manifest loading and replay into a live topology.
// Author: Lukas Bower
#![forbid(unsafe_code)]

mod common;

use std::fs;

use devcoord::config::{load_manifest, ConfigError};
use devcoord::loopback::replay_manifest;
use devcoord::{Coordinator, DeviceState, Loopback};
use serde_json::Value;
use tempfile::tempdir;

const MANIFEST: &str = r#"
[coordinator]
root_name = "dev"
max_name_len = 24

[[composite]]
name = "touch"
coresident = 0
metadata = [{ key = 12288, value = "calib-v1" }]

[[composite.slots]]
name = "i2c"
protocol = 36

[[composite.slots]]
name = "gpio"
protocol = 20

[[device]]
parent = "/dev"
name = "soc"
protocol = 1
driver = "soc-bus"

[[device]]
parent = "/dev/soc"
name = "i2c"
protocol = 36

[[device]]
parent = "/dev/soc"
name = "gpio"
protocol = 20
invisible = true
"#;

#[test]
fn manifest_replays_into_a_topology() {
    common::init_logging();
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("boot.toml");
    fs::write(&path, MANIFEST).expect("write manifest");

    let manifest = load_manifest(&path).expect("load");
    assert_eq!(manifest.coordinator.max_name_len, 24);
    assert_eq!(manifest.devices.len(), 3);

    let mut coordinator = Coordinator::new(manifest.coordinator.clone()).expect("boot");
    let mut hosts = Loopback::new();
    hosts.run(&mut coordinator);
    let added = replay_manifest(&mut coordinator, &mut hosts, &manifest).expect("replay");
    for id in &added {
        assert_eq!(coordinator.state(*id), Ok(DeviceState::Active));
    }
    let soc = coordinator.device(added[0]).expect("soc");
    assert_eq!(soc.bound_driver(), Some("soc-bus"));
    let driver_host = soc.driver_host().expect("driver host");
    assert_eq!(coordinator.device(added[1]).expect("i2c").host(), driver_host);
    assert!(coordinator.device(added[2]).expect("gpio").is_visible());

    let instance = coordinator.composite_instance("touch").expect("assembled");
    assert_eq!(
        coordinator.topological_path(instance).as_deref(),
        Ok("/dev/soc/i2c/touch-i2c/touch")
    );
    assert_eq!(coordinator.get_metadata(instance, 12288), Ok(b"calib-v1".to_vec()));

    let snapshot = serde_json::to_value(coordinator.snapshot()).expect("serialize");
    let devices = snapshot["devices"].as_array().expect("devices");
    let composite = devices
        .iter()
        .find(|device| device["path"] == Value::from("/dev/soc/i2c/touch-i2c/touch"))
        .expect("composite in snapshot");
    assert_eq!(composite["kind"], Value::from("composite"));
    assert_eq!(composite["state"], Value::from("Active"));
    assert_eq!(composite["visible"], Value::from(true));
    let nodes = devices
        .iter()
        .filter(|device| device["kind"] == Value::from("component"))
        .count();
    assert_eq!(nodes, 2);
    assert!(snapshot["hosts"].as_array().expect("hosts").len() >= 2);
}

#[test]
fn missing_manifest_reports_io_error() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("absent.toml");
    match load_manifest(&path) {
        Err(ConfigError::Io { path: reported, .. }) => assert_eq!(reported, path),
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn malformed_manifest_reports_parse_error() {
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("broken.toml");
    fs::write(&path, "[[device]]\nparent = \"/dev\"\nname = 3\n").expect("write");
    let err = load_manifest(&path).expect_err("parse failure");
    assert!(matches!(err, ConfigError::Parse { .. }));
    assert!(err.to_string().contains("broken.toml"));
}

#[test]
fn replay_stops_at_an_unknown_parent() {
    common::init_logging();
    let dir = tempdir().expect("tempdir");
    let path = dir.path().join("orphan.toml");
    fs::write(
        &path,
        "[[device]]\nparent = \"/dev/nowhere\"\nname = \"lost\"\nprotocol = 1\n",
    )
    .expect("write");
    let manifest = load_manifest(&path).expect("load");
    let mut coordinator = Coordinator::new(manifest.coordinator.clone()).expect("boot");
    let mut hosts = Loopback::new();
    let err = replay_manifest(&mut coordinator, &mut hosts, &manifest).expect_err("orphan");
    assert_eq!(err.status(), devcoord::Status::NotFound);
}

// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Coordinator configuration and the TOML boot manifest.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::composite::{CompositeDescriptor, MatchPredicate};
use crate::device::{AddDeviceArgs, DeviceFlags};

/// Tunables of the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorConfig {
    /// Name of the root device; the enumeration root is `/<root_name>`.
    pub root_name: String,
    /// Diagnostic name of the devhost carrying the root.
    pub root_host_name: String,
    /// Path prefixes that refuse published metadata.
    pub restricted_metadata_roots: Vec<String>,
    /// Longest accepted device name in bytes.
    pub max_name_len: usize,
    /// Emit a teardown once a non-root devhost hosts nothing.
    pub teardown_idle_hosts: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            root_name: "dev".to_owned(),
            root_host_name: "root-host".to_owned(),
            restricted_metadata_roots: vec!["/dev/misc".to_owned()],
            max_name_len: 31,
            teardown_idle_hosts: true,
        }
    }
}

/// Errors raised while loading a manifest.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The manifest could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Manifest path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The manifest is not valid TOML for this schema.
    #[error("failed to parse {path}: {source}")]
    Parse {
        /// Manifest path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },
}

/// Boot manifest replayed by `devcoordd`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BootManifest {
    /// Coordinator tunables.
    pub coordinator: CoordinatorConfig,
    /// Composite descriptors registered before any device is added.
    #[serde(rename = "composite")]
    pub composites: Vec<CompositeToml>,
    /// Devices added in order, each under an existing parent path.
    #[serde(rename = "device")]
    pub devices: Vec<DeviceToml>,
}

/// `[[composite]]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompositeToml {
    /// Descriptor name.
    pub name: String,
    /// Coresident slot index.
    #[serde(default)]
    pub coresident: Option<usize>,
    /// Component slots.
    pub slots: Vec<SlotToml>,
    /// Properties of the assembled device.
    #[serde(default)]
    pub properties: Vec<PropertyToml>,
    /// Metadata of the assembled device.
    #[serde(default)]
    pub metadata: Vec<MetadataToml>,
}

/// `[[composite.slots]]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlotToml {
    /// Slot name.
    pub name: String,
    /// Required protocol.
    #[serde(default)]
    pub protocol: Option<u32>,
    /// Required properties.
    #[serde(default)]
    pub properties: Vec<PropertyToml>,
}

/// Key/value property entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PropertyToml {
    /// Property key.
    pub key: u32,
    /// Property value.
    pub value: u32,
}

/// Metadata entry with a UTF-8 payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetadataToml {
    /// Metadata key.
    pub key: u32,
    /// Payload.
    pub value: String,
}

/// `[[device]]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceToml {
    /// Topological path of the parent.
    pub parent: String,
    /// Device name.
    pub name: String,
    /// Protocol identifier.
    pub protocol: u32,
    /// Binding properties.
    #[serde(default)]
    pub properties: Vec<PropertyToml>,
    /// Metadata attached to the device.
    #[serde(default)]
    pub metadata: Vec<MetadataToml>,
    /// Add the device invisible and publish it with MakeVisible afterwards.
    #[serde(default)]
    pub invisible: bool,
    /// Bind drivers to this device in its own devhost.
    #[serde(default)]
    pub colocate: bool,
    /// Driver to bind once the device is active.
    #[serde(default)]
    pub driver: Option<String>,
}

impl CompositeToml {
    /// Convert into a registry descriptor.
    pub fn to_descriptor(&self) -> CompositeDescriptor {
        let mut descriptor = CompositeDescriptor::new(self.name.clone());
        for slot in &self.slots {
            let mut predicate = MatchPredicate {
                protocol_id: slot.protocol,
                properties: Vec::new(),
            };
            for property in &slot.properties {
                predicate = predicate.property(property.key, property.value);
            }
            descriptor = descriptor.slot(slot.name.clone(), predicate);
        }
        descriptor.coresident = self.coresident;
        for property in &self.properties {
            descriptor = descriptor.property(property.key, property.value);
        }
        for entry in &self.metadata {
            descriptor = descriptor.metadata(entry.key, entry.value.as_bytes());
        }
        descriptor
    }
}

impl DeviceToml {
    /// Convert into AddDevice arguments.
    pub fn to_args(&self) -> AddDeviceArgs {
        let mut flags = DeviceFlags::empty();
        flags.set(DeviceFlags::INVISIBLE, self.invisible);
        flags.set(DeviceFlags::COLOCATE, self.colocate);
        let mut args = AddDeviceArgs::new(self.name.clone(), self.protocol).flags(flags);
        for property in &self.properties {
            args = args.property(property.key, property.value);
        }
        for entry in &self.metadata {
            args = args.metadata(entry.key, entry.value.as_bytes());
        }
        args
    }
}

/// Parse manifest text.
pub fn parse_manifest(text: &str) -> Result<BootManifest, toml::de::Error> {
    toml::from_str(text)
}

/// Read and parse a manifest file.
pub fn load_manifest(path: &Path) -> Result<BootManifest, ConfigError> {
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_manifest(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_manifest_uses_defaults() {
        let manifest = parse_manifest("").expect("parse");
        assert_eq!(manifest.coordinator, CoordinatorConfig::default());
        assert!(manifest.devices.is_empty());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = parse_manifest("[coordinator]\nroot = \"x\"\n").expect_err("unknown field");
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn composite_table_converts() {
        let manifest = parse_manifest(
            r#"
            [[composite]]
            name = "touch"
            coresident = 1
            metadata = [{ key = 3, value = "calib" }]

            [[composite.slots]]
            name = "i2c"
            protocol = 36
            properties = [{ key = 1, value = 64 }]

            [[composite.slots]]
            name = "gpio"
            protocol = 20
            "#,
        )
        .expect("parse");
        let descriptor = manifest.composites[0].to_descriptor();
        assert_eq!(descriptor.slots.len(), 2);
        assert_eq!(descriptor.coresident, Some(1));
        assert_eq!(descriptor.slots[0].predicate.protocol_id, Some(36));
        assert_eq!(descriptor.metadata[0].data, b"calib".to_vec());
        assert!(descriptor.validate(31).is_ok());
    }
}

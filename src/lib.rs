// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Device lifecycle coordinator library root.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Device lifecycle coordinator.
//!
//! Tracks a tree of devices spread across driver-host processes, sequences
//! bind, init, unbind, remove, suspend, and resume work against them, and
//! assembles composite devices from independently discovered components.
//! The coordinator performs no I/O; see [`coordinator::Coordinator`] for the
//! event-in, outbox-out contract and [`loopback::Loopback`] for an
//! in-process devhost set.

pub mod composite;
pub mod config;
pub mod coordinator;
pub mod device;
pub mod devhost;
pub mod error;
pub mod loopback;
pub mod metadata;
pub mod notify;
pub mod power;
pub mod task;

pub use composite::{CompositeDescriptor, MatchPredicate};
pub use config::{BootManifest, CoordinatorConfig};
pub use coordinator::{Coordinator, Scheduled, TopologySnapshot};
pub use device::{AddDeviceArgs, DeviceFlags, DeviceId, DeviceKind, DeviceState};
pub use devhost::{DevhostId, DriverRef, HostRequest, Outbound};
pub use error::{CoordinatorError, Result, Status};
pub use loopback::Loopback;
pub use metadata::MetadataEntry;
pub use notify::Notification;
pub use power::{PowerState, SuspendFlags, SweepId, SweepKind, SweepReport};
pub use task::{TaskKind, Txid};

// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Task kinds, per-device task slots, and the outstanding request ledger.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

use crate::device::DeviceId;
use crate::devhost::DevhostId;

/// Unit of asynchronous work bound to one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum TaskKind {
    /// Start a driver against the device.
    Bind,
    /// Ask the coresident devhost to construct an assembled composite.
    Create,
    /// Run the driver's init hook.
    Init,
    /// Run the driver's unbind hook.
    Unbind,
    /// Release the device inside its devhost.
    Remove,
    /// Move the device into a low-power state.
    Suspend,
    /// Return the device to a working power state.
    Resume,
}

impl TaskKind {
    /// All task kinds in slot order.
    pub const ALL: [TaskKind; 7] = [
        TaskKind::Bind,
        TaskKind::Create,
        TaskKind::Init,
        TaskKind::Unbind,
        TaskKind::Remove,
        TaskKind::Suspend,
        TaskKind::Resume,
    ];

    const fn index(self) -> usize {
        match self {
            Self::Bind => 0,
            Self::Create => 1,
            Self::Init => 2,
            Self::Unbind => 3,
            Self::Remove => 4,
            Self::Suspend => 5,
            Self::Resume => 6,
        }
    }

    /// Render the canonical task label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bind => "bind",
            Self::Create => "create",
            Self::Init => "init",
            Self::Unbind => "unbind",
            Self::Remove => "remove",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction identifier correlating a request with its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct Txid(u64);

impl Txid {
    /// Return the raw transaction number.
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Txid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx#{}", self.0)
    }
}

/// State of one task slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskState {
    /// No request of this kind is outstanding.
    #[default]
    Idle,
    /// A request was issued and awaits its reply.
    InFlight(Txid),
}

/// One slot per task kind; the only serialisation point for repeated requests.
#[derive(Debug, Clone, Default)]
pub struct TaskSlots {
    slots: [TaskState; 7],
}

impl TaskSlots {
    /// Return the outstanding transaction for `kind`, if any.
    pub fn in_flight(&self, kind: TaskKind) -> Option<Txid> {
        match self.slots[kind.index()] {
            TaskState::Idle => None,
            TaskState::InFlight(txid) => Some(txid),
        }
    }

    /// Return true when any slot is in flight.
    pub fn is_busy(&self) -> bool {
        TaskKind::ALL
            .iter()
            .any(|kind| self.in_flight(*kind).is_some())
    }

    pub(crate) fn set(&mut self, kind: TaskKind, txid: Txid) {
        self.slots[kind.index()] = TaskState::InFlight(txid);
    }

    /// Clear the slot when it still refers to `txid`; returns whether it did.
    pub(crate) fn complete(&mut self, kind: TaskKind, txid: Txid) -> bool {
        let slot = &mut self.slots[kind.index()];
        if *slot == TaskState::InFlight(txid) {
            *slot = TaskState::Idle;
            true
        } else {
            false
        }
    }

    pub(crate) fn clear_all(&mut self) {
        self.slots = [TaskState::Idle; 7];
    }
}

/// Book-keeping for one outstanding devhost request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingRequest {
    pub device: DeviceId,
    pub host: DevhostId,
    pub kind: TaskKind,
}

/// Ledger of every request awaiting a reply.
#[derive(Debug, Default)]
pub(crate) struct TaskLedger {
    next: u64,
    pending: HashMap<Txid, PendingRequest>,
}

impl TaskLedger {
    pub fn allocate(&mut self, device: DeviceId, host: DevhostId, kind: TaskKind) -> Txid {
        self.next += 1;
        let txid = Txid(self.next);
        self.pending.insert(txid, PendingRequest { device, host, kind });
        txid
    }

    pub fn take(&mut self, txid: Txid) -> Option<PendingRequest> {
        self.pending.remove(&txid)
    }

    /// Drop every entry targeting `device`; their replies become stale.
    pub fn invalidate_device(&mut self, device: DeviceId) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, entry| entry.device != device);
        before - self.pending.len()
    }

    /// Drop every entry addressed to `host`, returning them in txid order.
    pub fn invalidate_host(&mut self, host: DevhostId) -> Vec<(Txid, PendingRequest)> {
        let mut dropped: Vec<(Txid, PendingRequest)> = self
            .pending
            .iter()
            .filter(|(_, entry)| entry.host == host)
            .map(|(txid, entry)| (*txid, *entry))
            .collect();
        dropped.sort_by_key(|(txid, _)| *txid);
        for (txid, _) in &dropped {
            self.pending.remove(txid);
        }
        dropped
    }

    pub fn targets_host(&self, host: DevhostId) -> bool {
        self.pending.values().any(|entry| entry.host == host)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

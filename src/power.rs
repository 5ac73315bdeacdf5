// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Suspend/resume sweep records and reports.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fmt;

use bitflags::bitflags;

use crate::device::DeviceId;
use crate::error::Status;

bitflags! {
    /// Reason flags carried by a suspend sweep.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SuspendFlags: u32 {
        /// Suspend ahead of a reboot.
        const REBOOT = 1 << 0;
        /// Suspend ahead of power off.
        const POWEROFF = 1 << 1;
        /// Suspend ahead of a kernel handoff.
        const MEXEC = 1 << 2;
        /// Suspend to RAM.
        const SUSPEND_RAM = 1 << 3;
    }
}

/// Device power states a resume may target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PowerState {
    /// Fully on.
    #[default]
    D0,
    /// Light sleep.
    D1,
    /// Deeper sleep.
    D2,
    /// Off with context retained.
    D3Hot,
    /// Off.
    D3Cold,
}

/// Identifier of one power sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SweepId(pub(crate) u64);

impl fmt::Display for SweepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sweep#{}", self.0)
    }
}

/// Direction of a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepKind {
    /// Leaf-first suspend.
    Suspend(SuspendFlags),
    /// Root-first resume.
    Resume(PowerState),
}

impl SweepKind {
    /// Render the sweep direction.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Suspend(_) => "suspend",
            Self::Resume(_) => "resume",
        }
    }
}

/// Outcome of a finished sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// Sweep identifier.
    pub id: SweepId,
    /// Sweep direction.
    pub kind: SweepKind,
    /// Devices that reached the target state, in completion order.
    pub completed: Vec<DeviceId>,
    /// Devices whose request failed or could not be issued.
    pub failures: Vec<(DeviceId, Status)>,
    /// Devices that left the sweep without a request (removed, not active).
    pub skipped: usize,
}

impl SweepReport {
    /// Whether every participant reached the target state.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Sweep in progress.
#[derive(Debug)]
pub(crate) struct PowerSweep {
    pub kind: SweepKind,
    pub pending: BTreeSet<DeviceId>,
    pub report: SweepReport,
}

impl PowerSweep {
    pub fn new(id: SweepId, kind: SweepKind, pending: BTreeSet<DeviceId>) -> Self {
        Self {
            kind,
            pending,
            report: SweepReport {
                id,
                kind,
                completed: Vec::new(),
                failures: Vec::new(),
                skipped: 0,
            },
        }
    }

    pub fn settle(&mut self, device: DeviceId, outcome: Settle) {
        if !self.pending.remove(&device) {
            return;
        }
        match outcome {
            Settle::Completed => self.report.completed.push(device),
            Settle::Failed(status) => self.report.failures.push((device, status)),
            Settle::Skipped => self.report.skipped += 1,
        }
    }

    pub fn is_settled(&self) -> bool {
        self.pending.is_empty()
    }
}

/// How a participant left the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Settle {
    Completed,
    Failed(Status),
    Skipped,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settling_is_counted_once() {
        let a = DeviceId::from_raw(1);
        let b = DeviceId::from_raw(2);
        let mut sweep = PowerSweep::new(
            SweepId(1),
            SweepKind::Suspend(SuspendFlags::POWEROFF),
            [a, b].into_iter().collect(),
        );
        sweep.settle(a, Settle::Failed(Status::Io));
        sweep.settle(a, Settle::Completed);
        assert!(!sweep.is_settled());
        sweep.settle(b, Settle::Completed);
        assert!(sweep.is_settled());
        assert_eq!(sweep.report.completed, vec![b]);
        assert_eq!(sweep.report.failures, vec![(a, Status::Io)]);
        assert!(!sweep.report.is_clean());
    }
}

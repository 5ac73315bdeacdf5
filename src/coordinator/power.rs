// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Suspend and resume sweeps over the device tree.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use log::{debug, info, warn};

use super::Coordinator;
use crate::device::{DeviceId, DeviceState};
use crate::devhost::HostRequest;
use crate::error::{CoordinatorError, Result, Status};
use crate::notify::Notification;
use crate::power::{PowerState, PowerSweep, Settle, SuspendFlags, SweepId, SweepKind};
use crate::task::TaskKind;

/// Next action for one sweep participant.
enum Step {
    Wait,
    Settle(Settle),
    Issue(HostRequest),
}

impl Coordinator {
    /// Start a suspend sweep.
    ///
    /// Every active device is suspended after everything that depends on it;
    /// composites therefore go before their components and the root goes
    /// last. The outcome arrives as [`Notification::SweepFinished`].
    pub fn suspend(&mut self, flags: SuspendFlags) -> Result<SweepId> {
        self.start_sweep(SweepKind::Suspend(flags))
    }

    /// Start a resume sweep; the root resumes first and no device resumes
    /// before its parent is active again.
    pub fn resume(&mut self, target: PowerState) -> Result<SweepId> {
        self.start_sweep(SweepKind::Resume(target))
    }

    fn start_sweep(&mut self, kind: SweepKind) -> Result<SweepId> {
        if let Some(sweep) = &self.sweep {
            return Err(CoordinatorError::AlreadyInProgress(sweep.kind.as_str()));
        }
        let participant = match kind {
            SweepKind::Suspend(_) => DeviceState::Active,
            SweepKind::Resume(_) => DeviceState::Suspended,
        };
        let pending = self
            .devices
            .values()
            .filter(|device| device.state == participant && device.removal.is_none())
            .map(|device| device.id)
            .collect();
        self.next_sweep += 1;
        let id = SweepId(self.next_sweep);
        let sweep = PowerSweep::new(id, kind, pending);
        info!(
            "[devcoord][power] start {} kind={} participants={}",
            id,
            kind.as_str(),
            sweep.pending.len()
        );
        self.sweep = Some(sweep);
        self.pump();
        Ok(id)
    }

    pub(super) fn step_power(&mut self) -> bool {
        let Some(sweep) = &self.sweep else {
            return false;
        };
        let kind = sweep.kind;
        let pending: Vec<DeviceId> = sweep.pending.iter().copied().collect();
        let mut progressed = false;
        for id in pending {
            match self.power_step(id, kind) {
                Step::Wait => {}
                Step::Settle(outcome) => {
                    debug!("[devcoord][power] {} leaves sweep {:?}", id, outcome);
                    self.settle(id, outcome);
                    progressed = true;
                }
                Step::Issue(request) => {
                    let next = match request {
                        HostRequest::Resume { .. } => DeviceState::Resuming,
                        _ => DeviceState::Suspending,
                    };
                    if self.issue(id, request).is_some() {
                        if let Some(device) = self.devices.get_mut(&id) {
                            device.state = next;
                        }
                    } else {
                        self.settle(id, Settle::Failed(Status::PeerClosed));
                    }
                    progressed = true;
                }
            }
        }
        progressed
    }

    fn power_step(&self, id: DeviceId, kind: SweepKind) -> Step {
        let Some(device) = self.devices.get(&id) else {
            return Step::Settle(Settle::Skipped);
        };
        let power_busy = device.tasks.in_flight(TaskKind::Suspend).is_some()
            || device.tasks.in_flight(TaskKind::Resume).is_some();
        if power_busy {
            return Step::Wait;
        }
        if device.state.is_dead() || device.removal.is_some() {
            return Step::Settle(Settle::Skipped);
        }
        let Some(sweep) = &self.sweep else {
            return Step::Wait;
        };
        match kind {
            SweepKind::Suspend(flags) => {
                if device.state != DeviceState::Active {
                    return Step::Settle(Settle::Skipped);
                }
                let dependents_pending = self.dependents(id).iter().any(|dependent| {
                    sweep.pending.contains(dependent)
                        || self
                            .devices
                            .get(dependent)
                            .is_some_and(|device| device.state == DeviceState::Initializing)
                });
                if dependents_pending {
                    return Step::Wait;
                }
                Step::Issue(HostRequest::Suspend { flags })
            }
            SweepKind::Resume(target) => {
                if device.state != DeviceState::Suspended {
                    return Step::Settle(Settle::Skipped);
                }
                for supplier in self.suppliers(id) {
                    if sweep.pending.contains(&supplier) {
                        return Step::Wait;
                    }
                    let supplier_state = self.devices.get(&supplier).map(|device| device.state);
                    if supplier_state != Some(DeviceState::Active) {
                        return Step::Settle(Settle::Failed(Status::BadState));
                    }
                }
                Step::Issue(HostRequest::Resume { target })
            }
        }
    }

    pub(super) fn complete_suspend(&mut self, id: DeviceId, status: Status) {
        let Some(device) = self.devices.get_mut(&id) else {
            return;
        };
        if status.is_ok() {
            device.state = DeviceState::Suspended;
            debug!("[devcoord][power] {} suspended", id);
            self.settle(id, Settle::Completed);
        } else {
            device.state = DeviceState::Active;
            warn!("[devcoord][power] {} suspend failed status={}", id, status);
            self.settle(id, Settle::Failed(status));
        }
    }

    pub(super) fn complete_resume(&mut self, id: DeviceId, status: Status) {
        let Some(device) = self.devices.get_mut(&id) else {
            return;
        };
        if status.is_ok() {
            device.state = DeviceState::Active;
            debug!("[devcoord][power] {} resumed", id);
            self.settle(id, Settle::Completed);
        } else {
            device.state = DeviceState::Suspended;
            warn!("[devcoord][power] {} resume failed status={}", id, status);
            self.settle(id, Settle::Failed(status));
        }
    }

    pub(super) fn finish_sweep(&mut self) {
        if !self.sweep.as_ref().is_some_and(PowerSweep::is_settled) {
            return;
        }
        let Some(sweep) = self.sweep.take() else {
            return;
        };
        let report = sweep.report;
        info!(
            "[devcoord][power] finish {} kind={} completed={} failed={} skipped={}",
            report.id,
            report.kind.as_str(),
            report.completed.len(),
            report.failures.len(),
            report.skipped
        );
        self.outbox.notify(Notification::SweepFinished(report));
    }
}

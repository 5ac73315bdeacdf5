// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Enumeration notifications and the in-memory coordinator outbox.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use crate::devhost::Outbound;
use crate::power::SweepReport;

/// Event published to the enumeration view and sweep callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A visible device was published.
    Added {
        /// Topological path of the device.
        path: String,
    },
    /// A published device was unpublished.
    Removed {
        /// Topological path of the device.
        path: String,
    },
    /// A power sweep settled.
    SweepFinished(SweepReport),
}

/// Ordered queues the embedder drains after each event.
///
/// The coordinator never performs I/O itself; it appends here and the caller
/// decides when and how to deliver.
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    outbound: Vec<Outbound>,
    notifications: Vec<Notification>,
}

impl Outbox {
    pub fn send(&mut self, message: Outbound) {
        self.outbound.push(message);
    }

    pub fn notify(&mut self, notification: Notification) {
        self.notifications.push(notification);
    }

    pub fn outbound(&self) -> &[Outbound] {
        &self.outbound
    }

    pub fn drain_outbound(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbound)
    }

    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }
}

// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Status codes exchanged with devhosts and coordinator error types.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::fmt;

use serde::Serialize;
use thiserror::Error;

use crate::device::{DeviceId, DeviceState};
use crate::devhost::DevhostId;

/// Wire-visible status carried by devhost replies and rejected requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Status {
    /// The request succeeded.
    Ok,
    /// The referenced object does not exist.
    NotFound,
    /// One or more arguments were malformed.
    InvalidArgs,
    /// A uniquely named object already exists.
    AlreadyExists,
    /// The object is not in a state that permits the operation.
    BadState,
    /// The operation is not supported for this object.
    NotSupported,
    /// The caller may not perform the operation on this path.
    AccessDenied,
    /// An operation of the same kind is already running.
    AlreadyInProgress,
    /// The devhost channel closed.
    PeerClosed,
    /// The devhost reported an I/O failure.
    Io,
    /// Internal invariant failure.
    Internal,
}

impl Status {
    /// Return true for [`Status::Ok`].
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Render the canonical status label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::NotFound => "NOT_FOUND",
            Self::InvalidArgs => "INVALID_ARGS",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::BadState => "BAD_STATE",
            Self::NotSupported => "NOT_SUPPORTED",
            Self::AccessDenied => "ACCESS_DENIED",
            Self::AlreadyInProgress => "ALREADY_IN_PROGRESS",
            Self::PeerClosed => "PEER_CLOSED",
            Self::Io => "IO",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced synchronously by coordinator operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    /// No live device exists for the supplied identifier.
    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),
    /// No live devhost exists for the supplied identifier.
    #[error("unknown devhost {0}")]
    UnknownHost(DevhostId),
    /// No live device is published at the path.
    #[error("no device at {0}")]
    UnknownPath(String),
    /// Request arguments were rejected before any state changed.
    #[error("invalid argument: {0}")]
    InvalidArgs(String),
    /// A sibling device or descriptor already uses the name.
    #[error("{0} already exists")]
    AlreadyExists(String),
    /// The device is in a state that rejects the request.
    #[error("device {device} is {state}")]
    BadState {
        /// Device that rejected the request.
        device: DeviceId,
        /// State observed when the request arrived.
        state: DeviceState,
    },
    /// The device is already being torn down.
    #[error("device {0} is scheduled for removal")]
    Removing(DeviceId),
    /// The operation is not defined for the target.
    #[error("not supported: {0}")]
    NotSupported(&'static str),
    /// The path lies under a restricted root.
    #[error("access denied for {0}")]
    AccessDenied(String),
    /// Another operation of the same kind is outstanding.
    #[error("{0} already in progress")]
    AlreadyInProgress(&'static str),
    /// Metadata lookup reached the root without a match.
    #[error("metadata key {key:#x} not found for device {device}")]
    MetadataNotFound {
        /// Device the lookup started from.
        device: DeviceId,
        /// Requested metadata key.
        key: u32,
    },
    /// An internal invariant did not hold.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Map the error onto the status reported at the call boundary.
    pub fn status(&self) -> Status {
        match self {
            Self::UnknownDevice(_)
            | Self::UnknownHost(_)
            | Self::UnknownPath(_)
            | Self::MetadataNotFound { .. } => Status::NotFound,
            Self::InvalidArgs(_) => Status::InvalidArgs,
            Self::AlreadyExists(_) => Status::AlreadyExists,
            Self::BadState { .. } | Self::Removing(_) => Status::BadState,
            Self::NotSupported(_) => Status::NotSupported,
            Self::AccessDenied(_) => Status::AccessDenied,
            Self::AlreadyInProgress(_) => Status::AlreadyInProgress,
            Self::Internal(_) => Status::Internal,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgs(message.into())
    }
}

/// Result alias used across the coordinator.
pub type Result<T> = std::result::Result<T, CoordinatorError>;

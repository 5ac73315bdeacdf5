// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Metadata entries and the path-published metadata store.
// Author: Lukas Bower
#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use log::debug;
use serde::Serialize;

use crate::error::{CoordinatorError, Result};

/// Keyed metadata payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct MetadataEntry {
    /// Metadata key.
    pub key: u32,
    /// Opaque payload.
    pub data: Vec<u8>,
}

impl MetadataEntry {
    /// Build an entry.
    pub fn new(key: u32, data: impl Into<Vec<u8>>) -> Self {
        Self {
            key,
            data: data.into(),
        }
    }
}

/// Metadata published against topological paths.
///
/// Entries are keyed by path rather than device so that a device rebuilt at
/// the same path (a reassembled composite) sees the same payloads.
#[derive(Debug, Default)]
pub(crate) struct MetadataStore {
    restricted_roots: Vec<String>,
    published: BTreeMap<(String, u32), Vec<u8>>,
}

impl MetadataStore {
    pub fn new(restricted_roots: Vec<String>) -> Self {
        Self {
            restricted_roots,
            published: BTreeMap::new(),
        }
    }

    pub fn publish(&mut self, path: &str, key: u32, data: Vec<u8>) -> Result<()> {
        if !path.starts_with('/') || path.ends_with('/') {
            return Err(CoordinatorError::invalid(format!(
                "metadata path '{path}' is not absolute"
            )));
        }
        if self.is_restricted(path) {
            return Err(CoordinatorError::AccessDenied(path.to_owned()));
        }
        debug!(
            "[devcoord][metadata] publish path={} key={:#x} len={}",
            path,
            key,
            data.len()
        );
        self.published.insert((path.to_owned(), key), data);
        Ok(())
    }

    pub fn lookup(&self, path: &str, key: u32) -> Option<&[u8]> {
        self.published
            .get(&(path.to_owned(), key))
            .map(Vec::as_slice)
    }

    pub fn is_restricted(&self, path: &str) -> bool {
        self.restricted_roots.iter().any(|root| {
            path == root
                || path
                    .strip_prefix(root.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Forwarding-plane command interface.
//!
//! The daemon never talks to the packet path directly; it issues commands
//! through [`IpvsPlane`] and a transport implements them. [`RecordingPlane`]
//! keeps the command stream in memory, which is what every reload and quorum
//! test asserts against (a no-op reload must record an empty stream).

use crate::model::{AddrGroupEntry, RangeEntry, TunnelEntry};
use std::fmt::Debug;
use std::net::SocketAddr;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlaneError {
    #[error("plane command failed: {0}")]
    Failed(String),
}

/// One command towards the forwarding plane. Virtual servers are named by
/// their display identity; destination commands carry the weight actually
/// installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaneCmd {
    AddVs { vs: String },
    EditVs { vs: String },
    DelVs { vs: String },
    AddDest { vs: String, rs: SocketAddr, weight: i32 },
    EditDest { vs: String, rs: SocketAddr, weight: i32 },
    DelDest { vs: String, rs: SocketAddr },
    AddGroupEntry { vs: String, entry: String },
    SyncGroupEntry { vs: String, entry: String },
    DelGroupEntry { vs: String, entry: String },
    AddLaddrEntry { vs: String, entry: String },
    DelLaddrEntry { vs: String, entry: String },
    AddBlklstEntry { vs: String, entry: String },
    DelBlklstEntry { vs: String, entry: String },
    AddTunnel { ifname: String },
    DelTunnel { ifname: String },
}

/// Command sink towards the forwarding plane.
pub trait IpvsPlane: Debug {
    /// Applies one command.
    ///
    /// # Errors
    ///
    /// [`PlaneError::Failed`] when the plane rejects the command.
    fn apply(&mut self, cmd: PlaneCmd) -> Result<(), PlaneError>;
}

/// Formats a group range entry the way plane commands name it.
#[must_use]
pub fn range_entry_id(entry: &RangeEntry) -> String {
    format!(
        "{}-{}:{}",
        entry.range.first, entry.range.last, entry.port
    )
}

/// Formats a local-address/blacklist entry the way plane commands name it.
#[must_use]
pub fn addr_entry_id(entry: &AddrGroupEntry) -> String {
    if entry.ifname.is_empty() {
        format!("{}-{}", entry.range.first, entry.range.last)
    } else {
        format!(
            "{}-{}%{}",
            entry.range.first, entry.range.last, entry.ifname
        )
    }
}

/// Formats a tunnel entry the way plane commands name it.
#[must_use]
pub fn tunnel_entry_id(entry: &TunnelEntry) -> String {
    entry.ifname.clone()
}

/// In-memory [`IpvsPlane`] recording every command.
#[derive(Debug, Default)]
pub struct RecordingPlane {
    cmds: Vec<PlaneCmd>,
}

impl RecordingPlane {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn cmds(&self) -> &[PlaneCmd] {
        &self.cmds
    }

    pub fn clear(&mut self) {
        self.cmds.clear();
    }
}

impl IpvsPlane for RecordingPlane {
    fn apply(&mut self, cmd: PlaneCmd) -> Result<(), PlaneError> {
        self.cmds.push(cmd);
        Ok(())
    }
}

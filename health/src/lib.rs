// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

#![deny(clippy::all)]
#![deny(rustdoc::all)]

//! Real-server quorum and health arbitration for the load-balancer
//! configuration daemon.
//!
//! The daemon watches health-checker verdicts over the real servers of each
//! virtual server and arbitrates three things:
//!
//! - **quorum**: whether the summed weight of alive servers justifies
//!   keeping the service up, under hysteresis, swapping in the sorry server
//!   when it does not ([`quorum`], [`checker`]);
//! - **capacity**: the alive ratio, with debounced operator actions on
//!   crossing the configured limits ([`aratio`]);
//! - **reload**: the minimal plane diff between two configuration
//!   generations, with runtime state migrated onto the survivors
//!   ([`reload`]).
//!
//! Everything runs on one cooperative thread; see [`daemon`].

pub mod aratio;
pub mod checker;
pub mod daemon;
pub mod model;
pub mod notify;
pub mod plane;
pub mod quorum;
pub mod reload;

pub use daemon::{CheckDaemon, Effects};
pub use model::{
    AddrGroup, AddrGroupEntry, AddrRange, CheckData, Checker, CheckerKind, FwdMethod, Proto,
    RealServer, TunnelEntry, TunnelGroup, VirtualServer, VsFlags, VsGroup, VsIdent,
};
pub use notify::{AratioSide, Notifier, recording_notifier};
pub use plane::{IpvsPlane, PlaneCmd, PlaneError, RecordingPlane};

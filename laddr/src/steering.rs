// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Worker steering policy for reply traffic.
//!
//! The connection table is partitioned per worker, so the reply leg of a flow
//! must land on the worker that owns the inbound state. The NIC filter table
//! hashes on the source endpoint we picked for the flow, which leaves two
//! ways to encode the owning worker:
//!
//! - **Lport mode**: the low-order `B` bits of the local port name the
//!   worker, with `2^B >= #workers`. Low-order bits rather than high-order:
//!   operators carve forbidden port ranges (privileged ports, ephemeral
//!   tails) out of the pool, and a high-order split would let such a carve
//!   starve one worker's whole contiguous range while the others stay full.
//! - **Laddr mode**: every `<lip, iface>` pool is pre-bound to exactly one
//!   worker, so the address itself is the steering tag and the port is free.
//!
//! The mode is a deployment-time constant fixed at process start, as is the
//! worker enable-mask. Both are established once and passed by reference;
//! nothing in this crate reads them from ambient state.

use std::fmt;

/// Hard ceiling on worker ids; the enable-mask is one machine word.
pub const MAX_WORKERS: usize = 64;

/// Identifier of a data-plane worker (an lcore in DPDK terms).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u16);

impl WorkerId {
    #[must_use]
    pub fn as_usize(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which workers participate in local-address distribution.
///
/// Bit `w` set means worker `w` is enabled. Ids at or above [`MAX_WORKERS`]
/// never participate, whatever the bits say.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerMask(u64);

impl WorkerMask {
    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[must_use]
    pub fn contains(self, worker: WorkerId) -> bool {
        worker.as_usize() < MAX_WORKERS && self.0 & (1u64 << worker.0) != 0
    }

    /// Enabled workers in ascending id order.
    pub fn iter(self) -> impl Iterator<Item = WorkerId> {
        (0..MAX_WORKERS as u16)
            .map(WorkerId)
            .filter(move |w| self.contains(*w))
    }

    #[must_use]
    pub fn count(self) -> u32 {
        self.0.count_ones()
    }
}

/// How `<lip, lport>` selection maps flows onto workers.
///
/// A deployment-time constant, not a runtime switch: every pool in the
/// process is shaped by the same mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolMode {
    /// The low-order `fdir_bits` bits of the local port encode the worker.
    Lport { fdir_bits: u8 },
    /// Each local address is pre-bound to a single worker.
    Laddr,
}

impl PoolMode {
    /// Does a port reserved on `worker` satisfy the steering contract?
    ///
    /// Always true in laddr mode, where the port carries no steering
    /// information.
    #[must_use]
    pub fn steers_to(self, lport: u16, worker: WorkerId) -> bool {
        match self {
            PoolMode::Lport { fdir_bits } => {
                let mask = (1u16 << fdir_bits) - 1;
                lport & mask == worker.0 & mask
            }
            PoolMode::Laddr => true,
        }
    }

    /// The worker a port steers to, if the mode encodes one.
    #[must_use]
    pub fn worker_of(self, lport: u16) -> Option<WorkerId> {
        match self {
            PoolMode::Lport { fdir_bits } => {
                let mask = (1u16 << fdir_bits) - 1;
                Some(WorkerId(lport & mask))
            }
            PoolMode::Laddr => None,
        }
    }

    /// How many ports of `range` are legal for `worker`. Carving forbidden
    /// ranges out of the port space costs every worker the same share.
    #[must_use]
    pub fn legal_count(self, range: std::ops::RangeInclusive<u16>, worker: WorkerId) -> usize {
        range.filter(|p| self.steers_to(*p, worker)).count()
    }
}

/// Process-wide steering configuration, fixed at startup.
#[derive(Debug, Clone, Copy)]
pub struct SteeringCtx {
    pub mode: PoolMode,
    pub workers: WorkerMask,
}

impl SteeringCtx {
    #[must_use]
    pub fn new(mode: PoolMode, workers: WorkerMask) -> Self {
        if let PoolMode::Lport { fdir_bits } = mode {
            debug_assert!(
                1u64 << fdir_bits >= u64::from(workers.count()),
                "2^fdir_bits must cover the enabled workers"
            );
        }
        Self { mode, workers }
    }
}

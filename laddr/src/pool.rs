// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Per-service local-address pool.
//!
//! One local address covers roughly 60k concurrent flows towards a single
//! real server (only the port varies), so a service holds several and rotates
//! over them. The pool's shape depends on the deployment mode:
//!
//! - lport mode keeps a single ring shared by all workers (the port encodes
//!   the worker, any address works anywhere);
//! - laddr mode keeps one ring per worker, and an address is inserted only
//!   into the slots of workers whose port pool was pre-provisioned for it.
//!
//! A selected address is pinned by a [`LaddrLease`]; deletion of a pinned
//! record reports busy and the operator retries once the flows drain.

use crate::iface::IfaceId;
use crate::sapool::SaPool;
use crate::steering::{MAX_WORKERS, PoolMode, SteeringCtx, WorkerId};
use errcode::CtrlError;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

///////////////////////////////////////////////////////////////////////////////
// LocalAddress
///////////////////////////////////////////////////////////////////////////////

/// One local IP configured on a service.
///
/// `refcnt` pins the record while any reservation backed by it is alive;
/// `conn_counts` is a purely observational counter of bound connections,
/// reported by `enumerate` and never consulted for lifecycle decisions.
#[derive(Debug)]
pub struct LocalAddress {
    addr: IpAddr,
    iface: IfaceId,
    refcnt: AtomicU32,
    conn_counts: AtomicU32,
}

impl LocalAddress {
    fn new(addr: IpAddr, iface: IfaceId) -> Arc<Self> {
        Arc::new(Self {
            addr,
            iface,
            refcnt: AtomicU32::new(0),
            conn_counts: AtomicU32::new(0),
        })
    }

    #[must_use]
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    #[must_use]
    pub fn iface(&self) -> IfaceId {
        self.iface
    }

    #[must_use]
    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn conn_counts(&self) -> u32 {
        self.conn_counts.load(Ordering::Relaxed)
    }

    pub(crate) fn inc_conns(&self) {
        self.conn_counts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_conns(&self) {
        self.conn_counts.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Pinning handle on a [`LocalAddress`].
///
/// Selection hands one out with the pin already taken; dropping it releases
/// the pin. A connection that binds successfully keeps the lease for its
/// whole life, so "increment on select, transfer on success, release on
/// failure" is just move semantics.
#[derive(Debug)]
pub struct LaddrLease {
    laddr: Arc<LocalAddress>,
}

impl LaddrLease {
    fn take(laddr: &Arc<LocalAddress>) -> Self {
        laddr.refcnt.fetch_add(1, Ordering::Relaxed);
        Self {
            laddr: Arc::clone(laddr),
        }
    }

    #[must_use]
    pub fn addr(&self) -> IpAddr {
        self.laddr.addr
    }

    #[must_use]
    pub fn iface(&self) -> IfaceId {
        self.laddr.iface
    }

    #[must_use]
    pub fn record(&self) -> &Arc<LocalAddress> {
        &self.laddr
    }
}

impl Drop for LaddrLease {
    fn drop(&mut self) {
        self.laddr.refcnt.fetch_sub(1, Ordering::Relaxed);
    }
}

///////////////////////////////////////////////////////////////////////////////
// LaddrRing
///////////////////////////////////////////////////////////////////////////////

/// Ordered list of addresses with a wrapping round-robin cursor.
///
/// The cursor remembers the index of the most recently selected record;
/// selection advances first and then returns. Removing the record under the
/// cursor leaves the cursor on its successor (which the next selection will
/// therefore step past), or clears it when the tail was removed.
#[derive(Debug, Default)]
struct LaddrRing {
    entries: Vec<Arc<LocalAddress>>,
    cursor: Option<usize>,
}

impl LaddrRing {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn find(&self, addr: IpAddr) -> Option<usize> {
        self.entries.iter().position(|l| l.addr == addr)
    }

    fn select(&mut self, step: usize) -> Option<&Arc<LocalAddress>> {
        if self.entries.is_empty() {
            return None;
        }
        let mut curr = self.cursor;
        for _ in 0..step {
            curr = Some(match curr {
                None => 0,
                Some(c) => (c + 1) % self.entries.len(),
            });
        }
        self.cursor = curr;
        curr.map(|c| &self.entries[c])
    }

    fn remove(&mut self, index: usize) -> Arc<LocalAddress> {
        let removed = self.entries.remove(index);
        self.cursor = match self.cursor {
            Some(c) if c > index => Some(c - 1),
            Some(c) if c == index => {
                if index < self.entries.len() {
                    Some(index)
                } else {
                    None
                }
            }
            other => other,
        };
        removed
    }

    /// Drops every unpinned record; reports whether any pinned one survived.
    fn flush(&mut self) -> bool {
        let mut busy = false;
        let mut index = 0;
        while index < self.entries.len() {
            if self.entries[index].refcnt() == 0 {
                self.remove(index);
            } else {
                debug!(laddr = %self.entries[index].addr, "laddr is in use");
                busy = true;
                index += 1;
            }
        }
        busy
    }
}

///////////////////////////////////////////////////////////////////////////////
// LaddrPool
///////////////////////////////////////////////////////////////////////////////

/// Snapshot row returned by [`LaddrPool::enumerate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaddrSnapshot {
    pub addr: IpAddr,
    pub conn_counts: u32,
}

/// The per-service pool, shaped by the deployment mode.
#[derive(Debug)]
pub enum LaddrPool {
    Lport(LportPool),
    Laddr(PerWorkerPool),
}

#[derive(Debug, Default)]
pub struct LportPool {
    ring: LaddrRing,
}

#[derive(Debug)]
pub struct PerWorkerPool {
    slots: Box<[LaddrRing]>,
}

impl Default for PerWorkerPool {
    fn default() -> Self {
        let slots: Vec<LaddrRing> = (0..MAX_WORKERS).map(|_| LaddrRing::default()).collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }
}

impl LaddrPool {
    #[must_use]
    pub fn new(mode: PoolMode) -> Self {
        match mode {
            PoolMode::Lport { .. } => LaddrPool::Lport(LportPool::default()),
            PoolMode::Laddr => LaddrPool::Laddr(PerWorkerPool::default()),
        }
    }

    /// Number of addresses selectable on `worker`.
    #[must_use]
    pub fn num_laddrs(&self, worker: WorkerId) -> usize {
        match self {
            LaddrPool::Lport(pool) => pool.ring.len(),
            LaddrPool::Laddr(pool) => pool.slots[worker.as_usize()].len(),
        }
    }

    /// Adds a local address to the pool.
    ///
    /// # Errors
    ///
    /// `Exist` for a duplicate address; in laddr mode, `NotExist` when no
    /// enabled worker has a port pool for `<addr, iface>`.
    pub fn add(
        &mut self,
        addr: IpAddr,
        iface: IfaceId,
        ctx: &SteeringCtx,
        sapool: &dyn SaPool,
    ) -> Result<(), CtrlError> {
        match self {
            LaddrPool::Lport(pool) => {
                if pool.ring.find(addr).is_some() {
                    return Err(CtrlError::Exist);
                }
                pool.ring.entries.push(LocalAddress::new(addr, iface));
                Ok(())
            }
            LaddrPool::Laddr(pool) => {
                if pool.slots.iter().any(|slot| slot.find(addr).is_some()) {
                    return Err(CtrlError::Exist);
                }
                let workers: Vec<WorkerId> = ctx
                    .workers
                    .iter()
                    .filter(|w| sapool.provisioned(*w, iface, addr))
                    .collect();
                if workers.is_empty() {
                    return Err(CtrlError::NotExist);
                }
                // One shared record; each provisioned worker's ring pins it
                // through the same counters.
                let record = LocalAddress::new(addr, iface);
                for worker in workers {
                    pool.slots[worker.as_usize()]
                        .entries
                        .push(Arc::clone(&record));
                }
                Ok(())
            }
        }
    }

    /// Deletes an address, failing with `Busy` while it is pinned.
    ///
    /// # Errors
    ///
    /// `NotExist` when absent, `Busy` when `refcnt > 0` (no side effects).
    pub fn delete(&mut self, addr: IpAddr) -> Result<(), CtrlError> {
        match self {
            LaddrPool::Lport(pool) => {
                let index = pool.ring.find(addr).ok_or(CtrlError::NotExist)?;
                if pool.ring.entries[index].refcnt() != 0 {
                    debug!(laddr = %addr, "laddr is in use");
                    return Err(CtrlError::Busy);
                }
                pool.ring.remove(index);
                Ok(())
            }
            LaddrPool::Laddr(pool) => {
                let mut err = Err(CtrlError::NotExist);
                for slot in pool.slots.iter_mut() {
                    let Some(index) = slot.find(addr) else {
                        continue;
                    };
                    if slot.entries[index].refcnt() != 0 {
                        debug!(laddr = %addr, "laddr is in use");
                        err = Err(CtrlError::Busy);
                        continue;
                    }
                    slot.remove(index);
                    if err.is_err() && err != Err(CtrlError::Busy) {
                        err = Ok(());
                    }
                }
                err
            }
        }
    }

    /// Best-effort removal of every unpinned address.
    ///
    /// # Errors
    ///
    /// `Busy` when at least one pinned record survived.
    pub fn flush(&mut self) -> Result<(), CtrlError> {
        let busy = match self {
            LaddrPool::Lport(pool) => pool.ring.flush(),
            LaddrPool::Laddr(pool) => {
                let mut busy = false;
                for slot in pool.slots.iter_mut() {
                    busy |= slot.flush();
                }
                busy
            }
        };
        if busy { Err(CtrlError::Busy) } else { Ok(()) }
    }

    /// Snapshot of every distinct address and its connection count.
    #[must_use]
    pub fn enumerate(&self) -> Vec<LaddrSnapshot> {
        let snap = |l: &Arc<LocalAddress>| LaddrSnapshot {
            addr: l.addr,
            conn_counts: l.conn_counts(),
        };
        match self {
            LaddrPool::Lport(pool) => pool.ring.entries.iter().map(snap).collect(),
            LaddrPool::Laddr(pool) => {
                let mut out: Vec<LaddrSnapshot> = Vec::new();
                for slot in pool.slots.iter() {
                    for laddr in &slot.entries {
                        if !out.iter().any(|s| s.addr == laddr.addr) {
                            out.push(snap(laddr));
                        }
                    }
                }
                out
            }
        }
    }

    /// Round-robin selection; the returned lease pins the record.
    ///
    /// `step` is normally 1; a caller may pass 2 to break resonance with the
    /// real-server scheduler (lport mode only — per-worker rings cannot fall
    /// into lock-step with a scheduler running on the same worker).
    #[must_use]
    pub fn select(&mut self, worker: WorkerId, step: usize) -> Option<LaddrLease> {
        match self {
            LaddrPool::Lport(pool) => pool.ring.select(step).map(LaddrLease::take),
            LaddrPool::Laddr(pool) => pool.slots[worker.as_usize()]
                .select(1)
                .map(LaddrLease::take),
        }
    }
}

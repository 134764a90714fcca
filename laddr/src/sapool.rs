// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Socket-address pool interface.
//!
//! The pool that actually hands out `<lip, lport>` pairs lives outside this
//! crate; what we depend on is its contract. A pool is scoped by
//! `<worker, iface, lip>` and guarantees that a fetched port is unique for
//! the given destination endpoint and satisfies the steering policy of the
//! deployment ([`PoolMode`]). Pools are externally synchronized per scope, so
//! the trait takes `&self`.
//!
//! [`MemSaPool`] is an in-memory implementation of the same contract. It
//! backs every test in the workspace and doubles as executable documentation
//! for external implementations.

use crate::iface::IfaceId;
use crate::steering::{PoolMode, SteeringCtx, WorkerId};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt::Debug;
use std::net::{IpAddr, SocketAddr};
use std::num::NonZero;
use std::ops::RangeInclusive;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum SaPoolError {
    /// No pool has been provisioned for this `<worker, iface, lip>`.
    #[error("no port pool for this local address")]
    NoPool,
    /// The pool exists but every legal port is in use.
    #[error("port pool exhausted")]
    Exhausted,
}

/// Reserve/release contract against the `<lip, lport>` pool.
pub trait SaPool: Debug + Send + Sync {
    /// Reserves a source port on `worker` for a flow towards `dst`, sourced
    /// from `lip` on `iface`.
    ///
    /// # Errors
    ///
    /// [`SaPoolError::NoPool`] when the scope has no pool,
    /// [`SaPoolError::Exhausted`] when no legal port is free.
    fn fetch(
        &self,
        worker: WorkerId,
        iface: IfaceId,
        dst: SocketAddr,
        lip: IpAddr,
    ) -> Result<NonZero<u16>, SaPoolError>;

    /// Returns a reservation. Idempotent with respect to a matching prior
    /// [`SaPool::fetch`]; releasing an unknown pair is a no-op.
    fn release(&self, worker: WorkerId, iface: IfaceId, dst: SocketAddr, src: SocketAddr);

    /// Whether a pool exists for `<lip, iface>` on `worker`.
    fn provisioned(&self, worker: WorkerId, iface: IfaceId, lip: IpAddr) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PoolKey {
    worker: WorkerId,
    iface: IfaceId,
    lip: IpAddr,
}

#[derive(Debug, Default)]
struct PortPool {
    free: BTreeSet<u16>,
    busy: HashSet<(SocketAddr, u16)>,
}

impl PortPool {
    fn fetch(&mut self, dst: SocketAddr) -> Option<NonZero<u16>> {
        let port = self.free.pop_first()?;
        self.busy.insert((dst, port));
        NonZero::new(port)
    }

    fn release(&mut self, dst: SocketAddr, sport: u16) {
        if self.busy.remove(&(dst, sport)) {
            self.free.insert(sport);
        }
    }
}

/// In-memory [`SaPool`].
///
/// Ports are handed out in ascending order within a scope, which keeps test
/// expectations simple; nothing in the contract promises an order.
#[derive(Debug, Default)]
pub struct MemSaPool {
    pools: Mutex<HashMap<PoolKey, PortPool>>,
}

impl MemSaPool {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Provisions a pool for `<worker, iface, lip>` holding the ports of
    /// `range` that are legal for `worker` under `mode`. Port 0 is never
    /// provisioned.
    pub fn provision(
        &self,
        worker: WorkerId,
        iface: IfaceId,
        lip: IpAddr,
        range: RangeInclusive<u16>,
        mode: PoolMode,
    ) {
        let free: BTreeSet<u16> = range
            .filter(|p| *p != 0 && mode.steers_to(*p, worker))
            .collect();
        let key = PoolKey { worker, iface, lip };
        self.pools.lock().unwrap().insert(
            key,
            PortPool {
                free,
                busy: HashSet::new(),
            },
        );
    }

    /// Lport-mode convenience: provisions the pool on every enabled worker,
    /// each receiving its steering-legal slice of `range`.
    pub fn provision_all(
        &self,
        ctx: &SteeringCtx,
        iface: IfaceId,
        lip: IpAddr,
        range: RangeInclusive<u16>,
    ) {
        for worker in ctx.workers.iter() {
            self.provision(worker, iface, lip, range.clone(), ctx.mode);
        }
    }

    /// Count of free ports in one scope, for test assertions.
    #[must_use]
    pub fn free_ports(&self, worker: WorkerId, iface: IfaceId, lip: IpAddr) -> usize {
        let key = PoolKey { worker, iface, lip };
        self.pools
            .lock()
            .unwrap()
            .get(&key)
            .map_or(0, |pool| pool.free.len())
    }
}

impl SaPool for MemSaPool {
    fn fetch(
        &self,
        worker: WorkerId,
        iface: IfaceId,
        dst: SocketAddr,
        lip: IpAddr,
    ) -> Result<NonZero<u16>, SaPoolError> {
        let key = PoolKey { worker, iface, lip };
        let mut pools = self.pools.lock().unwrap();
        let pool = pools.get_mut(&key).ok_or(SaPoolError::NoPool)?;
        pool.fetch(dst).ok_or(SaPoolError::Exhausted)
    }

    fn release(&self, worker: WorkerId, iface: IfaceId, dst: SocketAddr, src: SocketAddr) {
        let key = PoolKey {
            worker,
            iface,
            lip: src.ip(),
        };
        if let Some(pool) = self.pools.lock().unwrap().get_mut(&key) {
            pool.release(dst, src.port());
        }
    }

    fn provisioned(&self, worker: WorkerId, iface: IfaceId, lip: IpAddr) -> bool {
        let key = PoolKey { worker, iface, lip };
        self.pools.lock().unwrap().contains_key(&key)
    }
}

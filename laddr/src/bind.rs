// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Binding a connection to a `<lip, lport>` endpoint.
//!
//! Sometimes port allocation fails on one local address while another still
//! has room, so a bind walks the pool under the service's write lock (the
//! walk moves the shared cursor and reads the pool size). The walk is
//! bounded: at most [`LADDR_MAX_TRAILS`] addresses are tried before the
//! caller is told the service is out of resources and drops the packet.

use crate::iface::IfaceTable;
use crate::pool::{LaddrLease, LaddrPool, LaddrSnapshot};
use crate::sapool::SaPool;
use crate::steering::{PoolMode, SteeringCtx, WorkerId};
use bitflags::bitflags;
use errcode::CtrlError;
use rand::Rng;
use std::net::{IpAddr, SocketAddr};
use std::sync::RwLock;
use tracing::{debug, error};

/// Trial budget of one bind call.
pub const LADDR_MAX_TRAILS: usize = 16;

/// Transport protocol of a virtual service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Tcp,
    Udp,
    Sctp,
}

/// Real-server scheduler name attached to a service. The scheduler itself is
/// pluggable and none of our business; only its rhythm matters here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedName(String);

impl SchedName {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self(name.to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `rr`/`wrr` advance one step per new session, the same rhythm as the
    /// laddr cursor, and the two can synchronize.
    #[must_use]
    pub fn lockstep_prone(&self) -> bool {
        self.0 == "rr" || self.0 == "wrr"
    }
}

/// Identity of a virtual service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceIdent {
    Addr { vaddr: IpAddr, vport: u16 },
    Fwmark(u32),
    Match(crate::sockopt::MatchSelector),
}

/// A virtual service as the data plane sees it: identity, protocol,
/// scheduler name and the local-address pool.
#[derive(Debug)]
pub struct VirtualService {
    ident: ServiceIdent,
    proto: Proto,
    sched: SchedName,
    pool: RwLock<LaddrPool>,
}

impl VirtualService {
    #[must_use]
    pub fn new(ident: ServiceIdent, proto: Proto, sched: SchedName, mode: PoolMode) -> Self {
        Self {
            ident,
            proto,
            sched,
            pool: RwLock::new(LaddrPool::new(mode)),
        }
    }

    #[must_use]
    pub fn ident(&self) -> &ServiceIdent {
        &self.ident
    }

    #[must_use]
    pub fn proto(&self) -> Proto {
        self.proto
    }

    #[must_use]
    pub fn sched(&self) -> &SchedName {
        &self.sched
    }

    /// Adds a local address, resolving `ifname` against the device table.
    ///
    /// # Errors
    ///
    /// `NotExist` for an unknown interface or (laddr mode) an address with no
    /// provisioned worker; `Exist` for a duplicate.
    pub fn laddr_add(
        &self,
        ifaces: &IfaceTable,
        ctx: &SteeringCtx,
        sapool: &dyn SaPool,
        addr: IpAddr,
        ifname: &str,
    ) -> Result<(), CtrlError> {
        let iface = ifaces.lookup(ifname).ok_or(CtrlError::NotExist)?;
        self.pool.write().unwrap().add(addr, iface, ctx, sapool)
    }

    /// Deletes a local address.
    ///
    /// # Errors
    ///
    /// `Busy` while flows still pin it; the caller retries.
    pub fn laddr_del(&self, addr: IpAddr) -> Result<(), CtrlError> {
        self.pool.write().unwrap().delete(addr)
    }

    /// Deletes every unpinned local address.
    ///
    /// # Errors
    ///
    /// `Busy` when some record survived.
    pub fn laddr_flush(&self) -> Result<(), CtrlError> {
        self.pool.write().unwrap().flush()
    }

    /// Stable snapshot of the pool, taken under one lock acquisition.
    #[must_use]
    pub fn laddr_enumerate(&self) -> Vec<LaddrSnapshot> {
        self.pool.read().unwrap().enumerate()
    }
}

bitflags! {
    /// Connection flags the binder cares about.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ConnFlags: u32 {
        /// Persistence template: carries no flow of its own, never binds.
        const TEMPLATE = 0b1;
    }
}

/// Mutable connection state the binder stamps.
///
/// `dest` is the real-server endpoint picked by the scheduler before the
/// bind. On success the binder fills `laddr`/`lport`, redirects the
/// reply-side tuple destination, and parks the pin in `local`.
#[derive(Debug, Default)]
pub struct FnatConn {
    pub flags: ConnFlags,
    pub dest: Option<SocketAddr>,
    pub laddr: Option<IpAddr>,
    pub lport: u16,
    pub reply_dst: Option<SocketAddr>,
    pub local: Option<LaddrLease>,
}

impl FnatConn {
    #[must_use]
    pub fn to_dest(dest: SocketAddr) -> Self {
        Self {
            dest: Some(dest),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn template(dest: SocketAddr) -> Self {
        Self {
            flags: ConnFlags::TEMPLATE,
            dest: Some(dest),
            ..Self::default()
        }
    }
}

/// Everything a worker needs to reach the pool machinery.
#[derive(Debug, Clone, Copy)]
pub struct FnatEnv<'a> {
    pub steering: &'a SteeringCtx,
    pub sapool: &'a dyn SaPool,
}

/// One laddr-cursor step for a new session.
///
/// A real-server `rr`/`wrr` scheduler can advance in lock-step with a strict
/// round-robin laddr cursor, gluing one real server to one local IP for long
/// stretches and exhausting its per-source four-tuple budget. Five percent of
/// sessions take a double step to break the resonance. Per-worker rings
/// (laddr mode) cannot resonate, so they always step by one.
fn laddr_step(mode: PoolMode, sched: &SchedName) -> usize {
    match mode {
        PoolMode::Lport { .. } if sched.lockstep_prone() => {
            if rand::rng().random_range(0..100) < 5 {
                2
            } else {
                1
            }
        }
        _ => 1,
    }
}

/// Binds `conn` to a `<lip, lport>` endpoint of `svc`.
///
/// All-or-nothing: on any failure the connection is left untouched and every
/// intermediate reservation is rolled back.
///
/// # Errors
///
/// `Invalid` on a connection with no destination, `NotSupported` for
/// non-TCP/UDP services, `ResourceExhausted` when no address yields a port
/// within the trial budget.
pub fn bind(
    env: &FnatEnv<'_>,
    worker: WorkerId,
    conn: &mut FnatConn,
    svc: &VirtualService,
) -> Result<(), CtrlError> {
    let dest = conn.dest.ok_or(CtrlError::Invalid)?;
    if !matches!(svc.proto, Proto::Tcp | Proto::Udp) {
        return Err(CtrlError::NotSupported);
    }
    if conn.flags.contains(ConnFlags::TEMPLATE) {
        return Ok(());
    }

    let mut bound: Option<(LaddrLease, u16)> = None;
    {
        let mut pool = svc.pool.write().unwrap();
        let num_laddrs = pool.num_laddrs(worker);
        for _ in 0..LADDR_MAX_TRAILS.min(num_laddrs) {
            let step = laddr_step(env.steering.mode, &svc.sched);
            let Some(lease) = pool.select(worker, step) else {
                error!(%worker, "no laddr available");
                return Err(CtrlError::ResourceExhausted);
            };

            // The per-worker pool can disappear between configuration and
            // now; this laddr then belongs to some other worker.
            if env.steering.mode == PoolMode::Laddr
                && !env.sapool.provisioned(worker, lease.iface(), lease.addr())
            {
                debug!(laddr = %lease.addr(), %worker, "not assigned on this worker, try next laddr");
                continue;
            }

            match env.sapool.fetch(worker, lease.iface(), dest, lease.addr()) {
                Ok(sport) => {
                    bound = Some((lease, sport.get()));
                    break;
                }
                Err(err) => {
                    debug!(laddr = %lease.addr(), %worker, %err, "no lport available, try next laddr");
                }
            }
        }
    }

    let Some((lease, sport)) = bound else {
        debug!(%worker, "no lport available on any laddr");
        return Err(CtrlError::ResourceExhausted);
    };

    lease.record().inc_conns();
    conn.laddr = Some(lease.addr());
    conn.lport = sport;
    conn.reply_dst = Some(SocketAddr::new(lease.addr(), sport));
    conn.local = Some(lease);
    Ok(())
}

/// Releases the endpoint held by `conn`, if any. Idempotent; templates and
/// never-bound connections pass through untouched.
pub fn unbind(env: &FnatEnv<'_>, worker: WorkerId, conn: &mut FnatConn) {
    if conn.flags.contains(ConnFlags::TEMPLATE) {
        return;
    }
    let Some(lease) = conn.local.take() else {
        return;
    };
    if let Some(dest) = conn.dest {
        let src = SocketAddr::new(lease.addr(), conn.lport);
        env.sapool.release(worker, lease.iface(), dest, src);
    }
    lease.record().dec_conns();
    drop(lease);
}

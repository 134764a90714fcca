// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Configuration and runtime model of the health daemon.
//!
//! A [`CheckData`] holds one complete configuration generation: virtual
//! servers, their real servers and sorry servers, virtual-server groups,
//! local-address and blacklist groups, tunnel groups. Runtime state (alive
//! flags, quorum state, checker history) lives on the same objects; a reload
//! migrates it from the outgoing generation onto the incoming one.

use bitflags::bitflags;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

///////////////////////////////////////////////////////////////////////////////
// Address ranges
///////////////////////////////////////////////////////////////////////////////

/// Inclusive range of addresses, compared and iterated on canonical values
/// (never on network-byte-order words).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrRange {
    pub first: IpAddr,
    pub last: IpAddr,
}

fn addr_bits(addr: IpAddr) -> u128 {
    match addr {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn bits_addr(bits: u128, v6: bool) -> IpAddr {
    if v6 {
        return IpAddr::V6(Ipv6Addr::from(bits));
    }
    #[allow(clippy::cast_possible_truncation)]
    let v4 = bits as u32;
    IpAddr::V4(Ipv4Addr::from(v4))
}

impl AddrRange {
    #[must_use]
    pub fn single(addr: IpAddr) -> Self {
        Self {
            first: addr,
            last: addr,
        }
    }

    #[must_use]
    pub fn contains(&self, addr: IpAddr) -> bool {
        addr.is_ipv6() == self.first.is_ipv6()
            && (addr_bits(self.first)..=addr_bits(self.last)).contains(&addr_bits(addr))
    }

    #[must_use]
    pub fn overlaps(&self, other: &AddrRange) -> bool {
        self.first.is_ipv6() == other.first.is_ipv6()
            && addr_bits(self.first) <= addr_bits(other.last)
            && addr_bits(other.first) <= addr_bits(self.last)
    }

    /// Every address of the range, ascending.
    pub fn addrs(&self) -> impl Iterator<Item = IpAddr> + use<> {
        let v6 = self.first.is_ipv6();
        (addr_bits(self.first)..=addr_bits(self.last)).map(move |bits| bits_addr(bits, v6))
    }
}

///////////////////////////////////////////////////////////////////////////////
// Virtual-server groups
///////////////////////////////////////////////////////////////////////////////

/// Per-entry alive counters, migrated across reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryAlive {
    pub tcp: u32,
    pub udp: u32,
    pub sctp: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeEntry {
    pub range: AddrRange,
    pub port: u16,
    pub alive: EntryAlive,
    pub reloaded: bool,
}

impl RangeEntry {
    #[must_use]
    pub fn new(range: AddrRange, port: u16) -> Self {
        Self {
            range,
            port,
            alive: EntryAlive::default(),
            reloaded: false,
        }
    }

    #[must_use]
    pub fn same_identity(&self, other: &Self) -> bool {
        self.range == other.range && self.port == other.port
    }
}

/// Per-fwmark alive counters, one per address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FwmarkAlive {
    pub v4: u32,
    pub v6: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FwmarkEntry {
    pub fwmark: u32,
    pub alive: FwmarkAlive,
    pub reloaded: bool,
}

impl FwmarkEntry {
    #[must_use]
    pub fn new(fwmark: u32) -> Self {
        Self {
            fwmark,
            alive: FwmarkAlive::default(),
            reloaded: false,
        }
    }
}

/// Named set of address ranges and firewall marks sharing one service
/// configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VsGroup {
    pub name: String,
    pub ranges: Vec<RangeEntry>,
    pub fwmarks: Vec<FwmarkEntry>,
}

impl VsGroup {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ranges: Vec::new(),
            fwmarks: Vec::new(),
        }
    }

    #[must_use]
    pub fn has_addr(&self, addr: IpAddr) -> bool {
        self.ranges.iter().any(|e| e.range.contains(addr))
    }

    #[must_use]
    pub fn shares_addr(&self, other: &VsGroup) -> bool {
        if self.name == other.name {
            return true;
        }
        self.ranges
            .iter()
            .any(|a| other.ranges.iter().any(|b| a.range.overlaps(&b.range)))
    }
}

///////////////////////////////////////////////////////////////////////////////
// Address groups (local addresses, blacklists)
///////////////////////////////////////////////////////////////////////////////

/// One entry of a local-address or blacklist group. `ifname` is empty for
/// blacklist entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrGroupEntry {
    pub range: AddrRange,
    pub ifname: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrGroup {
    pub name: String,
    pub entries: Vec<AddrGroupEntry>,
}

impl AddrGroup {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: Vec::new(),
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
// Tunnel groups
///////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelEntry {
    pub ifname: String,
    pub link: String,
    pub kind: String,
    pub local: IpAddr,
    pub remote: IpAddr,
}

impl TunnelEntry {
    #[must_use]
    pub fn same_identity(&self, other: &Self) -> bool {
        self.ifname == other.ifname
            && self.link == other.link
            && self.kind == other.kind
            && self.local == other.local
            && self.remote == other.remote
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelGroup {
    pub name: String,
    pub entries: Vec<TunnelEntry>,
}

///////////////////////////////////////////////////////////////////////////////
// Real servers
///////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Tcp,
    Udp,
    Sctp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Tcp => write!(f, "TCP"),
            Proto::Udp => write!(f, "UDP"),
            Proto::Sctp => write!(f, "SCTP"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FwdMethod {
    Fnat,
    Nat,
    Dr,
    Tunnel,
}

/// Tunnel encapsulation parameters of a real server; a change forces a
/// plane-level edit on reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RsTunnel {
    pub kind: u16,
    pub port: u16,
    pub csum: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealServer {
    pub addr: SocketAddr,
    /// Administrative weight; `iweight` is the configured snapshot, and
    /// `pweight` the weight carried over from before a reload.
    pub weight: i32,
    pub iweight: i32,
    pub pweight: i32,
    /// Keep the server installed with weight zero on failure instead of
    /// removing it.
    pub inhibit: bool,
    pub smtp_alert: bool,
    pub notify_up: Option<String>,
    pub notify_down: Option<String>,
    pub fwd_method: FwdMethod,
    pub tunnel: Option<RsTunnel>,
    // Runtime.
    pub alive: bool,
    /// Shadows forwarding-plane membership; the plane is the ground truth.
    pub set: bool,
    pub reloaded: bool,
    pub num_failed_checkers: u32,
}

impl RealServer {
    #[must_use]
    pub fn new(addr: SocketAddr, weight: i32) -> Self {
        Self {
            addr,
            weight,
            iweight: weight,
            pweight: weight,
            inhibit: false,
            smtp_alert: false,
            notify_up: None,
            notify_down: None,
            fwd_method: FwdMethod::Fnat,
            tunnel: None,
            alive: false,
            set: false,
            reloaded: false,
            num_failed_checkers: 0,
        }
    }

    #[must_use]
    pub fn same_identity(&self, other: &Self) -> bool {
        self.addr == other.addr
    }

    /// Weight as installed into the plane: zero while any checker holds the
    /// server failed.
    #[must_use]
    pub fn effective_weight(&self) -> i32 {
        if self.num_failed_checkers > 0 {
            0
        } else {
            self.weight
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
// Virtual servers
///////////////////////////////////////////////////////////////////////////////

/// Identity of a virtual server. Group members carry a sequence number in
/// place of a port, assigned when groups are linked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VsIdent {
    Addr { proto: Proto, addr: SocketAddr },
    Fwmark { v6: bool, mark: u32 },
    Group { name: String, seq: u16 },
}

impl fmt::Display for VsIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VsIdent::Addr { addr, .. } => write!(f, "{addr}"),
            VsIdent::Fwmark { mark, .. } => write!(f, "FWM#{mark}"),
            VsIdent::Group { name, .. } => write!(f, "{name}"),
        }
    }
}

bitflags! {
    /// Runtime flag bits of a virtual server.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct VsFlags: u32 {
        /// The alive ratio dropped to the lower limit and the operator was
        /// (or is about to be) told.
        const ARATIO_REACHED_LOWER = 0b1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualServer {
    pub ident: VsIdent,
    pub service_type: Proto,
    pub fwd_method: FwdMethod,
    pub sched: String,
    /// Opaque plane-level flag word; a change forces a plane edit on reload.
    pub conf_flags: u64,
    pub persistence_granularity: u32,
    pub persistence_timeout: u32,
    pub quorum: u32,
    pub hysteresis: u32,
    /// Fire non-SNMP notifiers even while shutting down.
    pub omega: bool,
    pub smtp_alert: bool,
    pub notify_quorum_up: Option<String>,
    pub notify_quorum_down: Option<String>,
    pub aratio_upper_limit: u32,
    pub aratio_lower_limit: u32,
    pub aratio_action: Option<String>,
    pub laddr_gname: Option<String>,
    pub blklst_gname: Option<String>,
    pub rs: Vec<RealServer>,
    pub s_svr: Option<RealServer>,
    // Runtime.
    pub alive: bool,
    pub quorum_state_up: bool,
    pub reloaded: bool,
    pub rs_alive_count: u32,
    pub flags: VsFlags,
    /// One-tick debounce slot for the upper-limit action.
    pub upper_timer_armed: bool,
}

impl VirtualServer {
    #[must_use]
    pub fn new(ident: VsIdent, service_type: Proto, quorum: u32, hysteresis: u32) -> Self {
        Self {
            ident,
            service_type,
            fwd_method: FwdMethod::Fnat,
            sched: "rr".to_string(),
            conf_flags: 0,
            persistence_granularity: 0,
            persistence_timeout: 0,
            quorum,
            hysteresis,
            omega: false,
            smtp_alert: false,
            notify_quorum_up: None,
            notify_quorum_down: None,
            aratio_upper_limit: 100,
            aratio_lower_limit: 0,
            aratio_action: None,
            laddr_gname: None,
            blklst_gname: None,
            rs: Vec::new(),
            s_svr: None,
            alive: false,
            quorum_state_up: false,
            reloaded: false,
            rs_alive_count: 0,
            flags: VsFlags::empty(),
            upper_timer_armed: false,
        }
    }

    #[must_use]
    pub fn same_identity(&self, other: &Self) -> bool {
        self.ident == other.ident
    }

    #[must_use]
    pub fn group_name(&self) -> Option<&str> {
        match &self.ident {
            VsIdent::Group { name, .. } => Some(name),
            _ => None,
        }
    }

    /// The single virtual address, when the identity carries one.
    #[must_use]
    pub fn vip(&self) -> Option<IpAddr> {
        match &self.ident {
            VsIdent::Addr { addr, .. } => Some(addr.ip()),
            _ => None,
        }
    }

    /// Percentage of alive real servers; zero for an empty pool.
    #[must_use]
    pub fn alive_ratio(&self) -> u32 {
        if self.rs.is_empty() {
            return 0;
        }
        #[allow(clippy::cast_possible_truncation)]
        let total = self.rs.len() as u32;
        self.rs_alive_count * 100 / total
    }

    pub(crate) fn recount_alive(&mut self) {
        #[allow(clippy::cast_possible_truncation)]
        let count = self.rs.iter().filter(|rs| rs.alive).count() as u32;
        self.rs_alive_count = count;
    }
}

///////////////////////////////////////////////////////////////////////////////
// Checkers
///////////////////////////////////////////////////////////////////////////////

/// Probe flavour; the probes themselves live outside this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckerKind {
    Tcp,
    Udp,
    Http,
    Misc,
}

/// Health-checker state as the daemon sees it. `ident` is the opaque
/// comparison payload: two checkers of the same kind with equal payloads are
/// the same probe across a reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checker {
    pub vs: usize,
    pub rs: usize,
    pub kind: CheckerKind,
    pub ident: String,
    /// Assume the server dead until the first successful probe.
    pub alpha: bool,
    pub retry: u32,
    // Runtime.
    pub is_up: bool,
    pub has_run: bool,
    pub retry_it: u32,
}

impl Checker {
    #[must_use]
    pub fn new(vs: usize, rs: usize, kind: CheckerKind, ident: &str) -> Self {
        Self {
            vs,
            rs,
            kind,
            ident: ident.to_string(),
            alpha: false,
            retry: 0,
            is_up: true,
            has_run: false,
            retry_it: 0,
        }
    }

    #[must_use]
    pub fn same_probe(&self, other: &Checker) -> bool {
        self.kind == other.kind && self.ident == other.ident
    }
}

///////////////////////////////////////////////////////////////////////////////
// CheckData
///////////////////////////////////////////////////////////////////////////////

/// One configuration generation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CheckData {
    pub vs: Vec<VirtualServer>,
    pub groups: Vec<VsGroup>,
    pub laddr_groups: Vec<AddrGroup>,
    pub blklst_groups: Vec<AddrGroup>,
    pub tunnel_groups: Vec<TunnelGroup>,
}

impl CheckData {
    #[must_use]
    pub fn group(&self, name: &str) -> Option<&VsGroup> {
        self.groups.iter().find(|g| g.name == name)
    }

    #[must_use]
    pub fn group_mut(&mut self, name: &str) -> Option<&mut VsGroup> {
        self.groups.iter_mut().find(|g| g.name == name)
    }

    #[must_use]
    pub fn laddr_group(&self, name: &str) -> Option<&AddrGroup> {
        self.laddr_groups.iter().find(|g| g.name == name)
    }

    #[must_use]
    pub fn blklst_group(&self, name: &str) -> Option<&AddrGroup> {
        self.blklst_groups.iter().find(|g| g.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn range_contains_and_overlaps_use_canonical_order() {
        let range = AddrRange {
            first: v4("10.1.0.250"),
            last: v4("10.1.1.5"),
        };
        assert!(range.contains(v4("10.1.0.255")));
        assert!(range.contains(v4("10.1.1.0")));
        assert!(!range.contains(v4("10.1.1.6")));

        let other = AddrRange {
            first: v4("10.1.1.4"),
            last: v4("10.1.1.20"),
        };
        assert!(range.overlaps(&other));
        let disjoint = AddrRange {
            first: v4("10.1.1.6"),
            last: v4("10.1.1.20"),
        };
        assert!(!range.overlaps(&disjoint));
    }

    #[test]
    fn range_iteration_crosses_octet_boundaries() {
        let range = AddrRange {
            first: v4("10.0.0.254"),
            last: v4("10.0.1.1"),
        };
        let addrs: Vec<IpAddr> = range.addrs().collect();
        assert_eq!(
            addrs,
            vec![
                v4("10.0.0.254"),
                v4("10.0.0.255"),
                v4("10.0.1.0"),
                v4("10.0.1.1"),
            ]
        );
    }

    #[test]
    fn families_never_mix() {
        let range = AddrRange {
            first: v4("10.0.0.1"),
            last: v4("10.0.0.10"),
        };
        assert!(!range.contains("::1".parse().unwrap()));
    }

    #[test]
    fn alive_ratio_is_zero_for_empty_pool() {
        let vs = VirtualServer::new(
            VsIdent::Fwmark { v6: false, mark: 1 },
            Proto::Tcp,
            1,
            0,
        );
        assert_eq!(vs.alive_ratio(), 0);
    }

    #[test]
    fn effective_weight_drops_with_failed_checkers() {
        let mut rs = RealServer::new("10.1.0.1:80".parse().unwrap(), 5);
        assert_eq!(rs.effective_weight(), 5);
        rs.num_failed_checkers = 1;
        assert_eq!(rs.effective_weight(), 0);
    }
}

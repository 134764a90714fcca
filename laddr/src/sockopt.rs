// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Control-plane operations on a service's local addresses.
//!
//! Requests arrive framed by an outer transport and carry a service
//! selector: address + port, a firewall mark, or a traffic match expression.
//! Every error kind is surfaced to the caller verbatim.

use crate::bind::{Proto, ServiceIdent, VirtualService};
use crate::iface::IfaceTable;
use crate::sapool::SaPool;
use crate::steering::SteeringCtx;
use errcode::CtrlError;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

///////////////////////////////////////////////////////////////////////////////
// Match expressions
///////////////////////////////////////////////////////////////////////////////

/// An address/port range, `"10.0.0.1-10.0.0.10:80-100"`.
///
/// The port part is optional, as is the upper bound of either range. IPv6
/// ranges take no port part (the colon is ambiguous there).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InetRange {
    pub first: IpAddr,
    pub last: IpAddr,
    pub port_first: u16,
    pub port_last: u16,
}

impl FromStr for InetRange {
    type Err = CtrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addrs, ports) = match s.rsplit_once(':') {
            // A lone colon split only applies to v4; more colons mean v6.
            Some((left, right)) if !left.contains(':') => (left, Some(right)),
            _ => (s, None),
        };

        let (first, last) = match addrs.split_once('-') {
            Some((a, b)) => (
                a.parse().map_err(|_| CtrlError::Invalid)?,
                b.parse().map_err(|_| CtrlError::Invalid)?,
            ),
            None => {
                let addr: IpAddr = addrs.parse().map_err(|_| CtrlError::Invalid)?;
                (addr, addr)
            }
        };

        let (port_first, port_last) = match ports {
            None => (0, 0),
            Some(p) => match p.split_once('-') {
                Some((a, b)) => (
                    a.parse().map_err(|_| CtrlError::Invalid)?,
                    b.parse().map_err(|_| CtrlError::Invalid)?,
                ),
                None => {
                    let port: u16 = p.parse().map_err(|_| CtrlError::Invalid)?;
                    (port, port)
                }
            },
        };

        if first > last || port_first > port_last {
            return Err(CtrlError::Invalid);
        }
        Ok(Self {
            first,
            last,
            port_first,
            port_last,
        })
    }
}

/// Parsed traffic match selecting a service by what it forwards rather than
/// by its own address.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MatchSelector {
    pub srange: Option<InetRange>,
    pub drange: Option<InetRange>,
    pub iifname: Option<String>,
    pub oifname: Option<String>,
}

impl MatchSelector {
    /// Parses the four selector fields; empty strings mean "unset". Returns
    /// `None` when every field is unset.
    ///
    /// # Errors
    ///
    /// `Invalid` on any unparseable range.
    pub fn parse(
        srange: &str,
        drange: &str,
        iifname: &str,
        oifname: &str,
    ) -> Result<Option<Self>, CtrlError> {
        let parse_range = |s: &str| -> Result<Option<InetRange>, CtrlError> {
            if s.is_empty() {
                Ok(None)
            } else {
                s.parse().map(Some)
            }
        };
        let sel = Self {
            srange: parse_range(srange)?,
            drange: parse_range(drange)?,
            iifname: (!iifname.is_empty()).then(|| iifname.to_string()),
            oifname: (!oifname.is_empty()).then(|| oifname.to_string()),
        };
        if sel == Self::default() {
            Ok(None)
        } else {
            Ok(Some(sel))
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
// Service table
///////////////////////////////////////////////////////////////////////////////

/// Registry of configured virtual services, owned by the control plane.
#[derive(Debug, Default)]
pub struct ServiceTable {
    services: Vec<Arc<VirtualService>>,
}

impl ServiceTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    ///
    /// `Exist` when a service with the same identity and protocol is already
    /// registered.
    pub fn add(&mut self, svc: VirtualService) -> Result<Arc<VirtualService>, CtrlError> {
        if self
            .services
            .iter()
            .any(|s| s.proto() == svc.proto() && s.ident() == svc.ident())
        {
            return Err(CtrlError::Exist);
        }
        let svc = Arc::new(svc);
        self.services.push(Arc::clone(&svc));
        Ok(svc)
    }

    /// Selector resolution: a non-zero firewall mark wins, then a match
    /// expression, then the `<vaddr, vport>` pair.
    #[must_use]
    pub fn lookup(
        &self,
        proto: Proto,
        vaddr: IpAddr,
        vport: u16,
        fwmark: u32,
        sel: Option<&MatchSelector>,
    ) -> Option<&Arc<VirtualService>> {
        self.services.iter().find(|s| {
            if fwmark != 0 {
                return *s.ident() == ServiceIdent::Fwmark(fwmark);
            }
            if let Some(sel) = sel {
                return *s.ident() == ServiceIdent::Match(sel.clone());
            }
            s.proto() == proto && *s.ident() == ServiceIdent::Addr { vaddr, vport }
        })
    }
}

///////////////////////////////////////////////////////////////////////////////
// Socket options
///////////////////////////////////////////////////////////////////////////////

/// Mutating laddr operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaddrOp {
    Add,
    Del,
    Flush,
}

/// Wire request for every laddr option; unused fields stay at their
/// defaults depending on the op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaddrRequest {
    pub proto: Proto,
    pub vaddr: IpAddr,
    pub vport: u16,
    pub fwmark: u32,
    pub srange: String,
    pub drange: String,
    pub iifname: String,
    pub oifname: String,
    pub laddr: Option<IpAddr>,
    pub ifname: String,
}

impl LaddrRequest {
    #[must_use]
    pub fn for_service(proto: Proto, vaddr: IpAddr, vport: u16) -> Self {
        Self {
            proto,
            vaddr,
            vport,
            fwmark: 0,
            srange: String::new(),
            drange: String::new(),
            iifname: String::new(),
            oifname: String::new(),
            laddr: None,
            ifname: String::new(),
        }
    }
}

/// One row of a `GETALL` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaddrEntryConf {
    pub addr: IpAddr,
    /// Reserved; the data plane does not count port conflicts yet.
    pub nport_conflict: u32,
    pub nconns: u32,
}

/// `GETALL` reply: the request echoed back, then the entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaddrReply {
    pub request: LaddrRequest,
    pub laddrs: Vec<LaddrEntryConf>,
}

fn lookup_service<'a>(
    table: &'a ServiceTable,
    req: &LaddrRequest,
) -> Result<&'a Arc<VirtualService>, CtrlError> {
    let sel = MatchSelector::parse(&req.srange, &req.drange, &req.iifname, &req.oifname)?;
    table
        .lookup(req.proto, req.vaddr, req.vport, req.fwmark, sel.as_ref())
        .ok_or(CtrlError::NoService)
}

/// Handles `LADDR_ADD`, `LADDR_DEL` and `LADDR_FLUSH`.
///
/// # Errors
///
/// The full taxonomy: `Invalid`, `NoService`, `Exist`, `NotExist`, `Busy`.
pub fn laddr_sockopt_set(
    op: LaddrOp,
    req: &LaddrRequest,
    table: &ServiceTable,
    ifaces: &IfaceTable,
    ctx: &SteeringCtx,
    sapool: &dyn SaPool,
) -> Result<(), CtrlError> {
    let svc = lookup_service(table, req)?;
    match op {
        LaddrOp::Add => {
            let addr = req.laddr.ok_or(CtrlError::Invalid)?;
            svc.laddr_add(ifaces, ctx, sapool, addr, &req.ifname)
        }
        LaddrOp::Del => {
            let addr = req.laddr.ok_or(CtrlError::Invalid)?;
            svc.laddr_del(addr)
        }
        LaddrOp::Flush => svc.laddr_flush(),
    }
}

/// Handles `LADDR_GETALL`.
///
/// # Errors
///
/// `Invalid` on a bad selector, `NoService` on a lookup miss.
pub fn laddr_sockopt_get(
    req: &LaddrRequest,
    table: &ServiceTable,
) -> Result<LaddrReply, CtrlError> {
    let svc = lookup_service(table, req)?;
    let laddrs = svc
        .laddr_enumerate()
        .into_iter()
        .map(|snap| LaddrEntryConf {
            addr: snap.addr,
            nport_conflict: 0,
            nconns: snap.conn_counts,
        })
        .collect();
    Ok(LaddrReply {
        request: req.clone(),
        laddrs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bind::SchedName;
    use crate::sapool::MemSaPool;
    use crate::steering::{PoolMode, WorkerMask};
    use pretty_assertions::assert_eq;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn ctx() -> SteeringCtx {
        SteeringCtx::new(PoolMode::Lport { fdir_bits: 1 }, WorkerMask::from_bits(0b11))
    }

    fn table_with_service() -> ServiceTable {
        let mut table = ServiceTable::new();
        table
            .add(VirtualService::new(
                ServiceIdent::Addr {
                    vaddr: ip(100),
                    vport: 80,
                },
                Proto::Tcp,
                SchedName::new("wrr"),
                ctx().mode,
            ))
            .unwrap();
        table
    }

    #[test]
    fn range_parsing() {
        let range: InetRange = "10.0.0.1-10.0.0.10:80-100".parse().unwrap();
        assert_eq!(range.first, ip(1));
        assert_eq!(range.last, ip(10));
        assert_eq!((range.port_first, range.port_last), (80, 100));

        let single: InetRange = "10.0.0.3".parse().unwrap();
        assert_eq!((single.first, single.last), (ip(3), ip(3)));
        assert_eq!((single.port_first, single.port_last), (0, 0));

        let v6: InetRange = "2001:db8::1-2001:db8::9".parse().unwrap();
        assert_eq!(v6.first, "2001:db8::1".parse::<IpAddr>().unwrap());

        assert_eq!(
            "10.0.0.10-10.0.0.1".parse::<InetRange>(),
            Err(CtrlError::Invalid)
        );
        assert_eq!("bogus".parse::<InetRange>(), Err(CtrlError::Invalid));
    }

    #[test]
    fn add_get_del_flush_round_trip() {
        let table = table_with_service();
        let mut ifaces = IfaceTable::new();
        let iface = ifaces.register("eth0");
        let ctx = ctx();
        let sapool = MemSaPool::new();
        sapool.provision_all(&ctx, iface, ip(1), 1024..=65535);

        let mut req = LaddrRequest::for_service(Proto::Tcp, ip(100), 80);
        req.laddr = Some(ip(1));
        req.ifname = "eth0".to_string();

        laddr_sockopt_set(LaddrOp::Add, &req, &table, &ifaces, &ctx, &sapool).unwrap();
        assert_eq!(
            laddr_sockopt_set(LaddrOp::Add, &req, &table, &ifaces, &ctx, &sapool),
            Err(CtrlError::Exist)
        );

        let reply = laddr_sockopt_get(&req, &table).unwrap();
        assert_eq!(reply.request, req);
        assert_eq!(
            reply.laddrs,
            vec![LaddrEntryConf {
                addr: ip(1),
                nport_conflict: 0,
                nconns: 0
            }]
        );

        laddr_sockopt_set(LaddrOp::Del, &req, &table, &ifaces, &ctx, &sapool).unwrap();
        assert_eq!(
            laddr_sockopt_set(LaddrOp::Del, &req, &table, &ifaces, &ctx, &sapool),
            Err(CtrlError::NotExist)
        );
        laddr_sockopt_set(LaddrOp::Flush, &req, &table, &ifaces, &ctx, &sapool).unwrap();
    }

    #[test]
    fn unknown_service_and_bad_match_are_reported() {
        let table = table_with_service();
        let ifaces = IfaceTable::new();
        let sapool = MemSaPool::new();

        let mut req = LaddrRequest::for_service(Proto::Tcp, ip(99), 80);
        req.laddr = Some(ip(1));
        assert_eq!(
            laddr_sockopt_set(LaddrOp::Add, &req, &table, &ifaces, &ctx(), &sapool),
            Err(CtrlError::NoService)
        );

        req.srange = "not-an-address".to_string();
        assert_eq!(
            laddr_sockopt_get(&req, &table),
            Err(CtrlError::Invalid)
        );
    }

    #[test]
    fn unknown_interface_is_not_exist() {
        let table = table_with_service();
        let ifaces = IfaceTable::new();
        let sapool = MemSaPool::new();

        let mut req = LaddrRequest::for_service(Proto::Tcp, ip(100), 80);
        req.laddr = Some(ip(1));
        req.ifname = "bond7".to_string();
        assert_eq!(
            laddr_sockopt_set(LaddrOp::Add, &req, &table, &ifaces, &ctx(), &sapool),
            Err(CtrlError::NotExist)
        );
    }

    #[test]
    fn fwmark_selector_wins_over_address() {
        let mut table = ServiceTable::new();
        table
            .add(VirtualService::new(
                ServiceIdent::Fwmark(7),
                Proto::Udp,
                SchedName::new("rr"),
                ctx().mode,
            ))
            .unwrap();

        let mut req = LaddrRequest::for_service(Proto::Udp, ip(1), 0);
        req.fwmark = 7;
        assert!(laddr_sockopt_get(&req, &table).is_ok());
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Alive-ratio watchdog.
//!
//! Operators wire capacity management to the fraction of alive real servers:
//! dropping to the lower limit fires a "lower" action (typically withdrawing
//! the VIP route), climbing back to the upper limit fires "upper". Two
//! guards keep this calm:
//!
//! - the upper action is debounced by one tick, and the ratio is re-checked
//!   when the tick fires, so a flapping server cannot fire it spuriously;
//! - the lower action fires only once every service sharing any of the same
//!   virtual addresses (group ranges expanded) has also reached its lower
//!   limit, so one transient dip cannot withdraw a VIP that healthy
//!   siblings still serve.
//!
//! An empty real-server pool has ratio zero and never drives the watchdog.

use crate::daemon::CheckDaemon;
use crate::notify::AratioSide;
use crate::plane::IpvsPlane;
use std::net::IpAddr;
use tracing::{info, warn};

use crate::model::VsFlags;

impl<P: IpvsPlane> CheckDaemon<P> {
    /// Feeds one real-server transition into the watchdog. Keeps
    /// `rs_alive_count`, arms/cancels the upper-limit debounce, and fires the
    /// lower action when the whole address-sharing set agrees.
    pub(crate) fn vs_rs_aratio_state(&mut self, alive: bool, vi: usize) {
        if self.data.vs[vi].rs.is_empty() {
            return;
        }

        if alive {
            let vs = &mut self.data.vs[vi];
            vs.rs_alive_count += 1;
            let ratio = vs.alive_ratio();
            if ratio >= vs.aratio_upper_limit && vs.flags.contains(VsFlags::ARATIO_REACHED_LOWER)
            {
                info!(
                    "VS [{}] rs_alive_ratio ({ratio}%) >= rs_aratio_upper_limit ({}%)",
                    vs.ident, vs.aratio_upper_limit
                );
                if vs.upper_timer_armed {
                    info!("Timer already added, ignore..");
                } else {
                    vs.upper_timer_armed = true;
                }
            }
            return;
        }

        let (ratio, reached_lower, cancel_timer) = {
            let vs = &mut self.data.vs[vi];
            vs.rs_alive_count = vs.rs_alive_count.saturating_sub(1);
            let ratio = vs.alive_ratio();
            let reached_lower = ratio <= vs.aratio_lower_limit;
            let cancel_timer = ratio < vs.aratio_upper_limit && vs.upper_timer_armed;
            (ratio, reached_lower, cancel_timer)
        };

        if reached_lower {
            info!(
                "VS [{}] rs_alive_ratio ({ratio}%) <= rs_aratio_lower_limit ({}%)",
                self.data.vs[vi].ident, self.data.vs[vi].aratio_lower_limit
            );
            self.data.vs[vi].flags |= VsFlags::ARATIO_REACHED_LOWER;
            if self.all_reach_lower(vi) && self.data.vs[vi].aratio_action.is_some() {
                self.aratio_action(vi, AratioSide::Lower);
            }
        }

        if cancel_timer {
            info!(
                "VS [{}] rs_alive_ratio ({ratio}%) < rs_aratio_upper_limit ({}%)",
                self.data.vs[vi].ident, self.data.vs[vi].aratio_upper_limit
            );
            self.data.vs[vi].upper_timer_armed = false;
        }
    }

    /// One cooperative tick: fires every armed upper-limit debounce timer.
    /// The ratio is re-evaluated at fire time; a dip since arming voids the
    /// action.
    pub fn tick(&mut self) {
        for vi in 0..self.data.vs.len() {
            if !self.data.vs[vi].upper_timer_armed {
                continue;
            }
            self.data.vs[vi].upper_timer_armed = false;

            let ratio = self.data.vs[vi].alive_ratio();
            let upper = self.data.vs[vi].aratio_upper_limit;
            if ratio >= upper {
                info!(
                    "VS [{}] rs_alive_ratio ({ratio}%) >= rs_aratio_upper_limit ({upper}%) execute action",
                    self.data.vs[vi].ident
                );
                self.data.vs[vi].flags.remove(VsFlags::ARATIO_REACHED_LOWER);
                self.aratio_action(vi, AratioSide::Upper);
            } else {
                warn!(
                    "VS [{}] rs_alive_ratio ({ratio}%) < rs_aratio_upper_limit ({upper}%) does not execute action",
                    self.data.vs[vi].ident
                );
            }
        }
    }

    /// Runs the operator action for every virtual address of the service —
    /// the single VIP, or each address of each group range.
    pub(crate) fn aratio_action(&mut self, vi: usize, side: AratioSide) {
        let Some(cmd) = self.data.vs[vi].aratio_action.clone() else {
            return;
        };
        if let Some(gname) = self.data.vs[vi].group_name() {
            let addrs: Vec<IpAddr> = self
                .data
                .group(gname)
                .map(|group| {
                    group
                        .ranges
                        .iter()
                        .flat_map(|entry| entry.range.addrs())
                        .collect()
                })
                .unwrap_or_default();
            for addr in addrs {
                self.fx.notify.hook.run(&cmd, addr, side);
            }
        } else if let Some(vip) = self.data.vs[vi].vip() {
            self.fx.notify.hook.run(&cmd, vip, side);
        }
    }

    /// Whether every service sharing an address with `vi` has also reached
    /// its lower limit.
    fn all_reach_lower(&self, vi: usize) -> bool {
        for (other, vs) in self.data.vs.iter().enumerate() {
            if vs.flags.contains(VsFlags::ARATIO_REACHED_LOWER) {
                continue;
            }
            if self.vss_share_addr(vi, other) {
                info!(
                    "VS [{}] does not reach lower limit, rs_alive_ratio_upper_limit ({}%)",
                    vs.ident, vs.aratio_upper_limit
                );
                return false;
            }
        }
        true
    }

    /// Address equivalence between two services, expanding group ranges as
    /// canonical intervals.
    fn vss_share_addr(&self, a: usize, b: usize) -> bool {
        let (vs_a, vs_b) = (&self.data.vs[a], &self.data.vs[b]);
        match (vs_a.group_name(), vs_b.group_name()) {
            (Some(ga), Some(gb)) => {
                match (self.data.group(ga), self.data.group(gb)) {
                    (Some(ga), Some(gb)) => ga.shares_addr(gb),
                    _ => false,
                }
            }
            (Some(ga), None) => vs_b
                .vip()
                .zip(self.data.group(ga))
                .is_some_and(|(vip, group)| group.has_addr(vip)),
            (None, Some(gb)) => vs_a
                .vip()
                .zip(self.data.group(gb))
                .is_some_and(|(vip, group)| group.has_addr(vip)),
            (None, None) => match (vs_a.vip(), vs_b.vip()) {
                (Some(ia), Some(ib)) => ia == ib,
                _ => false,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::daemon::CheckDaemon;
    use crate::model::{
        AddrRange, CheckData, Proto, RangeEntry, RealServer, VirtualServer, VsFlags, VsGroup,
        VsIdent,
    };
    use crate::notify::recording_notifier;
    use crate::plane::RecordingPlane;
    use std::net::IpAddr;

    fn vip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn vs_with(addr: &str, upper: u32, lower: u32, n_rs: usize) -> VirtualServer {
        let mut vs = VirtualServer::new(
            VsIdent::Addr {
                proto: Proto::Tcp,
                addr: format!("{addr}:80").parse().unwrap(),
            },
            Proto::Tcp,
            1,
            0,
        );
        vs.aratio_upper_limit = upper;
        vs.aratio_lower_limit = lower;
        vs.aratio_action = Some("/usr/bin/vip-ctl".to_string());
        for i in 0..n_rs {
            let mut rs = RealServer::new(
                format!("10.1.0.{}:80", i + 1).parse().unwrap(),
                1,
            );
            rs.alive = true;
            rs.set = true;
            vs.rs.push(rs);
        }
        vs.recount_alive();
        vs
    }

    fn daemon_with(data: CheckData) -> (CheckDaemon<RecordingPlane>, crate::notify::EventLog) {
        let (notifier, log) = recording_notifier();
        let mut daemon = CheckDaemon::new(RecordingPlane::new(), notifier);
        daemon.load(data, Vec::new());
        daemon.set_quorum_states();
        (daemon, log)
    }

    fn kill(daemon: &mut CheckDaemon<RecordingPlane>, vi: usize, ri: usize) {
        daemon.data.vs[vi].rs[ri].alive = false;
        daemon.vs_rs_aratio_state(false, vi);
    }

    fn revive(daemon: &mut CheckDaemon<RecordingPlane>, vi: usize, ri: usize) {
        daemon.data.vs[vi].rs[ri].alive = true;
        daemon.vs_rs_aratio_state(true, vi);
    }

    #[test]
    fn lower_action_fires_for_a_lone_service() {
        let (mut daemon, log) = daemon_with(CheckData {
            vs: vec![vs_with("10.0.0.100", 75, 25, 4)],
            ..CheckData::default()
        });
        kill(&mut daemon, 0, 0);
        kill(&mut daemon, 0, 1);
        kill(&mut daemon, 0, 2); // 25%
        assert!(daemon.data.vs[0].flags.contains(VsFlags::ARATIO_REACHED_LOWER));
        assert!(
            log.lock()
                .unwrap()
                .iter()
                .any(|e| e == "HOOK /usr/bin/vip-ctl 10.0.0.100 lower"),
            "events: {:?}",
            log.lock().unwrap()
        );
    }

    #[test]
    fn upper_action_waits_for_the_debounce_tick() {
        let (mut daemon, log) = daemon_with(CheckData {
            vs: vec![vs_with("10.0.0.100", 75, 25, 4)],
            ..CheckData::default()
        });
        for ri in 0..3 {
            kill(&mut daemon, 0, ri);
        }
        for ri in 0..3 {
            revive(&mut daemon, 0, ri); // back to 100%
        }
        assert!(daemon.data.vs[0].upper_timer_armed);
        assert!(
            !log.lock().unwrap().iter().any(|e| e.contains("upper")),
            "no upper action before the tick"
        );

        daemon.tick();
        assert!(!daemon.data.vs[0].upper_timer_armed);
        assert!(!daemon.data.vs[0].flags.contains(VsFlags::ARATIO_REACHED_LOWER));
        assert!(
            log.lock()
                .unwrap()
                .iter()
                .any(|e| e == "HOOK /usr/bin/vip-ctl 10.0.0.100 upper")
        );
    }

    #[test]
    fn dip_before_the_tick_voids_the_upper_action() {
        let (mut daemon, log) = daemon_with(CheckData {
            vs: vec![vs_with("10.0.0.100", 75, 25, 4)],
            ..CheckData::default()
        });
        for ri in 0..3 {
            kill(&mut daemon, 0, ri);
        }
        for ri in 0..3 {
            revive(&mut daemon, 0, ri);
        }
        assert!(daemon.data.vs[0].upper_timer_armed);
        kill(&mut daemon, 0, 0); // 75% -> not < upper, timer stays
        kill(&mut daemon, 0, 1); // 50% < upper -> timer cancelled
        assert!(!daemon.data.vs[0].upper_timer_armed);

        daemon.tick();
        assert!(
            !log.lock().unwrap().iter().any(|e| e.contains("upper")),
            "events: {:?}",
            log.lock().unwrap()
        );
    }

    #[test]
    fn lower_action_waits_for_every_sibling_on_the_same_vip() {
        // Two services on the same VIP, different ports.
        let vs_a = vs_with("10.0.0.100", 75, 25, 4);
        let mut vs_b = vs_with("10.0.0.100", 75, 25, 4);
        vs_b.ident = VsIdent::Addr {
            proto: Proto::Tcp,
            addr: "10.0.0.100:443".parse().unwrap(),
        };
        let (mut daemon, log) = daemon_with(CheckData {
            vs: vec![vs_a, vs_b],
            ..CheckData::default()
        });

        for ri in 0..3 {
            kill(&mut daemon, 0, ri);
        }
        assert!(daemon.data.vs[0].flags.contains(VsFlags::ARATIO_REACHED_LOWER));
        assert!(
            !log.lock().unwrap().iter().any(|e| e.contains("lower")),
            "sibling still healthy: no action"
        );

        for ri in 0..3 {
            kill(&mut daemon, 1, ri);
        }
        assert!(
            log.lock()
                .unwrap()
                .iter()
                .any(|e| e == "HOOK /usr/bin/vip-ctl 10.0.0.100 lower")
        );
    }

    #[test]
    fn group_ranges_expand_for_the_action() {
        let mut group = VsGroup::new("web");
        group.ranges.push(RangeEntry::new(
            AddrRange {
                first: vip("10.0.0.100"),
                last: vip("10.0.0.102"),
            },
            80,
        ));
        let mut vs = vs_with("10.0.0.100", 75, 25, 2);
        vs.ident = VsIdent::Group {
            name: "web".to_string(),
            seq: 0,
        };
        let (mut daemon, log) = daemon_with(CheckData {
            vs: vec![vs],
            groups: vec![group],
            ..CheckData::default()
        });

        kill(&mut daemon, 0, 0);
        kill(&mut daemon, 0, 1); // 0% <= 25%
        let events = log.lock().unwrap();
        for last in [100u8, 101, 102] {
            assert!(
                events
                    .iter()
                    .any(|e| *e == format!("HOOK /usr/bin/vip-ctl 10.0.0.{last} lower")),
                "missing action for 10.0.0.{last}: {events:?}"
            );
        }
    }

    #[test]
    fn empty_pool_never_drives_the_watchdog() {
        let mut vs = vs_with("10.0.0.100", 75, 25, 0);
        vs.rs.clear();
        vs.recount_alive();
        let (mut daemon, log) = daemon_with(CheckData {
            vs: vec![vs],
            ..CheckData::default()
        });
        daemon.vs_rs_aratio_state(false, 0);
        daemon.vs_rs_aratio_state(true, 0);
        assert!(log.lock().unwrap().iter().all(|e| !e.starts_with("HOOK")));
        assert_eq!(daemon.data.vs[0].rs_alive_count, 0);
    }
}

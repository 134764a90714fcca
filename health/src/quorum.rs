// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Quorum arbitration.
//!
//! A virtual server is "up" while the summed weight of its alive real
//! servers holds a quorum. The threshold is hysteretic: an up server must
//! fall below `quorum - hysteresis` to go down, and a down server must climb
//! to `quorum + hysteresis` to come back, so a server oscillating around the
//! quorum never flaps the service. Losing quorum swaps the pool for the
//! sorry server (when one is configured); regaining it swaps back.

use crate::daemon::CheckDaemon;
use crate::model::VirtualServer;
use crate::plane::IpvsPlane;
use tracing::info;

/// Summed weight of the alive real servers.
#[must_use]
pub(crate) fn weigh_live(vs: &VirtualServer) -> i64 {
    vs.rs
        .iter()
        .filter(|rs| rs.alive)
        .map(|rs| i64::from(rs.weight))
        .sum()
}

impl<P: IpvsPlane> CheckDaemon<P> {
    /// Initial quorum verdict for every service, taken from configured
    /// weights before any plane command is issued.
    pub fn set_quorum_states(&mut self) {
        for vs in &mut self.data.vs {
            let weight_sum = weigh_live(vs);
            vs.quorum_state_up =
                weight_sum >= i64::from(vs.quorum) + i64::from(vs.hysteresis);
        }
    }

    /// Plane-adds or plane-removes every alive real server, without touching
    /// the alive flags — the sorry-server takeover is transient and the pool
    /// must come back exactly as it was.
    pub(crate) fn perform_quorum_state(&mut self, vi: usize, add: bool) {
        let vs_id = self.data.vs[vi].ident.to_string();
        info!(
            "{} the pool for VS {vs_id}",
            if add {
                "Adding alive servers to"
            } else {
                "Removing alive servers from"
            }
        );
        let fx = &mut self.fx;
        for rs in self.data.vs[vi].rs.iter_mut().filter(|rs| rs.alive) {
            let _ = if add {
                fx.add_rs(&vs_id, rs)
            } else {
                fx.del_rs(&vs_id, rs, false)
            };
        }
    }

    /// Re-arbitrates one service after anything that may have moved its
    /// alive weight. `init` forces the down path when a configured sorry
    /// server is not yet installed, so a freshly loaded service is born
    /// covered.
    pub fn update_quorum_state(&mut self, vi: usize, init: bool) {
        let weight_sum = weigh_live(&self.data.vs[vi]);
        let vs = &self.data.vs[vi];
        let vs_id = vs.ident.to_string();
        let up = vs.quorum_state_up;
        let (quorum, hysteresis) = (vs.quorum, vs.hysteresis);
        let hyst = i64::from(hysteresis);
        let threshold = i64::from(quorum) + if up { -hyst } else { hyst };
        let sorry_present = vs.s_svr.is_some();
        let sorry_alive = vs.s_svr.as_ref().is_some_and(|s| s.alive);

        if !up && weight_sum >= threshold {
            self.data.vs[vi].quorum_state_up = true;
            info!(
                "{} {quorum}+{hysteresis}={threshold} <= {weight_sum} for VS {vs_id}",
                if init { "Starting with quorum up" } else { "Gained quorum" }
            );
            if sorry_present && sorry_alive {
                // Put the alive real servers back first, then retire the
                // stand-in.
                self.perform_quorum_state(vi, true);
                let inhibit = self.data.vs[vi].s_svr.as_ref().is_some_and(|s| s.inhibit);
                let sorry_addr = self.data.vs[vi].s_svr.as_ref().map(|s| s.addr);
                info!(
                    "{} sorry server {} from VS {vs_id}",
                    if inhibit { "Disabling" } else { "Removing" },
                    sorry_addr.map_or_else(String::new, |a| a.to_string()),
                );
                let _ = self.fx.del_rs(
                    &vs_id,
                    self.data.vs[vi].s_svr.as_mut().expect("sorry checked above"),
                    false,
                );
                if let Some(sorry) = self.data.vs[vi].s_svr.as_mut() {
                    sorry.alive = false;
                }
            }
            self.fx
                .do_vs_notifies(&self.data.vs[vi], init, threshold, weight_sum, false);
        } else if (up && (weight_sum == 0 || weight_sum < threshold))
            || (init && !up && sorry_present && !sorry_alive)
        {
            // Quorum lost, or starting up with the sorry server still
            // missing from the plane.
            self.data.vs[vi].quorum_state_up = false;
            info!(
                "{} {quorum}-{hysteresis}={threshold} > {weight_sum} for VS {vs_id}",
                if init { "Starting with quorum down" } else { "Lost quorum" }
            );
            if sorry_present && !sorry_alive {
                let inhibit = self.data.vs[vi].s_svr.as_ref().is_some_and(|s| s.inhibit);
                let sorry_addr = self.data.vs[vi].s_svr.as_ref().map(|s| s.addr);
                info!(
                    "{} sorry server {} to VS {vs_id}",
                    if inhibit { "Enabling" } else { "Adding" },
                    sorry_addr.map_or_else(String::new, |a| a.to_string()),
                );
                let _ = self.fx.add_rs(
                    &vs_id,
                    self.data.vs[vi].s_svr.as_mut().expect("sorry checked above"),
                );
                if let Some(sorry) = self.data.vs[vi].s_svr.as_mut() {
                    sorry.alive = true;
                }
                self.perform_quorum_state(vi, false);
            }
            self.fx
                .do_vs_notifies(&self.data.vs[vi], init, threshold, weight_sum, false);
        }
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! From checker verdicts to real-server transitions.
//!
//! A real server usually carries several checkers; it is alive only while
//! none of them holds it failed. The integrator turns per-checker up/down
//! edges into at most one server transition, keeps the failed-checker count,
//! and hands the fallout to the quorum arbiter and the alive-ratio watchdog.

use crate::daemon::CheckDaemon;
use crate::plane::IpvsPlane;
use tracing::info;

impl<P: IpvsPlane> CheckDaemon<P> {
    /// Records a checker verdict and adjusts the server's failed-checker
    /// count. No server transition happens here.
    pub fn set_checker_state(&mut self, ci: usize, up: bool) {
        if self.checkers[ci].is_up == up {
            return;
        }
        self.checkers[ci].is_up = up;

        let (vi, ri) = (self.checkers[ci].vs, self.checkers[ci].rs);
        let rs = &mut self.data.vs[vi].rs[ri];
        if up {
            rs.num_failed_checkers = rs.num_failed_checkers.saturating_sub(1);
        } else {
            rs.num_failed_checkers += 1;
        }
    }

    /// Entry point for a finished probe.
    ///
    /// A repeated verdict is a no-op, except that the very first run of a
    /// checker announces the server state once (always for alpha checkers,
    /// and for anything that starts failed).
    pub fn update_svr_checker_state(&mut self, alive: bool, ci: usize) {
        if self.checkers[ci].is_up == alive {
            if !self.checkers[ci].has_run {
                if self.checkers[ci].alpha || !alive {
                    let (vi, ri) = (self.checkers[ci].vs, self.checkers[ci].rs);
                    self.fx.do_rs_notifies(&self.data.vs[vi], ri, false);
                }
                self.checkers[ci].has_run = true;
            }
            return;
        }

        self.checkers[ci].has_run = true;

        let (vi, ri) = (self.checkers[ci].vs, self.checkers[ci].rs);
        if alive {
            // The server transitions only when this was the last failure.
            if self.data.vs[vi].rs[ri].num_failed_checkers <= 1
                && !self.perform_svr_state(true, vi, ri)
            {
                return;
            }
        } else if self.data.vs[vi].rs[ri].num_failed_checkers == 0
            && !self.perform_svr_state(false, vi, ri)
        {
            return;
        }

        self.set_checker_state(ci, alive);
    }

    /// The real-server transition: plane add/remove (unless the sorry server
    /// holds the pool), the alive flip, notifications, the alive-ratio
    /// watchdog, and quorum re-arbitration.
    pub(crate) fn perform_svr_state(&mut self, alive: bool, vi: usize, ri: usize) -> bool {
        if self.data.vs[vi].rs[ri].alive == alive {
            return true;
        }

        let vs_id = self.data.vs[vi].ident.to_string();
        let rs_id = self.data.vs[vi].rs[ri].addr.to_string();
        let inhibit = self.data.vs[vi].rs[ri].inhibit;
        info!(
            "{}ing service {rs_id} to VS {vs_id}",
            match (alive, inhibit) {
                (true, true) => "Enabl",
                (true, false) => "Add",
                (false, true) => "Disabl",
                (false, false) => "Remov",
            }
        );

        // Leave the plane alone while the sorry server has taken the pool
        // over; the flags still track reality for when it retires.
        let vs = &self.data.vs[vi];
        let sorry_holds = !vs.quorum_state_up
            && vs.s_svr.as_ref().is_some_and(|s| s.alive);
        if !sorry_holds {
            let result = if alive {
                // The recovering checker has not been recounted yet; the
                // transition itself means the server is healthy, so install
                // the full weight.
                let weight = self.data.vs[vi].rs[ri].weight;
                self.fx
                    .add_rs_with_weight(&vs_id, &mut self.data.vs[vi].rs[ri], weight)
            } else {
                self.fx.del_rs(&vs_id, &mut self.data.vs[vi].rs[ri], false)
            };
            if result.is_err() {
                return false;
            }
        }

        self.data.vs[vi].rs[ri].alive = alive;
        self.fx.do_rs_notifies(&self.data.vs[vi], ri, false);
        self.vs_rs_aratio_state(alive, vi);
        self.update_quorum_state(vi, false);
        true
    }

    /// Administrative weight change. Takes effect in the plane immediately
    /// only for an installed, alive server whose pool is not held by the
    /// sorry server; otherwise it applies when the server next comes up.
    pub fn update_svr_wgt(&mut self, weight: i32, vi: usize, ri: usize, update_quorum: bool) {
        if weight == self.data.vs[vi].rs[ri].weight {
            return;
        }
        let vs_id = self.data.vs[vi].ident.to_string();
        let rs_id = self.data.vs[vi].rs[ri].addr.to_string();
        info!(
            "Changing weight from {} to {weight} for {}active service {rs_id} of VS {vs_id}",
            self.data.vs[vi].rs[ri].weight,
            if self.data.vs[vi].rs[ri].alive { "" } else { "in" },
        );
        self.data.vs[vi].rs[ri].weight = weight;

        let vs = &self.data.vs[vi];
        let rs = &vs.rs[ri];
        let sorry_holds = !vs.quorum_state_up && vs.s_svr.as_ref().is_some_and(|s| s.alive);
        if rs.set && rs.alive && !sorry_holds {
            let _ = self.fx.edit_rs(&vs_id, &self.data.vs[vi].rs[ri]);
        }
        if update_quorum {
            self.update_quorum_state(vi, false);
        }
    }
}

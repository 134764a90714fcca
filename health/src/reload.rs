// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Configuration lifecycle: initial install, reload diffing, teardown.
//!
//! A reload never rebuilds the plane from scratch. The outgoing and incoming
//! generations are diffed object by object; only the negative diff is
//! removed and only the positive diff added, and runtime state (alive flags,
//! quorum verdicts, checker history) is migrated onto the surviving objects.
//! A reload against an identical configuration must therefore issue no plane
//! command at all.

use crate::daemon::{CheckDaemon, Effects};
use crate::model::{CheckData, Checker, TunnelGroup, VirtualServer, VsGroup};
use crate::plane::{IpvsPlane, PlaneCmd, addr_entry_id, range_entry_id, tunnel_entry_id};
use crate::quorum::weigh_live;
use tracing::info;

///////////////////////////////////////////////////////////////////////////////
// Teardown
///////////////////////////////////////////////////////////////////////////////

impl<P: IpvsPlane> Effects<P> {
    /// Removes the given real servers from the plane. Inhibited servers are
    /// force-removed (the weight-zero stand-in makes no sense for a server
    /// that is leaving the configuration). Ends with the late quorum check:
    /// the pool may have just lost its quorum, and no sorry server is pushed
    /// in — the regression is intended.
    pub(crate) fn clear_service_rs(
        &mut self,
        vs: &mut VirtualServer,
        targets: &[usize],
        stopping: bool,
    ) {
        let vs_id = vs.ident.to_string();
        let threshold = i64::from(vs.quorum) - i64::from(vs.hysteresis);

        for &ri in targets {
            let rs_id = vs.rs[ri].addr.to_string();
            if vs.rs[ri].set || stopping {
                info!(
                    "{} {}service {rs_id} from VS {vs_id}",
                    if stopping { "Shutting down" } else { "Removing" },
                    if vs.rs[ri].inhibit && !vs.rs[ri].alive {
                        "(inhibited) "
                    } else {
                        ""
                    },
                );
            }
            if !vs.rs[ri].set {
                continue;
            }

            let sav_inhibit = vs.rs[ri].inhibit;
            vs.rs[ri].inhibit = false;
            let _ = self.del_rs(&vs_id, &mut vs.rs[ri], true);
            vs.rs[ri].inhibit = sav_inhibit;

            if !vs.rs[ri].alive {
                continue;
            }
            vs.rs[ri].alive = false;

            // SNMP always hears about the shutdown; everything else only in
            // omega mode.
            if !vs.omega && stopping {
                self.notify.snmp.rs_trap(&rs_id, &vs_id, false, true);
                continue;
            }
            self.do_rs_notifies(vs, ri, stopping);
            if vs.rs[ri].smtp_alert {
                self.notify.smtp.alert(
                    &format!("RS {rs_id}"),
                    "DOWN",
                    if stopping {
                        "=> Shutting down <="
                    } else {
                        "=> Removing <="
                    },
                );
            }
        }
        vs.recount_alive();

        let weight_sum = weigh_live(vs);
        if stopping
            || (vs.quorum_state_up && (weight_sum == 0 || weight_sum < threshold))
        {
            vs.quorum_state_up = false;
            self.do_vs_notifies(vs, false, threshold, weight_sum, stopping);
        }
    }

    /// Removes a whole virtual server: sorry server first, then the real
    /// servers, then the service itself.
    pub(crate) fn clear_service_vs(&mut self, vs: &mut VirtualServer, stopping: bool) {
        let vs_id = vs.ident.to_string();

        if vs.s_svr.as_ref().is_some_and(|s| s.set) {
            let sorry = vs.s_svr.as_mut().expect("checked above");
            let sav_inhibit = sorry.inhibit;
            sorry.inhibit = false;
            let _ = self.del_rs(&vs_id, sorry, true);
            sorry.inhibit = sav_inhibit;
            sorry.alive = false;
        }

        let all: Vec<usize> = (0..vs.rs.len()).collect();
        self.clear_service_rs(vs, &all, stopping);

        let _ = self.plane.apply(PlaneCmd::DelVs { vs: vs_id });
        vs.alive = false;
    }
}

///////////////////////////////////////////////////////////////////////////////
// Initial install
///////////////////////////////////////////////////////////////////////////////

impl<P: IpvsPlane> CheckDaemon<P> {
    pub(crate) fn init_tunnels(&mut self) {
        for group in &self.data.tunnel_groups {
            for entry in &group.entries {
                let _ = self.fx.plane.apply(PlaneCmd::AddTunnel {
                    ifname: tunnel_entry_id(entry),
                });
            }
        }
    }

    /// Brings every service into the plane; see `init_service_vs`.
    pub fn init_services(&mut self) {
        for vi in 0..self.data.vs.len() {
            self.init_service_vs(vi);
        }
    }

    fn init_service_vs(&mut self, vi: usize) {
        let vs_id = self.data.vs[vi].ident.to_string();
        let is_group = self.data.vs[vi].group_name().is_some();

        if !self.data.vs[vi].alive || is_group {
            if is_group {
                // Only entries that did not survive a reload are new to the
                // plane.
                let gname = self.data.vs[vi].group_name().expect("is_group").to_string();
                let entries: Vec<String> = self.data.group(&gname).map_or_else(Vec::new, |g| {
                    g.ranges
                        .iter()
                        .filter(|e| !e.reloaded)
                        .map(range_entry_id)
                        .chain(
                            g.fwmarks
                                .iter()
                                .filter(|e| !e.reloaded)
                                .map(|e| format!("fwm#{}", e.fwmark)),
                        )
                        .collect()
                });
                for entry in entries {
                    let _ = self.fx.plane.apply(PlaneCmd::AddGroupEntry {
                        vs: vs_id.clone(),
                        entry,
                    });
                }
            } else {
                let _ = self.fx.plane.apply(PlaneCmd::AddVs { vs: vs_id.clone() });
            }
            self.data.vs[vi].alive = true;
        }

        // Full-NAT services carry their local-address and blacklist groups.
        // On reload the group diff has already adjusted the plane.
        if !self.data.vs[vi].reloaded {
            self.install_addr_groups(vi);
        }

        self.init_service_rs(vi);

        if self.data.vs[vi].reloaded && is_group {
            self.sync_service_vsg(vi);
        }

        // An initial verdict may need the sorry server installed from birth.
        self.update_quorum_state(vi, true);

        // A sorry server with inhibit set is pre-installed at weight zero so
        // failure handling only ever edits weights.
        let needs_preinstall = self.data.vs[vi]
            .s_svr
            .as_ref()
            .is_some_and(|s| s.inhibit && !s.set);
        if needs_preinstall {
            let _ = self.fx.add_rs_with_weight(
                &vs_id,
                self.data.vs[vi].s_svr.as_mut().expect("checked above"),
                0,
            );
        }
    }

    fn install_addr_groups(&mut self, vi: usize) {
        use crate::model::FwdMethod;
        if self.data.vs[vi].fwd_method != FwdMethod::Fnat {
            return;
        }
        let vs_id = self.data.vs[vi].ident.to_string();
        if let Some(gname) = self.data.vs[vi].laddr_gname.clone() {
            let entries: Vec<String> = self.data.laddr_group(&gname).map_or_else(Vec::new, |g| {
                g.entries.iter().map(addr_entry_id).collect()
            });
            for entry in entries {
                let _ = self.fx.plane.apply(PlaneCmd::AddLaddrEntry {
                    vs: vs_id.clone(),
                    entry,
                });
            }
        }
        if let Some(gname) = self.data.vs[vi].blklst_gname.clone() {
            let entries: Vec<String> = self.data.blklst_group(&gname).map_or_else(Vec::new, |g| {
                g.entries.iter().map(addr_entry_id).collect()
            });
            for entry in entries {
                let _ = self.fx.plane.apply(PlaneCmd::AddBlklstEntry {
                    vs: vs_id.clone(),
                    entry,
                });
            }
        }
    }

    fn init_service_rs(&mut self, vi: usize) {
        let vs_id = self.data.vs[vi].ident.to_string();
        for ri in 0..self.data.vs[vi].rs.len() {
            if self.data.vs[vi].rs[ri].reloaded {
                // Survivors keep their state; only an operator-changed
                // weight needs syncing. Failed servers are not re-added
                // instantly on reload.
                let (iweight, pweight) = {
                    let rs = &self.data.vs[vi].rs[ri];
                    (rs.iweight, rs.pweight)
                };
                if iweight != pweight {
                    self.update_svr_wgt(iweight, vi, ri, false);
                }
                continue;
            }

            // Alpha mode is pessimistic: a server that has not passed a
            // probe yet stays out of the pool, unless inhibit keeps it
            // installed at weight zero.
            let (failed, alive, inhibit, set) = {
                let rs = &self.data.vs[vi].rs[ri];
                (rs.num_failed_checkers, rs.alive, rs.inhibit, rs.set)
            };
            if (failed == 0 && !alive) || (inhibit && !set) {
                let _ = self.fx.add_rs(&vs_id, &mut self.data.vs[vi].rs[ri]);
                if failed == 0 {
                    self.data.vs[vi].rs[ri].alive = true;
                    if self.rs_init_notifies {
                        self.fx.do_rs_notifies(&self.data.vs[vi], ri, false);
                    }
                }
            }
        }
        self.data.vs[vi].recount_alive();
    }

    /// Adds the surviving destinations to group entries that are new in this
    /// generation.
    fn sync_service_vsg(&mut self, vi: usize) {
        let vs_id = self.data.vs[vi].ident.to_string();
        let Some(gname) = self.data.vs[vi].group_name().map(String::from) else {
            return;
        };
        let entries: Vec<String> = self.data.group(&gname).map_or_else(Vec::new, |g| {
            g.ranges
                .iter()
                .filter(|e| !e.reloaded)
                .map(range_entry_id)
                .chain(
                    g.fwmarks
                        .iter()
                        .filter(|e| !e.reloaded)
                        .map(|e| format!("fwm#{}", e.fwmark)),
                )
                .collect()
        });
        for entry in entries {
            info!("VS [{entry}] added into group {gname}");
            let _ = self.fx.plane.apply(PlaneCmd::SyncGroupEntry {
                vs: vs_id.clone(),
                entry,
            });
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
// Reload diffing
///////////////////////////////////////////////////////////////////////////////

impl<P: IpvsPlane> CheckDaemon<P> {
    /// Swaps in a new configuration generation, applying the minimal plane
    /// diff and migrating runtime state onto surviving objects.
    pub fn reload(&mut self, new_data: CheckData, new_checkers: Vec<Checker>) {
        let mut old_data = std::mem::replace(&mut self.data, new_data);
        let old_checkers = std::mem::replace(&mut self.checkers, new_checkers);

        self.clear_diff_tunnels(&old_data.tunnel_groups);
        self.clear_diff_services(&mut old_data, &old_checkers);
        self.check_new_rs_state();
        self.init_services();
    }

    /// Tunnels diff by group name, then entries by their full
    /// `(ifname, link, kind, local, remote)` identity.
    fn clear_diff_tunnels(&mut self, old_groups: &[TunnelGroup]) {
        for old_group in old_groups {
            let new_group = self
                .data
                .tunnel_groups
                .iter()
                .find(|g| g.name == old_group.name);
            for entry in &old_group.entries {
                let survives = new_group
                    .is_some_and(|g| g.entries.iter().any(|e| e.same_identity(entry)));
                if !survives {
                    let _ = self.fx.plane.apply(PlaneCmd::DelTunnel {
                        ifname: tunnel_entry_id(entry),
                    });
                }
            }
        }
        // The positive diff: entries and groups new in this generation.
        let add: Vec<String> = self
            .data
            .tunnel_groups
            .iter()
            .flat_map(|new_group| {
                let old_group = old_groups.iter().find(|g| g.name == new_group.name);
                new_group.entries.iter().filter(move |entry| {
                    !old_group
                        .is_some_and(|g| g.entries.iter().any(|e| e.same_identity(entry)))
                })
            })
            .map(tunnel_entry_id)
            .collect();
        for ifname in add {
            let _ = self.fx.plane.apply(PlaneCmd::AddTunnel { ifname });
        }
    }

    fn clear_diff_services(&mut self, old_data: &mut CheckData, old_checkers: &[Checker]) {
        for oi in 0..old_data.vs.len() {
            let ni = self
                .data
                .vs
                .iter()
                .position(|nv| nv.same_identity(&old_data.vs[oi]));
            let Some(ni) = ni else {
                info!("Removing Virtual Server {}", old_data.vs[oi].ident);
                self.fx.clear_service_vs(&mut old_data.vs[oi], false);
                continue;
            };

            {
                let old_vs = &old_data.vs[oi];
                let new_vs = &mut self.data.vs[ni];
                new_vs.alive = old_vs.alive;
                new_vs.quorum_state_up = old_vs.quorum_state_up;
                new_vs.reloaded = true;
            }

            if old_data.vs[oi].group_name().is_some() {
                self.clear_diff_vsg(&old_data.groups, &old_data.vs[oi], ni);
            }

            let edit_vs = {
                let (old_vs, new_vs) = (&old_data.vs[oi], &self.data.vs[ni]);
                old_vs.sched != new_vs.sched
                    || old_vs.conf_flags != new_vs.conf_flags
                    || old_vs.persistence_granularity != new_vs.persistence_granularity
                    || old_vs.persistence_timeout != new_vs.persistence_timeout
            };
            if edit_vs {
                let _ = self.fx.plane.apply(PlaneCmd::EditVs {
                    vs: self.data.vs[ni].ident.to_string(),
                });
            }

            // The notifiers must keep firing for servers leaving a service
            // that itself survives.
            old_data.vs[oi].omega = true;

            self.clear_diff_rs(&mut old_data.vs[oi], oi, ni, old_checkers);
            self.clear_diff_s_srv(&mut old_data.vs[oi], ni);
            self.update_alive_counts(old_data, oi, ni);
            self.clear_diff_addr_groups(old_data, oi, ni);
        }
    }

    /// Group entries absent from the new generation lose their per-entry
    /// forwarding state; survivors are marked reloaded.
    fn clear_diff_vsg(&mut self, old_groups: &[VsGroup], old_vs: &VirtualServer, ni: usize) {
        let Some(gname) = old_vs.group_name() else {
            return;
        };
        let Some(old_group) = old_groups.iter().find(|g| g.name == gname) else {
            return;
        };
        let vs_id = self.data.vs[ni].ident.to_string();
        let new_gname = gname.to_string();

        let mut removals: Vec<String> = Vec::new();
        for entry in &old_group.ranges {
            let survived = self.data.group_mut(&new_gname).and_then(|g| {
                g.ranges
                    .iter_mut()
                    .find(|e| e.same_identity(entry))
                    .map(|e| e.reloaded = true)
            });
            if survived.is_none() {
                info!(
                    "VS [{}] in group {new_gname} no longer exists",
                    range_entry_id(entry)
                );
                removals.push(range_entry_id(entry));
            }
        }
        for entry in &old_group.fwmarks {
            let survived = self.data.group_mut(&new_gname).and_then(|g| {
                g.fwmarks
                    .iter_mut()
                    .find(|e| e.fwmark == entry.fwmark)
                    .map(|e| e.reloaded = true)
            });
            if survived.is_none() {
                info!(
                    "VS [{}] in group {new_gname} no longer exists",
                    entry.fwmark
                );
                removals.push(format!("fwm#{}", entry.fwmark));
            }
        }
        for entry in removals {
            let _ = self.fx.plane.apply(PlaneCmd::DelGroupEntry {
                vs: vs_id.clone(),
                entry,
            });
        }
    }

    fn clear_diff_rs(
        &mut self,
        old_vs: &mut VirtualServer,
        oi: usize,
        ni: usize,
        old_checkers: &[Checker],
    ) {
        let mut to_remove: Vec<usize> = Vec::new();
        for ori in 0..old_vs.rs.len() {
            let nri = self.data.vs[ni]
                .rs
                .iter()
                .position(|r| r.same_identity(&old_vs.rs[ori]));
            let Some(nri) = nri else {
                info!("service {} no longer exist", old_vs.rs[ori].addr);
                to_remove.push(ori);
                continue;
            };

            {
                let old_rs = &old_vs.rs[ori];
                let new_rs = &mut self.data.vs[ni].rs[nri];
                new_rs.alive = old_rs.alive;
                new_rs.set = old_rs.set;
                new_rs.weight = old_rs.weight;
                new_rs.pweight = old_rs.iweight;
                new_rs.reloaded = true;
            }

            // Without the history, a failed server would sit in limbo:
            // reported down with no failed check, never brought back up.
            self.migrate_checkers(oi, ori, ni, nri, old_checkers);

            let edit = {
                let old_rs = &old_vs.rs[ori];
                let new_rs = &self.data.vs[ni].rs[nri];
                old_rs.tunnel != new_rs.tunnel || old_rs.fwd_method != new_rs.fwd_method
            };
            if edit {
                let vs_id = self.data.vs[ni].ident.to_string();
                let _ = self.fx.edit_rs(&vs_id, &self.data.vs[ni].rs[nri]);
            }
        }
        self.data.vs[ni].recount_alive();
        self.fx.clear_service_rs(old_vs, &to_remove, false);
    }

    /// Carries the history of matching checkers onto the new generation and
    /// reconciles whatever the match leaves dangling.
    fn migrate_checkers(
        &mut self,
        oi: usize,
        ori: usize,
        ni: usize,
        nri: usize,
        old_checkers: &[Checker],
    ) {
        let old_for_rs: Vec<&Checker> = old_checkers
            .iter()
            .filter(|c| c.vs == oi && c.rs == ori)
            .collect();

        if !old_for_rs.is_empty() {
            for ci in 0..self.checkers.len() {
                if self.checkers[ci].vs != ni || self.checkers[ci].rs != nri {
                    continue;
                }
                let matched = old_for_rs
                    .iter()
                    .find(|old_c| old_c.same_probe(&self.checkers[ci]));
                if let Some(old_c) = matched {
                    let (has_run, is_up, retry_it) = (old_c.has_run, old_c.is_up, old_c.retry_it);
                    if has_run && is_up != self.checkers[ci].is_up {
                        self.set_checker_state(ci, is_up);
                    }
                    self.checkers[ci].has_run = has_run;
                    self.checkers[ci].retry_it = retry_it;
                }
            }
        }

        // Recount from the migrated set; the configured count may have
        // changed arbitrarily.
        let mut failed = 0u32;
        let mut a_checker_has_run = false;
        for c in &self.checkers {
            if c.vs != ni || c.rs != nri {
                continue;
            }
            if c.has_run && !c.is_up {
                failed += 1;
            }
            if c.has_run {
                a_checker_has_run = true;
            }
        }
        self.data.vs[ni].rs[nri].num_failed_checkers = failed;

        // A known-failed server keeps its unrun alpha checkers pessimistic,
        // and one failure uses up the retry budget.
        let alive = self.data.vs[ni].rs[nri].alive;
        if failed > 0 || (!alive && !a_checker_has_run) {
            for ci in 0..self.checkers.len() {
                if self.checkers[ci].vs != ni
                    || self.checkers[ci].rs != nri
                    || self.checkers[ci].has_run
                {
                    continue;
                }
                if self.checkers[ci].alpha {
                    self.set_checker_state(ci, false);
                }
                self.checkers[ci].retry_it = self.checkers[ci].retry;
            }
        }

        let rs = &self.data.vs[ni].rs[nri];
        if rs.num_failed_checkers == 0 && !rs.alive {
            self.perform_svr_state(true, ni, nri);
        } else if rs.num_failed_checkers > 0 && rs.set != rs.inhibit {
            let vs_id = self.data.vs[ni].ident.to_string();
            let _ = if self.data.vs[ni].rs[nri].inhibit {
                self.fx.add_rs(&vs_id, &mut self.data.vs[ni].rs[nri])
            } else {
                self.fx.del_rs(&vs_id, &mut self.data.vs[ni].rs[nri], true)
            };
        }
    }

    /// Sorry-server diff: a surviving one keeps its state, a vanished or
    /// replaced one is removed from the plane.
    fn clear_diff_s_srv(&mut self, old_vs: &mut VirtualServer, ni: usize) {
        let vs_id = old_vs.ident.to_string();
        let Some(old_sorry) = old_vs.s_svr.as_mut() else {
            return;
        };
        let survives = self.data.vs[ni]
            .s_svr
            .as_ref()
            .is_some_and(|n| n.same_identity(old_sorry));

        if survives {
            let new_sorry = self.data.vs[ni].s_svr.as_mut().expect("checked above");
            new_sorry.alive = old_sorry.alive;
            new_sorry.set = old_sorry.set;
            new_sorry.weight = old_sorry.weight;
            new_sorry.pweight = old_sorry.iweight;
            new_sorry.reloaded = true;
        } else {
            if old_sorry.inhibit {
                if !old_sorry.alive && old_sorry.set {
                    old_sorry.alive = true;
                }
                old_sorry.inhibit = false;
            }
            if old_sorry.alive {
                info!("Removing sorry server {} from VS {vs_id}", old_sorry.addr);
                let _ = self.fx.del_rs(&vs_id, old_sorry, false);
            }
        }
    }

    /// Per-entry alive counters survive a reload on matching group entries.
    fn update_alive_counts(&mut self, old_data: &CheckData, oi: usize, ni: usize) {
        let (Some(old_gname), Some(new_gname)) = (
            old_data.vs[oi].group_name(),
            self.data.vs[ni].group_name().map(String::from),
        ) else {
            return;
        };
        let Some(old_group) = old_data.groups.iter().find(|g| g.name == old_gname) else {
            return;
        };

        for entry in &old_group.ranges {
            if let Some(new_entry) = self
                .data
                .group_mut(&new_gname)
                .and_then(|g| g.ranges.iter_mut().find(|e| e.same_identity(entry)))
            {
                new_entry.alive = entry.alive;
            }
        }
        for entry in &old_group.fwmarks {
            if let Some(new_entry) = self
                .data
                .group_mut(&new_gname)
                .and_then(|g| g.fwmarks.iter_mut().find(|e| e.fwmark == entry.fwmark))
            {
                new_entry.alive = entry.alive;
            }
        }
    }

    /// Local-address and blacklist groups diff symmetrically: entries gone
    /// from the new generation are removed, entries new to it are added.
    fn clear_diff_addr_groups(&mut self, old_data: &CheckData, oi: usize, ni: usize) {
        use crate::model::FwdMethod;
        let old_vs = &old_data.vs[oi];
        let vs_id = self.data.vs[ni].ident.to_string();

        let laddr_gname = if old_vs.fwd_method == FwdMethod::Fnat {
            old_vs.laddr_gname.as_ref()
        } else {
            None
        };
        if let Some(gname) = laddr_gname {
            let old_entries = old_data.laddr_group(gname).map(|g| g.entries.as_slice());
            let new_entries = self.data.laddr_group(gname).map(|g| g.entries.as_slice());
            let (removed, added) =
                diff_entries(old_entries.unwrap_or(&[]), new_entries.unwrap_or(&[]));
            for entry in removed {
                info!("VS [{entry}] in local address group {gname} no longer exist");
                let _ = self.fx.plane.apply(PlaneCmd::DelLaddrEntry {
                    vs: vs_id.clone(),
                    entry,
                });
            }
            for entry in added {
                let _ = self.fx.plane.apply(PlaneCmd::AddLaddrEntry {
                    vs: vs_id.clone(),
                    entry,
                });
            }
        }

        if let Some(gname) = &old_vs.blklst_gname {
            let old_entries = old_data.blklst_group(gname).map(|g| g.entries.as_slice());
            let new_entries = self.data.blklst_group(gname).map(|g| g.entries.as_slice());
            let (removed, added) =
                diff_entries(old_entries.unwrap_or(&[]), new_entries.unwrap_or(&[]));
            for entry in removed {
                info!(
                    "VS [{entry}] in blacklist address group {gname} no longer exist"
                );
                let _ = self.fx.plane.apply(PlaneCmd::DelBlklstEntry {
                    vs: vs_id.clone(),
                    entry,
                });
            }
            for entry in added {
                let _ = self.fx.plane.apply(PlaneCmd::AddBlklstEntry {
                    vs: vs_id.clone(),
                    entry,
                });
            }
        }
    }

    /// After a reload, brand-new servers with alpha checkers start down, as
    /// they would on a fresh start.
    pub(crate) fn check_new_rs_state(&mut self) {
        for ci in 0..self.checkers.len() {
            let (vi, ri) = (self.checkers[ci].vs, self.checkers[ci].rs);
            if self.data.vs[vi].rs[ri].reloaded {
                continue;
            }
            if !self.checkers[ci].alpha {
                continue;
            }
            self.set_checker_state(ci, false);
            self.data.vs[vi].rs[ri].alive = false;
        }
    }
}

fn diff_entries(
    old: &[crate::model::AddrGroupEntry],
    new: &[crate::model::AddrGroupEntry],
) -> (Vec<String>, Vec<String>) {
    let removed = old
        .iter()
        .filter(|e| !new.contains(e))
        .map(addr_entry_id)
        .collect();
    let added = new
        .iter()
        .filter(|e| !old.contains(e))
        .map(addr_entry_id)
        .collect();
    (removed, added)
}

#[cfg(test)]
mod tests {
    use crate::daemon::CheckDaemon;
    use crate::model::{
        AddrGroup, AddrGroupEntry, AddrRange, CheckData, Checker, CheckerKind, Proto, RangeEntry,
        RealServer, TunnelEntry, TunnelGroup, VirtualServer, VsGroup, VsIdent,
    };
    use crate::notify::recording_notifier;
    use crate::plane::{PlaneCmd, RecordingPlane};
    use pretty_assertions::assert_eq;
    use std::net::{IpAddr, SocketAddr};

    fn rs_addr(last: u8) -> SocketAddr {
        format!("10.1.0.{last}:80").parse().unwrap()
    }

    fn base_vs() -> VirtualServer {
        VirtualServer::new(
            VsIdent::Addr {
                proto: Proto::Tcp,
                addr: "10.0.0.100:80".parse().unwrap(),
            },
            Proto::Tcp,
            1,
            0,
        )
    }

    /// Two real servers, one TCP checker each, a sorry server.
    fn config() -> (CheckData, Vec<Checker>) {
        let mut vs = base_vs();
        vs.rs.push(RealServer::new(rs_addr(1), 1));
        vs.rs.push(RealServer::new(rs_addr(2), 1));
        vs.s_svr = Some(RealServer::new("10.9.0.9:80".parse().unwrap(), 1));
        let checkers = vec![
            Checker::new(0, 0, CheckerKind::Tcp, "connect:80"),
            Checker::new(0, 1, CheckerKind::Tcp, "connect:80"),
        ];
        (
            CheckData {
                vs: vec![vs],
                ..CheckData::default()
            },
            checkers,
        )
    }

    fn started_daemon() -> (CheckDaemon<RecordingPlane>, crate::notify::EventLog) {
        let (notifier, log) = recording_notifier();
        let mut daemon = CheckDaemon::new(RecordingPlane::new(), notifier);
        let (data, checkers) = config();
        daemon.load(data, checkers);
        daemon.start();
        daemon.update_svr_checker_state(true, 0);
        daemon.update_svr_checker_state(true, 1);
        (daemon, log)
    }

    #[test]
    fn identical_reload_issues_no_plane_command() {
        let (mut daemon, _log) = started_daemon();
        daemon.checkers[0].retry_it = 2;
        daemon.fx.plane.clear();

        let (new_data, new_checkers) = config();
        daemon.reload(new_data, new_checkers);

        assert_eq!(daemon.fx.plane.cmds(), &[] as &[PlaneCmd]);
        let vs = &daemon.data.vs[0];
        assert!(vs.reloaded);
        assert!(vs.quorum_state_up);
        assert!(vs.rs.iter().all(|rs| rs.alive && rs.set && rs.reloaded));
        assert_eq!(vs.rs[0].weight, 1);
        // Checker history survived the reload.
        assert!(daemon.checkers[0].is_up);
        assert!(daemon.checkers[0].has_run);
        assert_eq!(daemon.checkers[0].retry_it, 2);
        assert_eq!(vs.rs[0].num_failed_checkers, 0);
    }

    #[test]
    fn failed_server_history_survives_reload() {
        let (mut daemon, _log) = started_daemon();
        daemon.update_svr_checker_state(false, 1);
        assert!(!daemon.data.vs[0].rs[1].alive);
        daemon.fx.plane.clear();

        let (new_data, new_checkers) = config();
        daemon.reload(new_data, new_checkers);

        let rs = &daemon.data.vs[0].rs[1];
        assert!(!rs.alive, "failed server is not re-added on reload");
        assert_eq!(rs.num_failed_checkers, 1);
        assert!(!daemon.checkers[1].is_up);
        assert_eq!(daemon.fx.plane.cmds(), &[] as &[PlaneCmd]);
    }

    #[test]
    fn vanished_rs_is_removed_with_notifications() {
        let (mut daemon, log) = started_daemon();
        daemon.fx.plane.clear();

        let (mut new_data, mut new_checkers) = config();
        new_data.vs[0].rs.pop();
        new_checkers.pop();
        daemon.reload(new_data, new_checkers);

        let cmds = daemon.fx.plane.cmds();
        assert!(cmds.contains(&PlaneCmd::DelDest {
            vs: "10.0.0.100:80".to_string(),
            rs: rs_addr(2),
        }));
        assert!(
            !cmds
                .iter()
                .any(|c| matches!(c, PlaneCmd::DelDest { rs, .. } if *rs == rs_addr(1))),
            "surviving server untouched: {cmds:?}"
        );
        assert!(
            log.lock()
                .unwrap()
                .iter()
                .any(|e| e == "FIFO RS 10.1.0.2:80 10.0.0.100:80 DOWN"),
        );
        assert_eq!(daemon.data.vs[0].rs.len(), 1);
    }

    #[test]
    fn changed_probe_resets_history_and_revives_the_server() {
        let (mut daemon, _log) = started_daemon();
        daemon.update_svr_checker_state(false, 0);
        assert!(!daemon.data.vs[0].rs[0].alive);
        daemon.fx.plane.clear();

        // Same server, but its checker probes a different endpoint: no
        // history carries over, so zero failures remain and the server is
        // synthesized back up.
        let (new_data, mut new_checkers) = config();
        new_checkers[0].ident = "connect:8080".to_string();
        daemon.reload(new_data, new_checkers);

        assert!(daemon.data.vs[0].rs[0].alive);
        assert!(daemon.fx.plane.cmds().contains(&PlaneCmd::AddDest {
            vs: "10.0.0.100:80".to_string(),
            rs: rs_addr(1),
            weight: 1,
        }));
    }

    #[test]
    fn new_alpha_server_starts_down() {
        let (mut daemon, _log) = started_daemon();
        daemon.fx.plane.clear();

        let (mut new_data, mut new_checkers) = config();
        new_data.vs[0].rs.push(RealServer::new(rs_addr(3), 1));
        let mut alpha = Checker::new(0, 2, CheckerKind::Http, "get:/health");
        alpha.alpha = true;
        new_checkers.push(alpha);
        daemon.reload(new_data, new_checkers);

        let rs = &daemon.data.vs[0].rs[2];
        assert!(!rs.alive);
        assert!(!rs.set);
        assert_eq!(rs.num_failed_checkers, 1);
        assert!(
            !daemon
                .fx
                .plane
                .cmds()
                .iter()
                .any(|c| matches!(c, PlaneCmd::AddDest { rs, .. } if *rs == rs_addr(3))),
            "pessimistic start: not installed before the first probe"
        );
    }

    #[test]
    fn vanished_vs_is_torn_down() {
        let (mut daemon, log) = started_daemon();
        daemon.fx.plane.clear();

        daemon.reload(CheckData::default(), Vec::new());

        let cmds = daemon.fx.plane.cmds();
        for last in [1u8, 2] {
            assert!(cmds.contains(&PlaneCmd::DelDest {
                vs: "10.0.0.100:80".to_string(),
                rs: rs_addr(last),
            }));
        }
        assert!(cmds.contains(&PlaneCmd::DelVs {
            vs: "10.0.0.100:80".to_string(),
        }));
        assert!(
            log.lock()
                .unwrap()
                .iter()
                .any(|e| e == "FIFO VS 10.0.0.100:80 DOWN")
        );
    }

    #[test]
    fn scheduler_change_edits_the_service() {
        let (mut daemon, _log) = started_daemon();
        daemon.fx.plane.clear();

        let (mut new_data, new_checkers) = config();
        new_data.vs[0].sched = "wrr".to_string();
        daemon.reload(new_data, new_checkers);

        assert!(daemon.fx.plane.cmds().contains(&PlaneCmd::EditVs {
            vs: "10.0.0.100:80".to_string(),
        }));
    }

    #[test]
    fn shutdown_fires_snmp_always_but_spares_the_rest_without_omega() {
        let (mut daemon, log) = started_daemon();
        log.lock().unwrap().clear();
        daemon.fx.plane.clear();

        daemon.stop();

        let events = log.lock().unwrap().clone();
        assert!(
            events
                .iter()
                .any(|e| e.starts_with("SNMP RS 10.1.0.1:80") && e.ends_with("stopping=true"))
        );
        assert!(
            events
                .iter()
                .any(|e| e.starts_with("SNMP VS") && e.ends_with("stopping=true"))
        );
        assert!(
            events.iter().all(|e| !e.starts_with("FIFO")),
            "non-omega shutdown keeps the fifo quiet: {events:?}"
        );
        assert!(daemon.fx.plane.cmds().contains(&PlaneCmd::DelVs {
            vs: "10.0.0.100:80".to_string(),
        }));
    }

    #[test]
    fn omega_shutdown_runs_every_notifier() {
        let (notifier, log) = recording_notifier();
        let mut daemon = CheckDaemon::new(RecordingPlane::new(), notifier);
        let (mut data, checkers) = config();
        data.vs[0].omega = true;
        daemon.load(data, checkers);
        daemon.start();
        daemon.update_svr_checker_state(true, 0);
        daemon.update_svr_checker_state(true, 1);
        log.lock().unwrap().clear();

        daemon.stop();

        let events = log.lock().unwrap().clone();
        assert!(events.iter().any(|e| e.starts_with("FIFO RS 10.1.0.1:80")));
        assert!(events.iter().any(|e| e == "FIFO VS 10.0.0.100:80 DOWN"));
        assert!(events.iter().any(|e| e.starts_with("SNMP VS")));
    }

    #[test]
    fn laddr_group_diff_is_symmetric() {
        fn entry(last: u8) -> AddrGroupEntry {
            AddrGroupEntry {
                range: AddrRange::single(IpAddr::from([192, 168, 0, last])),
                ifname: "eth0".to_string(),
            }
        }
        let make = |lasts: &[u8]| {
            let (mut data, checkers) = config();
            data.vs[0].laddr_gname = Some("lg".to_string());
            data.laddr_groups = vec![AddrGroup {
                name: "lg".to_string(),
                entries: lasts.iter().copied().map(entry).collect(),
            }];
            (data, checkers)
        };

        let (notifier, _log) = recording_notifier();
        let mut daemon = CheckDaemon::new(RecordingPlane::new(), notifier);
        let (data, checkers) = make(&[1, 2]);
        daemon.load(data, checkers);
        daemon.start();
        daemon.fx.plane.clear();

        let (new_data, new_checkers) = make(&[2, 3]);
        daemon.reload(new_data, new_checkers);

        let cmds = daemon.fx.plane.cmds();
        assert!(cmds.contains(&PlaneCmd::DelLaddrEntry {
            vs: "10.0.0.100:80".to_string(),
            entry: "192.168.0.1-192.168.0.1%eth0".to_string(),
        }));
        assert!(cmds.contains(&PlaneCmd::AddLaddrEntry {
            vs: "10.0.0.100:80".to_string(),
            entry: "192.168.0.3-192.168.0.3%eth0".to_string(),
        }));
        assert!(
            !cmds
                .iter()
                .any(|c| matches!(c, PlaneCmd::DelLaddrEntry { entry, .. } if entry.contains("0.2"))),
        );
    }

    #[test]
    fn tunnel_groups_diff_by_name_then_quintuple() {
        fn tun(ifname: &str, remote: [u8; 4]) -> TunnelEntry {
            TunnelEntry {
                ifname: ifname.to_string(),
                link: "eth0".to_string(),
                kind: "ipip".to_string(),
                local: IpAddr::from([10, 0, 0, 1]),
                remote: IpAddr::from(remote),
            }
        }
        let make = |entries: Vec<TunnelEntry>| {
            let (mut data, checkers) = config();
            data.tunnel_groups = vec![TunnelGroup {
                name: "tg".to_string(),
                entries,
            }];
            (data, checkers)
        };

        let (notifier, _log) = recording_notifier();
        let mut daemon = CheckDaemon::new(RecordingPlane::new(), notifier);
        let (data, checkers) = make(vec![tun("tun1", [1, 1, 1, 1]), tun("tun2", [2, 2, 2, 2])]);
        daemon.load(data, checkers);
        daemon.start();
        daemon.fx.plane.clear();

        // tun2's remote changes: same name, different quintuple.
        let (new_data, new_checkers) =
            make(vec![tun("tun2", [9, 9, 9, 9]), tun("tun3", [3, 3, 3, 3])]);
        daemon.reload(new_data, new_checkers);

        let cmds = daemon.fx.plane.cmds();
        assert!(cmds.contains(&PlaneCmd::DelTunnel {
            ifname: "tun1".to_string()
        }));
        assert!(cmds.contains(&PlaneCmd::DelTunnel {
            ifname: "tun2".to_string()
        }));
        assert!(cmds.contains(&PlaneCmd::AddTunnel {
            ifname: "tun2".to_string()
        }));
        assert!(cmds.contains(&PlaneCmd::AddTunnel {
            ifname: "tun3".to_string()
        }));
    }

    #[test]
    fn group_entries_diff_and_sync() {
        let range = |first: u8, last: u8| {
            RangeEntry::new(
                AddrRange {
                    first: IpAddr::from([10, 0, 0, first]),
                    last: IpAddr::from([10, 0, 0, last]),
                },
                80,
            )
        };
        let make = |entries: Vec<RangeEntry>| {
            let (mut data, checkers) = config();
            data.vs[0].ident = VsIdent::Group {
                name: "web".to_string(),
                seq: 0,
            };
            data.groups = vec![VsGroup {
                name: "web".to_string(),
                ranges: entries,
                fwmarks: Vec::new(),
            }];
            (data, checkers)
        };

        let (notifier, _log) = recording_notifier();
        let mut daemon = CheckDaemon::new(RecordingPlane::new(), notifier);
        let (data, checkers) = make(vec![range(1, 5), range(10, 15)]);
        daemon.load(data, checkers);
        daemon.start();
        daemon.fx.plane.clear();

        let (new_data, new_checkers) = make(vec![range(10, 15), range(20, 25)]);
        daemon.reload(new_data, new_checkers);

        let cmds = daemon.fx.plane.cmds();
        assert!(cmds.contains(&PlaneCmd::DelGroupEntry {
            vs: "web".to_string(),
            entry: "10.0.0.1-10.0.0.5:80".to_string(),
        }));
        assert!(cmds.contains(&PlaneCmd::AddGroupEntry {
            vs: "web".to_string(),
            entry: "10.0.0.20-10.0.0.25:80".to_string(),
        }));
        assert!(cmds.contains(&PlaneCmd::SyncGroupEntry {
            vs: "web".to_string(),
            entry: "10.0.0.20-10.0.0.25:80".to_string(),
        }));
        assert!(
            !cmds
                .iter()
                .any(|c| matches!(c, PlaneCmd::DelGroupEntry { entry, .. } if entry.contains("10.0.0.10"))),
            "surviving entry untouched"
        );
    }

    #[test]
    fn sorry_server_state_survives_reload() {
        let (mut daemon, _log) = started_daemon();
        // Drop quorum so the sorry server goes in.
        daemon.update_svr_checker_state(false, 0);
        daemon.update_svr_checker_state(false, 1);
        assert!(daemon.data.vs[0].s_svr.as_ref().unwrap().alive);
        daemon.fx.plane.clear();

        let (new_data, new_checkers) = config();
        daemon.reload(new_data, new_checkers);

        let sorry = daemon.data.vs[0].s_svr.as_ref().unwrap();
        assert!(sorry.alive && sorry.set && sorry.reloaded);
        assert_eq!(daemon.fx.plane.cmds(), &[] as &[PlaneCmd]);
    }
}

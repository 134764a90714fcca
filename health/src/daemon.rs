// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The cooperative health daemon.
//!
//! One thread owns everything here: configuration generations, checker
//! state, plane commands and notifications. Checker callbacks, control
//! operations and the debounce tick all run on that thread, so the model
//! needs no internal locking.
//!
//! [`Effects`] bundles the two outward channels (forwarding plane and
//! notification transports) so state transitions can borrow the
//! configuration and the channels independently.

use crate::model::{CheckData, Checker, RealServer, VirtualServer};
use crate::notify::Notifier;
use crate::plane::{IpvsPlane, PlaneCmd, PlaneError};
use tracing::info;

///////////////////////////////////////////////////////////////////////////////
// Effects
///////////////////////////////////////////////////////////////////////////////

/// Outward channels of the daemon: plane commands and notifications.
#[derive(Debug)]
pub struct Effects<P: IpvsPlane> {
    pub plane: P,
    pub notify: Notifier,
}

impl<P: IpvsPlane> Effects<P> {
    /// Installs a real server, honouring the inhibit protocol: a server that
    /// is already installed (inhibited at weight zero) is edited back to its
    /// effective weight instead of re-added.
    pub(crate) fn add_rs(&mut self, vs_id: &str, rs: &mut RealServer) -> Result<(), PlaneError> {
        let weight = rs.effective_weight();
        self.add_rs_with_weight(vs_id, rs, weight)
    }

    pub(crate) fn add_rs_with_weight(
        &mut self,
        vs_id: &str,
        rs: &mut RealServer,
        weight: i32,
    ) -> Result<(), PlaneError> {
        if rs.inhibit && rs.set {
            self.plane.apply(PlaneCmd::EditDest {
                vs: vs_id.to_string(),
                rs: rs.addr,
                weight,
            })
        } else {
            self.plane.apply(PlaneCmd::AddDest {
                vs: vs_id.to_string(),
                rs: rs.addr,
                weight,
            })?;
            rs.set = true;
            Ok(())
        }
    }

    /// Removes a real server. Without `force`, an inhibited server is kept
    /// installed at weight zero; `force` removes it outright.
    pub(crate) fn del_rs(
        &mut self,
        vs_id: &str,
        rs: &mut RealServer,
        force: bool,
    ) -> Result<(), PlaneError> {
        if !force && rs.inhibit {
            self.plane.apply(PlaneCmd::EditDest {
                vs: vs_id.to_string(),
                rs: rs.addr,
                weight: 0,
            })
        } else {
            self.plane.apply(PlaneCmd::DelDest {
                vs: vs_id.to_string(),
                rs: rs.addr,
            })?;
            rs.set = false;
            Ok(())
        }
    }

    pub(crate) fn edit_rs(&mut self, vs_id: &str, rs: &RealServer) -> Result<(), PlaneError> {
        self.plane.apply(PlaneCmd::EditDest {
            vs: vs_id.to_string(),
            rs: rs.addr,
            weight: rs.effective_weight(),
        })
    }

    /// Real-server transition fan-out: script, FIFO line, SNMP trap. SMTP
    /// alerts belong to the individual checkers, which have probe context.
    pub(crate) fn do_rs_notifies(&mut self, vs: &VirtualServer, ri: usize, stopping: bool) {
        let rs = &vs.rs[ri];
        let script = if rs.alive {
            rs.notify_up.clone()
        } else {
            rs.notify_down.clone()
        };
        if let Some(cmd) = script {
            self.notify.script.run(&cmd);
        }
        let vs_id = vs.ident.to_string();
        let rs_id = rs.addr.to_string();
        self.notify.fifo_rs(&rs_id, &vs_id, rs.alive);
        self.notify.snmp.rs_trap(&rs_id, &vs_id, rs.alive, stopping);
    }

    /// Quorum transition fan-out. The SNMP trap always fires, shutdown
    /// included; every other sink is suppressed while stopping unless the
    /// service runs in omega mode.
    pub(crate) fn do_vs_notifies(
        &mut self,
        vs: &VirtualServer,
        init: bool,
        threshold: i64,
        weight_sum: i64,
        stopping: bool,
    ) {
        let vs_id = vs.ident.to_string();
        self.notify
            .snmp
            .vs_trap(&vs_id, vs.quorum_state_up, stopping);

        if stopping && !vs.omega {
            return;
        }

        let script = if vs.quorum_state_up {
            vs.notify_quorum_up.clone()
        } else {
            vs.notify_quorum_down.clone()
        };
        if let Some(cmd) = script {
            self.notify.script.run(&cmd);
        }

        self.notify.fifo_vs(&vs_id, vs.quorum_state_up);

        if vs.smtp_alert {
            let message = if stopping {
                "=> Shutting down <=".to_string()
            } else {
                let phrase = match (vs.quorum_state_up, init) {
                    (true, true) => "Starting with quorum up",
                    (true, false) => "Gained quorum",
                    (false, true) => "Starting with quorum down",
                    (false, false) => "Lost quorum",
                };
                // The sign follows the threshold that decided the
                // transition: quorum + hysteresis going up, minus going
                // down.
                format!(
                    "=> {} {}{}{}={} <= {} <=",
                    phrase,
                    vs.quorum,
                    if vs.quorum_state_up { "+" } else { "-" },
                    vs.hysteresis,
                    threshold,
                    weight_sum
                )
            };
            let state = if vs.quorum_state_up { "UP" } else { "DOWN" };
            self.notify.smtp.alert(&format!("VS {vs_id}"), state, &message);
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
// CheckDaemon
///////////////////////////////////////////////////////////////////////////////

/// The daemon: one configuration generation, the checker queue and the
/// outward channels.
#[derive(Debug)]
pub struct CheckDaemon<P: IpvsPlane> {
    pub data: CheckData,
    pub checkers: Vec<Checker>,
    pub fx: Effects<P>,
    /// Emit real-server notifications for servers installed at startup.
    pub rs_init_notifies: bool,
}

impl<P: IpvsPlane> CheckDaemon<P> {
    pub fn new(plane: P, notify: Notifier) -> Self {
        Self {
            data: CheckData::default(),
            checkers: Vec::new(),
            fx: Effects { plane, notify },
            rs_init_notifies: false,
        }
    }

    /// Installs the first configuration generation. Use [`Self::reload`] for
    /// every later one.
    pub fn load(&mut self, data: CheckData, checkers: Vec<Checker>) {
        self.data = data;
        self.checkers = checkers;
    }

    /// Brings the configuration into the plane: tunnels first, then the
    /// pessimistic alpha-checker start, the initial quorum verdicts, and the
    /// services themselves.
    pub fn start(&mut self) {
        self.init_tunnels();
        self.init_alpha_checkers();
        self.set_quorum_states();
        self.init_services();
    }

    /// Orderly shutdown: removes every service from the plane, emitting the
    /// shutdown flavour of each notification.
    pub fn stop(&mut self) {
        info!("shutting down services");
        let mut data = std::mem::take(&mut self.data);
        for vs in &mut data.vs {
            self.fx.clear_service_vs(vs, true);
        }
        self.data = data;
    }

    /// Alpha checkers assume their server dead until the first probe
    /// succeeds.
    fn init_alpha_checkers(&mut self) {
        for ci in 0..self.checkers.len() {
            if !self.checkers[ci].alpha {
                continue;
            }
            self.set_checker_state(ci, false);
            let (vi, ri) = (self.checkers[ci].vs, self.checkers[ci].rs);
            self.data.vs[vi].rs[ri].alive = false;
        }
    }
}

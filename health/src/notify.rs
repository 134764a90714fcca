// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Notification transports.
//!
//! State transitions fan out to up to four sinks: an operator script, FIFO
//! line writers, an SMTP alert and an SNMP trap. The transports themselves
//! are pluggable; the defaults spawn processes and log, and a recording
//! variant captures everything for tests. All writes are best effort — a
//! dead FIFO reader must never stall health checking.

use std::fmt;
use std::fmt::Debug;
use std::fs::File;
use std::io::{self, Write};
use std::net::IpAddr;
use std::process::Command;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Which alive-ratio limit an operator action is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AratioSide {
    Upper,
    Lower,
}

impl fmt::Display for AratioSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AratioSide::Upper => write!(f, "upper"),
            AratioSide::Lower => write!(f, "lower"),
        }
    }
}

/// Line-oriented sink (a FIFO opened by the operator).
pub trait LineSink: Debug {
    /// # Errors
    ///
    /// Propagates the underlying I/O error; callers ignore it.
    fn write_line(&mut self, line: &str) -> io::Result<()>;
}

/// FIFO-backed [`LineSink`].
#[derive(Debug)]
pub struct FifoFile(pub File);

impl LineSink for FifoFile {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.0.write_all(line.as_bytes())
    }
}

/// Runs operator commands detached from the daemon.
pub trait ScriptRunner: Debug {
    fn run(&mut self, cmd: &str);
}

/// [`ScriptRunner`] that hands the command line to a shell and does not
/// wait for it.
#[derive(Debug, Default)]
pub struct ExecScript;

impl ScriptRunner for ExecScript {
    fn run(&mut self, cmd: &str) {
        match Command::new("sh").arg("-c").arg(cmd).spawn() {
            Ok(child) => info!(pid = child.id(), %cmd, "notify script started"),
            Err(err) => warn!(%cmd, %err, "could not exec notify script"),
        }
    }
}

/// SMTP alert transport; the actual mailer lives outside this crate.
pub trait SmtpSink: Debug {
    fn alert(&mut self, subject: &str, state: &str, body: &str);
}

#[derive(Debug, Default)]
pub struct LogSmtp;

impl SmtpSink for LogSmtp {
    fn alert(&mut self, subject: &str, state: &str, body: &str) {
        info!(%subject, %state, %body, "smtp alert");
    }
}

/// SNMP trap transport; the actual agent lives outside this crate.
pub trait SnmpSink: Debug {
    fn vs_trap(&mut self, vs: &str, up: bool, stopping: bool);
    fn rs_trap(&mut self, rs: &str, vs: &str, up: bool, stopping: bool);
}

#[derive(Debug, Default)]
pub struct LogSnmp;

impl SnmpSink for LogSnmp {
    fn vs_trap(&mut self, vs: &str, up: bool, stopping: bool) {
        info!(%vs, up, stopping, "snmp quorum trap");
    }

    fn rs_trap(&mut self, rs: &str, vs: &str, up: bool, stopping: bool) {
        info!(%rs, %vs, up, stopping, "snmp rs trap");
    }
}

/// Alive-ratio operator hook, `"<cmd> <vip> <upper|lower>"`.
pub trait OperatorHook: Debug {
    fn run(&mut self, cmd: &str, vip: IpAddr, side: AratioSide);
}

#[derive(Debug, Default)]
pub struct ExecHook(ExecScript);

impl OperatorHook for ExecHook {
    fn run(&mut self, cmd: &str, vip: IpAddr, side: AratioSide) {
        let line = format!("{cmd} {vip} {side}");
        info!(%line, "alive-ratio action");
        self.0.run(&line);
    }
}

/// The daemon-facing bundle of every transport.
#[derive(Debug)]
pub struct Notifier {
    pub fifo: Option<Box<dyn LineSink>>,
    pub lvs_fifo: Option<Box<dyn LineSink>>,
    pub script: Box<dyn ScriptRunner>,
    pub smtp: Box<dyn SmtpSink>,
    pub snmp: Box<dyn SnmpSink>,
    pub hook: Box<dyn OperatorHook>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self {
            fifo: None,
            lvs_fifo: None,
            script: Box::new(ExecScript),
            smtp: Box::new(LogSmtp),
            snmp: Box::new(LogSnmp),
            hook: Box::new(ExecHook::default()),
        }
    }
}

impl Notifier {
    /// `VS <id> <UP|DOWN>` towards both FIFOs; write errors are ignored.
    pub fn fifo_vs(&mut self, vs: &str, up: bool) {
        let line = format!("VS {} {}\n", vs, if up { "UP" } else { "DOWN" });
        self.write_fifos(&line);
    }

    /// `RS <rs> <vs> <UP|DOWN>` towards both FIFOs; write errors are ignored.
    pub fn fifo_rs(&mut self, rs: &str, vs: &str, up: bool) {
        let line = format!("RS {} {} {}\n", rs, vs, if up { "UP" } else { "DOWN" });
        self.write_fifos(&line);
    }

    fn write_fifos(&mut self, line: &str) {
        for sink in [self.fifo.as_mut(), self.lvs_fifo.as_mut()].into_iter().flatten() {
            if let Err(err) = sink.write_line(line) {
                warn!(%err, "notify fifo write failed");
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////
// Recording transports
///////////////////////////////////////////////////////////////////////////////

/// Shared event log filled by [`recording_notifier`] transports.
pub type EventLog = Arc<Mutex<Vec<String>>>;

/// One recorder implementing every transport trait.
#[derive(Debug, Clone)]
pub struct Recorder(EventLog);

impl Recorder {
    fn push(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }
}

impl LineSink for Recorder {
    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.push(format!("FIFO {}", line.trim_end()));
        Ok(())
    }
}

impl ScriptRunner for Recorder {
    fn run(&mut self, cmd: &str) {
        self.push(format!("SCRIPT {cmd}"));
    }
}

impl SmtpSink for Recorder {
    fn alert(&mut self, subject: &str, state: &str, body: &str) {
        self.push(format!("SMTP {subject} {state} {body}"));
    }
}

impl SnmpSink for Recorder {
    fn vs_trap(&mut self, vs: &str, up: bool, stopping: bool) {
        self.push(format!(
            "SNMP VS {vs} {} stopping={stopping}",
            if up { "UP" } else { "DOWN" }
        ));
    }

    fn rs_trap(&mut self, rs: &str, vs: &str, up: bool, stopping: bool) {
        self.push(format!(
            "SNMP RS {rs} {vs} {} stopping={stopping}",
            if up { "UP" } else { "DOWN" }
        ));
    }
}

impl OperatorHook for Recorder {
    fn run(&mut self, cmd: &str, vip: IpAddr, side: AratioSide) {
        self.push(format!("HOOK {cmd} {vip} {side}"));
    }
}

/// A [`Notifier`] whose every transport records into one shared log.
#[must_use]
pub fn recording_notifier() -> (Notifier, EventLog) {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let recorder = Recorder(Arc::clone(&log));
    let notifier = Notifier {
        fifo: Some(Box::new(recorder.clone())),
        lvs_fifo: None,
        script: Box::new(recorder.clone()),
        smtp: Box::new(recorder.clone()),
        snmp: Box::new(recorder.clone()),
        hook: Box::new(recorder),
    };
    (notifier, log)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_lines_follow_the_protocol() {
        let (mut notifier, log) = recording_notifier();
        notifier.fifo_vs("10.0.0.100:80", false);
        notifier.fifo_rs("10.1.0.1:80", "10.0.0.100:80", true);
        let events = log.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                "FIFO VS 10.0.0.100:80 DOWN".to_string(),
                "FIFO RS 10.1.0.1:80 10.0.0.100:80 UP".to_string(),
            ]
        );
    }
}

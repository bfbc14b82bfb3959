//! Process and signal interface
//!
//! The terminal core does not own processes. It asks a [`ProcessTable`] who is in
//! which group and session, and asks it to deliver job-control signals. The
//! [`LocalProcessTable`] is a self-contained host used by the binary and tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use super::sync::{lock, NamedEvent};
use super::tty::DeviceId;

pub type Pid = u32;

/// Signals the terminal core raises.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Signal {
    Hup,
    Int,
    Quit,
    Kill,
    Term,
    Cont,
    Tstp,
    Ttin,
    Ttou,
    Winch,
}

impl Signal {
    pub fn number(self) -> i32 {
        match self {
            Signal::Hup => 1,
            Signal::Int => 2,
            Signal::Quit => 3,
            Signal::Kill => 9,
            Signal::Term => 15,
            Signal::Cont => 18,
            Signal::Tstp => 20,
            Signal::Ttin => 21,
            Signal::Ttou => 22,
            Signal::Winch => 28,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Signal::Hup => "SIGHUP",
            Signal::Int => "SIGINT",
            Signal::Quit => "SIGQUIT",
            Signal::Kill => "SIGKILL",
            Signal::Term => "SIGTERM",
            Signal::Cont => "SIGCONT",
            Signal::Tstp => "SIGTSTP",
            Signal::Ttin => "SIGTTIN",
            Signal::Ttou => "SIGTTOU",
            Signal::Winch => "SIGWINCH",
        }
    }
}

/// How a process treats a signal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Disposition {
    #[default]
    Default,
    Handled,
    Ignored,
    Blocked,
}

impl Disposition {
    /// Ignored or blocked signals cannot stop a background process.
    pub fn is_ignored_or_blocked(self) -> bool {
        matches!(self, Disposition::Ignored | Disposition::Blocked)
    }
}

/// Host process table consumed by the terminal core.
pub trait ProcessTable: Send + Sync {
    fn exists(&self, pid: Pid) -> bool;
    fn pgid(&self, pid: Pid) -> Option<Pid>;
    fn sid(&self, pid: Pid) -> Option<Pid>;
    fn ctty(&self, pid: Pid) -> Option<DeviceId>;
    fn set_ctty(&self, pid: Pid, dev: Option<DeviceId>);
    /// True when some process of group `pgid` belongs to session `sid`.
    fn pgrp_in_session(&self, pgid: Pid, sid: Pid) -> bool;
    /// No member of `pgid` has a parent in the same session but another group.
    fn is_orphaned_process_group(&self, pgid: Pid) -> bool;
    fn disposition(&self, pid: Pid, sig: Signal) -> Disposition;
    /// Deliver `sig` to every member of `pgid`; returns the number of receivers.
    fn kill_pgrp(&self, pgid: Pid, sig: Signal) -> usize;
    fn sig_send(&self, pid: Pid, sig: Signal) -> bool;
    /// Event set whenever a signal is queued for `pid`.
    fn signal_arrived(&self, pid: Pid) -> Option<Arc<NamedEvent>>;
    /// Security session (logon session) the process runs in.
    fn security_session(&self, pid: Pid) -> Option<u32>;
    fn uid(&self, pid: Pid) -> Option<u32>;
}

#[derive(Debug, Clone)]
pub struct ProcessInfo {
    pub pid: Pid,
    pub ppid: Pid,
    pub pgid: Pid,
    pub sid: Pid,
    pub uid: u32,
    pub security_session: u32,
    pub ctty: Option<DeviceId>,
    dispositions: HashMap<Signal, Disposition>,
    pending: Vec<Signal>,
    signal_arrived: Arc<NamedEvent>,
}

impl ProcessInfo {
    /// A session leader in its own group.
    pub fn new(pid: Pid) -> Self {
        Self {
            pid,
            ppid: 1,
            pgid: pid,
            sid: pid,
            uid: 1000,
            security_session: 1,
            ctty: None,
            dispositions: HashMap::new(),
            pending: Vec::new(),
            signal_arrived: Arc::new(NamedEvent::new(format!("sigarrived.{}", pid), false, false)),
        }
    }

    pub fn parent(mut self, ppid: Pid) -> Self {
        self.ppid = ppid;
        self
    }

    pub fn group(mut self, pgid: Pid) -> Self {
        self.pgid = pgid;
        self
    }

    pub fn session(mut self, sid: Pid) -> Self {
        self.sid = sid;
        self
    }

    pub fn user(mut self, uid: u32) -> Self {
        self.uid = uid;
        self
    }

    pub fn logon_session(mut self, session: u32) -> Self {
        self.security_session = session;
        self
    }
}

/// In-memory process table.
#[derive(Debug, Default)]
pub struct LocalProcessTable {
    procs: RwLock<HashMap<Pid, ProcessInfo>>,
    delivered: Mutex<Vec<(Pid, Signal)>>,
}

impl LocalProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, info: ProcessInfo) {
        self.procs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(info.pid, info);
    }

    /// Process exit.
    pub fn remove(&self, pid: Pid) {
        self.procs.write().unwrap_or_else(|e| e.into_inner()).remove(&pid);
    }

    pub fn setpgid(&self, pid: Pid, pgid: Pid) {
        if let Some(p) = self.procs.write().unwrap_or_else(|e| e.into_inner()).get_mut(&pid) {
            p.pgid = pgid;
        }
    }

    pub fn set_disposition(&self, pid: Pid, sig: Signal, disp: Disposition) {
        if let Some(p) = self.procs.write().unwrap_or_else(|e| e.into_inner()).get_mut(&pid) {
            p.dispositions.insert(sig, disp);
        }
    }

    /// Drain signals queued for `pid`, as its signal handler would.
    pub fn take_signals(&self, pid: Pid) -> Vec<Signal> {
        self.procs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&pid)
            .map(|p| {
                p.signal_arrived.reset();
                std::mem::take(&mut p.pending)
            })
            .unwrap_or_default()
    }

    /// Every (receiver, signal) pair delivered so far.
    pub fn delivered(&self) -> Vec<(Pid, Signal)> {
        lock(&self.delivered).clone()
    }

    pub fn delivered_to(&self, pid: Pid, sig: Signal) -> usize {
        lock(&self.delivered)
            .iter()
            .filter(|(p, s)| *p == pid && *s == sig)
            .count()
    }

    fn with<R>(&self, pid: Pid, f: impl FnOnce(&ProcessInfo) -> R) -> Option<R> {
        self.procs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&pid)
            .map(f)
    }

    fn deliver(&self, p: &mut ProcessInfo, sig: Signal) -> bool {
        if p.dispositions.get(&sig).copied() == Some(Disposition::Ignored) {
            return false;
        }
        p.pending.push(sig);
        lock(&self.delivered).push((p.pid, sig));
        p.signal_arrived.set();
        true
    }
}

impl ProcessTable for LocalProcessTable {
    fn exists(&self, pid: Pid) -> bool {
        self.with(pid, |_| ()).is_some()
    }

    fn pgid(&self, pid: Pid) -> Option<Pid> {
        self.with(pid, |p| p.pgid)
    }

    fn sid(&self, pid: Pid) -> Option<Pid> {
        self.with(pid, |p| p.sid)
    }

    fn ctty(&self, pid: Pid) -> Option<DeviceId> {
        self.with(pid, |p| p.ctty).flatten()
    }

    fn set_ctty(&self, pid: Pid, dev: Option<DeviceId>) {
        if let Some(p) = self.procs.write().unwrap_or_else(|e| e.into_inner()).get_mut(&pid) {
            p.ctty = dev;
        }
    }

    fn pgrp_in_session(&self, pgid: Pid, sid: Pid) -> bool {
        self.procs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .any(|p| p.pgid == pgid && p.sid == sid)
    }

    fn is_orphaned_process_group(&self, pgid: Pid) -> bool {
        let procs = self.procs.read().unwrap_or_else(|e| e.into_inner());
        !procs.values().filter(|p| p.pgid == pgid).any(|member| {
            procs
                .get(&member.ppid)
                .map_or(false, |parent| parent.pgid != pgid && parent.sid == member.sid)
        })
    }

    fn disposition(&self, pid: Pid, sig: Signal) -> Disposition {
        self.with(pid, |p| p.dispositions.get(&sig).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    fn kill_pgrp(&self, pgid: Pid, sig: Signal) -> usize {
        if pgid == 0 {
            return 0;
        }
        let mut procs = self.procs.write().unwrap_or_else(|e| e.into_inner());
        let mut count = 0;
        for p in procs.values_mut().filter(|p| p.pgid == pgid) {
            if self.deliver(p, sig) {
                count += 1;
            }
        }
        debug!("kill_pgrp({}, {}) reached {} processes", pgid, sig.name(), count);
        count
    }

    fn sig_send(&self, pid: Pid, sig: Signal) -> bool {
        let mut procs = self.procs.write().unwrap_or_else(|e| e.into_inner());
        match procs.get_mut(&pid) {
            Some(p) => self.deliver(p, sig),
            None => false,
        }
    }

    fn signal_arrived(&self, pid: Pid) -> Option<Arc<NamedEvent>> {
        self.with(pid, |p| p.signal_arrived.clone())
    }

    fn security_session(&self, pid: Pid) -> Option<u32> {
        self.with(pid, |p| p.security_session)
    }

    fn uid(&self, pid: Pid) -> Option<u32> {
        self.with(pid, |p| p.uid)
    }
}

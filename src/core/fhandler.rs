//! Application-facing terminal device interface
//!
//! Console, pty slave and pty master all present the same POSIX surface:
//! read/write/ioctl plus the `tc*` calls. The pieces every terminal device
//! shares (job-control checks, window size, controlling-tty bookkeeping) live
//! in [`TermiosBase`].

use std::sync::Arc;

use tracing::{debug, info};

use super::error::{Result, TtyError};
use super::ldisc::{bg_check, BgOp};
use super::process::{Pid, ProcessTable, Signal};
use super::termios::{FlushQueue, SetAction, Termios, Winsize};
use super::tty::TtyRecord;

/// Terminal ioctl requests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ioctl {
    /// `TIOCGWINSZ`
    GetWinsize,
    /// `TIOCSWINSZ`
    SetWinsize(Winsize),
    /// `TIOCSCTTY`
    SetCtty,
    /// `FIONREAD`
    InputPending,
    /// `TIOCLINUX` with its subcode
    Linux(u8),
    /// `TIOCPKT`
    Packet(bool),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoctlReply {
    Done,
    Winsize(Winsize),
    Count(usize),
    Byte(u8),
}

/// `TIOCLINUX` subcode returning the shift state.
pub const TIOCL_GETSHIFTSTATE: u8 = 6;

pub trait Fhandler: Send {
    fn name(&self) -> String;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn write(&mut self, buf: &[u8]) -> Result<usize>;
    fn ioctl(&mut self, req: Ioctl) -> Result<IoctlReply>;
    fn tcgetattr(&self) -> Result<Termios>;
    fn tcsetattr(&mut self, action: SetAction, t: &Termios) -> Result<()>;
    fn tcflush(&mut self, queue: FlushQueue) -> Result<()>;
    fn tcsetpgrp(&mut self, pgid: Pid) -> Result<()>;
    fn tcgetpgrp(&self) -> Result<Pid>;
    fn tcgetsid(&self) -> Result<Pid>;
    fn set_nonblocking(&mut self, nonblocking: bool);
}

/// State and helpers shared by every terminal fhandler.
pub struct TermiosBase {
    pub tty: Arc<TtyRecord>,
    pub procs: Arc<dyn ProcessTable>,
    /// Process the handle was opened by.
    pub pid: Pid,
    pub nonblocking: bool,
}

impl std::fmt::Debug for TermiosBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TermiosBase")
            .field("tty", &self.tty)
            .field("pid", &self.pid)
            .field("nonblocking", &self.nonblocking)
            .finish()
    }
}

impl TermiosBase {
    pub fn new(tty: Arc<TtyRecord>, procs: Arc<dyn ProcessTable>, pid: Pid) -> Self {
        Self { tty, procs, pid, nonblocking: false }
    }

    pub fn bg_check(&self, op: BgOp) -> Result<()> {
        bg_check(&self.tty, self.procs.as_ref(), self.pid, op)
    }

    pub fn tcgetattr(&self) -> Termios {
        self.tty.termios()
    }

    /// Store new attributes. FLUSHO is owned by the line discipline and kept.
    pub fn store_termios(&self, t: &Termios) {
        let mut state = self.tty.acquire();
        let flusho = state.ti.lflag & super::termios::LocalFlags::FLUSHO;
        state.ti = *t;
        state.ti.lflag.remove(super::termios::LocalFlags::FLUSHO);
        state.ti.lflag.insert(flusho);
    }

    pub fn tcsetpgrp(&self, pgid: Pid) -> Result<()> {
        self.bg_check(BgOp::Control)?;
        let mut state = self.tty.acquire();
        if pgid != 0 && !self.procs.pgrp_in_session(pgid, state.sid) {
            return Err(TtyError::Permission(format!(
                "pgid {} is not in session {}",
                pgid, state.sid
            )));
        }
        debug!("{}: foreground pgid {} -> {}", self.tty.name(), state.pgid, pgid);
        state.setpgid(pgid);
        Ok(())
    }

    pub fn tcgetpgrp(&self) -> Pid {
        self.tty.acquire().pgid
    }

    pub fn tcgetsid(&self) -> Result<Pid> {
        match self.tty.acquire().sid {
            0 => Err(TtyError::NotATty),
            sid => Ok(sid),
        }
    }

    /// `TIOCSCTTY`: make this terminal the caller's controlling terminal.
    pub fn set_ctty(&self) -> Result<()> {
        let sid = self.procs.sid(self.pid).unwrap_or(0);
        let pgid = self.procs.pgid(self.pid).unwrap_or(0);
        let mut state = self.tty.acquire();
        if state.sid != 0 && state.sid != sid {
            return Err(TtyError::Permission(format!(
                "{} is the controlling tty of session {}",
                state.ntty, state.sid
            )));
        }
        if state.sid == 0 {
            state.setsid(sid);
            state.setpgid(pgid);
        }
        self.procs.set_ctty(self.pid, Some(state.ntty));
        info!("{} is now the controlling tty of session {}", state.ntty, sid);
        Ok(())
    }

    /// What opening a terminal does for a session leader without one.
    pub fn maybe_set_ctty(&self) {
        let Some(sid) = self.procs.sid(self.pid) else {
            return;
        };
        if sid != self.pid || self.procs.ctty(self.pid).is_some() {
            return;
        }
        if self.tty.acquire().sid == 0 {
            let _ = self.set_ctty();
        }
    }

    pub fn winsize(&self) -> Winsize {
        self.tty.acquire().winsize
    }

    /// Store a new window size; the foreground group gets SIGWINCH on change.
    pub fn set_winsize(&self, ws: Winsize) {
        let pgid = {
            let mut state = self.tty.acquire();
            if state.winsize == ws {
                return;
            }
            state.winsize = ws;
            state.pgid
        };
        debug!("{}: window size {}x{}", self.tty.name(), ws.cols, ws.rows);
        self.procs.kill_pgrp(pgid, Signal::Winch);
    }

    /// True when a signal is waiting for the calling process.
    pub fn signal_pending(&self) -> bool {
        self.procs
            .signal_arrived(self.pid)
            .map_or(false, |ev| ev.is_set())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::process::{LocalProcessTable, ProcessInfo};
    use crate::core::tty::DeviceId;

    fn base(pid: Pid) -> (TermiosBase, Arc<LocalProcessTable>) {
        let procs = Arc::new(LocalProcessTable::new());
        procs.insert(ProcessInfo::new(100));
        procs.insert(ProcessInfo::new(200).parent(100).group(200).session(100));
        procs.insert(ProcessInfo::new(900));
        let tty = Arc::new(TtyRecord::new(DeviceId::pty(5)));
        (TermiosBase::new(tty, procs.clone(), pid), procs)
    }

    #[test]
    fn test_session_leader_acquires_ctty() {
        let (b, procs) = base(100);
        b.maybe_set_ctty();
        assert_eq!(b.tcgetsid().unwrap(), 100);
        assert_eq!(b.tcgetpgrp(), 100);
        assert_eq!(procs.ctty(100), Some(DeviceId::pty(5)));
    }

    #[test]
    fn test_tcgetsid_without_session() {
        let (b, _procs) = base(200);
        b.maybe_set_ctty();
        assert!(matches!(b.tcgetsid(), Err(TtyError::NotATty)));
    }

    #[test]
    fn test_tcsetpgrp_checks_session() {
        let (b, _procs) = base(100);
        b.set_ctty().unwrap();
        b.tcsetpgrp(200).unwrap();
        assert_eq!(b.tcgetpgrp(), 200);
        assert!(matches!(b.tcsetpgrp(900), Err(TtyError::Permission(_))));
    }

    #[test]
    fn test_set_ctty_refused_for_other_session() {
        let (b, procs) = base(100);
        b.set_ctty().unwrap();
        let other = TermiosBase::new(b.tty.clone(), procs, 900);
        assert!(matches!(other.set_ctty(), Err(TtyError::Permission(_))));
    }

    #[test]
    fn test_winsize_change_sends_sigwinch() {
        let (b, procs) = base(100);
        b.set_ctty().unwrap();
        b.set_winsize(Winsize::new(132, 43));
        assert_eq!(procs.delivered_to(100, Signal::Winch), 1);
        b.set_winsize(Winsize::new(132, 43));
        assert_eq!(procs.delivered_to(100, Signal::Winch), 1);
        assert_eq!(b.winsize().cols, 132);
    }
}

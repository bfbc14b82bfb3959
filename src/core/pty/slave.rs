//! Pty slave
//!
//! Opened by the program running on the terminal, usually in a process
//! unrelated to the master. Opening copies the master's slave-side pipe
//! handles into the caller's handle table, directly when the two share a
//! security session and through the broker otherwise.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use super::broker::BrokerClient;
use super::{master_alive_name, slave_alive_name, UnitObjects};
use crate::core::context::TtyContext;
use crate::core::error::{Result, TtyError};
use crate::core::fhandler::{Fhandler, Ioctl, IoctlReply, TermiosBase};
use crate::core::handles::{duplicate_handle, open_process, Access, HandleId, HandleTable};
use crate::core::ldisc::BgOp;
#[cfg(windows)]
use crate::core::handles::HandleObject;
#[cfg(windows)]
use crate::core::kernel;
#[cfg(windows)]
use crate::core::pipe::PipeMode;
use crate::core::pipe::{PipeReader, PipeWriter};
use crate::core::process::Pid;
#[cfg(windows)]
use crate::core::sync::shared_name;
use crate::core::sync::{wait_any, NamedEvent};
use crate::core::termios::{FlushQueue, SetAction, Termios, VMIN, VTIME};
use crate::core::tty::{PacketStatus, ReadStatus};

/// Longest single wait, so a dead master is noticed without a wakeup.
const WAIT_SLICE: Duration = Duration::from_millis(100);

pub struct TtySlave {
    unit: usize,
    ctx: Arc<TtyContext>,
    base: TermiosBase,
    objects: UnitObjects,
    handles: Arc<HandleTable>,
    ids: Vec<HandleId>,
    from_master: PipeReader,
    to_master: PipeWriter,
    alive: Option<Arc<NamedEvent>>,
    cancel: Arc<NamedEvent>,
}

impl std::fmt::Debug for TtySlave {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtySlave")
            .field("unit", &self.unit)
            .field("base", &self.base)
            .finish()
    }
}

/// Copy `wanted` handles of `master_pid` into `pid`'s table.
fn duplicate_from_master(
    ctx: &TtyContext,
    master_pid: Pid,
    pid: Pid,
    handles: &HandleTable,
    wanted: &[(HandleId, Access)],
) -> Result<Vec<HandleId>> {
    match open_process(ctx.namespace(), ctx.procs().as_ref(), pid, master_pid) {
        Ok(source) => {
            let mut ids = Vec::with_capacity(wanted.len());
            for &(id, access) in wanted {
                match duplicate_handle(&source, id, handles, access) {
                    Ok(new) => ids.push(new),
                    Err(e) => {
                        for new in ids {
                            let _ = handles.close(new);
                        }
                        return Err(TtyError::access(format!("duplicating handle {:#x}: {}", id, e)));
                    }
                }
            }
            Ok(ids)
        }
        Err(e) => {
            debug!("pid {}: direct duplication refused ({}), trying the broker", pid, e);
            let connector = ctx
                .broker()
                .ok_or_else(|| TtyError::access(format!("{}; no broker configured", e)))?;
            BrokerClient::new(connector)
                .duplicate(master_pid, pid, wanted)
                .map_err(|e| match e {
                    TtyError::AccessDenied(_) => e,
                    other => TtyError::access(other.to_string()),
                })
        }
    }
}

/// Copy the kernel pipe handles a master published in the tty record.
#[cfg(windows)]
fn duplicate_kernel_ends(
    master_pid: Pid,
    unit: usize,
    handles: &HandleTable,
    wanted: &[(HandleId, Access)],
) -> Result<Vec<HandleId>> {
    let [(from, from_access), (to, to_access)] = wanted else {
        return Err(TtyError::invalid("a slave opens exactly two pipe ends"));
    };
    let from = kernel::duplicate_from(master_pid, *from)?;
    let to = kernel::duplicate_from(master_pid, *to)?;
    let reader = PipeReader::from_kernel(kernel::PipeEnd::from_handle(
        shared_name("pipe.input", unit),
        PipeMode::Message,
        from,
    ));
    let writer = PipeWriter::from_kernel(kernel::PipeEnd::from_handle(
        shared_name("pipe.output", unit),
        PipeMode::Byte,
        to,
    ));
    debug!("pty{}: duplicated kernel pipes of pid {}", unit, master_pid);
    Ok(vec![
        handles.insert(HandleObject::PipeRead(reader), *from_access),
        handles.insert(HandleObject::PipeWrite(writer), *to_access),
    ])
}

impl TtySlave {
    /// Open `/dev/pty<unit>` for `pid`. `EACCES` when the unit has no live master.
    pub fn open(ctx: &Arc<TtyContext>, unit: usize, pid: Pid) -> Result<Self> {
        let tty = ctx.ttys().get(unit)?;
        let ns = ctx.namespace();
        let state = tty.snapshot();
        if !state.allocated || !ns.exists(&master_alive_name(unit)) {
            return Err(TtyError::access(format!("pty{} has no master", unit)));
        }
        let (Some(from), Some(to)) = (state.from_master, state.to_master) else {
            return Err(TtyError::access(format!("pty{} master has closed its pipes", unit)));
        };
        let objects = UnitObjects::open(ns, unit)?;
        let handles = ctx.handle_table(pid)?;
        let wanted = [
            (from, Access::GENERIC_READ | Access::SYNCHRONIZE),
            (to, Access::GENERIC_WRITE | Access::SYNCHRONIZE),
        ];
        #[cfg(windows)]
        let ids = if ns.is_machine() {
            duplicate_kernel_ends(state.master_pid, unit, &handles, &wanted)?
        } else {
            duplicate_from_master(ctx, state.master_pid, pid, &handles, &wanted)?
        };
        #[cfg(not(windows))]
        let ids = duplicate_from_master(ctx, state.master_pid, pid, &handles, &wanted)?;
        if ids.len() != wanted.len() {
            for &id in &ids {
                let _ = handles.close(id);
            }
            return Err(TtyError::access(format!("pty{}: got {} of {} handles", unit, ids.len(), wanted.len())));
        }
        let from_master = handles.pipe_reader(ids[0])?;
        let to_master = handles.pipe_writer(ids[1])?;

        let alive = ns.create_event(&slave_alive_name(unit), true, true)?;
        tty.acquire().was_opened = true;
        let base = TermiosBase::new(tty, ctx.procs().clone(), pid);
        base.maybe_set_ctty();
        info!("pty{}: slave opened by pid {}", unit, pid);

        Ok(Self {
            unit,
            ctx: ctx.clone(),
            base,
            objects,
            handles,
            ids,
            from_master,
            to_master,
            alive: Some(alive),
            cancel: Arc::new(NamedEvent::new(format!("cancel.pty{}.{}", unit, pid), true, false)),
        })
    }

    pub fn unit(&self) -> usize {
        self.unit
    }

    /// Event that, once set, makes blocked reads and writes return `Canceled`.
    pub fn cancel_event(&self) -> Arc<NamedEvent> {
        self.cancel.clone()
    }

    fn master_alive(&self) -> bool {
        self.ctx.namespace().exists(&master_alive_name(self.unit))
    }

    /// One message, or `None` when nothing is queued.
    fn try_read(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        let _guard = self.objects.input_mutex.acquire();
        match self.from_master.read(buf) {
            Ok(n) => {
                if self.from_master.peek().unwrap_or(0) > 0 {
                    // more for the next reader
                    self.objects.input_available.set();
                }
                Ok(Some(n))
            }
            Err(TtyError::WouldBlock) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Result of a read that found the master gone.
    fn master_gone(&self) -> Result<usize> {
        match self.base.tty.acquire().read_retval {
            ReadStatus::Error(errno) => Err(TtyError::io(format!("master failed with errno {}", errno))),
            _ => Ok(0),
        }
    }

    /// Wait for input, a signal or cancellation, until `deadline` at most.
    fn wait_input(&self, deadline: Option<Instant>) -> Result<()> {
        if self.cancel.is_set() {
            return Err(TtyError::Canceled);
        }
        if self.base.signal_pending() {
            return Err(TtyError::Interrupted);
        }
        let slice = match deadline {
            Some(d) => d.saturating_duration_since(Instant::now()).min(WAIT_SLICE),
            None => WAIT_SLICE,
        };
        let signal = self.base.procs.signal_arrived(self.base.pid);
        let mut events: Vec<&NamedEvent> = vec![&*self.objects.input_available, &*self.cancel];
        if let Some(signal) = signal.as_deref() {
            events.push(signal);
        }
        match wait_any(&events, Some(slice)) {
            Some(1) => Err(TtyError::Canceled),
            Some(2) => Err(TtyError::Interrupted),
            _ => Ok(()),
        }
    }

    fn read_canonical(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if let Some(n) = self.try_read(buf)? {
                return Ok(n);
            }
            if !self.master_alive() {
                return self.master_gone();
            }
            if self.base.nonblocking {
                return Err(TtyError::WouldBlock);
            }
            self.wait_input(None)?;
        }
    }

    fn read_raw(&mut self, buf: &mut [u8], ti: &Termios) -> Result<usize> {
        let vmin = (ti.cc[VMIN] as usize).min(buf.len());
        let vtime = Duration::from_millis(ti.cc[VTIME] as u64 * 100);
        let start = Instant::now();
        let mut last_byte = start;
        let mut total = 0;
        loop {
            while total < buf.len() {
                match self.try_read(&mut buf[total..])? {
                    Some(0) => return Ok(total),
                    Some(n) => {
                        total += n;
                        last_byte = Instant::now();
                    }
                    None => break,
                }
            }
            if total == buf.len() {
                return Ok(total);
            }
            let deadline = match (vmin, vtime.is_zero()) {
                (0, true) => return Ok(total),
                (_, true) if total >= vmin => return Ok(total),
                (_, true) => None,
                (0, false) if total > 0 => return Ok(total),
                (0, false) => Some(start + vtime),
                (_, false) if total >= vmin => return Ok(total),
                (_, false) if total > 0 => Some(last_byte + vtime),
                (_, false) => None,
            };
            if deadline.map_or(false, |d| Instant::now() >= d) {
                return Ok(total);
            }
            if !self.master_alive() {
                return if total > 0 { Ok(total) } else { self.master_gone() };
            }
            if self.base.nonblocking {
                return if total > 0 { Ok(total) } else { Err(TtyError::WouldBlock) };
            }
            match self.wait_input(deadline) {
                Ok(()) => {}
                Err(TtyError::Interrupted) if total > 0 => return Ok(total),
                Err(e) => return Err(e),
            }
        }
    }
}

impl Fhandler for TtySlave {
    fn name(&self) -> String {
        format!("/dev/pty{}", self.unit)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.base.bg_check(BgOp::Read)?;
        if buf.is_empty() {
            return Ok(0);
        }
        let ti = self.base.tcgetattr();
        if ti.canonical() {
            self.read_canonical(buf)
        } else {
            self.read_raw(buf, &ti)
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.base.bg_check(BgOp::Write)?;
        let tty = self.base.tty.clone();
        let poll = self.ctx.config().tty.poll_interval();
        let mut done = 0;
        while done < buf.len() {
            // None: still stopped by VSTOP after one poll interval
            let written = match tty.acquire_for_output_timeout(poll) {
                Some(_state) => match self.to_master.write(&buf[done..]) {
                    Ok(n) => Some(n),
                    Err(TtyError::WouldBlock) => Some(0),
                    Err(e) if done > 0 => {
                        debug!("pty{}: write cut short: {}", self.unit, e);
                        return Ok(done);
                    }
                    Err(e) => return Err(e),
                },
                None => None,
            };
            if let Some(n) = written.filter(|&n| n > 0) {
                done += n;
                continue;
            }
            if self.base.nonblocking {
                return if done > 0 { Ok(done) } else { Err(TtyError::WouldBlock) };
            }
            if self.cancel.is_set() {
                return Err(TtyError::Canceled);
            }
            if self.base.signal_pending() {
                return if done > 0 { Ok(done) } else { Err(TtyError::Interrupted) };
            }
            if !self.master_alive() {
                return if done > 0 { Ok(done) } else { Err(TtyError::io("pty master closed")) };
            }
            if written.is_some() {
                thread::sleep(poll);
            }
        }
        Ok(done)
    }

    fn ioctl(&mut self, req: Ioctl) -> Result<IoctlReply> {
        let timeout = self.ctx.config().tty.ioctl_timeout();
        let served = self.objects.ioctl.is_served();
        match req {
            Ioctl::GetWinsize => {
                if served {
                    match self.objects.ioctl.call(req, timeout) {
                        Ok(reply) => return Ok(reply),
                        Err(e) => warn!("pty{}: TIOCGWINSZ via master failed: {}", self.unit, e),
                    }
                }
                Ok(IoctlReply::Winsize(self.base.winsize()))
            }
            Ioctl::SetWinsize(ws) => {
                self.base.bg_check(BgOp::Control)?;
                if served {
                    self.objects.ioctl.call(req, timeout)?;
                }
                self.base.set_winsize(ws);
                Ok(IoctlReply::Done)
            }
            Ioctl::SetCtty => {
                self.base.set_ctty()?;
                Ok(IoctlReply::Done)
            }
            Ioctl::InputPending => Ok(IoctlReply::Count(self.from_master.peek().unwrap_or(0))),
            Ioctl::Linux(_) if served => self.objects.ioctl.call(req, timeout),
            Ioctl::Linux(sub) => Err(TtyError::invalid(format!("TIOCLINUX subcode {} without a console", sub))),
            Ioctl::Packet(_) => Err(TtyError::invalid("TIOCPKT on a pty slave")),
        }
    }

    fn tcgetattr(&self) -> Result<Termios> {
        Ok(self.base.tcgetattr())
    }

    fn tcsetattr(&mut self, action: SetAction, t: &Termios) -> Result<()> {
        self.base.bg_check(BgOp::Control)?;
        if action != SetAction::Now {
            let timeout = self.ctx.config().tty.ioctl_timeout();
            if !self.to_master.wait_drained(timeout) {
                debug!("pty{}: output not drained within {:?}", self.unit, timeout);
            }
        }
        if action == SetAction::Flush {
            let _guard = self.objects.input_mutex.acquire();
            self.from_master.discard();
        }
        self.base.store_termios(t);
        Ok(())
    }

    fn tcflush(&mut self, queue: FlushQueue) -> Result<()> {
        self.base.bg_check(BgOp::Control)?;
        let mut bits = PacketStatus::empty();
        if queue.input() {
            let _guard = self.objects.input_mutex.acquire();
            self.from_master.discard();
            bits |= PacketStatus::FLUSHREAD;
        }
        if queue.output() {
            self.to_master.discard();
            bits |= PacketStatus::FLUSHWRITE;
        }
        let mut state = self.base.tty.acquire();
        if state.packet_mode {
            state.packet |= bits;
        }
        Ok(())
    }

    fn tcsetpgrp(&mut self, pgid: Pid) -> Result<()> {
        self.base.tcsetpgrp(pgid)
    }

    fn tcgetpgrp(&self) -> Result<Pid> {
        Ok(self.base.tcgetpgrp())
    }

    fn tcgetsid(&self) -> Result<Pid> {
        self.base.tcgetsid()
    }

    fn set_nonblocking(&mut self, nonblocking: bool) {
        self.base.nonblocking = nonblocking;
    }
}

impl Drop for TtySlave {
    fn drop(&mut self) {
        for &id in &self.ids {
            let _ = self.handles.close(id);
        }
        let ns = self.ctx.namespace();
        let release = {
            let _state = self.base.tty.acquire();
            self.alive = None;
            !ns.exists(&slave_alive_name(self.unit)) && !ns.exists(&master_alive_name(self.unit))
        };
        info!("pty{}: slave closed by pid {}", self.unit, self.base.pid);
        if release {
            self.ctx.ttys().release(self.unit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::process::{LocalProcessTable, ProcessInfo, ProcessTable, Signal};
    use crate::core::pty::broker::{BrokerServer, LoopbackConnector};
    use crate::core::pty::PtyMaster;
    use crate::core::termios::{LocalFlags, Winsize};
    use crate::core::tty::DeviceId;

    struct Rig {
        ctx: Arc<TtyContext>,
        procs: Arc<LocalProcessTable>,
        master: PtyMaster,
        slave: TtySlave,
    }

    /// Master in pid 100; slave opened by session leader 200, whose
    /// child 201 sits in a background group.
    fn rig() -> Rig {
        let procs = Arc::new(LocalProcessTable::new());
        procs.insert(ProcessInfo::new(100));
        procs.insert(ProcessInfo::new(200));
        procs.insert(ProcessInfo::new(201).parent(200).group(201).session(200));
        let ctx = TtyContext::new(Config::default(), procs.clone());
        let master = PtyMaster::open(&ctx, 100).unwrap();
        let slave = TtySlave::open(&ctx, master.unit(), 200).unwrap();
        Rig { ctx, procs, master, slave }
    }

    #[test]
    fn test_open_makes_controlling_tty() {
        let r = rig();
        assert_eq!(r.procs.ctty(200), Some(DeviceId::pty(r.master.unit())));
        assert_eq!(r.slave.tcgetsid().unwrap(), 200);
        assert_eq!(r.slave.tcgetpgrp().unwrap(), 200);
    }

    #[test]
    fn test_open_without_master_is_refused() {
        let r = rig();
        let unused = r.master.unit() + 1;
        assert!(matches!(TtySlave::open(&r.ctx, unused, 200), Err(TtyError::AccessDenied(_))));
    }

    #[test]
    fn test_master_line_reaches_slave_with_echo() {
        let mut r = rig();
        assert_eq!(r.master.write(b"echo hi\n").unwrap(), 8);
        let mut buf = [0u8; 32];
        let n = r.slave.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"echo hi\n");
        let n = r.master.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"echo hi\r\n");
    }

    #[test]
    fn test_one_line_per_read() {
        let mut r = rig();
        r.master.write(b"one\ntwo\n").unwrap();
        let mut buf = [0u8; 32];
        let n = r.slave.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"one\n");
        let n = r.slave.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"two\n");
    }

    #[test]
    fn test_slave_output_is_post_processed() {
        let mut r = rig();
        assert_eq!(r.slave.write(b"a\nb").unwrap(), 3);
        let mut buf = [0u8; 16];
        let n = r.master.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"a\r\nb");
    }

    #[test]
    fn test_raw_read_collects_single_bytes() {
        let mut r = rig();
        let mut t = r.slave.tcgetattr().unwrap();
        t.make_raw();
        r.slave.tcsetattr(SetAction::Now, &t).unwrap();
        r.master.write(b"xy").unwrap();
        let mut buf = [0u8; 8];
        let n = r.slave.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"xy");
    }

    #[test]
    fn test_nonblocking_read_would_block() {
        let mut r = rig();
        r.slave.set_nonblocking(true);
        let mut buf = [0u8; 8];
        assert!(matches!(r.slave.read(&mut buf), Err(TtyError::WouldBlock)));
    }

    #[test]
    fn test_background_write_with_tostop() {
        let mut r = rig();
        let mut t = r.slave.tcgetattr().unwrap();
        t.lflag.insert(LocalFlags::TOSTOP);
        r.slave.tcsetattr(SetAction::Now, &t).unwrap();
        let mut bg = TtySlave::open(&r.ctx, r.master.unit(), 201).unwrap();
        r.procs.set_ctty(201, Some(DeviceId::pty(r.master.unit())));

        assert!(matches!(bg.write(b"hello"), Err(TtyError::Interrupted)));
        assert!(matches!(bg.write(b"hello"), Err(TtyError::Interrupted)));
        assert_eq!(r.procs.delivered_to(201, Signal::Ttou), 1);

        r.master.set_nonblocking(true);
        let mut buf = [0u8; 16];
        assert!(matches!(r.master.read(&mut buf), Err(TtyError::WouldBlock)));
    }

    #[test]
    fn test_background_read_raises_sigttin() {
        let r = rig();
        let mut bg = TtySlave::open(&r.ctx, r.master.unit(), 201).unwrap();
        r.procs.set_ctty(201, Some(DeviceId::pty(r.master.unit())));
        let mut buf = [0u8; 4];
        assert!(matches!(bg.read(&mut buf), Err(TtyError::Interrupted)));
        assert_eq!(r.procs.delivered_to(201, Signal::Ttin), 1);
        // writes are fine without TOSTOP
        assert_eq!(bg.write(b"ok").unwrap(), 2);
    }

    #[test]
    fn test_slave_sees_eof_when_master_closes() {
        let mut r = rig();
        let unit = r.master.unit();
        drop(r.master);
        let mut buf = [0u8; 8];
        assert_eq!(r.slave.read(&mut buf).unwrap(), 0);
        assert!(matches!(r.slave.write(b"late"), Err(TtyError::Io(_))));
        assert_eq!(r.ctx.ttys().in_use(), 1);
        drop(r.slave);
        assert_eq!(r.ctx.ttys().in_use(), 0);
        assert!(TtySlave::open(&r.ctx, unit, 200).is_err());
    }

    #[test]
    fn test_master_sees_eof_when_slaves_close() {
        let mut r = rig();
        drop(r.slave);
        let mut buf = [0u8; 8];
        assert_eq!(r.master.read(&mut buf).unwrap(), 0);
        assert_eq!(r.ctx.ttys().in_use(), 1);
    }

    #[test]
    fn test_packet_mode_reports_flush() {
        let mut r = rig();
        r.master.ioctl(Ioctl::Packet(true)).unwrap();
        r.slave.tcflush(FlushQueue::Input).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(r.master.read(&mut buf).unwrap(), 1);
        assert_eq!(buf[0], PacketStatus::FLUSHREAD.bits());
        r.slave.write(b"ok").unwrap();
        let n = r.master.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"\0ok");
    }

    #[test]
    fn test_winsize_without_console_master() {
        let mut r = rig();
        assert_eq!(r.slave.ioctl(Ioctl::GetWinsize).unwrap(), IoctlReply::Winsize(Winsize::new(80, 24)));
        r.master.ioctl(Ioctl::SetWinsize(Winsize::new(100, 40))).unwrap();
        assert_eq!(r.slave.ioctl(Ioctl::GetWinsize).unwrap(), IoctlReply::Winsize(Winsize::new(100, 40)));
        assert_eq!(r.procs.delivered_to(200, Signal::Winch), 1);
        assert!(matches!(r.slave.ioctl(Ioctl::Linux(6)), Err(TtyError::InvalidArgument(_))));
    }

    #[test]
    fn test_input_pending_counts_queued_bytes() {
        let mut r = rig();
        r.master.write(b"abc\n").unwrap();
        assert_eq!(r.slave.ioctl(Ioctl::InputPending).unwrap(), IoctlReply::Count(4));
    }

    #[test]
    fn test_cancel_wakes_blocked_reader() {
        let mut r = rig();
        let cancel = r.slave.cancel_event();
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            cancel.set();
        });
        let mut buf = [0u8; 8];
        assert!(matches!(r.slave.read(&mut buf), Err(TtyError::Canceled)));
        waker.join().unwrap();
    }

    #[test]
    fn test_cancel_wakes_writer_stopped_by_xoff() {
        let mut r = rig();
        r.master.tty().stop_output();
        let cancel = r.slave.cancel_event();
        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            cancel.set();
        });
        assert!(matches!(r.slave.write(b"x"), Err(TtyError::Canceled)));
        waker.join().unwrap();
        assert!(r.master.tty().output_stopped());
    }

    #[test]
    fn test_signal_wakes_writer_stopped_by_xoff() {
        let mut r = rig();
        r.master.tty().stop_output();
        let procs = r.procs.clone();
        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            procs.sig_send(200, Signal::Int);
        });
        assert!(matches!(r.slave.write(b"x"), Err(TtyError::Interrupted)));
        sender.join().unwrap();
    }

    #[test]
    fn test_nonblocking_write_under_xoff_would_block() {
        let mut r = rig();
        r.master.tty().stop_output();
        r.slave.set_nonblocking(true);
        assert!(matches!(r.slave.write(b"x"), Err(TtyError::WouldBlock)));
    }

    #[test]
    fn test_vstart_releases_stopped_writer() {
        let mut r = rig();
        r.master.write(b"\x13").unwrap();
        assert!(r.master.tty().output_stopped());

        let mut slave = r.slave;
        let writer = thread::spawn(move || slave.write(b"go"));
        thread::sleep(Duration::from_millis(50));
        assert!(!writer.is_finished());

        r.master.write(b"\x11").unwrap();
        assert_eq!(writer.join().unwrap().unwrap(), 2);
        let mut buf = [0u8; 8];
        let n = r.master.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"go");
    }

    #[test]
    fn test_other_session_goes_through_broker() {
        let r = rig();
        r.procs.insert(ProcessInfo::new(300).logon_session(2));
        assert!(matches!(
            TtySlave::open(&r.ctx, r.master.unit(), 300),
            Err(TtyError::AccessDenied(_))
        ));

        let server = BrokerServer::new(r.ctx.namespace().clone(), r.ctx.procs().clone());
        r.ctx.set_broker(Arc::new(LoopbackConnector::new(Arc::new(server))));
        let mut slave = TtySlave::open(&r.ctx, r.master.unit(), 300).unwrap();
        assert_eq!(slave.write(b"via broker").unwrap(), 10);
    }

    #[test]
    fn test_broker_refuses_other_user() {
        let r = rig();
        r.procs.insert(ProcessInfo::new(301).logon_session(2).user(0));
        let server = BrokerServer::new(r.ctx.namespace().clone(), r.ctx.procs().clone());
        r.ctx.set_broker(Arc::new(LoopbackConnector::new(Arc::new(server))));
        assert!(matches!(
            TtySlave::open(&r.ctx, r.master.unit(), 301),
            Err(TtyError::AccessDenied(_))
        ));
    }
}

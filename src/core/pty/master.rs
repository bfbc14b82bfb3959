//! Pure-pipe pty master
//!
//! No console and no worker threads: `write` runs the line discipline on the
//! caller's thread and `read` applies output processing to whatever the
//! slaves wrote. This is the `openpty` end a terminal emulator drives.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::debug;

use super::{accept_into, MasterUnit, UnitObjects};
use crate::core::context::TtyContext;
use crate::core::error::{Result, TtyError};
use crate::core::fhandler::{Fhandler, Ioctl, IoctlReply, TermiosBase};
use crate::core::ldisc::{AcceptStatus, LineDiscipline, LineEditStatus, OutputProcessor, TermiosIo};
use crate::core::pipe::PipeWriter;
use crate::core::process::Pid;
use crate::core::termios::{FlushQueue, SetAction, Termios};
use crate::core::tty::{PacketStatus, TtyRecord, TIOCPKT_DATA};

/// Echo goes back to the master's own reader through the output pipe.
struct MasterIo<'a> {
    tty: &'a TtyRecord,
    echo: &'a PipeWriter,
    to_slave: &'a PipeWriter,
    objects: &'a UnitObjects,
}

impl TermiosIo for MasterIo<'_> {
    fn doecho(&mut self, bytes: &[u8]) {
        let _state = self.tty.acquire();
        if let Err(e) = self.echo.write(bytes) {
            debug!("{}: echo dropped: {}", self.echo.name(), e);
        }
    }

    fn accept_input(&mut self, input: &[u8]) -> AcceptStatus {
        accept_into(self.to_slave, self.objects, input)
    }
}

pub struct PtyMaster {
    unit: MasterUnit,
    base: TermiosBase,
    ldisc: LineDiscipline,
    echo: PipeWriter,
    opost: OutputProcessor,
    poll: Duration,
}

impl std::fmt::Debug for PtyMaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyMaster").field("unit", &self.unit).finish()
    }
}

impl PtyMaster {
    pub fn open(ctx: &Arc<TtyContext>, pid: Pid) -> Result<Self> {
        let unit = MasterUnit::open(ctx, pid)?;
        let to_master = unit.tty.acquire().to_master.ok_or(TtyError::BadHandle)?;
        let echo = ctx.handle_table(pid)?.pipe_writer(to_master)?;
        let base = TermiosBase::new(unit.tty.clone(), ctx.procs().clone(), pid);
        let ldisc = LineDiscipline::new(unit.tty.clone(), ctx.procs().clone());
        Ok(Self {
            unit,
            base,
            ldisc,
            echo,
            opost: OutputProcessor::new(),
            poll: ctx.config().tty.poll_interval(),
        })
    }

    pub fn unit(&self) -> usize {
        self.unit.unit
    }

    pub fn tty(&self) -> &Arc<TtyRecord> {
        &self.unit.tty
    }

    /// Pending `TIOCPKT` status, cleared as it is reported.
    fn take_packet_status(&self) -> Option<u8> {
        let mut state = self.unit.tty.acquire();
        if !state.packet_mode || state.packet.is_empty() {
            return None;
        }
        let bits = state.packet.bits();
        state.packet = PacketStatus::empty();
        Some(bits)
    }

    fn packet_mode(&self) -> bool {
        self.unit.tty.acquire().packet_mode
    }

    fn read_output(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let ti = self.base.tcgetattr();
            if self.opost.has_leftover() {
                return Ok(self.opost.fill(&ti, &[], buf));
            }
            let avail = match self.unit.from_slave.peek() {
                Ok(n) => n,
                Err(_) => return Ok(0),
            };
            if avail > 0 {
                let mut raw = vec![0u8; avail.min(buf.len())];
                let n = match self.unit.from_slave.read(&mut raw) {
                    Ok(n) => n,
                    Err(TtyError::WouldBlock) => continue,
                    Err(e) => return Err(e),
                };
                let filled = self.opost.fill(&ti, &raw[..n], buf);
                if filled > 0 {
                    return Ok(filled);
                }
                // everything was discarded under FLUSHO
                continue;
            }
            if self.unit.slaves_gone() {
                debug!("pty{}: no slave left, EOF", self.unit.unit);
                return Ok(0);
            }
            if self.base.nonblocking {
                return Err(TtyError::WouldBlock);
            }
            if self.base.signal_pending() {
                return Err(TtyError::Interrupted);
            }
            self.unit.from_slave.wait_readable(Some(self.poll * 10));
        }
    }
}

impl Fhandler for PtyMaster {
    fn name(&self) -> String {
        format!("/dev/ptym{}", self.unit.unit)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some(status) = self.take_packet_status() {
            buf[0] = status;
            return Ok(1);
        }
        if !self.packet_mode() {
            return self.read_output(buf);
        }
        if buf.len() < 2 {
            return Err(TtyError::invalid("packet mode read needs two bytes"));
        }
        buf[0] = TIOCPKT_DATA;
        let n = self.read_output(&mut buf[1..])?;
        Ok(if n == 0 { 0 } else { n + 1 })
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let mut io = MasterIo {
            tty: &self.unit.tty,
            echo: &self.echo,
            to_slave: &self.unit.to_slave,
            objects: &self.unit.objects,
        };
        let mut done = 0;
        loop {
            let r = self.ldisc.line_edit(&buf[done..], &mut io);
            done += r.consumed;
            match r.status {
                LineEditStatus::PipeFull if done > 0 => return Ok(done),
                LineEditStatus::PipeFull if self.base.nonblocking => return Err(TtyError::WouldBlock),
                LineEditStatus::PipeFull => thread::sleep(self.poll),
                LineEditStatus::Error if done == 0 => return Err(TtyError::io("input pipe closed")),
                _ => return Ok(done),
            }
        }
    }

    fn ioctl(&mut self, req: Ioctl) -> Result<IoctlReply> {
        match req {
            Ioctl::Packet(on) => {
                let mut state = self.unit.tty.acquire();
                state.packet_mode = on;
                state.packet = PacketStatus::empty();
                debug!("pty{}: packet mode {}", self.unit.unit, on);
                Ok(IoctlReply::Done)
            }
            Ioctl::GetWinsize => Ok(IoctlReply::Winsize(self.base.winsize())),
            Ioctl::SetWinsize(ws) => {
                self.base.set_winsize(ws);
                Ok(IoctlReply::Done)
            }
            Ioctl::InputPending => {
                let pending = self.unit.from_slave.peek().unwrap_or(0);
                Ok(IoctlReply::Count(pending))
            }
            Ioctl::SetCtty => Err(TtyError::invalid("TIOCSCTTY on a pty master")),
            Ioctl::Linux(sub) => Err(TtyError::invalid(format!("TIOCLINUX subcode {}", sub))),
        }
    }

    fn tcgetattr(&self) -> Result<Termios> {
        Ok(self.base.tcgetattr())
    }

    fn tcsetattr(&mut self, action: SetAction, t: &Termios) -> Result<()> {
        if action == SetAction::Flush {
            self.tcflush(FlushQueue::Input)?;
        }
        self.base.store_termios(t);
        Ok(())
    }

    fn tcflush(&mut self, queue: FlushQueue) -> Result<()> {
        let mut bits = PacketStatus::empty();
        if queue.input() {
            self.ldisc.flush_input();
            let _guard = self.unit.objects.input_mutex.acquire();
            self.unit.to_slave.discard();
            bits |= PacketStatus::FLUSHREAD;
        }
        if queue.output() {
            self.opost.discard();
            self.unit.from_slave.discard();
            bits |= PacketStatus::FLUSHWRITE;
        }
        let mut state = self.unit.tty.acquire();
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

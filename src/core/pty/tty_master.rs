//! Console-backed pty master
//!
//! The process owning a real console runs one of these. Three worker threads
//! live as long as the master does:
//!
//! - `input`: console events through the line discipline into the input pipe
//! - `output`: whatever the slaves wrote, through OPOST onto the console
//! - `ioctl`: console requests slaves post on the ioctl channel
//!
//! Every worker wakes at least once per poll interval, so dropping the master
//! stops them promptly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use super::{accept_into, MasterUnit};
use crate::core::console::input::{debounce_ctrl_c, ConsoleEvent};
use crate::core::console::Console;
use crate::core::context::TtyContext;
use crate::core::error::{Result, TtyError};
use crate::core::fhandler::{Ioctl, IoctlReply, TermiosBase, TIOCL_GETSHIFTSTATE};
use crate::core::ldisc::{AcceptStatus, LineDiscipline, LineEditStatus, OutputProcessor, TermiosIo};
use crate::core::process::Pid;
use crate::core::termios::OutputFlags;
use crate::core::tty::TtyRecord;

struct Shared {
    unit: MasterUnit,
    console: Arc<Console>,
    base: TermiosBase,
    running: AtomicBool,
    poll: Duration,
    ctrl_c_slop: Duration,
}

impl Shared {
    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

/// Echo goes straight to the console, accepted input to the slaves.
struct ConsoleIo<'a> {
    shared: &'a Shared,
    onlcr: bool,
}

impl TermiosIo for ConsoleIo<'_> {
    fn doecho(&mut self, bytes: &[u8]) {
        let _state = self.shared.unit.tty.acquire();
        if let Err(e) = self.shared.console.write_output(bytes, self.onlcr) {
            warn!("pty{}: echo failed: {}", self.shared.unit.unit, e);
        }
    }

    fn accept_input(&mut self, input: &[u8]) -> AcceptStatus {
        accept_into(&self.shared.unit.to_slave, &self.shared.unit.objects, input)
    }
}

pub struct TtyMaster {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for TtyMaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtyMaster")
            .field("unit", &self.shared.unit)
            .field("console", &self.shared.console)
            .field("workers", &self.workers.len())
            .finish()
    }
}

impl TtyMaster {
    /// Allocate a pty for `pid` and start pumping it to and from `console`.
    pub fn open(ctx: &Arc<TtyContext>, pid: Pid, console: Arc<Console>) -> Result<Self> {
        let unit = MasterUnit::open(ctx, pid)?;
        let base = TermiosBase::new(unit.tty.clone(), ctx.procs().clone(), pid);
        match console.size() {
            Ok(ws) => unit.tty.acquire().winsize = ws,
            Err(e) => warn!("pty{}: console size unknown: {}", unit.unit, e),
        }
        let tty = &ctx.config().tty;
        let shared = Arc::new(Shared {
            unit,
            console,
            base,
            running: AtomicBool::new(true),
            poll: tty.poll_interval(),
            ctrl_c_slop: tty.ctrl_c_slop(),
        });

        let mut master = Self { shared, workers: Vec::with_capacity(3) };
        master.spawn("input", process_input)?;
        master.spawn("output", process_output)?;
        master.spawn("ioctl", process_ioctl)?;
        info!("pty{}: console master started", master.unit());
        Ok(master)
    }

    fn spawn(&mut self, what: &str, work: fn(Arc<Shared>)) -> Result<()> {
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name(format!("pty{}-{}", self.unit(), what))
            .spawn(move || work(shared))
            .map_err(|source| TtyError::Resource { what: "pty worker thread", source })?;
        self.workers.push(handle);
        Ok(())
    }

    pub fn unit(&self) -> usize {
        self.shared.unit.unit
    }

    pub fn tty(&self) -> &Arc<TtyRecord> {
        &self.shared.unit.tty
    }

    pub fn console(&self) -> &Arc<Console> {
        &self.shared.console
    }

    /// True while at least one slave has the unit open.
    pub fn has_slaves(&self) -> bool {
        self.shared.unit.slave_alive()
    }

    /// A slave was attached once and none is left.
    pub fn slaves_gone(&self) -> bool {
        self.shared.unit.slaves_gone()
    }
}

impl Drop for TtyMaster {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.unit.objects.ioctl.set_serving(false);
        for worker in self.workers.drain(..) {
            let name = worker.thread().name().unwrap_or("pty worker").to_string();
            if worker.join().is_err() {
                error!("{} panicked", name);
            }
        }
        info!("pty{}: console master stopped", self.unit());
    }
}

/// Console input through the line discipline into the input pipe.
fn process_input(shared: Arc<Shared>) {
    let unit = shared.unit.unit;
    debug!("pty{}: input thread running", unit);
    let mut ldisc = LineDiscipline::new(shared.unit.tty.clone(), shared.base.procs.clone());
    while shared.running() {
        let events = match shared.console.read_events(Some(shared.poll)) {
            Ok(events) => events,
            Err(e) => {
                error!("pty{}: console input failed: {}", unit, e);
                break;
            }
        };
        for ev in events {
            match ev {
                ConsoleEvent::Response(bytes) => {
                    if accept_into(&shared.unit.to_slave, &shared.unit.objects, &bytes) != AcceptStatus::Accepted {
                        debug!("pty{}: dropped {} response bytes", unit, bytes.len());
                    }
                }
                ConsoleEvent::Resize(ws) => shared.base.set_winsize(ws),
                ConsoleEvent::Input(bytes) => {
                    if debounce_ctrl_c(&shared.unit.tty, &bytes, shared.ctrl_c_slop) {
                        continue;
                    }
                    let onlcr = shared.base.tcgetattr().oflag.contains(OutputFlags::OPOST | OutputFlags::ONLCR);
                    let mut io = ConsoleIo { shared: &shared, onlcr };
                    let mut rest = &bytes[..];
                    while !rest.is_empty() && shared.running() {
                        let r = ldisc.line_edit(rest, &mut io);
                        rest = &rest[r.consumed..];
                        match r.status {
                            // the rest of the event went with the signal
                            LineEditStatus::Signalled => break,
                            LineEditStatus::PipeFull => thread::sleep(shared.poll),
                            LineEditStatus::Error => {
                                debug!("pty{}: input pipe closed", unit);
                                break;
                            }
                            _ if r.consumed == 0 => break,
                            _ => {}
                        }
                    }
                }
            }
        }
    }
    debug!("pty{}: input thread done", unit);
}

/// Slave output through OPOST onto the console.
fn process_output(shared: Arc<Shared>) {
    let unit = shared.unit.unit;
    debug!("pty{}: output thread running", unit);
    let mut opost = OutputProcessor::new();
    let mut raw = vec![0u8; 4096];
    let mut out = Vec::with_capacity(raw.len() * 2);
    while shared.running() {
        match shared.unit.from_slave.peek() {
            Ok(0) => {
                thread::sleep(shared.poll);
                continue;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("pty{}: output pipe: {}", unit, e);
                break;
            }
        }

        // wait out ^S without missing shutdown
        let state = loop {
            if !shared.running() {
                return;
            }
            if let Some(state) = shared.unit.tty.acquire_for_output_timeout(shared.poll) {
                break state;
            }
        };
        let ti = state.ti;
        let n = match shared.unit.from_slave.read(&mut raw) {
            Ok(n) => n,
            Err(TtyError::WouldBlock) => continue,
            Err(e) => {
                warn!("pty{}: reading slave output: {}", unit, e);
                break;
            }
        };
        out.clear();
        opost.process(&ti, &raw[..n], &mut out);
        trace!("pty{}: {} bytes out, {} to console", unit, n, out.len());
        if !out.is_empty() {
            if let Err(e) = shared.console.write_output(&out, false) {
                error!("pty{}: console write failed: {}", unit, e);
                break;
            }
        }
        drop(state);
    }
    debug!("pty{}: output thread done", unit);
}

/// Serve slave requests that need the console.
fn process_ioctl(shared: Arc<Shared>) {
    let unit = shared.unit.unit;
    let channel = shared.unit.objects.ioctl.clone();
    channel.set_serving(true);
    debug!("pty{}: ioctl thread running", unit);
    while shared.running() {
        channel.serve_one(shared.poll * 10, |req| console_ioctl(&shared, req));
    }
    channel.set_serving(false);
    debug!("pty{}: ioctl thread done", unit);
}

fn console_ioctl(shared: &Shared, req: Ioctl) -> Result<IoctlReply> {
    match req {
        Ioctl::GetWinsize => {
            let ws = shared.console.size()?;
            shared.base.set_winsize(ws);
            Ok(IoctlReply::Winsize(ws))
        }
        Ioctl::SetWinsize(ws) => {
            shared.console.resize(ws)?;
            Ok(IoctlReply::Done)
        }
        Ioctl::Linux(TIOCL_GETSHIFTSTATE) => Ok(IoctlReply::Byte(shared.console.modifiers())),
        Ioctl::Linux(sub) => Err(TtyError::invalid(format!("TIOCLINUX subcode {}", sub))),
        other => Err(TtyError::invalid(format!("{:?} is not a console request", other))),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::Sender;
    use std::time::Instant;

    use super::*;
    use crate::config::Config;
    use crate::core::console::device::*;
    use crate::core::console::screen::{ScreenConsole, ScreenInput};
    use crate::core::console::state::Charset;
    use crate::core::fhandler::Fhandler;
    use crate::core::process::{LocalProcessTable, ProcessInfo};
    use crate::core::pty::TtySlave;
    use crate::core::termios::Winsize;

    struct Rig {
        ctx: Arc<TtyContext>,
        screen: ScreenConsole,
        keys: Sender<InputRecord>,
        master: TtyMaster,
    }

    fn rig() -> Rig {
        let procs = Arc::new(LocalProcessTable::new());
        procs.insert(ProcessInfo::new(100));
        procs.insert(ProcessInfo::new(200));
        let ctx = TtyContext::new(Config::default(), procs);
        let screen = ScreenConsole::new(40, 10);
        let (keys, input) = ScreenInput::channel();
        let dev = screen.clone();
        let console = Console::attach(ctx.namespace(), 0, Charset::Utf8, move || {
            Ok((Box::new(dev) as Box<dyn ConsoleDevice>, Box::new(input) as Box<dyn ConsoleInput>))
        })
        .unwrap();
        let master = TtyMaster::open(&ctx, 100, console).unwrap();
        Rig { ctx, screen, keys, master }
    }

    fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_slave_output_reaches_console() {
        let r = rig();
        let mut slave = TtySlave::open(&r.ctx, r.master.unit(), 200).unwrap();
        assert_eq!(slave.write(b"\x1b[31mHELLO\x1b[0m\n").unwrap(), 15);
        wait_for("HELLO", || r.screen.row_text(0).trim_end() == "HELLO");
        wait_for("cursor on the next row", || r.screen.cursor() == (0, 1));
        assert_eq!(r.screen.cell(0, 0).attr & 0x0f, FOREGROUND_RED);
        assert_eq!(r.screen.cell(4, 0).attr & 0x0f, FOREGROUND_RED);
        assert_eq!(r.screen.cell(5, 0).attr, DEFAULT_ATTRIBUTE);
    }

    #[test]
    fn test_typed_line_reaches_slave() {
        let r = rig();
        let mut slave = TtySlave::open(&r.ctx, r.master.unit(), 200).unwrap();
        for c in "ls\r".chars() {
            r.keys.send(InputRecord::char_key(c, ControlKeyState::empty())).unwrap();
        }
        let mut buf = [0u8; 16];
        let n = slave.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"ls\n");
        wait_for("echo", || r.screen.row_text(0).trim_end() == "ls");
    }

    #[test]
    fn test_winsize_comes_from_console() {
        let r = rig();
        let mut slave = TtySlave::open(&r.ctx, r.master.unit(), 200).unwrap();
        wait_for("ioctl thread", || r.master.shared.unit.objects.ioctl.is_served());
        assert_eq!(slave.ioctl(Ioctl::GetWinsize).unwrap(), IoctlReply::Winsize(Winsize::new(40, 10)));
        slave.ioctl(Ioctl::SetWinsize(Winsize::new(50, 12))).unwrap();
        assert_eq!(r.screen.buffer().cols, 50);
        assert_eq!(r.master.tty().acquire().winsize, Winsize::new(50, 12));
    }

    #[test]
    fn test_shift_state_through_master() {
        let r = rig();
        let mut slave = TtySlave::open(&r.ctx, r.master.unit(), 200).unwrap();
        wait_for("ioctl thread", || r.master.shared.unit.objects.ioctl.is_served());
        r.keys.send(InputRecord::char_key('A', ControlKeyState::SHIFT)).unwrap();
        wait_for("shift state", || r.master.console().modifiers() == 1);
        assert_eq!(slave.ioctl(Ioctl::Linux(TIOCL_GETSHIFTSTATE)).unwrap(), IoctlReply::Byte(1));
        assert!(matches!(slave.ioctl(Ioctl::Linux(2)), Err(TtyError::InvalidArgument(_))));
    }

    #[test]
    fn test_drop_stops_workers_and_frees_unit() {
        let r = rig();
        let unit = r.master.unit();
        let mut slave = TtySlave::open(&r.ctx, unit, 200).unwrap();
        drop(r.master);
        let mut buf = [0u8; 8];
        assert_eq!(slave.read(&mut buf).unwrap(), 0);
        assert_eq!(r.ctx.ttys().in_use(), 1);
        drop(slave);
        assert_eq!(r.ctx.ttys().in_use(), 0);
    }
}

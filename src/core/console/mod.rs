//! Console terminal
//!
//! A [`Console`] is one console window shared by everything attached to it:
//! the device (screen output), the input queue and the escape engine state.
//! [`FhandlerConsole`] is a process's open handle on it, running the line
//! discipline on the caller's thread.

pub mod device;
pub mod escape;
pub mod input;
pub mod screen;
pub mod state;
pub mod term;
#[cfg(windows)]
pub mod win32;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use self::device::{ConsoleDevice, ConsoleInput};
use self::input::ConsoleEvent;
use self::state::{Charset, DevConsole};
use super::context::TtyContext;
use super::error::{Result, TtyError};
use super::fhandler::{Fhandler, Ioctl, IoctlReply, TermiosBase, TIOCL_GETSHIFTSTATE};
use super::ldisc::{AcceptStatus, BgOp, LineDiscipline, LineEditStatus, OutputProcessor, TermiosIo};
use super::process::Pid;
use super::sync::{lock, shared_name, NamedMutex, Namespace};
use super::termios::{FlushQueue, OutputFlags, SetAction, Termios, Winsize, VMIN, VTIME};
use super::tty::{DeviceId, TtyRecord};

/// One console window.
pub struct Console {
    window: usize,
    device: Mutex<Box<dyn ConsoleDevice>>,
    input: Mutex<Box<dyn ConsoleInput>>,
    state: Arc<NamedMutex<DevConsole>>,
    tty: Arc<TtyRecord>,
    /// Query answers waiting to be read.
    responses: Mutex<VecDeque<Vec<u8>>>,
}

impl std::fmt::Debug for Console {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Console")
            .field("window", &self.window)
            .field("tty", &self.tty)
            .finish()
    }
}

impl Console {
    /// Attach to console `window`, creating it with `open` if nobody has it yet.
    pub fn attach<F>(ns: &Namespace, window: usize, charset: Charset, open: F) -> Result<Arc<Console>>
    where
        F: FnOnce() -> Result<(Box<dyn ConsoleDevice>, Box<dyn ConsoleInput>)>,
    {
        let name = shared_name("cons.device", window);
        if let Some(console) = ns.open::<Console>(&name) {
            return Ok(console);
        }

        let (mut device, input) = open()?;
        let info = device.buffer_info()?;
        let state_name = shared_name("cons.state", window);
        let (state, created) = ns.create(&state_name, || {
            NamedMutex::new(state_name.clone(), DevConsole::new(charset))
        })?;
        if created {
            state.acquire().set_default_colors(info.attributes);
        }
        let tty = Arc::new(TtyRecord::new(DeviceId::console(window)));
        tty.acquire().winsize = Winsize::new(info.cols, info.rows);

        let (console, created) = ns.create(&name, move || Console {
            window,
            device: Mutex::new(device),
            input: Mutex::new(input),
            state,
            tty,
            responses: Mutex::new(VecDeque::new()),
        })?;
        if created {
            info!("console {} attached ({}x{}, {})", window, info.cols, info.rows, charset.name());
        }
        Ok(console)
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn tty(&self) -> &Arc<TtyRecord> {
        &self.tty
    }

    /// Run `buf` through the escape engine onto the device.
    pub fn write_output(&self, buf: &[u8], onlcr: bool) -> Result<()> {
        let mut con = self.state.acquire();
        let mut dev = lock(&self.device);
        let responses = escape::write(&mut con, dev.as_mut(), buf, onlcr)?;
        dev.flush()?;
        if !responses.is_empty() {
            debug!("cons{}: queued {} response bytes", self.window, responses.len());
            lock(&self.responses).push_back(responses);
        }
        Ok(())
    }

    /// Pending query answers, then whatever the input device delivers within `timeout`.
    pub fn read_events(&self, timeout: Option<Duration>) -> Result<Vec<ConsoleEvent>> {
        let mut events: Vec<ConsoleEvent> = lock(&self.responses).drain(..).map(ConsoleEvent::Response).collect();
        if !events.is_empty() {
            return Ok(events);
        }

        let records = lock(&self.input).read_input(timeout)?;
        if records.is_empty() {
            return Ok(events);
        }
        let mut con = self.state.acquire();
        for rec in &records {
            if let Some(ev) = input::translate(&mut con, rec) {
                if let ConsoleEvent::Resize(ws) = ev {
                    lock(&self.device).resize(ws.cols, ws.rows)?;
                }
                events.push(ev);
            }
        }
        Ok(events)
    }

    /// Shift state for `TIOCLINUX`.
    pub fn modifiers(&self) -> u8 {
        self.state.acquire().n_modifiers
    }

    pub fn resize(&self, ws: Winsize) -> Result<()> {
        let _con = self.state.acquire();
        lock(&self.device).resize(ws.cols, ws.rows)
    }

    /// Current device size.
    pub fn size(&self) -> Result<Winsize> {
        let info = lock(&self.device).buffer_info()?;
        Ok(Winsize::new(info.cols, info.rows))
    }
}

/// Completed input waiting for `read`, as the line discipline accepted it.
struct ReadyIo<'a> {
    console: &'a Console,
    ready: &'a mut VecDeque<Vec<u8>>,
    onlcr: bool,
}

impl TermiosIo for ReadyIo<'_> {
    fn doecho(&mut self, bytes: &[u8]) {
        if let Err(e) = self.console.write_output(bytes, self.onlcr) {
            warn!("cons{}: echo failed: {}", self.console.window, e);
        }
    }

    fn accept_input(&mut self, input: &[u8]) -> AcceptStatus {
        self.ready.push_back(input.to_vec());
        AcceptStatus::Accepted
    }
}

/// `/dev/consN` opened by a process.
pub struct FhandlerConsole {
    console: Arc<Console>,
    base: TermiosBase,
    ldisc: LineDiscipline,
    /// Accepted chunks; an empty chunk is EOF.
    ready: VecDeque<Vec<u8>>,
    opost: OutputProcessor,
    ctrl_c_slop: Duration,
    poll: Duration,
}

impl std::fmt::Debug for FhandlerConsole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FhandlerConsole")
            .field("console", &self.console)
            .field("base", &self.base)
            .field("ready", &self.ready.len())
            .finish()
    }
}

impl FhandlerConsole {
    pub fn open(ctx: &TtyContext, console: Arc<Console>, pid: Pid) -> Self {
        let tty = console.tty().clone();
        let procs = ctx.procs().clone();
        let base = TermiosBase::new(tty.clone(), procs.clone(), pid);
        base.maybe_set_ctty();
        debug!("{}: opened by pid {}", tty.name(), pid);
        Self {
            console,
            base,
            ldisc: LineDiscipline::new(tty, procs),
            ready: VecDeque::new(),
            opost: OutputProcessor::new(),
            ctrl_c_slop: ctx.config().tty.ctrl_c_slop(),
            poll: ctx.config().tty.poll_interval(),
        }
    }

    pub fn console(&self) -> &Arc<Console> {
        &self.console
    }

    /// Pull console events through the line discipline.
    fn pump(&mut self, timeout: Option<Duration>) -> Result<()> {
        let events = self.console.read_events(timeout)?;
        for ev in events {
            match ev {
                ConsoleEvent::Response(bytes) => self.ready.push_back(bytes),
                ConsoleEvent::Resize(ws) => self.base.set_winsize(ws),
                ConsoleEvent::Input(bytes) => {
                    if input::debounce_ctrl_c(&self.base.tty, &bytes, self.ctrl_c_slop) {
                        continue;
                    }
                    let ti = self.base.tcgetattr();
                    let mut io = ReadyIo {
                        console: &self.console,
                        ready: &mut self.ready,
                        onlcr: ti.oflag.contains(OutputFlags::OPOST | OutputFlags::ONLCR),
                    };
                    let mut rest = &bytes[..];
                    while !rest.is_empty() {
                        let r = self.ldisc.line_edit(rest, &mut io);
                        if r.status == LineEditStatus::Signalled || r.consumed == 0 {
                            break;
                        }
                        rest = &rest[r.consumed..];
                    }
                }
            }
        }
        Ok(())
    }

    fn pending(&self) -> usize {
        self.ready.iter().map(Vec::len).sum()
    }

    /// Copy up to `buf.len()` bytes out of the ready queue. Stops at EOF.
    fn take_ready(&mut self, buf: &mut [u8]) -> (usize, bool) {
        let mut n = 0;
        while n < buf.len() {
            let Some(chunk) = self.ready.front_mut() else {
                break;
            };
            if chunk.is_empty() {
                if n == 0 {
                    self.ready.pop_front();
                    return (0, true);
                }
                break;
            }
            let take = chunk.len().min(buf.len() - n);
            buf[n..n + take].copy_from_slice(&chunk[..take]);
            chunk.drain(..take);
            if chunk.is_empty() {
                self.ready.pop_front();
            }
            n += take;
        }
        (n, false)
    }

    fn read_canonical(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            if let Some(chunk) = self.ready.front_mut() {
                if chunk.is_empty() {
                    self.ready.pop_front();
                    return Ok(0);
                }
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                chunk.drain(..n);
                if chunk.is_empty() {
                    self.ready.pop_front();
                }
                return Ok(n);
            }
            self.wait_input()?;
        }
    }

    fn read_raw(&mut self, buf: &mut [u8], ti: &Termios) -> Result<usize> {
        let vmin = (ti.cc[VMIN] as usize).min(buf.len());
        let vtime = Duration::from_millis(ti.cc[VTIME] as u64 * 100);
        let start = Instant::now();
        let mut last_byte = start;
        let mut total = 0;
        loop {
            let (n, _) = self.take_ready(&mut buf[total..]);
            if n > 0 {
                total += n;
                last_byte = Instant::now();
            }
            if total == buf.len() {
                return Ok(total);
            }
            match (vmin, vtime.is_zero()) {
                (0, true) => return Ok(total),
                (_, true) if total >= vmin => return Ok(total),
                (0, false) if total > 0 || start.elapsed() >= vtime => return Ok(total),
                (_, false) if total >= vmin || (total > 0 && last_byte.elapsed() >= vtime) => {
                    return Ok(total)
                }
                _ => {}
            }
            if total > 0 && self.base.signal_pending() {
                return Ok(total);
            }
            self.wait_input()?;
        }
    }

    /// Block for one poll period of input, honouring signals and O_NONBLOCK.
    fn wait_input(&mut self) -> Result<()> {
        if self.base.signal_pending() {
            return Err(TtyError::Interrupted);
        }
        if self.base.nonblocking {
            self.pump(Some(Duration::ZERO))?;
            if self.ready.is_empty() {
                return Err(TtyError::WouldBlock);
            }
            return Ok(());
        }
        self.pump(Some(self.poll))
    }
}

impl Fhandler for FhandlerConsole {
    fn name(&self) -> String {
        format!("/dev/cons{}", self.console.window)
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
        let state = loop {
            if let Some(state) = tty.acquire_for_output_timeout(self.poll) {
                break state;
            }
            if self.base.nonblocking {
                return Err(TtyError::WouldBlock);
            }
            if self.base.signal_pending() {
                return Err(TtyError::Interrupted);
            }
        };
        let ti = state.ti;
        let mut out = Vec::with_capacity(buf.len());
        self.opost.process(&ti, buf, &mut out);
        if !out.is_empty() {
            self.console.write_output(&out, false)?;
        }
        drop(state);
        Ok(buf.len())
    }

    fn ioctl(&mut self, req: Ioctl) -> Result<IoctlReply> {
        match req {
            Ioctl::GetWinsize => Ok(IoctlReply::Winsize(self.base.winsize())),
            Ioctl::SetWinsize(ws) => {
                self.base.bg_check(BgOp::Control)?;
                self.console.resize(ws)?;
                self.base.set_winsize(ws);
                Ok(IoctlReply::Done)
            }
            Ioctl::SetCtty => {
                self.base.set_ctty()?;
                Ok(IoctlReply::Done)
            }
            Ioctl::InputPending => {
                self.pump(Some(Duration::ZERO))?;
                Ok(IoctlReply::Count(self.pending()))
            }
            Ioctl::Linux(TIOCL_GETSHIFTSTATE) => Ok(IoctlReply::Byte(self.console.modifiers())),
            Ioctl::Linux(sub) => Err(TtyError::invalid(format!("TIOCLINUX subcode {}", sub))),
            Ioctl::Packet(_) => Err(TtyError::invalid("TIOCPKT on a console")),
        }
    }

    fn tcgetattr(&self) -> Result<Termios> {
        Ok(self.base.tcgetattr())
    }

    fn tcsetattr(&mut self, action: SetAction, t: &Termios) -> Result<()> {
        self.base.bg_check(BgOp::Control)?;
        if action == SetAction::Flush {
            self.ready.clear();
            self.ldisc.flush_input();
        }
        self.base.store_termios(t);
        Ok(())
    }

    fn tcflush(&mut self, queue: FlushQueue) -> Result<()> {
        self.base.bg_check(BgOp::Control)?;
        if queue.input() {
            self.ready.clear();
            self.ldisc.flush_input();
        }
        if queue.output() {
            self.opost.discard();
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

#[cfg(test)]
mod tests {
    use std::sync::mpsc::Sender;
    use std::thread;

    use super::device::*;
    use super::screen::{ScreenConsole, ScreenInput};
    use super::*;
    use crate::config::Config;
    use crate::core::process::{LocalProcessTable, ProcessInfo, ProcessTable, Signal};
    use crate::core::termios::LocalFlags;

    struct Rig {
        ctx: Arc<TtyContext>,
        screen: ScreenConsole,
        keys: Sender<InputRecord>,
        procs: Arc<LocalProcessTable>,
        fh: FhandlerConsole,
    }

    fn rig() -> Rig {
        let procs = Arc::new(LocalProcessTable::new());
        procs.insert(ProcessInfo::new(100));
        procs.insert(ProcessInfo::new(101).parent(100).group(101).session(100));
        let ctx = TtyContext::new(Config::default(), procs.clone());
        let screen = ScreenConsole::new(40, 10);
        let (keys, input) = ScreenInput::channel();
        let dev = screen.clone();
        let console = ctx
            .attach_console(0, move || {
                Ok((Box::new(dev) as Box<dyn ConsoleDevice>, Box::new(input) as Box<dyn ConsoleInput>))
            })
            .unwrap();
        let fh = FhandlerConsole::open(&ctx, console, 100);
        Rig { ctx, screen, keys, procs, fh }
    }

    fn type_str(keys: &Sender<InputRecord>, s: &str) {
        for c in s.chars() {
            keys.send(InputRecord::char_key(c, ControlKeyState::empty())).unwrap();
        }
    }

    #[test]
    fn test_attach_twice_shares_console() {
        let ns = Namespace::new();
        let screen = ScreenConsole::new(20, 5);
        let (_tx, input) = ScreenInput::channel();
        let a = Console::attach(&ns, 3, Charset::Utf8, move || {
            Ok((Box::new(screen) as Box<dyn ConsoleDevice>, Box::new(input) as Box<dyn ConsoleInput>))
        })
        .unwrap();
        let b = Console::attach(&ns, 3, Charset::Utf8, || Err(TtyError::NoDevice)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.tty().acquire().winsize, Winsize::new(20, 5));
    }

    #[test]
    fn test_write_colours_and_newline() {
        let mut r = rig();
        assert_eq!(r.fh.write(b"\x1b[31mred\x1b[0m\nnext").unwrap(), 17);
        assert_eq!(r.screen.row_text(0).trim_end(), "red");
        assert_eq!(r.screen.cell(0, 0).attr & 0x0f, FOREGROUND_RED);
        assert_eq!(r.screen.cell(3, 0).attr, DEFAULT_ATTRIBUTE);
        assert_eq!(r.screen.row_text(1).trim_end(), "next");
    }

    #[test]
    fn test_canonical_read_with_echo() {
        let mut r = rig();
        type_str(&r.keys, "hi\r");
        let mut buf = [0u8; 16];
        let n = r.fh.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi\n");
        assert_eq!(r.screen.row_text(0).trim_end(), "hi");
        assert_eq!(r.screen.cursor(), (0, 1));
    }

    #[test]
    fn test_eof_on_ctrl_d() {
        let mut r = rig();
        type_str(&r.keys, "\u{4}");
        let mut buf = [0u8; 16];
        assert_eq!(r.fh.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_cursor_report_reaches_reader() {
        let mut r = rig();
        r.fh.write(b"ab\x1b[6n").unwrap();
        let mut buf = [0u8; 16];
        let n = r.fh.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"\x1b[1;3R");
    }

    #[test]
    fn test_ctrl_c_interrupts_reader() {
        let mut r = rig();
        r.keys.send(InputRecord::char_key('\u{3}', ControlKeyState::LEFT_CTRL)).unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(r.fh.read(&mut buf), Err(TtyError::Interrupted)));
        assert_eq!(r.procs.delivered_to(100, Signal::Int), 1);
    }

    #[test]
    fn test_background_read_raises_sigttin() {
        let mut r = rig();
        let mut bg = FhandlerConsole::open(&r.ctx, r.fh.console().clone(), 101);
        let mut buf = [0u8; 4];
        assert!(matches!(bg.read(&mut buf), Err(TtyError::Interrupted)));
        assert_eq!(r.procs.delivered_to(101, Signal::Ttin), 1);
        type_str(&r.keys, "x\r");
        assert_eq!(r.fh.read(&mut buf).unwrap(), 2);
    }

    #[test]
    fn test_nonblocking_read_would_block() {
        let mut r = rig();
        r.fh.set_nonblocking(true);
        let mut buf = [0u8; 4];
        assert!(matches!(r.fh.read(&mut buf), Err(TtyError::WouldBlock)));
    }

    #[test]
    fn test_raw_read_returns_each_key() {
        let mut r = rig();
        let mut t = r.fh.tcgetattr().unwrap();
        t.make_raw();
        r.fh.tcsetattr(SetAction::Now, &t).unwrap();
        r.keys.send(InputRecord::vk_key(VK_UP, ControlKeyState::empty())).unwrap();
        let mut buf = [0u8; 16];
        let n = r.fh.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"\x1b[A");
    }

    #[test]
    fn test_resize_event_sends_sigwinch() {
        let mut r = rig();
        r.keys.send(InputRecord::WindowBufferSize { cols: 60, rows: 20 }).unwrap();
        r.fh.set_nonblocking(true);
        let mut buf = [0u8; 4];
        let _ = r.fh.read(&mut buf);
        assert_eq!(r.fh.ioctl(Ioctl::GetWinsize).unwrap(), IoctlReply::Winsize(Winsize::new(60, 20)));
        assert_eq!(r.procs.delivered_to(100, Signal::Winch), 1);
        assert_eq!(r.screen.buffer().cols, 60);
    }

    #[test]
    fn test_shift_state_ioctl() {
        let mut r = rig();
        r.keys.send(InputRecord::char_key('A', ControlKeyState::SHIFT)).unwrap();
        assert_eq!(r.fh.ioctl(Ioctl::InputPending).unwrap(), IoctlReply::Count(0));
        assert_eq!(r.fh.ioctl(Ioctl::Linux(TIOCL_GETSHIFTSTATE)).unwrap(), IoctlReply::Byte(1));
        assert!(matches!(r.fh.ioctl(Ioctl::Linux(2)), Err(TtyError::InvalidArgument(_))));
    }

    #[test]
    fn test_flusho_drops_output() {
        let mut r = rig();
        let mut t = r.fh.tcgetattr().unwrap();
        t.lflag.insert(LocalFlags::FLUSHO);
        r.fh.base.tty.acquire().ti = t;
        assert_eq!(r.fh.write(b"gone").unwrap(), 4);
        assert_eq!(r.screen.row_text(0).trim_end(), "");
    }

    #[test]
    fn test_signal_wakes_writer_stopped_by_xoff() {
        let mut r = rig();
        r.fh.base.tty.stop_output();
        let procs = r.procs.clone();
        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            procs.sig_send(100, Signal::Int);
        });
        assert!(matches!(r.fh.write(b"late"), Err(TtyError::Interrupted)));
        sender.join().unwrap();
        assert_eq!(r.screen.row_text(0).trim_end(), "");
    }

    #[test]
    fn test_ctrl_q_releases_stopped_writer() {
        let mut r = rig();
        r.fh.base.tty.stop_output();
        r.fh.set_nonblocking(true);
        assert!(matches!(r.fh.write(b"held"), Err(TtyError::WouldBlock)));

        type_str(&r.keys, "\u{11}");
        let mut buf = [0u8; 4];
        assert!(matches!(r.fh.read(&mut buf), Err(TtyError::WouldBlock)));
        assert!(!r.fh.base.tty.output_stopped());
        assert_eq!(r.fh.write(b"held").unwrap(), 4);
        assert_eq!(r.screen.row_text(0).trim_end(), "held");
    }
}

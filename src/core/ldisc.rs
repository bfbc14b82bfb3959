//! Line discipline
//!
//! [`LineDiscipline::line_edit`] turns raw input bytes into what a reader of the
//! terminal gets: canonical-mode editing, echo, signal characters and XON/XOFF.
//! It never blocks. Where the edited input goes is up to the [`TermiosIo`]
//! implementation of the caller: a pty master pushes it into the slave's input
//! pipe, a console keeps it for its own `read`.
//!
//! [`bg_check`] gates I/O from background process groups and
//! [`OutputProcessor`] applies `OPOST` translation to output.

use std::collections::VecDeque;
use std::sync::Arc;

use tracing::{debug, trace};
use unicode_width::UnicodeWidthChar;

use super::error::{Result, TtyError};
use super::process::{Pid, ProcessTable, Signal};
use super::termios::*;
use super::tty::{PacketStatus, TtyRecord};

/// Outcome of one `line_edit` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineEditStatus {
    Ok,
    /// A line (canonical) or a chunk (non-canonical) was handed to the reader.
    InputDone,
    /// A signal character was seen; the rest of the input was dropped.
    Signalled,
    Error,
    /// The reader's buffer is full. Call again once it drains.
    PipeFull,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LineEdit {
    pub status: LineEditStatus,
    /// Bytes of the input that were processed (or deliberately discarded).
    pub consumed: usize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptStatus {
    Accepted,
    PipeFull,
    Error,
}

/// Where echo and completed input go.
pub trait TermiosIo {
    fn doecho(&mut self, bytes: &[u8]);
    /// Hand `input` to the reader. An empty slice in canonical mode is EOF.
    fn accept_input(&mut self, input: &[u8]) -> AcceptStatus;
}

pub struct LineDiscipline {
    tty: Arc<TtyRecord>,
    procs: Arc<dyn ProcessTable>,
    readahead: Vec<u8>,
    pending_accept: bool,
    lnext: bool,
}

impl std::fmt::Debug for LineDiscipline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineDiscipline")
            .field("tty", &self.tty)
            .field("readahead", &self.readahead.len())
            .field("pending_accept", &self.pending_accept)
            .finish()
    }
}

impl LineDiscipline {
    pub fn new(tty: Arc<TtyRecord>, procs: Arc<dyn ProcessTable>) -> Self {
        Self {
            tty,
            procs,
            readahead: Vec::new(),
            pending_accept: false,
            lnext: false,
        }
    }

    pub fn tty(&self) -> &Arc<TtyRecord> {
        &self.tty
    }

    /// Bytes collected but not yet handed to the reader.
    pub fn readahead(&self) -> &[u8] {
        &self.readahead
    }

    /// Drop `n` bytes from the end of the read-ahead, or all of it for `None`.
    pub fn eat_readahead(&mut self, n: Option<usize>) -> usize {
        let n = n.unwrap_or(self.readahead.len()).min(self.readahead.len());
        self.readahead.truncate(self.readahead.len() - n);
        n
    }

    /// Forget everything not yet accepted (`tcflush(TCIFLUSH)`).
    pub fn flush_input(&mut self) {
        self.readahead.clear();
        self.pending_accept = false;
        self.lnext = false;
    }

    pub fn line_edit(&mut self, buf: &[u8], io: &mut dyn TermiosIo) -> LineEdit {
        let ti = self.tty.termios();
        let iscanon = ti.canonical();
        let mut status = LineEditStatus::Ok;

        if self.pending_accept {
            match self.accept(io) {
                AcceptStatus::Accepted => status = LineEditStatus::InputDone,
                AcceptStatus::PipeFull => {
                    return LineEdit { status: LineEditStatus::PipeFull, consumed: 0 };
                }
                AcceptStatus::Error => return LineEdit { status: LineEditStatus::Error, consumed: 0 },
            }
        }

        let mut i = 0;
        while i < buf.len() {
            let mut c = buf[i];
            i += 1;
            let mut input_done = false;
            trace!("line_edit: char {:#04x}", c);

            if std::mem::take(&mut self.lnext) {
                if ti.iflag.contains(InputFlags::ISTRIP) {
                    c &= 0x7f;
                }
            } else {
                if c == b'\r' {
                    if ti.iflag.contains(InputFlags::IGNCR) {
                        continue;
                    }
                    if ti.iflag.contains(InputFlags::ICRNL) {
                        c = b'\n';
                        input_done = iscanon;
                    }
                } else if c == b'\n' {
                    if ti.iflag.contains(InputFlags::INLCR) {
                        c = b'\r';
                    } else {
                        input_done = iscanon;
                    }
                }

                if ti.iflag.contains(InputFlags::ISTRIP) {
                    c &= 0x7f;
                }

                if ti.lflag.contains(LocalFlags::ISIG) {
                    let sig = if ti.is_cc(VINTR, c) {
                        Some(Signal::Int)
                    } else if ti.is_cc(VQUIT, c) {
                        Some(Signal::Quit)
                    } else if ti.is_cc(VSUSP, c) {
                        Some(Signal::Tstp)
                    } else {
                        None
                    };
                    if let Some(sig) = sig {
                        self.raise(sig, &ti);
                        return LineEdit { status: LineEditStatus::Signalled, consumed: buf.len() };
                    }
                }

                if ti.iflag.contains(InputFlags::IXON) {
                    if ti.is_cc(VSTOP, c) {
                        self.tty.stop_output();
                        continue;
                    }
                    if ti.is_cc(VSTART, c) {
                        self.tty.start_output();
                        continue;
                    }
                    if ti.iflag.contains(InputFlags::IXANY) && self.tty.output_stopped() {
                        self.tty.start_output();
                        continue;
                    }
                }

                if iscanon && ti.lflag.contains(LocalFlags::IEXTEN) {
                    if ti.is_cc(VDISCARD, c) {
                        let mut state = self.tty.acquire();
                        state.ti.lflag.toggle(LocalFlags::FLUSHO);
                        debug!("{}: FLUSHO now {}", self.tty.name(), state.ti.lflag.contains(LocalFlags::FLUSHO));
                        continue;
                    }
                    if ti.is_cc(VLNEXT, c) {
                        self.lnext = true;
                        continue;
                    }
                }

                if iscanon {
                    if ti.is_cc(VERASE, c) {
                        if let Some(cols) = self.erase_char(&ti) {
                            self.echo_erase(cols, &ti, io);
                        }
                        continue;
                    }
                    if ti.is_cc(VWERASE, c) {
                        self.erase_word(&ti, io);
                        continue;
                    }
                    if ti.is_cc(VKILL, c) {
                        while let Some(cols) = self.erase_char(&ti) {
                            self.echo_erase(cols, &ti, io);
                        }
                        continue;
                    }
                    if ti.is_cc(VREPRINT, c) {
                        if ti.lflag.contains(LocalFlags::ECHO) {
                            io.doecho(b"\n\r");
                            io.doecho(&self.readahead);
                        }
                        continue;
                    }
                    if ti.is_cc(VEOF, c) {
                        trace!("line_edit: EOF");
                        match self.accept(io) {
                            AcceptStatus::Accepted => status = LineEditStatus::InputDone,
                            AcceptStatus::PipeFull => {
                                return LineEdit { status: LineEditStatus::PipeFull, consumed: i };
                            }
                            AcceptStatus::Error => {
                                return LineEdit { status: LineEditStatus::Error, consumed: i };
                            }
                        }
                        continue;
                    }
                    if ti.is_cc(VEOL, c) || ti.is_cc(VEOL2, c) || c == b'\n' {
                        input_done = true;
                    }
                }
            }

            if ti.iflag.contains(InputFlags::IUCLC) && c.is_ascii_uppercase() {
                c = c.to_ascii_lowercase();
            }

            self.readahead.push(c);
            if ti.lflag.contains(LocalFlags::ECHO) {
                self.echo_char(c, &ti, io);
            } else if c == b'\n' && ti.lflag.contains(LocalFlags::ECHONL) {
                io.doecho(b"\n");
            }

            if !iscanon || input_done {
                match self.accept(io) {
                    AcceptStatus::Accepted => status = LineEditStatus::InputDone,
                    AcceptStatus::PipeFull => {
                        return LineEdit { status: LineEditStatus::PipeFull, consumed: i };
                    }
                    AcceptStatus::Error => return LineEdit { status: LineEditStatus::Error, consumed: i },
                }
            }
        }

        LineEdit { status, consumed: buf.len() }
    }

    fn accept(&mut self, io: &mut dyn TermiosIo) -> AcceptStatus {
        let status = io.accept_input(&self.readahead);
        match status {
            AcceptStatus::Accepted => {
                self.readahead.clear();
                self.pending_accept = false;
            }
            AcceptStatus::PipeFull => self.pending_accept = true,
            AcceptStatus::Error => self.pending_accept = false,
        }
        status
    }

    fn raise(&mut self, sig: Signal, ti: &Termios) {
        let noflsh = ti.lflag.contains(LocalFlags::NOFLSH);
        if !noflsh {
            self.flush_input();
        }
        let pgid = {
            let mut state = self.tty.acquire();
            state.ti.lflag.remove(LocalFlags::FLUSHO);
            if !noflsh && state.packet_mode {
                state.packet.insert(PacketStatus::FLUSHREAD);
            }
            state.pgid
        };
        debug!("{}: got {} for pgid {}", self.tty.name(), sig.name(), pgid);
        self.procs.kill_pgrp(pgid, sig);
        self.tty.start_output();
    }

    /// Remove the last character; returns the columns it occupied on screen.
    fn erase_char(&mut self, ti: &Termios) -> Option<usize> {
        let last = self.readahead.pop()?;
        if ti.iflag.contains(InputFlags::IUTF8) && last >= 0x80 {
            let mut start = self.readahead.len();
            while start > 0 && (last & 0xc0) == 0x80 && (self.readahead[start - 1] & 0xc0) == 0x80 {
                start -= 1;
            }
            if (last & 0xc0) == 0x80 && start > 0 {
                start -= 1;
            }
            let mut bytes = self.readahead.split_off(start);
            bytes.push(last);
            let width = std::str::from_utf8(&bytes)
                .ok()
                .and_then(|s| s.chars().next())
                .and_then(UnicodeWidthChar::width)
                .unwrap_or(1);
            return Some(width);
        }
        Some(display_width(last, ti))
    }

    fn erase_word(&mut self, ti: &Termios, io: &mut dyn TermiosIo) {
        while self.readahead.last().map_or(false, |c| c.is_ascii_whitespace()) {
            if let Some(cols) = self.erase_char(ti) {
                self.echo_erase(cols, ti, io);
            }
        }
        while self.readahead.last().map_or(false, |c| !c.is_ascii_whitespace()) {
            if let Some(cols) = self.erase_char(ti) {
                self.echo_erase(cols, ti, io);
            }
        }
    }

    fn echo_erase(&self, cols: usize, ti: &Termios, io: &mut dyn TermiosIo) {
        if ti.lflag.contains(LocalFlags::ECHO) {
            for _ in 0..cols {
                io.doecho(b"\x08 \x08");
            }
        }
    }

    fn echo_char(&self, c: u8, ti: &Termios, io: &mut dyn TermiosIo) {
        if ti.lflag.contains(LocalFlags::ECHOCTL) && is_echoctl(c) {
            io.doecho(&[b'^', c ^ 0x40]);
        } else {
            io.doecho(&[c]);
        }
    }
}

fn is_echoctl(c: u8) -> bool {
    (c < 0x20 && c != b'\n' && c != b'\t' && c != b'\r') || c == 0x7f
}

fn display_width(c: u8, ti: &Termios) -> usize {
    if is_echoctl(c) {
        if ti.lflag.contains(LocalFlags::ECHOCTL) {
            2
        } else {
            0
        }
    } else {
        1
    }
}

/// Kind of access checked by [`bg_check`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BgOp {
    Read,
    Write,
    /// Anything that changes terminal state: tcsetattr, tcflush, tcsetpgrp,
    /// TIOCSWINSZ. Checked even without `TOSTOP`.
    Control,
}

/// Background process group check.
///
/// `Ok(())` lets the operation proceed. `Interrupted` means the caller's
/// group was sent SIGTTIN/SIGTTOU; `Io` means the group cannot be stopped
/// (orphaned, or SIGTTIN ignored).
pub fn bg_check(tty: &TtyRecord, procs: &dyn ProcessTable, caller: Pid, op: BgOp) -> Result<()> {
    let (tty_pgid, ntty, tostop) = {
        let state = tty.acquire();
        (state.pgid, state.ntty, state.ti.lflag.contains(LocalFlags::TOSTOP))
    };
    let my_pgid = procs.pgid(caller).unwrap_or(0);
    if my_pgid == 0
        || my_pgid == tty_pgid
        || procs.ctty(caller) != Some(ntty)
        || (op == BgOp::Write && !tostop)
    {
        return Ok(());
    }

    let sig = if op == BgOp::Read { Signal::Ttin } else { Signal::Ttou };
    debug!(
        "bg I/O from pid {} pgid {}, tty {} pgid {}, {}",
        caller, my_pgid, ntty, tty_pgid, sig.name()
    );

    if procs.disposition(caller, sig).is_ignored_or_blocked() {
        return if sig == Signal::Ttou {
            Ok(())
        } else {
            Err(TtyError::io("background read with SIGTTIN ignored"))
        };
    }
    if procs.is_orphaned_process_group(my_pgid) {
        return Err(TtyError::io("background process group is orphaned"));
    }

    // Another signal already interrupted this call.
    let interrupted = procs.signal_arrived(caller).map_or(false, |ev| ev.is_set());
    if !interrupted {
        procs.kill_pgrp(my_pgid, sig);
    }
    Err(TtyError::Interrupted)
}

/// `OPOST` output translation with the column state it needs.
#[derive(Debug, Default)]
pub struct OutputProcessor {
    column: usize,
    leftover: VecDeque<u8>,
}

impl OutputProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn column(&self) -> usize {
        self.column
    }

    pub fn has_leftover(&self) -> bool {
        !self.leftover.is_empty()
    }

    pub fn discard(&mut self) {
        self.leftover.clear();
    }

    /// Translate `input`, appending to `out`. Output is dropped under `FLUSHO`.
    pub fn process(&mut self, ti: &Termios, input: &[u8], out: &mut Vec<u8>) {
        if ti.lflag.contains(LocalFlags::FLUSHO) {
            return;
        }
        if !ti.oflag.contains(OutputFlags::OPOST) {
            out.extend_from_slice(input);
            return;
        }
        let o = ti.oflag;
        for &b in input {
            match b {
                b'\r' => {
                    if o.contains(OutputFlags::ONOCR) && self.column == 0 {
                        continue;
                    }
                    if o.contains(OutputFlags::OCRNL) {
                        out.push(b'\n');
                        if o.contains(OutputFlags::ONLRET) {
                            self.column = 0;
                        }
                    } else {
                        self.column = 0;
                        out.push(b'\r');
                    }
                }
                b'\n' => {
                    if o.contains(OutputFlags::ONLCR) {
                        out.push(b'\r');
                        self.column = 0;
                    }
                    if o.contains(OutputFlags::ONLRET) {
                        self.column = 0;
                    }
                    out.push(b'\n');
                }
                b'\t' => {
                    self.column = (self.column / 8 + 1) * 8;
                    out.push(b);
                }
                0x08 => {
                    self.column = self.column.saturating_sub(1);
                    out.push(b);
                }
                _ => {
                    if b >= 0x20 && (b & 0xc0) != 0x80 {
                        self.column += 1;
                    }
                    if o.contains(OutputFlags::OLCUC) {
                        out.push(b.to_ascii_uppercase());
                    } else {
                        out.push(b);
                    }
                }
            }
        }
    }

    /// Fill `buf` with translated output: first what did not fit last time,
    /// then `input`. Whatever does not fit is kept for the next call, so the
    /// caller's buffer is never overrun by `ONLCR` expansion.
    pub fn fill(&mut self, ti: &Termios, input: &[u8], buf: &mut [u8]) -> usize {
        if !input.is_empty() {
            let mut out = Vec::with_capacity(input.len() + input.len() / 8);
            self.process(ti, input, &mut out);
            self.leftover.extend(out);
        }
        let n = self.leftover.len().min(buf.len());
        for (dst, src) in buf.iter_mut().zip(self.leftover.drain(..n)) {
            *dst = src;
        }
        n
    }
}

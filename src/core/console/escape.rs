//! Console escape engine
//!
//! Interprets application output one byte at a time and turns it into
//! [`ConsoleDevice`] calls. The parser position lives in [`DevConsole`], so a
//! sequence may be split across any number of writes. Anything not understood
//! is dropped without touching the screen.

use tracing::{debug, trace};
use unicode_width::UnicodeWidthChar;

use super::device::*;
use super::state::{AnsiState, Charset, DevConsole, SavedScreen, MAXARGS, TITLESIZE};
use crate::core::error::Result;

/// Primary device attributes: VT102.
const DA_RESPONSE: &[u8] = b"\x1b[?6c";
/// Secondary device attributes.
const DA2_RESPONSE: &[u8] = b"\x1b[>1;10;0c";

/// ANSI colour number to Win32 colour bits.
const ANSI_TO_WIN32: [u16; 8] = [
    0,
    FOREGROUND_RED,
    FOREGROUND_GREEN,
    FOREGROUND_RED | FOREGROUND_GREEN,
    FOREGROUND_BLUE,
    FOREGROUND_RED | FOREGROUND_BLUE,
    FOREGROUND_GREEN | FOREGROUND_BLUE,
    FOREGROUND_RED | FOREGROUND_GREEN | FOREGROUND_BLUE,
];

/// Run `buf` through the engine.
///
/// Returns the bytes the terminal answers with (device attribute and status
/// reports); they belong on the input side of the same terminal. With
/// `onlcr` a line feed also returns the cursor to column 0.
pub fn write(con: &mut DevConsole, dev: &mut dyn ConsoleDevice, buf: &[u8], onlcr: bool) -> Result<Vec<u8>> {
    let mut data = std::mem::take(&mut con.trunc_buf);
    data.extend_from_slice(buf);

    let mut w = Writer {
        con,
        dev,
        onlcr,
        responses: Vec::new(),
    };
    w.dev.set_attribute(w.con.current_attr)?;

    let mut i = 0;
    while i < data.len() {
        if w.con.state != AnsiState::Normal {
            w.escape_byte(data[i])?;
            i += 1;
            continue;
        }
        let b = data[i];
        if b < 0x20 || b == 0x7f {
            w.control(b)?;
            i += 1;
            continue;
        }
        let end = data[i..]
            .iter()
            .position(|&b| b < 0x20 || b == 0x7f)
            .map_or(data.len(), |p| i + p);
        let used = w.text(&data[i..end], end == data.len())?;
        if used < end - i {
            // incomplete character stashed for the next write
            break;
        }
        i = end;
    }
    Ok(w.responses)
}

/// Map an RGB colour to the nearest of the 16 console colours.
pub fn rgb_to_win32(r: u8, g: u8, b: u8) -> u16 {
    let hi = r.max(g).max(b);
    if hi < 0x30 {
        return 0;
    }
    let t = hi / 2 + 1;
    let mut c = 0;
    if r >= t {
        c |= FOREGROUND_RED;
    }
    if g >= t {
        c |= FOREGROUND_GREEN;
    }
    if b >= t {
        c |= FOREGROUND_BLUE;
    }
    if hi > 0xc0 {
        c |= FOREGROUND_INTENSITY;
    }
    if c == FOREGROUND_RED | FOREGROUND_GREEN | FOREGROUND_BLUE && hi < 0x80 {
        c = FOREGROUND_INTENSITY;
    }
    c
}

/// Map an xterm 256-colour index to a console colour.
pub fn xterm256_to_win32(idx: u32) -> u16 {
    match idx {
        0..=7 => ANSI_TO_WIN32[idx as usize],
        8..=15 => ANSI_TO_WIN32[idx as usize - 8] | FOREGROUND_INTENSITY,
        16..=231 => {
            const LEVELS: [u8; 6] = [0, 95, 135, 175, 215, 255];
            let i = idx - 16;
            rgb_to_win32(
                LEVELS[(i / 36) as usize],
                LEVELS[((i / 6) % 6) as usize],
                LEVELS[(i % 6) as usize],
            )
        }
        232..=255 => {
            let v = (8 + 10 * (idx - 232)) as u8;
            rgb_to_win32(v, v, v)
        }
        _ => FOREGROUND_RED | FOREGROUND_GREEN | FOREGROUND_BLUE,
    }
}

struct Writer<'a> {
    con: &'a mut DevConsole,
    dev: &'a mut dyn ConsoleDevice,
    onlcr: bool,
    responses: Vec<u8>,
}

impl Writer<'_> {
    fn info(&mut self) -> Result<BufferInfo> {
        self.dev.buffer_info()
    }

    fn blank(&self) -> CharInfo {
        CharInfo::blank(self.con.current_attr)
    }

    fn cursor_set(&mut self, x: i32, y: i32) -> Result<()> {
        let info = self.info()?;
        let x = x.clamp(0, info.cols as i32 - 1) as u16;
        let y = y.clamp(0, info.rows as i32 - 1) as u16;
        self.con.wrap_pending = false;
        self.dev.set_cursor(x, y)
    }

    fn cursor_rel(&mut self, dx: i32, dy: i32) -> Result<()> {
        let info = self.info()?;
        self.cursor_set(info.cursor_x as i32 + dx, info.cursor_y as i32 + dy)
    }

    fn control(&mut self, b: u8) -> Result<()> {
        match b {
            0x07 => self.dev.beep()?,
            0x08 => self.cursor_rel(-1, 0)?,
            0x09 => {
                let info = self.info()?;
                let x = (info.cursor_x / 8 + 1) * 8;
                self.cursor_set(x as i32, info.cursor_y as i32)?;
            }
            0x0a | 0x0b | 0x0c => self.line_feed(self.onlcr)?,
            0x0d => {
                let info = self.info()?;
                self.cursor_set(0, info.cursor_y as i32)?;
            }
            0x0e => self.con.shift_out = true,
            0x0f => self.con.shift_out = false,
            0x1b => {
                self.con.reset_parser();
                self.con.state = AnsiState::GotEsc;
            }
            0x18 | 0x1a => self.con.reset_parser(),
            _ => trace!("ignoring control {:#04x}", b),
        }
        Ok(())
    }

    /// Move down a line, scrolling the region when at its bottom.
    fn line_feed(&mut self, cr: bool) -> Result<()> {
        let info = self.info()?;
        let (top, bottom) = self.con.scroll_region(info.rows);
        let x = if cr { 0 } else { info.cursor_x as i32 };
        if info.cursor_y == bottom {
            self.scroll_up(top, bottom, 1)?;
            self.cursor_set(x, info.cursor_y as i32)
        } else {
            self.cursor_set(x, info.cursor_y as i32 + 1)
        }
    }

    fn reverse_index(&mut self) -> Result<()> {
        let info = self.info()?;
        let (top, bottom) = self.con.scroll_region(info.rows);
        if info.cursor_y == top {
            self.scroll_down(top, bottom, 1)
        } else {
            self.cursor_rel(0, -1)
        }
    }

    /// Scroll rows `top..=bottom` up by `n`, blanking at the bottom.
    fn scroll_up(&mut self, top: u16, bottom: u16, n: u16) -> Result<()> {
        let info = self.info()?;
        let right = info.cols as i32 - 1;
        let clip = Rect::new(0, top as i32, right, bottom as i32);
        if n == 0 {
            return Ok(());
        }
        if n > bottom - top {
            let len = (bottom - top + 1) as usize * info.cols as usize;
            return self.dev.fill(0, top, len, ' ', self.con.current_attr);
        }
        let src = Rect::new(0, (top + n) as i32, right, bottom as i32);
        self.dev.scroll(src, clip, (0, top as i32), self.blank())
    }

    fn scroll_down(&mut self, top: u16, bottom: u16, n: u16) -> Result<()> {
        let info = self.info()?;
        let right = info.cols as i32 - 1;
        let clip = Rect::new(0, top as i32, right, bottom as i32);
        if n == 0 {
            return Ok(());
        }
        if n > bottom - top {
            let len = (bottom - top + 1) as usize * info.cols as usize;
            return self.dev.fill(0, top, len, ' ', self.con.current_attr);
        }
        let src = Rect::new(0, top as i32, right, (bottom - n) as i32);
        self.dev.scroll(src, clip, (0, (top + n) as i32), self.blank())
    }

    /// Decode and print a run of non-control bytes. Returns how many bytes
    /// were used; a character cut off at the end of the write is kept back.
    fn text(&mut self, run: &[u8], at_end: bool) -> Result<usize> {
        let mut out = String::with_capacity(run.len());
        let mut used = run.len();
        match self.con.charset {
            Charset::Latin1 => out.extend(run.iter().map(|&b| char::from(b))),
            Charset::Utf8 => {
                let mut rest = run;
                loop {
                    match std::str::from_utf8(rest) {
                        Ok(s) => {
                            out.push_str(s);
                            break;
                        }
                        Err(e) => {
                            let valid = e.valid_up_to();
                            out.push_str(std::str::from_utf8(&rest[..valid]).unwrap_or_default());
                            match e.error_len() {
                                Some(n) => {
                                    out.push(char::REPLACEMENT_CHARACTER);
                                    rest = &rest[valid + n..];
                                }
                                None if at_end => {
                                    self.con.trunc_buf = rest[valid..].to_vec();
                                    used = run.len() - (rest.len() - valid);
                                    trace!("keeping {} bytes of a split character", self.con.trunc_buf.len());
                                    break;
                                }
                                None => {
                                    out.push(char::REPLACEMENT_CHARACTER);
                                    break;
                                }
                            }
                        }
                    }
                }
            }
        }
        self.write_normal(&out)?;
        Ok(used)
    }

    fn write_normal(&mut self, text: &str) -> Result<()> {
        let info = self.info()?;
        let cols = info.cols;
        let mut x = info.cursor_x;
        let mut piece = String::new();
        let mut piece_w = 0u16;

        for c in text.chars() {
            let c = self.con.translate_char(c);
            let w = c.width().unwrap_or(0) as u16;
            if w == 0 {
                continue;
            }
            if self.con.wrap_pending || x + w > cols {
                self.put_piece(&mut piece, &mut piece_w)?;
                self.line_feed(true)?;
                x = 0;
            }
            piece.push(c);
            piece_w += w;
            x += w;
            if x >= cols {
                self.put_piece(&mut piece, &mut piece_w)?;
                self.con.wrap_pending = true;
            }
        }
        self.put_piece(&mut piece, &mut piece_w)
    }

    fn put_piece(&mut self, piece: &mut String, width: &mut u16) -> Result<()> {
        if piece.is_empty() {
            return Ok(());
        }
        if self.con.insert_mode {
            self.insert_chars(*width)?;
        }
        self.dev.write_text(piece)?;
        piece.clear();
        *width = 0;
        Ok(())
    }

    fn insert_chars(&mut self, n: u16) -> Result<()> {
        let info = self.info()?;
        let (x, y) = (info.cursor_x as i32, info.cursor_y as i32);
        let right = info.cols as i32 - 1;
        let line = Rect::new(x, y, right, y);
        if x + n as i32 > right {
            return self.dev.fill(x as u16, y as u16, (right - x + 1) as usize, ' ', self.con.current_attr);
        }
        self.dev.scroll(line, line, (x + n as i32, y), self.blank())
    }

    fn delete_chars(&mut self, n: u16) -> Result<()> {
        let info = self.info()?;
        let (x, y) = (info.cursor_x as i32, info.cursor_y as i32);
        let right = info.cols as i32 - 1;
        let line = Rect::new(x, y, right, y);
        if x + n as i32 > right {
            return self.dev.fill(x as u16, y as u16, (right - x + 1) as usize, ' ', self.con.current_attr);
        }
        self.dev.scroll(Rect::new(x + n as i32, y, right, y), line, (x, y), self.blank())
    }

    fn escape_byte(&mut self, b: u8) -> Result<()> {
        match self.con.state {
            AnsiState::Normal => self.control(b),
            AnsiState::GotEsc => self.got_esc(b),
            AnsiState::GotSquare | AnsiState::GotArg1 | AnsiState::GotCommand => self.csi_byte(b),
            AnsiState::GotRSquare => {
                match b {
                    b'0'..=b'9' => {
                        self.con.args[0] = self.con.args[0].saturating_mul(10).saturating_add((b - b'0') as u32);
                    }
                    b';' if self.con.args[0] <= 2 => {
                        self.con.title.clear();
                        self.con.state = AnsiState::GetTitle;
                    }
                    0x07 => self.con.reset_parser(),
                    0x1b => {
                        self.con.state = AnsiState::EatTitle;
                        self.con.osc_esc = true;
                    }
                    _ => self.con.state = AnsiState::EatTitle,
                }
                Ok(())
            }
            AnsiState::GetTitle | AnsiState::EatTitle => self.title_byte(b),
            AnsiState::GotParen | AnsiState::GotRParen => {
                let graphics = b == b'0';
                if self.con.state == AnsiState::GotParen {
                    self.con.g0_graphics = graphics;
                } else {
                    self.con.g1_graphics = graphics;
                }
                self.con.reset_parser();
                Ok(())
            }
        }
    }

    fn got_esc(&mut self, b: u8) -> Result<()> {
        self.con.reset_parser();
        match b {
            b'[' => self.con.state = AnsiState::GotSquare,
            b']' => self.con.state = AnsiState::GotRSquare,
            b'(' => self.con.state = AnsiState::GotParen,
            b')' => self.con.state = AnsiState::GotRParen,
            b'M' => self.reverse_index()?,
            b'D' => self.line_feed(false)?,
            b'E' => self.line_feed(true)?,
            b'7' => self.save_cursor()?,
            b'8' => self.restore_cursor()?,
            b'c' => self.full_reset()?,
            0x1b => self.con.state = AnsiState::GotEsc,
            b'=' | b'>' => trace!("keypad mode ignored"),
            _ => debug!("bad escape: ESC {:?}", b as char),
        }
        Ok(())
    }

    fn csi_byte(&mut self, b: u8) -> Result<()> {
        let con = &mut *self.con;
        match b {
            0x1b => {
                con.reset_parser();
                con.state = AnsiState::GotEsc;
            }
            0x18 | 0x1a => con.reset_parser(),
            0x00..=0x1f => return self.control(b),
            b'0'..=b'9' => {
                let arg = &mut con.args[con.nargs];
                *arg = arg.saturating_mul(10).saturating_add((b - b'0') as u32);
                con.state = AnsiState::GotArg1;
            }
            b';' => {
                if con.nargs < MAXARGS - 1 {
                    con.nargs += 1;
                }
                con.state = AnsiState::GotArg1;
            }
            b'?' if con.state == AnsiState::GotSquare => con.saw_question_mark = true,
            b'>' if con.state == AnsiState::GotSquare => con.saw_greater_than = true,
            0x20..=0x2f => con.saw_intermediate = true,
            0x40..=0x7e => {
                con.state = AnsiState::GotCommand;
                let result = if con.saw_intermediate {
                    debug!("bad escape: CSI with intermediate, final {:?}", b as char);
                    Ok(())
                } else {
                    self.char_command(b)
                };
                self.con.reset_parser();
                return result;
            }
            _ => trace!("ignoring {:#04x} in CSI", b),
        }
        Ok(())
    }

    fn title_byte(&mut self, b: u8) -> Result<()> {
        if self.con.osc_esc {
            self.finish_title()?;
            if b != b'\\' {
                self.con.state = AnsiState::GotEsc;
                return self.got_esc(b);
            }
            return Ok(());
        }
        match b {
            0x07 => self.finish_title()?,
            0x1b => self.con.osc_esc = true,
            0x18 | 0x1a => self.con.reset_parser(),
            _ => {
                if self.con.state == AnsiState::GetTitle && self.con.title.len() < TITLESIZE {
                    self.con.title.push(b);
                }
            }
        }
        Ok(())
    }

    fn finish_title(&mut self) -> Result<()> {
        if self.con.state == AnsiState::GetTitle {
            let title = match self.con.charset {
                Charset::Utf8 => String::from_utf8_lossy(&self.con.title).into_owned(),
                Charset::Latin1 => self.con.title.iter().map(|&b| char::from(b)).collect(),
            };
            debug!("console title {:?}", title);
            self.dev.set_title(&title)?;
        }
        self.con.title.clear();
        self.con.reset_parser();
        Ok(())
    }

    fn save_cursor(&mut self) -> Result<()> {
        let info = self.info()?;
        self.con.saved_cursor = Some((info.cursor_x, info.cursor_y));
        Ok(())
    }

    fn restore_cursor(&mut self) -> Result<()> {
        match self.con.saved_cursor {
            Some((x, y)) => self.cursor_set(x as i32, y as i32),
            None => self.cursor_set(0, 0),
        }
    }

    fn full_reset(&mut self) -> Result<()> {
        self.con.reset();
        let info = self.info()?;
        self.dev.set_attribute(self.con.current_attr)?;
        self.dev
            .fill(0, 0, info.cols as usize * info.rows as usize, ' ', self.con.current_attr)?;
        self.dev.set_cursor_visible(true)?;
        self.cursor_set(0, 0)
    }

    fn char_command(&mut self, cmd: u8) -> Result<()> {
        let info = self.info()?;
        let (x, y) = (info.cursor_x as i32, info.cursor_y as i32);
        let n = self.con.arg_or(0, 1).min(i16::MAX as u32) as i32;

        match cmd {
            b'm' => self.sgr()?,
            b'h' | b'l' => self.set_modes(cmd == b'h')?,
            b'J' => self.erase_display(&info)?,
            b'K' => {
                let attr = self.con.current_attr;
                let cols = info.cols as usize;
                match self.con.args[0] {
                    0 => self.dev.fill(x as u16, y as u16, cols - x as usize, ' ', attr)?,
                    1 => self.dev.fill(0, y as u16, x as usize + 1, ' ', attr)?,
                    2 => self.dev.fill(0, y as u16, cols, ' ', attr)?,
                    other => debug!("bad escape: CSI {}K", other),
                }
            }
            b'A' => self.cursor_set(x, y - n)?,
            b'B' => self.cursor_set(x, y + n)?,
            b'C' => self.cursor_set(x + n, y)?,
            b'D' => self.cursor_set(x - n, y)?,
            b'E' => self.cursor_set(0, y + n)?,
            b'F' => self.cursor_set(0, y - n)?,
            b'G' | b'`' => self.cursor_set(n - 1, y)?,
            b'd' => self.cursor_set(x, n - 1)?,
            b'H' | b'f' => {
                let col = self.con.arg_or(1, 1) as i32;
                self.cursor_set(col - 1, n - 1)?;
            }
            b'r' => {
                let top = self.con.args[0];
                let bottom = if self.con.nargs >= 1 { self.con.args[1] } else { 0 };
                self.con.scroll_top = (top > 0).then(|| (top - 1).min(u16::MAX as u32) as u16);
                self.con.scroll_bottom = (bottom > 0).then(|| (bottom - 1).min(u16::MAX as u32) as u16);
                self.cursor_set(0, 0)?;
            }
            b'L' | b'M' => {
                let (top, bottom) = self.con.scroll_region(info.rows);
                let y = y as u16;
                if y >= top && y <= bottom {
                    let n = (n as u16).min(bottom - y + 1);
                    if cmd == b'L' {
                        self.scroll_down(y, bottom, n)?;
                    } else {
                        self.scroll_up(y, bottom, n)?;
                    }
                }
            }
            b'@' => self.insert_chars(n as u16)?,
            b'P' => self.delete_chars(n as u16)?,
            b'X' => {
                let len = (n as usize).min(info.cols as usize - x as usize);
                self.dev.fill(x as u16, y as u16, len, ' ', self.con.current_attr)?;
            }
            b'S' | b'T' => {
                let (top, bottom) = self.con.scroll_region(info.rows);
                let n = n.min(u16::MAX as i32) as u16;
                if cmd == b'S' {
                    self.scroll_up(top, bottom, n)?;
                } else {
                    self.scroll_down(top, bottom, n)?;
                }
            }
            b's' => self.save_cursor()?,
            b'u' => self.restore_cursor()?,
            b'c' if self.con.args[0] == 0 => {
                let reply = if self.con.saw_greater_than { DA2_RESPONSE } else { DA_RESPONSE };
                self.responses.extend_from_slice(reply);
            }
            b'n' => match self.con.args[0] {
                5 => self.responses.extend_from_slice(b"\x1b[0n"),
                6 => self
                    .responses
                    .extend_from_slice(format!("\x1b[{};{}R", y + 1, x + 1).as_bytes()),
                other => debug!("bad escape: CSI {}n", other),
            },
            _ => debug!("bad escape: CSI final {:?}, {} args", cmd as char, self.con.nargs + 1),
        }
        Ok(())
    }

    fn erase_display(&mut self, info: &BufferInfo) -> Result<()> {
        let cols = info.cols as usize;
        let rows = info.rows as usize;
        let (x, y) = (info.cursor_x as usize, info.cursor_y as usize);
        let attr = self.con.current_attr;
        match self.con.args[0] {
            0 => self.dev.fill(x as u16, y as u16, (cols - x) + (rows - y - 1) * cols, ' ', attr),
            1 => self.dev.fill(0, 0, y * cols + x + 1, ' ', attr),
            2 | 3 => self.dev.fill(0, 0, cols * rows, ' ', attr),
            other => {
                debug!("bad escape: CSI {}J", other);
                Ok(())
            }
        }
    }

    fn sgr(&mut self) -> Result<()> {
        let con = &mut *self.con;
        let mut i = 0;
        while i <= con.nargs {
            match con.args[i] {
                0 => con.set_default_attr(),
                1 => {
                    con.bold = true;
                    con.dim = false;
                }
                2 => {
                    con.dim = true;
                    con.bold = false;
                }
                4 => con.underline = true,
                5 => con.blink = true,
                7 => con.reverse = true,
                8 => con.invisible = true,
                10 => {
                    con.shift_out = false;
                    con.g0_graphics = false;
                }
                11 => con.g0_graphics = true,
                22 => {
                    con.bold = false;
                    con.dim = false;
                }
                24 => con.underline = false,
                25 => con.blink = false,
                27 => con.reverse = false,
                28 => con.invisible = false,
                a @ 30..=37 => con.fg = ANSI_TO_WIN32[(a - 30) as usize],
                38 | 48 => {
                    let is_fg = con.args[i] == 38;
                    let colour = match con.args.get(i + 1).copied() {
                        Some(5) if i + 2 <= con.nargs => {
                            let c = xterm256_to_win32(con.args[i + 2]);
                            i += 2;
                            Some(c)
                        }
                        Some(2) if i + 4 <= con.nargs => {
                            let c = rgb_to_win32(
                                con.args[i + 2].min(255) as u8,
                                con.args[i + 3].min(255) as u8,
                                con.args[i + 4].min(255) as u8,
                            );
                            i += 4;
                            Some(c)
                        }
                        _ => None,
                    };
                    match (colour, is_fg) {
                        (Some(c), true) => con.fg = c,
                        (Some(c), false) => con.bg = c,
                        (None, _) => debug!("bad escape: incomplete extended colour"),
                    }
                }
                39 => con.fg = con.default_fg,
                a @ 40..=47 => con.bg = ANSI_TO_WIN32[(a - 40) as usize],
                49 => con.bg = con.default_bg,
                a @ 90..=97 => con.fg = ANSI_TO_WIN32[(a - 90) as usize] | FOREGROUND_INTENSITY,
                a @ 100..=107 => con.bg = ANSI_TO_WIN32[(a - 100) as usize] | FOREGROUND_INTENSITY,
                other => trace!("SGR {} ignored", other),
            }
            i += 1;
        }
        let attr = con.set_color();
        self.dev.set_attribute(attr)
    }

    fn set_modes(&mut self, set: bool) -> Result<()> {
        for i in 0..=self.con.nargs {
            let mode = self.con.args[i];
            if !self.con.saw_question_mark {
                match mode {
                    4 => self.con.insert_mode = set,
                    other => debug!("mode {} ignored", other),
                }
                continue;
            }
            match mode {
                1 => self.con.cursor_key_app_mode = set,
                25 => {
                    self.con.cursor_visible = set;
                    self.dev.set_cursor_visible(set)?;
                }
                47 | 1047 | 1049 => {
                    if set {
                        self.save_screen(mode != 47)?;
                    } else {
                        self.restore_screen()?;
                    }
                }
                1000 | 1002 | 1003 => self.con.use_mouse = if set { mode as u16 } else { 0 },
                1004 => self.con.use_focus = set,
                1005 => self.con.ext_mouse_mode5 = set,
                1006 => self.con.ext_mouse_mode6 = set,
                1015 => self.con.ext_mouse_mode15 = set,
                other => debug!("private mode {} ignored", other),
            }
        }
        Ok(())
    }

    fn save_screen(&mut self, clear: bool) -> Result<()> {
        let info = self.info()?;
        let whole = Rect::new(0, 0, info.cols as i32 - 1, info.rows as i32 - 1);
        let cells = self.dev.read_region(whole)?;
        self.con.savebuf = Some(SavedScreen {
            cols: info.cols,
            rows: info.rows,
            cells,
            cursor: (info.cursor_x, info.cursor_y),
        });
        if clear {
            self.dev
                .fill(0, 0, info.cols as usize * info.rows as usize, ' ', self.con.current_attr)?;
            self.cursor_set(0, 0)?;
        }
        Ok(())
    }

    fn restore_screen(&mut self) -> Result<()> {
        let Some(saved) = self.con.savebuf.take() else {
            return Ok(());
        };
        let rect = Rect::new(0, 0, saved.cols as i32 - 1, saved.rows as i32 - 1);
        self.dev.write_region(rect, &saved.cells)?;
        self.cursor_set(saved.cursor.0 as i32, saved.cursor.1 as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::console::screen::ScreenConsole;

    fn setup(cols: u16, rows: u16) -> (DevConsole, ScreenConsole) {
        (DevConsole::new(Charset::Utf8), ScreenConsole::new(cols, rows))
    }

    fn put(con: &mut DevConsole, screen: &ScreenConsole, s: &[u8]) -> Vec<u8> {
        let mut dev = screen.clone();
        write(con, &mut dev, s, true).unwrap()
    }

    #[test]
    fn test_sgr_red_around_text() {
        let (mut con, screen) = setup(20, 3);
        put(&mut con, &screen, b"\x1b[31mHELLO\x1b[0m!");
        assert_eq!(screen.row_text(0), "HELLO!");
        assert_eq!(screen.cell(0, 0).attr, FOREGROUND_RED);
        assert_eq!(screen.cell(4, 0).attr, FOREGROUND_RED);
        assert_eq!(screen.cell(5, 0).attr, DEFAULT_ATTRIBUTE);
        assert_eq!(con.current_attr, DEFAULT_ATTRIBUTE);
    }

    #[test]
    fn test_unknown_csi_is_a_no_op() {
        for final_byte in [b'y', b'q', b'z', b'p', b'w', b'~', b'}', b'Z', b't'] {
            let (mut con, screen) = setup(10, 4);
            put(&mut con, &screen, b"ab\x1b[2;3H\x1b[1;33m");
            let before = (screen.cursor(), con.current_attr, screen.row_text(0));
            let mut seq = b"\x1b[12;7".to_vec();
            seq.push(final_byte);
            put(&mut con, &screen, &seq);
            assert_eq!((screen.cursor(), con.current_attr, screen.row_text(0)), before);
            assert_eq!(con.state, AnsiState::Normal);
            put(&mut con, &screen, b"x");
            assert_eq!(screen.cell(2, 1).ch, 'x');
        }
    }

    #[test]
    fn test_intermediate_sequence_ignored() {
        let (mut con, screen) = setup(10, 2);
        put(&mut con, &screen, b"\x1b[2 qok");
        assert_eq!(screen.row_text(0), "ok");
    }

    #[test]
    fn test_split_utf8_matches_single_write() {
        let text = "a€漢😀z".as_bytes();
        let (mut whole_con, whole) = setup(20, 2);
        put(&mut whole_con, &whole, text);
        for cut in 1..text.len() {
            let (mut con, screen) = setup(20, 2);
            put(&mut con, &screen, &text[..cut]);
            put(&mut con, &screen, &text[cut..]);
            assert_eq!(screen.row_text(0), whole.row_text(0), "cut at {}", cut);
            assert!(con.trunc_buf.is_empty());
        }
    }

    #[test]
    fn test_invalid_utf8_replaced() {
        let (mut con, screen) = setup(10, 2);
        put(&mut con, &screen, b"a\xffb\xe2\n");
        assert_eq!(screen.row_text(0), "a\u{fffd}b\u{fffd}");
    }

    #[test]
    fn test_latin1() {
        let mut con = DevConsole::new(Charset::Latin1);
        let screen = ScreenConsole::new(10, 2);
        put(&mut con, &screen, b"caf\xe9");
        assert_eq!(screen.row_text(0), "café");
    }

    #[test]
    fn test_sequence_split_across_writes() {
        let (mut con, screen) = setup(10, 5);
        put(&mut con, &screen, b"\x1b");
        put(&mut con, &screen, b"[3");
        put(&mut con, &screen, b";4");
        put(&mut con, &screen, b"H*");
        assert_eq!(screen.cell(3, 2).ch, '*');
    }

    #[test]
    fn test_cursor_motion_clamps() {
        let (mut con, screen) = setup(10, 5);
        put(&mut con, &screen, b"\x1b[3;3H\x1b[10A");
        assert_eq!(screen.cursor(), (2, 0));
        put(&mut con, &screen, b"\x1b[99C\x1b[2B");
        assert_eq!(screen.cursor(), (9, 2));
        put(&mut con, &screen, b"\x1b[4D\x1b[G");
        assert_eq!(screen.cursor(), (0, 2));
        put(&mut con, &screen, b"\x1b[5d\x1b[2E");
        assert_eq!(screen.cursor(), (0, 4));
    }

    #[test]
    fn test_erase_line_and_display() {
        let (mut con, screen) = setup(5, 3);
        put(&mut con, &screen, b"abcde12345vwxyz");
        put(&mut con, &screen, b"\x1b[2;3H\x1b[K");
        assert_eq!(screen.row_text(1), "12");
        put(&mut con, &screen, b"\x1b[1K");
        assert_eq!(screen.row_text(1), "");
        put(&mut con, &screen, b"\x1b[1;2H\x1b[J");
        assert_eq!(screen.row_text(0), "a");
        assert_eq!(screen.row_text(2), "");
    }

    #[test]
    fn test_autowrap_and_scroll() {
        let (mut con, screen) = setup(4, 2);
        put(&mut con, &screen, b"abcdefgh");
        assert_eq!(screen.row_text(0), "abcd");
        assert_eq!(screen.row_text(1), "efgh");
        put(&mut con, &screen, b"i");
        assert_eq!(screen.row_text(0), "efgh");
        assert_eq!(screen.row_text(1), "i");
    }

    #[test]
    fn test_newline_with_and_without_onlcr() {
        let (mut con, screen) = setup(10, 3);
        put(&mut con, &screen, b"ab\ncd");
        assert_eq!(screen.row_text(1), "cd");
        let mut dev = screen.clone();
        write(&mut con, &mut dev, b"\nef", false).unwrap();
        assert_eq!(screen.row_text(2), "  ef");
    }

    #[test]
    fn test_scroll_region() {
        let (mut con, screen) = setup(5, 5);
        put(&mut con, &screen, b"r0\r\nr1\r\nr2\r\nr3\r\nr4");
        put(&mut con, &screen, b"\x1b[2;4r\x1b[4;1H\nnew");
        assert_eq!(screen.row_text(0), "r0");
        assert_eq!(screen.row_text(1), "r2");
        assert_eq!(screen.row_text(2), "r3");
        assert_eq!(screen.row_text(3), "new");
        assert_eq!(screen.row_text(4), "r4");
        put(&mut con, &screen, b"\x1b[2;1H\x1bM");
        assert_eq!(screen.row_text(1), "");
        assert_eq!(screen.row_text(2), "r2");
        assert_eq!(screen.row_text(4), "r4");
    }

    #[test]
    fn test_insert_delete_lines_and_chars() {
        let (mut con, screen) = setup(6, 3);
        put(&mut con, &screen, b"aaa\r\nbbb\r\nccc");
        put(&mut con, &screen, b"\x1b[2;1H\x1b[L");
        assert_eq!(screen.row_text(1), "");
        assert_eq!(screen.row_text(2), "bbb");
        put(&mut con, &screen, b"\x1b[M");
        assert_eq!(screen.row_text(1), "bbb");
        put(&mut con, &screen, b"\x1b[1;1Habcdef\x1b[1;2H\x1b[2P");
        assert_eq!(screen.row_text(0), "adef");
        put(&mut con, &screen, b"\x1b[2@");
        assert_eq!(screen.row_text(0), "a  def");
        put(&mut con, &screen, b"\x1b[1;4H\x1b[2X");
        assert_eq!(screen.row_text(0), "a    f");
    }

    #[test]
    fn test_insert_mode() {
        let (mut con, screen) = setup(8, 1);
        put(&mut con, &screen, b"world\r\x1b[4hhi \x1b[4l");
        assert_eq!(screen.row_text(0), "hi world");
    }

    #[test]
    fn test_reports_are_returned() {
        let (mut con, screen) = setup(10, 5);
        assert_eq!(put(&mut con, &screen, b"\x1b[3;5H\x1b[6n"), b"\x1b[3;5R");
        assert_eq!(put(&mut con, &screen, b"\x1b[c"), DA_RESPONSE);
        assert_eq!(put(&mut con, &screen, b"\x1b[>c"), DA2_RESPONSE);
        assert_eq!(put(&mut con, &screen, b"\x1b[5n"), b"\x1b[0n");
        assert_eq!(screen.cursor(), (4, 2));
    }

    #[test]
    fn test_title_bel_and_st() {
        let (mut con, screen) = setup(10, 2);
        put(&mut con, &screen, b"\x1b]0;first\x07");
        assert_eq!(screen.title(), "first");
        put(&mut con, &screen, b"\x1b]2;sec");
        put(&mut con, &screen, b"ond\x1b");
        put(&mut con, &screen, b"\\x");
        assert_eq!(screen.title(), "second");
        assert_eq!(screen.row_text(0), "x");
        put(&mut con, &screen, b"\x1b]52;c;Zm9v\x07y");
        assert_eq!(screen.title(), "second");
        assert_eq!(screen.row_text(0), "xy");
    }

    #[test]
    fn test_save_restore_screen() {
        let (mut con, screen) = setup(6, 2);
        put(&mut con, &screen, b"shell");
        put(&mut con, &screen, b"\x1b[?1049hvi");
        assert_eq!(screen.row_text(0), "vi");
        put(&mut con, &screen, b"\x1b[?1049l");
        assert_eq!(screen.row_text(0), "shell");
        assert_eq!(screen.cursor(), (5, 0));
    }

    #[test]
    fn test_save_restore_cursor() {
        let (mut con, screen) = setup(10, 5);
        put(&mut con, &screen, b"\x1b[2;3H\x1b7\x1b[5;5H\x1b8");
        assert_eq!(screen.cursor(), (2, 1));
        put(&mut con, &screen, b"\x1b[4;4H\x1b[s\x1b[H\x1b[u");
        assert_eq!(screen.cursor(), (3, 3));
    }

    #[test]
    fn test_line_drawing_charset() {
        let (mut con, screen) = setup(10, 2);
        put(&mut con, &screen, b"\x1b(0lqk\x1b(Bq");
        assert_eq!(screen.row_text(0), "┌─┐q");
        put(&mut con, &screen, b"\r\n\x1b)0\x0ex\x0fx");
        assert_eq!(screen.row_text(1), "│x");
    }

    #[test]
    fn test_private_modes() {
        let (mut con, screen) = setup(10, 2);
        put(&mut con, &screen, b"\x1b[?1;1000;1006h\x1b[?25l\x1b[?1004h");
        assert!(con.cursor_key_app_mode);
        assert_eq!(con.use_mouse, 1000);
        assert!(con.ext_mouse_mode6);
        assert!(con.use_focus);
        assert!(!screen.cursor_visible());
        put(&mut con, &screen, b"\x1b[?1000l\x1b[?25h");
        assert_eq!(con.use_mouse, 0);
        assert!(screen.cursor_visible());
    }

    #[test]
    fn test_extended_colours() {
        let (mut con, screen) = setup(10, 2);
        put(&mut con, &screen, b"\x1b[38;5;196;48;2;0;0;255mX");
        let attr = screen.cell(0, 0).attr;
        assert_eq!(attr & FOREGROUND_MASK, FOREGROUND_RED | FOREGROUND_INTENSITY);
        assert_eq!(attr & BACKGROUND_MASK, BACKGROUND_BLUE | BACKGROUND_INTENSITY);
        put(&mut con, &screen, b"\x1b[7;94mY");
        let attr = screen.cell(1, 0).attr;
        assert_eq!(attr & FOREGROUND_MASK, FOREGROUND_BLUE | FOREGROUND_INTENSITY);
        assert_eq!(attr & BACKGROUND_MASK, (FOREGROUND_BLUE | FOREGROUND_INTENSITY) << 4);
    }

    #[test]
    fn test_bell_and_reset() {
        let (mut con, screen) = setup(10, 2);
        put(&mut con, &screen, b"\x07\x1b[1;31mabc\x1bc");
        assert_eq!(screen.beeps(), 1);
        assert_eq!(screen.row_text(0), "");
        assert_eq!(con.current_attr, DEFAULT_ATTRIBUTE);
        assert_eq!(screen.cursor(), (0, 0));
    }

    #[test]
    fn test_rgb_mapping() {
        assert_eq!(rgb_to_win32(0, 0, 0), 0);
        assert_eq!(rgb_to_win32(255, 255, 255), 15);
        assert_eq!(rgb_to_win32(192, 192, 192), 7);
        assert_eq!(rgb_to_win32(100, 100, 100), FOREGROUND_INTENSITY);
        assert_eq!(xterm256_to_win32(1), FOREGROUND_RED);
        assert_eq!(xterm256_to_win32(12), FOREGROUND_BLUE | FOREGROUND_INTENSITY);
    }
}

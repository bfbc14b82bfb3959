//! crossterm console backend
//!
//! Outside a Win32 console the escape engine draws into a [`ScreenConsole`]
//! and [`TermConsole`] paints the changed rows onto the real terminal with
//! crossterm. [`CrosstermInput`] turns crossterm events back into
//! [`InputRecord`]s so the input side runs through the same translator as a
//! Win32 console.

use std::io::{self, Write};
use std::time::Duration;

use crossterm::{
    cursor::{Hide, MoveTo, Show},
    event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers, MouseButton, MouseEventKind},
    execute, queue,
    style::{Attribute, Color, Print, ResetColor, SetAttribute, SetBackgroundColor, SetForegroundColor},
    terminal::{self, Clear, ClearType, DisableLineWrap, EnableLineWrap, EnterAlternateScreen, LeaveAlternateScreen, SetTitle},
};
use tracing::{debug, warn};

use super::device::*;
use super::screen::{ScreenConsole, CONTINUATION};
use crate::core::error::{Result, TtyError};

/// Console colour index to a crossterm colour.
pub fn win32_color(idx: u16) -> Color {
    match idx & 0x0f {
        0 => Color::Black,
        1 => Color::DarkBlue,
        2 => Color::DarkGreen,
        3 => Color::DarkCyan,
        4 => Color::DarkRed,
        5 => Color::DarkMagenta,
        6 => Color::DarkYellow,
        7 => Color::Grey,
        8 => Color::DarkGrey,
        9 => Color::Blue,
        10 => Color::Green,
        11 => Color::Cyan,
        12 => Color::Red,
        13 => Color::Magenta,
        14 => Color::Yellow,
        _ => Color::White,
    }
}

/// The calling terminal, driven through an in-memory screen.
pub struct TermConsole {
    screen: ScreenConsole,
    initialized: bool,
    mouse: bool,
}

impl TermConsole {
    /// Size the screen after the real terminal, falling back to `fallback`.
    pub fn new(fallback: (u16, u16), mouse: bool) -> Self {
        let (cols, rows) = terminal::size().unwrap_or(fallback);
        Self {
            screen: ScreenConsole::new(cols, rows),
            initialized: false,
            mouse,
        }
    }

    pub fn screen(&self) -> ScreenConsole {
        self.screen.clone()
    }

    pub fn init(&mut self) -> Result<()> {
        terminal::enable_raw_mode().map_err(TtyError::console)?;
        let mut stdout = io::stdout();
        execute!(stdout, EnterAlternateScreen, DisableLineWrap, Clear(ClearType::All), MoveTo(0, 0))
            .map_err(TtyError::console)?;
        if self.mouse {
            execute!(stdout, event::EnableMouseCapture).map_err(TtyError::console)?;
        }
        execute!(stdout, event::EnableFocusChange).map_err(TtyError::console)?;
        self.initialized = true;
        self.screen.buffer().mark_all_dirty();
        debug!("terminal backend initialised");
        Ok(())
    }

    pub fn cleanup(&mut self) -> Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.initialized = false;
        let mut stdout = io::stdout();
        let _ = execute!(stdout, ResetColor, SetAttribute(Attribute::Reset), Show, EnableLineWrap);
        let _ = execute!(stdout, event::DisableFocusChange);
        if self.mouse {
            let _ = execute!(stdout, event::DisableMouseCapture);
        }
        let _ = execute!(stdout, LeaveAlternateScreen);
        let _ = stdout.flush();
        terminal::disable_raw_mode().map_err(TtyError::console)
    }

    fn render(&mut self) -> io::Result<()> {
        let mut buf = self.screen.buffer();
        let rows: Vec<usize> = if buf.full_redraw {
            (0..buf.rows as usize).collect()
        } else {
            buf.dirty_lines.iter().copied().collect()
        };

        let stdout = io::stdout();
        let mut out = io::BufWriter::with_capacity(65536, stdout.lock());

        // synchronized update
        write!(out, "\x1b[?2026h")?;
        queue!(out, Hide)?;
        let mut last_attr = None;
        for row in rows {
            let Some(cells) = buf.cells.get(row) else {
                continue;
            };
            queue!(out, MoveTo(0, row as u16))?;
            for cell in cells.iter().filter(|c| c.ch != CONTINUATION) {
                if last_attr != Some(cell.attr) {
                    queue!(
                        out,
                        SetAttribute(Attribute::Reset),
                        SetForegroundColor(win32_color(cell.attr & 0x0f)),
                        SetBackgroundColor(win32_color((cell.attr >> 4) & 0x0f))
                    )?;
                    if cell.attr & COMMON_LVB_UNDERSCORE != 0 {
                        queue!(out, SetAttribute(Attribute::Underlined))?;
                    }
                    last_attr = Some(cell.attr);
                }
                queue!(out, Print(cell.ch))?;
            }
        }
        queue!(out, ResetColor)?;
        if buf.cursor_visible {
            queue!(out, MoveTo(buf.cursor_x, buf.cursor_y), Show)?;
        }
        write!(out, "\x1b[?2026l")?;
        out.flush()?;
        buf.clear_dirty();
        Ok(())
    }
}

impl Drop for TermConsole {
    fn drop(&mut self) {
        if let Err(e) = self.cleanup() {
            warn!("terminal cleanup failed: {}", e);
        }
    }
}

impl ConsoleDevice for TermConsole {
    fn buffer_info(&mut self) -> Result<BufferInfo> {
        self.screen.buffer_info()
    }

    fn set_cursor(&mut self, x: u16, y: u16) -> Result<()> {
        self.screen.set_cursor(x, y)
    }

    fn set_attribute(&mut self, attr: u16) -> Result<()> {
        self.screen.set_attribute(attr)
    }

    fn write_text(&mut self, text: &str) -> Result<()> {
        self.screen.write_text(text)
    }

    fn fill(&mut self, x: u16, y: u16, len: usize, ch: char, attr: u16) -> Result<()> {
        self.screen.fill(x, y, len, ch, attr)
    }

    fn scroll(&mut self, src: Rect, clip: Rect, dest: (i32, i32), fill: CharInfo) -> Result<()> {
        self.screen.scroll(src, clip, dest, fill)
    }

    fn read_region(&mut self, rect: Rect) -> Result<Vec<CharInfo>> {
        self.screen.read_region(rect)
    }

    fn write_region(&mut self, rect: Rect, cells: &[CharInfo]) -> Result<()> {
        self.screen.write_region(rect, cells)
    }

    fn set_title(&mut self, title: &str) -> Result<()> {
        self.screen.set_title(title)?;
        if self.initialized {
            execute!(io::stdout(), SetTitle(title)).map_err(TtyError::console)?;
        }
        Ok(())
    }

    fn set_cursor_visible(&mut self, visible: bool) -> Result<()> {
        self.screen.set_cursor_visible(visible)
    }

    fn beep(&mut self) -> Result<()> {
        self.screen.beep()?;
        if self.initialized {
            let mut stdout = io::stdout();
            stdout.write_all(b"\x07").map_err(TtyError::console)?;
            stdout.flush().map_err(TtyError::console)?;
        }
        Ok(())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        self.screen.resize(cols, rows)
    }

    fn flush(&mut self) -> Result<()> {
        if !self.initialized {
            return Ok(());
        }
        self.render().map_err(TtyError::console)
    }
}

/// Input from the calling terminal.
#[derive(Debug, Default)]
pub struct CrosstermInput {
    /// Mouse buttons currently held, as `dwButtonState` bits.
    buttons: u32,
}

impl CrosstermInput {
    pub fn new() -> Self {
        Self::default()
    }

    fn convert(&mut self, ev: Event, out: &mut Vec<InputRecord>) {
        match ev {
            Event::Key(key) => out.extend(key_records(&key)),
            Event::Mouse(m) => {
                let state = control_state(m.modifiers);
                let (buttons, flags) = match m.kind {
                    MouseEventKind::Down(b) => {
                        self.buttons |= button_bit(b);
                        (self.buttons, 0)
                    }
                    MouseEventKind::Up(b) => {
                        self.buttons &= !button_bit(b);
                        (self.buttons, 0)
                    }
                    MouseEventKind::Drag(_) | MouseEventKind::Moved => (self.buttons, MOUSE_MOVED),
                    MouseEventKind::ScrollUp => ((120u32 << 16) | self.buttons, MOUSE_WHEELED),
                    MouseEventKind::ScrollDown => (((-120i16 as u16 as u32) << 16) | self.buttons, MOUSE_WHEELED),
                    MouseEventKind::ScrollLeft | MouseEventKind::ScrollRight => return,
                };
                out.push(InputRecord::Mouse {
                    x: m.column,
                    y: m.row,
                    buttons,
                    control_state: state,
                    flags,
                });
            }
            Event::FocusGained => out.push(InputRecord::Focus(true)),
            Event::FocusLost => out.push(InputRecord::Focus(false)),
            Event::Resize(cols, rows) => out.push(InputRecord::WindowBufferSize { cols, rows }),
            Event::Paste(text) => {
                for c in text.chars() {
                    let c = if c == '\n' { '\r' } else { c };
                    let mut units = [0u16; 2];
                    for unit in c.encode_utf16(&mut units).iter() {
                        out.push(InputRecord::Key {
                            key_down: true,
                            repeat_count: 1,
                            vk: 0,
                            scan: 0,
                            ch: *unit,
                            control_state: ControlKeyState::empty(),
                        });
                    }
                }
            }
        }
    }
}

impl ConsoleInput for CrosstermInput {
    fn read_input(&mut self, timeout: Option<Duration>) -> Result<Vec<InputRecord>> {
        if let Some(t) = timeout {
            if !event::poll(t).map_err(TtyError::console)? {
                return Ok(Vec::new());
            }
        }
        let mut out = Vec::new();
        loop {
            let ev = event::read().map_err(TtyError::console)?;
            self.convert(ev, &mut out);
            if !event::poll(Duration::ZERO).map_err(TtyError::console)? {
                break;
            }
        }
        Ok(out)
    }
}

fn control_state(mods: KeyModifiers) -> ControlKeyState {
    let mut s = ControlKeyState::empty();
    if mods.contains(KeyModifiers::SHIFT) {
        s |= ControlKeyState::SHIFT;
    }
    if mods.contains(KeyModifiers::CONTROL) {
        s |= ControlKeyState::LEFT_CTRL;
    }
    if mods.contains(KeyModifiers::ALT) {
        s |= ControlKeyState::LEFT_ALT;
    }
    s
}

fn button_bit(b: MouseButton) -> u32 {
    match b {
        MouseButton::Left => FROM_LEFT_1ST_BUTTON_PRESSED,
        MouseButton::Right => RIGHTMOST_BUTTON_PRESSED,
        MouseButton::Middle => FROM_LEFT_2ND_BUTTON_PRESSED,
    }
}

/// What a Win32 console would report for the same key. Characters outside
/// the BMP become a surrogate pair of key events.
pub fn key_records(key: &KeyEvent) -> Vec<InputRecord> {
    let state = control_state(key.modifiers);
    let key_down = key.kind != KeyEventKind::Release;
    let record = |vk: u16, ch: u16, control_state: ControlKeyState| InputRecord::Key {
        key_down,
        repeat_count: 1,
        vk,
        scan: 0,
        ch,
        control_state,
    };
    let (vk, ch) = match key.code {
        KeyCode::Char(c) => {
            let c = if state.ctrl() && (0x40..0x80).contains(&(c as u32)) {
                char::from(c as u8 & 0x1f)
            } else {
                c
            };
            let mut units = [0u16; 2];
            return c.encode_utf16(&mut units).iter().map(|&u| record(0, u, state)).collect();
        }
        KeyCode::Enter => (VK_RETURN, b'\r' as u16),
        KeyCode::Backspace => (VK_BACK, 0x08),
        KeyCode::Tab => (VK_TAB, b'\t' as u16),
        KeyCode::BackTab => return vec![record(VK_TAB, b'\t' as u16, ControlKeyState::SHIFT)],
        KeyCode::Esc => (VK_ESCAPE, 0x1b),
        KeyCode::Up => (VK_UP, 0),
        KeyCode::Down => (VK_DOWN, 0),
        KeyCode::Left => (VK_LEFT, 0),
        KeyCode::Right => (VK_RIGHT, 0),
        KeyCode::Home => (VK_HOME, 0),
        KeyCode::End => (VK_END, 0),
        KeyCode::PageUp => (VK_PRIOR, 0),
        KeyCode::PageDown => (VK_NEXT, 0),
        KeyCode::Insert => (VK_INSERT, 0),
        KeyCode::Delete => (VK_DELETE, 0),
        KeyCode::F(n @ 1..=12) => (VK_F1 + n as u16 - 1, 0),
        _ => return Vec::new(),
    };
    vec![record(vk, ch, state)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::console::input::{translate, ConsoleEvent};
    use crate::core::console::state::{Charset, DevConsole};

    fn bytes_for(key: KeyEvent) -> Option<Vec<u8>> {
        let mut con = DevConsole::new(Charset::Utf8);
        let mut out = None;
        for rec in key_records(&key) {
            if let Some(ConsoleEvent::Input(b)) = translate(&mut con, &rec) {
                out = Some(b);
            }
        }
        out
    }

    #[test]
    fn test_color_mapping() {
        assert_eq!(win32_color(0), Color::Black);
        assert_eq!(win32_color(FOREGROUND_RED), Color::DarkRed);
        assert_eq!(win32_color(FOREGROUND_RED | FOREGROUND_INTENSITY), Color::Red);
        assert_eq!(win32_color(DEFAULT_ATTRIBUTE), Color::Grey);
    }

    #[test]
    fn test_crossterm_keys_match_console_keys() {
        assert_eq!(bytes_for(KeyEvent::new(KeyCode::Char('a'), KeyModifiers::NONE)), Some(b"a".to_vec()));
        assert_eq!(bytes_for(KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL)), Some(vec![3]));
        assert_eq!(bytes_for(KeyEvent::new(KeyCode::Char('x'), KeyModifiers::ALT)), Some(vec![0x1b, b'x']));
        assert_eq!(bytes_for(KeyEvent::new(KeyCode::Enter, KeyModifiers::NONE)), Some(b"\r".to_vec()));
        assert_eq!(bytes_for(KeyEvent::new(KeyCode::Up, KeyModifiers::CONTROL)), Some(b"\x1b[1;5A".to_vec()));
        assert_eq!(bytes_for(KeyEvent::new(KeyCode::BackTab, KeyModifiers::SHIFT)), Some(b"\x1b[Z".to_vec()));
        assert_eq!(bytes_for(KeyEvent::new(KeyCode::F(5), KeyModifiers::NONE)), Some(b"\x1b[15~".to_vec()));
        assert_eq!(
            bytes_for(KeyEvent::new(KeyCode::Char('😀'), KeyModifiers::NONE)),
            Some("😀".as_bytes().to_vec())
        );
    }

    #[test]
    fn test_mouse_buttons_tracked() {
        use crossterm::event::MouseEvent;
        let mut input = CrosstermInput::new();
        let mut out = Vec::new();
        let ev = |kind| {
            Event::Mouse(MouseEvent {
                kind,
                column: 2,
                row: 3,
                modifiers: KeyModifiers::NONE,
            })
        };
        input.convert(ev(MouseEventKind::Down(MouseButton::Left)), &mut out);
        input.convert(ev(MouseEventKind::Drag(MouseButton::Left)), &mut out);
        input.convert(ev(MouseEventKind::Up(MouseButton::Left)), &mut out);
        let buttons: Vec<(u32, u32)> = out
            .iter()
            .map(|r| match r {
                InputRecord::Mouse { buttons, flags, .. } => (*buttons, *flags),
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(
            buttons,
            vec![(FROM_LEFT_1ST_BUTTON_PRESSED, 0), (FROM_LEFT_1ST_BUTTON_PRESSED, MOUSE_MOVED), (0, 0)]
        );
    }

    #[test]
    fn test_paste_becomes_keys() {
        let mut input = CrosstermInput::new();
        let mut out = Vec::new();
        input.convert(Event::Paste("a\nb".to_string()), &mut out);
        assert_eq!(out.len(), 3);
        assert_eq!(out[1], InputRecord::char_key('\r', ControlKeyState::empty()));
    }
}

//! Console device seam
//!
//! The escape engine drives a [`ConsoleDevice`] with the same primitive
//! operations a Win32 console screen buffer offers: cursor placement, the
//! current text attribute, fills, rectangle scrolls and region copies. Input
//! comes back from a [`ConsoleInput`] as [`InputRecord`]s.

use std::time::Duration;

use bitflags::bitflags;

use crate::core::error::Result;

// Win32 character attributes
pub const FOREGROUND_BLUE: u16 = 0x0001;
pub const FOREGROUND_GREEN: u16 = 0x0002;
pub const FOREGROUND_RED: u16 = 0x0004;
pub const FOREGROUND_INTENSITY: u16 = 0x0008;
pub const BACKGROUND_BLUE: u16 = 0x0010;
pub const BACKGROUND_GREEN: u16 = 0x0020;
pub const BACKGROUND_RED: u16 = 0x0040;
pub const BACKGROUND_INTENSITY: u16 = 0x0080;
pub const COMMON_LVB_REVERSE_VIDEO: u16 = 0x4000;
pub const COMMON_LVB_UNDERSCORE: u16 = 0x8000;

pub const FOREGROUND_MASK: u16 = FOREGROUND_BLUE | FOREGROUND_GREEN | FOREGROUND_RED | FOREGROUND_INTENSITY;
pub const BACKGROUND_MASK: u16 = BACKGROUND_BLUE | BACKGROUND_GREEN | BACKGROUND_RED | BACKGROUND_INTENSITY;

/// Light grey on black.
pub const DEFAULT_ATTRIBUTE: u16 = FOREGROUND_BLUE | FOREGROUND_GREEN | FOREGROUND_RED;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CharInfo {
    pub ch: char,
    pub attr: u16,
}

impl CharInfo {
    pub fn new(ch: char, attr: u16) -> Self {
        Self { ch, attr }
    }

    pub fn blank(attr: u16) -> Self {
        Self { ch: ' ', attr }
    }
}

impl Default for CharInfo {
    fn default() -> Self {
        Self::blank(DEFAULT_ATTRIBUTE)
    }
}

/// Inclusive rectangle in buffer coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self { left, top, right, bottom }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left + 1
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top + 1
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.left && x <= self.right && y >= self.top && y <= self.bottom
    }

    pub fn intersect(&self, other: &Rect) -> Option<Rect> {
        let r = Rect::new(
            self.left.max(other.left),
            self.top.max(other.top),
            self.right.min(other.right),
            self.bottom.min(other.bottom),
        );
        (r.left <= r.right && r.top <= r.bottom).then_some(r)
    }
}

/// What `GetConsoleScreenBufferInfo` reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferInfo {
    pub cols: u16,
    pub rows: u16,
    pub cursor_x: u16,
    pub cursor_y: u16,
    pub attributes: u16,
}

pub trait ConsoleDevice: Send {
    fn buffer_info(&mut self) -> Result<BufferInfo>;
    fn set_cursor(&mut self, x: u16, y: u16) -> Result<()>;
    fn set_attribute(&mut self, attr: u16) -> Result<()>;
    /// Write printable text at the cursor with the current attribute. No
    /// wrapping: the cursor stops in the last column.
    fn write_text(&mut self, text: &str) -> Result<()>;
    /// Fill `len` cells starting at (x, y), continuing on following rows.
    fn fill(&mut self, x: u16, y: u16, len: usize, ch: char, attr: u16) -> Result<()>;
    /// `ScrollConsoleScreenBuffer`: move `src` so its top-left lands on
    /// `dest`, only touching cells inside `clip`; uncovered source cells inside
    /// `clip` get `fill`.
    fn scroll(&mut self, src: Rect, clip: Rect, dest: (i32, i32), fill: CharInfo) -> Result<()>;
    fn read_region(&mut self, rect: Rect) -> Result<Vec<CharInfo>>;
    fn write_region(&mut self, rect: Rect, cells: &[CharInfo]) -> Result<()>;
    fn set_title(&mut self, title: &str) -> Result<()>;
    fn set_cursor_visible(&mut self, visible: bool) -> Result<()>;
    fn beep(&mut self) -> Result<()>;
    fn resize(&mut self, cols: u16, rows: u16) -> Result<()>;
    /// Push pending changes to the real screen, if there is one.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

bitflags! {
    /// `dwControlKeyState`
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ControlKeyState: u32 {
        const RIGHT_ALT  = 0x0001;
        const LEFT_ALT   = 0x0002;
        const RIGHT_CTRL = 0x0004;
        const LEFT_CTRL  = 0x0008;
        const SHIFT      = 0x0010;
        const NUMLOCK    = 0x0020;
        const SCROLLLOCK = 0x0040;
        const CAPSLOCK   = 0x0080;
        const ENHANCED   = 0x0100;
    }
}

impl ControlKeyState {
    pub fn alt(self) -> bool {
        self.intersects(Self::LEFT_ALT | Self::RIGHT_ALT)
    }

    pub fn ctrl(self) -> bool {
        self.intersects(Self::LEFT_CTRL | Self::RIGHT_CTRL)
    }

    pub fn shift(self) -> bool {
        self.contains(Self::SHIFT)
    }

    /// Windows reports AltGr as LeftCtrl+RightAlt.
    pub fn altgr(self) -> bool {
        self.contains(Self::LEFT_CTRL | Self::RIGHT_ALT)
    }
}

pub const FROM_LEFT_1ST_BUTTON_PRESSED: u32 = 0x0001;
pub const RIGHTMOST_BUTTON_PRESSED: u32 = 0x0002;
pub const FROM_LEFT_2ND_BUTTON_PRESSED: u32 = 0x0004;

pub const MOUSE_MOVED: u32 = 0x0001;
pub const DOUBLE_CLICK: u32 = 0x0002;
pub const MOUSE_WHEELED: u32 = 0x0004;
pub const MOUSE_HWHEELED: u32 = 0x0008;

// Virtual key codes the input translator knows about
pub const VK_BACK: u16 = 0x08;
pub const VK_TAB: u16 = 0x09;
pub const VK_RETURN: u16 = 0x0d;
pub const VK_ESCAPE: u16 = 0x1b;
pub const VK_SPACE: u16 = 0x20;
pub const VK_PRIOR: u16 = 0x21;
pub const VK_NEXT: u16 = 0x22;
pub const VK_END: u16 = 0x23;
pub const VK_HOME: u16 = 0x24;
pub const VK_LEFT: u16 = 0x25;
pub const VK_UP: u16 = 0x26;
pub const VK_RIGHT: u16 = 0x27;
pub const VK_DOWN: u16 = 0x28;
pub const VK_INSERT: u16 = 0x2d;
pub const VK_DELETE: u16 = 0x2e;
pub const VK_F1: u16 = 0x70;
pub const VK_F12: u16 = 0x7b;

/// `INPUT_RECORD`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputRecord {
    Key {
        key_down: bool,
        repeat_count: u16,
        vk: u16,
        scan: u16,
        /// UTF-16 code unit, 0 for keys without a character.
        ch: u16,
        control_state: ControlKeyState,
    },
    Mouse {
        x: u16,
        y: u16,
        buttons: u32,
        control_state: ControlKeyState,
        flags: u32,
    },
    Focus(bool),
    WindowBufferSize { cols: u16, rows: u16 },
}

impl InputRecord {
    /// A key press carrying a character.
    pub fn char_key(c: char, control_state: ControlKeyState) -> Self {
        let mut units = [0u16; 2];
        let ch = c.encode_utf16(&mut units)[0];
        InputRecord::Key {
            key_down: true,
            repeat_count: 1,
            vk: 0,
            scan: 0,
            ch,
            control_state,
        }
    }

    /// A key press of a character-less virtual key.
    pub fn vk_key(vk: u16, control_state: ControlKeyState) -> Self {
        InputRecord::Key {
            key_down: true,
            repeat_count: 1,
            vk,
            scan: 0,
            ch: 0,
            control_state,
        }
    }
}

pub trait ConsoleInput: Send {
    /// Wait up to `timeout` (forever for `None`) for input records.
    /// An empty vector means the wait timed out.
    fn read_input(&mut self, timeout: Option<Duration>) -> Result<Vec<InputRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rect_intersect() {
        let a = Rect::new(0, 0, 79, 24);
        let b = Rect::new(10, 20, 100, 30);
        assert_eq!(a.intersect(&b), Some(Rect::new(10, 20, 79, 24)));
        assert_eq!(a.intersect(&Rect::new(80, 0, 90, 5)), None);
        assert_eq!(Rect::new(2, 3, 4, 8).height(), 6);
    }

    #[test]
    fn test_control_key_state() {
        let s = ControlKeyState::LEFT_CTRL | ControlKeyState::RIGHT_ALT;
        assert!(s.altgr());
        assert!(s.ctrl() && s.alt());
        assert!(!ControlKeyState::LEFT_ALT.altgr());
    }

    #[test]
    fn test_char_key_surrogates() {
        match InputRecord::char_key('\u{1F600}', ControlKeyState::empty()) {
            InputRecord::Key { ch, .. } => assert_eq!(ch, 0xd83d),
            other => panic!("unexpected {:?}", other),
        }
    }
}

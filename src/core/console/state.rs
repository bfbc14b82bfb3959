//! Shared per-console state
//!
//! Everything the escape engine and the input translator remember between
//! calls lives in [`DevConsole`]: parser position, current rendition, scroll
//! region, saved screen, mouse and keyboard modes. One instance exists per
//! console window and every handle open on that window uses it, so a sequence
//! split across two `write` calls from different handles still parses.

use std::str::FromStr;

use super::device::*;
use crate::core::error::TtyError;

pub const MAXARGS: usize = 10;
/// Longest window title kept from an OSC sequence.
pub const TITLESIZE: usize = 1024;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AnsiState {
    #[default]
    Normal,
    GotEsc,
    GotSquare,
    GotArg1,
    GotCommand,
    GotRSquare,
    GetTitle,
    EatTitle,
    GotParen,
    GotRParen,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Charset {
    #[default]
    Utf8,
    Latin1,
}

impl FromStr for Charset {
    type Err = TtyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Ok(Charset::Utf8),
            "latin1" | "latin-1" | "iso-8859-1" => Ok(Charset::Latin1),
            other => Err(TtyError::invalid(format!("unknown charset {}", other))),
        }
    }
}

impl Charset {
    pub fn name(self) -> &'static str {
        match self {
            Charset::Utf8 => "utf-8",
            Charset::Latin1 => "latin1",
        }
    }

    /// Encode one character for the input stream.
    pub fn encode(self, c: char) -> Vec<u8> {
        match self {
            Charset::Utf8 => c.to_string().into_bytes(),
            Charset::Latin1 => vec![if (c as u32) < 0x100 { c as u8 } else { b'?' }],
        }
    }
}

/// Screen contents kept by `CSI ? 47 h`.
#[derive(Clone, Debug)]
pub struct SavedScreen {
    pub cols: u16,
    pub rows: u16,
    pub cells: Vec<CharInfo>,
    pub cursor: (u16, u16),
}

#[derive(Clone, Debug)]
pub struct DevConsole {
    pub state: AnsiState,
    pub args: [u32; MAXARGS],
    /// Index of the argument being collected.
    pub nargs: usize,
    pub saw_question_mark: bool,
    pub saw_greater_than: bool,
    /// An intermediate byte was seen; the command is not one we know.
    pub saw_intermediate: bool,
    /// ESC seen inside an OSC string.
    pub osc_esc: bool,

    // rendition, as 4-bit Win32 colour indices
    pub default_fg: u16,
    pub default_bg: u16,
    pub fg: u16,
    pub bg: u16,
    pub bold: bool,
    pub dim: bool,
    pub underline: bool,
    pub blink: bool,
    pub reverse: bool,
    pub invisible: bool,
    pub current_attr: u16,

    /// Scroll region rows, inclusive. `None` means the window edge.
    pub scroll_top: Option<u16>,
    pub scroll_bottom: Option<u16>,
    pub saved_cursor: Option<(u16, u16)>,
    pub savebuf: Option<SavedScreen>,
    pub title: Vec<u8>,
    pub insert_mode: bool,
    pub cursor_visible: bool,
    /// The last write ended in the last column; the next character wraps.
    pub wrap_pending: bool,

    /// 0 (off), 1000, 1002 or 1003
    pub use_mouse: u16,
    pub ext_mouse_mode5: bool,
    pub ext_mouse_mode6: bool,
    pub ext_mouse_mode15: bool,
    pub use_focus: bool,
    pub last_button_state: u32,
    pub last_mouse_pos: Option<(u16, u16)>,

    /// Modifier state for `TIOCLINUX`: shift 1, altgr 2, ctrl 4, alt 8.
    pub n_modifiers: u8,
    pub cursor_key_app_mode: bool,
    /// Alt prefixes ESC instead of setting the high bit.
    pub metabit: bool,
    pub pending_surrogate: Option<u16>,

    /// SO is active (G1 selected).
    pub shift_out: bool,
    pub g0_graphics: bool,
    pub g1_graphics: bool,

    /// Bytes of a multibyte character cut off by the end of a write.
    pub trunc_buf: Vec<u8>,
    pub charset: Charset,
}

impl Default for DevConsole {
    fn default() -> Self {
        Self::new(Charset::Utf8)
    }
}

impl DevConsole {
    pub fn new(charset: Charset) -> Self {
        let mut con = Self {
            state: AnsiState::Normal,
            args: [0; MAXARGS],
            nargs: 0,
            saw_question_mark: false,
            saw_greater_than: false,
            saw_intermediate: false,
            osc_esc: false,
            default_fg: DEFAULT_ATTRIBUTE & 0x0f,
            default_bg: (DEFAULT_ATTRIBUTE >> 4) & 0x0f,
            fg: 0,
            bg: 0,
            bold: false,
            dim: false,
            underline: false,
            blink: false,
            reverse: false,
            invisible: false,
            current_attr: DEFAULT_ATTRIBUTE,
            scroll_top: None,
            scroll_bottom: None,
            saved_cursor: None,
            savebuf: None,
            title: Vec::new(),
            insert_mode: false,
            cursor_visible: true,
            wrap_pending: false,
            use_mouse: 0,
            ext_mouse_mode5: false,
            ext_mouse_mode6: false,
            ext_mouse_mode15: false,
            use_focus: false,
            last_button_state: 0,
            last_mouse_pos: None,
            n_modifiers: 0,
            cursor_key_app_mode: false,
            metabit: true,
            pending_surrogate: None,
            shift_out: false,
            g0_graphics: false,
            g1_graphics: false,
            trunc_buf: Vec::new(),
            charset,
        };
        con.set_default_attr();
        con
    }

    /// Take the defaults from the attribute the console had when opened.
    pub fn set_default_colors(&mut self, attr: u16) {
        self.default_fg = attr & 0x0f;
        self.default_bg = (attr >> 4) & 0x0f;
        self.set_default_attr();
    }

    /// `SGR 0`
    pub fn set_default_attr(&mut self) {
        self.fg = self.default_fg;
        self.bg = self.default_bg;
        self.bold = false;
        self.dim = false;
        self.underline = false;
        self.blink = false;
        self.reverse = false;
        self.invisible = false;
        self.set_color();
    }

    /// Recompute the Win32 attribute from the rendition flags.
    pub fn set_color(&mut self) -> u16 {
        let mut fg = self.fg & 0x0f;
        let mut bg = self.bg & 0x0f;
        if self.bold {
            fg |= FOREGROUND_INTENSITY;
        }
        if self.dim {
            fg &= !FOREGROUND_INTENSITY;
        }
        if self.blink {
            bg |= FOREGROUND_INTENSITY;
        }
        if self.reverse {
            std::mem::swap(&mut fg, &mut bg);
        }
        if self.invisible {
            fg = bg;
        }
        let mut attr = fg | (bg << 4);
        if self.underline {
            attr |= COMMON_LVB_UNDERSCORE;
        }
        self.current_attr = attr;
        attr
    }

    /// Forget a half-parsed sequence.
    pub fn reset_parser(&mut self) {
        self.state = AnsiState::Normal;
        self.args = [0; MAXARGS];
        self.nargs = 0;
        self.saw_question_mark = false;
        self.saw_greater_than = false;
        self.saw_intermediate = false;
        self.osc_esc = false;
    }

    /// `ESC c`: everything but the charset and the colour defaults.
    pub fn reset(&mut self) {
        let charset = self.charset;
        let (fg, bg) = (self.default_fg, self.default_bg);
        *self = Self::new(charset);
        self.default_fg = fg;
        self.default_bg = bg;
        self.set_default_attr();
    }

    /// Scroll region clamped to a window of `rows` rows.
    pub fn scroll_region(&self, rows: u16) -> (u16, u16) {
        let last = rows.saturating_sub(1);
        let top = self.scroll_top.unwrap_or(0).min(last);
        let bottom = self.scroll_bottom.unwrap_or(last).min(last);
        if top < bottom {
            (top, bottom)
        } else {
            (0, last)
        }
    }

    /// Argument `i`, or `default` when it was omitted or zero.
    pub fn arg_or(&self, i: usize, default: u32) -> u32 {
        match self.args.get(i) {
            Some(&v) if v != 0 && i <= self.nargs => v,
            _ => default,
        }
    }

    pub fn graphics_active(&self) -> bool {
        if self.shift_out {
            self.g1_graphics
        } else {
            self.g0_graphics
        }
    }

    /// Map a character through the DEC special graphics set when selected.
    pub fn translate_char(&self, c: char) -> char {
        if !self.graphics_active() {
            return c;
        }
        match c {
            '_' => ' ',
            '`' => '◆',
            'a' => '▒',
            'b' => '␉',
            'c' => '␌',
            'd' => '␍',
            'e' => '␊',
            'f' => '°',
            'g' => '±',
            'h' => '␤',
            'i' => '␋',
            'j' => '┘',
            'k' => '┐',
            'l' => '┌',
            'm' => '└',
            'n' => '┼',
            'o' => '⎺',
            'p' => '⎻',
            'q' => '─',
            'r' => '⎼',
            's' => '⎽',
            't' => '├',
            'u' => '┤',
            'v' => '┴',
            'w' => '┬',
            'x' => '│',
            'y' => '≤',
            'z' => '≥',
            '{' => 'π',
            '|' => '≠',
            '}' => '£',
            '~' => '·',
            other => other,
        }
    }

    /// Whether mouse reports are wanted at all.
    pub fn mouse_active(&self) -> bool {
        self.use_mouse != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_attr() {
        let con = DevConsole::new(Charset::Utf8);
        assert_eq!(con.current_attr, DEFAULT_ATTRIBUTE);
    }

    #[test]
    fn test_reverse_bold_invisible() {
        let mut con = DevConsole::new(Charset::Utf8);
        con.fg = FOREGROUND_RED;
        con.bold = true;
        assert_eq!(con.set_color(), FOREGROUND_RED | FOREGROUND_INTENSITY);
        con.reverse = true;
        assert_eq!(con.set_color(), (FOREGROUND_RED | FOREGROUND_INTENSITY) << 4);
        con.reverse = false;
        con.invisible = true;
        assert_eq!(con.set_color(), 0);
    }

    #[test]
    fn test_blink_uses_background_intensity() {
        let mut con = DevConsole::new(Charset::Utf8);
        con.blink = true;
        assert_eq!(con.set_color() & BACKGROUND_INTENSITY, BACKGROUND_INTENSITY);
    }

    #[test]
    fn test_scroll_region_clamped() {
        let mut con = DevConsole::new(Charset::Utf8);
        assert_eq!(con.scroll_region(24), (0, 23));
        con.scroll_top = Some(5);
        con.scroll_bottom = Some(40);
        assert_eq!(con.scroll_region(24), (5, 23));
        con.scroll_bottom = Some(2);
        assert_eq!(con.scroll_region(24), (0, 23));
    }

    #[test]
    fn test_graphics_charset() {
        let mut con = DevConsole::new(Charset::Utf8);
        assert_eq!(con.translate_char('q'), 'q');
        con.g1_graphics = true;
        con.shift_out = true;
        assert_eq!(con.translate_char('q'), '─');
        con.shift_out = false;
        assert_eq!(con.translate_char('x'), 'x');
    }

    #[test]
    fn test_charset_names() {
        assert_eq!("UTF-8".parse::<Charset>().unwrap(), Charset::Utf8);
        assert_eq!("latin1".parse::<Charset>().unwrap(), Charset::Latin1);
        assert!("koi8".parse::<Charset>().is_err());
        assert_eq!(Charset::Latin1.encode('é'), vec![0xe9]);
    }
}

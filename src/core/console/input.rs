//! Console input translation
//!
//! Turns [`InputRecord`]s into the byte sequences an xterm-compatible
//! terminal would send.

use std::time::{Duration, Instant};

use tracing::trace;

use super::device::*;
use super::state::DevConsole;
use crate::core::termios::{LocalFlags, Winsize, VINTR};
use crate::core::tty::TtyRecord;

/// What one input record turns into.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConsoleEvent {
    /// Bytes for the line discipline.
    Input(Vec<u8>),
    /// Answers to terminal queries; they skip the line discipline.
    Response(Vec<u8>),
    Resize(Winsize),
}

// TIOCLINUX shift state bits
const MOD_SHIFT: u8 = 1;
const MOD_ALTGR: u8 = 2;
const MOD_CTRL: u8 = 4;
const MOD_ALT: u8 = 8;

pub fn translate(con: &mut DevConsole, rec: &InputRecord) -> Option<ConsoleEvent> {
    match *rec {
        InputRecord::Key {
            key_down,
            repeat_count,
            vk,
            ch,
            control_state,
            ..
        } => {
            con.n_modifiers = shift_state(control_state);
            if !key_down {
                return None;
            }
            let bytes = key_bytes(con, vk, ch, control_state)?;
            let n = repeat_count.max(1) as usize;
            Some(ConsoleEvent::Input(bytes.repeat(n)))
        }
        InputRecord::Mouse {
            x,
            y,
            buttons,
            control_state,
            flags,
        } => {
            if !con.mouse_active() {
                return None;
            }
            mouse_report(con, x, y, buttons, control_state, flags).map(ConsoleEvent::Input)
        }
        InputRecord::Focus(gained) => {
            if !con.use_focus {
                return None;
            }
            let seq: &[u8] = if gained { b"\x1b[I" } else { b"\x1b[O" };
            Some(ConsoleEvent::Input(seq.to_vec()))
        }
        InputRecord::WindowBufferSize { cols, rows } => Some(ConsoleEvent::Resize(Winsize::new(cols, rows))),
    }
}

/// Drop a repeated Ctrl-C arriving within `slop` of the last accepted one.
/// Returns true when `bytes` should be thrown away.
pub fn debounce_ctrl_c(tty: &TtyRecord, bytes: &[u8], slop: Duration) -> bool {
    let mut state = tty.acquire();
    if bytes.len() != 1 || !state.ti.lflag.contains(LocalFlags::ISIG) || !state.ti.is_cc(VINTR, bytes[0]) {
        return false;
    }
    let now = Instant::now();
    if let Some(last) = state.last_ctrl_c {
        if now.duration_since(last) < slop {
            trace!("{}: ctrl-c within {:?}, dropped", state.ntty, slop);
            return true;
        }
    }
    state.last_ctrl_c = Some(now);
    false
}

fn shift_state(s: ControlKeyState) -> u8 {
    let mut m = 0;
    if s.shift() {
        m |= MOD_SHIFT;
    }
    if s.altgr() {
        m |= MOD_ALTGR;
        if s.contains(ControlKeyState::RIGHT_CTRL) {
            m |= MOD_CTRL;
        }
        if s.contains(ControlKeyState::LEFT_ALT) {
            m |= MOD_ALT;
        }
    } else {
        if s.ctrl() {
            m |= MOD_CTRL;
        }
        if s.alt() {
            m |= MOD_ALT;
        }
    }
    m
}

/// xterm modifier parameter
fn modifier_code(s: ControlKeyState) -> u8 {
    1 + if s.shift() { 1 } else { 0 } + if s.alt() { 2 } else { 0 } + if s.ctrl() { 4 } else { 0 }
}

fn key_bytes(con: &mut DevConsole, vk: u16, ch: u16, state: ControlKeyState) -> Option<Vec<u8>> {
    if ch != 0 {
        let c = match ch {
            0xd800..=0xdbff => {
                con.pending_surrogate = Some(ch);
                return None;
            }
            0xdc00..=0xdfff => {
                let hi = con.pending_surrogate.take()?;
                char::decode_utf16([hi, ch]).next()?.ok()?
            }
            _ => {
                con.pending_surrogate = None;
                char::from_u32(ch as u32)?
            }
        };
        if vk == VK_TAB && state.shift() {
            return Some(b"\x1b[Z".to_vec());
        }
        return Some(char_bytes(con, c, state));
    }

    let m = modifier_code(state);
    let app = con.cursor_key_app_mode;
    let seq = match vk {
        VK_SPACE | 0x32 if state.ctrl() => vec![0],
        VK_UP => cursor_key(b'A', m, app),
        VK_DOWN => cursor_key(b'B', m, app),
        VK_RIGHT => cursor_key(b'C', m, app),
        VK_LEFT => cursor_key(b'D', m, app),
        VK_HOME => cursor_key(b'H', m, app),
        VK_END => cursor_key(b'F', m, app),
        VK_INSERT => tilde_key(2, m),
        VK_DELETE => tilde_key(3, m),
        VK_PRIOR => tilde_key(5, m),
        VK_NEXT => tilde_key(6, m),
        VK_F1..=VK_F12 => function_key((vk - VK_F1 + 1) as u8, m),
        _ => return None,
    };
    Some(seq)
}

fn char_bytes(con: &DevConsole, c: char, state: ControlKeyState) -> Vec<u8> {
    let mut bytes = con.charset.encode(c);
    if state.altgr() {
        return bytes;
    }
    if state.ctrl() && c == ' ' {
        return vec![0];
    }
    if state.alt() {
        if con.metabit {
            bytes.insert(0, 0x1b);
        } else if bytes.len() == 1 && bytes[0] < 0x80 {
            bytes[0] |= 0x80;
        }
    }
    bytes
}

fn cursor_key(key: u8, m: u8, app: bool) -> Vec<u8> {
    if m > 1 {
        format!("\x1b[1;{}{}", m, key as char).into_bytes()
    } else if app {
        vec![0x1b, b'O', key]
    } else {
        vec![0x1b, b'[', key]
    }
}

fn tilde_key(code: u8, m: u8) -> Vec<u8> {
    if m > 1 {
        format!("\x1b[{};{}~", code, m).into_bytes()
    } else {
        format!("\x1b[{}~", code).into_bytes()
    }
}

fn function_key(n: u8, m: u8) -> Vec<u8> {
    let code = match n {
        1..=4 => {
            let key = b"PQRS"[n as usize - 1];
            return if m > 1 {
                format!("\x1b[1;{}{}", m, key as char).into_bytes()
            } else {
                vec![0x1b, b'O', key]
            };
        }
        5 => 15,
        6 => 17,
        7 => 18,
        8 => 19,
        9 => 20,
        10 => 21,
        11 => 23,
        12 => 24,
        _ => return Vec::new(),
    };
    tilde_key(code, m)
}

fn button_code(bits: u32) -> Option<u32> {
    if bits & FROM_LEFT_1ST_BUTTON_PRESSED != 0 {
        Some(0)
    } else if bits & FROM_LEFT_2ND_BUTTON_PRESSED != 0 {
        Some(1)
    } else if bits & RIGHTMOST_BUTTON_PRESSED != 0 {
        Some(2)
    } else {
        None
    }
}

const BUTTON_BITS: u32 = FROM_LEFT_1ST_BUTTON_PRESSED | RIGHTMOST_BUTTON_PRESSED | FROM_LEFT_2ND_BUTTON_PRESSED;

fn mouse_report(
    con: &mut DevConsole,
    x: u16,
    y: u16,
    buttons: u32,
    state: ControlKeyState,
    flags: u32,
) -> Option<Vec<u8>> {
    let (code, release) = if flags & MOUSE_WHEELED != 0 {
        let delta = (buttons >> 16) as u16 as i16;
        (if delta > 0 { 64 } else { 65 }, false)
    } else if flags & MOUSE_MOVED != 0 {
        let held = buttons & BUTTON_BITS;
        let wanted = con.use_mouse == 1003 || (con.use_mouse == 1002 && held != 0);
        if !wanted || con.last_mouse_pos == Some((x, y)) {
            return None;
        }
        con.last_mouse_pos = Some((x, y));
        (button_code(held).unwrap_or(3) + 32, false)
    } else {
        let changed = (buttons ^ con.last_button_state) & BUTTON_BITS;
        let code = button_code(changed)?;
        con.last_button_state = buttons & BUTTON_BITS;
        con.last_mouse_pos = Some((x, y));
        (code, buttons & changed == 0)
    };

    let mut mods = 0;
    if state.shift() {
        mods += 4;
    }
    if state.alt() {
        mods += 8;
    }
    if state.ctrl() {
        mods += 16;
    }
    let (col, row) = (x as u32 + 1, y as u32 + 1);

    if con.ext_mouse_mode6 {
        let suffix = if release { 'm' } else { 'M' };
        return Some(format!("\x1b[<{};{};{}{}", code + mods, col, row, suffix).into_bytes());
    }
    let b = if release { 3 } else { code } + mods;
    if con.ext_mouse_mode15 {
        return Some(format!("\x1b[{};{};{}M", b + 32, col, row).into_bytes());
    }
    let mut out = b"\x1b[M".to_vec();
    if con.ext_mouse_mode5 {
        for v in [b + 32, col + 32, row + 32] {
            let c = char::from_u32(if v > 2047 { 0 } else { v }).unwrap_or('\0');
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        }
    } else {
        for v in [b + 32, col + 32, row + 32] {
            out.push(if v > 255 { 0 } else { v as u8 });
        }
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::console::state::Charset;
    use crate::core::tty::DeviceId;

    fn con() -> DevConsole {
        DevConsole::new(Charset::Utf8)
    }

    fn input(con: &mut DevConsole, rec: InputRecord) -> Option<Vec<u8>> {
        match translate(con, &rec) {
            Some(ConsoleEvent::Input(b)) => Some(b),
            None => None,
            other => panic!("unexpected {:?}", other),
        }
    }

    const NONE: ControlKeyState = ControlKeyState::empty();

    #[test]
    fn test_plain_and_repeated_keys() {
        let mut c = con();
        assert_eq!(input(&mut c, InputRecord::char_key('a', NONE)), Some(b"a".to_vec()));
        let rec = InputRecord::Key {
            key_down: true,
            repeat_count: 3,
            vk: 0,
            scan: 0,
            ch: 'z' as u16,
            control_state: NONE,
        };
        assert_eq!(input(&mut c, rec), Some(b"zzz".to_vec()));
    }

    #[test]
    fn test_key_up_only_updates_modifiers() {
        let mut c = con();
        let rec = InputRecord::Key {
            key_down: false,
            repeat_count: 1,
            vk: 0x10,
            scan: 0,
            ch: 0,
            control_state: ControlKeyState::SHIFT | ControlKeyState::LEFT_CTRL,
        };
        assert_eq!(input(&mut c, rec), None);
        assert_eq!(c.n_modifiers, MOD_SHIFT | MOD_CTRL);
    }

    #[test]
    fn test_surrogate_pair_combined() {
        let mut c = con();
        let mut units = [0u16; 2];
        '😀'.encode_utf16(&mut units);
        let key = |ch| InputRecord::Key {
            key_down: true,
            repeat_count: 1,
            vk: 0,
            scan: 0,
            ch,
            control_state: NONE,
        };
        assert_eq!(input(&mut c, key(units[0])), None);
        assert_eq!(input(&mut c, key(units[1])), Some("😀".as_bytes().to_vec()));
        // a lone low surrogate produces nothing
        assert_eq!(input(&mut c, key(units[1])), None);
    }

    #[test]
    fn test_alt_and_altgr() {
        let mut c = con();
        assert_eq!(
            input(&mut c, InputRecord::char_key('x', ControlKeyState::LEFT_ALT)),
            Some(vec![0x1b, b'x'])
        );
        let altgr = ControlKeyState::LEFT_CTRL | ControlKeyState::RIGHT_ALT;
        assert_eq!(input(&mut c, InputRecord::char_key('@', altgr)), Some(b"@".to_vec()));
        assert_eq!(c.n_modifiers, MOD_ALTGR);
        c.metabit = false;
        assert_eq!(
            input(&mut c, InputRecord::char_key('x', ControlKeyState::LEFT_ALT)),
            Some(vec![b'x' | 0x80])
        );
    }

    #[test]
    fn test_ctrl_space_is_nul() {
        let mut c = con();
        assert_eq!(
            input(&mut c, InputRecord::char_key(' ', ControlKeyState::LEFT_CTRL)),
            Some(vec![0])
        );
    }

    #[test]
    fn test_cursor_keys() {
        let mut c = con();
        assert_eq!(input(&mut c, InputRecord::vk_key(VK_UP, NONE)), Some(b"\x1b[A".to_vec()));
        assert_eq!(
            input(&mut c, InputRecord::vk_key(VK_UP, ControlKeyState::LEFT_CTRL)),
            Some(b"\x1b[1;5A".to_vec())
        );
        c.cursor_key_app_mode = true;
        assert_eq!(input(&mut c, InputRecord::vk_key(VK_LEFT, NONE)), Some(b"\x1bOD".to_vec()));
        assert_eq!(input(&mut c, InputRecord::vk_key(VK_DELETE, NONE)), Some(b"\x1b[3~".to_vec()));
        assert_eq!(
            input(&mut c, InputRecord::vk_key(VK_NEXT, ControlKeyState::SHIFT)),
            Some(b"\x1b[6;2~".to_vec())
        );
    }

    #[test]
    fn test_function_keys() {
        let mut c = con();
        assert_eq!(input(&mut c, InputRecord::vk_key(VK_F1, NONE)), Some(b"\x1bOP".to_vec()));
        assert_eq!(
            input(&mut c, InputRecord::vk_key(VK_F1 + 4, ControlKeyState::SHIFT)),
            Some(b"\x1b[15;2~".to_vec())
        );
        assert_eq!(input(&mut c, InputRecord::vk_key(VK_F12, NONE)), Some(b"\x1b[24~".to_vec()));
        assert_eq!(input(&mut c, InputRecord::vk_key(0x10, NONE)), None);
    }

    #[test]
    fn test_shift_tab() {
        let mut c = con();
        let rec = InputRecord::Key {
            key_down: true,
            repeat_count: 1,
            vk: VK_TAB,
            scan: 0,
            ch: 9,
            control_state: ControlKeyState::SHIFT,
        };
        assert_eq!(input(&mut c, rec), Some(b"\x1b[Z".to_vec()));
    }

    fn mouse(x: u16, y: u16, buttons: u32, flags: u32) -> InputRecord {
        InputRecord::Mouse {
            x,
            y,
            buttons,
            control_state: NONE,
            flags,
        }
    }

    #[test]
    fn test_mouse_needs_tracking_mode() {
        let mut c = con();
        assert_eq!(input(&mut c, mouse(1, 1, FROM_LEFT_1ST_BUTTON_PRESSED, 0)), None);
    }

    #[test]
    fn test_mouse_sgr_press_release() {
        let mut c = con();
        c.use_mouse = 1000;
        c.ext_mouse_mode6 = true;
        assert_eq!(
            input(&mut c, mouse(9, 4, RIGHTMOST_BUTTON_PRESSED, 0)),
            Some(b"\x1b[<2;10;5M".to_vec())
        );
        assert_eq!(input(&mut c, mouse(9, 4, 0, 0)), Some(b"\x1b[<2;10;5m".to_vec()));
    }

    #[test]
    fn test_mouse_x10_and_urxvt() {
        let mut c = con();
        c.use_mouse = 1000;
        assert_eq!(
            input(&mut c, mouse(0, 0, FROM_LEFT_1ST_BUTTON_PRESSED, 0)),
            Some(vec![0x1b, b'[', b'M', 32, 33, 33])
        );
        // release is button 3; out-of-range column encodes as 0
        assert_eq!(input(&mut c, mouse(300, 5, 0, 0)), Some(vec![0x1b, b'[', b'M', 35, 0, 38]));
        c.ext_mouse_mode15 = true;
        assert_eq!(
            input(&mut c, mouse(300, 5, FROM_LEFT_1ST_BUTTON_PRESSED, 0)),
            Some(b"\x1b[32;301;6M".to_vec())
        );
    }

    #[test]
    fn test_mouse_utf8_encoding() {
        let mut c = con();
        c.use_mouse = 1000;
        c.ext_mouse_mode5 = true;
        let out = input(&mut c, mouse(200, 0, FROM_LEFT_1ST_BUTTON_PRESSED, 0)).unwrap();
        // column 201 + 32 = U+00E9
        assert_eq!(out, b"\x1b[M \xc3\xa9!".to_vec());
    }

    #[test]
    fn test_mouse_wheel_and_motion() {
        let mut c = con();
        c.use_mouse = 1002;
        c.ext_mouse_mode6 = true;
        assert_eq!(
            input(&mut c, mouse(3, 3, 120u32 << 16, MOUSE_WHEELED)),
            Some(b"\x1b[<64;4;4M".to_vec())
        );
        let down = (-120i16 as u16 as u32) << 16;
        assert_eq!(input(&mut c, mouse(3, 3, down, MOUSE_WHEELED)), Some(b"\x1b[<65;4;4M".to_vec()));
        // 1002 reports motion only with a button held
        assert_eq!(input(&mut c, mouse(4, 3, 0, MOUSE_MOVED)), None);
        input(&mut c, mouse(4, 3, FROM_LEFT_1ST_BUTTON_PRESSED, 0));
        assert_eq!(
            input(&mut c, mouse(5, 3, FROM_LEFT_1ST_BUTTON_PRESSED, MOUSE_MOVED)),
            Some(b"\x1b[<32;6;4M".to_vec())
        );
        assert_eq!(input(&mut c, mouse(5, 3, FROM_LEFT_1ST_BUTTON_PRESSED, MOUSE_MOVED)), None);
    }

    #[test]
    fn test_mouse_modifiers() {
        let mut c = con();
        c.use_mouse = 1000;
        c.ext_mouse_mode6 = true;
        let rec = InputRecord::Mouse {
            x: 0,
            y: 0,
            buttons: FROM_LEFT_1ST_BUTTON_PRESSED,
            control_state: ControlKeyState::SHIFT | ControlKeyState::LEFT_CTRL,
            flags: 0,
        };
        assert_eq!(input(&mut c, rec), Some(b"\x1b[<20;1;1M".to_vec()));
    }

    #[test]
    fn test_focus_and_resize() {
        let mut c = con();
        assert_eq!(input(&mut c, InputRecord::Focus(true)), None);
        c.use_focus = true;
        assert_eq!(input(&mut c, InputRecord::Focus(false)), Some(b"\x1b[O".to_vec()));
        assert_eq!(
            translate(&mut c, &InputRecord::WindowBufferSize { cols: 100, rows: 30 }),
            Some(ConsoleEvent::Resize(Winsize::new(100, 30)))
        );
    }

    #[test]
    fn test_latin1_keys() {
        let mut c = DevConsole::new(Charset::Latin1);
        assert_eq!(input(&mut c, InputRecord::char_key('é', NONE)), Some(vec![0xe9]));
    }

    #[test]
    fn test_ctrl_c_debounce() {
        let tty = TtyRecord::new(DeviceId::console(0));
        let slop = Duration::from_secs(60);
        assert!(!debounce_ctrl_c(&tty, &[3], slop));
        assert!(debounce_ctrl_c(&tty, &[3], slop));
        assert!(!debounce_ctrl_c(&tty, b"a", slop));
        assert!(!debounce_ctrl_c(&tty, &[3], Duration::ZERO));
    }
}

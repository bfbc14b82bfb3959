//! Win32 console backend

use std::io;
use std::time::Duration;

use tracing::{debug, warn};
use windows::core::PCWSTR;
use windows::Win32::Foundation::{HANDLE, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows::Win32::System::Console::{
    FillConsoleOutputAttribute, FillConsoleOutputCharacterW, GetConsoleCursorInfo, GetConsoleMode,
    GetConsoleScreenBufferInfo, GetStdHandle, ReadConsoleInputW, ReadConsoleOutputW, ScrollConsoleScreenBufferW,
    SetConsoleCursorInfo, SetConsoleCursorPosition, SetConsoleMode, SetConsoleScreenBufferSize,
    SetConsoleTextAttribute, SetConsoleTitleW, WriteConsoleOutputW, WriteConsoleW, CHAR_INFO, CHAR_INFO_0,
    CONSOLE_CHARACTER_ATTRIBUTES, CONSOLE_CURSOR_INFO, CONSOLE_MODE, CONSOLE_SCREEN_BUFFER_INFO, COORD,
    ENABLE_EXTENDED_FLAGS, ENABLE_MOUSE_INPUT, ENABLE_PROCESSED_OUTPUT, ENABLE_QUICK_EDIT_MODE,
    ENABLE_WINDOW_INPUT, ENABLE_WRAP_AT_EOL_OUTPUT, INPUT_RECORD, SMALL_RECT, STD_INPUT_HANDLE,
    STD_OUTPUT_HANDLE,
};
use windows::Win32::System::Threading::{WaitForSingleObject, INFINITE};

use super::device::*;
use crate::core::error::{Result, TtyError};

// INPUT_RECORD event types
const KEY_EVENT: u16 = 0x0001;
const MOUSE_EVENT: u16 = 0x0002;
const WINDOW_BUFFER_SIZE_EVENT: u16 = 0x0004;
const FOCUS_EVENT: u16 = 0x0010;

fn resource(what: &'static str, err: windows::core::Error) -> TtyError {
    TtyError::Resource {
        what,
        source: io::Error::from_raw_os_error(err.code().0),
    }
}

fn coord(x: i32, y: i32) -> COORD {
    COORD { X: x as i16, Y: y as i16 }
}

fn small_rect(r: Rect) -> SMALL_RECT {
    SMALL_RECT {
        Left: r.left as i16,
        Top: r.top as i16,
        Right: r.right as i16,
        Bottom: r.bottom as i16,
    }
}

fn char_info(c: CharInfo) -> CHAR_INFO {
    let mut units = [0u16; 2];
    CHAR_INFO {
        Char: CHAR_INFO_0 {
            UnicodeChar: c.ch.encode_utf16(&mut units)[0],
        },
        Attributes: c.attr,
    }
}

/// The process's console screen buffer.
pub struct Win32Console {
    out: HANDLE,
    saved_mode: CONSOLE_MODE,
}

// The handle is only used from behind the console's device mutex.
unsafe impl Send for Win32Console {}

impl Win32Console {
    pub fn open() -> Result<Self> {
        unsafe {
            let out = GetStdHandle(STD_OUTPUT_HANDLE).map_err(|e| resource("console output handle", e))?;
            let mut mode = CONSOLE_MODE(0);
            GetConsoleMode(out, &mut mode).map_err(|e| resource("console output mode", e))?;
            // wrapping and scrolling belong to the escape engine
            let raw = CONSOLE_MODE((mode.0 & !ENABLE_WRAP_AT_EOL_OUTPUT.0) | ENABLE_PROCESSED_OUTPUT.0);
            SetConsoleMode(out, raw)?;

            let mut info = CONSOLE_SCREEN_BUFFER_INFO::default();
            GetConsoleScreenBufferInfo(out, &mut info)?;
            let w = info.srWindow.Right - info.srWindow.Left + 1;
            let h = info.srWindow.Bottom - info.srWindow.Top + 1;
            if let Err(e) = SetConsoleScreenBufferSize(out, COORD { X: w, Y: h }) {
                warn!("could not drop the console scrollback: {}", e);
            }
            debug!("win32 console {}x{}", w, h);
            Ok(Self { out, saved_mode: mode })
        }
    }

    fn info(&self) -> Result<CONSOLE_SCREEN_BUFFER_INFO> {
        let mut info = CONSOLE_SCREEN_BUFFER_INFO::default();
        unsafe { GetConsoleScreenBufferInfo(self.out, &mut info)? };
        Ok(info)
    }
}

impl Drop for Win32Console {
    fn drop(&mut self) {
        unsafe {
            let _ = SetConsoleMode(self.out, self.saved_mode);
        }
    }
}

impl ConsoleDevice for Win32Console {
    fn buffer_info(&mut self) -> Result<BufferInfo> {
        let info = self.info()?;
        Ok(BufferInfo {
            cols: info.dwSize.X.max(1) as u16,
            rows: info.dwSize.Y.max(1) as u16,
            cursor_x: info.dwCursorPosition.X.max(0) as u16,
            cursor_y: info.dwCursorPosition.Y.max(0) as u16,
            attributes: info.wAttributes.0,
        })
    }

    fn set_cursor(&mut self, x: u16, y: u16) -> Result<()> {
        unsafe { SetConsoleCursorPosition(self.out, coord(x as i32, y as i32))? };
        Ok(())
    }

    fn set_attribute(&mut self, attr: u16) -> Result<()> {
        unsafe { SetConsoleTextAttribute(self.out, CONSOLE_CHARACTER_ATTRIBUTES(attr))? };
        Ok(())
    }

    fn write_text(&mut self, text: &str) -> Result<()> {
        let wide: Vec<u16> = text.encode_utf16().collect();
        let mut written = 0u32;
        unsafe { WriteConsoleW(self.out, &wide, Some(&mut written), None)? };
        Ok(())
    }

    fn fill(&mut self, x: u16, y: u16, len: usize, ch: char, attr: u16) -> Result<()> {
        let mut units = [0u16; 2];
        let c = ch.encode_utf16(&mut units)[0];
        let at = coord(x as i32, y as i32);
        let mut done = 0u32;
        unsafe {
            FillConsoleOutputCharacterW(self.out, c, len as u32, at, &mut done)?;
            FillConsoleOutputAttribute(self.out, attr, len as u32, at, &mut done)?;
        }
        Ok(())
    }

    fn scroll(&mut self, src: Rect, clip: Rect, dest: (i32, i32), fill: CharInfo) -> Result<()> {
        let src = small_rect(src);
        let clip = small_rect(clip);
        let fill = char_info(fill);
        unsafe { ScrollConsoleScreenBufferW(self.out, &src, Some(&clip), coord(dest.0, dest.1), &fill)? };
        Ok(())
    }

    fn read_region(&mut self, rect: Rect) -> Result<Vec<CharInfo>> {
        let (w, h) = (rect.width().max(0), rect.height().max(0));
        let mut buf = vec![CHAR_INFO::default(); (w * h) as usize];
        let mut region = small_rect(rect);
        unsafe { ReadConsoleOutputW(self.out, buf.as_mut_ptr(), coord(w, h), coord(0, 0), &mut region)? };
        Ok(buf
            .iter()
            .map(|c| {
                let ch = char::from_u32(unsafe { c.Char.UnicodeChar } as u32).unwrap_or(' ');
                CharInfo::new(ch, c.Attributes)
            })
            .collect())
    }

    fn write_region(&mut self, rect: Rect, cells: &[CharInfo]) -> Result<()> {
        let (w, h) = (rect.width().max(0), rect.height().max(0));
        if cells.len() < (w * h) as usize {
            return Err(TtyError::invalid("region larger than the cell buffer"));
        }
        let buf: Vec<CHAR_INFO> = cells.iter().map(|&c| char_info(c)).collect();
        let mut region = small_rect(rect);
        unsafe { WriteConsoleOutputW(self.out, buf.as_ptr(), coord(w, h), coord(0, 0), &mut region)? };
        Ok(())
    }

    fn set_title(&mut self, title: &str) -> Result<()> {
        let wide: Vec<u16> = title.encode_utf16().chain(std::iter::once(0)).collect();
        unsafe { SetConsoleTitleW(PCWSTR(wide.as_ptr()))? };
        Ok(())
    }

    fn set_cursor_visible(&mut self, visible: bool) -> Result<()> {
        let mut ci = CONSOLE_CURSOR_INFO::default();
        unsafe {
            GetConsoleCursorInfo(self.out, &mut ci)?;
            ci.bVisible = visible.into();
            SetConsoleCursorInfo(self.out, &ci)?;
        }
        Ok(())
    }

    fn beep(&mut self) -> Result<()> {
        // processed output turns BEL into the system beep
        let bel = [0x07u16];
        unsafe { WriteConsoleW(self.out, &bel, None, None)? };
        Ok(())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        unsafe { SetConsoleScreenBufferSize(self.out, coord(cols as i32, rows as i32))? };
        Ok(())
    }
}

/// The process's console input buffer.
pub struct Win32Input {
    handle: HANDLE,
    saved_mode: CONSOLE_MODE,
}

unsafe impl Send for Win32Input {}

impl Win32Input {
    pub fn open(mouse: bool) -> Result<Self> {
        unsafe {
            let handle = GetStdHandle(STD_INPUT_HANDLE).map_err(|e| resource("console input handle", e))?;
            let mut mode = CONSOLE_MODE(0);
            GetConsoleMode(handle, &mut mode).map_err(|e| resource("console input mode", e))?;
            // Ctrl-C arrives as a key, line editing is ours, quick edit would eat the mouse
            let mut raw = ENABLE_WINDOW_INPUT.0 | ENABLE_EXTENDED_FLAGS.0;
            if mouse {
                raw |= ENABLE_MOUSE_INPUT.0;
            }
            raw &= !ENABLE_QUICK_EDIT_MODE.0;
            SetConsoleMode(handle, CONSOLE_MODE(raw))?;
            Ok(Self { handle, saved_mode: mode })
        }
    }
}

impl Drop for Win32Input {
    fn drop(&mut self) {
        unsafe {
            let _ = SetConsoleMode(self.handle, self.saved_mode);
        }
    }
}

fn convert(rec: &INPUT_RECORD) -> Option<InputRecord> {
    unsafe {
        match rec.EventType {
            KEY_EVENT => {
                let k = rec.Event.KeyEvent;
                Some(InputRecord::Key {
                    key_down: k.bKeyDown.as_bool(),
                    repeat_count: k.wRepeatCount,
                    vk: k.wVirtualKeyCode,
                    scan: k.wVirtualScanCode,
                    ch: k.uChar.UnicodeChar,
                    control_state: ControlKeyState::from_bits_truncate(k.dwControlKeyState),
                })
            }
            MOUSE_EVENT => {
                let m = rec.Event.MouseEvent;
                Some(InputRecord::Mouse {
                    x: m.dwMousePosition.X.max(0) as u16,
                    y: m.dwMousePosition.Y.max(0) as u16,
                    buttons: m.dwButtonState,
                    control_state: ControlKeyState::from_bits_truncate(m.dwControlKeyState),
                    flags: m.dwEventFlags,
                })
            }
            WINDOW_BUFFER_SIZE_EVENT => {
                let size = rec.Event.WindowBufferSizeEvent.dwSize;
                Some(InputRecord::WindowBufferSize {
                    cols: size.X.max(1) as u16,
                    rows: size.Y.max(1) as u16,
                })
            }
            FOCUS_EVENT => Some(InputRecord::Focus(rec.Event.FocusEvent.bSetFocus.as_bool())),
            _ => None,
        }
    }
}

impl ConsoleInput for Win32Input {
    fn read_input(&mut self, timeout: Option<Duration>) -> Result<Vec<InputRecord>> {
        let ms = timeout.map_or(INFINITE, |t| t.as_millis().min(u32::MAX as u128 - 1) as u32);
        let ready = unsafe { WaitForSingleObject(self.handle, ms) };
        if ready == WAIT_TIMEOUT {
            return Ok(Vec::new());
        }
        if ready != WAIT_OBJECT_0 {
            return Err(TtyError::console(io::Error::last_os_error()));
        }
        let mut buf = [INPUT_RECORD::default(); 64];
        let mut n = 0u32;
        unsafe { ReadConsoleInputW(self.handle, &mut buf, &mut n)? };
        Ok(buf[..n as usize].iter().filter_map(convert).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_char_info_conversion() {
        let c = char_info(CharInfo::new('A', FOREGROUND_RED));
        assert_eq!(unsafe { c.Char.UnicodeChar }, 'A' as u16);
        assert_eq!(c.Attributes, FOREGROUND_RED);
    }

    #[test]
    fn test_key_record_conversion() {
        let mut rec = INPUT_RECORD::default();
        rec.EventType = KEY_EVENT;
        unsafe {
            rec.Event.KeyEvent.bKeyDown = true.into();
            rec.Event.KeyEvent.wRepeatCount = 2;
            rec.Event.KeyEvent.uChar.UnicodeChar = 'q' as u16;
            rec.Event.KeyEvent.dwControlKeyState = 0x0010;
        }
        assert_eq!(
            convert(&rec),
            Some(InputRecord::Key {
                key_down: true,
                repeat_count: 2,
                vk: 0,
                scan: 0,
                ch: 'q' as u16,
                control_state: ControlKeyState::SHIFT,
            })
        );
    }
}

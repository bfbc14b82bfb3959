//! In-memory console screen buffer
//!
//! A [`ConsoleDevice`] backed by a grid of [`CharInfo`] cells. It is what the
//! crossterm backend renders from and what tests inspect. Input is fed through
//! a channel so another thread (or a test) can play the user.

use std::collections::BTreeSet;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use unicode_width::UnicodeWidthChar;

use super::device::*;
use crate::core::error::{Result, TtyError};

/// Cell content marking the right half of a wide character.
pub const CONTINUATION: char = '\0';

pub struct ScreenBuffer {
    pub cols: u16,
    pub rows: u16,
    pub cells: Vec<Vec<CharInfo>>,
    pub cursor_x: u16,
    pub cursor_y: u16,
    pub attr: u16,
    pub cursor_visible: bool,
    pub title: String,
    pub beeps: usize,
    /// Rows changed since the last render
    pub dirty_lines: BTreeSet<usize>,
    pub full_redraw: bool,
}

impl ScreenBuffer {
    pub fn new(cols: u16, rows: u16) -> Self {
        let cols = cols.max(1);
        let rows = rows.max(1);
        Self {
            cols,
            rows,
            cells: vec![vec![CharInfo::default(); cols as usize]; rows as usize],
            cursor_x: 0,
            cursor_y: 0,
            attr: DEFAULT_ATTRIBUTE,
            cursor_visible: true,
            title: String::new(),
            beeps: 0,
            dirty_lines: BTreeSet::new(),
            full_redraw: true,
        }
    }

    fn bounds(&self) -> Rect {
        Rect::new(0, 0, self.cols as i32 - 1, self.rows as i32 - 1)
    }

    pub fn mark_dirty(&mut self, row: usize) {
        self.dirty_lines.insert(row);
    }

    pub fn mark_all_dirty(&mut self) {
        self.full_redraw = true;
    }

    pub fn clear_dirty(&mut self) {
        self.dirty_lines.clear();
        self.full_redraw = false;
    }

    fn set_cell(&mut self, x: i32, y: i32, cell: CharInfo) {
        if self.bounds().contains(x, y) {
            self.cells[y as usize][x as usize] = cell;
            self.mark_dirty(y as usize);
        }
    }

    fn cell(&self, x: i32, y: i32) -> CharInfo {
        if self.bounds().contains(x, y) {
            self.cells[y as usize][x as usize]
        } else {
            CharInfo::blank(self.attr)
        }
    }

    /// Text of one row, continuation cells skipped, trailing blanks trimmed.
    pub fn row_text(&self, row: usize) -> String {
        self.cells
            .get(row)
            .map(|cells| {
                let s: String = cells.iter().map(|c| c.ch).filter(|&c| c != CONTINUATION).collect();
                s.trim_end().to_string()
            })
            .unwrap_or_default()
    }

    fn put_char(&mut self, ch: char) {
        let width = ch.width().unwrap_or(0) as u16;
        if width == 0 {
            return;
        }
        let (x, y) = (self.cursor_x, self.cursor_y);
        if x + width > self.cols {
            return;
        }
        // Overwriting half of a wide character blanks the other half.
        let row = &mut self.cells[y as usize];
        if row[x as usize].ch == CONTINUATION && x > 0 {
            row[x as usize - 1] = CharInfo::blank(self.attr);
        }
        let end = (x + width) as usize;
        if end < row.len() && row[end].ch == CONTINUATION {
            row[end] = CharInfo::blank(self.attr);
        }
        row[x as usize] = CharInfo::new(ch, self.attr);
        if width == 2 {
            row[x as usize + 1] = CharInfo::new(CONTINUATION, self.attr);
        }
        self.mark_dirty(y as usize);
        // The cursor sticks to the last column; wrapping is the caller's business.
        self.cursor_x = (x + width).min(self.cols - 1);
    }
}

/// Shared handle to a [`ScreenBuffer`]. Clones see the same screen.
#[derive(Clone)]
pub struct ScreenConsole {
    inner: Arc<Mutex<ScreenBuffer>>,
}

impl std::fmt::Debug for ScreenConsole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let b = self.buffer();
        f.debug_struct("ScreenConsole")
            .field("cols", &b.cols)
            .field("rows", &b.rows)
            .field("cursor", &(b.cursor_x, b.cursor_y))
            .finish()
    }
}

impl ScreenConsole {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ScreenBuffer::new(cols, rows))),
        }
    }

    pub fn buffer(&self) -> MutexGuard<'_, ScreenBuffer> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn row_text(&self, row: usize) -> String {
        self.buffer().row_text(row)
    }

    pub fn cell(&self, x: u16, y: u16) -> CharInfo {
        self.buffer().cell(x as i32, y as i32)
    }

    pub fn cursor(&self) -> (u16, u16) {
        let b = self.buffer();
        (b.cursor_x, b.cursor_y)
    }

    pub fn title(&self) -> String {
        self.buffer().title.clone()
    }

    pub fn beeps(&self) -> usize {
        self.buffer().beeps
    }

    pub fn cursor_visible(&self) -> bool {
        self.buffer().cursor_visible
    }
}

impl ConsoleDevice for ScreenConsole {
    fn buffer_info(&mut self) -> Result<BufferInfo> {
        let b = self.buffer();
        Ok(BufferInfo {
            cols: b.cols,
            rows: b.rows,
            cursor_x: b.cursor_x,
            cursor_y: b.cursor_y,
            attributes: b.attr,
        })
    }

    fn set_cursor(&mut self, x: u16, y: u16) -> Result<()> {
        let mut b = self.buffer();
        b.cursor_x = x.min(b.cols - 1);
        b.cursor_y = y.min(b.rows - 1);
        Ok(())
    }

    fn set_attribute(&mut self, attr: u16) -> Result<()> {
        self.buffer().attr = attr;
        Ok(())
    }

    fn write_text(&mut self, text: &str) -> Result<()> {
        let mut b = self.buffer();
        for ch in text.chars() {
            b.put_char(ch);
        }
        Ok(())
    }

    fn fill(&mut self, x: u16, y: u16, len: usize, ch: char, attr: u16) -> Result<()> {
        let mut b = self.buffer();
        let cols = b.cols as usize;
        let total = cols * b.rows as usize;
        let start = y as usize * cols + x as usize;
        for pos in start..(start + len).min(total) {
            b.set_cell((pos % cols) as i32, (pos / cols) as i32, CharInfo::new(ch, attr));
        }
        Ok(())
    }

    fn scroll(&mut self, src: Rect, clip: Rect, dest: (i32, i32), fill: CharInfo) -> Result<()> {
        let mut b = self.buffer();
        let bounds = b.bounds();
        let (Some(src), Some(clip)) = (src.intersect(&bounds), clip.intersect(&bounds)) else {
            return Ok(());
        };
        let snapshot: Vec<Vec<CharInfo>> = (src.top..=src.bottom)
            .map(|y| (src.left..=src.right).map(|x| b.cell(x, y)).collect())
            .collect();
        for y in src.top..=src.bottom {
            for x in src.left..=src.right {
                if clip.contains(x, y) {
                    b.set_cell(x, y, fill);
                }
            }
        }
        for (dy, row) in snapshot.iter().enumerate() {
            for (dx, cell) in row.iter().enumerate() {
                let (tx, ty) = (dest.0 + dx as i32, dest.1 + dy as i32);
                if clip.contains(tx, ty) {
                    b.set_cell(tx, ty, *cell);
                }
            }
        }
        Ok(())
    }

    fn read_region(&mut self, rect: Rect) -> Result<Vec<CharInfo>> {
        let b = self.buffer();
        Ok((rect.top..=rect.bottom)
            .flat_map(|y| (rect.left..=rect.right).map(move |x| (x, y)))
            .map(|(x, y)| b.cell(x, y))
            .collect())
    }

    fn write_region(&mut self, rect: Rect, cells: &[CharInfo]) -> Result<()> {
        let width = rect.width().max(0) as usize;
        if width == 0 || cells.len() < width * rect.height().max(0) as usize {
            return Err(TtyError::invalid("region larger than the cell buffer"));
        }
        let mut b = self.buffer();
        for (i, cell) in cells.iter().enumerate().take(width * rect.height() as usize) {
            let x = rect.left + (i % width) as i32;
            let y = rect.top + (i / width) as i32;
            b.set_cell(x, y, *cell);
        }
        Ok(())
    }

    fn set_title(&mut self, title: &str) -> Result<()> {
        self.buffer().title = title.to_string();
        Ok(())
    }

    fn set_cursor_visible(&mut self, visible: bool) -> Result<()> {
        self.buffer().cursor_visible = visible;
        Ok(())
    }

    fn beep(&mut self) -> Result<()> {
        self.buffer().beeps += 1;
        Ok(())
    }

    fn resize(&mut self, cols: u16, rows: u16) -> Result<()> {
        let mut b = self.buffer();
        let cols = cols.max(1);
        let rows = rows.max(1);
        b.cells.resize(rows as usize, vec![CharInfo::default(); cols as usize]);
        for row in &mut b.cells {
            row.resize(cols as usize, CharInfo::default());
        }
        b.cols = cols;
        b.rows = rows;
        b.cursor_x = b.cursor_x.min(cols - 1);
        b.cursor_y = b.cursor_y.min(rows - 1);
        b.mark_all_dirty();
        Ok(())
    }
}

/// Input side of the in-memory console.
pub struct ScreenInput {
    rx: Receiver<InputRecord>,
}

impl ScreenInput {
    /// Create the input queue and the sender that feeds it.
    pub fn channel() -> (Sender<InputRecord>, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, Self { rx })
    }
}

impl ConsoleInput for ScreenInput {
    fn read_input(&mut self, timeout: Option<Duration>) -> Result<Vec<InputRecord>> {
        let first = match timeout {
            Some(t) => match self.rx.recv_timeout(t) {
                Ok(rec) => rec,
                Err(RecvTimeoutError::Timeout) => return Ok(Vec::new()),
                Err(RecvTimeoutError::Disconnected) => return Err(TtyError::io("console input closed")),
            },
            None => self.rx.recv().map_err(|_| TtyError::io("console input closed"))?,
        };
        let mut records = vec![first];
        records.extend(self.rx.try_iter());
        Ok(records)
    }
}

//! Pipe transport between the master and slave ends
//!
//! A bounded pipe with the semantics of a Windows anonymous pipe: readers can
//! peek at how much is buffered without consuming it, non-blocking reads report
//! `WouldBlock` when empty, and once every handle of one end is gone the other
//! end sees a broken pipe. Message mode keeps write boundaries, which lets a
//! zero-length write travel as an end-of-file marker.
//!
//! On Windows either end may instead be a kernel named pipe, so that the
//! other end can live in another process. Waits on those poll.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;

use super::error::{Result, TtyError};
#[cfg(windows)]
use super::kernel;
use super::sync::lock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PipeMode {
    Byte,
    Message,
}

struct PipeState {
    chunks: VecDeque<Vec<u8>>,
    used: usize,
    readers: usize,
    writers: usize,
}

struct Pipe {
    name: String,
    mode: PipeMode,
    capacity: usize,
    state: Mutex<PipeState>,
    cond: Condvar,
}

impl Pipe {
    fn broken_for_reader(state: &PipeState) -> bool {
        state.writers == 0
    }
}

/// Sleep between looks at a kernel pipe.
#[cfg(windows)]
const KERNEL_POLL: Duration = Duration::from_millis(10);

/// Create a pipe, returning its read and write ends.
pub fn pipe(name: impl Into<String>, capacity: usize, mode: PipeMode) -> (PipeReader, PipeWriter) {
    let inner = Arc::new(Pipe {
        name: name.into(),
        mode,
        capacity: capacity.max(1),
        state: Mutex::new(PipeState {
            chunks: VecDeque::new(),
            used: 0,
            readers: 1,
            writers: 1,
        }),
        cond: Condvar::new(),
    });
    (
        PipeReader { inner: End::Local(inner.clone()) },
        PipeWriter { inner: End::Local(inner) },
    )
}

/// Create a kernel pipe whose ends can be duplicated into other processes.
#[cfg(windows)]
pub fn os_pipe(name: &str, capacity: usize, mode: PipeMode) -> Result<(PipeReader, PipeWriter)> {
    let (r, w) = kernel::pipe(name, capacity, mode)?;
    Ok((PipeReader::from_kernel(r), PipeWriter::from_kernel(w)))
}

enum End {
    Local(Arc<Pipe>),
    #[cfg(windows)]
    Os(Arc<kernel::PipeEnd>),
}

impl End {
    fn name(&self) -> &str {
        match self {
            End::Local(p) => &p.name,
            #[cfg(windows)]
            End::Os(p) => p.name(),
        }
    }

    #[cfg(windows)]
    fn raw_handle(&self) -> Option<u64> {
        match self {
            End::Local(_) => None,
            End::Os(p) => Some(p.value()),
        }
    }
}

/// Read end. Cloning duplicates the handle.
pub struct PipeReader {
    inner: End,
}

/// Write end. Cloning duplicates the handle.
pub struct PipeWriter {
    inner: End,
}

/// Sleep until `deadline`, at most one poll interval. False once it has passed.
#[cfg(windows)]
fn poll_until(deadline: Option<Instant>) -> bool {
    let slice = match deadline {
        Some(d) => {
            let left = d.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return false;
            }
            left.min(KERNEL_POLL)
        }
        None => KERNEL_POLL,
    };
    std::thread::sleep(slice);
    true
}

impl PipeReader {
    #[cfg(windows)]
    pub fn from_kernel(end: kernel::PipeEnd) -> Self {
        Self { inner: End::Os(Arc::new(end)) }
    }

    /// Kernel handle value, for another process to duplicate.
    #[cfg(windows)]
    pub fn raw_handle(&self) -> Option<u64> {
        self.inner.raw_handle()
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Bytes buffered, or a broken-pipe error when nothing is buffered and no
    /// writer remains.
    pub fn peek(&self) -> Result<usize> {
        match &self.inner {
            End::Local(pipe) => {
                let state = lock(&pipe.state);
                if state.used == 0 && state.chunks.is_empty() && Pipe::broken_for_reader(&state) {
                    return Err(TtyError::io("broken pipe"));
                }
                Ok(state.used)
            }
            #[cfg(windows)]
            End::Os(os) => os.peek(),
        }
    }

    /// True once every write handle has been closed.
    pub fn is_broken(&self) -> bool {
        match &self.inner {
            End::Local(pipe) => Pipe::broken_for_reader(&lock(&pipe.state)),
            #[cfg(windows)]
            End::Os(os) => os.peek().is_err(),
        }
    }

    /// Non-blocking read.
    ///
    /// Returns `Ok(0)` for end of file: a zero-length message, or an empty pipe
    /// with no writers left. An empty pipe with live writers is `WouldBlock`.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let pipe = match &self.inner {
            End::Local(pipe) => pipe,
            #[cfg(windows)]
            End::Os(os) => return os.read(buf),
        };
        let mut state = lock(&pipe.state);
        if state.chunks.is_empty() {
            return if Pipe::broken_for_reader(&state) {
                Ok(0)
            } else {
                Err(TtyError::WouldBlock)
            };
        }
        let n = match pipe.mode {
            PipeMode::Message => take_message(&mut state, buf),
            PipeMode::Byte => take_bytes(&mut state, buf),
        };
        pipe.cond.notify_all();
        trace!("pipe {}: read {} bytes", pipe.name, n);
        Ok(n)
    }

    /// Block until data is buffered, the pipe breaks, or `timeout` passes.
    pub fn wait_readable(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let pipe = match &self.inner {
            End::Local(pipe) => pipe,
            #[cfg(windows)]
            End::Os(os) => loop {
                match os.peek() {
                    Ok(0) => {}
                    _ => return true,
                }
                if !poll_until(deadline) {
                    return false;
                }
            },
        };
        let mut state = lock(&pipe.state);
        loop {
            if !state.chunks.is_empty() || Pipe::broken_for_reader(&state) {
                return true;
            }
            state = match deadline {
                None => pipe.cond.wait(state).unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    pipe.cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }

    /// Discard everything buffered. Returns the number of bytes dropped.
    pub fn discard(&self) -> usize {
        match &self.inner {
            End::Local(pipe) => {
                let mut state = lock(&pipe.state);
                let dropped = state.used;
                state.chunks.clear();
                state.used = 0;
                pipe.cond.notify_all();
                dropped
            }
            #[cfg(windows)]
            End::Os(os) => {
                let mut buf = [0u8; 1024];
                let mut dropped = 0;
                while os.peek().map_or(false, |n| n > 0) {
                    match os.read(&mut buf) {
                        Ok(n) if n > 0 => dropped += n,
                        _ => break,
                    }
                }
                dropped
            }
        }
    }
}

fn take_message(state: &mut PipeState, buf: &mut [u8]) -> usize {
    let Some(front) = state.chunks.front_mut() else {
        return 0;
    };
    let n = front.len().min(buf.len());
    buf[..n].copy_from_slice(&front[..n]);
    if n == front.len() {
        state.chunks.pop_front();
    } else {
        front.drain(..n);
    }
    state.used -= n;
    n
}

fn take_bytes(state: &mut PipeState, buf: &mut [u8]) -> usize {
    let mut n = 0;
    while n < buf.len() {
        let Some(front) = state.chunks.front_mut() else {
            break;
        };
        let take = front.len().min(buf.len() - n);
        buf[n..n + take].copy_from_slice(&front[..take]);
        n += take;
        if take == front.len() {
            state.chunks.pop_front();
        } else {
            front.drain(..take);
        }
    }
    state.used -= n;
    n
}

impl PipeWriter {
    #[cfg(windows)]
    pub fn from_kernel(end: kernel::PipeEnd) -> Self {
        Self { inner: End::Os(Arc::new(end)) }
    }

    /// Kernel handle value, for another process to duplicate.
    #[cfg(windows)]
    pub fn raw_handle(&self) -> Option<u64> {
        self.inner.raw_handle()
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn mode(&self) -> PipeMode {
        match &self.inner {
            End::Local(pipe) => pipe.mode,
            #[cfg(windows)]
            End::Os(os) => os.mode(),
        }
    }

    /// Non-blocking write.
    ///
    /// Byte pipes accept as much as fits and report the count; message pipes
    /// accept the whole message or nothing. A full pipe is `WouldBlock`, a pipe
    /// without readers is an I/O error.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let pipe = match &self.inner {
            End::Local(pipe) => pipe,
            #[cfg(windows)]
            End::Os(os) => return os.write(data),
        };
        let mut state = lock(&pipe.state);
        if state.readers == 0 {
            return Err(TtyError::io("broken pipe"));
        }
        let space = pipe.capacity.saturating_sub(state.used);
        let n = match pipe.mode {
            // An oversized message still goes through once the pipe is empty.
            PipeMode::Message if data.len() <= space || state.used == 0 => data.len(),
            PipeMode::Message => return Err(TtyError::WouldBlock),
            PipeMode::Byte if data.is_empty() => return Ok(0),
            PipeMode::Byte if space == 0 => return Err(TtyError::WouldBlock),
            PipeMode::Byte => data.len().min(space),
        };
        state.chunks.push_back(data[..n].to_vec());
        state.used += n;
        pipe.cond.notify_all();
        trace!("pipe {}: wrote {} bytes", pipe.name, n);
        Ok(n)
    }

    /// Write everything, waiting for the reader to make room.
    pub fn write_all(&self, mut data: &[u8], timeout: Option<Duration>) -> Result<usize> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let total = data.len();
        while !data.is_empty() {
            match self.write(data) {
                Ok(n) => data = &data[n..],
                Err(TtyError::WouldBlock) => {
                    if !self.wait_writable(deadline) {
                        return Err(TtyError::WouldBlock);
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }

    /// Queue an end-of-file marker (message mode only).
    pub fn write_eof(&self) -> Result<()> {
        if self.mode() != PipeMode::Message {
            return Err(TtyError::invalid("eof marker needs a message pipe"));
        }
        let pipe = match &self.inner {
            End::Local(pipe) => pipe,
            #[cfg(windows)]
            End::Os(os) => return os.write(&[]).map(|_| ()),
        };
        let mut state = lock(&pipe.state);
        if state.readers == 0 {
            return Err(TtyError::io("broken pipe"));
        }
        state.chunks.push_back(Vec::new());
        pipe.cond.notify_all();
        Ok(())
    }

    /// Wait until the reader has drained the pipe. A kernel pipe waits for
    /// its reader without a bound, like `tcdrain`.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        match &self.inner {
            End::Local(pipe) => {
                let state = lock(&pipe.state);
                let (state, _) = pipe
                    .cond
                    .wait_timeout_while(state, timeout, |s| !s.chunks.is_empty() && s.readers > 0)
                    .unwrap_or_else(|e| e.into_inner());
                state.chunks.is_empty()
            }
            #[cfg(windows)]
            End::Os(os) => os.flush(),
        }
    }

    /// Discard what the reader has not consumed yet. Data already in a
    /// kernel pipe belongs to the reader and stays.
    pub fn discard(&self) -> usize {
        match &self.inner {
            End::Local(pipe) => {
                let mut state = lock(&pipe.state);
                let dropped = state.used;
                state.chunks.clear();
                state.used = 0;
                pipe.cond.notify_all();
                dropped
            }
            #[cfg(windows)]
            End::Os(_) => 0,
        }
    }

    fn wait_writable(&self, deadline: Option<Instant>) -> bool {
        let pipe = match &self.inner {
            End::Local(pipe) => pipe,
            #[cfg(windows)]
            End::Os(_) => return poll_until(deadline),
        };
        let mut state = lock(&pipe.state);
        loop {
            if state.readers == 0 || state.used < pipe.capacity {
                return true;
            }
            state = match deadline {
                None => pipe.cond.wait(state).unwrap_or_else(|e| e.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    pipe.cond
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }
}

impl Clone for End {
    fn clone(&self) -> Self {
        match self {
            End::Local(pipe) => End::Local(pipe.clone()),
            #[cfg(windows)]
            End::Os(os) => End::Os(os.clone()),
        }
    }
}

impl Clone for PipeReader {
    fn clone(&self) -> Self {
        if let End::Local(pipe) = &self.inner {
            lock(&pipe.state).readers += 1;
        }
        Self { inner: self.inner.clone() }
    }
}

impl Clone for PipeWriter {
    fn clone(&self) -> Self {
        if let End::Local(pipe) = &self.inner {
            lock(&pipe.state).writers += 1;
        }
        Self { inner: self.inner.clone() }
    }
}

impl Drop for PipeReader {
    fn drop(&mut self) {
        if let End::Local(pipe) = &self.inner {
            lock(&pipe.state).readers -= 1;
            pipe.cond.notify_all();
        }
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        if let End::Local(pipe) = &self.inner {
            lock(&pipe.state).writers -= 1;
            pipe.cond.notify_all();
        }
    }
}

impl std::fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PipeReader").field(&self.name()).finish()
    }
}

impl std::fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PipeWriter").field(&self.name()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_byte_pipe_read_write() {
        let (r, w) = pipe("t", 16, PipeMode::Byte);
        assert_eq!(w.write(b"hello").unwrap(), 5);
        assert_eq!(w.write(b" world").unwrap(), 6);
        assert_eq!(r.peek().unwrap(), 11);
        let mut buf = [0u8; 8];
        assert_eq!(r.read(&mut buf).unwrap(), 8);
        assert_eq!(&buf, b"hello wo");
        assert_eq!(r.read(&mut buf).unwrap(), 3);
        assert!(matches!(r.read(&mut buf), Err(TtyError::WouldBlock)));
    }

    #[test]
    fn test_byte_pipe_partial_write_when_full() {
        let (_r, w) = pipe("t", 4, PipeMode::Byte);
        assert_eq!(w.write(b"abcdef").unwrap(), 4);
        assert!(matches!(w.write(b"g"), Err(TtyError::WouldBlock)));
        assert_eq!(w.discard(), 4);
        assert_eq!(w.write(b"gh").unwrap(), 2);
    }

    #[test]
    fn test_message_pipe_keeps_boundaries_and_eof() {
        let (r, w) = pipe("t", 64, PipeMode::Message);
        w.write(b"one").unwrap();
        w.write_eof().unwrap();
        w.write(b"two").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(r.read(&mut buf).unwrap(), 3);
        assert_eq!(r.read(&mut buf).unwrap(), 0);
        assert_eq!(r.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"two");
    }

    #[test]
    fn test_broken_pipe() {
        let (r, w) = pipe("t", 16, PipeMode::Byte);
        let w2 = w.clone();
        w.write(b"x").unwrap();
        drop(w);
        assert!(!r.is_broken());
        drop(w2);
        assert!(r.is_broken());
        // buffered data still readable after the writers are gone
        assert_eq!(r.peek().unwrap(), 1);
        let mut buf = [0u8; 4];
        assert_eq!(r.read(&mut buf).unwrap(), 1);
        assert_eq!(r.read(&mut buf).unwrap(), 0);
        assert!(r.peek().is_err());
    }

    #[test]
    fn test_write_without_reader_fails() {
        let (r, w) = pipe("t", 16, PipeMode::Byte);
        drop(r);
        assert!(matches!(w.write(b"x"), Err(TtyError::Io(_))));
    }

    #[test]
    fn test_write_all_waits_for_room() {
        let (r, w) = pipe("t", 4, PipeMode::Byte);
        let reader = thread::spawn(move || {
            let mut out = Vec::new();
            let mut buf = [0u8; 4];
            while out.len() < 10 {
                r.wait_readable(Some(Duration::from_secs(5)));
                if let Ok(n) = r.read(&mut buf) {
                    out.extend_from_slice(&buf[..n]);
                }
            }
            out
        });
        assert_eq!(w.write_all(b"0123456789", Some(Duration::from_secs(5))).unwrap(), 10);
        assert_eq!(reader.join().unwrap(), b"0123456789");
    }
}

//! Windows kernel objects behind the machine-wide namespace
//!
//! Named events and mutexes live in the session's `Local\` object directory,
//! pipes are named pipes opened in non-blocking mode, and the pty table is a
//! pagefile-backed section every attached process maps. A handle another
//! process owns is reached with `DuplicateHandle` after opening that process.

use std::io;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tracing::{debug, trace};
use windows::core::PCWSTR;
use windows::Win32::Foundation::{
    CloseHandle, DuplicateHandle, GetLastError, BOOL, DUPLICATE_SAME_ACCESS, ERROR_ALREADY_EXISTS,
    ERROR_BROKEN_PIPE, ERROR_MORE_DATA, ERROR_NO_DATA, ERROR_PIPE_NOT_CONNECTED, FALSE, HANDLE,
    INVALID_HANDLE_VALUE, WAIT_ABANDONED, WAIT_OBJECT_0,
};
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FlushFileBuffers, ReadFile, WriteFile, FILE_FLAGS_AND_ATTRIBUTES, FILE_FLAG_FIRST_PIPE_INSTANCE,
    FILE_SHARE_NONE, OPEN_EXISTING, PIPE_ACCESS_OUTBOUND,
};
use windows::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, UnmapViewOfFile, FILE_MAP_ALL_ACCESS, MEMORY_MAPPED_VIEW_ADDRESS,
    PAGE_READWRITE,
};
use windows::Win32::System::Pipes::{
    CreateNamedPipeW, PeekNamedPipe, SetNamedPipeHandleState, NAMED_PIPE_MODE, PIPE_NOWAIT, PIPE_READMODE_BYTE,
    PIPE_READMODE_MESSAGE, PIPE_REJECT_REMOTE_CLIENTS, PIPE_TYPE_BYTE, PIPE_TYPE_MESSAGE,
};
use windows::Win32::System::Threading::{
    CreateEventW, CreateMutexW, GetCurrentProcess, GetCurrentProcessId, OpenEventW, OpenMutexW, OpenProcess,
    ReleaseMutex, ResetEvent, SetEvent, WaitForMultipleObjects, WaitForSingleObject, EVENT_MODIFY_STATE,
    INFINITE, PROCESS_DUP_HANDLE, SYNCHRONIZATION_SYNCHRONIZE,
};

use super::error::{Result, TtyError};
use super::pipe::PipeMode;
use super::process::Pid;

const GENERIC_READ: u32 = 0x8000_0000;
const FILE_WRITE_ATTRIBUTES: u32 = 0x0000_0100;

/// Upper bound for a single wait on a kernel object.
const MAX_WAIT_OBJECTS: usize = 64;

static PIPE_SERIAL: AtomicU32 = AtomicU32::new(0);

fn resource(what: &'static str, err: windows::core::Error) -> TtyError {
    TtyError::Resource {
        what,
        source: io::Error::from_raw_os_error(err.code().0),
    }
}

fn wide(s: &str) -> Vec<u16> {
    s.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Session-local kernel object name.
fn object_name(name: &str) -> Vec<u16> {
    wide(&format!("Local\\{}", name))
}

fn millis(timeout: Option<Duration>) -> u32 {
    match timeout {
        None => INFINITE,
        Some(t) => t.as_millis().min((INFINITE - 1) as u128) as u32,
    }
}

/// `CreateNamedPipeW` has returned either a bare handle or a `Result`
/// depending on the bindings; accept both.
trait IntoHandle {
    fn into_handle(self) -> windows::core::Result<HANDLE>;
}

impl IntoHandle for HANDLE {
    fn into_handle(self) -> windows::core::Result<HANDLE> {
        if self.is_invalid() {
            Err(windows::core::Error::from_win32())
        } else {
            Ok(self)
        }
    }
}

impl IntoHandle for windows::core::Result<HANDLE> {
    fn into_handle(self) -> windows::core::Result<HANDLE> {
        self
    }
}

/// An owned kernel handle, closed on drop.
#[derive(Debug)]
pub struct Handle(HANDLE);

// Kernel handles are process-wide values; every object here does its own locking.
unsafe impl Send for Handle {}
unsafe impl Sync for Handle {}

impl Handle {
    pub fn raw(&self) -> HANDLE {
        self.0
    }

    /// The handle value as other processes see it in ours.
    pub fn value(&self) -> u64 {
        self.0 .0 as usize as u64
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

pub fn current_pid() -> Pid {
    unsafe { GetCurrentProcessId() }
}

/// Copy handle `value` of process `owner` into this process.
pub fn duplicate_from(owner: Pid, value: u64) -> Result<Handle> {
    unsafe {
        let process = OpenProcess(PROCESS_DUP_HANDLE, FALSE, owner)
            .map(Handle)
            .map_err(|e| TtyError::access(format!("opening pid {}: {}", owner, e)))?;
        let mut dup = HANDLE::default();
        DuplicateHandle(
            process.raw(),
            HANDLE(value as usize as *mut _),
            GetCurrentProcess(),
            &mut dup,
            0,
            FALSE,
            DUPLICATE_SAME_ACCESS,
        )
        .map_err(|e| TtyError::access(format!("duplicating {:#x} of pid {}: {}", value, owner, e)))?;
        trace!("duplicated {:#x} of pid {} as {:?}", value, owner, dup);
        Ok(Handle(dup))
    }
}

/// A named event.
#[derive(Debug)]
pub struct Event {
    handle: Handle,
}

impl Event {
    /// Create the event or open the existing one. The flag is true when it was created.
    pub fn create(name: &str, manual_reset: bool, initial: bool) -> Result<(Self, bool)> {
        let name = object_name(name);
        unsafe {
            let handle = CreateEventW(None, BOOL::from(manual_reset), BOOL::from(initial), PCWSTR(name.as_ptr()))
                .map_err(|e| resource("named event", e))?;
            let created = GetLastError() != ERROR_ALREADY_EXISTS;
            Ok((Self { handle: Handle(handle) }, created))
        }
    }

    pub fn open(name: &str) -> Option<Self> {
        let name = object_name(name);
        unsafe {
            OpenEventW(EVENT_MODIFY_STATE | SYNCHRONIZATION_SYNCHRONIZE, FALSE, PCWSTR(name.as_ptr()))
                .ok()
                .map(|h| Self { handle: Handle(h) })
        }
    }

    pub fn exists(name: &str) -> bool {
        Self::open(name).is_some()
    }

    pub fn set(&self) {
        unsafe {
            if let Err(e) = SetEvent(self.handle.raw()) {
                debug!("SetEvent failed: {}", e);
            }
        }
    }

    pub fn reset(&self) {
        unsafe {
            let _ = ResetEvent(self.handle.raw());
        }
    }

    /// Take the signal if present. Auto-reset events are cleared by this.
    pub fn try_consume(&self) -> bool {
        unsafe { WaitForSingleObject(self.handle.raw(), 0) == WAIT_OBJECT_0 }
    }

    /// Look at the signal without consuming it.
    pub fn is_set(&self) -> bool {
        if self.try_consume() {
            // put back what an auto-reset event just lost
            self.set();
            true
        } else {
            false
        }
    }
}

/// Wait for any of `events`; the index of the first one signaled.
pub fn wait_any(events: &[&Event], timeout: Option<Duration>) -> Option<usize> {
    let handles: Vec<HANDLE> = events.iter().take(MAX_WAIT_OBJECTS).map(|e| e.handle.raw()).collect();
    if handles.is_empty() {
        return None;
    }
    let ret = unsafe { WaitForMultipleObjects(&handles, FALSE, millis(timeout)) };
    let idx = ret.0.wrapping_sub(WAIT_OBJECT_0.0) as usize;
    (idx < handles.len()).then_some(idx)
}

/// A named mutex.
#[derive(Debug)]
pub struct Mutex {
    handle: Handle,
}

impl Mutex {
    pub fn create(name: &str) -> Result<Self> {
        let name = object_name(name);
        unsafe {
            CreateMutexW(None, FALSE, PCWSTR(name.as_ptr()))
                .map(|h| Self { handle: Handle(h) })
                .map_err(|e| resource("named mutex", e))
        }
    }

    pub fn open(name: &str) -> Option<Self> {
        let name = object_name(name);
        unsafe {
            OpenMutexW(SYNCHRONIZATION_SYNCHRONIZE, FALSE, PCWSTR(name.as_ptr()))
                .ok()
                .map(|h| Self { handle: Handle(h) })
        }
    }

    /// Block until owned. A mutex left behind by a dead owner is taken over.
    pub fn lock(&self) {
        let ret = unsafe { WaitForSingleObject(self.handle.raw(), INFINITE) };
        if ret == WAIT_ABANDONED {
            debug!("took over an abandoned mutex");
        }
    }

    pub fn unlock(&self) {
        unsafe {
            let _ = ReleaseMutex(self.handle.raw());
        }
    }
}

/// A mapped pagefile-backed section.
pub struct Section {
    _mapping: Handle,
    view: NonNull<u8>,
    len: usize,
}

// The view is shared memory; callers serialise access through named mutexes.
unsafe impl Send for Section {}
unsafe impl Sync for Section {}

impl std::fmt::Debug for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Section").field("len", &self.len).finish()
    }
}

impl Section {
    /// Create or open section `name` of `len` bytes. A new section is zeroed.
    pub fn create(name: &str, len: usize) -> Result<(Self, bool)> {
        let name = object_name(name);
        unsafe {
            let mapping = CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                None,
                PAGE_READWRITE,
                (len as u64 >> 32) as u32,
                len as u32,
                PCWSTR(name.as_ptr()),
            )
            .map(Handle)
            .map_err(|e| resource("shared section", e))?;
            let created = GetLastError() != ERROR_ALREADY_EXISTS;
            let view = MapViewOfFile(mapping.raw(), FILE_MAP_ALL_ACCESS, 0, 0, len);
            let view = NonNull::new(view.Value as *mut u8).ok_or_else(|| TtyError::Resource {
                what: "shared section view",
                source: io::Error::last_os_error(),
            })?;
            Ok((Self { _mapping: mapping, view, len }, created))
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Pointer to the `index`th `T` of the view.
    fn slot<T>(&self, index: usize) -> Option<NonNull<T>> {
        let size = std::mem::size_of::<T>();
        let end = (index + 1).checked_mul(size)?;
        if end > self.len {
            return None;
        }
        // views are page aligned and `size` is a multiple of T's alignment
        NonNull::new(unsafe { self.view.as_ptr().add(index * size) } as *mut T)
    }
}

impl Drop for Section {
    fn drop(&mut self) {
        unsafe {
            let _ = UnmapViewOfFile(MEMORY_MAPPED_VIEW_ADDRESS {
                Value: self.view.as_ptr() as *mut _,
            });
        }
    }
}

/// A `T` in a shared section guarded by a named mutex.
///
/// The section holds `T` as this build lays it out; the versioned object
/// names keep builds with another layout from ever opening it.
pub struct SharedCell<T> {
    mutex: Mutex,
    data: NonNull<T>,
    _section: Option<std::sync::Arc<Section>>,
    _marker: PhantomData<T>,
}

// Access to `data` only happens while `mutex` is owned.
unsafe impl<T: Send> Send for SharedCell<T> {}
unsafe impl<T: Send> Sync for SharedCell<T> {}

impl<T: Copy> SharedCell<T> {
    /// Slot `index` of `section`, guarded by `mutex`.
    pub fn in_section(mutex: Mutex, section: std::sync::Arc<Section>, index: usize) -> Result<Self> {
        let data = section
            .slot::<T>(index)
            .ok_or_else(|| TtyError::invalid(format!("slot {} outside the shared section", index)))?;
        Ok(Self {
            mutex,
            data,
            _section: Some(section),
            _marker: PhantomData,
        })
    }
}

impl<T> SharedCell<T> {
    /// Overwrite the slot without reading what was there, which may be
    /// zeroes of a freshly created section.
    pub fn store(&self, value: T) {
        self.mutex.lock();
        unsafe { self.data.as_ptr().write(value) };
        self.mutex.unlock();
    }

    pub fn lock(&self) -> SharedLock<'_, T> {
        self.mutex.lock();
        SharedLock { cell: self }
    }
}

impl SharedCell<()> {
    /// A bare named mutex with nothing behind it.
    pub fn lock_only(mutex: Mutex) -> Self {
        Self {
            mutex,
            data: NonNull::dangling(),
            _section: None,
            _marker: PhantomData,
        }
    }
}

/// Ownership of a [`SharedCell`]'s mutex.
pub struct SharedLock<'a, T> {
    cell: &'a SharedCell<T>,
}

impl<'a, T> SharedLock<'a, T> {
    /// Let other owners in for `pause`, then take the mutex again.
    pub fn pause(self, pause: Duration) -> Self {
        let cell = self.cell;
        drop(self);
        std::thread::sleep(pause);
        cell.lock()
    }
}

impl<T> Deref for SharedLock<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { self.cell.data.as_ref() }
    }
}

impl<T> DerefMut for SharedLock<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.cell.data.as_ptr() }
    }
}

impl<T> Drop for SharedLock<'_, T> {
    fn drop(&mut self) {
        self.cell.mutex.unlock();
    }
}

/// One end of a named pipe in non-blocking mode.
#[derive(Debug)]
pub struct PipeEnd {
    name: String,
    mode: PipeMode,
    handle: Handle,
}

/// Create a pipe and return its read and write ends.
pub fn pipe(name: &str, capacity: usize, mode: PipeMode) -> Result<(PipeEnd, PipeEnd)> {
    let serial = PIPE_SERIAL.fetch_add(1, Ordering::Relaxed);
    let path = wide(&format!("\\\\.\\pipe\\{}.{}.{}", name, current_pid(), serial));
    let (pipe_mode, read_mode) = match mode {
        PipeMode::Message => (PIPE_TYPE_MESSAGE | PIPE_READMODE_MESSAGE, PIPE_READMODE_MESSAGE),
        PipeMode::Byte => (PIPE_TYPE_BYTE | PIPE_READMODE_BYTE, PIPE_READMODE_BYTE),
    };
    let capacity = capacity.min(u32::MAX as usize) as u32;
    unsafe {
        let writer = CreateNamedPipeW(
            PCWSTR(path.as_ptr()),
            PIPE_ACCESS_OUTBOUND | FILE_FLAG_FIRST_PIPE_INSTANCE,
            pipe_mode | PIPE_NOWAIT | PIPE_REJECT_REMOTE_CLIENTS,
            1,
            capacity,
            capacity,
            0,
            None,
        )
        .into_handle()
        .map(Handle)
        .map_err(|e| resource("named pipe", e))?;
        let reader = CreateFileW(
            PCWSTR(path.as_ptr()),
            GENERIC_READ | FILE_WRITE_ATTRIBUTES,
            FILE_SHARE_NONE,
            None,
            OPEN_EXISTING,
            FILE_FLAGS_AND_ATTRIBUTES(0),
            HANDLE::default(),
        )
        .map(Handle)
        .map_err(|e| resource("named pipe client", e))?;
        let state: NAMED_PIPE_MODE = read_mode | PIPE_NOWAIT;
        SetNamedPipeHandleState(reader.raw(), Some(&state), None, None).map_err(|e| resource("pipe mode", e))?;
        debug!("pipe {}: kernel pipe of {} bytes", name, capacity);
        Ok((
            PipeEnd { name: name.to_string(), mode, handle: reader },
            PipeEnd { name: name.to_string(), mode, handle: writer },
        ))
    }
}

fn is(err: &windows::core::Error, code: windows::Win32::Foundation::WIN32_ERROR) -> bool {
    err.code() == code.to_hresult()
}

impl PipeEnd {
    /// Wrap a pipe handle duplicated from another process.
    pub fn from_handle(name: impl Into<String>, mode: PipeMode, handle: Handle) -> Self {
        Self { name: name.into(), mode, handle }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> PipeMode {
        self.mode
    }

    pub fn value(&self) -> u64 {
        self.handle.value()
    }

    /// Bytes buffered; an error once the pipe is empty and the writer is gone.
    pub fn peek(&self) -> Result<usize> {
        let mut avail = 0u32;
        unsafe {
            PeekNamedPipe(self.handle.raw(), None, 0, None, Some(&mut avail), None)
                .map_err(|e| TtyError::io(format!("{}: {}", self.name, e)))?;
        }
        Ok(avail as usize)
    }

    /// Non-blocking read: `WouldBlock` when empty, `Ok(0)` for an empty
    /// message or a pipe without writers.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut read = 0u32;
        match unsafe { ReadFile(self.handle.raw(), Some(buf), Some(&mut read), None) } {
            Ok(()) => Ok(read as usize),
            // the rest of the message stays for the next read
            Err(e) if is(&e, ERROR_MORE_DATA) => Ok(read as usize),
            Err(e) if is(&e, ERROR_NO_DATA) => Err(TtyError::WouldBlock),
            Err(e) if is(&e, ERROR_BROKEN_PIPE) || is(&e, ERROR_PIPE_NOT_CONNECTED) => Ok(0),
            Err(e) => Err(TtyError::io(format!("{}: {}", self.name, e))),
        }
    }

    /// Non-blocking write: byte pipes take what fits, message pipes all or nothing.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let mut written = 0u32;
        match unsafe { WriteFile(self.handle.raw(), Some(data), Some(&mut written), None) } {
            Ok(()) if written == 0 && !data.is_empty() => Err(TtyError::WouldBlock),
            Ok(()) => Ok(written as usize),
            Err(e) if is(&e, ERROR_NO_DATA) || is(&e, ERROR_BROKEN_PIPE) || is(&e, ERROR_PIPE_NOT_CONNECTED) => {
                Err(TtyError::io("broken pipe"))
            }
            Err(e) => Err(TtyError::io(format!("{}: {}", self.name, e))),
        }
    }

    /// Block until the reader has taken everything written.
    pub fn flush(&self) -> bool {
        unsafe { FlushFileBuffers(self.handle.raw()).is_ok() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique(base: &str) -> String {
        format!("ntty-test.{}.{}.{}", base, current_pid(), PIPE_SERIAL.fetch_add(1, Ordering::Relaxed))
    }

    #[test]
    fn test_event_name_dies_with_last_handle() {
        let name = unique("event");
        let (ev, created) = Event::create(&name, true, false).unwrap();
        assert!(created);
        let (_again, created) = Event::create(&name, true, false).unwrap();
        assert!(!created);
        let opened = Event::open(&name).unwrap();
        opened.set();
        assert!(ev.is_set());
        drop(opened);
        drop(_again);
        drop(ev);
        assert!(!Event::exists(&name));
    }

    #[test]
    fn test_auto_reset_event_is_set_keeps_signal() {
        let (ev, _) = Event::create(&unique("auto"), false, true).unwrap();
        assert!(ev.is_set());
        assert!(ev.try_consume());
        assert!(!ev.try_consume());
    }

    #[test]
    fn test_wait_any_picks_signaled_event() {
        let (a, _) = Event::create(&unique("a"), false, false).unwrap();
        let (b, _) = Event::create(&unique("b"), false, true).unwrap();
        assert_eq!(wait_any(&[&a, &b], Some(Duration::from_millis(100))), Some(1));
        assert_eq!(wait_any(&[&a, &b], Some(Duration::from_millis(10))), None);
    }

    #[test]
    fn test_message_pipe_keeps_boundaries_and_eof() {
        let (r, w) = pipe(&unique("msg"), 256, PipeMode::Message).unwrap();
        let mut buf = [0u8; 16];
        assert!(matches!(r.read(&mut buf), Err(TtyError::WouldBlock)));
        assert_eq!(w.write(b"one").unwrap(), 3);
        assert_eq!(w.write(b"").unwrap(), 0);
        assert_eq!(r.peek().unwrap(), 3);
        assert_eq!(r.read(&mut buf).unwrap(), 3);
        assert_eq!(r.read(&mut buf).unwrap(), 0);
        drop(w);
        assert_eq!(r.read(&mut buf).unwrap(), 0);
        assert!(r.peek().is_err());
    }

    #[test]
    fn test_write_without_reader_fails() {
        let (r, w) = pipe(&unique("byte"), 64, PipeMode::Byte).unwrap();
        drop(r);
        assert!(matches!(w.write(b"x"), Err(TtyError::Io(_))));
    }

    #[test]
    fn test_section_is_shared_between_views() {
        let name = unique("section");
        let (a, created) = Section::create(&name, 4096).unwrap();
        assert!(created);
        let (b, created) = Section::create(&name, 4096).unwrap();
        assert!(!created);
        let a = std::sync::Arc::new(a);
        let b = std::sync::Arc::new(b);
        let mutex_name = unique("section.mutex");
        let ca = SharedCell::<u64>::in_section(Mutex::create(&mutex_name).unwrap(), a, 3).unwrap();
        let cb = SharedCell::<u64>::in_section(Mutex::open(&mutex_name).unwrap(), b, 3).unwrap();
        *ca.lock() = 42;
        assert_eq!(*cb.lock(), 42);
    }

    #[test]
    fn test_duplicate_from_own_process() {
        let (r, w) = pipe(&unique("dup"), 64, PipeMode::Byte).unwrap();
        let dup = duplicate_from(current_pid(), r.value()).unwrap();
        let r2 = PipeEnd::from_handle("dup", PipeMode::Byte, dup);
        w.write(b"hi").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(r2.read(&mut buf).unwrap(), 2);
        drop(r);
    }
}

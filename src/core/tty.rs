//! Shared terminal records
//!
//! One [`TtyState`] exists per terminal and is visible to every process attached
//! to it. The only way to touch it is through [`TtyRecord::acquire`], which holds
//! the terminal's output mutex; that same mutex serialises every write to the
//! terminal, so XOFF flow control is simply "writers wait while
//! `output_stopped`".

use std::sync::Arc;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use tracing::{debug, info};

use super::error::{Result, TtyError};
use super::handles::HandleId;
use super::process::Pid;
#[cfg(windows)]
use super::kernel;
use super::sync::{shared_name, NamedGuard, NamedMutex};
use super::termios::{Termios, Winsize};

/// Number of pty units.
pub const NTTYS: usize = 128;

pub const DEV_CONS_MAJOR: u16 = 5;
pub const DEV_PTYM_MAJOR: u16 = 128;
pub const DEV_PTYS_MAJOR: u16 = 136;

/// Device identity of a terminal (`ntty`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DeviceId {
    pub major: u16,
    pub minor: u16,
}

impl DeviceId {
    pub fn pty(unit: usize) -> Self {
        Self { major: DEV_PTYS_MAJOR, minor: unit as u16 }
    }

    pub fn console(unit: usize) -> Self {
        Self { major: DEV_CONS_MAJOR, minor: unit as u16 }
    }

    pub fn unit(&self) -> usize {
        self.minor as usize
    }

    pub fn is_console(&self) -> bool {
        self.major == DEV_CONS_MAJOR
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_console() {
            write!(f, "cons{}", self.minor)
        } else {
            write!(f, "pty{}", self.minor)
        }
    }
}

/// How the slave's read loop should end once the pipe is empty.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReadStatus {
    #[default]
    Ok,
    Eof,
    Error(i32),
}

bitflags! {
    /// Pending `TIOCPKT` status bits.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct PacketStatus: u8 {
        const FLUSHREAD  = 0x01;
        const FLUSHWRITE = 0x02;
        const STOP       = 0x04;
        const START      = 0x08;
    }
}

/// `TIOCPKT_DATA` prefix byte.
pub const TIOCPKT_DATA: u8 = 0;

/// Plain data only: in a machine-scoped table every attached process maps
/// the same bytes.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct TtyState {
    pub ntty: DeviceId,
    pub sid: Pid,
    pub pgid: Pid,
    pub ti: Termios,
    pub winsize: Winsize,
    pub last_ctrl_c: Option<Instant>,
    pub output_stopped: bool,
    pub master_pid: Pid,
    /// Read end of the input pipe, as a handle in the master's table, or
    /// the master process's kernel handle value when the table is shared.
    pub from_master: Option<HandleId>,
    /// Write end of the output pipe, likewise.
    pub to_master: Option<HandleId>,
    pub read_retval: ReadStatus,
    pub was_opened: bool,
    pub allocated: bool,
    pub packet_mode: bool,
    pub packet: PacketStatus,
}

impl TtyState {
    pub fn new(ntty: DeviceId) -> Self {
        Self {
            ntty,
            sid: 0,
            pgid: 0,
            ti: Termios::tcinit(),
            winsize: Winsize::new(80, 24),
            last_ctrl_c: None,
            output_stopped: false,
            master_pid: 0,
            from_master: None,
            to_master: None,
            read_retval: ReadStatus::Ok,
            was_opened: false,
            allocated: false,
            packet_mode: false,
            packet: PacketStatus::empty(),
        }
    }

    /// Back to the state of a never-used unit.
    pub fn init(&mut self) {
        *self = Self::new(self.ntty);
    }

    pub fn setsid(&mut self, sid: Pid) {
        self.sid = sid;
    }

    pub fn setpgid(&mut self, pgid: Pid) {
        self.pgid = pgid;
    }

    /// Clear XOFF. Returns true when output was stopped.
    pub fn restart_output(&mut self) -> bool {
        let was = std::mem::replace(&mut self.output_stopped, false);
        if was && self.packet_mode {
            self.packet.remove(PacketStatus::STOP);
            self.packet.insert(PacketStatus::START);
        }
        was
    }

    pub fn stop_output(&mut self) -> bool {
        let was = std::mem::replace(&mut self.output_stopped, true);
        if !was && self.packet_mode {
            self.packet.remove(PacketStatus::START);
            self.packet.insert(PacketStatus::STOP);
        }
        !was
    }
}

/// A terminal record guarded by its output mutex.
pub struct TtyRecord {
    state: NamedMutex<TtyState>,
}

impl std::fmt::Debug for TtyRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtyRecord").field("name", &self.state.name()).finish()
    }
}

impl TtyRecord {
    pub fn new(ntty: DeviceId) -> Self {
        Self {
            state: NamedMutex::new(Self::mutex_name(ntty), TtyState::new(ntty)),
        }
    }

    /// Record kept in a shared section slot.
    #[cfg(windows)]
    pub fn shared(ntty: DeviceId, cell: kernel::SharedCell<TtyState>) -> Self {
        Self {
            state: NamedMutex::shared(Self::mutex_name(ntty), cell),
        }
    }

    fn mutex_name(ntty: DeviceId) -> String {
        let base = if ntty.is_console() { "cons.output.mutex" } else { "tty.output.mutex" };
        shared_name(base, ntty.unit())
    }

    pub fn name(&self) -> &str {
        self.state.name()
    }

    /// Acquire the output mutex.
    pub fn acquire(&self) -> NamedGuard<'_, TtyState> {
        self.state.acquire()
    }

    /// Acquire the output mutex once output is not stopped, giving up after
    /// `timeout` with output still stopped. Writers call this in a loop so
    /// they can notice signals and cancellation between attempts.
    pub fn acquire_for_output_timeout(&self, timeout: Duration) -> Option<NamedGuard<'_, TtyState>> {
        let (guard, timed_out) = self
            .state
            .acquire()
            .wait_timeout_while(timeout, |s| s.output_stopped);
        if timed_out {
            None
        } else {
            Some(guard)
        }
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> TtyState {
        *self.acquire()
    }

    pub fn termios(&self) -> Termios {
        self.acquire().ti
    }

    pub fn ntty(&self) -> DeviceId {
        self.acquire().ntty
    }

    /// VSTOP: stop output.
    pub fn stop_output(&self) {
        if self.acquire().stop_output() {
            debug!("{}: output stopped", self.name());
        }
    }

    /// VSTART: restart output and wake blocked writers.
    pub fn start_output(&self) {
        let mut state = self.acquire();
        if state.restart_output() {
            debug!("{}: output restarted", self.name());
        }
        state.notify_all();
    }

    pub fn output_stopped(&self) -> bool {
        self.acquire().output_stopped
    }

    /// Wake everyone waiting on the output mutex condition.
    pub fn notify_waiters(&self) {
        self.state.notify_all();
    }
}

/// The fixed array of pty records. Slots are reused, never freed.
pub struct TtyTable {
    slots: Vec<Arc<TtyRecord>>,
}

impl std::fmt::Debug for TtyTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtyTable").field("units", &self.slots.len()).finish()
    }
}

impl Default for TtyTable {
    fn default() -> Self {
        Self::new()
    }
}

impl TtyTable {
    pub fn new() -> Self {
        Self {
            slots: (0..NTTYS).map(|unit| Arc::new(TtyRecord::new(DeviceId::pty(unit)))).collect(),
        }
    }

    /// The table every process of the session maps. The first process to
    /// create the section initialises every slot, under a named mutex so a
    /// concurrent opener never sees a half-built table.
    #[cfg(windows)]
    pub fn shared() -> Result<Self> {
        let init = kernel::SharedCell::lock_only(kernel::Mutex::create(&shared_name("tty.table.init", 0))?);
        let _held = init.lock();
        let (section, created) =
            kernel::Section::create(&shared_name("tty.table", 0), NTTYS * std::mem::size_of::<TtyState>())?;
        let section = Arc::new(section);
        let mut slots = Vec::with_capacity(NTTYS);
        for unit in 0..NTTYS {
            let ntty = DeviceId::pty(unit);
            let mutex = kernel::Mutex::create(&TtyRecord::mutex_name(ntty))?;
            let cell = kernel::SharedCell::in_section(mutex, section.clone(), unit)?;
            if created {
                cell.store(TtyState::new(ntty));
            }
            slots.push(Arc::new(TtyRecord::shared(ntty, cell)));
        }
        info!("mapped shared tty table ({} units, created: {})", NTTYS, created);
        Ok(Self { slots })
    }

    pub fn get(&self, unit: usize) -> Result<Arc<TtyRecord>> {
        self.slots
            .get(unit)
            .cloned()
            .ok_or_else(|| TtyError::invalid(format!("no tty unit {}", unit)))
    }

    /// Claim the first free unit for a new master.
    pub fn allocate(&self, master_pid: Pid) -> Result<usize> {
        for (unit, slot) in self.slots.iter().enumerate() {
            let mut state = slot.acquire();
            if state.allocated {
                continue;
            }
            state.init();
            state.allocated = true;
            state.master_pid = master_pid;
            info!("allocated pty{} for pid {}", unit, master_pid);
            return Ok(unit);
        }
        Err(TtyError::NoDevice)
    }

    /// Reset a unit so it can be allocated again.
    pub fn release(&self, unit: usize) {
        if let Some(slot) = self.slots.get(unit) {
            slot.acquire().init();
            slot.notify_waiters();
            info!("released pty{}", unit);
        }
    }

    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.acquire().allocated).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_allocate_and_release() {
        let table = TtyTable::new();
        let a = table.allocate(10).unwrap();
        let b = table.allocate(11).unwrap();
        assert_ne!(a, b);
        assert_eq!(table.in_use(), 2);
        assert_eq!(table.get(a).unwrap().snapshot().master_pid, 10);
        table.release(a);
        assert_eq!(table.in_use(), 1);
        assert_eq!(table.allocate(12).unwrap(), a);
    }

    #[test]
    fn test_table_exhaustion() {
        let table = TtyTable::new();
        for _ in 0..NTTYS {
            table.allocate(1).unwrap();
        }
        assert!(matches!(table.allocate(1), Err(TtyError::NoDevice)));
    }

    #[test]
    fn test_stop_start_releases_writer() {
        let rec = Arc::new(TtyRecord::new(DeviceId::pty(0)));
        rec.stop_output();
        assert!(rec.acquire_for_output_timeout(Duration::from_millis(10)).is_none());

        let rec2 = rec.clone();
        let writer = thread::spawn(move || {
            rec2.acquire_for_output_timeout(Duration::from_secs(5))
                .map(|guard| guard.output_stopped)
        });
        thread::sleep(Duration::from_millis(20));
        rec.start_output();
        assert_eq!(writer.join().unwrap(), Some(false));
        assert!(!rec.output_stopped());
    }

    #[test]
    fn test_packet_status_on_flow_control() {
        let rec = TtyRecord::new(DeviceId::pty(1));
        rec.acquire().packet_mode = true;
        rec.stop_output();
        assert!(rec.snapshot().packet.contains(PacketStatus::STOP));
        rec.start_output();
        let s = rec.snapshot();
        assert!(s.packet.contains(PacketStatus::START));
        assert!(!s.packet.contains(PacketStatus::STOP));
    }

    #[test]
    fn test_device_id() {
        assert_eq!(DeviceId::pty(3).to_string(), "pty3");
        assert!(DeviceId::console(0).is_console());
        assert_eq!(DeviceId::pty(7).unit(), 7);
    }
}

#[cfg(all(test, windows))]
mod shared_tests {
    use super::*;

    #[test]
    fn test_shared_table_is_seen_by_every_mapping() {
        let a = TtyTable::shared().unwrap();
        let b = TtyTable::shared().unwrap();
        let unit = a.allocate(kernel::current_pid()).unwrap();
        assert!(b.get(unit).unwrap().snapshot().allocated);
        b.get(unit).unwrap().acquire().winsize = Winsize::new(132, 50);
        assert_eq!(a.get(unit).unwrap().snapshot().winsize, Winsize::new(132, 50));
        a.release(unit);
        assert!(!b.get(unit).unwrap().snapshot().allocated);
    }
}

//! Pseudo-terminals
//!
//! A pty unit is a [`TtyRecord`] from the [`TtyTable`] plus two pipes: the
//! input pipe carries accepted lines from the master to the slaves (one
//! message per line, an empty message for EOF) and the output pipe carries
//! whatever the slaves write back. The master keeps both slave-side pipe ends
//! in its handle table; slaves duplicate them from there when they open.
//! With a machine-scoped namespace the pipes are kernel pipes and the tty
//! record carries the master's raw handle values, which a slave in another
//! process duplicates with the master's pid.
//!
//! Liveness of either side is a named event each live end holds. Nobody
//! clears a flag on exit; the name simply stops resolving once the last
//! holder is gone, which also covers a process that died without cleaning up.
//!
//! ```text
//! PtyMaster / TtyMaster                       TtySlave (any process)
//!   write ── line_edit ──> input pipe  ──────>  read
//!   read  <── OPOST ────── output pipe <──────  write
//!                          ioctl channel <────  TIOCGWINSZ, TIOCLINUX
//! ```

pub mod broker;
pub mod ioctl;
pub mod master;
pub mod slave;
pub mod tty_master;

pub use master::PtyMaster;
pub use slave::TtySlave;
pub use tty_master::TtyMaster;

use std::sync::Arc;

use tracing::{debug, info, trace};

use self::ioctl::IoctlChannel;
use super::context::TtyContext;
use super::error::{Result, TtyError};
use super::handles::{Access, HandleId, HandleObject, HandleTable};
use super::ldisc::AcceptStatus;
#[cfg(windows)]
use super::pipe::os_pipe;
use super::pipe::{pipe, PipeMode, PipeReader, PipeWriter};
use super::process::Pid;
use super::sync::{shared_name, NamedEvent, NamedMutex, Namespace};
use super::tty::{ReadStatus, TtyRecord, TtyTable};

/// Name of the event every live master of `unit` holds.
pub fn master_alive_name(unit: usize) -> String {
    shared_name("master.alive", unit)
}

/// Name of the event every live slave of `unit` holds.
pub fn slave_alive_name(unit: usize) -> String {
    shared_name("slave.alive", unit)
}

/// Synchronisation objects shared by both ends of a unit.
#[derive(Clone, Debug)]
pub struct UnitObjects {
    /// Auto-reset; set whenever a message lands in the input pipe.
    pub input_available: Arc<NamedEvent>,
    /// Held while reading the input pipe so one message goes to one reader.
    pub input_mutex: Arc<NamedMutex<()>>,
    pub ioctl: Arc<IoctlChannel>,
}

impl UnitObjects {
    /// Create the objects for a new master. Failure leaves the unit unusable.
    pub fn create(ns: &Namespace, unit: usize) -> Result<Self> {
        let input_available = ns.create_event(&shared_name("input.avail", unit), false, false)?;
        let input_mutex = ns.create_mutex(&shared_name("input.mutex", unit))?;
        let ioctl_name = shared_name("ioctl", unit);
        let (ioctl, _) = ns.create(&ioctl_name, || IoctlChannel::new(ioctl_name.clone()))?;
        Ok(Self { input_available, input_mutex, ioctl })
    }

    /// Open the objects of an existing unit from a slave.
    ///
    /// The ioctl channel only exists in the master's process; a slave of a
    /// machine-scoped unit elsewhere gets an unserved channel and answers
    /// ioctls from the tty record.
    pub fn open(ns: &Namespace, unit: usize) -> Result<Self> {
        let missing = |what: &str| TtyError::access(format!("pty{}: {} is gone", unit, what));
        let ioctl_name = shared_name("ioctl", unit);
        let ioctl = match ns.open(&ioctl_name) {
            Some(ioctl) => ioctl,
            None if ns.is_machine() => Arc::new(IoctlChannel::new(ioctl_name)),
            None => return Err(missing("ioctl channel")),
        };
        Ok(Self {
            input_available: ns
                .open_event(&shared_name("input.avail", unit))
                .ok_or_else(|| missing("input event"))?,
            input_mutex: ns
                .open_mutex(&shared_name("input.mutex", unit))
                .ok_or_else(|| missing("input mutex"))?,
            ioctl,
        })
    }
}

/// Hand accepted input to the slaves.
pub(crate) fn accept_into(to_slave: &PipeWriter, objects: &UnitObjects, input: &[u8]) -> AcceptStatus {
    let _guard = objects.input_mutex.acquire();
    let status = match to_slave.write(input) {
        Ok(_) => AcceptStatus::Accepted,
        Err(TtyError::WouldBlock) => return AcceptStatus::PipeFull,
        Err(e) => {
            debug!("{}: accept failed: {}", to_slave.name(), e);
            return AcceptStatus::Error;
        }
    };
    trace!("{}: accepted {} bytes", to_slave.name(), input.len());
    objects.input_available.set();
    status
}

/// Input (message) and output (byte) pipes of `unit`.
#[cfg_attr(not(windows), allow(unused_variables))]
fn unit_pipes(
    ns: &Namespace,
    unit: usize,
    capacity: usize,
) -> Result<((PipeReader, PipeWriter), (PipeReader, PipeWriter))> {
    let input = shared_name("pipe.input", unit);
    let output = shared_name("pipe.output", unit);
    #[cfg(windows)]
    if ns.is_machine() {
        return Ok((
            os_pipe(&input, capacity, PipeMode::Message)?,
            os_pipe(&output, capacity, PipeMode::Byte)?,
        ));
    }
    Ok((
        pipe(input, capacity, PipeMode::Message),
        pipe(output, capacity, PipeMode::Byte),
    ))
}

/// The parts every master owns: its unit, the pipe ends it keeps, the
/// slave-side ends in its handle table, and its liveness token.
pub(crate) struct MasterUnit {
    pub unit: usize,
    pub tty: Arc<TtyRecord>,
    pub objects: UnitObjects,
    /// Write end of the input pipe.
    pub to_slave: PipeWriter,
    /// Read end of the output pipe.
    pub from_slave: PipeReader,
    ns: Arc<Namespace>,
    ttys: Arc<TtyTable>,
    handles: Arc<HandleTable>,
    slave_ends: [HandleId; 2],
    alive: Option<Arc<NamedEvent>>,
}

impl std::fmt::Debug for MasterUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterUnit")
            .field("unit", &self.unit)
            .field("alive", &self.alive.is_some())
            .finish()
    }
}

impl MasterUnit {
    /// Allocate a unit for master `pid` and build its pipes.
    pub fn open(ctx: &TtyContext, pid: Pid) -> Result<Self> {
        let unit = ctx.ttys().allocate(pid)?;
        match Self::setup(ctx, pid, unit) {
            Ok(m) => Ok(m),
            Err(e) => {
                ctx.ttys().release(unit);
                Err(e)
            }
        }
    }

    fn setup(ctx: &TtyContext, pid: Pid, unit: usize) -> Result<Self> {
        let ns = ctx.namespace().clone();
        let tty = ctx.ttys().get(unit)?;
        let objects = UnitObjects::create(&ns, unit)?;
        let alive = ns.create_event(&master_alive_name(unit), true, true)?;
        let handles = ctx.handle_table(pid)?;

        let ((in_r, in_w), (out_r, out_w)) = unit_pipes(&ns, unit, ctx.config().tty.pipe_capacity)?;
        // kernel pipes are published by handle value, for DuplicateHandle
        #[cfg(windows)]
        let published = (in_r.raw_handle(), out_w.raw_handle());
        #[cfg(not(windows))]
        let published: (Option<HandleId>, Option<HandleId>) = (None, None);
        let from_master = handles.insert(HandleObject::PipeRead(in_r), Access::GENERIC_READ | Access::SYNCHRONIZE);
        let to_master = handles.insert(HandleObject::PipeWrite(out_w), Access::GENERIC_WRITE | Access::SYNCHRONIZE);
        {
            let mut state = tty.acquire();
            state.from_master = published.0.or(Some(from_master));
            state.to_master = published.1.or(Some(to_master));
        }
        info!("pty{}: master opened by pid {}", unit, pid);

        Ok(Self {
            unit,
            tty,
            objects,
            to_slave: in_w,
            from_slave: out_r,
            ns,
            ttys: ctx.ttys().clone(),
            handles,
            slave_ends: [from_master, to_master],
            alive: Some(alive),
        })
    }

    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.ns
    }

    pub fn slave_alive(&self) -> bool {
        self.ns.exists(&slave_alive_name(self.unit))
    }

    /// A slave was attached once and none is left.
    pub fn slaves_gone(&self) -> bool {
        self.tty.acquire().was_opened && !self.slave_alive()
    }

    /// Give up the unit: slaves see EOF, and the unit is released once no
    /// slave holds it.
    pub fn close(&mut self) {
        if self.alive.is_none() {
            return;
        }
        for id in self.slave_ends {
            let _ = self.handles.close(id);
        }
        let release = {
            let mut state = self.tty.acquire();
            if state.read_retval == ReadStatus::Ok {
                state.read_retval = ReadStatus::Eof;
            }
            state.from_master = None;
            state.to_master = None;
            self.alive = None;
            !self.slave_alive()
        };
        self.objects.input_available.set();
        self.objects.ioctl.set_serving(false);
        self.tty.notify_waiters();
        info!("pty{}: master closed", self.unit);
        if release {
            self.ttys.release(self.unit);
        }
    }
}

impl Drop for MasterUnit {
    fn drop(&mut self) {
        self.close();
    }
}

//! Per-process handle tables
//!
//! Every simulated process owns a [`HandleTable`]. Handle ids are only meaningful
//! inside the table that issued them, so the tty record can carry the master's
//! pipe handles but a slave has to duplicate them into its own table before use.
//! A process publishes its table in the [`Namespace`] under its pid; dropping the
//! table closes every handle the process held.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bitflags::bitflags;
use tracing::{debug, warn};

use super::error::{Result, TtyError};
use super::pipe::{PipeReader, PipeWriter};
use super::process::{Pid, ProcessTable};
use super::sync::{lock, Namespace, NamedEvent};

pub type HandleId = u64;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Access: u32 {
        const SYNCHRONIZE   = 0x0010_0000;
        const GENERIC_WRITE = 0x4000_0000;
        const GENERIC_READ  = 0x8000_0000;
    }
}

/// Anything a handle can refer to.
#[derive(Clone, Debug)]
pub enum HandleObject {
    PipeRead(PipeReader),
    PipeWrite(PipeWriter),
    Event(Arc<NamedEvent>),
}

impl HandleObject {
    /// Rights a handle to this object may carry.
    fn allowed(&self) -> Access {
        match self {
            HandleObject::PipeRead(_) => Access::GENERIC_READ | Access::SYNCHRONIZE,
            HandleObject::PipeWrite(_) => Access::GENERIC_WRITE | Access::SYNCHRONIZE,
            HandleObject::Event(_) => Access::all(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            HandleObject::PipeRead(_) => "pipe-read",
            HandleObject::PipeWrite(_) => "pipe-write",
            HandleObject::Event(_) => "event",
        }
    }
}

struct Entry {
    object: HandleObject,
    access: Access,
}

pub struct HandleTable {
    owner: Pid,
    next: AtomicU64,
    entries: std::sync::Mutex<HashMap<HandleId, Entry>>,
}

impl std::fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleTable")
            .field("owner", &self.owner)
            .field("open", &self.len())
            .finish()
    }
}

/// Namespace name of a process's handle table.
pub fn process_object_name(pid: Pid) -> String {
    format!("process.{}", pid)
}

impl HandleTable {
    pub fn new(owner: Pid) -> Self {
        Self {
            owner,
            // keep ids recognisable per owner in logs
            next: AtomicU64::new(((owner as u64) << 32) | 4),
            entries: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Create the table and publish it so other processes can open it.
    pub fn register(ns: &Namespace, owner: Pid) -> Result<Arc<Self>> {
        let (table, created) = ns.create(&process_object_name(owner), || Self::new(owner))?;
        if !created {
            debug!("handle table for pid {} already published", owner);
        }
        Ok(table)
    }

    pub fn owner(&self) -> Pid {
        self.owner
    }

    pub fn insert(&self, object: HandleObject, access: Access) -> HandleId {
        let id = self.next.fetch_add(4, Ordering::Relaxed);
        let access = if access.is_empty() { object.allowed() } else { access & object.allowed() };
        lock(&self.entries).insert(id, Entry { object, access });
        id
    }

    pub fn get(&self, id: HandleId) -> Result<HandleObject> {
        lock(&self.entries)
            .get(&id)
            .map(|e| e.object.clone())
            .ok_or(TtyError::BadHandle)
    }

    pub fn access(&self, id: HandleId) -> Result<Access> {
        lock(&self.entries).get(&id).map(|e| e.access).ok_or(TtyError::BadHandle)
    }

    pub fn pipe_reader(&self, id: HandleId) -> Result<PipeReader> {
        match self.get(id)? {
            HandleObject::PipeRead(r) => Ok(r),
            _ => Err(TtyError::BadHandle),
        }
    }

    pub fn pipe_writer(&self, id: HandleId) -> Result<PipeWriter> {
        match self.get(id)? {
            HandleObject::PipeWrite(w) => Ok(w),
            _ => Err(TtyError::BadHandle),
        }
    }

    pub fn event(&self, id: HandleId) -> Result<Arc<NamedEvent>> {
        match self.get(id)? {
            HandleObject::Event(ev) => Ok(ev),
            _ => Err(TtyError::BadHandle),
        }
    }

    pub fn close(&self, id: HandleId) -> Result<()> {
        lock(&self.entries).remove(&id).map(|_| ()).ok_or(TtyError::BadHandle)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Copy handle `id` of `source` into `target`.
///
/// An empty `access` keeps the source rights; asking for rights the source
/// handle lacks is refused.
pub fn duplicate_handle(
    source: &HandleTable,
    id: HandleId,
    target: &HandleTable,
    access: Access,
) -> Result<HandleId> {
    let (object, held) = {
        let entries = lock(&source.entries);
        let entry = entries.get(&id).ok_or(TtyError::BadHandle)?;
        (entry.object.clone(), entry.access)
    };
    let wanted = if access.is_empty() { held } else { access };
    if !held.contains(wanted) {
        return Err(TtyError::access(format!(
            "{} handle {:#x} lacks {:?}",
            object.kind(),
            id,
            wanted - held
        )));
    }
    Ok(target.insert(object, wanted))
}

/// Open another process for handle duplication.
///
/// Fails when the target has exited or runs in a different security session.
pub fn open_process(
    ns: &Namespace,
    procs: &dyn ProcessTable,
    caller: Pid,
    target: Pid,
) -> Result<Arc<HandleTable>> {
    let table = ns
        .open::<HandleTable>(&process_object_name(target))
        .ok_or_else(|| TtyError::access(format!("process {} is gone", target)))?;
    let ours = procs.security_session(caller);
    let theirs = procs.security_session(target);
    if ours.is_none() || ours != theirs {
        warn!(
            "pid {} (session {:?}) may not open pid {} (session {:?})",
            caller, ours, target, theirs
        );
        return Err(TtyError::access(format!("pid {} is in another session", target)));
    }
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pipe::{pipe, PipeMode};
    use crate::core::process::{LocalProcessTable, ProcessInfo};

    #[test]
    fn test_duplicate_handle_shares_object() {
        let a = HandleTable::new(1);
        let b = HandleTable::new(2);
        let (r, w) = pipe("dup", 16, PipeMode::Byte);
        let rid = a.insert(HandleObject::PipeRead(r), Access::empty());
        let wid = a.insert(HandleObject::PipeWrite(w), Access::empty());
        let rid2 = duplicate_handle(&a, rid, &b, Access::empty()).unwrap();

        a.pipe_writer(wid).unwrap().write(b"hi").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(b.pipe_reader(rid2).unwrap().read(&mut buf).unwrap(), 2);
    }

    #[test]
    fn test_duplicate_refuses_extra_rights() {
        let a = HandleTable::new(1);
        let b = HandleTable::new(2);
        let (r, _w) = pipe("dup", 16, PipeMode::Byte);
        let rid = a.insert(HandleObject::PipeRead(r), Access::empty());
        let res = duplicate_handle(&a, rid, &b, Access::GENERIC_WRITE);
        assert!(matches!(res, Err(TtyError::AccessDenied(_))));
    }

    #[test]
    fn test_closing_last_writer_breaks_pipe() {
        let a = HandleTable::new(1);
        let (r, w) = pipe("close", 16, PipeMode::Byte);
        let wid = a.insert(HandleObject::PipeWrite(w), Access::empty());
        assert!(!r.is_broken());
        a.close(wid).unwrap();
        assert!(r.is_broken());
        assert!(matches!(a.close(wid), Err(TtyError::BadHandle)));
    }

    #[test]
    fn test_open_process_checks_session() {
        let ns = Namespace::new();
        let procs = LocalProcessTable::new();
        procs.insert(ProcessInfo::new(10).logon_session(1));
        procs.insert(ProcessInfo::new(11).logon_session(1));
        procs.insert(ProcessInfo::new(12).logon_session(0));
        let _t10 = HandleTable::register(&ns, 10).unwrap();

        assert!(open_process(&ns, &procs, 11, 10).is_ok());
        assert!(matches!(open_process(&ns, &procs, 12, 10), Err(TtyError::AccessDenied(_))));
        assert!(matches!(open_process(&ns, &procs, 11, 99), Err(TtyError::AccessDenied(_))));
    }
}

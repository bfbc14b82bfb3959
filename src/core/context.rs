//! Process-wide terminal context
//!
//! Everything the terminal core shares across handles of one process: the
//! named object namespace, the pty table, the process table and the
//! configuration. Built once on first use and never torn down.
//!
//! On Windows the global context is machine-scoped: events, mutexes, pipes
//! and the pty table are kernel objects other processes of the session
//! reach by name. Tests and other platforms use a process-local context.

use std::sync::{Arc, OnceLock, RwLock};

use tracing::info;

use super::console::device::{ConsoleDevice, ConsoleInput};
use super::console::Console;
use super::error::Result;
use super::handles::HandleTable;
use super::process::{LocalProcessTable, Pid, ProcessTable};
use super::pty::broker::Connector;
use super::pty::{PtyMaster, TtySlave};
use super::sync::Namespace;
use super::tty::TtyTable;
use crate::config::Config;

pub struct TtyContext {
    config: Config,
    ns: Arc<Namespace>,
    ttys: Arc<TtyTable>,
    procs: Arc<dyn ProcessTable>,
    broker: RwLock<Option<Arc<dyn Connector>>>,
}

impl std::fmt::Debug for TtyContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtyContext")
            .field("ns", &self.ns)
            .field("ttys_in_use", &self.ttys.in_use())
            .finish()
    }
}

static GLOBAL: OnceLock<Arc<TtyContext>> = OnceLock::new();

impl TtyContext {
    pub fn new(config: Config, procs: Arc<dyn ProcessTable>) -> Arc<Self> {
        Arc::new(Self {
            config,
            ns: Arc::new(Namespace::new()),
            ttys: Arc::new(TtyTable::new()),
            procs,
            broker: RwLock::new(None),
        })
    }

    /// Context whose objects every process of the session shares.
    #[cfg(windows)]
    pub fn machine(config: Config, procs: Arc<dyn ProcessTable>) -> Result<Arc<Self>> {
        let ttys = TtyTable::shared()?;
        Ok(Arc::new(Self {
            config,
            ns: Arc::new(Namespace::machine()),
            ttys: Arc::new(ttys),
            procs,
            broker: RwLock::new(None),
        }))
    }

    /// This process's context, created from `~/.ntty/config.toml` on first use.
    pub fn global() -> Arc<Self> {
        GLOBAL
            .get_or_init(|| {
                info!("initialising terminal context");
                let config = Config::load();
                let procs: Arc<dyn ProcessTable> = Arc::new(LocalProcessTable::new());
                #[cfg(windows)]
                match Self::machine(config.clone(), procs.clone()) {
                    Ok(ctx) => return ctx,
                    Err(e) => tracing::warn!("machine-wide terminal objects unavailable: {}", e),
                }
                Self::new(config, procs)
            })
            .clone()
    }

    pub fn is_machine(&self) -> bool {
        self.ns.is_machine()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn namespace(&self) -> &Arc<Namespace> {
        &self.ns
    }

    pub fn ttys(&self) -> &Arc<TtyTable> {
        &self.ttys
    }

    pub fn procs(&self) -> &Arc<dyn ProcessTable> {
        &self.procs
    }

    /// Handle table of `pid`, published on first use.
    pub fn handle_table(&self, pid: Pid) -> Result<Arc<HandleTable>> {
        HandleTable::register(&self.ns, pid)
    }

    /// Where slaves go when they may not duplicate a master's handles themselves.
    pub fn set_broker(&self, connector: Arc<dyn Connector>) {
        *self.broker.write().unwrap_or_else(|e| e.into_inner()) = Some(connector);
    }

    pub fn broker(&self) -> Option<Arc<dyn Connector>> {
        self.broker.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Attach to console `window`, opening the device with `open` when nobody has.
    pub fn attach_console<F>(&self, window: usize, open: F) -> Result<Arc<Console>>
    where
        F: FnOnce() -> Result<(Box<dyn ConsoleDevice>, Box<dyn ConsoleInput>)>,
    {
        Console::attach(&self.ns, window, self.config.console.charset(), open)
    }

    /// Allocate a pty and open both ends for `pid`.
    pub fn openpty(self: &Arc<Self>, pid: Pid) -> Result<(PtyMaster, TtySlave)> {
        let master = PtyMaster::open(self, pid)?;
        let slave = TtySlave::open(self, master.unit(), pid)?;
        Ok((master, slave))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::process::ProcessInfo;

    #[test]
    fn test_global_is_shared() {
        let a = TtyContext::global();
        let b = TtyContext::global();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_new_context_is_process_local() {
        let ctx = TtyContext::new(Config::default(), Arc::new(LocalProcessTable::new()));
        assert!(!ctx.is_machine());
    }

    #[test]
    fn test_openpty_uses_one_unit() {
        let procs = Arc::new(LocalProcessTable::new());
        procs.insert(ProcessInfo::new(10));
        let ctx = TtyContext::new(Config::default(), procs);
        let (master, slave) = ctx.openpty(10).unwrap();
        assert_eq!(master.unit(), slave.unit());
        assert_eq!(ctx.ttys().in_use(), 1);
        drop(slave);
        drop(master);
        assert_eq!(ctx.ttys().in_use(), 0);
    }

    #[test]
    fn test_handle_table_is_per_process() {
        let ctx = TtyContext::new(Config::default(), Arc::new(LocalProcessTable::new()));
        let a = ctx.handle_table(1).unwrap();
        let b = ctx.handle_table(1).unwrap();
        let c = ctx.handle_table(2).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}

#[cfg(all(test, windows))]
mod machine_tests {
    use super::*;
    use crate::core::fhandler::Fhandler;
    use crate::core::kernel;
    use crate::core::process::ProcessInfo;

    #[test]
    fn test_machine_openpty_moves_bytes_through_kernel_pipes() {
        let pid = kernel::current_pid();
        let procs = Arc::new(LocalProcessTable::new());
        procs.insert(ProcessInfo::new(pid));
        let ctx = TtyContext::machine(Config::default(), procs).unwrap();
        assert!(ctx.is_machine());
        let (mut master, mut slave) = ctx.openpty(pid).unwrap();
        assert_eq!(slave.write(b"hi").unwrap(), 2);
        let mut buf = [0u8; 8];
        let n = master.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hi");
        drop(slave);
        drop(master);
    }
}

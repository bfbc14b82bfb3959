//! Named synchronization objects
//!
//! Master and slave ends of a terminal live in different processes and only share
//! a unit number, so every object they both need is rediscovered by name through
//! a [`Namespace`]. A process-scoped namespace holds weak references only: once
//! the last holder of an object drops it, the name no longer resolves. On Windows
//! a machine-scoped namespace backs events and mutexes with kernel objects, whose
//! names vanish the same way when the last handle closes. Liveness checks such as
//! "is the master still there" are answered by opening a name, not by trusting a
//! flag someone may not have been able to clear before dying.

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

#[cfg(windows)]
use super::kernel;
use super::error::{Result, TtyError};

/// Prefix shared by every object name, versioned so incompatible builds never meet.
const NAME_PREFIX: &str = "ntty1S";

/// Build the machine-wide name of a per-unit object.
pub fn shared_name(base: &str, unit: usize) -> String {
    format!("{}.{}.{}", NAME_PREFIX, base, unit)
}

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// How often waits that involve kernel objects look again.
const KERNEL_POLL: Duration = Duration::from_millis(10);

type AnyObject = dyn Any + Send + Sync;

/// Where events and mutexes of a [`Namespace`] live.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Scope {
    /// Inside this process only.
    #[default]
    Process,
    /// Kernel objects every process of the session can open.
    #[cfg(windows)]
    Machine,
}

/// Registry of named objects.
///
/// Events and mutexes follow the namespace's [`Scope`]. Everything else
/// registered through [`create`](Namespace::create) is a process-local object
/// such as a handle table.
#[derive(Default)]
pub struct Namespace {
    scope: Scope,
    objects: Mutex<HashMap<String, Weak<AnyObject>>>,
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let live = lock(&self.objects)
            .values()
            .filter(|w| w.strong_count() > 0)
            .count();
        f.debug_struct("Namespace")
            .field("scope", &self.scope)
            .field("live", &live)
            .finish()
    }
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Namespace whose events and mutexes are kernel objects.
    #[cfg(windows)]
    pub fn machine() -> Self {
        Self {
            scope: Scope::Machine,
            objects: Mutex::default(),
        }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn is_machine(&self) -> bool {
        self.scope != Scope::Process
    }

    /// Create the object, or open it if a live object of that name exists.
    ///
    /// Returns `(object, created)`. A live object of a different type under the
    /// same name is a resource failure.
    pub fn create<T, F>(&self, name: &str, init: F) -> Result<(Arc<T>, bool)>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut objects = lock(&self.objects);
        if let Some(existing) = objects.get(name).and_then(Weak::upgrade) {
            return existing
                .downcast::<T>()
                .map(|obj| (obj, false))
                .map_err(|_| TtyError::Resource {
                    what: "named object",
                    source: io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{} exists with another type", name),
                    ),
                });
        }
        let obj = Arc::new(init());
        let erased: Arc<AnyObject> = obj.clone();
        objects.insert(name.to_string(), Arc::downgrade(&erased));
        Ok((obj, true))
    }

    /// Open an existing live object.
    pub fn open<T: Any + Send + Sync>(&self, name: &str) -> Option<Arc<T>> {
        let mut objects = lock(&self.objects);
        match objects.get(name).map(Weak::upgrade) {
            Some(Some(obj)) => obj.downcast::<T>().ok(),
            Some(None) => {
                objects.remove(name);
                None
            }
            None => None,
        }
    }

    /// True while some holder keeps the named object alive. In a machine
    /// namespace only events are looked up.
    pub fn exists(&self, name: &str) -> bool {
        #[cfg(windows)]
        if self.scope == Scope::Machine {
            return kernel::Event::exists(name);
        }
        lock(&self.objects)
            .get(name)
            .map_or(false, |w| w.strong_count() > 0)
    }

    pub fn create_event(&self, name: &str, manual_reset: bool, initial: bool) -> Result<Arc<NamedEvent>> {
        #[cfg(windows)]
        if self.scope == Scope::Machine {
            let (os, _) = kernel::Event::create(name, manual_reset, initial)?;
            return Ok(Arc::new(NamedEvent::from_kernel(name, manual_reset, os)));
        }
        self.create(name, || NamedEvent::new(name, manual_reset, initial))
            .map(|(ev, _)| ev)
    }

    pub fn open_event(&self, name: &str) -> Option<Arc<NamedEvent>> {
        #[cfg(windows)]
        if self.scope == Scope::Machine {
            return kernel::Event::open(name).map(|os| Arc::new(NamedEvent::from_kernel(name, false, os)));
        }
        self.open(name)
    }

    /// Create or open a mutex that guards no data of its own.
    pub fn create_mutex(&self, name: &str) -> Result<Arc<NamedMutex<()>>> {
        #[cfg(windows)]
        if self.scope == Scope::Machine {
            let os = kernel::Mutex::create(name)?;
            return Ok(Arc::new(NamedMutex::shared(name, kernel::SharedCell::lock_only(os))));
        }
        self.create(name, || NamedMutex::new(name, ())).map(|(m, _)| m)
    }

    pub fn open_mutex(&self, name: &str) -> Option<Arc<NamedMutex<()>>> {
        #[cfg(windows)]
        if self.scope == Scope::Machine {
            return kernel::Mutex::open(name)
                .map(|os| Arc::new(NamedMutex::shared(name, kernel::SharedCell::lock_only(os))));
        }
        self.open(name)
    }
}

enum Store<T> {
    Local(Mutex<T>),
    #[cfg(windows)]
    Shared(kernel::SharedCell<T>),
}

/// A mutex whose guard is the only way to reach the protected data, plus a
/// condition used by holders that must wait for another party to change it.
///
/// Shared mutexes keep their data in a kernel section; waiters on those poll,
/// since a change may come from another process.
pub struct NamedMutex<T> {
    name: String,
    store: Store<T>,
    cond: Condvar,
}

impl<T> std::fmt::Debug for NamedMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedMutex").field("name", &self.name).finish()
    }
}

impl<T> NamedMutex<T> {
    pub fn new(name: impl Into<String>, data: T) -> Self {
        Self {
            name: name.into(),
            store: Store::Local(Mutex::new(data)),
            cond: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn acquire(&self) -> NamedGuard<'_, T> {
        let held = match &self.store {
            Store::Local(m) => Held::Local(lock(m)),
            #[cfg(windows)]
            Store::Shared(cell) => Held::Shared(cell.lock()),
        };
        NamedGuard { owner: self, held }
    }

    /// Wake every holder blocked in [`NamedGuard::wait_timeout_while`].
    pub fn notify_all(&self) {
        self.cond.notify_all();
    }
}

#[cfg(windows)]
impl<T: Copy> NamedMutex<T> {
    pub fn shared(name: impl Into<String>, cell: kernel::SharedCell<T>) -> Self {
        Self {
            name: name.into(),
            store: Store::Shared(cell),
            cond: Condvar::new(),
        }
    }
}

enum Held<'a, T> {
    Local(MutexGuard<'a, T>),
    #[cfg(windows)]
    Shared(kernel::SharedLock<'a, T>),
}

pub struct NamedGuard<'a, T> {
    owner: &'a NamedMutex<T>,
    held: Held<'a, T>,
}

impl<'a, T> NamedGuard<'a, T> {
    /// Release the mutex while `cond` holds, reacquiring before return; give
    /// up after `timeout`. The flag is true when the wait timed out with
    /// `cond` still holding.
    pub fn wait_timeout_while<F: FnMut(&mut T) -> bool>(self, timeout: Duration, cond: F) -> (Self, bool) {
        let owner = self.owner;
        match self.held {
            Held::Local(guard) => {
                let (guard, res) = owner
                    .cond
                    .wait_timeout_while(guard, timeout, cond)
                    .unwrap_or_else(|e| e.into_inner());
                (NamedGuard { owner, held: Held::Local(guard) }, res.timed_out())
            }
            #[cfg(windows)]
            Held::Shared(mut guard) => {
                let mut cond = cond;
                let deadline = Instant::now() + timeout;
                loop {
                    if !cond(&mut guard) {
                        return (NamedGuard { owner, held: Held::Shared(guard) }, false);
                    }
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        return (NamedGuard { owner, held: Held::Shared(guard) }, true);
                    }
                    guard = guard.pause(left.min(KERNEL_POLL));
                }
            }
        }
    }

    pub fn notify_all(&self) {
        self.owner.cond.notify_all();
    }
}

impl<T> Deref for NamedGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        match &self.held {
            Held::Local(g) => &**g,
            #[cfg(windows)]
            Held::Shared(g) => &**g,
        }
    }
}

impl<T> DerefMut for NamedGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.held {
            Held::Local(g) => &mut **g,
            #[cfg(windows)]
            Held::Shared(g) => &mut **g,
        }
    }
}

#[derive(Default)]
struct Waker {
    fired: Mutex<bool>,
    cond: Condvar,
}

impl Waker {
    fn wake(&self) {
        *lock(&self.fired) = true;
        self.cond.notify_all();
    }
}

struct EventState {
    signaled: bool,
    waiters: Vec<Weak<Waker>>,
}

/// Win32-style event object.
///
/// An auto-reset event releases exactly one waiter per `set` and clears itself;
/// a manual-reset event stays signaled until `reset`. A kernel-backed event
/// keeps its signal in the kernel object, so a `set` from another process is
/// seen here too.
pub struct NamedEvent {
    name: String,
    manual_reset: bool,
    state: Mutex<EventState>,
    #[cfg(windows)]
    os: Option<kernel::Event>,
}

impl std::fmt::Debug for NamedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedEvent")
            .field("name", &self.name)
            .field("manual_reset", &self.manual_reset)
            .field("signaled", &self.is_set())
            .finish()
    }
}

impl NamedEvent {
    pub fn new(name: impl Into<String>, manual_reset: bool, initial: bool) -> Self {
        Self {
            name: name.into(),
            manual_reset,
            state: Mutex::new(EventState {
                signaled: initial,
                waiters: Vec::new(),
            }),
            #[cfg(windows)]
            os: None,
        }
    }

    #[cfg(windows)]
    pub(crate) fn from_kernel(name: impl Into<String>, manual_reset: bool, os: kernel::Event) -> Self {
        Self {
            name: name.into(),
            manual_reset,
            state: Mutex::new(EventState {
                signaled: false,
                waiters: Vec::new(),
            }),
            os: Some(os),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn is_kernel(&self) -> bool {
        #[cfg(windows)]
        if self.os.is_some() {
            return true;
        }
        false
    }

    pub fn set(&self) {
        #[cfg(windows)]
        if let Some(os) = &self.os {
            os.set();
        }
        let mut state = lock(&self.state);
        state.signaled = !self.is_kernel();
        state.waiters.retain(|w| match w.upgrade() {
            Some(waker) => {
                waker.wake();
                true
            }
            None => false,
        });
    }

    pub fn reset(&self) {
        #[cfg(windows)]
        if let Some(os) = &self.os {
            os.reset();
        }
        lock(&self.state).signaled = false;
    }

    pub fn is_set(&self) -> bool {
        #[cfg(windows)]
        if let Some(os) = &self.os {
            return os.is_set();
        }
        lock(&self.state).signaled
    }

    /// Consume the signal if present (auto-reset semantics apply).
    fn try_consume(&self) -> bool {
        #[cfg(windows)]
        if let Some(os) = &self.os {
            return os.try_consume();
        }
        let mut state = lock(&self.state);
        if state.signaled {
            if !self.manual_reset {
                state.signaled = false;
            }
            true
        } else {
            false
        }
    }

    fn register(&self, waker: &Arc<Waker>) {
        lock(&self.state).waiters.push(Arc::downgrade(waker));
    }

    fn unregister(&self, waker: &Arc<Waker>) {
        lock(&self.state)
            .waiters
            .retain(|w| w.upgrade().map_or(false, |o| !Arc::ptr_eq(&o, waker)));
    }

    /// Wait for this event alone.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        wait_any(&[self], timeout).is_some()
    }
}

/// Wait until any of `events` is signaled, returning its index, or `None` on
/// timeout. Lower indices win when several are signaled at once.
pub fn wait_any(events: &[&NamedEvent], timeout: Option<Duration>) -> Option<usize> {
    #[cfg(windows)]
    if !events.is_empty() {
        let os: Vec<&kernel::Event> = events.iter().filter_map(|ev| ev.os.as_ref()).collect();
        if os.len() == events.len() {
            return kernel::wait_any(&os, timeout);
        }
    }
    // a kernel event is signaled without touching our waker
    let slice = events.iter().any(|ev| ev.is_kernel()).then_some(KERNEL_POLL);
    let waker = Arc::new(Waker::default());
    for ev in events {
        ev.register(&waker);
    }
    let deadline = timeout.map(|t| Instant::now() + t);

    let result = 'outer: loop {
        for (i, ev) in events.iter().enumerate() {
            if ev.try_consume() {
                break 'outer Some(i);
            }
        }
        let mut fired = lock(&waker.fired);
        while !*fired {
            let left = match deadline {
                None => None,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break 'outer None;
                    }
                    Some(deadline - now)
                }
            };
            let wait = match (left, slice) {
                (Some(l), Some(s)) => Some(l.min(s)),
                (l, s) => l.or(s),
            };
            match wait {
                None => {
                    fired = waker.cond.wait(fired).unwrap_or_else(|e| e.into_inner());
                }
                Some(wait) => {
                    let (guard, res) = waker
                        .cond
                        .wait_timeout(fired, wait)
                        .unwrap_or_else(|e| e.into_inner());
                    fired = guard;
                    if res.timed_out() && slice.is_some() {
                        continue 'outer;
                    }
                }
            }
        }
        *fired = false;
    };

    for ev in events {
        ev.unregister(&waker);
    }
    result
}


#[cfg(all(test, windows))]
mod machine_tests {
    use super::*;
    use std::thread;

    fn unique(base: &str) -> String {
        format!("{}.{}.{}", NAME_PREFIX, base, kernel::current_pid())
    }

    #[test]
    fn test_machine_events_meet_across_namespaces() {
        let name = unique("test.ev");
        let a = Namespace::machine();
        let b = Namespace::machine();
        let ev = a.create_event(&name, true, false).unwrap();
        assert!(b.exists(&name));
        let seen = b.open_event(&name).unwrap();
        ev.set();
        assert!(seen.wait(Some(Duration::from_millis(100))));
        drop(seen);
        drop(ev);
        assert!(!b.exists(&name));
    }

    #[test]
    fn test_machine_wait_any_mixes_local_and_kernel() {
        let name = unique("test.mixed");
        let ns = Namespace::machine();
        let os = ns.create_event(&name, false, false).unwrap();
        let local = NamedEvent::new("local", false, false);
        let os2 = os.clone();
        let setter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            os2.set();
        });
        let idx = wait_any(&[&local, os.as_ref()], Some(Duration::from_secs(5)));
        setter.join().unwrap();
        assert_eq!(idx, Some(1));
    }

    #[test]
    fn test_machine_mutex_serializes() {
        let name = unique("test.mutex");
        let ns = Namespace::machine();
        let m = ns.create_mutex(&name).unwrap();
        let other = ns.open_mutex(&name).unwrap();
        let g = m.acquire();
        let t = thread::spawn(move || {
            let _g = other.acquire();
        });
        thread::sleep(Duration::from_millis(20));
        assert!(!t.is_finished());
        drop(g);
        t.join().unwrap();
    }
}

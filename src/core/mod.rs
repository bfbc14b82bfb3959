//! Terminal core.
//!
//! - **termios / ldisc**: termios settings, the line discipline, OPOST and
//!   background job control
//! - **tty**: the shared per-unit tty record and the unit table
//! - **console**: console escape engine, input translation and console devices
//! - **pty**: pty masters and slaves joined by pipes and named sync objects
//! - **fhandler**: the POSIX surface every terminal handle implements
//! - **kernel** (Windows): named kernel objects, pipes and the shared section
//!   behind a machine-scoped context
//!
//! # Architecture
//!
//! ```text
//! TtyContext
//! ├── Namespace (named mutexes, events, handle tables)
//! │     process scope: in memory; machine scope: kernel objects
//! ├── TtyTable ── TtyRecord (termios, pgid/sid, winsize, pipe handles)
//! │     process scope: in memory; machine scope: a shared section
//! └── ProcessTable (groups, sessions, signal delivery)
//!
//! FhandlerConsole ── LineDiscipline ── Console (escape engine + device)
//! PtyMaster / TtyMaster ══ pipes ══ TtySlave
//! ```

pub mod console;
pub mod context;
pub mod error;
pub mod fhandler;
pub mod handles;
#[cfg(windows)]
pub mod kernel;
pub mod ldisc;
pub mod pipe;
pub mod process;
pub mod pty;
pub mod sync;
pub mod termios;
pub mod tty;

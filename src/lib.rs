//! ntty: POSIX terminals over a console.
//!
//! The line discipline, the console escape engine and pseudo-terminals,
//! sharing one tty record per unit for termios and job-control state.

pub mod config;
pub mod core;

pub use crate::core::context::TtyContext;
pub use crate::core::error::{Result, TtyError};
pub use crate::core::fhandler::Fhandler;

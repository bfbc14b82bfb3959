//! Single-slot ioctl channel from slaves to the console-backed master
//!
//! Only the master holds the console, so a slave asking for the window size
//! or the shift state posts the request here and waits for the master's
//! ioctl thread to answer. One request is in flight at a time; a caller that
//! finds the slot busy waits its turn, bounded by its timeout.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::core::error::{Result, TtyError};
use crate::core::fhandler::{Ioctl, IoctlReply};
use crate::core::sync::NamedMutex;

#[derive(Default)]
struct Slot {
    seq: u64,
    request: Option<(u64, Ioctl)>,
    reply: Option<(u64, Result<IoctlReply>)>,
    busy: bool,
    serving: bool,
}

pub struct IoctlChannel {
    slot: NamedMutex<Slot>,
}

impl std::fmt::Debug for IoctlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoctlChannel").field("name", &self.slot.name()).finish()
    }
}

impl IoctlChannel {
    pub fn new(name: impl Into<String>) -> Self {
        Self { slot: NamedMutex::new(name, Slot::default()) }
    }

    /// Mark whether a master is answering requests.
    pub fn set_serving(&self, serving: bool) {
        let mut slot = self.slot.acquire();
        slot.serving = serving;
        if !serving {
            // nobody will answer what is still queued
            if let Some((seq, req)) = slot.request.take() {
                debug!("{}: dropping {:?}", self.slot.name(), req);
                slot.reply = Some((seq, Err(TtyError::NoDevice)));
            }
        }
        slot.notify_all();
    }

    pub fn is_served(&self) -> bool {
        self.slot.acquire().serving
    }

    /// Post `req` and wait for the answer. `Busy` when no answer came in time.
    pub fn call(&self, req: Ioctl, timeout: Duration) -> Result<IoctlReply> {
        let deadline = Instant::now() + timeout;
        let slot = self.slot.acquire();
        let (mut slot, timed_out) = slot.wait_timeout_while(timeout, |s| s.busy);
        if timed_out {
            return Err(TtyError::Busy);
        }
        if !slot.serving {
            return Err(TtyError::NoDevice);
        }
        slot.seq += 1;
        let seq = slot.seq;
        slot.busy = true;
        slot.reply = None;
        slot.request = Some((seq, req));
        slot.notify_all();

        let left = deadline.saturating_duration_since(Instant::now());
        let (mut slot, _) = slot.wait_timeout_while(left, |s| !matches!(s.reply, Some((n, _)) if n == seq));
        slot.busy = false;
        let reply = match slot.reply.take() {
            Some((n, reply)) if n == seq => reply,
            other => {
                slot.reply = other;
                if matches!(slot.request, Some((n, _)) if n == seq) {
                    slot.request = None;
                }
                warn!("{}: {:?} not answered within {:?}", self.slot.name(), req, timeout);
                Err(TtyError::Busy)
            }
        };
        slot.notify_all();
        reply
    }

    /// Wait up to `timeout` for one request and answer it with `handler`.
    /// Returns false when nothing arrived.
    pub fn serve_one<F>(&self, timeout: Duration, handler: F) -> bool
    where
        F: FnOnce(Ioctl) -> Result<IoctlReply>,
    {
        let slot = self.slot.acquire();
        let (mut slot, _) = slot.wait_timeout_while(timeout, |s| s.request.is_none());
        let Some((seq, req)) = slot.request.take() else {
            return false;
        };
        drop(slot);

        let reply = handler(req);
        debug!("{}: {:?} -> {:?}", self.slot.name(), req, reply);
        let mut slot = self.slot.acquire();
        slot.reply = Some((seq, reply));
        slot.notify_all();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::termios::Winsize;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_call_is_answered() {
        let ch = Arc::new(IoctlChannel::new("ioctl.test"));
        ch.set_serving(true);
        let server = {
            let ch = ch.clone();
            thread::spawn(move || {
                while !ch.serve_one(Duration::from_millis(50), |req| match req {
                    Ioctl::GetWinsize => Ok(IoctlReply::Winsize(Winsize::new(100, 30))),
                    _ => Err(TtyError::invalid("unsupported")),
                }) {}
            })
        };
        let reply = ch.call(Ioctl::GetWinsize, Duration::from_secs(5)).unwrap();
        assert_eq!(reply, IoctlReply::Winsize(Winsize::new(100, 30)));
        server.join().unwrap();
    }

    #[test]
    fn test_unserved_channel_refuses() {
        let ch = IoctlChannel::new("ioctl.none");
        assert!(matches!(
            ch.call(Ioctl::GetWinsize, Duration::from_millis(10)),
            Err(TtyError::NoDevice)
        ));
    }

    #[test]
    fn test_unanswered_call_times_out_and_frees_slot() {
        let ch = IoctlChannel::new("ioctl.slow");
        ch.set_serving(true);
        assert!(matches!(
            ch.call(Ioctl::Linux(6), Duration::from_millis(20)),
            Err(TtyError::Busy)
        ));
        // the stale request is gone; a server sees nothing
        assert!(!ch.serve_one(Duration::from_millis(10), |_| Ok(IoctlReply::Done)));
    }

    #[test]
    fn test_handler_error_reaches_caller() {
        let ch = Arc::new(IoctlChannel::new("ioctl.err"));
        ch.set_serving(true);
        let server = {
            let ch = ch.clone();
            thread::spawn(move || {
                while !ch.serve_one(Duration::from_millis(50), |_| Err(TtyError::invalid("no"))) {}
            })
        };
        assert!(matches!(
            ch.call(Ioctl::Linux(2), Duration::from_secs(5)),
            Err(TtyError::InvalidArgument(_))
        ));
        server.join().unwrap();
    }
}

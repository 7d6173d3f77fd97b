//! Readiness notification service backed by `poll(2)`.
//!
//! [`PollLoop`] is a single-threaded event-loop adapter. Channels register
//! read watches through a [`LoopHandle`] and are called back from
//! [`PollLoop::turn`] when their descriptor becomes readable. The loop also
//! owns a deferred-task queue: work posted with [`LoopHandle::defer`] during
//! one turn runs at the start of the next, never from inside the readiness
//! dispatch that posted it.
//!
//! Dispatch is edge-triggered from the watcher's point of view: a watch
//! fires at most once per enable. Firing disarms the watch; calling
//! [`ReadWatch::set_enabled`] with `true` arms it again. A watcher that
//! drains a descriptor must re-enable its watch or it will not be called
//! again.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::rc::{Rc, Weak};
use std::time::Duration;

use libc::{c_int, nfds_t, pollfd, POLLERR, POLLHUP, POLLIN};
use log::trace;

use crate::error::{self, Result};

struct WatchEntry {
    fd: RawFd,
    enabled: Cell<bool>,
    armed: Cell<bool>,
    on_readable: Box<dyn Fn()>,
}

/// A live read-readiness registration.
///
/// The watch stays registered for as long as this handle is alive; dropping
/// it removes the registration from the loop.
pub struct ReadWatch {
    entry: Rc<WatchEntry>,
}

impl ReadWatch {
    /// The watched descriptor.
    pub fn fd(&self) -> RawFd {
        self.entry.fd
    }

    /// Whether the watch currently delivers readiness events.
    pub fn is_enabled(&self) -> bool {
        self.entry.enabled.get()
    }

    /// Enables or disables delivery.
    ///
    /// Enabling also re-arms the watch, so the next readiness of the
    /// descriptor fires it again.
    pub fn set_enabled(&self, enabled: bool) {
        self.entry.enabled.set(enabled);
        if enabled {
            self.entry.armed.set(true);
        }
    }
}

struct LoopInner {
    watches: Vec<Weak<WatchEntry>>,
    deferred: VecDeque<Box<dyn FnOnce()>>,
}

/// A `poll(2)`-based event loop driving read watches and deferred tasks.
pub struct PollLoop {
    inner: Rc<RefCell<LoopInner>>,
}

impl PollLoop {
    /// Creates an empty loop.
    pub fn new() -> Self {
        PollLoop {
            inner: Rc::new(RefCell::new(LoopInner {
                watches: Vec::new(),
                deferred: VecDeque::new(),
            })),
        }
    }

    /// Returns a handle for registering watches and posting deferred tasks.
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            inner: Rc::downgrade(&self.inner),
        }
    }

    /// Runs one loop iteration.
    ///
    /// First runs every task deferred during previous turns, then polls the
    /// enabled watches and dispatches their readiness callbacks. `timeout`
    /// bounds the poll: `None` blocks until a watched descriptor is
    /// readable. When deferred tasks were run, the poll does not block at
    /// all, so back-to-back notifications cannot stall the loop.
    ///
    /// Returns the number of tasks run plus callbacks dispatched. An
    /// interrupted poll (`EINTR`) counts as an empty turn.
    pub fn turn(&self, timeout: Option<Duration>) -> Result<usize> {
        let tasks: Vec<Box<dyn FnOnce()>> = self.inner.borrow_mut().deferred.drain(..).collect();
        let mut progress = tasks.len();
        for task in tasks {
            task();
        }

        // Upgrade and sweep registrations without holding the borrow over
        // the dispatch below; callbacks may register watches or post tasks.
        let entries: Vec<Rc<WatchEntry>> = {
            let mut inner = self.inner.borrow_mut();
            inner.watches.retain(|watch| watch.upgrade().is_some());
            inner
                .watches
                .iter()
                .filter_map(Weak::upgrade)
                .filter(|entry| entry.enabled.get() && entry.armed.get())
                .collect()
        };

        if entries.is_empty() {
            return Ok(progress);
        }

        let mut fds: Vec<pollfd> = entries
            .iter()
            .map(|entry| pollfd {
                fd: entry.fd,
                events: POLLIN,
                revents: 0,
            })
            .collect();

        let timeout_ms: c_int = if progress > 0 {
            0
        } else {
            match timeout {
                Some(timeout) => timeout.as_millis().min(c_int::MAX as u128) as c_int,
                None => -1,
            }
        };

        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as nfds_t, timeout_ms) };
        if ready < 0 {
            let err = error::last_os_error();
            if err.kind() == crate::ErrorKind::Io(std::io::ErrorKind::Interrupted) {
                return Ok(progress);
            }
            return Err(err);
        }

        for (fd, entry) in fds.iter().zip(&entries) {
            if fd.revents & (POLLIN | POLLHUP | POLLERR) == 0 {
                continue;
            }

            // Re-check: an earlier callback in this turn may have disabled
            // this watch.
            if entry.enabled.get() && entry.armed.get() {
                entry.armed.set(false);
                trace!("fd {} readable, dispatching", entry.fd);
                (entry.on_readable)();
                progress += 1;
            }
        }

        Ok(progress)
    }
}

impl Default for PollLoop {
    fn default() -> Self {
        PollLoop::new()
    }
}

/// A cheap handle onto a [`PollLoop`], held by channels.
///
/// All operations become no-ops once the loop itself is dropped.
#[derive(Clone)]
pub struct LoopHandle {
    inner: Weak<RefCell<LoopInner>>,
}

impl LoopHandle {
    /// Registers a read watch for `fd`.
    ///
    /// The watch starts enabled and armed. `on_readable` is invoked from
    /// [`PollLoop::turn`] whenever the descriptor is readable and the watch
    /// is enabled.
    pub fn watch_read<F: Fn() + 'static>(&self, fd: RawFd, on_readable: F) -> ReadWatch {
        let entry = Rc::new(WatchEntry {
            fd,
            enabled: Cell::new(true),
            armed: Cell::new(true),
            on_readable: Box::new(on_readable),
        });

        if let Some(inner) = self.inner.upgrade() {
            inner.borrow_mut().watches.push(Rc::downgrade(&entry));
        }

        ReadWatch { entry }
    }

    /// Posts a task to run at the start of the next loop turn.
    pub fn defer<F: FnOnce() + 'static>(&self, task: F) {
        if let Some(inner) = self.inner.upgrade() {
            inner.borrow_mut().deferred.push_back(Box::new(task));
        }
    }
}

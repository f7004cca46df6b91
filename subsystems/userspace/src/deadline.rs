//! # Deadline Handlers
//!
//! When a real-time environment overruns its deadline the kernel demotes it
//! and diverts its current thread to the upcall entry, with the interrupted
//! registers saved on the thread's exception stack. The upcall trampoline
//! then calls [`DeadlineHandlers::dispatch`].
//!
//! Handlers run in registration order until one returns `true`.

use core::sync::atomic::{AtomicBool, Ordering};

use heapless::Vec;
use lumen_execution::EnvId;
use lumen_hal::VirtAddr;
use spin::Mutex;

use crate::{SyscallPort, UserError, UserResult, STATS};

/// Handler slots
pub const MAX_DEADLINE_HANDLERS: usize = 8;

/// A deadline handler; `true` means handled
pub type DeadlineHandler = fn() -> bool;

fn same(a: DeadlineHandler, b: DeadlineHandler) -> bool {
    a as usize == b as usize
}

/// Registry of deadline handlers for one environment
#[derive(Debug)]
pub struct DeadlineHandlers {
    upcall: VirtAddr,
    installed: AtomicBool,
    handlers: Mutex<Vec<DeadlineHandler, MAX_DEADLINE_HANDLERS>>,
}

impl DeadlineHandlers {
    /// Registry whose upcall trampoline lives at `upcall`
    pub const fn new(upcall: VirtAddr) -> Self {
        Self {
            upcall,
            installed: AtomicBool::new(false),
            handlers: Mutex::new(Vec::new()),
        }
    }

    /// Register `handler`.
    ///
    /// The first registration installs the upcall with the kernel.
    /// Registering a handler twice has no effect.
    pub fn add<P: SyscallPort + ?Sized>(&self, port: &P, handler: DeadlineHandler) -> UserResult<()> {
        let mut handlers = self.handlers.lock();
        if handlers.iter().any(|&h| same(h, handler)) {
            return Ok(());
        }
        if !self.installed.load(Ordering::Acquire) {
            port.set_deadline_upcall(EnvId::SELF, Some(self.upcall))?;
            self.installed.store(true, Ordering::Release);
            log::debug!("deadline upcall installed at {}", self.upcall);
        }
        handlers.push(handler).map_err(|_| UserError::HandlersFull)
    }

    /// Unregister `handler`; returns whether it was registered
    pub fn remove(&self, handler: DeadlineHandler) -> bool {
        let mut handlers = self.handlers.lock();
        match handlers.iter().position(|&h| same(h, handler)) {
            Some(i) => {
                handlers.remove(i);
                true
            }
            None => false,
        }
    }

    /// Registered handlers
    pub fn len(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the upcall has been installed
    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::Acquire)
    }

    /// Run handlers in order until one handles the overrun
    pub fn dispatch(&self) -> bool {
        STATS.deadline_dispatched();
        // Handlers may register others; run them on a snapshot
        let snapshot = self.handlers.lock().clone();
        snapshot.iter().any(|handler| handler())
    }
}

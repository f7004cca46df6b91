//! # Threads
//!
//! Thin wrappers over the thread syscalls. A thread starts at `entry` with
//! `arg` in its first argument register, on a stack the kernel maps for it.

use lumen_execution::{Sysno, ThreadId};
use lumen_hal::VirtAddr;

use crate::{SyscallPort, UserResult, STATS};

/// Start a thread in the calling environment
pub fn thread_create<P: SyscallPort + ?Sized>(
    port: &P,
    entry: VirtAddr,
    arg: u64,
) -> UserResult<ThreadId> {
    let raw = port.call(Sysno::ThreadCreate, &[entry.as_u64(), arg])?;
    STATS.thread_spawned();
    let id = ThreadId::from_raw(raw);
    log::trace!("spawned thread {}", id);
    Ok(id)
}

/// Wait until `thread` has exited
pub fn thread_join<P: SyscallPort + ?Sized>(port: &P, thread: ThreadId) -> UserResult<()> {
    port.call(Sysno::ThreadJoin, &[thread.as_raw() as u64])
        .map(drop)
}

/// Terminate `thread` wherever it is
pub fn thread_cancel<P: SyscallPort + ?Sized>(port: &P, thread: ThreadId) -> UserResult<()> {
    port.call(Sysno::ThreadCancel, &[thread.as_raw() as u64])
        .map(drop)
}

/// Terminate the calling thread; returns only if the kernel refused
pub fn thread_exit<P: SyscallPort + ?Sized>(port: &P) -> UserResult<()> {
    port.call(Sysno::ThreadExit, &[]).map(drop)
}

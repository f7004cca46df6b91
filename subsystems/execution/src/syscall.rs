//! # Syscall Dispatch
//!
//! Entry point of the trap path. The caller's registers are decoded into a
//! [`Syscall`], which maps onto exactly one kernel operation. The signed
//! result lands in the caller's `rax` slot: non-negative on success, a
//! negative errno otherwise.
//!
//! ## Convention (x86_64)
//! - Syscall number: RAX
//! - Arguments: RDI, RSI, RDX, R10, R8, R9
//! - Return: RAX (negative = error)
//!
//! Calls that block (join, sleep, contended mutex, IPC without a ready
//! peer) get their return value later, from whoever wakes the thread.

use lumen_hal::{AddressSpaceService, Clock, Protection, VirtAddr};

use crate::{
    context::{Dispatch, SwitchReason},
    environment::{EnvClass, EnvStatus, RealTimeParams},
    ipc::IpcPoll,
    kernel::Kernel,
    to_syscall_return, EnvId, ExecError, ExecResult, MutexId, ThreadId,
};

/// Syscall numbers
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sysno {
    /// Id of the calling environment
    GetEnvId = 2,
    /// Destroy an environment
    EnvDestroy = 3,
    /// Create a child environment from the calling thread
    Exofork = 9,
    /// Mark an environment runnable or not
    EnvSetStatus = 10,
    /// Install the deadline-exceeded upcall
    SetExceedDeadlineUpcall = 13,
    /// Switch between usual and real-time class
    ChangeClass = 14,
    /// Give up the CPU
    Yield = 15,
    /// Finish the current real-time job
    PeriodicWait = 16,
    /// Timed IPC send
    IpcSend = 17,
    /// Timed IPC receive
    IpcRecv = 18,
    /// Monotonic time in ticks
    GetTime = 19,
    /// Create a thread in the calling environment
    ThreadCreate = 21,
    /// Terminate the calling thread
    ThreadExit = 22,
    /// Terminate another thread
    ThreadCancel = 23,
    /// Id of the calling thread
    GetThreadId = 24,
    /// Wait for a thread to exit
    ThreadJoin = 25,
    /// Create a kernel mutex
    MutexCreate = 26,
    /// Destroy a kernel mutex
    MutexDestroy = 27,
    /// Lock a mutex, blocking on contention
    MutexBlock = 28,
    /// Unlock a mutex
    MutexUnlock = 29,
    /// Sleep for a number of milliseconds
    Sleep = 30,
}

impl Sysno {
    /// Convert from number
    pub fn from_num(num: u64) -> Option<Self> {
        Some(match num {
            2 => Sysno::GetEnvId,
            3 => Sysno::EnvDestroy,
            9 => Sysno::Exofork,
            10 => Sysno::EnvSetStatus,
            13 => Sysno::SetExceedDeadlineUpcall,
            14 => Sysno::ChangeClass,
            15 => Sysno::Yield,
            16 => Sysno::PeriodicWait,
            17 => Sysno::IpcSend,
            18 => Sysno::IpcRecv,
            19 => Sysno::GetTime,
            21 => Sysno::ThreadCreate,
            22 => Sysno::ThreadExit,
            23 => Sysno::ThreadCancel,
            24 => Sysno::GetThreadId,
            25 => Sysno::ThreadJoin,
            26 => Sysno::MutexCreate,
            27 => Sysno::MutexDestroy,
            28 => Sysno::MutexBlock,
            29 => Sysno::MutexUnlock,
            30 => Sysno::Sleep,
            _ => return None,
        })
    }

    /// Raw number
    pub const fn num(self) -> u64 {
        self as u64
    }
}

/// Syscall arguments
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyscallArgs {
    /// Arg 1 (RDI)
    pub arg1: u64,
    /// Arg 2 (RSI)
    pub arg2: u64,
    /// Arg 3 (RDX)
    pub arg3: u64,
    /// Arg 4 (R10)
    pub arg4: u64,
    /// Arg 5 (R8)
    pub arg5: u64,
    /// Arg 6 (R9)
    pub arg6: u64,
}

impl SyscallArgs {
    /// Create from array
    pub const fn from_array(args: [u64; 6]) -> Self {
        Self {
            arg1: args[0],
            arg2: args[1],
            arg3: args[2],
            arg4: args[3],
            arg5: args[4],
            arg6: args[5],
        }
    }

    /// Back to register order
    pub const fn to_array(self) -> [u64; 6] {
        [self.arg1, self.arg2, self.arg3, self.arg4, self.arg5, self.arg6]
    }
}

/// A decoded syscall
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    /// [`Sysno::GetEnvId`]
    GetEnvId,
    /// [`Sysno::EnvDestroy`]
    EnvDestroy { env: EnvId },
    /// [`Sysno::Exofork`]
    Exofork,
    /// [`Sysno::EnvSetStatus`]
    EnvSetStatus { env: EnvId, status: EnvStatus },
    /// [`Sysno::SetExceedDeadlineUpcall`]; a zero entry clears the upcall
    SetDeadlineUpcall { env: EnvId, entry: Option<VirtAddr> },
    /// [`Sysno::ChangeClass`], parameters in ticks
    ChangeClass {
        env: EnvId,
        class: EnvClass,
        params: RealTimeParams,
    },
    /// [`Sysno::Yield`]
    Yield,
    /// [`Sysno::PeriodicWait`]
    PeriodicWait,
    /// [`Sysno::IpcSend`]
    IpcSend {
        to: EnvId,
        value: u64,
        src_va: VirtAddr,
        size: usize,
        perm: Protection,
        timeout_ms: u64,
    },
    /// [`Sysno::IpcRecv`]; zero timeout waits forever
    IpcRecv {
        dst_va: VirtAddr,
        max_size: usize,
        timeout_ms: u64,
    },
    /// [`Sysno::GetTime`]
    GetTime,
    /// [`Sysno::ThreadCreate`]
    ThreadCreate { entry: VirtAddr, arg: u64 },
    /// [`Sysno::ThreadExit`]
    ThreadExit,
    /// [`Sysno::ThreadCancel`]
    ThreadCancel { thread: ThreadId },
    /// [`Sysno::GetThreadId`]
    GetThreadId,
    /// [`Sysno::ThreadJoin`]
    ThreadJoin { thread: ThreadId },
    /// [`Sysno::MutexCreate`]
    MutexCreate,
    /// [`Sysno::MutexDestroy`]
    MutexDestroy { mutex: MutexId },
    /// [`Sysno::MutexBlock`]
    MutexBlock { mutex: MutexId },
    /// [`Sysno::MutexUnlock`]
    MutexUnlock { mutex: MutexId },
    /// [`Sysno::Sleep`]
    Sleep { ms: u64 },
}

impl Syscall {
    /// Decode raw registers
    pub fn decode(num: u64, args: SyscallArgs) -> ExecResult<Self> {
        let sysno = Sysno::from_num(num).ok_or(ExecError::InvalidArgument)?;
        let env = || EnvId::from_raw(args.arg1 as i32);
        let thread = || ThreadId::from_raw(args.arg1 as i64);
        let mutex = || MutexId::from_raw(args.arg1 as i32);

        Ok(match sysno {
            Sysno::GetEnvId => Syscall::GetEnvId,
            Sysno::EnvDestroy => Syscall::EnvDestroy { env: env() },
            Sysno::Exofork => Syscall::Exofork,
            Sysno::EnvSetStatus => Syscall::EnvSetStatus {
                env: env(),
                status: EnvStatus::from_u64(args.arg2).ok_or(ExecError::InvalidArgument)?,
            },
            Sysno::SetExceedDeadlineUpcall => Syscall::SetDeadlineUpcall {
                env: env(),
                entry: (args.arg2 != 0).then(|| VirtAddr::new(args.arg2)),
            },
            Sysno::ChangeClass => Syscall::ChangeClass {
                env: env(),
                class: EnvClass::from_u64(args.arg2).ok_or(ExecError::InvalidArgument)?,
                params: RealTimeParams::new(args.arg3, args.arg4, args.arg5),
            },
            Sysno::Yield => Syscall::Yield,
            Sysno::PeriodicWait => Syscall::PeriodicWait,
            Sysno::IpcSend => Syscall::IpcSend {
                to: env(),
                value: args.arg2,
                src_va: VirtAddr::new(args.arg3),
                size: args.arg4 as usize,
                perm: u32::try_from(args.arg5)
                    .ok()
                    .and_then(Protection::from_bits)
                    .ok_or(ExecError::InvalidArgument)?,
                timeout_ms: args.arg6,
            },
            Sysno::IpcRecv => Syscall::IpcRecv {
                dst_va: VirtAddr::new(args.arg1),
                max_size: args.arg2 as usize,
                timeout_ms: args.arg3,
            },
            Sysno::GetTime => Syscall::GetTime,
            Sysno::ThreadCreate => Syscall::ThreadCreate {
                entry: VirtAddr::new(args.arg1),
                arg: args.arg2,
            },
            Sysno::ThreadExit => Syscall::ThreadExit,
            Sysno::ThreadCancel => Syscall::ThreadCancel { thread: thread() },
            Sysno::GetThreadId => Syscall::GetThreadId,
            Sysno::ThreadJoin => Syscall::ThreadJoin { thread: thread() },
            Sysno::MutexCreate => Syscall::MutexCreate,
            Sysno::MutexDestroy => Syscall::MutexDestroy { mutex: mutex() },
            Sysno::MutexBlock => Syscall::MutexBlock { mutex: mutex() },
            Sysno::MutexUnlock => Syscall::MutexUnlock { mutex: mutex() },
            Sysno::Sleep => Syscall::Sleep { ms: args.arg1 },
        })
    }
}

/// What happens to the caller once the operation is done
enum Flow {
    /// Result for `rax`
    Return(i64),
    /// `rax` already written by the operation
    Done,
    /// Caller gives up the CPU but stays runnable
    Yield,
    /// Caller blocked; its waker writes `rax`
    Block,
}

impl<A: AddressSpaceService, C: Clock> Kernel<A, C> {
    /// Handle a syscall trap from the current thread
    pub fn syscall(&mut self, num: u64, args: SyscallArgs) -> Dispatch {
        let Some(caller) = self.cpu.current_thread else {
            log::warn!("syscall {} with no current thread", num);
            return self.run_next();
        };

        let flow = match Syscall::decode(num, args) {
            Ok(call) => {
                log::trace!("{}: {:?}", caller, call);
                self.dispatch(call)
            }
            Err(err) => {
                log::debug!("{}: bad syscall {}: {}", caller, num, err);
                Flow::Return(err.errno())
            }
        };

        match flow {
            Flow::Return(value) => {
                if let Some(thread) = self.threads.get_mut(caller) {
                    thread.frame.set_return(value);
                }
                self.resume_caller(caller)
            }
            Flow::Done => self.resume_caller(caller),
            Flow::Yield => self.reschedule(SwitchReason::Yield),
            Flow::Block => self.reschedule(SwitchReason::Blocked),
        }
    }

    /// Resume the caller if it can still run, else reschedule
    fn resume_caller(&mut self, caller: ThreadId) -> Dispatch {
        let Some(thread) = self.threads.get(caller) else {
            return self.reschedule(SwitchReason::Exit);
        };
        let env_runnable = self
            .envs
            .get(caller.env())
            .map_or(false, |e| e.status.is_runnable());
        if thread.status.is_runnable() && env_runnable && self.cpu.current_thread == Some(caller) {
            self.run_thread(caller)
        } else {
            self.reschedule(SwitchReason::Blocked)
        }
    }

    fn dispatch(&mut self, call: Syscall) -> Flow {
        let result: ExecResult<i64> = match call {
            Syscall::GetEnvId => self
                .cpu
                .current_env
                .map(|e| i64::from(e.as_raw()))
                .ok_or(ExecError::BadEnv),
            Syscall::EnvDestroy { env } => self
                .env_for_caller(env)
                .and_then(|id| self.destroy_env(id))
                .map(|()| 0),
            Syscall::Exofork => self.exofork().map(|id| i64::from(id.as_raw())),
            Syscall::EnvSetStatus { env, status } => self
                .env_for_caller(env)
                .and_then(|id| self.set_env_status(id, status))
                .map(|()| 0),
            Syscall::SetDeadlineUpcall { env, entry } => self
                .env_for_caller(env)
                .and_then(|id| self.set_deadline_upcall(id, entry))
                .map(|()| 0),
            Syscall::ChangeClass { env, class, params } => self
                .env_for_caller(env)
                .and_then(|id| self.change_class(id, class, params))
                .map(|()| 0),
            Syscall::Yield => return Flow::Yield,
            Syscall::PeriodicWait => match self.periodic_wait() {
                Ok(()) => return Flow::Yield,
                Err(err) => Err(err),
            },
            Syscall::IpcSend {
                to,
                value,
                src_va,
                size,
                perm,
                timeout_ms,
            } => match self.prepare_send(to, value, src_va, size, perm, timeout_ms) {
                Ok(()) => return self.send_now(),
                Err(err) => Err(err),
            },
            Syscall::IpcRecv {
                dst_va,
                max_size,
                timeout_ms,
            } => match self.prepare_recv(dst_va, max_size, timeout_ms) {
                Ok(()) => return Flow::Block,
                Err(err) => Err(err),
            },
            Syscall::GetTime => Ok(self.clock.now() as i64),
            Syscall::ThreadCreate { entry, arg } => self
                .create_thread(EnvId::SELF, entry, arg)
                .map(ThreadId::as_raw),
            Syscall::ThreadExit => self.destroy_thread(ThreadId::SELF).map(|()| 0),
            Syscall::ThreadCancel { thread } => self.cancel_thread(thread).map(|()| 0),
            Syscall::GetThreadId => self
                .cpu
                .current_thread
                .map(ThreadId::as_raw)
                .ok_or(ExecError::BadThr),
            Syscall::ThreadJoin { thread } => match self.join(thread) {
                Ok(()) => return Flow::Block,
                Err(err) => Err(err),
            },
            Syscall::MutexCreate => self
                .env_id_or_self(EnvId::SELF)
                .and_then(|env| self.create_mutex(env))
                .map(|m| i64::from(m.as_raw())),
            Syscall::MutexDestroy { mutex } => self.destroy_mutex(mutex).map(|()| 0),
            Syscall::MutexBlock { mutex } => match self.block_on_mutex(mutex) {
                Ok(true) => Ok(0),
                Ok(false) => return Flow::Block,
                Err(err) => Err(err),
            },
            Syscall::MutexUnlock { mutex } => self.unlock_mutex(mutex).map(|()| 0),
            Syscall::Sleep { ms } => match self.sleep(ms) {
                Ok(()) => return Flow::Block,
                Err(err) => Err(err),
            },
        };
        Flow::Return(to_syscall_return(result))
    }

    /// Try a freshly prepared send right away
    fn send_now(&mut self) -> Flow {
        let Some(me) = self.cpu.current_env else {
            return Flow::Block;
        };
        match self.poll_timed(me) {
            IpcPoll::Pending => Flow::Block,
            _ => Flow::Done,
        }
    }

    /// Destroy a thread of the caller or of one of its children
    pub fn cancel_thread(&mut self, thread: ThreadId) -> ExecResult<()> {
        let caller = self.cpu.current_env.ok_or(ExecError::BadEnv)?;
        let target = self.thread(thread)?.id;
        self.check_perm(caller, target.env())?;
        log::debug!("{} cancels {}", caller, target);
        self.destroy_thread(target)
    }
}

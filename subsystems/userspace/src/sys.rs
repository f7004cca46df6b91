//! # Syscall Wrappers
//!
//! [`SyscallPort`] is the single trap primitive; everything else here is a
//! provided method that packs arguments in register order and decodes the
//! signed result.

use lumen_execution::{
    EnvClass, EnvId, EnvStatus, MutexId, RealTimeParams, Sysno, SyscallArgs, ThreadId,
};
use lumen_hal::{Protection, VirtAddr};

use crate::{check, UserResult, STATS};

/// The syscall surface as seen from user space
pub trait SyscallPort {
    /// Trap into the kernel and return the raw `rax`
    fn raw_syscall(&self, sysno: Sysno, args: SyscallArgs) -> i64;

    /// Trap with up to six arguments, decoding errors
    fn call(&self, sysno: Sysno, args: &[u64]) -> UserResult<i64> {
        let mut raw = [0u64; 6];
        for (slot, arg) in raw.iter_mut().zip(args) {
            *slot = *arg;
        }
        STATS.syscall_made();
        check(self.raw_syscall(sysno, SyscallArgs::from_array(raw)))
    }

    /// Id of the calling environment
    fn getenvid(&self) -> UserResult<EnvId> {
        self.call(Sysno::GetEnvId, &[])
            .map(|raw| EnvId::from_raw(raw as i32))
    }

    /// Id of the calling thread
    fn getthrid(&self) -> UserResult<ThreadId> {
        self.call(Sysno::GetThreadId, &[]).map(ThreadId::from_raw)
    }

    /// Monotonic time in ticks
    fn gettime(&self) -> UserResult<u64> {
        self.call(Sysno::GetTime, &[]).map(|t| t as u64)
    }

    /// Give up the CPU
    fn yield_now(&self) -> UserResult<()> {
        self.call(Sysno::Yield, &[]).map(drop)
    }

    /// Sleep for `ms` milliseconds
    fn sleep(&self, ms: u64) -> UserResult<()> {
        self.call(Sysno::Sleep, &[ms]).map(drop)
    }

    /// Finish the current real-time job
    fn periodic_wait(&self) -> UserResult<()> {
        self.call(Sysno::PeriodicWait, &[]).map(drop)
    }

    /// Switch `env` between the usual and real-time classes
    fn change_class(&self, env: EnvId, class: EnvClass, params: RealTimeParams) -> UserResult<()> {
        self.call(
            Sysno::ChangeClass,
            &[
                env.as_raw() as u64,
                class as u64,
                params.period,
                params.deadline,
                params.max_job_time,
            ],
        )
        .map(drop)
    }

    /// Install or clear the deadline-exceeded upcall of `env`
    fn set_deadline_upcall(&self, env: EnvId, entry: Option<VirtAddr>) -> UserResult<()> {
        let entry = entry.map_or(0, VirtAddr::as_u64);
        self.call(Sysno::SetExceedDeadlineUpcall, &[env.as_raw() as u64, entry])
            .map(drop)
    }

    /// Create a child environment running a copy of the calling thread
    fn exofork(&self) -> UserResult<EnvId> {
        self.call(Sysno::Exofork, &[])
            .map(|raw| EnvId::from_raw(raw as i32))
    }

    /// Mark `env` runnable or not runnable
    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> UserResult<()> {
        self.call(Sysno::EnvSetStatus, &[env.as_raw() as u64, status.as_u64()])
            .map(drop)
    }

    /// Destroy `env`
    fn env_destroy(&self, env: EnvId) -> UserResult<()> {
        self.call(Sysno::EnvDestroy, &[env.as_raw() as u64]).map(drop)
    }

    /// Send `value`, and optionally the region at `src_va`, to `to`
    fn ipc_send(
        &self,
        to: EnvId,
        value: u64,
        region: Option<(VirtAddr, usize, Protection)>,
        timeout_ms: u64,
    ) -> UserResult<()> {
        let (va, size, perm) = region.unwrap_or((VirtAddr::new(u64::MAX), 0, Protection::empty()));
        self.call(
            Sysno::IpcSend,
            &[
                to.as_raw() as u64,
                value,
                va.as_u64(),
                size as u64,
                u64::from(perm.bits()),
                timeout_ms,
            ],
        )
        .map(drop)
    }

    /// Receive a value, accepting up to `max_size` bytes at `dst_va`.
    ///
    /// A zero timeout waits forever.
    fn ipc_recv(&self, dst: Option<(VirtAddr, usize)>, timeout_ms: u64) -> UserResult<u64> {
        let (va, size) = dst.unwrap_or((VirtAddr::new(u64::MAX), 0));
        self.call(Sysno::IpcRecv, &[va.as_u64(), size as u64, timeout_ms])
            .map(|v| v as u64)
    }

    /// Create a kernel mutex
    fn mutex_create(&self) -> UserResult<MutexId> {
        self.call(Sysno::MutexCreate, &[])
            .map(|raw| MutexId::from_raw(raw as i32))
    }

    /// Destroy a kernel mutex
    fn mutex_destroy(&self, mutex: MutexId) -> UserResult<()> {
        self.call(Sysno::MutexDestroy, &[mutex.as_raw() as u64])
            .map(drop)
    }

    /// Lock a kernel mutex; the raw result tells acquired (0) from retry
    fn mutex_block(&self, mutex: MutexId) -> UserResult<i64> {
        self.call(Sysno::MutexBlock, &[mutex.as_raw() as u64])
    }

    /// Unlock a kernel mutex
    fn mutex_unlock(&self, mutex: MutexId) -> UserResult<()> {
        self.call(Sysno::MutexUnlock, &[mutex.as_raw() as u64])
            .map(drop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use crate::UserError;
    use lumen_execution::ExecError;

    #[test]
    fn test_identity() {
        let port = KernelPort::new();
        let (env, thread) = port.with(|k| (k.current_env().unwrap(), k.current_thread().unwrap()));
        assert_eq!(port.getenvid(), Ok(env));
        assert_eq!(port.getthrid(), Ok(thread));
        port.with(|k| k.clock().set(77));
        assert_eq!(port.gettime(), Ok(77));
    }

    #[test]
    fn test_errors_decode() {
        let port = KernelPort::new();
        assert_eq!(
            port.mutex_unlock(MutexId::from_raw(12)),
            Err(UserError::Kernel(ExecError::BadMutex))
        );
        assert_eq!(
            port.env_set_status(EnvId::SELF, EnvStatus::Running),
            Err(UserError::Kernel(ExecError::InvalidArgument))
        );
    }

    #[test]
    fn test_sleep_returns_after_wakeup() {
        let port = KernelPort::new();
        port.sleep(5).unwrap();
        assert!(port.gettime().unwrap() >= 5_000);
    }

    #[test]
    fn test_change_class_and_upcall() {
        let port = KernelPort::new();
        let params = RealTimeParams::new(10_000, 5_000, 1_000);
        port.change_class(EnvId::SELF, EnvClass::RealTime, params).unwrap();
        port.set_deadline_upcall(EnvId::SELF, Some(VirtAddr::new(0x90_0000)))
            .unwrap();
        port.with(|k| {
            let env = k.env(EnvId::SELF).unwrap();
            assert_eq!(env.class(), EnvClass::RealTime);
            assert_eq!(env.realtime().params, params);
            assert_eq!(env.deadline_upcall(), Some(VirtAddr::new(0x90_0000)));
        });
        port.set_deadline_upcall(EnvId::SELF, None).unwrap();
        port.with(|k| assert_eq!(k.env(EnvId::SELF).unwrap().deadline_upcall(), None));
    }

    #[test]
    fn test_ipc_recv_times_out() {
        let port = KernelPort::new();
        assert_eq!(
            port.ipc_recv(None, 3),
            Err(UserError::Kernel(ExecError::Timeout))
        );
    }

    #[test]
    fn test_argument_packing() {
        let port = ScriptedPort::new(ThreadId::from_raw(1));
        port.ipc_send(EnvId::from_raw(5), 9, None, 10).unwrap();
        let (sysno, args) = port.calls.lock()[0];
        assert_eq!(sysno, Sysno::IpcSend);
        assert_eq!(args.to_array(), [5, 9, u64::MAX, 0, 0, 10]);
    }
}

//! # Timed IPC
//!
//! Each environment has one mailbox holding at most one outstanding send
//! and one outstanding receive. Both are polled by the scheduler: a send
//! completes when its destination is found receiving, and either side
//! completes with [`ExecError::Timeout`] once its deadline passes. A
//! receive never completes by polling; the sender's delivery finishes it.
//!
//! A message carries a value and, when both sides name an address below
//! the user ceiling, a region of the sender's address space shared into
//! the receiver's.

use lumen_hal::{AddressSpaceService, Clock, Protection, VirtAddr};

use crate::{
    environment::EnvStatus, kernel::Kernel, thread::WaitReason, EnvId, ExecError, ExecResult,
    ThreadId,
};

/// Address meaning "no region" (anything at or above the user ceiling)
pub const NO_REGION: VirtAddr = VirtAddr::new(u64::MAX);

/// Per-environment IPC state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mailbox {
    pub(crate) sending: bool,
    pub(crate) receiving: bool,
    /// Absolute deadline; `None` waits forever
    pub(crate) deadline: Option<u64>,
    pub(crate) to: EnvId,
    pub(crate) from: EnvId,
    pub(crate) value: u64,
    pub(crate) src_va: VirtAddr,
    pub(crate) dst_va: VirtAddr,
    /// Requested size while sending, accepted size while receiving,
    /// transferred size after delivery
    pub(crate) size: usize,
    pub(crate) perm: Protection,
    /// Thread that issued the pending operation
    pub(crate) thread: Option<ThreadId>,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self {
            sending: false,
            receiving: false,
            deadline: None,
            to: EnvId::SELF,
            from: EnvId::SELF,
            value: 0,
            src_va: NO_REGION,
            dst_va: NO_REGION,
            size: 0,
            perm: Protection::empty(),
            thread: None,
        }
    }
}

impl Mailbox {
    /// Whether a send or receive is outstanding
    pub fn is_active(&self) -> bool {
        self.sending || self.receiving
    }

    /// Whether a send is outstanding
    pub fn is_sending(&self) -> bool {
        self.sending
    }

    /// Whether a receive is outstanding
    pub fn is_receiving(&self) -> bool {
        self.receiving
    }

    /// Deadline of the outstanding operation
    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    /// Sender of the last delivered message
    pub fn from(&self) -> EnvId {
        self.from
    }

    /// Value of the last delivered message
    pub fn value(&self) -> u64 {
        self.value
    }

    /// Protection of the last received region (empty if none)
    pub fn perm(&self) -> Protection {
        self.perm
    }

    /// Bytes of the last received region
    pub fn size(&self) -> usize {
        self.size
    }

    /// Forget the outstanding operation
    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Outcome of polling a mailbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcPoll {
    /// No timed operation outstanding
    NotApplicable,
    /// Still waiting (receive, or destination not receiving yet)
    Pending,
    /// The deadline passed; the issuer got [`ExecError::Timeout`]
    TimedOut,
    /// The message was delivered
    Delivered,
    /// The send completed with an error
    Failed(ExecError),
}

impl<A: AddressSpaceService, C: Clock> Kernel<A, C> {
    /// Park the current environment on a send to `dst`
    #[allow(clippy::too_many_arguments)]
    pub fn prepare_send(
        &mut self,
        dst: EnvId,
        value: u64,
        src_va: VirtAddr,
        size: usize,
        perm: Protection,
        timeout_ms: u64,
    ) -> ExecResult<()> {
        let dst = self.env_id_or_self(dst)?;
        let deadline = self.clock.deadline_after_ms(timeout_ms);
        let thread = self.block_current(WaitReason::Ipc)?;
        let env = self.env_mut(EnvId::SELF)?;
        env.status = EnvStatus::NotRunnable;
        let mb = &mut env.mailbox;
        mb.sending = true;
        mb.deadline = Some(deadline);
        mb.to = dst;
        mb.value = value;
        mb.src_va = src_va;
        mb.size = size;
        mb.perm = perm;
        mb.thread = Some(thread);
        log::trace!("{} sends to {} until {}", env.id, dst, deadline);
        Ok(())
    }

    /// Park the current environment on a receive.
    ///
    /// A zero timeout waits forever.
    pub fn prepare_recv(&mut self, dst_va: VirtAddr, max_size: usize, timeout_ms: u64) -> ExecResult<()> {
        if dst_va < self.spaces.max_user_address() && !dst_va.is_page_aligned() {
            return Err(ExecError::InvalidArgument);
        }
        let deadline = (timeout_ms != 0).then(|| self.clock.deadline_after_ms(timeout_ms));
        let thread = self.block_current(WaitReason::Ipc)?;
        let env = self.env_mut(EnvId::SELF)?;
        env.status = EnvStatus::NotRunnable;
        let mb = &mut env.mailbox;
        mb.receiving = true;
        mb.deadline = deadline;
        mb.dst_va = dst_va;
        mb.size = max_size;
        mb.perm = Protection::empty();
        mb.thread = Some(thread);
        log::trace!("{} receives at {} (max {} bytes)", env.id, dst_va, max_size);
        Ok(())
    }

    /// Drive an environment's outstanding timed operation
    pub fn poll_timed(&mut self, id: EnvId) -> IpcPoll {
        let now = self.clock.now();
        let Some(env) = self.envs.get(id) else {
            return IpcPoll::NotApplicable;
        };
        if env.status != EnvStatus::NotRunnable || !env.mailbox.is_active() {
            return IpcPoll::NotApplicable;
        }
        let mb = env.mailbox;
        let Some(deadline) = mb.deadline else {
            return IpcPoll::NotApplicable;
        };

        let issuer = match mb.thread.filter(|&t| self.threads.contains(t)) {
            Some(t) => t,
            None => {
                log::debug!("{}: ipc issuer vanished", id);
                self.finish_ipc(id, None, Err(ExecError::BadThr));
                return IpcPoll::Failed(ExecError::BadThr);
            }
        };

        if now >= deadline {
            log::debug!("{}: ipc timed out", id);
            self.metrics.record_ipc_timeout();
            self.finish_ipc(id, Some(issuer), Err(ExecError::Timeout));
            return IpcPoll::TimedOut;
        }

        if mb.receiving {
            return IpcPoll::Pending;
        }

        let receiving = match self.envs.get(mb.to).map(|d| (d.status, d.mailbox.receiving)) {
            Some((status, receiving)) if status != EnvStatus::Dying => receiving,
            _ => {
                log::debug!("{}: ipc destination {} is gone", id, mb.to);
                self.finish_ipc(id, Some(issuer), Err(ExecError::BadEnv));
                return IpcPoll::Failed(ExecError::BadEnv);
            }
        };
        if !receiving {
            return IpcPoll::Pending;
        }

        let result = self.deliver(mb.to, id);
        self.finish_ipc(id, Some(issuer), result);
        match result {
            Ok(()) => IpcPoll::Delivered,
            Err(err) => IpcPoll::Failed(err),
        }
    }

    /// Complete a send/receive pair.
    ///
    /// Both sides become runnable before any region work, so a failed
    /// mapping leaves the receiver with the value and no region.
    pub fn deliver(&mut self, receiver: EnvId, sender: EnvId) -> ExecResult<()> {
        let recv = self.envs.get(receiver).ok_or(ExecError::BadEnv)?;
        let send = self.envs.get(sender).ok_or(ExecError::BadEnv)?;
        let recv_thread = recv
            .mailbox
            .thread
            .filter(|&t| self.threads.contains(t))
            .ok_or(ExecError::IpcBadReceiver)?;
        let send_thread = send
            .mailbox
            .thread
            .filter(|&t| self.threads.contains(t))
            .ok_or(ExecError::IpcBadSender)?;

        let msg = send.mailbox;
        let (dst_va, max_size) = (recv.mailbox.dst_va, recv.mailbox.size);
        let (recv_space, send_space) = (recv.space, send.space);

        for (env, thread) in [(receiver, recv_thread), (sender, send_thread)] {
            if let Some(e) = self.envs.get_mut(env) {
                e.status = EnvStatus::Runnable;
                e.mailbox.clear();
            }
            self.wake_thread(thread, 0);
        }

        let ceiling = self.spaces.max_user_address();
        let mut region = (Protection::empty(), 0usize);
        let mut result = Ok(());
        if msg.src_va < ceiling && dst_va < ceiling {
            let size = msg.size.min(max_size);
            result = self.share_region(send_space, msg.src_va, recv_space, dst_va, size, msg.perm);
            if result.is_ok() {
                region = (msg.perm, size);
            }
        }

        if let Some(e) = self.envs.get_mut(receiver) {
            e.mailbox.from = sender;
            e.mailbox.value = msg.value;
            e.mailbox.perm = region.0;
            e.mailbox.size = region.1;
        }
        if let Some(t) = self.threads.get_mut(recv_thread) {
            t.frame.set_return(msg.value as i64);
        }
        self.metrics.record_ipc_delivery();
        log::debug!(
            "ipc {} -> {}: value {:#x}, {} bytes {:?}",
            sender,
            receiver,
            msg.value,
            region.1,
            result
        );
        result
    }

    fn share_region(
        &mut self,
        src_space: lumen_hal::SpaceId,
        src_va: VirtAddr,
        dst_space: lumen_hal::SpaceId,
        dst_va: VirtAddr,
        size: usize,
        perm: Protection,
    ) -> ExecResult<()> {
        if !src_va.is_page_aligned() || !dst_va.is_page_aligned() {
            return Err(ExecError::InvalidArgument);
        }
        if !perm.contains(Protection::READ) || !(Protection::RWX | Protection::USER).contains(perm) {
            return Err(ExecError::InvalidArgument);
        }
        self.spaces
            .check_access(src_space, src_va, size, perm.access())
            .map_err(|_| ExecError::InvalidArgument)?;
        self.spaces
            .map_region(dst_space, dst_va, Some((src_space, src_va)), size, perm | Protection::USER)
            .map_err(|_| ExecError::NoMemory)
    }

    /// Wake an environment whose operation ended without a delivery
    fn finish_ipc(&mut self, id: EnvId, issuer: Option<ThreadId>, result: ExecResult<()>) {
        if let Some(env) = self.envs.get_mut(id) {
            env.status = EnvStatus::Runnable;
            env.mailbox.clear();
        }
        if let Some(thread) = issuer {
            self.wake_thread(thread, result.map_or_else(ExecError::errno, |()| 0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::tests::*;
    use crate::thread::ThreadStatus;
    use lumen_hal::PAGE_SIZE;

    const SRC: VirtAddr = VirtAddr::new(0x10_0000);
    const DST: VirtAddr = VirtAddr::new(0x40_0000);

    #[test]
    fn test_timeout_is_idempotent() {
        let mut k = kernel();
        let (a, ta) = spawn_running(&mut k);
        let b = spawn(&mut k);
        k.prepare_send(b, 7, NO_REGION, 0, Protection::empty(), 10).unwrap();
        assert_eq!(k.env(a).unwrap().status(), EnvStatus::NotRunnable);
        assert_eq!(k.poll_timed(a), IpcPoll::Pending);

        k.clock().advance_ms(10);
        assert_eq!(k.poll_timed(a), IpcPoll::TimedOut);
        let env = k.env(a).unwrap();
        assert_eq!(env.status(), EnvStatus::Runnable);
        assert!(!env.mailbox().is_active());
        let t = k.thread(ta).unwrap();
        assert_eq!(t.status(), ThreadStatus::Runnable);
        assert_eq!(t.frame().return_value(), ExecError::Timeout.errno());

        assert_eq!(k.poll_timed(a), IpcPoll::NotApplicable);
        assert_eq!(k.metrics().ipc_timeouts(), 1);
    }

    #[test]
    fn test_receive_without_timeout_waits() {
        let mut k = kernel();
        let (b, _) = spawn_running(&mut k);
        k.prepare_recv(NO_REGION, 0, 0).unwrap();
        k.clock().advance_ms(1_000_000);
        assert_eq!(k.poll_timed(b), IpcPoll::NotApplicable);
        assert!(k.env(b).unwrap().mailbox().is_receiving());
    }

    #[test]
    fn test_send_to_vanished_destination() {
        let mut k = kernel();
        let b = spawn(&mut k);
        let (a, ta) = spawn_running(&mut k);
        k.prepare_send(b, 1, NO_REGION, 0, Protection::empty(), 100).unwrap();
        k.destroy_env(b).unwrap();
        assert_eq!(k.poll_timed(a), IpcPoll::Failed(ExecError::BadEnv));
        assert_eq!(k.thread(ta).unwrap().frame().return_value(), ExecError::BadEnv.errno());
        assert_eq!(k.poll_timed(a), IpcPoll::NotApplicable);
    }

    #[test]
    fn test_value_only_delivery() {
        let mut k = kernel();
        let (b, tb) = spawn_running(&mut k);
        k.prepare_recv(DST, PAGE_SIZE, 0).unwrap();
        let (a, ta) = spawn_running(&mut k);
        k.prepare_send(b, 0xbeef, NO_REGION, 0, Protection::RW, 50).unwrap();

        assert_eq!(k.poll_timed(a), IpcPoll::Delivered);
        let mb = *k.env(b).unwrap().mailbox();
        assert_eq!(mb.from(), a);
        assert_eq!(mb.value(), 0xbeef);
        assert_eq!(mb.perm(), Protection::empty());
        assert_eq!(k.thread(tb).unwrap().frame().return_value(), 0xbeef);
        assert_eq!(k.thread(ta).unwrap().frame().return_value(), 0);
        assert_eq!(k.env(a).unwrap().status(), EnvStatus::Runnable);
        assert_eq!(k.env(b).unwrap().status(), EnvStatus::Runnable);
        assert!(!k.spaces().is_mapped(k.env(b).unwrap().space(), DST));
    }

    fn region_round_trip(sent: usize, max: usize) {
        let mut k = kernel();
        let (b, _) = spawn_running(&mut k);
        k.prepare_recv(DST, max, 0).unwrap();
        let (a, _) = spawn_running(&mut k);
        let a_space = k.env(a).unwrap().space();
        let b_space = k.env(b).unwrap().space();

        let payload: Vec<u8> = (0..sent).map(|i| (i * 7 + 3) as u8).collect();
        k.spaces_mut()
            .map_region(a_space, SRC, None, PAGE_SIZE, Protection::RW | Protection::USER)
            .unwrap();
        k.spaces_mut().write_bytes(a_space, SRC, &payload).unwrap();

        k.prepare_send(b, 1, SRC, sent, Protection::RW, 50).unwrap();
        assert_eq!(k.poll_timed(a), IpcPoll::Delivered);

        let expect = sent.min(max);
        let mb = *k.env(b).unwrap().mailbox();
        assert_eq!(mb.size(), expect);
        assert_eq!(mb.perm(), Protection::RW);
        assert_eq!(k.spaces().protection(b_space, DST), Some(Protection::RW | Protection::USER));

        let mut got = vec![0u8; expect];
        k.spaces().read_bytes(b_space, DST, &mut got).unwrap();
        assert_eq!(&got[..], &payload[..expect]);
    }

    #[test]
    fn test_region_transfer() {
        for sent in [1, 17, 512, 4095, 4096] {
            region_round_trip(sent, PAGE_SIZE);
        }
        // Clipped by what the receiver accepts
        region_round_trip(4096, 100);
    }

    #[test]
    fn test_region_rejects_bad_perm_and_alignment() {
        let mut k = kernel();
        let (b, tb) = spawn_running(&mut k);
        k.prepare_recv(DST, PAGE_SIZE, 0).unwrap();
        let (a, ta) = spawn_running(&mut k);
        let a_space = k.env(a).unwrap().space();
        k.spaces_mut()
            .map_region(a_space, SRC, None, PAGE_SIZE, Protection::READ | Protection::USER)
            .unwrap();

        // The sender cannot grant write access it does not have
        k.prepare_send(b, 5, SRC, 64, Protection::RW, 50).unwrap();
        assert_eq!(k.poll_timed(a), IpcPoll::Failed(ExecError::InvalidArgument));
        assert_eq!(
            k.thread(ta).unwrap().frame().return_value(),
            ExecError::InvalidArgument.errno()
        );
        // The receiver still gets the value, without a region
        let mb = *k.env(b).unwrap().mailbox();
        assert_eq!(mb.value(), 5);
        assert_eq!(mb.perm(), Protection::empty());
        assert_eq!(k.thread(tb).unwrap().status(), ThreadStatus::Runnable);

        assert_eq!(
            k.prepare_recv(VirtAddr::new(0x40_0010), PAGE_SIZE, 0),
            Err(ExecError::InvalidArgument)
        );
    }

    #[test]
    fn test_mapping_failure_reports_no_memory() {
        let mut k = kernel();
        let (b, _) = spawn_running(&mut k);
        k.prepare_recv(DST, PAGE_SIZE, 0).unwrap();
        let (a, _) = spawn_running(&mut k);
        let a_space = k.env(a).unwrap().space();
        k.spaces_mut()
            .map_region(a_space, SRC, None, PAGE_SIZE, Protection::RW | Protection::USER)
            .unwrap();
        k.prepare_send(b, 9, SRC, 64, Protection::READ, 50).unwrap();
        k.spaces_mut().fail_next_maps(1);

        assert_eq!(k.poll_timed(a), IpcPoll::Failed(ExecError::NoMemory));
        // No rollback: both sides are awake
        assert_eq!(k.env(b).unwrap().status(), EnvStatus::Runnable);
        assert_eq!(k.env(b).unwrap().mailbox().value(), 9);
        assert_eq!(k.env(b).unwrap().mailbox().perm(), Protection::empty());
    }

    #[test]
    fn test_destination_not_receiving_stays_pending() {
        let mut k = kernel();
        let b = spawn(&mut k);
        let (a, _) = spawn_running(&mut k);
        k.prepare_send(b, 1, NO_REGION, 0, Protection::empty(), 10).unwrap();
        assert_eq!(k.poll_timed(a), IpcPoll::Pending);
        assert!(k.env(a).unwrap().mailbox().is_sending());
    }
}

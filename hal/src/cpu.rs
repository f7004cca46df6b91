//! # Saved CPU State
//!
//! Register state saved on trap entry and restored when a thread resumes.
//! The register file follows the x86_64 push order of the trap entry stub.

use static_assertions::const_assert_eq;

/// Number of general purpose registers saved on trap entry
pub const GP_REGS: usize = 15;

/// Register indices within [`TrapFrame::regs`]
pub mod reg {
    /// r15
    pub const R15: usize = 0;
    /// r14
    pub const R14: usize = 1;
    /// r13
    pub const R13: usize = 2;
    /// r12
    pub const R12: usize = 3;
    /// r11
    pub const R11: usize = 4;
    /// r10
    pub const R10: usize = 5;
    /// r9
    pub const R9: usize = 6;
    /// r8
    pub const R8: usize = 7;
    /// rsi (second argument)
    pub const RSI: usize = 8;
    /// rdi (first argument)
    pub const RDI: usize = 9;
    /// rbp
    pub const RBP: usize = 10;
    /// rdx
    pub const RDX: usize = 11;
    /// rcx
    pub const RCX: usize = 12;
    /// rbx
    pub const RBX: usize = 13;
    /// rax (return value)
    pub const RAX: usize = 14;
}

/// Interrupt-enable bit of the flags register
pub const FLAGS_IF: u64 = 1 << 9;

/// Trap frame (saved registers of a user thread)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrapFrame {
    /// General purpose registers
    pub regs: [u64; GP_REGS],
    /// Instruction pointer
    pub ip: u64,
    /// Stack pointer
    pub sp: u64,
    /// Flags register
    pub flags: u64,
}

impl TrapFrame {
    /// Create a frame that starts executing `entry` on `stack`
    pub fn new(entry: u64, stack: u64) -> Self {
        Self {
            regs: [0; GP_REGS],
            ip: entry,
            sp: stack,
            flags: FLAGS_IF,
        }
    }

    /// Stage the value a syscall returns to this thread
    #[inline]
    pub fn set_return(&mut self, value: i64) {
        self.regs[reg::RAX] = value as u64;
    }

    /// The staged syscall return value
    #[inline]
    pub fn return_value(&self) -> i64 {
        self.regs[reg::RAX] as i64
    }

    /// Set the first argument register
    #[inline]
    pub fn set_arg0(&mut self, value: u64) {
        self.regs[reg::RDI] = value;
    }
}

/// Frame pushed on the user exception stack before entering an upcall
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpcallFrame {
    /// Registers at the time of the event
    pub regs: [u64; GP_REGS],
    /// Interrupted instruction pointer
    pub ip: u64,
    /// Interrupted flags
    pub flags: u64,
    /// Interrupted stack pointer
    pub sp: u64,
}

const_assert_eq!(UpcallFrame::SIZE, (GP_REGS + 3) * 8);

impl UpcallFrame {
    /// Serialized size in bytes
    pub const SIZE: usize = (GP_REGS + 3) * core::mem::size_of::<u64>();

    /// Capture the interrupted state of a trap frame
    pub fn capture(tf: &TrapFrame) -> Self {
        Self {
            regs: tf.regs,
            ip: tf.ip,
            flags: tf.flags,
            sp: tf.sp,
        }
    }

    /// Little-endian image as laid out on the user stack
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let words = self.regs.iter().copied().chain([self.ip, self.flags, self.sp]);
        for (chunk, word) in out.chunks_exact_mut(8).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    /// Decode a frame previously written by [`UpcallFrame::to_bytes`]
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let mut words = [0u64; GP_REGS + 3];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            *word = u64::from_le_bytes(raw);
        }
        let mut regs = [0u64; GP_REGS];
        regs.copy_from_slice(&words[..GP_REGS]);
        Self {
            regs,
            ip: words[GP_REGS],
            flags: words[GP_REGS + 1],
            sp: words[GP_REGS + 2],
        }
    }
}

use kidneyos_shared::mem::{USER_STACK_MAX, USER_STACK_SLACK};

/// Tunables for the VM subsystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmConfig {
    /// How far below the top of user memory the stack may grow, in bytes.
    pub max_stack_size: usize,
    /// How far below `esp` a fault still counts as stack growth. `PUSHA`
    /// touches 32 bytes below the stack pointer before moving it.
    pub stack_slack: usize,
    /// Whether read-only file pages with the same block id share a frame.
    pub share_read_only: bool,
}

impl VmConfig {
    pub const fn new() -> Self {
        Self {
            max_stack_size: USER_STACK_MAX,
            stack_slack: USER_STACK_SLACK,
            share_read_only: true,
        }
    }

    pub const fn with_max_stack_size(mut self, bytes: usize) -> Self {
        self.max_stack_size = bytes;
        self
    }

    pub const fn with_stack_slack(mut self, bytes: usize) -> Self {
        self.stack_slack = bytes;
        self
    }

    pub const fn with_share_read_only(mut self, share: bool) -> Self {
        self.share_read_only = share;
        self
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::new()
    }
}

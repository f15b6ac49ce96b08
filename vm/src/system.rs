use crate::mem::{AddressSpace, VirtualMemory};
use alloc::{boxed::Box, sync::Arc};
use kidneyos_shared::mem::VirtAddr;
use log::{error, info};
use once_cell::race::OnceBox;

static SYSTEM: OnceBox<VirtualMemory> = OnceBox::new();

/// Installs the kernel-wide virtual memory manager. Panics if called twice.
pub fn init_system(vm: VirtualMemory) {
    if SYSTEM.set(Box::new(vm)).is_err() {
        panic!("virtual memory already initialized");
    }
    info!("virtual memory initialized");
}

pub fn unwrap_system() -> &'static VirtualMemory {
    SYSTEM.get().expect("Virtual memory not initialized.")
}

/// The scheduler and process table, as far as page faults are concerned.
pub trait ProcessControl {
    fn current_address_space(&self) -> Arc<AddressSpace>;

    /// Kills the running process with exit `status`.
    fn terminate_current(&self, status: i32) -> !;
}

/// Entry point from the page fault interrupt for a fault at `addr` in user mode.
///
/// A fault the process caused terminates it with status -1. A fault the kernel
/// cannot recover from panics.
pub fn page_fault(ctl: &dyn ProcessControl, addr: VirtAddr, esp: VirtAddr) {
    page_fault_handler(unwrap_system(), ctl, addr, esp);
}

pub fn page_fault_handler(
    vm: &VirtualMemory,
    ctl: &dyn ProcessControl,
    addr: VirtAddr,
    esp: VirtAddr,
) {
    let space = ctl.current_address_space();
    match vm.handle_fault(&space, addr, esp) {
        Ok(()) => {}
        Err(err) if err.is_fatal() => {
            error!("unrecoverable page fault at {addr:?}: {err}");
            panic!("unrecoverable page fault: {err}");
        }
        Err(err) => {
            info!("{}: {err}, terminating", space.id());
            drop(space);
            ctl.terminate_current(-1);
        }
    }
}

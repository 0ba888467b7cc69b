//! Observer-registry contracts replacing the intrusive-list-of-nullable-
//! function-pointers plugin fan-out. Not wired into the migration engine's
//! hot path -- the plugin layer is an out-of-scope external collaborator,
//! and this module exists so the re-architected contract has a concrete
//! home, exercised by its own tests.

/// A single syscall argument, tagged by shape rather than passed through a
/// C-style variadic list.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    U64(u64),
    I64(i64),
    Bytes(Vec<u8>),
}

pub trait RaStartObserver: Send + Sync {
    fn on_ra_start(&self);
}

pub trait RaStopObserver: Send + Sync {
    fn on_ra_stop(&self);
}

pub trait RaIdleObserver: Send + Sync {
    fn on_ra_idle(&self);
}

pub trait ExecInstructionObserver: Send + Sync {
    fn on_exec_instruction(&self, pc: u64);
}

pub trait MemReadObserver: Send + Sync {
    fn on_read_memory(&self, addr: u64, len: usize);
}

pub trait MemWriteObserver: Send + Sync {
    fn on_write_memory(&self, addr: u64, len: usize);
}

pub trait BreakpointObserver: Send + Sync {
    fn on_breakpoint_hit(&self, addr: u64);
}

pub trait ExceptionObserver: Send + Sync {
    fn on_exception(&self, vector: u32);
}

pub trait SyscallObserver: Send + Sync {
    fn on_syscall(&self, nr: u64, args: &[Arg]);
}

pub trait InterruptObserver: Send + Sync {
    fn on_interrupt(&self, vector: u32);
}

pub trait PacketInObserver: Send + Sync {
    fn on_receiving_packet(&self, bytes: &[u8]);
}

pub trait PacketOutObserver: Send + Sync {
    fn on_sending_packet(&self, bytes: &[u8]);
}

pub trait VmShutdownObserver: Send + Sync {
    fn on_vm_shutdown(&self);
}

/// Fans events out to every registered handle, in registration order.
#[derive(Default)]
pub struct ObserverRegistry {
    syscall: Vec<Box<dyn SyscallObserver>>,
    vm_shutdown: Vec<Box<dyn VmShutdownObserver>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_syscall(&mut self, observer: Box<dyn SyscallObserver>) {
        self.syscall.push(observer);
    }

    pub fn register_vm_shutdown(&mut self, observer: Box<dyn VmShutdownObserver>) {
        self.vm_shutdown.push(observer);
    }

    pub fn notify_syscall(&self, nr: u64, args: &[Arg]) {
        for o in &self.syscall {
            o.on_syscall(nr, args);
        }
    }

    pub fn notify_vm_shutdown(&self) {
        for o in &self.vm_shutdown {
            o.on_vm_shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSyscallObserver(Arc<AtomicUsize>);
    impl SyscallObserver for CountingSyscallObserver {
        fn on_syscall(&self, _nr: u64, _args: &[Arg]) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn syscall_observers_fire_in_registration_order() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut registry = ObserverRegistry::new();
        registry.register_syscall(Box::new(CountingSyscallObserver(count.clone())));
        registry.register_syscall(Box::new(CountingSyscallObserver(count.clone())));

        registry.notify_syscall(60, &[Arg::I64(0)]);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::{Mutex, RwLock};
use crate::result::*;
use crate::emu::kern as emu_kern;
use crate::kern::svc::SvcId;

pub mod result;

pub const X_REGISTER_COUNT: usize = 32;
pub const V_REGISTER_COUNT: usize = 32;

pub const SP_REGISTER: usize = 31;
pub const AARCH32_SP_REGISTER: usize = 13;
pub const TLS_REGISTER: usize = 18;

/// The execution capability a kernel thread drives: a register file plus a way to run,
/// interrupt and stop guest code.
pub trait ExecutionContext: Send + Sync {
    fn get_x(&self, index: usize) -> u64;
    fn set_x(&self, index: usize, value: u64);

    fn get_v(&self, index: usize) -> u128;
    fn set_v(&self, index: usize, value: u128);

    fn get_tpidrro_el0(&self) -> u64;
    fn set_tpidrro_el0(&self, value: u64);

    fn is_aarch32(&self) -> bool;
    fn set_aarch32(&self, aarch32: bool);

    /// Runs guest code starting at `entry` until it returns or is stopped.
    /// `interrupt_handler` is invoked from the executing thread whenever a requested interrupt is observed.
    fn execute(&self, entry: u64, interrupt_handler: &dyn Fn()) -> Result<()>;

    fn request_interrupt(&self);
    fn stop_running(&self);
    fn is_running(&self) -> bool;
    fn dispose(&self);
}

pub type GuestFn = Arc<dyn Fn(&GuestContext) -> Result<()> + Send + Sync>;

/// Program table shared by every execution context of a process: guest code is registered per entry address.
pub struct Context {
    programs: RwLock<BTreeMap<u64, GuestFn>>
}

impl Context {
    pub fn new() -> Self {
        Self {
            programs: RwLock::new(BTreeMap::new())
        }
    }

    pub fn register_program<F: Fn(&GuestContext) -> Result<()> + Send + Sync + 'static>(&self, entry: u64, f: F) {
        self.programs.write().insert(entry, Arc::new(f));
    }

    pub fn find_program(&self, entry: u64) -> Option<GuestFn> {
        self.programs.read().get(&entry).cloned()
    }

    pub fn get_program_count(&self) -> usize {
        self.programs.read().len()
    }

    pub fn create_execution_context(self: &Arc<Self>, aarch32: bool) -> Arc<HostExecutionContext> {
        let ctx = HostExecutionContext::new(self.clone());
        ctx.set_aarch32(aarch32);
        Arc::new(ctx)
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

struct RegisterFile {
    x: [u64; X_REGISTER_COUNT],
    v: [u128; V_REGISTER_COUNT],
    tpidrro_el0: u64
}

impl RegisterFile {
    const fn new() -> Self {
        Self {
            x: [0; X_REGISTER_COUNT],
            v: [0; V_REGISTER_COUNT],
            tpidrro_el0: 0
        }
    }
}

pub struct HostExecutionContext {
    programs: Arc<Context>,
    registers: Mutex<RegisterFile>,
    aarch32: AtomicBool,
    running: AtomicBool,
    stop_requested: AtomicBool,
    interrupt_requested: AtomicBool,
    disposed: AtomicBool
}

impl HostExecutionContext {
    pub fn new(programs: Arc<Context>) -> Self {
        Self {
            programs,
            registers: Mutex::new(RegisterFile::new()),
            aarch32: AtomicBool::new(false),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            interrupt_requested: AtomicBool::new(false),
            disposed: AtomicBool::new(false)
        }
    }

    pub fn is_interrupt_pending(&self) -> bool {
        self.interrupt_requested.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}

impl ExecutionContext for HostExecutionContext {
    fn get_x(&self, index: usize) -> u64 {
        self.registers.lock().x[index]
    }

    fn set_x(&self, index: usize, value: u64) {
        self.registers.lock().x[index] = value;
    }

    fn get_v(&self, index: usize) -> u128 {
        self.registers.lock().v[index]
    }

    fn set_v(&self, index: usize, value: u128) {
        self.registers.lock().v[index] = value;
    }

    fn get_tpidrro_el0(&self) -> u64 {
        self.registers.lock().tpidrro_el0
    }

    fn set_tpidrro_el0(&self, value: u64) {
        self.registers.lock().tpidrro_el0 = value;
    }

    fn is_aarch32(&self) -> bool {
        self.aarch32.load(Ordering::SeqCst)
    }

    fn set_aarch32(&self, aarch32: bool) {
        self.aarch32.store(aarch32, Ordering::SeqCst);
    }

    fn execute(&self, entry: u64, interrupt_handler: &dyn Fn()) -> Result<()> {
        result_return_if!(self.is_disposed(), crate::result::ResultObjectDisposed);

        let program = match self.programs.find_program(entry) {
            Some(program) => program,
            None => return result::ResultInvalidEntry::make_err()
        };

        // Stopped before it ever ran (thread terminated before being scheduled)
        if self.stop_requested.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.running.store(true, Ordering::SeqCst);
        let guest_ctx = GuestContext {
            exec_ctx: self,
            interrupt_handler
        };
        let rc = program(&guest_ctx);
        self.running.store(false, Ordering::SeqCst);

        rc
    }

    fn request_interrupt(&self) {
        self.interrupt_requested.store(true, Ordering::SeqCst);
    }

    fn stop_running(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.stop_requested.load(Ordering::SeqCst)
    }

    fn dispose(&self) {
        self.stop_running();
        self.disposed.store(true, Ordering::SeqCst);
    }
}

/// View of a running execution context handed to guest programs.
pub struct GuestContext<'a> {
    exec_ctx: &'a HostExecutionContext,
    interrupt_handler: &'a dyn Fn()
}

impl<'a> GuestContext<'a> {
    pub fn get_x(&self, index: usize) -> u64 {
        self.exec_ctx.get_x(index)
    }

    pub fn set_x(&self, index: usize, value: u64) {
        self.exec_ctx.set_x(index, value)
    }

    #[inline]
    pub fn get_w(&self, index: usize) -> u32 {
        self.get_x(index) as u32
    }

    #[inline]
    pub fn set_w(&self, index: usize, value: u32) {
        self.set_x(index, value as u64)
    }

    pub fn get_v(&self, index: usize) -> u128 {
        self.exec_ctx.get_v(index)
    }

    pub fn set_v(&self, index: usize, value: u128) {
        self.exec_ctx.set_v(index, value)
    }

    pub fn get_tpidrro_el0(&self) -> u64 {
        self.exec_ctx.get_tpidrro_el0()
    }

    pub fn is_aarch32(&self) -> bool {
        self.exec_ctx.is_aarch32()
    }

    /// Preemption point: dispatches a pending interrupt to the kernel and reports whether execution may continue.
    pub fn poll(&self) -> bool {
        if self.exec_ctx.interrupt_requested.swap(false, Ordering::SeqCst) {
            (self.interrupt_handler)();
        }

        self.exec_ctx.is_running()
    }

    /// Issues a supervisor call with the arguments currently in the registers, then runs the post-syscall kernel hook.
    pub fn svc(&self, svc_id: SvcId) -> Result<bool> {
        emu_kern::dispatch_svc(self, svc_id)?;

        self.exec_ctx.interrupt_requested.store(false, Ordering::SeqCst);
        (self.interrupt_handler)();

        Ok(self.exec_ctx.is_running())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn unknown_entry_is_rejected() {
        let programs = Arc::new(Context::new());
        let exec_ctx = programs.create_execution_context(false);

        let rc = exec_ctx.execute(0x1000, &|| {}).unwrap_err();
        assert!(result::ResultInvalidEntry::matches(rc));
    }

    #[test]
    fn program_observes_registers_and_interrupts() {
        let programs = Arc::new(Context::new());
        programs.register_program(0x8000, |ctx| {
            let arg = ctx.get_x(0);
            ctx.set_x(1, arg * 2);

            while ctx.poll() {
                std::thread::yield_now();
            }
            Ok(())
        });

        let exec_ctx = programs.create_execution_context(false);
        exec_ctx.set_x(0, 21);
        exec_ctx.request_interrupt();

        let interrupts = Arc::new(AtomicUsize::new(0));
        let handler_ctx = exec_ctx.clone();
        let handler_interrupts = interrupts.clone();
        exec_ctx.execute(0x8000, &move || {
            handler_interrupts.fetch_add(1, Ordering::SeqCst);
            handler_ctx.stop_running();
        }).unwrap();

        assert_eq!(exec_ctx.get_x(1), 42);
        assert_eq!(interrupts.load(Ordering::SeqCst), 1);
        assert!(!exec_ctx.is_running());
    }

    #[test]
    fn disposed_context_does_not_execute() {
        let programs = Arc::new(Context::new());
        programs.register_program(0x10, |_| Ok(()));

        let exec_ctx = programs.create_execution_context(true);
        assert!(exec_ctx.is_aarch32());
        exec_ctx.dispose();

        let rc = exec_ctx.execute(0x10, &|| {}).unwrap_err();
        assert!(crate::result::ResultObjectDisposed::matches(rc));
    }
}

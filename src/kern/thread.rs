use std::cell::RefCell;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{Builder, JoinHandle};
use std::time::{Duration, Instant};
use parking_lot::Mutex;
use rand::Rng;
use rsevents::{Awaitable, ManualResetEvent, State};
use crate::emu::cfg;
use crate::emu::cpu::{self, ExecutionContext};
use crate::result::*;
use crate::result as lib_result;
use crate::util::convert_io_result;
use super::{KernelContext, CPU_CORE_COUNT};
use super::proc::KProcess;
use super::svc::LimitableResource;
use super::sched::PRIORITY_COUNT;
use super::sync::{KSynchronization, KSynchronizationBase, KSynchronizationObject, WaitBlock, WaitOutcome};
use super::time::KFutureSchedulerObject;
use super::result;

pub const INVALID_CPU_CORE: i32 = -1;
pub const HIGHEST_THREAD_PRIORITY: i32 = 0;
pub const LOWEST_THREAD_PRIORITY: i32 = PRIORITY_COUNT as i32 - 1;

// Threads above this base priority get demoted when asked to terminate
const TERMINATION_PRIORITY_THRESHOLD: i32 = 0x10;
const TERMINATION_PRIORITY: i32 = 0xF;

bit_enum! {
    ThreadSchedState (u16) {
        None = 0,
        Paused = 1,
        Running = 2,
        TerminationPending = 3,

        ProcessPauseFlag = bit!(4),
        ThreadPauseFlag = bit!(5),
        ProcessDebugPauseFlag = bit!(6),
        BacktracePauseFlag = bit!(7),
        KernelInitPauseFlag = bit!(8),

        LowMask = 0xF,
        HighMask = 0xFFF0,
        ForcePauseMask = 0x1F0
    }
}

impl ThreadSchedState {
    #[inline]
    pub const fn get_low_flags(self) -> Self {
        Self(self.0 & 0xF)
    }

    #[inline]
    pub const fn get_high_flags(self) -> Self {
        Self(self.0 & 0xFFF0)
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ThreadType {
    Dummy,
    Kernel,
    Kernel2,
    User
}

pub enum ThreadEntry {
    Guest(u64),
    Custom(Box<dyn FnOnce() + Send + 'static>)
}

pub struct ThreadInitInfo {
    pub name: String,
    pub entry: Option<ThreadEntry>,
    pub arg: u64,
    pub stack_top: u64,
    pub priority: i32,
    pub cpu_core: i32,
    pub owner_process: Option<Arc<KProcess>>,
    pub thread_type: ThreadType,
    pub is_32bit: bool
}

impl ThreadInitInfo {
    fn new(name: &str, entry: Option<ThreadEntry>, priority: i32, cpu_core: i32, thread_type: ThreadType) -> Self {
        Self {
            name: String::from(name),
            entry,
            arg: 0,
            stack_top: 0,
            priority,
            cpu_core,
            owner_process: None,
            thread_type,
            is_32bit: false
        }
    }

    pub fn new_guest(name: &str, entry_addr: u64, arg: u64, stack_top: u64, priority: i32, cpu_core: i32) -> Self {
        let mut info = Self::new(name, Some(ThreadEntry::Guest(entry_addr)), priority, cpu_core, ThreadType::User);
        info.arg = arg;
        info.stack_top = stack_top;
        info
    }

    pub fn new_host<F: FnOnce() + Send + 'static>(name: &str, f: F, priority: i32, cpu_core: i32) -> Self {
        Self::new(name, Some(ThreadEntry::Custom(Box::new(f))), priority, cpu_core, ThreadType::Kernel)
    }

    /// Kernel-side representation of an already running host thread: it starts in the running state and has no vehicle.
    pub fn new_dummy(name: &str, priority: i32, cpu_core: i32) -> Self {
        Self::new(name, None, priority, cpu_core, ThreadType::Dummy)
    }

    pub fn with_owner(mut self, owner_process: &Arc<KProcess>) -> Self {
        self.owner_process = Some(owner_process.clone());
        self
    }

    pub fn with_type(mut self, thread_type: ThreadType) -> Self {
        self.thread_type = thread_type;
        self
    }

    pub fn with_32bit(mut self, is_32bit: bool) -> Self {
        self.is_32bit = is_32bit;
        self
    }
}

// Scheduling bookkeeping, only mutated under the kernel critical section

pub struct ThreadState {
    sched_flags: ThreadSchedState,
    force_pause_flags: ThreadSchedState,
    force_pause_permission_flags: ThreadSchedState,
    base_priority: i32,
    dynamic_priority: i32,
    original_base_priority: i32,
    preferred_core: i32,
    active_core: i32,
    current_core: i32,
    affinity_mask: u64,
    original_preferred_core: i32,
    original_affinity_mask: u64,
    pinned: bool,
    core_migration_disable_count: u32,
    mutex_owner: Weak<KThread>,
    mutex_waiters: BTreeMap<(i32, u64), Arc<KThread>>,
    mutex_waiter_key: Option<(i32, u64)>,
    mutex_address: u64,
    condvar_address: u64,
    pinned_waiters: Vec<Arc<KThread>>,
    tls_address: u64,
    sync_result: ResultCode,
    current_wait_block: Option<Arc<WaitBlock>>,
    total_cpu_time: Duration,
    last_scheduled_time: Option<Instant>
}

// The host vehicle and its wake primitive

pub struct ThreadExecutionHandle {
    context: Arc<dyn ExecutionContext>,
    scheduler_wait_event: ManualResetEvent,
    entry: Mutex<Option<ThreadEntry>>,
    host_thread: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    active: AtomicBool
}

impl ThreadExecutionHandle {
    fn new(context: Arc<dyn ExecutionContext>, entry: Option<ThreadEntry>, runnable: bool) -> Self {
        Self {
            context,
            scheduler_wait_event: ManualResetEvent::new(if runnable { State::Set } else { State::Unset }),
            entry: Mutex::new(entry),
            host_thread: Mutex::new(None),
            started: AtomicBool::new(false),
            active: AtomicBool::new(false)
        }
    }

    #[inline]
    pub fn get_context(&self) -> &Arc<dyn ExecutionContext> {
        &self.context
    }

    #[inline]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Whether the vehicle is currently executing (neither parked by the scheduler nor blocked in a wait).
    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    #[inline]
    fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }
}

pub struct KThread {
    pub id: u64,
    kernel: Arc<KernelContext>,
    owner_process: Option<Arc<KProcess>>,
    thread_type: ThreadType,
    is_schedulable: bool,
    host_name: String,
    state: Mutex<ThreadState>,
    exec: ThreadExecutionHandle,
    sync_base: KSynchronizationBase,
    cancel_signal: KSynchronizationBase,
    should_be_terminated: AtomicBool,
    exit_started: AtomicBool,
    resource_reserved: AtomicBool,
    activity_lock: Mutex<()>
}

impl KSynchronizationObject for KThread {
    fn get_sync_base(&self) -> &KSynchronizationBase {
        &self.sync_base
    }
}

impl KFutureSchedulerObject for KThread {
    fn time_up(self: Arc<Self>) {
        self.release_and_resume();
    }
}

impl KThread {
    pub fn new(kernel: &Arc<KernelContext>, info: ThreadInitInfo) -> Result<Arc<Self>> {
        let ThreadInitInfo { name, entry, arg, stack_top, priority, cpu_core, owner_process, thread_type, is_32bit } = info;

        result_return_unless!((priority >= HIGHEST_THREAD_PRIORITY) && (priority <= LOWEST_THREAD_PRIORITY), result::ResultInvalidPriority);
        result_return_unless!((cpu_core >= 0) && (cpu_core < CPU_CORE_COUNT as i32), result::ResultInvalidCoreId);

        let mut tls_address = 0;
        let mut resource_reserved = false;
        if thread_type == ThreadType::User {
            if let Some(owner) = owner_process.as_ref() {
                result_return_unless!(owner.get_resource_limit().reserve(LimitableResource::Thread, 1), result::ResultLimitReached);

                tls_address = match owner.allocate_tls() {
                    Ok(address) => address,
                    Err(rc) => {
                        owner.get_resource_limit().release(LimitableResource::Thread, 1);
                        return Err(rc);
                    }
                };
                resource_reserved = true;
            }
        }

        let exec_ctx: Arc<dyn ExecutionContext> = match owner_process.as_ref() {
            Some(owner) => owner.create_execution_context(is_32bit),
            None => Arc::new(cpu::Context::new()).create_execution_context(is_32bit)
        };

        exec_ctx.set_x(0, arg);
        if is_32bit {
            exec_ctx.set_x(cpu::AARCH32_SP_REGISTER, stack_top as u32 as u64);
        }
        else {
            exec_ctx.set_x(cpu::TLS_REGISTER, rand::thread_rng().gen::<u64>() | 1);
            exec_ctx.set_x(cpu::SP_REGISTER, stack_top);
        }
        exec_ctx.set_tpidrro_el0(tls_address);

        let is_custom = matches!(entry, Some(ThreadEntry::Custom(_)));
        let is_schedulable = !is_custom && (thread_type != ThreadType::Dummy);
        let sched_flags = match thread_type {
            ThreadType::Dummy => ThreadSchedState::Running(),
            _ => ThreadSchedState::None()
        };

        let thread = Arc::new(Self {
            id: kernel.new_thread_id(),
            kernel: kernel.clone(),
            owner_process: owner_process.clone(),
            thread_type,
            is_schedulable,
            host_name: name,
            state: Mutex::new(ThreadState {
                sched_flags,
                force_pause_flags: ThreadSchedState::None(),
                force_pause_permission_flags: ThreadSchedState::ForcePauseMask(),
                base_priority: priority,
                dynamic_priority: priority,
                original_base_priority: priority,
                preferred_core: cpu_core,
                active_core: cpu_core,
                current_core: cpu_core,
                affinity_mask: bit!(cpu_core as u64),
                original_preferred_core: cpu_core,
                original_affinity_mask: bit!(cpu_core as u64),
                pinned: false,
                core_migration_disable_count: 0,
                mutex_owner: Weak::new(),
                mutex_waiters: BTreeMap::new(),
                mutex_waiter_key: None,
                mutex_address: 0,
                condvar_address: 0,
                pinned_waiters: Vec::new(),
                tls_address,
                sync_result: lib_result::ResultThreadNotStarted::make(),
                current_wait_block: None,
                total_cpu_time: Duration::ZERO,
                last_scheduled_time: None
            }),
            exec: ThreadExecutionHandle::new(exec_ctx, entry, sched_flags == ThreadSchedState::Running()),
            sync_base: KSynchronizationBase::new(),
            cancel_signal: KSynchronizationBase::new(),
            should_be_terminated: AtomicBool::new(false),
            exit_started: AtomicBool::new(false),
            resource_reserved: AtomicBool::new(resource_reserved),
            activity_lock: Mutex::new(())
        });

        kernel.register_thread(&thread);

        if let Some(owner) = owner_process.as_ref() {
            owner.add_thread(&thread);

            let _guard = kernel.make_critical_section_guard();
            if owner.is_paused() && !thread.is_termination_requested() {
                thread.state.lock().force_pause_flags |= ThreadSchedState::ProcessPauseFlag();
                thread.combine_force_pause_flags();
            }
        }

        Ok(thread)
    }

    // Accessors

    #[inline]
    pub fn get_kernel(&self) -> &Arc<KernelContext> {
        &self.kernel
    }

    #[inline]
    pub fn belongs_to(&self, kernel: &KernelContext) -> bool {
        std::ptr::eq(Arc::as_ptr(&self.kernel), kernel)
    }

    #[inline]
    pub fn get_owner_process(&self) -> Option<Arc<KProcess>> {
        self.owner_process.clone()
    }

    #[inline]
    pub fn get_thread_type(&self) -> ThreadType {
        self.thread_type
    }

    #[inline]
    pub fn is_schedulable(&self) -> bool {
        self.is_schedulable
    }

    #[inline]
    pub fn get_host_name(&self) -> &str {
        &self.host_name
    }

    #[inline]
    pub fn get_execution_handle(&self) -> &ThreadExecutionHandle {
        &self.exec
    }

    #[inline]
    pub fn get_cancel_signal(&self) -> &KSynchronizationBase {
        &self.cancel_signal
    }

    pub fn get_sched_flags(&self) -> ThreadSchedState {
        self.state.lock().sched_flags
    }

    pub fn get_force_pause_flags(&self) -> ThreadSchedState {
        self.state.lock().force_pause_flags
    }

    pub fn get_base_priority(&self) -> i32 {
        self.state.lock().base_priority
    }

    pub fn get_dynamic_priority(&self) -> i32 {
        self.state.lock().dynamic_priority
    }

    pub fn get_active_core(&self) -> i32 {
        self.state.lock().active_core
    }

    pub(super) fn set_active_core(&self, core: i32) {
        self.state.lock().active_core = core;
    }

    pub fn get_current_core(&self) -> i32 {
        self.state.lock().current_core
    }

    pub(super) fn set_current_core(&self, core: i32) {
        self.state.lock().current_core = core;
    }

    pub fn get_preferred_core(&self) -> i32 {
        self.state.lock().preferred_core
    }

    pub fn get_affinity_mask(&self) -> u64 {
        self.state.lock().affinity_mask
    }

    pub fn is_pinned(&self) -> bool {
        self.state.lock().pinned
    }

    pub fn can_migrate(&self) -> bool {
        let state = self.state.lock();
        !state.pinned && (state.core_migration_disable_count == 0)
    }

    pub fn get_tls_address(&self) -> u64 {
        self.state.lock().tls_address
    }

    pub fn get_mutex_address(&self) -> u64 {
        self.state.lock().mutex_address
    }

    pub fn set_mutex_address(&self, address: u64) {
        self.state.lock().mutex_address = address;
    }

    pub fn get_condvar_address(&self) -> u64 {
        self.state.lock().condvar_address
    }

    pub fn set_condvar_address(&self, address: u64) {
        self.state.lock().condvar_address = address;
    }

    pub fn get_mutex_owner(&self) -> Option<Arc<KThread>> {
        self.state.lock().mutex_owner.upgrade()
    }

    pub fn get_mutex_waiter_count(&self) -> usize {
        self.state.lock().mutex_waiters.len()
    }

    pub fn get_sync_result(&self) -> ResultCode {
        self.state.lock().sync_result
    }

    pub fn set_sync_result(&self, rc: ResultCode) {
        self.state.lock().sync_result = rc;
    }

    #[inline]
    pub fn is_termination_requested(&self) -> bool {
        self.should_be_terminated.load(Ordering::SeqCst) || (self.get_sched_flags().get_low_flags() == ThreadSchedState::TerminationPending())
    }

    #[inline]
    pub fn has_exited(&self) -> bool {
        self.exit_started.load(Ordering::SeqCst)
    }

    pub(super) fn add_cpu_time(&self, elapsed: Duration) {
        self.state.lock().total_cpu_time += elapsed;
    }

    pub(super) fn set_last_scheduled_time(&self, instant: Instant) {
        self.state.lock().last_scheduled_time = Some(instant);
    }

    /// CPU time accumulated while selected by a core scheduler, including the ongoing slice.
    pub fn get_cpu_time(self: &Arc<Self>) -> Duration {
        let (total_cpu_time, last_scheduled_time, current_core) = {
            let state = self.state.lock();
            (state.total_cpu_time, state.last_scheduled_time, state.current_core)
        };

        let is_selected = (current_core >= 0) && self.kernel.get_scheduler(current_core).is_selected_thread(self);
        match (is_selected, last_scheduled_time) {
            (true, Some(instant)) => total_cpu_time + instant.elapsed(),
            _ => total_cpu_time
        }
    }

    // Scheduling state

    fn update_scheduler_wait_event(&self, flags: ThreadSchedState) {
        if (flags == ThreadSchedState::Running()) || (flags.get_low_flags() == ThreadSchedState::TerminationPending()) {
            self.exec.scheduler_wait_event.set();
        }
        else {
            self.exec.scheduler_wait_event.reset();
        }
    }

    fn adjust_scheduling(self: &Arc<Self>, old_flags: ThreadSchedState) {
        let (cur_flags, active_core, priority, affinity_mask) = {
            let state = self.state.lock();
            (state.sched_flags, state.active_core, state.dynamic_priority, state.affinity_mask)
        };

        if old_flags == cur_flags {
            return;
        }

        self.update_scheduler_wait_event(cur_flags);

        // Non-schedulable threads are just run or paused directly, priority and cores don't matter for them
        if !self.is_schedulable {
            return;
        }

        let mut priority_queue = self.kernel.get_priority_queue().lock();
        if old_flags == ThreadSchedState::Running() {
            if active_core >= 0 {
                priority_queue.unschedule(priority, active_core, self);
            }

            for core in 0..CPU_CORE_COUNT as i32 {
                if (core != active_core) && (((affinity_mask >> core) & 1) != 0) {
                    priority_queue.unsuggest(priority, core, self);
                }
            }
        }
        else if cur_flags == ThreadSchedState::Running() {
            if active_core >= 0 {
                priority_queue.schedule(priority, active_core, self);
            }

            for core in 0..CPU_CORE_COUNT as i32 {
                if (core != active_core) && (((affinity_mask >> core) & 1) != 0) {
                    priority_queue.suggest(priority, core, self);
                }
            }
        }
        drop(priority_queue);

        self.kernel.request_thread_reselection();
    }

    fn adjust_scheduling_for_new_priority(self: &Arc<Self>, old_priority: i32) {
        let (cur_flags, active_core, priority, affinity_mask) = {
            let state = self.state.lock();
            (state.sched_flags, state.active_core, state.dynamic_priority, state.affinity_mask)
        };

        if (cur_flags != ThreadSchedState::Running()) || !self.is_schedulable {
            return;
        }

        let is_current = match try_get_current_thread() {
            Some(cur_thread) => Arc::ptr_eq(&cur_thread, self),
            None => false
        };

        let mut priority_queue = self.kernel.get_priority_queue().lock();
        if active_core >= 0 {
            priority_queue.unschedule(old_priority, active_core, self);
        }
        for core in 0..CPU_CORE_COUNT as i32 {
            if (core != active_core) && (((affinity_mask >> core) & 1) != 0) {
                priority_queue.unsuggest(old_priority, core, self);
            }
        }

        if active_core >= 0 {
            if is_current {
                priority_queue.schedule_prepend(priority, active_core, self);
            }
            else {
                priority_queue.schedule(priority, active_core, self);
            }
        }
        for core in 0..CPU_CORE_COUNT as i32 {
            if (core != active_core) && (((affinity_mask >> core) & 1) != 0) {
                priority_queue.suggest(priority, core, self);
            }
        }
        drop(priority_queue);

        self.kernel.request_thread_reselection();
    }

    fn adjust_scheduling_for_new_affinity(self: &Arc<Self>, old_affinity_mask: u64, old_core: i32) {
        let (cur_flags, active_core, priority, affinity_mask) = {
            let state = self.state.lock();
            (state.sched_flags, state.active_core, state.dynamic_priority, state.affinity_mask)
        };

        if (cur_flags != ThreadSchedState::Running()) || (priority >= PRIORITY_COUNT as i32) || !self.is_schedulable {
            return;
        }

        let mut priority_queue = self.kernel.get_priority_queue().lock();
        for core in 0..CPU_CORE_COUNT as i32 {
            if ((old_affinity_mask >> core) & 1) != 0 {
                if core == old_core {
                    priority_queue.unschedule(priority, core, self);
                }
                else {
                    priority_queue.unsuggest(priority, core, self);
                }
            }
        }

        for core in 0..CPU_CORE_COUNT as i32 {
            if ((affinity_mask >> core) & 1) != 0 {
                if core == active_core {
                    priority_queue.schedule(priority, core, self);
                }
                else {
                    priority_queue.suggest(priority, core, self);
                }
            }
        }
        drop(priority_queue);

        self.kernel.request_thread_reselection();
    }

    fn set_new_sched_flags(self: &Arc<Self>, new_flags: ThreadSchedState) {
        let _guard = self.kernel.make_critical_section_guard();

        let old_flags = {
            let mut state = self.state.lock();
            let old_flags = state.sched_flags;
            state.sched_flags = old_flags.get_high_flags() | new_flags;
            old_flags
        };

        if old_flags.get_low_flags() != new_flags {
            self.adjust_scheduling(old_flags);
        }
    }

    /// Replaces the low scheduling state while keeping the force-pause bits.
    pub fn reschedule(self: &Arc<Self>, new_flags: ThreadSchedState) {
        let _guard = self.kernel.make_critical_section_guard();

        let old_flags = {
            let mut state = self.state.lock();
            let old_flags = state.sched_flags;
            state.sched_flags = old_flags.get_high_flags() | new_flags.get_low_flags();
            old_flags
        };

        self.adjust_scheduling(old_flags);
    }

    fn combine_force_pause_flags(self: &Arc<Self>) {
        let old_flags = {
            let mut state = self.state.lock();
            let old_flags = state.sched_flags;
            state.sched_flags = old_flags.get_low_flags() | (state.force_pause_flags & state.force_pause_permission_flags);
            old_flags
        };

        self.adjust_scheduling(old_flags);
    }

    /// Blocks the calling vehicle until the scheduler lets this thread run.
    pub fn wait_for_scheduling(&self) {
        if self.exec.scheduler_wait_event.wait0() {
            return;
        }

        if cfg::get_config().log_scheduling {
            log_line!("Parking thread {} ({:?})", self.id, self.get_sched_flags());
        }

        self.exec.set_active(false);
        self.exec.scheduler_wait_event.wait();
        self.exec.set_active(true);
    }

    // Start / vehicle

    fn host_thread_fn(thread: Arc<KThread>) {
        set_current_thread(thread.clone());
        thread.exec.set_active(true);
        thread.wait_for_scheduling();

        let entry = thread.exec.entry.lock().take();
        let run_rc = panic::catch_unwind(AssertUnwindSafe(|| {
            if thread.is_termination_requested() {
                return;
            }

            match entry {
                Some(ThreadEntry::Guest(entry_addr)) => {
                    if let Err(rc) = thread.exec.context.execute(entry_addr, &|| thread.handle_post_syscall()) {
                        log_line!("Guest execution at {:#X} failed: {:?}", entry_addr, rc);
                    }
                },
                Some(ThreadEntry::Custom(f)) => f(),
                None => {}
            }
        }));

        thread.exit();
        thread.exec.set_active(false);
        reset_current_thread();

        if let Err(panic_payload) = run_rc {
            panic::resume_unwind(panic_payload);
        }
    }

    fn start_host_thread(self: &Arc<Self>) -> Result<()> {
        let mut host_thread = self.exec.host_thread.lock();
        if self.exec.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let thread = self.clone();
        let builder = Builder::new().name(self.host_name.clone());
        *host_thread = Some(convert_io_result(builder.spawn(move || Self::host_thread_fn(thread)))?);
        Ok(())
    }

    pub fn start(self: &Arc<Self>) -> Result<()> {
        if !self.kernel.is_initialized() {
            let _guard = self.kernel.make_critical_section_guard();
            if !self.is_termination_requested() {
                self.state.lock().force_pause_flags |= ThreadSchedState::KernelInitPauseFlag();
                self.combine_force_pause_flags();
            }
        }

        let cur_thread = try_get_current_thread().filter(|thread| thread.belongs_to(&self.kernel));

        let _guard = self.kernel.make_critical_section_guard();
        if !self.should_be_terminated.load(Ordering::SeqCst) {
            loop {
                let cur_flags = self.get_sched_flags();
                if cur_flags.get_low_flags() == ThreadSchedState::TerminationPending() {
                    break;
                }

                if let Some(cur_thread_v) = cur_thread.as_ref() {
                    if cur_thread_v.is_termination_requested() {
                        break;
                    }
                }

                result_return_unless!(cur_flags.get_low_flags() == ThreadSchedState::None(), result::ResultInvalidState);

                let caller_paused = match cur_thread.as_ref() {
                    Some(cur_thread_v) => !cur_thread_v.get_force_pause_flags().is_empty(),
                    None => false
                };

                if !caller_paused {
                    if self.owner_process.is_some() && !self.get_force_pause_flags().is_empty() {
                        self.combine_force_pause_flags();
                    }

                    self.set_new_sched_flags(ThreadSchedState::Running());
                    self.start_host_thread()?;

                    if cfg::get_config().log_scheduling {
                        log_line!("Started thread {} ('{}')", self.id, self.host_name);
                    }
                    return Ok(());
                }

                // The caller has pending pauses of its own, let it get paused first
                if let Some(cur_thread_v) = cur_thread.as_ref() {
                    cur_thread_v.combine_force_pause_flags();
                    self.kernel.leave_critical_section();
                    self.kernel.enter_critical_section();

                    if cur_thread_v.should_be_terminated.load(Ordering::SeqCst) {
                        break;
                    }
                }
            }
        }

        result::ResultTerminationRequested::make_err()
    }

    /// Waits for the host vehicle to finish, forwarding any panic raised inside it.
    pub fn join(&self) -> Result<()> {
        result_return_unless!(self.exec.is_started(), lib_result::ResultThreadNotStarted);

        let host_thread = self.exec.host_thread.lock().take();
        if let Some(host_thread_v) = host_thread {
            if let Err(panic_payload) = host_thread_v.join() {
                panic::resume_unwind(panic_payload);
            }
        }

        Ok(())
    }

    // Priority / mutex inheritance

    pub fn set_priority(self: &Arc<Self>, priority: i32) {
        let _guard = self.kernel.make_critical_section_guard();

        {
            let mut state = self.state.lock();
            if state.pinned {
                state.original_base_priority = priority;
            }
            else {
                state.base_priority = priority;
            }
        }

        self.update_priority_inheritance();
    }

    fn add_to_mutex_waiters_list(&self, requester: &Arc<KThread>) {
        let key = (requester.get_dynamic_priority(), self.kernel.new_mutex_waiter_seq());
        self.state.lock().mutex_waiters.insert(key, requester.clone());
        requester.state.lock().mutex_waiter_key = Some(key);
    }

    pub fn add_mutex_waiter(self: &Arc<Self>, requester: &Arc<KThread>) {
        let _guard = self.kernel.make_critical_section_guard();

        self.add_to_mutex_waiters_list(requester);
        requester.state.lock().mutex_owner = Arc::downgrade(self);

        self.update_priority_inheritance();
    }

    pub fn remove_mutex_waiter(self: &Arc<Self>, thread: &Arc<KThread>) {
        let _guard = self.kernel.make_critical_section_guard();

        let waiter_key = {
            let mut waiter_state = thread.state.lock();
            waiter_state.mutex_owner = Weak::new();
            waiter_state.mutex_waiter_key.take()
        };
        if let Some(key) = waiter_key {
            self.state.lock().mutex_waiters.remove(&key);
        }

        self.update_priority_inheritance();
    }

    /// Hands the mutex at `mutex_address` to the most urgent waiter for it, re-parenting the rest of its waiters.
    /// Returns the new owner and how many waiters were waiting on that mutex.
    pub fn relinquish_mutex(self: &Arc<Self>, mutex_address: u64) -> (Option<Arc<KThread>>, usize) {
        let _guard = self.kernel.make_critical_section_guard();

        let waiters: Vec<((i32, u64), Arc<KThread>)> = self.state.lock().mutex_waiters.iter().map(|(key, waiter)| (*key, waiter.clone())).collect();

        let mut new_owner: Option<Arc<KThread>> = None;
        let mut count = 0;
        for (key, waiter) in waiters {
            if waiter.get_mutex_address() != mutex_address {
                continue;
            }

            self.state.lock().mutex_waiters.remove(&key);

            match new_owner.as_ref() {
                Some(new_owner_v) => {
                    waiter.state.lock().mutex_owner = Arc::downgrade(new_owner_v);
                    new_owner_v.add_to_mutex_waiters_list(&waiter);
                },
                None => {
                    {
                        let mut waiter_state = waiter.state.lock();
                        waiter_state.mutex_owner = Weak::new();
                        waiter_state.mutex_waiter_key = None;
                    }
                    new_owner = Some(waiter.clone());
                }
            }

            count += 1;
        }

        if let Some(new_owner_v) = new_owner.as_ref() {
            self.update_priority_inheritance();
            new_owner_v.update_priority_inheritance();
        }

        (new_owner, count)
    }

    /// Recomputes the dynamic priority from the base priority and the most urgent mutex waiter,
    /// propagating changes up the chain of mutex owners.
    pub fn update_priority_inheritance(self: &Arc<Self>) {
        let _guard = self.kernel.make_critical_section_guard();

        let mut thread = self.clone();
        loop {
            let (old_priority, new_priority, owner) = {
                let mut state = thread.state.lock();

                let mut highest_priority = state.base_priority;
                if let Some(((waiter_priority, _), _)) = state.mutex_waiters.iter().next() {
                    if *waiter_priority < highest_priority {
                        highest_priority = *waiter_priority;
                    }
                }

                if highest_priority == state.dynamic_priority {
                    return;
                }

                let old_priority = state.dynamic_priority;
                state.dynamic_priority = highest_priority;
                (old_priority, highest_priority, state.mutex_owner.upgrade())
            };

            thread.adjust_scheduling_for_new_priority(old_priority);

            let owner = match owner {
                Some(owner) => owner,
                None => return
            };

            // Re-insert to keep the owner's waiter list sorted by the new priority
            let old_key = thread.state.lock().mutex_waiter_key;
            let new_key = (new_priority, self.kernel.new_mutex_waiter_seq());
            {
                let mut owner_state = owner.state.lock();
                if let Some(old_key_v) = old_key {
                    owner_state.mutex_waiters.remove(&old_key_v);
                }
                owner_state.mutex_waiters.insert(new_key, thread.clone());
            }
            thread.state.lock().mutex_waiter_key = Some(new_key);

            thread = owner;
        }
    }

    // Pinning

    pub fn pin(self: &Arc<Self>) {
        let _guard = self.kernel.make_critical_section_guard();

        let (old_affinity_mask, old_active_core, affinity_changed) = {
            let mut state = self.state.lock();
            state.pinned = true;
            state.core_migration_disable_count += 1;

            let old_active_core = state.active_core;
            state.original_preferred_core = state.preferred_core;
            state.original_affinity_mask = state.affinity_mask;

            state.active_core = state.current_core;
            state.preferred_core = state.current_core;
            state.affinity_mask = bit!(state.current_core as u64);

            let affinity_changed = (old_active_core != state.current_core) || (state.original_affinity_mask != state.affinity_mask);
            (state.original_affinity_mask, old_active_core, affinity_changed)
        };

        if affinity_changed {
            self.adjust_scheduling_for_new_affinity(old_affinity_mask, old_active_core);
        }

        let allowed_priority_mask = match self.owner_process.as_ref() {
            Some(owner) => owner.get_allowed_priority_mask(),
            None => u64::MAX
        };
        let priority_ceiling = (allowed_priority_mask.trailing_zeros() as i32 - 1).max(0);

        {
            let mut state = self.state.lock();
            state.original_base_priority = state.base_priority;
            state.base_priority = state.original_base_priority.min(priority_ceiling);
        }
        self.update_priority_inheritance();

        // Pinned threads can't be paused individually
        self.state.lock().force_pause_permission_flags &= !ThreadSchedState::ThreadPauseFlag();
        self.combine_force_pause_flags();
    }

    pub fn unpin(self: &Arc<Self>) {
        let _guard = self.kernel.make_critical_section_guard();

        let (old_affinity_mask, old_active_core, affinity_changed) = {
            let mut state = self.state.lock();
            state.pinned = false;
            state.core_migration_disable_count = state.core_migration_disable_count.saturating_sub(1);

            let old_affinity_mask = state.affinity_mask;
            let old_active_core = state.active_core;
            state.preferred_core = state.original_preferred_core;
            state.affinity_mask = state.original_affinity_mask;

            let mut affinity_changed = false;
            if state.affinity_mask != old_affinity_mask {
                affinity_changed = true;
                if (state.affinity_mask & bit!(state.active_core as u64)) == 0 {
                    state.active_core = match state.preferred_core >= 0 {
                        true => state.preferred_core,
                        false => 63 - state.affinity_mask.leading_zeros() as i32
                    };
                }
            }
            (old_affinity_mask, old_active_core, affinity_changed)
        };

        if affinity_changed {
            self.adjust_scheduling_for_new_affinity(old_affinity_mask, old_active_core);
        }

        {
            let mut state = self.state.lock();
            state.base_priority = state.original_base_priority;
        }
        self.update_priority_inheritance();

        if !self.is_termination_requested() {
            self.state.lock().force_pause_permission_flags |= ThreadSchedState::ThreadPauseFlag();
            self.combine_force_pause_flags();
        }

        let pinned_waiters: Vec<Arc<KThread>> = self.state.lock().pinned_waiters.drain(..).collect();
        for waiter in pinned_waiters {
            waiter.release_and_resume();
        }
    }

    // Pausing

    pub fn suspend(self: &Arc<Self>, flag: ThreadSchedState) {
        let _guard = self.kernel.make_critical_section_guard();

        self.state.lock().force_pause_flags |= flag;
        self.combine_force_pause_flags();
    }

    pub fn resume(self: &Arc<Self>, flag: ThreadSchedState) {
        let _guard = self.kernel.make_critical_section_guard();

        self.state.lock().force_pause_flags &= !flag;
        self.combine_force_pause_flags();
    }

    pub fn set_activity(self: &Arc<Self>, pause: bool) -> Result<()> {
        let _activity_guard = self.activity_lock.lock();

        {
            let _guard = self.kernel.make_critical_section_guard();

            let low_flags = self.get_sched_flags().get_low_flags();
            result_return_unless!((low_flags == ThreadSchedState::Paused()) || (low_flags == ThreadSchedState::Running()), result::ResultInvalidState);

            if !self.is_termination_requested() {
                let is_paused = self.get_force_pause_flags().contains(ThreadSchedState::ThreadPauseFlag());
                if pause {
                    result_return_if!(is_paused, result::ResultInvalidState);
                    self.suspend(ThreadSchedState::ThreadPauseFlag());
                }
                else {
                    result_return_unless!(is_paused, result::ResultInvalidState);
                    self.resume(ThreadSchedState::ThreadPauseFlag());
                }
            }
        }

        if pause {
            if cfg::get_config().log_scheduling {
                log_line!("Pausing thread {}", self.id);
            }

            self.wait_until_not_running()?;
        }

        Ok(())
    }

    fn wait_until_not_running(self: &Arc<Self>) -> Result<()> {
        let cur_thread = try_get_current_thread().filter(|thread| thread.belongs_to(&self.kernel));
        if let Some(cur_thread_v) = cur_thread.as_ref() {
            if Arc::ptr_eq(cur_thread_v, self) {
                return Ok(());
            }
        }

        loop {
            {
                let _guard = self.kernel.make_critical_section_guard();
                if self.is_termination_requested() || self.has_exited() {
                    return Ok(());
                }

                if self.is_pinned() {
                    // Wait for the unpin instead of spinning on a thread which can't be paused yet
                    if let Some(cur_thread_v) = cur_thread.as_ref() {
                        result_return_if!(cur_thread_v.is_termination_requested(), result::ResultTerminationRequested);

                        self.state.lock().pinned_waiters.push(cur_thread_v.clone());
                        cur_thread_v.reschedule(ThreadSchedState::Paused());
                        continue;
                    }
                }
                else if !(self.exec.is_started() && self.exec.is_active()) {
                    return Ok(());
                }
                else {
                    self.exec.context.request_interrupt();
                }
            }

            std::thread::yield_now();
        }
    }

    // Termination

    pub fn release_and_resume(self: &Arc<Self>) {
        let _guard = self.kernel.make_critical_section_guard();

        if self.get_sched_flags().get_low_flags() == ThreadSchedState::Paused() {
            self.set_new_sched_flags(ThreadSchedState::Running());
        }
    }

    /// Requests termination exactly once, returning the low scheduling state afterwards.
    pub fn prepare_for_termination(self: &Arc<Self>) -> ThreadSchedState {
        let _guard = self.kernel.make_critical_section_guard();

        if let Some(owner) = self.owner_process.as_ref() {
            let cur_core = match try_get_current_thread() {
                Some(cur_thread) => cur_thread.get_current_core(),
                None => self.get_current_core()
            };
            if owner.is_pinned_thread(cur_core, self) {
                owner.unpin_thread(self);
            }
        }

        if !self.should_be_terminated.swap(true, Ordering::SeqCst) {
            if self.get_sched_flags().get_low_flags() == ThreadSchedState::None() {
                let old_flags = {
                    let mut state = self.state.lock();
                    let old_flags = state.sched_flags;
                    state.sched_flags = ThreadSchedState::TerminationPending();
                    old_flags
                };
                self.adjust_scheduling(old_flags);
            }
            else {
                let has_force_pause = !self.get_force_pause_flags().is_empty();
                if has_force_pause {
                    let old_flags = {
                        let mut state = self.state.lock();
                        state.force_pause_flags &= !ThreadSchedState::ThreadPauseFlag();
                        let old_flags = state.sched_flags;
                        state.sched_flags = old_flags.get_low_flags();
                        old_flags
                    };
                    self.adjust_scheduling(old_flags);
                }

                if self.get_base_priority() >= TERMINATION_PRIORITY_THRESHOLD {
                    self.set_priority(TERMINATION_PRIORITY);
                }

                if self.get_sched_flags().get_low_flags() == ThreadSchedState::Running() {
                    self.exec.context.request_interrupt();
                }

                let wait_block = {
                    let mut state = self.state.lock();
                    state.sync_result = result::ResultTerminationRequested::make();
                    state.current_wait_block.clone()
                };
                if let Some(wait_block_v) = wait_block {
                    wait_block_v.try_complete(WaitOutcome::Terminating);
                }

                self.release_and_resume();
            }
        }

        self.get_sched_flags().get_low_flags()
    }

    /// Requests termination and waits for the thread to exit.
    pub fn terminate(self: &Arc<Self>) -> Result<()> {
        let low_flags = self.prepare_for_termination();

        if low_flags == ThreadSchedState::TerminationPending() {
            // Never started, so nothing else will run its exit path
            if !self.exec.is_started() {
                self.exit();
            }
            return Ok(());
        }

        if let Some(cur_thread) = try_get_current_thread() {
            if Arc::ptr_eq(&cur_thread, self) {
                return Ok(());
            }
        }

        let objs: [Arc<dyn KSynchronizationObject>; 1] = [self.clone()];
        KSynchronization::wait_for(&self.kernel, &objs, -1).map(|_| ())
    }

    fn exit_impl(self: &Arc<Self>) {
        let _guard = self.kernel.make_critical_section_guard();

        self.set_new_sched_flags(ThreadSchedState::TerminationPending());
        self.sync_base.signal();
    }

    fn detach_mutex_waiters(self: &Arc<Self>) {
        if let Some(owner) = self.get_mutex_owner() {
            owner.remove_mutex_waiter(self);
        }

        let waiters: Vec<Arc<KThread>> = {
            let mut state = self.state.lock();
            let waiters = state.mutex_waiters.values().cloned().collect();
            state.mutex_waiters.clear();
            waiters
        };
        for waiter in waiters {
            let mut waiter_state = waiter.state.lock();
            waiter_state.mutex_owner = Weak::new();
            waiter_state.mutex_waiter_key = None;
        }

        self.update_priority_inheritance();
    }

    /// Marks the thread as dead: wakes joiners, stops its execution context and returns its resources. Runs once.
    pub fn exit(self: &Arc<Self>) {
        if self.exit_started.swap(true, Ordering::SeqCst) {
            return;
        }

        if self.resource_reserved.swap(false, Ordering::SeqCst) {
            if let Some(owner) = self.owner_process.as_ref() {
                owner.get_resource_limit().release(LimitableResource::Thread, 1);
            }
        }

        {
            let _guard = self.kernel.make_critical_section_guard();

            {
                let mut state = self.state.lock();
                state.force_pause_flags &= !ThreadSchedState::ForcePauseMask();
                state.force_pause_permission_flags = ThreadSchedState::None();
            }
            self.combine_force_pause_flags();
            self.detach_mutex_waiters();

            self.exit_impl();
            self.cancel_signal.dispose();
            self.exec.context.stop_running();
        }

        let tls_address = std::mem::replace(&mut self.state.lock().tls_address, 0);
        if let Some(owner) = self.owner_process.as_ref() {
            if tls_address != 0 {
                owner.free_tls(tls_address);
            }
            owner.remove_thread(self);
        }
        self.kernel.unregister_thread(self);

        if cfg::get_config().log_scheduling {
            log_line!("Thread {} ('{}') exited", self.id, self.host_name);
        }
    }

    /// Scheduling point after every guest syscall or interrupt: exits if termination was requested.
    pub fn handle_post_syscall(self: &Arc<Self>) {
        loop {
            if self.is_termination_requested() {
                self.exit();
                break;
            }

            let termination_pending = {
                let _guard = self.kernel.make_critical_section_guard();
                if self.is_termination_requested() {
                    true
                }
                else {
                    if !self.get_force_pause_flags().is_empty() {
                        self.combine_force_pause_flags();
                    }
                    false
                }
            };

            if !termination_pending {
                break;
            }
        }
    }

    // Waiting

    pub(super) fn begin_wait(&self, wait_block: Arc<WaitBlock>) {
        self.state.lock().current_wait_block = Some(wait_block);
        self.exec.set_active(false);
    }

    pub(super) fn end_wait(&self) {
        self.state.lock().current_wait_block = None;
        if self.exec.is_started() {
            self.exec.set_active(true);
        }
    }

    pub fn cancel_synchronization(&self) {
        let _guard = self.kernel.make_critical_section_guard();

        self.cancel_signal.signal();
    }

    /// Cooperative sleep of the current thread; never blocks other threads.
    pub fn sleep(self: &Arc<Self>, timeout_ns: i64) -> Result<()> {
        if timeout_ns <= 0 {
            self.yield_execution();
            return Ok(());
        }

        {
            let _guard = self.kernel.make_critical_section_guard();
            result_return_if!(self.is_termination_requested(), result::ResultTerminationRequested);

            self.set_new_sched_flags(ThreadSchedState::Paused());
            self.kernel.get_time_manager().schedule_future_invocation(self.clone(), timeout_ns);
        }

        self.kernel.get_time_manager().unschedule_future_invocation(self.as_ref());
        Ok(())
    }

    pub fn yield_execution(self: &Arc<Self>) {
        {
            let _guard = self.kernel.make_critical_section_guard();

            let (cur_flags, priority, active_core) = {
                let state = self.state.lock();
                (state.sched_flags, state.dynamic_priority, state.active_core)
            };
            if self.is_schedulable && (cur_flags == ThreadSchedState::Running()) && (active_core >= 0) {
                self.kernel.get_priority_queue().lock().reschedule(priority, active_core, self);
                self.kernel.request_thread_reselection();
            }
        }

        std::thread::yield_now();
    }
}

thread_local! {
    static G_CURRENT_THREAD: RefCell<Option<Arc<KThread>>> = RefCell::new(None);
}

/// Binds a kernel thread to the calling host thread.
pub fn set_current_thread(thread: Arc<KThread>) {
    G_CURRENT_THREAD.with(|cur_thread| {
        *cur_thread.borrow_mut() = Some(thread);
    });
}

pub fn reset_current_thread() {
    let _ = G_CURRENT_THREAD.try_with(|cur_thread| {
        cur_thread.borrow_mut().take()
    });
}

#[inline]
pub fn try_get_current_thread() -> Option<Arc<KThread>> {
    G_CURRENT_THREAD.try_with(|cur_thread| cur_thread.borrow().clone()).ok().flatten()
}

#[inline]
pub fn has_current_thread() -> bool {
    try_get_current_thread().is_some()
}

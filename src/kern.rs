use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use arrayvec::ArrayVec;
use parking_lot::Mutex;
use crate::result::*;

pub mod result;

pub mod sched;
use sched::{KCriticalSection, KCriticalSectionGuard, KPriorityQueue, KScheduler};

pub mod sync;

pub mod time;
use time::KTimeManager;

pub mod event;

pub mod thread;
use thread::{KThread, ThreadSchedState, try_get_current_thread};

pub mod proc;

pub mod svc;

pub type Handle = u32;

pub const CPU_CORE_COUNT: usize = 4;

/// Global kernel state: every scheduling transition of every thread created through it is serialized by its critical section.
pub struct KernelContext {
    critical_section: KCriticalSection,
    schedulers: ArrayVec<[KScheduler; CPU_CORE_COUNT]>,
    priority_queue: Mutex<KPriorityQueue>,
    time_manager: KTimeManager,
    thread_id_counter: AtomicU64,
    process_id_counter: AtomicU64,
    mutex_waiter_seq_counter: AtomicU64,
    thread_reselection_requested: AtomicBool,
    initialized: AtomicBool,
    threads: Mutex<Vec<Weak<KThread>>>
}

impl KernelContext {
    pub fn try_new() -> Result<Arc<Self>> {
        let mut schedulers: ArrayVec<[KScheduler; CPU_CORE_COUNT]> = ArrayVec::new();
        for core in 0..CPU_CORE_COUNT as i32 {
            schedulers.push(KScheduler::new(core));
        }

        Ok(Arc::new(Self {
            critical_section: KCriticalSection::new(),
            schedulers,
            priority_queue: Mutex::new(KPriorityQueue::new()),
            time_manager: KTimeManager::new()?,
            thread_id_counter: AtomicU64::new(0),
            process_id_counter: AtomicU64::new(0),
            mutex_waiter_seq_counter: AtomicU64::new(0),
            thread_reselection_requested: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            threads: Mutex::new(Vec::new())
        }))
    }

    pub fn new() -> Arc<Self> {
        match Self::try_new() {
            Ok(kernel) => kernel,
            Err(rc) => panic!("Unable to create kernel context: {:?}", rc)
        }
    }

    /// Marks the kernel as initialized and releases every thread that was started before this point.
    pub fn initialize(&self) {
        let _guard = self.make_critical_section_guard();

        self.initialized.store(true, Ordering::SeqCst);
        for thread in self.get_threads() {
            thread.resume(ThreadSchedState::KernelInitPauseFlag());
        }
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn get_critical_section(&self) -> &KCriticalSection {
        &self.critical_section
    }

    pub fn enter_critical_section(&self) {
        self.critical_section.enter();
    }

    pub fn leave_critical_section(&self) {
        let released = self.critical_section.leave(|| {
            KScheduler::select_threads(self);
        });

        if released {
            // Threads which can't run anymore park here once all scheduling changes are visible
            if let Some(thread) = try_get_current_thread() {
                if thread.belongs_to(self) {
                    thread.wait_for_scheduling();
                }
            }
        }
    }

    #[inline]
    pub fn make_critical_section_guard(&self) -> KCriticalSectionGuard<'_> {
        KCriticalSectionGuard::new(self)
    }

    #[inline]
    pub fn get_scheduler(&self, cpu_core: i32) -> &KScheduler {
        &self.schedulers[cpu_core as usize]
    }

    #[inline]
    pub fn get_schedulers(&self) -> &[KScheduler] {
        &self.schedulers
    }

    #[inline]
    pub fn get_priority_queue(&self) -> &Mutex<KPriorityQueue> {
        &self.priority_queue
    }

    #[inline]
    pub fn get_time_manager(&self) -> &KTimeManager {
        &self.time_manager
    }

    pub fn request_thread_reselection(&self) {
        self.thread_reselection_requested.store(true, Ordering::SeqCst);
    }

    pub fn take_thread_reselection_request(&self) -> bool {
        self.thread_reselection_requested.swap(false, Ordering::SeqCst)
    }

    pub fn new_thread_id(&self) -> u64 {
        self.thread_id_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn new_process_id(&self) -> u64 {
        self.process_id_counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn new_mutex_waiter_seq(&self) -> u64 {
        self.mutex_waiter_seq_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn register_thread(&self, thread: &Arc<KThread>) {
        let mut threads = self.threads.lock();
        threads.retain(|w_thread| w_thread.strong_count() > 0);
        threads.push(Arc::downgrade(thread));
    }

    pub fn unregister_thread(&self, thread: &KThread) {
        self.threads.lock().retain(|w_thread| match w_thread.upgrade() {
            Some(r_thread) => !std::ptr::eq(r_thread.as_ref(), thread),
            None => false
        });
    }

    pub fn get_threads(&self) -> Vec<Arc<KThread>> {
        self.threads.lock().iter().filter_map(|w_thread| w_thread.upgrade()).collect()
    }

    pub fn get_total_idle_time(&self) -> std::time::Duration {
        self.schedulers.iter().map(|scheduler| scheduler.get_total_idle_time()).sum()
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use parking_lot::Mutex;
use crate::emu::cfg;
use crate::util::{RecursiveLock, new_recursive_lock, current_host_thread_id};
use super::KernelContext;
use super::thread::KThread;
use super::CPU_CORE_COUNT;

// KCriticalSection
// Note: parking_lot exposes the raw reentrant mutex, so enter/leave don't need to be tied to a guard's lifetime

pub struct KCriticalSection {
    lock: RecursiveLock,
    owner: AtomicUsize,
    recursion_count: AtomicI32
}

impl KCriticalSection {
    pub const fn new() -> Self {
        Self {
            lock: new_recursive_lock(),
            owner: AtomicUsize::new(0),
            recursion_count: AtomicI32::new(0)
        }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.owner.load(Ordering::SeqCst) == current_host_thread_id().get()
    }

    pub fn get_recursion_count(&self) -> i32 {
        self.recursion_count.load(Ordering::SeqCst)
    }

    pub fn enter(&self) {
        self.lock.lock();
        self.owner.store(current_host_thread_id().get(), Ordering::SeqCst);
        self.recursion_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Leaves one level of the critical section, returning whether the lock was fully released.
    /// `on_release` runs right before the final release, still under the lock.
    /// Unbalanced leaves (not the owner, or nothing entered) are ignored.
    pub fn leave<F: FnOnce()>(&self, on_release: F) -> bool {
        if !self.is_held_by_current_thread() || (self.get_recursion_count() == 0) {
            return false;
        }

        let new_count = self.recursion_count.fetch_sub(1, Ordering::SeqCst) - 1;
        if new_count == 0 {
            on_release();
            self.owner.store(0, Ordering::SeqCst);

            unsafe {
                self.lock.unlock();
            }
            true
        }
        else {
            unsafe {
                self.lock.unlock();
            }
            false
        }
    }
}

impl Default for KCriticalSection {
    fn default() -> Self {
        Self::new()
    }
}

pub struct KCriticalSectionGuard<'a> {
    kernel: &'a KernelContext
}

impl<'a> KCriticalSectionGuard<'a> {
    pub fn new(kernel: &'a KernelContext) -> Self {
        kernel.enter_critical_section();

        Self {
            kernel
        }
    }
}

impl<'a> Drop for KCriticalSectionGuard<'a> {
    fn drop(&mut self) {
        self.kernel.leave_critical_section();
    }
}

// ---

// KPriorityQueue

pub const PRIORITY_COUNT: usize = 0x40;

type ThreadQueue = Vec<Vec<Vec<Arc<KThread>>>>;

pub struct KPriorityQueue {
    scheduled_threads_per_prio_per_core: ThreadQueue,
    scheduled_priority_masks_per_core: [u64; CPU_CORE_COUNT],
    suggested_threads_per_prio_per_core: ThreadQueue,
    suggested_priority_masks_per_core: [u64; CPU_CORE_COUNT]
}

impl KPriorityQueue {
    fn make_queues() -> ThreadQueue {
        (0..CPU_CORE_COUNT).map(|_| (0..PRIORITY_COUNT).map(|_| Vec::new()).collect()).collect()
    }

    #[inline]
    fn is_valid(prio: i32, cpu_core: i32) -> bool {
        (prio >= 0) && (prio < PRIORITY_COUNT as i32) && (cpu_core >= 0) && (cpu_core < CPU_CORE_COUNT as i32)
    }

    pub fn new() -> Self {
        Self {
            scheduled_threads_per_prio_per_core: Self::make_queues(),
            scheduled_priority_masks_per_core: [0; CPU_CORE_COUNT],
            suggested_threads_per_prio_per_core: Self::make_queues(),
            suggested_priority_masks_per_core: [0; CPU_CORE_COUNT]
        }
    }

    pub fn suggest(&mut self, prio: i32, cpu_core: i32, thread: &Arc<KThread>) {
        if Self::is_valid(prio, cpu_core) {
            let queue = &mut self.suggested_threads_per_prio_per_core[cpu_core as usize][prio as usize];
            queue.insert(0, thread.clone());
            self.suggested_priority_masks_per_core[cpu_core as usize] |= bit!(prio as u64);
        }
    }

    pub fn unsuggest(&mut self, prio: i32, cpu_core: i32, thread: &Arc<KThread>) {
        if Self::is_valid(prio, cpu_core) {
            let queue = &mut self.suggested_threads_per_prio_per_core[cpu_core as usize][prio as usize];
            queue.retain(|s_thread| !Arc::ptr_eq(s_thread, thread));

            if queue.is_empty() {
                self.suggested_priority_masks_per_core[cpu_core as usize] &= !bit!(prio as u64);
            }
        }
    }

    pub fn schedule(&mut self, prio: i32, cpu_core: i32, thread: &Arc<KThread>) {
        if Self::is_valid(prio, cpu_core) {
            let queue = &mut self.scheduled_threads_per_prio_per_core[cpu_core as usize][prio as usize];
            queue.push(thread.clone());
            self.scheduled_priority_masks_per_core[cpu_core as usize] |= bit!(prio as u64);
        }
    }

    pub fn schedule_prepend(&mut self, prio: i32, cpu_core: i32, thread: &Arc<KThread>) {
        if Self::is_valid(prio, cpu_core) {
            let queue = &mut self.scheduled_threads_per_prio_per_core[cpu_core as usize][prio as usize];
            queue.insert(0, thread.clone());
            self.scheduled_priority_masks_per_core[cpu_core as usize] |= bit!(prio as u64);
        }
    }

    /// Moves the thread to the back of its priority level, returning the new front of that level.
    pub fn reschedule(&mut self, prio: i32, cpu_core: i32, thread: &Arc<KThread>) -> Option<Arc<KThread>> {
        if Self::is_valid(prio, cpu_core) {
            let queue = &mut self.scheduled_threads_per_prio_per_core[cpu_core as usize][prio as usize];
            let prev_len = queue.len();
            queue.retain(|s_thread| !Arc::ptr_eq(s_thread, thread));
            if queue.len() != prev_len {
                queue.push(thread.clone());
            }

            return queue.first().cloned();
        }

        None
    }

    pub fn unschedule(&mut self, prio: i32, cpu_core: i32, thread: &Arc<KThread>) {
        if Self::is_valid(prio, cpu_core) {
            let queue = &mut self.scheduled_threads_per_prio_per_core[cpu_core as usize][prio as usize];
            queue.retain(|s_thread| !Arc::ptr_eq(s_thread, thread));

            if queue.is_empty() {
                self.scheduled_priority_masks_per_core[cpu_core as usize] &= !bit!(prio as u64);
            }
        }
    }

    fn get_thread_list(&self, core: i32, suggested: bool) -> Vec<Arc<KThread>> {
        let (thread_list, mut cur_priority_mask) = match suggested {
            true => (&self.suggested_threads_per_prio_per_core, self.suggested_priority_masks_per_core[core as usize]),
            false => (&self.scheduled_threads_per_prio_per_core, self.scheduled_priority_masks_per_core[core as usize])
        };

        let mut ret_thread_list: Vec<Arc<KThread>> = Vec::new();
        while cur_priority_mask != 0 {
            let priority = cur_priority_mask.trailing_zeros() as usize;
            ret_thread_list.extend(thread_list[core as usize][priority].iter().cloned());

            cur_priority_mask &= !bit!(priority as u64);
        }

        ret_thread_list
    }

    pub fn get_scheduled_threads_for_core(&self, core: i32) -> Vec<Arc<KThread>> {
        self.get_thread_list(core, false)
    }

    pub fn get_suggested_threads_for_core(&self, core: i32) -> Vec<Arc<KThread>> {
        self.get_thread_list(core, true)
    }

    pub fn get_first_scheduled_thread_for_core(&self, core: i32) -> Option<Arc<KThread>> {
        let mask = self.scheduled_priority_masks_per_core[core as usize];
        if mask == 0 {
            return None;
        }

        let priority = mask.trailing_zeros() as usize;
        self.scheduled_threads_per_prio_per_core[core as usize][priority].first().cloned()
    }

    pub fn has_scheduled_threads_for_core(&self, core: i32) -> bool {
        self.scheduled_priority_masks_per_core[core as usize] != 0
    }

    pub fn transfer_thread_to_core(&mut self, priority: i32, dst_core: i32, thread: &Arc<KThread>) {
        let src_core = thread.get_active_core();

        if src_core != dst_core {
            thread.set_active_core(dst_core);

            if src_core >= 0 {
                self.unschedule(priority, src_core, thread);
            }

            if dst_core >= 0 {
                self.unsuggest(priority, dst_core, thread);
                self.schedule(priority, dst_core, thread);
            }

            if src_core >= 0 {
                self.suggest(priority, src_core, thread);
            }
        }
    }
}

impl Default for KPriorityQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ---

// KScheduler

// Threads at this priority or more urgent are never migrated to idle cores
const MIGRATION_PRIORITY_THRESHOLD: i32 = 2;

pub struct KScheduler {
    cpu_core: i32,
    selected_thread: Mutex<Option<Arc<KThread>>>,
    needs_scheduling: AtomicBool,
    last_context_switch_instant: Mutex<Instant>,
    total_idle_time: Mutex<Duration>
}

impl KScheduler {
    pub fn new(cpu_core: i32) -> Self {
        Self {
            cpu_core,
            selected_thread: Mutex::new(None),
            needs_scheduling: AtomicBool::new(false),
            last_context_switch_instant: Mutex::new(Instant::now()),
            total_idle_time: Mutex::new(Duration::ZERO)
        }
    }

    #[inline]
    pub fn get_cpu_core(&self) -> i32 {
        self.cpu_core
    }

    pub fn get_selected_thread(&self) -> Option<Arc<KThread>> {
        self.selected_thread.lock().clone()
    }

    pub fn is_selected_thread(&self, thread: &Arc<KThread>) -> bool {
        match self.selected_thread.lock().as_ref() {
            Some(selected_thread) => Arc::ptr_eq(selected_thread, thread),
            None => false
        }
    }

    pub fn get_total_idle_time(&self) -> Duration {
        let total_idle_time = *self.total_idle_time.lock();

        // Include the ongoing idle period
        if self.selected_thread.lock().is_none() {
            total_idle_time + self.last_context_switch_instant.lock().elapsed()
        }
        else {
            total_idle_time
        }
    }

    pub fn take_needs_scheduling(&self) -> bool {
        self.needs_scheduling.swap(false, Ordering::SeqCst)
    }

    fn select_thread(&self, next_thread: Option<Arc<KThread>>) -> u64 {
        let mut prev_selected_thread = self.selected_thread.lock();

        let threads_match = match (next_thread.as_ref(), prev_selected_thread.as_ref()) {
            (Some(next), Some(prev)) => Arc::ptr_eq(next, prev),
            (None, None) => true,
            _ => false
        };

        if threads_match {
            return 0;
        }

        let now = Instant::now();
        let elapsed = {
            let mut last_context_switch_instant = self.last_context_switch_instant.lock();
            let elapsed = now.duration_since(*last_context_switch_instant);
            *last_context_switch_instant = now;
            elapsed
        };

        match prev_selected_thread.as_ref() {
            Some(prev_thread) => prev_thread.add_cpu_time(elapsed),
            None => *self.total_idle_time.lock() += elapsed
        };

        if let Some(next) = next_thread.as_ref() {
            next.set_current_core(self.cpu_core);
            next.set_last_scheduled_time(now);
        }

        if cfg::get_config().log_scheduling {
            let next_id = next_thread.as_ref().map(|thread| thread.id);
            log_line!("Core {} selected thread {:?}", self.cpu_core, next_id);
        }

        *prev_selected_thread = next_thread;
        self.needs_scheduling.store(true, Ordering::SeqCst);
        bit!(self.cpu_core as u64)
    }

    /// Picks the most urgent runnable thread for every core and lets idle cores steal suggested threads.
    /// Returns the mask of cores whose selection changed.
    pub fn select_threads(kernel: &KernelContext) -> u64 {
        if !kernel.take_thread_reselection_request() {
            return 0;
        }

        let mut priority_queue = kernel.get_priority_queue().lock();

        let mut scheduled_cores_mask = 0u64;
        for core in 0..CPU_CORE_COUNT as i32 {
            let thread = priority_queue.get_first_scheduled_thread_for_core(core);
            scheduled_cores_mask |= kernel.get_scheduler(core).select_thread(thread);
        }

        for core in 0..CPU_CORE_COUNT as i32 {
            if priority_queue.has_scheduled_threads_for_core(core) {
                continue;
            }

            let mut dst_thread: Option<Arc<KThread>> = None;
            for suggested_thread in priority_queue.get_suggested_threads_for_core(core) {
                if !suggested_thread.can_migrate() {
                    continue;
                }

                let active_core = suggested_thread.get_active_core();
                let is_selected_on_active_core = (active_core >= 0) && kernel.get_scheduler(active_core).is_selected_thread(&suggested_thread);
                if !is_selected_on_active_core {
                    dst_thread = Some(suggested_thread);
                    break;
                }
            }

            if let Some(dst_thread_v) = dst_thread {
                let dst_priority = dst_thread_v.get_dynamic_priority();
                if dst_priority >= MIGRATION_PRIORITY_THRESHOLD {
                    priority_queue.transfer_thread_to_core(dst_priority, core, &dst_thread_v);
                    scheduled_cores_mask |= kernel.get_scheduler(core).select_thread(Some(dst_thread_v));
                }
            }
        }

        scheduled_cores_mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use crate::kern::thread::{KThread, ThreadInitInfo, ThreadType};
    use crate::kern::KernelContext;

    fn make_thread(kernel: &Arc<KernelContext>, priority: i32, cpu_core: i32) -> Arc<KThread> {
        KThread::new(kernel, ThreadInitInfo::new_dummy("sched-test", priority, cpu_core).with_type(ThreadType::Kernel)).unwrap()
    }

    #[test]
    fn critical_section_is_reentrant() {
        let cs = KCriticalSection::new();
        let releases = AtomicUsize::new(0);

        cs.enter();
        cs.enter();
        assert_eq!(cs.get_recursion_count(), 2);
        assert!(!cs.leave(|| { releases.fetch_add(1, Ordering::SeqCst); }));
        assert!(cs.leave(|| { releases.fetch_add(1, Ordering::SeqCst); }));
        assert_eq!(releases.load(Ordering::SeqCst), 1);

        // Unbalanced leave is a no-op
        assert!(!cs.leave(|| { releases.fetch_add(1, Ordering::SeqCst); }));
        assert_eq!(cs.get_recursion_count(), 0);
    }

    #[test]
    fn critical_section_excludes_other_threads() {
        let cs = Arc::new(KCriticalSection::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4).map(|_| {
            let cs = cs.clone();
            let counter = counter.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    cs.enter();
                    let value = counter.load(Ordering::SeqCst);
                    thread::yield_now();
                    counter.store(value + 1, Ordering::SeqCst);
                    cs.leave(|| {});
                }
            })
        }).collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 800);
    }

    #[test]
    fn leave_from_foreign_thread_is_ignored() {
        let cs = Arc::new(KCriticalSection::new());
        cs.enter();

        let foreign_cs = cs.clone();
        let released = thread::spawn(move || foreign_cs.leave(|| {})).join().unwrap();
        assert!(!released);
        assert_eq!(cs.get_recursion_count(), 1);
        assert!(cs.leave(|| {}));
    }

    #[test]
    fn priority_queue_orders_by_priority() {
        let kernel = KernelContext::new();
        let low = make_thread(&kernel, 40, 0);
        let high = make_thread(&kernel, 10, 0);
        let mid = make_thread(&kernel, 20, 0);

        let mut queue = KPriorityQueue::new();
        queue.schedule(40, 0, &low);
        queue.schedule(10, 0, &high);
        queue.schedule(20, 0, &mid);

        let ids: Vec<u64> = queue.get_scheduled_threads_for_core(0).iter().map(|thread| thread.id).collect();
        assert_eq!(ids, vec![high.id, mid.id, low.id]);
        assert!(Arc::ptr_eq(&queue.get_first_scheduled_thread_for_core(0).unwrap(), &high));

        queue.unschedule(10, 0, &high);
        assert!(Arc::ptr_eq(&queue.get_first_scheduled_thread_for_core(0).unwrap(), &mid));
        assert!(!queue.has_scheduled_threads_for_core(1));
    }

    #[test]
    fn reschedule_moves_thread_to_back() {
        let kernel = KernelContext::new();
        let a = make_thread(&kernel, 30, 1);
        let b = make_thread(&kernel, 30, 1);

        let mut queue = KPriorityQueue::new();
        queue.schedule(30, 1, &a);
        queue.schedule_prepend(30, 1, &b);
        assert!(Arc::ptr_eq(&queue.get_first_scheduled_thread_for_core(1).unwrap(), &b));

        let front = queue.reschedule(30, 1, &b).unwrap();
        assert!(Arc::ptr_eq(&front, &a));
    }

    #[test]
    fn transfer_moves_between_scheduled_and_suggested() {
        let kernel = KernelContext::new();
        let thread = make_thread(&kernel, 20, 0);

        let mut queue = KPriorityQueue::new();
        queue.schedule(20, 0, &thread);
        queue.suggest(20, 2, &thread);

        queue.transfer_thread_to_core(20, 2, &thread);
        assert_eq!(thread.get_active_core(), 2);
        assert!(!queue.has_scheduled_threads_for_core(0));
        assert_eq!(queue.get_suggested_threads_for_core(0).len(), 1);
        assert!(queue.get_suggested_threads_for_core(2).is_empty());
        assert!(Arc::ptr_eq(&queue.get_first_scheduled_thread_for_core(2).unwrap(), &thread));
    }

    #[test]
    fn scheduler_accounts_idle_time() {
        let scheduler = KScheduler::new(3);
        thread::sleep(Duration::from_millis(5));
        assert!(scheduler.get_total_idle_time() >= Duration::from_millis(5));
        assert!(scheduler.get_selected_thread().is_none());
        assert!(!scheduler.take_needs_scheduling());
    }
}

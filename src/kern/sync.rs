use std::sync::Arc;
use std::time::Duration;
use parking_lot::Mutex;
use rsevents::{Awaitable, ManualResetEvent, State};
use crate::result::*;
use crate::result as lib_result;
use super::KernelContext;
use super::thread::try_get_current_thread;
use super::result;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum WaitOutcome {
    Signaled(usize),
    Cancelled,
    Disposed,
    Terminating,
    TimedOut
}

/// Single-slot completion token: the first outcome offered wins, later ones are dropped.
pub struct WaitBlock {
    outcome: Mutex<Option<WaitOutcome>>,
    event: ManualResetEvent
}

impl WaitBlock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            outcome: Mutex::new(None),
            event: ManualResetEvent::new(State::Unset)
        })
    }

    pub fn try_complete(&self, outcome: WaitOutcome) -> bool {
        let mut cur_outcome = self.outcome.lock();
        if cur_outcome.is_some() {
            return false;
        }

        *cur_outcome = Some(outcome);
        self.event.set();
        true
    }

    pub fn get_outcome(&self) -> Option<WaitOutcome> {
        *self.outcome.lock()
    }

    pub fn is_completed(&self) -> bool {
        self.outcome.lock().is_some()
    }

    pub fn wait(&self) {
        self.event.wait();
    }

    pub fn wait_for(&self, timeout: Duration) -> bool {
        self.event.wait_for(timeout)
    }
}

struct SyncState {
    signaled: bool,
    disposed: bool,
    waiters: Vec<(Arc<WaitBlock>, WaitOutcome)>
}

/// Signaled flag plus waiter list shared by everything threads can wait on.
pub struct KSynchronizationBase {
    state: Mutex<SyncState>
}

impl KSynchronizationBase {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SyncState {
                signaled: false,
                disposed: false,
                waiters: Vec::new()
            })
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.state.lock().signaled
    }

    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }

    pub fn get_waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Sets the signaled state and wakes every current waiter. Disposed objects never signal again.
    pub fn signal(&self) {
        let mut state = self.state.lock();
        if state.disposed {
            return;
        }

        state.signaled = true;
        for (wait_block, outcome) in state.waiters.drain(..) {
            wait_block.try_complete(outcome);
        }
    }

    pub fn clear(&self) {
        self.state.lock().signaled = false;
    }

    pub fn clear_if_signaled(&self) -> bool {
        let mut state = self.state.lock();
        let was_signaled = state.signaled;
        state.signaled = false;
        was_signaled
    }

    pub fn dispose(&self) {
        let mut state = self.state.lock();
        state.disposed = true;
        state.signaled = false;
        for (wait_block, _) in state.waiters.drain(..) {
            wait_block.try_complete(WaitOutcome::Disposed);
        }
    }

    /// Registers a waiter which receives `outcome` once signaled.
    /// A waiter registered on a signaled object completes right away, so a signal between polling and waiting is never missed.
    pub fn register_waiter(&self, wait_block: &Arc<WaitBlock>, outcome: WaitOutcome) {
        let mut state = self.state.lock();
        if state.disposed {
            wait_block.try_complete(WaitOutcome::Disposed);
        }
        else if state.signaled {
            wait_block.try_complete(outcome);
        }
        else {
            state.waiters.push((wait_block.clone(), outcome));
        }
    }

    pub fn unregister_waiter(&self, wait_block: &Arc<WaitBlock>) {
        self.state.lock().waiters.retain(|(w_block, _)| !Arc::ptr_eq(w_block, wait_block));
    }

    /// Blocks the calling host thread until the object is signaled. Returns false on timeout or disposal.
    pub fn wait_signaled(&self, timeout: Option<Duration>) -> bool {
        let wait_block = WaitBlock::new();
        self.register_waiter(&wait_block, WaitOutcome::Signaled(0));

        let completed = match timeout {
            Some(timeout_v) => wait_block.wait_for(timeout_v),
            None => {
                wait_block.wait();
                true
            }
        };

        self.unregister_waiter(&wait_block);
        completed && (wait_block.get_outcome() == Some(WaitOutcome::Signaled(0)))
    }
}

impl Default for KSynchronizationBase {
    fn default() -> Self {
        Self::new()
    }
}

pub trait KSynchronizationObject: Send + Sync {
    fn get_sync_base(&self) -> &KSynchronizationBase;

    fn is_signaled(&self) -> bool {
        self.get_sync_base().is_signaled()
    }
}

// KSynchronization

pub struct KSynchronization;

impl KSynchronization {
    fn find_signaled(objs: &[Arc<dyn KSynchronizationObject>]) -> Option<usize> {
        objs.iter().position(|obj| obj.is_signaled())
    }

    fn block(wait_block: &WaitBlock, timeout_ns: i64) {
        if timeout_ns < 0 {
            wait_block.wait();
            return;
        }

        let timeout_ms = (timeout_ns / 1_000_000) as u64;
        if timeout_ms == 0 {
            // Truncated to zero: still give other threads a chance to run once
            std::thread::yield_now();
        }
        else {
            wait_block.wait_for(Duration::from_millis(timeout_ms));
        }

        wait_block.try_complete(WaitOutcome::TimedOut);
    }

    /// Waits for any of `objs` to become signaled, returning the lowest signaled index.
    /// A negative timeout waits forever, a zero timeout only polls.
    pub fn wait_for(kernel: &KernelContext, objs: &[Arc<dyn KSynchronizationObject>], timeout_ns: i64) -> Result<usize> {
        let cur_thread = try_get_current_thread();

        let wait_block = {
            let _guard = kernel.make_critical_section_guard();

            if let Some(idx) = Self::find_signaled(objs) {
                return Ok(idx);
            }

            result_return_if!(timeout_ns == 0, result::ResultTimedOut);

            if let Some(thread) = cur_thread.as_ref() {
                result_return_if!(thread.is_termination_requested(), result::ResultTerminationRequested);

                if thread.get_cancel_signal().clear_if_signaled() {
                    return result::ResultCancelled::make_err();
                }
            }

            let wait_block = WaitBlock::new();
            for (i, obj) in objs.iter().enumerate() {
                obj.get_sync_base().register_waiter(&wait_block, WaitOutcome::Signaled(i));
            }

            if let Some(thread) = cur_thread.as_ref() {
                thread.get_cancel_signal().register_waiter(&wait_block, WaitOutcome::Cancelled);
                thread.begin_wait(wait_block.clone());
            }

            wait_block
        };

        Self::block(&wait_block, timeout_ns);

        let outcome = {
            let _guard = kernel.make_critical_section_guard();

            for obj in objs {
                obj.get_sync_base().unregister_waiter(&wait_block);
            }

            if let Some(thread) = cur_thread.as_ref() {
                thread.get_cancel_signal().unregister_waiter(&wait_block);
                thread.end_wait();
            }

            wait_block.get_outcome().unwrap_or(WaitOutcome::TimedOut)
        };

        match outcome {
            WaitOutcome::Signaled(idx) => Ok(idx),
            WaitOutcome::TimedOut => result::ResultTimedOut::make_err(),
            WaitOutcome::Cancelled => {
                if let Some(thread) = cur_thread.as_ref() {
                    thread.get_cancel_signal().clear();
                }
                result::ResultCancelled::make_err()
            },
            WaitOutcome::Disposed => lib_result::ResultObjectDisposed::make_err(),
            WaitOutcome::Terminating => result::ResultTerminationRequested::make_err()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;
    use crate::kern::event::KEvent;

    fn as_sync_objs(events: &[Arc<KEvent>]) -> Vec<Arc<dyn KSynchronizationObject>> {
        events.iter().map(|event| event.readable.clone() as Arc<dyn KSynchronizationObject>).collect()
    }

    #[test]
    fn lowest_signaled_index_wins() {
        let kernel = KernelContext::new();
        let events: Vec<Arc<KEvent>> = (0..3).map(|_| KEvent::new(&kernel)).collect();
        events[2].writable.signal();
        events[1].writable.signal();

        let objs = as_sync_objs(&events);
        assert_eq!(KSynchronization::wait_for(&kernel, &objs, 0).unwrap(), 1);
    }

    #[test]
    fn zero_timeout_polls() {
        let kernel = KernelContext::new();
        let events: Vec<Arc<KEvent>> = (0..2).map(|_| KEvent::new(&kernel)).collect();

        let rc = KSynchronization::wait_for(&kernel, &as_sync_objs(&events), 0).unwrap_err();
        assert!(result::ResultTimedOut::matches(rc));
    }

    #[test]
    fn sub_millisecond_timeout_still_times_out() {
        let kernel = KernelContext::new();
        let events = vec![KEvent::new(&kernel)];

        let rc = KSynchronization::wait_for(&kernel, &as_sync_objs(&events), 500_000).unwrap_err();
        assert!(result::ResultTimedOut::matches(rc));
        assert_eq!(events[0].readable.get_sync_base().get_waiter_count(), 0);
    }

    #[test]
    fn timeout_elapses() {
        let kernel = KernelContext::new();
        let events = vec![KEvent::new(&kernel)];

        let start = Instant::now();
        let rc = KSynchronization::wait_for(&kernel, &as_sync_objs(&events), 20_000_000).unwrap_err();
        assert!(result::ResultTimedOut::matches(rc));
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn signal_from_other_thread_wakes_waiter() {
        let kernel = KernelContext::new();
        let events: Vec<Arc<KEvent>> = (0..3).map(|_| KEvent::new(&kernel)).collect();

        let signaler_event = events[2].clone();
        let signaler = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaler_event.writable.signal();
        });

        assert_eq!(KSynchronization::wait_for(&kernel, &as_sync_objs(&events), -1).unwrap(), 2);
        signaler.join().unwrap();
    }

    #[test]
    fn disposed_object_releases_waiters() {
        let base = Arc::new(KSynchronizationBase::new());

        let disposer_base = base.clone();
        let disposer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            disposer_base.dispose();
        });

        assert!(!base.wait_signaled(None));
        disposer.join().unwrap();

        // Disposed objects never signal again
        base.signal();
        assert!(!base.is_signaled());
    }

    #[test]
    fn wait_block_keeps_first_outcome() {
        let wait_block = WaitBlock::new();
        assert!(wait_block.try_complete(WaitOutcome::Signaled(3)));
        assert!(!wait_block.try_complete(WaitOutcome::TimedOut));
        assert_eq!(wait_block.get_outcome(), Some(WaitOutcome::Signaled(3)));
        assert!(wait_block.wait_for(Duration::from_millis(1)));
    }
}

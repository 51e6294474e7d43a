use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::Builder;
use std::time::{Duration, Instant};
use parking_lot::Mutex;
use rsevents::{Awaitable, AutoResetEvent, State};
use crate::result::*;
use crate::util::convert_io_result;

pub trait KFutureSchedulerObject: Send + Sync {
    fn time_up(self: Arc<Self>);
}

struct WaitingObject {
    obj: Arc<dyn KFutureSchedulerObject>,
    deadline: Instant
}

struct TimeManagerState {
    waiting_objects: Mutex<Vec<WaitingObject>>,
    wait_event: AutoResetEvent,
    keep_running: AtomicBool
}

#[inline]
fn obj_addr<T: ?Sized>(obj: &T) -> *const () {
    obj as *const T as *const ()
}

pub struct KTimeManager {
    state: Arc<TimeManagerState>
}

impl KTimeManager {
    pub fn new() -> Result<Self> {
        let state = Arc::new(TimeManagerState {
            waiting_objects: Mutex::new(Vec::new()),
            wait_event: AutoResetEvent::new(State::Unset),
            keep_running: AtomicBool::new(true)
        });

        let worker_state = state.clone();
        convert_io_result(Builder::new().name(String::from("kcore.kern.KTimeManager")).spawn(move || {
            Self::wait_thread_fn(worker_state);
        }))?;

        Ok(Self {
            state
        })
    }

    fn wait_thread_fn(state: Arc<TimeManagerState>) {
        while state.keep_running.load(Ordering::SeqCst) {
            let now = Instant::now();

            let (expired, next_deadline) = {
                let mut waiting_objects = state.waiting_objects.lock();

                let mut expired: Vec<Arc<dyn KFutureSchedulerObject>> = Vec::new();
                waiting_objects.retain(|w_obj| {
                    if w_obj.deadline <= now {
                        expired.push(w_obj.obj.clone());
                        false
                    }
                    else {
                        true
                    }
                });

                (expired, waiting_objects.iter().map(|w_obj| w_obj.deadline).min())
            };

            // Callbacks may schedule new invocations, so they run with the list unlocked
            for obj in expired {
                obj.time_up();
            }

            match next_deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if deadline > now {
                        state.wait_event.wait_for(deadline - now);
                    }
                },
                None => state.wait_event.wait()
            };
        }
    }

    pub fn schedule_future_invocation(&self, obj: Arc<dyn KFutureSchedulerObject>, timeout_ns: i64) {
        let timeout = Duration::from_nanos(timeout_ns.max(0) as u64);
        let deadline = Instant::now().checked_add(timeout).unwrap_or_else(|| Instant::now() + Duration::from_secs(u32::MAX as u64));

        self.state.waiting_objects.lock().push(WaitingObject {
            obj,
            deadline
        });
        self.state.wait_event.set();
    }

    pub fn unschedule_future_invocation<T: ?Sized>(&self, obj: &T) {
        let addr = obj_addr(obj);
        self.state.waiting_objects.lock().retain(|w_obj| obj_addr(w_obj.obj.as_ref()) != addr);
    }

    pub fn get_pending_count(&self) -> usize {
        self.state.waiting_objects.lock().len()
    }
}

impl Drop for KTimeManager {
    fn drop(&mut self) {
        self.state.keep_running.store(false, Ordering::SeqCst);
        self.state.waiting_objects.lock().clear();
        self.state.wait_event.set();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use rsevents::ManualResetEvent;

    struct Counter {
        hits: AtomicUsize,
        fired: ManualResetEvent
    }

    impl KFutureSchedulerObject for Counter {
        fn time_up(self: Arc<Self>) {
            self.hits.fetch_add(1, Ordering::SeqCst);
            self.fired.set();
        }
    }

    fn make_counter() -> Arc<Counter> {
        Arc::new(Counter {
            hits: AtomicUsize::new(0),
            fired: ManualResetEvent::new(State::Unset)
        })
    }

    #[test]
    fn fires_after_deadline() {
        let time_manager = KTimeManager::new().unwrap();
        let counter = make_counter();

        let start = Instant::now();
        time_manager.schedule_future_invocation(counter.clone(), 10_000_000);
        assert!(counter.fired.wait_for(Duration::from_secs(5)));
        assert!(start.elapsed() >= Duration::from_millis(10));
        assert_eq!(counter.hits.load(Ordering::SeqCst), 1);
        assert_eq!(time_manager.get_pending_count(), 0);
    }

    #[test]
    fn unscheduled_object_never_fires() {
        let time_manager = KTimeManager::new().unwrap();
        let counter = make_counter();

        time_manager.schedule_future_invocation(counter.clone(), 50_000_000);
        assert_eq!(time_manager.get_pending_count(), 1);
        time_manager.unschedule_future_invocation(counter.as_ref());
        assert_eq!(time_manager.get_pending_count(), 0);

        assert!(!counter.fired.wait_for(Duration::from_millis(100)));
        assert_eq!(counter.hits.load(Ordering::SeqCst), 0);
    }
}

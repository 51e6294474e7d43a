use std::sync::Arc;
use crate::result::*;
use super::KernelContext;
use super::sync::{KSynchronizationBase, KSynchronizationObject};
use super::result;

// KReadableEvent

pub struct KReadableEvent {
    kernel: Arc<KernelContext>,
    sync_base: KSynchronizationBase
}

impl KSynchronizationObject for KReadableEvent {
    fn get_sync_base(&self) -> &KSynchronizationBase {
        &self.sync_base
    }
}

impl KReadableEvent {
    pub fn new(kernel: &Arc<KernelContext>) -> Arc<Self> {
        Arc::new(Self {
            kernel: kernel.clone(),
            sync_base: KSynchronizationBase::new()
        })
    }

    pub fn signal(&self) {
        let _guard = self.kernel.make_critical_section_guard();

        if !self.sync_base.is_signaled() {
            self.sync_base.signal();
        }
    }

    pub fn clear(&self) {
        self.sync_base.clear();
    }

    pub fn clear_if_signaled(&self) -> Result<()> {
        let _guard = self.kernel.make_critical_section_guard();

        result_return_unless!(self.sync_base.clear_if_signaled(), result::ResultInvalidState);
        Ok(())
    }

    /// Releases every waiter with a disposed outcome. Nothing can signal the event afterwards.
    pub fn dispose(&self) {
        let _guard = self.kernel.make_critical_section_guard();

        self.sync_base.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.sync_base.is_disposed()
    }
}

// KWritableEvent

pub struct KWritableEvent {
    readable: Arc<KReadableEvent>
}

impl KWritableEvent {
    pub fn signal(&self) {
        self.readable.signal();
    }

    pub fn clear(&self) {
        self.readable.clear();
    }

    pub fn get_readable_event(&self) -> &Arc<KReadableEvent> {
        &self.readable
    }
}

impl Drop for KWritableEvent {
    fn drop(&mut self) {
        // Without a writable side the event can never be signaled again
        self.readable.dispose();
    }
}

// KEvent

pub struct KEvent {
    pub readable: Arc<KReadableEvent>,
    pub writable: Arc<KWritableEvent>
}

impl KEvent {
    pub fn new(kernel: &Arc<KernelContext>) -> Arc<Self> {
        let readable = KReadableEvent::new(kernel);
        let writable = Arc::new(KWritableEvent {
            readable: readable.clone()
        });

        Arc::new(Self {
            readable,
            writable
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;
    use crate::kern::sync::KSynchronization;

    #[test]
    fn signal_and_clear() {
        let kernel = KernelContext::new();
        let event = KEvent::new(&kernel);
        assert!(!event.readable.is_signaled());

        event.writable.signal();
        assert!(event.readable.is_signaled());

        // Signaling twice keeps a single signaled state
        event.writable.signal();
        event.writable.clear();
        assert!(!event.readable.is_signaled());
    }

    #[test]
    fn clear_if_signaled_requires_signal() {
        let kernel = KernelContext::new();
        let event = KEvent::new(&kernel);

        let rc = event.readable.clear_if_signaled().unwrap_err();
        assert!(result::ResultInvalidState::matches(rc));

        event.writable.signal();
        event.readable.clear_if_signaled().unwrap();
        assert!(!event.readable.is_signaled());
    }

    #[test]
    fn dropping_writable_side_releases_waiters() {
        let kernel = KernelContext::new();
        let event = KEvent::new(&kernel);
        let readable = event.readable.clone();

        let waiter_kernel = kernel.clone();
        let waiter_readable = readable.clone();
        let waiter = thread::spawn(move || {
            let objs: Vec<Arc<dyn KSynchronizationObject>> = vec![waiter_readable];
            KSynchronization::wait_for(&waiter_kernel, &objs, -1)
        });

        while readable.get_sync_base().get_waiter_count() == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        drop(event);

        let rc = waiter.join().unwrap().unwrap_err();
        assert!(ResultObjectDisposed::matches(rc));
        assert!(readable.is_disposed());
        assert!(!readable.is_signaled());

        // Later waits fail right away instead of blocking forever
        let objs: Vec<Arc<dyn KSynchronizationObject>> = vec![readable.clone()];
        let rc = KSynchronization::wait_for(&kernel, &objs, -1).unwrap_err();
        assert!(ResultObjectDisposed::matches(rc));
    }
}

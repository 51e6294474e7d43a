use std::sync::Arc;
use std::time::Duration;
use scopeguard::{guard, ScopeGuard};
use crate::result::*;
use super::KernelContext;
use super::proc::{KObjectRef, KProcess, try_get_current_process};
use super::event::KEvent;
use super::sync::{KSynchronization, KSynchronizationObject};
use super::thread::{KThread, ThreadInitInfo, try_get_current_thread};
use super::result;

pub use super::Handle;

pub const INVALID_HANDLE: Handle = 0;
pub const CURRENT_THREAD_PSEUDO_HANDLE: Handle = 0xFFFF8000;
pub const CURRENT_PROCESS_PSEUDO_HANDLE: Handle = 0xFFFF8001;

pub const MAX_WAIT_OBJECT_COUNT: usize = 0x40;

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum LimitableResource {
    PhysicalMemory = 0,
    Thread = 1,
    Event = 2,
    TransferMemory = 3,
    Session = 4
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum SvcId {
    CreateThread = 0x08,
    StartThread = 0x09,
    ExitThread = 0x0A,
    SleepThread = 0x0B,
    GetThreadPriority = 0x0C,
    SetThreadPriority = 0x0D,
    SignalEvent = 0x11,
    ClearEvent = 0x12,
    CloseHandle = 0x16,
    ResetSignal = 0x17,
    WaitSynchronization = 0x18,
    CancelSynchronization = 0x19,
    GetThreadId = 0x25,
    SetThreadActivity = 0x32,
    CreateEvent = 0x45
}

impl SvcId {
    pub const fn from(raw: u8) -> Option<Self> {
        let svc_id = match raw {
            0x08 => Self::CreateThread,
            0x09 => Self::StartThread,
            0x0A => Self::ExitThread,
            0x0B => Self::SleepThread,
            0x0C => Self::GetThreadPriority,
            0x0D => Self::SetThreadPriority,
            0x11 => Self::SignalEvent,
            0x12 => Self::ClearEvent,
            0x16 => Self::CloseHandle,
            0x17 => Self::ResetSignal,
            0x18 => Self::WaitSynchronization,
            0x19 => Self::CancelSynchronization,
            0x25 => Self::GetThreadId,
            0x32 => Self::SetThreadActivity,
            0x45 => Self::CreateEvent,
            _ => return None
        };

        Some(svc_id)
    }
}

fn get_current_process() -> Result<Arc<KProcess>> {
    match try_get_current_process() {
        Some(process) => Ok(process),
        None => result::ResultInvalidHandle::make_err()
    }
}

fn get_current_thread() -> Result<Arc<KThread>> {
    match try_get_current_thread() {
        Some(thread) => Ok(thread),
        None => result::ResultInvalidHandle::make_err()
    }
}

fn get_current_kernel() -> Result<Arc<KernelContext>> {
    Ok(get_current_thread()?.get_kernel().clone())
}

// Note: the actual impl of SVCs would have (ptr, size) for args/bufs, but slices make this way easier here

pub fn create_thread(entry: u64, arg: u64, stack_top: u64, priority: i32, cpu_core: i32) -> Result<Handle> {
    let process = get_current_process()?;
    result_return_unless!(process.is_priority_allowed(priority), result::ResultInvalidPriority);

    let host_thread_name = format!("{}.Thread@{:#X}", process.name, entry);
    let thread = KThread::new(process.get_kernel(), ThreadInitInfo::new_guest(&host_thread_name, entry, arg, stack_top, priority, cpu_core).with_owner(&process))?;

    let add_fail_guard = guard(thread.clone(), |thread| {
        thread.exit();
    });
    let handle = process.get_handle_table().add(KObjectRef::Thread(thread))?;

    ScopeGuard::into_inner(add_fail_guard);
    Ok(handle)
}

pub fn start_thread(handle: Handle) -> Result<()> {
    let thread = get_current_process()?.get_handle_table().get_thread(handle)?;
    thread.start()
}

pub fn exit_thread() -> Result<()> {
    get_current_thread()?.exit();
    Ok(())
}

pub fn sleep_thread(timeout: i64) -> Result<()> {
    let thread = match try_get_current_thread() {
        Some(thread) => thread,
        None => {
            // Plain host threads just sleep
            if timeout > 0 {
                std::thread::sleep(Duration::from_nanos(timeout as u64));
            }
            else {
                std::thread::yield_now();
            }
            return Ok(());
        }
    };

    match timeout {
        // Yield, YieldWithLoadBalancing and YieldToAnyThread all end up being plain yields here
        0 | -1 | -2 => {
            thread.yield_execution();
            Ok(())
        },
        timeout => thread.sleep(timeout)
    }
}

pub fn get_thread_priority(handle: Handle) -> Result<i32> {
    let thread = get_current_process()?.get_handle_table().get_thread(handle)?;
    Ok(thread.get_dynamic_priority())
}

pub fn set_thread_priority(handle: Handle, priority: i32) -> Result<()> {
    let process = get_current_process()?;
    result_return_unless!(process.is_priority_allowed(priority), result::ResultInvalidPriority);

    let thread = process.get_handle_table().get_thread(handle)?;
    thread.set_priority(priority);
    Ok(())
}

pub fn signal_event(handle: Handle) -> Result<()> {
    let event = get_current_process()?.get_handle_table().get_writable_event(handle)?;
    event.signal();
    Ok(())
}

pub fn clear_event(handle: Handle) -> Result<()> {
    let process = get_current_process()?;

    match process.get_handle_table().get_object(handle)? {
        KObjectRef::WritableEvent(event) => event.clear(),
        KObjectRef::ReadableEvent(event) => event.clear(),
        _ => return result::ResultInvalidHandle::make_err()
    };

    Ok(())
}

pub fn close_handle(handle: Handle) -> Result<()> {
    get_current_process()?.get_handle_table().close_handle(handle)
}

pub fn reset_signal(handle: Handle) -> Result<()> {
    let event = get_current_process()?.get_handle_table().get_readable_event(handle)?;
    event.clear_if_signaled()
}

pub fn wait_synchronization(handles: &[Handle], timeout: i64) -> Result<usize> {
    result_return_unless!(handles.len() <= MAX_WAIT_OBJECT_COUNT, result::ResultOutOfRange);

    let process = get_current_process()?;
    let mut sync_objs: Vec<Arc<dyn KSynchronizationObject>> = Vec::with_capacity(handles.len());
    for handle in handles {
        sync_objs.push(process.get_handle_table().get_sync_object(*handle)?);
    }

    KSynchronization::wait_for(process.get_kernel(), &sync_objs, timeout)
}

pub fn cancel_synchronization(handle: Handle) -> Result<()> {
    let thread = get_current_process()?.get_handle_table().get_thread(handle)?;
    thread.cancel_synchronization();
    Ok(())
}

pub fn get_thread_id(handle: Handle) -> Result<u64> {
    let thread = get_current_process()?.get_handle_table().get_thread(handle)?;
    Ok(thread.id)
}

pub fn set_thread_activity(handle: Handle, pause: bool) -> Result<()> {
    let thread = get_current_process()?.get_handle_table().get_thread(handle)?;

    let cur_thread = get_current_thread()?;
    result_return_if!(Arc::ptr_eq(&thread, &cur_thread), result::ResultBusy);

    thread.set_activity(pause)
}

/// Returns the (writable, readable) handle pair.
pub fn create_event() -> Result<(Handle, Handle)> {
    let process = get_current_process()?;
    let event = KEvent::new(&get_current_kernel()?);

    let writable_handle = process.get_handle_table().add(KObjectRef::WritableEvent(event.writable.clone()))?;

    let add_readable_fail_guard = guard((), |()| {
        let _ = process.get_handle_table().close_handle(writable_handle);
    });

    let readable_handle = process.get_handle_table().add(KObjectRef::ReadableEvent(event.readable.clone()))?;

    ScopeGuard::into_inner(add_readable_fail_guard);
    Ok((writable_handle, readable_handle))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use crate::emu::cfg::Config;
    use crate::kern::thread::{reset_current_thread, set_current_thread};

    struct TestContext {
        process: Arc<KProcess>,
        thread: Arc<KThread>
    }

    impl TestContext {
        fn new() -> Self {
            let kernel = KernelContext::new();
            kernel.initialize();

            let process = KProcess::new(&kernel, "svc-test", Config::default()).unwrap();
            let thread = KThread::new(&kernel, ThreadInitInfo::new_dummy("svc-main", 44, 0).with_owner(&process)).unwrap();
            set_current_thread(thread.clone());

            Self {
                process,
                thread
            }
        }
    }

    impl Drop for TestContext {
        fn drop(&mut self) {
            reset_current_thread();
        }
    }

    #[test]
    fn svcs_need_a_current_process() {
        let rc = create_event().unwrap_err();
        assert!(result::ResultInvalidHandle::matches(rc));

        // Sleeping works for any host thread though
        sleep_thread(1_000).unwrap();
    }

    #[test]
    fn event_lifecycle() {
        let _ctx = TestContext::new();

        let (writable_handle, readable_handle) = create_event().unwrap();
        let rc = wait_synchronization(&[readable_handle], 0).unwrap_err();
        assert!(result::ResultTimedOut::matches(rc));

        signal_event(writable_handle).unwrap();
        assert_eq!(wait_synchronization(&[readable_handle], -1).unwrap(), 0);

        reset_signal(readable_handle).unwrap();
        let rc = reset_signal(readable_handle).unwrap_err();
        assert!(result::ResultInvalidState::matches(rc));

        // Only the writable side can be signaled, and only the readable side can be waited on
        let rc = signal_event(readable_handle).unwrap_err();
        assert!(result::ResultInvalidHandle::matches(rc));
        let rc = wait_synchronization(&[writable_handle], 0).unwrap_err();
        assert!(result::ResultInvalidHandle::matches(rc));

        signal_event(writable_handle).unwrap();
        clear_event(readable_handle).unwrap();
        let rc = wait_synchronization(&[readable_handle], 0).unwrap_err();
        assert!(result::ResultTimedOut::matches(rc));

        close_handle(writable_handle).unwrap();
        close_handle(readable_handle).unwrap();
        let rc = close_handle(readable_handle).unwrap_err();
        assert!(result::ResultInvalidHandle::matches(rc));
    }

    #[test]
    fn wait_synchronization_limits_handle_count() {
        let _ctx = TestContext::new();

        let handles = vec![INVALID_HANDLE; MAX_WAIT_OBJECT_COUNT + 1];
        let rc = wait_synchronization(&handles, 0).unwrap_err();
        assert!(result::ResultOutOfRange::matches(rc));
    }

    #[test]
    fn current_thread_pseudo_handle() {
        let ctx = TestContext::new();

        assert_eq!(get_thread_id(CURRENT_THREAD_PSEUDO_HANDLE).unwrap(), ctx.thread.id);
        assert_eq!(get_thread_priority(CURRENT_THREAD_PSEUDO_HANDLE).unwrap(), 44);

        set_thread_priority(CURRENT_THREAD_PSEUDO_HANDLE, 30).unwrap();
        assert_eq!(ctx.thread.get_base_priority(), 30);

        let rc = set_thread_priority(CURRENT_THREAD_PSEUDO_HANDLE, 10).unwrap_err();
        assert!(result::ResultInvalidPriority::matches(rc));

        let rc = set_thread_activity(CURRENT_THREAD_PSEUDO_HANDLE, true).unwrap_err();
        assert!(result::ResultBusy::matches(rc));
    }

    #[test]
    fn sleep_thread_waits_and_yields() {
        let _ctx = TestContext::new();

        let start = Instant::now();
        sleep_thread(10_000_000).unwrap();
        assert!(start.elapsed() >= Duration::from_millis(10));

        sleep_thread(0).unwrap();
        sleep_thread(-1).unwrap();
        sleep_thread(-2).unwrap();
    }

    #[test]
    fn guest_thread_roundtrip() {
        let ctx = TestContext::new();

        ctx.process.get_cpu_context().register_program(0x8000_0000, |guest_ctx| {
            let arg = guest_ctx.get_x(0);
            guest_ctx.set_x(1, arg + 1);
            guest_ctx.svc(SvcId::ExitThread)?;
            Ok(())
        });

        let rc = create_thread(0x8000_0000, 7, 0x2000, 10, 0).unwrap_err();
        assert!(result::ResultInvalidPriority::matches(rc));
        let rc = create_thread(0x8000_0000, 7, 0x2000, 44, 9).unwrap_err();
        assert!(result::ResultInvalidCoreId::matches(rc));

        let thread_handle = create_thread(0x8000_0000, 7, 0x2000, 44, 1).unwrap();
        let thread = ctx.process.get_handle_table().get_thread(thread_handle).unwrap();
        assert_eq!(get_thread_id(thread_handle).unwrap(), thread.id);

        start_thread(thread_handle).unwrap();
        assert_eq!(wait_synchronization(&[thread_handle], -1).unwrap(), 0);
        thread.join().unwrap();

        assert_eq!(thread.get_execution_handle().get_context().get_x(1), 8);
        close_handle(thread_handle).unwrap();
    }

    #[test]
    fn cancel_synchronization_before_wait() {
        let ctx = TestContext::new();

        let (_, readable_handle) = create_event().unwrap();
        cancel_synchronization(CURRENT_THREAD_PSEUDO_HANDLE).unwrap();
        let rc = wait_synchronization(&[readable_handle], 1_000_000).unwrap_err();
        assert!(result::ResultCancelled::matches(rc));
        assert!(!ctx.thread.get_cancel_signal().is_signaled());
    }
}

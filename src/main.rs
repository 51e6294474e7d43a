// For bit_enum enum names
#![allow(non_snake_case)]

use backtrace::Backtrace;
use std::panic;
use std::process;
use std::sync::Arc;
use kcore::emu::cfg;
use kcore::kern::KernelContext;
use kcore::kern::event::KEvent;
use kcore::kern::proc::KProcess;
use kcore::kern::svc::SvcId;
use kcore::kern::sync::{KSynchronization, KSynchronizationObject};
use kcore::kern::thread::{KThread, ThreadInitInfo, try_get_current_thread};
use kcore::mem::PageTableMemoryManager;
use kcore::mem::multi::MultiRegion;
use kcore::mem::tracking::MemoryTracking;
use kcore::util::make_log_guard;
use kcore::log_line;

const GUEST_ENTRY: u64 = 0x8000_0000;
const GUEST_SLEEP_NS: u64 = 1_000_000;
const TRACKED_PAGE_COUNT: u64 = 16;

fn run_threads(kernel: &Arc<KernelContext>) {
    let process = KProcess::new(kernel, "kcore.demo", cfg::get_config()).unwrap();

    process.get_cpu_context().register_program(GUEST_ENTRY, |ctx| {
        for _ in 0..ctx.get_x(0) {
            ctx.set_x(0, GUEST_SLEEP_NS);
            if !ctx.svc(SvcId::SleepThread)? {
                return Ok(());
            }
        }

        ctx.svc(SvcId::ExitThread)?;
        Ok(())
    });

    let guest_thread = KThread::new(kernel, ThreadInitInfo::new_guest("guest.MainThread", GUEST_ENTRY, 4, 0x10000, 44, 0).with_owner(&process)).unwrap();

    let event = KEvent::new(kernel);
    let waiter_kernel = kernel.clone();
    let waiter_event = event.readable.clone();
    let waiter_thread = KThread::new(kernel, ThreadInitInfo::new_host("host.Waiter", move || {
        let objs: Vec<Arc<dyn KSynchronizationObject>> = vec![waiter_event];
        match KSynchronization::wait_for(&waiter_kernel, &objs, -1) {
            Ok(idx) => log_line!("Object {} got signaled", idx),
            Err(rc) => log_line!("Wait failed: {:?}", rc)
        };
    }, 40, 1).with_owner(&process)).unwrap();

    let signaler_event = event.writable.clone();
    let signaler_thread = KThread::new(kernel, ThreadInitInfo::new_host("host.Signaler", move || {
        if let Some(thread) = try_get_current_thread() {
            let _ = thread.sleep(5 * GUEST_SLEEP_NS as i64);
        }
        log_line!("Signaling event...");
        signaler_event.signal();
    }, 42, 2).with_owner(&process)).unwrap();

    for thread in [&guest_thread, &waiter_thread, &signaler_thread] {
        thread.start().unwrap();
    }
    for thread in [&guest_thread, &waiter_thread, &signaler_thread] {
        thread.join().unwrap();
        log_line!("Thread {} ('{}') finished, cpu time {:?}", thread.id, thread.get_host_name(), thread.get_cpu_time());
    }

    log_line!("Process '{}' has {} threads left, total idle time {:?}", process.name, process.get_thread_count(), kernel.get_total_idle_time());
}

fn run_tracking() {
    let page_size = cfg::get_config().tracking_page_size;
    let mm = Arc::new(PageTableMemoryManager::new(page_size));
    mm.map(0, page_size * TRACKED_PAGE_COUNT);

    let tracking = MemoryTracking::from_config(mm.clone()).unwrap();
    let handle = tracking.begin_granular_tracking(0, page_size * TRACKED_PAGE_COUNT, None, page_size, 0).unwrap();
    handle.query_modified_all(&mut |_, _| {}).unwrap();

    for page in [3, 4, 9, 15, 4] {
        let trapped = mm.simulate_access(&tracking, page * page_size + 0x10, 8, true).unwrap();
        log_line!("Write to page {} trapped: {}", page, trapped);
    }

    handle.query_modified_all(&mut |address, size| log_line!("Modified range {:#X} (size {:#X})", address, size)).unwrap();
    log_line!("Tracking {} regions, {} reprotects", tracking.get_region_count(), mm.get_reprotect_count());
}

fn main() {
    let orig_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = Backtrace::new();

        // Guard to prevent other thread logs to mix with the panic printing
        let _guard = make_log_guard();

        orig_hook(panic_info);
        println!();

        if let Some(thread) = try_get_current_thread() {
            println!(" ---- Thread/process info ----");
            println!();

            match thread.get_owner_process() {
                Some(proc) => {
                    println!("* Process name: '{}'", proc.name);
                    println!("* Process ID: {:#X}", proc.id);
                },
                None => println!("* Not a process...")
            };

            println!("* Thread ID: {:#X}", thread.id);
            println!("* Host thread name: '{}'", thread.get_host_name());
            println!("* Scheduling state: {:?}", thread.get_sched_flags());
            println!();
        }

        println!(" ---- Emulator backtrace ----");
        println!();
        println!("{:?}", backtrace);

        // Exit everything, panic = unrecoverable error
        println!("Exiting...");
        process::exit(1);
    }));

    cfg::initialize().unwrap();

    let kernel = KernelContext::new();
    kernel.initialize();

    run_threads(&kernel);
    run_tracking();
}

use crate::emu::cpu::{self, GuestContext};
use crate::kern::svc::{self, Handle, SvcId};
use crate::result::*;

pub type SvcHandlerFn = fn(&GuestContext) -> Result<()>;

pub const MAX_PACKED_HANDLES: usize = cpu::V_REGISTER_COUNT * 4;

// Guest code has no addressable memory here, so handle arrays travel packed in the vector registers (4 per register)

pub fn pack_handles(handles: &[Handle]) -> Vec<u128> {
    handles.chunks(4).map(|chunk| {
        let mut value = 0u128;
        for (i, handle) in chunk.iter().enumerate() {
            value |= (*handle as u128) << (i * 32);
        }
        value
    }).collect()
}

fn read_packed_handles(ctx: &GuestContext, count: usize) -> Result<Vec<Handle>> {
    result_return_if!(count > MAX_PACKED_HANDLES, cpu::result::ResultInvalidRegister);

    let mut handles: Vec<Handle> = Vec::with_capacity(count);
    for i in 0..count {
        let packed = ctx.get_v(i / 4);
        handles.push((packed >> ((i % 4) * 32)) as Handle);
    }
    Ok(handles)
}

fn do_create_thread(ctx: &GuestContext) -> Result<()> {
    let entry = ctx.get_x(1);
    let arg = ctx.get_x(2);
    let stack_top = ctx.get_x(3);
    let priority = ctx.get_w(4) as i32;
    let cpu_core = ctx.get_w(5) as i32;

    match svc::create_thread(entry, arg, stack_top, priority, cpu_core) {
        Ok(handle) => {
            ctx.set_w(0, ResultSuccess::make().get_value());
            ctx.set_w(1, handle);
        },
        Err(rc) => ctx.set_w(0, rc.get_value())
    };

    Ok(())
}

fn do_start_thread(ctx: &GuestContext) -> Result<()> {
    let handle: Handle = ctx.get_w(0);

    let rc = ResultCode::from(svc::start_thread(handle));
    ctx.set_w(0, rc.get_value());
    Ok(())
}

fn do_exit_thread(ctx: &GuestContext) -> Result<()> {
    let rc = ResultCode::from(svc::exit_thread());
    ctx.set_w(0, rc.get_value());
    Ok(())
}

fn do_sleep_thread(ctx: &GuestContext) -> Result<()> {
    let timeout = ctx.get_x(0) as i64;

    let rc = ResultCode::from(svc::sleep_thread(timeout));
    ctx.set_w(0, rc.get_value());
    Ok(())
}

fn do_get_thread_priority(ctx: &GuestContext) -> Result<()> {
    let handle: Handle = ctx.get_w(1);

    match svc::get_thread_priority(handle) {
        Ok(priority) => {
            ctx.set_w(0, ResultSuccess::make().get_value());
            ctx.set_w(1, priority as u32);
        },
        Err(rc) => ctx.set_w(0, rc.get_value())
    };

    Ok(())
}

fn do_set_thread_priority(ctx: &GuestContext) -> Result<()> {
    let handle: Handle = ctx.get_w(0);
    let priority = ctx.get_w(1) as i32;

    let rc = ResultCode::from(svc::set_thread_priority(handle, priority));
    ctx.set_w(0, rc.get_value());
    Ok(())
}

fn do_signal_event(ctx: &GuestContext) -> Result<()> {
    let handle: Handle = ctx.get_w(0);

    let rc = ResultCode::from(svc::signal_event(handle));
    ctx.set_w(0, rc.get_value());
    Ok(())
}

fn do_clear_event(ctx: &GuestContext) -> Result<()> {
    let handle: Handle = ctx.get_w(0);

    let rc = ResultCode::from(svc::clear_event(handle));
    ctx.set_w(0, rc.get_value());
    Ok(())
}

fn do_close_handle(ctx: &GuestContext) -> Result<()> {
    let handle: Handle = ctx.get_w(0);

    let rc = ResultCode::from(svc::close_handle(handle));
    ctx.set_w(0, rc.get_value());
    Ok(())
}

fn do_reset_signal(ctx: &GuestContext) -> Result<()> {
    let handle: Handle = ctx.get_w(0);

    let rc = ResultCode::from(svc::reset_signal(handle));
    ctx.set_w(0, rc.get_value());
    Ok(())
}

fn do_wait_synchronization(ctx: &GuestContext) -> Result<()> {
    let handles_count = ctx.get_w(2) as usize;
    let timeout = ctx.get_x(3) as i64;

    let handles = match read_packed_handles(ctx, handles_count) {
        Ok(handles) => handles,
        Err(_) => {
            ctx.set_w(0, crate::kern::result::ResultOutOfRange::make().get_value());
            return Ok(());
        }
    };

    match svc::wait_synchronization(&handles, timeout) {
        Ok(idx) => {
            ctx.set_w(0, ResultSuccess::make().get_value());
            ctx.set_w(1, idx as u32);
        },
        Err(rc) => ctx.set_w(0, rc.get_value())
    };

    Ok(())
}

fn do_cancel_synchronization(ctx: &GuestContext) -> Result<()> {
    let handle: Handle = ctx.get_w(0);

    let rc = ResultCode::from(svc::cancel_synchronization(handle));
    ctx.set_w(0, rc.get_value());
    Ok(())
}

fn do_get_thread_id(ctx: &GuestContext) -> Result<()> {
    let handle: Handle = ctx.get_w(1);

    match svc::get_thread_id(handle) {
        Ok(thread_id) => {
            ctx.set_w(0, ResultSuccess::make().get_value());
            ctx.set_x(1, thread_id);
        },
        Err(rc) => ctx.set_w(0, rc.get_value())
    };

    Ok(())
}

fn do_set_thread_activity(ctx: &GuestContext) -> Result<()> {
    let handle: Handle = ctx.get_w(0);
    let pause = ctx.get_w(1) != 0;

    let rc = ResultCode::from(svc::set_thread_activity(handle, pause));
    ctx.set_w(0, rc.get_value());
    Ok(())
}

fn do_create_event(ctx: &GuestContext) -> Result<()> {
    match svc::create_event() {
        Ok((writable_handle, readable_handle)) => {
            ctx.set_w(0, ResultSuccess::make().get_value());
            ctx.set_w(1, writable_handle);
            ctx.set_w(2, readable_handle);
        },
        Err(rc) => ctx.set_w(0, rc.get_value())
    };

    Ok(())
}

pub fn try_find_svc_handler(svc_id: SvcId) -> Option<SvcHandlerFn> {
    let handler: SvcHandlerFn = match svc_id {
        SvcId::CreateThread => do_create_thread,
        SvcId::StartThread => do_start_thread,
        SvcId::ExitThread => do_exit_thread,
        SvcId::SleepThread => do_sleep_thread,
        SvcId::GetThreadPriority => do_get_thread_priority,
        SvcId::SetThreadPriority => do_set_thread_priority,
        SvcId::SignalEvent => do_signal_event,
        SvcId::ClearEvent => do_clear_event,
        SvcId::CloseHandle => do_close_handle,
        SvcId::ResetSignal => do_reset_signal,
        SvcId::WaitSynchronization => do_wait_synchronization,
        SvcId::CancelSynchronization => do_cancel_synchronization,
        SvcId::GetThreadId => do_get_thread_id,
        SvcId::SetThreadActivity => do_set_thread_activity,
        SvcId::CreateEvent => do_create_event
    };

    Some(handler)
}

pub fn dispatch_svc(ctx: &GuestContext, svc_id: SvcId) -> Result<()> {
    match try_find_svc_handler(svc_id) {
        Some(handler) => handler(ctx),
        None => {
            log_line!("Unhandled SVC: {:?}", svc_id);
            cpu::result::ResultUnknownSvc::make_err()
        }
    }
}

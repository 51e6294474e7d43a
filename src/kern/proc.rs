use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use crate::emu::cfg::Config;
use crate::emu::cpu::{self, HostExecutionContext};
use crate::result::*;
use super::{KernelContext, CPU_CORE_COUNT};
use super::event::{KReadableEvent, KWritableEvent};
use super::sync::KSynchronizationObject;
use super::thread::{KThread, ThreadSchedState, try_get_current_thread};
use super::svc::{Handle, LimitableResource, CURRENT_PROCESS_PSEUDO_HANDLE, CURRENT_THREAD_PSEUDO_HANDLE};
use super::result;

// KResourceLimit

const LIMITABLE_RESOURCE_COUNT: usize = 5;

#[derive(Copy, Clone, Default)]
struct ResourceValues {
    limit: u64,
    current: u64,
    peak: u64
}

pub struct KResourceLimit {
    values: Mutex<[ResourceValues; LIMITABLE_RESOURCE_COUNT]>
}

impl KResourceLimit {
    pub fn new() -> Self {
        Self {
            values: Mutex::new([ResourceValues::default(); LIMITABLE_RESOURCE_COUNT])
        }
    }

    pub fn set_limit_value(&self, resource: LimitableResource, limit: u64) -> Result<()> {
        let mut values = self.values.lock();
        let res_values = &mut values[resource as usize];
        result_return_if!(res_values.current > limit, result::ResultInvalidState);

        res_values.limit = limit;
        Ok(())
    }

    /// Reserves `amount` units, failing without side effects if that would exceed the limit.
    pub fn reserve(&self, resource: LimitableResource, amount: u64) -> bool {
        let mut values = self.values.lock();
        let res_values = &mut values[resource as usize];

        let new_current = res_values.current + amount;
        if new_current > res_values.limit {
            return false;
        }

        res_values.current = new_current;
        res_values.peak = res_values.peak.max(new_current);
        true
    }

    pub fn release(&self, resource: LimitableResource, amount: u64) {
        let mut values = self.values.lock();
        let res_values = &mut values[resource as usize];
        res_values.current = res_values.current.saturating_sub(amount);
    }

    pub fn get_limit_value(&self, resource: LimitableResource) -> u64 {
        self.values.lock()[resource as usize].limit
    }

    pub fn get_current_value(&self, resource: LimitableResource) -> u64 {
        self.values.lock()[resource as usize].current
    }

    pub fn get_peak_value(&self, resource: LimitableResource) -> u64 {
        self.values.lock()[resource as usize].peak
    }
}

impl Default for KResourceLimit {
    fn default() -> Self {
        Self::new()
    }
}

// ---

// KHandleTable

#[derive(Clone)]
pub enum KObjectRef {
    Thread(Arc<KThread>),
    ReadableEvent(Arc<KReadableEvent>),
    WritableEvent(Arc<KWritableEvent>)
}

impl KObjectRef {
    pub fn as_sync_object(&self) -> Option<Arc<dyn KSynchronizationObject>> {
        match self {
            Self::Thread(thread) => Some(thread.clone()),
            Self::ReadableEvent(event) => Some(event.clone()),
            Self::WritableEvent(_) => None
        }
    }
}

pub struct KHandleTableEntry {
    pub linear_id: u16,
    pub obj: Option<KObjectRef>
}

impl KHandleTableEntry {
    pub const MAX_LINEAR_ID: u16 = 0x7FFF;
    pub const MIN_LINEAR_ID: u16 = 1;
    pub const INVALID_LINEAR_ID: u16 = 0;

    pub const fn new() -> Self {
        Self {
            linear_id: Self::INVALID_LINEAR_ID,
            obj: None
        }
    }

    pub const fn is_empty(&self) -> bool {
        self.linear_id == Self::INVALID_LINEAR_ID
    }
}

struct HandleTableState {
    entry_table: Vec<KHandleTableEntry>,
    used_entry_count: usize,
    linear_id_counter: u16
}

impl HandleTableState {
    fn find_entry(&mut self, handle: Handle) -> Result<&mut KHandleTableEntry> {
        result_return_if!((handle == CURRENT_PROCESS_PSEUDO_HANDLE) || (handle == CURRENT_THREAD_PSEUDO_HANDLE), result::ResultInvalidHandle);

        let (idx, linear_id) = KHandleTable::decode_handle(handle);
        match self.entry_table.get_mut(idx as usize) {
            Some(entry) if !entry.is_empty() && (entry.linear_id == linear_id) => Ok(entry),
            _ => result::ResultInvalidHandle::make_err()
        }
    }
}

pub struct KHandleTable {
    state: Mutex<HandleTableState>
}

impl KHandleTable {
    pub const MAX_SIZE: usize = 0x400;

    pub const fn encode_handle(idx: u32, linear_id: u16) -> Handle {
        ((linear_id as u32) << 15) | idx
    }

    pub const fn decode_handle(handle: Handle) -> (u32, u16) {
        (handle & 0x7FFF, (handle >> 15) as u16)
    }

    pub fn new(size: usize) -> Result<Self> {
        result_return_unless!((size > 0) && (size <= Self::MAX_SIZE), result::ResultOutOfMemory);

        let mut entry_table: Vec<KHandleTableEntry> = Vec::with_capacity(size);
        for _ in 0..size {
            entry_table.push(KHandleTableEntry::new());
        }

        Ok(Self {
            state: Mutex::new(HandleTableState {
                entry_table,
                used_entry_count: 0,
                linear_id_counter: KHandleTableEntry::MIN_LINEAR_ID
            })
        })
    }

    /// Reserves a handle whose object gets filled in later through `set_allocated_handle`.
    pub fn allocate_handle(&self) -> Result<Handle> {
        let mut state = self.state.lock();
        result_return_unless!(state.used_entry_count < state.entry_table.len(), result::ResultOutOfHandles);

        let linear_id = state.linear_id_counter;
        let idx = match state.entry_table.iter().position(|entry| entry.is_empty()) {
            Some(idx) => idx,
            None => return result::ResultOutOfHandles::make_err()
        };

        state.linear_id_counter += 1;
        if state.linear_id_counter > KHandleTableEntry::MAX_LINEAR_ID {
            state.linear_id_counter = KHandleTableEntry::MIN_LINEAR_ID;
        }

        let entry = &mut state.entry_table[idx];
        entry.linear_id = linear_id;
        entry.obj = None;
        state.used_entry_count += 1;

        Ok(Self::encode_handle(idx as u32, linear_id))
    }

    pub fn set_allocated_handle(&self, handle: Handle, obj: KObjectRef) -> Result<()> {
        let mut state = self.state.lock();
        let entry = state.find_entry(handle)?;

        entry.obj = Some(obj);
        Ok(())
    }

    pub fn add(&self, obj: KObjectRef) -> Result<Handle> {
        let handle = self.allocate_handle()?;
        self.set_allocated_handle(handle, obj)?;
        Ok(handle)
    }

    pub fn close_handle(&self, handle: Handle) -> Result<()> {
        let obj = {
            let mut state = self.state.lock();
            let entry = state.find_entry(handle)?;

            let obj = entry.obj.take();
            *entry = KHandleTableEntry::new();
            state.used_entry_count -= 1;
            obj
        };

        // Dropping the last reference may tear the object down, which must not happen under the table lock
        drop(obj);
        Ok(())
    }

    pub fn get_used_entry_count(&self) -> usize {
        self.state.lock().used_entry_count
    }

    pub fn get_object(&self, handle: Handle) -> Result<KObjectRef> {
        let mut state = self.state.lock();
        let entry = state.find_entry(handle)?;

        match entry.obj.as_ref() {
            Some(obj) => Ok(obj.clone()),
            None => result::ResultInvalidHandle::make_err()
        }
    }

    pub fn get_thread(&self, handle: Handle) -> Result<Arc<KThread>> {
        if handle == CURRENT_THREAD_PSEUDO_HANDLE {
            return match try_get_current_thread() {
                Some(thread) => Ok(thread),
                None => result::ResultInvalidHandle::make_err()
            };
        }

        match self.get_object(handle)? {
            KObjectRef::Thread(thread) => Ok(thread),
            _ => result::ResultInvalidHandle::make_err()
        }
    }

    pub fn get_readable_event(&self, handle: Handle) -> Result<Arc<KReadableEvent>> {
        match self.get_object(handle)? {
            KObjectRef::ReadableEvent(event) => Ok(event),
            _ => result::ResultInvalidHandle::make_err()
        }
    }

    pub fn get_writable_event(&self, handle: Handle) -> Result<Arc<KWritableEvent>> {
        match self.get_object(handle)? {
            KObjectRef::WritableEvent(event) => Ok(event),
            _ => result::ResultInvalidHandle::make_err()
        }
    }

    pub fn get_sync_object(&self, handle: Handle) -> Result<Arc<dyn KSynchronizationObject>> {
        let obj = match handle {
            CURRENT_THREAD_PSEUDO_HANDLE => KObjectRef::Thread(self.get_thread(handle)?),
            _ => self.get_object(handle)?
        };

        match obj.as_sync_object() {
            Some(sync_obj) => Ok(sync_obj),
            None => result::ResultInvalidHandle::make_err()
        }
    }
}

// ---

// KProcess

const TLS_PAGE_SIZE: u64 = 0x1000;
const TLS_SLOT_SIZE: u64 = 0x200;
const TLS_SLOTS_PER_PAGE: usize = (TLS_PAGE_SIZE / TLS_SLOT_SIZE) as usize;
const TLS_REGION_BASE: u64 = 0x1_0000_0000;

// Priorities user threads may use, as granted to regular applications
const DEFAULT_ALLOWED_PRIORITY_MASK: u64 = 0x0FFF_FFFF_FF00_0000;

struct TlsPage {
    address: u64,
    used_slots: [bool; TLS_SLOTS_PER_PAGE]
}

impl TlsPage {
    fn new(address: u64) -> Self {
        Self {
            address,
            used_slots: [false; TLS_SLOTS_PER_PAGE]
        }
    }

    fn allocate_slot(&mut self) -> Option<u64> {
        let slot = self.used_slots.iter().position(|used| !*used)?;
        self.used_slots[slot] = true;
        Some(self.address + slot as u64 * TLS_SLOT_SIZE)
    }

    fn contains(&self, address: u64) -> bool {
        (address >= self.address) && (address < self.address + TLS_PAGE_SIZE)
    }

    fn is_empty(&self) -> bool {
        self.used_slots.iter().all(|used| !*used)
    }
}

pub struct KProcess {
    pub id: u64,
    pub name: String,
    kernel: Arc<KernelContext>,
    cpu_ctx: Arc<cpu::Context>,
    allowed_priority_mask: u64,
    resource_limit: KResourceLimit,
    handle_table: KHandleTable,
    tls_pages: Mutex<Vec<TlsPage>>,
    tls_page_limit: usize,
    pinned_threads: Mutex<[Option<Arc<KThread>>; CPU_CORE_COUNT]>,
    threads: Mutex<Vec<Weak<KThread>>>,
    paused: AtomicBool
}

impl KProcess {
    pub fn new(kernel: &Arc<KernelContext>, name: &str, cfg: Config) -> Result<Arc<Self>> {
        // Default limits for regular application processes
        let resource_limit = KResourceLimit::new();
        resource_limit.set_limit_value(LimitableResource::PhysicalMemory, 0)?;
        resource_limit.set_limit_value(LimitableResource::Thread, cfg.process_thread_limit as u64)?;
        resource_limit.set_limit_value(LimitableResource::Event, 700)?;
        resource_limit.set_limit_value(LimitableResource::TransferMemory, 128)?;
        resource_limit.set_limit_value(LimitableResource::Session, 894)?;

        Ok(Arc::new(Self {
            id: kernel.new_process_id(),
            name: String::from(name),
            kernel: kernel.clone(),
            cpu_ctx: Arc::new(cpu::Context::new()),
            allowed_priority_mask: DEFAULT_ALLOWED_PRIORITY_MASK,
            resource_limit,
            handle_table: KHandleTable::new(KHandleTable::MAX_SIZE)?,
            tls_pages: Mutex::new(Vec::new()),
            tls_page_limit: cfg.tls_page_limit as usize,
            pinned_threads: Mutex::new(Default::default()),
            threads: Mutex::new(Vec::new()),
            paused: AtomicBool::new(false)
        }))
    }

    #[inline]
    pub fn get_kernel(&self) -> &Arc<KernelContext> {
        &self.kernel
    }

    #[inline]
    pub fn get_cpu_context(&self) -> &Arc<cpu::Context> {
        &self.cpu_ctx
    }

    pub fn create_execution_context(&self, is_32bit: bool) -> Arc<HostExecutionContext> {
        self.cpu_ctx.create_execution_context(is_32bit)
    }

    #[inline]
    pub fn get_resource_limit(&self) -> &KResourceLimit {
        &self.resource_limit
    }

    #[inline]
    pub fn get_handle_table(&self) -> &KHandleTable {
        &self.handle_table
    }

    #[inline]
    pub fn get_allowed_priority_mask(&self) -> u64 {
        self.allowed_priority_mask
    }

    #[inline]
    pub fn is_priority_allowed(&self, priority: i32) -> bool {
        (0..64).contains(&priority) && ((self.allowed_priority_mask & bit!(priority as u64)) != 0)
    }

    pub fn allocate_tls(&self) -> Result<u64> {
        let mut tls_pages = self.tls_pages.lock();

        for page in tls_pages.iter_mut() {
            if let Some(address) = page.allocate_slot() {
                return Ok(address);
            }
        }

        result_return_unless!(tls_pages.len() < self.tls_page_limit, result::ResultOutOfMemory);

        // Reuse the lowest free page address
        let mut address = TLS_REGION_BASE;
        while tls_pages.iter().any(|page| page.address == address) {
            address += TLS_PAGE_SIZE;
        }

        let mut page = TlsPage::new(address);
        let slot_address = match page.allocate_slot() {
            Some(slot_address) => slot_address,
            None => return result::ResultOutOfMemory::make_err()
        };
        tls_pages.push(page);
        Ok(slot_address)
    }

    pub fn free_tls(&self, address: u64) {
        let mut tls_pages = self.tls_pages.lock();

        if let Some(page_idx) = tls_pages.iter().position(|page| page.contains(address)) {
            let page = &mut tls_pages[page_idx];
            page.used_slots[((address - page.address) / TLS_SLOT_SIZE) as usize] = false;
            if page.is_empty() {
                tls_pages.remove(page_idx);
            }
        }
    }

    pub fn get_tls_page_count(&self) -> usize {
        self.tls_pages.lock().len()
    }

    pub fn add_thread(&self, thread: &Arc<KThread>) {
        let mut threads = self.threads.lock();
        threads.retain(|w_thread| w_thread.strong_count() > 0);
        threads.push(Arc::downgrade(thread));
    }

    pub fn remove_thread(&self, thread: &KThread) {
        self.threads.lock().retain(|w_thread| match w_thread.upgrade() {
            Some(r_thread) => !std::ptr::eq(r_thread.as_ref(), thread),
            None => false
        });
    }

    pub fn get_threads(&self) -> Vec<Arc<KThread>> {
        self.threads.lock().iter().filter_map(|w_thread| w_thread.upgrade()).collect()
    }

    pub fn get_thread_count(&self) -> usize {
        self.get_threads().len()
    }

    #[inline]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Force-pauses (or resumes) every thread of the process.
    pub fn set_paused(&self, paused: bool) -> Result<()> {
        let _guard = self.kernel.make_critical_section_guard();

        result_return_if!(self.paused.swap(paused, Ordering::SeqCst) == paused, result::ResultInvalidState);

        for thread in self.get_threads() {
            match paused {
                true => thread.suspend(ThreadSchedState::ProcessPauseFlag()),
                false => thread.resume(ThreadSchedState::ProcessPauseFlag())
            };
        }

        Ok(())
    }

    pub fn pin_thread(&self, thread: &Arc<KThread>) {
        let _guard = self.kernel.make_critical_section_guard();

        let core = thread.get_current_core();
        if (core >= 0) && (core < CPU_CORE_COUNT as i32) {
            self.pinned_threads.lock()[core as usize] = Some(thread.clone());
        }
        thread.pin();
    }

    pub fn unpin_thread(&self, thread: &Arc<KThread>) {
        let _guard = self.kernel.make_critical_section_guard();

        let core = thread.get_current_core();
        if (core >= 0) && (core < CPU_CORE_COUNT as i32) {
            self.pinned_threads.lock()[core as usize] = None;
        }
        thread.unpin();
    }

    pub fn get_pinned_thread(&self, core: i32) -> Option<Arc<KThread>> {
        match (core >= 0) && (core < CPU_CORE_COUNT as i32) {
            true => self.pinned_threads.lock()[core as usize].clone(),
            false => None
        }
    }

    pub fn is_pinned_thread(&self, core: i32, thread: &KThread) -> bool {
        match self.get_pinned_thread(core) {
            Some(pinned_thread) => std::ptr::eq(pinned_thread.as_ref(), thread),
            None => false
        }
    }
}

#[inline]
pub fn try_get_current_process() -> Option<Arc<KProcess>> {
    try_get_current_thread().and_then(|thread| thread.get_owner_process())
}

#[inline]
pub fn has_current_process() -> bool {
    try_get_current_process().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kern::event::KEvent;
    use crate::kern::thread::ThreadInitInfo;

    fn make_process(kernel: &Arc<KernelContext>, cfg: Config) -> Arc<KProcess> {
        KProcess::new(kernel, "proc-test", cfg).unwrap()
    }

    #[test]
    fn resource_limit_tracks_peak() {
        let limit = KResourceLimit::new();
        limit.set_limit_value(LimitableResource::Thread, 2).unwrap();

        assert!(limit.reserve(LimitableResource::Thread, 1));
        assert!(limit.reserve(LimitableResource::Thread, 1));
        assert!(!limit.reserve(LimitableResource::Thread, 1));
        assert_eq!(limit.get_current_value(LimitableResource::Thread), 2);

        limit.release(LimitableResource::Thread, 2);
        assert_eq!(limit.get_current_value(LimitableResource::Thread), 0);
        assert_eq!(limit.get_peak_value(LimitableResource::Thread), 2);

        // Can't go below what's already in use
        assert!(limit.reserve(LimitableResource::Thread, 1));
        let rc = limit.set_limit_value(LimitableResource::Thread, 0).unwrap_err();
        assert!(result::ResultInvalidState::matches(rc));
    }

    #[test]
    fn closing_last_writable_handle_disposes_event() {
        let kernel = KernelContext::new();
        let table = KHandleTable::new(4).unwrap();
        let event = KEvent::new(&kernel);
        let readable = event.readable.clone();

        let writable_handle = table.add(KObjectRef::WritableEvent(event.writable.clone())).unwrap();
        drop(event);
        assert!(!readable.is_disposed());

        table.close_handle(writable_handle).unwrap();
        assert!(readable.is_disposed());
        assert_eq!(table.get_used_entry_count(), 0);
    }

    #[test]
    fn handle_table_lookup_and_close() {
        let kernel = KernelContext::new();
        let table = KHandleTable::new(4).unwrap();
        let event = KEvent::new(&kernel);

        let readable_handle = table.add(KObjectRef::ReadableEvent(event.readable.clone())).unwrap();
        let writable_handle = table.add(KObjectRef::WritableEvent(event.writable.clone())).unwrap();
        assert_ne!(readable_handle, writable_handle);
        assert_eq!(table.get_used_entry_count(), 2);

        assert!(Arc::ptr_eq(&table.get_readable_event(readable_handle).unwrap(), &event.readable));
        assert!(table.get_sync_object(readable_handle).is_ok());

        // Wrong type for the handle
        let rc = table.get_readable_event(writable_handle).err().unwrap();
        assert!(result::ResultInvalidHandle::matches(rc));
        let rc = table.get_sync_object(writable_handle).err().unwrap();
        assert!(result::ResultInvalidHandle::matches(rc));

        table.close_handle(readable_handle).unwrap();
        let rc = table.get_readable_event(readable_handle).err().unwrap();
        assert!(result::ResultInvalidHandle::matches(rc));
        let rc = table.close_handle(readable_handle).unwrap_err();
        assert!(result::ResultInvalidHandle::matches(rc));

        // A reused slot gets a new linear id, so stale handles stay invalid
        let new_handle = table.add(KObjectRef::ReadableEvent(event.readable.clone())).unwrap();
        assert_eq!(KHandleTable::decode_handle(new_handle).0, KHandleTable::decode_handle(readable_handle).0);
        assert_ne!(new_handle, readable_handle);
        assert!(table.get_readable_event(readable_handle).is_err());
    }

    #[test]
    fn handle_table_exhaustion() {
        let kernel = KernelContext::new();
        let table = KHandleTable::new(2).unwrap();
        let event = KEvent::new(&kernel);

        table.add(KObjectRef::ReadableEvent(event.readable.clone())).unwrap();
        table.add(KObjectRef::ReadableEvent(event.readable.clone())).unwrap();
        let rc = table.add(KObjectRef::ReadableEvent(event.readable.clone())).unwrap_err();
        assert!(result::ResultOutOfHandles::matches(rc));

        let rc = table.close_handle(CURRENT_THREAD_PSEUDO_HANDLE).unwrap_err();
        assert!(result::ResultInvalidHandle::matches(rc));
        assert!(KHandleTable::new(KHandleTable::MAX_SIZE + 1).is_err());
    }

    #[test]
    fn tls_slots_fill_pages() {
        let kernel = KernelContext::new();
        let mut cfg = Config::default();
        cfg.tls_page_limit = 2;
        let process = make_process(&kernel, cfg);

        let mut addresses = Vec::new();
        for _ in 0..(TLS_SLOTS_PER_PAGE * 2) {
            addresses.push(process.allocate_tls().unwrap());
        }
        assert_eq!(addresses[0], TLS_REGION_BASE);
        assert_eq!(addresses[1], TLS_REGION_BASE + TLS_SLOT_SIZE);
        assert_eq!(addresses[TLS_SLOTS_PER_PAGE], TLS_REGION_BASE + TLS_PAGE_SIZE);
        assert_eq!(process.get_tls_page_count(), 2);

        let rc = process.allocate_tls().unwrap_err();
        assert!(result::ResultOutOfMemory::matches(rc));

        process.free_tls(addresses[3]);
        assert_eq!(process.allocate_tls().unwrap(), addresses[3]);

        for address in &addresses[TLS_SLOTS_PER_PAGE..] {
            process.free_tls(*address);
        }
        assert_eq!(process.get_tls_page_count(), 1);
    }

    #[test]
    fn thread_creation_respects_limits() {
        let kernel = KernelContext::new();
        let mut cfg = Config::default();
        cfg.process_thread_limit = 1;
        let process = make_process(&kernel, cfg);

        let first = KThread::new(&kernel, ThreadInitInfo::new_guest("first", 0, 0, 0, 44, 0).with_owner(&process)).unwrap();
        assert_eq!(process.get_resource_limit().get_current_value(LimitableResource::Thread), 1);

        let rc = KThread::new(&kernel, ThreadInitInfo::new_guest("second", 0, 0, 0, 44, 0).with_owner(&process)).err().unwrap();
        assert!(result::ResultLimitReached::matches(rc));

        // Exiting returns both the reservation and the TLS slot
        first.exit();
        assert_eq!(process.get_resource_limit().get_current_value(LimitableResource::Thread), 0);
        assert_eq!(process.get_tls_page_count(), 0);
        assert_eq!(process.get_thread_count(), 0);
    }

    #[test]
    fn tls_exhaustion_releases_reservation() {
        let kernel = KernelContext::new();
        let mut cfg = Config::default();
        cfg.tls_page_limit = 0;
        let process = make_process(&kernel, cfg);

        let rc = KThread::new(&kernel, ThreadInitInfo::new_guest("no-tls", 0, 0, 0, 44, 0).with_owner(&process)).err().unwrap();
        assert!(result::ResultOutOfMemory::matches(rc));
        assert_eq!(process.get_resource_limit().get_current_value(LimitableResource::Thread), 0);
    }

    #[test]
    fn pausing_process_pauses_threads() {
        let kernel = KernelContext::new();
        kernel.initialize();
        let process = make_process(&kernel, Config::default());

        let existing = KThread::new(&kernel, ThreadInitInfo::new_dummy("existing", 44, 0).with_owner(&process)).unwrap();
        process.set_paused(true).unwrap();
        assert!(process.is_paused());
        assert!(existing.get_sched_flags().contains(ThreadSchedState::ProcessPauseFlag()));

        let rc = process.set_paused(true).unwrap_err();
        assert!(result::ResultInvalidState::matches(rc));

        // Threads created while paused start out paused too
        let created = KThread::new(&kernel, ThreadInitInfo::new_dummy("created", 44, 1).with_owner(&process)).unwrap();
        assert!(created.get_force_pause_flags().contains(ThreadSchedState::ProcessPauseFlag()));

        process.set_paused(false).unwrap();
        assert_eq!(existing.get_sched_flags(), ThreadSchedState::Running());
        assert_eq!(created.get_sched_flags(), ThreadSchedState::Running());
    }

    #[test]
    fn allowed_priorities() {
        let kernel = KernelContext::new();
        let process = make_process(&kernel, Config::default());

        assert!(!process.is_priority_allowed(23));
        assert!(process.is_priority_allowed(24));
        assert!(process.is_priority_allowed(59));
        assert!(!process.is_priority_allowed(60));
        assert!(!process.is_priority_allowed(-1));
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use parking_lot::{Mutex, RwLock};
use crate::result::*;
use super::MemoryPermission;
use super::bitmap::ConcurrentBitmap;
use super::tracking::MemoryTracking;

/// One-shot callback fired with the accessed range (clamped to the handle) on the first access after registration.
pub type RegionSignal = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Callback fired on every precise access. Returning true absorbs the access.
pub type PreciseRegionSignal = Arc<dyn Fn(u64, u64, bool) -> bool + Send + Sync>;

pub type DirtyEvent = Arc<dyn Fn() + Send + Sync>;

const NO_SEQUENCE_NUMBER: i64 = i64::MIN;

struct DirtyStorage {
    bitmap: Arc<ConcurrentBitmap>,
    index: usize
}

pub(crate) struct HandleState {
    pub id: i32,
    pub address: u64,
    pub size: u64,
    pub real_address: u64,
    pub real_size: u64,
    dirty_storage: RwLock<DirtyStorage>,
    parent_dirty: RwLock<Option<Arc<AtomicBool>>>,
    unmapped: AtomicBool,
    disposed: AtomicBool,
    sequence_number: AtomicI64,
    action: Mutex<Option<RegionSignal>>,
    precise_action: Mutex<Option<PreciseRegionSignal>>,
    dirty_event: Mutex<Option<DirtyEvent>>
}

impl HandleState {
    pub fn new(id: i32, address: u64, size: u64, real_address: u64, real_size: u64, bitmap: Arc<ConcurrentBitmap>, index: usize, mapped: bool) -> Self {
        bitmap.set(index, mapped);

        Self {
            id,
            address,
            size,
            real_address,
            real_size,
            dirty_storage: RwLock::new(DirtyStorage { bitmap, index }),
            parent_dirty: RwLock::new(None),
            unmapped: AtomicBool::new(!mapped),
            disposed: AtomicBool::new(false),
            sequence_number: AtomicI64::new(NO_SEQUENCE_NUMBER),
            action: Mutex::new(None),
            precise_action: Mutex::new(None),
            dirty_event: Mutex::new(None)
        }
    }

    #[inline]
    pub fn end_address(&self) -> u64 {
        self.address.saturating_add(self.size)
    }

    pub fn is_dirty(&self) -> bool {
        let storage = self.dirty_storage.read();
        storage.bitmap.is_set(storage.index)
    }

    /// Returns the previous dirty state.
    pub fn set_dirty(&self, dirty: bool) -> bool {
        let storage = self.dirty_storage.read();
        storage.bitmap.set(storage.index, dirty)
    }

    pub fn signal_parent(&self) {
        if let Some(parent_dirty) = self.parent_dirty.read().as_ref() {
            parent_dirty.store(true, Ordering::SeqCst);
        }
    }

    #[inline]
    pub fn is_unmapped(&self) -> bool {
        self.unmapped.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn set_mapped(&self, mapped: bool) {
        self.unmapped.store(!mapped, Ordering::SeqCst);
        self.set_dirty(mapped);
    }

    pub fn take_action(&self) -> Option<RegionSignal> {
        self.action.lock().take()
    }

    pub fn get_precise_action(&self) -> Option<PreciseRegionSignal> {
        self.precise_action.lock().clone()
    }

    pub fn get_dirty_event(&self) -> Option<DirtyEvent> {
        self.dirty_event.lock().clone()
    }

    pub fn required_permission(&self) -> MemoryPermission {
        if self.is_unmapped() {
            MemoryPermission::ReadAndWrite()
        }
        else if self.action.lock().is_some() {
            MemoryPermission::None()
        }
        else if self.is_dirty() {
            MemoryPermission::ReadAndWrite()
        }
        else {
            MemoryPermission::Read()
        }
    }

    /// Clamps an accessed range to the range this handle was requested for.
    pub fn clamp_range(&self, address: u64, size: u64) -> (u64, u64) {
        let start = address.max(self.real_address);
        let end = address.saturating_add(size).min(self.real_address.saturating_add(self.real_size)).max(start);
        (start, end - start)
    }
}

/// A tracked contiguous range of guest memory, page-aligned outward from the requested range.
/// Dropping the handle stops tracking.
pub struct RegionHandle {
    tracking: MemoryTracking,
    state: Arc<HandleState>
}

impl RegionHandle {
    pub(crate) fn new(tracking: MemoryTracking, state: Arc<HandleState>) -> Self {
        Self {
            tracking,
            state
        }
    }

    #[inline]
    pub fn get_id(&self) -> i32 {
        self.state.id
    }

    #[inline]
    pub fn get_address(&self) -> u64 {
        self.state.address
    }

    #[inline]
    pub fn get_size(&self) -> u64 {
        self.state.size
    }

    #[inline]
    pub fn get_end_address(&self) -> u64 {
        self.state.end_address()
    }

    #[inline]
    pub fn get_real_address(&self) -> u64 {
        self.state.real_address
    }

    #[inline]
    pub fn get_real_size(&self) -> u64 {
        self.state.real_size
    }

    #[inline]
    pub fn get_real_end_address(&self) -> u64 {
        self.state.real_address.saturating_add(self.state.real_size)
    }

    #[inline]
    pub fn dirty(&self) -> bool {
        self.state.is_dirty()
    }

    #[inline]
    pub fn is_unmapped(&self) -> bool {
        self.state.is_unmapped()
    }

    #[inline]
    pub fn is_disposed(&self) -> bool {
        self.state.is_disposed()
    }

    pub fn overlaps_with(&self, address: u64, size: u64) -> bool {
        self.state.address < address.saturating_add(size) && address < self.state.end_address()
    }

    pub fn get_sequence_number(&self) -> Option<i32> {
        match self.state.sequence_number.load(Ordering::SeqCst) {
            NO_SEQUENCE_NUMBER => None,
            seq => Some(seq as i32)
        }
    }

    pub fn set_sequence_number(&self, seq: i32) {
        self.state.sequence_number.store(seq as i64, Ordering::SeqCst);
    }

    /// Consumes the dirty state (replacing it with `as_dirty`) and reapplies page protection.
    pub fn reprotect(&self, as_dirty: bool) -> Result<()> {
        result_return_if!(self.is_disposed(), ResultObjectDisposed);

        self.state.set_dirty(as_dirty);
        self.tracking.update_handle_protection(&self.state)
    }

    pub fn force_dirty(&self) {
        if !self.is_unmapped() {
            self.state.set_dirty(true);
            self.state.signal_parent();
        }
    }

    pub fn register_action(&self, action: RegionSignal) -> Result<()> {
        result_return_if!(self.is_disposed(), ResultObjectDisposed);

        let prev_action = self.state.action.lock().replace(action);
        if prev_action.is_none() {
            // Reads need to trap now too
            self.tracking.update_handle_protection(&self.state)?;
        }
        Ok(())
    }

    pub fn register_precise_action(&self, action: PreciseRegionSignal) -> Result<()> {
        result_return_if!(self.is_disposed(), ResultObjectDisposed);

        *self.state.precise_action.lock() = Some(action);
        Ok(())
    }

    pub fn register_dirty_event(&self, event: DirtyEvent) {
        *self.state.dirty_event.lock() = Some(event);
    }

    pub fn get_action(&self) -> Option<RegionSignal> {
        self.state.action.lock().clone()
    }

    pub fn get_precise_action(&self) -> Option<PreciseRegionSignal> {
        self.state.get_precise_action()
    }

    pub(crate) fn set_parent_dirty(&self, parent_dirty: Arc<AtomicBool>) {
        *self.state.parent_dirty.write() = Some(parent_dirty);
    }

    /// Moves the dirty bit into a slot of a shared bitmap, keeping its current value.
    pub(crate) fn replace_dirty_storage(&self, bitmap: Arc<ConcurrentBitmap>, index: usize) {
        let mut storage = self.state.dirty_storage.write();
        let dirty = storage.bitmap.is_set(storage.index);
        bitmap.set(index, dirty);
        *storage = DirtyStorage { bitmap, index };
    }

    pub fn dispose(&self) -> Result<()> {
        result_return_if!(self.state.disposed.swap(true, Ordering::SeqCst), ResultObjectDisposed);

        self.tracking.remove_handle(&self.state)
    }
}

impl Drop for RegionHandle {
    fn drop(&mut self) {
        if !self.is_disposed() {
            let _ = self.dispose();
        }
    }
}

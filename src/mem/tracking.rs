use std::collections::BTreeMap;
use std::sync::Arc;
use parking_lot::{Mutex, MutexGuard};
use crate::result::*;
use crate::emu::cfg;
use crate::util;
use super::{MemoryPermission, VirtualMemoryManager};
use super::bitmap::ConcurrentBitmap;
use super::handle::{HandleState, RegionHandle};
use super::multi::MultiRegionHandle;
use super::smart::SmartMultiRegionHandle;
use super::result;

pub type InvalidAccessHandler = Arc<dyn Fn(u64) + Send + Sync>;

// VirtualRegion

struct VirtualRegion {
    address: u64,
    size: u64,
    handles: Vec<Arc<HandleState>>,
    last_permission: MemoryPermission
}

impl VirtualRegion {
    fn new(address: u64, size: u64) -> Self {
        Self {
            address,
            size,
            handles: Vec::new(),
            last_permission: MemoryPermission::Invalid()
        }
    }

    #[inline]
    fn end_address(&self) -> u64 {
        self.address.saturating_add(self.size)
    }

    fn contains_handle(&self, handle: &Arc<HandleState>) -> bool {
        self.handles.iter().any(|r_handle| Arc::ptr_eq(r_handle, handle))
    }

    fn required_permission(&self) -> MemoryPermission {
        let mut perm = MemoryPermission::ReadAndWrite();
        for handle in self.handles.iter() {
            perm = perm & handle.required_permission();
            if perm == MemoryPermission::None() {
                break;
            }
        }
        perm
    }
}

// TrackingState

struct TrackingState {
    regions: BTreeMap<u64, VirtualRegion>
}

impl TrackingState {
    /// Start addresses of the regions overlapping the range, ascending.
    fn overlapping_keys(&self, address: u64, size: u64) -> Vec<u64> {
        let end = address.saturating_add(size);
        let mut keys: Vec<u64> = self.regions.range(..end).rev()
            .take_while(|(_, region)| region.end_address() > address)
            .map(|(key, _)| *key)
            .collect();
        keys.reverse();
        keys
    }

    fn handle_keys(&self, handle: &Arc<HandleState>) -> Vec<u64> {
        self.overlapping_keys(handle.address, handle.size).into_iter()
            .filter(|key| self.regions.get(key).map_or(false, |region| region.contains_handle(handle)))
            .collect()
    }

    fn split(&mut self, key: u64, split_address: u64) {
        let high = match self.regions.get_mut(&key) {
            Some(region) if (split_address > region.address) && (split_address < region.end_address()) => {
                let high = VirtualRegion {
                    address: split_address,
                    size: region.end_address() - split_address,
                    handles: region.handles.clone(),
                    last_permission: region.last_permission
                };
                region.size = split_address - region.address;
                high
            },
            _ => return
        };

        if cfg::get_config().log_memory_tracking {
            log_line!("Splitting region {:#X} at {:#X}", key, split_address);
        }
        self.regions.insert(split_address, high);
    }

    /// Splits the regions straddling the range bounds and fills the gaps, so that the returned regions cover the range exactly.
    fn get_or_add_regions(&mut self, address: u64, size: u64) -> Vec<u64> {
        let end = address + size;
        for key in self.overlapping_keys(address, size) {
            self.split(key, address);
        }
        for key in self.overlapping_keys(address, size) {
            self.split(key, end);
        }

        let mut keys = Vec::new();
        let mut cur_address = address;
        for key in self.overlapping_keys(address, size) {
            if key > cur_address {
                self.regions.insert(cur_address, VirtualRegion::new(cur_address, key - cur_address));
                keys.push(cur_address);
            }

            keys.push(key);
            cur_address = self.regions.get(&key).map_or(cur_address, |region| region.end_address());
        }
        if cur_address < end {
            self.regions.insert(cur_address, VirtualRegion::new(cur_address, end - cur_address));
            keys.push(cur_address);
        }

        keys
    }

    fn update_protection(&mut self, mm: &dyn VirtualMemoryManager, key: u64) -> Result<bool> {
        let region = match self.regions.get_mut(&key) {
            Some(region) => region,
            None => return Ok(false)
        };

        let perm = region.required_permission();
        if perm == region.last_permission {
            return Ok(false);
        }

        mm.tracking_reprotect(region.address, region.size, perm)?;
        region.last_permission = perm;

        if cfg::get_config().log_memory_tracking {
            log_line!("Reprotected region {:#X} (size {:#X}) as {:?}", region.address, region.size, perm);
        }
        Ok(true)
    }
}

// MemoryTracking

struct TrackingInner {
    mm: Arc<dyn VirtualMemoryManager>,
    page_size: u64,
    state: Mutex<TrackingState>,
    invalid_access_handler: Mutex<Option<InvalidAccessHandler>>
}

/// Maps tracked address ranges to the handles watching them and keeps page protection in sync with what those handles need.
#[derive(Clone)]
pub struct MemoryTracking {
    inner: Arc<TrackingInner>
}

impl MemoryTracking {
    pub fn new(mm: Arc<dyn VirtualMemoryManager>, page_size: u64) -> Result<Self> {
        result_return_unless!(page_size.is_power_of_two(), result::ResultInvalidGranularity);

        Ok(Self {
            inner: Arc::new(TrackingInner {
                mm,
                page_size,
                state: Mutex::new(TrackingState { regions: BTreeMap::new() }),
                invalid_access_handler: Mutex::new(None)
            })
        })
    }

    pub fn from_config(mm: Arc<dyn VirtualMemoryManager>) -> Result<Self> {
        Self::new(mm, cfg::get_config().tracking_page_size)
    }

    #[inline]
    pub fn get_page_size(&self) -> u64 {
        self.inner.page_size
    }

    #[inline]
    pub fn get_memory_manager(&self) -> &Arc<dyn VirtualMemoryManager> {
        &self.inner.mm
    }

    pub fn set_invalid_access_handler(&self, handler: InvalidAccessHandler) {
        *self.inner.invalid_access_handler.lock() = Some(handler);
    }

    pub fn get_region_count(&self) -> usize {
        self.inner.state.lock().regions.len()
    }

    /// Must be called after the range was mapped in the memory manager.
    pub fn map(&self, va: u64, size: u64) -> Result<()> {
        let mut state = self.inner.state.lock();
        let keys = state.overlapping_keys(va, size);

        for key in keys.iter() {
            if let Some(region) = state.regions.get_mut(key) {
                if self.inner.mm.is_range_mapped(region.address, region.size) {
                    for handle in region.handles.iter() {
                        handle.set_mapped(true);
                    }
                    region.last_permission = MemoryPermission::Invalid();
                }
            }
        }

        for key in keys {
            state.update_protection(self.inner.mm.as_ref(), key)?;
        }
        Ok(())
    }

    /// Must be called after the range was unmapped from the memory manager.
    pub fn unmap(&self, va: u64, size: u64) {
        let mut state = self.inner.state.lock();
        for key in state.overlapping_keys(va, size) {
            if let Some(region) = state.regions.get_mut(&key) {
                for handle in region.handles.iter() {
                    handle.set_mapped(false);
                }
                region.last_permission = MemoryPermission::Invalid();
            }
        }
    }

    fn page_align_range(&self, address: u64, size: u64) -> Result<(u64, u64)> {
        let page_size = self.inner.page_size;
        let end = match address.checked_add(size).and_then(|end| end.checked_add(page_size - 1)) {
            Some(end) if size > 0 => util::align_down(end, page_size),
            _ => return result::ResultRangeOutOfBounds::make_err()
        };

        let page_address = util::align_down(address, page_size);
        Ok((page_address, end - page_address))
    }

    pub(crate) fn create_handle(&self, address: u64, size: u64, dirty_storage: Option<(Arc<ConcurrentBitmap>, usize)>, id: i32) -> Result<RegionHandle> {
        let (page_address, page_size) = self.page_align_range(address, size)?;
        let (bitmap, index) = dirty_storage.unwrap_or_else(|| (Arc::new(ConcurrentBitmap::new(1, false)), 0));

        let mapped = self.inner.mm.is_range_mapped(page_address, page_size);
        let handle = Arc::new(HandleState::new(id, page_address, page_size, address, size, bitmap, index, mapped));

        let mut state = self.inner.state.lock();
        for key in state.get_or_add_regions(page_address, page_size) {
            if let Some(region) = state.regions.get_mut(&key) {
                region.handles.push(handle.clone());
            }
        }

        Ok(RegionHandle::new(self.clone(), handle))
    }

    /// Tracks the pages touched by [address, address + size). Protection is left untouched until the handle is reprotected.
    pub fn begin_tracking(&self, address: u64, size: u64, id: i32) -> Result<RegionHandle> {
        self.create_handle(address, size, None, id)
    }

    pub fn begin_granular_tracking(&self, address: u64, size: u64, inherited_handles: Option<Vec<RegionHandle>>, granularity: u64, id: i32) -> Result<MultiRegionHandle> {
        MultiRegionHandle::new(self, address, size, inherited_handles, granularity, id)
    }

    pub fn begin_smart_granular_tracking(&self, address: u64, size: u64, granularity: u64, id: i32) -> Result<SmartMultiRegionHandle> {
        SmartMultiRegionHandle::new(self, address, size, granularity, id)
    }

    pub(crate) fn update_handle_protection(&self, handle: &Arc<HandleState>) -> Result<()> {
        let mut state = self.inner.state.lock();
        for key in state.handle_keys(handle) {
            state.update_protection(self.inner.mm.as_ref(), key)?;
        }
        Ok(())
    }

    pub(crate) fn remove_handle(&self, handle: &Arc<HandleState>) -> Result<()> {
        let mut state = self.inner.state.lock();
        for key in state.handle_keys(handle) {
            let is_empty = match state.regions.get_mut(&key) {
                Some(region) => {
                    region.handles.retain(|r_handle| !Arc::ptr_eq(r_handle, handle));
                    region.handles.is_empty()
                },
                None => continue
            };

            // Leftover handles may need less protection now, or none at all
            state.update_protection(self.inner.mm.as_ref(), key)?;
            if is_empty {
                state.regions.remove(&key);
            }
        }
        Ok(())
    }

    pub fn virtual_memory_event(&self, address: u64, size: u64, write: bool) -> Result<bool> {
        self.virtual_memory_event_exempt(address, size, write, false, None)
    }

    pub fn virtual_memory_event_precise(&self, address: u64, size: u64, write: bool) -> Result<bool> {
        self.virtual_memory_event_exempt(address, size, write, true, None)
    }

    /// Signals an access to every handle overlapping the range except those with the exempt id.
    /// Fails with `InvalidMemoryRegion` when nothing tracks the range and it isn't mapped.
    pub fn virtual_memory_event_exempt(&self, address: u64, size: u64, write: bool, precise: bool, exempt_id: Option<i32>) -> Result<bool> {
        let mut state = self.inner.state.lock();
        let keys = state.overlapping_keys(address, size.max(1));

        if keys.is_empty() && !precise {
            if self.inner.mm.is_range_mapped(address, size) {
                // Stale protection with no handle left behind it
                let (page_address, page_size) = self.page_align_range(address, size.max(1))?;
                self.inner.mm.tracking_reprotect(page_address, page_size, MemoryPermission::ReadAndWrite())?;
                return Ok(true);
            }

            drop(state);
            let handler = self.inner.invalid_access_handler.lock().clone();
            if let Some(handler) = handler {
                handler(address);
            }
            return result::ResultInvalidMemoryRegion::make_err();
        }

        for key in keys {
            let handles = match state.regions.get(&key) {
                Some(region) => region.handles.clone(),
                None => continue
            };

            let mut all_precise = true;
            for handle in handles.iter() {
                if exempt_id == Some(handle.id) {
                    continue;
                }

                if precise {
                    all_precise &= Self::signal_handle_precise(handle, address, size, write, &mut state);
                }
                else {
                    Self::signal_handle(handle, address, size, write, &mut state);
                    all_precise = false;
                }
            }

            if !all_precise {
                state.update_protection(self.inner.mm.as_ref(), key)?;
            }
        }

        Ok(true)
    }

    fn signal_handle(handle: &Arc<HandleState>, address: u64, size: u64, write: bool, state: &mut MutexGuard<'_, TrackingState>) {
        if handle.is_unmapped() || handle.is_disposed() {
            return;
        }

        // Taking the action hands it to exactly one signaling thread
        if let Some(action) = handle.take_action() {
            let (action_address, action_size) = handle.clamp_range(address, size);
            MutexGuard::unlocked(state, || action(action_address, action_size));
        }

        if write {
            let was_dirty = handle.set_dirty(true);
            handle.signal_parent();

            if !was_dirty {
                if let Some(dirty_event) = handle.get_dirty_event() {
                    MutexGuard::unlocked(state, || dirty_event());
                }
            }
        }
    }

    fn signal_handle_precise(handle: &Arc<HandleState>, address: u64, size: u64, write: bool, state: &mut MutexGuard<'_, TrackingState>) -> bool {
        if !handle.is_unmapped() && !handle.is_disposed() {
            if let Some(precise_action) = handle.get_precise_action() {
                if MutexGuard::unlocked(state, || precise_action(address, size, write)) {
                    return true;
                }
            }
        }

        Self::signal_handle(handle, address, size, write, state);
        false
    }
}

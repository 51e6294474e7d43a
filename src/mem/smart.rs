use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use parking_lot::Mutex;
use crate::result::*;
use crate::util;
use super::handle::{PreciseRegionSignal, RegionHandle, RegionSignal};
use super::multi::{DirtyRangeCollector, MultiRegion};
use super::tracking::MemoryTracking;
use super::result;

/// A granular handle whose sub-handles are created lazily and split to match the ranges being queried.
/// Sub-handles are stored at the granule index they start at; the slots they cover beyond that stay empty.
/// Actions registered over a range are kept so that sub-handles created there later get them too.
pub struct SmartMultiRegionHandle {
    tracking: MemoryTracking,
    address: u64,
    size: u64,
    granularity: u64,
    id: i32,
    handles: Mutex<Vec<Option<RegionHandle>>>,
    actions: Mutex<Vec<RangeAction<RegionSignal>>>,
    precise_actions: Mutex<Vec<RangeAction<PreciseRegionSignal>>>,
    dirty: Arc<AtomicBool>,
    disposed: AtomicBool
}

struct RangeAction<T> {
    address: u64,
    size: u64,
    action: T
}

impl<T> RangeAction<T> {
    fn overlaps_with(&self, address: u64, size: u64) -> bool {
        self.address < address.saturating_add(size) && address < self.address.saturating_add(self.size)
    }
}

/// Registrations fully covered by the new one are dropped.
fn push_range_action<T>(actions: &mut Vec<RangeAction<T>>, address: u64, size: u64, action: T) {
    let end = address.saturating_add(size);
    actions.retain(|r_action| (r_action.address < address) || (r_action.address.saturating_add(r_action.size) > end));
    actions.push(RangeAction { address, size, action });
}

/// The latest registration overlapping the range, if any.
fn find_range_action<T: Clone>(actions: &[RangeAction<T>], address: u64, size: u64) -> Option<T> {
    actions.iter().rev().find(|r_action| r_action.overlaps_with(address, size)).map(|r_action| r_action.action.clone())
}

impl SmartMultiRegionHandle {
    pub(crate) fn new(tracking: &MemoryTracking, address: u64, size: u64, granularity: u64, id: i32) -> Result<Self> {
        result_return_unless!(granularity != 0 && util::is_aligned(granularity, tracking.get_page_size()), result::ResultInvalidGranularity);
        result_return_unless!(util::is_aligned(address, tracking.get_page_size()), result::ResultInvalidMemoryRegion);
        result_return_unless!(size != 0 && address.checked_add(size).is_some(), result::ResultRangeOutOfBounds);

        let handle_count = ((size + granularity - 1) / granularity) as usize;
        let mut handles = Vec::with_capacity(handle_count);
        handles.resize_with(handle_count, || None);

        Ok(Self {
            tracking: tracking.clone(),
            address,
            size,
            granularity,
            id,
            handles: Mutex::new(handles),
            actions: Mutex::new(Vec::new()),
            precise_actions: Mutex::new(Vec::new()),
            dirty: Arc::new(AtomicBool::new(true)),
            disposed: AtomicBool::new(false)
        })
    }

    #[inline]
    fn handles_to_bytes(&self, handle_count: usize) -> u64 {
        handle_count as u64 * self.granularity
    }

    pub fn get_handle_count(&self) -> usize {
        self.handles.lock().iter().filter(|handle| handle.is_some()).count()
    }

    fn begin_sub_tracking(&self, address: u64, size: u64, action: Option<RegionSignal>, precise_action: Option<PreciseRegionSignal>) -> Result<RegionHandle> {
        let handle = self.tracking.begin_tracking(address, size, self.id)?;
        handle.set_parent_dirty(self.dirty.clone());
        if let Some(action) = action {
            handle.register_action(action)?;
        }
        if let Some(precise_action) = precise_action {
            handle.register_precise_action(precise_action)?;
        }
        Ok(handle)
    }

    fn split_handle(&self, handles: &mut [Option<RegionHandle>], handle_idx: usize, split_idx: usize) -> Result<()> {
        let handle = match handles[handle_idx].take() {
            Some(handle) => handle,
            None => return Ok(())
        };

        let action = handle.get_action();
        let precise_action = handle.get_precise_action();
        let old_size = handle.get_size();
        handle.dispose()?;

        let address = self.address + self.handles_to_bytes(handle_idx);
        let low_size = self.handles_to_bytes(split_idx - handle_idx);
        handles[handle_idx] = Some(self.begin_sub_tracking(address, low_size, action.clone(), precise_action.clone())?);
        handles[split_idx] = Some(self.begin_sub_tracking(address + low_size, old_size - low_size, action, precise_action)?);
        Ok(())
    }

    fn create_handle(&self, handles: &mut [Option<RegionHandle>], start_idx: usize, last_idx: usize) -> Result<()> {
        let start_address = self.address + self.handles_to_bytes(start_idx);

        // A handle starting before us may cover this slot, in which case splitting it fills the slot
        for i in (0..start_idx).rev() {
            if let Some(handle) = handles[i].as_ref() {
                if handle.get_end_address() > start_address {
                    return self.split_handle(handles, i, start_idx);
                }
                break;
            }
        }

        let mut end_idx = last_idx + 1;
        for i in (start_idx + 1)..=last_idx {
            if handles[i].is_some() {
                end_idx = i;
                break;
            }
        }

        let size = self.handles_to_bytes(end_idx - start_idx);
        let action = find_range_action(&self.actions.lock(), start_address, size);
        let precise_action = find_range_action(&self.precise_actions.lock(), start_address, size);
        handles[start_idx] = Some(self.begin_sub_tracking(start_address, size, action, precise_action)?);
        Ok(())
    }

    fn index_range(&self, address: u64, size: u64) -> Result<Option<(usize, usize)>> {
        if size == 0 {
            return Ok(None);
        }
        result_return_unless!(address >= self.address, result::ResultRangeOutOfBounds);
        result_return_unless!(address.checked_add(size).map_or(false, |end| end <= self.address + self.size), result::ResultRangeOutOfBounds);

        let start_idx = ((address - self.address) / self.granularity) as usize;
        let last_idx = ((address + size - 1 - self.address) / self.granularity) as usize;
        Ok(Some((start_idx, last_idx)))
    }

    fn query_modified_impl(&self, address: u64, size: u64, modified_fn: &mut dyn FnMut(u64, u64), seq: Option<i32>) -> Result<()> {
        result_return_if!(self.disposed.load(Ordering::SeqCst), ResultObjectDisposed);

        let (start_idx, last_idx) = match self.index_range(address, size)? {
            Some(range) => range,
            None => return Ok(())
        };

        let end_address = self.address + self.handles_to_bytes(last_idx + 1);
        let mut collector = DirtyRangeCollector::new(self.address + self.handles_to_bytes(start_idx));

        {
            let mut handles = self.handles.lock();
            let mut i = start_idx;
            while i <= last_idx {
                if handles[i].is_none() {
                    self.create_handle(&mut handles, i, last_idx)?;
                }
                if handles[i].as_ref().map_or(false, |handle| handle.get_end_address() > end_address) {
                    self.split_handle(&mut handles, i, last_idx + 1)?;
                }

                let handle = match handles[i].as_ref() {
                    Some(handle) => handle,
                    None => return result::ResultInvalidMemoryRegion::make_err()
                };

                let consumable = match seq {
                    Some(seq) => handle.get_sequence_number() != Some(seq),
                    None => true
                };
                if consumable && handle.dirty() {
                    collector.add_dirty(handle.get_size());
                    handle.reprotect(false)?;
                }
                else {
                    collector.add_clean(handle.get_end_address());
                }
                if let Some(seq) = seq {
                    handle.set_sequence_number(seq);
                }

                i += (handle.get_size() / self.granularity) as usize;
            }
        }

        collector.finish(modified_fn);
        Ok(())
    }
}

impl MultiRegion for SmartMultiRegionHandle {
    fn get_address(&self) -> u64 {
        self.address
    }

    fn get_size(&self) -> u64 {
        self.size
    }

    fn dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn force_dirty(&self, address: u64, size: u64) {
        self.dirty.store(true, Ordering::SeqCst);
        for handle in self.handles.lock().iter().flatten() {
            if handle.overlaps_with(address, size) {
                handle.force_dirty();
            }
        }
    }

    fn query_modified_all(&self, modified_fn: &mut dyn FnMut(u64, u64)) -> Result<()> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.query_modified_impl(self.address, self.size, modified_fn, None)
    }

    fn query_modified(&self, address: u64, size: u64, modified_fn: &mut dyn FnMut(u64, u64)) -> Result<()> {
        self.query_modified_impl(address, size, modified_fn, None)
    }

    fn query_modified_with_sequence(&self, address: u64, size: u64, modified_fn: &mut dyn FnMut(u64, u64), seq: i32) -> Result<()> {
        self.query_modified_impl(address, size, modified_fn, Some(seq))
    }

    fn register_action(&self, address: u64, size: u64, action: RegionSignal) -> Result<()> {
        result_return_if!(self.disposed.load(Ordering::SeqCst), ResultObjectDisposed);

        let handles = self.handles.lock();
        push_range_action(&mut self.actions.lock(), address, size, action.clone());
        for handle in handles.iter().flatten() {
            if handle.overlaps_with(address, size) {
                handle.register_action(action.clone())?;
            }
        }
        Ok(())
    }

    fn register_precise_action(&self, address: u64, size: u64, action: PreciseRegionSignal) -> Result<()> {
        result_return_if!(self.disposed.load(Ordering::SeqCst), ResultObjectDisposed);

        let handles = self.handles.lock();
        push_range_action(&mut self.precise_actions.lock(), address, size, action.clone());
        for handle in handles.iter().flatten() {
            if handle.overlaps_with(address, size) {
                handle.register_precise_action(action.clone())?;
            }
        }
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        result_return_if!(self.disposed.swap(true, Ordering::SeqCst), ResultObjectDisposed);

        let mut handles = self.handles.lock();
        for handle in handles.iter_mut().filter_map(|handle| handle.take()) {
            handle.dispose()?;
        }
        Ok(())
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use crate::result::*;
use crate::util;
use super::bitmap::ConcurrentBitmap;
use super::handle::{PreciseRegionSignal, RegionHandle, RegionSignal};
use super::tracking::MemoryTracking;
use super::result;

/// Common interface of handles that split a tracked range into granular sub-handles.
pub trait MultiRegion: Send + Sync {
    fn get_address(&self) -> u64;
    fn get_size(&self) -> u64;
    fn dirty(&self) -> bool;
    fn force_dirty(&self, address: u64, size: u64);
    fn query_modified_all(&self, modified_fn: &mut dyn FnMut(u64, u64)) -> Result<()>;
    fn query_modified(&self, address: u64, size: u64, modified_fn: &mut dyn FnMut(u64, u64)) -> Result<()>;
    fn query_modified_with_sequence(&self, address: u64, size: u64, modified_fn: &mut dyn FnMut(u64, u64), seq: i32) -> Result<()>;
    fn register_action(&self, address: u64, size: u64, action: RegionSignal) -> Result<()>;
    fn register_precise_action(&self, address: u64, size: u64, action: PreciseRegionSignal) -> Result<()>;
    fn dispose(&self) -> Result<()>;
}

/// Accumulates adjacent dirty sub-ranges into contiguous runs.
pub(crate) struct DirtyRangeCollector {
    ranges: Vec<(u64, u64)>,
    cur_start: u64,
    cur_size: u64
}

impl DirtyRangeCollector {
    pub fn new(start: u64) -> Self {
        Self {
            ranges: Vec::new(),
            cur_start: start,
            cur_size: 0
        }
    }

    pub fn add_dirty(&mut self, size: u64) {
        self.cur_size += size;
    }

    pub fn add_clean(&mut self, end_address: u64) {
        if self.cur_size != 0 {
            self.ranges.push((self.cur_start, self.cur_size));
            self.cur_size = 0;
        }
        self.cur_start = end_address;
    }

    /// Callbacks run once every sub-handle was reprotected.
    pub fn finish(mut self, modified_fn: &mut dyn FnMut(u64, u64)) {
        if self.cur_size != 0 {
            self.ranges.push((self.cur_start, self.cur_size));
        }
        for (address, size) in self.ranges {
            modified_fn(address, size);
        }
    }
}

pub struct MultiRegionHandle {
    address: u64,
    size: u64,
    granularity: u64,
    handles: Vec<RegionHandle>,
    dirty: Arc<AtomicBool>,
    dirty_bitmap: Arc<ConcurrentBitmap>,
    disposed: AtomicBool
}

impl MultiRegionHandle {
    pub(crate) fn new(tracking: &MemoryTracking, address: u64, size: u64, inherited_handles: Option<Vec<RegionHandle>>, granularity: u64, id: i32) -> Result<Self> {
        result_return_unless!(granularity != 0 && util::is_aligned(granularity, tracking.get_page_size()), result::ResultInvalidGranularity);
        result_return_unless!(util::is_aligned(address, tracking.get_page_size()), result::ResultInvalidMemoryRegion);
        result_return_unless!(size != 0 && address.checked_add(size).is_some(), result::ResultRangeOutOfBounds);

        let handle_count = ((size + granularity - 1) / granularity) as usize;
        let dirty = Arc::new(AtomicBool::new(true));
        let dirty_bitmap = Arc::new(ConcurrentBitmap::new(handle_count, true));
        let mut handles: Vec<RegionHandle> = Vec::with_capacity(handle_count);

        let create_sub_handle = |idx: usize| -> Result<RegionHandle> {
            let handle = tracking.create_handle(address + idx as u64 * granularity, granularity, Some((dirty_bitmap.clone(), idx)), id)?;
            handle.set_parent_dirty(dirty.clone());
            Ok(handle)
        };

        let mut inherited_handles = inherited_handles.unwrap_or_default();
        inherited_handles.sort_by_key(|handle| handle.get_address());

        for handle in inherited_handles {
            result_return_unless!(handle.get_address() >= address + handles.len() as u64 * granularity, result::ResultRangeOutOfBounds);
            result_return_unless!(handle.get_end_address() <= address + size, result::ResultRangeOutOfBounds);
            result_return_unless!(util::is_aligned(handle.get_address() - address, granularity), result::ResultInvalidGranularity);

            let start_idx = ((handle.get_address() - address) / granularity) as usize;
            while handles.len() < start_idx {
                handles.push(create_sub_handle(handles.len())?);
            }

            if handle.get_size() == granularity {
                handle.replace_dirty_storage(dirty_bitmap.clone(), start_idx);
                handle.set_parent_dirty(dirty.clone());
                handles.push(handle);
            }
            else {
                // Every split keeps the old dirty state and pending actions
                let end_idx = ((handle.get_end_address() - address + granularity - 1) / granularity) as usize;
                while handles.len() < end_idx {
                    let split = create_sub_handle(handles.len())?;
                    split.reprotect(handle.dirty())?;
                    if let Some(action) = handle.get_action() {
                        split.register_action(action)?;
                    }
                    if let Some(precise_action) = handle.get_precise_action() {
                        split.register_precise_action(precise_action)?;
                    }
                    handles.push(split);
                }
                handle.dispose()?;
            }
        }

        while handles.len() < handle_count {
            handles.push(create_sub_handle(handles.len())?);
        }

        Ok(Self {
            address,
            size,
            granularity,
            handles,
            dirty,
            dirty_bitmap,
            disposed: AtomicBool::new(false)
        })
    }

    #[inline]
    pub fn get_granularity(&self) -> u64 {
        self.granularity
    }

    #[inline]
    pub fn get_handles(&self) -> &[RegionHandle] {
        &self.handles
    }

    /// Gives up the sub-handles so a new granular handle can inherit them.
    pub fn into_handles(self) -> Vec<RegionHandle> {
        self.handles
    }

    fn handle_index_range(&self, address: u64, size: u64) -> Result<Option<(usize, usize)>> {
        if size == 0 {
            return Ok(None);
        }
        result_return_unless!(address >= self.address, result::ResultRangeOutOfBounds);
        result_return_unless!(address.checked_add(size).map_or(false, |end| end <= self.address + self.size), result::ResultRangeOutOfBounds);

        let start_idx = ((address - self.address) / self.granularity) as usize;
        let last_idx = ((address + size - 1 - self.address) / self.granularity) as usize;
        Ok(Some((start_idx, last_idx)))
    }

    fn overlapping_handles(&self, address: u64, size: u64) -> impl Iterator<Item = &RegionHandle> {
        self.handles.iter().filter(move |handle| handle.overlaps_with(address, size))
    }
}

impl MultiRegion for MultiRegionHandle {
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
        for handle in self.overlapping_handles(address, size) {
            handle.force_dirty();
        }
    }

    fn query_modified_all(&self, modified_fn: &mut dyn FnMut(u64, u64)) -> Result<()> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.query_modified(self.address, self.size, modified_fn)
    }

    fn query_modified(&self, address: u64, size: u64, modified_fn: &mut dyn FnMut(u64, u64)) -> Result<()> {
        let (start_idx, last_idx) = match self.handle_index_range(address, size)? {
            Some(range) => range,
            None => return Ok(())
        };

        if !self.dirty_bitmap.any_set_in(start_idx, last_idx + 1) {
            return Ok(());
        }

        let mut collector = DirtyRangeCollector::new(self.handles[start_idx].get_address());
        for handle in self.handles[start_idx..=last_idx].iter() {
            if handle.dirty() {
                collector.add_dirty(handle.get_size());
                handle.reprotect(false)?;
            }
            else {
                collector.add_clean(handle.get_end_address());
            }
        }

        collector.finish(modified_fn);
        Ok(())
    }

    fn query_modified_with_sequence(&self, address: u64, size: u64, modified_fn: &mut dyn FnMut(u64, u64), seq: i32) -> Result<()> {
        let (start_idx, last_idx) = match self.handle_index_range(address, size)? {
            Some(range) => range,
            None => return Ok(())
        };

        let mut collector = DirtyRangeCollector::new(self.handles[start_idx].get_address());
        for handle in self.handles[start_idx..=last_idx].iter() {
            if (handle.get_sequence_number() != Some(seq)) && handle.dirty() {
                collector.add_dirty(handle.get_size());
                handle.reprotect(false)?;
            }
            else {
                collector.add_clean(handle.get_end_address());
            }
            handle.set_sequence_number(seq);
        }

        collector.finish(modified_fn);
        Ok(())
    }

    fn register_action(&self, address: u64, size: u64, action: RegionSignal) -> Result<()> {
        for handle in self.overlapping_handles(address, size) {
            handle.register_action(action.clone())?;
        }
        Ok(())
    }

    fn register_precise_action(&self, address: u64, size: u64, action: PreciseRegionSignal) -> Result<()> {
        for handle in self.overlapping_handles(address, size) {
            handle.register_precise_action(action.clone())?;
        }
        Ok(())
    }

    fn dispose(&self) -> Result<()> {
        result_return_if!(self.disposed.swap(true, Ordering::SeqCst), ResultObjectDisposed);

        for handle in self.handles.iter() {
            handle.dispose()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use rand::seq::SliceRandom;
    use crate::mem::PageTableMemoryManager;

    const PAGE_SIZE: u64 = 0x1000;
    const PAGE_COUNT: u64 = 32;

    fn make_tracking(page_count: u64) -> MemoryTracking {
        let mm = Arc::new(PageTableMemoryManager::new(PAGE_SIZE));
        mm.map(0, PAGE_SIZE * page_count);
        MemoryTracking::new(mm, PAGE_SIZE).unwrap()
    }

    fn make_granular(tracking: &MemoryTracking, smart: bool, address: u64, size: u64, granularity: u64) -> Box<dyn MultiRegion> {
        match smart {
            true => Box::new(tracking.begin_smart_granular_tracking(address, size, granularity, 0).unwrap()),
            false => Box::new(tracking.begin_granular_tracking(address, size, None, granularity, 0).unwrap())
        }
    }

    fn collect_modified(handle: &dyn MultiRegion, address: u64, size: u64, seq: Option<i32>) -> Vec<(u64, u64)> {
        let mut ranges = Vec::new();
        let mut add_range = |address, size| ranges.push((address, size));
        match seq {
            Some(seq) => handle.query_modified_with_sequence(address, size, &mut add_range, seq).unwrap(),
            None => handle.query_modified(address, size, &mut add_range).unwrap()
        };
        ranges
    }

    /// Queries every page on its own in random order, leaving a handle per page behind.
    fn prepare_pages(handle: &dyn MultiRegion, page_count: u64) {
        let mut pages: Vec<u64> = (0..page_count).collect();
        pages.shuffle(&mut rand::thread_rng());

        for page in pages {
            let ranges = collect_modified(handle, page * PAGE_SIZE, PAGE_SIZE, None);
            assert_eq!(ranges, vec![(page * PAGE_SIZE, PAGE_SIZE)]);
        }
    }

    fn write_pages_in_random_order(tracking: &MemoryTracking, mut pages: Vec<u64>) {
        pages.shuffle(&mut rand::thread_rng());
        for page in pages {
            tracking.virtual_memory_event(page * PAGE_SIZE, PAGE_SIZE, true).unwrap();
        }
    }

    fn check_dirty_region_ordering(smart: bool) {
        let tracking = make_tracking(PAGE_COUNT);
        let handle = make_granular(&tracking, smart, 0, PAGE_SIZE * PAGE_COUNT, PAGE_SIZE);
        prepare_pages(handle.as_ref(), PAGE_COUNT);

        let odd: Vec<u64> = (0..PAGE_COUNT / 2).map(|i| i * 2 + 1).collect();
        let even: Vec<u64> = (0..PAGE_COUNT / 2).map(|i| i * 2).collect();

        write_pages_in_random_order(&tracking, odd.clone());
        let ranges = collect_modified(handle.as_ref(), 0, PAGE_SIZE * PAGE_COUNT, None);
        let expected: Vec<(u64, u64)> = odd.iter().map(|page| (page * PAGE_SIZE, PAGE_SIZE)).collect();
        assert_eq!(ranges, expected);

        write_pages_in_random_order(&tracking, even.clone());
        let ranges = collect_modified(handle.as_ref(), 0, PAGE_SIZE * PAGE_COUNT, None);
        let expected: Vec<(u64, u64)> = even.iter().map(|page| (page * PAGE_SIZE, PAGE_SIZE)).collect();
        assert_eq!(ranges, expected);

        // Adjacent dirty pages are reported as one range
        write_pages_in_random_order(&tracking, (0..PAGE_COUNT).filter(|page| page % 4 != 3).collect());
        let ranges = collect_modified(handle.as_ref(), 0, PAGE_SIZE * PAGE_COUNT, None);
        let expected: Vec<(u64, u64)> = (0..PAGE_COUNT / 4).map(|i| (i * 4 * PAGE_SIZE, PAGE_SIZE * 3)).collect();
        assert_eq!(ranges, expected);
    }

    #[test]
    fn dirty_region_ordering() {
        check_dirty_region_ordering(false);
    }

    #[test]
    fn dirty_region_ordering_smart() {
        check_dirty_region_ordering(true);
    }

    fn check_sequence_number(smart: bool) {
        let tracking = make_tracking(PAGE_COUNT);
        let handle = make_granular(&tracking, smart, 0, PAGE_SIZE * PAGE_COUNT, PAGE_SIZE);
        prepare_pages(handle.as_ref(), PAGE_COUNT);

        let odd: Vec<u64> = (0..PAGE_COUNT / 2).map(|i| i * 2 + 1).collect();
        write_pages_in_random_order(&tracking, odd.clone());

        // Only the odd pages get sequence number 1
        let mut odd_region_count = 0;
        for page in odd.iter() {
            odd_region_count += collect_modified(handle.as_ref(), page * PAGE_SIZE, PAGE_SIZE, Some(1)).len();
        }
        assert_eq!(odd_region_count, (PAGE_COUNT / 2) as usize);

        tracking.virtual_memory_event(0, PAGE_SIZE * PAGE_COUNT, true).unwrap();

        let even_ranges = collect_modified(handle.as_ref(), 0, PAGE_SIZE * PAGE_COUNT, Some(1));
        let expected: Vec<(u64, u64)> = (0..PAGE_COUNT / 2).map(|i| (i * 2 * PAGE_SIZE, PAGE_SIZE)).collect();
        assert_eq!(even_ranges, expected);

        // Same sequence number, nothing new to consume
        assert!(collect_modified(handle.as_ref(), 0, PAGE_SIZE * PAGE_COUNT, Some(1)).is_empty());

        let odd_ranges = collect_modified(handle.as_ref(), 0, PAGE_SIZE * PAGE_COUNT, Some(2));
        assert_eq!(odd_ranges.len(), (PAGE_COUNT / 2) as usize);
        assert!(odd_ranges.iter().all(|(address, _)| (address / PAGE_SIZE) % 2 == 1));
    }

    #[test]
    fn sequence_number() {
        check_sequence_number(false);
    }

    #[test]
    fn sequence_number_smart() {
        check_sequence_number(true);
    }

    #[test]
    fn query_modified_all_uses_parent_dirty_flag() {
        let tracking = make_tracking(PAGE_COUNT);
        let handle = make_granular(&tracking, false, 0, PAGE_SIZE * 8, PAGE_SIZE);

        let mut ranges = Vec::new();
        handle.query_modified_all(&mut |address, size| ranges.push((address, size))).unwrap();
        assert_eq!(ranges, vec![(0, PAGE_SIZE * 8)]);
        assert!(!handle.dirty());

        ranges.clear();
        handle.query_modified_all(&mut |address, size| ranges.push((address, size))).unwrap();
        assert!(ranges.is_empty());

        tracking.virtual_memory_event(PAGE_SIZE * 5, 1, true).unwrap();
        assert!(handle.dirty());
        handle.query_modified_all(&mut |address, size| ranges.push((address, size))).unwrap();
        assert_eq!(ranges, vec![(PAGE_SIZE * 5, PAGE_SIZE)]);

        ranges.clear();
        handle.force_dirty(PAGE_SIZE * 2, PAGE_SIZE * 2);
        handle.query_modified_all(&mut |address, size| ranges.push((address, size))).unwrap();
        assert_eq!(ranges, vec![(PAGE_SIZE * 2, PAGE_SIZE * 2)]);
    }

    #[test]
    fn query_out_of_bounds() {
        let tracking = make_tracking(PAGE_COUNT);
        let handle = tracking.begin_granular_tracking(PAGE_SIZE * 4, PAGE_SIZE * 4, None, PAGE_SIZE, 0).unwrap();

        let rc = handle.query_modified(0, PAGE_SIZE, &mut |_, _| {}).unwrap_err();
        assert!(result::ResultRangeOutOfBounds::matches(rc));
        let rc = handle.query_modified(PAGE_SIZE * 7, PAGE_SIZE * 2, &mut |_, _| {}).unwrap_err();
        assert!(result::ResultRangeOutOfBounds::matches(rc));

        let rc = tracking.begin_granular_tracking(0, PAGE_SIZE, None, PAGE_SIZE + 1, 0).err().unwrap();
        assert!(result::ResultInvalidGranularity::matches(rc));
    }

    #[test]
    fn register_action_on_sub_range() {
        let tracking = make_tracking(PAGE_COUNT);
        let handle = tracking.begin_granular_tracking(0, PAGE_SIZE * 8, None, PAGE_SIZE, 0).unwrap();
        handle.query_modified_all(&mut |_, _| {}).unwrap();

        let triggered = Arc::new(AtomicUsize::new(0));
        let triggered_c = triggered.clone();
        handle.register_action(PAGE_SIZE * 2, PAGE_SIZE * 2, Arc::new(move |_, _| { triggered_c.fetch_add(1, Ordering::SeqCst); })).unwrap();

        tracking.virtual_memory_event(PAGE_SIZE, 1, false).unwrap();
        assert_eq!(triggered.load(Ordering::SeqCst), 0);
        tracking.virtual_memory_event(PAGE_SIZE * 3, 1, false).unwrap();
        assert_eq!(triggered.load(Ordering::SeqCst), 1);

        // Reads don't dirty anything
        assert!(collect_modified(&handle, 0, PAGE_SIZE * 8, None).is_empty());
    }

    #[test]
    fn granular_handles_inherit_existing_handles() {
        let tracking = make_tracking(PAGE_COUNT);

        let single = tracking.begin_tracking(PAGE_SIZE * 2, PAGE_SIZE, 0).unwrap();
        single.reprotect(false).unwrap();

        let big = tracking.begin_tracking(PAGE_SIZE * 4, PAGE_SIZE * 4, 0).unwrap();
        big.reprotect(true).unwrap();
        let triggered = Arc::new(AtomicUsize::new(0));
        let triggered_c = triggered.clone();
        big.register_action(Arc::new(move |_, _| { triggered_c.fetch_add(1, Ordering::SeqCst); })).unwrap();

        let handle = tracking.begin_granular_tracking(0, PAGE_SIZE * 8, Some(vec![big, single]), PAGE_SIZE, 0).unwrap();
        assert_eq!(handle.get_handles().len(), 8);
        assert_eq!(tracking.get_region_count(), 8);

        // Page 2 was clean, the splits of the big handle stayed dirty
        let ranges = collect_modified(&handle, 0, PAGE_SIZE * 8, None);
        assert_eq!(ranges, vec![(0, PAGE_SIZE * 2), (PAGE_SIZE * 3, PAGE_SIZE * 5)]);

        // Each split carries its own copy of the action
        tracking.virtual_memory_event(PAGE_SIZE * 5, 1, false).unwrap();
        assert_eq!(triggered.load(Ordering::SeqCst), 1);
        tracking.virtual_memory_event(PAGE_SIZE * 5, 1, false).unwrap();
        assert_eq!(triggered.load(Ordering::SeqCst), 1);
        tracking.virtual_memory_event(PAGE_SIZE * 6, 1, false).unwrap();
        assert_eq!(triggered.load(Ordering::SeqCst), 2);

        // Writing to the inherited page goes through the shared bitmap
        tracking.virtual_memory_event(PAGE_SIZE * 2, 1, true).unwrap();
        assert_eq!(collect_modified(&handle, 0, PAGE_SIZE * 8, None), vec![(PAGE_SIZE * 2, PAGE_SIZE)]);

        handle.dispose().unwrap();
        assert_eq!(tracking.get_region_count(), 0);
        let rc = handle.dispose().unwrap_err();
        assert!(ResultObjectDisposed::matches(rc));
    }

    #[test]
    fn inherit_from_previous_granular_handle() {
        let tracking = make_tracking(PAGE_COUNT);
        let old_handle = tracking.begin_granular_tracking(0, PAGE_SIZE * 4, None, PAGE_SIZE, 0).unwrap();
        old_handle.query_modified_all(&mut |_, _| {}).unwrap();
        tracking.virtual_memory_event(PAGE_SIZE, 1, true).unwrap();

        let handle = tracking.begin_granular_tracking(0, PAGE_SIZE * 8, Some(old_handle.into_handles()), PAGE_SIZE, 0).unwrap();
        assert_eq!(collect_modified(&handle, 0, PAGE_SIZE * 8, None), vec![(PAGE_SIZE, PAGE_SIZE), (PAGE_SIZE * 4, PAGE_SIZE * 4)]);
        assert_eq!(tracking.get_region_count(), 8);
    }
}

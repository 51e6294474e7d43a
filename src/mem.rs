use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use parking_lot::Mutex;
use crate::result::*;
use crate::util;

pub mod result;

pub mod bitmap;

pub mod handle;

pub mod tracking;
use tracking::MemoryTracking;

pub mod multi;

pub mod smart;

bit_enum! {
    MemoryPermission (u32) {
        None = 0,
        Read = bit!(0),
        Write = bit!(1),
        ReadAndWrite = bit_group!(Self [Read, Write]).get(),
        Execute = bit!(2),
        Invalid = 0xFF
    }
}

/// Host side of guest memory: the tracker asks it whether ranges are mapped and pushes page protection changes into it.
pub trait VirtualMemoryManager: Send + Sync {
    fn is_range_mapped(&self, va: u64, size: u64) -> bool;
    fn tracking_reprotect(&self, va: u64, size: u64, perm: MemoryPermission) -> Result<()>;
}

// PageTableMemoryManager

pub struct PageTableMemoryManager {
    page_size: u64,
    pages: Mutex<BTreeMap<u64, MemoryPermission>>,
    reprotect_count: AtomicU64
}

impl PageTableMemoryManager {
    pub fn new(page_size: u64) -> Self {
        Self {
            page_size,
            pages: Mutex::new(BTreeMap::new()),
            reprotect_count: AtomicU64::new(0)
        }
    }

    #[inline]
    pub fn get_page_size(&self) -> u64 {
        self.page_size
    }

    fn page_range(&self, va: u64, size: u64) -> std::ops::RangeInclusive<u64> {
        let start = util::align_down(va, self.page_size) / self.page_size;
        let end = util::align_down(va.saturating_add(size.max(1) - 1), self.page_size) / self.page_size;
        start..=end
    }

    /// Maps the pages covering the range as readable and writable. Already mapped pages keep their protection.
    pub fn map(&self, va: u64, size: u64) {
        let mut pages = self.pages.lock();
        for page in self.page_range(va, size) {
            pages.entry(page).or_insert(MemoryPermission::ReadAndWrite());
        }
    }

    pub fn unmap(&self, va: u64, size: u64) -> Result<()> {
        let mut pages = self.pages.lock();
        let range = self.page_range(va, size);
        result_return_unless!(range.clone().all(|page| pages.contains_key(&page)), result::ResultUnmappedRange);

        for page in range {
            pages.remove(&page);
        }
        Ok(())
    }

    pub fn get_permission(&self, va: u64) -> Option<MemoryPermission> {
        let page = util::align_down(va, self.page_size) / self.page_size;
        self.pages.lock().get(&page).copied()
    }

    pub fn get_reprotect_count(&self) -> u64 {
        self.reprotect_count.load(Ordering::SeqCst)
    }

    /// Performs a guest access against the page table, trapping into the tracker when the pages don't allow it.
    /// Returns whether the access trapped.
    pub fn simulate_access(&self, tracking: &MemoryTracking, va: u64, size: u64, write: bool) -> Result<bool> {
        let needed = match write {
            true => MemoryPermission::Write(),
            false => MemoryPermission::Read()
        };

        let trapped = {
            let pages = self.pages.lock();
            self.page_range(va, size).any(|page| match pages.get(&page) {
                Some(perm) => !perm.contains_all(needed),
                None => true
            })
        };

        if trapped {
            tracking.virtual_memory_event(va, size, write)?;
        }
        Ok(trapped)
    }
}

impl VirtualMemoryManager for PageTableMemoryManager {
    fn is_range_mapped(&self, va: u64, size: u64) -> bool {
        let pages = self.pages.lock();
        self.page_range(va, size).all(|page| pages.contains_key(&page))
    }

    fn tracking_reprotect(&self, va: u64, size: u64, perm: MemoryPermission) -> Result<()> {
        result_return_unless!(perm != MemoryPermission::Invalid(), result::ResultInvalidMemoryRegion);

        let mut pages = self.pages.lock();
        for page in self.page_range(va, size) {
            // Unmapped pages have nothing to protect
            if let Some(page_perm) = pages.get_mut(&page) {
                *page_perm = perm;
            }
        }

        self.reprotect_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_SIZE: u64 = 0x1000;

    #[test]
    fn map_and_unmap_pages() {
        let mm = PageTableMemoryManager::new(PAGE_SIZE);
        assert!(!mm.is_range_mapped(0, PAGE_SIZE));

        mm.map(0, PAGE_SIZE * 2);
        assert!(mm.is_range_mapped(0x10, PAGE_SIZE + 0x10));
        assert!(!mm.is_range_mapped(PAGE_SIZE, PAGE_SIZE * 2));
        assert_eq!(mm.get_permission(PAGE_SIZE + 4), Some(MemoryPermission::ReadAndWrite()));

        mm.unmap(PAGE_SIZE, PAGE_SIZE).unwrap();
        assert_eq!(mm.get_permission(PAGE_SIZE), None);

        let rc = mm.unmap(0, PAGE_SIZE * 2).unwrap_err();
        assert!(result::ResultUnmappedRange::matches(rc));
        assert!(mm.is_range_mapped(0, PAGE_SIZE));
    }

    #[test]
    fn reprotect_skips_unmapped_pages() {
        let mm = PageTableMemoryManager::new(PAGE_SIZE);
        mm.map(0, PAGE_SIZE);

        mm.tracking_reprotect(0, PAGE_SIZE * 2, MemoryPermission::Read()).unwrap();
        assert_eq!(mm.get_permission(0), Some(MemoryPermission::Read()));
        assert_eq!(mm.get_permission(PAGE_SIZE), None);
        assert_eq!(mm.get_reprotect_count(), 1);

        let rc = mm.tracking_reprotect(0, PAGE_SIZE, MemoryPermission::Invalid()).unwrap_err();
        assert!(result::ResultInvalidMemoryRegion::matches(rc));
    }
}

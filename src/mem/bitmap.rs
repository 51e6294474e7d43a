use std::sync::atomic::{AtomicU64, Ordering};

const BITS_PER_WORD: usize = u64::BITS as usize;

/// Fixed-size bitmap whose bits can be flipped from any thread without a lock.
pub struct ConcurrentBitmap {
    words: Vec<AtomicU64>,
    count: usize
}

impl ConcurrentBitmap {
    pub fn new(count: usize, set: bool) -> Self {
        let word_count = (count + BITS_PER_WORD - 1) / BITS_PER_WORD;
        let words = (0..word_count).map(|word_idx| {
            let value = match set {
                true => Self::word_mask(count, word_idx),
                false => 0
            };
            AtomicU64::new(value)
        }).collect();

        Self {
            words,
            count
        }
    }

    fn word_mask(count: usize, word_idx: usize) -> u64 {
        let remaining = count - word_idx * BITS_PER_WORD;
        match remaining >= BITS_PER_WORD {
            true => u64::MAX,
            false => (1u64 << remaining) - 1
        }
    }

    #[inline]
    pub fn get_count(&self) -> usize {
        self.count
    }

    #[inline]
    pub fn is_set(&self, idx: usize) -> bool {
        let bit = 1u64 << (idx % BITS_PER_WORD);
        (self.words[idx / BITS_PER_WORD].load(Ordering::SeqCst) & bit) != 0
    }

    /// Sets or clears a bit, returning its previous value.
    pub fn set(&self, idx: usize, value: bool) -> bool {
        let bit = 1u64 << (idx % BITS_PER_WORD);
        let word = &self.words[idx / BITS_PER_WORD];
        let prev = match value {
            true => word.fetch_or(bit, Ordering::SeqCst),
            false => word.fetch_and(!bit, Ordering::SeqCst)
        };
        (prev & bit) != 0
    }

    /// Clears a bit, returning whether it was set.
    #[inline]
    pub fn clear(&self, idx: usize) -> bool {
        self.set(idx, false)
    }

    /// Checks whether any bit in [start, end) is set.
    pub fn any_set_in(&self, start: usize, end: usize) -> bool {
        let end = end.min(self.count);
        if start >= end {
            return false;
        }

        let first_word = start / BITS_PER_WORD;
        let last_word = (end - 1) / BITS_PER_WORD;
        for word_idx in first_word..=last_word {
            let mut mask = u64::MAX;
            if word_idx == first_word {
                mask &= u64::MAX << (start % BITS_PER_WORD);
            }
            if word_idx == last_word {
                let end_bit = end - word_idx * BITS_PER_WORD;
                if end_bit < BITS_PER_WORD {
                    mask &= (1u64 << end_bit) - 1;
                }
            }

            if (self.words[word_idx].load(Ordering::SeqCst) & mask) != 0 {
                return true;
            }
        }
        false
    }

    pub fn clear_all(&self) {
        for word in self.words.iter() {
            word.store(0, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_clear_bits() {
        let bitmap = ConcurrentBitmap::new(70, false);
        assert!(!bitmap.any_set_in(0, 70));

        assert!(!bitmap.set(3, true));
        assert!(bitmap.set(3, true));
        assert!(bitmap.is_set(3));

        assert!(!bitmap.set(65, true));
        assert!(bitmap.any_set_in(64, 70));
        assert!(!bitmap.any_set_in(4, 65));
        assert!(bitmap.any_set_in(3, 4));

        assert!(bitmap.clear(3));
        assert!(!bitmap.clear(3));
        bitmap.clear_all();
        assert!(!bitmap.any_set_in(0, 70));
    }

    #[test]
    fn initially_set_bitmap_stays_in_bounds() {
        let bitmap = ConcurrentBitmap::new(66, true);
        assert!(bitmap.is_set(0));
        assert!(bitmap.is_set(65));
        assert!(bitmap.any_set_in(65, 200));
        assert_eq!(bitmap.words[1].load(Ordering::SeqCst), 0b11);
    }
}

//! Growable bit array used by the physical pools and the per-region
//! copy-on-write map.

use alloc::vec;
use alloc::vec::Vec;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    /// Create a bitmap of `len` bits, all set to `value`.
    pub fn new(len: usize, value: bool) -> Self {
        let fill = if value { u64::MAX } else { 0 };
        let mut bitmap = Self {
            words: vec![fill; len.div_ceil(64)],
            len,
        };
        bitmap.clear_tail();
        bitmap
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read bit `index`.
    ///
    /// # Panics
    /// Panics if `index >= len()`.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.len, "bitmap index {} out of range {}", index, self.len);
        (self.words[index / 64] >> (index % 64)) & 1 == 1
    }

    /// Write bit `index`.
    ///
    /// # Panics
    /// Panics if `index >= len()`.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.len, "bitmap index {} out of range {}", index, self.len);
        let word = &mut self.words[index / 64];
        if value {
            *word |= 1 << (index % 64);
        } else {
            *word &= !(1 << (index % 64));
        }
    }

    /// Set every bit in `start..start + count`.
    pub fn set_range(&mut self, start: usize, count: usize, value: bool) {
        for index in start..start + count {
            self.set(index, value);
        }
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// First clear bit at or after `hint`, wrapping around once.
    pub fn find_first_unset(&self, hint: usize) -> Option<usize> {
        let hint = if hint >= self.len { 0 } else { hint };
        self.scan_unset(hint, self.len)
            .or_else(|| self.scan_unset(0, hint))
    }

    fn scan_unset(&self, from: usize, to: usize) -> Option<usize> {
        let mut index = from;
        while index < to {
            let word = self.words[index / 64];
            if word == u64::MAX {
                // Skip to the next word boundary.
                index = (index / 64 + 1) * 64;
                continue;
            }
            if (word >> (index % 64)) & 1 == 0 {
                return Some(index);
            }
            index += 1;
        }
        None
    }

    /// Start of the first run of `count` clear bits.
    pub fn find_unset_run(&self, count: usize) -> Option<usize> {
        if count == 0 || count > self.len {
            return None;
        }
        let mut run_start = 0;
        let mut run_len = 0;
        for index in 0..self.len {
            if self.get(index) {
                run_len = 0;
                run_start = index + 1;
            } else {
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            }
        }
        None
    }

    fn clear_tail(&mut self) {
        let rem = self.len % 64;
        if rem != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << rem) - 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut bitmap = Bitmap::new(130, false);
        bitmap.set(0, true);
        bitmap.set(129, true);
        assert!(bitmap.get(0));
        assert!(!bitmap.get(64));
        assert!(bitmap.get(129));
        assert_eq!(bitmap.count_ones(), 2);
    }

    #[test]
    fn test_filled_bitmap_counts_only_len() {
        let bitmap = Bitmap::new(70, true);
        assert_eq!(bitmap.count_ones(), 70);
        assert_eq!(bitmap.find_first_unset(0), None);
    }

    #[test]
    fn test_find_first_unset_wraps() {
        let mut bitmap = Bitmap::new(128, true);
        bitmap.set(3, false);
        assert_eq!(bitmap.find_first_unset(100), Some(3));
        assert_eq!(bitmap.find_first_unset(3), Some(3));
    }

    #[test]
    fn test_find_unset_run() {
        let mut bitmap = Bitmap::new(16, false);
        bitmap.set(2, true);
        bitmap.set(6, true);
        assert_eq!(bitmap.find_unset_run(3), Some(3));
        assert_eq!(bitmap.find_unset_run(9), Some(7));
        assert_eq!(bitmap.find_unset_run(10), None);
    }

    #[test]
    #[should_panic]
    fn test_out_of_range_panics() {
        Bitmap::new(8, false).get(8);
    }
}

//! Fixed-size associative cache with one-byte tags.
//!
//! Lookups are accelerated by keeping an 8-bit tag per slot in a packed
//! array, so a probe can reject most slots with a 16-wide vector compare
//! (or an 8-wide SWAR compare on other targets) before touching the full
//! keys. Hot keys bubble toward slot 0 one position per hit, and new
//! entries always enter at the coldest slot.

#![cfg_attr(not(test), no_std)]

/// Associative cache of `N` slots keyed by `i64`, tagged by one byte.
///
/// `N` must be a power of two and a multiple of 8.
#[derive(Debug)]
pub struct TagCache<V, const N: usize> {
    tags: [u8; N],
    slots: [Slot<V>; N],
    hits_one: u64,
    hits_two: u64,
    misses: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct Slot<V> {
    key: i64,
    value: V,
}

impl<V, const N: usize> TagCache<V, N>
where
    V: Copy + Default,
{
    #[must_use]
    pub fn new() -> Self {
        assert!(N.is_power_of_two());
        assert!(N % 8 == 0);
        Self {
            tags: [0; N],
            slots: [Slot::default(); N],
            hits_one: 0,
            hits_two: 0,
            misses: 0,
        }
    }

    /// Looks up `key`, promoting it one slot toward the hot end on a hit.
    ///
    /// Slot 0 is checked first without consulting the tag array. A slot
    /// whose key is the all-clear default matches a probe for that key;
    /// callers that need a stronger notion of validity encode it in `V`.
    pub fn get(&mut self, tag: u8, key: i64) -> Option<V> {
        if self.slots[0].key == key {
            self.hits_one += 1;
            return Some(self.slots[0].value);
        }
        if let Some(j) = self.search(tag, key) {
            debug_assert!(j > 0);
            self.hits_two += 1;
            let value = self.slots[j].value;
            self.tags.swap(j, j - 1);
            self.slots.swap(j, j - 1);
            return Some(value);
        }
        self.misses += 1;
        None
    }

    /// Installs `key` at the coldest slot, evicting whatever was there.
    pub fn insert(&mut self, tag: u8, key: i64, value: V) {
        self.tags[N - 1] = tag;
        self.slots[N - 1] = Slot { key, value };
    }

    /// Drops every entry. Counters survive.
    pub fn clear(&mut self) {
        self.tags = [0; N];
        self.slots = [Slot::default(); N];
    }

    #[must_use]
    pub fn hits_one(&self) -> u64 {
        self.hits_one
    }

    #[must_use]
    pub fn hits_two(&self) -> u64 {
        self.hits_two
    }

    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Finds the slot holding `key`, tag-filtered, scanning candidates
    /// from the cold end down.
    fn search(&self, tag: u8, key: i64) -> Option<usize> {
        #[cfg(target_arch = "x86_64")]
        if N >= 16 {
            if let Some(j) = self.search_vector(tag, key) {
                return Some(j);
            }
            return self.search_swar(16, tag, key);
        }
        self.search_swar(0, tag, key)
    }

    /// Probes the first 16 tags with one SSE2 compare.
    #[cfg(target_arch = "x86_64")]
    fn search_vector(&self, tag: u8, key: i64) -> Option<usize> {
        use core::arch::x86_64::{
            __m128i, _mm_cmpeq_epi8, _mm_loadu_si128, _mm_movemask_epi8, _mm_set1_epi8,
        };

        // SAFETY: SSE2 is part of the x86_64 baseline, and `tags` holds at
        // least 16 bytes on this path.
        let mut mask = unsafe {
            let lanes = _mm_loadu_si128(self.tags.as_ptr().cast::<__m128i>());
            let needle = _mm_set1_epi8(tag as i8);
            _mm_movemask_epi8(_mm_cmpeq_epi8(lanes, needle)) as u32
        };
        while mask != 0 {
            let j = (31 - mask.leading_zeros()) as usize;
            if self.slots[j].key == key {
                return Some(j);
            }
            mask &= !(1 << j);
        }
        None
    }

    /// Probes tags eight at a time starting at `start`, which must be a
    /// multiple of 8.
    fn search_swar(&self, start: usize, tag: u8, key: i64) -> Option<usize> {
        let needle = u64::from(tag) * 0x0101_0101_0101_0101;
        for (g, group) in self.tags[start..].chunks_exact(8).enumerate() {
            let lanes = u64::from_le_bytes(group.try_into().unwrap());
            let mut mask = compare_eq(lanes, needle);
            while mask != 0 {
                let lane = (63 - mask.leading_zeros()) as usize >> 3;
                let j = start + g * 8 + lane;
                if self.slots[j].key == key {
                    return Some(j);
                }
                mask &= !(0xFF_u64 << (lane * 8));
            }
        }
        None
    }
}

impl<V, const N: usize> Default for TagCache<V, N>
where
    V: Copy + Default,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Folds per-byte equality of `x` and `y` into bit 7 of each lane.
const fn compare_eq(x: u64, y: u64) -> u64 {
    let w = x ^ y;
    !w & w.wrapping_sub(0x0101_0101_0101_0101) & 0x8080_8080_8080_8080
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag_of(key: i64) -> u8 {
        (key & 0xff) as u8
    }

    #[test]
    fn test_miss_on_empty() {
        let mut cache = TagCache::<u64, 16>::new();
        assert_eq!(cache.get(tag_of(7), 7), None);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn test_insert_then_hit() {
        let mut cache = TagCache::<u64, 16>::new();
        cache.insert(tag_of(7), 7, 0x7000);
        assert_eq!(cache.get(tag_of(7), 7), Some(0x7000));
        assert_eq!(cache.hits_two(), 1);
    }

    #[test]
    fn test_promotion_reaches_slot_zero() {
        let mut cache = TagCache::<u64, 16>::new();
        cache.insert(tag_of(42), 42, 1);
        // One bubble step per hit; enough hits float the entry to slot 0,
        // after which the fast path takes over.
        for _ in 0..16 {
            assert_eq!(cache.get(tag_of(42), 42), Some(1));
        }
        assert!(cache.hits_one() > 0);
    }

    #[test]
    fn test_same_tag_different_key() {
        let mut cache = TagCache::<u64, 16>::new();
        // 0x100 and 0x200 share the low byte 0x00.
        cache.insert(0, 0x100, 1);
        assert_eq!(cache.get(0, 0x100), Some(1));
        assert_eq!(cache.get(0, 0x200), None);
    }

    #[test]
    fn test_insert_evicts_coldest() {
        let mut cache = TagCache::<u64, 8>::new();
        cache.insert(tag_of(1), 1, 10);
        cache.insert(tag_of(2), 2, 20);
        // The second insert reused the coldest slot.
        assert_eq!(cache.get(tag_of(1), 1), None);
        assert_eq!(cache.get(tag_of(2), 2), Some(20));
    }

    #[test]
    fn test_clear_drops_entries_keeps_counters() {
        let mut cache = TagCache::<u64, 16>::new();
        cache.insert(tag_of(9), 9, 90);
        assert_eq!(cache.get(tag_of(9), 9), Some(90));
        cache.clear();
        assert_eq!(cache.get(tag_of(9), 9), None);
        assert_eq!(cache.hits_two(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn test_swar_groups_past_sixteen() {
        let mut cache = TagCache::<u64, 32>::new();
        for key in 1..=24_i64 {
            cache.insert(tag_of(key), key, key as u64);
            // Drag each entry off the coldest slot so the next insert
            // does not evict it.
            for _ in 0..24 {
                cache.get(tag_of(key), key);
            }
        }
        for key in 1..=24_i64 {
            assert_eq!(cache.get(tag_of(key), key), Some(key as u64), "key {key}");
        }
    }

    #[test]
    fn test_compare_eq_marks_equal_lanes() {
        let x = u64::from_le_bytes([1, 2, 3, 4, 5, 6, 7, 8]);
        let y = u64::from_le_bytes([1, 9, 3, 9, 5, 9, 7, 9]);
        let m = compare_eq(x, y);
        for lane in 0..8 {
            let equal = lane % 2 == 0;
            assert_eq!(m >> (lane * 8 + 7) & 1 == 1, equal, "lane {lane}");
        }
    }
}

use tag_cache::TagCache;

use super::{PAGE_SHIFT, Pte, VirtAddr};
use crate::params::TLB_ENTRIES;

/// Translation cache mapping virtual pages to their leaf entries.
///
/// A thin facade over [`TagCache`]: the tag is bits 12..19 of the page
/// address, the key is the page address itself, and validity is carried
/// by the cached entry's own `V` bit.
#[derive(Debug)]
pub(crate) struct Tlb {
    cache: TagCache<Pte, TLB_ENTRIES>,
}

impl Tlb {
    pub(crate) fn new() -> Self {
        Self {
            cache: TagCache::new(),
        }
    }

    fn tag(page: VirtAddr) -> u8 {
        ((page.addr() >> PAGE_SHIFT) & 0xff) as u8
    }

    pub(crate) fn get(&mut self, page: VirtAddr) -> Option<Pte> {
        self.cache.get(Self::tag(page), page.addr())
    }

    /// Caches `entry` for `page`, starting life at the coldest slot.
    pub(crate) fn put(&mut self, page: VirtAddr, entry: Pte) {
        self.cache.insert(Self::tag(page), page.addr(), entry);
    }

    pub(crate) fn reset(&mut self) {
        self.cache.clear();
    }

    pub(crate) fn hits_one(&self) -> u64 {
        self.cache.hits_one()
    }

    pub(crate) fn hits_two(&self) -> u64 {
        self.cache.hits_two()
    }

    pub(crate) fn misses(&self) -> u64 {
        self.cache.misses()
    }
}

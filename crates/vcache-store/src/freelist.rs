//! Free-space tracking for the data file
//!
//! Free regions are indexed two ways over the same set: by start location
//! (one entry per location) and by length (a multimap, realised as an
//! ordered set of `(length, location)` pairs). The location doubles as the
//! region's handle, so a membership change always updates both indices and
//! neither can go stale.
//!
//! Coalescing is incremental: every insert merges with the immediate
//! neighbours, so the list is maximally coalesced at all times and lookups
//! stay logarithmic.

use std::collections::{BTreeMap, BTreeSet};

/// The two free-region indices
#[derive(Debug, Default)]
pub struct FreeList {
    /// location -> length, one entry per region
    by_location: BTreeMap<u32, i32>,
    /// (length, location) pairs ordered for best-fit lookup
    by_length: BTreeSet<(i32, u32)>,
}

impl FreeList {
    /// Create an empty free list
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of free regions
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_location.len()
    }

    /// Whether no free region exists
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_location.is_empty()
    }

    /// Total free bytes
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.by_location.values().map(|&len| len as u64).sum()
    }

    /// Length of the largest free region, 0 when empty
    #[must_use]
    pub fn largest(&self) -> i32 {
        self.by_length.iter().next_back().map_or(0, |&(len, _)| len)
    }

    /// Iterate regions in location order
    pub fn iter(&self) -> impl Iterator<Item = (u32, i32)> + '_ {
        self.by_location.iter().map(|(&loc, &len)| (loc, len))
    }

    /// Smallest region with `length >= size`, best fit first
    ///
    /// Returns a copy without removing it; ties between equal lengths
    /// resolve in location order, which callers must not depend on.
    #[must_use]
    pub fn find(&self, size: i32) -> Option<(u32, i32)> {
        self.by_length
            .range((size, 0)..)
            .next()
            .map(|&(len, loc)| (loc, len))
    }

    /// First region starting strictly after `location`
    ///
    /// Used by the grow path to probe for an adjacent trailing region.
    #[must_use]
    pub fn next_after(&self, location: u32) -> Option<(u32, i32)> {
        self.by_location
            .range(location + 1..)
            .next()
            .map(|(&loc, &len)| (loc, len))
    }

    /// Remove the region at `location` from both indices, returning its length
    ///
    /// # Panics
    /// Panics if no region starts there; callers always hold a handle they
    /// obtained from this list.
    pub fn remove(&mut self, location: u32) -> i32 {
        let length = self
            .by_location
            .remove(&location)
            .expect("free region not in list");
        let removed = self.by_length.remove(&(length, location));
        assert!(removed, "free-list indices out of step");
        length
    }

    /// Consume a prefix of `take` bytes from the region at `location`
    ///
    /// Full consumption destroys the region; otherwise it is re-keyed with
    /// an advanced location and shortened length. The remainder cannot
    /// touch another free region, so no coalescing pass is needed.
    pub fn use_space(&mut self, location: u32, take: i32) {
        let length = self.remove(location);
        debug_assert!(take > 0 && take <= length);
        if take < length {
            self.insert_raw(location + take as u32, length - take);
        }
    }

    /// Add a region, merging with the immediate neighbours when adjacent
    pub fn insert(&mut self, location: u32, length: i32) {
        debug_assert!(length > 0);
        debug_assert!(
            !self.by_location.contains_key(&location),
            "free region already in list"
        );

        let prev = self
            .by_location
            .range(..location)
            .next_back()
            .map(|(&loc, &len)| (loc, len));
        let next = self
            .by_location
            .range(location..)
            .next()
            .map(|(&loc, &len)| (loc, len));

        let merge_prev =
            prev.is_some_and(|(loc, len)| loc + len as u32 == location);
        let merge_next =
            next.is_some_and(|(loc, _)| location + length as u32 == loc);

        match (merge_prev, merge_next) {
            (true, true) => {
                // both neighbours collapse into the predecessor
                let (prev_loc, prev_len) = prev.unwrap();
                let (next_loc, next_len) = next.unwrap();
                self.by_length.remove(&(prev_len, prev_loc));
                self.remove(next_loc);
                let merged = prev_len + length + next_len;
                self.by_location.insert(prev_loc, merged);
                self.by_length.insert((merged, prev_loc));
            }
            (true, false) => {
                // predecessor keeps its location, only its length changes
                let (prev_loc, prev_len) = prev.unwrap();
                self.by_length.remove(&(prev_len, prev_loc));
                let merged = prev_len + length;
                self.by_location.insert(prev_loc, merged);
                self.by_length.insert((merged, prev_loc));
            }
            (false, true) => {
                // successor moves back to our location and grows
                let (next_loc, next_len) = next.unwrap();
                self.remove(next_loc);
                self.insert_raw(location, length + next_len);
            }
            (false, false) => {
                self.insert_raw(location, length);
            }
        }
    }

    /// Insert without neighbour merging; both indices updated together
    fn insert_raw(&mut self, location: u32, length: i32) {
        self.by_location.insert(location, length);
        self.by_length.insert((length, location));
    }

    /// Assert the two indices hold the same membership
    #[cfg(test)]
    fn assert_symmetric(&self) {
        assert_eq!(self.by_location.len(), self.by_length.len());
        for (&loc, &len) in &self.by_location {
            assert!(self.by_length.contains(&(len, loc)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_fit() {
        let mut list = FreeList::new();
        list.insert(0, 4096);
        list.insert(8192, 1024);
        list.insert(16384, 2048);

        // smallest region that fits
        assert_eq!(list.find(1000), Some((8192, 1024)));
        assert_eq!(list.find(1500), Some((16384, 2048)));
        assert_eq!(list.find(4096), Some((0, 4096)));
        assert_eq!(list.find(5000), None);
        list.assert_symmetric();
    }

    #[test]
    fn test_use_space_full_consumption() {
        let mut list = FreeList::new();
        list.insert(0, 1024);
        list.use_space(0, 1024);
        assert!(list.is_empty());
        list.assert_symmetric();
    }

    #[test]
    fn test_use_space_prefix() {
        let mut list = FreeList::new();
        list.insert(0, 4096);
        list.use_space(0, 1024);

        assert_eq!(list.len(), 1);
        assert_eq!(list.find(1), Some((1024, 3072)));
        list.assert_symmetric();
    }

    #[test]
    fn test_merge_with_previous() {
        let mut list = FreeList::new();
        list.insert(0, 1024);
        list.insert(1024, 2048);

        assert_eq!(list.len(), 1);
        assert_eq!(list.find(1), Some((0, 3072)));
        list.assert_symmetric();
    }

    #[test]
    fn test_merge_with_next() {
        let mut list = FreeList::new();
        list.insert(2048, 1024);
        list.insert(1024, 1024);

        assert_eq!(list.len(), 1);
        assert_eq!(list.find(1), Some((1024, 2048)));
        list.assert_symmetric();
    }

    #[test]
    fn test_merge_both_sides() {
        let mut list = FreeList::new();
        list.insert(0, 1024);
        list.insert(2048, 1024);
        list.insert(1024, 1024);

        assert_eq!(list.len(), 1);
        assert_eq!(list.find(1), Some((0, 3072)));
        assert_eq!(list.total_bytes(), 3072);
        list.assert_symmetric();
    }

    #[test]
    fn test_no_merge_across_gap() {
        let mut list = FreeList::new();
        list.insert(0, 1024);
        list.insert(2048, 1024);

        assert_eq!(list.len(), 2);
        list.assert_symmetric();
    }

    #[test]
    fn test_next_after_is_strict() {
        let mut list = FreeList::new();
        list.insert(0, 1024);
        list.insert(4096, 1024);

        assert_eq!(list.next_after(0), Some((4096, 1024)));
        assert_eq!(list.next_after(4096), None);
    }

    #[test]
    fn test_last_region_exact_fit_clears_both_indices() {
        let mut list = FreeList::new();
        list.insert(512, 2048);

        let (loc, len) = list.find(2048).unwrap();
        assert_eq!((loc, len), (512, 2048));
        list.use_space(loc, 2048);

        assert!(list.is_empty());
        assert_eq!(list.find(1), None);
        assert_eq!(list.largest(), 0);
        list.assert_symmetric();
    }
}

use std::{collections::BTreeMap, ops::Bound::*};

use utils::Range;

#[derive(Debug, PartialEq, Clone, Copy)]
pub struct Gap<K> {
    range: Range<K>,
}

impl<K: num::Integer + num::Bounded + Copy> Gap<K> {
    fn new(start: K, end: K) -> Self {
        Gap {
            range: Range { start, end },
        }
    }

    #[inline]
    pub fn range(&self) -> Range<K> {
        self.range
    }

    #[inline]
    pub fn start(&self) -> K {
        self.range.start
    }

    #[inline]
    pub fn end(&self) -> K {
        self.range.end
    }

    #[inline]
    pub fn len(&self) -> K {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub struct Seg<K> {
    range: Range<K>,
}

impl<K: num::Integer + num::Bounded + Copy> Seg<K> {
    #[inline]
    pub fn start(&self) -> K {
        self.range.start
    }

    #[inline]
    pub fn end(&self) -> K {
        self.range.end
    }

    #[inline]
    pub fn range(&self) -> Range<K> {
        self.range
    }
}

/// Value policy for a [`Set`].
///
/// `split` must produce values that describe the two halves of `r` cut at
/// `split`; for example a mapping of a file advances the file offset of the
/// upper half. `merge` may fuse two adjacent values and defaults to never
/// merging.
pub trait SetOperations: Send + Sync {
    type K;
    type V;
    fn merge(
        &self,
        _r1: Range<Self::K>,
        _v1: &Self::V,
        _r2: Range<Self::K>,
        _v2: &Self::V,
    ) -> Option<Self::V> {
        None
    }
    fn split(&self, r: Range<Self::K>, v: &Self::V, split: Self::K) -> (Self::V, Self::V);
}

/// A set of disjoint, non-empty intervals keyed by their start, each carrying
/// a value. Backed by a B-tree, so lookups and updates are O(log n).
pub struct Set<K, V> {
    map: BTreeMap<Range<K>, V>,
    operations: Box<dyn SetOperations<K = K, V = V>>,
}

impl<K: num::Integer + std::fmt::Debug, V: std::fmt::Debug> std::fmt::Debug for Set<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("").field(&self.map).finish()
    }
}

impl<K, V> Set<K, V>
where
    K: num::Integer + num::Bounded + std::fmt::Debug + Copy,
{
    pub fn new(operations: Box<dyn SetOperations<K = K, V = V>>) -> Self {
        Self {
            map: BTreeMap::new(),
            operations,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Range<K>, &V)> + '_ {
        self.map.iter().map(|(k, v)| (*k, v))
    }

    /// Total length covered by all segments.
    pub fn span(&self) -> K {
        self.map.keys().fold(K::zero(), |sz, r| sz + r.len())
    }

    pub fn first_segment(&self) -> Option<Seg<K>> {
        self.map.keys().next().map(|r| Seg { range: *r })
    }

    pub fn next_segment_of_seg(&self, seg: &Seg<K>) -> Option<Seg<K>> {
        self.map
            .range((Excluded(seg.range), Unbounded))
            .next()
            .map(|(k, _)| Seg { range: *k })
    }

    /// The segment with the largest start not above `key`, whether or not it
    /// contains `key`.
    pub fn search_le(&self, key: K) -> Option<Seg<K>> {
        self.map
            .range(..=Range::point(key))
            .next_back()
            .map(|(k, _)| Seg { range: *k })
    }

    /// The first segment whose start is at or above `key`.
    fn search_ge(&self, key: K) -> Option<Seg<K>> {
        self.map
            .range(Range::point(key)..)
            .next()
            .map(|(k, _)| Seg { range: *k })
    }

    pub fn find_segment(&self, key: K) -> Option<Seg<K>> {
        self.search_le(key).filter(|s| s.range.contains(key))
    }

    /// The maximal free interval containing `key`, or `None` if `key` is
    /// covered by a segment.
    pub fn find_gap(&self, key: K) -> Option<Gap<K>> {
        let start = match self.search_le(key) {
            Some(prev) if prev.range.contains(key) => return None,
            Some(prev) => prev.end(),
            None => K::min_value(),
        };
        let end = self.search_ge(key).map_or_else(K::max_value, |n| n.start());
        Some(Gap::new(start, end))
    }

    pub fn first_gap(&self) -> Gap<K> {
        let end = self.first_segment().map_or_else(K::max_value, |s| s.start());
        Gap::new(K::min_value(), end)
    }

    /// The (possibly empty) gap following `seg`.
    pub fn next_gap_of_seg(&self, seg: &Seg<K>) -> Gap<K> {
        let end = self
            .next_segment_of_seg(seg)
            .map_or_else(K::max_value, |s| s.start());
        Gap::new(seg.end(), end)
    }

    /// The gap containing `key`, or the gap right after the segment that
    /// contains it.
    pub fn lower_bound_gap(&self, key: K) -> Gap<K> {
        match self.find_gap(key) {
            Some(gap) => gap,
            None => {
                let seg = self
                    .find_segment(key)
                    .unwrap_or_else(|| panic!("no gap or segment corresponding the key {:?}", key));
                self.next_gap_of_seg(&seg)
            }
        }
    }

    /// The first gap after `gap` whose length is at least `min_size`.
    pub fn next_large_enough_gap(&self, gap: &Gap<K>, min_size: K) -> Option<Gap<K>> {
        if gap.end() == K::max_value() {
            return None;
        }
        let mut segs = self.map.range(Range::point(gap.end())..).map(|(k, _)| *k);
        let mut gap_start = segs.next()?.end;
        for r in segs {
            if r.start - gap_start >= min_size {
                return Some(Gap::new(gap_start, r.start));
            }
            gap_start = r.end;
        }
        if K::max_value() - gap_start >= min_size {
            Some(Gap::new(gap_start, K::max_value()))
        } else {
            None
        }
    }

    /// Lowest start of a free interval of `length` inside `bounds`.
    pub fn first_fit(&self, bounds: Range<K>, length: K) -> Option<K> {
        if length.is_zero() || bounds.len() < length {
            return None;
        }
        let mut gap = self.lower_bound_gap(bounds.start);
        loop {
            if gap.start() >= bounds.end {
                return None;
            }
            let gr = gap.range().intersect(&bounds);
            if gr.len() >= length {
                return Some(gr.start);
            }
            gap = self.next_large_enough_gap(&gap, length)?;
        }
    }

    /// Whether no segment overlaps `r`.
    pub fn is_free(&self, r: Range<K>) -> bool {
        self.find_gap(r.start)
            .map_or(false, |g| g.range().is_superset_of(&r))
    }

    /// Segments that overlap `r`, in ascending order.
    pub fn segments_in(&self, r: Range<K>) -> Vec<Seg<K>> {
        let first = self
            .find_segment(r.start)
            .or_else(|| self.search_ge(r.start));
        let mut segs = Vec::new();
        let mut maybe_seg = first;
        while let Some(seg) = maybe_seg {
            if seg.start() >= r.end {
                break;
            }
            segs.push(seg);
            maybe_seg = self.next_segment_of_seg(&seg);
        }
        segs
    }

    /// Inserts `val` at `range` if the range is free; returns false otherwise.
    pub fn add(&mut self, range: Range<K>, val: V) -> bool {
        if range.end <= range.start {
            panic!("invalid segment range: {:?}", range);
        }
        if !self.is_free(range) {
            return false;
        }
        self.insert(range, val);
        true
    }

    /// Inserts `val` at `range`, merging with adjacent segments when the
    /// operations allow it.
    ///
    /// Panics if `range` is empty or overlaps an existing segment.
    pub fn insert(&mut self, range: Range<K>, val: V) -> Seg<K> {
        if range.end <= range.start {
            panic!("invalid segment range: {:?}", range);
        }
        let prev = self.search_le(range.start);
        let next = self.search_ge(range.start);
        if let Some(prev) = prev {
            if prev.end() > range.start {
                panic!("new segment {:?} overlaps predecessor {:?}", range, prev);
            }
        }
        if let Some(next) = next {
            if next.start() < range.end {
                panic!("new segment {:?} overlaps successor {:?}", range, next);
            }
        }

        let mut key = range;
        let mut val = val;
        if let Some(prev) = prev.filter(|p| p.end() == range.start) {
            if let Some(mval) = self
                .operations
                .merge(prev.range, &self.map[&prev.range], key, &val)
            {
                self.map.remove(&prev.range);
                key.start = prev.start();
                val = mval;
            }
        }
        if let Some(next) = next.filter(|n| n.start() == range.end) {
            if let Some(mval) = self
                .operations
                .merge(key, &val, next.range, &self.map[&next.range])
            {
                self.map.remove(&next.range);
                key.end = next.end();
                val = mval;
            }
        }
        self.map.insert(key, val);
        Seg { range: key }
    }

    /// Removes the segment starting at `start`.
    pub fn remove(&mut self, start: K) -> Option<(Range<K>, V)> {
        self.map.remove_entry(&Range::point(start))
    }

    pub fn remove_first(&mut self) -> Option<(Range<K>, V)> {
        let first = self.first_segment()?;
        self.map.remove_entry(&first.range)
    }

    /// Splits the segment containing `split` so that `split` becomes a
    /// segment boundary. Returns false if nothing was split.
    pub fn split_at(&mut self, split: K) -> bool {
        match self.find_segment(split) {
            Some(seg) if seg.range.can_split_at(split) => {
                self.split_unchecked(&seg, split);
                true
            }
            _ => false,
        }
    }

    // precondition: seg.start < split < seg.end
    fn split_unchecked(&mut self, seg: &Seg<K>, split: K) -> (Seg<K>, Seg<K>) {
        let v = self
            .map
            .remove(&seg.range)
            .unwrap_or_else(|| panic!("split of unknown segment {:?}", seg));
        let (val1, val2) = self.operations.split(seg.range, &v, split);
        let key1 = Range {
            start: seg.start(),
            end: split,
        };
        let key2 = Range {
            start: split,
            end: seg.end(),
        };
        self.map.insert(key1, val1);
        self.map.insert(key2, val2);
        (Seg { range: key1 }, Seg { range: key2 })
    }

    /// Splits `seg` so that the returned segment lies inside `range`.
    pub fn isolate(&mut self, seg: &Seg<K>, range: Range<K>) -> Seg<K> {
        let mut seg = *seg;
        if seg.range.can_split_at(range.start) {
            seg = self.split_unchecked(&seg, range.start).1;
        }
        if seg.range.can_split_at(range.end) {
            seg = self.split_unchecked(&seg, range.end).0;
        }
        seg
    }

    pub fn get(&self, start: K) -> Option<&V> {
        self.map.get(&Range::point(start))
    }

    pub fn value(&self, seg: &Seg<K>) -> &V {
        self.map
            .get(&seg.range)
            .unwrap_or_else(|| panic!("stale segment {:?}", seg))
    }

    pub fn value_mut(&mut self, seg: &Seg<K>) -> &mut V {
        self.map
            .get_mut(&seg.range)
            .unwrap_or_else(|| panic!("stale segment {:?}", seg))
    }
}

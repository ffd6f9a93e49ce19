//! Per-entity change tick index
//!
//! For each flattened property we keep the tick it last changed, and for each
//! group of `BUCKET_SIZE` properties the maximum of those ticks. Asking "what
//! changed after tick T" skips every bucket whose maximum is not after T, so
//! the cost follows the number of changed properties plus the bucket count
//! rather than the property count.

use crate::constants::change_frame::{bucket_count, BUCKET_SIZE};
use crate::snapshot::class::PropIndex;
use crate::snapshot::Tick;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFrameList {
    props: Box<[Tick]>,
    buckets: Box<[Tick]>,
    /// First tick from which this list has recorded every change, if known
    history_start: Option<Tick>,
}

impl ChangeFrameList {
    /// Every property stamped as changed at `tick`; history starts there.
    pub fn new(property_count: usize, tick: Tick) -> Self {
        Self {
            props: vec![tick; property_count].into_boxed_slice(),
            buckets: vec![tick; bucket_count(property_count)].into_boxed_slice(),
            history_start: Some(tick),
        }
    }

    /// A list whose ticks cannot be trusted for "changed since" queries,
    /// e.g. state reconstructed from a recording.
    pub fn without_history(property_count: usize, tick: Tick) -> Self {
        Self {
            history_start: None,
            ..Self::new(property_count, tick)
        }
    }

    #[inline]
    pub fn property_count(&self) -> usize {
        self.props.len()
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub fn history_start(&self) -> Option<Tick> {
        self.history_start
    }

    /// True when every change after `tick` is recorded here.
    #[inline]
    pub fn covers(&self, tick: Tick) -> bool {
        self.history_start.is_some_and(|start| start <= tick)
    }

    #[inline]
    pub fn change_tick(&self, prop: PropIndex) -> Option<Tick> {
        self.props.get(prop as usize).copied()
    }

    #[inline]
    pub fn bucket_max(&self, bucket: usize) -> Option<Tick> {
        self.buckets.get(bucket).copied()
    }

    /// Stamp `props` as changed at `tick`.
    ///
    /// Out-of-range indices are a contract violation and are skipped.
    pub fn set_change_tick(&mut self, props: &[PropIndex], tick: Tick) {
        for &prop in props {
            let i = prop as usize;
            if i >= self.props.len() {
                debug_assert!(
                    i < self.props.len(),
                    "property {} out of range ({} properties)",
                    i,
                    self.props.len()
                );
                continue;
            }

            let previous = self.props[i];
            self.props[i] = tick;

            let bucket = i / BUCKET_SIZE;
            if tick >= self.buckets[bucket] {
                self.buckets[bucket] = tick;
            } else if previous == self.buckets[bucket] {
                // The bucket maximum may have just been lowered
                self.buckets[bucket] = self.bucket_range(bucket).iter().copied().max().unwrap_or(0);
            }
        }
    }

    #[inline]
    fn bucket_range(&self, bucket: usize) -> &[Tick] {
        let start = bucket * BUCKET_SIZE;
        let end = (start + BUCKET_SIZE).min(self.props.len());
        &self.props[start..end]
    }

    #[inline]
    pub fn did_change_after(&self, prop: PropIndex, tick: Tick) -> bool {
        self.props.get(prop as usize).is_some_and(|&t| t > tick)
    }

    /// Properties whose change tick is after `tick`, ascending.
    pub fn changed_since(&self, tick: Tick) -> ChangedSince<'_> {
        ChangedSince {
            list: self,
            tick,
            bucket: 0,
            prop: 0,
            end: 0,
        }
    }

    /// Independent copy; future stamps on the copy never touch `self`.
    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// `bucket[i] == max(props in bucket i)` for every bucket.
    pub fn buckets_consistent(&self) -> bool {
        (0..self.buckets.len())
            .all(|b| self.bucket_range(b).iter().copied().max() == Some(self.buckets[b]))
    }
}

/// Lazy iterator returned by `ChangeFrameList::changed_since`
pub struct ChangedSince<'a> {
    list: &'a ChangeFrameList,
    tick: Tick,
    bucket: usize,
    prop: usize,
    end: usize,
}

impl Iterator for ChangedSince<'_> {
    type Item = PropIndex;

    fn next(&mut self) -> Option<PropIndex> {
        loop {
            while self.prop < self.end {
                let i = self.prop;
                self.prop += 1;
                if self.list.props[i] > self.tick {
                    return Some(i as PropIndex);
                }
            }

            // Advance to the next bucket with something newer than `tick`
            while self.bucket < self.list.buckets.len() && self.list.buckets[self.bucket] <= self.tick {
                self.bucket += 1;
            }
            if self.bucket >= self.list.buckets.len() {
                return None;
            }
            self.prop = self.bucket * BUCKET_SIZE;
            self.end = (self.prop + BUCKET_SIZE).min(self.list.props.len());
            self.bucket += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_two_bucket_scenario() {
        // 40 properties -> 2 buckets
        let mut list = ChangeFrameList::new(40, 0);
        assert_eq!(list.bucket_count(), 2);

        list.set_change_tick(&[3], 10);
        list.set_change_tick(&[35], 50);

        let since_5: Vec<PropIndex> = list.changed_since(5).collect();
        let since_20: Vec<PropIndex> = list.changed_since(20).collect();
        let since_60: Vec<PropIndex> = list.changed_since(60).collect();

        assert_eq!(since_5, vec![3, 35]);
        assert_eq!(since_20, vec![35]);
        assert!(since_60.is_empty());
    }

    #[test]
    fn test_new_list_reports_everything_before_creation() {
        let list = ChangeFrameList::new(70, 100);
        assert_eq!(list.changed_since(99).count(), 70);
        assert_eq!(list.changed_since(100).count(), 0);
    }

    #[test]
    fn test_changed_since_is_idempotent() {
        let mut list = ChangeFrameList::new(96, 1);
        list.set_change_tick(&[0, 31, 32, 95], 7);
        list.set_change_tick(&[64], 9);

        let first: Vec<PropIndex> = list.changed_since(5).collect();
        let second: Vec<PropIndex> = list.changed_since(5).collect();
        assert_eq!(first, second);
        assert_eq!(first, vec![0, 31, 32, 64, 95]);
    }

    #[test]
    fn test_bucket_invariant_under_random_mutation() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..50 {
            let count = rng.gen_range(1..200);
            let mut list = ChangeFrameList::new(count, rng.gen_range(0..10));

            for _ in 0..100 {
                let n = rng.gen_range(1..8);
                let props: Vec<PropIndex> =
                    (0..n).map(|_| rng.gen_range(0..count) as PropIndex).collect();
                // Ticks may also move backwards (rewound timelines)
                let tick = rng.gen_range(0..1000);
                list.set_change_tick(&props, tick);
                assert!(list.buckets_consistent());
            }
        }
    }

    #[test]
    fn test_changed_since_matches_linear_scan() {
        let mut rng = StdRng::seed_from_u64(42);
        let mut list = ChangeFrameList::new(150, 0);
        for tick in 1..200 {
            let prop = rng.gen_range(0..150) as PropIndex;
            list.set_change_tick(&[prop], tick);
        }

        for since in [0, 10, 50, 150, 199, 500] {
            let fast: Vec<PropIndex> = list.changed_since(since).collect();
            let linear: Vec<PropIndex> = (0..150u16).filter(|&p| list.did_change_after(p, since)).collect();
            assert_eq!(fast, linear, "since {}", since);
        }
    }

    #[test]
    fn test_copy_is_independent() {
        let mut original = ChangeFrameList::new(40, 0);
        original.set_change_tick(&[1], 5);

        let mut copy = original.copy();
        copy.set_change_tick(&[2], 9);

        assert_eq!(original.changed_since(5).count(), 0);
        assert_eq!(copy.changed_since(5).collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn test_history_coverage() {
        let list = ChangeFrameList::new(4, 20);
        assert!(list.covers(20));
        assert!(list.covers(30));
        assert!(!list.covers(19));

        let unknown = ChangeFrameList::without_history(4, 20);
        assert!(!unknown.covers(30));
    }

    #[test]
    fn test_lowering_a_bucket_maximum() {
        let mut list = ChangeFrameList::new(33, 0);
        list.set_change_tick(&[5], 40);
        list.set_change_tick(&[6], 30);
        // Rewind the property holding the maximum
        list.set_change_tick(&[5], 10);
        assert_eq!(list.bucket_max(0), Some(30));
        assert!(list.buckets_consistent());
    }

    #[test]
    fn test_empty_class() {
        let list = ChangeFrameList::new(0, 3);
        assert_eq!(list.bucket_count(), 0);
        assert_eq!(list.changed_since(0).count(), 0);
        assert!(list.buckets_consistent());
    }
}

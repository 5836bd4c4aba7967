// SPDX-License-Identifier: Apache-2.0
// SPDX-FileCopyrightText: Copyright The Lance Authors

//! Registered byte ranges ("read heads") and their adjacency merging.

use std::collections::BTreeSet;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use bytes::Bytes;
use readahead_core::{Error, Result};
use snafu::location;
use tracing::trace;

/// Stable handle of a [ReadHead] inside a [RangeRegistry].
///
/// Handles stay valid across unrelated insertions and merges. They are
/// invalidated by [RangeRegistry::clear] and, under [MergePolicy::Chained], when
/// the head is absorbed into a neighbour. Ids are never reused within one
/// registry, so a stale handle resolves to nothing rather than to a newer head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeadId(usize);

/// A contiguous byte range that was hinted to be accessed in the near future.
#[derive(Debug)]
pub struct ReadHead {
    location: u64,
    size: u64,
    /// Present once the executor has read the range.
    buffer: Option<Bytes>,
}

impl ReadHead {
    fn new(location: u64, size: u64) -> Self {
        Self {
            location,
            size,
            buffer: None,
        }
    }

    pub fn location(&self) -> u64 {
        self.location
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn end(&self) -> u64 {
        self.location + self.size
    }

    pub fn range(&self) -> Range<u64> {
        self.location..self.end()
    }

    pub fn contains(&self, pos: u64) -> bool {
        pos >= self.location && pos < self.end()
    }

    pub fn buffer(&self) -> Option<&Bytes> {
        self.buffer.as_ref()
    }

    pub fn is_materialized(&self) -> bool {
        self.buffer.is_some()
    }

    /// The materialized bytes from file offset `pos` to the end of this head.
    ///
    /// Returns `None` if `pos` is outside the head or nothing has been read yet.
    pub fn data_from(&self, pos: u64) -> Option<&[u8]> {
        if !self.contains(pos) {
            return None;
        }
        let buffer = self.buffer.as_ref()?;
        buffer.get((pos - self.location) as usize..)
    }

    // Any change of bounds makes a previously read buffer stale.
    fn grow(&mut self, location: u64, size: u64) {
        self.location = location;
        self.size = size;
        self.buffer = None;
    }
}

/// How newly registered ranges are combined with existing ones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergePolicy {
    /// Every registration becomes its own head.
    Disabled,
    /// Extend one existing head that ends exactly where the new range starts,
    /// or else one that starts exactly where it ends. At most one side is
    /// merged per registration and overlapping ranges are never combined.
    #[default]
    Adjacent,
    /// Like [MergePolicy::Adjacent], but after extending a head forward it also
    /// absorbs any heads that now start exactly at its end.
    Chained,
}

impl fmt::Display for MergePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disabled => "disabled",
            Self::Adjacent => "adjacent",
            Self::Chained => "chained",
        };
        f.write_str(name)
    }
}

impl FromStr for MergePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" | "none" | "off" => Ok(Self::Disabled),
            "adjacent" => Ok(Self::Adjacent),
            "chained" => Ok(Self::Chained),
            _ => Err(Error::InvalidInput {
                source: format!(
                    "unknown merge policy {s:?}, expected one of: disabled, adjacent, chained"
                )
                .into(),
                location: location!(),
            }),
        }
    }
}

/// The set of ranges registered for one file during one scan unit.
///
/// Heads live in an arena addressed by [HeadId]. Two ordered indices map the
/// start and end offset of every live head to its id; they are kept in step
/// with the heads' bounds on every mutation so merge candidates can be found
/// without scanning.
#[derive(Debug, Default)]
pub struct RangeRegistry {
    heads: Vec<Option<ReadHead>>,
    // Id of heads[0]; advanced past every issued id on clear
    first_id: usize,
    // (offset, id) pairs so that heads sharing a boundary each keep an entry
    by_start: BTreeSet<(u64, HeadId)>,
    by_end: BTreeSet<(u64, HeadId)>,
    num_heads: usize,
    total_size: u64,
    merge_policy: MergePolicy,
}

impl RangeRegistry {
    pub fn new(merge_policy: MergePolicy) -> Self {
        Self {
            merge_policy,
            ..Default::default()
        }
    }

    pub fn merge_policy(&self) -> MergePolicy {
        self.merge_policy
    }

    /// Number of live heads.
    pub fn len(&self) -> usize {
        self.num_heads
    }

    pub fn is_empty(&self) -> bool {
        self.num_heads == 0
    }

    /// Sum of the sizes of all live heads.
    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Bytes currently held by materialized heads.
    pub fn materialized_size(&self) -> u64 {
        self.iter()
            .filter_map(|(_, head)| head.buffer())
            .map(|buffer| buffer.len() as u64)
            .sum()
    }

    pub fn get(&self, id: HeadId) -> Option<&ReadHead> {
        self.heads.get(self.slot(id)?).and_then(Option::as_ref)
    }

    /// Live heads, most recently registered first.
    pub fn iter(&self) -> impl Iterator<Item = (HeadId, &ReadHead)> + '_ {
        self.heads
            .iter()
            .enumerate()
            .rev()
            .filter_map(|(idx, head)| {
                head.as_ref()
                    .map(|head| (HeadId(self.first_id + idx), head))
            })
    }

    /// Register interest in the bytes `[pos, pos + len)`.
    ///
    /// With `allow_merge` set (and a merge policy other than
    /// [MergePolicy::Disabled]) a head ending exactly at `pos` is extended
    /// forward; failing that, a head starting exactly at `pos + len` is extended
    /// backward. Otherwise a new head is created.
    ///
    /// Returns the id of the head now covering the range, or `None` for an
    /// empty range, which is ignored.
    pub fn add_read_head(&mut self, pos: u64, len: u64, allow_merge: bool) -> Option<HeadId> {
        if len == 0 {
            return None;
        }
        let end = pos + len;

        if allow_merge && self.merge_policy != MergePolicy::Disabled {
            if let Some(id) = first_at(&self.by_end, pos) {
                self.extend_forward(id, len);
                if self.merge_policy == MergePolicy::Chained {
                    self.absorb_successors(id);
                }
                return Some(id);
            }

            if let Some(id) = first_at(&self.by_start, end) {
                self.extend_backward(id, len);
                return Some(id);
            }
        }

        let id = HeadId(self.first_id + self.heads.len());
        self.heads.push(Some(ReadHead::new(pos, len)));
        self.by_start.insert((pos, id));
        self.by_end.insert((end, id));
        self.num_heads += 1;
        self.total_size += len;
        Some(id)
    }

    /// Returns the first head, most recently registered first, whose span
    /// contains `pos`.
    ///
    /// This is a linear scan; the number of heads is bounded by the column
    /// chunks of a single scan unit.
    pub fn get_read_head(&self, pos: u64) -> Option<&ReadHead> {
        self.find(pos).and_then(|id| self.get(id))
    }

    /// Like [Self::get_read_head] but returns the head's id.
    pub fn find(&self, pos: u64) -> Option<HeadId> {
        self.iter()
            .find(|(_, head)| head.contains(pos))
            .map(|(id, _)| id)
    }

    /// Discard all heads and their buffers.
    pub fn clear(&mut self) {
        self.first_id += self.heads.len();
        self.heads.clear();
        self.by_start.clear();
        self.by_end.clear();
        self.num_heads = 0;
        self.total_size = 0;
    }

    /// Attach the data read for head `id`.
    ///
    /// Returns false (and drops the buffer) if `id` is no longer live or the
    /// buffer does not match the head's size.
    pub(crate) fn set_buffer(&mut self, id: HeadId, buffer: Bytes) -> bool {
        match self.live_mut(id) {
            Some(head) if head.size == buffer.len() as u64 => {
                head.buffer = Some(buffer);
                true
            }
            _ => false,
        }
    }

    fn slot(&self, id: HeadId) -> Option<usize> {
        id.0.checked_sub(self.first_id)
    }

    fn live_mut(&mut self, id: HeadId) -> Option<&mut ReadHead> {
        let slot = self.slot(id)?;
        self.heads.get_mut(slot).and_then(Option::as_mut)
    }

    fn extend_forward(&mut self, id: HeadId, len: u64) {
        let Some(head) = self.live_mut(id) else {
            return;
        };
        let old_end = head.end();
        let (location, size) = (head.location, head.size + len);
        head.grow(location, size);
        let new_end = head.end();
        trace!(location, old_end, new_end, "extended read head forward");

        self.by_end.remove(&(old_end, id));
        self.by_end.insert((new_end, id));
        self.total_size += len;
    }

    fn extend_backward(&mut self, id: HeadId, len: u64) {
        let Some(head) = self.live_mut(id) else {
            return;
        };
        let old_start = head.location;
        let (location, size) = (head.location - len, head.size + len);
        head.grow(location, size);
        trace!(old_start, new_start = location, end = head.end(), "extended read head backward");

        self.by_start.remove(&(old_start, id));
        self.by_start.insert((location, id));
        self.total_size += len;
    }

    fn absorb_successors(&mut self, id: HeadId) {
        while let Some(end) = self.get(id).map(ReadHead::end) {
            let Some(next) = self
                .by_start
                .range((end, HeadId(0))..=(end, HeadId(usize::MAX)))
                .map(|(_, next)| *next)
                .find(|next| *next != id)
            else {
                return;
            };
            let Some(absorbed) = self
                .slot(next)
                .and_then(|slot| self.heads.get_mut(slot))
                .and_then(Option::take)
            else {
                return;
            };
            self.by_start.remove(&(absorbed.location, next));
            self.by_end.remove(&(absorbed.end(), next));
            self.num_heads -= 1;

            let Some(head) = self.live_mut(id) else {
                return;
            };
            let (location, size) = (head.location, head.size + absorbed.size);
            head.grow(location, size);
            let new_end = head.end();
            trace!(location, old_end = end, new_end, "absorbed adjacent read head");

            self.by_end.remove(&(end, id));
            self.by_end.insert((new_end, id));
        }
    }

    /// Check that both indices describe exactly the live heads.
    #[cfg(test)]
    fn validate(&self) {
        let live: Vec<_> = self.iter().collect();
        assert_eq!(live.len(), self.num_heads);
        assert_eq!(self.by_start.len(), self.num_heads);
        assert_eq!(self.by_end.len(), self.num_heads);
        for (id, head) in &live {
            assert!(self.by_start.contains(&(head.location(), *id)));
            assert!(self.by_end.contains(&(head.end(), *id)));
        }
        let sum: u64 = live.iter().map(|(_, head)| head.size()).sum();
        assert_eq!(sum, self.total_size);
    }
}

fn first_at(index: &BTreeSet<(u64, HeadId)>, offset: u64) -> Option<HeadId> {
    index
        .range((offset, HeadId(0))..=(offset, HeadId(usize::MAX)))
        .next()
        .map(|(_, id)| *id)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    fn ranges(registry: &RangeRegistry) -> Vec<Range<u64>> {
        let mut ranges: Vec<_> = registry.iter().map(|(_, head)| head.range()).collect();
        ranges.sort_by_key(|r| (r.start, r.end));
        ranges
    }

    #[rstest]
    #[case::forward(&[(100, 50), (150, 30)])]
    #[case::backward(&[(150, 30), (100, 50)])]
    fn test_adjacent_ranges_merge(#[case] registrations: &[(u64, u64)]) {
        let mut registry = RangeRegistry::new(MergePolicy::Adjacent);
        for (pos, len) in registrations {
            registry.add_read_head(*pos, *len, true);
        }
        registry.validate();

        assert_eq!(registry.len(), 1);
        assert_eq!(ranges(&registry), vec![100..180]);
        assert_eq!(registry.total_size(), 80);
    }

    #[test]
    fn test_merge_keeps_id() {
        let mut registry = RangeRegistry::new(MergePolicy::Adjacent);
        let first = registry.add_read_head(0, 10, true).unwrap();
        assert_eq!(registry.add_read_head(10, 10, true), Some(first));
        assert_eq!(registry.add_read_head(20, 5, true), Some(first));
        assert_eq!(registry.get(first).unwrap().range(), 0..25);
    }

    #[test]
    fn test_overlap_is_not_merged() {
        let mut registry = RangeRegistry::new(MergePolicy::Adjacent);
        registry.add_read_head(0, 10, true);
        registry.add_read_head(5, 10, true);
        registry.validate();

        assert_eq!(ranges(&registry), vec![0..10, 5..15]);
        assert_eq!(registry.total_size(), 20);

        // First match wins, most recent registration first
        let head = registry.get_read_head(7).unwrap();
        assert_eq!(head.range(), 5..15);
        assert_eq!(registry.get_read_head(2).unwrap().range(), 0..10);
    }

    #[test]
    fn test_shared_boundaries_are_indexed() {
        let mut registry = RangeRegistry::new(MergePolicy::Adjacent);
        registry.add_read_head(0, 10, true);
        registry.add_read_head(0, 10, true);
        registry.validate();
        assert_eq!(registry.len(), 2);

        // Only one of the two heads ending at 10 is extended
        registry.add_read_head(10, 5, true);
        registry.validate();
        assert_eq!(ranges(&registry), vec![0..10, 0..15]);
    }

    #[test]
    fn test_merge_disabled() {
        let mut registry = RangeRegistry::new(MergePolicy::Adjacent);
        registry.add_read_head(0, 10, false);
        registry.add_read_head(10, 10, false);
        assert_eq!(registry.len(), 2);

        let mut registry = RangeRegistry::new(MergePolicy::Disabled);
        registry.add_read_head(0, 10, true);
        registry.add_read_head(10, 10, true);
        registry.validate();
        assert_eq!(ranges(&registry), vec![0..10, 10..20]);
    }

    #[test]
    fn test_bridging_range_merges_one_side() {
        let mut registry = RangeRegistry::new(MergePolicy::Adjacent);
        registry.add_read_head(0, 10, true);
        registry.add_read_head(20, 10, true);
        // [10, 20) touches both heads; only the one ending at 10 grows
        registry.add_read_head(10, 10, true);
        registry.validate();

        assert_eq!(ranges(&registry), vec![0..20, 20..30]);
        assert_eq!(registry.total_size(), 30);
    }

    #[test]
    fn test_bridging_range_chained() {
        let mut registry = RangeRegistry::new(MergePolicy::Chained);
        registry.add_read_head(0, 10, true);
        registry.add_read_head(20, 10, false);
        registry.add_read_head(30, 10, false);
        registry.add_read_head(10, 10, true);
        registry.validate();

        assert_eq!(ranges(&registry), vec![0..40]);
        assert_eq!(registry.total_size(), 40);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_empty_range_is_ignored() {
        let mut registry = RangeRegistry::default();
        assert_eq!(registry.add_read_head(10, 0, true), None);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clear() {
        let mut registry = RangeRegistry::default();
        registry.add_read_head(0, 10, true);
        registry.add_read_head(100, 10, true);
        registry.clear();
        registry.validate();

        assert!(registry.is_empty());
        assert_eq!(registry.total_size(), 0);
        for pos in [0, 5, 100, 109] {
            assert!(registry.get_read_head(pos).is_none());
        }
    }

    #[test]
    fn test_ids_are_not_reused_after_clear() {
        let mut registry = RangeRegistry::default();
        let stale = registry.add_read_head(0, 10, true).unwrap();
        registry.clear();

        let fresh = registry.add_read_head(500, 20, true).unwrap();
        assert_ne!(stale, fresh);
        assert!(registry.get(stale).is_none());
        assert!(!registry.set_buffer(stale, Bytes::from(vec![0u8; 20])));
        assert!(!registry.get(fresh).unwrap().is_materialized());
        assert_eq!(registry.iter().map(|(id, _)| id).collect::<Vec<_>>(), vec![fresh]);
        registry.validate();
    }

    #[test]
    fn test_merge_drops_stale_buffer() {
        let mut registry = RangeRegistry::default();
        let id = registry.add_read_head(0, 4, true).unwrap();
        assert!(registry.set_buffer(id, Bytes::from_static(&[1, 2, 3, 4])));
        assert_eq!(registry.get(id).unwrap().data_from(2), Some(&[3, 4][..]));
        assert_eq!(registry.materialized_size(), 4);

        registry.add_read_head(4, 4, true);
        let head = registry.get(id).unwrap();
        assert!(!head.is_materialized());
        assert_eq!(head.data_from(2), None);
        assert_eq!(registry.materialized_size(), 0);

        // Wrong-sized buffers are refused
        assert!(!registry.set_buffer(id, Bytes::from_static(&[1, 2, 3, 4])));
    }

    #[rstest]
    #[case("adjacent", MergePolicy::Adjacent)]
    #[case("Chained", MergePolicy::Chained)]
    #[case("off", MergePolicy::Disabled)]
    fn test_parse_merge_policy(#[case] value: &str, #[case] expected: MergePolicy) {
        assert_eq!(value.parse::<MergePolicy>().unwrap(), expected);
        assert_eq!(
            expected.to_string().parse::<MergePolicy>().unwrap(),
            expected
        );
    }

    #[test]
    fn test_parse_bad_merge_policy() {
        let err = "greedy".parse::<MergePolicy>().unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));
    }

    fn merge_policy() -> impl Strategy<Value = MergePolicy> {
        prop_oneof![
            Just(MergePolicy::Disabled),
            Just(MergePolicy::Adjacent),
            Just(MergePolicy::Chained),
        ]
    }

    proptest! {
        #[test]
        fn test_registry_invariants(
            policy in merge_policy(),
            registrations in prop::collection::vec((0u64..64, 1u64..16, any::<bool>()), 0..32),
        ) {
            let mut registry = RangeRegistry::new(policy);
            let mut covered = [false; 80];
            let mut registered_size = 0;
            for (pos, len, allow_merge) in registrations {
                registry.add_read_head(pos, len, allow_merge);
                registry.validate();
                for byte in pos..pos + len {
                    covered[byte as usize] = true;
                }
                registered_size += len;
            }

            // Merging never double counts and never changes which bytes are covered
            prop_assert_eq!(registry.total_size(), registered_size);
            for (pos, expected) in covered.iter().enumerate() {
                prop_assert_eq!(registry.get_read_head(pos as u64).is_some(), *expected);
            }
        }
    }
}

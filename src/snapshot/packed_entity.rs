//! One entity's serialized state for one snapshot

use std::sync::Arc;

use bitvec::prelude::*;

use crate::snapshot::change_frame::ChangeFrameList;
use crate::snapshot::class::{ClassDescriptor, PackedData, PropIndex};
use crate::snapshot::{EntitySlot, SnapshotSet, Tick};

/// Index of a consumer in visibility bitsets
pub type RecipientId = usize;

/// Properties that only some recipients may observe.
///
/// A property in `props` is visible to recipient `r` only when bit `r` of
/// `recipients` is set.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProxyGroup {
    pub props: BitVec,
    pub recipients: BitVec,
}

impl ProxyGroup {
    pub fn new(props: &[PropIndex], recipients: &[RecipientId]) -> Self {
        let mut group = Self::default();
        for &prop in props {
            let i = prop as usize;
            if group.props.len() <= i {
                group.props.resize(i + 1, false);
            }
            group.props.set(i, true);
        }
        for &r in recipients {
            if group.recipients.len() <= r {
                group.recipients.resize(r + 1, false);
            }
            group.recipients.set(r, true);
        }
        group
    }

    #[inline]
    fn covers(&self, prop: PropIndex) -> bool {
        self.props.get(prop as usize).is_some_and(|b| *b)
    }

    #[inline]
    fn admits(&self, recipient: RecipientId) -> bool {
        self.recipients.get(recipient).is_some_and(|b| *b)
    }
}

/// Per-recipient property visibility of one packed entity.
///
/// No groups means everything is visible to everyone.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VisibilityMask {
    groups: Vec<ProxyGroup>,
}

impl VisibilityMask {
    pub fn all_visible() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, group: ProxyGroup) -> Self {
        self.groups.push(group);
        self
    }

    #[inline]
    pub fn is_all_visible(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn groups(&self) -> &[ProxyGroup] {
        &self.groups
    }

    /// A property hidden by any group that excludes `recipient` is invisible.
    pub fn is_visible(&self, prop: PropIndex, recipient: RecipientId) -> bool {
        self.groups
            .iter()
            .all(|g| !g.covers(prop) || g.admits(recipient))
    }

    /// Properties governed by at least one group, ascending.
    pub fn proxied_props(&self) -> Vec<PropIndex> {
        let len = self.groups.iter().map(|g| g.props.len()).max().unwrap_or(0);
        let mut union: BitVec = BitVec::repeat(false, len);
        for group in &self.groups {
            for i in group.props.iter_ones() {
                union.set(i, true);
            }
        }
        union.iter_ones().map(|i| i as PropIndex).collect()
    }

    /// Highest property index any group governs
    pub fn highest_proxied_prop(&self) -> Option<usize> {
        self.groups.iter().filter_map(|g| g.props.last_one()).max()
    }
}

/// Immutable packed state of one entity.
///
/// Built once by the snapshot manager and shared by every snapshot that
/// reuses it. "Changing" an entity means packing a new one.
#[derive(Debug)]
pub struct PackedEntity {
    pub(crate) slot: EntitySlot,
    pub(crate) class: Arc<ClassDescriptor>,
    pub(crate) serial: u32,
    pub(crate) data: PackedData,
    pub(crate) change_frames: ChangeFrameList,
    pub(crate) visibility: VisibilityMask,
    pub(crate) creation_tick: Tick,
    pub(crate) set: SnapshotSet,
    pub(crate) needs_tick_revalidation: bool,
    /// EnterView source: the class default or the class's instance baseline
    pub(crate) baseline: Option<Arc<PackedData>>,
}

impl PackedEntity {
    #[inline]
    pub fn slot(&self) -> EntitySlot {
        self.slot
    }

    #[inline]
    pub fn class(&self) -> &Arc<ClassDescriptor> {
        &self.class
    }

    #[inline]
    pub fn serial(&self) -> u32 {
        self.serial
    }

    #[inline]
    pub fn data(&self) -> &PackedData {
        &self.data
    }

    #[inline]
    pub fn change_frames(&self) -> &ChangeFrameList {
        &self.change_frames
    }

    #[inline]
    pub fn visibility(&self) -> &VisibilityMask {
        &self.visibility
    }

    #[inline]
    pub fn creation_tick(&self) -> Tick {
        self.creation_tick
    }

    #[inline]
    pub fn set(&self) -> SnapshotSet {
        self.set
    }

    #[inline]
    pub fn baseline(&self) -> Option<&PackedData> {
        self.baseline.as_deref()
    }

    /// Holds tick-relative fields, so it can never be carried into a later tick.
    #[inline]
    pub fn needs_tick_revalidation(&self) -> bool {
        self.needs_tick_revalidation
    }

    /// Same slot occupant: class and instance serial match.
    #[inline]
    pub fn same_instance(&self, other: &PackedEntity) -> bool {
        self.serial == other.serial && self.class.id() == other.class.id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_visible_mask() {
        let mask = VisibilityMask::all_visible();
        assert!(mask.is_all_visible());
        assert!(mask.is_visible(0, 0));
        assert!(mask.is_visible(100, 7));
        assert!(mask.proxied_props().is_empty());
    }

    #[test]
    fn test_proxy_group_hides_from_other_recipients() {
        // Props 2 and 5 only for recipient 1
        let mask = VisibilityMask::all_visible().with_group(ProxyGroup::new(&[2, 5], &[1]));

        assert!(mask.is_visible(2, 1));
        assert!(!mask.is_visible(2, 0));
        assert!(!mask.is_visible(5, 3));
        assert!(mask.is_visible(3, 0));
        assert_eq!(mask.proxied_props(), vec![2, 5]);
    }

    #[test]
    fn test_overlapping_groups_require_every_admission() {
        let mask = VisibilityMask::all_visible()
            .with_group(ProxyGroup::new(&[4], &[0, 1]))
            .with_group(ProxyGroup::new(&[4, 6], &[1]));

        assert!(mask.is_visible(4, 1));
        assert!(!mask.is_visible(4, 0));
        assert_eq!(mask.proxied_props(), vec![4, 6]);
        assert_eq!(mask.highest_proxied_prop(), Some(6));
        assert_eq!(VisibilityMask::all_visible().highest_proxied_prop(), None);
    }
}

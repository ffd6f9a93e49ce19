//! Per-recipient property culling
//!
//! Narrows a changed-property list to what one recipient may observe under
//! the entity's current visibility mask, and adds back properties that just
//! became visible to that recipient even though their value did not change.
//! The recipient never saw those values, so they have to be sent now.
//!
//! # Performance
//! - Entities without proxy groups return the input untouched
//! - Otherwise cost is O(changed + proxied properties)

use smallvec::SmallVec;

use crate::net::delta::DeltaResult;
use crate::snapshot::class::PropIndex;
use crate::snapshot::packed_entity::{RecipientId, VisibilityMask};

/// Stateless filter; see module docs
pub struct RecipientProxyFilter;

impl RecipientProxyFilter {
    /// Properties of `changed` that `recipient` may see under `new`, plus
    /// properties hidden under `old` that `new` reveals. Ascending, and
    /// never past `property_count`.
    pub fn filter(
        changed: &DeltaResult,
        recipient: RecipientId,
        old: Option<&VisibilityMask>,
        new: &VisibilityMask,
        property_count: usize,
    ) -> DeltaResult {
        let old_all = old.map_or(true, VisibilityMask::is_all_visible);
        if new.is_all_visible() && old_all {
            return changed.clone();
        }

        let mut kept: SmallVec<[PropIndex; 16]> = changed
            .iter()
            .filter(|&prop| new.is_visible(prop, recipient))
            .collect();

        // Proxy turned on: invisible before, visible now
        if let Some(old) = old.filter(|m| !m.is_all_visible()) {
            let revealed = old
                .proxied_props()
                .into_iter()
                .take_while(|&prop| (prop as usize) < property_count)
                .filter(|&prop| !old.is_visible(prop, recipient) && new.is_visible(prop, recipient))
                .filter(|&prop| !changed.contains(prop));
            kept.extend(revealed);
        }

        DeltaResult::from_unsorted(kept)
    }
}

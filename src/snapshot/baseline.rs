//! Per-class instance baselines
//!
//! A class without a configured baseline gets one from the first of its
//! instances packed with every property visible to everyone. EnterView
//! records for later instances then carry only the properties that differ
//! from it. Recorded baselines never change, so consumers follow them
//! through an append-only stream of `BaselineUpdate`s delivered alongside
//! the entity updates.

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;
use rustc_hash::FxBuildHasher;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::snapshot::class::{ClassDescriptor, ClassId, CodecError, PackedData};
use crate::snapshot::packed_entity::VisibilityMask;
use crate::snapshot::Tick;

/// One recorded baseline as a consumer receives it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineEntry {
    pub class: ClassId,
    /// Tick of the snapshot whose instance became the baseline
    pub tick: Tick,
    pub fields: Vec<Vec<u8>>,
}

/// Baselines recorded after `from_version`, oldest first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaselineUpdate {
    pub from_version: u64,
    pub entries: Vec<BaselineEntry>,
}

impl BaselineUpdate {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Version a consumer holds once this update is applied
    #[inline]
    pub fn to_version(&self) -> u64 {
        self.from_version + self.entries.len() as u64
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CodecError::Baseline(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CodecError::Baseline(e.to_string()))?;
        Ok(update)
    }
}

#[derive(Debug, Default)]
struct Recorded {
    by_class: HashMap<ClassId, Arc<PackedData>, FxBuildHasher>,
    /// Recording order; a consumer's version is a prefix length
    log: Vec<(ClassId, Tick)>,
}

/// Instance baselines of every class, shared by the packing side and the
/// update builders
#[derive(Debug, Default)]
pub struct InstanceBaselines {
    inner: RwLock<Recorded>,
}

impl InstanceBaselines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, class: ClassId) -> Option<Arc<PackedData>> {
        self.inner.read().by_class.get(&class).cloned()
    }

    /// Baseline for `class`, recording `data` as it when the class has none
    /// yet. Instances hiding properties from some recipients never become a
    /// baseline, because every consumer receives the baseline in full.
    pub fn ensure(
        &self,
        class: &ClassDescriptor,
        data: &PackedData,
        visibility: &VisibilityMask,
        tick: Tick,
    ) -> Option<Arc<PackedData>> {
        if let Some(existing) = self.get(class.id()) {
            return Some(existing);
        }
        if !visibility.is_all_visible() {
            return None;
        }

        let mut guard = self.inner.write();
        let Recorded { by_class, log } = &mut *guard;
        let baseline = by_class.entry(class.id()).or_insert_with(|| {
            log.push((class.id(), tick));
            debug!(class = class.id(), name = class.name(), tick, bytes = data.byte_len(), "instance baseline recorded");
            Arc::new(data.clone())
        });
        Some(Arc::clone(baseline))
    }

    /// Number of baselines recorded so far
    pub fn version(&self) -> u64 {
        self.inner.read().log.len() as u64
    }

    /// Everything recorded after `version`
    pub fn updates_since(&self, version: u64) -> BaselineUpdate {
        let inner = self.inner.read();
        let from = (version as usize).min(inner.log.len());
        let entries = inner.log[from..]
            .iter()
            .filter_map(|&(class, tick)| {
                let data = inner.by_class.get(&class)?;
                Some(BaselineEntry {
                    class,
                    tick,
                    fields: data.fields().map(<[u8]>::to_vec).collect(),
                })
            })
            .collect();
        BaselineUpdate {
            from_version: from as u64,
            entries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::class::PropertyValue;
    use crate::snapshot::packed_entity::ProxyGroup;

    fn data(class: &ClassDescriptor, value: i64) -> PackedData {
        class
            .encode(&vec![PropertyValue::Int(value); class.flattened_property_count()])
            .unwrap()
    }

    #[test]
    fn test_first_instance_becomes_baseline() {
        let baselines = InstanceBaselines::new();
        let class = ClassDescriptor::new(4, "door", 3);
        let open = VisibilityMask::all_visible();

        let first = baselines.ensure(&class, &data(&class, 7), &open, 10).unwrap();
        let second = baselines.ensure(&class, &data(&class, 9), &open, 11).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(*first, data(&class, 7));
        assert_eq!(baselines.version(), 1);
    }

    #[test]
    fn test_partially_hidden_instance_is_skipped() {
        let baselines = InstanceBaselines::new();
        let class = ClassDescriptor::new(2, "player", 4);
        let owner_only = VisibilityMask::all_visible().with_group(ProxyGroup::new(&[3], &[0]));

        assert!(baselines.ensure(&class, &data(&class, 1), &owner_only, 1).is_none());
        assert_eq!(baselines.version(), 0);

        let later = baselines
            .ensure(&class, &data(&class, 2), &VisibilityMask::all_visible(), 2)
            .unwrap();
        assert_eq!(*later, data(&class, 2));
    }

    #[test]
    fn test_updates_since_streams_new_entries() {
        let baselines = InstanceBaselines::new();
        let open = VisibilityMask::all_visible();
        let a = ClassDescriptor::new(1, "a", 2);
        let b = ClassDescriptor::new(2, "b", 1);

        baselines.ensure(&a, &data(&a, 1), &open, 5);
        let held = baselines.version();
        baselines.ensure(&b, &data(&b, 2), &open, 6);

        let update = baselines.updates_since(held);
        assert_eq!(update.from_version, 1);
        assert_eq!(update.to_version(), 2);
        assert_eq!(update.entries.len(), 1);
        assert_eq!(update.entries[0].class, 2);
        assert_eq!(update.entries[0].tick, 6);

        let wire = update.encode().unwrap();
        assert_eq!(BaselineUpdate::decode(&wire).unwrap(), update);
        assert!(baselines.updates_since(2).is_empty());
    }
}
